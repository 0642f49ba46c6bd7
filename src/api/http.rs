//! HTTP API Server
//!
//! REST API for cluster status queries and administration.

use std::sync::Arc;
use axum::{
    extract::{Path, State, Json},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::cluster::Cluster;
use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::types::{Status, ClusterView};

/// Shared application state
pub struct AppState {
    /// Node ID
    pub node_id: String,
    /// Cluster API of this node
    pub cluster: Arc<dyn Cluster>,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, node_id: String, cluster: Arc<dyn Cluster>) -> Self {
        let state = Arc::new(AppState { node_id, cluster });
        Self { config, state }
    }

    /// Create the router
    pub fn router(&self) -> Router {
        let router = Router::new()
            // Status and info
            .route("/health", get(handle_health))
            .route("/cluster", get(handle_cluster_info))
            .route("/cluster/nodes/:node_id", get(handle_node_info))
            // Admin operations
            .route("/cluster/remove", post(handle_remove))
            .route("/cluster/shutdown", post(handle_shutdown))
            .route("/node/status", put(handle_set_status))
            .with_state(Arc::clone(&self.state))
            .layer(TraceLayer::new_for_http());

        if self.config.cors_enabled {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Serve until `shutdown` turns true
    pub async fn start(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = self.router();

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                while !*shutdown.borrow() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
    pub status: Status,
}

/// Remove request
#[derive(Debug, Serialize, Deserialize)]
pub struct RemoveRequest {
    pub nodes: Vec<String>,
}

/// Shutdown request
#[derive(Debug, Serialize, Deserialize)]
pub struct ShutdownRequest {
    /// Also ask the listed nodes to shut down
    #[serde(default)]
    pub cluster: bool,
    /// Nodes to ask; every member when empty
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// Status change request
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusRequest {
    pub status: String,
}

/// Admin action response
#[derive(Debug, Serialize, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: Option<String>,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn error_response(error: Error) -> Response {
    let (status, code) = match &error {
        Error::NodeNotFound(_) => (StatusCode::NOT_FOUND, "NODE_NOT_FOUND"),
        Error::NotInitialized => (StatusCode::SERVICE_UNAVAILABLE, "NOT_INITIALIZED"),
        Error::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN"),
        Error::StoreUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE"),
        Error::InvalidState(_) => (StatusCode::CONFLICT, "INVALID_STATE"),
        Error::UpdateFailed(_) => (StatusCode::CONFLICT, "UPDATE_FAILED"),
        Error::Config(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
    };

    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
        }),
    )
        .into_response()
}

// ============ Handlers ============

async fn handle_health(
    State(state): State<Arc<AppState>>,
) -> Response {
    // Answered from the node itself, so an evicted daemon still reports in
    match state.cluster.local_node().await {
        Ok(node) => Json(HealthResponse {
            healthy: node.status == Status::Ok,
            node_id: state.node_id.clone(),
            status: node.status,
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_cluster_info(
    State(state): State<Arc<AppState>>,
) -> Response {
    match state.cluster.enumerate().await {
        Ok(view) => Json::<ClusterView>(view).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_node_info(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
) -> Response {
    match state.cluster.locate_node(&node_id).await {
        Ok(node) => Json(node).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_remove(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RemoveRequest>,
) -> Response {
    if req.nodes.is_empty() {
        return error_response(Error::Config("no nodes given".into()));
    }

    tracing::warn!("Eviction of {:?} requested via API", req.nodes);
    match state.cluster.remove(&req.nodes).await {
        Ok(()) => Json(ActionResponse {
            success: true,
            message: Some(format!("Removed {}", req.nodes.join(", "))),
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_shutdown(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ShutdownRequest>,
) -> Response {
    tracing::warn!("Shutdown requested via API (cluster: {})", req.cluster);

    // Answer first; shutting down stops the node serving this request
    let cluster = Arc::clone(&state.cluster);
    tokio::spawn(async move {
        if let Err(e) = cluster.shutdown(req.cluster, &req.nodes).await {
            tracing::error!("Shutdown failed: {}", e);
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(ActionResponse {
            success: true,
            message: Some("Shutdown started".to_string()),
        }),
    )
        .into_response()
}

async fn handle_set_status(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StatusRequest>,
) -> Response {
    let status: Status = match req.status.parse() {
        Ok(status) => status,
        Err(e) => return error_response(e),
    };

    match state.cluster.set_local_status(status).await {
        Ok(node) => Json(node).into_response(),
        Err(e) => error_response(e),
    }
}
