//! StormCtl - Command line tool for managing stormgr clusters
//!
//! Usage:
//!   stormctl nodes                 - Show cluster node status
//!   stormctl node <id>             - Show one node
//!   stormctl remove <id>...        - Evict nodes from the cluster
//!   stormctl shutdown [--cluster]  - Stop this node (and others)
//!   stormctl set-status <status>   - Change this node's status

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;

use stormgr::api::{ActionResponse, ErrorResponse, HealthResponse};
use stormgr::types::{ClusterView, Node, Status};
use stormgr::StormgrConfig;

/// Stormgr Cluster Control Tool
#[derive(Parser)]
#[command(name = "stormctl")]
#[command(about = "Control and monitor stormgr clusters", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "/etc/stormgr/config.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List cluster nodes and their status
    Nodes,
    /// Show one node
    Node {
        /// Node ID
        id: String,
    },
    /// Show health of the local node
    Health,
    /// Evict nodes from the cluster record
    Remove {
        /// Node IDs to evict
        #[arg(required = true)]
        nodes: Vec<String>,
    },
    /// Shut down the local node
    Shutdown {
        /// Ask other nodes to shut down too
        #[arg(long)]
        cluster: bool,
        /// Nodes to ask (all members when omitted)
        nodes: Vec<String>,
    },
    /// Change the status the local node advertises
    SetStatus {
        /// New status (e.g. OK, STORAGE_DEGRADED)
        status: String,
    },
    /// Check configuration file for errors
    CheckConfig {
        /// Path to config file to check (defaults to --config path)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

// ============ Config ============

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default)]
    api: ApiConfig,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfig {
    #[serde(default = "default_api_bind")]
    bind_address: String,
}

fn default_api_bind() -> String {
    "0.0.0.0:9080".to_string()
}

fn endpoint_from_config(path: &PathBuf) -> String {
    let fallback = "http://127.0.0.1:9080".to_string();

    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(_) => return fallback,
    };
    match toml::from_str::<Config>(&content) {
        Ok(config) => {
            // Convert bind address to localhost if it's 0.0.0.0
            let addr = config.api.bind_address;
            if addr.starts_with("0.0.0.0") {
                format!("http://127.0.0.1:{}", addr.split(':').nth(1).unwrap_or("9080"))
            } else {
                format!("http://{}", addr)
            }
        }
        Err(_) => fallback,
    }
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let endpoint = match &cli.endpoint {
        Some(e) => e.trim_end_matches('/').to_string(),
        None => endpoint_from_config(&cli.config),
    };

    let result = match &cli.command {
        Commands::Nodes => list_nodes(&endpoint).await,
        Commands::Node { id } => show_node(&endpoint, id).await,
        Commands::Health => show_health(&endpoint).await,
        Commands::Remove { nodes } => remove_nodes(&endpoint, nodes).await,
        Commands::Shutdown { cluster, nodes } => shutdown(&endpoint, *cluster, nodes).await,
        Commands::SetStatus { status } => set_status(&endpoint, status).await,
        Commands::CheckConfig { file } => {
            let config_path = file.clone().unwrap_or_else(|| cli.config.clone());
            check_config(&config_path)
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

// ============ Commands ============

/// Turn a non-success response into an error carrying the API's message
async fn api_error(response: reqwest::Response) -> Box<dyn std::error::Error> {
    let status = response.status();
    match response.json::<ErrorResponse>().await {
        Ok(body) => format!("{} ({})", body.error, body.code).into(),
        Err(_) => format!("API error: {}", status).into(),
    }
}

fn colored_status(status: Status) -> String {
    // Pad status to fixed width BEFORE adding color codes
    let padded = format!("{:<18}", status.to_string());
    match status {
        Status::Ok | Status::StorageOk => format!("\x1b[32m{}\x1b[0m", padded),
        Status::Init | Status::StorageDegraded => format!("\x1b[33m{}\x1b[0m", padded),
        Status::Offline | Status::Error | Status::NotInQuorum | Status::StorageDown => {
            format!("\x1b[31m{}\x1b[0m", padded)
        }
    }
}

async fn list_nodes(endpoint: &str) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/cluster", endpoint);
    let client = reqwest::Client::new();

    let response = client.get(&url).send().await?;
    if !response.status().is_success() {
        return Err(api_error(response).await);
    }

    let view: ClusterView = response.json().await?;

    println!();
    println!("Cluster {} (stormctl v{})", view.id, env!("CARGO_PKG_VERSION"));
    println!("========================================");
    println!();
    let online = view.nodes.iter().filter(|n| n.status.is_online()).count();
    println!("Total: {} nodes  |  Online: {}  |  Status: {}", view.nodes.len(), online, view.status);
    println!("Reported by: {}", view.node_id);
    println!();

    println!("{:<24} {:<24} {:<18} {:<12}", "NODE ID", "ADDRESS", "STATUS", "GENERATION");
    println!("{}", "-".repeat(80));

    for node in &view.nodes {
        println!("{:<24} {:<24} {} {:<12}",
            node.id,
            node.ip,
            colored_status(node.status),
            node.gen_number
        );
    }
    println!();

    Ok(())
}

async fn show_node(endpoint: &str, id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/cluster/nodes/{}", endpoint, id);
    let client = reqwest::Client::new();

    let response = client.get(&url).send().await?;
    if !response.status().is_success() {
        return Err(api_error(response).await);
    }

    let node: Node = response.json().await?;

    println!();
    println!("Node ID:      {}", node.id);
    println!("Address:      {}", node.ip);
    println!("Status:       {}", colored_status(node.status));
    println!("Generation:   {}", node.gen_number);
    println!("Updated:      {}", node.timestamp.to_rfc3339());
    println!();

    Ok(())
}

async fn show_health(endpoint: &str) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/health", endpoint);
    let client = reqwest::Client::new();

    let response = client.get(&url).send().await?;
    if !response.status().is_success() {
        return Err(api_error(response).await);
    }

    let health: HealthResponse = response.json().await?;
    println!("{}: {} ({})",
        health.node_id,
        if health.healthy { "healthy" } else { "unhealthy" },
        health.status
    );

    Ok(())
}

fn print_action(action: &str, result: ActionResponse) {
    if result.success {
        println!("{} requested successfully", action);
    } else {
        println!("{} failed", action);
    }
    if let Some(msg) = result.message {
        println!("{}", msg);
    }
}

async fn remove_nodes(endpoint: &str, nodes: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/cluster/remove", endpoint);
    let client = reqwest::Client::new();

    let response = client
        .post(&url)
        .json(&serde_json::json!({ "nodes": nodes }))
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(api_error(response).await);
    }

    print_action("Removal", response.json().await?);
    Ok(())
}

async fn shutdown(endpoint: &str, cluster: bool, nodes: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    if !cluster && !nodes.is_empty() {
        return Err("node list given without --cluster".into());
    }

    let url = format!("{}/cluster/shutdown", endpoint);
    let client = reqwest::Client::new();

    let response = client
        .post(&url)
        .json(&serde_json::json!({ "cluster": cluster, "nodes": nodes }))
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(api_error(response).await);
    }

    print_action("Shutdown", response.json().await?);
    Ok(())
}

async fn set_status(endpoint: &str, status: &str) -> Result<(), Box<dyn std::error::Error>> {
    // Reject typos before they reach the node
    let status: Status = status.parse()?;

    let url = format!("{}/node/status", endpoint);
    let client = reqwest::Client::new();

    let response = client
        .put(&url)
        .json(&serde_json::json!({ "status": status.to_string() }))
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(api_error(response).await);
    }

    let node: Node = response.json().await?;
    println!("{} now reports {}", node.id, colored_status(node.status));
    Ok(())
}

// ============ Config Check ============

fn check_config(path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    println!("Checking {}", path.display());

    match StormgrConfig::from_file(path) {
        Ok(config) => {
            println!("\x1b[32m✓\x1b[0m Configuration is valid");
            println!("  Node:     {} ({})", config.node.id, config.advertise_address());
            println!("  Cluster:  {}", config.cluster.id);
            println!("  Store:    {:?} at {}", config.store.backend, config.store_path().display());
            println!("  API:      {}", config.api.bind_address);
            Ok(())
        }
        Err(e) => {
            println!("\x1b[31m✗\x1b[0m {}", e);
            Err(e.into())
        }
    }
}
