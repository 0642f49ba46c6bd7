//! HTTP API Module
//!
//! Provides a REST API for cluster status and administration.

mod http;

pub use http::{HttpServer, ErrorResponse, HealthResponse, ActionResponse, RemoveRequest, ShutdownRequest, StatusRequest};
