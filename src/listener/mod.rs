//! Cluster Listener Module
//!
//! Storage drivers observe the cluster through `ClusterListener`. Setup
//! callbacks (`cluster_init`, `init`, `join`) run once before any membership
//! event reaches the listener.

mod registry;

pub use registry::ListenerRegistry;

use async_trait::async_trait;

use crate::types::{Database, Node};

/// Lifecycle callbacks implemented by storage drivers
#[async_trait]
pub trait ClusterListener: Send + Sync {
    /// Identity string; must be unique within a registry
    fn name(&self) -> String;

    /// This node created the cluster
    async fn cluster_init(&self, _this: &Node, _db: &Database) -> anyhow::Result<()> {
        Ok(())
    }

    /// This node joins the cluster for the first time
    async fn init(&self, _this: &Node, _db: &Database) -> anyhow::Result<()> {
        Ok(())
    }

    /// This node rejoins the cluster after a restart
    async fn join(&self, _this: &Node, _db: &Database) -> anyhow::Result<()> {
        Ok(())
    }

    async fn add(&self, _node: &Node) -> anyhow::Result<()> {
        Ok(())
    }

    async fn remove(&self, _node: &Node) -> anyhow::Result<()> {
        Ok(())
    }

    async fn update(&self, _node: &Node) -> anyhow::Result<()> {
        Ok(())
    }

    /// A node, possibly this one, is leaving the cluster
    async fn leave(&self, _node: &Node) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Listener that only logs what it sees
pub struct LoggingListener;

#[async_trait]
impl ClusterListener for LoggingListener {
    fn name(&self) -> String {
        "logging".to_string()
    }

    async fn cluster_init(&self, this: &Node, db: &Database) -> anyhow::Result<()> {
        tracing::info!("Node {} created cluster {}", this.id, db.id);
        Ok(())
    }

    async fn init(&self, this: &Node, db: &Database) -> anyhow::Result<()> {
        tracing::info!(
            "Node {} joining cluster {} for the first time ({} members)",
            this.id,
            db.id,
            db.node_entries.len()
        );
        Ok(())
    }

    async fn join(&self, this: &Node, db: &Database) -> anyhow::Result<()> {
        tracing::info!("Node {} rejoining cluster {}", this.id, db.id);
        Ok(())
    }

    async fn add(&self, node: &Node) -> anyhow::Result<()> {
        tracing::info!("Node added: {} at {} ({})", node.id, node.ip, node.status);
        Ok(())
    }

    async fn remove(&self, node: &Node) -> anyhow::Result<()> {
        tracing::info!("Node removed: {}", node.id);
        Ok(())
    }

    async fn update(&self, node: &Node) -> anyhow::Result<()> {
        tracing::info!("Node updated: {} is {}", node.id, node.status);
        Ok(())
    }

    async fn leave(&self, node: &Node) -> anyhow::Result<()> {
        tracing::info!("Node leaving: {}", node.id);
        Ok(())
    }
}
