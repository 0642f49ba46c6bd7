//! Cluster Module
//!
//! The `Cluster` API, the manager implementing it, and the process-wide
//! instance accessor.
//!
//! Only one manager may be installed per process. `new` and `uninstall` must
//! not race each other; call them once at startup and teardown.

mod manager;

pub use manager::ClusterManager;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::listener::ClusterListener;
use crate::membership::TrackerConfig;
use crate::network::PeerTransport;
use crate::state::StateTracker;
use crate::store::{ClusterStore, RetryPolicy};
use crate::types::{ClusterView, Node, Status};

/// Cluster operations offered to the API layer and CLI
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Look up a node in the current view
    async fn locate_node(&self, node_id: &str) -> Result<Node>;

    /// This node, even after another member evicted it from the record
    async fn local_node(&self) -> Result<Node>;

    /// Register a listener; only allowed before `start`
    fn add_event_listener(&self, listener: Arc<dyn ClusterListener>) -> Result<()>;

    /// Snapshot of the cluster record merged with live status
    async fn enumerate(&self) -> Result<ClusterView>;

    /// Evict nodes from the cluster record without their cooperation
    async fn remove(&self, nodes: &[String]) -> Result<()>;

    /// Leave the cluster; with `cluster` set, ask `nodes` (all members when
    /// empty) to shut down first
    async fn shutdown(&self, cluster: bool, nodes: &[String]) -> Result<()>;

    /// Run the join protocol and start the membership loops
    async fn start(&self) -> Result<()>;

    /// Change the status this node advertises
    async fn set_local_status(&self, status: Status) -> Result<Node>;
}

/// Lifecycle of a manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterState {
    Uninitialized,
    /// Created the cluster record, awaiting `start`
    Bootstrapping,
    /// Found an existing record, awaiting `start`
    Joining,
    Started,
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterState::Uninitialized => write!(f, "UNINITIALIZED"),
            ClusterState::Bootstrapping => write!(f, "BOOTSTRAPPING"),
            ClusterState::Joining => write!(f, "JOINING"),
            ClusterState::Started => write!(f, "STARTED"),
            ClusterState::ShuttingDown => write!(f, "SHUTTING_DOWN"),
            ClusterState::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Manager configuration, fixed for the life of the process
#[derive(Debug, Clone)]
pub struct Config {
    /// Identifies the shared cluster record
    pub cluster_id: String,
    /// This process's identity
    pub node_id: String,
    /// Gossip address peers use to reach this node
    pub address: String,
    /// Failure detection tuning
    pub tracker: TrackerConfig,
    /// Budget for conditional writes of the cluster record
    pub retry: RetryPolicy,
    /// Delay before re-subscribing a failed watch, and store check period
    pub watch_retry: Duration,
    /// Consecutive store failures before this node reports `NotInQuorum`
    pub store_failure_threshold: u32,
}

impl Config {
    pub fn new(cluster_id: impl Into<String>, node_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            node_id: node_id.into(),
            address: address.into(),
            tracker: TrackerConfig::default(),
            retry: RetryPolicy::default(),
            watch_retry: Duration::from_millis(1000),
            store_failure_threshold: 5,
        }
    }
}

/// Collaborators a manager is built from
#[derive(Clone)]
pub struct Deps {
    pub store: ClusterStore,
    pub state: Arc<StateTracker>,
    pub transport: Arc<dyn PeerTransport>,
}

static INSTANCE: RwLock<Option<ClusterManager>> = RwLock::new(None);

/// Build and initialize a manager, then install it as the process instance
pub async fn new(config: Config, deps: Deps) -> Result<ClusterManager> {
    if inst().is_ok() {
        return Err(Error::InvalidState("a cluster manager is already installed".into()));
    }

    let manager = ClusterManager::new(config, deps)?;
    manager.init().await?;
    install(manager.clone())?;
    Ok(manager)
}

/// Install `manager` as the process instance
pub fn install(manager: ClusterManager) -> Result<()> {
    let mut slot = INSTANCE.write().unwrap_or_else(|e| e.into_inner());
    if slot.is_some() {
        return Err(Error::InvalidState("a cluster manager is already installed".into()));
    }
    *slot = Some(manager);
    Ok(())
}

/// The process instance
pub fn inst() -> Result<ClusterManager> {
    INSTANCE
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
        .ok_or(Error::NotInitialized)
}

/// Start the process instance; a failed start uninstalls it
pub async fn start() -> Result<()> {
    let manager = inst()?;
    if let Err(e) = manager.start().await {
        uninstall();
        return Err(e);
    }
    Ok(())
}

pub fn uninstall() -> Option<ClusterManager> {
    INSTANCE.write().unwrap_or_else(|e| e.into_inner()).take()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::LoopbackNetwork;
    use crate::store::MemoryKv;

    #[tokio::test]
    async fn test_process_instance() {
        assert!(matches!(inst(), Err(Error::NotInitialized)));
        assert!(matches!(start().await, Err(Error::NotInitialized)));

        let network = LoopbackNetwork::new();
        let deps = Deps {
            store: ClusterStore::new(Arc::new(MemoryKv::new())),
            state: Arc::new(StateTracker::in_memory("n1".into()).unwrap()),
            transport: Arc::new(network.transport("n1")),
        };
        let manager = new(Config::new("c1", "n1", "n1"), deps.clone()).await.unwrap();
        assert_eq!(manager.state(), ClusterState::Bootstrapping);

        // A second instance is refused
        assert!(new(Config::new("c1", "n1", "n1"), deps).await.is_err());

        start().await.unwrap();
        assert_eq!(inst().unwrap().state(), ClusterState::Started);

        inst().unwrap().shutdown(false, &[]).await.unwrap();
        assert_eq!(manager.state(), ClusterState::Stopped);
        assert!(uninstall().is_some());
        assert!(matches!(inst(), Err(Error::NotInitialized)));
    }
}
