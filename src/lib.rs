//! Stormgr - Cluster Membership Coordinator
//!
//! Keeps a set of storage-driver daemons agreed on who is in the cluster and
//! tells driver plug-ins when that changes.
//!
//! # Architecture
//!
//! A single cluster record lives in a shared versioned key-value store and
//! lists every member. Each daemon bootstraps or joins that record, then
//! gossips heartbeats with the members it lists to learn who is alive.
//! Membership changes are delivered to registered listeners in the order
//! they are observed.
//!
//! # Features
//!
//! - Leader-free bootstrap decided by a conditional write on the record
//! - Heartbeat failure detection with generation-ordered node updates
//! - Ordered listener callbacks with per-listener failure isolation
//! - Administrative eviction and cluster-wide shutdown
//! - HTTP API for status queries and administration

pub mod config;
pub mod error;
pub mod types;
pub mod store;
pub mod state;
pub mod network;
pub mod membership;
pub mod listener;
pub mod cluster;
pub mod api;

pub use config::StormgrConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::StormgrConfig;
    pub use crate::error::{Error, Result};
    pub use crate::types::{ClusterView, Database, Node, NodeEntry, Status};
    pub use crate::cluster::{Cluster, ClusterManager, ClusterState};
    pub use crate::listener::ClusterListener;
    pub use crate::store::{ClusterStore, KvStore};
}
