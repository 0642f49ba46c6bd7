//! Membership Module
//!
//! Local belief about every peer's liveness, fed by heartbeats and by the
//! cluster record. Changes leave the tracker as `MembershipEvent`s on a single
//! ordered queue.

mod tracker;
mod handler;

pub use tracker::MembershipTracker;
pub use handler::GossipHandler;

use std::time::Duration;

use crate::types::Node;

/// A change in the membership view, in the order it was observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// Peer discovered, or back after failure detection removed it
    Added(Node),
    /// Peer status changed
    Updated(Node),
    /// Peer gone: failure detection, eviction or dropped from the record
    Removed(Node),
    /// Peer announced a graceful departure
    Left(Node),
}

impl MembershipEvent {
    pub fn node(&self) -> &Node {
        match self {
            MembershipEvent::Added(node)
            | MembershipEvent::Updated(node)
            | MembershipEvent::Removed(node)
            | MembershipEvent::Left(node) => node,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MembershipEvent::Added(_) => "Added",
            MembershipEvent::Updated(_) => "Updated",
            MembershipEvent::Removed(_) => "Removed",
            MembershipEvent::Left(_) => "Left",
        }
    }
}

/// Failure detection tuning
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Time between heartbeat rounds
    pub heartbeat_interval: Duration,
    /// How long a single probe may take
    pub probe_timeout: Duration,
    /// Consecutive misses before a peer is marked offline
    pub suspect_after_misses: u32,
    /// How long a peer may stay offline before it is removed
    pub removal_grace: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(1000),
            probe_timeout: Duration::from_millis(500),
            suspect_after_misses: 3,
            removal_grace: Duration::from_secs(30),
        }
    }
}
