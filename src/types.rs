//! Cluster Data Model
//!
//! Node records, health status, and the shared cluster database record.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health classification of a node or of the cluster as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Known but not yet heard from
    Init,
    /// Healthy member
    Ok,
    /// Missed too many heartbeats
    Offline,
    /// Reported an error
    Error,
    /// Lost contact with the cluster store
    NotInQuorum,
    /// Storage backend is down
    StorageDown,
    /// Storage backend is degraded
    StorageDegraded,
    /// Storage backend is healthy
    StorageOk,
}

impl Status {
    /// Whether a node in this status is considered reachable
    pub fn is_online(&self) -> bool {
        !matches!(self, Status::Init | Status::Offline)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Init => write!(f, "INIT"),
            Status::Ok => write!(f, "OK"),
            Status::Offline => write!(f, "OFFLINE"),
            Status::Error => write!(f, "ERROR"),
            Status::NotInQuorum => write!(f, "NOT_IN_QUORUM"),
            Status::StorageDown => write!(f, "STORAGE_DOWN"),
            Status::StorageDegraded => write!(f, "STORAGE_DEGRADED"),
            Status::StorageOk => write!(f, "STORAGE_OK"),
        }
    }
}

impl std::str::FromStr for Status {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "INIT" => Ok(Status::Init),
            "OK" => Ok(Status::Ok),
            "OFFLINE" => Ok(Status::Offline),
            "ERROR" => Ok(Status::Error),
            "NOT_IN_QUORUM" => Ok(Status::NotInQuorum),
            "STORAGE_DOWN" => Ok(Status::StorageDown),
            "STORAGE_DEGRADED" => Ok(Status::StorageDegraded),
            "STORAGE_OK" => Ok(Status::StorageOk),
            other => Err(crate::Error::Config(format!("unknown status '{}'", other))),
        }
    }
}

/// Addressing record used to open a gossip session with a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    /// Node identifier
    pub id: String,
    /// Gossip address (host:port)
    pub ip: String,
}

impl NodeEntry {
    pub fn new(id: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ip: ip.into(),
        }
    }
}

/// Live view of a cluster member
///
/// Records are replaced wholesale when a newer generation arrives; a
/// `gen_number` that is not greater than the last accepted one is stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Node identifier
    pub id: String,
    /// Gossip address (host:port)
    pub ip: String,
    /// Current health
    pub status: Status,
    /// Monotonic generation counter owned by the node itself
    pub gen_number: u64,
    /// When this snapshot was produced by its owner
    pub timestamp: DateTime<Utc>,
}

impl Node {
    /// A node known only from its entry, never heard from
    pub fn from_entry(entry: &NodeEntry) -> Self {
        Self {
            id: entry.id.clone(),
            ip: entry.ip.clone(),
            status: Status::Init,
            gen_number: 0,
            timestamp: Utc::now(),
        }
    }

    /// The addressing entry for this node
    pub fn entry(&self) -> NodeEntry {
        NodeEntry::new(self.id.clone(), self.ip.clone())
    }
}

/// The single cluster-wide record kept in the distributed store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Database {
    /// Cluster status
    pub status: Status,
    /// Cluster identifier
    pub id: String,
    /// Member addressing entries keyed by node id
    pub node_entries: BTreeMap<String, NodeEntry>,
}

impl Database {
    /// A fresh record containing only the bootstrapping node
    pub fn bootstrap(cluster_id: &str, founder: NodeEntry) -> Self {
        let mut node_entries = BTreeMap::new();
        node_entries.insert(founder.id.clone(), founder);
        Self {
            status: Status::Init,
            id: cluster_id.to_string(),
            node_entries,
        }
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.node_entries.contains_key(node_id)
    }

    /// Still `Init` with nobody but `node_id` listed: whoever created it
    /// never finished `ClusterInit`, so `node_id` may bootstrap it again
    pub fn claimable_by(&self, node_id: &str) -> bool {
        self.status == Status::Init && self.node_entries.keys().all(|id| id == node_id)
    }
}

/// Point-in-time snapshot of the cluster returned by `Enumerate`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterView {
    /// Cluster identifier
    pub id: String,
    /// Cluster status
    pub status: Status,
    /// Identifier of the node that produced this view
    pub node_id: String,
    /// Members, sorted by id
    pub nodes: Vec<Node>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse() {
        assert_eq!("ok".parse::<Status>().unwrap(), Status::Ok);
        assert_eq!("storage-degraded".parse::<Status>().unwrap(), Status::StorageDegraded);
        assert_eq!(Status::NotInQuorum.to_string().parse::<Status>().unwrap(), Status::NotInQuorum);
        assert!("sideways".parse::<Status>().is_err());
    }

    #[test]
    fn test_bootstrap_database() {
        let db = Database::bootstrap("c1", NodeEntry::new("n1", "10.0.0.1:9010"));
        assert_eq!(db.id, "c1");
        assert_eq!(db.status, Status::Init);
        assert!(db.contains("n1"));
        assert_eq!(db.node_entries["n1"].ip, "10.0.0.1:9010");
    }

    #[test]
    fn test_unfinished_record_claimable() {
        let mut db = Database::bootstrap("c1", NodeEntry::new("n1", "10.0.0.1:9010"));
        assert!(db.claimable_by("n1"));
        assert!(!db.claimable_by("n2"));

        db.node_entries.clear();
        assert!(db.claimable_by("n2"));

        db.status = Status::Ok;
        assert!(!db.claimable_by("n2"));
    }

    #[test]
    fn test_database_json_shape() {
        let db = Database::bootstrap("c1", NodeEntry::new("n1", "10.0.0.1:9010"));
        let json = serde_json::to_value(&db).unwrap();
        assert_eq!(json["id"], "c1");
        assert_eq!(json["node_entries"]["n1"]["ip"], "10.0.0.1:9010");
    }
}
