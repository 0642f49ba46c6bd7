//! State Tracker
//!
//! Persistent local record of which clusters this node has already joined,
//! used to tell a first-time joiner from a node restarting into a cluster.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// How this node entered a cluster the first time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    /// Created the cluster
    Bootstrap,
    /// Joined an existing cluster
    Member,
}

impl JoinKind {
    fn as_str(&self) -> &'static str {
        match self {
            JoinKind::Bootstrap => "bootstrap",
            JoinKind::Member => "member",
        }
    }
}

/// Persistent state tracker backed by SQLite
pub struct StateTracker {
    /// Database connection
    conn: Mutex<Connection>,
    /// Node ID
    node_id: String,
}

impl StateTracker {
    /// Create or open the state tracker database
    pub fn new(data_dir: PathBuf, node_id: String) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)?;

        let db_path = data_dir.join("state.db");
        let conn = Connection::open(&db_path)?;
        Self::with_connection(conn, node_id)
    }

    /// Volatile tracker; every start looks like a first join
    pub fn in_memory(node_id: String) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, node_id)
    }

    fn with_connection(conn: Connection, node_id: String) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cluster_membership (
                cluster_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                joined_at TEXT NOT NULL,
                last_start_at TEXT NOT NULL,
                PRIMARY KEY (cluster_id, node_id)
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            node_id,
        })
    }

    /// Whether this node has completed setup for the cluster before
    pub async fn has_joined(&self, cluster_id: &str) -> Result<bool> {
        Ok(self.joined_at(cluster_id).await?.is_some())
    }

    /// When this node first completed setup for the cluster
    pub async fn joined_at(&self, cluster_id: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().await;
        let joined: Option<String> = conn
            .query_row(
                "SELECT joined_at FROM cluster_membership WHERE cluster_id = ?1 AND node_id = ?2",
                params![cluster_id, self.node_id],
                |row| row.get(0),
            )
            .optional()?;

        joined
            .map(|ts| {
                DateTime::parse_from_rfc3339(&ts)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| Error::State(format!("Corrupt join timestamp '{}': {}", ts, e)))
            })
            .transpose()
    }

    /// Record a completed setup. The first join time is preserved on restarts.
    pub async fn record_joined(&self, cluster_id: &str, kind: JoinKind) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO cluster_membership (cluster_id, node_id, kind, joined_at, last_start_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            ON CONFLICT(cluster_id, node_id) DO UPDATE SET last_start_at = ?4
            "#,
            params![cluster_id, self.node_id, kind.as_str(), now],
        )?;
        Ok(())
    }

    /// Get node ID
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::State(format!("SQLite error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_join_record_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let tracker = StateTracker::new(dir.path().to_path_buf(), "n2".to_string()).unwrap();
            assert!(!tracker.has_joined("c1").await.unwrap());
            tracker.record_joined("c1", JoinKind::Member).await.unwrap();
        }

        let tracker = StateTracker::new(dir.path().to_path_buf(), "n2".to_string()).unwrap();
        assert!(tracker.has_joined("c1").await.unwrap());
        assert!(!tracker.has_joined("c2").await.unwrap());
    }

    #[tokio::test]
    async fn test_first_join_time_kept() {
        let tracker = StateTracker::in_memory("n1".to_string()).unwrap();
        tracker.record_joined("c1", JoinKind::Bootstrap).await.unwrap();
        let first = tracker.joined_at("c1").await.unwrap().unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        tracker.record_joined("c1", JoinKind::Member).await.unwrap();
        assert_eq!(tracker.joined_at("c1").await.unwrap().unwrap(), first);
    }

    #[tokio::test]
    async fn test_records_are_per_node() {
        let dir = tempdir().unwrap();
        let a = StateTracker::new(dir.path().to_path_buf(), "n1".to_string()).unwrap();
        a.record_joined("c1", JoinKind::Bootstrap).await.unwrap();

        let b = StateTracker::new(dir.path().to_path_buf(), "n2".to_string()).unwrap();
        assert!(!b.has_joined("c1").await.unwrap());
    }
}
