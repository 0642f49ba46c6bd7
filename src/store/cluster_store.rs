//! Cluster Store
//!
//! Reads, conditionally writes, and watches the single `Database` record of
//! a cluster.

use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;

use super::{KvStore, Version};
use crate::error::{Error, Result};
use crate::types::Database;

/// A value together with the store version it was read or written at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: Version,
}

/// Stream of database snapshots; `None` means the record does not exist
pub type DatabaseWatch = BoxStream<'static, Result<Option<Versioned<Database>>>>;

/// Consistency layer over the distributed key-value store
#[derive(Clone)]
pub struct ClusterStore {
    kv: Arc<dyn KvStore>,
}

impl ClusterStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Store key holding a cluster's record
    pub fn key(cluster_id: &str) -> String {
        format!("clusters/{}", cluster_id)
    }

    /// Read the cluster record. `DatabaseNotFound` signals that no cluster
    /// has been bootstrapped yet.
    pub async fn read_database(&self, cluster_id: &str) -> Result<Versioned<Database>> {
        let key = Self::key(cluster_id);
        match self.kv.get(&key).await? {
            Some(pair) => Ok(Versioned {
                value: serde_json::from_slice(&pair.value)?,
                version: pair.version,
            }),
            None => Err(Error::DatabaseNotFound(cluster_id.to_string())),
        }
    }

    /// Write the cluster record. `expected = None` creates it and fails with
    /// `VersionConflict` if it already exists; otherwise the write only
    /// succeeds if the stored version still equals `expected`.
    pub async fn write_database(
        &self,
        cluster_id: &str,
        db: &Database,
        expected: Option<Version>,
    ) -> Result<Version> {
        let key = Self::key(cluster_id);
        let value = serde_json::to_vec(db)?;

        let version = match expected {
            None => self.kv.create(&key, value).await?,
            Some(expected) => self.kv.compare_and_set(&key, value, expected).await?,
        };

        tracing::debug!("Wrote cluster database {} at version {}", cluster_id, version);
        Ok(version)
    }

    /// Watch the cluster record. Only the latest state is guaranteed to be
    /// delivered; callers may re-subscribe after an error.
    pub fn watch(&self, cluster_id: &str) -> DatabaseWatch {
        self.kv
            .watch(&Self::key(cluster_id))
            .map(|snapshot| -> Result<Option<Versioned<Database>>> {
                match snapshot? {
                    Some(pair) => Ok(Some(Versioned {
                        value: serde_json::from_slice(&pair.value)?,
                        version: pair.version,
                    })),
                    None => Ok(None),
                }
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKv;
    use crate::types::NodeEntry;

    fn store() -> ClusterStore {
        ClusterStore::new(Arc::new(MemoryKv::new()))
    }

    #[tokio::test]
    async fn test_read_missing_is_bootstrap_signal() {
        let store = store();
        assert!(matches!(
            store.read_database("c1").await,
            Err(Error::DatabaseNotFound(id)) if id == "c1"
        ));
    }

    #[tokio::test]
    async fn test_create_once() {
        let store = store();
        let db = Database::bootstrap("c1", NodeEntry::new("n1", "127.0.0.1:9010"));
        let version = store.write_database("c1", &db, None).await.unwrap();

        let other = Database::bootstrap("c1", NodeEntry::new("n2", "127.0.0.1:9011"));
        assert!(store.write_database("c1", &other, None).await.unwrap_err().is_conflict());

        let read = store.read_database("c1").await.unwrap();
        assert_eq!(read.version, version);
        assert_eq!(read.value, db);
    }

    #[tokio::test]
    async fn test_stale_write_never_succeeds() {
        let store = store();
        let mut db = Database::bootstrap("c1", NodeEntry::new("n1", "127.0.0.1:9010"));
        let v1 = store.write_database("c1", &db, None).await.unwrap();

        db.node_entries.insert("n2".into(), NodeEntry::new("n2", "127.0.0.1:9011"));
        store.write_database("c1", &db, Some(v1)).await.unwrap();

        db.node_entries.insert("n3".into(), NodeEntry::new("n3", "127.0.0.1:9012"));
        assert!(store.write_database("c1", &db, Some(v1)).await.unwrap_err().is_conflict());

        let read = store.read_database("c1").await.unwrap();
        assert!(read.value.contains("n2"));
        assert!(!read.value.contains("n3"));
    }

    #[tokio::test]
    async fn test_watch_decodes() {
        let store = store();
        let mut watch = store.watch("c1");
        assert!(watch.next().await.unwrap().unwrap().is_none());

        let db = Database::bootstrap("c1", NodeEntry::new("n1", "127.0.0.1:9010"));
        store.write_database("c1", &db, None).await.unwrap();
        let snapshot = watch.next().await.unwrap().unwrap().unwrap();
        assert_eq!(snapshot.value, db);
    }
}
