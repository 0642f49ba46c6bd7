//! SQLite Store
//!
//! Versioned store kept in a SQLite file. Several daemons on one host (or on
//! a shared filesystem with working locks) can open the same file; SQLite's
//! write lock makes each conditional update atomic. Watches poll the row
//! version.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use super::{KvPair, KvStore, KvWatch, Version};
use crate::error::{Error, Result};

/// Versioned key-value store backed by SQLite
#[derive(Clone)]
pub struct SqliteKv {
    conn: Arc<Mutex<Connection>>,
    poll_interval: Duration,
}

impl SqliteKv {
    /// Open or create the store file
    pub fn open(path: &Path, poll_interval: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(unavailable)?;
        Self::with_connection(conn, poll_interval)
    }

    /// Private in-memory store
    pub fn in_memory(poll_interval: Duration) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(unavailable)?;
        Self::with_connection(conn, poll_interval)
    }

    fn with_connection(conn: Connection, poll_interval: Duration) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5)).map_err(unavailable)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                version INTEGER NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )
        .map_err(unavailable)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            poll_interval,
        })
    }
}

fn unavailable(e: rusqlite::Error) -> Error {
    Error::StoreUnavailable(format!("SQLite error: {}", e))
}

fn read_pair(conn: &Connection, key: &str) -> Result<Option<KvPair>> {
    conn.query_row(
        "SELECT value, version FROM kv WHERE key = ?1",
        params![key],
        |row| {
            Ok(KvPair {
                value: row.get(0)?,
                version: row.get::<_, i64>(1)? as Version,
            })
        },
    )
    .optional()
    .map_err(unavailable)
}

#[async_trait]
impl KvStore for SqliteKv {
    async fn get(&self, key: &str) -> Result<Option<KvPair>> {
        let conn = self.conn.lock().await;
        read_pair(&conn, key)
    }

    async fn create(&self, key: &str, value: Vec<u8>) -> Result<Version> {
        let conn = self.conn.lock().await;
        let inserted = conn
            .execute(
                "INSERT INTO kv (key, value, version) VALUES (?1, ?2, 1) ON CONFLICT(key) DO NOTHING",
                params![key, value],
            )
            .map_err(unavailable)?;

        if inserted == 0 {
            return Err(Error::VersionConflict {
                key: key.to_string(),
                expected: None,
            });
        }
        Ok(1)
    }

    async fn compare_and_set(&self, key: &str, value: Vec<u8>, expected: Version) -> Result<Version> {
        let conn = self.conn.lock().await;
        let updated = conn
            .execute(
                r#"
                UPDATE kv SET value = ?2, version = version + 1, updated_at = CURRENT_TIMESTAMP
                WHERE key = ?1 AND version = ?3
                "#,
                params![key, value, expected as i64],
            )
            .map_err(unavailable)?;

        if updated == 1 {
            return Ok(expected + 1);
        }

        match read_pair(&conn, key)? {
            None => Err(Error::DatabaseNotFound(key.to_string())),
            Some(_) => Err(Error::VersionConflict {
                key: key.to_string(),
                expected: Some(expected),
            }),
        }
    }

    fn watch(&self, key: &str) -> KvWatch {
        let store = self.clone();
        let key = key.to_string();
        let poll_interval = self.poll_interval;

        // State: (last delivered version, first poll). Version 0 stands for
        // "absent", which is never a stored version.
        futures::stream::unfold((None::<Version>, true), move |(last, first)| {
            let store = store.clone();
            let key = key.clone();
            async move {
                if !first {
                    tokio::time::sleep(poll_interval).await;
                }
                loop {
                    match store.get(&key).await {
                        Ok(pair) => {
                            let version = pair.as_ref().map(|p| p.version).unwrap_or(0);
                            if last != Some(version) {
                                return Some((Ok(pair), (Some(version), false)));
                            }
                        }
                        Err(e) => return Some((Err(e), (last, false))),
                    }
                    tokio::time::sleep(poll_interval).await;
                }
            }
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_conditional_writes() {
        let kv = SqliteKv::in_memory(Duration::from_millis(10)).unwrap();
        assert_eq!(kv.create("k", b"a".to_vec()).await.unwrap(), 1);
        assert!(kv.create("k", b"b".to_vec()).await.unwrap_err().is_conflict());

        assert_eq!(kv.compare_and_set("k", b"b".to_vec(), 1).await.unwrap(), 2);
        assert!(kv.compare_and_set("k", b"c".to_vec(), 1).await.unwrap_err().is_conflict());
        assert!(matches!(
            kv.compare_and_set("other", b"c".to_vec(), 1).await,
            Err(Error::DatabaseNotFound(_))
        ));

        let current = kv.get("k").await.unwrap().unwrap();
        assert_eq!(current, KvPair { value: b"b".to_vec(), version: 2 });
    }

    #[tokio::test]
    async fn test_shared_file_between_handles() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cluster.db");
        let a = SqliteKv::open(&path, Duration::from_millis(10)).unwrap();
        let b = SqliteKv::open(&path, Duration::from_millis(10)).unwrap();

        a.create("k", b"from-a".to_vec()).await.unwrap();
        assert!(b.create("k", b"from-b".to_vec()).await.unwrap_err().is_conflict());
        assert_eq!(b.get("k").await.unwrap().unwrap().value, b"from-a".to_vec());
    }

    #[tokio::test]
    async fn test_polling_watch() {
        let kv = SqliteKv::in_memory(Duration::from_millis(10)).unwrap();
        let mut watch = kv.watch("k");
        assert_eq!(watch.next().await.unwrap().unwrap(), None);

        kv.create("k", b"a".to_vec()).await.unwrap();
        let snapshot = tokio::time::timeout(Duration::from_secs(2), watch.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.version, 1);
    }
}
