//! In-Memory Store
//!
//! Process-local versioned store. Watches are served from tokio watch
//! channels, which naturally coalesce to the latest value.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use super::{KvPair, KvStore, KvWatch, Version};
use crate::error::{Error, Result};

/// Process-local versioned key-value store
#[derive(Clone, Default)]
pub struct MemoryKv {
    keys: Arc<Mutex<HashMap<String, watch::Sender<Option<KvPair>>>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a store outage; every call fails with `StoreUnavailable`
    /// while unavailable, and watches yield errors.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("memory store offline".into()));
        }
        Ok(())
    }

    fn sender(&self, key: &str) -> watch::Sender<Option<KvPair>> {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        keys.entry(key.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .clone()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<KvPair>> {
        self.check_available()?;
        Ok(self.sender(key).borrow().clone())
    }

    async fn create(&self, key: &str, value: Vec<u8>) -> Result<Version> {
        self.check_available()?;
        let mut created = None;
        self.sender(key).send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(KvPair { value, version: 1 });
            created = Some(1);
            true
        });

        created.ok_or_else(|| Error::VersionConflict {
            key: key.to_string(),
            expected: None,
        })
    }

    async fn compare_and_set(&self, key: &str, value: Vec<u8>, expected: Version) -> Result<Version> {
        self.check_available()?;
        let mut outcome: Result<Version> = Err(Error::DatabaseNotFound(key.to_string()));
        self.sender(key).send_if_modified(|slot| match slot {
            None => false,
            Some(current) if current.version != expected => {
                outcome = Err(Error::VersionConflict {
                    key: key.to_string(),
                    expected: Some(expected),
                });
                false
            }
            Some(current) => {
                let version = current.version + 1;
                *slot = Some(KvPair { value, version });
                outcome = Ok(version);
                true
            }
        });
        outcome
    }

    fn watch(&self, key: &str) -> KvWatch {
        let unavailable = Arc::clone(&self.unavailable);
        let rx = self.sender(key).subscribe();
        WatchStream::new(rx)
            .map(move |snapshot| {
                if unavailable.load(Ordering::SeqCst) {
                    Err(Error::StoreUnavailable("memory store offline".into()))
                } else {
                    Ok(snapshot)
                }
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_then_conflict() {
        let kv = MemoryKv::new();
        assert_eq!(kv.create("k", b"a".to_vec()).await.unwrap(), 1);

        let err = kv.create("k", b"b".to_vec()).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(kv.get("k").await.unwrap().unwrap().value, b"a".to_vec());
    }

    #[tokio::test]
    async fn test_stale_cas_rejected() {
        let kv = MemoryKv::new();
        kv.create("k", b"a".to_vec()).await.unwrap();
        assert_eq!(kv.compare_and_set("k", b"b".to_vec(), 1).await.unwrap(), 2);

        let err = kv.compare_and_set("k", b"c".to_vec(), 1).await.unwrap_err();
        assert!(err.is_conflict());
        let current = kv.get("k").await.unwrap().unwrap();
        assert_eq!(current.value, b"b".to_vec());
        assert_eq!(current.version, 2);
    }

    #[tokio::test]
    async fn test_cas_on_missing_key() {
        let kv = MemoryKv::new();
        let err = kv.compare_and_set("missing", b"x".to_vec(), 1).await.unwrap_err();
        assert!(matches!(err, Error::DatabaseNotFound(_)));
    }

    #[tokio::test]
    async fn test_watch_sees_latest() {
        let kv = MemoryKv::new();
        let mut watch = kv.watch("k");
        assert_eq!(watch.next().await.unwrap().unwrap(), None);

        kv.create("k", b"a".to_vec()).await.unwrap();
        kv.compare_and_set("k", b"b".to_vec(), 1).await.unwrap();

        let latest = watch.next().await.unwrap().unwrap().unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.value, b"b".to_vec());
    }

    #[tokio::test]
    async fn test_outage() {
        let kv = MemoryKv::new();
        kv.set_available(false);
        assert!(matches!(kv.get("k").await, Err(Error::StoreUnavailable(_))));
        kv.set_available(true);
        assert!(kv.get("k").await.unwrap().is_none());
    }
}
