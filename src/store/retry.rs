//! Optimistic Update Helper
//!
//! Read-modify-conditional-write of the cluster record, retried with
//! exponential backoff when another writer wins the race or the store is
//! briefly unreachable.

use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;

use super::{ClusterStore, Versioned};
use crate::error::{Error, Result};
use crate::types::Database;

/// Bounded retry budget for conditional writes
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for a single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), with jitter in the upper half
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.saturating_sub(1).min(16);
        let ceiling = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if ceiling.is_zero() {
            return ceiling;
        }
        let millis = ceiling.as_millis() as u64;
        let jittered = rand::thread_rng().gen_range(millis / 2..=millis);
        Duration::from_millis(jittered)
    }
}

fn cancelled(cancel: Option<&watch::Receiver<bool>>) -> bool {
    cancel.map(|rx| *rx.borrow()).unwrap_or(false)
}

/// Apply `mutate` to the cluster record under compare-and-swap.
///
/// `mutate` returns whether it changed the record; unchanged records are not
/// written. After `max_attempts` lost races the result is `UpdateFailed`;
/// after that many outages the last `StoreUnavailable` is returned. Once
/// `cancel` reads `true` no attempt is started, including the first.
pub async fn update_database<F>(
    store: &ClusterStore,
    cluster_id: &str,
    policy: &RetryPolicy,
    cancel: Option<&watch::Receiver<bool>>,
    mut mutate: F,
) -> Result<Versioned<Database>>
where
    F: FnMut(&mut Database) -> bool,
{
    let mut last_error = None;

    for attempt in 1..=policy.max_attempts.max(1) {
        if attempt > 1 && !cancelled(cancel) {
            tokio::time::sleep(policy.backoff(attempt - 1)).await;
        }
        if cancelled(cancel) {
            return Err(Error::ShuttingDown);
        }

        let current = match store.read_database(cluster_id).await {
            Ok(current) => current,
            Err(e) if e.is_retryable() => {
                tracing::warn!("Cluster store read failed (attempt {}): {}", attempt, e);
                last_error = Some(e);
                continue;
            }
            Err(e) => return Err(e),
        };

        let mut db = current.value.clone();
        if !mutate(&mut db) {
            return Ok(current);
        }

        match store.write_database(cluster_id, &db, Some(current.version)).await {
            Ok(version) => return Ok(Versioned { value: db, version }),
            Err(e) if e.is_conflict() => {
                tracing::debug!(
                    "Lost update race on cluster {} at version {} (attempt {})",
                    cluster_id,
                    current.version,
                    attempt
                );
                last_error = Some(e);
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!("Cluster store write failed (attempt {}): {}", attempt, e);
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    match last_error {
        Some(Error::StoreUnavailable(reason)) => Err(Error::StoreUnavailable(reason)),
        _ => Err(Error::UpdateFailed(format!(
            "cluster {} still contended after {} attempts",
            cluster_id, policy.max_attempts
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::store::{KvPair, KvStore, KvWatch, MemoryKv, Version};
    use crate::types::NodeEntry;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    async fn seeded(kv: Arc<dyn KvStore>) -> ClusterStore {
        let store = ClusterStore::new(kv);
        let db = Database::bootstrap("c1", NodeEntry::new("n0", "127.0.0.1:9000"));
        store.write_database("c1", &db, None).await.unwrap();
        store
    }

    /// Lets reads through but loses every conditional write
    struct AlwaysContended(MemoryKv);

    #[async_trait]
    impl KvStore for AlwaysContended {
        async fn get(&self, key: &str) -> Result<Option<KvPair>> {
            self.0.get(key).await
        }

        async fn create(&self, key: &str, value: Vec<u8>) -> Result<Version> {
            self.0.create(key, value).await
        }

        async fn compare_and_set(&self, key: &str, _value: Vec<u8>, expected: Version) -> Result<Version> {
            Err(Error::VersionConflict { key: key.to_string(), expected: Some(expected) })
        }

        fn watch(&self, key: &str) -> KvWatch {
            self.0.watch(key)
        }
    }

    #[test]
    fn test_backoff_bounds() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
        };
        let first = policy.backoff(1);
        assert!(first >= Duration::from_millis(50) && first <= Duration::from_millis(100));
        let capped = policy.backoff(10);
        assert!(capped <= Duration::from_millis(300));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_union() {
        let store = seeded(Arc::new(MemoryKv::new())).await;

        let mut handles = Vec::new();
        for i in 1..=8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let id = format!("n{}", i);
                update_database(&store, "c1", &fast_policy(50), None, |db| {
                    db.node_entries.insert(id.clone(), NodeEntry::new(id.clone(), "127.0.0.1:1"));
                    true
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let db = store.read_database("c1").await.unwrap().value;
        assert_eq!(db.node_entries.len(), 9);
        for i in 0..=8 {
            assert!(db.contains(&format!("n{}", i)));
        }
    }

    #[tokio::test]
    async fn test_unchanged_skips_write() {
        let store = seeded(Arc::new(MemoryKv::new())).await;
        let before = store.read_database("c1").await.unwrap();
        let after = update_database(&store, "c1", &fast_policy(3), None, |_| false).await.unwrap();
        assert_eq!(before.version, after.version);
    }

    #[tokio::test]
    async fn test_contention_exhausts_budget() {
        let store = seeded(Arc::new(AlwaysContended(MemoryKv::new()))).await;
        let err = update_database(&store, "c1", &fast_policy(3), None, |db| {
            db.status = crate::types::Status::Ok;
            true
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::UpdateFailed(_)));
    }

    #[tokio::test]
    async fn test_outage_surfaces_unavailable() {
        let kv = MemoryKv::new();
        let store = seeded(Arc::new(kv.clone())).await;
        kv.set_available(false);
        let err = update_database(&store, "c1", &fast_policy(3), None, |_| true).await.unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_no_retry_after_cancel() {
        let kv = MemoryKv::new();
        let store = seeded(Arc::new(kv.clone())).await;
        kv.set_available(false);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        cancel_tx.send_replace(true);
        let err = update_database(&store, "c1", &fast_policy(100), Some(&cancel_rx), |_| true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ShuttingDown));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_write() {
        let store = seeded(Arc::new(MemoryKv::new())).await;
        let before = store.read_database("c1").await.unwrap();

        let (cancel_tx, cancel_rx) = watch::channel(false);
        cancel_tx.send_replace(true);
        let err = update_database(&store, "c1", &fast_policy(5), Some(&cancel_rx), |db| {
            db.node_entries.insert("late".into(), NodeEntry::new("late", "127.0.0.1:1"));
            true
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::ShuttingDown));

        let after = store.read_database("c1").await.unwrap();
        assert_eq!(before.version, after.version);
        assert!(!after.value.contains("late"));
    }
}
