//! Cluster Store Module
//!
//! Versioned key-value storage for the shared cluster database record.
//! Every backend offers versioned reads, conditional writes, and a
//! level-triggered watch; the cluster record is only ever mutated through
//! compare-and-swap.

mod memory;
mod sqlite;
mod cluster_store;
pub mod retry;

pub use memory::MemoryKv;
pub use sqlite::SqliteKv;
pub use cluster_store::{ClusterStore, DatabaseWatch, Versioned};
pub use retry::{RetryPolicy, update_database};

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;

/// Version assigned by the store to each successful write
pub type Version = u64;

/// A stored value and the version it was written at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub value: Vec<u8>,
    pub version: Version,
}

/// Stream of snapshots of a single key; `None` means the key is absent
pub type KvWatch = BoxStream<'static, Result<Option<KvPair>>>;

/// Versioned key-value store backing the cluster record
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a key
    async fn get(&self, key: &str) -> Result<Option<KvPair>>;

    /// Create a key that must not exist yet
    async fn create(&self, key: &str, value: Vec<u8>) -> Result<Version>;

    /// Replace a key only if it is still at `expected`
    async fn compare_and_set(&self, key: &str, value: Vec<u8>, expected: Version) -> Result<Version>;

    /// Watch a key. Delivers the latest state on subscription and after every
    /// change; intermediate versions may be skipped.
    fn watch(&self, key: &str) -> KvWatch;
}
