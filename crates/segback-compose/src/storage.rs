//! Object store seam used for archives, segment files, manifests and sentinels.
//!
//! The backup tool talks to S3-like storage through [`ObjectStore`]. The only
//! failure callers branch on is [`StorageError::NotFound`]; everything else is
//! an opaque backend error.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Result type alias for object store operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors returned by an [`ObjectStore`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// The requested key does not exist.
    #[error("Object not found: {key}")]
    NotFound {
        /// Missing key.
        key: String,
    },
    /// Any other backend failure.
    #[error("Backend error: {0}")]
    Backend(String),
}

/// A single entry of a storage listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    /// Full object key.
    pub key: String,
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time reported by the store.
    pub last_modified: DateTime<Utc>,
    /// Name of the storage the object lives in.
    pub storage: String,
}

/// Object store operations consumed by the composition core.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List every object whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectInfo>>;

    /// Read the full content of `key`.
    async fn read(&self, key: &str) -> StorageResult<Bytes>;

    /// Write `data` under `key`, replacing any existing object.
    async fn write(&self, key: &str, data: Bytes) -> StorageResult<()>;
}

/// Operation counters of the in-memory store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStoreStats {
    /// Number of write operations.
    pub writes: u64,
    /// Number of read operations.
    pub reads: u64,
    /// Number of list operations.
    pub lists: u64,
    /// Total bytes written.
    pub bytes_written: u64,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    last_modified: DateTime<Utc>,
}

/// In-memory [`ObjectStore`] with fault injection, used by tests and dry runs.
pub struct MemoryObjectStore {
    name: String,
    objects: Mutex<BTreeMap<String, StoredObject>>,
    stats: Mutex<MemoryStoreStats>,
    fail_writes_with: Mutex<Option<String>>,
    fail_reads_with: Mutex<Option<String>>,
}

impl MemoryObjectStore {
    /// Create an empty store named "default".
    pub fn new() -> Self {
        Self::with_name("default")
    }

    /// Create an empty store with a storage name reported in listings.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: Mutex::new(BTreeMap::new()),
            stats: Mutex::new(MemoryStoreStats::default()),
            fail_writes_with: Mutex::new(None),
            fail_reads_with: Mutex::new(None),
        }
    }

    /// Insert an object with an explicit modification time.
    pub fn insert_at(&self, key: &str, data: impl Into<Bytes>, last_modified: DateTime<Utc>) {
        self.objects.lock().insert(
            key.to_string(),
            StoredObject {
                data: data.into(),
                last_modified,
            },
        );
    }

    /// Make every subsequent write whose key contains `pattern` fail.
    pub fn fail_writes_containing(&self, pattern: &str) {
        *self.fail_writes_with.lock() = Some(pattern.to_string());
    }

    /// Make every subsequent read whose key contains `pattern` fail with a backend error.
    pub fn fail_reads_containing(&self, pattern: &str) {
        *self.fail_reads_with.lock() = Some(pattern.to_string());
    }

    /// Content of `key`, if present.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().get(key).map(|o| o.data.clone())
    }

    /// All keys currently stored, in order.
    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }

    /// Snapshot of operation counters.
    pub fn stats(&self) -> MemoryStoreStats {
        self.stats.lock().clone()
    }

    fn injected(slot: &Mutex<Option<String>>, key: &str) -> bool {
        slot.lock()
            .as_deref()
            .map(|pattern| key.contains(pattern))
            .unwrap_or(false)
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectInfo>> {
        self.stats.lock().lists += 1;
        let objects = self.objects.lock();
        let listing: Vec<ObjectInfo> = objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, obj)| ObjectInfo {
                key: key.clone(),
                size: obj.data.len() as u64,
                last_modified: obj.last_modified,
                storage: self.name.clone(),
            })
            .collect();
        debug!(prefix, count = listing.len(), "Memory store list");
        Ok(listing)
    }

    async fn read(&self, key: &str) -> StorageResult<Bytes> {
        self.stats.lock().reads += 1;
        if Self::injected(&self.fail_reads_with, key) {
            return Err(StorageError::Backend(format!("injected read failure for {}", key)));
        }
        self.objects
            .lock()
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })
    }

    async fn write(&self, key: &str, data: Bytes) -> StorageResult<()> {
        if Self::injected(&self.fail_writes_with, key) {
            return Err(StorageError::Backend(format!("injected write failure for {}", key)));
        }
        {
            let mut stats = self.stats.lock();
            stats.writes += 1;
            stats.bytes_written = stats.bytes_written.saturating_add(data.len() as u64);
        }
        debug!(key, size = data.len(), "Memory store write");
        self.insert_at(key, data, Utc::now());
        Ok(())
    }
}
