//! Storage Adapters
//!
//! Every layer stores its entries through a `StorageAdapter`. The engine
//! ships an in-memory adapter; distributed stores and CDN purge APIs plug in
//! by implementing the same trait.
//!
//! # Design
//!
//! - Async trait so network-backed adapters can await I/O
//! - Entries are handed out as `Arc<CacheEntry>` so access bookkeeping
//!   mutates the resident copy in place
//! - `store`/`delete` return the displaced entry so the caller can keep
//!   `current_size` exact

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::entry::CacheEntry;
use super::policy::KeyPattern;
use crate::error::Result;

/// Backend storage for one cache layer
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Load the entry stored under a physical key
    async fn load(&self, key: &str) -> Result<Option<Arc<CacheEntry>>>;

    /// Store an entry, returning the one it replaced
    async fn store(&self, key: &str, entry: Arc<CacheEntry>) -> Result<Option<Arc<CacheEntry>>>;

    /// Delete an entry, returning it if present
    async fn delete(&self, key: &str) -> Result<Option<Arc<CacheEntry>>>;

    /// List entries whose physical key matches `pattern`
    async fn scan(&self, pattern: &KeyPattern) -> Result<Vec<(String, Arc<CacheEntry>)>>;

    /// Cheap liveness check used by maintenance to re-activate a layer
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    /// Get adapter statistics
    fn stats(&self) -> AdapterStats;
}

/// Adapter statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterStats {
    /// Entries currently stored
    pub object_count: u64,
    /// Bytes currently stored
    pub total_bytes: u64,
    /// Load operations
    pub reads: u64,
    /// Store operations
    pub writes: u64,
    /// Delete operations
    pub deletes: u64,
}

/// In-memory adapter backed by a concurrent map
#[derive(Default)]
pub struct InMemoryAdapter {
    storage: DashMap<String, Arc<CacheEntry>>,
    total_bytes: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl InMemoryAdapter {
    /// Create a new in-memory adapter
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageAdapter for InMemoryAdapter {
    async fn load(&self, key: &str) -> Result<Option<Arc<CacheEntry>>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.storage.get(key).map(|e| Arc::clone(e.value())))
    }

    async fn store(&self, key: &str, entry: Arc<CacheEntry>) -> Result<Option<Arc<CacheEntry>>> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let size = entry.size();

        let old = self.storage.insert(key.to_string(), entry);
        if let Some(old_entry) = &old {
            self.total_bytes.fetch_sub(old_entry.size(), Ordering::Relaxed);
        }
        self.total_bytes.fetch_add(size, Ordering::Relaxed);

        Ok(old)
    }

    async fn delete(&self, key: &str) -> Result<Option<Arc<CacheEntry>>> {
        self.deletes.fetch_add(1, Ordering::Relaxed);

        if let Some((_, entry)) = self.storage.remove(key) {
            self.total_bytes.fetch_sub(entry.size(), Ordering::Relaxed);
            return Ok(Some(entry));
        }
        Ok(None)
    }

    async fn scan(&self, pattern: &KeyPattern) -> Result<Vec<(String, Arc<CacheEntry>)>> {
        // Collect first so no shard guard is held by the caller
        Ok(self
            .storage
            .iter()
            .filter(|e| pattern.matches(e.key()))
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect())
    }

    fn stats(&self) -> AdapterStats {
        AdapterStats {
            object_count: self.storage.len() as u64,
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}


// =============================================================================
// Tests
// =============================================================================
