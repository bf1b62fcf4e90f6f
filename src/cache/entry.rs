//! Cache Entry Types
//!
//! Tenant-scoped keys and the entries stored under them. The physical key
//! (`tenant:{id}:{key}` or `global:{key}`) is the only thing that separates
//! tenants inside a shared layer, so it is built in exactly one place.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;

use super::compression::CompressionAlgorithm;
use crate::error::{Error, Result};

/// Sentinel tenant id for entries that belong to no tenant
pub const GLOBAL_TENANT: &str = "global";

/// Milliseconds since the Unix epoch
#[inline]
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

static ACCESS_CLOCK: AtomicU64 = AtomicU64::new(1);

/// Next tick of the process-wide access clock.
///
/// Strictly increasing, so entries touched within the same millisecond
/// still have a total recency order.
#[inline]
pub fn next_access_seq() -> u64 {
    ACCESS_CLOCK.fetch_add(1, Ordering::Relaxed)
}

/// Fast non-cryptographic 64-bit hash (FxHash algorithm)
#[inline]
pub fn fx_hash(bytes: &[u8]) -> u64 {
    const SEED: u64 = 0x517cc1b727220a95;
    let mut hash = SEED;
    for &byte in bytes {
        hash = hash.rotate_left(5) ^ (byte as u64);
        hash = hash.wrapping_mul(SEED);
    }
    hash
}

/// Cache key - logical key plus owning tenant
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Logical key as supplied by the caller
    key: String,
    /// Owning tenant (None = global)
    tenant: Option<String>,
    /// Physical key used inside a layer
    physical: String,
}

impl CacheKey {
    /// Create a new tenant-scoped key
    pub fn new(key: impl Into<String>, tenant: Option<&str>) -> Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(Error::InvalidKey {
                key,
                reason: "key must not be empty".into(),
            });
        }
        if let Some(tenant) = tenant {
            validate_tenant(tenant)?;
        }

        let physical = match tenant {
            Some(t) => format!("tenant:{}:{}", t, key),
            None => format!("{}:{}", GLOBAL_TENANT, key),
        };

        Ok(Self {
            key,
            tenant: tenant.map(str::to_string),
            physical,
        })
    }

    /// Create a key owned by no tenant
    pub fn global(key: impl Into<String>) -> Result<Self> {
        Self::new(key, None)
    }

    /// Get the logical key
    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Get the owning tenant, if any
    #[inline]
    pub fn tenant(&self) -> Option<&str> {
        self.tenant.as_deref()
    }

    /// Get the tenant id used by the keyspace index
    #[inline]
    pub fn tenant_id(&self) -> &str {
        self.tenant.as_deref().unwrap_or(GLOBAL_TENANT)
    }

    /// Get the physical key stored in a layer
    #[inline]
    pub fn physical(&self) -> &str {
        &self.physical
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.physical)
    }
}

/// Reject tenant ids that could forge another tenant's physical key
pub fn validate_tenant(tenant: &str) -> Result<()> {
    if tenant.is_empty() {
        return Err(Error::InvalidTenant {
            tenant: tenant.to_string(),
            reason: "tenant id must not be empty".into(),
        });
    }
    if tenant == GLOBAL_TENANT {
        return Err(Error::InvalidTenant {
            tenant: tenant.to_string(),
            reason: format!("'{}' is reserved for unscoped entries", GLOBAL_TENANT),
        });
    }
    if tenant.contains(':') {
        return Err(Error::InvalidTenant {
            tenant: tenant.to_string(),
            reason: "tenant id must not contain ':'".into(),
        });
    }
    Ok(())
}

/// Descriptive metadata carried alongside the payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMetadata {
    /// Where the value came from (e.g. "catalog-service")
    pub source: Option<String>,
    /// Version of the upstream value
    pub version: Option<String>,
    /// Compression applied to the stored bytes
    pub compression: CompressionAlgorithm,
    /// FxHash of the stored bytes
    pub checksum: u64,
}

/// Cache entry containing data and access bookkeeping
///
/// Access fields are atomic so a shared `Arc<CacheEntry>` can be touched
/// in place by concurrent readers.
pub struct CacheEntry {
    key: String,
    tenant: Option<String>,
    data: Bytes,
    ttl: Duration,
    created_at: u64,
    last_accessed: AtomicU64,
    access_seq: AtomicU64,
    access_count: AtomicU32,
    tags: BTreeSet<String>,
    metadata: EntryMetadata,
}

impl CacheEntry {
    /// Create a new entry from already-encoded bytes
    pub fn new(
        key: &CacheKey,
        data: Bytes,
        ttl: Duration,
        compression: CompressionAlgorithm,
    ) -> Self {
        let now = now_ms();
        let checksum = fx_hash(&data);
        Self {
            key: key.key().to_string(),
            tenant: key.tenant().map(str::to_string),
            data,
            ttl,
            created_at: now,
            last_accessed: AtomicU64::new(now),
            access_seq: AtomicU64::new(next_access_seq()),
            access_count: AtomicU32::new(0),
            tags: BTreeSet::new(),
            metadata: EntryMetadata {
                source: None,
                version: None,
                compression,
                checksum,
            },
        }
    }

    /// Attach tags
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Attach source and version
    pub fn with_origin(mut self, source: Option<String>, version: Option<String>) -> Self {
        self.metadata.source = source;
        self.metadata.version = version;
        self
    }

    /// Override the time-to-live (used when a layer has its own ttl)
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Logical key
    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Owning tenant (None = global)
    #[inline]
    pub fn tenant(&self) -> Option<&str> {
        self.tenant.as_deref()
    }

    /// Tenant id used by the keyspace index
    #[inline]
    pub fn tenant_id(&self) -> &str {
        self.tenant.as_deref().unwrap_or(GLOBAL_TENANT)
    }

    /// Physical key this entry is stored under
    pub fn physical_key(&self) -> String {
        match &self.tenant {
            Some(t) => format!("tenant:{}:{}", t, self.key),
            None => format!("{}:{}", GLOBAL_TENANT, self.key),
        }
    }

    /// Stored bytes (possibly compressed)
    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Stored size in bytes
    #[inline]
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Time-to-live
    #[inline]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Creation time (epoch millis)
    #[inline]
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Last access time (epoch millis)
    #[inline]
    pub fn last_accessed(&self) -> u64 {
        self.last_accessed.load(Ordering::Relaxed)
    }

    /// Access clock tick of the creation or latest hit
    #[inline]
    pub fn access_seq(&self) -> u64 {
        self.access_seq.load(Ordering::Relaxed)
    }

    /// Number of hits served from this entry
    #[inline]
    pub fn access_count(&self) -> u32 {
        self.access_count.load(Ordering::Relaxed)
    }

    /// Tags
    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    /// Check for a tag
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Metadata
    pub fn metadata(&self) -> &EntryMetadata {
        &self.metadata
    }

    /// Age relative to `now` (epoch millis)
    #[inline]
    pub fn age_at(&self, now: u64) -> Duration {
        Duration::from_millis(now.saturating_sub(self.created_at))
    }

    /// Check if the entry outlived its ttl at `now`
    #[inline]
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.age_at(now) > self.ttl
    }

    /// Check if expired right now
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_ms())
    }

    /// Remaining lifetime in millis at `now`; negative once expired
    pub fn remaining_lifetime_ms(&self, now: u64) -> i64 {
        self.ttl.as_millis() as i64 - self.age_at(now).as_millis() as i64
    }

    /// Record a hit and return the new access count
    #[inline]
    pub fn record_access(&self) -> u32 {
        self.last_accessed.store(now_ms(), Ordering::Relaxed);
        self.access_seq.store(next_access_seq(), Ordering::Relaxed);
        self.access_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Verify content integrity
    pub fn verify_integrity(&self) -> bool {
        fx_hash(&self.data) == self.metadata.checksum
    }
}

impl Clone for CacheEntry {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            tenant: self.tenant.clone(),
            data: self.data.clone(),
            ttl: self.ttl,
            created_at: self.created_at,
            last_accessed: AtomicU64::new(self.last_accessed()),
            access_seq: AtomicU64::new(self.access_seq()),
            access_count: AtomicU32::new(self.access_count()),
            tags: self.tags.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("tenant", &self.tenant_id())
            .field("size", &self.size())
            .field("access_count", &self.access_count())
            .field("is_expired", &self.is_expired())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
