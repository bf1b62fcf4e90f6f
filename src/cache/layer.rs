//! Cache Layers
//!
//! One tier of the cache: static configuration, live size accounting,
//! status, and counters, in front of a `StorageAdapter`.
//!
//! # Design
//!
//! - Reads go straight to the adapter
//! - Every mutation runs under the layer's async write lock, so capacity
//!   checks, eviction and the write that follows are atomic per layer
//! - Every adapter call is bounded by `operation_timeout` and feeds the
//!   latency EMA and the error streak used for health transitions

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};

use super::adapter::StorageAdapter;
use super::entry::CacheEntry;
use super::policy::{EvictionPolicy, KeyPattern};
use crate::error::{Error, Result};

/// Proof that the caller holds a layer's write lock
pub type WriteGuard<'a> = MutexGuard<'a, ()>;

/// Kind of backend a layer represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    /// In-process memory
    Local,
    /// Shared cache cluster
    Distributed,
    /// CDN edge
    Edge,
}

impl std::fmt::Display for LayerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LayerKind::Local => write!(f, "local"),
            LayerKind::Distributed => write!(f, "distributed"),
            LayerKind::Edge => write!(f, "edge"),
        }
    }
}

/// Layer availability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerStatus {
    /// Serving reads and writes
    Active,
    /// Backend is erroring; skipped until it recovers
    Degraded,
    /// Backend is unreachable; skipped until a ping succeeds
    Offline,
}

impl std::fmt::Display for LayerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LayerStatus::Active => write!(f, "active"),
            LayerStatus::Degraded => write!(f, "degraded"),
            LayerStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Static layer configuration
#[derive(Debug, Clone)]
pub struct LayerConfig {
    /// Layer id (e.g. "memory-l1")
    pub id: String,
    /// Backend kind
    pub kind: LayerKind,
    /// Deployment region
    pub region: String,
    /// TTL when neither the caller nor a policy supplies one
    pub default_ttl: Duration,
    /// Capacity in bytes
    pub max_size: u64,
    /// Victim selection
    pub eviction: EvictionPolicy,
    /// Upper bound on a single adapter call
    pub operation_timeout: Duration,
}

impl LayerConfig {
    /// Create a layer configuration with a 1s operation timeout
    pub fn new(
        id: impl Into<String>,
        kind: LayerKind,
        max_size: u64,
        default_ttl: Duration,
        eviction: EvictionPolicy,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            region: "local".to_string(),
            default_ttl,
            max_size,
            eviction,
            operation_timeout: Duration::from_secs(1),
        }
    }

    /// Set the region
    pub fn in_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }
}

/// Derived rates, refreshed on hits and by maintenance
#[derive(Debug, Clone, Copy)]
pub struct LayerRates {
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub last_updated: DateTime<Utc>,
}

/// Per-layer counters
#[derive(Debug)]
pub struct LayerMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    writes: AtomicU64,
    reads: AtomicU64,
    errors: AtomicU64,
    consecutive_errors: AtomicU32,
    // Exponential moving average of adapter latency (microseconds)
    avg_latency_us: AtomicU64,
    rates: RwLock<LayerRates>,
}

impl Default for LayerMetrics {
    fn default() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            consecutive_errors: AtomicU32::new(0),
            avg_latency_us: AtomicU64::new(0),
            rates: RwLock::new(LayerRates {
                hit_rate: 0.0,
                miss_rate: 0.0,
                last_updated: Utc::now(),
            }),
        }
    }
}

impl LayerMetrics {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.refresh_rates();
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a backend failure and extend the error streak
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.consecutive_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn record_success(&self) {
        self.consecutive_errors.store(0, Ordering::Relaxed);
    }

    /// Reset the error streak after a successful ping
    pub fn clear_error_streak(&self) {
        self.record_success();
    }

    fn record_latency(&self, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1;

        loop {
            let current = self.avg_latency_us.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if self
                .avg_latency_us
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Recompute hit/miss rates from the cumulative counters
    pub fn refresh_rates(&self) {
        let hits = self.hits() as f64;
        let misses = self.misses() as f64;
        let total = hits + misses;
        let (hit_rate, miss_rate) = if total == 0.0 {
            (0.0, 0.0)
        } else {
            (hits / total, misses / total)
        };
        *self.rates.write() = LayerRates {
            hit_rate,
            miss_rate,
            last_updated: Utc::now(),
        };
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::Relaxed)
    }

    pub fn avg_latency(&self) -> Duration {
        Duration::from_micros(self.avg_latency_us.load(Ordering::Relaxed))
    }

    pub fn rates(&self) -> LayerRates {
        *self.rates.read()
    }
}

/// One cache tier
pub struct CacheLayer {
    config: LayerConfig,
    adapter: Arc<dyn StorageAdapter>,
    status: RwLock<LayerStatus>,
    metrics: LayerMetrics,
    current_size: AtomicU64,
    write_lock: Mutex<()>,
}

impl CacheLayer {
    /// Create an active layer
    pub fn new(config: LayerConfig, adapter: Arc<dyn StorageAdapter>) -> Self {
        Self {
            config,
            adapter,
            status: RwLock::new(LayerStatus::Active),
            metrics: LayerMetrics::default(),
            current_size: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        }
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &LayerConfig {
        &self.config
    }

    pub fn adapter(&self) -> &Arc<dyn StorageAdapter> {
        &self.adapter
    }

    pub fn metrics(&self) -> &LayerMetrics {
        &self.metrics
    }

    pub fn status(&self) -> LayerStatus {
        *self.status.read()
    }

    /// Change the status; returns the previous one
    pub fn set_status(&self, status: LayerStatus) -> LayerStatus {
        std::mem::replace(&mut *self.status.write(), status)
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.status() == LayerStatus::Active
    }

    #[inline]
    pub fn current_size(&self) -> u64 {
        self.current_size.load(Ordering::Acquire)
    }

    #[inline]
    pub fn max_size(&self) -> u64 {
        self.config.max_size
    }

    /// Fraction of capacity in use (0.0 - 1.0)
    pub fn utilization(&self) -> f64 {
        if self.config.max_size == 0 {
            return 0.0;
        }
        self.current_size() as f64 / self.config.max_size as f64
    }

    /// Take the layer's write lock
    pub async fn lock_writes(&self) -> WriteGuard<'_> {
        self.write_lock.lock().await
    }

    /// Run an adapter call under the timeout, recording latency and errors
    async fn call<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let result = match tokio::time::timeout(self.config.operation_timeout, fut).await {
            Ok(result) => result.map_err(|e| match e {
                e @ (Error::Adapter { .. } | Error::AdapterTimeout { .. }) => e,
                other => Error::Adapter {
                    layer: self.config.id.clone(),
                    operation,
                    reason: other.to_string(),
                },
            }),
            Err(_) => Err(Error::AdapterTimeout {
                layer: self.config.id.clone(),
                operation,
                timeout_ms: self.config.operation_timeout.as_millis() as u64,
            }),
        };
        self.metrics.record_latency(start.elapsed());

        match &result {
            Ok(_) => self.metrics.record_success(),
            Err(e) => {
                self.metrics.record_error();
                tracing::warn!(
                    layer = %self.config.id,
                    operation,
                    error = %e,
                    "Storage adapter call failed"
                );
            }
        }
        result
    }

    /// Load an entry by physical key
    pub async fn load(&self, key: &str) -> Result<Option<Arc<CacheEntry>>> {
        self.metrics.record_read();
        self.call("load", self.adapter.load(key)).await
    }

    /// List entries whose physical key matches `pattern`
    pub async fn scan(&self, pattern: &KeyPattern) -> Result<Vec<(String, Arc<CacheEntry>)>> {
        self.call("scan", self.adapter.scan(pattern)).await
    }

    /// Ping the backend
    pub async fn ping(&self) -> Result<()> {
        self.call("ping", self.adapter.ping()).await
    }

    /// Store an entry, keeping `current_size` exact across replacements
    pub(crate) async fn store_locked(
        &self,
        _guard: &WriteGuard<'_>,
        key: &str,
        entry: Arc<CacheEntry>,
    ) -> Result<Option<Arc<CacheEntry>>> {
        let size = entry.size();
        let replaced = self.call("store", self.adapter.store(key, entry)).await?;
        if let Some(old) = &replaced {
            self.sub_size(old.size());
        }
        self.current_size.fetch_add(size, Ordering::AcqRel);
        self.metrics.record_write();
        Ok(replaced)
    }

    /// Delete an entry, releasing its bytes
    pub(crate) async fn remove_locked(
        &self,
        _guard: &WriteGuard<'_>,
        key: &str,
    ) -> Result<Option<Arc<CacheEntry>>> {
        let removed = self.call("delete", self.adapter.delete(key)).await?;
        if let Some(entry) = &removed {
            self.sub_size(entry.size());
        }
        Ok(removed)
    }

    fn sub_size(&self, size: u64) {
        // Saturating: an adapter that lost entries must not wrap the counter
        let _ = self
            .current_size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some(cur.saturating_sub(size))
            });
    }

    /// Drop all accounting (used with `clear`)
    pub(crate) fn reset_size(&self, _guard: &WriteGuard<'_>) {
        self.current_size.store(0, Ordering::Release);
    }
}

impl std::fmt::Debug for CacheLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLayer")
            .field("id", &self.config.id)
            .field("kind", &self.config.kind)
            .field("status", &self.status())
            .field("current_size", &self.current_size())
            .field("max_size", &self.config.max_size)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::adapter::InMemoryAdapter;
    use crate::cache::compression::CompressionAlgorithm;
    use crate::cache::entry::CacheKey;
    use bytes::Bytes;

    fn layer(max: u64) -> CacheLayer {
        CacheLayer::new(
            LayerConfig::new(
                "memory-l1",
                LayerKind::Local,
                max,
                Duration::from_secs(60),
                EvictionPolicy::Lru,
            ),
            Arc::new(InMemoryAdapter::new()),
        )
    }

    fn entry(key: &CacheKey, len: usize) -> Arc<CacheEntry> {
        Arc::new(CacheEntry::new(
            key,
            Bytes::from(vec![0u8; len]),
            Duration::from_secs(60),
            CompressionAlgorithm::None,
        ))
    }

    #[tokio::test]
    async fn test_size_accounting_on_replace_and_remove() {
        let layer = layer(1000);
        let key = CacheKey::global("k").unwrap();

        let guard = layer.lock_writes().await;
        layer.store_locked(&guard, key.physical(), entry(&key, 100)).await.unwrap();
        assert_eq!(layer.current_size(), 100);

        layer.store_locked(&guard, key.physical(), entry(&key, 40)).await.unwrap();
        assert_eq!(layer.current_size(), 40);

        layer.remove_locked(&guard, key.physical()).await.unwrap();
        assert_eq!(layer.current_size(), 0);
        assert_eq!(layer.metrics().writes(), 2);
    }

    #[tokio::test]
    async fn test_utilization() {
        let layer = layer(200);
        let key = CacheKey::global("k").unwrap();
        let guard = layer.lock_writes().await;
        layer.store_locked(&guard, key.physical(), entry(&key, 50)).await.unwrap();
        assert!((layer.utilization() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rates_refresh() {
        let metrics = LayerMetrics::default();
        metrics.record_hit();
        metrics.record_hit();
        metrics.record_miss();
        metrics.refresh_rates();

        let rates = metrics.rates();
        assert!((rates.hit_rate - 0.666).abs() < 0.01);
        assert!((rates.miss_rate - 0.333).abs() < 0.01);
    }

    #[test]
    fn test_latency_ema() {
        let metrics = LayerMetrics::default();
        metrics.record_latency(Duration::from_micros(100));
        assert_eq!(metrics.avg_latency(), Duration::from_micros(100));

        metrics.record_latency(Duration::from_micros(200));
        let latency = metrics.avg_latency().as_micros();
        assert!(latency > 100 && latency < 200);
    }

    #[test]
    fn test_error_streak() {
        let metrics = LayerMetrics::default();
        metrics.record_error();
        metrics.record_error();
        assert_eq!(metrics.consecutive_errors(), 2);
        assert_eq!(metrics.errors(), 2);

        metrics.clear_error_streak();
        assert_eq!(metrics.consecutive_errors(), 0);
        assert_eq!(metrics.errors(), 2);
    }

    #[test]
    fn test_status_transitions() {
        let layer = layer(10);
        assert!(layer.is_active());
        assert_eq!(layer.set_status(LayerStatus::Degraded), LayerStatus::Active);
        assert!(!layer.is_active());
        assert_eq!(layer.status().to_string(), "degraded");
    }
}
