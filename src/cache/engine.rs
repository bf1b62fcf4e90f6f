//! Edge Cache Engine
//!
//! The public face of the cache. Resolves layer chains, reads and fills
//! layers, triggers promotion and eviction, and records every call in the
//! operation log.
//!
//! # Failure semantics
//!
//! - `get` is fail-open: an adapter error is a miss for that layer
//! - `set` and `delete` are fail-closed: adapter errors are returned
//! - `invalidate` is best effort per layer
//! - `warmup` counts failures per item and never aborts a batch

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use tracing::{debug, info, instrument, warn};

use super::adapter::{InMemoryAdapter, StorageAdapter};
use super::analytics::{AnalyticsAggregator, CacheAnalytics, CacheStatistics};
use super::compression::CompressionManager;
use super::entry::{now_ms, CacheEntry, CacheKey};
use super::eviction::EvictionManager;
use super::invalidation::{InvalidateOptions, InvalidationEvent, InvalidationManager};
use super::layer::{CacheLayer, LayerStatus};
use super::maintenance::{HealthThresholds, MaintenanceSettings};
use super::oplog::{
    CacheOperation, OperationLog, OperationType, PendingOperation, TimeRange, BYPASS_LAYER,
};
use super::policy::{CachePolicyResolver, KeyPattern, Resolution};
use super::promotion::PromotionManager;
use super::registry::CacheLayerRegistry;
use crate::config::EngineConfig;
use crate::error::{Error, Result};

// =============================================================================
// Call Options and Outcomes
// =============================================================================

/// Options for [`EdgeCache::get`]
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Read these layers instead of the resolved chain
    pub preferred_layers: Option<Vec<String>>,
    /// Skip copies older than this
    pub max_staleness: Option<Duration>,
    /// Do not look anything up
    pub bypass_cache: bool,
}

impl GetOptions {
    pub fn bypass() -> Self {
        Self {
            bypass_cache: true,
            ..Default::default()
        }
    }

    pub fn in_layers(layers: &[&str]) -> Self {
        Self {
            preferred_layers: Some(layers.iter().map(|l| l.to_string()).collect()),
            ..Default::default()
        }
    }
}

/// Result of a lookup
#[derive(Debug, Clone)]
pub struct GetOutcome {
    /// Decompressed payload on a hit
    pub value: Option<Bytes>,
    pub hit: bool,
    /// Layer that served the hit
    pub layer: Option<String>,
    /// Age of the served copy
    pub age: Option<Duration>,
    pub operation: CacheOperation,
}

/// Options for [`EdgeCache::set`]
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// TTL for every written layer (overrides policy and layer defaults)
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
    pub source: Option<String>,
    pub version: Option<String>,
    /// Write these layers instead of the resolved chain
    pub target_layers: Option<Vec<String>>,
    /// Force compression on or off
    pub compression: Option<bool>,
}

impl SetOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Default::default()
        }
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags.extend(tags.iter().map(|t| t.to_string()));
        self
    }

    pub fn in_layers(mut self, layers: &[&str]) -> Self {
        self.target_layers = Some(layers.iter().map(|l| l.to_string()).collect());
        self
    }
}

/// Result of a write
#[derive(Debug, Clone)]
pub struct SetOutcome {
    /// At least one layer accepted the entry
    pub success: bool,
    pub layers_written: Vec<String>,
    pub operation: CacheOperation,
}

/// Result of a delete
#[derive(Debug, Clone)]
pub struct DeleteOutcome {
    pub deleted: bool,
    pub layers: Vec<String>,
    pub operation: CacheOperation,
}

/// One item to preload
#[derive(Debug, Clone)]
pub struct WarmupItem {
    pub key: String,
    pub value: Bytes,
    pub tenant_id: Option<String>,
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
}

impl WarmupItem {
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            tenant_id: None,
            ttl: None,
            tags: Vec::new(),
        }
    }

    pub fn for_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }
}

/// Options for [`EdgeCache::warmup`]
#[derive(Debug, Clone, Default)]
pub struct WarmupOptions {
    /// Items written in parallel per batch
    pub concurrency: Option<usize>,
    pub target_layers: Option<Vec<String>>,
}

/// Result of a warmup
#[derive(Debug, Clone)]
pub struct WarmupReport {
    /// Items at least one layer accepted
    pub success: usize,
    pub failed: usize,
    pub batches: usize,
    /// Per-item set operations (failed ones included), in item order
    pub operations: Vec<CacheOperation>,
    /// The warmup operation itself
    pub operation: CacheOperation,
}

/// A layer status change made by a health refresh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub layer: String,
    pub from: LayerStatus,
    pub to: LayerStatus,
}

struct Hit {
    value: Bytes,
    layer: String,
    age: Duration,
}

// =============================================================================
// Engine
// =============================================================================

/// Multi-tier, tenant-isolated cache
pub struct EdgeCache {
    registry: Arc<CacheLayerRegistry>,
    resolver: CachePolicyResolver,
    compression: CompressionManager,
    eviction: Arc<EvictionManager>,
    promotion: PromotionManager,
    invalidation: Arc<InvalidationManager>,
    oplog: Arc<OperationLog>,
    analytics: AnalyticsAggregator,
    warmup_concurrency: usize,
    maintenance: MaintenanceSettings,
    health: HealthThresholds,
}

impl EdgeCache {
    /// Build an engine with in-memory storage behind every layer
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_adapters(config, HashMap::new())
    }

    /// Build an engine, using the given adapters by layer id and
    /// in-memory storage for the rest
    pub fn with_adapters(
        config: EngineConfig,
        mut adapters: HashMap<String, Arc<dyn StorageAdapter>>,
    ) -> Result<Self> {
        config.validate()?;

        let layers: Vec<CacheLayer> = config
            .layer_configs()?
            .into_iter()
            .map(|layer_config| {
                let adapter = adapters
                    .remove(&layer_config.id)
                    .unwrap_or_else(|| Arc::new(InMemoryAdapter::new()) as Arc<dyn StorageAdapter>);
                CacheLayer::new(layer_config, adapter)
            })
            .collect();
        if let Some(unknown) = adapters.keys().next() {
            return Err(Error::LayerNotFound(unknown.clone()));
        }

        let registry = Arc::new(CacheLayerRegistry::new(layers)?);
        let eviction = Arc::new(EvictionManager::new(registry.clone()));
        let promotion =
            PromotionManager::new(registry.clone(), eviction.clone(), config.promotion_threshold);
        let invalidation = Arc::new(InvalidationManager::new(registry.clone()));
        let oplog = Arc::new(OperationLog::with_limits(
            config.maintenance.log_max_entries,
            config.maintenance.log_keep_entries,
        ));
        let analytics =
            AnalyticsAggregator::new(registry.clone(), oplog.clone(), invalidation.clone());

        info!(
            layers = registry.layers().len(),
            policies = config.policies.len(),
            default_chain = ?config.default_chain,
            "Edge cache initialized"
        );

        Ok(Self {
            resolver: CachePolicyResolver::new(
                config.cache_policies()?,
                config.default_chain.clone(),
            ),
            compression: CompressionManager::with_threshold(config.compression_threshold),
            maintenance: config.maintenance_settings()?,
            health: config.health_thresholds(),
            warmup_concurrency: config.warmup_concurrency,
            registry,
            eviction,
            promotion,
            invalidation,
            oplog,
            analytics,
        })
    }

    pub fn registry(&self) -> &Arc<CacheLayerRegistry> {
        &self.registry
    }

    pub fn layer(&self, id: &str) -> Option<&Arc<CacheLayer>> {
        self.registry.get(id)
    }

    pub fn resolver(&self) -> &CachePolicyResolver {
        &self.resolver
    }

    pub fn operation_log(&self) -> &OperationLog {
        &self.oplog
    }

    pub fn invalidation_history(&self, range: Option<TimeRange>) -> Vec<InvalidationEvent> {
        self.invalidation.history(range)
    }

    pub fn maintenance_settings(&self) -> &MaintenanceSettings {
        &self.maintenance
    }

    pub fn health_thresholds(&self) -> &HealthThresholds {
        &self.health
    }

    /// Freeze an operation, append it to the log and hand back a copy
    fn record<T>(&self, op: PendingOperation, result: &Result<T>) -> CacheOperation {
        let operation = match result {
            Ok(_) => op.complete(),
            Err(e) => op.fail(e),
        };
        self.oplog.append(operation.clone());
        operation
    }

    /// Resolve the layer chain for a key and check tenant requirements
    fn resolve(
        &self,
        key: &CacheKey,
        explicit: Option<&[String]>,
    ) -> Result<(Resolution, Vec<Arc<CacheLayer>>)> {
        let resolution = self.resolver.resolve(key.key(), explicit);
        if resolution.tenant_isolation && key.tenant().is_none() {
            return Err(Error::InvalidTenant {
                tenant: String::new(),
                reason: format!(
                    "policy {} requires a tenant id",
                    resolution.policy_id.as_deref().unwrap_or("default")
                ),
            });
        }

        let chain = resolution
            .layers
            .iter()
            .map(|id| self.registry.require(id).cloned())
            .collect::<Result<Vec<_>>>()?;
        Ok((resolution, chain))
    }

    // =========================================================================
    // Get
    // =========================================================================

    /// Look a key up along its layer chain
    #[instrument(skip(self, options), fields(tenant = tenant_id.unwrap_or("global")))]
    pub async fn get(
        &self,
        key: &str,
        tenant_id: Option<&str>,
        options: GetOptions,
    ) -> Result<GetOutcome> {
        let mut op = PendingOperation::new(OperationType::Get, key, tenant_id);
        let result = self.get_inner(key, tenant_id, &options, &mut op).await;
        let operation = self.record(op, &result);

        let hit = result?;
        Ok(match hit {
            Some(hit) => GetOutcome {
                value: Some(hit.value),
                hit: true,
                layer: Some(hit.layer),
                age: Some(hit.age),
                operation,
            },
            None => GetOutcome {
                value: None,
                hit: false,
                layer: None,
                age: None,
                operation,
            },
        })
    }

    async fn get_inner(
        &self,
        key: &str,
        tenant_id: Option<&str>,
        options: &GetOptions,
        op: &mut PendingOperation,
    ) -> Result<Option<Hit>> {
        let cache_key = CacheKey::new(key, tenant_id)?;
        if options.bypass_cache {
            op.touch_layer(BYPASS_LAYER);
            debug!(key = %cache_key, "Cache bypassed");
            return Ok(None);
        }

        let (_, chain) = self.resolve(&cache_key, options.preferred_layers.as_deref())?;

        for (index, layer) in chain.iter().enumerate() {
            if !layer.is_active() {
                continue;
            }
            op.touch_layer(layer.id());

            let entry = match layer.load(cache_key.physical()).await {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    layer.metrics().record_miss();
                    continue;
                }
                Err(_) => {
                    // Already counted against the layer; fall through to the next one
                    layer.metrics().record_miss();
                    continue;
                }
            };

            let now = now_ms();
            if entry.is_expired_at(now) {
                self.discard(layer, &entry, "expired").await;
                continue;
            }

            let age = entry.age_at(now);
            if options.max_staleness.is_some_and(|max| age > max) {
                debug!(layer = %layer.id(), age_ms = age.as_millis() as u64, "Skipping stale copy");
                continue;
            }

            let value = if entry.verify_integrity() {
                self.compression.decode(entry.data(), entry.metadata().compression)
            } else {
                Err(Error::IntegrityCheckFailed {
                    key: cache_key.physical().to_string(),
                    layer: layer.id().to_string(),
                })
            };
            let value = match value {
                Ok(value) => value,
                Err(e) => {
                    warn!(
                        layer = %layer.id(),
                        key = %cache_key,
                        error = %e,
                        "Dropping unreadable entry"
                    );
                    layer.metrics().record_error();
                    layer.metrics().record_miss();
                    self.discard(layer, &entry, "corrupt").await;
                    continue;
                }
            };

            entry.record_access();
            layer.metrics().record_hit();
            op.set_hit(true);
            op.set_size(value.len() as u64);

            if index > 0 {
                self.promotion.promote(&chain, index, &entry).await;
            }

            return Ok(Some(Hit {
                value,
                layer: layer.id().to_string(),
                age,
            }));
        }

        Ok(None)
    }

    /// Remove `entry` from `layer` unless a concurrent write replaced it
    async fn discard(&self, layer: &CacheLayer, entry: &Arc<CacheEntry>, why: &'static str) {
        let physical = entry.physical_key();
        let guard = layer.lock_writes().await;

        match layer.load(&physical).await {
            Ok(Some(current)) if Arc::ptr_eq(&current, entry) => {
                if let Err(e) = self.registry.remove_entry(layer, &guard, &physical).await {
                    warn!(
                        layer = %layer.id(),
                        key = %physical,
                        reason = why,
                        error = %e,
                        "Failed to drop entry"
                    );
                } else {
                    debug!(layer = %layer.id(), key = %physical, reason = why, "Dropped entry");
                }
            }
            _ => {}
        }
    }

    // =========================================================================
    // Set
    // =========================================================================

    /// Write a value into every active layer of its chain
    #[instrument(
        skip(self, value, options),
        fields(tenant = tenant_id.unwrap_or("global"), len = value.len())
    )]
    pub async fn set(
        &self,
        key: &str,
        value: Bytes,
        tenant_id: Option<&str>,
        options: SetOptions,
    ) -> Result<SetOutcome> {
        let (operation, result) = self.set_logged(key, &value, tenant_id, &options).await;

        match result {
            Ok(layers_written) => Ok(SetOutcome {
                success: !layers_written.is_empty(),
                layers_written,
                operation,
            }),
            Err(e) => {
                warn!(error = %e, "Cache write failed");
                Err(e)
            }
        }
    }

    /// Run a write and append its operation to the log
    async fn set_logged(
        &self,
        key: &str,
        value: &Bytes,
        tenant_id: Option<&str>,
        options: &SetOptions,
    ) -> (CacheOperation, Result<Vec<String>>) {
        let mut op = PendingOperation::new(OperationType::Set, key, tenant_id);
        let result = self.set_inner(key, value, tenant_id, options, &mut op).await;
        let operation = self.record(op, &result);
        (operation, result)
    }

    async fn set_inner(
        &self,
        key: &str,
        value: &Bytes,
        tenant_id: Option<&str>,
        options: &SetOptions,
        op: &mut PendingOperation,
    ) -> Result<Vec<String>> {
        if options.ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(Error::InvalidArgument("ttl must be greater than zero".into()));
        }

        let cache_key = CacheKey::new(key, tenant_id)?;
        let (resolution, chain) = self.resolve(&cache_key, options.target_layers.as_deref())?;

        let explicit = match options.compression {
            Some(flag) => Some(flag),
            None if !resolution.compression => Some(false),
            None => None,
        };
        let (data, algorithm) = self.compression.encode(value, explicit)?;

        let template = CacheEntry::new(&cache_key, data, Duration::ZERO, algorithm)
            .with_tags(resolution.tags.iter().chain(options.tags.iter()).cloned())
            .with_origin(options.source.clone(), options.version.clone());
        let size = template.size();
        op.set_size(size);

        let mut written = Vec::new();
        for layer in &chain {
            if !layer.is_active() {
                continue;
            }

            let ttl = options
                .ttl
                .or_else(|| resolution.ttl.get(layer.id()).copied())
                .unwrap_or(layer.config().default_ttl);

            let guard = layer.lock_writes().await;
            // The previous copy must not count against capacity
            self.registry.remove_entry(layer, &guard, cache_key.physical()).await?;

            if !self.eviction.ensure_capacity(layer, &guard, size).await? {
                warn!(
                    layer = %layer.id(),
                    size,
                    max = layer.max_size(),
                    "Entry does not fit, skipping layer"
                );
                continue;
            }

            let entry = Arc::new(template.clone().with_ttl(ttl));
            self.registry.write_entry(layer, &guard, entry).await?;
            op.touch_layer(layer.id());
            written.push(layer.id().to_string());
        }

        debug!(key = %cache_key, size, compression = %algorithm, layers = ?written, "Stored entry");
        Ok(written)
    }

    // =========================================================================
    // Delete / Invalidate / Clear
    // =========================================================================

    /// Remove one key from every layer
    #[instrument(skip(self), fields(tenant = tenant_id.unwrap_or("global")))]
    pub async fn delete(&self, key: &str, tenant_id: Option<&str>) -> Result<DeleteOutcome> {
        let mut op = PendingOperation::new(OperationType::Delete, key, tenant_id);
        let result = self.delete_inner(key, tenant_id, &mut op).await;
        let operation = self.record(op, &result);

        let layers = result?;
        Ok(DeleteOutcome {
            deleted: !layers.is_empty(),
            layers,
            operation,
        })
    }

    async fn delete_inner(
        &self,
        key: &str,
        tenant_id: Option<&str>,
        op: &mut PendingOperation,
    ) -> Result<Vec<String>> {
        let cache_key = CacheKey::new(key, tenant_id)?;
        let mut removed_from = Vec::new();
        let mut freed = 0;

        for layer in self.registry.layers() {
            let guard = layer.lock_writes().await;
            let removed = self
                .registry
                .remove_entry(layer, &guard, cache_key.physical())
                .await?;
            if let Some(entry) = removed {
                freed += entry.size();
                op.touch_layer(layer.id());
                removed_from.push(layer.id().to_string());
            }
        }
        op.set_size(freed);
        Ok(removed_from)
    }

    /// Remove entries by keys, tenant, pattern or tags
    pub async fn invalidate(&self, options: InvalidateOptions) -> Result<InvalidationEvent> {
        let target = options
            .selector()
            .map(|s| s.describe())
            .unwrap_or_else(|_| "invalid".to_string());
        let mut op =
            PendingOperation::new(OperationType::Invalidate, target, options.tenant_id.as_deref());

        let result = self.invalidation.invalidate(&options).await;
        if let Ok(event) = &result {
            for layer in &event.layers_affected {
                op.touch_layer(layer);
            }
            op.set_size(event.bytes_freed);
        }
        self.record(op, &result);
        result
    }

    /// Empty every layer; returns the number of entries removed
    #[instrument(skip(self))]
    pub async fn clear(&self) -> Result<u64> {
        let mut removed = 0;
        for layer in self.registry.layers() {
            let guard = layer.lock_writes().await;
            for (key, _) in layer.scan(&KeyPattern::any()).await? {
                if self.registry.remove_entry(layer, &guard, &key).await?.is_some() {
                    removed += 1;
                }
            }
            layer.reset_size(&guard);
        }
        self.registry.keyspace().clear();

        info!(removed, "Cache cleared");
        Ok(removed)
    }

    // =========================================================================
    // Warmup
    // =========================================================================

    /// Preload items in sequential batches of parallel writes
    #[instrument(skip(self, items, options), fields(items = items.len()))]
    pub async fn warmup(
        &self,
        items: Vec<WarmupItem>,
        options: WarmupOptions,
    ) -> Result<WarmupReport> {
        let concurrency = options.concurrency.unwrap_or(self.warmup_concurrency);
        let target = format!("warmup:{}", items.len());
        let mut op = PendingOperation::new(OperationType::Warmup, target, None);
        if concurrency == 0 {
            let result = Err(Error::InvalidArgument(
                "warmup concurrency must be at least 1".into(),
            ));
            self.record::<WarmupReport>(op, &result);
            return result;
        }

        let mut report_ops = Vec::with_capacity(items.len());
        let mut success = 0;
        let mut failed = 0;
        let mut batches = 0;

        for batch in items.chunks(concurrency) {
            batches += 1;
            let writes = batch.iter().map(|item| {
                let set_options = SetOptions {
                    ttl: item.ttl,
                    tags: item.tags.clone(),
                    source: Some("warmup".to_string()),
                    target_layers: options.target_layers.clone(),
                    ..Default::default()
                };
                async move {
                    self.set_logged(&item.key, &item.value, item.tenant_id.as_deref(), &set_options)
                        .await
                }
            });

            for (item, (operation, result)) in batch.iter().zip(join_all(writes).await) {
                match result {
                    Ok(layers_written) if !layers_written.is_empty() => {
                        success += 1;
                        for layer in &layers_written {
                            op.touch_layer(layer);
                        }
                    }
                    Ok(_) => failed += 1,
                    Err(e) => {
                        debug!(key = %item.key, error = %e, "Warmup item failed");
                        failed += 1;
                    }
                }
                report_ops.push(operation);
            }
        }

        op.set_size(success as u64);
        let operation = self.record::<()>(op, &Ok(()));
        info!(success, failed, batches, "Warmup finished");

        Ok(WarmupReport {
            success,
            failed,
            batches,
            operations: report_ops,
            operation,
        })
    }

    // =========================================================================
    // Statistics and Analytics
    // =========================================================================

    /// Per-layer snapshot plus totals
    pub fn statistics(&self) -> CacheStatistics {
        self.analytics.statistics()
    }

    /// Analytics over `range` (whole log if None)
    pub async fn cache_analytics(&self, range: Option<TimeRange>) -> CacheAnalytics {
        self.analytics.cache_analytics(range).await
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Delete every expired entry; returns how many were removed
    #[instrument(skip(self))]
    pub async fn sweep_expired(&self) -> u64 {
        let mut removed = 0;
        for layer in self.registry.layers() {
            let guard = layer.lock_writes().await;
            let entries = match layer.scan(&KeyPattern::any()).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(layer = %layer.id(), error = %e, "Sweep scan failed");
                    continue;
                }
            };

            let now = now_ms();
            for (key, entry) in entries {
                if !entry.is_expired_at(now) {
                    continue;
                }
                match self.registry.remove_entry(layer, &guard, &key).await {
                    Ok(Some(_)) => removed += 1,
                    Ok(None) => {}
                    Err(e) => {
                        warn!(layer = %layer.id(), key = %key, error = %e, "Sweep delete failed")
                    }
                }
            }
        }

        if removed > 0 {
            info!(removed, "Expired entries swept");
        }
        removed
    }

    /// Recompute rates and move layers between active, degraded and offline
    #[instrument(skip(self))]
    pub async fn refresh_layer_health(&self) -> Vec<StatusChange> {
        let mut changes = Vec::new();

        for layer in self.registry.layers() {
            layer.metrics().refresh_rates();

            let previous = layer.status();
            let next = if previous != LayerStatus::Active && layer.ping().await.is_ok() {
                LayerStatus::Active
            } else {
                self.health.classify(layer.metrics().consecutive_errors())
            };

            if next != previous {
                layer.set_status(next);
                match next {
                    LayerStatus::Active => {
                        info!(layer = %layer.id(), from = %previous, "Layer recovered")
                    }
                    _ => warn!(
                        layer = %layer.id(),
                        from = %previous,
                        to = %next,
                        consecutive_errors = layer.metrics().consecutive_errors(),
                        "Layer status changed"
                    ),
                }
                changes.push(StatusChange {
                    layer: layer.id().to_string(),
                    from: previous,
                    to: next,
                });
            }
        }
        changes
    }

    /// Trim the operation log; returns how many operations were dropped
    pub fn trim_log(&self) -> usize {
        let dropped = self.oplog.trim();
        if dropped > 0 {
            debug!(dropped, remaining = self.oplog.len(), "Operation log trimmed");
        }
        dropped
    }
}

impl std::fmt::Debug for EdgeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeCache")
            .field("layers", &self.registry.layers())
            .field("default_chain", &self.resolver.default_chain())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
