//! Analytics Aggregator
//!
//! Derives hit rates, latency percentiles, per-tenant numbers, invalidation
//! totals and hot keys from the operation log, the invalidation history and
//! live layer state. Everything is computed on demand; nothing here is
//! cached between calls.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use super::entry::GLOBAL_TENANT;
use super::invalidation::InvalidationManager;
use super::layer::{LayerKind, LayerStatus};
use super::oplog::{CacheOperation, OperationLog, OperationStatus, OperationType, TimeRange};
use super::policy::{EvictionPolicy, KeyPattern};
use super::registry::CacheLayerRegistry;

/// Length of the hot key ranking
pub const HOT_KEY_LIMIT: usize = 20;

// =============================================================================
// Report Types
// =============================================================================

/// Full analytics report
#[derive(Debug, Clone, Serialize)]
pub struct CacheAnalytics {
    pub generated_at: DateTime<Utc>,
    pub range_start: Option<DateTime<Utc>>,
    pub range_end: Option<DateTime<Utc>>,
    pub layers: Vec<LayerAnalytics>,
    pub global: GlobalAnalytics,
    pub tenants: Vec<TenantAnalytics>,
    pub invalidations: InvalidationAnalytics,
    pub hot_keys: Vec<HotKey>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LayerAnalytics {
    pub id: String,
    pub kind: LayerKind,
    pub status: LayerStatus,
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub utilization: f64,
    pub current_size: u64,
    pub max_size: u64,
    /// Logged operations that touched the layer
    pub operations: u64,
    /// Mean latency of those operations
    pub avg_latency_ms: f64,
    /// Moving average of raw adapter calls
    pub adapter_latency_ms: f64,
    pub evictions: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GlobalAnalytics {
    pub total_operations: u64,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub invalidations: u64,
    pub warmups: u64,
    pub failed: u64,
    pub hit_rate: f64,
    pub avg_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TenantAnalytics {
    pub tenant_id: String,
    pub operations: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    /// Distinct physical keys resident in any layer
    pub key_count: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InvalidationAnalytics {
    pub total_events: u64,
    pub total_entries: u64,
    pub by_reason: Vec<ReasonStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReasonStats {
    pub reason: String,
    pub events: u64,
    pub entries: u64,
    pub avg_entries: f64,
}

/// A key ranked by cumulative hits across layers
#[derive(Debug, Clone, Serialize)]
pub struct HotKey {
    pub key: String,
    pub tenant_id: String,
    pub access_count: u64,
    pub layers: Vec<String>,
}

/// Point-in-time snapshot of one layer
#[derive(Debug, Clone, Serialize)]
pub struct LayerStatistics {
    pub id: String,
    pub kind: LayerKind,
    pub region: String,
    pub eviction: EvictionPolicy,
    pub status: LayerStatus,
    pub entries: u64,
    pub current_size: u64,
    pub max_size: u64,
    pub utilization: f64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub writes: u64,
    pub reads: u64,
    pub errors: u64,
    pub consecutive_errors: u32,
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub avg_latency_us: u64,
    pub rates_updated_at: DateTime<Utc>,
}

/// Snapshot of every layer plus totals
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatistics {
    pub layers: Vec<LayerStatistics>,
    pub total_entries: u64,
    pub total_size: u64,
    pub total_hits: u64,
    pub total_misses: u64,
    pub hit_rate: f64,
    pub tenants: usize,
    pub logged_operations: usize,
    pub invalidation_events: usize,
}

// =============================================================================
// Aggregator
// =============================================================================

pub struct AnalyticsAggregator {
    registry: Arc<CacheLayerRegistry>,
    oplog: Arc<OperationLog>,
    invalidation: Arc<InvalidationManager>,
}

impl AnalyticsAggregator {
    pub fn new(
        registry: Arc<CacheLayerRegistry>,
        oplog: Arc<OperationLog>,
        invalidation: Arc<InvalidationManager>,
    ) -> Self {
        Self {
            registry,
            oplog,
            invalidation,
        }
    }

    /// Build the analytics report for `range` (whole log if None)
    pub async fn cache_analytics(&self, range: Option<TimeRange>) -> CacheAnalytics {
        let ops = self.oplog.snapshot(range);

        CacheAnalytics {
            generated_at: Utc::now(),
            range_start: range.map(|r| r.start),
            range_end: range.map(|r| r.end),
            layers: self.layer_analytics(&ops),
            global: global_analytics(&ops),
            tenants: self.tenant_analytics(&ops),
            invalidations: self.invalidation_analytics(range),
            hot_keys: self.hot_keys().await,
        }
    }

    fn layer_analytics(&self, ops: &[CacheOperation]) -> Vec<LayerAnalytics> {
        self.registry
            .layers()
            .iter()
            .map(|layer| {
                let touched: Vec<&CacheOperation> = ops
                    .iter()
                    .filter(|op| op.layer_ids.iter().any(|l| l == layer.id()))
                    .collect();
                let latencies: Vec<u64> = touched.iter().map(|op| op.latency_us).collect();
                let metrics = layer.metrics();
                let rates = metrics.rates();

                LayerAnalytics {
                    id: layer.id().to_string(),
                    kind: layer.config().kind,
                    status: layer.status(),
                    hit_rate: rates.hit_rate,
                    miss_rate: rates.miss_rate,
                    utilization: layer.utilization(),
                    current_size: layer.current_size(),
                    max_size: layer.max_size(),
                    operations: touched.len() as u64,
                    avg_latency_ms: mean_ms(&latencies),
                    adapter_latency_ms: metrics.avg_latency().as_secs_f64() * 1000.0,
                    evictions: metrics.evictions(),
                    errors: metrics.errors(),
                }
            })
            .collect()
    }

    fn tenant_analytics(&self, ops: &[CacheOperation]) -> Vec<TenantAnalytics> {
        let key_counts = self.registry.keyspace().key_counts();

        // (operations, hits, misses)
        let mut counters: BTreeMap<String, (u64, u64, u64)> = BTreeMap::new();
        for tenant in key_counts.keys() {
            counters.entry(tenant.clone()).or_default();
        }
        for op in ops {
            let tenant = op.tenant_id.as_deref().unwrap_or(GLOBAL_TENANT);
            let c = counters.entry(tenant.to_string()).or_default();
            c.0 += 1;
            if op.op_type == OperationType::Get && op.status == OperationStatus::Completed {
                if op.hit {
                    c.1 += 1;
                } else {
                    c.2 += 1;
                }
            }
        }

        counters
            .into_iter()
            .map(|(tenant_id, (operations, hits, misses))| TenantAnalytics {
                key_count: key_counts.get(&tenant_id).copied().unwrap_or(0),
                tenant_id,
                operations,
                hits,
                misses,
                hit_rate: ratio(hits, hits + misses),
            })
            .collect()
    }

    fn invalidation_analytics(&self, range: Option<TimeRange>) -> InvalidationAnalytics {
        let mut by_reason: BTreeMap<String, (u64, u64)> = BTreeMap::new();
        let mut report = InvalidationAnalytics::default();

        for event in self.invalidation.history(range) {
            report.total_events += 1;
            report.total_entries += event.entries_invalidated;
            let r = by_reason.entry(event.reason).or_default();
            r.0 += 1;
            r.1 += event.entries_invalidated;
        }

        report.by_reason = by_reason
            .into_iter()
            .map(|(reason, (events, entries))| ReasonStats {
                reason,
                events,
                entries,
                avg_entries: if events == 0 { 0.0 } else { entries as f64 / events as f64 },
            })
            .collect();
        report
    }

    /// Top keys by access count summed over every layer holding them
    pub async fn hot_keys(&self) -> Vec<HotKey> {
        let mut totals: HashMap<String, HotKey> = HashMap::new();

        for layer in self.registry.layers() {
            let entries = match layer.scan(&KeyPattern::any()).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(layer = %layer.id(), error = %e, "Skipping layer in hot key scan");
                    continue;
                }
            };

            for (physical, entry) in entries {
                let hot = totals.entry(physical).or_insert_with(|| HotKey {
                    key: entry.key().to_string(),
                    tenant_id: entry.tenant_id().to_string(),
                    access_count: 0,
                    layers: Vec::new(),
                });
                hot.access_count += entry.access_count() as u64;
                hot.layers.push(layer.id().to_string());
            }
        }

        let mut ranked: Vec<HotKey> = totals.into_values().collect();
        ranked.sort_by(|a, b| {
            b.access_count
                .cmp(&a.access_count)
                .then_with(|| a.tenant_id.cmp(&b.tenant_id))
                .then_with(|| a.key.cmp(&b.key))
        });
        ranked.truncate(HOT_KEY_LIMIT);
        ranked
    }

    /// Snapshot of every layer
    pub fn statistics(&self) -> CacheStatistics {
        let layers: Vec<LayerStatistics> = self
            .registry
            .layers()
            .iter()
            .map(|layer| {
                let metrics = layer.metrics();
                let rates = metrics.rates();
                let config = layer.config();
                LayerStatistics {
                    id: config.id.clone(),
                    kind: config.kind,
                    region: config.region.clone(),
                    eviction: config.eviction,
                    status: layer.status(),
                    entries: layer.adapter().stats().object_count,
                    current_size: layer.current_size(),
                    max_size: layer.max_size(),
                    utilization: layer.utilization(),
                    hits: metrics.hits(),
                    misses: metrics.misses(),
                    evictions: metrics.evictions(),
                    writes: metrics.writes(),
                    reads: metrics.reads(),
                    errors: metrics.errors(),
                    consecutive_errors: metrics.consecutive_errors(),
                    hit_rate: rates.hit_rate,
                    miss_rate: rates.miss_rate,
                    avg_latency_us: metrics.avg_latency().as_micros() as u64,
                    rates_updated_at: rates.last_updated,
                }
            })
            .collect();

        let total_hits = layers.iter().map(|l| l.hits).sum();
        let total_misses = layers.iter().map(|l| l.misses).sum();
        CacheStatistics {
            total_entries: layers.iter().map(|l| l.entries).sum(),
            total_size: layers.iter().map(|l| l.current_size).sum(),
            total_hits,
            total_misses,
            hit_rate: ratio(total_hits, total_hits + total_misses),
            tenants: self.registry.keyspace().key_counts().len(),
            logged_operations: self.oplog.len(),
            invalidation_events: self.invalidation.history_len(),
            layers,
        }
    }
}

fn global_analytics(ops: &[CacheOperation]) -> GlobalAnalytics {
    let mut global = GlobalAnalytics {
        total_operations: ops.len() as u64,
        ..Default::default()
    };

    for op in ops {
        if op.status == OperationStatus::Failed {
            global.failed += 1;
        }
        match op.op_type {
            OperationType::Get if op.status == OperationStatus::Completed => {
                if op.hit {
                    global.hits += 1;
                } else {
                    global.misses += 1;
                }
            }
            OperationType::Get => {}
            OperationType::Set => global.sets += 1,
            OperationType::Delete => global.deletes += 1,
            OperationType::Invalidate => global.invalidations += 1,
            OperationType::Warmup => global.warmups += 1,
        }
    }

    let mut latencies: Vec<u64> = ops.iter().map(|op| op.latency_us).collect();
    latencies.sort_unstable();

    global.hit_rate = ratio(global.hits, global.hits + global.misses);
    global.avg_latency_ms = mean_ms(&latencies);
    global.p50_latency_ms = percentile(&latencies, 50.0) as f64 / 1000.0;
    global.p95_latency_ms = percentile(&latencies, 95.0) as f64 / 1000.0;
    global.p99_latency_ms = percentile(&latencies, 99.0) as f64 / 1000.0;
    global
}

/// Nearest-rank percentile over sorted samples
pub fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn mean_ms(latencies_us: &[u64]) -> f64 {
    if latencies_us.is_empty() {
        return 0.0;
    }
    latencies_us.iter().sum::<u64>() as f64 / latencies_us.len() as f64 / 1000.0
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

// =============================================================================
// Tests
// =============================================================================
