//! Prometheus Exporter
//!
//! Mirrors `EdgeCache::statistics()` into a Prometheus registry. Layer
//! counters are cumulative inside the engine, so they are exported as
//! gauges set from each snapshot.

use prometheus::{Encoder, GaugeVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::cache::analytics::CacheStatistics;
use crate::cache::layer::LayerStatus;
use crate::error::{Error, Result};

const NAMESPACE: &str = "edgecache";

/// Per-layer and engine-wide cache metrics
pub struct CacheExporter {
    registry: Registry,
    layer_size_bytes: IntGaugeVec,
    layer_max_size_bytes: IntGaugeVec,
    layer_entries: IntGaugeVec,
    layer_hits: IntGaugeVec,
    layer_misses: IntGaugeVec,
    layer_evictions: IntGaugeVec,
    layer_writes: IntGaugeVec,
    layer_errors: IntGaugeVec,
    layer_hit_rate: GaugeVec,
    layer_latency_seconds: GaugeVec,
    layer_status: IntGaugeVec,
    tenants: IntGauge,
    logged_operations: IntGauge,
}

fn prom_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("prometheus: {}", e))
}

impl CacheExporter {
    /// Create an exporter with its own registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let int_vec = |name: &str, help: &str, labels: &[&str]| -> Result<IntGaugeVec> {
            let gauge = IntGaugeVec::new(Opts::new(name, help).namespace(NAMESPACE), labels)
                .map_err(prom_err)?;
            registry.register(Box::new(gauge.clone())).map_err(prom_err)?;
            Ok(gauge)
        };
        let float_vec = |name: &str, help: &str| -> Result<GaugeVec> {
            let gauge = GaugeVec::new(Opts::new(name, help).namespace(NAMESPACE), &["layer"])
                .map_err(prom_err)?;
            registry.register(Box::new(gauge.clone())).map_err(prom_err)?;
            Ok(gauge)
        };
        let int = |name: &str, help: &str| -> Result<IntGauge> {
            let gauge = IntGauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))
                .map_err(prom_err)?;
            registry.register(Box::new(gauge.clone())).map_err(prom_err)?;
            Ok(gauge)
        };

        let exporter = Self {
            layer_size_bytes: int_vec(
                "layer_size_bytes",
                "Bytes currently held by the layer",
                &["layer"],
            )?,
            layer_max_size_bytes: int_vec(
                "layer_max_size_bytes",
                "Layer capacity in bytes",
                &["layer"],
            )?,
            layer_entries: int_vec(
                "layer_entries",
                "Entries currently held by the layer",
                &["layer"],
            )?,
            layer_hits: int_vec("layer_hits", "Hits served by the layer", &["layer"])?,
            layer_misses: int_vec("layer_misses", "Misses recorded by the layer", &["layer"])?,
            layer_evictions: int_vec(
                "layer_evictions",
                "Entries evicted from the layer",
                &["layer"],
            )?,
            layer_writes: int_vec("layer_writes", "Entries written to the layer", &["layer"])?,
            layer_errors: int_vec("layer_errors", "Storage adapter failures", &["layer"])?,
            layer_hit_rate: float_vec("layer_hit_rate", "Hit rate (0-1)")?,
            layer_latency_seconds: float_vec(
                "layer_latency_seconds",
                "Moving average adapter latency",
            )?,
            layer_status: int_vec(
                "layer_status",
                "1 for the layer's current status",
                &["layer", "status"],
            )?,
            tenants: int("tenants", "Tenants with resident keys")?,
            logged_operations: int("logged_operations", "Operations held in the log")?,
            registry,
        };
        Ok(exporter)
    }

    /// Copy a statistics snapshot into the gauges
    pub fn update(&self, stats: &CacheStatistics) {
        for layer in &stats.layers {
            let id = [layer.id.as_str()];
            self.layer_size_bytes.with_label_values(&id).set(layer.current_size as i64);
            self.layer_max_size_bytes.with_label_values(&id).set(layer.max_size as i64);
            self.layer_entries.with_label_values(&id).set(layer.entries as i64);
            self.layer_hits.with_label_values(&id).set(layer.hits as i64);
            self.layer_misses.with_label_values(&id).set(layer.misses as i64);
            self.layer_evictions.with_label_values(&id).set(layer.evictions as i64);
            self.layer_writes.with_label_values(&id).set(layer.writes as i64);
            self.layer_errors.with_label_values(&id).set(layer.errors as i64);
            self.layer_hit_rate.with_label_values(&id).set(layer.hit_rate);
            self.layer_latency_seconds
                .with_label_values(&id)
                .set(layer.avg_latency_us as f64 / 1_000_000.0);

            for status in [LayerStatus::Active, LayerStatus::Degraded, LayerStatus::Offline] {
                let label = status.to_string();
                self.layer_status
                    .with_label_values(&[layer.id.as_str(), label.as_str()])
                    .set(i64::from(layer.status == status));
            }
        }
        self.tenants.set(stats.tenants as i64);
        self.logged_operations.set(stats.logged_operations as i64);
    }

    /// Render in the Prometheus text format
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(prom_err)?;
        String::from_utf8(buffer)
            .map_err(|e| Error::Internal(format!("metrics are not utf-8: {}", e)))
    }

    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::engine::{EdgeCache, SetOptions};
    use crate::config::EngineConfig;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_export_layer_metrics() {
        let cache = EdgeCache::new(EngineConfig::default()).unwrap();
        cache
            .set("catalog:1", Bytes::from_static(b"value"), Some("t1"), SetOptions::default())
            .await
            .unwrap();

        let exporter = CacheExporter::new().unwrap();
        exporter.update(&cache.statistics());
        let text = exporter.encode().unwrap();

        assert!(text.contains("edgecache_layer_size_bytes{layer=\"memory-l1\"} 5"));
        assert!(text.contains("edgecache_layer_writes{layer=\"redis-l2\"} 1"));
        assert!(text.contains("edgecache_layer_status{layer=\"cdn-edge\",status=\"active\"} 1"));
        assert!(text.contains("edgecache_tenants 1"));
    }
}
