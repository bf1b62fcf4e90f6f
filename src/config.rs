//! Engine Configuration
//!
//! YAML-friendly description of the layers, routing policies and
//! maintenance settings. Durations and sizes are written as strings
//! (`"30s"`, `"5m"`, `"100MB"`) and parsed when the engine is built.
//!
//! ```yaml
//! layers:
//!   - id: memory-l1
//!     kind: local
//!     maxSize: 100MB
//!     defaultTtl: 5m
//!     eviction: lru
//! policies:
//!   - id: catalog
//!     pattern: "catalog:*"
//!     layers: [memory-l1]
//! defaultChain: [memory-l1]
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::compression::DEFAULT_COMPRESSION_THRESHOLD;
use crate::cache::layer::{LayerConfig, LayerKind};
use crate::cache::maintenance::{HealthThresholds, MaintenanceSettings};
use crate::cache::policy::{CachePolicy, EvictionPolicy, InvalidationStrategy, WarmupStrategy};
use crate::cache::promotion::DEFAULT_PROMOTION_THRESHOLD;
use crate::error::{Error, Result};

/// Warmup batch size when the caller gives none
pub const DEFAULT_WARMUP_CONCURRENCY: usize = 10;

// =============================================================================
// Config Types
// =============================================================================

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Layers in priority order
    pub layers: Vec<LayerSpec>,

    /// Routing policies, first match wins
    #[serde(default)]
    pub policies: Vec<PolicySpec>,

    /// Chain for keys no policy matches
    pub default_chain: Vec<String>,

    /// Hits before an entry is copied into faster layers
    #[serde(default = "default_promotion_threshold")]
    pub promotion_threshold: u32,

    /// Payloads larger than this are compressed (bytes)
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: u64,

    /// Default warmup batch size
    #[serde(default = "default_warmup_concurrency")]
    pub warmup_concurrency: usize,

    /// Background task settings
    #[serde(default)]
    pub maintenance: MaintenanceSpec,

    /// Layer health thresholds
    #[serde(default)]
    pub health: HealthSpec,
}

/// One cache layer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LayerSpec {
    pub id: String,

    pub kind: LayerKind,

    #[serde(default = "default_region")]
    pub region: String,

    /// Capacity (e.g. "100MB", "1GB", or plain bytes)
    pub max_size: String,

    /// TTL when neither caller nor policy gives one
    pub default_ttl: String,

    #[serde(default)]
    pub eviction: EvictionPolicy,

    /// Upper bound on one adapter call
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout: String,
}

/// Key routing rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    pub id: String,

    /// Glob over logical keys
    pub pattern: String,

    /// Ordered layer ids
    pub layers: Vec<String>,

    /// TTL per layer id
    #[serde(default)]
    pub ttl: BTreeMap<String, String>,

    #[serde(default)]
    pub invalidation: InvalidationStrategy,

    #[serde(default)]
    pub warmup: WarmupStrategy,

    #[serde(default)]
    pub tenant_isolation: bool,

    #[serde(default = "default_true")]
    pub compression: bool,

    #[serde(default)]
    pub tags: Vec<String>,
}

/// Background task intervals and log bounds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct MaintenanceSpec {
    pub sweep_interval: String,
    pub metrics_interval: String,
    pub log_trim_interval: String,
    pub log_max_entries: usize,
    pub log_keep_entries: usize,
}

impl Default for MaintenanceSpec {
    fn default() -> Self {
        Self {
            sweep_interval: "5m".to_string(),
            metrics_interval: "60s".to_string(),
            log_trim_interval: "60s".to_string(),
            log_max_entries: crate::cache::oplog::DEFAULT_LOG_MAX,
            log_keep_entries: crate::cache::oplog::DEFAULT_LOG_KEEP,
        }
    }
}

/// Consecutive adapter errors that degrade or take a layer offline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthSpec {
    pub degrade_after: u32,
    pub offline_after: u32,
}

impl Default for HealthSpec {
    fn default() -> Self {
        let thresholds = HealthThresholds::default();
        Self {
            degrade_after: thresholds.degrade_after,
            offline_after: thresholds.offline_after,
        }
    }
}

fn default_region() -> String {
    "local".to_string()
}

fn default_operation_timeout() -> String {
    "1s".to_string()
}

fn default_true() -> bool {
    true
}

fn default_promotion_threshold() -> u32 {
    DEFAULT_PROMOTION_THRESHOLD
}

fn default_compression_threshold() -> u64 {
    DEFAULT_COMPRESSION_THRESHOLD
}

fn default_warmup_concurrency() -> usize {
    DEFAULT_WARMUP_CONCURRENCY
}

fn layer_spec(
    id: &str,
    kind: LayerKind,
    max_size: &str,
    ttl: &str,
    eviction: EvictionPolicy,
    timeout: &str,
) -> LayerSpec {
    LayerSpec {
        id: id.to_string(),
        kind,
        region: default_region(),
        max_size: max_size.to_string(),
        default_ttl: ttl.to_string(),
        eviction,
        operation_timeout: timeout.to_string(),
    }
}

fn policy_spec(id: &str, pattern: &str, layers: &[(&str, &str)], tags: &[&str]) -> PolicySpec {
    PolicySpec {
        id: id.to_string(),
        pattern: pattern.to_string(),
        layers: layers.iter().map(|(l, _)| l.to_string()).collect(),
        ttl: layers
            .iter()
            .map(|(l, ttl)| (l.to_string(), ttl.to_string()))
            .collect(),
        invalidation: InvalidationStrategy::Immediate,
        warmup: WarmupStrategy::None,
        tenant_isolation: false,
        compression: true,
        tags: tags.iter().map(|t| t.to_string()).collect(),
    }
}

// =============================================================================
// Defaults
// =============================================================================

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            layers: vec![
                layer_spec(
                    "memory-l1",
                    LayerKind::Local,
                    "100MB",
                    "5m",
                    EvictionPolicy::Lru,
                    "100ms",
                ),
                layer_spec(
                    "redis-l2",
                    LayerKind::Distributed,
                    "1GB",
                    "1h",
                    EvictionPolicy::Lfu,
                    "500ms",
                ),
                layer_spec("cdn-edge", LayerKind::Edge, "10GB", "1d", EvictionPolicy::Ttl, "2s"),
            ],
            policies: vec![
                PolicySpec {
                    warmup: WarmupStrategy::Eager,
                    ..policy_spec(
                        "plugin-assets",
                        "plugin:*:asset:*",
                        &[("memory-l1", "5m"), ("cdn-edge", "1d")],
                        &["plugin-assets"],
                    )
                },
                policy_spec(
                    "catalog",
                    "catalog:*",
                    &[("memory-l1", "5m"), ("redis-l2", "1h")],
                    &["catalog"],
                ),
                PolicySpec {
                    tenant_isolation: true,
                    ..policy_spec(
                        "user-records",
                        "user:*",
                        &[("memory-l1", "1m"), ("redis-l2", "15m")],
                        &["user"],
                    )
                },
            ],
            default_chain: vec!["memory-l1".to_string(), "redis-l2".to_string()],
            promotion_threshold: DEFAULT_PROMOTION_THRESHOLD,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            warmup_concurrency: DEFAULT_WARMUP_CONCURRENCY,
            maintenance: MaintenanceSpec::default(),
            health: HealthSpec::default(),
        }
    }
}

// =============================================================================
// Loading and Validation
// =============================================================================

impl EngineConfig {
    /// Load and validate a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }

    /// Parse and validate YAML
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for inconsistencies
    pub fn validate(&self) -> Result<()> {
        if self.layers.is_empty() {
            return Err(Error::Config("at least one layer is required".into()));
        }

        let mut ids = HashSet::new();
        for layer in &self.layers {
            if layer.id.is_empty() {
                return Err(Error::Config("layer id must not be empty".into()));
            }
            if !ids.insert(layer.id.as_str()) {
                return Err(Error::Config(format!("duplicate layer id: {}", layer.id)));
            }
            layer.to_layer_config()?;
        }

        let known = |chain: &[String], owner: &str| -> Result<()> {
            if chain.is_empty() {
                return Err(Error::Config(format!("{} has an empty layer chain", owner)));
            }
            match chain.iter().find(|l| !ids.contains(l.as_str())) {
                Some(unknown) => Err(Error::Config(format!(
                    "{} references unknown layer: {}",
                    owner, unknown
                ))),
                None => Ok(()),
            }
        };

        known(&self.default_chain, "default chain")?;
        for policy in &self.policies {
            let owner = format!("policy {}", policy.id);
            known(&policy.layers, &owner)?;
            if let Some(layer) = policy.ttl.keys().find(|l| !ids.contains(l.as_str())) {
                return Err(Error::Config(format!(
                    "{} sets a ttl for unknown layer: {}",
                    owner, layer
                )));
            }
            policy.to_policy()?;
        }

        if self.promotion_threshold == 0 {
            return Err(Error::Config("promotionThreshold must be at least 1".into()));
        }
        if self.warmup_concurrency == 0 {
            return Err(Error::Config("warmupConcurrency must be at least 1".into()));
        }
        if self.health.degrade_after == 0 || self.health.degrade_after > self.health.offline_after {
            return Err(Error::Config(
                "health thresholds must satisfy 0 < degradeAfter <= offlineAfter".into(),
            ));
        }
        if self.maintenance.log_keep_entries > self.maintenance.log_max_entries {
            return Err(Error::Config("logKeepEntries must not exceed logMaxEntries".into()));
        }
        self.maintenance_settings()?;

        Ok(())
    }

    /// Runtime layer configurations, in priority order
    pub fn layer_configs(&self) -> Result<Vec<LayerConfig>> {
        self.layers.iter().map(LayerSpec::to_layer_config).collect()
    }

    /// Runtime policies, in match order
    pub fn cache_policies(&self) -> Result<Vec<CachePolicy>> {
        self.policies.iter().map(PolicySpec::to_policy).collect()
    }

    /// Background task settings
    pub fn maintenance_settings(&self) -> Result<MaintenanceSettings> {
        Ok(MaintenanceSettings {
            sweep_interval: parse_duration(&self.maintenance.sweep_interval)?,
            metrics_interval: parse_duration(&self.maintenance.metrics_interval)?,
            log_trim_interval: parse_duration(&self.maintenance.log_trim_interval)?,
        })
    }

    /// Health thresholds
    pub fn health_thresholds(&self) -> HealthThresholds {
        HealthThresholds {
            degrade_after: self.health.degrade_after,
            offline_after: self.health.offline_after,
        }
    }
}

impl LayerSpec {
    pub fn to_layer_config(&self) -> Result<LayerConfig> {
        let max_size = parse_size(&self.max_size)?;
        if max_size == 0 {
            return Err(Error::Config(format!("layer {} has zero capacity", self.id)));
        }

        let mut config = LayerConfig::new(
            self.id.clone(),
            self.kind,
            max_size,
            parse_duration(&self.default_ttl)?,
            self.eviction,
        )
        .in_region(self.region.clone());
        config.operation_timeout = parse_duration(&self.operation_timeout)?;
        Ok(config)
    }
}

impl PolicySpec {
    pub fn to_policy(&self) -> Result<CachePolicy> {
        let mut policy = CachePolicy::new(self.id.clone(), &self.pattern, &[])?;
        policy.layers = self.layers.clone();
        for (layer, ttl) in &self.ttl {
            policy = policy.with_ttl(layer, parse_duration(ttl)?);
        }
        policy.invalidation = self.invalidation;
        policy.warmup = self.warmup;
        policy.tenant_isolation = self.tenant_isolation;
        policy.compression = self.compression;
        policy.tags = self.tags.clone();
        Ok(policy)
    }
}

// =============================================================================
// Duration and Size Parsing
// =============================================================================

/// Parse a Go-style duration string (e.g., "500ms", "30s", "5m", "1h30m", "1d").
///
/// A trailing bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total_ms: u64 = 0;
    let mut num_buf = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            num_buf.push(c);
            continue;
        }

        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        num_buf.clear();

        let multiplier = match c {
            'm' | 'M' if chars.peek().is_some_and(|n| *n == 's' || *n == 'S') => {
                chars.next();
                1
            }
            'h' | 'H' => 3_600_000,
            'm' | 'M' => 60_000,
            's' | 'S' => 1_000,
            'd' | 'D' => 86_400_000,
            _ => {
                return Err(Error::DurationParse(format!(
                    "unknown duration unit: {}",
                    c
                )))
            }
        };

        total_ms += num * multiplier;
    }

    // Handle case where string ends with a number (assume seconds)
    if !num_buf.is_empty() {
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        total_ms += num * 1_000;
    }

    if total_ms == 0 {
        return Err(Error::DurationParse(
            "duration must be greater than 0".to_string(),
        ));
    }

    Ok(Duration::from_millis(total_ms))
}

/// Parse a byte size ("512", "64KB", "100MB", "10GB"); units are binary
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num, unit) = s.split_at(split);

    let num: u64 = num
        .parse()
        .map_err(|_| Error::Config(format!("invalid size: {}", s)))?;
    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1 << 10,
        "M" | "MB" | "MIB" => 1 << 20,
        "G" | "GB" | "GIB" => 1 << 30,
        "T" | "TB" | "TIB" => 1 << 40,
        other => return Err(Error::Config(format!("unknown size unit: {}", other))),
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| Error::Config(format!("size overflows: {}", s)))
}
