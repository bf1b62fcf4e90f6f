//! Invalidation Manager
//!
//! Removes entries by explicit key list, owning tenant, logical key pattern
//! or tag, and keeps a bounded audit trail of every invalidation.
//!
//! Invalidation is best effort: a layer that fails is logged and skipped,
//! and the event reports what was actually removed.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::entry::{validate_tenant, CacheKey};
use super::layer::CacheLayer;
use super::oplog::TimeRange;
use super::policy::KeyPattern;
use super::registry::CacheLayerRegistry;
use crate::error::{Error, Result};

/// History length that triggers a trim
pub const DEFAULT_HISTORY_MAX: usize = 1000;

/// Events kept after a trim
pub const DEFAULT_HISTORY_KEEP: usize = 500;

const DEFAULT_REASON: &str = "manual";
const DEFAULT_SOURCE: &str = "api";

/// Invalidation request.
///
/// Only one criterion is used. When several are set the first non-empty
/// one wins, in the order `keys`, `tenant_id`, `pattern`, `tags`. With
/// `keys`, a `tenant_id` scopes the keys to that tenant instead.
#[derive(Debug, Clone, Default)]
pub struct InvalidateOptions {
    /// Logical key glob matched across every tenant scope
    pub pattern: Option<String>,
    /// Tenant whose keys are removed
    pub tenant_id: Option<String>,
    /// Explicit logical keys
    pub keys: Vec<String>,
    /// Remove entries carrying any of these tags
    pub tags: Vec<String>,
    /// Free-form reason, grouped on in analytics
    pub reason: Option<String>,
    /// Restrict to these layers (default: all)
    pub layers: Option<Vec<String>>,
    /// Who asked for it
    pub source: Option<String>,
}

impl InvalidateOptions {
    pub fn keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            ..Default::default()
        }
    }

    pub fn pattern(pattern: impl Into<String>) -> Self {
        Self {
            pattern: Some(pattern.into()),
            ..Default::default()
        }
    }

    pub fn tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn in_layers(mut self, layers: &[&str]) -> Self {
        self.layers = Some(layers.iter().map(|l| l.to_string()).collect());
        self
    }

    /// Pick the selection criterion
    pub fn selector(&self) -> Result<Selector> {
        // An empty tenant id counts as unset
        let tenant_id = self.tenant_id.as_deref().filter(|t| !t.is_empty());

        if !self.keys.is_empty() {
            let keys = self
                .keys
                .iter()
                .map(|k| CacheKey::new(k.as_str(), tenant_id).map(|k| k.physical().to_string()))
                .collect::<Result<Vec<_>>>()?;
            return Ok(Selector::Keys(keys));
        }
        if let Some(tenant) = tenant_id {
            validate_tenant(tenant)?;
            return Ok(Selector::Tenant(tenant.to_string()));
        }
        if let Some(pattern) = self.pattern.as_deref().filter(|p| !p.is_empty()) {
            return Ok(Selector::Pattern(KeyPattern::logical(pattern)?));
        }
        if !self.tags.is_empty() {
            return Ok(Selector::Tags(self.tags.clone()));
        }
        Err(Error::InvalidArgument(
            "invalidation needs keys, a tenant id, a pattern or tags".into(),
        ))
    }
}

/// Resolved selection criterion
#[derive(Debug, Clone)]
pub enum Selector {
    /// Physical keys
    Keys(Vec<String>),
    /// Every key of a tenant
    Tenant(String),
    /// Logical key pattern
    Pattern(KeyPattern),
    /// Any of these tags
    Tags(Vec<String>),
}

impl Selector {
    /// Short description used as the event target
    pub fn describe(&self) -> String {
        match self {
            Selector::Keys(keys) => format!("keys:{}", keys.len()),
            Selector::Tenant(tenant) => format!("tenant:{}", tenant),
            Selector::Pattern(pattern) => format!("pattern:{}", pattern.as_str()),
            Selector::Tags(tags) => format!("tags:{}", tags.join(",")),
        }
    }
}

/// Audit record of one invalidation
#[derive(Debug, Clone, Serialize)]
pub struct InvalidationEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Selector description (`tenant:t1`, `pattern:catalog:*`, ...)
    pub target: String,
    pub tenant_id: Option<String>,
    pub pattern: Option<String>,
    /// Physical keys removed
    pub keys: Vec<String>,
    pub reason: String,
    pub source: String,
    /// Layers where at least one entry was removed
    pub layers_affected: Vec<String>,
    /// Layers that failed and were skipped
    pub layers_failed: Vec<String>,
    pub entries_invalidated: u64,
    pub bytes_freed: u64,
}

/// Executes invalidations and keeps their history
pub struct InvalidationManager {
    registry: Arc<CacheLayerRegistry>,
    history: RwLock<VecDeque<InvalidationEvent>>,
    history_max: usize,
    history_keep: usize,
}

impl InvalidationManager {
    pub fn new(registry: Arc<CacheLayerRegistry>) -> Self {
        Self::with_history_limits(registry, DEFAULT_HISTORY_MAX, DEFAULT_HISTORY_KEEP)
    }

    pub fn with_history_limits(registry: Arc<CacheLayerRegistry>, max: usize, keep: usize) -> Self {
        Self {
            registry,
            history: RwLock::new(VecDeque::new()),
            history_max: max,
            history_keep: keep.min(max),
        }
    }

    /// Run an invalidation and record its event
    #[instrument(
        skip(self, options),
        fields(reason = options.reason.as_deref().unwrap_or(DEFAULT_REASON))
    )]
    pub async fn invalidate(&self, options: &InvalidateOptions) -> Result<InvalidationEvent> {
        let selector = options.selector()?;

        let layers: Vec<Arc<CacheLayer>> = match &options.layers {
            Some(ids) => ids
                .iter()
                .map(|id| self.registry.require(id).cloned())
                .collect::<Result<_>>()?,
            None => self.registry.layers().to_vec(),
        };

        let mut event = InvalidationEvent {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            target: selector.describe(),
            tenant_id: options.tenant_id.clone(),
            pattern: options.pattern.clone(),
            keys: Vec::new(),
            reason: options.reason.clone().unwrap_or_else(|| DEFAULT_REASON.to_string()),
            source: options.source.clone().unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
            layers_affected: Vec::new(),
            layers_failed: Vec::new(),
            entries_invalidated: 0,
            bytes_freed: 0,
        };

        for layer in &layers {
            match self.invalidate_layer(layer, &selector).await {
                Ok(removed) if removed.is_empty() => {}
                Ok(removed) => {
                    event.layers_affected.push(layer.id().to_string());
                    event.entries_invalidated += removed.len() as u64;
                    for (key, size) in removed {
                        event.bytes_freed += size;
                        if !event.keys.contains(&key) {
                            event.keys.push(key);
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        layer = %layer.id(),
                        target = %event.target,
                        error = %e,
                        "Invalidation failed for layer"
                    );
                    event.layers_failed.push(layer.id().to_string());
                }
            }
        }

        info!(
            target = %event.target,
            entries = event.entries_invalidated,
            layers = ?event.layers_affected,
            "Invalidated cache entries"
        );

        self.record(event.clone());
        Ok(event)
    }

    /// Remove matching keys from one layer; returns (physical key, size)
    async fn invalidate_layer(
        &self,
        layer: &CacheLayer,
        selector: &Selector,
    ) -> Result<Vec<(String, u64)>> {
        let guard = layer.lock_writes().await;

        let candidates: Vec<String> = match selector {
            Selector::Keys(keys) => keys.clone(),
            Selector::Tenant(tenant) => self.registry.keyspace().keys_in_layer(tenant, layer.id()),
            Selector::Pattern(pattern) => layer
                .scan(pattern)
                .await?
                .into_iter()
                .map(|(key, _)| key)
                .collect(),
            Selector::Tags(tags) => layer
                .scan(&KeyPattern::any())
                .await?
                .into_iter()
                .filter(|(_, entry)| tags.iter().any(|t| entry.has_tag(t)))
                .map(|(key, _)| key)
                .collect(),
        };

        let mut removed = Vec::new();
        for key in candidates {
            if let Some(entry) = self.registry.remove_entry(layer, &guard, &key).await? {
                removed.push((key, entry.size()));
            }
        }
        Ok(removed)
    }

    fn record(&self, event: InvalidationEvent) {
        let mut history = self.history.write();
        history.push_back(event);
        if history.len() > self.history_max {
            let excess = history.len() - self.history_keep;
            history.drain(..excess);
        }
    }

    /// Events inside `range` (all if None), oldest first
    pub fn history(&self, range: Option<TimeRange>) -> Vec<InvalidationEvent> {
        let history = self.history.read();
        history
            .iter()
            .filter(|e| range.map_or(true, |r| r.contains(e.timestamp)))
            .cloned()
            .collect()
    }

    pub fn history_len(&self) -> usize {
        self.history.read().len()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::adapter::testing::FlakyAdapter;
    use crate::cache::adapter::InMemoryAdapter;
    use crate::cache::compression::CompressionAlgorithm;
    use crate::cache::entry::CacheEntry;
    use crate::cache::layer::{LayerConfig, LayerKind};
    use crate::cache::policy::EvictionPolicy;
    use assert_matches::assert_matches;
    use bytes::Bytes;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn registry() -> Arc<CacheLayerRegistry> {
        let layer = |id: &str| {
            CacheLayer::new(
                LayerConfig::new(
                    id,
                    LayerKind::Local,
                    100_000,
                    Duration::from_secs(60),
                    EvictionPolicy::Lru,
                ),
                Arc::new(InMemoryAdapter::new()),
            )
        };
        Arc::new(CacheLayerRegistry::new(vec![layer("l1"), layer("l2")]).unwrap())
    }

    async fn put(
        registry: &CacheLayerRegistry,
        layer: &str,
        key: &str,
        tenant: Option<&str>,
        tags: &[&str],
    ) {
        let layer = registry.require(layer).unwrap();
        let key = CacheKey::new(key, tenant).unwrap();
        let entry = CacheEntry::new(
            &key,
            Bytes::from_static(b"0123456789"),
            Duration::from_secs(60),
            CompressionAlgorithm::None,
        )
        .with_tags(tags.iter().copied());
        let guard = layer.lock_writes().await;
        registry.write_entry(layer, &guard, Arc::new(entry)).await.unwrap();
    }

    async fn present(
        registry: &CacheLayerRegistry,
        layer: &str,
        key: &str,
        tenant: Option<&str>,
    ) -> bool {
        let key = CacheKey::new(key, tenant).unwrap();
        registry.require(layer).unwrap().load(key.physical()).await.unwrap().is_some()
    }

    #[test]
    fn test_selector_precedence() {
        let opts = InvalidateOptions {
            keys: vec!["a".into()],
            tenant_id: Some("t1".into()),
            pattern: Some("x*".into()),
            tags: vec!["tag".into()],
            ..Default::default()
        };
        assert_matches!(opts.selector(), Ok(Selector::Keys(k)) if k == vec!["tenant:t1:a"]);

        let opts = InvalidateOptions {
            keys: vec![],
            ..opts
        };
        assert_matches!(opts.selector(), Ok(Selector::Tenant(t)) if t == "t1");

        let opts = InvalidateOptions {
            tenant_id: None,
            ..opts
        };
        assert_matches!(opts.selector(), Ok(Selector::Pattern(_)));

        let opts = InvalidateOptions {
            pattern: None,
            ..opts
        };
        assert_matches!(opts.selector(), Ok(Selector::Tags(_)));
    }

    #[test]
    fn test_selector_requires_a_criterion() {
        assert_matches!(InvalidateOptions::default().selector(), Err(Error::InvalidArgument(_)));
        assert_matches!(
            InvalidateOptions::tenant("a:b").selector(),
            Err(Error::InvalidTenant { .. })
        );
        assert_matches!(
            InvalidateOptions::tenant("global").selector(),
            Err(Error::InvalidTenant { .. })
        );
    }

    #[test]
    fn test_empty_tenant_falls_through_to_pattern() {
        let opts = InvalidateOptions {
            tenant_id: Some(String::new()),
            ..InvalidateOptions::pattern("catalog:*")
        };
        assert_matches!(opts.selector(), Ok(Selector::Pattern(_)));

        let opts = InvalidateOptions {
            tenant_id: Some(String::new()),
            ..InvalidateOptions::keys(["a"])
        };
        assert_matches!(opts.selector(), Ok(Selector::Keys(k)) if k == vec!["global:a"]);
    }

    #[tokio::test]
    async fn test_failing_layer_is_skipped() {
        let flaky = Arc::new(FlakyAdapter::new());
        let registry = Arc::new(
            CacheLayerRegistry::new(vec![
                CacheLayer::new(
                    LayerConfig::new(
                        "l1",
                        LayerKind::Local,
                        100_000,
                        Duration::from_secs(60),
                        EvictionPolicy::Lru,
                    ),
                    flaky.clone(),
                ),
                CacheLayer::new(
                    LayerConfig::new(
                        "l2",
                        LayerKind::Local,
                        100_000,
                        Duration::from_secs(60),
                        EvictionPolicy::Lru,
                    ),
                    Arc::new(InMemoryAdapter::new()),
                ),
            ])
            .unwrap(),
        );
        for layer in ["l1", "l2"] {
            put(&registry, layer, "user:1", Some("t1"), &[]).await;
            put(&registry, layer, "user:2", Some("t1"), &[]).await;
        }
        let manager = InvalidationManager::new(registry.clone());

        flaky.broken.store(true, Ordering::SeqCst);
        let event = manager.invalidate(&InvalidateOptions::tenant("t1")).await.unwrap();
        flaky.broken.store(false, Ordering::SeqCst);

        assert_eq!(event.layers_failed, vec!["l1"]);
        assert_eq!(event.layers_affected, vec!["l2"]);
        assert_eq!(event.entries_invalidated, 2);
        assert_eq!(event.bytes_freed, 20);
        for key in ["user:1", "user:2"] {
            assert!(present(&registry, "l1", key, Some("t1")).await);
            assert!(!present(&registry, "l2", key, Some("t1")).await);
        }
        assert_eq!(registry.require("l2").unwrap().current_size(), 0);
        assert_eq!(manager.history_len(), 1);
    }

    #[tokio::test]
    async fn test_tenant_invalidation_is_isolated() {
        let registry = registry();
        for layer in ["l1", "l2"] {
            put(&registry, layer, "user:1", Some("t1"), &[]).await;
            put(&registry, layer, "user:1", Some("t2"), &[]).await;
        }
        let manager = InvalidationManager::new(registry.clone());

        let event = manager
            .invalidate(&InvalidateOptions::tenant("t1").with_reason("tenant-suspended"))
            .await
            .unwrap();

        assert_eq!(event.entries_invalidated, 2);
        assert_eq!(event.layers_affected, vec!["l1", "l2"]);
        assert_eq!(event.keys, vec!["tenant:t1:user:1"]);
        assert_eq!(event.reason, "tenant-suspended");
        for layer in ["l1", "l2"] {
            assert!(!present(&registry, layer, "user:1", Some("t1")).await);
            assert!(present(&registry, layer, "user:1", Some("t2")).await);
            assert_eq!(registry.require(layer).unwrap().current_size(), 10);
        }
        assert_eq!(registry.keyspace().key_count("t1"), 0);
        assert_eq!(registry.keyspace().key_count("t2"), 1);
    }

    #[tokio::test]
    async fn test_pattern_spans_tenants() {
        let registry = registry();
        put(&registry, "l1", "catalog:1", Some("t1"), &[]).await;
        put(&registry, "l1", "catalog:2", None, &[]).await;
        put(&registry, "l1", "user:1", Some("t1"), &[]).await;
        let manager = InvalidationManager::new(registry.clone());

        let event = manager.invalidate(&InvalidateOptions::pattern("catalog:*")).await.unwrap();
        assert_eq!(event.entries_invalidated, 2);
        assert!(present(&registry, "l1", "user:1", Some("t1")).await);
    }

    #[tokio::test]
    async fn test_tags_and_layer_restriction() {
        let registry = registry();
        put(&registry, "l1", "a", None, &["assets"]).await;
        put(&registry, "l2", "a", None, &["assets"]).await;
        put(&registry, "l1", "b", None, &["other"]).await;
        let manager = InvalidationManager::new(registry.clone());

        let event = manager
            .invalidate(&InvalidateOptions::tags(["assets"]).in_layers(&["l1"]))
            .await
            .unwrap();
        assert_eq!(event.entries_invalidated, 1);
        assert!(!present(&registry, "l1", "a", None).await);
        assert!(present(&registry, "l2", "a", None).await);
        assert!(present(&registry, "l1", "b", None).await);
    }

    #[tokio::test]
    async fn test_unknown_layer_rejected() {
        let manager = InvalidationManager::new(registry());
        let result = manager
            .invalidate(&InvalidateOptions::keys(["a"]).in_layers(&["nope"]))
            .await;
        assert_matches!(result, Err(Error::LayerNotFound(_)));
        assert_eq!(manager.history_len(), 0);
    }

    #[tokio::test]
    async fn test_history_trim() {
        let manager = InvalidationManager::with_history_limits(registry(), 10, 5);
        for i in 0..11 {
            manager
                .invalidate(&InvalidateOptions::keys([format!("k{}", i)]))
                .await
                .unwrap();
        }
        assert_eq!(manager.history_len(), 5);
        assert_eq!(manager.history(None)[0].target, "keys:1");
    }
}
