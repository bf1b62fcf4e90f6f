//! Promotion Manager
//!
//! Copies frequently-hit entries into the faster layers ahead of the layer
//! that served the hit. The source copy is left in place, so hot entries
//! end up duplicated across tiers.

use std::sync::Arc;

use tracing::{debug, warn};

use super::entry::CacheEntry;
use super::eviction::EvictionManager;
use super::layer::CacheLayer;
use super::registry::CacheLayerRegistry;

/// Hits required before an entry is copied upward
pub const DEFAULT_PROMOTION_THRESHOLD: u32 = 3;

/// Copies hot entries into higher-priority layers
pub struct PromotionManager {
    registry: Arc<CacheLayerRegistry>,
    eviction: Arc<EvictionManager>,
    threshold: u32,
}

impl PromotionManager {
    pub fn new(
        registry: Arc<CacheLayerRegistry>,
        eviction: Arc<EvictionManager>,
        threshold: u32,
    ) -> Self {
        Self {
            registry,
            eviction,
            threshold,
        }
    }

    /// Access count at which promotion kicks in
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Promote `entry`, found at `chain[hit_index]`, into every active
    /// layer ahead of it. Returns the ids of layers that received a copy.
    ///
    /// Failures are logged and skipped; a promotion never fails the read.
    pub async fn promote(
        &self,
        chain: &[Arc<CacheLayer>],
        hit_index: usize,
        entry: &Arc<CacheEntry>,
    ) -> Vec<String> {
        if entry.access_count() < self.threshold {
            return Vec::new();
        }

        let mut promoted = Vec::new();
        for layer in chain.iter().take(hit_index) {
            if !layer.is_active() {
                continue;
            }

            let guard = layer.lock_writes().await;
            match self.eviction.ensure_capacity(layer, &guard, entry.size()).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(layer = %layer.id(), size = entry.size(), "No room to promote entry");
                    continue;
                }
                Err(e) => {
                    warn!(layer = %layer.id(), error = %e, "Eviction failed during promotion");
                    continue;
                }
            }

            let copy = Arc::new(CacheEntry::clone(entry));
            match self.registry.write_entry(layer, &guard, copy).await {
                Ok(()) => promoted.push(layer.id().to_string()),
                Err(e) => warn!(layer = %layer.id(), error = %e, "Promotion write failed"),
            }
        }

        if !promoted.is_empty() {
            debug!(key = %entry.key(), layers = ?promoted, "Promoted entry");
        }
        promoted
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
    use crate::cache::layer::{LayerConfig, LayerKind, LayerStatus};
    use crate::cache::policy::EvictionPolicy;
    use bytes::Bytes;
    use std::time::Duration;

    fn registry() -> Arc<CacheLayerRegistry> {
        let layer = |id: &str| {
            CacheLayer::new(
                LayerConfig::new(
                    id,
                    LayerKind::Local,
                    10_000,
                    Duration::from_secs(60),
                    EvictionPolicy::Lru,
                ),
                Arc::new(InMemoryAdapter::new()),
            )
        };
        Arc::new(CacheLayerRegistry::new(vec![layer("l1"), layer("l2"), layer("l3")]).unwrap())
    }

    fn manager(registry: &Arc<CacheLayerRegistry>) -> PromotionManager {
        let eviction = Arc::new(EvictionManager::new(registry.clone()));
        PromotionManager::new(registry.clone(), eviction, DEFAULT_PROMOTION_THRESHOLD)
    }

    fn entry(hits: u32) -> (CacheKey, Arc<CacheEntry>) {
        let key = CacheKey::new("catalog:1", Some("t1")).unwrap();
        let e = Arc::new(CacheEntry::new(
            &key,
            Bytes::from_static(b"payload"),
            Duration::from_secs(60),
            CompressionAlgorithm::None,
        ));
        for _ in 0..hits {
            e.record_access();
        }
        (key, e)
    }

    #[tokio::test]
    async fn test_below_threshold_does_nothing() {
        let registry = registry();
        let chain = registry.layers().to_vec();
        let (_, e) = entry(2);

        assert!(manager(&registry).promote(&chain, 2, &e).await.is_empty());
        assert_eq!(chain[0].current_size(), 0);
    }

    #[tokio::test]
    async fn test_promotes_into_every_faster_layer() {
        let registry = registry();
        let chain = registry.layers().to_vec();
        let (key, e) = entry(3);

        let promoted = manager(&registry).promote(&chain, 2, &e).await;
        assert_eq!(promoted, vec!["l1", "l2"]);

        for layer in &chain[..2] {
            let copy = layer.load(key.physical()).await.unwrap().unwrap();
            assert_eq!(copy.data(), e.data());
            assert_eq!(layer.current_size(), e.size());
        }
        // Independent copies
        let copy = chain[0].load(key.physical()).await.unwrap().unwrap();
        assert!(!Arc::ptr_eq(&copy, &e));
    }

    #[tokio::test]
    async fn test_skips_inactive_layers() {
        let registry = registry();
        let chain = registry.layers().to_vec();
        chain[0].set_status(LayerStatus::Offline);
        let (_, e) = entry(5);

        let promoted = manager(&registry).promote(&chain, 2, &e).await;
        assert_eq!(promoted, vec!["l2"]);
    }

    #[tokio::test]
    async fn test_hit_in_first_layer_has_nowhere_to_go() {
        let registry = registry();
        let chain = registry.layers().to_vec();
        let (_, e) = entry(10);
        assert!(manager(&registry).promote(&chain, 0, &e).await.is_empty());
    }
}
