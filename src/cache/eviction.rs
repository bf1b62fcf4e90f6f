//! Eviction Manager
//!
//! Frees space in a layer by deleting entries in the order dictated by the
//! layer's `EvictionPolicy`, stopping once enough bytes are released.

use std::sync::Arc;

use rand::seq::SliceRandom;
use tracing::{debug, instrument};

use super::entry::{now_ms, CacheEntry};
use super::layer::{CacheLayer, WriteGuard};
use super::policy::{EvictionPolicy, KeyPattern};
use super::registry::CacheLayerRegistry;
use crate::error::Result;

/// Frees layer capacity
pub struct EvictionManager {
    registry: Arc<CacheLayerRegistry>,
}

impl EvictionManager {
    pub fn new(registry: Arc<CacheLayerRegistry>) -> Self {
        Self { registry }
    }

    /// Free at least `required` bytes in `layer` if it holds that much.
    ///
    /// Returns the bytes actually freed, which is less than `required`
    /// when the layer runs out of entries.
    pub async fn evict(&self, layer: &CacheLayer, required: u64) -> Result<u64> {
        let guard = layer.lock_writes().await;
        self.evict_locked(layer, &guard, required).await
    }

    /// Same as [`evict`](Self::evict) for callers already holding the lock
    #[instrument(
        skip(self, layer, guard),
        fields(layer = %layer.id(), policy = %layer.config().eviction)
    )]
    pub(crate) async fn evict_locked(
        &self,
        layer: &CacheLayer,
        guard: &WriteGuard<'_>,
        required: u64,
    ) -> Result<u64> {
        if required == 0 {
            return Ok(0);
        }

        let mut candidates = layer.scan(&KeyPattern::any()).await?;
        order_victims(layer.config().eviction, &mut candidates, now_ms());

        let mut freed = 0u64;
        let mut evicted = 0usize;
        for (key, _) in candidates {
            if freed >= required {
                break;
            }
            if let Some(entry) = self.registry.remove_entry(layer, guard, &key).await? {
                freed += entry.size();
                evicted += 1;
                layer.metrics().record_eviction();
            }
        }

        debug!(required, freed, evicted, "Eviction pass finished");
        Ok(freed)
    }

    /// Make room for an entry of `size` bytes.
    ///
    /// Returns false when the entry cannot fit even after eviction; the
    /// caller then skips this layer.
    pub(crate) async fn ensure_capacity(
        &self,
        layer: &CacheLayer,
        guard: &WriteGuard<'_>,
        size: u64,
    ) -> Result<bool> {
        if size > layer.max_size() {
            return Ok(false);
        }
        if layer.current_size() + size > layer.max_size() {
            self.evict_locked(layer, guard, size).await?;
        }
        Ok(layer.current_size() + size <= layer.max_size())
    }
}

/// Sort candidates so the first element is evicted first
pub fn order_victims(
    policy: EvictionPolicy,
    candidates: &mut [(String, Arc<CacheEntry>)],
    now: u64,
) {
    match policy {
        EvictionPolicy::Lru => candidates.sort_by_key(|(_, e)| e.access_seq()),
        EvictionPolicy::Lfu => candidates.sort_by(|a, b| {
            a.1.access_count()
                .cmp(&b.1.access_count())
                .then_with(|| a.1.access_seq().cmp(&b.1.access_seq()))
        }),
        EvictionPolicy::Ttl => candidates.sort_by(|a, b| {
            a.1.remaining_lifetime_ms(now)
                .cmp(&b.1.remaining_lifetime_ms(now))
        }),
        EvictionPolicy::Random => candidates.shuffle(&mut rand::rng()),
    }
}

// =============================================================================
// Tests
// =============================================================================
