//! Edge Cache Integration Tests
//!
//! End-to-end behaviour through the public `EdgeCache` API:
//! - Read/write across the stock layer chain
//! - Capacity-driven eviction
//! - Tenant-scoped invalidation
//! - Bypass reads and the operation log
//! - Warmup batching and analytics

use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;
use proptest::prelude::*;

use edgecache::cache::layer::LayerKind;
use edgecache::cache::oplog::{OperationStatus, OperationType, BYPASS_LAYER};
use edgecache::cache::policy::EvictionPolicy;
use edgecache::cache::{HOT_KEY_LIMIT, LayerStatus};
use edgecache::config::{LayerSpec, PolicySpec};
use edgecache::{
    EdgeCache, EngineConfig, Error, GetOptions, InvalidateOptions, SetOptions, WarmupItem,
    WarmupOptions,
};

fn layer(id: &str, max: &str, eviction: EvictionPolicy) -> LayerSpec {
    LayerSpec {
        id: id.into(),
        kind: LayerKind::Local,
        region: "local".into(),
        max_size: max.into(),
        default_ttl: "1h".into(),
        eviction,
        operation_timeout: "1s".into(),
    }
}

/// One LRU layer holding exactly 100 entries of 100 bytes
fn hundred_slot_config() -> EngineConfig {
    EngineConfig {
        layers: vec![layer("l1", "10000B", EvictionPolicy::Lru)],
        policies: Vec::<PolicySpec>::new(),
        default_chain: vec!["l1".into()],
        ..EngineConfig::default()
    }
}

fn payload(seed: u8) -> Bytes {
    Bytes::from(vec![seed; 100])
}

// =============================================================================
// Read / Write
// =============================================================================

mod read_write {
    use super::*;

    #[tokio::test]
    async fn test_plugin_asset_round_trip() {
        let cache = EdgeCache::new(EngineConfig::default()).unwrap();
        let logo = Bytes::from_static(b"\x89PNG plugin logo");

        let set = cache
            .set(
                "plugin:123:asset:logo",
                logo.clone(),
                Some("t1"),
                SetOptions::ttl(Duration::from_secs(300)),
            )
            .await
            .unwrap();
        assert!(set.success);
        assert!(set.layers_written.contains(&"memory-l1".to_string()));

        let got = cache
            .get("plugin:123:asset:logo", Some("t1"), GetOptions::default())
            .await
            .unwrap();
        assert!(got.hit);
        assert_eq!(got.layer.as_deref(), Some("memory-l1"));
        assert_eq!(got.value, Some(logo));

        let l1 = cache.layer("memory-l1").unwrap();
        assert_eq!(l1.metrics().hits(), 1);
    }

    #[tokio::test]
    async fn test_catalog_lands_in_both_shared_layers() {
        let cache = EdgeCache::new(EngineConfig::default()).unwrap();
        let set = cache
            .set(
                "catalog:sku-9",
                Bytes::from_static(b"{\"price\":10}"),
                None,
                SetOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(set.layers_written, vec!["memory-l1", "redis-l2"]);
    }

    #[tokio::test]
    async fn test_user_records_require_tenant() {
        let cache = EdgeCache::new(EngineConfig::default()).unwrap();
        let result = cache
            .set("user:42", Bytes::from_static(b"profile"), None, SetOptions::default())
            .await;
        assert_matches!(result, Err(Error::InvalidTenant { .. }));
    }

    #[tokio::test]
    async fn test_delete_clears_every_layer() {
        let cache = EdgeCache::new(EngineConfig::default()).unwrap();
        cache
            .set("catalog:1", Bytes::from_static(b"x"), Some("t1"), SetOptions::default())
            .await
            .unwrap();

        let deleted = cache.delete("catalog:1", Some("t1")).await.unwrap();
        assert!(deleted.deleted);

        let got = cache.get("catalog:1", Some("t1"), GetOptions::default()).await.unwrap();
        assert!(!got.hit);
        assert_eq!(cache.statistics().total_entries, 0);
    }
}

// =============================================================================
// Eviction
// =============================================================================

mod eviction {
    use super::*;

    #[tokio::test]
    async fn test_lru_overflow_evicts_oldest_untouched() {
        let cache = EdgeCache::new(hundred_slot_config()).unwrap();

        for i in 0..100u8 {
            cache
                .set(&format!("k{}", i), payload(i), None, SetOptions::default())
                .await
                .unwrap();
        }
        let l1 = cache.layer("l1").unwrap().clone();
        assert_eq!(l1.current_size(), 10_000);

        // Touch k0 so k1 becomes the least recently used
        assert!(cache.get("k0", None, GetOptions::default()).await.unwrap().hit);

        cache
            .set("k100", payload(100), None, SetOptions::default())
            .await
            .unwrap();

        assert!(l1.current_size() <= l1.max_size());
        assert_eq!(l1.metrics().evictions(), 1);
        assert!(cache.get("k0", None, GetOptions::default()).await.unwrap().hit);
        assert!(!cache.get("k1", None, GetOptions::default()).await.unwrap().hit);
        assert!(cache.get("k100", None, GetOptions::default()).await.unwrap().hit);
    }

    #[tokio::test]
    async fn test_lru_overflow_without_pauses_drops_first_written() {
        for _ in 0..20 {
            let cache = EdgeCache::new(hundred_slot_config()).unwrap();
            for i in 0..=100u8 {
                cache
                    .set(&format!("k{}", i), payload(i), None, SetOptions::default())
                    .await
                    .unwrap();
            }

            let l1 = cache.layer("l1").unwrap();
            assert_eq!(l1.metrics().evictions(), 1);
            assert_eq!(l1.current_size(), 10_000);
            assert!(!cache.get("k0", None, GetOptions::default()).await.unwrap().hit);
            assert!(cache.get("k1", None, GetOptions::default()).await.unwrap().hit);
        }
    }

    #[tokio::test]
    async fn test_entry_larger_than_layer_is_skipped() {
        let cache = EdgeCache::new(hundred_slot_config()).unwrap();
        let huge = Bytes::from(vec![7u8; 20_000]);

        let set = cache
            .set(
                "huge",
                huge,
                None,
                SetOptions {
                    compression: Some(false),
                    ..SetOptions::default()
                },
            )
            .await
            .unwrap();
        assert!(set.layers_written.is_empty());
        assert_eq!(cache.layer("l1").unwrap().current_size(), 0);
    }
}

// =============================================================================
// Invalidation
// =============================================================================

mod invalidation {
    use super::*;

    #[tokio::test]
    async fn test_tenant_invalidation_leaves_other_tenants() {
        let cache = EdgeCache::new(EngineConfig::default()).unwrap();
        for tenant in ["t1", "t2"] {
            for key in ["catalog:a", "catalog:b"] {
                cache
                    .set(key, Bytes::from_static(b"v"), Some(tenant), SetOptions::default())
                    .await
                    .unwrap();
            }
        }

        let event = cache
            .invalidate(InvalidateOptions::tenant("t1").with_reason("tenant-offboarded"))
            .await
            .unwrap();

        // Two keys in two layers each
        assert_eq!(event.entries_invalidated, 4);
        assert_eq!(event.reason, "tenant-offboarded");
        assert!(event.layers_failed.is_empty());

        for key in ["catalog:a", "catalog:b"] {
            assert!(!cache.get(key, Some("t1"), GetOptions::default()).await.unwrap().hit);
            assert!(cache.get(key, Some("t2"), GetOptions::default()).await.unwrap().hit);
        }
        assert_eq!(cache.registry().keyspace().key_count("t1"), 0);
        assert_eq!(cache.registry().keyspace().key_count("t2"), 2);
    }

    #[tokio::test]
    async fn test_pattern_and_tag_invalidation() {
        let cache = EdgeCache::new(EngineConfig::default()).unwrap();
        cache
            .set(
                "catalog:1",
                Bytes::from_static(b"v"),
                Some("t1"),
                SetOptions::default().with_tags(&["pricing"]),
            )
            .await
            .unwrap();
        cache
            .set("catalog:2", Bytes::from_static(b"v"), Some("t2"), SetOptions::default())
            .await
            .unwrap();
        cache
            .set("plugin:1:asset:a", Bytes::from_static(b"v"), Some("t1"), SetOptions::default())
            .await
            .unwrap();

        let by_tag = cache.invalidate(InvalidateOptions::tags(["pricing"])).await.unwrap();
        assert!(by_tag.entries_invalidated > 0);
        assert!(!cache.get("catalog:1", Some("t1"), GetOptions::default()).await.unwrap().hit);
        assert!(cache.get("catalog:2", Some("t2"), GetOptions::default()).await.unwrap().hit);

        let by_pattern = cache.invalidate(InvalidateOptions::pattern("catalog:*")).await.unwrap();
        assert!(by_pattern.entries_invalidated > 0);
        assert!(!cache.get("catalog:2", Some("t2"), GetOptions::default()).await.unwrap().hit);
        let asset = cache
            .get("plugin:1:asset:a", Some("t1"), GetOptions::default())
            .await
            .unwrap();
        assert!(asset.hit);

        assert_eq!(cache.invalidation_history(None).len(), 2);
    }

    #[tokio::test]
    async fn test_global_tenant_id_is_reserved() {
        let cache = EdgeCache::new(EngineConfig::default()).unwrap();
        cache
            .set("catalog:shared", Bytes::from_static(b"v"), None, SetOptions::default())
            .await
            .unwrap();

        let write = cache
            .set("catalog:mine", Bytes::from_static(b"v"), Some("global"), SetOptions::default())
            .await;
        assert_matches!(write, Err(Error::InvalidTenant { .. }));

        let wipe = cache.invalidate(InvalidateOptions::tenant("global")).await;
        assert_matches!(wipe, Err(Error::InvalidTenant { .. }));
        assert!(cache.get("catalog:shared", None, GetOptions::default()).await.unwrap().hit);
    }

    #[tokio::test]
    async fn test_unknown_layer_is_rejected() {
        let cache = EdgeCache::new(EngineConfig::default()).unwrap();
        let result = cache
            .invalidate(InvalidateOptions::tenant("t1").in_layers(&["nowhere"]))
            .await;
        assert_matches!(result, Err(Error::LayerNotFound(_)));
    }
}

// =============================================================================
// Operation Log
// =============================================================================

mod operation_log {
    use super::*;

    #[tokio::test]
    async fn test_bypass_read_is_logged() {
        let cache = EdgeCache::new(EngineConfig::default()).unwrap();
        cache
            .set("catalog:1", Bytes::from_static(b"v"), None, SetOptions::default())
            .await
            .unwrap();

        let got = cache.get("catalog:1", None, GetOptions::bypass()).await.unwrap();
        assert!(!got.hit);
        assert!(got.value.is_none());

        let last = cache.operation_log().recent(1);
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].op_type, OperationType::Get);
        assert_eq!(last[0].layer_ids, vec![BYPASS_LAYER]);
        assert_eq!(last[0].status, OperationStatus::Completed);
        assert!(!last[0].hit);
    }

    #[tokio::test]
    async fn test_failed_operation_is_logged() {
        let cache = EdgeCache::new(EngineConfig::default()).unwrap();
        let _ = cache
            .set("user:1", Bytes::from_static(b"v"), None, SetOptions::default())
            .await;

        let last = cache.operation_log().recent(1);
        assert_eq!(last[0].op_type, OperationType::Set);
        assert_eq!(last[0].status, OperationStatus::Failed);
        assert!(last[0].error.is_some());
    }
}

// =============================================================================
// Warmup & Analytics
// =============================================================================

mod warmup_and_analytics {
    use super::*;

    #[tokio::test]
    async fn test_warmup_runs_in_bounded_batches() {
        let cache = EdgeCache::new(EngineConfig::default()).unwrap();
        let items: Vec<WarmupItem> = (0..23)
            .map(|i| {
                WarmupItem::new(format!("catalog:{}", i), Bytes::from_static(b"v")).for_tenant("t1")
            })
            .collect();

        let report = cache
            .warmup(items, WarmupOptions { concurrency: Some(5), ..WarmupOptions::default() })
            .await
            .unwrap();

        assert_eq!(report.batches, 5);
        assert_eq!(report.success, 23);
        assert_eq!(report.failed, 0);
        assert_eq!(report.operations.len(), 23);
        assert_eq!(report.operation.op_type, OperationType::Warmup);
    }

    #[tokio::test]
    async fn test_zero_concurrency_is_rejected() {
        let cache = EdgeCache::new(EngineConfig::default()).unwrap();
        let result = cache
            .warmup(
                vec![WarmupItem::new("catalog:1", Bytes::from_static(b"v"))],
                WarmupOptions { concurrency: Some(0), ..WarmupOptions::default() },
            )
            .await;
        assert_matches!(result, Err(Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_hot_keys_are_bounded_and_ranked() {
        let cache = EdgeCache::new(EngineConfig::default()).unwrap();
        for i in 0..30u64 {
            let key = format!("catalog:{}", i);
            cache
                .set(&key, Bytes::from_static(b"v"), Some("t1"), SetOptions::default())
                .await
                .unwrap();
            for _ in 0..(i % 7) {
                cache.get(&key, Some("t1"), GetOptions::default()).await.unwrap();
            }
        }

        let analytics = cache.cache_analytics(None).await;
        assert!(analytics.hot_keys.len() <= HOT_KEY_LIMIT);
        for pair in analytics.hot_keys.windows(2) {
            assert!(pair[0].access_count >= pair[1].access_count);
        }
        assert!(analytics.global.hits > 0);
        assert!(analytics.global.p50_latency_ms <= analytics.global.p99_latency_ms);
        assert!(analytics.tenants.iter().any(|t| t.tenant_id == "t1" && t.key_count == 30));
    }

    #[tokio::test]
    async fn test_layers_start_active() {
        let cache = EdgeCache::new(EngineConfig::default()).unwrap();
        let stats = cache.statistics();
        assert_eq!(stats.layers.len(), 3);
        assert!(stats.layers.iter().all(|l| l.status == LayerStatus::Active));
    }
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_tenants_never_read_each_other(
        key in "[a-z]{1,12}",
        a in "[a-z0-9]{1,8}",
        b in "[a-z0-9]{1,8}"
    ) {
        prop_assume!(a != b);
        prop_assume!(a != "global" && b != "global");
        tokio_test::block_on(async {
            let cache = EdgeCache::new(hundred_slot_config()).unwrap();
            cache
                .set(&key, Bytes::from_static(b"secret"), Some(&a), SetOptions::default())
                .await
                .unwrap();

            let other = cache.get(&key, Some(&b), GetOptions::default()).await.unwrap();
            assert!(!other.hit);
            let owner = cache.get(&key, Some(&a), GetOptions::default()).await.unwrap();
            assert!(owner.hit);
        });
    }

    #[test]
    fn prop_layer_never_exceeds_capacity(sizes in proptest::collection::vec(1usize..900, 1..60)) {
        tokio_test::block_on(async {
            let cache = EdgeCache::new(hundred_slot_config()).unwrap();
            let l1 = cache.layer("l1").unwrap().clone();
            for (i, size) in sizes.iter().enumerate() {
                cache
                    .set(
                        &format!("k{}", i),
                        Bytes::from(vec![1u8; *size]),
                        None,
                        SetOptions::default(),
                    )
                    .await
                    .unwrap();
                assert!(l1.current_size() <= l1.max_size());
            }
        });
    }

    #[test]
    fn prop_warmup_batch_count(count in 1usize..60, concurrency in 1usize..12) {
        tokio_test::block_on(async {
            let cache = EdgeCache::new(hundred_slot_config()).unwrap();
            let items: Vec<WarmupItem> = (0..count)
                .map(|i| WarmupItem::new(format!("w{}", i), Bytes::from_static(b"v")))
                .collect();
            let report = cache
                .warmup(
                    items,
                    WarmupOptions {
                        concurrency: Some(concurrency),
                        ..WarmupOptions::default()
                    },
                )
                .await
                .unwrap();
            assert_eq!(report.batches, count.div_ceil(concurrency));
            assert_eq!(report.success + report.failed, count);
            assert_eq!(report.operations.len(), count);
        });
    }
}
