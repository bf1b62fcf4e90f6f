//! Multi-Tier Edge Cache
//!
//! Tenant-isolated caching across an ordered chain of layers (local memory,
//! a shared distributed cache, a CDN edge), each behind a pluggable
//! storage adapter.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                              EdgeCache                                    │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  get / set / delete / invalidate / warmup                                 │
//! │         │                                                                 │
//! │  CachePolicyResolver ──▶ layer chain + per-layer ttl                      │
//! │         │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐                   │
//! │  │  memory-l1   │   │  redis-l2    │   │  cdn-edge    │  CacheLayer       │
//! │  │  (local)     │   │ (distributed)│   │  (edge)      │  + StorageAdapter │
//! │  └──────────────┘   └──────────────┘   └──────────────┘                   │
//! │         ▲   promotion (hits >= 3)  │                                      │
//! │         └──────────────────────────┘                                      │
//! │                                                                           │
//! │  EvictionManager   InvalidationManager   OperationLog ──▶ Analytics      │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Tenant Isolation
//!
//! Every entry is stored under `tenant:{id}:{key}` or `global:{key}`.
//! Tenant ids may not contain `:`, so no tenant can address another
//! tenant's physical keys.

pub mod adapter;
pub mod analytics;
pub mod compression;
pub mod engine;
pub mod entry;
pub mod eviction;
pub mod invalidation;
pub mod layer;
pub mod maintenance;
pub mod oplog;
pub mod policy;
pub mod promotion;
pub mod registry;

pub use adapter::{AdapterStats, InMemoryAdapter, StorageAdapter};
pub use analytics::{AnalyticsAggregator, CacheAnalytics, CacheStatistics, HotKey, HOT_KEY_LIMIT};
pub use compression::{CompressionAlgorithm, CompressionManager, Compressor};
pub use engine::{
    DeleteOutcome, EdgeCache, GetOptions, GetOutcome, SetOptions, SetOutcome, StatusChange,
    WarmupItem, WarmupOptions, WarmupReport,
};
pub use entry::{CacheEntry, CacheKey, EntryMetadata, GLOBAL_TENANT};
pub use eviction::EvictionManager;
pub use invalidation::{InvalidateOptions, InvalidationEvent, InvalidationManager};
pub use layer::{CacheLayer, LayerConfig, LayerKind, LayerMetrics, LayerStatus};
pub use maintenance::{HealthThresholds, MaintenanceSettings, MaintenanceTask};
pub use oplog::{CacheOperation, OperationLog, OperationStatus, OperationType, TimeRange};
pub use policy::{CachePolicy, CachePolicyResolver, EvictionPolicy, KeyPattern};
pub use promotion::PromotionManager;
pub use registry::{CacheLayerRegistry, TenantKeyspace};
