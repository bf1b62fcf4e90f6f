//! Edgecache - Multi-Tier Edge Caching Engine
//!
//! A tenant-isolated cache that sits in front of slower backing stores and
//! absorbs repeated reads for plugin assets, catalog data and user records.
//!
//! # Architecture
//!
//! ```text
//! caller ──▶ EdgeCache ──▶ policy resolver ──▶ layer chain
//!                │                               │
//!                ├── eviction / promotion ◀──────┘
//!                ├── invalidation (keys, tenant, pattern, tags)
//!                └── operation log ──▶ analytics ──▶ Prometheus
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Layers, entries, policies, eviction, promotion, invalidation
//!   and analytics
//! - [`config`] - YAML engine configuration
//! - [`error`] - Error types
//! - [`exporter`] - Prometheus metrics export
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use edgecache::cache::{EdgeCache, GetOptions, SetOptions};
//! use edgecache::config::EngineConfig;
//!
//! # async fn demo() -> edgecache::Result<()> {
//! let cache = EdgeCache::new(EngineConfig::default())?;
//! cache
//!     .set("catalog:42", Bytes::from_static(b"{}"), Some("t1"), SetOptions::default())
//!     .await?;
//! let found = cache.get("catalog:42", Some("t1"), GetOptions::default()).await?;
//! assert!(found.hit);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod exporter;

// Re-export commonly used types
pub use cache::{EdgeCache, GetOptions, InvalidateOptions, SetOptions, WarmupItem, WarmupOptions};
pub use config::EngineConfig;
pub use error::{Error, Result};
