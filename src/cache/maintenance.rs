//! Background Maintenance
//!
//! Three periodic jobs keep the engine healthy:
//!
//! - expired-entry sweep
//! - metrics refresh with layer health transitions
//! - operation log trim
//!
//! All three run in one task driven by `tokio::select!` over independent
//! intervals and stop when the shutdown token is cancelled.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::engine::EdgeCache;
use super::layer::LayerStatus;

/// Consecutive adapter errors before a layer is degraded
pub const DEFAULT_DEGRADE_AFTER: u32 = 3;

/// Consecutive adapter errors before a layer is taken offline
pub const DEFAULT_OFFLINE_AFTER: u32 = 10;

/// Background task intervals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceSettings {
    pub sweep_interval: Duration,
    pub metrics_interval: Duration,
    pub log_trim_interval: Duration,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(300),
            metrics_interval: Duration::from_secs(60),
            log_trim_interval: Duration::from_secs(60),
        }
    }
}

/// Error-streak thresholds for layer status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthThresholds {
    pub degrade_after: u32,
    pub offline_after: u32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            degrade_after: DEFAULT_DEGRADE_AFTER,
            offline_after: DEFAULT_OFFLINE_AFTER,
        }
    }
}

impl HealthThresholds {
    /// Status implied by an error streak
    pub fn classify(&self, consecutive_errors: u32) -> LayerStatus {
        if consecutive_errors >= self.offline_after {
            LayerStatus::Offline
        } else if consecutive_errors >= self.degrade_after {
            LayerStatus::Degraded
        } else {
            LayerStatus::Active
        }
    }
}

/// Periodic maintenance for one engine
pub struct MaintenanceTask {
    cache: Arc<EdgeCache>,
    settings: MaintenanceSettings,
    shutdown: CancellationToken,
}

impl MaintenanceTask {
    /// Use the engine's configured intervals
    pub fn new(cache: Arc<EdgeCache>, shutdown: CancellationToken) -> Self {
        let settings = *cache.maintenance_settings();
        Self::with_settings(cache, settings, shutdown)
    }

    pub fn with_settings(
        cache: Arc<EdgeCache>,
        settings: MaintenanceSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            cache,
            settings,
            shutdown,
        }
    }

    /// Run on the current runtime
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run the maintenance loop until shutdown
    #[instrument(skip(self))]
    pub async fn run(self) {
        info!(
            sweep = ?self.settings.sweep_interval,
            metrics = ?self.settings.metrics_interval,
            trim = ?self.settings.log_trim_interval,
            "Starting cache maintenance"
        );

        let mut sweep = interval(self.settings.sweep_interval);
        let mut metrics = interval(self.settings.metrics_interval);
        let mut trim = interval(self.settings.log_trim_interval);
        for tick in [&mut sweep, &mut metrics, &mut trim] {
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; start one period in
            tick.reset();
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Cache maintenance shutting down");
                    break;
                }

                _ = sweep.tick() => {
                    let removed = self.cache.sweep_expired().await;
                    debug!(removed, "Sweep finished");
                }

                _ = metrics.tick() => {
                    let changes = self.cache.refresh_layer_health().await;
                    debug!(changes = changes.len(), "Metrics refreshed");
                }

                _ = trim.tick() => {
                    self.cache.trim_log();
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::engine::SetOptions;
    use crate::config::EngineConfig;
    use bytes::Bytes;

    #[test]
    fn test_classify() {
        let t = HealthThresholds::default();
        assert_eq!(t.classify(0), LayerStatus::Active);
        assert_eq!(t.classify(2), LayerStatus::Active);
        assert_eq!(t.classify(3), LayerStatus::Degraded);
        assert_eq!(t.classify(9), LayerStatus::Degraded);
        assert_eq!(t.classify(10), LayerStatus::Offline);
    }

    #[tokio::test]
    async fn test_loop_sweeps_and_stops() {
        let cache = Arc::new(EdgeCache::new(EngineConfig::default()).unwrap());
        cache
            .set(
                "catalog:1",
                Bytes::from_static(b"v"),
                None,
                SetOptions::ttl(Duration::from_millis(5)),
            )
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let settings = MaintenanceSettings {
            sweep_interval: Duration::from_millis(20),
            metrics_interval: Duration::from_millis(20),
            log_trim_interval: Duration::from_millis(20),
        };
        let handle =
            MaintenanceTask::with_settings(cache.clone(), settings, shutdown.clone()).spawn();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cache.statistics().total_entries, 0);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
