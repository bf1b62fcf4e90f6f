//! Operation Log
//!
//! Time-ordered record of every public cache call. Operations are built as
//! `PendingOperation`s while a call runs and frozen into `CacheOperation`s
//! when it finishes; only frozen operations enter the log.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

use crate::error::Error;

/// Log length that triggers a trim
pub const DEFAULT_LOG_MAX: usize = 10_000;

/// Entries kept after a trim
pub const DEFAULT_LOG_KEEP: usize = 5_000;

/// Layer id recorded for bypassed reads
pub const BYPASS_LAYER: &str = "bypass";

/// Kind of public call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Get,
    Set,
    Delete,
    Invalidate,
    Warmup,
}

/// Outcome of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    /// Still running (never stored in the log)
    Pending,
    Completed,
    Failed,
}

/// Frozen record of one call
#[derive(Debug, Clone, Serialize)]
pub struct CacheOperation {
    pub id: Uuid,
    pub op_type: OperationType,
    pub key: String,
    pub tenant_id: Option<String>,
    pub layer_ids: Vec<String>,
    pub status: OperationStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub latency_us: u64,
    pub size: u64,
    pub hit: bool,
    pub error: Option<String>,
}

impl CacheOperation {
    /// Latency as a Duration
    pub fn latency(&self) -> Duration {
        Duration::from_micros(self.latency_us)
    }
}

/// A call in flight
#[derive(Debug)]
pub struct PendingOperation {
    id: Uuid,
    op_type: OperationType,
    key: String,
    tenant_id: Option<String>,
    layer_ids: Vec<String>,
    started_at: DateTime<Utc>,
    start: Instant,
    size: u64,
    hit: bool,
}

impl PendingOperation {
    pub fn new(op_type: OperationType, key: impl Into<String>, tenant_id: Option<&str>) -> Self {
        Self {
            id: Uuid::new_v4(),
            op_type,
            key: key.into(),
            tenant_id: tenant_id.map(str::to_string),
            layer_ids: Vec::new(),
            started_at: Utc::now(),
            start: Instant::now(),
            size: 0,
            hit: false,
        }
    }

    pub fn status(&self) -> OperationStatus {
        OperationStatus::Pending
    }

    /// Record a layer touched by the call
    pub fn touch_layer(&mut self, layer: &str) {
        if !self.layer_ids.iter().any(|l| l == layer) {
            self.layer_ids.push(layer.to_string());
        }
    }

    pub fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    pub fn set_hit(&mut self, hit: bool) {
        self.hit = hit;
    }

    fn finish(self, status: OperationStatus, error: Option<String>) -> CacheOperation {
        CacheOperation {
            id: self.id,
            op_type: self.op_type,
            key: self.key,
            tenant_id: self.tenant_id,
            layer_ids: self.layer_ids,
            status,
            started_at: self.started_at,
            ended_at: Utc::now(),
            latency_us: self.start.elapsed().as_micros() as u64,
            size: self.size,
            hit: self.hit,
            error,
        }
    }

    /// Freeze as completed
    pub fn complete(self) -> CacheOperation {
        self.finish(OperationStatus::Completed, None)
    }

    /// Freeze as failed
    pub fn fail(self, error: &Error) -> CacheOperation {
        self.finish(OperationStatus::Failed, Some(error.to_string()))
    }
}

/// Inclusive time window for analytics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The window ending now
    pub fn last(window: chrono::Duration) -> Self {
        let end = Utc::now();
        Self {
            start: end - window,
            end,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }
}

/// Bounded, append-only operation history
#[derive(Debug)]
pub struct OperationLog {
    entries: RwLock<VecDeque<CacheOperation>>,
    max_len: usize,
    keep_len: usize,
}

impl Default for OperationLog {
    fn default() -> Self {
        Self::with_limits(DEFAULT_LOG_MAX, DEFAULT_LOG_KEEP)
    }
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trim to `keep_len` once the log exceeds `max_len`
    pub fn with_limits(max_len: usize, keep_len: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            max_len,
            keep_len: keep_len.min(max_len),
        }
    }

    /// Append a finished operation
    pub fn append(&self, op: CacheOperation) {
        self.entries.write().push_back(op);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop the oldest operations if over the limit; returns how many
    pub fn trim(&self) -> usize {
        let mut entries = self.entries.write();
        if entries.len() <= self.max_len {
            return 0;
        }
        let excess = entries.len() - self.keep_len;
        entries.drain(..excess);
        excess
    }

    /// Copy of the operations that started inside `range` (all if None)
    pub fn snapshot(&self, range: Option<TimeRange>) -> Vec<CacheOperation> {
        let entries = self.entries.read();
        match range {
            Some(range) => entries
                .iter()
                .filter(|op| range.contains(op.started_at))
                .cloned()
                .collect(),
            None => entries.iter().cloned().collect(),
        }
    }

    /// The most recent `n` operations, oldest first
    pub fn recent(&self, n: usize) -> Vec<CacheOperation> {
        let entries = self.entries.read();
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn op(key: &str) -> CacheOperation {
        PendingOperation::new(OperationType::Get, key, None).complete()
    }

    #[test]
    fn test_pending_to_completed() {
        let mut pending = PendingOperation::new(OperationType::Set, "k", Some("t1"));
        assert_eq!(pending.status(), OperationStatus::Pending);
        pending.touch_layer("memory-l1");
        pending.touch_layer("memory-l1");
        pending.set_size(42);

        let op = pending.complete();
        assert_eq!(op.status, OperationStatus::Completed);
        assert_eq!(op.layer_ids, vec!["memory-l1"]);
        assert_eq!(op.size, 42);
        assert_eq!(op.tenant_id.as_deref(), Some("t1"));
        assert!(op.ended_at >= op.started_at);
        assert!(op.error.is_none());
    }

    #[test]
    fn test_failed_operation_carries_error() {
        let pending = PendingOperation::new(OperationType::Set, "k", None);
        let op = pending.fail(&Error::Internal("boom".into()));
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.error.as_deref(), Some("Internal error: boom"));
    }

    #[test]
    fn test_trim_keeps_most_recent() {
        let log = OperationLog::with_limits(10, 5);
        for i in 0..11 {
            log.append(op(&format!("k{}", i)));
        }

        assert_eq!(log.trim(), 6);
        assert_eq!(log.len(), 5);
        let keys: Vec<_> = log.snapshot(None).into_iter().map(|o| o.key).collect();
        assert_eq!(keys, vec!["k6", "k7", "k8", "k9", "k10"]);
    }

    #[test]
    fn test_trim_below_limit_is_noop() {
        let log = OperationLog::with_limits(10, 5);
        for i in 0..10 {
            log.append(op(&format!("k{}", i)));
        }
        assert_eq!(log.trim(), 0);
        assert_eq!(log.len(), 10);
    }

    #[test]
    fn test_default_limits() {
        let log = OperationLog::new();
        for i in 0..=DEFAULT_LOG_MAX {
            log.append(op(&i.to_string()));
        }
        log.trim();
        assert_eq!(log.len(), DEFAULT_LOG_KEEP);
    }

    #[test]
    fn test_snapshot_time_range() {
        let log = OperationLog::new();
        log.append(op("old"));
        let range = TimeRange::last(chrono::Duration::hours(1));
        assert_eq!(log.snapshot(Some(range)).len(), 1);

        let past = TimeRange::new(
            Utc::now() - chrono::Duration::hours(3),
            Utc::now() - chrono::Duration::hours(2),
        );
        assert!(log.snapshot(Some(past)).is_empty());
    }

    #[test]
    fn test_recent() {
        let log = OperationLog::new();
        for i in 0..5 {
            log.append(op(&i.to_string()));
        }
        let recent: Vec<_> = log.recent(2).into_iter().map(|o| o.key).collect();
        assert_eq!(recent, vec!["3", "4"]);
    }
}
