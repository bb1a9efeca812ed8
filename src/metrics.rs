//! Metrics instrumentation for playervault.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for choosing the exporter
//! (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `playervault_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//! - `_bytes` suffix for size histograms

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a store operation outcome (load, update, tx, save, unload, peek).
pub fn record_operation(operation: &str, status: &str) {
    counter!(
        "playervault_operations_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency.
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "playervault_operation_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record one backoff pause taken by the retry layer.
pub fn record_retry(operation: &str) {
    counter!(
        "playervault_retries_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record the inline encoded size of a record at write time.
pub fn record_encoded_size(bytes: usize) {
    histogram!("playervault_record_bytes").record(bytes as f64);
}

/// Record a lost lease.
pub fn record_lock_lost() {
    counter!("playervault_lock_lost_total").increment(1);
}

/// Record an acquire that timed out against a foreign holder.
pub fn record_lock_timeout() {
    counter!("playervault_lock_timeout_total").increment(1);
}

/// Record a transaction outcome (committed, aborted, rolled_back, downgraded).
pub fn record_tx(outcome: &str) {
    counter!(
        "playervault_tx_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record orphaned shard documents deleted by a sweep.
pub fn record_orphans_deleted(count: usize) {
    counter!("playervault_orphans_deleted_total").increment(count as u64);
}

/// Set the number of live sessions.
pub fn set_sessions(count: usize) {
    gauge!("playervault_sessions").set(count as f64);
}

/// Timer helper for recording operation latency.
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    #[must_use]
    pub fn new(operation: &'static str) -> Self {
        Self { operation, start: Instant::now() }
    }

    pub fn finish(self, status: &str) {
        record_latency(self.operation, self.start.elapsed());
        record_operation(self.operation, status);
    }
}
