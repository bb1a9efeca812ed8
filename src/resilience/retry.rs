// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with classified exponential backoff.
//!
//! Every DocStore and LeaseMap call goes through [`retry_backend`]. The
//! backend classifies its own failures ([`BackendError`]); this layer
//! decides what to do with each class:
//!
//! - **Transient**: retried with exponential backoff and jitter.
//! - **BudgetExceeded**: retried, but the attempt is not counted.
//! - **Terminal / Conflict**: surfaced immediately.
//!
//! Cancellation halts further attempts between calls; an in-flight call is
//! always allowed to settle.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::BackendError;
use crate::resilience::cancel::CancelToken;

/// Backoff schedule for backend calls.
///
/// Defaults follow the engine-wide policy: first delay 1 s, factor 2,
/// jitter ±20%, capped at 30 s.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Fraction of the delay randomised in both directions (0.2 = ±20%).
    pub jitter: f64,
    /// `None` retries until cancelled or the deadline passes.
    pub max_attempts: Option<usize>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            jitter: 0.2,
            max_attempts: Some(5),
        }
    }
}

impl RetryPolicy {
    /// Unbounded retry, for writes that must eventually land (the
    /// transaction ledger commit bit).
    #[must_use]
    pub fn persistent() -> Self {
        Self { max_attempts: None, ..Self::default() }
    }

    /// Fast schedule for tests.
    #[cfg(test)]
    pub(crate) fn test() -> Self {
        Self {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
            jitter: 0.0,
            max_attempts: Some(3),
        }
    }

    /// Next delay after `delay`, capped.
    pub(crate) fn advance(&self, delay: Duration) -> Duration {
        delay.mul_f64(self.factor).min(self.max_delay)
    }

    pub(crate) fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= f64::EPSILON {
            return delay;
        }
        let spread = 1.0 + self.jitter * (rand::random::<f64>() * 2.0 - 1.0);
        delay.mul_f64(spread.max(0.0))
    }
}

/// Run `operation` until it succeeds, fails terminally, exhausts its
/// attempt budget, or is cancelled.
pub async fn retry_backend<F, Fut, T>(
    operation_name: &str,
    policy: &RetryPolicy,
    cancel: &CancelToken,
    mut operation: F,
) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let mut delay = policy.initial_delay;
    let mut attempts = 0usize;

    loop {
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }

        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!(operation = operation_name, attempts, "operation succeeded after retries");
                }
                return Ok(val);
            }
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => {
                if err.counts_as_attempt() {
                    attempts += 1;
                    if let Some(max) = policy.max_attempts {
                        if attempts >= max {
                            warn!(operation = operation_name, attempts, error = %err, "retry budget exhausted");
                            return Err(err);
                        }
                    }
                }
                crate::metrics::record_retry(operation_name);
                let pause = policy.jittered(delay);
                warn!(
                    operation = operation_name,
                    attempts,
                    error = %err,
                    delay_ms = pause.as_millis() as u64,
                    "backend call failed, backing off"
                );
                sleep(pause).await;
                if err.counts_as_attempt() {
                    delay = policy.advance(delay);
                }
            }
        }
    }
}
