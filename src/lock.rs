// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Distributed lock manager over the LeaseMap.
//!
//! Each acquisition is identified by a random 128-bit lock id and backed
//! by the LeaseMap's atomic "set if absent or mine" update. A background
//! task refreshes the lease; if a refresh is refused or the locally
//! tracked expiry passes without one, the handle transitions to `Lost` and
//! fires its loss callbacks exactly once. A session whose lock is lost
//! must refuse further mutations.
//!
//! ```text
//! acquiring → held → released
//!                └──→ lost (refresh refused or expiry elapsed)
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::backend::LeaseMap;
use crate::error::{BackendError, StoreError};
use crate::resilience::{CancelSource, CancelToken, RetryPolicy};

/// Allowance for clock skew between this process and the LeaseMap.
const EXPIRY_MARGIN: Duration = Duration::from_millis(200);

/// Lifecycle of one acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Held,
    Lost,
    Released,
}

impl std::fmt::Display for LockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Held => write!(f, "Held"),
            Self::Lost => write!(f, "Lost"),
            Self::Released => write!(f, "Released"),
        }
    }
}

type LostCallback = Box<dyn FnOnce() + Send>;

/// Acquires and supervises leases for record keys.
pub struct LockManager {
    leases: Arc<dyn LeaseMap>,
    retry: RetryPolicy,
}

impl LockManager {
    pub fn new(leases: Arc<dyn LeaseMap>, retry: RetryPolicy) -> Self {
        Self { leases, retry }
    }

    /// Whether some process currently holds a live lease for `key`.
    pub async fn probe(&self, key: &str) -> Result<bool, BackendError> {
        Ok(self.leases.holder(key).await?.is_some())
    }

    /// Acquire the lease for `key`, retrying with backoff until the
    /// acquire deadline (= `duration`) elapses.
    pub async fn acquire(
        &self,
        key: &str,
        duration: Duration,
        refresh_interval: Duration,
        cancel: &CancelToken,
    ) -> Result<LockHandle, StoreError> {
        let lock_id = uuid::Uuid::new_v4().to_string();
        let deadline = Instant::now() + duration;
        let mut delay = self.retry.initial_delay;

        loop {
            if cancel.is_cancelled() {
                return Err(StoreError::StoreClosed);
            }
            match self.leases.try_lease(key, &lock_id, duration).await {
                Ok(true) => break,
                Ok(false) => debug!(key, "lease held elsewhere, backing off"),
                Err(e) if e.is_retryable() => {
                    warn!(key, error = %e, "lease attempt failed, backing off");
                }
                Err(e) => return Err(e.into()),
            }
            let pause = self.retry.jittered(delay);
            if Instant::now() + pause >= deadline {
                crate::metrics::record_lock_timeout();
                return Err(StoreError::LockUnavailable(key.to_string()));
            }
            sleep(pause).await;
            delay = self.retry.advance(delay);
        }

        info!(key, "lock acquired");
        let (state_tx, _) = watch::channel(LockState::Held);
        let refresh_cancel = CancelSource::new();
        let inner = Arc::new(LockInner {
            key: key.to_string(),
            lock_id,
            duration,
            leases: self.leases.clone(),
            state: state_tx,
            expiry: Mutex::new(Instant::now() + duration - EXPIRY_MARGIN),
            lost_callbacks: Mutex::new(Some(Vec::new())),
        });

        let task = tokio::spawn(refresh_loop(
            inner.clone(),
            refresh_interval,
            refresh_cancel.token(),
        ));

        Ok(LockHandle { inner, cancel: refresh_cancel, refresh_task: Mutex::new(Some(task)) })
    }
}

struct LockInner {
    key: String,
    lock_id: String,
    duration: Duration,
    leases: Arc<dyn LeaseMap>,
    state: watch::Sender<LockState>,
    expiry: Mutex<Instant>,
    /// `Some` until loss fires; `take`n so callbacks run exactly once.
    lost_callbacks: Mutex<Option<Vec<LostCallback>>>,
}

impl LockInner {
    fn expired(&self) -> bool {
        *self.expiry.lock() <= Instant::now()
    }

    fn mark_lost(&self) {
        let transitioned = self.state.send_if_modified(|s| {
            if *s == LockState::Held {
                *s = LockState::Lost;
                true
            } else {
                false
            }
        });
        if !transitioned {
            return;
        }
        warn!(key = %self.key, "lock lost");
        crate::metrics::record_lock_lost();
        let callbacks = self.lost_callbacks.lock().take().unwrap_or_default();
        for cb in callbacks {
            if catch_unwind(AssertUnwindSafe(cb)).is_err() {
                warn!(key = %self.key, "lock-lost observer panicked");
            }
        }
    }
}

async fn refresh_loop(inner: Arc<LockInner>, interval: Duration, mut cancel: CancelToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            () = sleep(interval) => {}
        }
        match inner.leases.try_lease(&inner.key, &inner.lock_id, inner.duration).await {
            Ok(true) => {
                *inner.expiry.lock() = Instant::now() + inner.duration - EXPIRY_MARGIN;
                debug!(key = %inner.key, "lease refreshed");
            }
            Ok(false) => {
                inner.mark_lost();
                return;
            }
            Err(e) if e.is_retryable() => {
                // Tolerated until the tracked expiry passes; the next tick
                // retries.
                warn!(key = %inner.key, error = %e, "lease refresh failed");
            }
            Err(e) => {
                warn!(key = %inner.key, error = %e, "lease refresh failed terminally");
                inner.mark_lost();
                return;
            }
        }
        if inner.expired() {
            inner.mark_lost();
            return;
        }
    }
}

/// A held (or formerly held) lease.
pub struct LockHandle {
    inner: Arc<LockInner>,
    cancel: CancelSource,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle").field("key", &self.inner.key).finish()
    }
}

impl LockHandle {
    #[must_use]
    pub fn state(&self) -> LockState {
        *self.inner.state.borrow()
    }

    /// True only while held and within the locally tracked expiry.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state() == LockState::Held && !self.inner.expired()
    }

    #[must_use]
    pub fn lock_id(&self) -> &str {
        &self.inner.lock_id
    }

    /// Register a loss observer. Runs synchronously, exactly once, when the
    /// lock transitions to `Lost`; immediately if it already has.
    pub fn on_lost(&self, callback: impl FnOnce() + Send + 'static) {
        let run_now = {
            let mut slot = self.inner.lost_callbacks.lock();
            match slot.as_mut() {
                Some(list) if self.state() == LockState::Held => {
                    list.push(Box::new(callback));
                    None
                }
                _ => Some(callback),
            }
        };
        if let Some(cb) = run_now {
            if self.state() == LockState::Lost {
                if catch_unwind(AssertUnwindSafe(cb)).is_err() {
                    warn!(key = %self.inner.key, "lock-lost observer panicked");
                }
            }
        }
    }

    /// Stop refreshing and clear the lease. Idempotent; a lost handle only
    /// winds down its refresh task.
    pub async fn release(&self) {
        self.cancel.cancel();
        let task = self.refresh_task.lock().take();
        if let Some(task) = task {
            // Let an in-flight refresh settle rather than orphan the lease
            // mid-update.
            let _ = task.await;
        }

        let release_lease = self.inner.state.send_if_modified(|s| {
            if *s == LockState::Held {
                *s = LockState::Released;
                true
            } else {
                false
            }
        });
        if release_lease {
            if let Err(e) = self.inner.leases.release(&self.inner.key, &self.inner.lock_id).await
            {
                warn!(key = %self.inner.key, error = %e, "lease clear failed, will expire by TTL");
            }
            debug!(key = %self.inner.key, "lock released");
        }
    }
}
