// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Store lifecycle: open, the maintenance loop, and graceful close.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{Store, StoreContext, StoreInner, StoreState};
use crate::backend::{DocStore, LeaseMap};
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::resilience::{CancelSource, CancelToken};

impl Store {
    /// Open a store over the given backends.
    ///
    /// Sweeps the orphaned-shard queue before returning and starts the
    /// periodic maintenance loop that keeps sweeping while the store runs.
    pub async fn open(
        config: StoreConfig,
        docs: Arc<dyn DocStore>,
        leases: Arc<dyn LeaseMap>,
    ) -> Result<Self, StoreError> {
        let cancel = CancelSource::new();
        let ctx = StoreContext::new(config, docs, leases, cancel.token());
        info!(store = %ctx.config.name, "opening store");

        match ctx.orphans.sweep().await {
            Ok(0) => {}
            Ok(deleted) => info!(deleted, "startup orphan sweep"),
            Err(e) => warn!(error = %e, "startup orphan sweep failed"),
        }

        let (state, _) = watch::channel(StoreState::Open);
        let inner = Arc::new(StoreInner {
            ctx: ctx.clone(),
            sessions: DashMap::new(),
            load_guards: DashMap::new(),
            tx_admission: tokio::sync::Mutex::new(()),
            state,
            cancel,
            maintenance: Mutex::new(None),
        });

        let task = tokio::spawn(maintenance_loop(ctx, inner.cancel.token()));
        *inner.maintenance.lock() = Some(task);
        Ok(Self { inner })
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> StoreState {
        *self.inner.state.borrow()
    }

    /// Watch lifecycle transitions.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<StoreState> {
        self.inner.state.subscribe()
    }

    /// Gracefully shut down: refuse new operations, unload every session
    /// (final save, lease release), stop maintenance, and sweep orphans
    /// one last time. Resolves when all sessions are closed. Transactions
    /// already past their commit-staging point run to completion first.
    pub async fn close(&self) {
        let _ = self.inner.state.send_if_modified(|s| {
            if *s == StoreState::Open {
                *s = StoreState::Closing;
                true
            } else {
                false
            }
        });
        self.inner.ctx.set_closing();
        info!(store = %self.inner.ctx.config.name, "closing store");

        let keys: Vec<String> =
            self.inner.sessions.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            if let Some((_, session)) = self.inner.sessions.remove(&key) {
                if let Err(e) = session.unload().await {
                    warn!(key = %key, error = %e, "unload during close failed");
                }
            }
        }
        crate::metrics::set_sessions(0);

        // Best-effort final sweep before cancellation halts retries.
        if let Err(e) = self.inner.ctx.orphans.sweep().await {
            debug!(error = %e, "final orphan sweep failed");
        }

        self.inner.cancel.cancel();
        let task = self.inner.maintenance.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let _ = self.inner.state.send(StoreState::Closed);
        info!(store = %self.inner.ctx.config.name, "store closed");
    }
}

/// Periodic background maintenance: the orphan queue is consulted on a
/// fixed cadence while the store runs.
async fn maintenance_loop(ctx: Arc<StoreContext>, mut cancel: CancelToken) {
    let mut sweep_interval =
        tokio::time::interval(ctx.config.tunables.orphan_sweep_interval());
    sweep_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    sweep_interval.tick().await; // the immediate first tick

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sweep_interval.tick() => {
                match ctx.orphans.sweep().await {
                    Ok(0) => {}
                    Ok(deleted) => debug!(deleted, "periodic orphan sweep"),
                    Err(e) => warn!(error = %e, "periodic orphan sweep failed"),
                }
            }
        }
    }
}
