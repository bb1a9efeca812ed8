// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Store facade.
//!
//! The [`Store`] owns the per-key session map and is the host's entire
//! surface: `load`, `unload`, `update`, `tx`, `save`, `get`, `peek`,
//! `close`. One store instance corresponds to one namespace (`config.name`)
//! over a pair of backends.
//!
//! # Lifecycle
//!
//! ```text
//! Open → Closing → Closed
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use playervault::{MemoryDocStore, MemoryLeaseMap, Store, StoreConfig};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), playervault::StoreError> {
//! let config = StoreConfig::new("players").template(json!({"coins": 0}));
//! let store = Store::open(
//!     config,
//!     Arc::new(MemoryDocStore::new()),
//!     Arc::new(MemoryLeaseMap::new()),
//! )
//! .await?;
//!
//! store.load("player-1").await?;
//! store.update("player-1", |data| {
//!     data["coins"] = json!(100);
//!     true
//! })
//! .await?;
//! store.close().await;
//! # Ok(())
//! # }
//! ```

mod api;
mod lifecycle;
mod types;

pub use types::{StoreState, StoreStats};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::backend::{DocStore, LeaseMap};
use crate::config::StoreConfig;
use crate::lock::LockManager;
use crate::resilience::{CancelSource, CancelToken, RetryPolicy};
use crate::session::Session;
use crate::shard::OrphanQueue;

/// Shared store internals handed to sessions and the transaction
/// coordinator.
pub(crate) struct StoreContext {
    pub(crate) config: StoreConfig,
    pub(crate) docs: Arc<dyn DocStore>,
    pub(crate) locks: LockManager,
    pub(crate) orphans: OrphanQueue,
    pub(crate) cancel: CancelToken,
    closing: AtomicBool,
}

impl StoreContext {
    pub(crate) fn new(
        config: StoreConfig,
        docs: Arc<dyn DocStore>,
        leases: Arc<dyn LeaseMap>,
        cancel: CancelToken,
    ) -> Arc<Self> {
        let locks = LockManager::new(leases, config.retry.clone());
        let orphans = OrphanQueue::new(
            docs.clone(),
            config.retry.clone(),
            cancel.clone(),
            format!("{}/orphans", config.name),
        );
        Arc::new(Self { config, docs, locks, orphans, cancel, closing: AtomicBool::new(false) })
    }

    /// DocStore id of the primary document for `key`. Doubles as the
    /// LeaseMap key, so distinct store names never contend.
    pub(crate) fn primary_id(&self, key: &str) -> String {
        format!("{}/{}", self.config.name, key)
    }

    /// DocStore id of the transaction ledger document for `tx_id`.
    pub(crate) fn ledger_id(&self, tx_id: &str) -> String {
        format!("{}/tx/{}", self.config.name, tx_id)
    }

    pub(crate) fn retry(&self) -> &RetryPolicy {
        &self.config.retry
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub(crate) fn set_closing(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }
}

/// A multi-tenant player-data store over a DocStore and a LeaseMap.
pub struct Store {
    pub(crate) inner: Arc<StoreInner>,
}

pub(crate) struct StoreInner {
    pub(super) ctx: Arc<StoreContext>,
    pub(super) sessions: DashMap<String, Arc<Session>>,
    /// Per-key mutexes serializing concurrent `load` calls.
    pub(super) load_guards: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    /// Serializes transaction slot acquisition (phase 0) store-wide.
    pub(super) tx_admission: tokio::sync::Mutex<()>,
    pub(super) state: watch::Sender<StoreState>,
    pub(super) cancel: CancelSource,
    pub(super) maintenance: Mutex<Option<JoinHandle<()>>>,
}
