// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Host-facing operations: load, unload, update, tx, save, get, peek.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::instrument;

use super::{Store, StoreState, StoreStats};
use crate::error::StoreError;
use crate::metrics::LatencyTimer;
use crate::queue::Op;
use crate::session::{Session, SessionState};
use crate::{shard, tx};

impl Store {
    fn ensure_open(&self) -> Result<(), StoreError> {
        match self.state() {
            StoreState::Open => Ok(()),
            _ => Err(StoreError::StoreClosed),
        }
    }

    fn session(&self, key: &str) -> Result<Arc<Session>, StoreError> {
        self.inner
            .sessions
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::KeyNotLoaded(key.to_string()))
    }

    /// Load `key` into a session: acquire its lock, read and migrate the
    /// record, and make it Ready. Idempotent; concurrent loads of the same
    /// key share one attempt.
    #[instrument(skip(self), fields(store = %self.inner.ctx.config.name))]
    pub async fn load(&self, key: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        let timer = LatencyTimer::new("load");

        let guard = self
            .inner
            .load_guards
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _held = guard.lock().await;
        self.ensure_open()?;

        if let Some(existing) = self.inner.sessions.get(key) {
            if existing.core.state() == SessionState::Ready {
                timer.finish("already_loaded");
                return Ok(());
            }
            // A lost or closed session still in the map: replace it.
            drop(existing);
            self.inner.sessions.remove(key);
        }

        match Session::load(self.inner.ctx.clone(), key).await {
            Ok(session) => {
                if self.state() != StoreState::Open {
                    // close() began while we were loading: wind the
                    // session back down instead of leaking its lease.
                    let _ = session.unload().await;
                    timer.finish("error");
                    return Err(StoreError::StoreClosed);
                }
                self.inner.sessions.insert(key.to_string(), session);
                crate::metrics::set_sessions(self.inner.sessions.len());
                timer.finish("success");
                Ok(())
            }
            Err(e) => {
                timer.finish("error");
                Err(e)
            }
        }
    }

    /// Flush and release `key`. A no-op if the key is not loaded.
    #[instrument(skip(self), fields(store = %self.inner.ctx.config.name))]
    pub async fn unload(&self, key: &str) -> Result<(), StoreError> {
        let Some((_, session)) = self.inner.sessions.remove(key) else {
            return Ok(());
        };
        let timer = LatencyTimer::new("unload");
        let result = session.unload().await;
        crate::metrics::set_sessions(self.inner.sessions.len());
        timer.finish(if result.is_ok() { "success" } else { "error" });
        result
    }

    /// Run `transform` against a copy of the current data; `true` commits
    /// (after schema validation), `false` aborts and resolves `Ok(false)`.
    ///
    /// Runs immediately when no transaction touches the key, otherwise
    /// queues behind it.
    pub async fn update(
        &self,
        key: &str,
        transform: impl FnOnce(&mut Value) -> bool + Send + 'static,
    ) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let timer = LatencyTimer::new("update");
        let session = self.session(key)?;
        let core = &session.core;

        let result = if core.fast_path_open() {
            core.apply_update(Box::new(transform))
        } else {
            let (reply, done) = oneshot::channel();
            core.submit(Op::Update { transform: Box::new(transform), reply })?;
            done.await
                .unwrap_or_else(|_| Err(StoreError::KeyNotLoaded(key.to_string())))
        };
        timer.finish(match &result {
            Ok(true) => "committed",
            Ok(false) => "aborted",
            Err(_) => "error",
        });
        result
    }

    /// Run an atomic transaction across `keys`, all of which must be
    /// loaded on this store. The transform receives a map of deep copies;
    /// `true` commits all-or-nothing, `false` aborts.
    pub async fn tx(
        &self,
        keys: &[&str],
        transform: impl FnOnce(&mut BTreeMap<String, Value>) -> bool + Send + 'static,
    ) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let timer = LatencyTimer::new("tx");

        let mut sorted: Vec<String> = keys.iter().map(|k| (*k).to_string()).collect();
        sorted.sort();
        sorted.dedup();

        let mut cores = Vec::with_capacity(sorted.len());
        for key in &sorted {
            cores.push(self.session(key)?.core.clone());
        }

        let result = tx::run_transaction(
            &self.inner.ctx,
            &self.inner.tx_admission,
            cores,
            Box::new(transform),
        )
        .await;
        timer.finish(match &result {
            Ok(true) => "committed",
            Ok(false) => "aborted",
            Err(_) => "error",
        });
        result
    }

    /// Force a flush of `key`; resolves once the record is durable.
    /// Stacked saves coalesce into one write.
    pub async fn save(&self, key: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        let timer = LatencyTimer::new("save");
        let session = self.session(key)?;
        let (reply, done) = oneshot::channel();
        session.core.submit(Op::Save { reply: Some(reply) })?;
        let result = done
            .await
            .unwrap_or_else(|_| Err(StoreError::KeyNotLoaded(key.to_string())));
        timer.finish(if result.is_ok() { "success" } else { "error" });
        result
    }

    /// Deep copy of the current data for `key`. Fails if not loaded.
    pub fn get(&self, key: &str) -> Result<Value, StoreError> {
        self.ensure_open()?;
        self.session(key)?.core.data_snapshot()
    }

    /// Lockless point-in-time read straight from the DocStore, without
    /// creating a session. Staged transaction state resolves through the
    /// ledger; migrations do not run. Returns `None` for absent keys.
    #[instrument(skip(self), fields(store = %self.inner.ctx.config.name))]
    pub async fn peek(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.ensure_open()?;
        let timer = LatencyTimer::new("peek");
        let ctx = &self.inner.ctx;
        let primary_id = ctx.primary_id(key);

        let assembled =
            shard::read_record(&ctx.docs, ctx.retry(), &ctx.cancel, &primary_id).await;
        let result = match assembled {
            Ok(Some(assembled)) => {
                tx::resolve_staged(ctx, assembled).await.map(|resolved| Some(resolved.data))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        };
        timer.finish(if result.is_ok() { "success" } else { "error" });
        result
    }

    /// Whether `key` currently has a Ready session on this store.
    #[must_use]
    pub fn is_loaded(&self, key: &str) -> bool {
        self.inner
            .sessions
            .get(key)
            .is_some_and(|s| s.core.state() == SessionState::Ready)
    }

    /// FSM state of the session for `key`, if one exists.
    #[must_use]
    pub fn session_state(&self, key: &str) -> Option<SessionState> {
        self.inner.sessions.get(key).map(|s| s.core.state())
    }

    /// Cheap health snapshot plus one orphan-queue read.
    pub async fn stats(&self) -> StoreStats {
        let mut ready = 0;
        let mut lost = 0;
        for entry in self.inner.sessions.iter() {
            match entry.core.state() {
                SessionState::Ready => ready += 1,
                SessionState::Lost => lost += 1,
                _ => {}
            }
        }
        StoreStats {
            state: self.state(),
            sessions: self.inner.sessions.len(),
            ready,
            lost,
            orphans_queued: self.inner.ctx.orphans.len().await.ok(),
        }
    }
}
