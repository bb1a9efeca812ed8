// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-key session: the in-memory state machine that mediates every
//! operation on one record.
//!
//! # Lifecycle
//!
//! ```text
//! Loading → Ready → Unloading → Closed
//!      └──────┴──→ Lost ──────→ Closed   (lease lost)
//! ```
//!
//! Loading acquires the lease, reads and reassembles the record, resolves
//! any staged transaction against the ledger, migrates, validates, and,
//! if anything changed, flushes before turning Ready. Ready accepts
//! operations through the queue (updates may take the fast path while no
//! transaction touches the key). Unloading drains, saves, and releases the
//! lease. A lost lease makes the session terminal: all operations reject
//! with `LockLost`.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::Precondition;
use crate::codec::StoredDoc;
use crate::error::StoreError;
use crate::events::{fan_out, ChangeEvent};
use crate::lock::LockHandle;
use crate::migration::MigrationRunner;
use crate::patch::Patch;
use crate::queue::{self, Op, OpQueue, SlotPermit, UpdateFn};
use crate::record::{LogicalRecord, RecordMeta};
use crate::shard;
use crate::store::StoreContext;
use crate::tx;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Acquiring the lock, reading, migrating, validating.
    Loading,
    /// Accepting operations.
    Ready,
    /// Draining the queue and writing the final save.
    Unloading,
    /// Terminal; every operation rejects.
    Closed,
    /// The lease was lost; in-memory data may be stale. Terminal.
    Lost,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Loading => write!(f, "Loading"),
            Self::Ready => write!(f, "Ready"),
            Self::Unloading => write!(f, "Unloading"),
            Self::Closed => write!(f, "Closed"),
            Self::Lost => write!(f, "Lost"),
        }
    }
}

pub(crate) struct SessionData {
    pub data: Value,
    pub meta: RecordMeta,
    pub last_saved: Value,
    pub dirty: bool,
    /// CAS version of the primary document; `None` until first write.
    pub doc_version: Option<u64>,
}

impl SessionData {
    fn write_precondition(&self) -> Precondition {
        match self.doc_version {
            Some(v) => Precondition::Version(v),
            None => Precondition::Absent,
        }
    }
}

/// Shared per-session state; the worker, autosave task, lock-loss callback
/// and transaction coordinator all hold an `Arc` of this.
pub(crate) struct SessionCore {
    pub(crate) key: String,
    pub(crate) primary_id: String,
    pub(crate) ctx: Arc<StoreContext>,
    state: watch::Sender<SessionState>,
    pub(crate) data: Mutex<SessionData>,
    queue: OpQueue,
    lock: LockHandle,
}

/// A loaded session: the core plus its background tasks.
pub(crate) struct Session {
    pub(crate) core: Arc<SessionCore>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("key", &self.core.key).finish()
    }
}

impl Session {
    /// Load the record for `key`: acquire the lock, read, resolve staged
    /// transaction state, migrate, validate, and flush anything that
    /// changed. Any failure closes the session and releases the lock.
    pub(crate) async fn load(ctx: Arc<StoreContext>, key: &str) -> Result<Arc<Self>, StoreError> {
        let primary_id = ctx.primary_id(key);
        let tunables = &ctx.config.tunables;
        let lock = ctx
            .locks
            .acquire(
                &primary_id,
                tunables.lock_duration(),
                tunables.lock_refresh_interval(),
                &ctx.cancel,
            )
            .await?;

        let prepared = match prepare_record(&ctx, key, &primary_id).await {
            Ok(prepared) => prepared,
            Err(e) => {
                lock.release().await;
                return Err(e);
            }
        };

        let (queue, op_rx) = OpQueue::channel();
        let (state, _) = watch::channel(SessionState::Loading);
        let dirty = prepared.dirty;
        let core = Arc::new(SessionCore {
            key: key.to_string(),
            primary_id,
            ctx: ctx.clone(),
            state,
            data: Mutex::new(SessionData {
                last_saved: prepared.data.clone(),
                data: prepared.data,
                meta: prepared.meta,
                dirty,
                doc_version: prepared.doc_version,
            }),
            queue,
            lock,
        });

        // Migration, import, and staged-tx collapse become durable with
        // this first save; a crash before it reapplies them on next load.
        if dirty {
            if let Err(e) = core.flush().await {
                core.lock.release().await;
                let _ = core.state.send(SessionState::Closed);
                return Err(e);
            }
        }

        let weak = Arc::downgrade(&core);
        core.lock.on_lost(move || {
            if let Some(core) = weak.upgrade() {
                core.mark_lost();
            }
        });

        let loaded = core.data.lock().data.clone();
        fan_out(
            &ctx.config.changed_callbacks,
            &ChangeEvent { key: key.to_string(), new: Arc::new(loaded), old: None },
        );

        let _ = core.state.send(SessionState::Ready);
        info!(key, "session ready");

        let worker = tokio::spawn(run_worker(core.clone(), op_rx));
        let autosave = tokio::spawn(autosave_loop(core.clone()));
        Ok(Arc::new(Self { core, tasks: Mutex::new(vec![worker, autosave]) }))
    }

    /// Enqueue the unload and wait for the final save, lease release, and
    /// worker shutdown.
    pub(crate) async fn unload(&self) -> Result<(), StoreError> {
        let (reply, done) = oneshot::channel();
        let result = match self.core.queue.submit(Op::Unload { reply }, &self.core.key) {
            // Worker already gone: the session is closed.
            Err(_) => Ok(()),
            Ok(()) => done.await.unwrap_or(Ok(())),
        };
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        result
    }
}

impl SessionCore {
    pub(crate) fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub(crate) fn state_receiver(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub(crate) fn fast_path_open(&self) -> bool {
        self.queue.fast_path_open()
    }

    pub(crate) fn submit(&self, op: Op) -> Result<(), StoreError> {
        self.queue.submit(op, &self.key)
    }

    pub(crate) fn request_tx_slot(&self) -> Result<oneshot::Receiver<SlotPermit>, StoreError> {
        self.queue.request_tx_slot(&self.key)
    }

    fn mark_lost(&self) {
        let transitioned = self.state.send_if_modified(|s| {
            if matches!(s, SessionState::Loading | SessionState::Ready) {
                *s = SessionState::Lost;
                true
            } else {
                false
            }
        });
        if transitioned {
            warn!(key = %self.key, "session lost its lease");
        }
    }

    /// The per-state error an operation gets outside `Ready`.
    fn reject_for_state(&self) -> StoreError {
        if self.ctx.is_closing() {
            return StoreError::StoreClosed;
        }
        match self.state() {
            SessionState::Lost => StoreError::LockLost(self.key.clone()),
            _ => StoreError::KeyNotLoaded(self.key.clone()),
        }
    }

    fn ensure_ready(&self) -> Result<(), StoreError> {
        if self.ctx.is_closing() {
            return Err(StoreError::StoreClosed);
        }
        if self.state() != SessionState::Ready {
            return Err(self.reject_for_state());
        }
        // A lease we can no longer assert means no further mutations.
        if !self.lock.is_locked() {
            self.mark_lost();
            return Err(StoreError::LockLost(self.key.clone()));
        }
        Ok(())
    }

    /// Ready with an assertable lease, without the store-closing check:
    /// transaction phases 2-4 run to completion even while the store
    /// closes.
    fn ensure_tx_mutable(&self) -> Result<(), StoreError> {
        match self.state() {
            SessionState::Ready => {}
            SessionState::Lost => return Err(StoreError::LockLost(self.key.clone())),
            _ => return Err(StoreError::KeyNotLoaded(self.key.clone())),
        }
        if !self.lock.is_locked() {
            self.mark_lost();
            return Err(StoreError::LockLost(self.key.clone()));
        }
        Ok(())
    }

    /// Deep copy of the current data, for `get`.
    pub(crate) fn data_snapshot(&self) -> Result<Value, StoreError> {
        match self.state() {
            SessionState::Ready => Ok(self.data.lock().data.clone()),
            _ => Err(self.reject_for_state()),
        }
    }

    /// Run an update transform and commit its result. Synchronous: used by
    /// both the fast path and the queue worker.
    pub(crate) fn apply_update(&self, transform: UpdateFn) -> Result<bool, StoreError> {
        self.ensure_ready()?;

        let mut guard = self.data.lock();
        let old = Arc::new(guard.data.clone());

        let committed = if self.ctx.config.disable_reference_protection {
            // Trusted transforms mutate in place; an abort or overrun
            // leaves whatever they wrote (documented on the flag).
            run_transform(&self.ctx, &mut guard.data, transform)?
        } else {
            let mut candidate = guard.data.clone();
            let committed = run_transform(&self.ctx, &mut candidate, transform)?;
            if committed {
                self.ctx.config.check_schema(&candidate)?;
                guard.data = candidate;
            }
            committed
        };
        if !committed {
            return Ok(false);
        }
        if self.ctx.config.disable_reference_protection {
            self.ctx.config.check_schema(&guard.data)?;
        }

        guard.dirty = true;
        let new = Arc::new(guard.data.clone());
        drop(guard);

        fan_out(
            &self.ctx.config.changed_callbacks,
            &ChangeEvent { key: self.key.clone(), new, old: Some(old) },
        );
        Ok(true)
    }

    /// Write the current record to the DocStore if dirty.
    pub(crate) async fn flush(&self) -> Result<(), StoreError> {
        let (stored, prev_shards, expected) = {
            let guard = self.data.lock();
            if !guard.dirty {
                return Ok(());
            }
            let record =
                LogicalRecord { data: guard.data.clone(), meta: guard.meta.clone() };
            (StoredDoc::inline(&record), guard.meta.shard_ids.clone(), guard.write_precondition())
        };

        let written = stored.data.clone().unwrap_or(Value::Null);
        let (version, shard_ids) = shard::write_record(
            &self.ctx.docs,
            self.ctx.retry(),
            &self.ctx.cancel,
            &self.ctx.orphans,
            &self.primary_id,
            &stored,
            &prev_shards,
            expected,
            self.ctx.config.tunables.max_doc_bytes,
        )
        .await?;

        let mut guard = self.data.lock();
        guard.doc_version = Some(version);
        guard.meta.shard_ids = shard_ids;
        guard.last_saved = written;
        // Fast-path updates may have landed while the write was in flight.
        guard.dirty = guard.data != guard.last_saved;
        debug!(key = %self.key, version, "record flushed");
        Ok(())
    }

    async fn checked_flush(&self) -> Result<(), StoreError> {
        self.ensure_ready()?;
        self.flush().await
    }

    /// Final save, lease release, and transition to `Closed`.
    async fn finish_unload(&self) -> Result<(), StoreError> {
        let prior = self.state();
        if prior == SessionState::Closed {
            return Ok(());
        }
        if matches!(prior, SessionState::Loading | SessionState::Ready) {
            let _ = self.state.send(SessionState::Unloading);
        }

        // A lost session skips the save: its data may be stale.
        let save_result =
            if prior == SessionState::Ready { self.flush().await } else { Ok(()) };
        if let Err(e) = &save_result {
            warn!(key = %self.key, error = %e, "final save failed during unload");
        }

        self.lock.release().await;
        let _ = self.state.send(SessionState::Closed);
        info!(key = %self.key, "session closed");
        save_result
    }

    // --- Transaction coordinator hooks. The coordinator holds this
    // session's tx slot while calling these, so the worker is parked and
    // nothing else mutates the record.

    /// Phase 2: write the record with the staged transaction state.
    pub(crate) async fn stage_tx(&self, tx_id: &str, patch: Patch) -> Result<(), StoreError> {
        self.ensure_tx_mutable()?;
        let (stored, prev_shards, expected) = {
            let guard = self.data.lock();
            let mut meta = guard.meta.clone();
            meta.active_tx_id = Some(tx_id.to_string());
            meta.committed_data = Some(guard.data.clone());
            meta.tx_patch = Some(patch);
            let record = LogicalRecord { data: guard.data.clone(), meta };
            (StoredDoc::inline(&record), guard.meta.shard_ids.clone(), guard.write_precondition())
        };

        let (version, shard_ids) = shard::write_record(
            &self.ctx.docs,
            self.ctx.retry(),
            &self.ctx.cancel,
            &self.ctx.orphans,
            &self.primary_id,
            &stored,
            &prev_shards,
            expected,
            self.ctx.config.tunables.max_doc_bytes,
        )
        .await?;

        let mut guard = self.data.lock();
        guard.meta.active_tx_id = stored.meta.active_tx_id.clone();
        guard.meta.committed_data = stored.meta.committed_data.clone();
        guard.meta.tx_patch = stored.meta.tx_patch.clone();
        guard.meta.shard_ids = shard_ids;
        guard.doc_version = Some(version);
        debug!(key = %self.key, tx_id, "transaction staged");
        Ok(())
    }

    /// Rollback: rewrite the record without staged state. The in-memory
    /// staging clears even if the write fails; the durable leftover heals
    /// on the next load.
    pub(crate) async fn rollback_stage(&self) -> Result<(), StoreError> {
        let (stored, prev_shards, expected) = {
            let guard = self.data.lock();
            let mut meta = guard.meta.clone();
            meta.clear_staging();
            let record = LogicalRecord { data: guard.data.clone(), meta };
            (StoredDoc::inline(&record), guard.meta.shard_ids.clone(), guard.write_precondition())
        };

        let result = shard::write_record(
            &self.ctx.docs,
            self.ctx.retry(),
            &self.ctx.cancel,
            &self.ctx.orphans,
            &self.primary_id,
            &stored,
            &prev_shards,
            expected,
            self.ctx.config.tunables.max_doc_bytes,
        )
        .await;

        let mut guard = self.data.lock();
        guard.meta.clear_staging();
        match result {
            Ok((version, shard_ids)) => {
                guard.doc_version = Some(version);
                guard.meta.shard_ids = shard_ids;
                Ok(())
            }
            Err(e) => {
                guard.dirty = true;
                Err(e)
            }
        }
    }

    /// Phase 4: write the post-transaction record and fan out the change.
    /// A failed write leaves the session dirty so a later flush collapses
    /// the staged document; the commit itself already happened at the
    /// ledger.
    pub(crate) async fn finalize_tx(&self, new_data: Value) -> Result<(), StoreError> {
        let (stored, prev_shards, expected, old) = {
            let guard = self.data.lock();
            let mut meta = guard.meta.clone();
            meta.clear_staging();
            let record = LogicalRecord { data: new_data.clone(), meta };
            (
                StoredDoc::inline(&record),
                guard.meta.shard_ids.clone(),
                guard.write_precondition(),
                Arc::new(guard.data.clone()),
            )
        };

        let result = shard::write_record(
            &self.ctx.docs,
            self.ctx.retry(),
            &self.ctx.cancel,
            &self.ctx.orphans,
            &self.primary_id,
            &stored,
            &prev_shards,
            expected,
            self.ctx.config.tunables.max_doc_bytes,
        )
        .await;

        {
            let mut guard = self.data.lock();
            guard.data = new_data.clone();
            guard.meta.clear_staging();
            match &result {
                Ok((version, shard_ids)) => {
                    guard.doc_version = Some(*version);
                    guard.meta.shard_ids = shard_ids.clone();
                    guard.last_saved = new_data.clone();
                    guard.dirty = false;
                }
                Err(_) => guard.dirty = true,
            }
        }

        fan_out(
            &self.ctx.config.changed_callbacks,
            &ChangeEvent { key: self.key.clone(), new: Arc::new(new_data), old: Some(old) },
        );
        result.map(|_| ())
    }

    /// Single-key downgrade: commit the transform's result as an ordinary
    /// in-memory update.
    pub(crate) fn commit_local(&self, new_data: Value) -> Result<(), StoreError> {
        self.ensure_ready()?;
        let old = {
            let mut guard = self.data.lock();
            let old = Arc::new(guard.data.clone());
            guard.data = new_data.clone();
            guard.dirty = true;
            old
        };
        fan_out(
            &self.ctx.config.changed_callbacks,
            &ChangeEvent { key: self.key.clone(), new: Arc::new(new_data), old: Some(old) },
        );
        Ok(())
    }

    fn reject(&self, op: Op) {
        let err = self.reject_for_state();
        match op {
            Op::Update { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Op::Save { reply: Some(reply) } => {
                let _ = reply.send(Err(err));
            }
            Op::Save { reply: None } => {}
            // Dropping the grant refuses the slot; the permit's blocker
            // unwinds with it.
            Op::TxSlot { .. } => {}
            Op::Unload { reply } => {
                let _ = reply.send(Ok(()));
            }
        }
    }
}

/// Run a transform against `data` under the synchronous budget.
fn run_transform(
    ctx: &StoreContext,
    data: &mut Value,
    transform: UpdateFn,
) -> Result<bool, StoreError> {
    let budget = ctx.config.tunables.transform_budget();
    // Wall clock, not the tokio clock: what is being bounded is real
    // scheduler blockage.
    let start = std::time::Instant::now();
    let outcome = catch_unwind(AssertUnwindSafe(move || transform(data)));
    let elapsed = start.elapsed();
    let committed = outcome
        .map_err(|_| StoreError::UpdateYielded { elapsed_ms: elapsed.as_millis() as u64 })?;
    if elapsed > budget {
        return Err(StoreError::UpdateYielded { elapsed_ms: elapsed.as_millis() as u64 });
    }
    Ok(committed)
}

async fn run_worker(core: Arc<SessionCore>, mut ops: mpsc::UnboundedReceiver<Op>) {
    while let Some(op) = ops.recv().await {
        match op {
            Op::Update { transform, reply } => {
                let _ = reply.send(core.apply_update(transform));
            }
            Op::Save { reply } => {
                let result = core.checked_flush().await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                } else if let Err(e) = result {
                    warn!(key = %core.key, error = %e, "autosave failed");
                }
            }
            Op::TxSlot { grant, blocker } => queue::serve_tx_slot(grant, blocker).await,
            Op::Unload { reply } => {
                let _ = reply.send(core.finish_unload().await);
                break;
            }
        }
    }
    // Anything still queued (or racing in) is rejected.
    ops.close();
    while let Ok(op) = ops.try_recv() {
        core.reject(op);
    }
}

async fn autosave_loop(core: Arc<SessionCore>) {
    let interval = core.ctx.config.tunables.autosave_interval();
    let mut state_rx = core.state_receiver();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await; // the immediate first tick

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if core.state() != SessionState::Ready {
                    return;
                }
                if core.data.lock().dirty {
                    debug!(key = %core.key, "autosave tick");
                    let _ = core.submit(Op::Save { reply: None });
                }
            }
            changed = state_rx.changed() => {
                if changed.is_err() || *state_rx.borrow() != SessionState::Ready {
                    return;
                }
            }
        }
    }
}

struct PreparedRecord {
    data: Value,
    meta: RecordMeta,
    doc_version: Option<u64>,
    dirty: bool,
}

/// Read, resolve, import, migrate, and validate the record for `key`.
async fn prepare_record(
    ctx: &Arc<StoreContext>,
    key: &str,
    primary_id: &str,
) -> Result<PreparedRecord, StoreError> {
    let assembled =
        shard::read_record(&ctx.docs, ctx.retry(), &ctx.cancel, primary_id).await?;
    let runner = MigrationRunner::new(&ctx.config.migration_steps);

    let (mut data, mut meta, doc_version, mut dirty) = match assembled {
        Some(assembled) => {
            let resolved = tx::resolve_staged(ctx, assembled).await?;
            (resolved.data, resolved.meta, Some(resolved.version), resolved.collapsed)
        }
        None => match import_legacy(ctx, key)? {
            Some(imported) => {
                info!(key, "imported legacy data");
                // Imported data predates every migration step.
                let meta = RecordMeta {
                    shard_ids: vec![primary_id.to_string()],
                    ..RecordMeta::default()
                };
                (imported, meta, None, true)
            }
            None => {
                // Born from the template, current as of every known step.
                let meta = RecordMeta {
                    applied_migrations: runner.all_names(),
                    shard_ids: vec![primary_id.to_string()],
                    ..RecordMeta::default()
                };
                (ctx.config.template.clone(), meta, None, true)
            }
        },
    };

    dirty |= runner.run(&mut data, &mut meta.applied_migrations)?;
    ctx.config.check_schema(&data)?;
    Ok(PreparedRecord { data, meta, doc_version, dirty })
}

fn import_legacy(ctx: &Arc<StoreContext>, key: &str) -> Result<Option<Value>, StoreError> {
    let Some(import) = &ctx.config.import_legacy_data else {
        return Ok(None);
    };
    let import = import.clone();
    let key_owned = key.to_string();
    catch_unwind(AssertUnwindSafe(move || import(&key_owned)))
        .map_err(|_| StoreError::ImportFailed("import hook panicked".into()))?
        .map_err(StoreError::ImportFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{LeaseMap, MemoryDocStore, MemoryLeaseMap};
    use crate::config::StoreConfig;
    use crate::migration::MigrationStep;
    use crate::resilience::RetryPolicy;
    use serde_json::json;

    fn context(config: StoreConfig) -> (Arc<StoreContext>, Arc<MemoryDocStore>, Arc<MemoryLeaseMap>) {
        let docs = Arc::new(MemoryDocStore::new());
        let leases = Arc::new(MemoryLeaseMap::new());
        let config = config.retry(RetryPolicy::test());
        let ctx = StoreContext::new(
            config,
            docs.clone(),
            leases.clone(),
            crate::resilience::CancelToken::never(),
        );
        (ctx, docs, leases)
    }

    fn coin_config() -> StoreConfig {
        StoreConfig::new("players").template(json!({"coins": 0}))
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_load_creates_the_record() {
        let (ctx, docs, _) = context(coin_config());
        let session = Session::load(ctx, "p1").await.unwrap();
        assert_eq!(session.core.state(), SessionState::Ready);
        assert_eq!(session.core.data_snapshot().unwrap(), json!({"coins": 0}));
        // The eager first save persisted the template.
        assert!(docs.peek_raw("players/p1").is_some());
        session.unload().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn update_commits_and_save_persists() {
        let (ctx, docs, _) = context(coin_config());
        let session = Session::load(ctx.clone(), "p1").await.unwrap();

        let committed = session
            .core
            .apply_update(Box::new(|data| {
                data["coins"] = json!(10);
                true
            }))
            .unwrap();
        assert!(committed);
        assert!(session.core.data.lock().dirty);

        session.core.flush().await.unwrap();
        assert!(!session.core.data.lock().dirty);

        let doc = docs.peek_raw("players/p1").unwrap();
        let stored = crate::codec::decode_stored(&doc.bytes).unwrap();
        assert_eq!(stored.data.unwrap(), json!({"coins": 10}));
        session.unload().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn aborting_update_resolves_false_and_keeps_data() {
        let (ctx, _, _) = context(coin_config());
        let session = Session::load(ctx, "p1").await.unwrap();
        let committed = session
            .core
            .apply_update(Box::new(|data| {
                data["coins"] = json!(999);
                false
            }))
            .unwrap();
        assert!(!committed);
        assert_eq!(session.core.data_snapshot().unwrap(), json!({"coins": 0}));
        session.unload().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn schema_rejection_leaves_session_ready() {
        let config = coin_config().schema(|data| {
            data["coins"].as_i64().map(|_| ()).ok_or_else(|| "coins must be a number".into())
        });
        let (ctx, _, _) = context(config);
        let session = Session::load(ctx, "p1").await.unwrap();

        let err = session
            .core
            .apply_update(Box::new(|data| {
                data["coins"] = json!("ten");
                true
            }))
            .unwrap_err();
        assert!(matches!(err, StoreError::SchemaFailed { .. }));
        assert_eq!(session.core.state(), SessionState::Ready);
        assert_eq!(session.core.data_snapshot().unwrap(), json!({"coins": 0}));
        session.unload().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_transform_yields() {
        let (ctx, _, _) = context(coin_config());
        let session = Session::load(ctx, "p1").await.unwrap();
        let err = session
            .core
            .apply_update(Box::new(|data| {
                std::thread::sleep(std::time::Duration::from_millis(250));
                data["coins"] = json!(1);
                true
            }))
            .unwrap_err();
        assert!(matches!(err, StoreError::UpdateYielded { .. }));
        assert_eq!(session.core.data_snapshot().unwrap(), json!({"coins": 0}));
        session.unload().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_transform_yields_and_keeps_data() {
        let (ctx, _, _) = context(coin_config());
        let session = Session::load(ctx, "p1").await.unwrap();
        let err = session
            .core
            .apply_update(Box::new(|_| panic!("transform bug")))
            .unwrap_err();
        assert!(matches!(err, StoreError::UpdateYielded { .. }));
        assert_eq!(session.core.data_snapshot().unwrap(), json!({"coins": 0}));
        session.unload().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unload_releases_the_lease() {
        let (ctx, _, leases) = context(coin_config());
        let session = Session::load(ctx, "p1").await.unwrap();
        assert!(leases.holder("players/p1").await.unwrap().is_some());
        session.unload().await.unwrap();
        assert_eq!(session.core.state(), SessionState::Closed);
        assert!(leases.holder("players/p1").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn operations_after_unload_reject() {
        let (ctx, _, _) = context(coin_config());
        let session = Session::load(ctx, "p1").await.unwrap();
        session.unload().await.unwrap();
        let err = session.core.apply_update(Box::new(|_| true)).unwrap_err();
        assert!(matches!(err, StoreError::KeyNotLoaded(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn lost_lease_rejects_with_lock_lost() {
        let (ctx, _, leases) = context(coin_config());
        let session = Session::load(ctx, "p1").await.unwrap();

        leases.evict("players/p1");
        leases
            .try_lease("players/p1", "thief", std::time::Duration::from_secs(600))
            .await
            .unwrap();
        // Past the refresh interval (20 s for a 60 s lock).
        tokio::time::sleep(std::time::Duration::from_secs(25)).await;

        assert_eq!(session.core.state(), SessionState::Lost);
        let err = session.core.apply_update(Box::new(|_| true)).unwrap_err();
        assert!(matches!(err, StoreError::LockLost(_)));
        let err = session.core.data_snapshot().unwrap_err();
        assert!(matches!(err, StoreError::LockLost(_)));

        // Cleanup from Lost closes without touching the foreign lease.
        session.unload().await.unwrap();
        assert_eq!(session.core.state(), SessionState::Closed);
        assert_eq!(leases.holder("players/p1").await.unwrap().as_deref(), Some("thief"));
    }

    #[tokio::test(start_paused = true)]
    async fn import_hook_seeds_absent_keys_and_migrates() {
        let config = StoreConfig::new("players")
            .template(json!({"coins": 0, "tier": "bronze"}))
            .migration_steps(vec![MigrationStep::new("add-tier", |mut data| {
                data["tier"] = json!("bronze");
                Ok(data)
            })])
            .import_legacy_data(|key| {
                if key == "veteran" {
                    Ok(Some(json!({"coins": 500})))
                } else {
                    Ok(None)
                }
            });
        let (ctx, _, _) = context(config);

        // Imported data runs through every migration step.
        let vet = Session::load(ctx.clone(), "veteran").await.unwrap();
        assert_eq!(
            vet.core.data_snapshot().unwrap(),
            json!({"coins": 500, "tier": "bronze"})
        );
        vet.unload().await.unwrap();

        // Absent import falls back to the template, born current.
        let fresh = Session::load(ctx, "rookie").await.unwrap();
        assert_eq!(
            fresh.core.data_snapshot().unwrap(),
            json!({"coins": 0, "tier": "bronze"})
        );
        assert_eq!(fresh.core.data.lock().meta.applied_migrations, vec!["add-tier"]);
        fresh.unload().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failing_import_fails_the_load() {
        let config = coin_config().import_legacy_data(|_| Err("legacy backend down".into()));
        let (ctx, _, leases) = context(config);
        let err = Session::load(ctx, "p1").await.unwrap_err();
        assert!(matches!(err, StoreError::ImportFailed(_)));
        // The lock did not leak.
        assert!(leases.holder("players/p1").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn migration_applies_once_across_reloads() {
        let steps = || {
            vec![MigrationStep::new("double-coins", |mut data| {
                let coins = data["coins"].as_i64().unwrap_or(0);
                data["coins"] = json!(coins * 2);
                Ok(data)
            })]
        };
        let (ctx, docs, leases) = context(coin_config());
        let session = Session::load(ctx, "p1").await.unwrap();
        session
            .core
            .apply_update(Box::new(|data| {
                data["coins"] = json!(21);
                true
            }))
            .unwrap();
        session.unload().await.unwrap();

        // Reopen with a migration configured: it applies once.
        let config = coin_config().migration_steps(steps()).retry(RetryPolicy::test());
        let ctx = StoreContext::new(
            config,
            docs.clone(),
            leases.clone(),
            crate::resilience::CancelToken::never(),
        );
        let session = Session::load(ctx.clone(), "p1").await.unwrap();
        assert_eq!(session.core.data_snapshot().unwrap(), json!({"coins": 42}));
        session.unload().await.unwrap();

        let session = Session::load(ctx, "p1").await.unwrap();
        assert_eq!(session.core.data_snapshot().unwrap(), json!({"coins": 42}));
        session.unload().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_migration_refuses_to_load() {
        let config = coin_config().migration_steps(vec![MigrationStep::new(
            "known",
            |data| Ok(data),
        )]);
        let (ctx, docs, leases) = context(config);
        let session = Session::load(ctx, "p1").await.unwrap();
        session.unload().await.unwrap();

        // Reopen with an empty step list: the record now knows more than
        // the store.
        let ctx = StoreContext::new(
            coin_config().retry(RetryPolicy::test()),
            docs,
            leases,
            crate::resilience::CancelToken::never(),
        );
        let err = Session::load(ctx, "p1").await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownMigration(name) if name == "known"));
    }

    #[tokio::test(start_paused = true)]
    async fn autosave_flushes_dirty_sessions() {
        let (ctx, docs, _) = context(coin_config());
        let session = Session::load(ctx, "p1").await.unwrap();
        session
            .core
            .apply_update(Box::new(|data| {
                data["coins"] = json!(7);
                true
            }))
            .unwrap();
        let version_before = docs.peek_raw("players/p1").unwrap().version;

        // Past the 30 s autosave interval.
        tokio::time::sleep(std::time::Duration::from_secs(35)).await;

        let doc = docs.peek_raw("players/p1").unwrap();
        assert!(doc.version > version_before, "autosave should have written");
        let stored = crate::codec::decode_stored(&doc.bytes).unwrap();
        assert_eq!(stored.data.unwrap(), json!({"coins": 7}));
        session.unload().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn second_loader_waits_out_the_lease() {
        let (ctx, _, _) = context(coin_config());
        let session = Session::load(ctx.clone(), "p1").await.unwrap();

        // Another "process" (same backends, separate context) competes.
        let rival = {
            let ctx = ctx.clone();
            tokio::spawn(async move { Session::load(ctx, "p1").await })
        };
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        session.unload().await.unwrap();

        let rival = rival.await.unwrap().unwrap();
        assert_eq!(rival.core.state(), SessionState::Ready);
        rival.unload().await.unwrap();
    }
}
