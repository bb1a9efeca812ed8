// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Multi-key transactions: two-phase commit over the record-embedded
//! write-ahead state, linearized by a single ledger document.
//!
//! Phases:
//!
//! 0. Acquire an exclusive slot on every participating session (ascending
//!    key order, serialized store-wide so overlapping transactions cannot
//!    deadlock). Running updates finish first; new ones queue.
//! 1. Run the transform on deep copies, validate, and diff. No changes
//!    resolves immediately; one changed key downgrades to an update.
//! 2. Stage each record: rewrite it carrying `activeTxId`, the unchanged
//!    `committedData`, and the computed patch. Any terminal failure rolls
//!    the staged records back.
//! 3. Write `true` to the ledger document keyed by the transaction id.
//!    This single write is the commit point: readers before it reassemble
//!    pre-transaction data, readers after it apply the patch.
//! 4. Rewrite each record collapsed to its post-transaction state, then
//!    delete the ledger. Failures here are not fatal; any leftover
//!    staged-plus-ledger state heals on the next load via [`resolve_staged`].

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::backend::Precondition;
use crate::error::StoreError;
use crate::patch::{self, Patch};
use crate::record::RecordMeta;
use crate::resilience::{retry_backend, CancelToken, RetryPolicy};
use crate::session::{SessionCore, SessionState};
use crate::shard::AssembledRecord;
use crate::store::StoreContext;

/// A transaction transform: mutates the per-key state map in place and
/// returns whether to commit. Synchronous and non-suspending, like update
/// transforms.
pub(crate) type TxFn = Box<dyn FnOnce(&mut BTreeMap<String, Value>) -> bool + Send>;

struct Participant {
    core: Arc<SessionCore>,
    new_data: Value,
    patch: Patch,
}

/// Run a transaction across `participants` (sorted by key, deduplicated).
pub(crate) async fn run_transaction(
    ctx: &Arc<StoreContext>,
    admission: &tokio::sync::Mutex<()>,
    participants: Vec<Arc<SessionCore>>,
    transform: TxFn,
) -> Result<bool, StoreError> {
    // --- Phase 0: exclusive slots on every session.
    if ctx.is_closing() {
        return Err(StoreError::StoreClosed);
    }
    for core in &participants {
        ensure_participant_ready(core)?;
    }

    let mut permits = Vec::with_capacity(participants.len());
    {
        // Slot acquisition is serialized store-wide; overlapping
        // transactions queue here instead of deadlocking in the sessions.
        let _admission = admission.lock().await;
        for core in &participants {
            let granted = core.request_tx_slot()?;
            let permit = granted
                .await
                .map_err(|_| StoreError::KeyNotLoaded(core.key.clone()))?;
            permits.push(permit);
        }
    }
    // State may have moved while we queued behind running operations.
    for core in &participants {
        ensure_participant_ready(core)?;
    }

    // --- Phase 1: transform on deep copies, validate, diff.
    let mut state_map: BTreeMap<String, Value> = participants
        .iter()
        .map(|core| (core.key.clone(), core.data.lock().data.clone()))
        .collect();
    let original_keys: Vec<String> = state_map.keys().cloned().collect();

    let committed = run_tx_transform(ctx, &mut state_map, transform)?;
    if !committed {
        crate::metrics::record_tx("aborted");
        return Ok(false);
    }
    let after_keys: Vec<String> = state_map.keys().cloned().collect();
    if original_keys != after_keys {
        return Err(StoreError::KeysChangedInTransaction);
    }
    for data in state_map.values() {
        ctx.config.check_schema(data)?;
    }

    let mut changed = Vec::new();
    for core in &participants {
        let new_data = state_map
            .remove(&core.key)
            .ok_or(StoreError::KeysChangedInTransaction)?;
        let current = core.data.lock().data.clone();
        let diff = patch::diff(&current, &new_data);
        if !diff.is_empty() {
            changed.push(Participant { core: core.clone(), new_data, patch: diff });
        }
    }

    if changed.is_empty() {
        debug!("transaction changed nothing, resolving without writes");
        crate::metrics::record_tx("empty");
        return Ok(true);
    }
    if changed.len() == 1 {
        // One key changed: an ordinary update, no staging needed.
        let only = changed.remove(0);
        only.core.commit_local(only.new_data)?;
        crate::metrics::record_tx("downgraded");
        return Ok(true);
    }

    // Queued work that has not reached Phase 2 is refused once close
    // begins; from here on the transaction runs to completion.
    if ctx.is_closing() {
        return Err(StoreError::StoreClosed);
    }

    // --- Phase 2: stage every record, ascending key order.
    let tx_id = uuid::Uuid::new_v4().to_string();
    let mut staged: Vec<&Participant> = Vec::with_capacity(changed.len());
    for participant in &changed {
        match participant.core.stage_tx(&tx_id, participant.patch.clone()).await {
            Ok(()) => staged.push(participant),
            Err(e) => {
                warn!(
                    tx_id = %tx_id,
                    key = %participant.core.key,
                    error = %e,
                    "staging failed, rolling back"
                );
                rollback(&staged).await;
                crate::metrics::record_tx("rolled_back");
                return Err(e);
            }
        }
    }

    // --- Phase 3: the commit point.
    let ledger_id = ctx.ledger_id(&tx_id);
    let persistent = RetryPolicy::persistent();
    let ledger_write = retry_backend("ledger_write", &persistent, &CancelToken::never(), || {
        ctx.docs.write(&ledger_id, Precondition::Any, b"true".to_vec())
    })
    .await;
    if let Err(e) = ledger_write {
        // Terminal refusal: the commit bit never landed.
        warn!(tx_id = %tx_id, error = %e, "ledger write refused, rolling back");
        rollback(&staged).await;
        crate::metrics::record_tx("rolled_back");
        return Err(e.into());
    }

    // --- Phase 4: collapse the staged records, then drop the ledger.
    let mut cleanup_clean = true;
    for participant in changed {
        let key = participant.core.key.clone();
        if let Err(e) = participant.core.finalize_tx(participant.new_data).await {
            warn!(tx_id = %tx_id, key = %key, error = %e, "post-commit cleanup failed, heals on next load");
            cleanup_clean = false;
        }
    }
    if cleanup_clean {
        if let Err(e) = retry_backend("ledger_delete", ctx.retry(), &ctx.cancel, || {
            ctx.docs.remove(&ledger_id, Precondition::Any)
        })
        .await
        {
            warn!(tx_id = %tx_id, error = %e, "ledger delete failed, heals on next load");
        }
    }

    info!(tx_id = %tx_id, "transaction committed");
    crate::metrics::record_tx("committed");
    Ok(true)
}

fn ensure_participant_ready(core: &Arc<SessionCore>) -> Result<(), StoreError> {
    match core.state() {
        SessionState::Ready => Ok(()),
        SessionState::Lost => Err(StoreError::LockLost(core.key.clone())),
        _ => Err(StoreError::KeyNotLoaded(core.key.clone())),
    }
}

fn run_tx_transform(
    ctx: &StoreContext,
    state_map: &mut BTreeMap<String, Value>,
    transform: TxFn,
) -> Result<bool, StoreError> {
    let budget = ctx.config.tunables.transform_budget();
    let start = std::time::Instant::now();
    let outcome = catch_unwind(AssertUnwindSafe(move || transform(state_map)));
    let elapsed = start.elapsed();
    let committed = outcome
        .map_err(|_| StoreError::UpdateYielded { elapsed_ms: elapsed.as_millis() as u64 })?;
    if elapsed > budget {
        return Err(StoreError::UpdateYielded { elapsed_ms: elapsed.as_millis() as u64 });
    }
    Ok(committed)
}

async fn rollback(staged: &[&Participant]) {
    for participant in staged {
        if let Err(e) = participant.core.rollback_stage().await {
            warn!(key = %participant.core.key, error = %e, "rollback write failed, heals on next load");
        }
    }
}

/// A record after the readTx rule has been applied.
#[derive(Debug)]
pub(crate) struct ResolvedRecord {
    pub data: Value,
    pub meta: RecordMeta,
    pub version: u64,
    /// Whether staged state was collapsed (the caller should persist).
    pub collapsed: bool,
}

/// The readTx rule, applied to every loaded record: an unstaged record is
/// its own truth; a staged one resolves through the ledger: committed
/// applies the patch, anything else (absent, `false`) falls back to
/// `committedData`.
pub(crate) async fn resolve_staged(
    ctx: &Arc<StoreContext>,
    assembled: AssembledRecord,
) -> Result<ResolvedRecord, StoreError> {
    let AssembledRecord { stored, data, version } = assembled;
    let mut meta = stored.meta;

    let Some(tx_id) = meta.active_tx_id.clone() else {
        return Ok(ResolvedRecord { data, meta, version, collapsed: false });
    };

    let committed_data = meta
        .committed_data
        .take()
        .ok_or_else(|| StoreError::corrupt("staged record has no committedData"))?;
    let tx_patch = meta
        .tx_patch
        .take()
        .ok_or_else(|| StoreError::corrupt("staged record has no txPatch"))?;

    let committed = ledger_committed(ctx, &tx_id).await?;
    let data = if committed {
        patch::apply(&committed_data, &tx_patch)
            .map_err(|e| StoreError::corrupt(format!("staged patch does not apply: {e}")))?
    } else {
        committed_data
    };
    meta.clear_staging();
    debug!(tx_id = %tx_id, committed, "resolved staged transaction state");
    Ok(ResolvedRecord { data, meta, version, collapsed: true })
}

async fn ledger_committed(ctx: &Arc<StoreContext>, tx_id: &str) -> Result<bool, StoreError> {
    let ledger_id = ctx.ledger_id(tx_id);
    let doc = retry_backend("ledger_read", ctx.retry(), &ctx.cancel, || {
        ctx.docs.read(&ledger_id)
    })
    .await?;
    Ok(match doc {
        Some(doc) => serde_json::from_slice::<bool>(&doc.bytes).unwrap_or(false),
        None => false,
    })
}
