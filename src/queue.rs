// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-session operation queue.
//!
//! Each session owns a FIFO of operations drained by its worker task.
//! Updates may bypass the queue (the fast path) only while no transaction
//! item is queued or holding the session: transaction participation flips
//! a blocker count at enqueue time and holds it until the coordinator
//! drops its [`SlotPermit`], which also resumes the worker.
//!
//! Saves, transaction participation, and unloads are always queued.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::StoreError;

/// A synchronous update transform: mutates the (copied) data in place and
/// returns whether to commit.
pub(crate) type UpdateFn = Box<dyn FnOnce(&mut Value) -> bool + Send>;

/// One queued operation.
pub(crate) enum Op {
    Update { transform: UpdateFn, reply: oneshot::Sender<Result<bool, StoreError>> },
    /// `reply` is `None` for autosave ticks, which nobody awaits.
    Save { reply: Option<oneshot::Sender<Result<(), StoreError>>> },
    /// Grant the coordinator exclusive use of the session until the permit
    /// drops. The blocker was incremented at enqueue.
    TxSlot { grant: oneshot::Sender<SlotPermit>, blocker: BlockerGuard },
    Unload { reply: oneshot::Sender<Result<(), StoreError>> },
}

/// Decrements the fast-path blocker count when dropped.
pub(crate) struct BlockerGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for BlockerGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Held by the transaction coordinator for the duration of a transaction.
/// Dropping it releases the fast path and resumes the session worker.
pub(crate) struct SlotPermit {
    _blocker: BlockerGuard,
    _release: oneshot::Sender<()>,
}

/// Sending half of a session's queue, plus the fast-path gate.
pub(crate) struct OpQueue {
    ops: mpsc::UnboundedSender<Op>,
    tx_blockers: Arc<AtomicUsize>,
}

impl OpQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Op>) {
        let (ops, rx) = mpsc::unbounded_channel();
        (Self { ops, tx_blockers: Arc::new(AtomicUsize::new(0)) }, rx)
    }

    /// Whether an update may run immediately instead of queueing: true
    /// only while no transaction item is queued or holding this session.
    pub fn fast_path_open(&self) -> bool {
        self.tx_blockers.load(Ordering::SeqCst) == 0
    }

    /// Enqueue an operation. Fails once the session worker has exited.
    pub fn submit(&self, op: Op, key: &str) -> Result<(), StoreError> {
        self.ops.send(op).map_err(|_| StoreError::KeyNotLoaded(key.to_string()))
    }

    /// Enqueue a transaction-participation item. The fast path closes
    /// immediately; the returned receiver resolves with the slot permit
    /// when the worker reaches the item.
    pub fn request_tx_slot(
        &self,
        key: &str,
    ) -> Result<oneshot::Receiver<SlotPermit>, StoreError> {
        let (grant, granted) = oneshot::channel();
        self.tx_blockers.fetch_add(1, Ordering::SeqCst);
        let blocker = BlockerGuard { counter: self.tx_blockers.clone() };
        self.submit(Op::TxSlot { grant, blocker }, key)?;
        Ok(granted)
    }
}

/// Worker-side handling of a granted slot: sends the permit and waits for
/// the coordinator to drop it before the queue continues.
pub(crate) async fn serve_tx_slot(grant: oneshot::Sender<SlotPermit>, blocker: BlockerGuard) {
    let (release, released) = oneshot::channel();
    let permit = SlotPermit { _blocker: blocker, _release: release };
    if grant.send(permit).is_ok() {
        // Resolves (with an error) when the permit's sender drops.
        let _ = released.await;
    }
    // Grant refused: the coordinator gave up; the permit (and blocker)
    // dropped with it.
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fast_path_open_by_default() {
        let (queue, _rx) = OpQueue::channel();
        assert!(queue.fast_path_open());
    }

    #[tokio::test]
    async fn tx_request_closes_fast_path_until_permit_drops() {
        let (queue, mut rx) = OpQueue::channel();
        let granted = queue.request_tx_slot("k").unwrap();
        assert!(!queue.fast_path_open());

        let worker = tokio::spawn(async move {
            match rx.recv().await {
                Some(Op::TxSlot { grant, blocker }) => serve_tx_slot(grant, blocker).await,
                _ => panic!("expected a tx slot item"),
            }
        });

        let permit = granted.await.unwrap();
        assert!(!queue.fast_path_open(), "fast path stays closed while the slot is held");

        drop(permit);
        worker.await.unwrap();
        assert!(queue.fast_path_open());
    }

    #[tokio::test]
    async fn abandoned_grant_reopens_fast_path() {
        let (queue, mut rx) = OpQueue::channel();
        let granted = queue.request_tx_slot("k").unwrap();
        drop(granted);

        match rx.recv().await {
            Some(Op::TxSlot { grant, blocker }) => serve_tx_slot(grant, blocker).await,
            _ => panic!("expected a tx slot item"),
        }
        assert!(queue.fast_path_open());
    }

    #[tokio::test]
    async fn submit_after_worker_exit_fails() {
        let (queue, rx) = OpQueue::channel();
        drop(rx);
        let (reply, _) = oneshot::channel();
        let err = queue.submit(Op::Save { reply: Some(reply) }, "player-1").unwrap_err();
        assert!(matches!(err, StoreError::KeyNotLoaded(k) if k == "player-1"));
    }

    #[tokio::test]
    async fn concurrent_tx_requests_stack_blockers() {
        let (queue, _rx) = OpQueue::channel();
        let _a = queue.request_tx_slot("k").unwrap();
        let _b = queue.request_tx_slot("k").unwrap();
        assert_eq!(queue.tx_blockers.load(Ordering::SeqCst), 2);
        assert!(!queue.fast_path_open());
    }
}
