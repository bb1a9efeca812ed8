// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the store and its backends.
//!
//! [`BackendError`] classifies DocStore/LeaseMap failures for the retry
//! layer; [`StoreError`] is the public taxonomy surfaced by every store
//! operation. Transform-level aborts are not errors: an update or
//! transaction whose transform returns `false` resolves `Ok(false)`.

use thiserror::Error;

/// A failure from a DocStore or LeaseMap call, classified for retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Throttling, timeout, transient network. Retried with backoff.
    #[error("transient backend error: {0}")]
    Transient(String),
    /// Request-budget exhaustion. Retried, but never counted as progress.
    #[error("request budget exceeded: {0}")]
    BudgetExceeded(String),
    /// Malformed request, permission, corruption. Surfaced immediately.
    #[error("terminal backend error: {0}")]
    Terminal(String),
    /// Compare-and-set precondition failed. The caller must re-read.
    #[error("compare-and-set conflict on '{0}'")]
    Conflict(String),
    /// The operation was cancelled before it could be attempted.
    #[error("operation cancelled")]
    Cancelled,
}

impl BackendError {
    /// Whether the retry wrapper may try again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::BudgetExceeded(_))
    }

    /// Whether a failed attempt consumes retry budget. Budget-style errors
    /// are waited out without counting toward the attempt limit.
    #[must_use]
    pub fn counts_as_attempt(&self) -> bool {
        !matches!(self, Self::BudgetExceeded(_))
    }
}

/// Public error taxonomy of the store.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Operation on a key before `load` resolved (or after unload).
    #[error("key '{0}' is not loaded")]
    KeyNotLoaded(String),

    /// Operation submitted after `close` began.
    #[error("store is closed")]
    StoreClosed,

    /// The session's lease was lost mid-flight; the session is terminal.
    #[error("lock for key '{0}' was lost")]
    LockLost(String),

    /// Another process holds the lease and the acquire deadline elapsed.
    #[error("lock for key '{0}' is held by another process")]
    LockUnavailable(String),

    /// The schema predicate rejected the candidate data.
    #[error("schema validation failed: {reason}")]
    SchemaFailed { reason: String },

    /// A transform blocked past its synchronous budget.
    #[error("transform blocked the scheduler for {elapsed_ms} ms")]
    UpdateYielded { elapsed_ms: u64 },

    /// A transaction transform added or removed keys from its state map.
    #[error("transaction transform changed its key set")]
    KeysChangedInTransaction,

    /// Envelope decode, shard hash, or patch application failed.
    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    /// The record has applied a migration this store does not know about.
    #[error("record applied unknown migration '{0}'")]
    UnknownMigration(String),

    /// A configured migration step returned an error (or panicked).
    #[error("migration step '{step}' failed: {detail}")]
    MigrationFailed { step: String, detail: String },

    /// The `import_legacy_data` hook failed.
    #[error("legacy import failed: {0}")]
    ImportFailed(String),

    /// A classified backend failure that survived the retry layer.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl StoreError {
    /// Corrupt-record constructor used across codec, shard, and patch code.
    pub(crate) fn corrupt(detail: impl Into<String>) -> Self {
        Self::CorruptRecord(detail.into())
    }
}
