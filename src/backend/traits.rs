// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The two external services the engine is built on.
//!
//! [`DocStore`] is a key/value document store with per-document atomic
//! compare-and-set; [`LeaseMap`] is a best-effort shared hash map with TTL
//! entries used for cross-process coordination. Both are expected to throw
//! transient errors under throttling; callers wrap every call in
//! [`retry_backend`](crate::resilience::retry_backend).

use async_trait::async_trait;
use std::time::Duration;

use crate::error::BackendError;

/// A stored document: opaque bytes plus the version used for CAS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Monotonic per-document version, bumped on every successful write.
    pub version: u64,
    pub bytes: Vec<u8>,
}

/// Write precondition for [`DocStore::write`] and [`DocStore::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// Unconditional upsert.
    Any,
    /// The document must not exist.
    Absent,
    /// The document must exist at exactly this version.
    Version(u64),
}

/// Key/value document store with per-key atomic compare-and-set.
#[async_trait]
pub trait DocStore: Send + Sync {
    /// Read a document. `Ok(None)` means the id does not exist.
    async fn read(&self, id: &str) -> Result<Option<Document>, BackendError>;

    /// Write a document subject to `pre`. Returns the new version.
    ///
    /// A failed precondition yields [`BackendError::Conflict`].
    async fn write(
        &self,
        id: &str,
        pre: Precondition,
        bytes: Vec<u8>,
    ) -> Result<u64, BackendError>;

    /// Delete a document subject to `pre`. Deleting an absent document
    /// under [`Precondition::Any`] is not an error.
    async fn remove(&self, id: &str, pre: Precondition) -> Result<(), BackendError>;
}

/// Lease-based shared hash map for cross-process coordination.
///
/// Entries expire after their TTL; the update primitive is atomic
/// "set-if-absent-or-mine".
#[async_trait]
pub trait LeaseMap: Send + Sync {
    /// If `key` is absent (or expired) or already held by `holder`,
    /// (re)set it to `holder` with the given TTL and return `true`.
    /// If another holder owns a live lease, return `false`.
    async fn try_lease(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, BackendError>;

    /// Clear the lease if (and only if) `holder` owns it. Idempotent.
    async fn release(&self, key: &str, holder: &str) -> Result<(), BackendError>;

    /// Current live holder of `key`, if any.
    async fn holder(&self, key: &str) -> Result<Option<String>, BackendError>;
}
