// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory backends.
//!
//! [`MemoryDocStore`] and [`MemoryLeaseMap`] implement the backend traits
//! over process-local maps. They are the reference implementation for the
//! engine's test suites and for hosts that want a store without external
//! services; real deployments implement [`DocStore`]/[`LeaseMap`] over
//! their platform's primitives.
//!
//! Both accept a shared [`FaultPlan`] so tests can inject classified
//! failures at precise call counts.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;

use super::traits::{DocStore, Document, LeaseMap, Precondition};
use crate::error::BackendError;

/// Precise failure injection shared by the in-memory backends.
///
/// Call numbers are 1-indexed and counted across all operations on the
/// backend the plan is attached to.
#[derive(Debug, Default)]
pub struct FaultPlan {
    call_count: AtomicU64,
    fail_calls: RwLock<HashSet<u64>>,
    always: RwLock<Option<BackendError>>,
}

impl FaultPlan {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Inject a transient failure on each listed call number.
    pub fn fail_on_calls(&self, calls: impl IntoIterator<Item = u64>) {
        self.fail_calls.write().extend(calls);
    }

    /// Fail every subsequent call with `err` (e.g. to simulate a dead
    /// backend). Cleared with [`FaultPlan::heal`].
    pub fn fail_always(&self, err: BackendError) {
        *self.always.write() = Some(err);
    }

    /// Stop failing.
    pub fn heal(&self) {
        *self.always.write() = None;
        self.fail_calls.write().clear();
    }

    /// Calls observed so far.
    pub fn calls(&self) -> u64 {
        self.call_count.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), BackendError> {
        let n = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(err) = self.always.read().clone() {
            return Err(err);
        }
        if self.fail_calls.read().contains(&n) {
            return Err(BackendError::Transient(format!("injected fault on call {n}")));
        }
        Ok(())
    }
}

/// In-memory [`DocStore`] with versioned compare-and-set documents.
pub struct MemoryDocStore {
    docs: DashMap<String, Document>,
    faults: Arc<FaultPlan>,
}

impl MemoryDocStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_faults(FaultPlan::new())
    }

    #[must_use]
    pub fn with_faults(faults: Arc<FaultPlan>) -> Self {
        Self { docs: DashMap::new(), faults }
    }

    /// All stored ids, for orphan-accounting assertions.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.docs.iter().map(|e| e.key().clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Direct read bypassing fault injection, for test assertions.
    #[must_use]
    pub fn peek_raw(&self, id: &str) -> Option<Document> {
        self.docs.get(id).map(|e| e.value().clone())
    }

    /// Direct write bypassing fault injection and CAS, for seeding tests.
    pub fn put_raw(&self, id: &str, bytes: Vec<u8>) {
        let version = self.docs.get(id).map_or(0, |d| d.version) + 1;
        self.docs.insert(id.to_string(), Document { version, bytes });
    }

    /// Direct delete bypassing fault injection, for seeding tests.
    pub fn remove_raw(&self, id: &str) {
        self.docs.remove(id);
    }
}

impl Default for MemoryDocStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocStore for MemoryDocStore {
    async fn read(&self, id: &str) -> Result<Option<Document>, BackendError> {
        self.faults.check()?;
        Ok(self.docs.get(id).map(|e| e.value().clone()))
    }

    async fn write(
        &self,
        id: &str,
        pre: Precondition,
        bytes: Vec<u8>,
    ) -> Result<u64, BackendError> {
        self.faults.check()?;
        // The entry reference holds the shard lock, making the CAS atomic.
        let entry = self.docs.entry(id.to_string());
        match (pre, entry) {
            (Precondition::Absent, Entry::Occupied(_)) => {
                Err(BackendError::Conflict(id.to_string()))
            }
            (Precondition::Version(_), Entry::Vacant(_)) => {
                Err(BackendError::Conflict(id.to_string()))
            }
            (Precondition::Version(v), Entry::Occupied(mut occ)) => {
                if occ.get().version != v {
                    return Err(BackendError::Conflict(id.to_string()));
                }
                let next = v + 1;
                occ.insert(Document { version: next, bytes });
                Ok(next)
            }
            (_, Entry::Occupied(mut occ)) => {
                let next = occ.get().version + 1;
                occ.insert(Document { version: next, bytes });
                Ok(next)
            }
            (_, Entry::Vacant(vac)) => {
                vac.insert(Document { version: 1, bytes });
                Ok(1)
            }
        }
    }

    async fn remove(&self, id: &str, pre: Precondition) -> Result<(), BackendError> {
        self.faults.check()?;
        match pre {
            Precondition::Any => {
                self.docs.remove(id);
                Ok(())
            }
            Precondition::Absent => match self.docs.contains_key(id) {
                true => Err(BackendError::Conflict(id.to_string())),
                false => Ok(()),
            },
            Precondition::Version(v) => {
                match self.docs.remove_if(id, |_, doc| doc.version == v) {
                    Some(_) => Ok(()),
                    None => Err(BackendError::Conflict(id.to_string())),
                }
            }
        }
    }
}

struct LeaseEntry {
    holder: String,
    expires_at: Instant,
}

/// In-memory [`LeaseMap`] with lazy TTL expiry.
///
/// Expiry uses the tokio clock, so tests under `start_paused` can advance
/// time deterministically.
pub struct MemoryLeaseMap {
    entries: Mutex<HashMap<String, LeaseEntry>>,
    faults: Arc<FaultPlan>,
}

impl MemoryLeaseMap {
    #[must_use]
    pub fn new() -> Self {
        Self::with_faults(FaultPlan::new())
    }

    #[must_use]
    pub fn with_faults(faults: Arc<FaultPlan>) -> Self {
        Self { entries: Mutex::new(HashMap::new()), faults }
    }

    /// Drop a lease regardless of holder, simulating TTL expiry or an
    /// operator wipe. For tests.
    pub fn evict(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}

impl Default for MemoryLeaseMap {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaseMap for MemoryLeaseMap {
    async fn try_lease(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        self.faults.check()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let live = entries
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.holder.clone());
        match live {
            Some(other) if other != holder => Ok(false),
            _ => {
                if ttl.is_zero() {
                    entries.remove(key);
                } else {
                    entries.insert(
                        key.to_string(),
                        LeaseEntry { holder: holder.to_string(), expires_at: now + ttl },
                    );
                }
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, holder: &str) -> Result<(), BackendError> {
        self.faults.check()?;
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|e| e.holder == holder) {
            entries.remove(key);
        }
        Ok(())
    }

    async fn holder(&self, key: &str) -> Result<Option<String>, BackendError> {
        self.faults.check()?;
        let now = Instant::now();
        let entries = self.entries.lock();
        Ok(entries
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.holder.clone()))
    }
}
