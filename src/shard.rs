// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shard management: splitting oversized records across sibling documents
//! and garbage-collecting the shards a shrinking write leaves behind.
//!
//! A record whose inline encoding exceeds `max_doc_bytes` has its data
//! payload split into equal byte segments written to deterministic sibling
//! ids (`{primary}/shard/{index}`); the primary document then stores only
//! the manifest and metadata. Reads reassemble in manifest order and
//! verify the SHA-256 content hash.
//!
//! Write ordering: shards land first, the primary CAS is the visibility
//! point, and only then are dropped shard ids appended to the orphan queue
//! and deleted. An id stays queued until its delete succeeds.

use std::collections::HashSet;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::backend::{DocStore, Precondition};
use crate::codec::{self, StoredDoc};
use crate::error::{BackendError, StoreError};
use crate::record::ShardManifest;
use crate::resilience::{retry_backend, CancelToken, RetryPolicy};

/// Envelope headroom reserved per shard document so that segment bytes
/// plus the DocStore's own wrapping stay under the size cap.
const SHARD_HEADROOM: usize = 1024;

pub(crate) fn shard_id(primary_id: &str, index: usize) -> String {
    format!("{primary_id}/shard/{index}")
}

fn content_hash(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// A record read back from the DocStore, reassembled but not yet resolved
/// against the transaction ledger.
#[derive(Debug)]
pub(crate) struct AssembledRecord {
    pub stored: StoredDoc,
    /// The data payload: inline `data`, or the decoded shard concatenation.
    pub data: serde_json::Value,
    /// CAS version of the primary document.
    pub version: u64,
}

/// Read and reassemble the record at `primary_id`.
pub(crate) async fn read_record(
    docs: &Arc<dyn DocStore>,
    retry: &RetryPolicy,
    cancel: &CancelToken,
    primary_id: &str,
) -> Result<Option<AssembledRecord>, StoreError> {
    let Some(doc) = retry_backend("doc_read", retry, cancel, || docs.read(primary_id)).await?
    else {
        return Ok(None);
    };
    let version = doc.version;
    let stored = codec::decode_stored(&doc.bytes)?;

    let data = match (&stored.data, &stored.manifest) {
        (Some(data), None) => data.clone(),
        (None, Some(manifest)) => {
            let mut payload = Vec::with_capacity(manifest.total_size as usize);
            for id in &manifest.shard_ids {
                let shard = retry_backend("shard_read", retry, cancel, || docs.read(id))
                    .await?
                    .ok_or_else(|| {
                        StoreError::corrupt(format!("missing shard '{id}' of '{primary_id}'"))
                    })?;
                payload.extend_from_slice(&shard.bytes);
            }
            if payload.len() as u64 != manifest.total_size {
                return Err(StoreError::corrupt(format!(
                    "reassembled '{primary_id}' is {} bytes, manifest says {}",
                    payload.len(),
                    manifest.total_size
                )));
            }
            let actual = content_hash(&payload);
            if actual != manifest.content_hash {
                return Err(StoreError::corrupt(format!(
                    "content hash mismatch for '{primary_id}': expected {}, got {actual}",
                    manifest.content_hash
                )));
            }
            codec::decode_data(&payload)?
        }
        // decode_stored guarantees exactly one of the two is present.
        _ => unreachable!("decode_stored enforces envelope shape"),
    };

    Ok(Some(AssembledRecord { stored, data, version }))
}

/// Write `stored` at `primary_id`, sharding if its inline encoding exceeds
/// `max_doc_bytes`. Returns the new primary version and the shard ids the
/// written record references (`[primary_id]` when inline).
///
/// `prev_shard_ids` is the layout the previous durable write produced;
/// shards it references that the new layout does not are queued as orphans
/// and deleted best-effort.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn write_record(
    docs: &Arc<dyn DocStore>,
    retry: &RetryPolicy,
    cancel: &CancelToken,
    orphans: &OrphanQueue,
    primary_id: &str,
    stored: &StoredDoc,
    prev_shard_ids: &[String],
    expected: Precondition,
    max_doc_bytes: usize,
) -> Result<(u64, Vec<String>), StoreError> {
    let data = stored
        .data
        .as_ref()
        .ok_or_else(|| StoreError::corrupt("write_record requires an inline candidate"))?;

    let mut inline = stored.clone();
    inline.meta.shard_ids = vec![primary_id.to_string()];
    let inline_bytes = codec::encode_stored(&inline)?;
    crate::metrics::record_encoded_size(inline_bytes.len());

    let (primary_bytes, new_shard_ids, shard_writes) = if inline_bytes.len() <= max_doc_bytes {
        (inline_bytes, vec![primary_id.to_string()], Vec::new())
    } else {
        let payload = codec::encode_data(data)?;
        let budget = max_doc_bytes.saturating_sub(SHARD_HEADROOM).max(1);
        let count = payload.len().div_ceil(budget);
        let segment = payload.len().div_ceil(count);

        let mut shard_ids = Vec::with_capacity(count);
        let mut writes = Vec::with_capacity(count);
        for (index, chunk) in payload.chunks(segment).enumerate() {
            let id = shard_id(primary_id, index);
            shard_ids.push(id.clone());
            writes.push((id, chunk.to_vec()));
        }

        let mut sharded = stored.clone();
        sharded.data = None;
        sharded.manifest = Some(ShardManifest {
            shard_ids: shard_ids.clone(),
            total_size: payload.len() as u64,
            content_hash: content_hash(&payload),
        });
        sharded.meta.shard_ids = shard_ids.clone();
        (codec::encode_stored(&sharded)?, shard_ids, writes)
    };

    // Shards first: a reader must never find a manifest pointing at
    // documents that do not exist yet.
    for (id, bytes) in &shard_writes {
        retry_backend("shard_write", retry, cancel, || {
            docs.write(id, Precondition::Any, bytes.clone())
        })
        .await?;
    }

    let version = retry_backend("doc_write", retry, cancel, || {
        docs.write(primary_id, expected, primary_bytes.clone())
    })
    .await?;

    let live: HashSet<&String> = new_shard_ids.iter().collect();
    let dropped: Vec<String> = prev_shard_ids
        .iter()
        .filter(|id| !live.contains(id) && id.as_str() != primary_id)
        .cloned()
        .collect();
    if !dropped.is_empty() {
        debug!(primary = primary_id, count = dropped.len(), "shrinking write dropped shards");
        match orphans.enqueue(&dropped).await {
            Ok(()) => {
                if let Err(e) = orphans.sweep().await {
                    warn!(error = %e, "orphan sweep after write failed, ids remain queued");
                }
            }
            // Leaking the shard bytes is recoverable; deleting something a
            // still-live manifest references is not. Skip deletion.
            Err(e) => warn!(error = %e, "failed to queue orphaned shards"),
        }
    }

    Ok((version, new_shard_ids))
}

/// The persistent queue of shard documents awaiting deletion.
///
/// One queue document per store. Appends and removals are CAS
/// read-modify-write loops so concurrent processes sharing the store name
/// cannot drop each other's entries.
pub(crate) struct OrphanQueue {
    docs: Arc<dyn DocStore>,
    retry: RetryPolicy,
    cancel: CancelToken,
    queue_id: String,
}

impl OrphanQueue {
    const CAS_ATTEMPTS: usize = 8;

    pub fn new(
        docs: Arc<dyn DocStore>,
        retry: RetryPolicy,
        cancel: CancelToken,
        queue_id: String,
    ) -> Self {
        Self { docs, retry, cancel, queue_id }
    }

    async fn load(&self) -> Result<(Vec<String>, Option<u64>), BackendError> {
        let doc =
            retry_backend("orphans_read", &self.retry, &self.cancel, || self.docs.read(&self.queue_id))
                .await?;
        match doc {
            Some(doc) => {
                let ids: Vec<String> = serde_json::from_slice(&doc.bytes).unwrap_or_default();
                Ok((ids, Some(doc.version)))
            }
            None => Ok((Vec::new(), None)),
        }
    }

    async fn store(
        &self,
        ids: &[String],
        version: Option<u64>,
    ) -> Result<(), BackendError> {
        let bytes = serde_json::to_vec(ids).unwrap_or_else(|_| b"[]".to_vec());
        let pre = match version {
            Some(v) => Precondition::Version(v),
            None => Precondition::Absent,
        };
        retry_backend("orphans_write", &self.retry, &self.cancel, || {
            self.docs.write(&self.queue_id, pre, bytes.clone())
        })
        .await?;
        Ok(())
    }

    /// Number of queued ids.
    pub async fn len(&self) -> Result<usize, BackendError> {
        Ok(self.load().await?.0.len())
    }

    /// Append `ids` durably. Must succeed before the ids may be deleted.
    pub async fn enqueue(&self, ids: &[String]) -> Result<(), BackendError> {
        for _ in 0..Self::CAS_ATTEMPTS {
            let (mut queued, version) = self.load().await?;
            let known: HashSet<&String> = queued.iter().collect();
            let fresh: Vec<String> =
                ids.iter().filter(|id| !known.contains(*id)).cloned().collect();
            if fresh.is_empty() {
                return Ok(());
            }
            queued.extend(fresh);
            match self.store(&queued, version).await {
                Ok(()) => return Ok(()),
                Err(BackendError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(BackendError::Conflict(self.queue_id.clone()))
    }

    /// Attempt to delete every queued id, removing the ones that succeed.
    /// Returns the number deleted. Failed deletions stay queued.
    pub async fn sweep(&self) -> Result<usize, BackendError> {
        let (queued, _) = self.load().await?;
        if queued.is_empty() {
            return Ok(0);
        }

        let mut deleted = Vec::new();
        for id in &queued {
            let res = retry_backend("orphan_delete", &self.retry, &self.cancel, || {
                self.docs.remove(id, Precondition::Any)
            })
            .await;
            match res {
                Ok(()) => deleted.push(id.clone()),
                Err(e) => warn!(shard = %id, error = %e, "orphan deletion failed, will retry later"),
            }
        }
        if deleted.is_empty() {
            return Ok(0);
        }
        crate::metrics::record_orphans_deleted(deleted.len());

        let gone: HashSet<&String> = deleted.iter().collect();
        for _ in 0..Self::CAS_ATTEMPTS {
            let (current, version) = self.load().await?;
            let remaining: Vec<String> =
                current.iter().filter(|id| !gone.contains(*id)).cloned().collect();
            if remaining.len() == current.len() {
                break;
            }
            match self.store(&remaining, version).await {
                Ok(()) => break,
                Err(BackendError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(deleted.len())
    }
}
