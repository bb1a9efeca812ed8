// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document codec: the stored envelope and its byte representation.
//!
//! Records are encoded as UTF-8 JSON inside the DocStore's binary blob.
//! The envelope is [`StoredDoc`]: inline records carry `data` directly;
//! sharded records carry a `manifest` and the data bytes live in sibling
//! shard documents. Envelope-shape mismatches decode to
//! [`StoreError::CorruptRecord`]; the data payload itself is validated
//! separately by the store's schema predicate.
//!
//! The payload is tree-shaped JSON by construction (`serde_json::Value`
//! cannot express cycles), so no cycle check is needed at this layer.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;
use crate::record::{LogicalRecord, RecordMeta, ShardManifest};

/// The serialized form of a primary document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredDoc {
    /// Inline data payload. Present exactly when `manifest` is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Shard manifest. Present exactly when the record is sharded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<ShardManifest>,

    pub meta: RecordMeta,
}

impl StoredDoc {
    /// An inline (unsharded) document for `record`.
    pub fn inline(record: &LogicalRecord) -> Self {
        Self {
            data: Some(record.data.clone()),
            manifest: None,
            meta: record.meta.clone(),
        }
    }
}

/// Encode an envelope to bytes.
pub fn encode_stored(doc: &StoredDoc) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(doc).map_err(|e| StoreError::corrupt(format!("encode failed: {e}")))
}

/// Decode an envelope, enforcing its structural invariants.
pub fn decode_stored(bytes: &[u8]) -> Result<StoredDoc, StoreError> {
    let doc: StoredDoc = serde_json::from_slice(bytes)
        .map_err(|e| StoreError::corrupt(format!("envelope decode failed: {e}")))?;
    match (&doc.data, &doc.manifest) {
        (Some(_), Some(_)) => Err(StoreError::corrupt("envelope has both data and manifest")),
        (None, None) => Err(StoreError::corrupt("envelope has neither data nor manifest")),
        _ => Ok(doc),
    }
}

/// Encode a data payload on its own, as stored in shard documents.
pub(crate) fn encode_data(data: &Value) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(data).map_err(|e| StoreError::corrupt(format!("encode failed: {e}")))
}

/// Decode a reassembled data payload.
pub(crate) fn decode_data(bytes: &[u8]) -> Result<Value, StoreError> {
    serde_json::from_slice(bytes)
        .map_err(|e| StoreError::corrupt(format!("payload decode failed: {e}")))
}

/// Encoded size of `record` as an inline document, in bytes. This is the
/// number compared against `max_doc_bytes` when deciding whether to shard.
pub fn encoded_size(record: &LogicalRecord) -> Result<usize, StoreError> {
    Ok(encode_stored(&StoredDoc::inline(record))?.len())
}
