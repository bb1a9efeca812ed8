// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The logical record: the unit of data a session manages for one key.
//!
//! A record is `{ data, meta }`. `data` is an arbitrary JSON tree validated
//! by the store's schema predicate. `meta` carries the migration history,
//! the shard layout, and, while a multi-key transaction is in flight,
//! the staged write-ahead state (`active_tx_id`, `committed_data`,
//! `tx_patch`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::patch::Patch;

/// Durable metadata stored alongside `data` in the primary document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMeta {
    /// Names of migration steps already applied, in configured order.
    #[serde(default)]
    pub applied_migrations: Vec<String>,

    /// DocStore ids that together store `data`. Length 1 (the primary id)
    /// for unsharded records.
    #[serde(default)]
    pub shard_ids: Vec<String>,

    /// Transaction currently staged from this key, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_tx_id: Option<String>,

    /// Last durable snapshot of `data` from before `active_tx_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed_data: Option<Value>,

    /// Patch that turns `committed_data` into the post-transaction state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_patch: Option<Patch>,
}

impl RecordMeta {
    /// Whether this record has transaction state staged.
    #[must_use]
    pub fn is_staged(&self) -> bool {
        self.active_tx_id.is_some()
    }

    /// Drop any staged transaction state.
    pub fn clear_staging(&mut self) {
        self.active_tx_id = None;
        self.committed_data = None;
        self.tx_patch = None;
    }
}

/// A fully-assembled record as held in memory by a session.
#[derive(Debug, Clone, PartialEq)]
pub struct LogicalRecord {
    pub data: Value,
    pub meta: RecordMeta,
}

impl LogicalRecord {
    /// A freshly-created record carrying the given data, unsharded and
    /// unstaged.
    #[must_use]
    pub fn new(data: Value, applied_migrations: Vec<String>, primary_id: &str) -> Self {
        Self {
            data,
            meta: RecordMeta {
                applied_migrations,
                shard_ids: vec![primary_id.to_string()],
                ..RecordMeta::default()
            },
        }
    }
}

/// Shard manifest held in the primary document of a sharded record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardManifest {
    /// Sibling document ids, in concatenation order.
    pub shard_ids: Vec<String>,
    /// Byte length of the reassembled payload.
    pub total_size: u64,
    /// Hex SHA-256 of the reassembled payload.
    pub content_hash: String,
}
