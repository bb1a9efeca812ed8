// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Structural JSON diffing and patching.
//!
//! [`diff`] produces a minimal ordered list of `add`/`remove`/`replace`
//! operations sufficient to rebuild `b` from `a`; [`apply`] replays such a
//! list. Paths are JSON pointers (`""` is the document root, `/foo/0` an
//! array index, `~0`/`~1` escape `~` and `/` in map keys).
//!
//! Determinism: operations are emitted in document order, depth first, with
//! map keys visited in sorted order, so identical inputs always serialize
//! to byte-identical patches. Within an array, trailing removals are
//! emitted from the highest index down so the patch applies cleanly.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A single patch operation, serialized in RFC 6902 shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
}

impl PatchOp {
    fn path(&self) -> &str {
        match self {
            Self::Add { path, .. } | Self::Remove { path } | Self::Replace { path, .. } => path,
        }
    }
}

/// An ordered sequence of [`PatchOp`]s.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Patch(pub Vec<PatchOp>);

impl Patch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// A patch that does not apply to its base document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("path '{0}' not found")]
    PathNotFound(String),
    #[error("invalid pointer '{0}'")]
    InvalidPointer(String),
    #[error("cannot remove the document root")]
    RemoveRoot,
}

fn escape(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

fn unescape(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}

/// Compute the patch transforming `a` into `b`.
#[must_use]
pub fn diff(a: &Value, b: &Value) -> Patch {
    let mut ops = Vec::new();
    diff_at("", a, b, &mut ops);
    Patch(ops)
}

fn diff_at(path: &str, a: &Value, b: &Value, ops: &mut Vec<PatchOp>) {
    match (a, b) {
        _ if a == b => {}
        (Value::Object(ma), Value::Object(mb)) => {
            // serde_json maps iterate in sorted key order; walk the sorted
            // union so emission order is fully determined by the inputs.
            let mut keys: Vec<&String> = ma.keys().chain(mb.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                let child = format!("{path}/{}", escape(key));
                match (ma.get(key), mb.get(key)) {
                    (Some(va), Some(vb)) => diff_at(&child, va, vb, ops),
                    (Some(_), None) => ops.push(PatchOp::Remove { path: child }),
                    (None, Some(vb)) => {
                        ops.push(PatchOp::Add { path: child, value: vb.clone() });
                    }
                    (None, None) => unreachable!("key came from one of the maps"),
                }
            }
        }
        (Value::Array(va), Value::Array(vb)) => {
            let common = va.len().min(vb.len());
            for i in 0..common {
                diff_at(&format!("{path}/{i}"), &va[i], &vb[i], ops);
            }
            for (i, item) in vb.iter().enumerate().skip(common) {
                ops.push(PatchOp::Add { path: format!("{path}/{i}"), value: item.clone() });
            }
            // Highest index first, so earlier removals don't shift later ones.
            for i in (common..va.len()).rev() {
                ops.push(PatchOp::Remove { path: format!("{path}/{i}") });
            }
        }
        _ => ops.push(PatchOp::Replace { path: path.to_string(), value: b.clone() }),
    }
}

/// Apply `patch` to `base`, returning the patched document.
pub fn apply(base: &Value, patch: &Patch) -> Result<Value, PatchError> {
    let mut doc = base.clone();
    for op in &patch.0 {
        apply_op(&mut doc, op)?;
    }
    Ok(doc)
}

fn apply_op(doc: &mut Value, op: &PatchOp) -> Result<(), PatchError> {
    let path = op.path();
    if path.is_empty() {
        return match op {
            PatchOp::Add { value, .. } | PatchOp::Replace { value, .. } => {
                *doc = value.clone();
                Ok(())
            }
            PatchOp::Remove { .. } => Err(PatchError::RemoveRoot),
        };
    }
    if !path.starts_with('/') {
        return Err(PatchError::InvalidPointer(path.to_string()));
    }

    let segments: Vec<String> = path.split('/').skip(1).map(|s| unescape(s)).collect();
    let Some((leaf, parents)) = segments.split_last() else {
        return Err(PatchError::InvalidPointer(path.to_string()));
    };

    let mut target = &mut *doc;
    for seg in parents {
        target = descend(target, seg).ok_or_else(|| PatchError::PathNotFound(path.to_string()))?;
    }

    match (op, target) {
        (PatchOp::Add { value, .. }, Value::Object(map)) => {
            map.insert(leaf.clone(), value.clone());
            Ok(())
        }
        (PatchOp::Add { value, .. }, Value::Array(arr)) => {
            let idx = parse_index(leaf, path)?;
            if idx > arr.len() {
                return Err(PatchError::PathNotFound(path.to_string()));
            }
            arr.insert(idx, value.clone());
            Ok(())
        }
        (PatchOp::Replace { value, .. }, Value::Object(map)) => match map.get_mut(leaf) {
            Some(slot) => {
                *slot = value.clone();
                Ok(())
            }
            None => Err(PatchError::PathNotFound(path.to_string())),
        },
        (PatchOp::Replace { value, .. }, Value::Array(arr)) => {
            let idx = parse_index(leaf, path)?;
            match arr.get_mut(idx) {
                Some(slot) => {
                    *slot = value.clone();
                    Ok(())
                }
                None => Err(PatchError::PathNotFound(path.to_string())),
            }
        }
        (PatchOp::Remove { .. }, Value::Object(map)) => match map.remove(leaf) {
            Some(_) => Ok(()),
            None => Err(PatchError::PathNotFound(path.to_string())),
        },
        (PatchOp::Remove { .. }, Value::Array(arr)) => {
            let idx = parse_index(leaf, path)?;
            if idx >= arr.len() {
                return Err(PatchError::PathNotFound(path.to_string()));
            }
            arr.remove(idx);
            Ok(())
        }
        _ => Err(PatchError::PathNotFound(path.to_string())),
    }
}

fn descend<'a>(value: &'a mut Value, segment: &str) -> Option<&'a mut Value> {
    match value {
        Value::Object(map) => map.get_mut(segment),
        Value::Array(arr) => {
            let idx: usize = segment.parse().ok()?;
            arr.get_mut(idx)
        }
        _ => None,
    }
}

fn parse_index(segment: &str, path: &str) -> Result<usize, PatchError> {
    if segment != "0" && segment.starts_with('0') {
        return Err(PatchError::InvalidPointer(path.to_string()));
    }
    segment.parse().map_err(|_| PatchError::InvalidPointer(path.to_string()))
}
