//! Patch atoms: the wire-shaped edit ops, chain keys, and the full local
//! record.
//!
//! One representation serves persistence, sync, undo/redo and migration: an
//! ordered list of `{op, path, value}` edits plus the exact reverse list.
//! Only forward ops go over the wire; reverse ops stay local.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::identity::{ClientId, PatchSeq, SessionId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Add,
    Remove,
    Replace,
}

/// One edit. `path` is a `/`-joined pointer into the serialized `Data`
/// document; segments never contain `/` (ids are base-36, field names are
/// fixed).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PatchOp {
    pub op: OpKind,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl PatchOp {
    pub fn add(path: impl Into<String>, value: Value) -> Self {
        Self {
            op: OpKind::Add,
            path: path.into(),
            value: Some(value),
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self {
            op: OpKind::Remove,
            path: path.into(),
            value: None,
        }
    }

    pub fn replace(path: impl Into<String>, value: Value) -> Self {
        Self {
            op: OpKind::Replace,
            path: path.into(),
            value: Some(value),
        }
    }
}

/// A point in a session's patch chain; the unit of optimistic concurrency.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PatchKey {
    pub client_id: ClientId,
    pub session_id: SessionId,
    pub patch_id: PatchSeq,
}

impl PatchKey {
    pub fn new(client_id: ClientId, session_id: SessionId, patch_id: PatchSeq) -> Self {
        Self {
            client_id,
            session_id,
            patch_id,
        }
    }
}

/// A stored patch: key, causal parent, both directions, timestamp.
///
/// A chain root points at itself; every other patch has exactly one parent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PatchRecord {
    pub key: PatchKey,
    pub parent: PatchKey,
    pub forward: Vec<PatchOp>,
    pub reverse: Vec<PatchOp>,
    pub created_at: u64,
}

impl PatchRecord {
    pub fn is_chain_root(&self) -> bool {
        self.key == self.parent
    }
}
