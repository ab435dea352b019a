//! Core validation errors.
//!
//! Every graph mutation validates before touching state; a `CoreError` means
//! the state is unchanged. These surface to the operator as non-fatal
//! notices, so messages are written for humans.

use thiserror::Error;

use crate::error::Transience;

use super::identity::{EdgeId, NodeId};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CoreError {
    #[error("invalid id {raw:?}: {reason}")]
    InvalidId { raw: String, reason: String },

    #[error("node {0} does not exist")]
    MissingNode(NodeId),

    #[error("edge {0} does not exist")]
    MissingEdge(EdgeId),

    #[error("no strong child can be added to non-todo parent {0}")]
    NotTodo(NodeId),

    #[error("the root node cannot be a child")]
    RootAsChild,

    #[error("the root node cannot be deleted")]
    RootDeletion,

    #[error("an edge {parent} -> {child} already exists")]
    DuplicateEdge { parent: NodeId, child: NodeId },

    #[error("edge {parent} -> {child} would close a cycle")]
    CycleDetected { parent: NodeId, child: NodeId },

    #[error("node {0} is not deletable")]
    NotDeletableNode(NodeId),

    #[error("edge {0} is not deletable")]
    NotDeletableEdge(EdgeId),

    #[error("node {0} cannot leave todo: a strong child is still todo")]
    NotCompletable(NodeId),

    #[error("node {0} cannot return to todo: no strong parent is still todo")]
    NotUncompletable(NodeId),

    #[error("non-todo node {0} cannot be {1}")]
    NotTodoFor(NodeId, &'static str),

    #[error("invalid estimate {value} for node {node}")]
    InvalidEstimate { node: NodeId, value: f64 },

    #[error("range {index} of node {node}: {reason}")]
    InvalidRange {
        node: NodeId,
        index: usize,
        reason: String,
    },

    #[error("text patch for node {node} does not apply: {reason}")]
    TextPatch { node: NodeId, reason: String },
}

impl CoreError {
    pub fn transience(&self) -> Transience {
        // Validation failures never succeed on retry with the same inputs.
        Transience::Permanent
    }
}

/// Patch application errors: a forward or reverse op did not fit the
/// document it was applied to.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PatchError {
    #[error("empty path segment in {path:?}")]
    BadPath { path: String },

    #[error("path {path:?} does not resolve")]
    MissingTarget { path: String },

    #[error("path {path:?} expects an array index, got {segment:?}")]
    BadIndex { path: String, segment: String },

    #[error("array index {index} out of range at {path:?} (len {len})")]
    IndexOutOfRange {
        path: String,
        index: usize,
        len: usize,
    },

    #[error("add at {path:?} requires a value")]
    MissingValue { path: String },
}
