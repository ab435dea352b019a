#![forbid(unsafe_code)]

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod history;
pub mod migrate;
pub mod predict;
pub mod sync;
pub mod telemetry;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export core types at crate root for convenience
pub use crate::core::{
    Action, ClientId, Data, Edge, EdgeId, EdgeKind, NewEdge, Node, NodeId, PatchKey, PatchOp,
    PatchRecord, PatchSeq, Range, SessionId, Status, TimeId, TimeNode, TimeScale,
};
pub use crate::engine::{DispatchOutcome, Engine};
pub use crate::sync::{ConflictChoice, Remote, SyncEvent, Synchronizer};
