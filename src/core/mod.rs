//! Replicated task-graph core.
//!
//! Layering, leaves first:
//! - identity: validated id atoms
//! - order: fractional position maps
//! - walker: visit-epoch traversal
//! - node / edge / timeline: data atoms
//! - state: the replicated `Data` document
//! - patch / diff: invertible JSON edits
//! - text: reversible text-patch seam
//! - graph: validated mutations and checks
//! - reduce: the pure action reducer

pub mod diff;
pub mod edge;
pub mod error;
pub mod graph;
pub mod identity;
pub mod node;
pub mod order;
pub mod patch;
pub mod reduce;
pub mod state;
pub mod text;
pub mod timeline;
pub mod walker;

pub use diff::{apply_patch, diff_values};
pub use edge::{Edge, EdgeKind, NewEdge};
pub use error::{CoreError, PatchError};
pub use graph::Graph;
pub use identity::{ClientId, EdgeId, NodeId, PatchSeq, SessionId, id_from_seq};
pub use node::{Node, Range, Status, TextPatch};
pub use patch::{OpKind, PatchKey, PatchOp, PatchRecord};
pub use reduce::{Action, ReduceCtx, ReduceOutcome, reduce};
pub use state::{CoveyQuadrants, DATA_VERSION, Data, Quadrant, Timeline};
pub use text::{ReplaceCodec, TextCodec};
pub use timeline::{ShowChildren, TimeId, TimeNode, TimeScale};
pub use walker::Walker;
