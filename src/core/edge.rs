//! Directed edges between task nodes.

use serde::{Deserialize, Serialize};

use super::identity::NodeId;

/// Strong edges are blocking dependencies; the strong subgraph must stay
/// acyclic and drives completability. Weak edges are non-blocking
/// associations (outline ordering and the like).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    Weak,
    Strong,
}

impl EdgeKind {
    pub fn is_strong(self) -> bool {
        matches!(self, EdgeKind::Strong)
    }
}

/// Requested edge in an `AddEdges` batch, before an id is minted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewEdge {
    pub parent: NodeId,
    pub child: NodeId,
    pub kind: EdgeKind,
    #[serde(default)]
    pub hidden: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub parent: NodeId,
    pub child: NodeId,
    pub kind: EdgeKind,
    /// Presentation-only visibility toggle. Traversals (cycle checks,
    /// aggregates, deletability) still cross hidden edges.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hidden: bool,
}
