//! The replicated document.
//!
//! `Data` is everything that replicates between sessions: the node/edge
//! graph, the global queue, calendar buckets, quadrant and pin lists, the id
//! allocator, and the schema version. Anything derived (projected text,
//! tracked-time totals, predictions) lives outside and is rebuilt, never
//! synced.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::edge::Edge;
use super::identity::{EdgeId, NodeId};
use super::node::Node;
use super::timeline::{TimeId, TimeNode};

/// Current schema version. Older documents run through the migration chain
/// in `crate::migrate` on load.
pub const DATA_VERSION: u32 = 3;

/// Urgent/important quadrant addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quadrant {
    ImportantUrgent,
    NotImportantUrgent,
    ImportantNotUrgent,
    NotImportantNotUrgent,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CoveyQuadrants {
    pub important_urgent: Vec<NodeId>,
    pub not_important_urgent: Vec<NodeId>,
    pub important_not_urgent: Vec<NodeId>,
    pub not_important_not_urgent: Vec<NodeId>,
}

impl CoveyQuadrants {
    pub fn list_mut(&mut self, quadrant: Quadrant) -> &mut Vec<NodeId> {
        match quadrant {
            Quadrant::ImportantUrgent => &mut self.important_urgent,
            Quadrant::NotImportantUrgent => &mut self.not_important_urgent,
            Quadrant::ImportantNotUrgent => &mut self.important_not_urgent,
            Quadrant::NotImportantNotUrgent => &mut self.not_important_not_urgent,
        }
    }

    pub fn list(&self, quadrant: Quadrant) -> &[NodeId] {
        match quadrant {
            Quadrant::ImportantUrgent => &self.important_urgent,
            Quadrant::NotImportantUrgent => &self.not_important_urgent,
            Quadrant::ImportantNotUrgent => &self.important_not_urgent,
            Quadrant::NotImportantNotUrgent => &self.not_important_not_urgent,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    pub year_begin: i32,
    pub count: u64,
    pub time_nodes: BTreeMap<TimeId, TimeNode>,
}

impl Default for Timeline {
    fn default() -> Self {
        Self {
            year_begin: 2020,
            count: 0,
            time_nodes: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Data {
    pub covey_quadrants: CoveyQuadrants,
    pub edges: BTreeMap<EdgeId, Edge>,
    pub id_seq: u64,
    pub nodes: BTreeMap<NodeId, Node>,
    pub pinned_sub_trees: Vec<NodeId>,
    pub queue: BTreeMap<NodeId, f64>,
    pub root: NodeId,
    pub timeline: Timeline,
    pub version: u32,
}

impl Data {
    /// A fresh document: one root node, nothing else.
    pub fn empty(now_ms: u64) -> Self {
        let root = NodeId::from_seq(0);
        let mut nodes = BTreeMap::new();
        nodes.insert(root.clone(), Node::new(now_ms));
        Self {
            covey_quadrants: CoveyQuadrants::default(),
            edges: BTreeMap::new(),
            id_seq: 0,
            nodes,
            pinned_sub_trees: Vec::new(),
            queue: BTreeMap::new(),
            root,
            timeline: Timeline::default(),
            version: DATA_VERSION,
        }
    }

    /// Mint a fresh id. Ids are never reused; the allocator only grows.
    pub fn next_id(&mut self) -> u64 {
        self.id_seq += 1;
        self.id_seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_data_has_only_the_root() {
        let data = Data::empty(42);
        assert_eq!(data.nodes.len(), 1);
        assert!(data.nodes.contains_key(&data.root));
        assert_eq!(data.version, DATA_VERSION);
        assert_eq!(data.root.as_str(), "0");
    }

    #[test]
    fn ids_are_never_reused() {
        let mut data = Data::empty(0);
        let a = data.next_id();
        let b = data.next_id();
        assert!(b > a);
    }
}
