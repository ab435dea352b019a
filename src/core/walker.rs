//! Visit-epoch graph traversal.
//!
//! One walker owns a monotonically increasing epoch counter plus a node ->
//! last-seen-epoch map; marking a node "visited" is a single insert and no
//! per-traversal set is allocated. All walks use explicit work lists so
//! adversarial DAG depth cannot overflow the stack. Hidden edges are
//! traversed: `hide` is presentation-only.

use std::collections::{BTreeSet, HashMap};

use super::identity::NodeId;
use super::state::Data;

#[derive(Debug, Default)]
pub struct Walker {
    epochs: HashMap<NodeId, u64>,
    counter: u64,
}

impl Walker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new traversal epoch.
    pub fn next_epoch(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    fn mark(&mut self, id: &NodeId, epoch: u64) -> bool {
        if self.epochs.get(id) == Some(&epoch) {
            return false;
        }
        self.epochs.insert(id.clone(), epoch);
        true
    }

    /// Would adding `parent -> child` close a cycle?
    ///
    /// Marks `child`, then walks upward from `parent` through parent edges;
    /// reaching `child` again means the candidate edge closes a loop.
    pub fn creates_cycle(&mut self, data: &Data, parent: &NodeId, child: &NodeId) -> bool {
        if parent == child {
            return true;
        }
        let epoch = self.next_epoch();
        self.mark(child, epoch);
        let mut stack = vec![parent.clone()];
        while let Some(id) = stack.pop() {
            if id == *child {
                return true;
            }
            if !self.mark(&id, epoch) {
                continue;
            }
            let Some(node) = data.nodes.get(&id) else {
                continue;
            };
            for edge_id in node.parents.keys() {
                if let Some(edge) = data.edges.get(edge_id) {
                    stack.push(edge.parent.clone());
                }
            }
        }
        false
    }

    /// Visit `root` and every node reachable through strong child edges,
    /// once each.
    pub fn for_each_strong_descendant(
        &mut self,
        data: &Data,
        root: &NodeId,
        mut visit: impl FnMut(&NodeId),
    ) {
        let epoch = self.next_epoch();
        let mut stack = vec![root.clone()];
        while let Some(id) = stack.pop() {
            if !self.mark(&id, epoch) {
                continue;
            }
            let Some(node) = data.nodes.get(&id) else {
                continue;
            };
            visit(&id);
            for edge_id in node.children.keys() {
                if let Some(edge) = data.edges.get(edge_id)
                    && edge.kind.is_strong()
                {
                    stack.push(edge.child.clone());
                }
            }
        }
    }

    /// The node and every ancestor reachable through parent edges of any
    /// kind.
    pub fn ancestors(&mut self, data: &Data, id: &NodeId) -> BTreeSet<NodeId> {
        let epoch = self.next_epoch();
        let mut seen = BTreeSet::new();
        let mut stack = vec![id.clone()];
        while let Some(id) = stack.pop() {
            if !self.mark(&id, epoch) {
                continue;
            }
            let Some(node) = data.nodes.get(&id) else {
                continue;
            };
            seen.insert(id.clone());
            for edge_id in node.parents.keys() {
                if let Some(edge) = data.edges.get(edge_id) {
                    stack.push(edge.parent.clone());
                }
            }
        }
        seen
    }

    /// Count of distinct todo nodes reachable upward from `id` (inclusive),
    /// stopping at non-todo nodes.
    pub fn todo_parent_weight(&mut self, data: &Data, id: &NodeId) -> usize {
        let epoch = self.next_epoch();
        let mut count = 0;
        let mut stack = vec![id.clone()];
        while let Some(id) = stack.pop() {
            if !self.mark(&id, epoch) {
                continue;
            }
            let Some(node) = data.nodes.get(&id) else {
                continue;
            };
            if !node.status.is_todo() {
                continue;
            }
            count += 1;
            for edge_id in node.parents.keys() {
                if let Some(edge) = data.edges.get(edge_id) {
                    stack.push(edge.parent.clone());
                }
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::Graph;

    fn diamond() -> (Data, Walker, Vec<NodeId>) {
        // root -> a -> c, root -> b -> c (all strong)
        let mut walker = Walker::new();
        let mut data = Data::empty(0);
        let root = data.root.clone();
        let a = Graph::new(&mut data, &mut walker).add_node(&root, 1).unwrap();
        let b = Graph::new(&mut data, &mut walker).add_node(&root, 2).unwrap();
        let c = Graph::new(&mut data, &mut walker).add_node(&a, 3).unwrap();
        let notices = Graph::new(&mut data, &mut walker).add_edges(vec![crate::core::NewEdge {
            parent: b.clone(),
            child: c.clone(),
            kind: crate::core::EdgeKind::Strong,
            hidden: false,
        }]);
        assert!(notices.is_empty());
        (data, walker, vec![root, a, b, c])
    }

    #[test]
    fn cycle_probe_detects_back_edge() {
        let (data, mut walker, ids) = diamond();
        // c -> a would loop (a is an ancestor of c)
        assert!(walker.creates_cycle(&data, &ids[3], &ids[1]));
        // a -> b is fine (siblings)
        assert!(!walker.creates_cycle(&data, &ids[1], &ids[2]));
        // self edge
        assert!(walker.creates_cycle(&data, &ids[1], &ids[1]));
    }

    #[test]
    fn strong_descendants_visit_once() {
        let (data, mut walker, ids) = diamond();
        let mut seen = Vec::new();
        walker.for_each_strong_descendant(&data, &ids[0], |id| seen.push(id.clone()));
        assert_eq!(seen.len(), 4);
        let unique: BTreeSet<_> = seen.iter().collect();
        assert_eq!(unique.len(), 4);
    }

    #[test]
    fn ancestors_include_self_and_all_paths() {
        let (data, mut walker, ids) = diamond();
        let up = walker.ancestors(&data, &ids[3]);
        assert_eq!(up.len(), 4);
        assert!(up.contains(&ids[0]));
    }
}
