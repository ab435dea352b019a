//! Validated graph mutations and structural checks.
//!
//! Every operation validates first and leaves `Data` untouched on rejection;
//! a `CoreError` here is a non-fatal notice, not a crash. Batch operations
//! (`add_edges`) skip failing entries individually instead of aborting.

use super::edge::{Edge, EdgeKind, NewEdge};
use super::error::CoreError;
use super::identity::{EdgeId, NodeId};
use super::node::{Node, Range, Status, TextPatch};
use super::order;
use super::state::{Data, Quadrant};
use super::text::{TextCodec, project_text};
use super::timeline::{TimeId, TimeNode};
use super::walker::Walker;

/// A mutable view pairing the document with a walker for traversal state.
pub struct Graph<'a> {
    pub data: &'a mut Data,
    pub walker: &'a mut Walker,
}

/// No strong child is still todo.
pub fn is_completable(data: &Data, id: &NodeId) -> bool {
    let Some(node) = data.nodes.get(id) else {
        return false;
    };
    !node.children.keys().any(|edge_id| {
        data.edges.get(edge_id).is_some_and(|edge| {
            edge.kind.is_strong()
                && data
                    .nodes
                    .get(&edge.child)
                    .is_some_and(|child| child.status.is_todo())
        })
    })
}

/// Completion is revocable: at least one strong parent is still todo.
/// A node whose strong parents have all left todo must have them reverted
/// first, outermost-in.
pub fn is_uncompletable(data: &Data, id: &NodeId) -> bool {
    let Some(node) = data.nodes.get(id) else {
        return false;
    };
    node.parents.keys().any(|edge_id| {
        data.edges.get(edge_id).is_some_and(|edge| {
            edge.kind.is_strong()
                && data
                    .nodes
                    .get(&edge.parent)
                    .is_some_and(|parent| parent.status.is_todo())
        })
    })
}

/// Weak edges always come out; a strong edge only when its child keeps at
/// least one other strong parent.
pub fn is_deletable_edge(data: &Data, edge_id: &EdgeId) -> bool {
    let Some(edge) = data.edges.get(edge_id) else {
        return false;
    };
    if !edge.kind.is_strong() {
        return true;
    }
    let Some(child) = data.nodes.get(&edge.child) else {
        return false;
    };
    child
        .parents
        .keys()
        .filter(|parent_edge| {
            data.edges
                .get(*parent_edge)
                .is_some_and(|e| e.kind.is_strong())
        })
        .take(2)
        .count()
        > 1
}

/// Never the root; every child edge must be deletable.
pub fn is_deletable_node(data: &Data, id: &NodeId) -> bool {
    if *id == data.root {
        return false;
    }
    let Some(node) = data.nodes.get(id) else {
        return false;
    };
    node.children
        .keys()
        .all(|edge_id| is_deletable_edge(data, edge_id))
}

pub fn has_edge(data: &Data, parent: &NodeId, child: &NodeId) -> bool {
    data.nodes.get(child).is_some_and(|node| {
        node.parents
            .keys()
            .any(|edge_id| data.edges.get(edge_id).is_some_and(|e| e.parent == *parent))
    })
}

impl<'a> Graph<'a> {
    pub fn new(data: &'a mut Data, walker: &'a mut Walker) -> Self {
        Self { data, walker }
    }

    fn node(&self, id: &NodeId) -> Result<&Node, CoreError> {
        self.data
            .nodes
            .get(id)
            .ok_or_else(|| CoreError::MissingNode(id.clone()))
    }

    fn require_todo(&self, id: &NodeId, verb: &'static str) -> Result<(), CoreError> {
        if self.node(id)?.status.is_todo() {
            Ok(())
        } else {
            Err(CoreError::NotTodoFor(id.clone(), verb))
        }
    }

    /// Create a node under `parent` with a strong edge; the new node enters
    /// the queue front and the parent's child order front.
    pub fn add_node(&mut self, parent: &NodeId, now_ms: u64) -> Result<NodeId, CoreError> {
        if !self.node(parent)?.status.is_todo() {
            return Err(CoreError::NotTodo(parent.clone()));
        }
        let node_id = NodeId::from_seq(self.data.next_id());
        let edge_id = EdgeId::from_seq(self.data.next_id());
        let mut node = Node::new(now_ms);
        order::insert_front(&mut node.parents, edge_id.clone());
        self.data.edges.insert(
            edge_id.clone(),
            Edge {
                parent: parent.clone(),
                child: node_id.clone(),
                kind: EdgeKind::Strong,
                hidden: false,
            },
        );
        let parent_node = self
            .data
            .nodes
            .get_mut(parent)
            .expect("parent checked above");
        order::insert_front(&mut parent_node.children, edge_id);
        order::insert_front(&mut self.data.queue, node_id.clone());
        self.data.nodes.insert(node_id.clone(), node);
        Ok(node_id)
    }

    /// Add a batch of edges. Each edge validates independently; failures are
    /// returned as notices and do not abort the rest of the batch.
    pub fn add_edges(&mut self, edges: Vec<NewEdge>) -> Vec<CoreError> {
        let mut notices = Vec::new();
        for request in edges {
            if let Err(notice) = self.add_edge(request) {
                notices.push(notice);
            }
        }
        notices
    }

    fn add_edge(&mut self, request: NewEdge) -> Result<(), CoreError> {
        let NewEdge {
            parent,
            child,
            kind,
            hidden,
        } = request;
        if child == self.data.root {
            return Err(CoreError::RootAsChild);
        }
        if !self.data.nodes.contains_key(&parent) {
            return Err(CoreError::MissingNode(parent));
        }
        if !self.data.nodes.contains_key(&child) {
            return Err(CoreError::MissingNode(child));
        }
        if has_edge(self.data, &parent, &child) {
            return Err(CoreError::DuplicateEdge { parent, child });
        }
        if self.walker.creates_cycle(self.data, &parent, &child) {
            return Err(CoreError::CycleDetected { parent, child });
        }
        let edge_id = EdgeId::from_seq(self.data.next_id());
        let child_node = self.data.nodes.get_mut(&child).expect("checked above");
        order::insert_front(&mut child_node.parents, edge_id.clone());
        let parent_node = self.data.nodes.get_mut(&parent).expect("checked above");
        order::insert_front(&mut parent_node.children, edge_id.clone());
        self.data.edges.insert(
            edge_id,
            Edge {
                parent,
                child,
                kind,
                hidden,
            },
        );
        Ok(())
    }

    pub fn delete_node(&mut self, id: &NodeId) -> Result<(), CoreError> {
        if *id == self.data.root {
            return Err(CoreError::RootDeletion);
        }
        let node = self.node(id)?;
        if !is_deletable_node(self.data, id) {
            return Err(CoreError::NotDeletableNode(id.clone()));
        }
        let parent_edges: Vec<EdgeId> = node.parents.keys().cloned().collect();
        let child_edges: Vec<EdgeId> = node.children.keys().cloned().collect();

        for time_node in self.data.timeline.time_nodes.values_mut() {
            time_node.nodes.remove(id);
        }
        for quadrant in [
            Quadrant::ImportantUrgent,
            Quadrant::NotImportantUrgent,
            Quadrant::ImportantNotUrgent,
            Quadrant::NotImportantNotUrgent,
        ] {
            self.data.covey_quadrants.list_mut(quadrant).retain(|n| n != id);
        }
        self.data.pinned_sub_trees.retain(|n| n != id);
        self.data.queue.remove(id);

        for edge_id in parent_edges {
            if let Some(edge) = self.data.edges.remove(&edge_id)
                && let Some(parent) = self.data.nodes.get_mut(&edge.parent)
            {
                parent.children.remove(&edge_id);
            }
        }
        for edge_id in child_edges {
            if let Some(edge) = self.data.edges.remove(&edge_id)
                && let Some(child) = self.data.nodes.get_mut(&edge.child)
            {
                child.parents.remove(&edge_id);
            }
        }
        self.data.nodes.remove(id);
        Ok(())
    }

    pub fn delete_edge(&mut self, id: &EdgeId) -> Result<(), CoreError> {
        if !self.data.edges.contains_key(id) {
            return Err(CoreError::MissingEdge(id.clone()));
        }
        if !is_deletable_edge(self.data, id) {
            return Err(CoreError::NotDeletableEdge(id.clone()));
        }
        let edge = self.data.edges.remove(id).expect("checked above");
        if let Some(parent) = self.data.nodes.get_mut(&edge.parent) {
            parent.children.remove(id);
        }
        if let Some(child) = self.data.nodes.get_mut(&edge.child) {
            child.parents.remove(id);
        }
        Ok(())
    }

    /// Change an edge's kind. Guarded by deletability: demoting the only
    /// strong parent of a child is as forbidden as deleting it.
    pub fn set_edge_kind(&mut self, id: &EdgeId, kind: EdgeKind) -> Result<(), CoreError> {
        if !self.data.edges.contains_key(id) {
            return Err(CoreError::MissingEdge(id.clone()));
        }
        if !is_deletable_edge(self.data, id) {
            return Err(CoreError::NotDeletableEdge(id.clone()));
        }
        self.data.edges.get_mut(id).expect("checked above").kind = kind;
        Ok(())
    }

    pub fn toggle_edge_hidden(&mut self, id: &EdgeId) -> Result<(), CoreError> {
        let edge = self
            .data
            .edges
            .get_mut(id)
            .ok_or_else(|| CoreError::MissingEdge(id.clone()))?;
        edge.hidden = !edge.hidden;
        Ok(())
    }

    /// todo -> done/dont. Tops the queue entry, closes any open range,
    /// stamps `end_time`, and re-fronts the node in every parent's child
    /// order.
    pub fn complete(&mut self, id: &NodeId, status: Status, now_ms: u64) -> Result<(), CoreError> {
        debug_assert!(!status.is_todo());
        self.require_todo(id, "completed")?;
        if !is_completable(self.data, id) {
            return Err(CoreError::NotCompletable(id.clone()));
        }
        order::move_to_front(&mut self.data.queue, id);
        self.stop(id, now_ms);
        let node = self.data.nodes.get_mut(id).expect("checked above");
        node.status = status;
        node.end_time = Some(now_ms);
        self.refront_in_parents(id);
        Ok(())
    }

    /// done/dont -> todo. Requires a strong parent that is still todo;
    /// re-fronts the node in the queue and in every parent's child ordering.
    pub fn back_to_todo(&mut self, id: &NodeId) -> Result<(), CoreError> {
        let node = self.node(id)?;
        if node.status.is_todo() {
            return Ok(());
        }
        if !is_uncompletable(self.data, id) {
            return Err(CoreError::NotUncompletable(id.clone()));
        }
        let node = self.data.nodes.get_mut(id).expect("checked above");
        node.status = Status::Todo;
        node.end_time = None;
        order::move_to_front(&mut self.data.queue, id);
        self.refront_in_parents(id);
        Ok(())
    }

    fn refront_in_parents(&mut self, id: &NodeId) {
        let parent_edges: Vec<EdgeId> = self.data.nodes[id].parents.keys().cloned().collect();
        for edge_id in parent_edges {
            let Some(edge) = self.data.edges.get(&edge_id) else {
                continue;
            };
            let parent = edge.parent.clone();
            if let Some(parent_node) = self.data.nodes.get_mut(&parent) {
                order::move_to_front(&mut parent_node.children, &edge_id);
            }
        }
    }

    /// Open a tracked range. Single-focus: unless `concurrent`, every other
    /// open range is closed first. Returns false when the node was already
    /// running (no change).
    pub fn start(&mut self, id: &NodeId, concurrent: bool, now_ms: u64) -> Result<bool, CoreError> {
        self.require_todo(id, "started")?;
        if self.data.nodes[id].is_running() {
            return Ok(false);
        }
        order::move_to_front(&mut self.data.queue, id);
        if !concurrent {
            self.stop_all(now_ms);
        }
        let node = self.data.nodes.get_mut(id).expect("checked above");
        node.ranges.push(Range {
            start: now_ms,
            end: None,
        });
        Ok(true)
    }

    /// Close the open range, if any.
    pub fn stop(&mut self, id: &NodeId, now_ms: u64) -> bool {
        let Some(node) = self.data.nodes.get_mut(id) else {
            return false;
        };
        match node.ranges.last_mut() {
            Some(range) if range.end.is_none() => {
                range.end = Some(now_ms);
                true
            }
            _ => false,
        }
    }

    pub fn stop_all(&mut self, now_ms: u64) {
        let running: Vec<NodeId> = self
            .data
            .nodes
            .iter()
            .filter(|(_, node)| node.is_running())
            .map(|(id, _)| id.clone())
            .collect();
        for id in running {
            self.stop(&id, now_ms);
        }
    }

    pub fn set_estimate(&mut self, id: &NodeId, estimate: f64) -> Result<(), CoreError> {
        if !(estimate.is_finite() && estimate >= 0.0) {
            return Err(CoreError::InvalidEstimate {
                node: id.clone(),
                value: estimate,
            });
        }
        self.node(id)?;
        self.data.nodes.get_mut(id).expect("checked above").estimate = estimate;
        Ok(())
    }

    /// Append a text patch taking the projection from its current value to
    /// `text`. No-op when the text is unchanged.
    pub fn set_text(
        &mut self,
        id: &NodeId,
        codec: &dyn TextCodec,
        text: &str,
        now_ms: u64,
    ) -> Result<(), CoreError> {
        let node = self.node(id)?;
        let current = project_text(codec, node.text_patches.iter().map(|p| p.ops.clone()))
            .map_err(|reason| CoreError::TextPatch {
                node: id.clone(),
                reason,
            })?;
        if current == text {
            return Ok(());
        }
        let ops = codec.diff(&current, text);
        self.data
            .nodes
            .get_mut(id)
            .expect("checked above")
            .text_patches
            .push(TextPatch {
                created_at: now_ms,
                ops,
            });
        Ok(())
    }

    /// Edit one bound of an existing range. The open end of a running range
    /// cannot be set this way, and a range never inverts.
    pub fn set_range_value(
        &mut self,
        id: &NodeId,
        index: usize,
        set_end: bool,
        value_ms: u64,
    ) -> Result<(), CoreError> {
        let node = self.node(id)?;
        let range = *node
            .ranges
            .get(index)
            .ok_or_else(|| CoreError::InvalidRange {
                node: id.clone(),
                index,
                reason: "no such range".to_string(),
            })?;
        let mut next = range;
        if set_end {
            if range.end.is_none() {
                return Err(CoreError::InvalidRange {
                    node: id.clone(),
                    index,
                    reason: "the end of a running range cannot be edited".to_string(),
                });
            }
            next.end = Some(value_ms);
        } else {
            next.start = value_ms;
        }
        if let Some(end) = next.end
            && end < next.start
        {
            return Err(CoreError::InvalidRange {
                node: id.clone(),
                index,
                reason: format!("end {end} would precede start {}", next.start),
            });
        }
        self.data.nodes.get_mut(id).expect("checked above").ranges[index] = next;
        Ok(())
    }

    pub fn delete_range(&mut self, id: &NodeId, index: usize) -> Result<(), CoreError> {
        let node = self.node(id)?;
        if index >= node.ranges.len() {
            return Err(CoreError::InvalidRange {
                node: id.clone(),
                index,
                reason: "no such range".to_string(),
            });
        }
        self.data
            .nodes
            .get_mut(id)
            .expect("checked above")
            .ranges
            .remove(index);
        Ok(())
    }

    pub fn move_up(&mut self, id: &NodeId) -> Result<(), CoreError> {
        self.require_todo(id, "moved up")?;
        let parent_edges: Vec<EdgeId> = self.data.nodes[id].parents.keys().cloned().collect();
        for edge_id in parent_edges {
            if let Some(edge) = self.data.edges.get(&edge_id) {
                let parent = edge.parent.clone();
                if let Some(parent_node) = self.data.nodes.get_mut(&parent) {
                    order::move_up(&mut parent_node.children, &edge_id);
                }
            }
        }
        order::move_up(&mut self.data.queue, id);
        Ok(())
    }

    pub fn move_down(&mut self, id: &NodeId) -> Result<(), CoreError> {
        self.require_todo(id, "moved down")?;
        let parent_edges: Vec<EdgeId> = self.data.nodes[id].parents.keys().cloned().collect();
        for edge_id in parent_edges {
            if let Some(edge) = self.data.edges.get(&edge_id) {
                let parent = edge.parent.clone();
                if let Some(parent_node) = self.data.nodes.get_mut(&parent) {
                    order::move_down(&mut parent_node.children, &edge_id);
                }
            }
        }
        order::move_down(&mut self.data.queue, id);
        Ok(())
    }

    /// Front the node in the queue and in the child order of its first todo
    /// strong parent.
    pub fn top(&mut self, id: &NodeId) -> Result<(), CoreError> {
        self.require_todo(id, "moved")?;
        let parents = order::sorted_keys(&self.data.nodes[id].parents);
        for edge_id in parents {
            let Some(edge) = self.data.edges.get(&edge_id) else {
                continue;
            };
            if edge.kind.is_strong()
                && self
                    .data
                    .nodes
                    .get(&edge.parent)
                    .is_some_and(|p| p.status.is_todo())
            {
                let parent = edge.parent.clone();
                if let Some(parent_node) = self.data.nodes.get_mut(&parent) {
                    order::move_to_front(&mut parent_node.children, &edge_id);
                }
                break;
            }
        }
        order::move_to_front(&mut self.data.queue, id);
        Ok(())
    }

    fn is_actionable(&self, id: &NodeId) -> bool {
        self.data.nodes.get(id).is_some_and(|node| {
            node.status.is_todo()
                && !node.children.keys().any(|edge_id| {
                    self.data.edges.get(edge_id).is_some_and(|edge| {
                        self.data
                            .nodes
                            .get(&edge.child)
                            .is_some_and(|child| child.status.is_todo())
                    })
                })
        })
    }

    /// Front the actionable todo node with the smallest nonzero estimate.
    pub fn smallest_to_top(&mut self) {
        let mut best: Option<(NodeId, f64)> = None;
        for id in order::sorted_keys(&self.data.queue) {
            let Some(node) = self.data.nodes.get(&id) else {
                continue;
            };
            if !node.has_estimate() || !self.is_actionable(&id) {
                continue;
            }
            if best.as_ref().is_none_or(|(_, e)| node.estimate < *e) {
                best = Some((id.clone(), node.estimate));
            }
        }
        if let Some((id, _)) = best {
            order::move_to_front(&mut self.data.queue, &id);
        }
    }

    /// Front the actionable todo node (no strong todo child) that unblocks
    /// the most transitive todo parents.
    pub fn important_to_top(&mut self) {
        let mut best: Option<(NodeId, usize)> = None;
        for id in order::sorted_keys(&self.data.queue) {
            let Some(node) = self.data.nodes.get(&id) else {
                continue;
            };
            let blocked_by_child = node.children.keys().any(|edge_id| {
                self.data.edges.get(edge_id).is_some_and(|edge| {
                    edge.kind.is_strong()
                        && self
                            .data
                            .nodes
                            .get(&edge.child)
                            .is_some_and(|child| child.status.is_todo())
                })
            });
            if !node.status.is_todo() || blocked_by_child {
                continue;
            }
            let weight = self.walker.todo_parent_weight(self.data, &id);
            if best.as_ref().is_none_or(|(_, w)| weight > *w) {
                best = Some((id.clone(), weight));
            }
        }
        if let Some((id, _)) = best {
            let _ = self.top(&id);
        }
    }

    fn time_node_mut(&mut self, time_id: &TimeId, now_ms: u64) -> &mut TimeNode {
        self.data
            .timeline
            .time_nodes
            .entry(time_id.clone())
            .or_insert_with(|| TimeNode::new(now_ms))
    }

    /// Assign nodes to a calendar bucket, given order preserved at the
    /// front. Missing nodes and duplicates are skipped.
    pub fn assign_to_time_node(&mut self, time_id: &TimeId, nodes: &[NodeId], now_ms: u64) {
        let present: Vec<NodeId> = nodes
            .iter()
            .filter(|id| self.data.nodes.contains_key(*id))
            .cloned()
            .collect();
        let bucket = self.time_node_mut(time_id, now_ms);
        for id in present.into_iter().rev() {
            if !bucket.nodes.contains_key(&id) {
                order::insert_front(&mut bucket.nodes, id);
            }
        }
    }

    pub fn unassign_from_time_node(&mut self, time_id: &TimeId, nodes: &[NodeId]) {
        if let Some(bucket) = self.data.timeline.time_nodes.get_mut(time_id) {
            for id in nodes {
                bucket.nodes.remove(id);
            }
        }
    }

    pub fn set_time_node_text(&mut self, time_id: &TimeId, text: &str, now_ms: u64) {
        self.time_node_mut(time_id, now_ms).text = text.to_string();
    }

    pub fn cycle_time_node_children(&mut self, time_id: &TimeId, now_ms: u64) {
        let bucket = self.time_node_mut(time_id, now_ms);
        bucket.show_children = bucket.show_children.cycled();
    }

    pub fn assign_to_quadrant(&mut self, quadrant: Quadrant, nodes: &[NodeId]) {
        let list = self.data.covey_quadrants.list_mut(quadrant);
        for id in nodes {
            if !list.contains(id) {
                list.push(id.clone());
            }
        }
    }

    pub fn unassign_from_quadrant(&mut self, quadrant: Quadrant, nodes: &[NodeId]) {
        let list = self.data.covey_quadrants.list_mut(quadrant);
        list.retain(|id| !nodes.contains(id));
    }

    pub fn toggle_pin(&mut self, id: &NodeId) -> Result<(), CoreError> {
        self.node(id)?;
        let pins = &mut self.data.pinned_sub_trees;
        match pins.iter().position(|n| n == id) {
            Some(index) => {
                pins.remove(index);
            }
            None => pins.push(id.clone()),
        }
        Ok(())
    }

    pub fn move_pinned(&mut self, from: &NodeId, to: &NodeId) {
        let pins = &mut self.data.pinned_sub_trees;
        let (Some(from_index), Some(to_index)) = (
            pins.iter().position(|n| n == from),
            pins.iter().position(|n| n == to),
        ) else {
            return;
        };
        if from_index == to_index {
            return;
        }
        let item = pins.remove(from_index);
        pins.insert(to_index, item);
    }

    /// Total tracked milliseconds over the union of closed ranges in the
    /// strong-descendant subtree (overlapping ranges counted once).
    pub fn total_tracked_ms(&mut self, id: &NodeId) -> u64 {
        let mut events: Vec<(u64, i32)> = Vec::new();
        let data = &*self.data;
        self.walker.for_each_strong_descendant(data, id, |node_id| {
            if let Some(node) = data.nodes.get(node_id) {
                for range in &node.ranges {
                    if let Some(end) = range.end {
                        events.push((range.start, 1));
                        events.push((end, -1));
                    }
                }
            }
        });
        events.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
        let mut total = 0;
        let mut depth = 0;
        let mut opened_at = 0;
        for (t, delta) in events {
            if depth == 0 && delta > 0 {
                opened_at = t;
            }
            depth += delta;
            if depth == 0 {
                total += t - opened_at;
            }
        }
        total
    }
}
