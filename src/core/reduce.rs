//! The pure action reducer.
//!
//! `(Data, Action) -> (Data', forward patch, reverse patch)`: exactly one
//! reduction per action kind, no I/O. Rejected validations come back as
//! notices with the state unchanged and an empty patch. The caller supplies
//! the current time and the traversal/codec collaborators through
//! `ReduceCtx`, so a given `(data, action, ctx)` always reduces the same
//! way.

use serde_json::Value;

use super::diff::diff_values;
use super::edge::{EdgeKind, NewEdge};
use super::error::CoreError;
use super::graph::Graph;
use super::identity::{EdgeId, NodeId};
use super::node::Status;
use super::patch::PatchOp;
use super::state::{Data, Quadrant};
use super::text::TextCodec;
use super::timeline::TimeId;
use super::walker::Walker;

#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    AddNode { parent: NodeId },
    AddEdges(Vec<NewEdge>),
    DeleteNode(NodeId),
    DeleteEdge(EdgeId),
    SetEdgeKind { edge: EdgeId, kind: EdgeKind },
    ToggleEdgeHidden(EdgeId),
    SetEstimate { node: NodeId, estimate: f64 },
    SetText { node: NodeId, text: String },
    Start { node: NodeId, concurrent: bool },
    Stop(NodeId),
    StopAll,
    ToDone(NodeId),
    ToDont(NodeId),
    BackToTodo(NodeId),
    MoveUp(NodeId),
    MoveDown(NodeId),
    Top(NodeId),
    SmallestToTop,
    ImportantToTop,
    SetRangeValue { node: NodeId, index: usize, set_end: bool, value_ms: u64 },
    DeleteRange { node: NodeId, index: usize },
    AssignToTimeNode { time: TimeId, nodes: Vec<NodeId> },
    UnassignFromTimeNode { time: TimeId, nodes: Vec<NodeId> },
    SetTimeNodeText { time: TimeId, text: String },
    CycleTimeNodeChildren(TimeId),
    IncrementCount,
    AssignToQuadrant { quadrant: Quadrant, nodes: Vec<NodeId> },
    UnassignFromQuadrant { quadrant: Quadrant, nodes: Vec<NodeId> },
    TogglePin(NodeId),
    MovePinned { from: NodeId, to: NodeId },
}

pub struct ReduceCtx<'a> {
    pub now_ms: u64,
    pub walker: &'a mut Walker,
    pub codec: &'a dyn TextCodec,
}

pub struct ReduceOutcome {
    pub data: Data,
    /// Serialized form of `data`, reusable as the next reduction's base.
    pub value: Value,
    pub forward: Vec<PatchOp>,
    pub reverse: Vec<PatchOp>,
    pub notices: Vec<CoreError>,
    /// The id of a node created by `AddNode`.
    pub created: Option<NodeId>,
    /// A `Start` actually opened a range (feeds the next-action predictor).
    pub started: Option<NodeId>,
}

/// Reduce one action. `base_value` must be the serialization of `data`; the
/// caller keeps it cached between reductions so unchanged reductions cost no
/// serialization diff.
pub fn reduce(data: &Data, base_value: &Value, action: &Action, ctx: &mut ReduceCtx<'_>) -> ReduceOutcome {
    let mut next = data.clone();
    let mut notices = Vec::new();
    let mut created = None;
    let mut started = None;
    {
        let mut graph = Graph::new(&mut next, ctx.walker);
        let result = match action {
            Action::AddNode { parent } => graph.add_node(parent, ctx.now_ms).map(|id| {
                created = Some(id);
            }),
            Action::AddEdges(edges) => {
                notices.extend(graph.add_edges(edges.clone()));
                Ok(())
            }
            Action::DeleteNode(id) => graph.delete_node(id),
            Action::DeleteEdge(id) => graph.delete_edge(id),
            Action::SetEdgeKind { edge, kind } => graph.set_edge_kind(edge, *kind),
            Action::ToggleEdgeHidden(id) => graph.toggle_edge_hidden(id),
            Action::SetEstimate { node, estimate } => graph.set_estimate(node, *estimate),
            Action::SetText { node, text } => graph.set_text(node, ctx.codec, text, ctx.now_ms),
            Action::Start { node, concurrent } => {
                graph.start(node, *concurrent, ctx.now_ms).map(|did| {
                    if did {
                        started = Some(node.clone());
                    }
                })
            }
            Action::Stop(id) => {
                graph.stop(id, ctx.now_ms);
                Ok(())
            }
            Action::StopAll => {
                graph.stop_all(ctx.now_ms);
                Ok(())
            }
            Action::ToDone(id) => graph.complete(id, Status::Done, ctx.now_ms),
            Action::ToDont(id) => graph.complete(id, Status::Dont, ctx.now_ms),
            Action::BackToTodo(id) => graph.back_to_todo(id),
            Action::MoveUp(id) => graph.move_up(id),
            Action::MoveDown(id) => graph.move_down(id),
            Action::Top(id) => graph.top(id),
            Action::SmallestToTop => {
                graph.smallest_to_top();
                Ok(())
            }
            Action::ImportantToTop => {
                graph.important_to_top();
                Ok(())
            }
            Action::SetRangeValue {
                node,
                index,
                set_end,
                value_ms,
            } => graph.set_range_value(node, *index, *set_end, *value_ms),
            Action::DeleteRange { node, index } => graph.delete_range(node, *index),
            Action::AssignToTimeNode { time, nodes } => {
                graph.assign_to_time_node(time, nodes, ctx.now_ms);
                Ok(())
            }
            Action::UnassignFromTimeNode { time, nodes } => {
                graph.unassign_from_time_node(time, nodes);
                Ok(())
            }
            Action::SetTimeNodeText { time, text } => {
                graph.set_time_node_text(time, text, ctx.now_ms);
                Ok(())
            }
            Action::CycleTimeNodeChildren(time) => {
                graph.cycle_time_node_children(time, ctx.now_ms);
                Ok(())
            }
            Action::IncrementCount => {
                graph.data.timeline.count += 1;
                Ok(())
            }
            Action::AssignToQuadrant { quadrant, nodes } => {
                graph.assign_to_quadrant(*quadrant, nodes);
                Ok(())
            }
            Action::UnassignFromQuadrant { quadrant, nodes } => {
                graph.unassign_from_quadrant(*quadrant, nodes);
                Ok(())
            }
            Action::TogglePin(id) => graph.toggle_pin(id),
            Action::MovePinned { from, to } => {
                graph.move_pinned(from, to);
                Ok(())
            }
        };
        if let Err(notice) = result {
            notices.push(notice);
        }
    }

    if !notices.is_empty() && next == *data {
        // Rejected outright: empty patch, unchanged state.
        return ReduceOutcome {
            data: data.clone(),
            value: base_value.clone(),
            forward: Vec::new(),
            reverse: Vec::new(),
            notices,
            created,
            started,
        };
    }

    let value = serde_json::to_value(&next).expect("Data serializes");
    let (forward, reverse) = diff_values(base_value, &value);
    ReduceOutcome {
        data: next,
        value,
        forward,
        reverse,
        notices,
        created,
        started,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::diff::apply_patch;
    use crate::core::text::ReplaceCodec;

    struct Fixture {
        data: Data,
        value: Value,
        walker: Walker,
        now: u64,
    }

    impl Fixture {
        fn new() -> Self {
            let data = Data::empty(0);
            let value = serde_json::to_value(&data).unwrap();
            Self {
                data,
                value,
                walker: Walker::new(),
                now: 0,
            }
        }

        fn apply(&mut self, action: Action) -> ReduceOutcome {
            self.now += 1_000;
            let outcome = reduce(
                &self.data,
                &self.value,
                &action,
                &mut ReduceCtx {
                    now_ms: self.now,
                    walker: &mut self.walker,
                    codec: &ReplaceCodec,
                },
            );
            self.data = outcome.data.clone();
            self.value = outcome.value.clone();
            outcome
        }
    }

    #[test]
    fn forward_then_reverse_round_trips_exactly() {
        let mut fx = Fixture::new();
        let root = fx.data.root.clone();

        let mut history: Vec<(Value, Vec<PatchOp>, Vec<PatchOp>)> = Vec::new();
        let mut record =
            |fx: &mut Fixture, action: Action, history: &mut Vec<(Value, Vec<PatchOp>, Vec<PatchOp>)>| {
                let before = fx.value.clone();
                let outcome = fx.apply(action);
                history.push((before, outcome.forward.clone(), outcome.reverse.clone()));
                outcome
            };

        let a = record(&mut fx, Action::AddNode { parent: root.clone() }, &mut history)
            .created
            .unwrap();
        record(&mut fx, Action::SetEstimate { node: a.clone(), estimate: 1.5 }, &mut history);
        record(&mut fx, Action::Start { node: a.clone(), concurrent: false }, &mut history);
        record(&mut fx, Action::Stop(a.clone()), &mut history);
        record(
            &mut fx,
            Action::SetText { node: a.clone(), text: "write the report".into() },
            &mut history,
        );
        record(&mut fx, Action::ToDone(a.clone()), &mut history);

        for (before, forward, reverse) in history {
            let mut doc = before.clone();
            apply_patch(&mut doc, &forward).unwrap();
            apply_patch(&mut doc, &reverse).unwrap();
            assert_eq!(doc, before);
        }
    }

    #[test]
    fn rejected_action_changes_nothing_and_reports() {
        let mut fx = Fixture::new();
        let root = fx.data.root.clone();
        let a = fx.apply(Action::AddNode { parent: root.clone() }).created.unwrap();

        let before = fx.value.clone();
        // a has no strong todo child, so BackToTodo on a todo node is a
        // silent no-op; deleting the root is a rejection.
        let outcome = fx.apply(Action::DeleteNode(root));
        assert_eq!(outcome.notices, vec![CoreError::RootDeletion]);
        assert!(outcome.forward.is_empty());
        assert_eq!(fx.value, before);

        let outcome = fx.apply(Action::SetEstimate { node: a, estimate: -1.0 });
        assert!(matches!(outcome.notices[0], CoreError::InvalidEstimate { .. }));
        assert!(outcome.forward.is_empty());
    }

    #[test]
    fn partial_edge_batch_keeps_successes() {
        let mut fx = Fixture::new();
        let root = fx.data.root.clone();
        let a = fx.apply(Action::AddNode { parent: root.clone() }).created.unwrap();
        let b = fx.apply(Action::AddNode { parent: root.clone() }).created.unwrap();

        let outcome = fx.apply(Action::AddEdges(vec![
            NewEdge {
                parent: a.clone(),
                child: b.clone(),
                kind: EdgeKind::Strong,
                hidden: false,
            },
            NewEdge {
                parent: b.clone(),
                child: a.clone(),
                kind: EdgeKind::Strong,
                hidden: false,
            },
        ]));
        assert_eq!(outcome.notices.len(), 1);
        assert!(!outcome.forward.is_empty());
        assert!(crate::core::graph::has_edge(&fx.data, &a, &b));
        assert!(!crate::core::graph::has_edge(&fx.data, &b, &a));
    }

    #[test]
    fn start_reports_only_real_starts() {
        let mut fx = Fixture::new();
        let root = fx.data.root.clone();
        let a = fx.apply(Action::AddNode { parent: root }).created.unwrap();

        let outcome = fx.apply(Action::Start { node: a.clone(), concurrent: false });
        assert_eq!(outcome.started, Some(a.clone()));
        let outcome = fx.apply(Action::Start { node: a.clone(), concurrent: false });
        assert_eq!(outcome.started, None);
        assert!(outcome.forward.is_empty());
    }
}
