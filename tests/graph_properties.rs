//! Structural properties of the graph core, driven through the public API.

use std::collections::BTreeSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;

use braid::core::{
    Action, Data, EdgeKind, NewEdge, NodeId, ReduceCtx, ReplaceCodec, Walker, apply_patch, reduce,
};
use braid::engine::Engine;

struct Harness {
    data: Data,
    value: Value,
    walker: Walker,
    now: u64,
}

impl Harness {
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

    fn apply(&mut self, action: Action) -> (Vec<braid::PatchOp>, Vec<braid::PatchOp>) {
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
        self.data = outcome.data;
        self.value = outcome.value;
        (outcome.forward, outcome.reverse)
    }

    fn node_ids(&self) -> Vec<NodeId> {
        self.data.nodes.keys().cloned().collect()
    }
}

/// Strong-edge subgraph must be acyclic: Kahn-style peel over strong edges.
fn assert_strong_acyclic(data: &Data) {
    let mut incoming: std::collections::HashMap<&NodeId, usize> =
        data.nodes.keys().map(|id| (id, 0)).collect();
    for edge in data.edges.values() {
        if edge.kind.is_strong() {
            *incoming.get_mut(&edge.child).unwrap() += 1;
        }
    }
    let mut ready: Vec<&NodeId> = incoming
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut peeled = 0;
    while let Some(id) = ready.pop() {
        peeled += 1;
        for edge in data.edges.values() {
            if edge.kind.is_strong() && edge.parent == *id {
                let slot = incoming.get_mut(&edge.child).unwrap();
                *slot -= 1;
                if *slot == 0 {
                    ready.push(&edge.child);
                }
            }
        }
    }
    assert_eq!(peeled, data.nodes.len(), "strong subgraph contains a cycle");
}

fn assert_open_range_invariant(data: &Data) {
    for (id, node) in &data.nodes {
        let open = node.ranges.iter().filter(|r| r.end.is_none()).count();
        assert!(open <= 1, "node {id} has {open} open ranges");
        if open == 1 {
            assert!(
                node.ranges.last().unwrap().end.is_none(),
                "open range of {id} is not last"
            );
        }
    }
}

#[test]
fn random_edge_churn_never_creates_a_strong_cycle() {
    let mut rng = StdRng::seed_from_u64(20_240_705);
    let mut harness = Harness::new();
    let root = harness.data.root.clone();

    for _ in 0..12 {
        harness.apply(Action::AddNode {
            parent: root.clone(),
        });
    }

    for _ in 0..400 {
        let ids = harness.node_ids();
        match rng.gen_range(0..4) {
            0 => {
                let parent = ids[rng.gen_range(0..ids.len())].clone();
                harness.apply(Action::AddNode { parent });
            }
            1 => {
                let parent = ids[rng.gen_range(0..ids.len())].clone();
                let child = ids[rng.gen_range(0..ids.len())].clone();
                let kind = if rng.r#gen::<bool>() {
                    EdgeKind::Strong
                } else {
                    EdgeKind::Weak
                };
                harness.apply(Action::AddEdges(vec![NewEdge {
                    parent,
                    child,
                    kind,
                    hidden: false,
                }]));
            }
            2 => {
                let edges: Vec<_> = harness.data.edges.keys().cloned().collect();
                if !edges.is_empty() {
                    let edge = edges[rng.gen_range(0..edges.len())].clone();
                    harness.apply(Action::DeleteEdge(edge));
                }
            }
            _ => {
                let node = ids[rng.gen_range(0..ids.len())].clone();
                harness.apply(Action::DeleteNode(node));
            }
        }
        assert_strong_acyclic(&harness.data);

        // Edges always connect live nodes.
        for edge in harness.data.edges.values() {
            assert!(harness.data.nodes.contains_key(&edge.parent));
            assert!(harness.data.nodes.contains_key(&edge.child));
        }
    }
}

#[test]
fn every_patch_reverses_exactly_under_random_actions() {
    let mut rng = StdRng::seed_from_u64(7_031);
    let mut harness = Harness::new();
    let root = harness.data.root.clone();
    for _ in 0..6 {
        harness.apply(Action::AddNode {
            parent: root.clone(),
        });
    }

    for step in 0..300 {
        let ids = harness.node_ids();
        let id = ids[rng.gen_range(0..ids.len())].clone();
        let action = match rng.gen_range(0..8) {
            0 => Action::AddNode { parent: id },
            1 => Action::Start {
                node: id,
                concurrent: rng.r#gen(),
            },
            2 => Action::Stop(id),
            3 => Action::SetEstimate {
                node: id,
                estimate: f64::from(rng.gen_range(0..10u32)) / 2.0,
            },
            4 => Action::ToDone(id),
            5 => Action::BackToTodo(id),
            6 => Action::MoveUp(id),
            _ => Action::SetText {
                node: id,
                text: format!("note {step}"),
            },
        };

        let before = harness.value.clone();
        let (forward, reverse) = harness.apply(action);

        let mut doc = before.clone();
        apply_patch(&mut doc, &forward).expect("forward applies");
        assert_eq!(doc, harness.value, "forward patch reproduces the state");
        apply_patch(&mut doc, &reverse).expect("reverse applies");
        assert_eq!(doc, before, "reverse patch restores the pre-state");

        assert_open_range_invariant(&harness.data);
        assert_strong_acyclic(&harness.data);
    }
}

#[test]
fn queue_and_node_sets_stay_consistent() {
    let mut harness = Harness::new();
    let root = harness.data.root.clone();
    for _ in 0..5 {
        harness.apply(Action::AddNode {
            parent: root.clone(),
        });
    }
    // Every non-root node sits in the queue exactly once; positions are
    // unique.
    let queue_keys: BTreeSet<_> = harness.data.queue.keys().cloned().collect();
    let non_root: BTreeSet<_> = harness
        .data
        .nodes
        .keys()
        .filter(|id| **id != harness.data.root)
        .cloned()
        .collect();
    assert_eq!(queue_keys, non_root);
    let positions: BTreeSet<String> = harness
        .data
        .queue
        .values()
        .map(|p| format!("{p:?}"))
        .collect();
    assert_eq!(positions.len(), harness.data.queue.len());
}

#[test]
fn undo_redo_ladder_reproduces_states_through_the_engine() {
    let mut engine = Engine::new(braid::config::Config::default());
    let root = engine.data().root.clone();

    let mut states = vec![engine.data().clone()];
    let mut last_node = root.clone();
    for i in 0..10 {
        let action = match i % 3 {
            0 => Action::AddNode {
                parent: root.clone(),
            },
            1 => Action::SetEstimate {
                node: last_node.clone(),
                estimate: 1.0 + i as f64,
            },
            _ => Action::SetText {
                node: last_node.clone(),
                text: format!("step {i}"),
            },
        };
        let outcome = engine.dispatch(action);
        assert!(outcome.changed);
        if let Some(created) = outcome.created {
            last_node = created;
        }
        states.push(engine.data().clone());
    }

    // Walk all the way down and back up; every rung must match the recorded
    // state exactly.
    for expected in states.iter().rev().skip(1) {
        assert!(engine.undo());
        assert_eq!(engine.data(), expected);
    }
    assert!(!engine.undo());
    for expected in states.iter().skip(1) {
        assert!(engine.redo());
        assert_eq!(engine.data(), expected);
    }
    assert!(!engine.redo());
}
