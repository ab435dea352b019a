//! The long-lived engine instance.
//!
//! Owns everything that used to be ambient: the replicated document and its
//! serialized mirror, the undo/redo history, the visit-epoch walker, the
//! next-action predictor tables, and the derived-state caches. All of it is
//! constructed once per running instance and passed by reference to
//! dependents — nothing here is a hidden singleton, which is what keeps the
//! engine testable in isolation.
//!
//! Dispatch is synchronous and single-threaded: reduce, record history,
//! update caches, then emit the patch to the sync pipeline. Undo and redo
//! are expressed as patches between the current and target snapshots and
//! flow through the same channel as ordinary edits.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam::channel::Sender;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::Value;

use crate::config::Config;
use crate::core::{
    Action, CoreError, Data, Graph, NodeId, PatchOp, ReduceCtx, ReplaceCodec, TextCodec, Walker,
    diff_values, reduce,
};
use crate::history::History;
use crate::predict::forecast::{CandidateInput, Forecast, ForecastInputs, LeafInput, forecast};
use crate::predict::next_action::{BiGramPredictor, TriGramPredictor, predict_top_n};
use crate::sync::session::{Bootstrap, LocalChange};

/// Millisecond clock seam. Production uses the system clock; tests drive a
/// manual one.
pub trait TimeSource: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Manually advanced clock.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn advance_ms(&self, delta_ms: u64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set_ms(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }
}

impl TimeSource for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct DispatchOutcome {
    pub changed: bool,
    pub notices: Vec<CoreError>,
    pub created: Option<NodeId>,
}

#[derive(Default)]
struct Caches {
    /// Projected text per node: patches applied so far + result.
    text: HashMap<NodeId, (usize, String)>,
    total_time_ms: HashMap<NodeId, u64>,
    updated_epoch: HashMap<NodeId, u64>,
    affected_epoch: HashMap<NodeId, u64>,
}

pub struct Engine {
    data: Data,
    value: Value,
    history: History<Data>,
    walker: Walker,
    bigram: BiGramPredictor<NodeId>,
    trigram: TriGramPredictor<NodeId>,
    predicted: Vec<NodeId>,
    caches: Caches,
    codec: Box<dyn TextCodec>,
    clock: Arc<dyn TimeSource>,
    changes: Option<Sender<LocalChange>>,
    rng: StdRng,
    config: Config,
}

impl Engine {
    /// Standalone engine over a fresh document (no sync attached).
    pub fn new(config: Config) -> Self {
        let clock: Arc<dyn TimeSource> = Arc::new(SystemTimeSource);
        let data = Data::empty(clock.now_ms());
        Self::from_parts(config, data, clock, None)
    }

    /// Engine over a bootstrapped document, wired to the synchronizer. The
    /// bootstrap's load ops (first-run init, migrations) are emitted as the
    /// session's first patch.
    pub fn from_bootstrap(
        config: Config,
        bootstrap: Bootstrap,
        changes: Sender<LocalChange>,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        let mut engine = Self::from_parts(config, bootstrap.data, clock, Some(changes));
        if !bootstrap.load_ops.is_empty() {
            engine.emit(bootstrap.load_ops, bootstrap.load_reverse);
        }
        engine
    }

    fn from_parts(
        config: Config,
        data: Data,
        clock: Arc<dyn TimeSource>,
        changes: Option<Sender<LocalChange>>,
    ) -> Self {
        let value = serde_json::to_value(&data).expect("Data serializes");
        let history = History::new(data.clone(), config.history.max_entries);
        let mut engine = Self {
            history,
            value,
            walker: Walker::new(),
            bigram: BiGramPredictor::new(config.predictor.decay),
            trigram: TriGramPredictor::new(config.predictor.decay),
            predicted: Vec::new(),
            caches: Caches::default(),
            codec: Box::new(ReplaceCodec),
            clock,
            changes,
            rng: StdRng::from_entropy(),
            config,
            data,
        };
        engine.seed_predictors();
        engine
    }

    /// Replace the text codec (the default is whole-string replacement).
    pub fn set_codec(&mut self, codec: Box<dyn TextCodec>) {
        self.codec = codec;
        self.caches.text.clear();
    }

    /// Deterministic sampling for tests.
    pub fn seed_rng(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    pub fn data(&self) -> &Data {
        &self.data
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    /// Replay historical start events into the predictor tables, oldest
    /// first.
    fn seed_predictors(&mut self) {
        let mut starts: Vec<(u64, NodeId)> = Vec::new();
        for (id, node) in &self.data.nodes {
            if !node.status.is_todo() {
                continue;
            }
            for range in &node.ranges {
                starts.push((range.start, id.clone()));
            }
        }
        starts.sort();
        for (_, id) in starts {
            self.trigram.fit(id.clone());
            self.bigram.fit(id);
        }
        self.refresh_predictions();
    }

    fn refresh_predictions(&mut self) {
        let data = &self.data;
        let eligible = |id: &NodeId| {
            data.nodes
                .get(id)
                .is_some_and(|node| node.status.is_todo() && !node.is_running())
        };
        self.predicted = predict_top_n(
            &self.trigram,
            &self.bigram,
            self.config.predictor.top_n,
            eligible,
        );
    }

    /// Current next-action suggestions, best first.
    pub fn predicted_next_nodes(&self) -> &[NodeId] {
        &self.predicted
    }

    /// Reduce one action against the current state. Notices are non-fatal;
    /// `changed` says whether a patch was produced (and emitted).
    pub fn dispatch(&mut self, action: Action) -> DispatchOutcome {
        let now_ms = self.clock.now_ms();
        let outcome = {
            let mut ctx = ReduceCtx {
                now_ms,
                walker: &mut self.walker,
                codec: self.codec.as_ref(),
            };
            reduce(&self.data, &self.value, &action, &mut ctx)
        };
        for notice in &outcome.notices {
            tracing::warn!(notice = %notice, "action rejected");
        }
        if outcome.forward.is_empty() {
            return DispatchOutcome {
                changed: false,
                notices: outcome.notices,
                created: outcome.created,
            };
        }

        self.mark_tracked_dirty(&outcome.forward);
        self.data = outcome.data;
        self.value = outcome.value;
        self.history.push(self.data.clone());
        if let Some(started) = &outcome.started {
            self.trigram.fit(started.clone());
            self.bigram.fit(started.clone());
        }
        self.refresh_predictions();
        self.emit(outcome.forward, outcome.reverse);

        DispatchOutcome {
            changed: true,
            notices: outcome.notices,
            created: outcome.created,
        }
    }

    /// Step history backward. The movement itself is a patch through the
    /// normal pipeline; history is not pushed again.
    pub fn undo(&mut self) -> bool {
        let Some(target) = self.history.undo().cloned() else {
            return false;
        };
        self.apply_snapshot(target)
    }

    /// Step history forward.
    pub fn redo(&mut self) -> bool {
        let Some(target) = self.history.redo().cloned() else {
            return false;
        };
        self.apply_snapshot(target)
    }

    fn apply_snapshot(&mut self, target: Data) -> bool {
        let target_value = serde_json::to_value(&target).expect("Data serializes");
        let (forward, reverse) = diff_values(&self.value, &target_value);
        if forward.is_empty() {
            return false;
        }
        self.mark_tracked_dirty(&forward);
        self.data = target;
        self.value = target_value;
        self.refresh_predictions();
        self.emit(forward, reverse);
        true
    }

    fn emit(&mut self, forward: Vec<PatchOp>, reverse: Vec<PatchOp>) {
        let Some(changes) = &self.changes else {
            return;
        };
        let change = LocalChange {
            forward,
            reverse,
            created_at: self.clock.now_ms(),
        };
        if changes.send(change).is_err() {
            tracing::warn!("sync channel closed; edits stay local");
            self.changes = None;
        }
    }

    /// Ops touching `/nodes/<id>/ranges` — or adding/removing a node
    /// wholesale — dirty that node's tracked-time aggregate and every
    /// ancestor's.
    fn mark_tracked_dirty(&mut self, ops: &[PatchOp]) {
        let mut touched: Vec<NodeId> = Vec::new();
        for op in ops {
            let mut segments = op.path.split('/');
            if segments.next() != Some("") || segments.next() != Some("nodes") {
                continue;
            }
            let Some(raw_id) = segments.next() else {
                continue;
            };
            match segments.next() {
                Some("ranges") | None => {}
                Some(_) => continue,
            }
            if let Ok(id) = NodeId::parse(raw_id)
                && !touched.contains(&id)
            {
                touched.push(id);
            }
        }
        if touched.is_empty() {
            return;
        }
        let epoch = self.walker.next_epoch();
        for id in touched {
            // The node may be gone in the post-state; ancestors are resolved
            // against the current data, which is fine for cache dirtying.
            for ancestor in self.walker.ancestors(&self.data, &id) {
                self.caches.affected_epoch.insert(ancestor, epoch);
            }
        }
    }

    /// Tracked-time total for the strong-descendant subtree, recomputed only
    /// when a range edit has dirtied it since the last read. Comparing the
    /// two epochs makes recomputation idempotent and order-independent.
    pub fn total_time_ms(&mut self, id: &NodeId) -> u64 {
        let affected = self.caches.affected_epoch.get(id).copied();
        let updated = self.caches.updated_epoch.get(id).copied();
        let stale = match (updated, affected) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(u), Some(a)) => u < a,
        };
        if stale || !self.caches.total_time_ms.contains_key(id) {
            let total = Graph::new(&mut self.data, &mut self.walker).total_tracked_ms(id);
            self.caches.total_time_ms.insert(id.clone(), total);
            let epoch = affected.unwrap_or_else(|| self.walker.next_epoch());
            self.caches.updated_epoch.insert(id.clone(), epoch);
        }
        self.caches.total_time_ms[id]
    }

    /// Projected text for a node. Patches are append-only, so the cache only
    /// ever applies the new tail.
    pub fn text(&mut self, id: &NodeId) -> String {
        let Some(node) = self.data.nodes.get(id) else {
            return String::new();
        };
        let patches = &node.text_patches;
        let (mut applied, mut text) = self
            .caches
            .text
            .get(id)
            .cloned()
            .unwrap_or((0, String::new()));
        if applied > patches.len() {
            // History moved backward under this cache entry; rebuild.
            applied = 0;
            text = String::new();
        }
        for patch in &patches[applied..] {
            match self.codec.apply(&text, &patch.ops) {
                Ok(next) => text = next,
                Err(reason) => {
                    tracing::warn!(node = %id, reason, "text patch does not apply");
                    break;
                }
            }
        }
        self.caches
            .text
            .insert(id.clone(), (patches.len(), text.clone()));
        text
    }

    /// Monte-Carlo completion forecast for the subtree rooted at `id`.
    pub fn forecast(&mut self, id: &NodeId) -> Forecast {
        // Todo strong-descendants that are actionable leaves with estimates.
        let mut leaf_ids: Vec<NodeId> = Vec::new();
        {
            let data = &self.data;
            self.walker.for_each_strong_descendant(data, id, |node_id| {
                let Some(node) = data.nodes.get(node_id) else {
                    return;
                };
                if !node.status.is_todo() || !node.has_estimate() {
                    return;
                }
                let blocked = node.children.keys().any(|edge_id| {
                    data.edges.get(edge_id).is_some_and(|edge| {
                        edge.kind.is_strong()
                            && data
                                .nodes
                                .get(&edge.child)
                                .is_some_and(|child| child.status.is_todo())
                    })
                });
                if !blocked {
                    leaf_ids.push(node_id.clone());
                }
            });
        }

        // Calibration candidates: anything finished (or abandoned) with an
        // estimate, scored by how its tracked time compared to it.
        let candidate_ids: Vec<NodeId> = self
            .data
            .nodes
            .iter()
            .filter(|(_, node)| !node.status.is_todo() && node.has_estimate())
            .map(|(id, _)| id.clone())
            .collect();

        let leaves: Vec<LeafInput> = leaf_ids
            .iter()
            .map(|leaf_id| LeafInput {
                estimate: self.data.nodes[leaf_id].estimate,
                start_time: self.data.nodes[leaf_id].start_time,
                ancestors: self.walker.ancestors(&self.data, leaf_id),
            })
            .collect();
        let candidates: Vec<CandidateInput> = candidate_ids
            .iter()
            .map(|candidate_id| {
                let tracked = self.total_time_ms(candidate_id) as f64;
                let node = &self.data.nodes[candidate_id];
                CandidateInput {
                    ratio: tracked / (3_600_000.0 * node.estimate),
                    start_time: node.start_time,
                    ancestors: self.walker.ancestors(&self.data, candidate_id),
                }
            })
            .collect();

        let inputs = ForecastInputs {
            leaves,
            candidates,
            trials: self.config.forecast.trials,
            half_life_ms: self.config.forecast.half_life_ms as f64,
        };
        forecast(&inputs, &mut self.rng)
    }
}
