//! Head reconciliation.
//!
//! Per-session state machine: Idle -> Pushing -> {Acknowledged, Conflicted}.
//! Three cooperating pieces:
//!
//! - the engine thread emits `LocalChange`s (forward/reverse op lists);
//! - the log thread keys each change into the session's causal chain and
//!   appends it durably (patch + pending mark + local head, one
//!   transaction), then hands the new head to the push thread;
//! - the push thread drains pending patches FIFO in batches, then attempts
//!   a compare-and-swap of the authoritative head. A CAS miss parks the
//!   push thread on a blocking operator choice: adopt the remote head (and
//!   reload) or force-adopt the local one (re-assert our head view at the
//!   FRONT of the retry queue, then let the parked CAS retry succeed).
//!
//! Every remote call checks connectivity first and retries transport errors
//! without bound; unpushed local patches are never discarded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use serde_json::Value;
use thiserror::Error;

use crate::config::SyncConfig;
use crate::core::{
    ClientId, Data, PatchKey, PatchOp, PatchRecord, PatchSeq, SessionId, apply_patch, diff_values,
};
use crate::error::{Effect, Transience};
use crate::migrate;

use super::remote::{Connectivity, Remote, RemoteError, RemoteHead, WirePatch};
use super::retry::{Backoff, Hooks, RetryPolicy, RetryQueue};
use super::store::{PatchStore, StoreError};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("synchronizer is shut down")]
    Shutdown,
}

impl SyncError {
    pub fn transience(&self) -> Transience {
        match self {
            SyncError::Store(e) => e.transience(),
            SyncError::Remote(e) => e.transience(),
            SyncError::Shutdown => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            SyncError::Store(e) => e.effect(),
            SyncError::Remote(e) => e.effect(),
            SyncError::Shutdown => Effect::None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Pushing,
    Acknowledged,
    Conflicted,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SyncEvent {
    /// The authoritative head now points at our chain.
    Acknowledged { head: PatchKey },
    /// The head moved under us; operator must choose.
    Conflicted {
        actual: RemoteHead,
        expected: Option<PatchKey>,
    },
    /// Heads were reset to the remote chain; the in-memory state is stale
    /// and must be rebuilt from the store.
    ReloadRequired,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictChoice {
    AdoptRemote,
    ForceAdoptLocal,
}

/// One reduced edit, as emitted by the engine. Keys are assigned by the log
/// thread.
#[derive(Clone, Debug)]
pub struct LocalChange {
    pub forward: Vec<PatchOp>,
    pub reverse: Vec<PatchOp>,
    pub created_at: u64,
}

/// Result of `Synchronizer::bootstrap`: the materialized document plus the
/// ops (migrations, first-run init) that must be recorded as the session's
/// first patch.
pub struct Bootstrap {
    pub data: Data,
    pub load_ops: Vec<PatchOp>,
    pub load_reverse: Vec<PatchOp>,
    pub client_id: ClientId,
    pub session_id: SessionId,
}

struct ConflictGate {
    slot: Mutex<Option<Option<ConflictChoice>>>,
    decided: Condvar,
}

impl ConflictGate {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            decided: Condvar::new(),
        }
    }

    /// Open the gate for a decision. Called before the conflict is
    /// announced so a prompt `decide` cannot race the parking thread.
    fn arm(&self) {
        let mut slot = self.slot.lock().expect("conflict mutex");
        if slot.is_none() {
            *slot = Some(None);
        }
    }

    /// Park until the operator chooses (or shutdown).
    fn wait_for_choice(&self, shutdown: &AtomicBool) -> Option<ConflictChoice> {
        let mut slot = self.slot.lock().expect("conflict mutex");
        if slot.is_none() {
            *slot = Some(None);
        }
        loop {
            if shutdown.load(Ordering::Relaxed) {
                *slot = None;
                return None;
            }
            if let Some(Some(choice)) = *slot {
                *slot = None;
                return Some(choice);
            }
            let (next, _) = self
                .decided
                .wait_timeout(slot, Duration::from_millis(100))
                .expect("conflict mutex");
            slot = next;
        }
    }

    /// Deliver a choice; false when nothing is waiting.
    fn decide(&self, choice: ConflictChoice) -> bool {
        let mut slot = self.slot.lock().expect("conflict mutex");
        match slot.as_mut() {
            Some(pending @ None) => {
                *pending = Some(choice);
                self.decided.notify_all();
                true
            }
            _ => false,
        }
    }
}

pub struct Synchronizer {
    store: Arc<PatchStore>,
    change_tx: Sender<LocalChange>,
    events_rx: Receiver<SyncEvent>,
    phase: Arc<Mutex<SyncPhase>>,
    conflict: Arc<ConflictGate>,
    needs_reload: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    queue: Arc<RetryQueue>,
    remote: Arc<dyn Remote>,
    connectivity: Arc<dyn Connectivity>,
    client_id: ClientId,
    config: SyncConfig,
    joins: Vec<JoinHandle<()>>,
}

impl Synchronizer {
    /// Prepare the local store against the remote: ensure a client id, adopt
    /// the remote head on first run, drain remote pending patches, and
    /// materialize the document (chain replay + migration).
    pub fn bootstrap(
        store: &PatchStore,
        remote: &dyn Remote,
        connectivity: &dyn Connectivity,
        config: &SyncConfig,
        client_name: &str,
        now_ms: u64,
    ) -> crate::Result<Bootstrap> {
        let policy = RetryPolicy::from_config(config);
        let never_stop = AtomicBool::new(false);

        let client_id = match store.client_id()? {
            Some(id) => id,
            None => {
                let id = blocking_retry(connectivity, policy, &never_stop, || {
                    remote.register_client(client_name)
                })
                .map_err(SyncError::Remote)?;
                store.set_client_id(id)?;
                id
            }
        };
        let session_id = store.next_session_id()?;

        let mut local_head = store.head("local")?;
        if local_head.is_none() {
            // First run on this device: adopt the remote chain if one
            // exists.
            match blocking_retry(connectivity, policy, &never_stop, || remote.get_head()) {
                Ok(head) => {
                    store.set_heads(&head.key)?;
                    local_head = Some(head.key);
                }
                Err(RemoteError::Rejected { .. }) => {
                    // Fresh account: no head yet, start a new chain.
                }
                Err(err) => return Err(SyncError::Remote(err).into()),
            }
        }
        drain_remote_pending(
            store,
            remote,
            connectivity,
            policy,
            &never_stop,
            client_id,
            config.pull_page,
        )
        .map_err(crate::Error::from)?;

        let (data, load_ops, load_reverse) = match local_head {
            None => fresh_document(now_ms),
            Some(head) => {
                let replay_started = Instant::now();
                let (mut doc, records) = store.load_chain(&head)?;
                for record in &records {
                    apply_patch(&mut doc, &record.forward).map_err(crate::Error::from)?;
                }
                if replay_started.elapsed().as_millis() as u64 > config.snapshot_threshold_ms {
                    // Bound the next replay.
                    store.write_snapshot(&head, &doc, now_ms)?;
                }
                if doc.is_null() {
                    fresh_document(now_ms)
                } else {
                    let (load_ops, load_reverse) = migrate::migrate_to_current(&mut doc)?;
                    let data: Data =
                        serde_json::from_value(doc).map_err(|e| migrate::MigrateError::Parse {
                            reason: e.to_string(),
                        })?;
                    (data, load_ops, load_reverse)
                }
            }
        };

        Ok(Bootstrap {
            data,
            load_ops,
            load_reverse,
            client_id,
            session_id,
        })
    }

    /// Spawn the log and push threads.
    pub fn start(
        store: Arc<PatchStore>,
        remote: Arc<dyn Remote>,
        connectivity: Arc<dyn Connectivity>,
        config: SyncConfig,
        client_id: ClientId,
        session_id: SessionId,
    ) -> crate::Result<Self> {
        let policy = RetryPolicy::from_config(&config);
        let queue = Arc::new(RetryQueue::start(
            policy,
            Hooks {
                before: Some(Box::new(|label| tracing::debug!(task = label, "rpc start"))),
                after: Some(Box::new(|label| tracing::debug!(task = label, "rpc end"))),
            },
        ));
        let (change_tx, change_rx) = unbounded::<LocalChange>();
        let (head_tx, head_rx) = unbounded::<PatchKey>();
        let (events_tx, events_rx) = unbounded::<SyncEvent>();
        let phase = Arc::new(Mutex::new(SyncPhase::Idle));
        let conflict = Arc::new(ConflictGate::new());
        let needs_reload = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(AtomicBool::new(false));

        let parent = store.head("local")?;

        let log_store = Arc::clone(&store);
        let log_shutdown = Arc::clone(&shutdown);
        let log_join = std::thread::Builder::new()
            .name("braid-log".to_string())
            .spawn(move || {
                run_log_loop(
                    log_store,
                    change_rx,
                    head_tx,
                    log_shutdown,
                    client_id,
                    session_id,
                    parent,
                );
            })
            .expect("spawn log thread");

        let push = PushRuntime {
            store: Arc::clone(&store),
            remote: Arc::clone(&remote),
            connectivity: Arc::clone(&connectivity),
            queue: Arc::clone(&queue),
            events: events_tx,
            phase: Arc::clone(&phase),
            conflict: Arc::clone(&conflict),
            needs_reload: Arc::clone(&needs_reload),
            shutdown: Arc::clone(&shutdown),
            client_id,
            config: config.clone(),
        };
        let push_join = std::thread::Builder::new()
            .name("braid-push".to_string())
            .spawn(move || run_push_loop(push, head_rx))
            .expect("spawn push thread");

        Ok(Self {
            store,
            change_tx,
            events_rx,
            phase,
            conflict,
            needs_reload,
            shutdown,
            queue,
            remote,
            connectivity,
            client_id,
            config,
            joins: vec![log_join, push_join],
        })
    }

    /// Sender the engine uses to emit reduced edits.
    pub fn change_sender(&self) -> Sender<LocalChange> {
        self.change_tx.clone()
    }

    /// Event stream: acknowledgements, conflicts, reload requests.
    pub fn events(&self) -> Receiver<SyncEvent> {
        self.events_rx.clone()
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.lock().expect("phase mutex")
    }

    /// Locally appended patches not yet remote-acknowledged.
    pub fn pending_count(&self) -> crate::Result<u64> {
        Ok(self.store.pending_count()?)
    }

    /// Deliver the operator's choice for a blocking conflict. Returns false
    /// when no conflict is waiting.
    pub fn resolve(&self, choice: ConflictChoice) -> bool {
        self.conflict.decide(choice)
    }

    /// Re-fetch the authoritative head and drain remote pending patches
    /// (reconnect / window-focus check). Returns the actual head when it
    /// does not match our recorded remote head.
    pub fn check_remote_head(&self) -> crate::Result<Option<RemoteHead>> {
        let remote = Arc::clone(&self.remote);
        let connectivity = Arc::clone(&self.connectivity);
        let actual = self
            .queue
            .call("check_remote_head", move || {
                if !connectivity.is_online() {
                    return None;
                }
                match remote.get_head() {
                    Ok(head) => Some(Ok(head)),
                    Err(err) if err.transience().is_retryable() => None,
                    Err(err) => Some(Err(err)),
                }
            })
            .ok_or(SyncError::Shutdown)?
            .map_err(SyncError::Remote)?;
        let policy = RetryPolicy::from_config(&self.config);
        drain_remote_pending(
            &self.store,
            self.remote.as_ref(),
            self.connectivity.as_ref(),
            policy,
            &self.shutdown,
            self.client_id,
            self.config.pull_page,
        )?;

        let expected = self.store.head("remote")?;
        if Some(actual.key) == expected {
            return Ok(None);
        }
        tracing::warn!(?actual, ?expected, "remote head moved under us");
        Ok(Some(actual))
    }

    /// Adopt the remote chain: reset both heads and require a reload. Local
    /// patches stay in the store (and in the pending set) untouched.
    pub fn adopt_remote(&self, head: &PatchKey) -> crate::Result<()> {
        self.store.set_heads(head)?;
        self.needs_reload.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// True once the in-memory state is stale (after adopting the remote
    /// chain) and the caller must rebuild from the store.
    pub fn needs_reload(&self) -> bool {
        self.needs_reload.load(Ordering::Relaxed)
    }

    /// Stop the worker threads. Unpushed patches remain durable and pending;
    /// they push on the next session.
    pub fn shutdown(self) {}
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        // Stop the queue first: a push-thread call blocked on a task result
        // unblocks when the worker drops its queue.
        self.queue.request_stop();
        for join in self.joins.drain(..) {
            let _ = join.join();
        }
    }
}

fn fresh_document(now_ms: u64) -> (Data, Vec<PatchOp>, Vec<PatchOp>) {
    let data = Data::empty(now_ms);
    let value = serde_json::to_value(&data).expect("Data serializes");
    let (load_ops, load_reverse) = diff_values(&Value::Null, &value);
    (data, load_ops, load_reverse)
}

/// Retry a remote call on the current thread: require connectivity, then
/// back off on transient errors without bound (until `stop`). Permanent
/// rejections surface immediately.
fn blocking_retry<T>(
    connectivity: &dyn Connectivity,
    policy: RetryPolicy,
    stop: &AtomicBool,
    mut call: impl FnMut() -> Result<T, RemoteError>,
) -> Result<T, RemoteError> {
    let mut backoff = Backoff::new(policy);
    let mut rng = rand::thread_rng();
    loop {
        if stop.load(Ordering::Relaxed) {
            return Err(RemoteError::Rejected {
                reason: "synchronizer is shutting down".to_string(),
            });
        }
        if !connectivity.is_online() {
            std::thread::sleep(Duration::from_millis(50));
            continue;
        }
        match call() {
            Ok(value) => return Ok(value),
            Err(err) if err.transience().is_retryable() => {
                let delay = backoff.next_delay(&mut rng);
                tracing::debug!(error = %err, ?delay, "remote call failed, backing off");
                std::thread::sleep(delay);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Page remote-pending patches into the local store, deleting each page
/// server-side once it is durable locally.
#[allow(clippy::too_many_arguments)]
fn drain_remote_pending(
    store: &PatchStore,
    remote: &dyn Remote,
    connectivity: &dyn Connectivity,
    policy: RetryPolicy,
    stop: &AtomicBool,
    client_id: ClientId,
    page_size: usize,
) -> Result<(), SyncError> {
    loop {
        let patches = blocking_retry(connectivity, policy, stop, || {
            remote.get_pending_patches(client_id, page_size)
        })?;
        if patches.is_empty() {
            return Ok(());
        }
        let records: Vec<PatchRecord> = patches
            .iter()
            .map(|wire| PatchRecord {
                key: wire.patch_key,
                parent: wire.parent_patch_key,
                forward: wire.patch.clone(),
                reverse: Vec::new(),
                created_at: wire.created_at,
            })
            .collect();
        store.store_remote_patches(&records)?;
        let keys: Vec<PatchKey> = patches.iter().map(|wire| wire.patch_key).collect();
        blocking_retry(connectivity, policy, stop, || {
            remote.delete_pending_patches(client_id, &keys)
        })?;
    }
}

fn run_log_loop(
    store: Arc<PatchStore>,
    change_rx: Receiver<LocalChange>,
    head_tx: Sender<PatchKey>,
    shutdown: Arc<AtomicBool>,
    client_id: ClientId,
    session_id: SessionId,
    mut parent: Option<PatchKey>,
) {
    let mut next_seq: i64 = 0;
    loop {
        let change = match change_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(change) => change,
            Err(RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::Relaxed) {
                    return;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => return,
        };
        let key = PatchKey::new(client_id, session_id, PatchSeq(next_seq));
        let record = PatchRecord {
            key,
            // A chain root points at itself.
            parent: parent.unwrap_or(key),
            forward: change.forward,
            reverse: change.reverse,
            created_at: change.created_at,
        };
        match store.append_local(&record) {
            Ok(()) => {
                next_seq += 1;
                parent = Some(key);
                if head_tx.send(key).is_err() {
                    return;
                }
            }
            Err(err) => {
                // The patch is lost for replication but the in-memory state
                // already advanced; surface loudly.
                tracing::error!(error = %err, ?key, "durable append failed, dropping patch");
            }
        }
    }
}

struct PushRuntime {
    store: Arc<PatchStore>,
    remote: Arc<dyn Remote>,
    connectivity: Arc<dyn Connectivity>,
    queue: Arc<RetryQueue>,
    events: Sender<SyncEvent>,
    phase: Arc<Mutex<SyncPhase>>,
    conflict: Arc<ConflictGate>,
    needs_reload: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    client_id: ClientId,
    config: SyncConfig,
}

impl PushRuntime {
    fn set_phase(&self, phase: SyncPhase) {
        *self.phase.lock().expect("phase mutex") = phase;
    }
}

fn run_push_loop(runtime: PushRuntime, head_rx: Receiver<PatchKey>) {
    for head in &head_rx {
        if runtime.shutdown.load(Ordering::Relaxed) {
            return;
        }
        if runtime.needs_reload.load(Ordering::Relaxed) {
            // Stale session: keep appending locally, push nothing.
            continue;
        }
        // Collapse a burst of heads to the newest one.
        let head = std::iter::once(head)
            .chain(head_rx.try_iter())
            .last()
            .expect("at least one head");

        runtime.set_phase(SyncPhase::Pushing);
        match push_until_acknowledged(&runtime, head) {
            Ok(()) => {}
            Err(SyncError::Shutdown) => return,
            Err(err) => {
                tracing::error!(error = %err, "push loop error");
                runtime.set_phase(SyncPhase::Idle);
            }
        }
    }
}

fn push_until_acknowledged(runtime: &PushRuntime, head: PatchKey) -> Result<(), SyncError> {
    loop {
        drain_local_pending(runtime)?;

        let expected = runtime.store.head("remote")?;
        if expected == Some(head) {
            runtime.set_phase(SyncPhase::Acknowledged);
            return Ok(());
        }
        let remote = Arc::clone(&runtime.remote);
        let connectivity = Arc::clone(&runtime.connectivity);
        let updated = runtime
            .queue
            .call("update_head", move || {
                if !connectivity.is_online() {
                    return None;
                }
                remote.update_head(head, expected).ok()
            })
            .ok_or(SyncError::Shutdown)?;

        if updated {
            runtime.store.set_head("remote", &head)?;
            runtime.set_phase(SyncPhase::Acknowledged);
            let _ = runtime.events.send(SyncEvent::Acknowledged { head });
            return Ok(());
        }

        // CAS miss: someone else advanced the head. Fetch the truth, pull
        // their patches down, and park for the operator.
        runtime.set_phase(SyncPhase::Conflicted);
        let policy = RetryPolicy::from_config(&runtime.config);
        let actual = blocking_retry(
            runtime.connectivity.as_ref(),
            policy,
            &runtime.shutdown,
            || runtime.remote.get_head(),
        )?;
        drain_remote_pending(
            &runtime.store,
            runtime.remote.as_ref(),
            runtime.connectivity.as_ref(),
            policy,
            &runtime.shutdown,
            runtime.client_id,
            runtime.config.pull_page,
        )?;
        runtime.conflict.arm();
        let _ = runtime.events.send(SyncEvent::Conflicted {
            actual: actual.clone(),
            expected,
        });

        let Some(choice) = runtime.conflict.wait_for_choice(&runtime.shutdown) else {
            return Err(SyncError::Shutdown);
        };
        match choice {
            ConflictChoice::AdoptRemote => {
                runtime.store.set_heads(&actual.key)?;
                runtime.needs_reload.store(true, Ordering::Relaxed);
                runtime.set_phase(SyncPhase::Idle);
                let _ = runtime.events.send(SyncEvent::ReloadRequired);
                return Ok(());
            }
            ConflictChoice::ForceAdoptLocal => {
                // Re-assert the head we believed in, unconditionally and at
                // the FRONT of the queue, so this loop's next CAS (expecting
                // exactly that head) lands. Nothing local is discarded.
                if let Some(expected) = expected {
                    let remote = Arc::clone(&runtime.remote);
                    let connectivity = Arc::clone(&runtime.connectivity);
                    runtime
                        .queue
                        .call_front("force_head_override", move || {
                            if !connectivity.is_online() {
                                return None;
                            }
                            remote.update_head(expected, None).ok().map(|_| ())
                        })
                        .ok_or(SyncError::Shutdown)?;
                }
                runtime.set_phase(SyncPhase::Pushing);
                // Loop: drain anything new, CAS again.
            }
        }
    }
}

/// Push every locally pending patch in FIFO batches, unmarking each batch
/// once the remote acknowledged it.
fn drain_local_pending(runtime: &PushRuntime) -> Result<(), SyncError> {
    loop {
        let page = runtime.store.pending_page(runtime.config.push_batch)?;
        if page.is_empty() {
            return Ok(());
        }
        let records = runtime.store.read_patches(&page)?;
        let batch: Vec<WirePatch> = records
            .iter()
            .map(|record| WirePatch {
                patch_key: record.key,
                parent_patch_key: record.parent,
                patch: record.forward.clone(),
                created_at: record.created_at,
            })
            .collect();
        let remote = Arc::clone(&runtime.remote);
        let connectivity = Arc::clone(&runtime.connectivity);
        let client_id = runtime.client_id;
        runtime
            .queue
            .call("create_patches", move || {
                if !connectivity.is_online() {
                    return None;
                }
                remote.create_patches(client_id, &batch).ok()
            })
            .ok_or(SyncError::Shutdown)?;
        runtime.store.remove_pending(&page)?;
    }
}
