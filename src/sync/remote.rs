//! The reconciliation API.
//!
//! One authoritative remote store per user. Patches are append-only and
//! fan out to every other registered client as "pending" until that client
//! acknowledges them; the head moves by compare-and-swap, which is the whole
//! concurrency story: a CAS miss means another session advanced the head
//! first and the operator has to choose sides.
//!
//! `MemoryRemote` implements the trait in-process with fault injection for
//! tests; a production implementation wraps the HTTP API with the same
//! shapes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{ClientId, PatchKey, PatchOp};
use crate::error::{Effect, Transience};

/// A patch as pushed over the wire: forward ops only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WirePatch {
    pub patch_key: PatchKey,
    pub parent_patch_key: PatchKey,
    pub patch: Vec<PatchOp>,
    pub created_at: u64,
}

/// The authoritative head plus provenance for the conflict surface.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteHead {
    pub key: PatchKey,
    pub created_at: u64,
    /// Name of the client that set the head (shown to the operator).
    pub name: String,
}

#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// Transport-level failure; retrying may help.
    #[error("remote unavailable: {reason}")]
    Unavailable { reason: String },

    /// The server answered and said no; retrying the same request will not
    /// help.
    #[error("remote rejected request: {reason}")]
    Rejected { reason: String },
}

impl RemoteError {
    pub fn transience(&self) -> Transience {
        match self {
            RemoteError::Unavailable { .. } => Transience::Retryable,
            RemoteError::Rejected { .. } => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            // The request may or may not have landed before the transport
            // broke.
            RemoteError::Unavailable { .. } => Effect::Unknown,
            RemoteError::Rejected { .. } => Effect::None,
        }
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

pub trait Remote: Send + Sync {
    /// Register this device; returns its stable client id.
    fn register_client(&self, name: &str) -> RemoteResult<ClientId>;

    fn get_head(&self) -> RemoteResult<RemoteHead>;

    /// Append a batch of patches. Idempotent per key.
    fn create_patches(&self, client: ClientId, batch: &[WirePatch]) -> RemoteResult<()>;

    /// Set the head to `new`. With `expected_prev`, only if the current head
    /// still matches (compare-and-swap); returns whether the head moved.
    fn update_head(&self, new: PatchKey, expected_prev: Option<PatchKey>) -> RemoteResult<bool>;

    /// Patches other clients pushed that `client` has not yet acknowledged.
    fn get_pending_patches(&self, client: ClientId, limit: usize) -> RemoteResult<Vec<WirePatch>>;

    fn delete_pending_patches(&self, client: ClientId, keys: &[PatchKey]) -> RemoteResult<()>;
}

/// Connectivity gate. Every remote call awaits this first; the production
/// implementation watches the platform's online state.
pub trait Connectivity: Send + Sync {
    fn is_online(&self) -> bool;
    /// Block until online.
    fn wait_online(&self);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysOnline;

impl Connectivity for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }

    fn wait_online(&self) {}
}

/// Toggleable connectivity for tests and manual offline mode.
#[derive(Default)]
pub struct SwitchedConnectivity {
    online: Mutex<bool>,
    changed: Condvar,
}

impl SwitchedConnectivity {
    pub fn new(online: bool) -> Self {
        Self {
            online: Mutex::new(online),
            changed: Condvar::new(),
        }
    }

    pub fn set_online(&self, online: bool) {
        *self.online.lock().expect("connectivity mutex") = online;
        self.changed.notify_all();
    }
}

impl Connectivity for SwitchedConnectivity {
    fn is_online(&self) -> bool {
        *self.online.lock().expect("connectivity mutex")
    }

    fn wait_online(&self) {
        let mut online = self.online.lock().expect("connectivity mutex");
        while !*online {
            online = self.changed.wait(online).expect("connectivity mutex");
        }
    }
}

#[derive(Default)]
struct MemoryRemoteState {
    clients: BTreeMap<ClientId, String>,
    next_client: i64,
    patches: BTreeMap<PatchKey, WirePatch>,
    pending: BTreeMap<ClientId, BTreeSet<PatchKey>>,
    head: Option<RemoteHead>,
    now_ms: u64,
}

/// In-memory remote with failure injection.
#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<MemoryRemoteState>,
    /// Each call decrements this; while positive, calls fail as
    /// `Unavailable`.
    fail_next: AtomicUsize,
}

impl MemoryRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self, calls: usize) {
        self.fail_next.store(calls, Ordering::SeqCst);
    }

    pub fn advance_clock(&self, delta_ms: u64) {
        self.state.lock().expect("remote mutex").now_ms += delta_ms;
    }

    /// Total patches the remote has seen.
    pub fn patch_count(&self) -> usize {
        self.state.lock().expect("remote mutex").patches.len()
    }

    pub fn head_key(&self) -> Option<PatchKey> {
        self.state
            .lock()
            .expect("remote mutex")
            .head
            .as_ref()
            .map(|head| head.key)
    }

    /// Set the head out-of-band, as another session would.
    pub fn set_head_as(&self, name: &str, key: PatchKey) {
        let mut state = self.state.lock().expect("remote mutex");
        let created_at = state.now_ms;
        state.head = Some(RemoteHead {
            key,
            created_at,
            name: name.to_string(),
        });
    }

    fn gate(&self) -> RemoteResult<()> {
        let remaining = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if remaining {
            return Err(RemoteError::Unavailable {
                reason: "injected fault".to_string(),
            });
        }
        Ok(())
    }
}

impl Remote for MemoryRemote {
    fn register_client(&self, name: &str) -> RemoteResult<ClientId> {
        self.gate()?;
        let mut state = self.state.lock().expect("remote mutex");
        state.next_client += 1;
        let id = ClientId(state.next_client);
        state.clients.insert(id, name.to_string());
        // A new client starts with the full history pending so it can
        // materialize the chain.
        let backlog: BTreeSet<PatchKey> = state.patches.keys().copied().collect();
        state.pending.insert(id, backlog);
        Ok(id)
    }

    fn get_head(&self) -> RemoteResult<RemoteHead> {
        self.gate()?;
        let state = self.state.lock().expect("remote mutex");
        state.head.clone().ok_or_else(|| RemoteError::Rejected {
            reason: "no head registered".to_string(),
        })
    }

    fn create_patches(&self, client: ClientId, batch: &[WirePatch]) -> RemoteResult<()> {
        self.gate()?;
        let mut state = self.state.lock().expect("remote mutex");
        if !state.clients.contains_key(&client) {
            return Err(RemoteError::Rejected {
                reason: format!("unknown client {client:?}"),
            });
        }
        let others: Vec<ClientId> = state
            .clients
            .keys()
            .filter(|id| **id != client)
            .copied()
            .collect();
        for patch in batch {
            if state.patches.insert(patch.patch_key, patch.clone()).is_none() {
                for other in &others {
                    state
                        .pending
                        .entry(*other)
                        .or_default()
                        .insert(patch.patch_key);
                }
            }
        }
        Ok(())
    }

    fn update_head(&self, new: PatchKey, expected_prev: Option<PatchKey>) -> RemoteResult<bool> {
        self.gate()?;
        let mut state = self.state.lock().expect("remote mutex");
        if let Some(expected) = expected_prev {
            let current = state.head.as_ref().map(|head| head.key);
            if current.is_some_and(|key| key != expected) {
                return Ok(false);
            }
        }
        let name = state
            .clients
            .get(&new.client_id)
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());
        let created_at = state.now_ms;
        state.head = Some(RemoteHead {
            key: new,
            created_at,
            name,
        });
        Ok(true)
    }

    fn get_pending_patches(&self, client: ClientId, limit: usize) -> RemoteResult<Vec<WirePatch>> {
        self.gate()?;
        let state = self.state.lock().expect("remote mutex");
        let Some(pending) = state.pending.get(&client) else {
            return Ok(Vec::new());
        };
        Ok(pending
            .iter()
            .take(limit)
            .filter_map(|key| state.patches.get(key).cloned())
            .collect())
    }

    fn delete_pending_patches(&self, client: ClientId, keys: &[PatchKey]) -> RemoteResult<()> {
        self.gate()?;
        let mut state = self.state.lock().expect("remote mutex");
        if let Some(pending) = state.pending.get_mut(&client) {
            for key in keys {
                pending.remove(key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PatchSeq, SessionId};

    fn key(client: i64, session: i64, patch: i64) -> PatchKey {
        PatchKey::new(ClientId(client), SessionId(session), PatchSeq(patch))
    }

    fn wire(k: PatchKey) -> WirePatch {
        WirePatch {
            patch_key: k,
            parent_patch_key: k,
            patch: vec![],
            created_at: 0,
        }
    }

    #[test]
    fn patches_fan_out_to_other_clients_only() {
        let remote = MemoryRemote::new();
        let alice = remote.register_client("alice").unwrap();
        let bob = remote.register_client("bob").unwrap();

        remote
            .create_patches(alice, &[wire(key(alice.0, 1, 0))])
            .unwrap();
        assert!(remote.get_pending_patches(alice, 10).unwrap().is_empty());
        let for_bob = remote.get_pending_patches(bob, 10).unwrap();
        assert_eq!(for_bob.len(), 1);

        remote
            .delete_pending_patches(bob, &[key(alice.0, 1, 0)])
            .unwrap();
        assert!(remote.get_pending_patches(bob, 10).unwrap().is_empty());
    }

    #[test]
    fn head_cas_only_moves_on_match() {
        let remote = MemoryRemote::new();
        let alice = remote.register_client("alice").unwrap();
        let a0 = key(alice.0, 1, 0);
        let a1 = key(alice.0, 1, 1);
        let other = key(99, 1, 7);

        // Unconditional set always lands.
        assert!(remote.update_head(a0, None).unwrap());
        // CAS from the right expectation.
        assert!(remote.update_head(a1, Some(a0)).unwrap());
        // Stale expectation is refused, head unchanged.
        assert!(!remote.update_head(other, Some(a0)).unwrap());
        assert_eq!(remote.head_key(), Some(a1));
    }

    #[test]
    fn injected_faults_are_transient() {
        let remote = MemoryRemote::new();
        remote.fail_next(2);
        assert!(remote.get_head().is_err());
        assert!(remote.register_client("x").is_err());
        assert!(remote.register_client("x").is_ok());
    }

    #[test]
    fn switched_connectivity_blocks_until_online() {
        let connectivity = Arc::new(SwitchedConnectivity::new(false));
        let waiter = Arc::clone(&connectivity);
        let handle = std::thread::spawn(move || {
            waiter.wait_online();
            true
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!handle.is_finished());
        connectivity.set_online(true);
        assert!(handle.join().unwrap());
    }
}
