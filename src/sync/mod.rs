//! Replication: the durable local patch log, the rate-limited retry queue,
//! the remote reconciliation API, and the synchronizer that ties them
//! together.

pub mod remote;
pub mod retry;
pub mod session;
pub mod store;

pub use remote::{
    AlwaysOnline, Connectivity, MemoryRemote, Remote, RemoteError, RemoteHead, SwitchedConnectivity,
    WirePatch,
};
pub use retry::{RetryPolicy, RetryQueue};
pub use session::{
    Bootstrap, ConflictChoice, LocalChange, SyncError, SyncEvent, SyncPhase, Synchronizer,
};
pub use store::{PatchStore, StoreError};
