use crate::state::StateDoc;
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::broadcast;

/// Handle for a held store lock. Pass it back to `release_lock`; the file
/// backend's leases are inert.
#[derive(Debug)]
pub struct LockLease {
    pub name: String,
    pub(crate) lease_id: Option<i64>,
}

/// Persistence contract shared by the file and cluster backends.
///
/// Backends expose single-shot operations; reconnect and heartbeat loops
/// are owned by the composition roots.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read the persisted document. `None` on a fresh store.
    async fn read_state(&self) -> Result<Option<StateDoc>>;

    async fn write_state(&self, doc: &StateDoc) -> Result<()>;

    /// Acquire the named coarse lock. `timeout` of `None` retries forever.
    /// Fails with `StatikoError::LockTimeout` when the deadline passes.
    async fn acquire_lock(&self, name: &str, timeout: Option<Duration>) -> Result<LockLease>;

    async fn release_lock(&self, lease: LockLease) -> Result<()>;

    /// Receiver that fires when another process changed the stored state.
    /// The file backend never fires (the controller is the sole writer).
    fn subscribe_external_change(&self) -> broadcast::Receiver<()>;

    async fn healthy(&self) -> bool;
}
