use super::PoolManager;
use crate::policy::CapacityDecision;
use std::ops::Deref;
use tracing::warn;
use vdipool_core::{MachineHandle, Result};

/// A machine reserved from a pool.
///
/// When dropped, the machine is released back to its pool in a background
/// task, so the drop is non-blocking. Use [`release`](Self::release) to
/// release explicitly and observe the outcome.
///
/// This type implements [`Deref<Target=MachineHandle>`](std::ops::Deref),
/// so the machine's id, name and address are available directly.
pub struct MachineLease {
    handle: MachineHandle,
    pool: PoolManager,
    released: bool,
}

impl MachineLease {
    pub(super) fn new(handle: MachineHandle, pool: PoolManager) -> Self {
        Self {
            handle,
            pool,
            released: false,
        }
    }

    pub fn handle(&self) -> &MachineHandle {
        &self.handle
    }

    pub fn pool(&self) -> &PoolManager {
        &self.pool
    }

    /// Records that the client has connected to the machine.
    pub fn mark_in_use(&self) -> Result<()> {
        self.pool.mark_in_use(&self.handle.id)
    }

    /// Returns the machine to the pool.
    pub async fn release(mut self) -> Result<CapacityDecision> {
        self.released = true;
        self.pool.release(&self.handle.id).await
    }
}

impl Deref for MachineLease {
    type Target = MachineHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl std::fmt::Debug for MachineLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineLease")
            .field("handle", &self.handle)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for MachineLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let pool = self.pool.clone();
        let id = self.handle.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = pool.release(&id).await {
                        warn!(pool = %pool.id(), machine = %id, error = %e, "failed to release dropped lease");
                    }
                });
            }
            Err(_) => {
                // No runtime to rebalance on; return the machine without it.
                if let Err(e) = pool.release_record(&id) {
                    warn!(pool = %pool.id(), machine = %id, error = %e, "failed to release dropped lease");
                }
            }
        }
    }
}
