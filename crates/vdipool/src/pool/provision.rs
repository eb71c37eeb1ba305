//! Background provisioning and destruction of pool machines.

use super::{DrainClaim, InFlight, PoolInner};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use vdipool_core::{
    AdapterError, AdapterResult, Error, Machine, MachineId, MachineInfo, MachineSpec,
    MachineState, Result,
};

pub(super) type Reply = oneshot::Sender<Result<Machine>>;

/// Provisions `placeholder` in a tracked task.
///
/// With a `reply`, the placeholder is claimed: the ready machine is handed
/// to the waiting caller as `Reserved`. If the caller has gone away by then,
/// the machine stays in the pool as an available spare.
///
/// `guard` must be taken under the pool lock that inserted the placeholder.
pub(super) fn spawn(
    inner: Arc<PoolInner>,
    placeholder: Machine,
    reply: Option<Reply>,
    guard: InFlight,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        provision(&inner, placeholder, reply).await;
        drop(guard);
    })
}

/// Destroys a draining machine in a tracked task.
pub(super) fn spawn_drain(
    inner: Arc<PoolInner>,
    claim: DrainClaim,
    guard: InFlight,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let id = &claim.id;
        if let Err(e) = drain(&inner, id).await {
            warn!(pool = %inner.id(), machine = %id, error = %e, "failed to destroy machine");
        }
        drop(claim);
        drop(guard);
    })
}

async fn provision(inner: &Arc<PoolInner>, placeholder: Machine, reply: Option<Reply>) {
    let spec = inner.spec_for(&placeholder);
    let placeholder_id = placeholder.id;

    let id = match create_with_retry(inner, &spec).await {
        Ok(id) => id,
        Err(e) => {
            warn!(pool = %inner.id(), machine = %spec.name, error = %e, "failed to create machine");
            inner.registry.remove(&placeholder_id);
            inner.notify.notify_waiters();
            send(reply, Err(Error::Provision(e)));
            return;
        }
    };

    if let Err(e) = inner
        .registry
        .with_lock(|members| members.rekey(&placeholder_id, id.clone()))
    {
        // The hypervisor handed out an id we already track. Leave the machine
        // for reconciliation and free the slot.
        warn!(pool = %inner.id(), machine = %id, error = %e, "cannot register created machine");
        inner.registry.remove(&placeholder_id);
        inner.notify.notify_waiters();
        send(reply, Err(e));
        return;
    }
    debug!(pool = %inner.id(), machine = %id, name = %spec.name, "machine created");

    let info = match start_and_inspect(inner, &id).await {
        Ok(info) => info,
        Err(e) => {
            warn!(pool = %inner.id(), machine = %id, error = %e, "machine failed to start");
            inner
                .registry
                .transition(&id, MachineState::Provisioning, MachineState::Failed);
            inner.notify.notify_waiters();
            send(reply, Err(Error::Provision(e)));
            return;
        }
    };

    let claimed = reply.as_ref().is_some_and(|tx| !tx.is_closed());
    let ready = inner.registry.with_lock(|members| {
        let machine = members.get_mut(&id)?;
        if machine.state != MachineState::Provisioning {
            return None;
        }
        let now = Instant::now();
        machine.address = info.address.clone();
        if claimed {
            machine.state = MachineState::Reserved;
            machine.reserved_at = Some(now);
        } else {
            machine.state = MachineState::Available;
            machine.reserved_by = None;
            machine.last_active_at = now;
        }
        Some(machine.clone())
    });

    let Some(machine) = ready else {
        // Destroyed or rebuilt by an admin while it was starting.
        inner.notify.notify_waiters();
        send(
            reply,
            Err(Error::Provision(AdapterError::NotFound(id.to_string()))),
        );
        return;
    };
    info!(
        pool = %inner.id(),
        machine = %id,
        state = %machine.state,
        address = machine.address.as_deref().unwrap_or("-"),
        "machine ready"
    );

    if machine.state == MachineState::Reserved {
        if let Some(tx) = reply {
            if tx.send(Ok(machine)).is_err() {
                // The caller gave up between the check and the send.
                let released = inner
                    .registry
                    .with_lock(|members| members.release(&id, Instant::now()));
                if released.is_ok() {
                    debug!(pool = %inner.id(), machine = %id, "claim abandoned, kept as spare");
                }
            }
        }
    }
    inner.notify.notify_waiters();
}

fn send(reply: Option<Reply>, result: Result<Machine>) {
    if let Some(tx) = reply {
        let _ = tx.send(result);
    }
}

/// Calls `create_machine`, retrying transient errors with backoff.
async fn create_with_retry(inner: &PoolInner, spec: &MachineSpec) -> AdapterResult<MachineId> {
    let retry = &inner.tuning.retry;
    let mut attempt = 1;
    loop {
        let result = inner
            .bounded("create_machine", inner.adapter.create_machine(spec))
            .await;
        match result {
            Err(e) if e.is_retryable() && attempt < retry.max_attempts => {
                let delay = retry.delay_for(attempt);
                warn!(
                    pool = %inner.id(),
                    machine = %spec.name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient create failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

async fn start_and_inspect(inner: &PoolInner, id: &MachineId) -> AdapterResult<MachineInfo> {
    inner
        .bounded("start_machine", inner.adapter.start_machine(id))
        .await?;
    inner
        .bounded("get_machine", inner.adapter.get_machine(id))
        .await
}

/// Destroys a machine that is already `Draining`.
///
/// On success (or if the hypervisor no longer knows the machine) the record
/// moves to `Destroyed` and leaves the registry. Any other adapter error
/// leaves it `Failed`.
pub(super) async fn drain(inner: &PoolInner, id: &MachineId) -> Result<()> {
    let result = inner
        .bounded("destroy_machine", inner.adapter.destroy_machine(id))
        .await;

    let outcome = match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => {
            debug!(pool = %inner.id(), machine = %id, "machine already gone from hypervisor");
            Ok(())
        }
        Err(e) => Err(e),
    };

    match outcome {
        Ok(()) => {
            inner.registry.with_lock(|members| {
                members.transition(id, MachineState::Draining, MachineState::Destroyed);
                members.remove(id);
            });
            info!(pool = %inner.id(), machine = %id, "machine destroyed");
            inner.notify.notify_waiters();
            Ok(())
        }
        Err(e) => {
            inner
                .registry
                .transition(id, MachineState::Draining, MachineState::Failed);
            inner.notify.notify_waiters();
            Err(Error::Adapter(e))
        }
    }
}
