use super::{DrainClaim, PoolManager, provision};
use crate::policy::CapacityDecision;
use std::collections::HashSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use vdipool_core::{
    Error, Machine, MachineId, MachineInfo, MachineState, OrphanPolicy, PowerState, PoolType,
    Result,
};

/// What a reconciliation pass found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Tagged machines unknown to the registry that joined the pool.
    pub adopted: usize,
    /// Tagged machines unknown to the registry that were destroyed.
    pub orphans_destroyed: usize,
    /// Orphans left for a later pass because creates were in flight.
    pub orphans_deferred: usize,
    /// Registry entries the hypervisor no longer reports.
    pub marked_failed: usize,
    /// Interrupted destroys that were driven to completion.
    pub drains_resumed: usize,
    /// Failed machines removed from the pool.
    pub reaped: usize,
    /// Capacity decision applied at the end of the pass.
    pub decision: CapacityDecision,
    /// Adapter errors encountered and logged during the pass.
    pub errors: usize,
}

pub(super) async fn run(pool: &PoolManager) -> Result<ReconcileReport> {
    let inner = &pool.inner;
    let _pass = inner.reconcile_lock.lock().await;
    if inner.is_shutting_down() {
        return Err(Error::PoolShutdown);
    }
    let mut report = ReconcileReport::default();

    // Only settled members can be judged missing: anything still
    // provisioning may not be listed yet.
    let settled: HashSet<MachineId> = inner.registry.with_lock(|members| {
        members
            .iter()
            .filter(|m| !m.provisional && m.state != MachineState::Provisioning)
            .map(|m| m.id.clone())
            .collect()
    });

    let tag = inner.config.id.tag();
    let listed: HashSet<MachineId> = inner
        .bounded("list_machines", inner.adapter.list_machines(&[tag]))
        .await
        .map_err(|e| Error::Reconciliation(format!("listing pool '{}' failed: {e}", inner.id())))?
        .into_iter()
        .collect();

    mark_missing(pool, &settled, &listed, &mut report);
    handle_orphans(pool, &listed, &mut report).await;
    resume_drains(pool, &mut report).await;
    if inner.tuning.reap_failed {
        reap_failed(pool, &mut report).await;
    }

    let (decision, work) = pool.rebalance();
    for handle in work {
        if let Err(e) = handle.await {
            warn!(pool = %inner.id(), error = %e, "capacity task panicked");
            report.errors += 1;
        }
    }
    report.decision = decision;

    let stats = pool.stats();
    info!(
        pool = %inner.id(),
        members = stats.members,
        available = stats.available,
        active = stats.active,
        adopted = report.adopted,
        reaped = report.reaped,
        "reconciliation complete"
    );
    Ok(report)
}

fn mark_missing(
    pool: &PoolManager,
    settled: &HashSet<MachineId>,
    listed: &HashSet<MachineId>,
    report: &mut ReconcileReport,
) {
    let inner = &pool.inner;
    let missing: Vec<MachineId> = settled.difference(listed).cloned().collect();
    inner.registry.with_lock(|members| {
        for id in &missing {
            let Some(machine) = members.get_mut(id) else {
                continue;
            };
            if !matches!(
                machine.state,
                MachineState::Available | MachineState::Reserved | MachineState::InUse
            ) {
                continue;
            }
            warn!(
                pool = %inner.id(),
                machine = %id,
                state = %machine.state,
                "machine missing from hypervisor, marking failed"
            );
            machine.state = MachineState::Failed;
            report.marked_failed += 1;
        }
    });
    if report.marked_failed > 0 {
        inner.notify.notify_waiters();
    }
}

/// Finishes destroys nobody is driving any more, such as a `destroy` call
/// that was cancelled halfway.
async fn resume_drains(pool: &PoolManager, report: &mut ReconcileReport) {
    let inner = &pool.inner;
    let claims: Vec<DrainClaim> = inner.registry.with_lock(|members| {
        members
            .draining()
            .into_iter()
            .filter(|id| !inner.is_drain_claimed(id))
            .map(|id| inner.claim_drain(&id))
            .collect()
    });

    for claim in claims {
        warn!(pool = %inner.id(), machine = %claim.id, "resuming interrupted destroy");
        match provision::drain(inner, &claim.id).await {
            Ok(()) => report.drains_resumed += 1,
            Err(e) => {
                warn!(pool = %inner.id(), machine = %claim.id, error = %e, "failed to resume destroy");
                report.errors += 1;
            }
        }
    }
}

async fn handle_orphans(
    pool: &PoolManager,
    listed: &HashSet<MachineId>,
    report: &mut ReconcileReport,
) {
    let inner = &pool.inner;
    let (candidates, in_flight) = inner.registry.with_lock(|members| {
        let candidates: Vec<MachineId> = listed
            .iter()
            .filter(|id| !members.contains(id))
            .cloned()
            .collect();
        (candidates, members.has_provisional())
    });
    if candidates.is_empty() {
        return;
    }
    if in_flight {
        // A create in flight may already exist in the hypervisor without its
        // id being registered yet.
        debug!(pool = %inner.id(), count = candidates.len(), "deferring orphans while creates are in flight");
        report.orphans_deferred += candidates.len();
        return;
    }

    // Static pools own nothing they may destroy.
    let policy = match inner.config.pool_type {
        PoolType::Static => OrphanPolicy::Adopt,
        PoolType::Dynamic => inner.tuning.orphan_policy,
    };

    for id in candidates {
        match policy {
            OrphanPolicy::Adopt => adopt(pool, &id, report).await,
            OrphanPolicy::Destroy => destroy_orphan(pool, &id, report).await,
        }
    }
}

async fn adopt(pool: &PoolManager, id: &MachineId, report: &mut ReconcileReport) {
    let inner = &pool.inner;
    let info = match inner.bounded("get_machine", inner.adapter.get_machine(id)).await {
        Ok(info) => info,
        Err(e) if e.is_not_found() => return,
        Err(e) => {
            warn!(pool = %inner.id(), machine = %id, error = %e, "cannot inspect orphan");
            report.errors += 1;
            return;
        }
    };

    let full = inner
        .registry
        .with_lock(|members| members.len() >= inner.config.max);
    if full {
        if inner.config.pool_type == PoolType::Dynamic {
            warn!(pool = %inner.id(), machine = %id, "pool full, destroying orphan instead of adopting");
            destroy_orphan(pool, id, report).await;
        } else {
            warn!(pool = %inner.id(), machine = %id, "pool full, orphan left unmanaged");
        }
        return;
    }

    let info = if info.power == PowerState::On {
        info
    } else {
        match start_orphan(pool, id).await {
            Ok(info) => info,
            Err(e) => {
                warn!(pool = %inner.id(), machine = %id, error = %e, "cannot start orphan");
                report.errors += 1;
                return;
            }
        }
    };

    let machine = adopted_machine(pool, info);
    let inserted = inner.registry.with_lock(|members| {
        if members.len() >= inner.config.max {
            return Err(Error::CapacityExceeded {
                pool: inner.id().clone(),
                max: inner.config.max,
            });
        }
        members.insert(machine)
    });
    match inserted {
        Ok(()) => {
            info!(pool = %inner.id(), machine = %id, "adopted orphaned machine");
            report.adopted += 1;
            inner.notify.notify_waiters();
        }
        Err(e) => {
            warn!(pool = %inner.id(), machine = %id, error = %e, "orphan not adopted");
        }
    }
}

async fn start_orphan(pool: &PoolManager, id: &MachineId) -> vdipool_core::AdapterResult<MachineInfo> {
    let inner = &pool.inner;
    inner
        .bounded("start_machine", inner.adapter.start_machine(id))
        .await?;
    inner
        .bounded("get_machine", inner.adapter.get_machine(id))
        .await
}

fn adopted_machine(pool: &PoolManager, info: MachineInfo) -> Machine {
    let config = &pool.inner.config;
    let mut machine = Machine::placeholder(
        config.id.clone(),
        info.name,
        info.template.unwrap_or_else(|| config.template.clone()),
        config.snapshot.clone(),
        config.network.clone(),
    );
    machine.id = info.id;
    machine.provisional = false;
    machine.address = info.address;
    machine.state = MachineState::Available;
    machine.last_active_at = Instant::now();
    machine
}

async fn destroy_orphan(pool: &PoolManager, id: &MachineId, report: &mut ReconcileReport) {
    let inner = &pool.inner;
    match inner
        .bounded("destroy_machine", inner.adapter.destroy_machine(id))
        .await
    {
        Ok(()) => {
            info!(pool = %inner.id(), machine = %id, "destroyed orphaned machine");
            report.orphans_destroyed += 1;
        }
        Err(e) if e.is_not_found() => {}
        Err(e) => {
            warn!(pool = %inner.id(), machine = %id, error = %e, "failed to destroy orphan");
            report.errors += 1;
        }
    }
}

async fn reap_failed(pool: &PoolManager, report: &mut ReconcileReport) {
    let inner = &pool.inner;

    if inner.config.pool_type == PoolType::Static {
        // Static machines are not ours to destroy; forget them and let a
        // later pass adopt them again if they come back.
        let removed = inner.registry.with_lock(|members| {
            let failed: Vec<MachineId> = members
                .iter()
                .filter(|m| m.state == MachineState::Failed)
                .map(|m| m.id.clone())
                .collect();
            for id in &failed {
                members.remove(id);
            }
            failed.len()
        });
        report.reaped += removed;
        return;
    }

    let draining: Vec<DrainClaim> = inner.registry.with_lock(|members| {
        let failed: Vec<MachineId> = members
            .iter()
            .filter(|m| m.state == MachineState::Failed)
            .map(|m| m.id.clone())
            .collect();
        failed
            .into_iter()
            .filter(|id| members.transition(id, MachineState::Failed, MachineState::Draining))
            .map(|id| inner.claim_drain(&id))
            .collect()
    });

    for claim in draining {
        let id = &claim.id;
        match provision::drain(inner, id).await {
            Ok(()) => {
                info!(pool = %inner.id(), machine = %id, "reaped failed machine");
                report.reaped += 1;
            }
            Err(e) => {
                warn!(pool = %inner.id(), machine = %id, error = %e, "failed to reap machine");
                report.errors += 1;
            }
        }
    }
}
