//! Desktop pool management.
//!
//! A [`PoolManager`] owns the registry of one pool, the hypervisor adapter
//! that builds its machines, and the capacity policy that sizes it. Clients
//! call [`PoolManager::acquire`] to reserve a machine and receive a
//! [`MachineLease`]; dropping the lease returns the machine to the pool.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vdipool::{ClientInfo, MemoryAdapter, PoolConfig, PoolManager, PoolTuning};
//!
//! # async fn example() -> vdipool::Result<()> {
//! let adapter = Arc::new(MemoryAdapter::new());
//! let config = PoolConfig::new("eng", "win11-gold", 10).with_bounds(1, 10, 2);
//! let pool = PoolManager::new(config, PoolTuning::default(), adapter)?;
//!
//! // Bring the pool up to its spare target.
//! pool.reconcile().await?;
//!
//! let lease = pool.acquire(&ClientInfo::new("alice")).await?;
//! println!("connect to {}", lease.hostname());
//!
//! // The machine goes back to the pool when the lease is dropped.
//! drop(lease);
//! # Ok(())
//! # }
//! ```

mod lease;
mod provision;
mod reconcile;

pub use lease::MachineLease;
pub use reconcile::ReconcileReport;

use crate::policy::{CapacityBounds, CapacityDecision, CapacityPolicy};
use crate::registry::{MachineRegistry, Members};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, MutexGuard};
use tokio::sync::{Mutex, Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use vdipool_core::{
    AdapterError, ClientInfo, Error, HypervisorAdapter, Machine, MachineHandle, MachineId,
    MachineSpec, MachineState, PoolConfig, PoolId, PoolStats, PoolTuning, PoolType, Result,
};

pub(crate) struct PoolInner {
    config: PoolConfig,
    tuning: PoolTuning,
    adapter: Arc<dyn HypervisorAdapter>,
    registry: MachineRegistry,
    policy: CapacityPolicy,
    /// Signalled whenever a machine may have become available or capacity
    /// was freed.
    notify: Notify,
    shutting_down: AtomicBool,
    reconcile_lock: Mutex<()>,
    next_suffix: AtomicUsize,
    in_flight: AtomicUsize,
    drained: Notify,
    /// Draining machines whose destroy is being driven right now.
    drains: std::sync::Mutex<HashSet<MachineId>>,
}

impl PoolInner {
    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn id(&self) -> &PoolId {
        &self.config.id
    }

    fn handle_for(&self, machine: &Machine) -> MachineHandle {
        MachineHandle {
            id: machine.id.clone(),
            name: machine.name.clone(),
            pool: machine.pool.clone(),
            protocol: self.config.protocol,
            address: machine.address.clone(),
        }
    }

    /// Picks a machine name not used by any current member.
    fn next_name(&self, members: &Members<'_>) -> String {
        loop {
            let n = self.next_suffix.fetch_add(1, Ordering::Relaxed) + 1;
            let name = format!("{}-{}", self.config.basename(), n);
            if !members.iter().any(|m| m.name == name) {
                return name;
            }
        }
    }

    fn placeholder(&self, members: &Members<'_>) -> Machine {
        Machine::placeholder(
            self.config.id.clone(),
            self.next_name(members),
            self.config.template.clone(),
            self.config.snapshot.clone(),
            self.config.network.clone(),
        )
    }

    fn spec_for(&self, machine: &Machine) -> MachineSpec {
        MachineSpec {
            pool: self.config.id.clone(),
            template: machine.template.clone(),
            snapshot: machine.snapshot.clone(),
            name: machine.name.clone(),
            network: machine.network.clone(),
            tags: vec![self.config.id.tag()],
            addressing: self.config.addressing.clone(),
            domain_join: self.config.domain_join.clone(),
        }
    }

    /// Runs an adapter call bounded by the configured create timeout.
    async fn bounded<T>(
        &self,
        what: &str,
        call: impl Future<Output = vdipool_core::AdapterResult<T>>,
    ) -> vdipool_core::AdapterResult<T> {
        let limit = self.tuning.create_timeout();
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Timeout(format!(
                "{what} did not complete within {}s",
                limit.as_secs()
            ))),
        }
    }

    fn track(self: &Arc<Self>) -> InFlight {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlight {
            inner: Arc::clone(self),
        }
    }

    fn drains(&self) -> MutexGuard<'_, HashSet<MachineId>> {
        self.drains
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Takes over the destroy of a machine that was just moved to
    /// `Draining`.
    fn claim_drain(self: &Arc<Self>, id: &MachineId) -> DrainClaim {
        self.drains().insert(id.clone());
        DrainClaim {
            inner: Arc::clone(self),
            id: id.clone(),
        }
    }

    fn is_drain_claimed(&self, id: &MachineId) -> bool {
        self.drains().contains(id)
    }

    async fn wait_idle(&self) {
        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            drained.await;
        }
    }
}

/// Marks a background provisioning or destroy task as in flight.
struct InFlight {
    inner: Arc<PoolInner>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.drained.notify_waiters();
        }
    }
}

/// A destroy in progress. Dropping it, finished or cancelled, hands the
/// machine back to reconciliation if it is still `Draining`.
struct DrainClaim {
    inner: Arc<PoolInner>,
    id: MachineId,
}

impl Drop for DrainClaim {
    fn drop(&mut self) {
        self.inner.drains().remove(&self.id);
    }
}

/// A caller waiting for the placeholder provisioned on its behalf.
///
/// If the caller goes away first the claim is given up: a machine already
/// handed over is released and a placeholder still provisioning becomes an
/// unclaimed spare that other callers may wait for.
struct PendingClaim {
    inner: Arc<PoolInner>,
    name: String,
    rx: Option<oneshot::Receiver<Result<Machine>>>,
}

impl PendingClaim {
    async fn wait(&mut self) -> Result<Machine> {
        let Some(rx) = self.rx.as_mut() else {
            return Err(Error::PoolShutdown);
        };
        let result = rx.await;
        self.rx = None;
        result.map_err(|_| Error::PoolShutdown)?
    }
}

impl Drop for PendingClaim {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        rx.close();
        let inner = &self.inner;
        let abandoned = match rx.try_recv() {
            Ok(Ok(machine)) => inner
                .registry
                .with_lock(|members| members.release(&machine.id, Instant::now()))
                .is_ok(),
            Ok(Err(_)) => false,
            Err(_) => inner
                .registry
                .with_lock(|members| members.abandon_claim(&self.name)),
        };
        if abandoned {
            debug!(pool = %inner.id(), machine = %self.name, "claim abandoned, kept as spare");
            inner.notify.notify_waiters();
        }
    }
}

enum AcquireStep {
    Reserved(MachineHandle),
    Provision(Machine, InFlight),
    Wait,
    Full,
    Shutdown,
}

/// Manages the machines of one desktop pool.
///
/// `PoolManager` is a cheap handle: clones share the same pool.
#[derive(Clone)]
pub struct PoolManager {
    inner: Arc<PoolInner>,
}

impl PoolManager {
    /// Creates a manager for `config`, backed by `adapter`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configuration is invalid or
    /// needs a capability the adapter does not have.
    pub fn new(
        config: PoolConfig,
        tuning: PoolTuning,
        adapter: Arc<dyn HypervisorAdapter>,
    ) -> Result<Self> {
        config.validate()?;
        let caps = adapter.capabilities();
        let missing = if config.addressing.is_static() && !caps.static_addressing {
            Some("static addressing")
        } else if config.domain_join.is_some() && !caps.domain_join {
            Some("domain join")
        } else if config.pool_type == PoolType::Static && !caps.tagging {
            Some("machine tagging")
        } else {
            None
        };
        if let Some(capability) = missing {
            return Err(Error::InvalidConfig(format!(
                "pool '{}' needs {capability}, which adapter '{}' does not support",
                config.id,
                adapter.name()
            )));
        }

        let policy = CapacityPolicy::new(CapacityBounds::from_config(&config, &tuning));
        let registry = MachineRegistry::new(config.id.clone());
        info!(
            pool = %config.id,
            adapter = adapter.name(),
            pool_type = %config.pool_type,
            min = config.min,
            max = config.max,
            spare = config.spare,
            "pool created"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                tuning,
                adapter,
                registry,
                policy,
                notify: Notify::new(),
                shutting_down: AtomicBool::new(false),
                reconcile_lock: Mutex::new(()),
                next_suffix: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                drained: Notify::new(),
                drains: std::sync::Mutex::new(HashSet::new()),
            }),
        })
    }

    pub fn id(&self) -> &PoolId {
        self.inner.id()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn tuning(&self) -> &PoolTuning {
        &self.inner.tuning
    }

    pub fn adapter(&self) -> &Arc<dyn HypervisorAdapter> {
        &self.inner.adapter
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.registry.stats()
    }

    /// Snapshot of all members, ordered by name.
    pub fn machines(&self) -> Vec<Machine> {
        self.inner.registry.snapshot()
    }

    pub fn machine(&self, id: &MachineId) -> Option<Machine> {
        self.inner.registry.get(id)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.is_shutting_down()
    }

    /// Reserves a machine for `client`.
    ///
    /// Hands out an available machine if there is one. Otherwise, if the pool
    /// is below its maximum, a new machine is provisioned for this caller.
    /// A full pool with a spare still being provisioned makes the caller wait
    /// for that spare.
    ///
    /// # Errors
    ///
    /// - [`Error::CapacityExceeded`] - the pool is at its maximum and nothing
    ///   is available or on its way
    /// - [`Error::Provision`] - building a machine for this caller failed
    /// - [`Error::Timeout`] - no machine within the acquire timeout
    /// - [`Error::PoolShutdown`] - the pool is shutting down
    pub async fn acquire(&self, client: &ClientInfo) -> Result<MachineLease> {
        let limit = self.inner.tuning.acquire_timeout();
        match tokio::time::timeout(limit, self.acquire_inner(client)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(pool = %self.id(), client = %client.label(), "acquire timed out");
                Err(Error::Timeout(format!(
                    "no machine from pool '{}' within {}s",
                    self.id(),
                    limit.as_secs()
                )))
            }
        }
    }

    async fn acquire_inner(&self, client: &ClientInfo) -> Result<MachineLease> {
        let inner = &self.inner;
        let owner = client.label();
        loop {
            // Register before checking state so a release between the check
            // and the await is not missed.
            let notified = inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // Shutdown is flagged under the pool lock, so a create started
            // here is always seen by shutdown's wait for in-flight work.
            let step = inner.registry.with_lock(|members| {
                if inner.is_shutting_down() {
                    return AcquireStep::Shutdown;
                }
                if let Some(id) = members.pick_available() {
                    members.reserve(&id, owner.clone(), Instant::now());
                    if let Some(machine) = members.get(&id) {
                        return AcquireStep::Reserved(inner.handle_for(machine));
                    }
                }
                if inner.config.pool_type == PoolType::Dynamic
                    && members.len() < inner.config.max
                {
                    let placeholder = inner.placeholder(members).claimed_by(client);
                    if members.insert(placeholder.clone()).is_ok() {
                        return AcquireStep::Provision(placeholder, inner.track());
                    }
                }
                if members.has_unclaimed_provisioning() {
                    AcquireStep::Wait
                } else {
                    AcquireStep::Full
                }
            });

            match step {
                AcquireStep::Reserved(handle) => {
                    info!(pool = %self.id(), machine = %handle.id, client = %owner, "machine reserved");
                    self.schedule_rebalance();
                    return Ok(MachineLease::new(handle, self.clone()));
                }
                AcquireStep::Provision(placeholder, guard) => {
                    info!(
                        pool = %self.id(),
                        machine = %placeholder.name,
                        client = %owner,
                        "provisioning machine for client"
                    );
                    let (tx, rx) = oneshot::channel();
                    let mut claim = PendingClaim {
                        inner: Arc::clone(inner),
                        name: placeholder.name.clone(),
                        rx: Some(rx),
                    };
                    provision::spawn(Arc::clone(inner), placeholder, Some(tx), guard);
                    let machine = claim.wait().await?;
                    self.schedule_rebalance();
                    return Ok(MachineLease::new(inner.handle_for(&machine), self.clone()));
                }
                AcquireStep::Wait => {
                    debug!(pool = %self.id(), client = %owner, "waiting for provisioning spare");
                    notified.await;
                }
                AcquireStep::Full => {
                    return Err(Error::CapacityExceeded {
                        pool: self.id().clone(),
                        max: inner.config.max,
                    });
                }
                AcquireStep::Shutdown => return Err(Error::PoolShutdown),
            }
        }
    }

    /// Returns a reserved or in-use machine to the pool and re-evaluates
    /// capacity.
    ///
    /// Returns the capacity decision that was scheduled as a result.
    pub async fn release(&self, id: &MachineId) -> Result<CapacityDecision> {
        self.release_record(id)?;
        Ok(self.rebalance().0)
    }

    pub(crate) fn release_record(&self, id: &MachineId) -> Result<()> {
        let from = self
            .inner
            .registry
            .with_lock(|members| members.release(id, Instant::now()))?;
        info!(pool = %self.id(), machine = %id, from = %from, "machine released");
        self.inner.notify.notify_waiters();
        Ok(())
    }

    /// Records that the client holding `id` has connected.
    pub fn mark_in_use(&self, id: &MachineId) -> Result<()> {
        self.inner.registry.with_lock(|members| {
            let state = members
                .get(id)
                .map(|m| m.state)
                .ok_or_else(|| Error::MachineNotFound(id.clone()))?;
            if state != MachineState::Reserved {
                return Err(Error::InvalidTransition {
                    id: id.clone(),
                    from: state,
                    to: MachineState::InUse,
                });
            }
            members.try_transition(id, MachineState::InUse)?;
            Ok(())
        })?;
        debug!(pool = %self.id(), machine = %id, "machine in use");
        Ok(())
    }

    /// Destroys a machine regardless of its state, except while it is still
    /// provisioning.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MachineNotFound`] if the machine is unknown or was
    /// already destroyed.
    pub async fn destroy(&self, id: &MachineId) -> Result<Machine> {
        let inner = &self.inner;
        let (mut machine, _claim, _guard) = inner.registry.with_lock(|members| {
            members.try_transition(id, MachineState::Draining)?;
            let machine = members
                .get(id)
                .cloned()
                .ok_or_else(|| Error::MachineNotFound(id.clone()))?;
            Ok::<_, Error>((machine, inner.claim_drain(id), inner.track()))
        })?;
        info!(pool = %self.id(), machine = %id, "destroying machine");

        provision::drain(inner, id).await?;
        machine.state = MachineState::Destroyed;
        self.schedule_rebalance();
        Ok(machine)
    }

    /// Rebuilds an available or failed machine from its template.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Unsupported`] (as [`Error::Adapter`]) if the
    /// adapter cannot rebuild machines.
    pub async fn rebuild(&self, id: &MachineId) -> Result<Machine> {
        let inner = &self.inner;
        if !inner.adapter.capabilities().rebuild {
            return Err(AdapterError::Unsupported(format!(
                "adapter '{}' cannot rebuild machines",
                inner.adapter.name()
            ))
            .into());
        }
        inner
            .registry
            .with_lock(|members| members.try_transition(id, MachineState::Provisioning))?;
        info!(pool = %self.id(), machine = %id, "rebuilding machine");

        let _guard = inner.track();
        let rebuilt: vdipool_core::AdapterResult<vdipool_core::MachineInfo> = async {
            inner
                .bounded("rebuild_machine", inner.adapter.rebuild_machine(id))
                .await?;
            inner
                .bounded("start_machine", inner.adapter.start_machine(id))
                .await?;
            inner
                .bounded("get_machine", inner.adapter.get_machine(id))
                .await
        }
        .await;

        let result = inner.registry.with_lock(|members| {
            let machine = members
                .get_mut(id)
                .ok_or_else(|| Error::MachineNotFound(id.clone()))?;
            match rebuilt {
                Ok(info) => {
                    machine.state = MachineState::Available;
                    machine.address = info.address;
                    machine.last_active_at = Instant::now();
                    Ok(machine.clone())
                }
                Err(e) => {
                    machine.state = MachineState::Failed;
                    Err(Error::Provision(e))
                }
            }
        });
        inner.notify.notify_waiters();
        if let Err(e) = &result {
            warn!(pool = %self.id(), machine = %id, error = %e, "rebuild failed");
        }
        result
    }

    /// Power-cycles a machine through the adapter.
    pub async fn restart(&self, id: &MachineId, clean: bool) -> Result<()> {
        if self.inner.registry.get(id).is_none() {
            return Err(Error::MachineNotFound(id.clone()));
        }
        info!(pool = %self.id(), machine = %id, clean, "restarting machine");
        self.inner
            .bounded("restart_machine", self.inner.adapter.restart_machine(id, clean))
            .await?;
        Ok(())
    }

    /// Brings the registry in line with the hypervisor and the pool's
    /// capacity bounds. Passes are serialized.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        reconcile::run(self).await
    }

    /// Stops the pool.
    ///
    /// New acquires fail with [`Error::PoolShutdown`] and waiters are woken.
    /// In-flight provisioning finishes first. Available machines are
    /// destroyed when `destroy_available` (or the tuning's
    /// `destroy_on_shutdown`) is set; machines in use are never touched.
    ///
    /// Returns the number of machines destroyed.
    pub async fn shutdown(&self, destroy_available: bool) -> Result<usize> {
        let inner = &self.inner;
        let already = inner
            .registry
            .with_lock(|_| inner.shutting_down.swap(true, Ordering::SeqCst));
        if already {
            debug!(pool = %self.id(), "pool already shutting down");
        }
        inner.notify.notify_waiters();
        info!(pool = %self.id(), "shutting down pool");

        inner.wait_idle().await;

        let destroy = (destroy_available || inner.tuning.destroy_on_shutdown)
            && inner.config.pool_type == PoolType::Dynamic;
        if !destroy {
            return Ok(0);
        }

        let draining: Vec<DrainClaim> = inner.registry.with_lock(|members| {
            let ids: Vec<MachineId> = members
                .iter()
                .filter(|m| m.state == MachineState::Available)
                .map(|m| m.id.clone())
                .collect();
            ids.into_iter()
                .filter(|id| members.transition(id, MachineState::Available, MachineState::Draining))
                .map(|id| inner.claim_drain(&id))
                .collect()
        });

        let mut destroyed = 0;
        for claim in &draining {
            match provision::drain(inner, &claim.id).await {
                Ok(()) => destroyed += 1,
                Err(e) => warn!(pool = %self.id(), machine = %claim.id, error = %e, "destroy on shutdown failed"),
            }
        }
        info!(pool = %self.id(), destroyed, "pool shut down");
        Ok(destroyed)
    }

    fn schedule_rebalance(&self) {
        let (decision, _) = self.rebalance();
        if !decision.is_noop() {
            debug!(pool = %self.id(), ?decision, "capacity rebalance scheduled");
        }
    }

    /// Evaluates the capacity policy and starts the work it asks for.
    ///
    /// The decision and the resulting placeholders or drains are applied
    /// under the pool lock, so concurrent rebalances never overshoot.
    pub(crate) fn rebalance(&self) -> (CapacityDecision, Vec<JoinHandle<()>>) {
        let inner = &self.inner;
        if inner.config.pool_type == PoolType::Static {
            return (CapacityDecision::NoOp, Vec::new());
        }

        let (decision, work) = inner.registry.with_lock(|members| {
            if inner.is_shutting_down() {
                return (CapacityDecision::NoOp, Work::None);
            }
            let decision = inner.policy.evaluate(members.iter(), Instant::now());
            let work = match &decision {
                CapacityDecision::Grow(n) => {
                    let mut placeholders = Vec::with_capacity(*n);
                    for _ in 0..*n {
                        let placeholder = inner.placeholder(members);
                        if members.insert(placeholder.clone()).is_ok() {
                            placeholders.push((placeholder, inner.track()));
                        }
                    }
                    Work::Provision(placeholders)
                }
                CapacityDecision::Shrink(ids) => Work::Drain(
                    ids.iter()
                        .filter(|id| {
                            members.transition(id, MachineState::Available, MachineState::Draining)
                        })
                        .map(|id| (inner.claim_drain(id), inner.track()))
                        .collect(),
                ),
                CapacityDecision::NoOp => Work::None,
            };
            (decision, work)
        });

        let handles = match work {
            Work::Provision(placeholders) => {
                info!(pool = %self.id(), count = placeholders.len(), "growing pool");
                placeholders
                    .into_iter()
                    .map(|(p, guard)| provision::spawn(Arc::clone(inner), p, None, guard))
                    .collect()
            }
            Work::Drain(drains) => {
                info!(pool = %self.id(), count = drains.len(), "shrinking pool");
                drains
                    .into_iter()
                    .map(|(claim, guard)| provision::spawn_drain(Arc::clone(inner), claim, guard))
                    .collect()
            }
            Work::None => Vec::new(),
        };
        (decision, handles)
    }
}

enum Work {
    Provision(Vec<(Machine, InFlight)>),
    Drain(Vec<(DrainClaim, InFlight)>),
    None,
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("id", self.id())
            .field("adapter", &self.inner.adapter.name())
            .field("stats", &self.stats())
            .finish()
    }
}
