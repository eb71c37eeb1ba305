//! In-memory record of the machines belonging to one pool.
//!
//! The registry's mutex is the pool lock: every decision that depends on the
//! member count (reserving, inserting placeholders, adopting orphans) runs
//! inside [`MachineRegistry::with_lock`] so that it is atomic with respect to
//! concurrent callers. The lock is never held across an `.await`.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use vdipool_core::{Error, Machine, MachineId, MachineState, PoolId, PoolStats, Result};

pub struct MachineRegistry {
    pool: PoolId,
    machines: Mutex<HashMap<MachineId, Machine>>,
}

impl MachineRegistry {
    pub fn new(pool: PoolId) -> Self {
        Self {
            pool,
            machines: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &PoolId {
        &self.pool
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<MachineId, Machine>> {
        // Every mutation leaves the map consistent, so a panic elsewhere
        // while holding the lock does not invalidate it.
        self.machines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs `f` with exclusive access to the pool's members.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut Members<'_>) -> R) -> R {
        let mut guard = self.lock();
        let mut members = Members {
            pool: &self.pool,
            machines: &mut guard,
        };
        f(&mut members)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn get(&self, id: &MachineId) -> Option<Machine> {
        self.lock().get(id).cloned()
    }

    pub fn state(&self, id: &MachineId) -> Option<MachineState> {
        self.lock().get(id).map(|m| m.state)
    }

    /// All members, ordered by name.
    pub fn snapshot(&self) -> Vec<Machine> {
        let mut machines: Vec<Machine> = self.lock().values().cloned().collect();
        machines.sort_by(|a, b| a.name.cmp(&b.name));
        machines
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats::from_machines(self.lock().values())
    }

    pub fn insert(&self, machine: Machine) -> Result<()> {
        self.with_lock(|m| m.insert(machine))
    }

    pub fn remove(&self, id: &MachineId) -> Option<Machine> {
        self.with_lock(|m| m.remove(id))
    }

    /// Compare-and-swap on a machine's state.
    ///
    /// Succeeds only if the machine exists, is currently in `from`, and the
    /// lifecycle allows `from -> to`.
    pub fn transition(&self, id: &MachineId, from: MachineState, to: MachineState) -> bool {
        self.with_lock(|m| m.transition(id, from, to))
    }
}

/// Exclusive view of a pool's members, valid while the pool lock is held.
pub struct Members<'a> {
    pool: &'a PoolId,
    machines: &'a mut HashMap<MachineId, Machine>,
}

impl Members<'_> {
    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Machine> {
        self.machines.values()
    }

    pub fn get(&self, id: &MachineId) -> Option<&Machine> {
        self.machines.get(id)
    }

    pub fn get_mut(&mut self, id: &MachineId) -> Option<&mut Machine> {
        self.machines.get_mut(id)
    }

    pub fn contains(&self, id: &MachineId) -> bool {
        self.machines.contains_key(id)
    }

    pub fn count(&self, state: MachineState) -> usize {
        self.machines.values().filter(|m| m.state == state).count()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats::from_machines(self.machines.values())
    }

    pub fn insert(&mut self, machine: Machine) -> Result<()> {
        if &machine.pool != self.pool {
            return Err(Error::InvalidConfig(format!(
                "machine {} belongs to pool '{}', not '{}'",
                machine.id, machine.pool, self.pool
            )));
        }
        if self.machines.contains_key(&machine.id) {
            return Err(Error::InvalidConfig(format!(
                "machine {} is already registered",
                machine.id
            )));
        }
        self.machines.insert(machine.id.clone(), machine);
        Ok(())
    }

    pub fn remove(&mut self, id: &MachineId) -> Option<Machine> {
        self.machines.remove(id)
    }

    pub fn transition(&mut self, id: &MachineId, from: MachineState, to: MachineState) -> bool {
        match self.machines.get_mut(id) {
            Some(machine) if machine.state == from && from.can_transition_to(to) => {
                machine.state = to;
                true
            }
            _ => false,
        }
    }

    /// Moves a machine to `to` from whatever state it is in, if the lifecycle
    /// allows it.
    pub fn try_transition(&mut self, id: &MachineId, to: MachineState) -> Result<MachineState> {
        let machine = self
            .machines
            .get_mut(id)
            .ok_or_else(|| Error::MachineNotFound(id.clone()))?;
        let from = machine.state;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                id: id.clone(),
                from,
                to,
            });
        }
        machine.state = to;
        Ok(from)
    }

    /// An available machine to hand out, preferring the one used most
    /// recently so that long-idle machines age out first.
    pub fn pick_available(&self) -> Option<MachineId> {
        self.machines
            .values()
            .filter(|m| m.state == MachineState::Available)
            .max_by_key(|m| m.last_active_at)
            .map(|m| m.id.clone())
    }

    /// Reserves an available machine for `owner`.
    pub fn reserve(&mut self, id: &MachineId, owner: String, now: Instant) -> bool {
        if !self.transition(id, MachineState::Available, MachineState::Reserved) {
            return false;
        }
        if let Some(machine) = self.machines.get_mut(id) {
            machine.reserved_by = Some(owner);
            machine.reserved_at = Some(now);
        }
        true
    }

    /// Returns a reserved or in-use machine to the available set.
    pub fn release(&mut self, id: &MachineId, now: Instant) -> Result<MachineState> {
        let from = self
            .machines
            .get(id)
            .map(|m| m.state)
            .ok_or_else(|| Error::MachineNotFound(id.clone()))?;
        if !from.is_active() {
            return Err(Error::InvalidTransition {
                id: id.clone(),
                from,
                to: MachineState::Available,
            });
        }
        self.try_transition(id, MachineState::Available)?;
        if let Some(machine) = self.machines.get_mut(id) {
            machine.reserved_by = None;
            machine.reserved_at = None;
            machine.last_active_at = now;
        }
        Ok(from)
    }

    /// Swaps a placeholder's provisional id for the one the hypervisor
    /// assigned.
    pub fn rekey(&mut self, placeholder: &MachineId, id: MachineId) -> Result<()> {
        if self.machines.contains_key(&id) {
            return Err(Error::Reconciliation(format!(
                "hypervisor returned id {id} which is already registered"
            )));
        }
        let mut machine = self
            .machines
            .remove(placeholder)
            .ok_or_else(|| Error::MachineNotFound(placeholder.clone()))?;
        machine.id = id.clone();
        machine.provisional = false;
        self.machines.insert(id, machine);
        Ok(())
    }

    /// Whether a machine is provisioning without anyone waiting for it.
    pub fn has_unclaimed_provisioning(&self) -> bool {
        self.machines
            .values()
            .any(|m| m.state == MachineState::Provisioning && !m.is_claimed())
    }

    /// Drops the claim on the placeholder named `name` if it is still
    /// provisioning, turning it into an unclaimed spare.
    pub fn abandon_claim(&mut self, name: &str) -> bool {
        match self
            .machines
            .values_mut()
            .find(|m| m.name == name && m.is_claimed())
        {
            Some(machine) => {
                machine.reserved_by = None;
                true
            }
            None => false,
        }
    }

    /// Draining members, for resuming destroys that were interrupted.
    pub fn draining(&self) -> Vec<MachineId> {
        self.machines
            .values()
            .filter(|m| m.state == MachineState::Draining)
            .map(|m| m.id.clone())
            .collect()
    }

    pub fn has_provisional(&self) -> bool {
        self.machines.values().any(|m| m.provisional)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdipool_core::ClientInfo;

    fn registry() -> MachineRegistry {
        MachineRegistry::new(PoolId::new("pool"))
    }

    fn machine(id: &str, state: MachineState) -> Machine {
        let mut m = Machine::placeholder(PoolId::new("pool"), id, "tpl", None, "lan");
        m.id = MachineId::new(id);
        m.provisional = false;
        m.state = state;
        m
    }

    #[test]
    fn insert_rejects_foreign_pool() {
        let reg = registry();
        let mut m = machine("vm-1", MachineState::Available);
        m.pool = PoolId::new("other");
        assert!(matches!(reg.insert(m), Err(Error::InvalidConfig(_))));
        assert!(reg.is_empty());
    }

    #[test]
    fn insert_rejects_duplicate_id() {
        let reg = registry();
        reg.insert(machine("vm-1", MachineState::Available)).unwrap();
        assert!(reg.insert(machine("vm-1", MachineState::Available)).is_err());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn transition_is_compare_and_swap() {
        let reg = registry();
        let id = MachineId::new("vm-1");
        reg.insert(machine("vm-1", MachineState::Available)).unwrap();

        assert!(reg.transition(&id, MachineState::Available, MachineState::Reserved));
        assert!(!reg.transition(&id, MachineState::Available, MachineState::Reserved));
        assert_eq!(reg.state(&id), Some(MachineState::Reserved));
    }

    #[test]
    fn transition_respects_lifecycle() {
        let reg = registry();
        let id = MachineId::new("vm-1");
        reg.insert(machine("vm-1", MachineState::Draining)).unwrap();
        assert!(!reg.transition(&id, MachineState::Draining, MachineState::Reserved));
        assert_eq!(reg.state(&id), Some(MachineState::Draining));
    }

    #[test]
    fn transition_unknown_machine_fails() {
        let reg = registry();
        assert!(!reg.transition(
            &MachineId::new("ghost"),
            MachineState::Available,
            MachineState::Reserved
        ));
    }

    #[test]
    fn reserve_records_owner() {
        let reg = registry();
        let id = MachineId::new("vm-1");
        reg.insert(machine("vm-1", MachineState::Available)).unwrap();
        let now = Instant::now();

        assert!(reg.with_lock(|m| m.reserve(&id, "alice".into(), now)));
        let reserved = reg.get(&id).unwrap();
        assert_eq!(reserved.state, MachineState::Reserved);
        assert_eq!(reserved.reserved_by.as_deref(), Some("alice"));
        assert_eq!(reserved.reserved_at, Some(now));
    }

    #[test]
    fn release_clears_reservation() {
        let reg = registry();
        let id = MachineId::new("vm-1");
        reg.insert(machine("vm-1", MachineState::InUse)).unwrap();
        let now = Instant::now();

        let from = reg.with_lock(|m| m.release(&id, now)).unwrap();
        assert_eq!(from, MachineState::InUse);
        let released = reg.get(&id).unwrap();
        assert_eq!(released.state, MachineState::Available);
        assert!(released.reserved_by.is_none());
        assert_eq!(released.last_active_at, now);
    }

    #[test]
    fn release_of_available_machine_is_rejected() {
        let reg = registry();
        let id = MachineId::new("vm-1");
        reg.insert(machine("vm-1", MachineState::Available)).unwrap();
        let result = reg.with_lock(|m| m.release(&id, Instant::now()));
        assert!(matches!(result, Err(Error::InvalidTransition { .. })));
    }

    #[test]
    fn pick_available_prefers_most_recent() {
        let reg = registry();
        let base = Instant::now();
        let mut old = machine("old", MachineState::Available);
        old.last_active_at = base;
        let mut recent = machine("recent", MachineState::Available);
        recent.last_active_at = base + std::time::Duration::from_secs(30);
        reg.insert(old).unwrap();
        reg.insert(recent).unwrap();
        reg.insert(machine("busy", MachineState::InUse)).unwrap();

        assert_eq!(
            reg.with_lock(|m| m.pick_available()),
            Some(MachineId::new("recent"))
        );
    }

    #[test]
    fn rekey_replaces_provisional_id() {
        let reg = registry();
        let placeholder = Machine::placeholder(PoolId::new("pool"), "p-1", "tpl", None, "lan");
        let pid = placeholder.id.clone();
        reg.insert(placeholder).unwrap();

        reg.with_lock(|m| m.rekey(&pid, MachineId::new("vm-7")))
            .unwrap();
        assert!(reg.get(&pid).is_none());
        let machine = reg.get(&MachineId::new("vm-7")).unwrap();
        assert!(!machine.provisional);
        assert_eq!(machine.name, "p-1");
    }

    #[test]
    fn claimed_placeholders_are_not_waitable() {
        let reg = registry();
        let claimed = Machine::placeholder(PoolId::new("pool"), "p-1", "tpl", None, "lan")
            .claimed_by(&ClientInfo::new("bob"));
        reg.insert(claimed).unwrap();
        assert!(!reg.with_lock(|m| m.has_unclaimed_provisioning()));

        reg.insert(Machine::placeholder(
            PoolId::new("pool"),
            "p-2",
            "tpl",
            None,
            "lan",
        ))
        .unwrap();
        assert!(reg.with_lock(|m| m.has_unclaimed_provisioning()));
    }

    #[test]
    fn abandoned_claim_becomes_waitable() {
        let reg = registry();
        let claimed = Machine::placeholder(PoolId::new("pool"), "p-1", "tpl", None, "lan")
            .claimed_by(&ClientInfo::new("bob"));
        reg.insert(claimed).unwrap();

        assert!(reg.with_lock(|m| m.abandon_claim("p-1")));
        assert!(reg.with_lock(|m| m.has_unclaimed_provisioning()));
        assert!(!reg.with_lock(|m| m.abandon_claim("p-1")));
    }

    #[test]
    fn abandon_claim_ignores_reserved_machines() {
        let reg = registry();
        let mut m = machine("vm-1", MachineState::Reserved);
        m.reserved_by = Some("bob".into());
        reg.insert(m).unwrap();

        assert!(!reg.with_lock(|m| m.abandon_claim("vm-1")));
        assert_eq!(
            reg.get(&MachineId::new("vm-1")).unwrap().reserved_by.as_deref(),
            Some("bob")
        );
    }

    #[test]
    fn snapshot_is_sorted_by_name() {
        let reg = registry();
        reg.insert(machine("b", MachineState::Available)).unwrap();
        reg.insert(machine("a", MachineState::Available)).unwrap();
        let names: Vec<_> = reg.snapshot().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
