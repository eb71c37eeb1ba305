//! Capacity policy: decides whether a pool should grow, shrink or stay put.
//!
//! The policy is a pure function of the pool's members and its bounds. It
//! never touches the hypervisor; the pool manager applies its decisions.

use std::time::Duration;
use tokio::time::Instant;
use vdipool_core::{Machine, MachineId, MachineState, PoolConfig, PoolTuning};

/// Outcome of a capacity evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CapacityDecision {
    /// Create this many new machines.
    Grow(usize),
    /// Destroy these available machines, least recently used first.
    Shrink(Vec<MachineId>),
    #[default]
    NoOp,
}

impl CapacityDecision {
    pub fn is_noop(&self) -> bool {
        matches!(self, CapacityDecision::NoOp)
    }
}

/// Sizing bounds of a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityBounds {
    pub min: usize,
    pub max: usize,
    pub spare: usize,
    pub auto_grow: bool,
    pub auto_shrink: bool,
    /// Minimum time a machine must sit available before it may be shrunk.
    pub min_idle: Duration,
}

impl CapacityBounds {
    pub fn from_config(config: &PoolConfig, tuning: &PoolTuning) -> Self {
        Self {
            min: config.min,
            max: config.max,
            spare: config.spare,
            auto_grow: config.auto_grow,
            auto_shrink: config.auto_shrink,
            min_idle: tuning.min_idle(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CapacityPolicy {
    bounds: CapacityBounds,
}

impl CapacityPolicy {
    pub fn new(bounds: CapacityBounds) -> Self {
        Self { bounds }
    }

    pub fn bounds(&self) -> &CapacityBounds {
        &self.bounds
    }

    /// Evaluates the pool at time `now`.
    ///
    /// Machines still provisioning count as idle, so creates in flight are
    /// not requested again. A placeholder claimed by a waiting caller counts
    /// as active instead: it will never become a spare.
    pub fn evaluate<'a>(
        &self,
        machines: impl IntoIterator<Item = &'a Machine>,
        now: Instant,
    ) -> CapacityDecision {
        let b = &self.bounds;
        let mut members = 0;
        let mut usable = 0;
        let mut active = 0;
        let mut candidates: Vec<&Machine> = Vec::new();

        for machine in machines {
            members += 1;
            if machine.state.is_usable() {
                usable += 1;
            }
            if machine.state.is_active() || machine.is_claimed() {
                active += 1;
            }
            if machine.state == MachineState::Available && machine.idle_for(now) >= b.min_idle {
                candidates.push(machine);
            }
        }
        let idle = usable - active;

        if b.auto_grow && (idle < b.spare || members < b.min) && members < b.max {
            let wanted = b
                .spare
                .saturating_sub(idle)
                .max(b.min.saturating_sub(members));
            let n = wanted.min(b.max - members);
            if n > 0 {
                return CapacityDecision::Grow(n);
            }
        }

        if b.auto_shrink && idle > b.spare && members > b.min {
            let n = (idle - b.spare).min(members - b.min);
            candidates.sort_by_key(|m| m.last_active_at);
            let ids: Vec<MachineId> = candidates.into_iter().take(n).map(|m| m.id.clone()).collect();
            if !ids.is_empty() {
                return CapacityDecision::Shrink(ids);
            }
        }

        CapacityDecision::NoOp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdipool_core::{ClientInfo, PoolId};

    fn bounds(min: usize, max: usize, spare: usize) -> CapacityBounds {
        CapacityBounds {
            min,
            max,
            spare,
            auto_grow: true,
            auto_shrink: true,
            min_idle: Duration::ZERO,
        }
    }

    fn machine(name: &str, state: MachineState, last_active_at: Instant) -> Machine {
        let mut m = Machine::placeholder(PoolId::new("p"), name, "tpl", None, "lan");
        m.id = MachineId::new(name);
        m.provisional = false;
        m.state = state;
        m.last_active_at = last_active_at;
        m
    }

    fn pool(states: &[MachineState], now: Instant) -> Vec<Machine> {
        states
            .iter()
            .enumerate()
            .map(|(i, s)| machine(&format!("m{i}"), *s, now))
            .collect()
    }

    mod grow {
        use super::*;
        use MachineState::*;

        #[test]
        fn empty_pool_grows_to_spare() {
            let policy = CapacityPolicy::new(bounds(0, 10, 3));
            let now = Instant::now();
            assert_eq!(policy.evaluate(&Vec::<Machine>::new(), now), CapacityDecision::Grow(3));
        }

        #[test]
        fn grows_to_min_when_min_exceeds_spare() {
            let policy = CapacityPolicy::new(bounds(5, 10, 1));
            let now = Instant::now();
            let machines = pool(&[Available, Available], now);
            assert_eq!(policy.evaluate(&machines, now), CapacityDecision::Grow(3));
        }

        #[test]
        fn growth_capped_at_max() {
            let policy = CapacityPolicy::new(bounds(0, 4, 3));
            let now = Instant::now();
            let machines = pool(&[InUse, InUse, InUse], now);
            assert_eq!(policy.evaluate(&machines, now), CapacityDecision::Grow(1));
        }

        #[test]
        fn full_pool_does_not_grow() {
            let policy = CapacityPolicy::new(bounds(0, 2, 1));
            let now = Instant::now();
            let machines = pool(&[InUse, Reserved], now);
            assert_eq!(policy.evaluate(&machines, now), CapacityDecision::NoOp);
        }

        #[test]
        fn provisioning_counts_as_idle() {
            let policy = CapacityPolicy::new(bounds(0, 10, 2));
            let now = Instant::now();
            let machines = pool(&[InUse, Provisioning, Provisioning], now);
            assert_eq!(policy.evaluate(&machines, now), CapacityDecision::NoOp);
        }

        #[test]
        fn claimed_placeholder_is_not_a_spare() {
            let policy = CapacityPolicy::new(bounds(0, 10, 1));
            let now = Instant::now();
            let claimed = machine("c", Provisioning, now).claimed_by(&ClientInfo::new("alice"));
            assert_eq!(policy.evaluate([&claimed], now), CapacityDecision::Grow(1));
        }

        #[test]
        fn failed_machines_are_not_spares() {
            let policy = CapacityPolicy::new(bounds(0, 10, 1));
            let now = Instant::now();
            let machines = pool(&[Failed, Draining], now);
            assert_eq!(policy.evaluate(&machines, now), CapacityDecision::Grow(1));
        }

        #[test]
        fn auto_grow_disabled() {
            let mut b = bounds(2, 10, 2);
            b.auto_grow = false;
            let policy = CapacityPolicy::new(b);
            let now = Instant::now();
            assert_eq!(policy.evaluate(&Vec::<Machine>::new(), now), CapacityDecision::NoOp);
        }
    }

    mod shrink {
        use super::*;
        use MachineState::*;

        #[test]
        fn shrinks_excess_idle_machines_lru_first() {
            let policy = CapacityPolicy::new(bounds(0, 10, 1));
            let base = Instant::now();
            let now = base + Duration::from_secs(900);
            let machines = vec![
                machine("recent", Available, now),
                machine("oldest", Available, base + Duration::from_secs(300)),
                machine("older", Available, base + Duration::from_secs(600)),
                machine("busy", InUse, base),
            ];
            assert_eq!(
                policy.evaluate(&machines, now),
                CapacityDecision::Shrink(vec![MachineId::new("oldest"), MachineId::new("older")])
            );
        }

        #[test]
        fn never_below_min() {
            let policy = CapacityPolicy::new(bounds(3, 10, 0));
            let now = Instant::now();
            let machines = pool(&[Available, Available, Available, Available], now);
            match policy.evaluate(&machines, now) {
                CapacityDecision::Shrink(ids) => assert_eq!(ids.len(), 1),
                other => panic!("expected shrink, got {other:?}"),
            }
        }

        #[test]
        fn respects_min_idle() {
            let mut b = bounds(0, 10, 0);
            b.min_idle = Duration::from_secs(300);
            let policy = CapacityPolicy::new(b);
            let base = Instant::now();
            let now = base + Duration::from_secs(400);
            let machines = vec![
                machine("fresh", Available, base + Duration::from_secs(390)),
                machine("stale", Available, base),
            ];
            assert_eq!(
                policy.evaluate(&machines, now),
                CapacityDecision::Shrink(vec![MachineId::new("stale")])
            );
        }

        #[test]
        fn nothing_eligible_is_noop() {
            let mut b = bounds(0, 10, 0);
            b.min_idle = Duration::from_secs(300);
            let policy = CapacityPolicy::new(b);
            let now = Instant::now();
            let machines = pool(&[Available, Provisioning], now);
            assert_eq!(policy.evaluate(&machines, now), CapacityDecision::NoOp);
        }

        #[test]
        fn only_available_machines_are_shrunk() {
            let policy = CapacityPolicy::new(bounds(0, 10, 0));
            let now = Instant::now();
            let machines = pool(&[Provisioning, Provisioning, Available], now);
            assert_eq!(
                policy.evaluate(&machines, now),
                CapacityDecision::Shrink(vec![MachineId::new("m2")])
            );
        }

        #[test]
        fn auto_shrink_disabled() {
            let mut b = bounds(0, 10, 0);
            b.auto_shrink = false;
            let policy = CapacityPolicy::new(b);
            let now = Instant::now();
            let machines = pool(&[Available, Available], now);
            assert_eq!(policy.evaluate(&machines, now), CapacityDecision::NoOp);
        }
    }

    #[test]
    fn steady_state_is_noop() {
        let policy = CapacityPolicy::new(bounds(1, 10, 2));
        let now = Instant::now();
        let machines = pool(
            &[
                MachineState::InUse,
                MachineState::Available,
                MachineState::Available,
            ],
            now,
        );
        assert_eq!(policy.evaluate(&machines, now), CapacityDecision::NoOp);
    }

    #[test]
    fn bounds_from_config() {
        let config = PoolConfig::new("eng", "win11", 8).with_bounds(1, 8, 2);
        let tuning = PoolTuning {
            min_idle_secs: 42,
            ..PoolTuning::default()
        };
        let b = CapacityBounds::from_config(&config, &tuning);
        assert_eq!((b.min, b.max, b.spare), (1, 8, 2));
        assert_eq!(b.min_idle, Duration::from_secs(42));
    }
}
