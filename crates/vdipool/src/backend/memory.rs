//! In-process hypervisor.
//!
//! Machines exist only in memory. Useful for tests and dry runs of a pool
//! configuration; faults can be injected to exercise failure handling.

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;
use vdipool_core::{
    AdapterCapabilities, AdapterError, AdapterResult, HypervisorAdapter, MachineId, MachineInfo,
    MachineSpec, PoolId, PowerState, Template,
};

/// Number of calls made to each adapter operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub list: usize,
    pub get: usize,
    pub create: usize,
    pub destroy: usize,
    pub start: usize,
    pub stop: usize,
    pub restart: usize,
    pub rebuild: usize,
}

impl CallCounts {
    pub fn total(&self) -> usize {
        self.list
            + self.get
            + self.create
            + self.destroy
            + self.start
            + self.stop
            + self.restart
            + self.rebuild
    }
}

#[derive(Default)]
struct Faults {
    create_errors: VecDeque<AdapterError>,
    hidden_creates: usize,
    start_failures: usize,
    hang_creates: bool,
    hang_gets: bool,
}

struct State {
    machines: BTreeMap<MachineId, MachineInfo>,
    templates: Vec<Template>,
    networks: BTreeMap<String, String>,
    storage: BTreeMap<String, String>,
    next_id: u64,
    faults: Faults,
    calls: CallCounts,
}

pub struct MemoryAdapter {
    capabilities: AdapterCapabilities,
    latency: Duration,
    state: Mutex<State>,
}

impl MemoryAdapter {
    /// Creates an adapter seeded with a couple of templates, one network and
    /// one datastore.
    pub fn new() -> Self {
        let templates = vec![
            Template::new("win11-gold", "Windows 11 Gold")
                .in_folder("templates")
                .with_snapshot("base")
                .with_snapshot("patched"),
            Template::new("ubuntu-24.04", "Ubuntu 24.04").in_folder("templates"),
        ];
        let networks = BTreeMap::from([("net-1".to_string(), "lan".to_string())]);
        let storage = BTreeMap::from([("ds-1".to_string(), "datastore1".to_string())]);

        Self {
            capabilities: AdapterCapabilities::all(),
            latency: Duration::ZERO,
            state: Mutex::new(State {
                machines: BTreeMap::new(),
                templates,
                networks,
                storage,
                next_id: 0,
                faults: Faults::default(),
                calls: CallCounts::default(),
            }),
        }
    }

    /// Delays every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_capabilities(mut self, capabilities: AdapterCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_template(self, template: Template) -> Self {
        self.lock().templates.push(template);
        self
    }

    pub fn with_network(self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.lock().networks.insert(id.into(), name.into());
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes the next `count` creates fail with `error` without creating
    /// anything.
    pub fn fail_next_creates(&self, count: usize, error: AdapterError) {
        let mut state = self.lock();
        for _ in 0..count {
            state.faults.create_errors.push_back(error.clone());
        }
    }

    /// Makes the next `count` creates build the machine but report a
    /// timeout, as when the response of a remote call is lost.
    pub fn hide_next_creates(&self, count: usize) {
        self.lock().faults.hidden_creates += count;
    }

    /// Makes the next `count` starts fail.
    pub fn fail_next_starts(&self, count: usize) {
        self.lock().faults.start_failures += count;
    }

    /// Makes creates never return while set.
    pub fn hang_creates(&self, hang: bool) {
        self.lock().faults.hang_creates = hang;
    }

    /// Makes `get_machine` never return while set.
    pub fn hang_inspections(&self, hang: bool) {
        self.lock().faults.hang_gets = hang;
    }

    /// Adds a machine as if created outside the pool manager.
    pub fn add_machine(&self, name: &str, tags: &[String], power: PowerState) -> MachineId {
        let mut state = self.lock();
        let id = state.allocate_id();
        let address = (power == PowerState::On).then(|| address_for(&id));
        let info = MachineInfo {
            id: id.clone(),
            name: name.to_string(),
            pool: pool_from_tags(tags),
            template: None,
            power,
            address,
            tags: tags.to_vec(),
        };
        state.machines.insert(id.clone(), info);
        id
    }

    /// Deletes a machine behind the pool manager's back.
    pub fn remove_machine(&self, id: &MachineId) -> bool {
        self.lock().machines.remove(id).is_some()
    }

    pub fn machine(&self, id: &MachineId) -> Option<MachineInfo> {
        self.lock().machines.get(id).cloned()
    }

    pub fn machine_count(&self) -> usize {
        self.lock().machines.len()
    }

    pub fn calls(&self) -> CallCounts {
        self.lock().calls.clone()
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    fn allocate_id(&mut self) -> MachineId {
        self.next_id += 1;
        MachineId::new(format!("vm-{}", self.next_id))
    }

    fn machine_mut(&mut self, id: &MachineId) -> AdapterResult<&mut MachineInfo> {
        self.machines
            .get_mut(id)
            .ok_or_else(|| AdapterError::NotFound(id.to_string()))
    }

    fn validate(&self, spec: &MachineSpec) -> AdapterResult<()> {
        let template = self
            .templates
            .iter()
            .find(|t| t.id == spec.template || t.name == spec.template)
            .ok_or_else(|| AdapterError::Permanent(format!("unknown template '{}'", spec.template)))?;
        if let Some(snapshot) = &spec.snapshot {
            if !template.has_snapshot(snapshot) {
                return Err(AdapterError::Permanent(format!(
                    "template '{}' has no snapshot '{snapshot}'",
                    template.id
                )));
            }
        }
        if !spec.network.is_empty()
            && !self.networks.contains_key(&spec.network)
            && !self.networks.values().any(|n| n == &spec.network)
        {
            return Err(AdapterError::Permanent(format!(
                "unknown network '{}'",
                spec.network
            )));
        }
        Ok(())
    }
}

fn address_for(id: &MachineId) -> String {
    let n: u32 = id
        .as_str()
        .trim_start_matches("vm-")
        .parse()
        .unwrap_or(0);
    format!("10.64.{}.{}", (n / 250) % 256, n % 250 + 2)
}

fn pool_from_tags(tags: &[String]) -> Option<PoolId> {
    tags.iter()
        .find_map(|t| t.strip_prefix("vdipool:pool="))
        .map(PoolId::new)
}

#[async_trait]
impl HypervisorAdapter for MemoryAdapter {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn capabilities(&self) -> &AdapterCapabilities {
        &self.capabilities
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn list_machines(&self, tags: &[String]) -> AdapterResult<Vec<MachineId>> {
        self.lock().calls.list += 1;
        self.delay().await;
        let state = self.lock();
        Ok(state
            .machines
            .values()
            .filter(|m| tags.iter().all(|t| m.tags.contains(t)))
            .map(|m| m.id.clone())
            .collect())
    }

    async fn get_machine(&self, id: &MachineId) -> AdapterResult<MachineInfo> {
        let hang = {
            let mut state = self.lock();
            state.calls.get += 1;
            state.faults.hang_gets
        };
        if hang {
            std::future::pending::<()>().await;
        }
        self.delay().await;
        self.lock()
            .machines
            .get(id)
            .cloned()
            .ok_or_else(|| AdapterError::NotFound(id.to_string()))
    }

    async fn list_templates(&self, folder: Option<&str>) -> AdapterResult<Vec<Template>> {
        self.delay().await;
        Ok(self
            .lock()
            .templates
            .iter()
            .filter(|t| folder.is_none() || t.folder.as_deref() == folder)
            .cloned()
            .collect())
    }

    async fn storage(&self) -> AdapterResult<BTreeMap<String, String>> {
        self.delay().await;
        Ok(self.lock().storage.clone())
    }

    async fn networks(&self) -> AdapterResult<BTreeMap<String, String>> {
        self.delay().await;
        Ok(self.lock().networks.clone())
    }

    async fn create_machine(&self, spec: &MachineSpec) -> AdapterResult<MachineId> {
        let hang = {
            let mut state = self.lock();
            state.calls.create += 1;
            state.faults.hang_creates
        };
        if hang {
            std::future::pending::<()>().await;
        }
        self.delay().await;

        let mut state = self.lock();
        if let Some(error) = state.faults.create_errors.pop_front() {
            return Err(error);
        }
        if spec.domain_join.is_some() && !self.capabilities.domain_join {
            return Err(AdapterError::Unsupported("domain join".into()));
        }
        if spec.addressing.is_static() && !self.capabilities.static_addressing {
            return Err(AdapterError::Unsupported("static addressing".into()));
        }
        state.validate(spec)?;

        let id = state.allocate_id();
        state.machines.insert(
            id.clone(),
            MachineInfo {
                id: id.clone(),
                name: spec.name.clone(),
                pool: Some(spec.pool.clone()),
                template: Some(spec.template.clone()),
                power: PowerState::Off,
                address: None,
                tags: spec.tags.clone(),
            },
        );
        debug!(machine = %id, name = %spec.name, "memory adapter created machine");

        if state.faults.hidden_creates > 0 {
            state.faults.hidden_creates -= 1;
            return Err(AdapterError::Timeout(format!(
                "create of '{}' lost its response",
                spec.name
            )));
        }
        Ok(id)
    }

    async fn destroy_machine(&self, id: &MachineId) -> AdapterResult<()> {
        self.lock().calls.destroy += 1;
        self.delay().await;
        self.lock()
            .machines
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| AdapterError::NotFound(id.to_string()))
    }

    async fn start_machine(&self, id: &MachineId) -> AdapterResult<()> {
        self.lock().calls.start += 1;
        self.delay().await;
        let mut state = self.lock();
        if state.faults.start_failures > 0 {
            state.faults.start_failures -= 1;
            return Err(AdapterError::Permanent(format!("{id} failed to boot")));
        }
        let machine = state.machine_mut(id)?;
        machine.power = PowerState::On;
        machine.address = Some(address_for(id));
        Ok(())
    }

    async fn stop_machine(&self, id: &MachineId, _clean: bool) -> AdapterResult<()> {
        self.lock().calls.stop += 1;
        self.delay().await;
        let mut state = self.lock();
        let machine = state.machine_mut(id)?;
        machine.power = PowerState::Off;
        machine.address = None;
        Ok(())
    }

    async fn restart_machine(&self, id: &MachineId, _clean: bool) -> AdapterResult<()> {
        self.lock().calls.restart += 1;
        self.delay().await;
        let mut state = self.lock();
        let machine = state.machine_mut(id)?;
        machine.power = PowerState::On;
        machine.address = Some(address_for(id));
        Ok(())
    }

    async fn rebuild_machine(&self, id: &MachineId) -> AdapterResult<()> {
        self.lock().calls.rebuild += 1;
        if !self.capabilities.rebuild {
            return Err(AdapterError::Unsupported("rebuild".into()));
        }
        self.delay().await;
        let mut state = self.lock();
        let machine = state.machine_mut(id)?;
        machine.power = PowerState::Off;
        machine.address = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdipool_core::{Addressing, DomainJoin};

    fn spec(name: &str) -> MachineSpec {
        MachineSpec {
            pool: PoolId::new("eng"),
            template: "win11-gold".to_string(),
            snapshot: None,
            name: name.to_string(),
            network: "lan".to_string(),
            tags: vec![PoolId::new("eng").tag()],
            addressing: Addressing::Dhcp,
            domain_join: None,
        }
    }

    #[tokio::test]
    async fn create_start_and_inspect() {
        let adapter = MemoryAdapter::new();
        let id = adapter.create_machine(&spec("eng-1")).await.unwrap();
        assert_eq!(adapter.get_machine(&id).await.unwrap().power, PowerState::Off);

        adapter.start_machine(&id).await.unwrap();
        let info = adapter.get_machine(&id).await.unwrap();
        assert_eq!(info.power, PowerState::On);
        assert!(info.address.is_some());
        assert_eq!(info.pool, Some(PoolId::new("eng")));
    }

    #[tokio::test]
    async fn unknown_template_is_permanent() {
        let adapter = MemoryAdapter::new();
        let mut bad = spec("eng-1");
        bad.template = "nope".to_string();
        let err = adapter.create_machine(&bad).await.unwrap_err();
        assert!(matches!(err, AdapterError::Permanent(_)));
        assert_eq!(adapter.machine_count(), 0);
    }

    #[tokio::test]
    async fn unknown_snapshot_is_rejected() {
        let adapter = MemoryAdapter::new();
        let mut bad = spec("eng-1");
        bad.snapshot = Some("missing".to_string());
        assert!(adapter.create_machine(&bad).await.is_err());

        let mut good = spec("eng-2");
        good.snapshot = Some("patched".to_string());
        assert!(adapter.create_machine(&good).await.is_ok());
    }

    #[tokio::test]
    async fn list_filters_by_tag() {
        let adapter = MemoryAdapter::new();
        let ours = adapter.create_machine(&spec("eng-1")).await.unwrap();
        adapter.add_machine("other", &[PoolId::new("ops").tag()], PowerState::On);
        adapter.add_machine("untagged", &[], PowerState::Off);

        let listed = adapter.list_machines(&[PoolId::new("eng").tag()]).await.unwrap();
        assert_eq!(listed, vec![ours]);
        assert_eq!(adapter.list_machines(&[]).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn destroy_missing_is_not_found() {
        let adapter = MemoryAdapter::new();
        let err = adapter
            .destroy_machine(&MachineId::new("vm-404"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn injected_create_failures_are_consumed_in_order() {
        let adapter = MemoryAdapter::new();
        adapter.fail_next_creates(1, AdapterError::Transient("busy".into()));
        adapter.fail_next_creates(1, AdapterError::QuotaExceeded("cpu".into()));

        assert!(matches!(
            adapter.create_machine(&spec("a")).await,
            Err(AdapterError::Transient(_))
        ));
        assert!(matches!(
            adapter.create_machine(&spec("b")).await,
            Err(AdapterError::QuotaExceeded(_))
        ));
        assert!(adapter.create_machine(&spec("c")).await.is_ok());
        assert_eq!(adapter.calls().create, 3);
    }

    #[tokio::test]
    async fn hidden_create_leaves_machine_behind() {
        let adapter = MemoryAdapter::new();
        adapter.hide_next_creates(1);
        let err = adapter.create_machine(&spec("eng-1")).await.unwrap_err();
        assert!(matches!(err, AdapterError::Timeout(_)));
        assert_eq!(adapter.machine_count(), 1);
    }

    #[tokio::test]
    async fn domain_join_requires_capability() {
        let adapter = MemoryAdapter::new().with_capabilities(AdapterCapabilities::default());
        let mut joined = spec("eng-1");
        joined.domain_join = Some(DomainJoin {
            domain: "corp.example".into(),
            username: "joiner".into(),
            password: "pw".into(),
            ou: None,
        });
        assert!(matches!(
            adapter.create_machine(&joined).await,
            Err(AdapterError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn templates_filtered_by_folder() {
        let adapter = MemoryAdapter::new().with_template(Template::new("lab", "Lab").in_folder("lab"));
        assert_eq!(adapter.list_templates(None).await.unwrap().len(), 3);
        let lab = adapter.list_templates(Some("lab")).await.unwrap();
        assert_eq!(lab.len(), 1);
        assert_eq!(lab[0].id, "lab");
    }

    #[test]
    fn addresses_are_distinct() {
        assert_ne!(
            address_for(&MachineId::new("vm-1")),
            address_for(&MachineId::new("vm-2"))
        );
    }
}
