use crate::capabilities::AdapterCapabilities;
use crate::error::AdapterResult;
use crate::types::{MachineId, MachineInfo, MachineSpec, Template};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Vendor driver for a hypervisor or cloud provider.
///
/// Every call may block on network I/O for seconds to minutes. Implementations
/// hold no pool state and are shared by all pools of a backend, so they must
/// be safe to call concurrently.
#[async_trait]
pub trait HypervisorAdapter: Send + Sync {
    fn name(&self) -> &'static str;
    fn capabilities(&self) -> &AdapterCapabilities;
    fn is_available(&self) -> bool;

    /// Identifiers of machines carrying all of the given tags.
    async fn list_machines(&self, tags: &[String]) -> AdapterResult<Vec<MachineId>>;
    async fn get_machine(&self, id: &MachineId) -> AdapterResult<MachineInfo>;
    async fn list_templates(&self, folder: Option<&str>) -> AdapterResult<Vec<Template>>;
    /// Storage repositories, id to name.
    async fn storage(&self) -> AdapterResult<BTreeMap<String, String>>;
    /// Networks, id to name.
    async fn networks(&self) -> AdapterResult<BTreeMap<String, String>>;

    async fn create_machine(&self, spec: &MachineSpec) -> AdapterResult<MachineId>;
    /// Halts and deletes the machine.
    async fn destroy_machine(&self, id: &MachineId) -> AdapterResult<()>;
    async fn start_machine(&self, id: &MachineId) -> AdapterResult<()>;
    async fn stop_machine(&self, id: &MachineId, clean: bool) -> AdapterResult<()>;
    async fn restart_machine(&self, id: &MachineId, clean: bool) -> AdapterResult<()>;
    /// Resets the machine to its template or snapshot.
    async fn rebuild_machine(&self, id: &MachineId) -> AdapterResult<()>;
}
