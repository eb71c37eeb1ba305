use super::{Addressing, ClientInfo, DomainJoin, MachineId, PoolId, Protocol};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;

/// Lifecycle state of a pooled machine.
///
/// ```text
/// (none) --create--> Provisioning --ready--> Available | Reserved (claimed)
/// Provisioning --error--> Failed
/// Available --acquire--> Reserved --connect--> InUse
/// Reserved | InUse --release--> Available
/// Available | Reserved | InUse | Failed --destroy--> Draining --> Destroyed
/// Available | Failed --rebuild--> Provisioning
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    Provisioning,
    Available,
    Reserved,
    #[serde(rename = "in_use")]
    InUse,
    Draining,
    Destroying,
    Destroyed,
    Failed,
}

impl MachineState {
    pub fn can_transition_to(self, to: MachineState) -> bool {
        use MachineState::*;
        matches!(
            (self, to),
            (Provisioning, Available)
                | (Provisioning, Reserved)
                | (Provisioning, Failed)
                | (Available, Reserved)
                | (Reserved, InUse)
                | (Reserved, Available)
                | (InUse, Available)
                | (Available, Draining)
                | (Reserved, Draining)
                | (InUse, Draining)
                | (Failed, Draining)
                | (Draining, Destroying)
                | (Draining, Destroyed)
                | (Draining, Failed)
                | (Destroying, Destroyed)
                | (Destroying, Failed)
                | (Available, Provisioning)
                | (Failed, Provisioning)
        )
    }

    /// Reserved or in use by a client.
    pub fn is_active(self) -> bool {
        matches!(self, MachineState::Reserved | MachineState::InUse)
    }

    /// Counts toward serving capacity (everything except broken or leaving
    /// machines).
    pub fn is_usable(self) -> bool {
        !matches!(
            self,
            MachineState::Failed
                | MachineState::Draining
                | MachineState::Destroying
                | MachineState::Destroyed
        )
    }

    pub fn is_terminal(self) -> bool {
        self == MachineState::Destroyed
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MachineState::Provisioning => "provisioning",
            MachineState::Available => "available",
            MachineState::Reserved => "reserved",
            MachineState::InUse => "in_use",
            MachineState::Draining => "draining",
            MachineState::Destroying => "destroying",
            MachineState::Destroyed => "destroyed",
            MachineState::Failed => "failed",
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A machine as tracked by a pool's registry.
#[derive(Debug, Clone)]
pub struct Machine {
    pub id: MachineId,
    pub pool: PoolId,
    pub name: String,
    pub template: String,
    pub snapshot: Option<String>,
    pub network: String,
    pub state: MachineState,
    /// Address reported by the hypervisor once the machine is up.
    pub address: Option<String>,
    /// Client holding the reservation. On a provisioning placeholder this is
    /// the client the machine is being built for.
    pub reserved_by: Option<String>,
    pub reserved_at: Option<Instant>,
    pub last_active_at: Instant,
    /// The id is a placeholder until the hypervisor returns the real one.
    pub provisional: bool,
}

impl Machine {
    /// Creates a provisioning placeholder that holds a capacity slot while the
    /// hypervisor builds the machine.
    pub fn placeholder(
        pool: PoolId,
        name: impl Into<String>,
        template: impl Into<String>,
        snapshot: Option<String>,
        network: impl Into<String>,
    ) -> Self {
        Self {
            id: MachineId::provisional(),
            pool,
            name: name.into(),
            template: template.into(),
            snapshot,
            network: network.into(),
            state: MachineState::Provisioning,
            address: None,
            reserved_by: None,
            reserved_at: None,
            last_active_at: Instant::now(),
            provisional: true,
        }
    }

    pub fn claimed_by(mut self, client: &ClientInfo) -> Self {
        self.reserved_by = Some(client.label());
        self
    }

    /// Provisioning and reserved for a specific caller.
    pub fn is_claimed(&self) -> bool {
        self.state == MachineState::Provisioning && self.reserved_by.is_some()
    }

    pub fn idle_for(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.last_active_at)
    }
}

/// Power state reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    On,
    Off,
    Suspended,
    Unknown,
}

/// Hypervisor view of a machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineInfo {
    pub id: MachineId,
    pub name: String,
    /// Pool the machine is tagged with, if any.
    pub pool: Option<PoolId>,
    pub template: Option<String>,
    pub power: PowerState,
    pub address: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Everything an adapter needs to build one machine.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineSpec {
    pub pool: PoolId,
    pub template: String,
    pub snapshot: Option<String>,
    pub name: String,
    pub network: String,
    pub tags: Vec<String>,
    pub addressing: Addressing,
    pub domain_join: Option<DomainJoin>,
}

/// What a client needs to reach a reserved machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineHandle {
    pub id: MachineId,
    pub name: String,
    pub pool: PoolId,
    pub protocol: Protocol,
    pub address: Option<String>,
}

impl MachineHandle {
    /// Hostname to connect to: the reported address, or the machine name.
    pub fn hostname(&self) -> &str {
        self.address.as_deref().unwrap_or(&self.name)
    }
}
