mod machine;
mod network;
mod pool;
mod template;

pub use machine::{Machine, MachineHandle, MachineInfo, MachineSpec, MachineState, PowerState};
pub use network::{Addressing, DomainJoin, StaticAddress};
pub use pool::{
    OrphanPolicy, PoolConfig, PoolStats, PoolTuning, PoolType, RetryPolicy, attributes,
};
pub use template::Template;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Hypervisor-assigned machine identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineId(String);

impl MachineId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates an identifier for a machine the hypervisor has not assigned
    /// an id to yet.
    pub fn provisional() -> Self {
        Self(format!("pending-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MachineId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Identifier of a desktop pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolId(String);

impl PoolId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hypervisor tag marking a machine as a member of this pool.
    ///
    /// This tag is the only state persisted outside the process; it lets a
    /// restarted manager rediscover its machines.
    pub fn tag(&self) -> String {
        format!("vdipool:pool={}", self.0)
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PoolId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Remote desktop protocol used to reach machines of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Rdp,
    Vnc,
    Ssh,
    Telnet,
    Kubernetes,
}

impl Protocol {
    pub const ALL: [Protocol; 5] = [
        Protocol::Rdp,
        Protocol::Vnc,
        Protocol::Ssh,
        Protocol::Telnet,
        Protocol::Kubernetes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Rdp => "rdp",
            Protocol::Vnc => "vnc",
            Protocol::Ssh => "ssh",
            Protocol::Telnet => "telnet",
            Protocol::Kubernetes => "kubernetes",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
    }

    /// Port the protocol listens on when a machine does not say otherwise.
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Rdp => 3389,
            Protocol::Vnc => 5900,
            Protocol::Ssh => 22,
            Protocol::Telnet => 23,
            Protocol::Kubernetes => 8080,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Information about the client asking for a desktop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub username: Option<String>,
    pub remote_address: Option<String>,
}

impl ClientInfo {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            remote_address: None,
        }
    }

    pub fn with_remote_address(mut self, address: impl Into<String>) -> Self {
        self.remote_address = Some(address.into());
        self
    }

    /// Label used in logs and as the reservation owner.
    pub fn label(&self) -> String {
        match (&self.username, &self.remote_address) {
            (Some(user), Some(addr)) => format!("{user}@{addr}"),
            (Some(user), None) => user.clone(),
            (None, Some(addr)) => addr.clone(),
            (None, None) => "anonymous".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod machine_id {
        use super::*;

        #[test]
        fn provisional_ids_are_unique() {
            let a = MachineId::provisional();
            let b = MachineId::provisional();
            assert_ne!(a, b);
            assert!(a.as_str().starts_with("pending-"));
        }

        #[test]
        fn serializes_as_plain_string() {
            let id = MachineId::new("vm-42");
            assert_eq!(serde_json::to_string(&id).unwrap(), "\"vm-42\"");
        }
    }

    mod pool_id {
        use super::*;

        #[test]
        fn tag_includes_pool_id() {
            assert_eq!(PoolId::new("eng").tag(), "vdipool:pool=eng");
        }
    }

    mod protocol {
        use super::*;

        #[test]
        fn serializes_lowercase() {
            assert_eq!(serde_json::to_string(&Protocol::Rdp).unwrap(), "\"rdp\"");
            assert_eq!(
                serde_json::from_str::<Protocol>("\"vnc\"").unwrap(),
                Protocol::Vnc
            );
        }

        #[test]
        fn parse_is_case_insensitive() {
            assert_eq!(Protocol::parse("SSH"), Some(Protocol::Ssh));
            assert_eq!(Protocol::parse(" rdp "), Some(Protocol::Rdp));
            assert_eq!(Protocol::parse("spice"), None);
        }

        #[test]
        fn default_ports() {
            assert_eq!(Protocol::Rdp.default_port(), 3389);
            assert_eq!(Protocol::Vnc.default_port(), 5900);
        }
    }

    mod client_info {
        use super::*;

        #[test]
        fn label_combines_user_and_address() {
            let client = ClientInfo::new("alice").with_remote_address("10.0.0.7");
            assert_eq!(client.label(), "alice@10.0.0.7");
        }

        #[test]
        fn label_defaults_to_anonymous() {
            assert_eq!(ClientInfo::default().label(), "anonymous");
        }
    }
}
