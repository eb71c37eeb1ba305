use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// How a new machine obtains its network address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "mode")]
pub enum Addressing {
    #[default]
    Dhcp,
    Static(StaticAddress),
}

impl Addressing {
    pub fn is_static(&self) -> bool {
        matches!(self, Addressing::Static(_))
    }
}

/// Fixed network settings applied to a machine at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticAddress {
    pub ip: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    #[serde(default)]
    pub dns: Vec<Ipv4Addr>,
    /// Primary DNS domain of the machine.
    pub domain: Option<String>,
    #[serde(default)]
    pub search_domains: Vec<String>,
}

/// Active Directory join parameters for new machines.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainJoin {
    pub domain: String,
    pub username: String,
    pub password: String,
    /// OU to place the computer object in.
    pub ou: Option<String>,
}

impl fmt::Debug for DomainJoin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainJoin")
            .field("domain", &self.domain)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("ou", &self.ou)
            .finish()
    }
}
