use serde::{Deserialize, Serialize};

/// Optional features a hypervisor adapter supports.
///
/// The pool manager checks these when a pool is created so that a
/// configuration the adapter cannot honour fails early instead of on the
/// first provisioning attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterCapabilities {
    /// Reimage a machine from its template in place.
    pub rebuild: bool,
    /// Join new machines to an Active Directory domain.
    pub domain_join: bool,
    /// Assign fixed addresses instead of DHCP.
    pub static_addressing: bool,
    /// Persist pool tags on machines. Without tagging, pool membership cannot
    /// be recovered after a restart.
    pub tagging: bool,
}

impl AdapterCapabilities {
    pub fn all() -> Self {
        Self {
            rebuild: true,
            domain_join: true,
            static_addressing: true,
            tagging: true,
        }
    }
}
