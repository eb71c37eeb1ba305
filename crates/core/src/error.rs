use crate::types::{MachineId, MachineState, PoolId};

/// Errors reported by a hypervisor adapter.
///
/// Only [`AdapterError::Transient`] is retried by the pool manager; every
/// other kind is surfaced to the caller on the first occurrence.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    #[error("machine not found: {0}")]
    NotFound(String),

    #[error("hypervisor call timed out: {0}")]
    Timeout(String),

    #[error("hypervisor quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("hypervisor authentication failed: {0}")]
    AuthFailure(String),

    #[error("transient hypervisor error: {0}")]
    Transient(String),

    #[error("hypervisor error: {0}")]
    Permanent(String),

    #[error("operation not supported by adapter: {0}")]
    Unsupported(String),
}

impl AdapterError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterError::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AdapterError::NotFound(_))
    }
}

pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// Errors that can occur when managing desktop pools.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no suitable hypervisor adapter available")]
    NoAdapterAvailable,

    #[error("adapter '{name}' is not available: {reason}")]
    AdapterUnavailable { name: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("missing required configuration: {0}")]
    MissingConfig(String),

    #[error("pool '{pool}' has no machines available (max {max})")]
    CapacityExceeded { pool: PoolId, max: usize },

    #[error("provisioning failed: {0}")]
    Provision(#[source] AdapterError),

    #[error("reconciliation error: {0}")]
    Reconciliation(String),

    #[error("machine not found: {0}")]
    MachineNotFound(MachineId),

    #[error("machine {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: MachineId,
        from: MachineState,
        to: MachineState,
    },

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("pool is shutting down")]
    PoolShutdown,

    #[error("invalid or missing registration token")]
    Unauthorized,

    #[error("registration not found: {0}")]
    RegistrationNotFound(uuid::Uuid),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true when the pool was full, as opposed to a failure to build
    /// a new machine. Callers use this to decide between queueing and
    /// reporting an error.
    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(self, Error::CapacityExceeded { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_capacity_exceeded() {
        let err = Error::CapacityExceeded {
            pool: PoolId::new("eng"),
            max: 3,
        };
        assert_eq!(
            err.to_string(),
            "pool 'eng' has no machines available (max 3)"
        );
        assert!(err.is_capacity_exceeded());
    }

    #[test]
    fn error_display_provision_wraps_adapter_error() {
        let err = Error::Provision(AdapterError::QuotaExceeded("vcpu".to_string()));
        assert_eq!(
            err.to_string(),
            "provisioning failed: hypervisor quota exceeded: vcpu"
        );
        assert!(!err.is_capacity_exceeded());
    }

    #[test]
    fn error_display_invalid_transition() {
        let err = Error::InvalidTransition {
            id: MachineId::new("vm-1"),
            from: MachineState::Draining,
            to: MachineState::Reserved,
        };
        assert_eq!(
            err.to_string(),
            "machine vm-1 cannot move from draining to reserved"
        );
    }

    #[test]
    fn error_from_adapter_error_is_transparent() {
        let err: Error = AdapterError::NotFound("vm-9".to_string()).into();
        assert!(matches!(err, Error::Adapter(AdapterError::NotFound(_))));
        assert_eq!(err.to_string(), "machine not found: vm-9");
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(AdapterError::Transient("busy".into()).is_retryable());
        assert!(!AdapterError::Timeout("create".into()).is_retryable());
        assert!(!AdapterError::QuotaExceeded("ram".into()).is_retryable());
        assert!(!AdapterError::AuthFailure("denied".into()).is_retryable());
        assert!(!AdapterError::Permanent("bad template".into()).is_retryable());
    }

    #[test]
    fn error_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "virsh not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("virsh not found"));
    }
}
