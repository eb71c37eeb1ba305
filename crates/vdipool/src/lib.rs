//! Warm pools of virtual desktops behind a single connection target.
//!
//! vdipool keeps a right-sized set of desktop machines ready for incoming
//! connections, provisioning and destroying them on demand against a
//! pluggable hypervisor adapter.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use vdipool::{AdapterConfig, ClientInfo, PoolConfig, PoolManager, PoolTuning, select_adapter};
//!
//! # async fn example() -> vdipool::Result<()> {
//! let adapter = select_adapter(&AdapterConfig::Virsh {
//!     uri: "qemu:///system".into(),
//! })?;
//!
//! let config = PoolConfig::new("eng", "win11-gold", 20)
//!     .with_bounds(2, 20, 3)
//!     .with_basename("eng-desk");
//! let pool = PoolManager::new(config, PoolTuning::default(), adapter)?;
//! pool.reconcile().await?;
//!
//! let lease = pool.acquire(&ClientInfo::new("alice")).await?;
//! println!("{} at {}", lease.name, lease.hostname());
//! lease.release().await?;
//! # Ok(())
//! # }
//! ```
//!
//! The main types are [`PoolManager`], [`MachineLease`] and
//! [`PoolGroupFacade`]. Hypervisors plug in through
//! [`HypervisorAdapter`].

mod backend;
mod facade;
mod policy;
mod pool;
mod registrar;
mod registry;

// ============================================================================
// Pools
// ============================================================================

pub use pool::{MachineLease, PoolManager, ReconcileReport};
pub use policy::{CapacityBounds, CapacityDecision, CapacityPolicy};
pub use registry::{MachineRegistry, Members};

pub use vdipool_core::{
    Machine, MachineHandle, MachineId, MachineState, OrphanPolicy, PoolConfig, PoolId, PoolStats,
    PoolTuning, PoolType, RetryPolicy, attributes,
};

// Provisioning inputs
pub use vdipool_core::{Addressing, DomainJoin, MachineSpec, StaticAddress, Template};

// Connections
pub use facade::{
    AttributeField, ConnectTarget, Connector, FieldKind, PoolGroupFacade, PoolSession, Tunnel,
};
pub use registrar::{REGISTERED_UUID, RegisteredConnection, Registrar};
pub use vdipool_core::{ClientInfo, Protocol};

// Errors
pub use vdipool_core::{AdapterError, AdapterResult, Error, Result};

// ============================================================================
// Adapters
// ============================================================================

pub use backend::{
    AdapterConfig, CallCounts, DEFAULT_URI, MemoryAdapter, TEMPLATE_TAG, VirshAdapter,
    available_adapters, select_adapter,
};
pub use vdipool_core::{AdapterCapabilities, HypervisorAdapter, MachineInfo, PowerState};
