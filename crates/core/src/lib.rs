pub mod adapter;
pub mod capabilities;
pub mod error;
pub mod types;

pub use adapter::HypervisorAdapter;
pub use capabilities::AdapterCapabilities;
pub use error::{AdapterError, AdapterResult, Error, Result};
pub use types::{
    Addressing, ClientInfo, DomainJoin, Machine, MachineHandle, MachineId, MachineInfo,
    MachineSpec, MachineState, OrphanPolicy, PoolConfig, PoolId, PoolStats, PoolTuning, PoolType,
    PowerState, Protocol, RetryPolicy, StaticAddress, Template, attributes,
};
