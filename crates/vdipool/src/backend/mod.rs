mod memory;
mod virsh;

pub use memory::{CallCounts, MemoryAdapter};
pub use virsh::{DEFAULT_URI, TEMPLATE_TAG, VirshAdapter};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use vdipool_core::{Error, HypervisorAdapter, Result};

fn default_uri() -> String {
    DEFAULT_URI.to_string()
}

/// Which hypervisor adapter to use and how to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AdapterConfig {
    Memory {
        /// Artificial delay added to every call.
        #[serde(default)]
        latency_ms: u64,
    },
    Virsh {
        #[serde(default = "default_uri")]
        uri: String,
    },
}

impl Default for AdapterConfig {
    fn default() -> Self {
        AdapterConfig::Memory { latency_ms: 0 }
    }
}

impl AdapterConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            AdapterConfig::Memory { .. } => "memory",
            AdapterConfig::Virsh { .. } => "virsh",
        }
    }
}

/// Builds the adapter described by `config`.
///
/// The returned adapter is meant to be shared by every pool using it.
///
/// # Errors
///
/// Returns [`Error::AdapterUnavailable`] if the adapter's tooling is missing
/// on this host.
pub fn select_adapter(config: &AdapterConfig) -> Result<Arc<dyn HypervisorAdapter>> {
    let adapter: Arc<dyn HypervisorAdapter> = match config {
        AdapterConfig::Memory { latency_ms } => {
            Arc::new(MemoryAdapter::new().with_latency(Duration::from_millis(*latency_ms)))
        }
        AdapterConfig::Virsh { uri } => Arc::new(VirshAdapter::new(uri.clone())),
    };
    if !adapter.is_available() {
        return Err(Error::AdapterUnavailable {
            name: adapter.name().to_string(),
            reason: "required tools not found in PATH".to_string(),
        });
    }
    Ok(adapter)
}

/// Every adapter this build knows about, available on this host or not.
pub fn available_adapters() -> Vec<Box<dyn HypervisorAdapter>> {
    vec![
        Box::new(MemoryAdapter::new()),
        Box::new(VirshAdapter::default()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_adapter_is_always_selectable() {
        let adapter = select_adapter(&AdapterConfig::Memory { latency_ms: 5 }).unwrap();
        assert_eq!(adapter.name(), "memory");
        assert!(adapter.capabilities().rebuild);
    }

    #[test]
    fn available_adapters_lists_all_kinds() {
        let names: Vec<&str> = available_adapters().iter().map(|a| a.name()).collect();
        assert_eq!(names, vec!["memory", "virsh"]);
    }

    #[test]
    fn config_deserializes_by_kind() {
        let config: AdapterConfig = serde_json::from_str(r#"{"kind": "virsh"}"#).unwrap();
        assert_eq!(
            config,
            AdapterConfig::Virsh {
                uri: DEFAULT_URI.to_string()
            }
        );
        assert_eq!(config.kind(), "virsh");

        let config: AdapterConfig =
            serde_json::from_str(r#"{"kind": "memory", "latency_ms": 20}"#).unwrap();
        assert_eq!(config, AdapterConfig::Memory { latency_ms: 20 });
    }
}
