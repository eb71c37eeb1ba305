//! TOML configuration of the `vdipool` daemon.
//!
//! ```toml
//! [adapter]
//! kind = "virsh"
//! uri = "qemu:///system"
//!
//! [[pools]]
//! id = "eng"
//! template = "win11-gold"
//! max = 20
//! spare = 2
//!
//! [pools.tuning]
//! min_idle_secs = 600
//! ```

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use vdipool::{AdapterConfig, PoolConfig, PoolTuning};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub adapter: AdapterConfig,
    #[serde(default)]
    pub pools: Vec<PoolEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolEntry {
    #[serde(flatten)]
    pub pool: PoolConfig,
    /// Overrides the default tuning for this pool.
    pub tuning: Option<PoolTuning>,
}

impl PoolEntry {
    pub fn tuning(&self) -> PoolTuning {
        self.tuning.clone().unwrap_or_default()
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config = Self::parse(&text).with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pools.is_empty() {
            bail!("no pools configured");
        }
        let mut seen = HashSet::new();
        for entry in &self.pools {
            entry.pool.validate()?;
            if !seen.insert(entry.pool.id.clone()) {
                bail!("pool '{}' is configured more than once", entry.pool.id);
            }
        }
        Ok(())
    }
}
