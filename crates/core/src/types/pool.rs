use super::{Addressing, DomainJoin, Machine, MachineState, PoolId, Protocol};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Names of the connection-group attributes that configure a pool.
pub mod attributes {
    pub const TYPE: &str = "vdi-pool-type";
    pub const TEMPLATE: &str = "vdi-pool-template";
    pub const SNAPSHOT: &str = "vdi-pool-snapshot";
    pub const BASENAME: &str = "vdi-pool-basename";
    pub const MAX_VMS: &str = "vdi-pool-max-vms";
    pub const MIN_VMS: &str = "vdi-pool-min-vms";
    pub const SPARE_VMS: &str = "vdi-pool-spare-vms";
    pub const AUTO_GROW: &str = "vdi-pool-auto-grow";
    pub const AUTO_SHRINK: &str = "vdi-pool-auto-shrink";
    pub const PROTOCOL: &str = "vdi-pool-protocol";

    pub const ALL: [&str; 10] = [
        TYPE,
        TEMPLATE,
        SNAPSHOT,
        BASENAME,
        MAX_VMS,
        MIN_VMS,
        SPARE_VMS,
        AUTO_GROW,
        AUTO_SHRINK,
        PROTOCOL,
    ];

    pub fn is_pool_attribute(name: &str) -> bool {
        ALL.contains(&name)
    }
}

/// How a pool obtains its machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolType {
    /// Machines are cloned from a template on demand.
    #[default]
    Dynamic,
    /// Machines are created outside the pool and discovered through their
    /// pool tag. The pool never creates or shrinks.
    Static,
}

impl PoolType {
    pub const ALL: [PoolType; 2] = [PoolType::Dynamic, PoolType::Static];

    pub fn as_str(&self) -> &'static str {
        match self {
            PoolType::Dynamic => "dynamic",
            PoolType::Static => "static",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
    }
}

impl fmt::Display for PoolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_true() -> bool {
    true
}

/// Configuration of a single desktop pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub id: PoolId,
    #[serde(rename = "type", default)]
    pub pool_type: PoolType,
    #[serde(default)]
    pub template: String,
    pub snapshot: Option<String>,
    /// Prefix for machine names. Defaults to the pool id.
    #[serde(default)]
    pub basename: String,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub min: usize,
    pub max: usize,
    /// Number of idle machines to keep ready ahead of demand.
    #[serde(default)]
    pub spare: usize,
    #[serde(default = "default_true")]
    pub auto_grow: bool,
    #[serde(default = "default_true")]
    pub auto_shrink: bool,
    #[serde(default)]
    pub addressing: Addressing,
    pub domain_join: Option<DomainJoin>,
}

impl PoolConfig {
    pub fn new(id: impl Into<String>, template: impl Into<String>, max: usize) -> Self {
        Self {
            id: PoolId::new(id),
            pool_type: PoolType::Dynamic,
            template: template.into(),
            snapshot: None,
            basename: String::new(),
            network: String::new(),
            protocol: Protocol::Rdp,
            min: 0,
            max,
            spare: 0,
            auto_grow: true,
            auto_shrink: true,
            addressing: Addressing::Dhcp,
            domain_join: None,
        }
    }

    pub fn with_type(mut self, pool_type: PoolType) -> Self {
        self.pool_type = pool_type;
        self
    }

    pub fn with_snapshot(mut self, snapshot: impl Into<String>) -> Self {
        self.snapshot = Some(snapshot.into());
        self
    }

    pub fn with_basename(mut self, basename: impl Into<String>) -> Self {
        self.basename = basename.into();
        self
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_bounds(mut self, min: usize, max: usize, spare: usize) -> Self {
        self.min = min;
        self.max = max;
        self.spare = spare;
        self
    }

    pub fn with_auto_grow(mut self, enabled: bool) -> Self {
        self.auto_grow = enabled;
        self
    }

    pub fn with_auto_shrink(mut self, enabled: bool) -> Self {
        self.auto_shrink = enabled;
        self
    }

    pub fn with_addressing(mut self, addressing: Addressing) -> Self {
        self.addressing = addressing;
        self
    }

    pub fn with_domain_join(mut self, join: DomainJoin) -> Self {
        self.domain_join = Some(join);
        self
    }

    /// Prefix used when naming new machines.
    pub fn basename(&self) -> &str {
        if self.basename.is_empty() {
            self.id.as_str()
        } else {
            &self.basename
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.as_str().trim().is_empty() {
            return Err(Error::MissingConfig("pool id".into()));
        }
        if self.id.as_str().chars().any(char::is_whitespace) {
            return Err(Error::InvalidConfig(format!(
                "pool id '{}' must not contain whitespace",
                self.id
            )));
        }
        if self.max == 0 {
            return Err(Error::InvalidConfig(format!(
                "pool '{}': max must be at least 1",
                self.id
            )));
        }
        if self.min > self.max {
            return Err(Error::InvalidConfig(format!(
                "pool '{}': min ({}) exceeds max ({})",
                self.id, self.min, self.max
            )));
        }
        if self.spare > self.max {
            return Err(Error::InvalidConfig(format!(
                "pool '{}': spare ({}) exceeds max ({})",
                self.id, self.spare, self.max
            )));
        }
        if self.pool_type == PoolType::Dynamic && self.template.trim().is_empty() {
            return Err(Error::MissingConfig(format!(
                "pool '{}': template is required for dynamic pools",
                self.id
            )));
        }
        if self.addressing.is_static() && self.max > 1 {
            return Err(Error::InvalidConfig(format!(
                "pool '{}': static addressing requires max = 1",
                self.id
            )));
        }
        Ok(())
    }

    /// Renders the pool settings as connection-group attributes.
    pub fn to_attributes(&self) -> BTreeMap<String, String> {
        let mut attrs = BTreeMap::new();
        attrs.insert(attributes::TYPE.to_string(), self.pool_type.to_string());
        attrs.insert(attributes::TEMPLATE.to_string(), self.template.clone());
        if let Some(snapshot) = &self.snapshot {
            attrs.insert(attributes::SNAPSHOT.to_string(), snapshot.clone());
        }
        attrs.insert(attributes::BASENAME.to_string(), self.basename().to_string());
        attrs.insert(attributes::MAX_VMS.to_string(), self.max.to_string());
        attrs.insert(attributes::MIN_VMS.to_string(), self.min.to_string());
        attrs.insert(attributes::SPARE_VMS.to_string(), self.spare.to_string());
        attrs.insert(attributes::AUTO_GROW.to_string(), self.auto_grow.to_string());
        attrs.insert(
            attributes::AUTO_SHRINK.to_string(),
            self.auto_shrink.to_string(),
        );
        attrs.insert(attributes::PROTOCOL.to_string(), self.protocol.to_string());
        attrs
    }

    /// Overwrites settings from connection-group attributes. Attributes that
    /// are absent or empty leave the current value untouched.
    pub fn apply_attributes(&mut self, attrs: &BTreeMap<String, String>) -> Result<()> {
        let get = |name: &str| {
            attrs
                .get(name)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get(attributes::TYPE) {
            self.pool_type = PoolType::parse(v).ok_or_else(|| {
                Error::InvalidConfig(format!("unknown pool type '{v}'"))
            })?;
        }
        if let Some(v) = get(attributes::TEMPLATE) {
            self.template = v.to_string();
        }
        if let Some(v) = get(attributes::SNAPSHOT) {
            self.snapshot = Some(v.to_string());
        }
        if let Some(v) = get(attributes::BASENAME) {
            self.basename = v.to_string();
        }
        if let Some(v) = get(attributes::MAX_VMS) {
            self.max = parse_count(attributes::MAX_VMS, v)?;
        }
        if let Some(v) = get(attributes::MIN_VMS) {
            self.min = parse_count(attributes::MIN_VMS, v)?;
        }
        if let Some(v) = get(attributes::SPARE_VMS) {
            self.spare = parse_count(attributes::SPARE_VMS, v)?;
        }
        if let Some(v) = get(attributes::AUTO_GROW) {
            self.auto_grow = parse_flag(attributes::AUTO_GROW, v)?;
        }
        if let Some(v) = get(attributes::AUTO_SHRINK) {
            self.auto_shrink = parse_flag(attributes::AUTO_SHRINK, v)?;
        }
        if let Some(v) = get(attributes::PROTOCOL) {
            self.protocol = Protocol::parse(v)
                .ok_or_else(|| Error::InvalidConfig(format!("unknown protocol '{v}'")))?;
        }
        Ok(())
    }

    /// Builds and validates a pool from connection-group attributes.
    pub fn from_attributes(
        id: impl Into<String>,
        network: impl Into<String>,
        attrs: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let mut config = PoolConfig::new(id, "", 0).with_network(network);
        config.apply_attributes(attrs)?;
        config.validate()?;
        Ok(config)
    }
}

fn parse_count(name: &str, value: &str) -> Result<usize> {
    value
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("{name}: '{value}' is not a valid number")))
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(Error::InvalidConfig(format!(
            "{name}: '{value}' is not a boolean"
        ))),
    }
}

/// What reconciliation does with tagged machines missing from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrphanPolicy {
    #[default]
    Adopt,
    Destroy,
}

/// Bounded retry with exponential backoff for transient adapter errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry (1-based), doubling each time.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

/// Runtime thresholds of a pool manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolTuning {
    /// How long a machine must stay available before it may be shrunk away.
    pub min_idle_secs: u64,
    pub acquire_timeout_secs: u64,
    /// Upper bound on a single create/start/destroy adapter call.
    pub create_timeout_secs: u64,
    pub retry: RetryPolicy,
    pub orphan_policy: OrphanPolicy,
    /// Destroy failed machines during reconciliation.
    pub reap_failed: bool,
    pub destroy_on_shutdown: bool,
    pub reconcile_interval_secs: u64,
}

impl Default for PoolTuning {
    fn default() -> Self {
        Self {
            min_idle_secs: 300,
            acquire_timeout_secs: 600,
            create_timeout_secs: 900,
            retry: RetryPolicy::default(),
            orphan_policy: OrphanPolicy::Adopt,
            reap_failed: true,
            destroy_on_shutdown: false,
            reconcile_interval_secs: 60,
        }
    }
}

impl PoolTuning {
    pub fn min_idle(&self) -> Duration {
        Duration::from_secs(self.min_idle_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn create_timeout(&self) -> Duration {
        Duration::from_secs(self.create_timeout_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }
}

/// Point-in-time counts of a pool's members.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub members: usize,
    /// Reserved plus in use.
    pub active: usize,
    /// Usable members not held by a client, including machines still
    /// provisioning.
    pub idle: usize,
    pub provisioning: usize,
    pub available: usize,
    pub reserved: usize,
    pub in_use: usize,
    pub draining: usize,
    pub failed: usize,
}

impl PoolStats {
    pub fn from_machines<'a>(machines: impl IntoIterator<Item = &'a Machine>) -> Self {
        let mut stats = PoolStats::default();
        let mut usable = 0;
        for machine in machines {
            stats.members += 1;
            if machine.state.is_usable() {
                usable += 1;
            }
            match machine.state {
                MachineState::Provisioning => stats.provisioning += 1,
                MachineState::Available => stats.available += 1,
                MachineState::Reserved => stats.reserved += 1,
                MachineState::InUse => stats.in_use += 1,
                MachineState::Draining | MachineState::Destroying => stats.draining += 1,
                MachineState::Failed => stats.failed += 1,
                MachineState::Destroyed => {}
            }
        }
        stats.active = stats.reserved + stats.in_use;
        stats.idle = usable - stats.active;
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    mod pool_config {
        use super::*;

        #[test]
        fn basename_defaults_to_id() {
            let config = PoolConfig::new("eng", "win11", 4);
            assert_eq!(config.basename(), "eng");
            assert_eq!(config.with_basename("desk").basename(), "desk");
        }

        #[test]
        fn validate_accepts_sane_bounds() {
            let config = PoolConfig::new("eng", "win11", 10).with_bounds(2, 10, 3);
            assert!(config.validate().is_ok());
        }

        #[test]
        fn validate_rejects_zero_max() {
            let config = PoolConfig::new("eng", "win11", 0);
            assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
        }

        #[test]
        fn validate_rejects_min_above_max() {
            let config = PoolConfig::new("eng", "win11", 2).with_bounds(3, 2, 0);
            assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
        }

        #[test]
        fn validate_rejects_spare_above_max() {
            let config = PoolConfig::new("eng", "win11", 2).with_bounds(0, 2, 5);
            assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
        }

        #[test]
        fn validate_requires_template_for_dynamic_pools() {
            let config = PoolConfig::new("eng", "", 2);
            assert!(matches!(config.validate(), Err(Error::MissingConfig(_))));
            let config = config.with_type(PoolType::Static);
            assert!(config.validate().is_ok());
        }

        #[test]
        fn deserializes_with_defaults() {
            let json = r#"{"id": "eng", "template": "win11", "max": 5}"#;
            let config: PoolConfig = serde_json::from_str(json).unwrap();
            assert_eq!(config.pool_type, PoolType::Dynamic);
            assert_eq!(config.protocol, Protocol::Rdp);
            assert!(config.auto_grow);
            assert!(config.auto_shrink);
            assert_eq!(config.min, 0);
            assert_eq!(config.addressing, Addressing::Dhcp);
        }

        #[test]
        fn deserializes_type_field() {
            let json = r#"{"id": "lab", "type": "static", "max": 3}"#;
            let config: PoolConfig = serde_json::from_str(json).unwrap();
            assert_eq!(config.pool_type, PoolType::Static);
        }
    }

    mod attribute_mapping {
        use super::*;

        #[test]
        fn from_attributes_parses_all_fields() {
            let config = PoolConfig::from_attributes(
                "eng",
                "lan",
                &attrs(&[
                    (attributes::TYPE, "dynamic"),
                    (attributes::TEMPLATE, "win11-gold"),
                    (attributes::SNAPSHOT, "patched"),
                    (attributes::BASENAME, "eng-desk"),
                    (attributes::MAX_VMS, "40"),
                    (attributes::MIN_VMS, "5"),
                    (attributes::SPARE_VMS, "5"),
                    (attributes::AUTO_GROW, "true"),
                    (attributes::AUTO_SHRINK, "false"),
                    (attributes::PROTOCOL, "vnc"),
                ]),
            )
            .unwrap();

            assert_eq!(config.template, "win11-gold");
            assert_eq!(config.snapshot.as_deref(), Some("patched"));
            assert_eq!(config.basename(), "eng-desk");
            assert_eq!((config.min, config.max, config.spare), (5, 40, 5));
            assert!(config.auto_grow);
            assert!(!config.auto_shrink);
            assert_eq!(config.protocol, Protocol::Vnc);
            assert_eq!(config.network, "lan");
        }

        #[test]
        fn empty_attribute_keeps_current_value() {
            let mut config = PoolConfig::new("eng", "win11", 4);
            config
                .apply_attributes(&attrs(&[(attributes::TEMPLATE, "  ")]))
                .unwrap();
            assert_eq!(config.template, "win11");
        }

        #[test]
        fn rejects_non_numeric_count() {
            let err = PoolConfig::from_attributes(
                "eng",
                "lan",
                &attrs(&[
                    (attributes::TEMPLATE, "win11"),
                    (attributes::MAX_VMS, "lots"),
                ]),
            )
            .unwrap_err();
            assert!(err.to_string().contains("vdi-pool-max-vms"));
        }

        #[test]
        fn rejects_unknown_protocol() {
            let mut config = PoolConfig::new("eng", "win11", 4);
            let result = config.apply_attributes(&attrs(&[(attributes::PROTOCOL, "spice")]));
            assert!(matches!(result, Err(Error::InvalidConfig(_))));
        }

        #[test]
        fn to_attributes_roundtrips_through_apply() {
            let original = PoolConfig::new("eng", "win11", 8)
                .with_bounds(1, 8, 2)
                .with_auto_shrink(false)
                .with_protocol(Protocol::Ssh);
            let mut parsed = PoolConfig::new("eng", "", 0);
            parsed.apply_attributes(&original.to_attributes()).unwrap();
            assert_eq!(parsed.max, 8);
            assert_eq!(parsed.spare, 2);
            assert!(!parsed.auto_shrink);
            assert_eq!(parsed.protocol, Protocol::Ssh);
        }

        #[test]
        fn pool_attribute_names() {
            assert!(attributes::is_pool_attribute("vdi-pool-max-vms"));
            assert!(!attributes::is_pool_attribute("max-connections"));
        }
    }

    mod tuning {
        use super::*;

        #[test]
        fn retry_delay_doubles() {
            let retry = RetryPolicy {
                max_attempts: 4,
                base_delay_ms: 100,
            };
            assert_eq!(retry.delay_for(1), Duration::from_millis(100));
            assert_eq!(retry.delay_for(2), Duration::from_millis(200));
            assert_eq!(retry.delay_for(3), Duration::from_millis(400));
        }

        #[test]
        fn partial_tuning_uses_defaults() {
            let tuning: PoolTuning = serde_json::from_str(r#"{"min_idle_secs": 30}"#).unwrap();
            assert_eq!(tuning.min_idle(), Duration::from_secs(30));
            assert_eq!(tuning.retry, RetryPolicy::default());
            assert_eq!(tuning.orphan_policy, OrphanPolicy::Adopt);
            assert!(tuning.reap_failed);
        }
    }

    mod stats {
        use super::*;

        #[test]
        fn counts_states() {
            let pool = PoolId::new("p");
            let mut machines = Vec::new();
            for state in [
                MachineState::Available,
                MachineState::Available,
                MachineState::Reserved,
                MachineState::InUse,
                MachineState::Provisioning,
                MachineState::Failed,
                MachineState::Draining,
            ] {
                let mut m = Machine::placeholder(pool.clone(), "m", "t", None, "n");
                m.state = state;
                machines.push(m);
            }

            let stats = PoolStats::from_machines(&machines);
            assert_eq!(stats.members, 7);
            assert_eq!(stats.active, 2);
            assert_eq!(stats.idle, 3);
            assert_eq!(stats.provisioning, 1);
            assert_eq!(stats.failed, 1);
            assert_eq!(stats.draining, 1);
        }
    }
}
