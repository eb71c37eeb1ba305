//! A pool presented as a single logical connection target.

use crate::pool::{MachineLease, PoolManager};
use crate::policy::CapacityDecision;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use vdipool_core::{
    ClientInfo, MachineHandle, MachineId, PoolConfig, PoolType, Protocol, Result,
    attributes,
};

/// Where a client should be connected to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub machine: MachineId,
    pub hostname: String,
    pub port: u16,
    pub protocol: Protocol,
    /// Extra connection parameters configured on the group.
    pub parameters: BTreeMap<String, String>,
}

/// Opens the remote-desktop stream to a machine.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &ConnectTarget, client: &ClientInfo)
    -> Result<Box<dyn Tunnel>>;
}

/// An open remote-desktop stream.
#[async_trait]
pub trait Tunnel: Send + Sync {
    fn id(&self) -> &str;

    async fn close(&mut self) -> Result<()>;
}

/// Kind of value a pool attribute holds, for rendering forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Enum(Vec<&'static str>),
    Text,
    Numeric,
    Boolean,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeField {
    pub name: &'static str,
    pub kind: FieldKind,
}

/// Exposes a [`PoolManager`] as one connection group.
///
/// Connecting reserves a machine from the pool and hands it to the
/// [`Connector`]; the machine returns to the pool when the session ends.
pub struct PoolGroupFacade {
    name: String,
    manager: PoolManager,
    connector: Arc<dyn Connector>,
    parameters: BTreeMap<String, String>,
    attributes: BTreeMap<String, String>,
}

impl PoolGroupFacade {
    pub fn new(name: impl Into<String>, manager: PoolManager, connector: Arc<dyn Connector>) -> Self {
        Self {
            name: name.into(),
            manager,
            connector,
            parameters: BTreeMap::new(),
            attributes: BTreeMap::new(),
        }
    }

    /// Adds a connection parameter passed to every session.
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Adds a group attribute unrelated to pooling.
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn manager(&self) -> &PoolManager {
        &self.manager
    }

    /// Number of machines currently reserved or in use.
    pub fn active_connections(&self) -> usize {
        self.manager.stats().active
    }

    /// Reserves a machine for `client` and connects to it.
    ///
    /// If the connector fails the machine is released immediately.
    pub async fn connect(&self, client: &ClientInfo) -> Result<PoolSession> {
        let lease = self.manager.acquire(client).await?;
        let target = self.target_for(&lease);

        let mut tunnel = match self.connector.connect(&target, client).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                warn!(
                    group = %self.name,
                    machine = %lease.id,
                    client = %client.label(),
                    error = %e,
                    "connection failed, releasing machine"
                );
                if let Err(release_err) = lease.release().await {
                    warn!(group = %self.name, error = %release_err, "release after failed connect");
                }
                return Err(e);
            }
        };

        if let Err(e) = lease.mark_in_use() {
            warn!(group = %self.name, machine = %lease.id, error = %e, "machine lost before session start");
            if let Err(close_err) = tunnel.close().await {
                warn!(group = %self.name, tunnel = tunnel.id(), error = %close_err, "tunnel close failed");
            }
            return Err(e);
        }
        info!(
            group = %self.name,
            machine = %lease.id,
            tunnel = tunnel.id(),
            client = %client.label(),
            "session started"
        );
        Ok(PoolSession { lease, tunnel })
    }

    fn target_for(&self, machine: &MachineHandle) -> ConnectTarget {
        ConnectTarget {
            machine: machine.id.clone(),
            hostname: machine.hostname().to_string(),
            port: machine.protocol.default_port(),
            protocol: machine.protocol,
            parameters: self.parameters.clone(),
        }
    }

    /// Group attributes as seen by a user.
    ///
    /// Users allowed to update the group see every pool attribute, unset
    /// ones as `None`; everyone else sees only the non-pool attributes.
    pub fn attributes(&self, can_update: bool) -> BTreeMap<String, Option<String>> {
        let mut attrs: BTreeMap<String, Option<String>> = self
            .attributes
            .iter()
            .filter(|(name, _)| !attributes::is_pool_attribute(name))
            .map(|(name, value)| (name.clone(), Some(value.clone())))
            .collect();
        if can_update {
            let pool = self.manager.config().to_attributes();
            for name in attributes::ALL {
                attrs.insert(name.to_string(), pool.get(name).cloned());
            }
        }
        attrs
    }

    /// Drops pool attributes from an update made by a user without
    /// permission to change them.
    pub fn filter_update(
        attrs: BTreeMap<String, String>,
        can_update: bool,
    ) -> BTreeMap<String, String> {
        if can_update {
            return attrs;
        }
        attrs
            .into_iter()
            .filter(|(name, _)| !attributes::is_pool_attribute(name))
            .collect()
    }

    /// The pool configuration that results from applying `attrs`.
    ///
    /// The running pool is unchanged; callers rebuild the manager with the
    /// returned configuration.
    pub fn updated_config(&self, attrs: &BTreeMap<String, String>) -> Result<PoolConfig> {
        let mut config = self.manager.config().clone();
        config.apply_attributes(attrs)?;
        config.validate()?;
        Ok(config)
    }

    /// Typed descriptions of the pool attributes.
    pub fn fields() -> Vec<AttributeField> {
        vec![
            AttributeField {
                name: attributes::TYPE,
                kind: FieldKind::Enum(PoolType::ALL.iter().map(|t| t.as_str()).collect()),
            },
            AttributeField {
                name: attributes::TEMPLATE,
                kind: FieldKind::Text,
            },
            AttributeField {
                name: attributes::SNAPSHOT,
                kind: FieldKind::Text,
            },
            AttributeField {
                name: attributes::BASENAME,
                kind: FieldKind::Text,
            },
            AttributeField {
                name: attributes::MAX_VMS,
                kind: FieldKind::Numeric,
            },
            AttributeField {
                name: attributes::MIN_VMS,
                kind: FieldKind::Numeric,
            },
            AttributeField {
                name: attributes::SPARE_VMS,
                kind: FieldKind::Numeric,
            },
            AttributeField {
                name: attributes::AUTO_GROW,
                kind: FieldKind::Boolean,
            },
            AttributeField {
                name: attributes::AUTO_SHRINK,
                kind: FieldKind::Boolean,
            },
            AttributeField {
                name: attributes::PROTOCOL,
                kind: FieldKind::Enum(Protocol::ALL.iter().map(|p| p.as_str()).collect()),
            },
        ]
    }
}

impl std::fmt::Debug for PoolGroupFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGroupFacade")
            .field("name", &self.name)
            .field("pool", self.manager.id())
            .finish()
    }
}

/// A connected client session on a pooled machine.
///
/// Dropping the session releases the machine through its lease; call
/// [`close`](Self::close) to close the tunnel and release explicitly.
pub struct PoolSession {
    lease: MachineLease,
    tunnel: Box<dyn Tunnel>,
}

impl PoolSession {
    pub fn machine(&self) -> &MachineHandle {
        &self.lease
    }

    pub fn tunnel_id(&self) -> &str {
        self.tunnel.id()
    }

    pub async fn close(self) -> Result<CapacityDecision> {
        let PoolSession { lease, mut tunnel } = self;
        if let Err(e) = tunnel.close().await {
            warn!(machine = %lease.id, tunnel = tunnel.id(), error = %e, "tunnel close failed");
        }
        lease.release().await
    }
}

impl std::fmt::Debug for PoolSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolSession")
            .field("machine", &self.lease.id)
            .field("tunnel", &self.tunnel.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_cover_all_pool_attributes() {
        let fields = PoolGroupFacade::fields();
        let names: Vec<&str> = fields.iter().map(|f| f.name).collect();
        assert_eq!(names, attributes::ALL.to_vec());
    }

    #[test]
    fn protocol_field_lists_protocols() {
        let fields = PoolGroupFacade::fields();
        let protocol = fields
            .iter()
            .find(|f| f.name == attributes::PROTOCOL)
            .unwrap();
        match &protocol.kind {
            FieldKind::Enum(values) => assert!(values.contains(&"rdp")),
            other => panic!("expected enum, got {other:?}"),
        }
    }

    #[test]
    fn filter_update_strips_pool_attributes_without_permission() {
        let attrs: BTreeMap<String, String> = [
            (attributes::MAX_VMS.to_string(), "100".to_string()),
            ("max-connections".to_string(), "5".to_string()),
        ]
        .into_iter()
        .collect();

        let filtered = PoolGroupFacade::filter_update(attrs.clone(), false);
        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key("max-connections"));

        let kept = PoolGroupFacade::filter_update(attrs, true);
        assert_eq!(kept.len(), 2);
    }
}
