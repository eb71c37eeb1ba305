//! Registration store for connections managed by remote agents.
//!
//! Agents (for example a machine announcing itself at boot) register a
//! connection with a shared secret. Every call is authenticated against that
//! secret.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::info;
use uuid::Uuid;
use vdipool_core::{Error, Protocol, Result};

/// Attribute recording the registration id on a registered connection.
pub const REGISTERED_UUID: &str = "registered-uuid";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredConnection {
    pub id: Uuid,
    pub name: String,
    pub protocol: Protocol,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

pub struct Registrar {
    secret: String,
    connections: RwLock<BTreeMap<Uuid, RegisteredConnection>>,
}

impl Registrar {
    /// Creates a registrar accepting `secret`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingConfig`] if the secret is empty.
    pub fn new(secret: impl Into<String>) -> Result<Self> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(Error::MissingConfig("registrar secret".into()));
        }
        Ok(Self {
            secret,
            connections: RwLock::new(BTreeMap::new()),
        })
    }

    fn authorize(&self, token: &str) -> Result<()> {
        if tokens_match(token.as_bytes(), self.secret.as_bytes()) {
            Ok(())
        } else {
            Err(Error::Unauthorized)
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<Uuid, RegisteredConnection>> {
        self.connections
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<Uuid, RegisteredConnection>> {
        self.connections
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(
        &self,
        token: &str,
        name: impl Into<String>,
        protocol: Protocol,
        parameters: BTreeMap<String, String>,
    ) -> Result<Uuid> {
        self.authorize(token)?;
        let id = Uuid::new_v4();
        let name = name.into();
        let mut attributes = BTreeMap::new();
        attributes.insert(REGISTERED_UUID.to_string(), id.to_string());
        info!(registration = %id, name = %name, protocol = %protocol, "connection registered");
        self.write().insert(
            id,
            RegisteredConnection {
                id,
                name,
                protocol,
                parameters,
                attributes,
            },
        );
        Ok(id)
    }

    /// Replaces the parameters of a registration.
    pub fn update(
        &self,
        token: &str,
        id: Uuid,
        parameters: BTreeMap<String, String>,
    ) -> Result<RegisteredConnection> {
        self.authorize(token)?;
        let mut connections = self.write();
        let connection = connections
            .get_mut(&id)
            .ok_or(Error::RegistrationNotFound(id))?;
        connection.parameters = parameters;
        info!(registration = %id, "connection updated");
        Ok(connection.clone())
    }

    pub fn delete(&self, token: &str, id: Uuid) -> Result<RegisteredConnection> {
        self.authorize(token)?;
        let removed = self
            .write()
            .remove(&id)
            .ok_or(Error::RegistrationNotFound(id))?;
        info!(registration = %id, "connection deleted");
        Ok(removed)
    }

    pub fn get(&self, token: &str, id: Uuid) -> Result<RegisteredConnection> {
        self.authorize(token)?;
        self.read()
            .get(&id)
            .cloned()
            .ok_or(Error::RegistrationNotFound(id))
    }

    pub fn list(&self, token: &str) -> Result<Vec<RegisteredConnection>> {
        self.authorize(token)?;
        Ok(self.read().values().cloned().collect())
    }
}

impl std::fmt::Debug for Registrar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registrar")
            .field("secret", &"<redacted>")
            .field("connections", &self.read().len())
            .finish()
    }
}

/// Compares two tokens in time independent of where they differ.
fn tokens_match(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
