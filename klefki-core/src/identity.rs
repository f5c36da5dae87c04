//! Machine identities and the registry the broker resolves them from.

use std::collections::HashMap;
use std::sync::RwLock;

use klefki_auth::{Fingerprint, PublicKey};
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

/// Unique identifier for a machine: the fingerprint of its public key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineId(pub String);

impl MachineId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<Fingerprint> for MachineId {
    fn from(fingerprint: Fingerprint) -> Self {
        Self(fingerprint.into_string())
    }
}

impl std::fmt::Display for MachineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A registered machine as seen by the broker. Never mutated here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineIdentity {
    pub id: MachineId,
    /// Raw verification key bytes.
    pub public_key: Vec<u8>,
}

impl MachineIdentity {
    pub fn new(id: MachineId, public_key: Vec<u8>) -> Self {
        Self { id, public_key }
    }

    /// Build an identity whose id is the key's fingerprint.
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        Self {
            id: Fingerprint::from_public_key(public_key).into(),
            public_key: public_key.to_bytes().to_vec(),
        }
    }
}

/// Synchronous lookup of registered machines.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; lookups run on request tasks.
/// They must not block on IO, which in practice means serving from an
/// in-memory snapshot.
pub trait MachineRegistry: Send + Sync {
    /// Look up a machine by id. `Ok(None)` means "not registered".
    fn lookup(&self, id: &MachineId) -> Result<Option<MachineIdentity>, RegistryError>;
}

impl<R: MachineRegistry + ?Sized> MachineRegistry for std::sync::Arc<R> {
    fn lookup(&self, id: &MachineId) -> Result<Option<MachineIdentity>, RegistryError> {
        (**self).lookup(id)
    }
}

/// A registry held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    machines: RwLock<HashMap<MachineId, MachineIdentity>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, identity: MachineIdentity) {
        let mut machines = self
            .machines
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        machines.insert(identity.id.clone(), identity);
    }

    pub fn remove(&self, id: &MachineId) -> bool {
        let mut machines = self
            .machines
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        machines.remove(id).is_some()
    }
}

impl MachineRegistry for InMemoryRegistry {
    fn lookup(&self, id: &MachineId) -> Result<Option<MachineIdentity>, RegistryError> {
        let machines = self
            .machines
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(machines.get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use klefki_auth::PrivateKey;

    #[test]
    fn machine_id_serializes_transparently() {
        let id = MachineId::new("SHA256:abc");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, r#""SHA256:abc""#);
        let parsed: MachineId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn identity_id_is_fingerprint() {
        let key = PrivateKey::generate();
        let identity = MachineIdentity::from_public_key(&key.public_key());

        assert_eq!(
            identity.id.as_str(),
            Fingerprint::from_public_key(&key.public_key()).as_str()
        );
        assert_eq!(identity.public_key, key.public_key().to_bytes().to_vec());
    }

    #[test]
    fn in_memory_registry_lookup() {
        let registry = InMemoryRegistry::new();
        let identity = MachineIdentity::new(MachineId::new("m1"), vec![1; 32]);
        registry.insert(identity.clone());

        assert_eq!(registry.lookup(&MachineId::new("m1")).unwrap(), Some(identity));
        assert_eq!(registry.lookup(&MachineId::new("m2")).unwrap(), None);

        assert!(registry.remove(&MachineId::new("m1")));
        assert_eq!(registry.lookup(&MachineId::new("m1")).unwrap(), None);
    }
}
