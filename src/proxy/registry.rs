//! Object registry: locally-served sub-objects keyed by the identity the
//! real provider assigned.
//!
//! The mapping is the only proxy-owned shared mutable state. A single coarse
//! lock guards it; mutation only happens on object creation and destruction,
//! so contention stays negligible. Entries are published fully built and
//! never mutated afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::provider::ProviderClient;
use crate::proxy::protocol::{EndpointDescriptor, ObjectId};
use crate::proxy::session::SessionId;

/// Which facade serves calls on this object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Interface,
    Endpoint,
}

/// Everything needed to serve calls on one minted sub-object.
pub struct RegistryEntry {
    pub identity: ObjectId,
    pub kind: ObjectKind,
    pub owner: SessionId,
    /// Exclusively-owned forwarding connection. Calls on a given object are
    /// serialized by its session, so this lock is never contended.
    pub connection: tokio::sync::Mutex<ProviderClient>,
    /// Descriptor captured when the object was minted, attached once.
    pub descriptor: Option<EndpointDescriptor>,
}

impl std::fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("identity", &self.identity)
            .field("kind", &self.kind)
            .field("owner", &self.owner)
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl RegistryEntry {
    pub fn new(
        identity: ObjectId,
        kind: ObjectKind,
        owner: SessionId,
        client: ProviderClient,
        descriptor: Option<EndpointDescriptor>,
    ) -> Self {
        Self {
            identity,
            kind,
            owner,
            connection: tokio::sync::Mutex::new(client),
            descriptor,
        }
    }
}

/// Identity-keyed map of live sub-objects.
#[derive(Default)]
pub struct ObjectRegistry {
    entries: Mutex<HashMap<ObjectId, Arc<RegistryEntry>>>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a fully built entry under its identity. A duplicate identity
    /// means the identity-correlation invariant broke; the entry is handed
    /// back unpublished so the caller can close its connection.
    pub fn register(&self, entry: RegistryEntry) -> Result<(), RegistryEntry> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&entry.identity) {
            return Err(entry);
        }
        entries.insert(entry.identity, Arc::new(entry));
        Ok(())
    }

    pub fn lookup(&self, identity: ObjectId) -> Option<Arc<RegistryEntry>> {
        self.entries.lock().get(&identity).cloned()
    }

    /// Remove an entry, returning it so the caller can close its connection.
    /// Idempotent: removing an absent identity is a no-op.
    pub fn remove(&self, identity: ObjectId) -> Option<Arc<RegistryEntry>> {
        self.entries.lock().remove(&identity)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
