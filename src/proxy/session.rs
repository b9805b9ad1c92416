//! Per-connection session state.
//!
//! A session owns the root forwarding connection opened when the broker
//! handed us the client, plus the identities of every sub-object minted on
//! its behalf. The root connection outlives every child derived from it;
//! teardown closes the children first.

use std::fmt;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::provider::{ForwardingConnection, ProviderClient};
use crate::proxy::protocol::ObjectId;
use crate::proxy::registry::ObjectRegistry;

/// Diagnostic id for one accepted session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity of the connecting client process, supplied at accept time.
/// Immutable for the session's lifetime; diagnostics only, never routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIdentity {
    pub process_id: u32,
    pub program_id: u64,
}

/// State for one accepted client connection.
pub struct Session {
    id: SessionId,
    identity: ClientIdentity,
    port: String,
    root: ProviderClient,
    /// Sub-objects minted for this client, in creation order.
    children: Vec<ObjectId>,
}

impl Session {
    pub fn new(identity: ClientIdentity, port: String, root_conn: ForwardingConnection) -> Self {
        Self {
            id: SessionId::new(),
            identity,
            port,
            root: ProviderClient::root(root_conn),
            children: Vec::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn identity(&self) -> ClientIdentity {
        self.identity
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn root_mut(&mut self) -> &mut ProviderClient {
        &mut self.root
    }

    pub fn children(&self) -> &[ObjectId] {
        &self.children
    }

    /// Record a sub-object minted on behalf of this session.
    pub fn adopt_child(&mut self, identity: ObjectId) {
        self.children.push(identity);
    }

    /// Forget a sub-object the client closed explicitly.
    pub fn release_child(&mut self, identity: ObjectId) {
        self.children.retain(|c| *c != identity);
    }

    /// Cascade teardown: close every owned child object (newest first), then
    /// the root forwarding connection.
    pub async fn teardown(mut self, registry: &ObjectRegistry) {
        while let Some(child) = self.children.pop() {
            let Some(entry) = registry.remove(child) else {
                continue;
            };
            let mut client = entry.connection.lock().await;
            if let Err(e) = client.close_connection().await {
                warn!(session = %self.id, object = %child, error = %e,
                    "failed to close child forwarding connection");
            }
        }
        if let Err(e) = self.root.close_connection().await {
            warn!(session = %self.id, error = %e, "failed to close root forwarding connection");
        }
        debug!(session = %self.id, port = %self.port, "session torn down");
    }
}
