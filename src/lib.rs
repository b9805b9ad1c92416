//! svcgate is an interception proxy for object-capability IPC services. It
//! binds the ports of a real service provider, accepts client sessions in
//! the provider's stead, and forwards every call over its own connections to
//! the provider so that replies, result codes, and payload bytes reach the
//! client unchanged.
//!
//! The interesting part is identity: when a forwarded call mints a sub-object
//! on the provider side, svcgate records the provider-assigned object id in
//! its registry and serves later calls targeting that id through the minted
//! connection, so the client's view of the object graph is exactly the
//! provider's.

pub mod config;
pub mod handle;
pub mod provider;
pub mod proxy;
pub mod shutdown;
pub mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use provider::ProviderConnector;
use proxy::protocol::DEFAULT_FRAME_LIMIT;
use proxy::registry::ObjectRegistry;
use proxy::server::{PortConfig, ServerConfig, ServerError, ServerManager};
use shutdown::ShutdownCoordinator;

/// Top-level proxy settings.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub ports: Vec<PortConfig>,
    pub socket_dir: PathBuf,
    pub frame_limit: usize,
    pub shutdown_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            ports: Vec::new(),
            socket_dir: PathBuf::from("/var/run/svcgate"),
            frame_limit: DEFAULT_FRAME_LIMIT,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// The assembled proxy: registry, shutdown coordinator, and the connector
/// used to reach the real provider.
pub struct Proxy {
    registry: Arc<ObjectRegistry>,
    shutdown: Arc<ShutdownCoordinator>,
    connector: Arc<dyn ProviderConnector>,
    config: ProxyConfig,
}

impl Proxy {
    pub fn new(connector: Arc<dyn ProviderConnector>, config: ProxyConfig) -> Self {
        Self {
            registry: Arc::new(ObjectRegistry::new()),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            connector,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ObjectRegistry> {
        &self.registry
    }

    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Serve all configured ports until `stop` flips to true.
    pub async fn serve(&self, stop: watch::Receiver<bool>) -> Result<(), ServerError> {
        let server = ServerManager::new(
            self.config.ports.clone(),
            Arc::clone(&self.connector),
            Arc::clone(&self.registry),
            Arc::clone(&self.shutdown),
            ServerConfig {
                socket_dir: self.config.socket_dir.clone(),
                frame_limit: self.config.frame_limit,
            },
        );
        server.run(stop).await
    }
}
