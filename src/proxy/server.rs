//! Port listener / server manager.
//!
//! Binds one Unix-socket listener per intercepted port, accepts sessions up
//! to the per-port limit, and serves each connection on its own task: one
//! frame is read, dispatched to completion, and answered before the next is
//! read, which serializes requests per session while sessions on other
//! connections proceed in parallel across the runtime workers.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::provider::ProviderConnector;
use crate::proxy::connections::PortSessionPool;
use crate::proxy::dispatcher::Dispatcher;
use crate::proxy::protocol::{
    self, CallFrame, ReplyFrame, ResultCode, SessionHello,
};
use crate::proxy::registry::ObjectRegistry;
use crate::proxy::session::{ClientIdentity, Session};
use crate::shutdown::ShutdownCoordinator;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("no ports configured")]
    NoPorts,
}

/// One intercepted service port.
#[derive(Debug, Clone)]
pub struct PortConfig {
    pub name: String,
    pub max_sessions: usize,
}

/// Listener-level settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory the per-port listener sockets live in.
    pub socket_dir: PathBuf,
    pub frame_limit: usize,
}

struct PortContext {
    port: String,
    pool: Arc<PortSessionPool>,
    connector: Arc<dyn ProviderConnector>,
    registry: Arc<ObjectRegistry>,
    shutdown: Arc<ShutdownCoordinator>,
    frame_limit: usize,
}

/// Owns the listening ports and the accept loops.
pub struct ServerManager {
    ports: Vec<PortConfig>,
    connector: Arc<dyn ProviderConnector>,
    registry: Arc<ObjectRegistry>,
    shutdown: Arc<ShutdownCoordinator>,
    config: ServerConfig,
}

impl ServerManager {
    pub fn new(
        ports: Vec<PortConfig>,
        connector: Arc<dyn ProviderConnector>,
        registry: Arc<ObjectRegistry>,
        shutdown: Arc<ShutdownCoordinator>,
        config: ServerConfig,
    ) -> Self {
        Self { ports, connector, registry, shutdown, config }
    }

    /// Register every port and serve until `stop` flips. A port that fails
    /// to bind is fatal: the proxy cannot function without its ports.
    pub async fn run(self, stop: watch::Receiver<bool>) -> Result<(), ServerError> {
        if self.ports.is_empty() {
            return Err(ServerError::NoPorts);
        }

        let mut accept_loops = JoinSet::new();
        for port in &self.ports {
            let path = self.config.socket_dir.join(&port.name);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            let listener = UnixListener::bind(&path)?;
            info!(port = %port.name, path = %path.display(), max_sessions = port.max_sessions,
                "port registered");

            let ctx = Arc::new(PortContext {
                port: port.name.clone(),
                pool: Arc::new(PortSessionPool::new(port.max_sessions)),
                connector: Arc::clone(&self.connector),
                registry: Arc::clone(&self.registry),
                shutdown: Arc::clone(&self.shutdown),
                frame_limit: self.config.frame_limit,
            });
            accept_loops.spawn(accept_loop(listener, ctx, stop.clone()));
        }

        while let Some(joined) = accept_loops.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "accept loop aborted");
            }
        }
        Ok(())
    }
}

async fn accept_loop(listener: UnixListener, ctx: Arc<PortContext>, mut stop: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let ctx = Arc::clone(&ctx);
                        tokio::spawn(handle_connection(stream, ctx));
                    }
                    // Fatal to this one accept only; keep serving the port.
                    Err(e) => warn!(port = %ctx.port, error = %e, "accept failed"),
                }
            }
        }
    }
    info!(port = %ctx.port, "listener stopped");
}

async fn handle_connection(mut stream: UnixStream, ctx: Arc<PortContext>) {
    let hello = match read_hello(&mut stream, ctx.frame_limit).await {
        Some(hello) => hello,
        None => return,
    };

    let process_id = stream
        .peer_cred()
        .ok()
        .and_then(|cred| cred.pid())
        .unwrap_or(0) as u32;
    let identity = ClientIdentity { process_id, program_id: hello.program_id };

    // Session-count enforcement and provider reachability both resolve at
    // accept time; either failure rejects this one connection.
    let Some(slot) = ctx.pool.try_acquire() else {
        warn!(port = %ctx.port, max = ctx.pool.max_sessions(), "port at session limit, rejecting");
        reject(&mut stream, ctx.frame_limit).await;
        return;
    };
    let _slot = slot;

    let root_conn = match ctx.connector.connect_root(&ctx.port).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(port = %ctx.port, error = %e, "provider connection failed, rejecting session");
            reject(&mut stream, ctx.frame_limit).await;
            return;
        }
    };

    let mut session = Session::new(identity, ctx.port.clone(), root_conn);
    let program_id = format!("0x{:016x}", identity.program_id);
    info!(
        session = %session.id(),
        port = %ctx.port,
        process_id = identity.process_id,
        program_id = %program_id,
        active = ctx.pool.active_count(),
        "session accepted"
    );

    if write_reply(&mut stream, &ReplyFrame::success(protocol::Reply::Ack), ctx.frame_limit)
        .await
        .is_err()
    {
        session.teardown(&ctx.registry).await;
        return;
    }

    let dispatcher = Dispatcher::new(Arc::clone(&ctx.registry));
    loop {
        let bytes = match protocol::read_frame(&mut stream, ctx.frame_limit).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => break, // client disconnected
            Err(e) => {
                warn!(session = %session.id(), error = %e, "failed to read request frame");
                break;
            }
        };

        let reply = match protocol::decode::<CallFrame>(&bytes, ctx.frame_limit) {
            Ok(frame) => match ctx.shutdown.track() {
                Some(_guard) => dispatcher.dispatch(&mut session, frame).await,
                None => {
                    debug!(session = %session.id(), "draining, refusing request");
                    ReplyFrame::failure(ResultCode::REJECTED)
                }
            },
            Err(e) => {
                warn!(session = %session.id(), error = %e, "malformed request frame");
                ReplyFrame::failure(ResultCode::MALFORMED)
            }
        };

        if let Err(e) = write_reply(&mut stream, &reply, ctx.frame_limit).await {
            warn!(session = %session.id(), error = %e, "failed to write reply");
            break;
        }
    }

    let session_id = session.id();
    session.teardown(&ctx.registry).await;
    info!(session = %session_id, port = %ctx.port, "session closed");
}

async fn read_hello(stream: &mut UnixStream, frame_limit: usize) -> Option<SessionHello> {
    let bytes = match protocol::read_frame(stream, frame_limit).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return None,
        Err(e) => {
            warn!(error = %e, "failed to read session hello");
            return None;
        }
    };
    match protocol::decode::<SessionHello>(&bytes, frame_limit) {
        Ok(hello) => Some(hello),
        Err(e) => {
            warn!(error = %e, "malformed session hello");
            let reply = ReplyFrame::failure(ResultCode::MALFORMED);
            let _ = write_reply(stream, &reply, frame_limit).await;
            None
        }
    }
}

async fn reject(stream: &mut UnixStream, frame_limit: usize) {
    let reply = ReplyFrame::failure(ResultCode::REJECTED);
    let _ = write_reply(stream, &reply, frame_limit).await;
}

async fn write_reply(
    stream: &mut UnixStream,
    reply: &ReplyFrame,
    frame_limit: usize,
) -> Result<(), protocol::ProtocolError> {
    let bytes = protocol::encode(reply, frame_limit)?;
    protocol::write_frame(stream, &bytes).await?;
    Ok(())
}
