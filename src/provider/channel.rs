//! Connections to the real provider.
//!
//! [`ProviderChannel`] is the seam between the forwarding engine and the
//! transport: one owned channel per remote object, a blocking round trip per
//! call, and child derivation when the provider mints a sub-object. The
//! production implementation dials the provider over a Unix socket; tests
//! substitute scripted channels.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tracing::warn;

use crate::proxy::protocol::{
    self, Attach, CallFrame, ObjectId, ProtocolError, ReplyFrame, ResultCode,
};

#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The provider answered with a non-success result code. Relayed to the
    /// client verbatim, never reinterpreted.
    #[error("provider result code {0}")]
    Provider(ResultCode),

    #[error("unexpected reply payload: expected {expected}, got {got}")]
    UnexpectedReply { expected: &'static str, got: &'static str },

    #[error("provider closed the connection")]
    Disconnected,

    #[error("forwarding connection already closed")]
    ConnectionClosed,
}

/// One exclusively-owned transport channel to the real provider.
#[async_trait]
pub trait ProviderChannel: Send + Sync {
    /// Perform one blocking round trip: send the call, wait for the reply.
    async fn round_trip(&mut self, frame: &CallFrame) -> Result<ReplyFrame, ForwardError>;

    /// Derive a new exclusively-owned channel bound to a sub-object the
    /// provider just minted.
    async fn open_child(&mut self, object: ObjectId) -> Result<Box<dyn ProviderChannel>, ForwardError>;

    /// Tear the transport down. Called exactly once per channel.
    async fn shutdown(&mut self) -> Result<(), ForwardError>;
}

/// An owned forwarding channel with closed-exactly-once discipline.
///
/// Owned by the session (root level) or by a registry entry (sub-object
/// level), never shared. [`ForwardingConnection::close`] is idempotent at
/// this wrapper but reaches the underlying channel exactly once.
pub struct ForwardingConnection {
    channel: Box<dyn ProviderChannel>,
    closed: bool,
}

impl ForwardingConnection {
    pub fn new(channel: Box<dyn ProviderChannel>) -> Self {
        Self { channel, closed: false }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub async fn call(&mut self, frame: &CallFrame) -> Result<ReplyFrame, ForwardError> {
        if self.closed {
            return Err(ForwardError::ConnectionClosed);
        }
        self.channel.round_trip(frame).await
    }

    pub async fn open_child(&mut self, object: ObjectId) -> Result<ForwardingConnection, ForwardError> {
        if self.closed {
            return Err(ForwardError::ConnectionClosed);
        }
        let channel = self.channel.open_child(object).await?;
        Ok(ForwardingConnection::new(channel))
    }

    pub async fn close(&mut self) -> Result<(), ForwardError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.channel.shutdown().await
    }
}

impl Drop for ForwardingConnection {
    fn drop(&mut self) {
        if !self.closed {
            warn!("forwarding connection dropped without close");
        }
    }
}

/// Hands out root-level forwarding connections when a session is accepted.
#[async_trait]
pub trait ProviderConnector: Send + Sync {
    async fn connect_root(&self, port: &str) -> Result<ForwardingConnection, ForwardError>;
}

/// Channel over a Unix socket to the real provider.
///
/// Each connection opens with an [`Attach`] preamble naming the port and,
/// for child channels, the provider-assigned object the connection serves.
pub struct SocketChannel {
    stream: UnixStream,
    provider_path: PathBuf,
    port: String,
    frame_limit: usize,
}

impl SocketChannel {
    pub async fn connect(
        provider_path: &Path,
        port: &str,
        object: Option<ObjectId>,
        frame_limit: usize,
    ) -> Result<Self, ForwardError> {
        let mut stream = UnixStream::connect(provider_path).await?;

        let attach = Attach { port: port.to_string(), object };
        let bytes = protocol::encode(&attach, frame_limit)?;
        protocol::write_frame(&mut stream, &bytes).await?;

        let reply_bytes = protocol::read_frame(&mut stream, frame_limit)
            .await?
            .ok_or(ForwardError::Disconnected)?;
        let reply: ReplyFrame = protocol::decode(&reply_bytes, frame_limit)?;
        if !reply.result.is_success() {
            return Err(ForwardError::Provider(reply.result));
        }

        Ok(Self {
            stream,
            provider_path: provider_path.to_path_buf(),
            port: port.to_string(),
            frame_limit,
        })
    }
}

#[async_trait]
impl ProviderChannel for SocketChannel {
    async fn round_trip(&mut self, frame: &CallFrame) -> Result<ReplyFrame, ForwardError> {
        let bytes = protocol::encode(frame, self.frame_limit)?;
        protocol::write_frame(&mut self.stream, &bytes).await?;

        let reply_bytes = protocol::read_frame(&mut self.stream, self.frame_limit)
            .await?
            .ok_or(ForwardError::Disconnected)?;
        Ok(protocol::decode(&reply_bytes, self.frame_limit)?)
    }

    async fn open_child(&mut self, object: ObjectId) -> Result<Box<dyn ProviderChannel>, ForwardError> {
        let child = SocketChannel::connect(
            &self.provider_path,
            &self.port,
            Some(object),
            self.frame_limit,
        )
        .await?;
        Ok(Box::new(child))
    }

    async fn shutdown(&mut self) -> Result<(), ForwardError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Dials root connections against the real provider's socket.
pub struct SocketConnector {
    provider_path: PathBuf,
    frame_limit: usize,
}

impl SocketConnector {
    pub fn new(provider_path: PathBuf, frame_limit: usize) -> Self {
        Self { provider_path, frame_limit }
    }
}

#[async_trait]
impl ProviderConnector for SocketConnector {
    async fn connect_root(&self, port: &str) -> Result<ForwardingConnection, ForwardError> {
        let channel =
            SocketChannel::connect(&self.provider_path, port, None, self.frame_limit).await?;
        Ok(ForwardingConnection::new(Box::new(channel)))
    }
}
