//! Interception side: wire protocol, sessions, the object registry, the
//! per-object dispatcher, and the port listener.

pub mod connections;
pub mod dispatcher;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

pub use connections::{PortSessionPool, SessionSlot};
pub use dispatcher::Dispatcher;
pub use protocol::{CallFrame, ObjectId, Reply, ReplyFrame, Request, ResultCode};
pub use registry::{ObjectKind, ObjectRegistry, RegistryEntry};
pub use server::{PortConfig, ServerConfig, ServerError, ServerManager};
pub use session::{ClientIdentity, Session, SessionId};
