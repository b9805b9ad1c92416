//! Real-provider side: owned forwarding connections and the synchronous
//! client stubs the dispatcher calls through.

pub mod channel;
pub mod client;

pub use channel::{
    ForwardError, ForwardingConnection, ProviderChannel, ProviderConnector, SocketChannel,
    SocketConnector,
};
pub use client::{MintedEndpoint, MintedInterface, OpenEndpointArgs, ProviderClient};
