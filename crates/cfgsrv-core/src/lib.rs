//! cfgsrv-core: membership and liveness logic for the config server.
//!
//! This crate provides:
//! - The JSON message protocol spoken with peers
//! - An in-process keyed store with TTL expiry and list-change callbacks
//! - The connect and heartbeat handlers that maintain the peer list
//! - A dispatcher that routes decoded frames to the handlers

pub mod connect_handler;
pub mod dispatcher;
pub mod handler;
pub mod liveness;
pub mod message;
pub mod ping_handler;
pub mod registry;
pub mod request_id;
pub mod store;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use connect_handler::ConnectHandler;
pub use dispatcher::Dispatcher;
pub use handler::Handler;
pub use liveness::{Liveness, LivenessEvent, LivenessTable};
pub use message::{Message, MessageType, Op, ProtocolError};
pub use ping_handler::{HeartbeatError, PingHandler};
pub use registry::{PeerStore, Registered, PEERS_LIST};
pub use request_id::RequestIdGenerator;
pub use store::{MemStore, StoreError, Subscription, WeakStore};
pub use transport::{Conn, ConnId, TransportError};
