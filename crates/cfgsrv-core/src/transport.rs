//! Connection handle contract provided by the transport.
//!
//! Implementations:
//! - WebSocket connections in the `cfgsrv` daemon crate
//! - A recording connection used by unit tests

use std::fmt;
use thiserror::Error;

/// Stable numeric identity of a live connection.
pub type ConnId = u64;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection {0} is closed")]
    Closed(ConnId),

    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// One live channel to a peer.
///
/// The core only holds non-owning references to these; the transport owns
/// the underlying socket.
pub trait Conn: Send + Sync + fmt::Debug {
    /// Connection identity, unique for the lifetime of the process.
    fn id(&self) -> ConnId;

    /// Queue a frame for delivery.
    ///
    /// Best-effort and non-blocking: returns once the frame is queued, with
    /// no confirmation that the peer received it.
    fn send(&self, data: Vec<u8>) -> Result<(), TransportError>;
}
