//! Message handler abstraction.

use crate::message::Message;
use crate::transport::Conn;
use std::sync::Arc;
use tracing::warn;

/// Reacts to decoded inbound messages.
///
/// Every handler sees every message and ignores the operations it doesn't
/// own.
pub trait Handler: Send + Sync {
    /// Process one inbound message received on `conn`.
    fn process_message(&self, msg: &Message, conn: &Arc<dyn Conn>);

    /// Release background resources. Must be safe to call more than once.
    fn close(&self) {}
}

/// Encode and queue a message, logging failures.
///
/// Returns true if the frame was queued.
pub(crate) fn send_message(conn: &dyn Conn, msg: &Message) -> bool {
    match msg.encode() {
        Ok(data) => send_frame(conn, data, msg),
        Err(e) => {
            warn!("Failed to encode {:?} message {}: {}", msg.op, msg.id, e);
            false
        }
    }
}

/// Queue an already encoded frame, logging failures.
pub(crate) fn send_frame(conn: &dyn Conn, data: Vec<u8>, msg: &Message) -> bool {
    match conn.send(data) {
        Ok(()) => true,
        Err(e) => {
            warn!(
                "Failed to send {:?} {} to connection {}: {}",
                msg.op,
                msg.id,
                conn.id(),
                e
            );
            false
        }
    }
}
