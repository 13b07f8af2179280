//! Routes inbound frames to the handlers and cleans up closed connections.

use crate::connect_handler::ConnectHandler;
use crate::handler::{send_message, Handler};
use crate::liveness::LivenessTable;
use crate::message::{Message, Op};
use crate::ping_handler::{HeartbeatError, PingHandler};
use crate::registry::{conn_key, PeerStore};
use crate::transport::Conn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Owns the registry and the handler chain for one server instance.
pub struct Dispatcher {
    config: Arc<serde_json::Value>,
    store: PeerStore,
    liveness: Arc<LivenessTable>,
    handlers: Vec<Arc<dyn Handler>>,
    closed: AtomicBool,
}

impl Dispatcher {
    /// Build the registry and the connect and ping handlers.
    ///
    /// Starts the heartbeat, so this must run inside a tokio runtime.
    pub fn new(config: serde_json::Value, timeout: Duration) -> Result<Self, HeartbeatError> {
        let config = Arc::new(config);
        let store = PeerStore::new();
        let liveness = Arc::new(LivenessTable::new());

        let ping = PingHandler::new(store.clone(), timeout, Arc::clone(&liveness))?;
        let connect = ConnectHandler::new(
            store.clone(),
            Arc::clone(&config),
            timeout,
            Arc::clone(&liveness),
        );

        let handlers: Vec<Arc<dyn Handler>> = vec![Arc::new(connect) as Arc<dyn Handler>, Arc::new(ping)];

        Ok(Self {
            config,
            store,
            liveness,
            handlers,
            closed: AtomicBool::new(false),
        })
    }

    /// Decode one frame and route it.
    ///
    /// Undecodable frames are logged and dropped; the connection stays open.
    pub fn on_message(&self, data: &[u8], conn: &Arc<dyn Conn>) {
        let msg = match Message::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping frame from connection {}: {}", conn.id(), e);
                return;
            }
        };
        debug!("Operation: {:?} ({}) from connection {}", msg.op, msg.id, conn.id());

        if msg.op == Op::Get {
            let response = Message::response_to(&msg).with_config(self.config.as_ref().clone());
            send_message(conn.as_ref(), &response);
        }

        for handler in &self.handlers {
            handler.process_message(&msg, conn);
        }
    }

    /// Remove the peer registered on a connection that is closing.
    ///
    /// If the peer's address has since been claimed by a newer connection,
    /// only this connection's reverse-lookup entry is removed.
    pub fn on_connection_closing(&self, conn: &dyn Conn) {
        let id = conn.id();
        let addr = match self.store.resolve_addr(id) {
            Ok(Some(addr)) => addr,
            Ok(None) => {
                debug!("Connection {} closing, no peer registered", id);
                return;
            }
            Err(e) => {
                debug!("Connection {} closing: {}", id, e);
                return;
            }
        };

        let owner = self.store.resolve_conn(&addr).ok().flatten().map(|c| c.id());
        let result = if owner == Some(id) {
            info!("Connection {} for {} closing, removing peer", id, addr);
            self.liveness.forget(&addr);
            self.store.remove_peer(&addr).map(|_| ())
        } else {
            debug!("Connection {} closing, {} now owned by another connection", id, addr);
            self.store.delete(&conn_key(id)).map(|_| ())
        };

        if let Err(e) = result {
            warn!("Cleanup for connection {} failed: {}", id, e);
        }
    }

    pub fn store(&self) -> &PeerStore {
        &self.store
    }

    pub fn liveness(&self) -> &LivenessTable {
        &self.liveness
    }

    /// Stop the handlers and close the registry. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for handler in &self.handlers {
            handler.close();
        }
        self.store.close();
        info!("Dispatcher closed");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.close();
    }
}
