//! WebSocket server for the config service.
//!
//! Accepts connections, feeds their frames to the `Dispatcher`, and makes
//! sure a closing connection is reported to the dispatcher before it is
//! dropped.

use crate::config::Options;
use crate::connection::{ConnectionEvent, WsConn};
use anyhow::Result;
use cfgsrv_core::{Conn, ConnId, Dispatcher, PeerStore};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info};

/// The config server: transport plus dispatcher.
pub struct ConfigServer {
    dispatcher: Dispatcher,
    /// Open connections indexed by connection id
    connections: HashMap<ConnId, Arc<WsConn>>,
    /// Counter for generating connection IDs
    next_conn_id: ConnId,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    event_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl ConfigServer {
    /// Validate options, load the config file and start the heartbeat.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(opts: &Options) -> Result<Self> {
        opts.validate()?;
        let config = opts.load_config()?;
        info!("Loaded config from {:?}", opts.config_file);

        let dispatcher = Dispatcher::new(config, opts.timeout)?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Ok(Self {
            dispatcher,
            connections: HashMap::new(),
            next_conn_id: 1,
            event_tx,
            event_rx,
        })
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("WebSocket server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Serve connections until `shutdown` completes, then close everything.
    pub async fn run(&mut self, listener: TcpListener, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.accept_connection(stream, addr),
                        Err(e) => error!("Failed to accept connection: {}", e),
                    }
                }

                Some(event) = self.event_rx.recv() => {
                    self.on_event(event);
                }

                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.stop();
        Ok(())
    }

    /// Registry handle, for inspection.
    pub fn store(&self) -> PeerStore {
        self.dispatcher.store().clone()
    }

    /// Close every connection and the dispatcher. Idempotent.
    pub fn stop(&mut self) {
        for (_, conn) in self.connections.drain() {
            conn.close();
        }
        self.dispatcher.close();
    }

    /// Upgrade a TCP connection on its own task so a slow client can't
    /// stall the accept loop.
    fn accept_connection(&mut self, stream: TcpStream, addr: SocketAddr) {
        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    // Health checks connect and close without a handshake.
                    let err_str = e.to_string();
                    if err_str.contains("Handshake not finished")
                        || err_str.contains("Connection reset")
                        || err_str.contains("unexpected EOF")
                    {
                        debug!("Connection closed before handshake from {}", addr);
                    } else {
                        error!("WebSocket upgrade failed for {}: {}", addr, e);
                    }
                    return;
                }
            };

            info!("New connection from {} (conn_id: {})", addr, conn_id);
            WsConn::spawn(conn_id, addr, ws_stream, event_tx);
        });
    }

    fn on_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Opened(conn) => {
                self.connections.insert(conn.id(), conn);
            }
            ConnectionEvent::Message { conn_id, data } => {
                let Some(conn) = self.connections.get(&conn_id) else {
                    debug!("Frame for unknown connection {}, dropping", conn_id);
                    return;
                };
                let conn: Arc<dyn Conn> = conn.clone();
                self.dispatcher.on_message(&data, &conn);
            }
            ConnectionEvent::Closed { conn_id } => {
                if let Some(conn) = self.connections.remove(&conn_id) {
                    info!("Connection {} from {} closed", conn_id, conn.remote_addr());
                    self.dispatcher.on_connection_closing(conn.as_ref());
                }
            }
        }
    }
}

impl Drop for ConfigServer {
    fn drop(&mut self) {
        self.stop();
    }
}
