//! Individual peer connection management.
//!
//! Each accepted WebSocket is split into a read task, which forwards frames
//! to the server's event channel, and a write task, which drains an
//! unbounded queue so that `send` never blocks the caller.

use cfgsrv_core::{Conn, ConnId, TransportError};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{
    tungstenite::{Error as WsError, Message},
    WebSocketStream,
};
use tracing::{debug, error, trace, warn};

/// Maximum inbound frame size (1MB). Larger frames are dropped.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Event emitted by a connection.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// WebSocket upgrade finished; always precedes the connection's messages
    Opened(Arc<WsConn>),
    /// Received a frame from the peer
    Message { conn_id: ConnId, data: Vec<u8> },
    /// Connection was closed (by the peer or by an error)
    Closed { conn_id: ConnId },
}

/// A single accepted WebSocket connection.
#[derive(Debug)]
pub struct WsConn {
    id: ConnId,
    remote: SocketAddr,
    outbound: mpsc::UnboundedSender<Message>,
    /// Stops the read task
    shutdown: watch::Sender<bool>,
}

impl WsConn {
    /// Wrap an upgraded stream and start its read and write tasks.
    ///
    /// `ConnectionEvent::Opened` is queued before the read task starts, so
    /// the receiver always learns about the connection before its first
    /// frame.
    pub fn spawn(
        id: ConnId,
        remote: SocketAddr,
        ws_stream: WebSocketStream<TcpStream>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Arc<Self> {
        let (write, read) = ws_stream.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let conn = Arc::new(Self {
            id,
            remote,
            outbound,
            shutdown,
        });

        let _ = event_tx.send(ConnectionEvent::Opened(Arc::clone(&conn)));
        tokio::spawn(Self::write_loop(id, write, outbound_rx));
        tokio::spawn(Self::read_loop(id, read, event_tx, shutdown_rx));

        conn
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Send a close frame and stop reading.
    ///
    /// No `Closed` event is emitted for a connection closed this way.
    pub fn close(&self) {
        let _ = self.outbound.send(Message::Close(None));
        self.shutdown.send_replace(true);
    }

    /// Read loop that forwards frames to the event channel.
    async fn read_loop(
        id: ConnId,
        mut read: SplitStream<WebSocketStream<TcpStream>>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let frame = tokio::select! {
                frame = read.next() => frame,
                _ = shutdown.changed() => {
                    debug!("Connection {} read loop stopped", id);
                    return;
                }
            };

            match frame {
                Some(Ok(msg)) => {
                    let data = match msg {
                        Message::Text(text) => text.into_bytes(),
                        Message::Binary(data) => data.to_vec(),
                        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                        Message::Close(_) => {
                            debug!("Received close frame from connection {}", id);
                            break;
                        }
                    };

                    if data.len() > MAX_MESSAGE_SIZE {
                        warn!(
                            "Message from connection {} exceeds max size ({} > {}), dropping",
                            id,
                            data.len(),
                            MAX_MESSAGE_SIZE
                        );
                        continue;
                    }

                    trace!("Frame from connection {}: {} bytes", id, data.len());
                    let _ = event_tx.send(ConnectionEvent::Message { conn_id: id, data });
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Connection {} closed", id);
                        }
                        _ => {
                            error!("WebSocket error on connection {}: {}", id, e);
                        }
                    }
                    break;
                }
                None => {
                    debug!("Connection {} stream ended", id);
                    break;
                }
            }
        }

        let _ = event_tx.send(ConnectionEvent::Closed { conn_id: id });
    }

    /// Write loop; ends after a close frame or once every sender is gone.
    async fn write_loop(
        id: ConnId,
        mut write: SplitSink<WebSocketStream<TcpStream>, Message>,
        mut outbound: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(msg) = outbound.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = write.send(msg).await {
                debug!("Write to connection {} failed: {}", id, e);
                break;
            }
            if closing {
                break;
            }
        }
        let _ = write.close().await;
    }
}

impl Conn for WsConn {
    fn id(&self) -> ConnId {
        self.id
    }

    /// Queue a frame; protocol messages are JSON so they go out as text.
    fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        let text = String::from_utf8(data).map_err(|e| TransportError::SendFailed(e.to_string()))?;
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| TransportError::Closed(self.id))
    }
}
