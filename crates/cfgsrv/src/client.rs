//! Client for the config server.
//!
//! Fetches the shared config, joins the peer list, answers heartbeats and
//! surfaces peer-list pushes:
//!
//! ```no_run
//! # async fn example() -> Result<(), cfgsrv::ClientError> {
//! let mut client = cfgsrv::ConfigClient::connect("ws://127.0.0.1:7170").await?;
//! let joined = client.join("10.0.0.5:7171").await?;
//! println!("config: {}, peers: {:?}", joined.config, joined.peers);
//! while let Some(peers) = client.peer_updates().recv().await {
//!     println!("peers now: {:?}", peers);
//! }
//! # Ok(())
//! # }
//! ```

use cfgsrv_core::{Message, MessageType, Op, ProtocolError};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message as WsMessage},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

/// How long a request waits for its response by default.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Connection to config server closed")]
    Closed,

    #[error("Timed out waiting for response to request {0}")]
    Timeout(String),

    #[error("Response to request {0} has no {1}")]
    MissingField(String, &'static str),
}

/// Result of joining the peer list.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinResponse {
    /// Peer list including our own address, in connect order
    pub peers: Vec<String>,
    pub config: serde_json::Value,
}

#[derive(Default)]
struct PendingRequests {
    waiters: Mutex<HashMap<String, oneshot::Sender<Message>>>,
}

impl PendingRequests {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Message>>> {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Connection to a config server.
pub struct ConfigClient {
    outbound: mpsc::UnboundedSender<WsMessage>,
    pending: Arc<PendingRequests>,
    auto_pong: Arc<AtomicBool>,
    updates: mpsc::UnboundedReceiver<Vec<String>>,
    request_timeout: Duration,
    read_task: JoinHandle<()>,
}

impl ConfigClient {
    /// Connect to a config server, e.g. `ws://127.0.0.1:7170`.
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let (ws_stream, _) = connect_async(url).await?;
        let (write, read) = ws_stream.split();

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (updates_tx, updates) = mpsc::unbounded_channel();
        let pending = Arc::new(PendingRequests::default());
        let auto_pong = Arc::new(AtomicBool::new(true));

        tokio::spawn(write_loop(write, outbound_rx));
        let read_task = tokio::spawn(read_loop(
            read,
            outbound.clone(),
            Arc::clone(&pending),
            Arc::clone(&auto_pong),
            updates_tx,
        ));

        info!("Connected to config server at {}", url);
        Ok(Self {
            outbound,
            pending,
            auto_pong,
            updates,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            read_task,
        })
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Fetch the shared configuration. Does not join the peer list.
    pub async fn get_config(&self) -> Result<serde_json::Value, ClientError> {
        let response = self.request(Message::request(Op::Get, new_request_id())).await?;
        response
            .config
            .ok_or(ClientError::MissingField(response.id, "config"))
    }

    /// Register `addr` as a peer.
    pub async fn join(&self, addr: &str) -> Result<JoinResponse, ClientError> {
        let request = Message::request(Op::Connect, new_request_id()).with_addr(addr);
        let response = self.request(request).await?;

        let Some(config) = response.config else {
            return Err(ClientError::MissingField(response.id, "config"));
        };
        Ok(JoinResponse {
            peers: response.peers.unwrap_or_default(),
            config,
        })
    }

    /// Peer lists pushed by the server, oldest first.
    pub fn peer_updates(&mut self) -> &mut mpsc::UnboundedReceiver<Vec<String>> {
        &mut self.updates
    }

    /// Turn automatic pong replies on or off. On by default; a client that
    /// stops answering is evicted once the server's timeout elapses.
    pub fn set_auto_pong(&self, enabled: bool) {
        self.auto_pong.store(enabled, Ordering::SeqCst);
    }

    /// Close the connection.
    pub fn close(self) {
        let _ = self.outbound.send(WsMessage::Close(None));
        self.read_task.abort();
    }

    async fn request(&self, msg: Message) -> Result<Message, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(msg.id.clone(), tx);

        if let Err(e) = send_message(&self.outbound, &msg) {
            self.pending.lock().remove(&msg.id);
            return Err(e);
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                self.pending.lock().remove(&msg.id);
                Err(ClientError::Timeout(msg.id))
            }
        }
    }
}

impl Drop for ConfigClient {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}

fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn send_message(outbound: &mpsc::UnboundedSender<WsMessage>, msg: &Message) -> Result<(), ClientError> {
    let data = msg.encode()?;
    outbound
        .send(WsMessage::Text(String::from_utf8_lossy(&data).into_owned()))
        .map_err(|_| ClientError::Closed)
}

async fn write_loop(mut write: SplitSink<ClientStream, WsMessage>, mut outbound: mpsc::UnboundedReceiver<WsMessage>) {
    while let Some(msg) = outbound.recv().await {
        let closing = matches!(msg, WsMessage::Close(_));
        if let Err(e) = write.send(msg).await {
            debug!("Write to config server failed: {}", e);
            break;
        }
        if closing {
            break;
        }
    }
    let _ = write.close().await;
}

async fn read_loop(
    mut read: SplitStream<ClientStream>,
    outbound: mpsc::UnboundedSender<WsMessage>,
    pending: Arc<PendingRequests>,
    auto_pong: Arc<AtomicBool>,
    updates: mpsc::UnboundedSender<Vec<String>>,
) {
    while let Some(frame) = read.next().await {
        let data = match frame {
            Ok(WsMessage::Text(text)) => text.into_bytes(),
            Ok(WsMessage::Binary(data)) => data.to_vec(),
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("Config server connection error: {}", e);
                break;
            }
        };

        let msg = match Message::decode(&data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Ignoring frame from config server: {}", e);
                continue;
            }
        };

        match (msg.op, msg.msg_type) {
            (Op::Ping, _) => {
                if !auto_pong.load(Ordering::SeqCst) {
                    continue;
                }
                let pong = Message {
                    op: Op::Pong,
                    ..Message::response_to(&msg)
                };
                if let Err(e) = send_message(&outbound, &pong) {
                    debug!("Failed to answer ping {}: {}", msg.id, e);
                }
            }
            (Op::PeersChanged, MessageType::Push) => {
                if let Some(peers) = msg.peers {
                    let _ = updates.send(peers);
                }
            }
            (_, MessageType::Response) => match pending.lock().remove(&msg.id) {
                Some(waiter) => {
                    let _ = waiter.send(msg);
                }
                None => debug!("Response {} matches no pending request", msg.id),
            },
            (op, msg_type) => debug!("Ignoring {:?} {:?} {}", op, msg_type, msg.id),
        }
    }

    // Wake every waiter with `Closed`
    pending.lock().clear();
    debug!("Config client read loop done");
}
