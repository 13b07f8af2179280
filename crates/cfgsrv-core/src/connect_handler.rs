//! Peer registration and peer-list broadcast.
//!
//! A `connect` request registers the sender's address, answers with the
//! config and the peer list as it will look once the address is appended,
//! then appends it. Every mutation of the peer list, whatever caused it, is
//! followed by a `peers_changed` push to every listed peer.

use crate::handler::{send_frame, send_message, Handler};
use crate::liveness::LivenessTable;
use crate::message::{Message, Op};
use crate::registry::{conn_key, is_valid_addr, ping_key, PeerStore, Registered, PEERS_LIST};
use crate::request_id::RequestIdGenerator;
use crate::store::{StoreError, Subscription};
use crate::transport::Conn;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Handles `connect` requests and broadcasts peer-list changes.
pub struct ConnectHandler {
    store: PeerStore,
    config: Arc<serde_json::Value>,
    /// TTL of the liveness token armed on connect
    timeout: Duration,
    liveness: Arc<LivenessTable>,
    _list_subscription: Subscription,
}

impl ConnectHandler {
    /// Create the handler and subscribe it to peer-list changes.
    pub fn new(
        store: PeerStore,
        config: Arc<serde_json::Value>,
        timeout: Duration,
        liveness: Arc<LivenessTable>,
    ) -> Self {
        let broadcaster = PeerBroadcaster {
            ids: RequestIdGenerator::new(),
            in_flight: Mutex::new(()),
        };
        let weak = store.downgrade();
        let subscription = store.on_list_changed(move |list, values| {
            if list != PEERS_LIST {
                return;
            }
            debug!("Peer list changed: {} peer(s)", values.len());
            // Re-read inside the broadcast: `values` may already be stale.
            if let Some(store) = weak.upgrade() {
                broadcaster.broadcast(&store);
            }
        });

        Self {
            store,
            config,
            timeout,
            liveness,
            _list_subscription: subscription,
        }
    }

    fn register(&self, msg: &Message, addr: &str, conn: &Arc<dyn Conn>) -> Result<(), StoreError> {
        let mut peers = self.store.peer_list()?;
        if peers.iter().any(|p| p == addr) {
            info!("{} connected again, replacing its previous registration", addr);
            self.store.remove_peer(addr)?;
            peers.retain(|p| p != addr);
        }
        // The response reflects the list as it will be after the append below.
        peers.push(addr.to_string());

        self.store
            .put(addr, Registered::Conn(Arc::clone(conn)), None)?;
        self.store
            .put(conn_key(conn.id()), Registered::Addr(addr.to_string()), None)?;
        self.liveness.register(addr);
        self.store.put(
            ping_key(addr),
            Registered::Addr(addr.to_string()),
            Some(self.timeout),
        )?;

        let response = Message::response_to(msg)
            .with_config(self.config.as_ref().clone())
            .with_peers(peers);
        send_message(conn.as_ref(), &response);

        self.store.list_push(PEERS_LIST, addr)
    }
}

impl Handler for ConnectHandler {
    fn process_message(&self, msg: &Message, conn: &Arc<dyn Conn>) {
        if msg.op != Op::Connect {
            return;
        }

        let Some(addr) = msg.addr.as_deref().filter(|a| !a.is_empty()) else {
            warn!(
                "Connect request {} on connection {} has no addr, ignoring",
                msg.id,
                conn.id()
            );
            return;
        };
        if !is_valid_addr(addr) {
            warn!(
                "Connect request {} on connection {} uses reserved addr {}, ignoring",
                msg.id,
                conn.id(),
                addr
            );
            return;
        }

        info!("Connect: addr: {} (connection {})", addr, conn.id());
        if let Err(e) = self.register(msg, addr, conn) {
            warn!("Connect for {} aborted: {}", addr, e);
        }
    }
}

/// Sends the current peer list to every listed peer.
struct PeerBroadcaster {
    ids: RequestIdGenerator,
    /// Held from the list read to the last send, so pushes go out in id
    /// order and the newest list is always delivered last.
    in_flight: Mutex<()>,
}

impl PeerBroadcaster {
    fn broadcast(&self, store: &PeerStore) {
        let _guard = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        let peers = match store.list_get(PEERS_LIST) {
            Ok(Some(peers)) => peers,
            Ok(None) => return,
            Err(e) => {
                warn!("Cannot read peer list for broadcast: {}", e);
                return;
            }
        };

        let push = Message::push(Op::PeersChanged, self.ids.next_id()).with_peers(peers.clone());
        let data = match push.encode() {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to encode peers_changed: {}", e);
                return;
            }
        };

        let mut delivered = 0;
        for addr in &peers {
            match store.resolve_conn(addr) {
                Ok(Some(conn)) => {
                    if send_frame(conn.as_ref(), data.clone(), &push) {
                        delivered += 1;
                    }
                }
                // Removed concurrently; nothing to deliver to.
                Ok(None) => debug!("No connection registered for {}, skipping", addr),
                Err(e) => {
                    warn!("Broadcast {} aborted: {}", push.id, e);
                    return;
                }
            }
        }

        debug!(
            "Broadcast peers_changed {} ({} peer(s)) to {} connection(s)",
            push.id,
            peers.len(),
            delivered
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use crate::test_support::{strings, RecordingConn};
    use crate::transport::{ConnId, TransportError};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    const A: &str = "127.0.0.1:7171";
    const B: &str = "192.168.0.100:7171";
    const C: &str = "192.168.0.101:7171";

    fn handler(store: &PeerStore) -> ConnectHandler {
        ConnectHandler::new(
            store.clone(),
            Arc::new(json!({"feature1": {"enable": false}, "feature2": {"enable": true}})),
            Duration::from_secs(30),
            Arc::new(LivenessTable::new()),
        )
    }

    fn connect(handler: &ConnectHandler, conn: &Arc<RecordingConn>, id: &str, addr: &str) {
        let msg = Message::request(Op::Connect, id).with_addr(addr);
        let conn: Arc<dyn Conn> = conn.clone();
        handler.process_message(&msg, &conn);
    }

    fn connect_response(conn: &RecordingConn) -> Message {
        conn.messages()
            .into_iter()
            .find(|m| m.op == Op::Connect)
            .expect("connect response")
    }

    #[tokio::test]
    async fn test_first_connect_response() {
        let store = PeerStore::new();
        let handler = handler(&store);
        let conn = RecordingConn::new(1);

        connect(&handler, &conn, "2", A);

        let messages = conn.messages();
        assert_eq!(messages.len(), 2);

        let response = &messages[0];
        assert_eq!(response.op, Op::Connect);
        assert_eq!(response.msg_type, MessageType::Response);
        assert_eq!(response.id, "2");
        assert_eq!(response.peers, Some(strings(&[A])));
        assert_eq!(response.config.as_ref().unwrap()["feature2"]["enable"], true);

        // The append triggers the broadcast after the response
        let push = &messages[1];
        assert_eq!(push.op, Op::PeersChanged);
        assert_eq!(push.msg_type, MessageType::Push);
        assert_eq!(push.id, "1");
        assert_eq!(push.peers, Some(strings(&[A])));
    }

    #[tokio::test]
    async fn test_kth_response_lists_first_k_peers() {
        let store = PeerStore::new();
        let handler = handler(&store);
        let (a, b, c) = (RecordingConn::new(1), RecordingConn::new(2), RecordingConn::new(3));

        connect(&handler, &a, "2", A);
        connect(&handler, &b, "2", B);
        connect(&handler, &c, "req-client-3", C);

        assert_eq!(connect_response(&a).peers, Some(strings(&[A])));
        assert_eq!(connect_response(&b).peers, Some(strings(&[A, B])));
        let response_c = connect_response(&c);
        assert_eq!(response_c.id, "req-client-3");
        assert_eq!(response_c.peers, Some(strings(&[A, B, C])));

        assert_eq!(store.peer_list().unwrap(), strings(&[A, B, C]));
    }

    #[tokio::test]
    async fn test_every_peer_receives_each_list_change() {
        let store = PeerStore::new();
        let handler = handler(&store);
        let (a, b, c) = (RecordingConn::new(1), RecordingConn::new(2), RecordingConn::new(3));

        connect(&handler, &a, "1", A);
        connect(&handler, &b, "2", B);
        connect(&handler, &c, "3", C);

        assert_eq!(
            a.peer_pushes(),
            vec![strings(&[A]), strings(&[A, B]), strings(&[A, B, C])]
        );
        assert_eq!(b.peer_pushes(), vec![strings(&[A, B]), strings(&[A, B, C])]);
        assert_eq!(c.peer_pushes(), vec![strings(&[A, B, C])]);

        let ids: Vec<_> = a
            .messages()
            .into_iter()
            .filter(|m| m.op == Op::PeersChanged)
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_connect_registers_entries() {
        let store = PeerStore::new();
        let liveness = Arc::new(LivenessTable::new());
        let handler = ConnectHandler::new(
            store.clone(),
            Arc::new(json!({})),
            Duration::from_secs(30),
            Arc::clone(&liveness),
        );
        let conn = RecordingConn::new(9);

        connect(&handler, &conn, "1", A);

        assert_eq!(store.resolve_conn(A).unwrap().unwrap().id(), 9);
        assert_eq!(store.resolve_addr(9).unwrap().as_deref(), Some(A));
        assert!(matches!(
            store.get(&ping_key(A)).unwrap(),
            Some(Registered::Addr(addr)) if addr == A
        ));
        assert_eq!(liveness.state(A), Some(crate::Liveness::Responsive));
    }

    #[tokio::test]
    async fn test_ignores_other_operations_and_missing_addr() {
        let store = PeerStore::new();
        let handler = handler(&store);
        let conn = RecordingConn::new(1);
        let dyn_conn: Arc<dyn Conn> = conn.clone();

        handler.process_message(&Message::request(Op::Get, "1"), &dyn_conn);
        handler.process_message(&Message::request(Op::Pong, "2"), &dyn_conn);
        handler.process_message(&Message::request(Op::Connect, "3"), &dyn_conn);
        handler.process_message(
            &Message::request(Op::Connect, "4").with_addr(""),
            &dyn_conn,
        );

        assert!(conn.messages().is_empty());
        assert!(store.list_get(PEERS_LIST).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_broadcast_skips_unresolvable_and_failing_peers() {
        let store = PeerStore::new();
        let handler = handler(&store);
        let (a, b, c) = (RecordingConn::new(1), RecordingConn::new(2), RecordingConn::new(3));

        connect(&handler, &a, "1", A);
        connect(&handler, &b, "2", B);

        // A's handle vanished concurrently, B's socket is gone
        store.delete(A).unwrap();
        b.close();
        a.clear();

        connect(&handler, &c, "3", C);

        assert!(a.messages().is_empty());
        assert_eq!(c.peer_pushes(), vec![strings(&[A, B, C])]);
        // Send failures don't remove peers
        assert_eq!(store.peer_list().unwrap(), strings(&[A, B, C]));
    }

    #[tokio::test]
    async fn test_reconnect_replaces_previous_entry() {
        let store = PeerStore::new();
        let handler = handler(&store);
        let (a, b, a2) = (RecordingConn::new(1), RecordingConn::new(2), RecordingConn::new(3));

        connect(&handler, &a, "1", A);
        connect(&handler, &b, "2", B);
        connect(&handler, &a2, "3", A);

        assert_eq!(connect_response(&a2).peers, Some(strings(&[B, A])));
        assert_eq!(store.peer_list().unwrap(), strings(&[B, A]));
        assert_eq!(store.resolve_conn(A).unwrap().unwrap().id(), 3);
        assert_eq!(store.resolve_addr(3).unwrap().as_deref(), Some(A));
        assert!(store.resolve_addr(1).unwrap().is_none());

        // The final broadcast carries the deduplicated list
        assert_eq!(b.peer_pushes().last(), Some(&strings(&[B, A])));
        assert_eq!(a2.peer_pushes(), vec![strings(&[B, A])]);
    }

    #[tokio::test]
    async fn test_reserved_addresses_rejected() {
        let store = PeerStore::new();
        let handler = handler(&store);
        let (a, b, c) = (RecordingConn::new(1), RecordingConn::new(2), RecordingConn::new(3));

        connect(&handler, &a, "1", A);
        connect(&handler, &b, "2", &ping_key(A));
        connect(&handler, &c, "3", "5");

        assert!(b.messages().is_empty());
        assert!(c.messages().is_empty());
        assert_eq!(store.peer_list().unwrap(), strings(&[A]));
        // A's liveness token is untouched
        assert!(matches!(
            store.get(&ping_key(A)).unwrap(),
            Some(Registered::Addr(addr)) if addr == A
        ));
    }

    /// Connection whose first `peers_changed` delivery stalls.
    #[derive(Debug)]
    struct StallingConn {
        id: ConnId,
        stall: AtomicBool,
        pushes: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl Conn for StallingConn {
        fn id(&self) -> ConnId {
            self.id
        }

        fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
            let msg = Message::decode(&data).unwrap();
            if msg.op == Op::PeersChanged {
                if self.stall.swap(false, Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(200));
                }
                self.pushes
                    .lock()
                    .unwrap()
                    .push((msg.id, msg.peers.unwrap_or_default()));
            }
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_broadcasts_deliver_newest_list_last() {
        let store = PeerStore::new();
        let handler = Arc::new(handler(&store));
        let a = Arc::new(StallingConn {
            id: 1,
            stall: AtomicBool::new(true),
            pushes: Mutex::new(Vec::new()),
        });
        let b = RecordingConn::new(2);

        let first = {
            let handler = Arc::clone(&handler);
            let conn: Arc<dyn Conn> = a.clone();
            tokio::task::spawn_blocking(move || {
                handler.process_message(&Message::request(Op::Connect, "1").with_addr(A), &conn)
            })
        };
        // Let the first broadcast reach its stalled send
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = {
            let handler = Arc::clone(&handler);
            let conn: Arc<dyn Conn> = b.clone();
            tokio::task::spawn_blocking(move || {
                handler.process_message(&Message::request(Op::Connect, "2").with_addr(B), &conn)
            })
        };
        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(store.peer_list().unwrap(), strings(&[A, B]));
        let pushes = a.pushes.lock().unwrap().clone();
        assert_eq!(
            pushes,
            vec![
                ("1".to_string(), strings(&[A])),
                ("2".to_string(), strings(&[A, B])),
            ]
        );
        assert_eq!(b.peer_pushes(), vec![strings(&[A, B])]);
    }

    #[tokio::test]
    async fn test_closed_store_aborts_connect() {
        let store = PeerStore::new();
        let handler = handler(&store);
        let conn = RecordingConn::new(1);

        store.close();
        connect(&handler, &conn, "1", A);

        assert!(conn.messages().is_empty());
    }
}
