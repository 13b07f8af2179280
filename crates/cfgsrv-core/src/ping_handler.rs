//! Heartbeat: periodic pings, pong handling, and eviction on token expiry.
//!
//! Each registered peer owns a liveness token in the store whose TTL equals
//! the heartbeat timeout. A pong re-arms the token. When a token expires the
//! peer is evicted and the resulting list change is broadcast by the
//! connect handler's subscription.

use crate::handler::{send_frame, Handler};
use crate::liveness::LivenessTable;
use crate::message::{Message, Op};
use crate::registry::{ping_key, PeerStore, Registered, PEERS_LIST};
use crate::request_id::RequestIdGenerator;
use crate::store::{Subscription, WeakStore};
use crate::transport::Conn;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Smallest ping period the loop will run with.
const MIN_PING_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeartbeatError {
    #[error("Heartbeat timeout must be greater than zero")]
    InvalidTimeout,
}

/// Sends pings, re-arms liveness tokens on pong, evicts silent peers.
pub struct PingHandler {
    store: PeerStore,
    timeout: Duration,
    liveness: Arc<LivenessTable>,
    stop_tx: watch::Sender<bool>,
    _expiry_subscription: Subscription,
}

impl PingHandler {
    /// Create the handler and start its ping loop.
    ///
    /// Pings go out every `timeout / 2`. Must be called from within a tokio
    /// runtime.
    pub fn new(
        store: PeerStore,
        timeout: Duration,
        liveness: Arc<LivenessTable>,
    ) -> Result<Self, HeartbeatError> {
        if timeout.is_zero() {
            return Err(HeartbeatError::InvalidTimeout);
        }

        let subscription = {
            let weak = store.downgrade();
            let liveness = Arc::clone(&liveness);
            store.on_item_expired(move |key, value| {
                let Registered::Addr(addr) = value else {
                    return;
                };
                if key != ping_key(addr) {
                    return;
                }
                if !liveness.expire(addr) {
                    return;
                }
                info!("Peer {} missed its heartbeat (key {}), evicting", addr, key);
                let Some(store) = weak.upgrade() else {
                    return;
                };
                match store.remove_peer(addr) {
                    Ok(_) => liveness.prune(addr),
                    Err(e) => warn!("Failed to evict {}: {}", addr, e),
                }
            })
        };

        let period = (timeout / 2).max(MIN_PING_PERIOD);
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(ping_loop(store.downgrade(), period, stop_rx));
        info!("Heartbeat started: timeout {:?}, ping every {:?}", timeout, period);

        Ok(Self {
            store,
            timeout,
            liveness,
            stop_tx,
            _expiry_subscription: subscription,
        })
    }

    /// Stop the ping loop. Idempotent; never blocks.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    fn handle_pong(&self, msg: &Message, conn: &Arc<dyn Conn>) {
        let addr = match self.store.resolve_addr(conn.id()) {
            Ok(Some(addr)) => addr,
            Ok(None) => {
                debug!("Pong {} from unregistered connection {}", msg.id, conn.id());
                return;
            }
            Err(e) => {
                warn!("Pong {} dropped: {}", msg.id, e);
                return;
            }
        };

        // Re-arm first, then confirm the peer is still responsive. An eviction
        // that lands in between either deletes this token itself or is seen
        // here, so no token outlives an evicted peer.
        trace!("Updating ping for addr: {}", addr);
        let key = ping_key(&addr);
        let token = Registered::Addr(addr.clone());
        if let Err(e) = self.store.put(key.as_str(), token, Some(self.timeout)) {
            warn!("Failed to re-arm heartbeat for {}: {}", addr, e);
            return;
        }

        if !self.liveness.pong(&addr) {
            debug!("Pong {} from evicted peer {}, discarding", msg.id, addr);
            if let Err(e) = self.store.delete(&key) {
                warn!("Failed to drop heartbeat token for {}: {}", addr, e);
            }
        }
    }
}

impl Handler for PingHandler {
    fn process_message(&self, msg: &Message, conn: &Arc<dyn Conn>) {
        if msg.op == Op::Pong {
            self.handle_pong(msg, conn);
        }
    }

    fn close(&self) {
        self.stop();
    }
}

async fn ping_loop(store: WeakStore<Registered>, period: Duration, mut stop: watch::Receiver<bool>) {
    let ids = RequestIdGenerator::with_prefix("ping");
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = stop.changed() => {
                // Err means the handler was dropped
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let Some(store) = store.upgrade() else {
                    break;
                };
                if store.is_closed() {
                    break;
                }
                ping_peers(&store, &ids);
            }
        }
    }

    debug!("Ping loop done");
}

/// Send one ping round. All peers in a round share a request id.
fn ping_peers(store: &PeerStore, ids: &RequestIdGenerator) {
    let peers = match store.list_get(PEERS_LIST) {
        Ok(Some(peers)) if !peers.is_empty() => peers,
        Ok(_) => return,
        Err(e) => {
            warn!("Ping round skipped: {}", e);
            return;
        }
    };

    let ping = Message::request(Op::Ping, ids.next_id());
    let data = match ping.encode() {
        Ok(data) => data,
        Err(e) => {
            warn!("Failed to encode ping: {}", e);
            return;
        }
    };

    for addr in &peers {
        if let Ok(Some(conn)) = store.resolve_conn(addr) {
            send_frame(conn.as_ref(), data.clone(), &ping);
        }
    }
    trace!("Sent {} to {} peer(s)", ping.id, peers.len());
}
