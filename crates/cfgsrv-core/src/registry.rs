//! Typed view of the store as the peer registry.
//!
//! Per peer the registry holds:
//! - `<addr>` → connection handle (no expiry)
//! - `<conn id>` → addr (no expiry), for reverse lookups
//! - `<addr>-ping` → addr (TTL = heartbeat timeout), the liveness token
//! - the address itself in the `peers` list, in connect order
//!
//! All three key kinds share one namespace, so an address that looks like a
//! connection id or a liveness token key is refused (see `is_valid_addr`).

use crate::store::{MemStore, StoreError};
use crate::transport::{Conn, ConnId};
use std::sync::Arc;
use tracing::debug;

/// Name of the list holding live peer addresses.
pub const PEERS_LIST: &str = "peers";

const PING_SUFFIX: &str = "-ping";

/// Value stored under a registry key.
#[derive(Debug, Clone)]
pub enum Registered {
    Conn(Arc<dyn Conn>),
    Addr(String),
}

/// The shared registry all handlers operate on.
pub type PeerStore = MemStore<Registered>;

/// Key of the reverse-lookup entry for a connection.
pub fn conn_key(id: ConnId) -> String {
    id.to_string()
}

/// Key of a peer's liveness token.
pub fn ping_key(addr: &str) -> String {
    format!("{}{}", addr, PING_SUFFIX)
}

/// Whether `addr` can be registered without colliding with another key kind.
pub fn is_valid_addr(addr: &str) -> bool {
    !addr.is_empty() && !addr.ends_with(PING_SUFFIX) && addr.parse::<ConnId>().is_err()
}

impl MemStore<Registered> {
    /// Connection handle registered for an address.
    pub fn resolve_conn(&self, addr: &str) -> Result<Option<Arc<dyn Conn>>, StoreError> {
        Ok(match self.get(addr)? {
            Some(Registered::Conn(conn)) => Some(conn),
            _ => None,
        })
    }

    /// Address registered by a connection.
    pub fn resolve_addr(&self, id: ConnId) -> Result<Option<String>, StoreError> {
        Ok(match self.get(&conn_key(id))? {
            Some(Registered::Addr(addr)) => Some(addr),
            _ => None,
        })
    }

    /// Current peer list in connect order (empty if none ever connected).
    pub fn peer_list(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.list_get(PEERS_LIST)?.unwrap_or_default())
    }

    /// Remove every trace of a peer.
    ///
    /// The list entry goes first, so observers of the list see the reduced
    /// membership. The reverse-lookup entry is only removed while it still
    /// points at `addr`. Returns true if the peer was listed.
    pub fn remove_peer(&self, addr: &str) -> Result<bool, StoreError> {
        let listed = self.list_delete(PEERS_LIST, addr)?;

        if let Some(conn) = self.resolve_conn(addr)? {
            let key = conn_key(conn.id());
            if self.resolve_addr(conn.id())?.as_deref() == Some(addr) {
                self.delete(&key)?;
            }
        }
        self.delete(addr)?;
        self.delete(&ping_key(addr))?;

        debug!("Removed peer {} from registry (listed: {})", addr, listed);
        Ok(listed)
    }
}
