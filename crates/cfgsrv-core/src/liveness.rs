//! Per-peer liveness state.
//!
//! A peer is `Responsive` from the moment it connects. Only two events move
//! it: a pong (stays `Responsive`, heartbeat token re-armed) and expiry of the
//! heartbeat token (becomes `Evicted`). There is no grace period between
//! missing the deadline and eviction.

use std::collections::HashMap;
use std::sync::RwLock;

/// Liveness of a registered peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Answered a heartbeat within the timeout window
    Responsive,
    /// Missed the timeout window and was removed from the peer list
    Evicted,
}

/// Event that can change a peer's liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessEvent {
    PongReceived,
    TokenExpired,
}

impl Liveness {
    /// Next state after `event`.
    ///
    /// An evicted peer stays evicted; it has to connect again to become
    /// responsive.
    pub fn on(self, event: LivenessEvent) -> Liveness {
        match (self, event) {
            (Liveness::Responsive, LivenessEvent::PongReceived) => Liveness::Responsive,
            (Liveness::Responsive, LivenessEvent::TokenExpired) => Liveness::Evicted,
            (Liveness::Evicted, _) => Liveness::Evicted,
        }
    }
}

/// Liveness of every known peer, keyed by address.
#[derive(Debug, Default)]
pub struct LivenessTable {
    peers: RwLock<HashMap<String, Liveness>>,
}

impl LivenessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a peer responsive on connect (or reconnect).
    pub fn register(&self, addr: &str) {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(addr.to_string(), Liveness::Responsive);
    }

    /// Apply a pong. Returns true if the peer's heartbeat token should be
    /// re-armed.
    pub fn pong(&self, addr: &str) -> bool {
        self.apply(addr, LivenessEvent::PongReceived) == Some(Liveness::Responsive)
    }

    /// Apply a token expiry. Returns true if this expiry evicts the peer,
    /// false if it was already evicted.
    ///
    /// A peer with no recorded state is treated as responsive, so a token
    /// that outlives its table entry still evicts. No entry is created for it.
    pub fn expire(&self, addr: &str) -> bool {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        match peers.get_mut(addr) {
            Some(state) => {
                let before = *state;
                *state = before.on(LivenessEvent::TokenExpired);
                before == Liveness::Responsive
            }
            None => true,
        }
    }

    /// Drop all state for a peer that closed or was evicted.
    pub fn forget(&self, addr: &str) {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(addr);
    }

    /// Drop an evicted peer's record. A peer that reconnected since its
    /// eviction is left alone.
    pub fn prune(&self, addr: &str) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        if peers.get(addr) == Some(&Liveness::Evicted) {
            peers.remove(addr);
        }
    }

    pub fn len(&self) -> usize {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self, addr: &str) -> Option<Liveness> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(addr)
            .copied()
    }

    fn apply(&self, addr: &str, event: LivenessEvent) -> Option<Liveness> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let state = peers.get_mut(addr)?;
        *state = state.on(event);
        Some(*state)
    }
}
