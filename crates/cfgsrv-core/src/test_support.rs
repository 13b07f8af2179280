//! Shared fixtures for unit tests.

use crate::message::{Message, Op};
use crate::transport::{Conn, ConnId, TransportError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Connection that records every frame sent to it.
#[derive(Debug)]
pub struct RecordingConn {
    id: ConnId,
    sent: Mutex<Vec<Vec<u8>>>,
    closed: AtomicBool,
}

impl RecordingConn {
    pub fn new(id: ConnId) -> Arc<Self> {
        Arc::new(Self {
            id,
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Make every later send fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Decoded frames sent so far.
    pub fn messages(&self) -> Vec<Message> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|data| Message::decode(data).expect("sent frame should decode"))
            .collect()
    }

    /// Peer lists of every `peers_changed` push received so far.
    pub fn peer_pushes(&self) -> Vec<Vec<String>> {
        self.messages()
            .into_iter()
            .filter(|m| m.op == Op::PeersChanged)
            .map(|m| m.peers.unwrap_or_default())
            .collect()
    }

    pub fn count(&self, op: Op) -> usize {
        self.messages().iter().filter(|m| m.op == op).count()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

impl Conn for RecordingConn {
    fn id(&self) -> ConnId {
        self.id
    }

    fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed(self.id));
        }
        self.sent.lock().unwrap().push(data);
        Ok(())
    }
}

pub fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}
