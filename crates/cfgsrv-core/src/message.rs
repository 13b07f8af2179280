//! Wire protocol messages exchanged with peers.
//!
//! Every frame is a flat JSON object:
//! `{"op":"connect","type":"request","id":"2","addr":"127.0.0.1:7171"}`.
//! Optional fields are omitted entirely when they don't apply to the
//! operation, never sent as `null` or empty placeholders.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Frame is not a valid message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Operation carried by a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    /// Fetch the shared configuration
    Get,
    /// Register the sender's address as a peer
    Connect,
    /// Heartbeat request sent by the server
    Ping,
    /// Heartbeat answer sent by a peer
    Pong,
    /// Push carrying the current peer list
    PeersChanged,
    /// Push carrying a new configuration (reserved)
    ConfigChanged,
}

/// Role of a message in an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    Push,
}

/// A protocol message.
///
/// Field order matches the wire format clients expect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub op: Op,

    #[serde(rename = "type")]
    pub msg_type: MessageType,

    #[serde(default)]
    pub id: String,

    /// Peer addresses in insertion order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peers: Option<Vec<String>>,

    /// Opaque configuration document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    /// Address being registered by a `connect` request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,
}

impl Message {
    fn new(op: Op, msg_type: MessageType, id: impl Into<String>) -> Self {
        Self {
            op,
            msg_type,
            id: id.into(),
            peers: None,
            config: None,
            timeout: None,
            addr: None,
        }
    }

    /// Create a request message.
    pub fn request(op: Op, id: impl Into<String>) -> Self {
        Self::new(op, MessageType::Request, id)
    }

    /// Create a response with the same operation and ID as `request`.
    pub fn response_to(request: &Message) -> Self {
        Self::new(request.op, MessageType::Response, request.id.clone())
    }

    /// Create a server-initiated push.
    pub fn push(op: Op, id: impl Into<String>) -> Self {
        Self::new(op, MessageType::Push, id)
    }

    pub fn with_peers(mut self, peers: Vec<String>) -> Self {
        self.peers = Some(peers);
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = Some(addr.into());
        self
    }

    /// Serialize to JSON bytes for sending over a connection.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(ProtocolError::Encode)
    }

    /// Parse a message from a raw frame.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encode_str(msg: &Message) -> String {
        String::from_utf8(msg.encode().unwrap()).unwrap()
    }

    #[test]
    fn test_get_response_wire_format() {
        let request = Message::request(Op::Get, "get1");
        let response = Message::response_to(&request).with_config(json!({
            "feature1": {"enable": false},
            "feature2": {"enable": true},
        }));

        assert_eq!(
            encode_str(&response),
            r#"{"op":"get","type":"response","id":"get1","config":{"feature1":{"enable":false},"feature2":{"enable":true}}}"#
        );
    }

    #[test]
    fn test_connect_response_wire_format() {
        let request = Message::request(Op::Connect, "2").with_addr("127.0.0.1:7171");
        let response = Message::response_to(&request)
            .with_config(json!({"feature1": {"enable": false}}))
            .with_peers(vec!["127.0.0.1:7171".into()]);

        assert_eq!(
            encode_str(&response),
            r#"{"op":"connect","type":"response","id":"2","peers":["127.0.0.1:7171"],"config":{"feature1":{"enable":false}}}"#
        );
    }

    #[test]
    fn test_push_omits_absent_fields() {
        let ping = Message::request(Op::Ping, "ping-1");
        assert_eq!(encode_str(&ping), r#"{"op":"ping","type":"request","id":"ping-1"}"#);

        let push = Message::push(Op::PeersChanged, "3").with_peers(vec!["a".into(), "b".into()]);
        assert_eq!(
            encode_str(&push),
            r#"{"op":"peers_changed","type":"push","id":"3","peers":["a","b"]}"#
        );
    }

    #[test]
    fn test_decode_client_request() {
        let msg = Message::decode(
            br#"{"op":"connect","type":"request","id":"req-client-3","addr":"192.168.0.101:7171"}"#,
        )
        .unwrap();

        assert_eq!(msg.op, Op::Connect);
        assert_eq!(msg.msg_type, MessageType::Request);
        assert_eq!(msg.id, "req-client-3");
        assert_eq!(msg.addr.as_deref(), Some("192.168.0.101:7171"));
        assert!(msg.peers.is_none());
        assert!(msg.config.is_none());
    }

    #[test]
    fn test_decode_null_optional_fields() {
        let msg =
            Message::decode(br#"{"op":"pong","type":"response","id":"7","peers":null}"#).unwrap();
        assert_eq!(msg.op, Op::Pong);
        assert!(msg.peers.is_none());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            Message::decode(b"not json at all"),
            Err(ProtocolError::Decode(_))
        ));
        assert!(Message::decode(br#"{"op":"explode","type":"request","id":"1"}"#).is_err());
        assert!(Message::decode(br#"{"type":"request","id":"1"}"#).is_err());
    }
}
