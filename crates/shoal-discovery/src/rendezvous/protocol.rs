//! Rendezvous protocol message definitions.
//!
//! Messages travel as JSON text frames. Application messages carry a free-form
//! `type`, so frames are classified by shape rather than by tag alone:
//!
//! ```text
//! client -> server   {"type":"register","region":"east-asia"}
//!                    {"type":"heartbeat"}
//!                    {"to":"<peer>","type":"offer","data":{..}}        directed
//!                    {"type":"chat","broadcast":{..}}                  broadcast
//! server -> client   {"type":"registered","peerId":"<peer>"}
//!                    {"type":"peers","peers":[{"id":..,"lastSeen":..}]}
//!                    {"from":"<peer>","type":"offer","data":{..}}      directed
//!                    {"from":"<peer>","type":"chat","broadcast":{..}}  broadcast
//!                    {"type":"error","code":"peer-not-found","to":..}
//! ```

use crate::peer::{PeerId, PeerRecord};
use crate::region::RegionId;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Rendezvous errors
#[derive(Debug, Error)]
pub enum RendezvousError {
    /// Operation requires a connected session
    #[error("Not connected to rendezvous server")]
    NotConnected,

    /// Server rejected or never acknowledged registration
    #[error("Registration failed: {0}")]
    Registration(String),

    /// Connection closed by the remote side
    #[error("Connection closed")]
    ConnectionClosed,

    /// Malformed or unrecognized message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// WebSocket transport failure
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Network I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Handshake or registration timed out
    #[error("Connection timeout")]
    Timeout,

    /// Message could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for RendezvousError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        RendezvousError::WebSocket(err.to_string())
    }
}

/// Error codes the server reports to a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    /// Directed message recipient is not connected
    PeerNotFound,
    /// Frame could not be understood
    InvalidMessage,
    /// First frame was not a registration
    NotRegistered,
}

/// Messages a client sends
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Request a session id
    Register {
        /// Region to announce to other peers
        region: Option<RegionId>,
    },
    /// Liveness signal
    Heartbeat,
    /// Message for one named peer
    Directed {
        /// Recipient
        to: PeerId,
        /// Application message type
        kind: String,
        /// Application payload
        data: Value,
    },
    /// Message for every other connected peer
    Broadcast {
        /// Application message type
        kind: String,
        /// Application payload
        payload: Value,
    },
}

/// Messages the server sends
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Registration accepted
    Registered {
        /// Assigned session id
        peer_id: PeerId,
    },
    /// Current live peer set
    Peers {
        /// Known peers with last activity
        peers: Vec<PeerRecord>,
    },
    /// Relayed directed message
    Directed {
        /// Sender, stamped by the server
        from: PeerId,
        /// Application message type
        kind: String,
        /// Application payload
        data: Value,
    },
    /// Relayed broadcast
    Broadcast {
        /// Sender, stamped by the server
        from: PeerId,
        /// Application message type
        kind: String,
        /// Application payload
        payload: Value,
    },
    /// Error notice
    Error {
        /// Error code
        code: ErrorCode,
        /// Human-readable detail
        message: String,
        /// Recipient of the failed directed message
        to: Option<PeerId>,
    },
}

/// Wire form of a peer-list entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePeer {
    id: PeerId,
    last_seen: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    region: Option<RegionId>,
}

/// Superset of every frame's fields
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    from: Option<PeerId>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    broadcast: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    peers: Option<Vec<WirePeer>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    peer_id: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    region: Option<RegionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

/// `Some` whenever the key is present, so an explicit `null` payload is kept
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl Envelope {
    fn parse(text: &str) -> Result<Self, RendezvousError> {
        serde_json::from_str(text).map_err(|e| RendezvousError::Protocol(e.to_string()))
    }

    fn encode(&self) -> Result<String, RendezvousError> {
        serde_json::to_string(self).map_err(|e| RendezvousError::Serialization(e.to_string()))
    }

    fn require_kind(&mut self) -> Result<String, RendezvousError> {
        self.kind
            .take()
            .ok_or_else(|| RendezvousError::Protocol("missing type".to_string()))
    }
}

impl ClientMessage {
    /// Encode as a JSON text frame
    pub fn to_text(&self) -> Result<String, RendezvousError> {
        let envelope = match self {
            ClientMessage::Register { region } => Envelope {
                kind: Some("register".to_string()),
                region: *region,
                ..Envelope::default()
            },
            ClientMessage::Heartbeat => Envelope {
                kind: Some("heartbeat".to_string()),
                ..Envelope::default()
            },
            ClientMessage::Directed { to, kind, data } => Envelope {
                kind: Some(kind.clone()),
                to: Some(to.clone()),
                data: Some(data.clone()),
                ..Envelope::default()
            },
            ClientMessage::Broadcast { kind, payload } => Envelope {
                kind: Some(kind.clone()),
                broadcast: Some(payload.clone()),
                ..Envelope::default()
            },
        };
        envelope.encode()
    }

    /// Decode a JSON text frame
    ///
    /// Any `from` field supplied by a client is ignored.
    pub fn from_text(text: &str) -> Result<Self, RendezvousError> {
        let mut envelope = Envelope::parse(text)?;
        let kind = envelope.require_kind()?;

        if let Some(to) = envelope.to {
            return Ok(ClientMessage::Directed {
                to,
                kind,
                data: envelope.data.unwrap_or(Value::Null),
            });
        }
        if let Some(payload) = envelope.broadcast {
            return Ok(ClientMessage::Broadcast { kind, payload });
        }
        match kind.as_str() {
            "register" => Ok(ClientMessage::Register {
                region: envelope.region,
            }),
            "heartbeat" => Ok(ClientMessage::Heartbeat),
            other => Err(RendezvousError::Protocol(format!(
                "unrecognized message type: {other}"
            ))),
        }
    }

    /// Message type name, for logs
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            ClientMessage::Register { .. } => "Register",
            ClientMessage::Heartbeat => "Heartbeat",
            ClientMessage::Directed { .. } => "Directed",
            ClientMessage::Broadcast { .. } => "Broadcast",
        }
    }
}

impl ServerMessage {
    /// Encode as a JSON text frame
    pub fn to_text(&self) -> Result<String, RendezvousError> {
        let envelope = match self {
            ServerMessage::Registered { peer_id } => Envelope {
                kind: Some("registered".to_string()),
                peer_id: Some(peer_id.clone()),
                ..Envelope::default()
            },
            ServerMessage::Peers { peers } => Envelope {
                kind: Some("peers".to_string()),
                peers: Some(
                    peers
                        .iter()
                        .map(|p| WirePeer {
                            id: p.peer_id.clone(),
                            last_seen: p.last_seen,
                            region: p.region,
                        })
                        .collect(),
                ),
                ..Envelope::default()
            },
            ServerMessage::Directed { from, kind, data } => Envelope {
                kind: Some(kind.clone()),
                from: Some(from.clone()),
                data: Some(data.clone()),
                ..Envelope::default()
            },
            ServerMessage::Broadcast {
                from,
                kind,
                payload,
            } => Envelope {
                kind: Some(kind.clone()),
                from: Some(from.clone()),
                broadcast: Some(payload.clone()),
                ..Envelope::default()
            },
            ServerMessage::Error { code, message, to } => Envelope {
                kind: Some("error".to_string()),
                code: Some(*code),
                message: Some(message.clone()),
                to: to.clone(),
                ..Envelope::default()
            },
        };
        envelope.encode()
    }

    /// Decode a JSON text frame
    pub fn from_text(text: &str) -> Result<Self, RendezvousError> {
        let mut envelope = Envelope::parse(text)?;
        let kind = envelope.require_kind()?;

        if let Some(from) = envelope.from {
            return Ok(match envelope.broadcast {
                Some(payload) => ServerMessage::Broadcast {
                    from,
                    kind,
                    payload,
                },
                None => ServerMessage::Directed {
                    from,
                    kind,
                    data: envelope.data.unwrap_or(Value::Null),
                },
            });
        }
        match kind.as_str() {
            "registered" => envelope
                .peer_id
                .map(|peer_id| ServerMessage::Registered { peer_id })
                .ok_or_else(|| RendezvousError::Protocol("registered without peerId".into())),
            "peers" => Ok(ServerMessage::Peers {
                peers: envelope
                    .peers
                    .unwrap_or_default()
                    .into_iter()
                    .map(|p| PeerRecord::new(p.id, p.last_seen, p.region))
                    .collect(),
            }),
            "error" => Ok(ServerMessage::Error {
                code: envelope.code.unwrap_or(ErrorCode::InvalidMessage),
                message: envelope.message.unwrap_or_default(),
                to: envelope.to,
            }),
            other => Err(RendezvousError::Protocol(format!(
                "unrecognized message type: {other}"
            ))),
        }
    }

    /// Message type name, for logs
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            ServerMessage::Registered { .. } => "Registered",
            ServerMessage::Peers { .. } => "Peers",
            ServerMessage::Directed { .. } => "Directed",
            ServerMessage::Broadcast { .. } => "Broadcast",
            ServerMessage::Error { .. } => "Error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_wire_shape() {
        let text = ClientMessage::Register { region: None }.to_text().unwrap();
        assert_eq!(text, r#"{"type":"register"}"#);

        let with_region = ClientMessage::Register {
            region: Some(RegionId::EastAsia),
        };
        let text = with_region.to_text().unwrap();
        assert_eq!(text, r#"{"type":"register","region":"east-asia"}"#);
        assert_eq!(ClientMessage::from_text(&text).unwrap(), with_region);
    }

    #[test]
    fn test_directed_wire_shape() {
        let msg = ClientMessage::Directed {
            to: PeerId::new("b"),
            kind: "offer".to_string(),
            data: json!({"sdp": "v=0"}),
        };
        let value: Value = serde_json::from_str(&msg.to_text().unwrap()).unwrap();
        assert_eq!(value, json!({"to": "b", "type": "offer", "data": {"sdp": "v=0"}}));
    }

    #[test]
    fn test_broadcast_wire_shape() {
        let msg = ClientMessage::Broadcast {
            kind: "announce".to_string(),
            payload: json!([1, 2, 3]),
        };
        let value: Value = serde_json::from_str(&msg.to_text().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "announce", "broadcast": [1, 2, 3]}));
    }

    #[test]
    fn test_null_broadcast_payload_survives() {
        let sent = ClientMessage::Broadcast {
            kind: "ping".to_string(),
            payload: Value::Null,
        };
        let text = sent.to_text().unwrap();
        assert_eq!(text, r#"{"type":"ping","broadcast":null}"#);
        assert_eq!(ClientMessage::from_text(&text).unwrap(), sent);

        let relayed = ServerMessage::Broadcast {
            from: PeerId::new("a"),
            kind: "ping".to_string(),
            payload: Value::Null,
        };
        let text = relayed.to_text().unwrap();
        assert_eq!(ServerMessage::from_text(&text).unwrap(), relayed);

        // Without the key it is still a directed message
        assert!(matches!(
            ServerMessage::from_text(r#"{"from":"a","type":"ping"}"#).unwrap(),
            ServerMessage::Directed { data: Value::Null, .. }
        ));
    }

    #[test]
    fn test_client_from_field_ignored() {
        let text = r#"{"from":"spoofed","to":"b","type":"offer","data":1}"#;
        let msg = ClientMessage::from_text(text).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Directed {
                to: PeerId::new("b"),
                kind: "offer".to_string(),
                data: json!(1),
            }
        );
    }

    #[test]
    fn test_directed_named_like_control_message() {
        // An application type that collides with a control name is still directed
        let text = r#"{"to":"b","type":"register","data":null}"#;
        assert!(matches!(
            ClientMessage::from_text(text).unwrap(),
            ClientMessage::Directed { .. }
        ));
    }

    #[test]
    fn test_peers_wire_shape() {
        let msg = ServerMessage::Peers {
            peers: vec![
                PeerRecord::new(PeerId::new("a"), 1000, None),
                PeerRecord::new(PeerId::new("b"), 2000, Some(RegionId::EuropeWest)),
            ],
        };
        let text = msg.to_text().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({"type": "peers", "peers": [
                {"id": "a", "lastSeen": 1000},
                {"id": "b", "lastSeen": 2000, "region": "europe-west"}
            ]})
        );
        assert_eq!(ServerMessage::from_text(&text).unwrap(), msg);
    }

    #[test]
    fn test_server_relayed_messages_decode() {
        let directed = ServerMessage::from_text(r#"{"from":"a","type":"offer","data":"x"}"#).unwrap();
        assert_eq!(
            directed,
            ServerMessage::Directed {
                from: PeerId::new("a"),
                kind: "offer".to_string(),
                data: json!("x"),
            }
        );

        let broadcast =
            ServerMessage::from_text(r#"{"from":"a","type":"chat","broadcast":{"m":1}}"#).unwrap();
        assert!(matches!(broadcast, ServerMessage::Broadcast { ref kind, .. } if kind == "chat"));
    }

    #[test]
    fn test_registered_and_error_decode() {
        let registered = ServerMessage::Registered {
            peer_id: PeerId::new("abc"),
        };
        let text = registered.to_text().unwrap();
        assert_eq!(text, r#"{"type":"registered","peerId":"abc"}"#);
        assert_eq!(ServerMessage::from_text(&text).unwrap(), registered);

        let error = ServerMessage::Error {
            code: ErrorCode::PeerNotFound,
            message: "gone".to_string(),
            to: Some(PeerId::new("zz")),
        };
        let decoded = ServerMessage::from_text(&error.to_text().unwrap()).unwrap();
        assert_eq!(decoded, error);
    }

    #[test]
    fn test_malformed_frames_rejected() {
        assert!(matches!(
            ClientMessage::from_text("not json"),
            Err(RendezvousError::Protocol(_))
        ));
        assert!(matches!(
            ClientMessage::from_text(r#"{"data":1}"#),
            Err(RendezvousError::Protocol(_))
        ));
        assert!(matches!(
            ClientMessage::from_text(r#"{"type":"dance"}"#),
            Err(RendezvousError::Protocol(_))
        ));
        assert!(matches!(
            ServerMessage::from_text(r#"{"type":"registered"}"#),
            Err(RendezvousError::Protocol(_))
        ));
    }

    #[test]
    fn test_message_type_names() {
        assert_eq!(ClientMessage::Heartbeat.message_type(), "Heartbeat");
        assert_eq!(
            ServerMessage::Peers { peers: vec![] }.message_type(),
            "Peers"
        );
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            RendezvousError::NotConnected.to_string(),
            "Not connected to rendezvous server"
        );
        assert_eq!(RendezvousError::Timeout.to_string(), "Connection timeout");
    }
}
