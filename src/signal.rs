//! Identifiers and messages exchanged between participants and the room coordinator.
//!
//! Every message is a JSON object tagged by its `"type"` field. Relayed signals carry an opaque
//! `payload` which the coordinator forwards untouched: only the negotiation engines on both ends
//! know that it contains a [SessionDescription].

use crate::error::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Formatter;

/// Identifier of a single transport connection, assigned by the coordinator.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Opaque rendezvous id shared out of band by both participants.
pub type RoomId = String;

/// User supplied identity (ie. an email address) announced to the other participant.
pub type Identity = String;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Rollback,
}

/// Session description in the shape of a browser `RTCSessionDescriptionInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer<S: Into<String>>(sdp: S) -> Self {
        SessionDescription {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer<S: Into<String>>(sdp: S) -> Self {
        SessionDescription {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn rollback() -> Self {
        SessionDescription {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        }
    }

    pub fn to_payload(&self) -> Result<Value, Error> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_payload(payload: &Value) -> Result<Self, Error> {
        Ok(Self::deserialize(payload)?)
    }
}

/// Tag of a relayed signal. Initial call setup and renegotiation use distinct tags, so that both
/// exchanges can be told apart regardless of the order in which they are delivered.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SignalKind {
    CallOffer,
    CallAnswer,
    RenegOffer,
    RenegAnswer,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::CallOffer => "call-offer",
            SignalKind::CallAnswer => "call-answer",
            SignalKind::RenegOffer => "reneg-offer",
            SignalKind::RenegAnswer => "reneg-answer",
        }
    }

    pub fn is_offer(&self) -> bool {
        matches!(self, SignalKind::CallOffer | SignalKind::RenegOffer)
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Messages sent by a participant to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    JoinRequest { room_id: RoomId, identity: Identity },
    CallOffer { payload: Value },
    CallAnswer { payload: Value },
    RenegOffer { payload: Value },
    RenegAnswer { payload: Value },
    Leave,
}

impl ClientMessage {
    pub fn signal(kind: SignalKind, payload: Value) -> Self {
        match kind {
            SignalKind::CallOffer => ClientMessage::CallOffer { payload },
            SignalKind::CallAnswer => ClientMessage::CallAnswer { payload },
            SignalKind::RenegOffer => ClientMessage::RenegOffer { payload },
            SignalKind::RenegAnswer => ClientMessage::RenegAnswer { payload },
        }
    }

    /// Splits a relayable message into its tag and payload. Non-relayable messages are handed
    /// back unchanged.
    pub fn into_signal(self) -> Result<(SignalKind, Value), Self> {
        match self {
            ClientMessage::CallOffer { payload } => Ok((SignalKind::CallOffer, payload)),
            ClientMessage::CallAnswer { payload } => Ok((SignalKind::CallAnswer, payload)),
            ClientMessage::RenegOffer { payload } => Ok((SignalKind::RenegOffer, payload)),
            ClientMessage::RenegAnswer { payload } => Ok((SignalKind::RenegAnswer, payload)),
            other => Err(other),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::JoinRequest { .. } => "join-request",
            ClientMessage::CallOffer { .. } => "call-offer",
            ClientMessage::CallAnswer { .. } => "call-answer",
            ClientMessage::RenegOffer { .. } => "reneg-offer",
            ClientMessage::RenegAnswer { .. } => "reneg-answer",
            ClientMessage::Leave => "leave",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    RoomFull,
    AlreadyJoined,
}

/// Messages sent by the coordinator to a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Pairing complete. `initiator` tells the recipient whether it is expected to place the call.
    Joined {
        peer_id: ConnectionId,
        peer_identity: Identity,
        initiator: bool,
    },
    JoinRejected {
        room_id: RoomId,
        reason: RejectReason,
    },
    CallOffer {
        from: ConnectionId,
        payload: Value,
    },
    CallAnswer {
        from: ConnectionId,
        payload: Value,
    },
    RenegOffer {
        from: ConnectionId,
        payload: Value,
    },
    RenegAnswer {
        from: ConnectionId,
        payload: Value,
    },
    PeerLeft {
        peer_id: ConnectionId,
    },
}

impl ServerMessage {
    pub fn relayed(kind: SignalKind, from: ConnectionId, payload: Value) -> Self {
        match kind {
            SignalKind::CallOffer => ServerMessage::CallOffer { from, payload },
            SignalKind::CallAnswer => ServerMessage::CallAnswer { from, payload },
            SignalKind::RenegOffer => ServerMessage::RenegOffer { from, payload },
            SignalKind::RenegAnswer => ServerMessage::RenegAnswer { from, payload },
        }
    }

    pub fn as_signal(&self) -> Option<(SignalKind, ConnectionId, &Value)> {
        match self {
            ServerMessage::CallOffer { from, payload } => {
                Some((SignalKind::CallOffer, *from, payload))
            }
            ServerMessage::CallAnswer { from, payload } => {
                Some((SignalKind::CallAnswer, *from, payload))
            }
            ServerMessage::RenegOffer { from, payload } => {
                Some((SignalKind::RenegOffer, *from, payload))
            }
            ServerMessage::RenegAnswer { from, payload } => {
                Some((SignalKind::RenegAnswer, *from, payload))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_messages_use_kebab_case_tags() {
        let join = ClientMessage::JoinRequest {
            room_id: "r1".into(),
            identity: "alice@example.com".into(),
        };
        assert_eq!(
            serde_json::to_value(&join).unwrap(),
            json!({"type": "join-request", "room_id": "r1", "identity": "alice@example.com"})
        );
        assert_eq!(
            serde_json::to_value(&ClientMessage::Leave).unwrap(),
            json!({"type": "leave"})
        );

        let parsed: ClientMessage =
            serde_json::from_str(r#"{"type":"reneg-offer","payload":{"x":1}}"#).unwrap();
        assert_eq!(
            parsed.into_signal(),
            Ok((SignalKind::RenegOffer, json!({"x": 1})))
        );
    }

    #[test]
    fn relayed_server_message_carries_sender() {
        let msg = ServerMessage::relayed(SignalKind::CallAnswer, ConnectionId(7), json!("a1"));
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "call-answer", "from": 7, "payload": "a1"})
        );
        let (kind, from, payload) = msg.as_signal().unwrap();
        assert_eq!(kind, SignalKind::CallAnswer);
        assert_eq!(from, ConnectionId(7));
        assert_eq!(payload, &json!("a1"));
    }

    #[test]
    fn session_description_matches_browser_shape() {
        let offer = SessionDescription::offer("v=0");
        let payload = offer.to_payload().unwrap();
        assert_eq!(payload, json!({"type": "offer", "sdp": "v=0"}));
        assert_eq!(SessionDescription::from_payload(&payload).unwrap(), offer);
        assert!(SessionDescription::from_payload(&json!({"sdp": 1})).is_err());
    }
}
