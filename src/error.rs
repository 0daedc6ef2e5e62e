use crate::signal::{ConnectionId, RoomId};
use std::sync::Arc;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Signal could not be delivered over the transport. Retrying is up to the transport, the
    /// negotiation protocol itself never resends.
    #[error("signal transport failure: {0}")]
    Transport(String),
    #[error("pairing conflict: {0}")]
    PairingConflict(Conflict),
    /// Local capture device was denied or is unavailable.
    #[error("failed to acquire local media: {0}")]
    MediaAcquisition(String),
    /// Message arrived in a state that cannot handle it.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error(transparent)]
    WebRtc(Arc<webrtc::Error>),
    #[error("malformed signal payload: {0}")]
    Payload(Arc<serde_json::Error>),
}

impl Error {
    pub fn transport<E: std::fmt::Display>(cause: E) -> Self {
        Error::Transport(cause.to_string())
    }

    pub fn protocol_violation<S: Into<String>>(msg: S) -> Self {
        Error::ProtocolViolation(msg.into())
    }

    /// Errors that only affect a single message and must not tear down the session.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::PairingConflict(_) | Error::ProtocolViolation(_) | Error::Payload(_)
        )
    }
}

impl From<webrtc::Error> for Error {
    fn from(value: webrtc::Error) -> Self {
        Error::WebRtc(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Payload(Arc::new(value))
    }
}

impl From<Conflict> for Error {
    fn from(value: Conflict) -> Self {
        Error::PairingConflict(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Conflict {
    #[error("room '{0}' already has two participants")]
    RoomFull(RoomId),
    #[error("connection is already a member of room '{0}'")]
    AlreadyJoined(RoomId),
    #[error("signal from {received} while paired with {expected:?}")]
    StalePeer {
        expected: Option<ConnectionId>,
        received: ConnectionId,
    },
}
