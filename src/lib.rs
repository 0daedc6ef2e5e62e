//! `callroom` negotiates two-party real-time calls on top of [webrtc](https://webrtc.rs):
//! - A [Coordinator] pairs participants who name the same room, and relays their signals to one
//!   another without looking into them. [server::SignalingServer] exposes it over WebSockets.
//! - A [NegotiationEngine] drives one participant through the offer/answer exchange: it captures
//!   local media, places or answers the call, renegotiates when tracks are added, and releases
//!   everything when the other participant goes away.
//!
//! Signals are JSON objects tagged by `"type"`. Initial call setup uses `call-offer` and
//! `call-answer`, renegotiation of an established call uses `reneg-offer` and `reneg-answer`.
//! Session descriptions travel in the browser `{"type": "offer", "sdp": "..."}` shape.
//!
//! # Examples
//!
//! ```rust
//! use callroom::{ClientMessage, Coordinator, Error, LocalTransport, ServerMessage, SignalTransport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let coordinator = Coordinator::new();
//!     let (alice, mut alice_rx) = LocalTransport::connect(&coordinator);
//!     let (bob, mut bob_rx) = LocalTransport::connect(&coordinator);
//!
//!     for (participant, identity) in [(&alice, "alice@example.com"), (&bob, "bob@example.com")] {
//!         participant
//!             .send(ClientMessage::JoinRequest {
//!                 room_id: "room-1".into(),
//!                 identity: identity.into(),
//!             })
//!             .await?;
//!     }
//!
//!     // the participant who waited in the room places the call
//!     match alice_rx.recv().await {
//!         Some(ServerMessage::Joined { peer_identity, initiator, .. }) => {
//!             assert_eq!(peer_identity, "bob@example.com");
//!             assert!(initiator);
//!         }
//!         other => panic!("unexpected {:?}", other),
//!     }
//!     match bob_rx.recv().await {
//!         Some(ServerMessage::Joined { peer_identity, initiator, .. }) => {
//!             assert_eq!(peer_identity, "alice@example.com");
//!             assert!(!initiator);
//!         }
//!         other => panic!("unexpected {:?}", other),
//!     }
//!
//!     // leaving tells the other member
//!     alice.send(ClientMessage::Leave).await?;
//!     assert!(matches!(bob_rx.recv().await, Some(ServerMessage::PeerLeft { .. })));
//!     Ok(())
//! }
//! ```

pub mod coordinator;
pub mod engine;
pub mod error;
pub mod media;
pub mod peer;
pub mod peer_connection;
pub mod room;
pub mod server;
pub mod session;
pub mod signal;
pub mod transport;

#[cfg(test)]
mod mock;

pub use coordinator::Coordinator;
pub use engine::{
    AttachMedia, Command, EngineHandle, EngineOptions, NegotiationEngine, SessionEvent,
    SessionStatus,
};
pub use error::{Conflict, Error};
pub use media::{LocalStream, MediaConstraints, MediaSource, MediaTrack};
pub use peer::{PeerConnectionFactory, PeerConnector, PeerEvent, RemoteTrack};
pub use peer_connection::{Options, WebRtcConnection, WebRtcFactory};
pub use session::{NegotiationSession, Phase, RemotePeer, Role};
pub use signal::{
    ClientMessage, ConnectionId, Identity, RoomId, ServerMessage, SessionDescription, SignalKind,
};
pub use transport::{LocalTransport, SignalTransport, WsTransport};
