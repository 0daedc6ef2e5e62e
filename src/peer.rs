//! Capabilities of the peer-connection primitive, as consumed by the negotiation engine.
//!
//! [crate::peer_connection] implements them on top of webrtc-rs. The engine itself only sees
//! these traits, which keeps it independent of any concrete media stack.

use crate::error::Error;
use crate::media::MediaTrack;
use crate::signal::SessionDescription;
use async_trait::async_trait;
use std::fmt::Formatter;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;

/// Events raised by a peer connection on its own.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Current descriptions no longer match the set of local tracks.
    NegotiationNeeded,
    RemoteTrack(RemoteTrack),
}

/// Track received from the remote participant.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: RTPCodecType,
    /// Underlying track to read media from, if the connection is backed by webrtc-rs.
    pub track: Option<Arc<TrackRemote>>,
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, Error>;

    /// Creates an answer to the remote offer that was last applied with
    /// [PeerConnector::set_remote_description].
    async fn create_answer(&self) -> Result<SessionDescription, Error>;

    /// Applies a local description and returns the description that should be sent to the
    /// remote side. Implementations which gather candidates may return a description that is
    /// more complete than the one passed in.
    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<SessionDescription, Error>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), Error>;

    async fn add_track(&self, track: MediaTrack) -> Result<(), Error>;

    async fn close(&self) -> Result<(), Error>;
}

/// Creates peer connections. Each connection reports its [PeerEvent]s to the given sender for as
/// long as the receiving side is kept alive.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    type Connection: PeerConnector + 'static;

    async fn create(&self, events: UnboundedSender<PeerEvent>)
        -> Result<Self::Connection, Error>;
}
