use crate::media::{MediaSource, MediaTrack, StreamGuard};
use crate::peer::{PeerConnector, PeerEvent};
use crate::signal::{ConnectionId, Identity};
use std::collections::HashSet;
use std::fmt::Formatter;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::UnboundedReceiver;

/// Negotiation phase of a single participant.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Phase {
    /// No remote participant known.
    Idle,
    /// Paired as the caller, capturing local media before placing the call.
    AwaitingLocalMedia,
    /// Creating and sending the initial offer.
    Offering,
    /// Initial offer sent, waiting for the call-answer.
    AwaitingAnswer,
    /// Paired as the callee, waiting for the call-offer.
    AwaitingRemoteOffer,
    /// Both descriptions applied. Renegotiation happens without leaving this phase.
    Connected,
    /// Remote participant left after the call was established, or this side left.
    Disconnected,
}

impl Phase {
    /// Phases in which a new pairing may start.
    pub fn accepts_pairing(&self) -> bool {
        matches!(self, Phase::Idle | Phase::Disconnected)
    }

    /// Phases in which this side's initial description has already been created, so that
    /// tracks attached now are only negotiated by a later renegotiation.
    pub fn is_offer_pending(&self) -> bool {
        matches!(self, Phase::Offering | Phase::AwaitingAnswer)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePeer {
    pub id: ConnectionId,
    pub identity: Identity,
}

/// Which side of the call this participant plays in the current pairing.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

/// Progress of a renegotiation started by this side while [Phase::Connected].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Renegotiation {
    Stable,
    /// reneg-offer sent. `queued` is set when another renegotiation was requested meanwhile.
    AwaitingAnswer { queued: bool },
}

/// Connection owned by a session together with the subscription to its events. Dropping the
/// link drops the subscription.
pub(crate) struct PeerLink<C> {
    pub(crate) connection: C,
    events: UnboundedReceiver<PeerEvent>,
}

impl<C> PeerLink<C> {
    pub(crate) fn new(connection: C, events: UnboundedReceiver<PeerEvent>) -> Self {
        PeerLink { connection, events }
    }
}

/// State of one participant's side of a call. All resources are exclusively owned: the
/// connection and the local stream are never shared with other sessions.
pub struct NegotiationSession<C, M: MediaSource + ?Sized> {
    pub(crate) phase: Phase,
    pub(crate) role: Option<Role>,
    pub(crate) remote: Option<RemotePeer>,
    pub(crate) renegotiation: Renegotiation,
    /// Set when tracks changed after the initial offer was created. Renegotiates once connected.
    pub(crate) renegotiate_when_connected: bool,
    pub(crate) link: Option<PeerLink<C>>,
    pub(crate) stream: Option<StreamGuard<M>>,
    /// Ids of local tracks already attached to the current connection.
    attached: HashSet<String>,
}

impl<C: PeerConnector, M: MediaSource + ?Sized> NegotiationSession<C, M> {
    pub fn new() -> Self {
        NegotiationSession {
            phase: Phase::Idle,
            role: None,
            remote: None,
            renegotiation: Renegotiation::Stable,
            renegotiate_when_connected: false,
            link: None,
            stream: None,
            attached: HashSet::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn remote(&self) -> Option<&RemotePeer> {
        self.remote.as_ref()
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn renegotiation(&self) -> Renegotiation {
        self.renegotiation
    }

    pub fn has_connection(&self) -> bool {
        self.link.is_some()
    }

    pub fn has_stream(&self) -> bool {
        self.stream.is_some()
    }

    pub(crate) fn connection(&self) -> Option<&C> {
        self.link.as_ref().map(|link| &link.connection)
    }

    /// Tracks of the held local stream not yet attached to the connection.
    pub(crate) fn unattached_tracks(&self) -> Vec<MediaTrack> {
        match &self.stream {
            Some(stream) => stream
                .tracks()
                .iter()
                .filter(|t| !self.attached.contains(t.id()))
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    pub(crate) fn mark_attached(&mut self, track: &MediaTrack) -> bool {
        self.attached.insert(track.id().to_owned())
    }

    pub(crate) fn is_attached(&self, track: &MediaTrack) -> bool {
        self.attached.contains(track.id())
    }

    /// Waits for the next event of the current connection. Never resolves if there is none.
    pub(crate) async fn next_event(&mut self) -> Option<PeerEvent> {
        match &mut self.link {
            Some(link) => link.events.recv().await,
            None => std::future::pending().await,
        }
    }

    pub(crate) fn try_next_event(&mut self) -> Option<PeerEvent> {
        match &mut self.link {
            Some(link) => match link.events.try_recv() {
                Ok(event) => Some(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
            },
            None => None,
        }
    }

    /// Releases the local stream and closes the connection, each at most once, and forgets the
    /// current pairing. The session ends up in `phase`.
    pub(crate) async fn release(&mut self, phase: Phase) {
        if let Some(stream) = self.stream.take() {
            stream.release();
        }
        if let Some(link) = self.link.take() {
            if let Err(e) = link.connection.close().await {
                log::warn!("failed to close peer connection: {}", e);
            }
        }
        self.attached.clear();
        self.remote = None;
        self.role = None;
        self.renegotiation = Renegotiation::Stable;
        self.renegotiate_when_connected = false;
        self.phase = phase;
    }
}

impl<C: PeerConnector, M: MediaSource + ?Sized> Default for NegotiationSession<C, M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C, M: MediaSource + ?Sized> std::fmt::Debug for NegotiationSession<C, M> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiationSession")
            .field("phase", &self.phase)
            .field("role", &self.role)
            .field("remote", &self.remote)
            .field("renegotiation", &self.renegotiation)
            .field("connected", &self.link.is_some())
            .field("stream", &self.stream)
            .finish()
    }
}
