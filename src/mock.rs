//! In-memory stand-ins for capture devices and peer connections, used by the tests.

use crate::error::Error;
use crate::media::{LocalStream, MediaConstraints, MediaSource, MediaTrack};
use crate::peer::{PeerConnectionFactory, PeerConnector, PeerEvent, RemoteTrack};
use crate::signal::{SdpKind, SessionDescription};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::UnboundedSender;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

/// Media source handing out sample tracks named `mic` and `cam`.
#[derive(Debug, Default)]
pub struct MockMedia {
    acquired: AtomicUsize,
    released: AtomicUsize,
    fail: AtomicBool,
}

impl MockMedia {
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Makes the next acquisition fail as if the user denied access.
    pub fn fail_next(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaSource for MockMedia {
    async fn acquire_local_stream(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalStream, Error> {
        if self.fail.swap(false, Ordering::SeqCst) {
            return Err(Error::MediaAcquisition("permission denied".into()));
        }
        let n = self.acquired.fetch_add(1, Ordering::SeqCst) + 1;
        let stream_id = format!("local-{}", n);
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MediaTrack::audio("mic", &stream_id));
        }
        if constraints.video {
            tracks.push(MediaTrack::video("cam", &stream_id));
        }
        Ok(LocalStream::new(stream_id, tracks))
    }

    fn release(&self, _stream: LocalStream) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Factory of [MockConnection]s. Clones share the record of created connections.
#[derive(Clone)]
pub struct MockFactory {
    label: Arc<str>,
    connections: Arc<Mutex<Vec<MockConnection>>>,
    closed: Arc<AtomicUsize>,
}

impl MockFactory {
    /// `label` prefixes every description produced by connections of this factory.
    pub fn new(label: &str) -> Self {
        MockFactory {
            label: label.into(),
            connections: Arc::default(),
            closed: Arc::default(),
        }
    }

    /// Connection created `index`-th by this factory.
    pub fn connection(&self, index: usize) -> MockConnection {
        lock(&self.connections)[index].clone()
    }

    pub fn created(&self) -> usize {
        lock(&self.connections).len()
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnectionFactory for MockFactory {
    type Connection = MockConnection;

    async fn create(&self, events: UnboundedSender<PeerEvent>) -> Result<MockConnection, Error> {
        let connection = MockConnection {
            label: self.label.clone(),
            events,
            closed: self.closed.clone(),
            state: Arc::default(),
        };
        lock(&self.connections).push(connection.clone());
        Ok(connection)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
enum Signaling {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

#[derive(Default)]
struct State {
    signaling: Signaling,
    generation: usize,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    /// Descriptions to restore on rollback.
    stable_local: Option<SessionDescription>,
    stable_remote: Option<SessionDescription>,
    tracks: Vec<MediaTrack>,
    rollbacks: usize,
    closed: bool,
    reject_remote: bool,
    reject_answer: bool,
}

/// Peer connection following the offer/answer state machine without any networking. Produced
/// descriptions are `{label}:{offer|answer}:{n}`, `n` counting every description it created.
///
/// Negotiation is requested whenever a track is added while both descriptions are applied and
/// signaling is stable.
#[derive(Clone)]
pub struct MockConnection {
    label: Arc<str>,
    events: UnboundedSender<PeerEvent>,
    closed: Arc<AtomicUsize>,
    state: Arc<Mutex<State>>,
}

impl MockConnection {
    pub fn local(&self) -> Option<SessionDescription> {
        lock(&self.state).local.clone()
    }

    pub fn remote(&self) -> Option<SessionDescription> {
        lock(&self.state).remote.clone()
    }

    pub fn tracks(&self) -> Vec<MediaTrack> {
        lock(&self.state).tracks.clone()
    }

    pub fn rollbacks(&self) -> usize {
        lock(&self.state).rollbacks
    }

    /// Makes the next [PeerConnector::set_remote_description] fail without changing state.
    pub fn reject_next_remote(&self) {
        lock(&self.state).reject_remote = true;
    }

    /// Makes the next [PeerConnector::create_answer] fail.
    pub fn reject_next_answer(&self) {
        lock(&self.state).reject_answer = true;
    }

    pub fn emit_remote_track(&self, id: &str, kind: RTPCodecType) {
        let _ = self.events.send(PeerEvent::RemoteTrack(RemoteTrack {
            id: id.to_owned(),
            stream_id: format!("{}-remote", self.label),
            kind,
            track: None,
        }));
    }

    fn describe(&self, kind: SdpKind) -> SessionDescription {
        let mut state = lock(&self.state);
        state.generation += 1;
        let sdp = match kind {
            SdpKind::Offer => format!("{}:offer:{}", self.label, state.generation),
            _ => format!("{}:answer:{}", self.label, state.generation),
        };
        SessionDescription { kind, sdp }
    }
}

fn invalid_state(op: &str, signaling: Signaling) -> Error {
    Error::protocol_violation(format!("{} is invalid in {:?}", op, signaling))
}

#[async_trait]
impl PeerConnector for MockConnection {
    async fn create_offer(&self) -> Result<SessionDescription, Error> {
        Ok(self.describe(SdpKind::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, Error> {
        {
            let mut state = lock(&self.state);
            if std::mem::take(&mut state.reject_answer) {
                return Err(Error::protocol_violation("answer could not be created"));
            }
            if state.signaling != Signaling::HaveRemoteOffer {
                return Err(invalid_state("create_answer", state.signaling));
            }
        }
        Ok(self.describe(SdpKind::Answer))
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<SessionDescription, Error> {
        let mut state = lock(&self.state);
        match (desc.kind, state.signaling) {
            (SdpKind::Offer, Signaling::Stable) | (SdpKind::Offer, Signaling::HaveLocalOffer) => {
                if state.signaling == Signaling::Stable {
                    state.stable_local = state.local.clone();
                }
                state.signaling = Signaling::HaveLocalOffer;
                state.local = Some(desc.clone());
            }
            (SdpKind::Answer, Signaling::HaveRemoteOffer) => {
                state.signaling = Signaling::Stable;
                state.local = Some(desc.clone());
            }
            (SdpKind::Rollback, Signaling::HaveLocalOffer) => {
                state.signaling = Signaling::Stable;
                state.local = state.stable_local.take();
                state.rollbacks += 1;
            }
            (_, signaling) => return Err(invalid_state("set_local_description", signaling)),
        }
        Ok(desc)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), Error> {
        let mut state = lock(&self.state);
        if std::mem::take(&mut state.reject_remote) {
            return Err(Error::protocol_violation(format!(
                "remote description '{}' rejected",
                desc.sdp
            )));
        }
        match (desc.kind, state.signaling) {
            (SdpKind::Offer, Signaling::Stable) => {
                state.signaling = Signaling::HaveRemoteOffer;
                state.stable_remote = state.remote.clone();
                state.remote = Some(desc);
            }
            (SdpKind::Answer, Signaling::HaveLocalOffer) => {
                state.signaling = Signaling::Stable;
                state.remote = Some(desc);
            }
            (SdpKind::Rollback, Signaling::HaveRemoteOffer) => {
                state.signaling = Signaling::Stable;
                state.remote = state.stable_remote.take();
                state.rollbacks += 1;
            }
            (_, signaling) => return Err(invalid_state("set_remote_description", signaling)),
        }
        Ok(())
    }

    async fn add_track(&self, track: MediaTrack) -> Result<(), Error> {
        let mut state = lock(&self.state);
        if state.tracks.iter().any(|t| t.id() == track.id()) {
            return Err(Error::protocol_violation(format!(
                "track {} already added",
                track.id()
            )));
        }
        state.tracks.push(track);
        let negotiated = state.local.is_some() && state.remote.is_some();
        if negotiated && state.signaling == Signaling::Stable {
            let _ = self.events.send(PeerEvent::NegotiationNeeded);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        let mut state = lock(&self.state);
        if !state.closed {
            state.closed = true;
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap()
}
