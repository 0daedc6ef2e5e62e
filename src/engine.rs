//! Negotiation engine: one participant's side of the call setup protocol.
//!
//! The engine reacts to three sources of events, one at a time:
//! - messages relayed by the coordinator ([NegotiationEngine::handle_message]),
//! - events raised by its own peer connection ([NegotiationEngine::handle_peer_event]),
//! - commands from the application ([NegotiationEngine::add_track], [NegotiationEngine::leave]...).
//!
//! [NegotiationEngine::run] multiplexes all three in a loop, while [EngineHandle] lets the
//! application send commands and observe the current [Phase] from elsewhere.

use crate::error::{Conflict, Error};
use crate::media::{MediaConstraints, MediaSource, MediaTrack, StreamGuard};
use crate::peer::{PeerConnectionFactory, PeerConnector, PeerEvent, RemoteTrack};
use crate::session::{NegotiationSession, PeerLink, Phase, RemotePeer, Renegotiation, Role};
use crate::signal::{
    ClientMessage, ConnectionId, Identity, RejectReason, RoomId, SdpKind, ServerMessage,
    SessionDescription, SignalKind,
};
use crate::transport::SignalTransport;
use arc_swap::ArcSwap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// When local tracks get attached to the peer connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AttachMedia {
    /// Attached before the initial offer or answer is created.
    OnSetup,
    /// Held until [Command::SendStreams] is issued once connected, which renegotiates.
    OnDemand,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub constraints: MediaConstraints,
    pub attach_media: AttachMedia,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            constraints: MediaConstraints::default(),
            attach_media: AttachMedia::OnSetup,
        }
    }
}

/// Notifications published to the application.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    PhaseChanged(Phase),
    Paired {
        peer_id: ConnectionId,
        peer_identity: Identity,
        role: Role,
    },
    JoinRejected {
        room_id: RoomId,
        reason: RejectReason,
    },
    RemoteTrack(RemoteTrack),
    PeerLeft(ConnectionId),
    MediaFailure(Error),
}

/// Snapshot of a session, readable without going through the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub phase: Phase,
    pub remote: Option<RemotePeer>,
    pub renegotiating: bool,
}

impl Default for SessionStatus {
    fn default() -> Self {
        SessionStatus {
            phase: Phase::Idle,
            remote: None,
            renegotiating: false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Command {
    AddTrack(MediaTrack),
    SendStreams,
    Leave,
}

/// Handle used to drive an engine running its [NegotiationEngine::run] loop.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: UnboundedSender<Command>,
    status: Arc<ArcSwap<SessionStatus>>,
}

impl EngineHandle {
    pub fn status(&self) -> Arc<SessionStatus> {
        self.status.load_full()
    }

    pub fn phase(&self) -> Phase {
        self.status.load().phase
    }

    pub fn add_track(&self, track: MediaTrack) -> Result<(), Error> {
        self.send(Command::AddTrack(track))
    }

    pub fn send_streams(&self) -> Result<(), Error> {
        self.send(Command::SendStreams)
    }

    pub fn leave(&self) -> Result<(), Error> {
        self.send(Command::Leave)
    }

    fn send(&self, cmd: Command) -> Result<(), Error> {
        self.commands
            .send(cmd)
            .map_err(|_| Error::transport("negotiation engine has stopped"))
    }
}

pub struct NegotiationEngine<T, F, M>
where
    T: SignalTransport,
    F: PeerConnectionFactory,
    M: MediaSource + ?Sized,
{
    transport: T,
    factory: F,
    media: Arc<M>,
    options: EngineOptions,
    session: NegotiationSession<F::Connection, M>,
    status: Arc<ArcSwap<SessionStatus>>,
    events: UnboundedSender<SessionEvent>,
    commands: UnboundedReceiver<Command>,
    command_sender: UnboundedSender<Command>,
}

impl<T, F, M> NegotiationEngine<T, F, M>
where
    T: SignalTransport,
    F: PeerConnectionFactory,
    M: MediaSource + ?Sized,
{
    /// Creates an idle engine. The returned receiver yields every [SessionEvent] it publishes.
    pub fn new(
        transport: T,
        factory: F,
        media: Arc<M>,
        options: EngineOptions,
    ) -> (Self, UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = unbounded_channel();
        let (command_sender, commands) = unbounded_channel();
        let engine = NegotiationEngine {
            transport,
            factory,
            media,
            options,
            session: NegotiationSession::new(),
            status: Arc::new(ArcSwap::from_pointee(SessionStatus::default())),
            events,
            commands,
            command_sender,
        };
        (engine, events_rx)
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            commands: self.command_sender.clone(),
            status: self.status.clone(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.session.phase()
    }

    pub fn session(&self) -> &NegotiationSession<F::Connection, M> {
        &self.session
    }

    /// Asks the coordinator to place this participant in `room_id` under `identity`.
    pub async fn join(&mut self, room_id: RoomId, identity: Identity) -> Result<(), Error> {
        log::info!("joining room '{}' as {}", room_id, identity);
        self.transport
            .send(ClientMessage::JoinRequest { room_id, identity })
            .await
    }

    /// Handles a single message delivered by the coordinator.
    pub async fn handle_message(&mut self, msg: ServerMessage) -> Result<(), Error> {
        match msg {
            ServerMessage::Joined {
                peer_id,
                peer_identity,
                initiator,
            } => self.on_joined(peer_id, peer_identity, initiator).await,
            ServerMessage::JoinRejected { room_id, reason } => {
                self.emit(SessionEvent::JoinRejected {
                    room_id: room_id.clone(),
                    reason,
                });
                Err(match reason {
                    RejectReason::RoomFull => Conflict::RoomFull(room_id),
                    RejectReason::AlreadyJoined => Conflict::AlreadyJoined(room_id),
                }
                .into())
            }
            ServerMessage::PeerLeft { peer_id } => self.on_peer_left(peer_id).await,
            ServerMessage::CallOffer { from, payload } => {
                let offer = self.accept_signal(SignalKind::CallOffer, from, &payload)?;
                self.on_call_offer(offer).await
            }
            ServerMessage::CallAnswer { from, payload } => {
                let answer = self.accept_signal(SignalKind::CallAnswer, from, &payload)?;
                self.on_call_answer(answer).await
            }
            ServerMessage::RenegOffer { from, payload } => {
                let offer = self.accept_signal(SignalKind::RenegOffer, from, &payload)?;
                self.on_reneg_offer(offer).await
            }
            ServerMessage::RenegAnswer { from, payload } => {
                let answer = self.accept_signal(SignalKind::RenegAnswer, from, &payload)?;
                self.on_reneg_answer(answer).await
            }
        }
    }

    /// Handles an event raised by the current peer connection.
    pub async fn handle_peer_event(&mut self, event: PeerEvent) -> Result<(), Error> {
        match event {
            PeerEvent::NegotiationNeeded => {
                if self.session.phase == Phase::Connected {
                    self.renegotiate().await
                } else {
                    // tracks attached after the initial offer are flagged by add_track
                    log::debug!("negotiation needed during {}, ignored", self.session.phase);
                    Ok(())
                }
            }
            PeerEvent::RemoteTrack(track) => {
                log::info!("received remote {} track {}", track.kind, track.id);
                self.emit(SessionEvent::RemoteTrack(track));
                Ok(())
            }
        }
    }

    /// Attaches an extra local track. The connection then asks for renegotiation.
    pub async fn add_track(&mut self, track: MediaTrack) -> Result<(), Error> {
        if self.session.is_attached(&track) {
            return Ok(());
        }
        let connection = self
            .session
            .connection()
            .ok_or_else(|| Error::protocol_violation("no peer connection to add a track to"))?;
        connection.add_track(track.clone()).await?;
        self.session.mark_attached(&track);
        if self.session.phase.is_offer_pending() {
            log::debug!(
                "track {} added during {}, renegotiating once connected",
                track.id(),
                self.session.phase
            );
            self.session.renegotiate_when_connected = true;
        }
        Ok(())
    }

    /// Attaches every track of the local stream which is not attached yet.
    pub async fn send_streams(&mut self) -> Result<(), Error> {
        if self.session.phase != Phase::Connected {
            return Err(Error::protocol_violation(format!(
                "cannot send streams during {}",
                self.session.phase
            )));
        }
        self.attach_local_tracks().await
    }

    /// Leaves the room and releases every resource held by the session.
    pub async fn leave(&mut self) -> Result<(), Error> {
        let sent = self.transport.send(ClientMessage::Leave).await;
        self.reset(Phase::Disconnected).await;
        sent
    }

    /// Drives the engine until the application leaves or the signal channel closes.
    pub async fn run(mut self, mut incoming: UnboundedReceiver<ServerMessage>) -> Result<(), Error> {
        loop {
            tokio::select! {
                msg = incoming.recv() => match msg {
                    Some(msg) => {
                        let res = self.handle_message(msg).await;
                        self.absorb(res)?;
                    }
                    None => {
                        log::info!("signal channel closed");
                        self.reset(Phase::Disconnected).await;
                        return Err(Error::transport("signal channel closed"));
                    }
                },
                Some(event) = self.session.next_event() => {
                    let res = self.handle_peer_event(event).await;
                    self.absorb(res)?;
                }
                Some(cmd) = self.commands.recv() => match cmd {
                    Command::AddTrack(track) => {
                        let res = self.add_track(track).await;
                        self.absorb(res)?;
                    }
                    Command::SendStreams => {
                        let res = self.send_streams().await;
                        self.absorb(res)?;
                    }
                    Command::Leave => return self.leave().await,
                },
            }
        }
    }

    /// Decides whether an error ends the run loop. Only transport failures do.
    fn absorb(&mut self, res: Result<(), Error>) -> Result<(), Error> {
        match res {
            Ok(()) => Ok(()),
            Err(e @ Error::Transport(_)) => Err(e),
            Err(e @ Error::MediaAcquisition(_)) => {
                log::warn!("{}", e);
                self.emit(SessionEvent::MediaFailure(e));
                Ok(())
            }
            Err(e) if e.is_recoverable() => {
                log::warn!("dropped signal: {}", e);
                Ok(())
            }
            Err(e) => {
                log::error!("negotiation failed: {}", e);
                Ok(())
            }
        }
    }

    async fn on_joined(
        &mut self,
        peer_id: ConnectionId,
        peer_identity: Identity,
        initiator: bool,
    ) -> Result<(), Error> {
        if !self.session.phase.accepts_pairing() {
            return Err(Error::protocol_violation(format!(
                "joined with {} during {}",
                peer_id, self.session.phase
            )));
        }
        let role = if initiator { Role::Caller } else { Role::Callee };
        let (tx, rx) = unbounded_channel();
        let connection = self.factory.create(tx).await?;
        self.session.link = Some(PeerLink::new(connection, rx));
        self.session.remote = Some(RemotePeer {
            id: peer_id,
            identity: peer_identity.clone(),
        });
        self.session.role = Some(role);
        log::info!("paired with {} ({}) as {:?}", peer_id, peer_identity, role);
        self.emit(SessionEvent::Paired {
            peer_id,
            peer_identity,
            role,
        });

        match role {
            Role::Caller => {
                self.transition(Phase::AwaitingLocalMedia);
                self.place_call().await
            }
            Role::Callee => {
                self.transition(Phase::AwaitingRemoteOffer);
                Ok(())
            }
        }
    }

    async fn place_call(&mut self) -> Result<(), Error> {
        if let Err(e) = self.acquire_media().await {
            self.reset(Phase::Idle).await;
            return Err(e);
        }
        self.transition(Phase::Offering);
        let res = self.send_offer(SignalKind::CallOffer).await;
        if let Err(e) = res {
            self.reset(Phase::Idle).await;
            return Err(e);
        }
        self.transition(Phase::AwaitingAnswer);
        Ok(())
    }

    async fn on_call_offer(&mut self, offer: SessionDescription) -> Result<(), Error> {
        self.expect_phase(Phase::AwaitingRemoteOffer, SignalKind::CallOffer)?;
        if let Err(e) = self.acquire_media().await {
            self.reset(Phase::Idle).await;
            return Err(e);
        }
        if let Err(e) = self.answer(offer, SignalKind::CallAnswer).await {
            self.reset(Phase::Idle).await;
            return Err(e);
        }
        self.transition(Phase::Connected);
        Ok(())
    }

    async fn on_call_answer(&mut self, answer: SessionDescription) -> Result<(), Error> {
        self.expect_phase(Phase::AwaitingAnswer, SignalKind::CallAnswer)?;
        self.connection()?.set_remote_description(answer).await?;
        self.transition(Phase::Connected);
        if std::mem::take(&mut self.session.renegotiate_when_connected) {
            self.renegotiate().await?;
        }
        Ok(())
    }

    async fn on_reneg_offer(&mut self, offer: SessionDescription) -> Result<(), Error> {
        self.expect_phase(Phase::Connected, SignalKind::RenegOffer)?;
        let mut replay = false;
        if let Renegotiation::AwaitingAnswer { .. } = self.session.renegotiation {
            // both sides offered at once: the caller's offer wins
            if self.session.role == Some(Role::Caller) {
                log::warn!("renegotiation glare: keeping own offer, dropping the remote one");
                return Ok(());
            }
            log::info!("renegotiation glare: rolling back own offer");
            // the caller dropped our offer, its answer will never come
            self.session.renegotiation = Renegotiation::Stable;
            self.publish();
            self.connection()?
                .set_local_description(SessionDescription::rollback())
                .await?;
            replay = true;
        }
        let answered = self.answer(offer, SignalKind::RenegAnswer).await;
        if let Err(e) = &answered {
            log::warn!("failed to answer reneg-offer: {}", e);
            // no-op if the offer was never applied
            if let Err(e) = self
                .connection()?
                .set_remote_description(SessionDescription::rollback())
                .await
            {
                log::debug!("remote rollback skipped: {}", e);
            }
        }
        if replay {
            self.renegotiate().await?;
        }
        answered
    }

    async fn on_reneg_answer(&mut self, answer: SessionDescription) -> Result<(), Error> {
        self.expect_phase(Phase::Connected, SignalKind::RenegAnswer)?;
        let Renegotiation::AwaitingAnswer { queued } = self.session.renegotiation else {
            return Err(Error::protocol_violation(
                "reneg-answer without an outstanding reneg-offer",
            ));
        };
        let applied = self.connection()?.set_remote_description(answer).await;
        self.session.renegotiation = Renegotiation::Stable;
        self.publish();
        if let Err(e) = &applied {
            log::warn!("reneg-answer rejected, rolling back own offer: {}", e);
            if let Err(e) = self
                .connection()?
                .set_local_description(SessionDescription::rollback())
                .await
            {
                log::error!("failed to roll back rejected offer: {}", e);
            }
        }
        if queued {
            self.renegotiate().await?;
        }
        applied
    }

    async fn on_peer_left(&mut self, peer_id: ConnectionId) -> Result<(), Error> {
        let expected = self.session.remote.as_ref().map(|r| r.id);
        if expected != Some(peer_id) {
            return Err(Conflict::StalePeer {
                expected,
                received: peer_id,
            }
            .into());
        }
        let phase = if self.session.phase == Phase::Connected {
            Phase::Disconnected
        } else {
            Phase::Idle
        };
        log::info!("{} left during {}", peer_id, self.session.phase);
        self.emit(SessionEvent::PeerLeft(peer_id));
        self.reset(phase).await;
        Ok(())
    }

    /// Starts a renegotiation from [Phase::Connected], or queues one if another is in flight.
    async fn renegotiate(&mut self) -> Result<(), Error> {
        match self.session.renegotiation {
            Renegotiation::AwaitingAnswer { .. } => {
                self.session.renegotiation = Renegotiation::AwaitingAnswer { queued: true };
                log::debug!("renegotiation already in flight, queued another one");
                Ok(())
            }
            Renegotiation::Stable => {
                self.send_offer(SignalKind::RenegOffer).await?;
                self.session.renegotiation = Renegotiation::AwaitingAnswer { queued: false };
                self.publish();
                Ok(())
            }
        }
    }

    async fn acquire_media(&mut self) -> Result<(), Error> {
        if self.session.stream.is_none() {
            let stream = self
                .media
                .acquire_local_stream(&self.options.constraints)
                .await?;
            log::debug!(
                "acquired local stream {} with {} tracks",
                stream.id,
                stream.tracks.len()
            );
            self.session.stream = Some(StreamGuard::new(stream, self.media.clone()));
        }
        if self.options.attach_media == AttachMedia::OnSetup {
            self.attach_local_tracks().await?;
        }
        Ok(())
    }

    async fn attach_local_tracks(&mut self) -> Result<(), Error> {
        for track in self.session.unattached_tracks() {
            self.add_track(track).await?;
        }
        Ok(())
    }

    async fn send_offer(&mut self, kind: SignalKind) -> Result<(), Error> {
        let connection = self.connection()?;
        let offer = connection.create_offer().await?;
        let offer = connection.set_local_description(offer).await?;
        let payload = offer.to_payload()?;
        self.transport.send(ClientMessage::signal(kind, payload)).await
    }

    /// Applies a remote offer and replies with an answer tagged as `kind`.
    async fn answer(&mut self, offer: SessionDescription, kind: SignalKind) -> Result<(), Error> {
        let connection = self.connection()?;
        connection.set_remote_description(offer).await?;
        if kind == SignalKind::CallAnswer && self.options.attach_media == AttachMedia::OnSetup {
            // attach after the remote offer, so that offered transceivers get reused
            self.attach_local_tracks().await?;
        }
        let connection = self.connection()?;
        let answer = connection.create_answer().await?;
        let answer = connection.set_local_description(answer).await?;
        let payload = answer.to_payload()?;
        self.transport.send(ClientMessage::signal(kind, payload)).await
    }

    /// Checks that a relayed signal comes from the current peer and carries a description of
    /// the expected type.
    fn accept_signal(
        &self,
        kind: SignalKind,
        from: ConnectionId,
        payload: &Value,
    ) -> Result<SessionDescription, Error> {
        let expected = self.session.remote.as_ref().map(|r| r.id);
        match expected {
            None => {
                return Err(Error::protocol_violation(format!(
                    "{} from {} while not paired",
                    kind, from
                )))
            }
            Some(id) if id != from => {
                return Err(Conflict::StalePeer {
                    expected,
                    received: from,
                }
                .into())
            }
            Some(_) => {}
        }
        let desc = SessionDescription::from_payload(payload)?;
        let expected_kind = if kind.is_offer() {
            SdpKind::Offer
        } else {
            SdpKind::Answer
        };
        if desc.kind != expected_kind {
            return Err(Error::protocol_violation(format!(
                "{} carries a {:?} description",
                kind, desc.kind
            )));
        }
        Ok(desc)
    }

    fn expect_phase(&self, phase: Phase, kind: SignalKind) -> Result<(), Error> {
        if self.session.phase == phase {
            Ok(())
        } else {
            Err(Error::protocol_violation(format!(
                "unexpected {} during {}",
                kind, self.session.phase
            )))
        }
    }

    fn connection(&self) -> Result<&F::Connection, Error> {
        self.session
            .connection()
            .ok_or_else(|| Error::protocol_violation("no active peer connection"))
    }

    /// Forgets the current pairing, if any, and releases its resources.
    async fn reset(&mut self, phase: Phase) {
        let previous = self.session.phase;
        self.session.release(phase).await;
        if previous != phase {
            log::info!("{} -> {}", previous, phase);
            self.emit(SessionEvent::PhaseChanged(phase));
        }
        self.publish();
    }

    fn transition(&mut self, phase: Phase) {
        if self.session.phase != phase {
            log::info!("{} -> {}", self.session.phase, phase);
            self.session.phase = phase;
            self.emit(SessionEvent::PhaseChanged(phase));
        }
        self.publish();
    }

    fn publish(&self) {
        self.status.store(Arc::new(SessionStatus {
            phase: self.session.phase,
            remote: self.session.remote.clone(),
            renegotiating: matches!(
                self.session.renegotiation,
                Renegotiation::AwaitingAnswer { .. }
            ),
        }));
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}
