use crate::error::Error;
use crate::media::MediaTrack;
use crate::peer::{PeerConnectionFactory, PeerConnector, PeerEvent, RemoteTrack};
use crate::signal::{SdpKind, SessionDescription};
use async_trait::async_trait;
use std::fmt::Formatter;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Configuration shared by every connection created by a [WebRtcFactory].
#[derive(Clone)]
pub struct Options {
    pub rtc_config: RTCConfiguration,
}

impl Options {
    pub fn with_ice_servers(urls: &[&str]) -> Self {
        let ice_servers = if urls.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: urls.iter().map(|&url| url.to_owned()).collect(),
                ..Default::default()
            }]
        };
        Options {
            rtc_config: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
        }
    }
}

impl Default for Options {
    fn default() -> Self {
        Options::with_ice_servers(&["stun:stun.l.google.com:19302"])
    }
}

/// Creates webrtc-rs peer connections.
#[derive(Clone, Default)]
pub struct WebRtcFactory {
    options: Options,
}

impl WebRtcFactory {
    pub fn new(options: Options) -> Self {
        WebRtcFactory { options }
    }

    fn api() -> Result<API, Error> {
        // Create a MediaEngine object to configure the supported codec
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        // Interceptors provide NACKs, RTCP reports and others. A registry must be created for
        // each peer connection.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build())
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcFactory {
    type Connection = WebRtcConnection;

    async fn create(&self, events: UnboundedSender<PeerEvent>) -> Result<WebRtcConnection, Error> {
        let api = Self::api()?;
        let pc = Arc::new(api.new_peer_connection(self.options.rtc_config.clone()).await?);
        Ok(WebRtcConnection::start(pc, events))
    }
}

/// [PeerConnector] backed by a webrtc-rs [RTCPeerConnection].
pub struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcConnection {
    fn start(pc: Arc<RTCPeerConnection>, events: UnboundedSender<PeerEvent>) -> Self {
        pc.on_peer_connection_state_change(Box::new(move |s| {
            match s {
                RTCPeerConnectionState::Failed => log::warn!("peer connection failed"),
                _ => log::debug!("peer connection state changed: {}", s),
            }
            Box::pin(async move {})
        }));
        {
            let events = events.clone();
            pc.on_negotiation_needed(Box::new(move || {
                let _ = events.send(PeerEvent::NegotiationNeeded);
                Box::pin(async move {})
            }));
        }
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let remote = RemoteTrack {
                id: track.id().to_string(),
                stream_id: track.stream_id().to_string(),
                kind: track.kind(),
                track: Some(track),
            };
            let _ = events.send(PeerEvent::RemoteTrack(remote));
            Box::pin(async move {})
        }));
        WebRtcConnection { pc }
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnection {
    async fn create_offer(&self) -> Result<SessionDescription, Error> {
        let offer = self.pc.create_offer(None).await?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, Error> {
        let answer = self.pc.create_answer(None).await?;
        from_rtc(answer)
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<SessionDescription, Error> {
        if desc.kind == SdpKind::Rollback {
            self.pc.set_local_description(to_rtc(desc.clone())?).await?;
            return Ok(desc);
        }
        // candidates are not trickled: wait for gathering to finish so that the returned
        // description is complete
        let mut gathering_complete = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(to_rtc(desc.clone())?).await?;
        let _ = gathering_complete.recv().await;
        match self.pc.local_description().await {
            Some(local) => from_rtc(local),
            None => Ok(desc),
        }
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), Error> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn add_track(&self, track: MediaTrack) -> Result<(), Error> {
        self.pc.add_track(track.inner().clone()).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.pc.close().await?;
        Ok(())
    }
}

impl std::fmt::Debug for WebRtcConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcConnection")
            .field("signaling", &self.pc.signaling_state())
            .field("state", &self.pc.connection_state())
            .finish()
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, Error> {
    Ok(match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
        SdpKind::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            rollback
        }
    })
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, Error> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(Error::protocol_violation(format!(
            "unsupported session description type: {}",
            other
        ))),
    }
}
