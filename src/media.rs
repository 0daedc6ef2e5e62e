use crate::error::Error;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Formatter;
use std::sync::Arc;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// What kind of capture is requested from a [MediaSource].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        MediaConstraints {
            audio: true,
            video: false,
        }
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        MediaConstraints {
            audio: true,
            video: true,
        }
    }
}

/// Local track that can be attached to a peer connection.
#[derive(Clone)]
pub struct MediaTrack(Arc<dyn TrackLocal + Send + Sync>);

impl MediaTrack {
    pub fn new(track: Arc<dyn TrackLocal + Send + Sync>) -> Self {
        MediaTrack(track)
    }

    /// Opus track fed with samples by the capture pipeline.
    pub fn audio(id: &str, stream_id: &str) -> Self {
        Self::sample_track(MIME_TYPE_OPUS, id, stream_id)
    }

    /// VP8 track fed with samples by the capture pipeline.
    pub fn video(id: &str, stream_id: &str) -> Self {
        Self::sample_track(MIME_TYPE_VP8, id, stream_id)
    }

    fn sample_track(mime_type: &str, id: &str, stream_id: &str) -> Self {
        let track = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.to_owned(),
            stream_id.to_owned(),
        );
        MediaTrack(Arc::new(track))
    }

    pub fn id(&self) -> &str {
        self.0.id()
    }

    pub fn stream_id(&self) -> &str {
        self.0.stream_id()
    }

    pub fn kind(&self) -> RTPCodecType {
        self.0.kind()
    }

    pub fn inner(&self) -> &Arc<dyn TrackLocal + Send + Sync> {
        &self.0
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .finish()
    }
}

/// Set of tracks captured together from local devices.
#[derive(Debug, Clone)]
pub struct LocalStream {
    pub id: String,
    pub tracks: Vec<MediaTrack>,
}

impl LocalStream {
    pub fn new<S: Into<String>>(id: S, tracks: Vec<MediaTrack>) -> Self {
        LocalStream {
            id: id.into(),
            tracks,
        }
    }
}

/// Provider of locally captured media (microphone, camera).
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquires capture devices. Fails with [Error::MediaAcquisition] when a device was denied or
    /// is not available.
    async fn acquire_local_stream(&self, constraints: &MediaConstraints)
        -> Result<LocalStream, Error>;

    /// Stops capture and frees the devices held by `stream`.
    fn release(&self, stream: LocalStream);
}

/// Owns an acquired [LocalStream] and hands it back to its [MediaSource] exactly once, either
/// explicitly via [StreamGuard::release] or when dropped.
pub struct StreamGuard<M: MediaSource + ?Sized> {
    stream: Option<LocalStream>,
    source: Arc<M>,
}

impl<M: MediaSource + ?Sized> StreamGuard<M> {
    pub fn new(stream: LocalStream, source: Arc<M>) -> Self {
        StreamGuard {
            stream: Some(stream),
            source,
        }
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        self.stream
            .as_ref()
            .map(|s| s.tracks.as_slice())
            .unwrap_or(&[])
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(stream) = self.stream.take() {
            log::debug!("releasing local stream {}", stream.id);
            self.source.release(stream);
        }
    }
}

impl<M: MediaSource + ?Sized> Drop for StreamGuard<M> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl<M: MediaSource + ?Sized> std::fmt::Debug for StreamGuard<M> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamGuard")
            .field("stream", &self.stream)
            .finish()
    }
}
