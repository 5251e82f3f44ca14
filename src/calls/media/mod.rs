//! Media stack seam for call sessions.
//!
//! Capture pipelines, codecs and rendering live outside this crate. The call
//! runtime only needs:
//!
//! - [`MediaEngine`]: the once-initialized shared context that creates peer
//!   connections. It is injected, never global.
//! - [`MediaConnection`]: one peer connection's offer/answer primitives.
//!   Transport callbacks arrive as [`ConnectionEvent`]s on a single channel.
//! - [`MediaDevices`]: the host's camera, audio routing and render context.
//! - [`LocalTrack`] / [`LocalMedia`]: local tracks owned by the publish session.
//!
//! [`WebRtcMediaEngine`] is the webrtc-rs backed engine.

mod webrtc;

pub use self::webrtc::{WebRtcMediaEngine, WebRtcRemoteTrack};

use async_trait::async_trait;
use log::debug;
use relaycore::types::{CallKind, CameraFacing, ConnectionState, PeerRole, TrackKind};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

use ::webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use ::webrtc::media::Sample;
use ::webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use ::webrtc::track::track_local::TrackLocal;
use ::webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Errors from the media stack.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("WebRTC error: {0}")]
    WebRtc(#[from] ::webrtc::Error),

    #[error("no camera available")]
    NoCamera,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("media backend error: {0}")]
    Backend(String),
}

/// A remote track as seen by the call runtime. The media stack owns it.
pub trait RemoteMediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> String;
    fn kind(&self) -> TrackKind;
}

/// Non-owning handle to a remote track, suitable for attaching a renderer.
pub type RemoteTrackRef = Weak<dyn RemoteMediaTrack>;

/// Everything a peer connection reports asynchronously.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    RemoteTrack(RemoteTrackRef),
}

/// Where a connection delivers its [`ConnectionEvent`]s.
pub type EventSink = mpsc::UnboundedSender<ConnectionEvent>;

/// One peer connection's negotiation primitives.
#[async_trait]
pub trait MediaConnection: Send + Sync {
    /// Creates a local offer and returns its SDP.
    async fn create_offer(&self) -> Result<String, MediaError>;

    async fn set_local_description(&self, sdp: &str) -> Result<(), MediaError>;

    async fn set_remote_description(&self, sdp: &str) -> Result<(), MediaError>;

    async fn close(&self) -> Result<(), MediaError>;
}

/// Shared media context that creates peer connections.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Creates a connection for `role`.
    ///
    /// Publish connections attach `local`'s tracks as send-only; play
    /// connections ignore `local` and receive audio and video.
    async fn new_connection(
        &self,
        role: PeerRole,
        local: Option<&LocalMedia>,
        events: EventSink,
    ) -> Result<Arc<dyn MediaConnection>, MediaError>;
}

/// Camera feeding the local video track.
pub trait VideoCapturer: Send + Sync {
    /// Swaps front/back camera and returns the new facing.
    fn switch_camera(&self) -> Result<CameraFacing, MediaError>;

    fn facing(&self) -> CameraFacing;

    /// Stops capture and releases the device.
    fn stop(&self);
}

/// GPU/EGL-like context shared read-only by every renderer of a call.
pub trait RenderContext: Send + Sync {
    fn release(&self);
}

/// Host capture, audio routing and rendering facilities.
pub trait MediaDevices: Send + Sync {
    fn open_camera(&self) -> Result<Arc<dyn VideoCapturer>, MediaError>;

    fn set_speakerphone(&self, enabled: bool);

    fn create_render_context(&self) -> Option<Arc<dyn RenderContext>> {
        None
    }
}

/// Devices for hosts without camera, speaker routing or rendering.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadlessDevices;

impl MediaDevices for HeadlessDevices {
    fn open_camera(&self) -> Result<Arc<dyn VideoCapturer>, MediaError> {
        Err(MediaError::NoCamera)
    }

    fn set_speakerphone(&self, enabled: bool) {
        debug!("speakerphone {} (headless, ignored)", enabled);
    }
}

/// A local audio or video track.
///
/// The host capture pipeline pushes samples through [`LocalTrack::write_sample`];
/// while the track is disabled (muted) or stopped, samples are dropped.
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
    track: Arc<TrackLocalStaticSample>,
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl LocalTrack {
    /// Opus, 48 kHz stereo.
    pub fn audio(stream_id: &str) -> Self {
        Self::with_codec(
            TrackKind::Audio,
            format!("{stream_id}-audio"),
            stream_id,
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
        )
    }

    /// VP8, 90 kHz clock.
    pub fn video(stream_id: &str) -> Self {
        Self::with_codec(
            TrackKind::Video,
            format!("{stream_id}-video"),
            stream_id,
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        )
    }

    fn with_codec(kind: TrackKind, id: String, stream_id: &str, codec: RTCRtpCodecCapability) -> Self {
        let track = Arc::new(TrackLocalStaticSample::new(
            codec,
            id.clone(),
            stream_id.to_owned(),
        ));
        Self {
            id,
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            track,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Ends the track for good. Idempotent.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.enabled.store(false, Ordering::Release);
            debug!("local track {} stopped", self.id);
        }
    }

    /// The webrtc-rs track to attach to a peer connection.
    pub fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }

    /// Writes one encoded sample. Returns `false` when it was dropped because
    /// the track is muted or stopped.
    pub async fn write_sample(&self, sample: &Sample) -> Result<bool, MediaError> {
        if self.is_stopped() || !self.is_enabled() {
            return Ok(false);
        }
        self.track.write_sample(sample).await?;
        Ok(true)
    }
}

/// Local media of one call: an audio track always, a video track and its
/// capturer only for video calls.
pub struct LocalMedia {
    audio: Arc<LocalTrack>,
    video: Option<Arc<LocalTrack>>,
    capturer: Option<Arc<dyn VideoCapturer>>,
}

impl fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMedia")
            .field("audio", &self.audio)
            .field("video", &self.video)
            .field("capturer", &self.capturer.is_some())
            .finish()
    }
}

impl LocalMedia {
    pub fn new(
        audio: Arc<LocalTrack>,
        video: Option<Arc<LocalTrack>>,
        capturer: Option<Arc<dyn VideoCapturer>>,
    ) -> Self {
        Self {
            audio,
            video,
            capturer,
        }
    }

    /// Opens the tracks a call of `kind` needs.
    pub fn open(
        kind: CallKind,
        stream_id: &str,
        devices: &dyn MediaDevices,
    ) -> Result<Self, MediaError> {
        let audio = Arc::new(LocalTrack::audio(stream_id));
        let (video, capturer) = if kind.has_video() {
            let capturer = devices.open_camera()?;
            (Some(Arc::new(LocalTrack::video(stream_id))), Some(capturer))
        } else {
            (None, None)
        };
        Ok(Self::new(audio, video, capturer))
    }

    pub fn audio(&self) -> &Arc<LocalTrack> {
        &self.audio
    }

    pub fn video(&self) -> Option<&Arc<LocalTrack>> {
        self.video.as_ref()
    }

    pub fn capturer(&self) -> Option<&Arc<dyn VideoCapturer>> {
        self.capturer.as_ref()
    }

    /// Stops the capture device first, then the tracks.
    pub fn stop(&self) {
        if let Some(capturer) = &self.capturer {
            capturer.stop();
        }
        if let Some(video) = &self.video {
            video.stop();
        }
        self.audio.stop();
    }
}
