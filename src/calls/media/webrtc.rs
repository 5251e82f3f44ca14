//! webrtc-rs backed media engine.
//!
//! Publish connections carry our local tracks on send-only transceivers.
//! Play connections add receive-only audio and video transceivers so the
//! offer asks the relay for both. ICE connection state is mirrored into
//! [`ConnectionState`]; remote tracks stay owned by the connection.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use relaycore::types::{ConnectionState, PeerRole, TrackKind};
use tokio::sync::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine as RtcMediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_remote::TrackRemote;

use super::{
    ConnectionEvent, EventSink, LocalMedia, MediaConnection, MediaEngine, MediaError,
    RemoteMediaTrack, RemoteTrackRef,
};

/// Shared webrtc-rs context. Build once and reuse for every call.
pub struct WebRtcMediaEngine {
    api: API,
    ice_servers: Vec<String>,
}

impl WebRtcMediaEngine {
    pub fn new(ice_servers: Vec<String>) -> Result<Self, MediaError> {
        let mut media_engine = RtcMediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let mut setting_engine = SettingEngine::default();
        // The relay hands us its candidates in the answer; mDNS only adds noise.
        setting_engine.set_ice_multicast_dns_mode(webrtc::ice::mdns::MulticastDnsMode::Disabled);

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        info!(
            "WebRTC media engine ready ({} ICE servers)",
            ice_servers.len()
        );
        Ok(Self { api, ice_servers })
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl MediaEngine for WebRtcMediaEngine {
    async fn new_connection(
        &self,
        role: PeerRole,
        local: Option<&LocalMedia>,
        events: EventSink,
    ) -> Result<Arc<dyn MediaConnection>, MediaError> {
        let peer_connection = Arc::new(
            self.api
                .new_peer_connection(self.rtc_configuration())
                .await?,
        );

        match role {
            PeerRole::Publish => {
                let local = local.ok_or_else(|| {
                    MediaError::Backend("publish connection without local media".into())
                })?;
                let tracks = std::iter::once(local.audio()).chain(local.video());
                for track in tracks {
                    peer_connection
                        .add_transceiver_from_track(
                            track.rtc_track(),
                            Some(RTCRtpTransceiverInit {
                                direction: RTCRtpTransceiverDirection::Sendonly,
                                send_encodings: vec![],
                            }),
                        )
                        .await?;
                    debug!("[{}] attached local {:?} track {}", role, track.kind(), track.id());
                }
            }
            PeerRole::Play => {
                for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
                    peer_connection
                        .add_transceiver_from_kind(
                            kind,
                            Some(RTCRtpTransceiverInit {
                                direction: RTCRtpTransceiverDirection::Recvonly,
                                send_encodings: vec![],
                            }),
                        )
                        .await?;
                }
            }
        }

        let remote_tracks = Arc::new(Mutex::new(Vec::new()));

        let state_events = events.clone();
        peer_connection.on_ice_connection_state_change(Box::new(
            move |state: RTCIceConnectionState| {
                let events = state_events.clone();
                Box::pin(async move {
                    debug!("[{}] ICE connection state: {:?}", role, state);
                    if let Some(state) = map_ice_state(state) {
                        let _ = events.send(ConnectionEvent::StateChanged(state));
                    }
                })
            },
        ));

        let track_store = remote_tracks.clone();
        peer_connection.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let events = events.clone();
            let track_store = track_store.clone();
            Box::pin(async move {
                let remote = Arc::new(WebRtcRemoteTrack { track });
                info!(
                    "[{}] remote {:?} track {} added",
                    role,
                    remote.kind(),
                    remote.id()
                );
                let as_dyn: Arc<dyn RemoteMediaTrack> = remote.clone();
                let weak: RemoteTrackRef = Arc::downgrade(&as_dyn);
                track_store.lock().await.push(remote);
                if events.send(ConnectionEvent::RemoteTrack(weak)).is_err() {
                    warn!("[{}] remote track dropped: session gone", role);
                }
            })
        }));

        Ok(Arc::new(WebRtcConnection {
            role,
            peer_connection,
            remote_tracks,
        }))
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<ConnectionState> {
    match state {
        RTCIceConnectionState::New => Some(ConnectionState::New),
        RTCIceConnectionState::Checking => Some(ConnectionState::Checking),
        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
            Some(ConnectionState::Connected)
        }
        RTCIceConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCIceConnectionState::Failed => Some(ConnectionState::Failed),
        RTCIceConnectionState::Closed => Some(ConnectionState::Closed),
        _ => None,
    }
}

/// Remote track owned by a [`WebRtcConnection`].
#[derive(Debug)]
pub struct WebRtcRemoteTrack {
    track: Arc<TrackRemote>,
}

impl WebRtcRemoteTrack {
    /// Underlying webrtc-rs track, for renderers reading RTP.
    pub fn rtc_track(&self) -> &Arc<TrackRemote> {
        &self.track
    }
}

impl RemoteMediaTrack for WebRtcRemoteTrack {
    fn id(&self) -> String {
        self.track.id()
    }

    fn kind(&self) -> TrackKind {
        match self.track.kind() {
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        }
    }
}

struct WebRtcConnection {
    role: PeerRole,
    peer_connection: Arc<RTCPeerConnection>,
    remote_tracks: Arc<Mutex<Vec<Arc<WebRtcRemoteTrack>>>>,
}

#[async_trait]
impl MediaConnection for WebRtcConnection {
    async fn create_offer(&self) -> Result<String, MediaError> {
        let offer = self.peer_connection.create_offer(None).await?;
        Ok(offer.sdp)
    }

    async fn set_local_description(&self, sdp: &str) -> Result<(), MediaError> {
        let offer = RTCSessionDescription::offer(sdp.to_owned())?;
        self.peer_connection.set_local_description(offer).await?;
        Ok(())
    }

    async fn set_remote_description(&self, sdp: &str) -> Result<(), MediaError> {
        let answer = RTCSessionDescription::answer(sdp.to_owned())?;
        self.peer_connection.set_remote_description(answer).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), MediaError> {
        self.peer_connection.close().await?;
        // Dropping our ownership invalidates every Weak handed out.
        self.remote_tracks.lock().await.clear();
        info!("[{}] peer connection closed", self.role);
        Ok(())
    }
}
