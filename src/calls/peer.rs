//! One directional media connection against the relay.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use relaycore::signaling::SdpAnswer;
use relaycore::types::{CameraFacing, ConnectionState, PeerRole, TrackKind};
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;

use super::error::CallError;
use super::media::{ConnectionEvent, LocalMedia, MediaConnection, MediaEngine, RemoteTrackRef};
use super::signaling::SignalingTransport;

const STATE_CHANNEL_CAPACITY: usize = 32;

/// Lifecycle of a [`PeerSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    /// Local offer created and applied.
    OfferCreated,
    /// Offer sent to the relay.
    AwaitingAnswer,
    /// Answer applied; waiting for ICE.
    Negotiated,
    Connected,
    Closed,
    Failed,
}

impl PeerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// Events a peer session forwards to its owner.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    StateChanged {
        role: PeerRole,
        state: ConnectionState,
    },
    RemoteTrack {
        role: PeerRole,
        track: RemoteTrackRef,
    },
}

type RemoteTrackCallback = Arc<dyn Fn(RemoteTrackRef) + Send + Sync>;

/// Wraps one publish or play connection and drives its offer/answer exchange.
pub struct PeerSession {
    role: PeerRole,
    connection: Arc<dyn MediaConnection>,
    signaling: SignalingTransport,
    local_media: Option<Arc<LocalMedia>>,
    state: Arc<RwLock<PeerState>>,
    negotiating: AtomicBool,
    disposed: AtomicBool,
    session_token: Mutex<Option<String>>,
    state_tx: broadcast::Sender<ConnectionState>,
    remote_track_cb: Arc<Mutex<Option<RemoteTrackCallback>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("role", &self.role)
            .field("local_media", &self.local_media)
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish()
    }
}

impl PeerSession {
    /// Allocates the connection for `role`.
    ///
    /// Publish sessions take ownership of `local_media` and fail with
    /// [`CallError::Configuration`] without it. Play sessions attach no local
    /// tracks. `forward` receives every connection event after the session
    /// has processed it.
    pub async fn create(
        role: PeerRole,
        engine: &dyn MediaEngine,
        signaling: SignalingTransport,
        local_media: Option<Arc<LocalMedia>>,
        forward: Option<mpsc::UnboundedSender<PeerEvent>>,
    ) -> Result<Arc<Self>, CallError> {
        let local_media = match role {
            PeerRole::Publish => match local_media {
                Some(media) if !media.audio().is_stopped() => Some(media),
                Some(_) => {
                    return Err(CallError::Configuration(
                        "publish session needs a live local audio track".into(),
                    ));
                }
                None => {
                    return Err(CallError::Configuration(
                        "publish session needs local media".into(),
                    ));
                }
            },
            PeerRole::Play => None,
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connection = engine
            .new_connection(role, local_media.as_deref(), events_tx)
            .await?;

        let (state_tx, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        let session = Arc::new(Self {
            role,
            connection,
            signaling,
            local_media,
            state: Arc::new(RwLock::new(PeerState::Idle)),
            negotiating: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            session_token: Mutex::new(None),
            state_tx,
            remote_track_cb: Arc::new(Mutex::new(None)),
            pump: Mutex::new(None),
        });

        let pump = tokio::spawn(Self::pump_events(
            role,
            events_rx,
            session.state.clone(),
            session.state_tx.clone(),
            session.remote_track_cb.clone(),
            forward,
        ));
        *session.pump.lock().await = Some(pump);

        debug!("[{}] peer session created", role);
        Ok(session)
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub async fn state(&self) -> PeerState {
        *self.state.read().await
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Session token returned by the relay on the last successful exchange.
    pub async fn session_token(&self) -> Option<String> {
        self.session_token.lock().await.clone()
    }

    pub fn local_media(&self) -> Option<&Arc<LocalMedia>> {
        self.local_media.as_ref()
    }

    /// Offer → set local → relay exchange → set remote.
    ///
    /// Any failure leaves the session `Failed` and is returned unchanged; a
    /// failed session must be disposed. A second call while one is in flight
    /// is rejected with [`CallError::NegotiationInProgress`]; once the first
    /// attempt finished, with [`CallError::AlreadyNegotiated`]. Rejected calls
    /// leave the state untouched.
    pub async fn negotiate(&self, stream_url: &str) -> Result<(), CallError> {
        if self.is_disposed() {
            return Err(CallError::SessionDisposed);
        }
        if self
            .negotiating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CallError::NegotiationInProgress);
        }
        let current = *self.state.read().await;
        if current != PeerState::Idle {
            self.negotiating.store(false, Ordering::Release);
            debug!("[{}] negotiate rejected in state {:?}", self.role, current);
            return Err(CallError::AlreadyNegotiated);
        }

        let result = self.negotiate_inner(stream_url).await;
        self.negotiating.store(false, Ordering::Release);

        match result {
            Ok(answer) => {
                *self.session_token.lock().await = answer.session_id;
                info!("[{}] negotiated {}", self.role, stream_url);
                Ok(())
            }
            Err(e) => {
                let mut state = self.state.write().await;
                warn!(
                    "[{}] negotiation failed in state {:?}: {}",
                    self.role, *state, e
                );
                if *state != PeerState::Closed {
                    *state = PeerState::Failed;
                }
                Err(e)
            }
        }
    }

    async fn negotiate_inner(&self, stream_url: &str) -> Result<SdpAnswer, CallError> {
        let offer = self.connection.create_offer().await?;
        self.connection.set_local_description(&offer).await?;
        self.set_state_if_live(PeerState::OfferCreated).await?;

        self.set_state_if_live(PeerState::AwaitingAnswer).await?;
        let answer = self
            .signaling
            .exchange_for(self.role, &offer, stream_url)
            .await?;

        if self.is_disposed() {
            debug!("[{}] answer arrived after dispose; ignored", self.role);
            return Err(CallError::SessionDisposed);
        }
        self.connection.set_remote_description(&answer.sdp).await?;

        let mut state = self.state.write().await;
        // ICE may already have reported connected while we were applying the answer.
        if *state == PeerState::AwaitingAnswer {
            *state = PeerState::Negotiated;
        }
        Ok(answer)
    }

    async fn set_state_if_live(&self, next: PeerState) -> Result<(), CallError> {
        if self.is_disposed() {
            return Err(CallError::SessionDisposed);
        }
        *self.state.write().await = next;
        Ok(())
    }

    /// Subscribes to connection state changes from now on. Each call returns
    /// an independent receiver.
    pub fn observe_connection_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Registers the callback for remote video tracks of a play session.
    /// Audio tracks are played by the media stack and not reported.
    pub async fn on_remote_track_added<F>(&self, callback: F)
    where
        F: Fn(RemoteTrackRef) + Send + Sync + 'static,
    {
        *self.remote_track_cb.lock().await = Some(Arc::new(callback));
    }

    /// Enables or disables the local audio track. No-op for play sessions.
    pub fn set_muted(&self, muted: bool) {
        match &self.local_media {
            Some(media) if self.role == PeerRole::Publish => {
                media.audio().set_enabled(!muted);
                debug!("[{}] audio {}", self.role, if muted { "muted" } else { "unmuted" });
            }
            _ => {}
        }
    }

    /// Swaps front/back camera. Without a capturer (voice call, play session)
    /// this only logs and returns `None`.
    pub fn switch_camera(&self) -> Option<CameraFacing> {
        let Some(capturer) = self.local_media.as_ref().and_then(|m| m.capturer()) else {
            warn!("[{}] switch camera requested without a video capturer", self.role);
            return None;
        };
        match capturer.switch_camera() {
            Ok(facing) => Some(facing),
            Err(e) => {
                warn!("[{}] camera switch failed: {}", self.role, e);
                None
            }
        }
    }

    /// Releases capturer, local tracks and the connection, in that order.
    /// Safe to call repeatedly and from any state.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            debug!("[{}] already disposed", self.role);
            return;
        }

        if let Some(media) = &self.local_media {
            media.stop();
        }
        if let Err(e) = self.connection.close().await {
            warn!("[{}] error closing connection: {}", self.role, e);
        }
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
        *self.remote_track_cb.lock().await = None;

        let mut state = self.state.write().await;
        if *state != PeerState::Failed {
            *state = PeerState::Closed;
        }
        info!("[{}] peer session disposed", self.role);
    }

    async fn pump_events(
        role: PeerRole,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
        state: Arc<RwLock<PeerState>>,
        state_tx: broadcast::Sender<ConnectionState>,
        remote_track_cb: Arc<Mutex<Option<RemoteTrackCallback>>>,
        forward: Option<mpsc::UnboundedSender<PeerEvent>>,
    ) {
        let mut video_tracks_seen = 0usize;
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::StateChanged(conn_state) => {
                    {
                        let mut current = state.write().await;
                        let next = match conn_state {
                            ConnectionState::Connected if !current.is_terminal() => {
                                Some(PeerState::Connected)
                            }
                            ConnectionState::Failed if !current.is_terminal() => {
                                Some(PeerState::Failed)
                            }
                            ConnectionState::Closed if !current.is_terminal() => {
                                Some(PeerState::Closed)
                            }
                            _ => None,
                        };
                        if let Some(next) = next {
                            *current = next;
                        }
                    }
                    debug!("[{}] connection state {:?}", role, conn_state);
                    let _ = state_tx.send(conn_state);
                    if let Some(fwd) = &forward {
                        let _ = fwd.send(PeerEvent::StateChanged {
                            role,
                            state: conn_state,
                        });
                    }
                }
                ConnectionEvent::RemoteTrack(track) => {
                    if role != PeerRole::Play {
                        continue;
                    }
                    let kind = track.upgrade().map(|t| t.kind());
                    if kind != Some(TrackKind::Video) {
                        continue;
                    }
                    video_tracks_seen += 1;
                    debug!("[{}] remote video track #{}", role, video_tracks_seen);
                    let callback = remote_track_cb.lock().await.clone();
                    if let Some(cb) = callback {
                        cb(track.clone());
                    }
                    if let Some(fwd) = &forward {
                        let _ = fwd.send(PeerEvent::RemoteTrack { role, track });
                    }
                }
            }
        }
    }
}
