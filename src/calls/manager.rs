//! Session manager for orchestrating call lifecycle.
//!
//! [`SessionManager`] is a cheap handle onto a single call-control task. The
//! task owns the [`CallState`] and both peer sessions; negotiation, transport
//! callbacks and the duration timer all report back to it over one channel, so
//! there is never more than one writer of the call state.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use relaycore::net::HttpClient;
use relaycore::signaling::{stream_name, stream_url};
use relaycore::types::{CallDirection, CallKind, ConnectionState, PeerRole};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::error::CallError;
use super::media::{
    LocalMedia, MediaDevices, MediaEngine, MediaError, RenderContext, WebRtcMediaEngine,
};
use super::messages::{ControlCommand, ControlEvent};
use super::peer::{PeerEvent, PeerSession};
use super::signaling::SignalingTransport;
use super::state::{CallState, CallStatus, CallTransition};
use super::timer::DurationTimer;
use crate::config::CallConfig;
use crate::types::events::{CallEvent, EventBus};

const TICK_PERIOD: Duration = Duration::from_secs(1);

/// Dependencies shared by every call a manager runs. Build once and inject.
#[derive(Clone)]
pub struct CallContext {
    pub config: CallConfig,
    pub http: Arc<dyn HttpClient>,
    pub engine: Arc<dyn MediaEngine>,
    pub devices: Arc<dyn MediaDevices>,
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CallContext {
    pub fn new(
        config: CallConfig,
        http: Arc<dyn HttpClient>,
        engine: Arc<dyn MediaEngine>,
        devices: Arc<dyn MediaDevices>,
    ) -> Self {
        Self {
            config,
            http,
            engine,
            devices,
        }
    }

    /// The production stack: `ureq` signaling and the webrtc-rs engine.
    pub fn with_webrtc(
        config: CallConfig,
        devices: Arc<dyn MediaDevices>,
    ) -> Result<Self, MediaError> {
        let engine = WebRtcMediaEngine::new(config.ice_servers.clone())?;
        let http = Arc::new(config.http_client());
        Ok(Self::new(config, http, Arc::new(engine), devices))
    }
}

/// Public API of the call runtime.
///
/// Must be created inside a tokio runtime. Dropping the manager hangs up any
/// active call.
pub struct SessionManager {
    commands: mpsc::UnboundedSender<ControlCommand>,
    state: watch::Receiver<CallState>,
    events: EventBus,
    _controller: JoinHandle<()>,
}

impl SessionManager {
    pub fn new(ctx: CallContext) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(CallState::default());
        let events = EventBus::new();

        let controller = CallController::new(ctx, state_tx, events.clone(), control_tx);
        let handle = tokio::spawn(controller.run(command_rx, control_rx));

        Self {
            commands: command_tx,
            state: state_rx,
            events,
            _controller: handle,
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ControlCommand,
    ) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| CallError::ControllerGone)?;
        rx.await.map_err(|_| CallError::ControllerGone)
    }

    /// Places a call. Returns once local media is up and negotiation has been
    /// scheduled; signaling runs in the background.
    pub async fn start_call(
        &self,
        kind: CallKind,
        local_id: impl Into<String>,
        remote_id: impl Into<String>,
        remote_name: impl Into<String>,
    ) -> Result<(), CallError> {
        self.begin(CallDirection::Outgoing, kind, local_id, remote_id, remote_name)
            .await
    }

    /// Answers a call. Same publish-then-play sequence as [`start_call`](Self::start_call).
    pub async fn accept_call(
        &self,
        kind: CallKind,
        local_id: impl Into<String>,
        remote_id: impl Into<String>,
        remote_name: impl Into<String>,
    ) -> Result<(), CallError> {
        self.begin(CallDirection::Incoming, kind, local_id, remote_id, remote_name)
            .await
    }

    async fn begin(
        &self,
        direction: CallDirection,
        kind: CallKind,
        local_id: impl Into<String>,
        remote_id: impl Into<String>,
        remote_name: impl Into<String>,
    ) -> Result<(), CallError> {
        let (local_id, remote_id, remote_name) =
            (local_id.into(), remote_id.into(), remote_name.into());
        self.request(|reply| ControlCommand::Start {
            kind,
            direction,
            local_id,
            remote_id,
            remote_name,
            reply,
        })
        .await?
    }

    /// Returns the new mute flag.
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        self.request(|reply| ControlCommand::ToggleMute { reply })
            .await?
    }

    /// Returns the new speakerphone flag.
    pub async fn toggle_speaker(&self) -> Result<bool, CallError> {
        self.request(|reply| ControlCommand::ToggleSpeaker { reply })
            .await?
    }

    /// Returns `true` when the front camera is active afterwards.
    pub async fn switch_camera(&self) -> Result<bool, CallError> {
        self.request(|reply| ControlCommand::SwitchCamera { reply })
            .await?
    }

    /// Renegotiates the play side after it failed.
    pub async fn retry_play(&self) -> Result<(), CallError> {
        self.request(|reply| ControlCommand::RetryPlay { reply })
            .await?
    }

    /// Shared render context of the active call, for attaching renderers.
    pub async fn render_context(&self) -> Result<Option<Arc<dyn RenderContext>>, CallError> {
        self.request(|reply| ControlCommand::RenderContext { reply })
            .await
    }

    /// Ends the active call. Idempotent.
    pub async fn hang_up(&self) -> Result<(), CallError> {
        self.request(|reply| ControlCommand::HangUp { reply }).await
    }

    pub fn state(&self) -> CallState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CallState> {
        self.state.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }
}

/// What a background negotiation task needs. One per call.
#[derive(Clone)]
struct NegotiationPlan {
    seq: u64,
    engine: Arc<dyn MediaEngine>,
    signaling: SignalingTransport,
    local_media: Arc<LocalMedia>,
    publish_url: String,
    play_url: String,
    play_delay: Duration,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
    control: mpsc::UnboundedSender<ControlEvent>,
}

impl NegotiationPlan {
    /// Publish first; play only after publish succeeded and the relay had
    /// `play_delay` to register our stream.
    async fn publish_then_play(self) {
        let seq = self.seq;
        match self.negotiate(PeerRole::Publish).await {
            Ok(()) => {
                let _ = self.control.send(ControlEvent::PublishNegotiated { seq });
            }
            Err(error) => {
                let _ = self.control.send(ControlEvent::PublishFailed { seq, error });
                return;
            }
        }
        tokio::time::sleep(self.play_delay).await;
        self.play().await;
    }

    async fn play(&self) {
        let seq = self.seq;
        let event = match self.negotiate(PeerRole::Play).await {
            Ok(()) => ControlEvent::PlayNegotiated { seq },
            Err(error) => ControlEvent::PlayFailed { seq, error },
        };
        let _ = self.control.send(event);
    }

    async fn negotiate(&self, role: PeerRole) -> Result<(), CallError> {
        let (local, url) = match role {
            PeerRole::Publish => (Some(self.local_media.clone()), &self.publish_url),
            PeerRole::Play => (None, &self.play_url),
        };
        let session = PeerSession::create(
            role,
            self.engine.as_ref(),
            self.signaling.clone(),
            local,
            Some(self.peer_events.clone()),
        )
        .await?;
        let _ = self.control.send(ControlEvent::SessionCreated {
            seq: self.seq,
            session: session.clone(),
        });
        session.negotiate(url).await
    }
}

/// One call as seen by the controller. Kept after the call ends so late
/// results can be recognised and dropped.
struct ActiveCall {
    seq: u64,
    state: CallState,
    plan: Option<NegotiationPlan>,
    local_media: Option<Arc<LocalMedia>>,
    publish: Option<Arc<PeerSession>>,
    play: Option<Arc<PeerSession>>,
    render_context: Option<Arc<dyn RenderContext>>,
    negotiation: Option<JoinHandle<()>>,
    play_retry: Option<JoinHandle<()>>,
    forwarder: Option<JoinHandle<()>>,
    timer: DurationTimer,
    publish_negotiated: bool,
    publish_connected_early: bool,
    play_pending: bool,
}

impl ActiveCall {
    fn live(call: &mut Option<ActiveCall>, seq: u64) -> Option<&mut ActiveCall> {
        call.as_mut()
            .filter(|c| c.seq == seq && c.state.is_active())
    }

    fn active(call: &mut Option<ActiveCall>) -> Result<&mut ActiveCall, CallError> {
        call.as_mut()
            .filter(|c| c.state.is_active())
            .ok_or(CallError::NoActiveCall)
    }
}

struct CallController {
    ctx: CallContext,
    signaling: SignalingTransport,
    state_tx: watch::Sender<CallState>,
    events: EventBus,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
    call: Option<ActiveCall>,
    seq: u64,
}

impl CallController {
    fn new(
        ctx: CallContext,
        state_tx: watch::Sender<CallState>,
        events: EventBus,
        control_tx: mpsc::UnboundedSender<ControlEvent>,
    ) -> Self {
        let signaling = SignalingTransport::new(ctx.http.clone(), ctx.config.base_url.clone());
        Self {
            ctx,
            signaling,
            state_tx,
            events,
            control_tx,
            call: None,
            seq: 0,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<ControlCommand>,
        mut control: mpsc::UnboundedReceiver<ControlEvent>,
    ) {
        debug!("call controller started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = control.recv() => self.handle_event(event).await,
            }
        }
        self.end_call(None).await;
        debug!("call controller stopped");
    }

    async fn handle_command(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::Start {
                kind,
                direction,
                local_id,
                remote_id,
                remote_name,
                reply,
            } => {
                let result = self
                    .start(kind, direction, local_id, remote_id, remote_name)
                    .await;
                let _ = reply.send(result);
            }
            ControlCommand::ToggleMute { reply } => {
                let _ = reply.send(self.toggle_mute());
            }
            ControlCommand::ToggleSpeaker { reply } => {
                let _ = reply.send(self.toggle_speaker());
            }
            ControlCommand::SwitchCamera { reply } => {
                let _ = reply.send(self.switch_camera());
            }
            ControlCommand::RetryPlay { reply } => {
                let result = self.retry_play().await;
                let _ = reply.send(result);
            }
            ControlCommand::RenderContext { reply } => {
                let context = ActiveCall::active(&mut self.call)
                    .ok()
                    .and_then(|c| c.render_context.clone());
                let _ = reply.send(context);
            }
            ControlCommand::HangUp { reply } => {
                self.end_call(None).await;
                let _ = reply.send(());
            }
        }
    }

    async fn start(
        &mut self,
        kind: CallKind,
        direction: CallDirection,
        local_id: String,
        remote_id: String,
        remote_name: String,
    ) -> Result<(), CallError> {
        if self.call.as_ref().is_some_and(|c| c.state.is_active()) {
            return Err(CallError::CallActive);
        }
        if local_id.trim().is_empty() || remote_id.trim().is_empty() {
            return Err(CallError::Configuration(
                "local and remote ids are required".into(),
            ));
        }

        self.seq += 1;
        let seq = self.seq;
        let mut state = CallState::new(kind, direction, &local_id, &remote_id, remote_name);
        state.apply_transition(CallTransition::Start)?;
        info!(
            "{:?} {} call {} -> {} (#{})",
            direction, kind, local_id, remote_id, seq
        );

        let (peer_events, forwarder) = self.spawn_forwarder(seq);
        let speaker_on = state.speaker_on;
        self.call = Some(ActiveCall {
            seq,
            state,
            plan: None,
            local_media: None,
            publish: None,
            play: None,
            render_context: self.ctx.devices.create_render_context(),
            negotiation: None,
            play_retry: None,
            forwarder: Some(forwarder),
            timer: DurationTimer::default(),
            publish_negotiated: false,
            publish_connected_early: false,
            play_pending: false,
        });
        self.ctx.devices.set_speakerphone(speaker_on);
        self.publish_snapshot();

        let local_media = match LocalMedia::open(
            kind,
            &stream_name(&local_id, &remote_id),
            self.ctx.devices.as_ref(),
        ) {
            Ok(media) => Arc::new(media),
            Err(e) => {
                let error = CallError::Media(e);
                self.end_call(Some(error.to_string())).await;
                return Err(error);
            }
        };

        let host = self.ctx.config.stream_host();
        let app = &self.ctx.config.app;
        let plan = NegotiationPlan {
            seq,
            engine: self.ctx.engine.clone(),
            signaling: self.signaling.clone(),
            local_media: local_media.clone(),
            publish_url: stream_url(&host, app, PeerRole::Publish, &local_id, &remote_id),
            play_url: stream_url(&host, app, PeerRole::Play, &local_id, &remote_id),
            play_delay: self.ctx.config.play_delay,
            peer_events,
            control: self.control_tx.clone(),
        };

        if let Some(call) = self.call.as_mut() {
            call.local_media = Some(local_media);
            call.negotiation = Some(tokio::spawn(plan.clone().publish_then_play()));
            call.plan = Some(plan);
        }
        Ok(())
    }

    /// Tags peer events with the call they belong to and hands them to the controller.
    fn spawn_forwarder(&self, seq: u64) -> (mpsc::UnboundedSender<PeerEvent>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<PeerEvent>();
        let control = self.control_tx.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if control.send(ControlEvent::Peer { seq, event }).is_err() {
                    break;
                }
            }
        });
        (tx, handle)
    }

    fn toggle_mute(&mut self) -> Result<bool, CallError> {
        let call = ActiveCall::active(&mut self.call)?;
        let muted = !call.state.muted;
        match (&call.publish, &call.local_media) {
            (Some(publish), _) => publish.set_muted(muted),
            (None, Some(media)) => media.audio().set_enabled(!muted),
            (None, None) => {}
        }
        if let Some(play) = &call.play {
            play.set_muted(muted);
        }
        call.state.muted = muted;
        self.state_tx.send_replace(call.state.clone());
        Ok(muted)
    }

    fn toggle_speaker(&mut self) -> Result<bool, CallError> {
        let call = ActiveCall::active(&mut self.call)?;
        let speaker_on = !call.state.speaker_on;
        self.ctx.devices.set_speakerphone(speaker_on);
        call.state.speaker_on = speaker_on;
        self.state_tx.send_replace(call.state.clone());
        Ok(speaker_on)
    }

    fn switch_camera(&mut self) -> Result<bool, CallError> {
        let call = ActiveCall::active(&mut self.call)?;
        let facing = match (&call.publish, &call.local_media) {
            (Some(publish), _) => publish.switch_camera(),
            (None, Some(media)) => match media.capturer() {
                Some(capturer) => capturer.switch_camera().ok(),
                None => {
                    warn!("switch camera requested on a voice call");
                    None
                }
            },
            (None, None) => None,
        };
        if let Some(facing) = facing {
            call.state.camera_facing = facing;
            self.state_tx.send_replace(call.state.clone());
        }
        Ok(call.state.camera_facing.is_front())
    }

    async fn retry_play(&mut self) -> Result<(), CallError> {
        let call = ActiveCall::active(&mut self.call)?;
        if !call.publish_negotiated {
            return Err(CallError::Configuration(
                "cannot play before publishing succeeded".into(),
            ));
        }
        if call.play_pending {
            return Err(CallError::NegotiationInProgress);
        }
        let Some(plan) = call.plan.clone() else {
            return Err(CallError::NoActiveCall);
        };
        if let Some(old) = call.play.take() {
            old.dispose().await;
        }
        info!("retrying play for call #{}", call.seq);
        call.play_pending = true;
        call.play_retry = Some(tokio::spawn(async move { plan.play().await }));
        Ok(())
    }

    async fn handle_event(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::SessionCreated { seq, session } => {
                let Some(call) = ActiveCall::live(&mut self.call, seq) else {
                    debug!("[{}] session for finished call #{} disposed", session.role(), seq);
                    session.dispose().await;
                    return;
                };
                let slot = match session.role() {
                    PeerRole::Publish => &mut call.publish,
                    PeerRole::Play => &mut call.play,
                };
                if let Some(old) = slot.replace(session) {
                    old.dispose().await;
                }
            }
            ControlEvent::PublishNegotiated { seq } => {
                let Some(call) = ActiveCall::live(&mut self.call, seq) else {
                    debug!("late publish result for call #{} ignored", seq);
                    return;
                };
                if let Err(e) = call
                    .state
                    .apply_transition(CallTransition::PublishNegotiated)
                {
                    warn!("{}", e);
                    return;
                }
                call.publish_negotiated = true;
                call.play_pending = true;
                self.state_tx.send_replace(call.state.clone());
                self.events.dispatch(CallEvent::Publishing);
                if call.publish_connected_early {
                    Self::enter_connected(call, &self.control_tx, &self.state_tx, &self.events);
                }
            }
            ControlEvent::PublishFailed { seq, error } => {
                if ActiveCall::live(&mut self.call, seq).is_none() {
                    debug!("late publish failure for call #{} ignored: {}", seq, error);
                    return;
                }
                warn!("publish failed, ending call: {}", error);
                self.end_call(Some(error.to_string())).await;
            }
            ControlEvent::PlayNegotiated { seq } => {
                if let Some(call) = ActiveCall::live(&mut self.call, seq) {
                    call.play_pending = false;
                    info!("playing remote stream for call #{}", seq);
                }
            }
            ControlEvent::PlayFailed { seq, error } => {
                let Some(call) = ActiveCall::live(&mut self.call, seq) else {
                    debug!("late play failure for call #{} ignored: {}", seq, error);
                    return;
                };
                call.play_pending = false;
                warn!(
                    "play failed for call #{}, continuing without remote media: {}",
                    seq, error
                );
                if let Some(play) = call.play.take() {
                    play.dispose().await;
                }
                self.events.dispatch(CallEvent::PlayFailed {
                    error: error.to_string(),
                });
            }
            ControlEvent::Peer { seq, event } => match event {
                PeerEvent::StateChanged { role, state } => {
                    self.on_connection_state(seq, role, state).await;
                }
                PeerEvent::RemoteTrack { role, track } => {
                    if ActiveCall::live(&mut self.call, seq).is_some() {
                        self.events.dispatch(CallEvent::RemoteTrack { role, track });
                    }
                }
            },
            ControlEvent::Tick { seq } => {
                if let Some(call) = ActiveCall::live(&mut self.call, seq)
                    && call.state.tick()
                {
                    self.state_tx.send_replace(call.state.clone());
                }
            }
        }
    }

    async fn on_connection_state(&mut self, seq: u64, role: PeerRole, state: ConnectionState) {
        let Some(call) = ActiveCall::live(&mut self.call, seq) else {
            return;
        };
        self.events
            .dispatch(CallEvent::ConnectionChanged { role, state });

        let fatal = match (role, state) {
            (PeerRole::Publish, ConnectionState::Connected) => {
                match call.state.status {
                    CallStatus::Ringing => {
                        Self::enter_connected(call, &self.control_tx, &self.state_tx, &self.events)
                    }
                    CallStatus::Connecting => call.publish_connected_early = true,
                    _ => debug!("publish transport reconnected"),
                }
                false
            }
            (PeerRole::Publish, ConnectionState::Disconnected) => {
                info!("publish transport disconnected, waiting for recovery");
                false
            }
            (PeerRole::Publish, s) if s.is_terminal() => true,
            (PeerRole::Play, s) if s.is_terminal() => {
                warn!("play transport {:?}; remote media lost", s);
                false
            }
            _ => false,
        };

        if fatal {
            let error = CallError::TransportFailure(format!("publish transport {:?}", state));
            warn!("{}", error);
            self.end_call(Some(error.to_string())).await;
        }
    }

    fn enter_connected(
        call: &mut ActiveCall,
        control: &mpsc::UnboundedSender<ControlEvent>,
        state_tx: &watch::Sender<CallState>,
        events: &EventBus,
    ) {
        if let Err(e) = call.state.apply_transition(CallTransition::MediaConnected) {
            warn!("{}", e);
            return;
        }
        let seq = call.seq;
        let control = control.clone();
        call.timer.start(TICK_PERIOD, move || {
            control.send(ControlEvent::Tick { seq }).is_ok()
        });
        info!("call #{} connected", seq);
        state_tx.send_replace(call.state.clone());
        events.dispatch(CallEvent::Connected);
    }

    /// Tears the active call down and fires `Ended` once. No-op when no call
    /// is active.
    async fn end_call(&mut self, error: Option<String>) {
        let Some(call) = self.call.as_mut().filter(|c| c.state.is_active()) else {
            return;
        };

        call.timer.cancel();
        for task in [
            call.negotiation.take(),
            call.play_retry.take(),
            call.forwarder.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }

        if let Some(play) = call.play.take() {
            play.dispose().await;
        }
        if let Some(publish) = call.publish.take() {
            publish.dispose().await;
        }
        // Covers calls that ended before the publish session existed.
        if let Some(media) = call.local_media.take() {
            media.stop();
        }
        call.plan = None;
        call.play_pending = false;
        if let Some(context) = call.render_context.take() {
            context.release();
        }

        if let Err(e) = call
            .state
            .apply_transition(CallTransition::Ended { error })
        {
            warn!("{}", e);
        }
        info!(
            "call #{} ended after {}s{}",
            call.seq,
            call.state.duration_seconds,
            call.state
                .error_message
                .as_deref()
                .map(|e| format!(": {e}"))
                .unwrap_or_default()
        );
        self.state_tx.send_replace(call.state.clone());
        self.events.dispatch(CallEvent::Ended {
            error: call.state.error_message.clone(),
            dismiss_after: self.ctx.config.dismiss_delay,
        });
    }

    fn publish_snapshot(&self) {
        if let Some(call) = &self.call {
            self.state_tx.send_replace(call.state.clone());
        }
    }
}
