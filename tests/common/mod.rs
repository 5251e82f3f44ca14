//! In-memory relay, media engine and devices for exercising call sessions
//! without network or codecs.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use relay_call::calls::media::{
    ConnectionEvent, EventSink, LocalMedia, MediaConnection, MediaDevices, MediaEngine,
    MediaError, RemoteMediaTrack, RenderContext, VideoCapturer,
};
use relay_call::calls::{CallContext, SessionManager};
use relay_call::config::CallConfig;
use relay_call::net::{HttpClient, HttpRequest, HttpResponse};
use relay_call::types::{CameraFacing, ConnectionState, PeerRole, TrackKind};

pub const BASE_URL: &str = "http://10.0.0.5:1985";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn answer_body(session_id: &str) -> String {
    format!(
        r#"{{"code":0,"sdp":"v=0\r\no=- 9 2 IN IP4 10.0.0.5\r\ns=answer\r\n","sessionid":"{session_id}"}}"#
    )
}

fn role_of(url: &str) -> PeerRole {
    if url.contains("/rtc/v1/play/") {
        PeerRole::Play
    } else {
        PeerRole::Publish
    }
}

/// One scripted relay reply.
#[derive(Debug, Clone)]
pub struct Reply {
    pub delay: Duration,
    pub outcome: Result<HttpResponse, String>,
}

impl Reply {
    pub fn ok(session_id: &str) -> Self {
        Self::status(200, answer_body(session_id))
    }

    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: Ok(HttpResponse::json(status, body.into().into_bytes())),
        }
    }

    pub fn io_error(message: &str) -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: Err(message.to_string()),
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Relay double. Replies are consumed per role in order; an empty script
/// answers successfully.
#[derive(Default)]
pub struct MockRelay {
    script: Mutex<HashMap<PeerRole, VecDeque<Reply>>>,
    requests: Mutex<Vec<HttpRequest>>,
    log: Mutex<Vec<String>>,
}

impl MockRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, role: PeerRole, reply: Reply) {
        self.script
            .lock()
            .unwrap()
            .entry(role)
            .or_default()
            .push_back(reply);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, role: PeerRole) -> Vec<HttpRequest> {
        self.requests()
            .into_iter()
            .filter(|r| role_of(&r.url) == role)
            .collect()
    }

    /// `start <role>` / `end <role>` entries in the order they happened.
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn body_json(request: &HttpRequest) -> serde_json::Value {
        serde_json::from_slice(request.body.as_deref().unwrap_or_default()).unwrap()
    }
}

#[async_trait]
impl HttpClient for MockRelay {
    async fn execute(&self, request: HttpRequest) -> anyhow::Result<HttpResponse> {
        let role = role_of(&request.url);
        self.requests.lock().unwrap().push(request);
        self.log.lock().unwrap().push(format!("start {role}"));

        let reply = self
            .script
            .lock()
            .unwrap()
            .get_mut(&role)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| Reply::ok(&format!("{role}-session")));

        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }
        self.log.lock().unwrap().push(format!("end {role}"));
        reply.outcome.map_err(|e| anyhow::anyhow!(e))
    }
}

#[derive(Debug)]
pub struct MockRemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

impl RemoteMediaTrack for MockRemoteTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }
}

#[derive(Debug)]
pub struct MockConnection {
    pub role: PeerRole,
    pub local_sdp: Mutex<Option<String>>,
    pub remote_sdp: Mutex<Option<String>>,
    pub closed: AtomicBool,
    pub close_calls: AtomicUsize,
    pub fail_offer: bool,
    pub video_sender: bool,
}

#[async_trait]
impl MediaConnection for MockConnection {
    async fn create_offer(&self) -> Result<String, MediaError> {
        if self.fail_offer {
            return Err(MediaError::Backend("offer rejected".into()));
        }
        Ok(format!("v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns={}\r\n", self.role))
    }

    async fn set_local_description(&self, sdp: &str) -> Result<(), MediaError> {
        *self.local_sdp.lock().unwrap() = Some(sdp.to_string());
        Ok(())
    }

    async fn set_remote_description(&self, sdp: &str) -> Result<(), MediaError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MediaError::ConnectionClosed);
        }
        *self.remote_sdp.lock().unwrap() = Some(sdp.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<(), MediaError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Engine double. Keeps every connection and its event sink so tests can
/// play the part of ICE.
#[derive(Default)]
pub struct MockEngine {
    connections: Mutex<Vec<(Arc<MockConnection>, EventSink)>>,
    tracks: Mutex<Vec<Arc<dyn RemoteMediaTrack>>>,
    pub fail_offers: AtomicBool,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connections(&self, role: PeerRole) -> Vec<Arc<MockConnection>> {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c.role == role)
            .map(|(c, _)| c.clone())
            .collect()
    }

    pub fn latest(&self, role: PeerRole) -> Option<Arc<MockConnection>> {
        self.connections(role).pop()
    }

    fn latest_sink(&self, role: PeerRole) -> EventSink {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(c, _)| c.role == role)
            .map(|(_, sink)| sink.clone())
            .expect("no connection for role")
    }

    /// Reports an ICE state on the newest connection of `role`.
    pub fn emit_state(&self, role: PeerRole, state: ConnectionState) {
        let _ = self
            .latest_sink(role)
            .send(ConnectionEvent::StateChanged(state));
    }

    /// Delivers a remote track on the newest connection of `role`. The engine
    /// keeps the only strong reference.
    pub fn emit_track(&self, role: PeerRole, kind: TrackKind) -> Weak<dyn RemoteMediaTrack> {
        let track: Arc<dyn RemoteMediaTrack> = Arc::new(MockRemoteTrack {
            id: format!("{role}-{kind:?}"),
            kind,
        });
        let weak = Arc::downgrade(&track);
        self.tracks.lock().unwrap().push(track);
        let _ = self
            .latest_sink(role)
            .send(ConnectionEvent::RemoteTrack(weak.clone()));
        weak
    }

    pub fn drop_tracks(&self) {
        self.tracks.lock().unwrap().clear();
    }
}

#[async_trait]
impl MediaEngine for MockEngine {
    async fn new_connection(
        &self,
        role: PeerRole,
        local: Option<&LocalMedia>,
        events: EventSink,
    ) -> Result<Arc<dyn MediaConnection>, MediaError> {
        let connection = Arc::new(MockConnection {
            role,
            local_sdp: Mutex::new(None),
            remote_sdp: Mutex::new(None),
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            fail_offer: self.fail_offers.load(Ordering::SeqCst),
            video_sender: local.is_some_and(|m| m.video().is_some()),
        });
        self.connections
            .lock()
            .unwrap()
            .push((connection.clone(), events));
        Ok(connection)
    }
}

#[derive(Debug, Default)]
pub struct MockCamera {
    pub facing: Mutex<CameraFacing>,
    pub stopped: AtomicBool,
}

impl VideoCapturer for MockCamera {
    fn switch_camera(&self) -> Result<CameraFacing, MediaError> {
        let mut facing = self.facing.lock().unwrap();
        *facing = facing.flipped();
        Ok(*facing)
    }

    fn facing(&self) -> CameraFacing {
        *self.facing.lock().unwrap()
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
pub struct MockRenderContext {
    pub released: AtomicBool,
}

impl RenderContext for MockRenderContext {
    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockDevices {
    pub camera: Arc<MockCamera>,
    pub speaker: Mutex<Vec<bool>>,
    pub render_contexts: Mutex<Vec<Arc<MockRenderContext>>>,
}

impl MockDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn speaker_history(&self) -> Vec<bool> {
        self.speaker.lock().unwrap().clone()
    }

    pub fn latest_render_context(&self) -> Option<Arc<MockRenderContext>> {
        self.render_contexts.lock().unwrap().last().cloned()
    }
}

impl MediaDevices for MockDevices {
    fn open_camera(&self) -> Result<Arc<dyn VideoCapturer>, MediaError> {
        Ok(self.camera.clone())
    }

    fn set_speakerphone(&self, enabled: bool) {
        self.speaker.lock().unwrap().push(enabled);
    }

    fn create_render_context(&self) -> Option<Arc<dyn RenderContext>> {
        let context = Arc::new(MockRenderContext::default());
        self.render_contexts.lock().unwrap().push(context.clone());
        Some(context)
    }
}

pub struct Harness {
    pub relay: Arc<MockRelay>,
    pub engine: Arc<MockEngine>,
    pub devices: Arc<MockDevices>,
    pub manager: SessionManager,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_relay(MockRelay::new())
    }

    pub fn with_relay(relay: Arc<MockRelay>) -> Self {
        init_logging();
        let engine = MockEngine::new();
        let devices = MockDevices::new();
        let ctx = CallContext::new(
            CallConfig::new(BASE_URL),
            relay.clone(),
            engine.clone(),
            devices.clone(),
        );
        Self {
            relay,
            engine,
            devices,
            manager: SessionManager::new(ctx),
        }
    }
}

/// Lets spawned tasks run until they block. Under a paused clock this does
/// not advance time.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}
