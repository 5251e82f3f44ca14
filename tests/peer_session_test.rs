mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{BASE_URL, MockDevices, MockEngine, MockRelay, Reply, init_logging, settle};
use relay_call::calls::media::LocalMedia;
use relay_call::calls::{CallError, PeerSession, PeerState, SignalingTransport};
use relay_call::signaling::SignalingErrorKind;
use relay_call::types::{CallKind, CameraFacing, ConnectionState, PeerRole, TrackKind};

const PUBLISH_URL: &str = "webrtc://10.0.0.5/live/call_alice_bob";
const PLAY_URL: &str = "webrtc://10.0.0.5/live/call_bob_alice";

struct Fixture {
    relay: Arc<MockRelay>,
    engine: Arc<MockEngine>,
    devices: Arc<MockDevices>,
}

impl Fixture {
    fn new() -> Self {
        init_logging();
        Self {
            relay: MockRelay::new(),
            engine: MockEngine::new(),
            devices: MockDevices::new(),
        }
    }

    fn signaling(&self) -> SignalingTransport {
        SignalingTransport::new(self.relay.clone(), BASE_URL)
    }

    fn media(&self, kind: CallKind) -> Arc<LocalMedia> {
        Arc::new(LocalMedia::open(kind, "call_alice_bob", self.devices.as_ref()).unwrap())
    }

    async fn publish(&self, kind: CallKind) -> Arc<PeerSession> {
        PeerSession::create(
            PeerRole::Publish,
            self.engine.as_ref(),
            self.signaling(),
            Some(self.media(kind)),
            None,
        )
        .await
        .unwrap()
    }

    async fn play(&self) -> Arc<PeerSession> {
        PeerSession::create(
            PeerRole::Play,
            self.engine.as_ref(),
            self.signaling(),
            None,
            None,
        )
        .await
        .unwrap()
    }
}

#[tokio::test]
async fn test_publish_negotiation_applies_answer() {
    let fx = Fixture::new();
    fx.relay.script(PeerRole::Publish, Reply::ok("abc123"));
    let session = fx.publish(CallKind::Voice).await;
    assert_eq!(session.state().await, PeerState::Idle);

    session.negotiate(PUBLISH_URL).await.unwrap();

    assert_eq!(session.state().await, PeerState::Negotiated);
    assert_eq!(session.session_token().await.as_deref(), Some("abc123"));

    let conn = fx.engine.latest(PeerRole::Publish).unwrap();
    let local = conn.local_sdp.lock().unwrap().clone().unwrap();
    let remote = conn.remote_sdp.lock().unwrap().clone().unwrap();
    assert!(local.starts_with("v=0"));
    assert!(remote.contains("s=answer"));

    let body = MockRelay::body_json(&fx.relay.requests()[0]);
    assert_eq!(body["sdp"], local.as_str());
    assert_eq!(body["streamurl"], PUBLISH_URL);
}

#[tokio::test]
async fn test_publish_requires_local_media() {
    let fx = Fixture::new();
    let err = PeerSession::create(
        PeerRole::Publish,
        fx.engine.as_ref(),
        fx.signaling(),
        None,
        None,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, CallError::Configuration(_)));

    let stopped = fx.media(CallKind::Voice);
    stopped.stop();
    let err = PeerSession::create(
        PeerRole::Publish,
        fx.engine.as_ref(),
        fx.signaling(),
        Some(stopped),
        None,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, CallError::Configuration(_)));
    assert!(fx.engine.connections(PeerRole::Publish).is_empty());
}

#[tokio::test]
async fn test_play_session_ignores_local_media() {
    let fx = Fixture::new();
    let session = PeerSession::create(
        PeerRole::Play,
        fx.engine.as_ref(),
        fx.signaling(),
        Some(fx.media(CallKind::Video)),
        None,
    )
    .await
    .unwrap();

    assert!(session.local_media().is_none());
    assert!(!fx.engine.latest(PeerRole::Play).unwrap().video_sender);
}

#[tokio::test]
async fn test_failed_negotiation_then_double_dispose() {
    let fx = Fixture::new();
    fx.relay
        .script(PeerRole::Publish, Reply::status(200, r#"{"code":1}"#));
    let session = fx.publish(CallKind::Voice).await;

    let err = session.negotiate(PUBLISH_URL).await.unwrap_err();
    assert_eq!(
        err.signaling().map(|e| e.kind.clone()),
        Some(SignalingErrorKind::ProtocolCode(1))
    );
    assert_eq!(session.state().await, PeerState::Failed);

    session.dispose().await;
    session.dispose().await;

    let conn = fx.engine.latest(PeerRole::Publish).unwrap();
    assert_eq!(conn.close_calls.load(Ordering::SeqCst), 1);
    assert_eq!(session.state().await, PeerState::Failed);
    assert!(session.is_disposed());
    assert!(session.local_media().unwrap().audio().is_stopped());
}

#[tokio::test]
async fn test_offer_failure_is_reported_unchanged() {
    let fx = Fixture::new();
    fx.engine.fail_offers.store(true, Ordering::SeqCst);
    let session = fx.play().await;

    let err = session.negotiate(PLAY_URL).await.unwrap_err();
    assert!(matches!(err, CallError::Media(_)));
    assert_eq!(session.state().await, PeerState::Failed);
    assert!(fx.relay.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_negotiate_is_rejected() {
    let fx = Fixture::new();
    fx.relay.script(
        PeerRole::Publish,
        Reply::ok("slow").after(Duration::from_secs(2)),
    );
    let session = fx.publish(CallKind::Voice).await;

    let first = tokio::spawn({
        let session = session.clone();
        async move { session.negotiate(PUBLISH_URL).await }
    });
    settle().await;
    assert_eq!(session.state().await, PeerState::AwaitingAnswer);

    let err = session.negotiate(PUBLISH_URL).await.unwrap_err();
    assert!(matches!(err, CallError::NegotiationInProgress));

    first.await.unwrap().unwrap();
    assert_eq!(session.state().await, PeerState::Negotiated);
    assert_eq!(fx.relay.requests().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dispose_during_exchange_discards_answer() {
    let fx = Fixture::new();
    fx.relay.script(
        PeerRole::Play,
        Reply::ok("late").after(Duration::from_secs(5)),
    );
    let session = fx.play().await;

    let pending = tokio::spawn({
        let session = session.clone();
        async move { session.negotiate(PLAY_URL).await }
    });
    settle().await;
    session.dispose().await;

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, CallError::SessionDisposed));
    assert_eq!(session.state().await, PeerState::Closed);
    let conn = fx.engine.latest(PeerRole::Play).unwrap();
    assert!(conn.remote_sdp.lock().unwrap().is_none());

    let err = session.negotiate(PLAY_URL).await.unwrap_err();
    assert!(matches!(err, CallError::SessionDisposed));
}

#[tokio::test]
async fn test_connection_state_observers_are_independent() {
    let fx = Fixture::new();
    let session = fx.publish(CallKind::Voice).await;
    session.negotiate(PUBLISH_URL).await.unwrap();

    let mut first = session.observe_connection_state();
    let mut second = session.observe_connection_state();

    fx.engine
        .emit_state(PeerRole::Publish, ConnectionState::Checking);
    fx.engine
        .emit_state(PeerRole::Publish, ConnectionState::Connected);

    for rx in [&mut first, &mut second] {
        assert_eq!(rx.recv().await.unwrap(), ConnectionState::Checking);
        assert_eq!(rx.recv().await.unwrap(), ConnectionState::Connected);
    }
    assert_eq!(session.state().await, PeerState::Connected);
}

#[tokio::test]
async fn test_mute_only_affects_publish() {
    let fx = Fixture::new();
    let publish = fx.publish(CallKind::Voice).await;
    let play = fx.play().await;

    publish.set_muted(true);
    assert!(!publish.local_media().unwrap().audio().is_enabled());
    publish.set_muted(false);
    assert!(publish.local_media().unwrap().audio().is_enabled());

    play.set_muted(true);
    assert!(play.local_media().is_none());
    assert_eq!(play.state().await, PeerState::Idle);
}

#[tokio::test]
async fn test_switch_camera() {
    let fx = Fixture::new();
    let voice = fx.publish(CallKind::Voice).await;
    assert_eq!(voice.switch_camera(), None);

    let video = fx.publish(CallKind::Video).await;
    assert!(fx.engine.latest(PeerRole::Publish).unwrap().video_sender);
    assert_eq!(video.switch_camera(), Some(CameraFacing::Back));
    assert_eq!(video.switch_camera(), Some(CameraFacing::Front));
}

#[tokio::test]
async fn test_remote_video_track_callback() {
    let fx = Fixture::new();
    let session = fx.play().await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    session
        .on_remote_track_added({
            let seen = seen.clone();
            move |track| seen.lock().unwrap().push(track)
        })
        .await;

    let mut states = session.observe_connection_state();
    fx.engine.emit_track(PeerRole::Play, TrackKind::Audio);
    fx.engine.emit_track(PeerRole::Play, TrackKind::Video);
    // Events are processed in order; once this arrives both tracks were handled.
    fx.engine
        .emit_state(PeerRole::Play, ConnectionState::Connected);
    states.recv().await.unwrap();

    let tracks = seen.lock().unwrap().clone();
    assert_eq!(tracks.len(), 1);
    let track = tracks[0].upgrade().expect("engine still owns the track");
    assert_eq!(track.kind(), TrackKind::Video);
    drop(track);

    fx.engine.drop_tracks();
    assert!(tracks[0].upgrade().is_none());
}

#[tokio::test]
async fn test_second_negotiate_keeps_session_healthy() {
    let fx = Fixture::new();
    let session = fx.publish(CallKind::Voice).await;
    session.negotiate(PUBLISH_URL).await.unwrap();

    let err = session.negotiate(PUBLISH_URL).await.unwrap_err();
    assert!(matches!(err, CallError::AlreadyNegotiated));
    assert_eq!(session.state().await, PeerState::Negotiated);
    assert_eq!(fx.relay.requests().len(), 1);

    let mut states = session.observe_connection_state();
    fx.engine
        .emit_state(PeerRole::Publish, ConnectionState::Connected);
    assert_eq!(states.recv().await.unwrap(), ConnectionState::Connected);
    assert_eq!(session.state().await, PeerState::Connected);

    let err = session.negotiate(PUBLISH_URL).await.unwrap_err();
    assert!(matches!(err, CallError::AlreadyNegotiated));
    assert_eq!(session.state().await, PeerState::Connected);
}

#[tokio::test]
async fn test_remote_track_callback_can_reregister() {
    let fx = Fixture::new();
    let session = fx.play().await;
    let replaced = Arc::new(Mutex::new(Vec::new()));
    session
        .on_remote_track_added({
            let session = session.clone();
            let replaced = replaced.clone();
            move |_track| {
                let session = session.clone();
                let replaced = replaced.clone();
                tokio::spawn(async move {
                    session
                        .on_remote_track_added(move |track| replaced.lock().unwrap().push(track))
                        .await;
                });
            }
        })
        .await;

    let mut states = session.observe_connection_state();
    fx.engine.emit_track(PeerRole::Play, TrackKind::Video);
    fx.engine
        .emit_state(PeerRole::Play, ConnectionState::Checking);
    states.recv().await.unwrap();
    settle().await;

    fx.engine.emit_track(PeerRole::Play, TrackKind::Video);
    fx.engine
        .emit_state(PeerRole::Play, ConnectionState::Connected);
    states.recv().await.unwrap();

    assert_eq!(replaced.lock().unwrap().len(), 1);
    session.dispose().await;
}
