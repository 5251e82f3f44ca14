use std::sync::Arc;

use relaycore::types::{CallDirection, CallKind};
use tokio::sync::oneshot;

use super::error::CallError;
use super::media::RenderContext;
use super::peer::{PeerEvent, PeerSession};

// --- Commands from the SessionManager handle to the call-control task ---
pub(crate) enum ControlCommand {
    Start {
        kind: CallKind,
        direction: CallDirection,
        local_id: String,
        remote_id: String,
        remote_name: String,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    ToggleMute {
        reply: oneshot::Sender<Result<bool, CallError>>,
    },
    ToggleSpeaker {
        reply: oneshot::Sender<Result<bool, CallError>>,
    },
    SwitchCamera {
        reply: oneshot::Sender<Result<bool, CallError>>,
    },
    RetryPlay {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    RenderContext {
        reply: oneshot::Sender<Option<Arc<dyn RenderContext>>>,
    },
    HangUp {
        reply: oneshot::Sender<()>,
    },
}

// --- Results marshaled back onto the call-control task ---
// Every event carries the sequence number of the call it belongs to so
// results from a call that already ended are dropped.
pub(crate) enum ControlEvent {
    SessionCreated {
        seq: u64,
        session: Arc<PeerSession>,
    },
    PublishNegotiated {
        seq: u64,
    },
    PublishFailed {
        seq: u64,
        error: CallError,
    },
    PlayNegotiated {
        seq: u64,
    },
    PlayFailed {
        seq: u64,
        error: CallError,
    },
    Peer {
        seq: u64,
        event: PeerEvent,
    },
    Tick {
        seq: u64,
    },
}
