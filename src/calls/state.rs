//! Call state machine implementation.

use chrono::{DateTime, Utc};
use relaycore::types::{CallDirection, CallKind, CameraFacing};
use serde::Serialize;

/// Lifecycle of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum CallStatus {
    #[default]
    Idle,
    /// Local media up, publish negotiation running.
    Connecting,
    /// Publishing; waiting for the transport to connect.
    Ringing,
    /// Media flowing; the duration counter runs.
    Connected,
    /// Terminal.
    Ended,
}

/// State transitions for calls.
#[derive(Debug, Clone)]
pub enum CallTransition {
    Start,
    PublishNegotiated,
    MediaConnected,
    Ended { error: Option<String> },
}

/// Snapshot of a call as shown to the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallState {
    pub status: CallStatus,
    pub kind: CallKind,
    pub direction: CallDirection,
    pub local_id: String,
    pub remote_id: String,
    pub remote_name: String,
    pub duration_seconds: u64,
    pub muted: bool,
    pub speaker_on: bool,
    pub camera_facing: CameraFacing,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub connected_at: Option<DateTime<Utc>>,
}

impl Default for CallState {
    fn default() -> Self {
        Self::new(
            CallKind::Voice,
            CallDirection::Outgoing,
            String::new(),
            String::new(),
            String::new(),
        )
    }
}

impl CallState {
    pub fn new(
        kind: CallKind,
        direction: CallDirection,
        local_id: impl Into<String>,
        remote_id: impl Into<String>,
        remote_name: impl Into<String>,
    ) -> Self {
        Self {
            status: CallStatus::Idle,
            kind,
            direction,
            local_id: local_id.into(),
            remote_id: remote_id.into(),
            remote_name: remote_name.into(),
            duration_seconds: 0,
            muted: false,
            // Video calls start on the loudspeaker, voice calls on the earpiece.
            speaker_on: kind.has_video(),
            camera_facing: CameraFacing::Front,
            error_message: None,
            started_at: None,
            connected_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            CallStatus::Connecting | CallStatus::Ringing | CallStatus::Connected
        )
    }

    pub fn is_ended(&self) -> bool {
        self.status == CallStatus::Ended
    }

    /// Apply a state transition. Returns error if transition is invalid.
    pub fn apply_transition(&mut self, transition: CallTransition) -> Result<(), InvalidTransition> {
        match (self.status, transition) {
            (CallStatus::Idle, CallTransition::Start) => {
                self.status = CallStatus::Connecting;
                self.started_at = Some(Utc::now());
            }
            (CallStatus::Connecting, CallTransition::PublishNegotiated) => {
                self.status = CallStatus::Ringing;
            }
            (CallStatus::Ringing, CallTransition::MediaConnected) => {
                self.status = CallStatus::Connected;
                self.connected_at = Some(Utc::now());
            }
            (
                CallStatus::Connecting | CallStatus::Ringing | CallStatus::Connected,
                CallTransition::Ended { error },
            ) => {
                self.status = CallStatus::Ended;
                self.error_message = error.filter(|e| !e.is_empty());
            }
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: format!("{:?}", current),
                    attempted: format!("{:?}", transition),
                });
            }
        }
        Ok(())
    }

    /// Advances the duration counter by one second. Only counts while connected.
    pub fn tick(&mut self) -> bool {
        if self.status == CallStatus::Connected {
            self.duration_seconds += 1;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}
