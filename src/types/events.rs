use crate::calls::media::RemoteTrackRef;
use relaycore::types::{ConnectionState, PeerRole};
use std::time::Duration;
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

/// Everything a call reports to its observers, delivered over one channel.
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Publish negotiation succeeded; our stream exists on the relay.
    Publishing,
    /// The publish transport connected for the first time.
    Connected,
    /// Raw connection state change of one peer session, including transient
    /// disconnects that do not affect the call status.
    ConnectionChanged {
        role: PeerRole,
        state: ConnectionState,
    },
    /// A remote video track to attach a renderer to. The handle does not keep
    /// the track alive.
    RemoteTrack {
        role: PeerRole,
        track: RemoteTrackRef,
    },
    /// The play side could not be negotiated. The call continues without
    /// remote media.
    PlayFailed { error: String },
    /// Terminal; fired once per call.
    Ended {
        error: Option<String>,
        /// How long the UI should keep the ended call on screen.
        dismiss_after: Duration,
    },
}

impl CallEvent {
    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }
}

/// Broadcast bus for [`CallEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CallEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            sender: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.sender.subscribe()
    }

    /// Publishes to current subscribers; having none is fine.
    pub fn dispatch(&self, event: CallEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
