//! Call-related error types.

use relaycore::signaling::SignalingError;
use thiserror::Error;

use super::media::MediaError;

#[derive(Debug, Error)]
pub enum CallError {
    /// Invalid local setup, e.g. a publish session without an audio track.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error("media error: {0}")]
    Media(#[from] MediaError),

    /// ICE failed or closed after the call was up.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] super::state::InvalidTransition),

    #[error("negotiation already in progress")]
    NegotiationInProgress,

    /// The session already ran its one negotiation attempt.
    #[error("peer session already negotiated")]
    AlreadyNegotiated,

    #[error("peer session disposed")]
    SessionDisposed,

    #[error("a call is already active")]
    CallActive,

    #[error("no active call")]
    NoActiveCall,

    #[error("call controller stopped")]
    ControllerGone,
}

impl CallError {
    pub fn signaling(&self) -> Option<&SignalingError> {
        match self {
            Self::Signaling(e) => Some(e),
            _ => None,
        }
    }
}
