//! WebRTC call sessions through an SRS-style relay.
//!
//! Each side of a call publishes its own stream to the relay and plays the
//! other side's stream, so a call is two independent peer connections plus
//! a small state machine on top.
//!
//! # Architecture
//!
//! - [`SignalingTransport`]: one HTTP offer/answer exchange with the relay
//! - [`PeerSession`]: a single publish or play connection and its negotiation
//! - [`SessionManager`]: runs a call end to end and exposes its state
//! - [`CallState`] & [`CallTransition`]: call lifecycle
//! - [`media`]: local tracks, device hooks and the webrtc-rs engine
//!
//! # Call flow
//!
//! Publish is negotiated first. Once the relay accepted our stream the call
//! rings; play is negotiated after a short delay. The call becomes connected
//! when the publish transport reports ICE connected. Play failures are logged
//! and leave the call running.

mod error;
mod manager;
pub mod media;
mod messages;
mod peer;
mod signaling;
mod state;
mod timer;

pub use error::CallError;
pub use manager::{CallContext, SessionManager};
pub use peer::{PeerEvent, PeerSession, PeerState};
pub use signaling::SignalingTransport;
pub use state::{CallState, CallStatus, CallTransition, InvalidTransition};
