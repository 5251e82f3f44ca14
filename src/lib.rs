// Core protocol pieces live in relaycore and are re-exported here.
pub use relaycore::{net, signaling};

pub mod types {
    pub use relaycore::types::*;
    pub mod events;
}

pub mod calls;
pub mod config;

pub use calls::{CallContext, CallError, CallState, CallStatus, SessionManager};
pub use config::CallConfig;
