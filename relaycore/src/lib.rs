//! Runtime-agnostic core for relay-backed calls.
//!
//! Holds the pieces that do not need an async runtime: the HTTP client seam,
//! the SRS signaling wire format and the value types shared by the call
//! session runtime.

pub mod net;
pub mod signaling;
pub mod types;
