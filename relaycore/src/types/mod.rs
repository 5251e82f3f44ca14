pub mod call;

pub use call::{CallDirection, CallKind, CameraFacing, ConnectionState, PeerRole, TrackKind};
