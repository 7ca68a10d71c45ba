//! Real-time fan-out over WebSockets

pub mod api;
pub mod broadcaster;

pub use broadcaster::{Channel, ConnectionBroadcaster, Frame, SocketSink};
