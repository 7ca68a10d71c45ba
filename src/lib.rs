//! TrustGate Backend Library
//!
//! Session and trust layer for a multi-tenant task API: refresh-token
//! rotation, login throttling, cached permissions and authenticated
//! real-time fan-out.

pub mod api;
pub mod auth;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod maintenance;
pub mod middleware;
pub mod ws;

pub use error::{SessionError, SessionResult};
