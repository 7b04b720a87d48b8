// src/server/mod.rs
//! Server module for the tunnel server.
//!
//! This module provides the listener lifecycle, the hello handshake and
//! the per-connection provisioning and relay pipeline.

pub mod core;
pub mod handshake;
pub mod relay;
pub mod session;

// Re-export commonly used items
pub use core::{ServerError, ServerState, SetupStep, VpnServer};
pub use handshake::{HandshakeCoordinator, HandshakeError};
pub use relay::{relay, Direction, RelayOutcome};
pub use session::{serve_connection, SessionContext, SessionError, TunnelSession};
