// src/lib.rs
//! Point-to-point VPN tunnel server.
//!
//! Clients connect over TCP, exchange one JSON hello to obtain a private
//! /29 address block, and then stream raw IP packets that the server relays
//! through a TUN interface dedicated to that client.

pub mod config;
pub mod network;
pub mod protocol;
pub mod server;
pub mod utils;

// Re-export the most commonly used items for convenience
pub use crate::config::{ConfigError, ServerArgs, ServerConfig};
pub use crate::network::{AddressBlock, AddressPool, NetworkConfigurator, SystemNetwork};
pub use crate::protocol::{ClientHello, HandshakeStatus, ServerHello};
pub use crate::server::{ServerError, ServerState, VpnServer};
pub use crate::utils::system::{ElevatedScope, PrivilegeManager};
