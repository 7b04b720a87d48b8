// src/network/mod.rs
//! Network module for the tunnel server.
//!
//! This module hands out client address blocks and owns every change the
//! server makes to the host network: forwarding switches, masquerading and
//! per-client TUN devices.

pub mod configurator;
pub mod ip_pool;
pub mod tun;

// Re-export commonly used items
pub use configurator::{
    InterfaceSettings, NetworkConfigurator, NetworkError, OriginalNetworkState, VirtualInterface,
};
pub use ip_pool::{AddressBlock, AddressPool, PoolError};
pub use self::tun::SystemNetwork;
