// src/config/defaults.rs
//! Default configurations for the tunnel server.
//!
//! This module provides sensible default values for configuration settings
//! when not explicitly specified by the user.

/// Default server listening port
pub const DEFAULT_PORT: u16 = 7000;

/// Default log level
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default TUN MTU
pub const DEFAULT_TUN_MTU: u16 = crate::config::constants::TUN_MTU;

/// Default TCP keepalive idle time in seconds (0 disables keepalive)
pub const DEFAULT_TCP_KEEPALIVE: u64 = crate::config::constants::TCP_KEEPALIVE_SECS;

/// Default address ranges for client blocks
pub fn default_address_ranges() -> Vec<String> {
    crate::config::constants::PRIVATE_RANGES
        .iter()
        .map(|range| range.to_string())
        .collect()
}

pub fn default_tun_mtu() -> u16 {
    DEFAULT_TUN_MTU
}

pub fn default_tcp_keepalive() -> u64 {
    DEFAULT_TCP_KEEPALIVE
}

pub fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
