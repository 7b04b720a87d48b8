// src/config/constants.rs
//! Application constants and fixed settings.
//!
//! This module contains fixed values that are used throughout the server,
//! such as the address block layout, protocol limits and buffer sizes.

/// Address block layout
///
/// Every client session gets one /29 block: 8 addresses, of which the
/// server gateway (+1), server endpoint (+2), client gateway (+3) and
/// client endpoint (+4) are handed out.
pub const BLOCK_PREFIX: u8 = 29;
pub const BLOCK_SIZE: u32 = 1 << (32 - BLOCK_PREFIX as u32);
pub const SERVER_GATEWAY_OFFSET: u32 = 1;
pub const SERVER_IP_OFFSET: u32 = 2;
pub const CLIENT_GATEWAY_OFFSET: u32 = 3;
pub const CLIENT_IP_OFFSET: u32 = 4;

/// Private ranges walked by the address pool, in allocation order
pub const PRIVATE_RANGES: &[&str] = &["192.168.0.0/16", "172.16.0.0/12", "10.0.0.0/8"];

/// Handshake protocol limits
pub const MAX_HELLO_SIZE: usize = 64 * 1024; // 64KB

/// TUN settings
pub const TUN_MTU: u16 = 1500; // Default MTU size
pub const MIN_TUN_MTU: u16 = 576;

/// Network constants
pub const TCP_KEEPALIVE_SECS: u64 = 60;

/// Kernel forwarding switches
pub const IPV4_FORWARDING_PATH: &str = "/proc/sys/net/ipv4/ip_forward";
pub const IPV6_FORWARDING_PATH: &str = "/proc/sys/net/ipv6/conf/all/forwarding";
pub const IPV4_FORWARDING_SYSCTL: &str = "net.ipv4.ip_forward";
pub const IPV6_FORWARDING_SYSCTL: &str = "net.ipv6.conf.all.forwarding";
