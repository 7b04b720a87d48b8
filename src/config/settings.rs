// src/config/settings.rs
//! Server configuration settings.
//!
//! This module contains the server configuration structures and
//! implementation for loading, parsing, and validating user-provided
//! settings. A JSON config file supplies the base values; flags given on
//! the command line override it.

use clap::Parser;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::config::constants::MIN_TUN_MTU;
use crate::config::defaults;
use crate::network::ip_pool::parse_ranges;

/// Error type for configuration-related operations
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid subnet format: {0}")]
    InvalidSubnet(String),

    #[error("Invalid socket address: {0}")]
    InvalidSocketAddr(#[from] std::net::AddrParseError),
}

/// Command line arguments for the server
#[derive(Parser, Debug, Clone, Default)]
#[clap(
    name = "AeroNyx Tunnel Server",
    about = "Point-to-point VPN tunnel server relaying raw IP traffic over TUN interfaces",
    version,
    author
)]
pub struct ServerArgs {
    /// Address to accept VPN clients on
    #[clap(long)]
    pub listen: Option<String>,

    /// Shared passcode clients must present (empty disables the check)
    #[clap(long)]
    pub passcode: Option<String>,

    /// Private IPv4 range client blocks are carved from (repeatable)
    #[clap(long = "address-range")]
    pub address_ranges: Vec<String>,

    /// MTU of the per-client TUN interfaces
    #[clap(long)]
    pub tun_mtu: Option<u16>,

    /// TCP keepalive idle time for client connections in seconds (0 disables)
    #[clap(long)]
    pub tcp_keepalive: Option<u64>,

    /// Log level
    #[clap(long)]
    pub log_level: Option<String>,

    /// Also write logs to this file (rotated daily)
    #[clap(long)]
    pub log_file: Option<String>,

    /// Configuration file path
    #[clap(long)]
    pub config_file: Option<String>,
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server listen address
    pub listen_addr: SocketAddr,

    /// Shared passcode
    #[serde(default)]
    pub passcode: Option<String>,

    /// Ranges the address pool is built from
    #[serde(default = "defaults::default_address_ranges")]
    pub address_ranges: Vec<String>,

    /// TUN interface MTU
    #[serde(default = "defaults::default_tun_mtu")]
    pub tun_mtu: u16,

    /// TCP keepalive idle time in seconds
    #[serde(default = "defaults::default_tcp_keepalive")]
    pub tcp_keepalive: u64,

    /// Log level
    #[serde(default = "defaults::default_log_level")]
    pub log_level: String,

    /// Optional log file
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, defaults::DEFAULT_PORT)),
            passcode: None,
            address_ranges: defaults::default_address_ranges(),
            tun_mtu: defaults::DEFAULT_TUN_MTU,
            tcp_keepalive: defaults::DEFAULT_TCP_KEEPALIVE,
            log_level: defaults::DEFAULT_LOG_LEVEL.to_string(),
            log_file: None,
        }
    }
}

impl ServerConfig {
    /// Create a new server configuration from command line arguments
    pub fn from_args(args: ServerArgs) -> Result<Self, ConfigError> {
        let mut config = match &args.config_file {
            Some(path) => Self::read_file(Path::new(path))?,
            None => Self::default(),
        };

        // Override with command line arguments if explicitly provided
        if let Some(listen) = args.listen {
            config.listen_addr = listen.parse()?;
        }
        if args.passcode.is_some() {
            config.passcode = args.passcode;
        }
        if !args.address_ranges.is_empty() {
            config.address_ranges = args.address_ranges;
        }
        if let Some(mtu) = args.tun_mtu {
            config.tun_mtu = mtu;
        }
        if let Some(keepalive) = args.tcp_keepalive {
            config.tcp_keepalive = keepalive;
        }
        if let Some(level) = args.log_level {
            config.log_level = level;
        }
        if let Some(file) = args.log_file {
            config.log_file = Some(PathBuf::from(file));
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address_ranges.is_empty() {
            return Err(ConfigError::InvalidSubnet(
                "At least one address range is required".to_string(),
            ));
        }
        self.parsed_ranges()?;

        if self.tun_mtu < MIN_TUN_MTU {
            return Err(ConfigError::Invalid(format!(
                "TUN MTU must be at least {}, got {}",
                MIN_TUN_MTU, self.tun_mtu
            )));
        }

        if self.log_level.trim().is_empty() {
            return Err(ConfigError::Invalid("Log level must not be empty".to_string()));
        }

        Ok(())
    }

    /// Parsed, normalized address ranges
    pub fn parsed_ranges(&self) -> Result<Vec<Ipv4Network>, ConfigError> {
        parse_ranges(&self.address_ranges).map_err(|e| ConfigError::InvalidSubnet(e.to_string()))
    }

    /// The passcode clients must present, if one is configured
    pub fn passcode(&self) -> Option<&str> {
        self.passcode.as_deref().filter(|p| !p.is_empty())
    }

    /// Keepalive idle time for client sockets, if enabled
    pub fn keepalive(&self) -> Option<Duration> {
        (self.tcp_keepalive > 0).then(|| Duration::from_secs(self.tcp_keepalive))
    }

    /// Save configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        info!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::read_file(path)?;
        config.validate()?;
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}
