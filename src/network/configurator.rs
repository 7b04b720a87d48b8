// src/network/configurator.rs
//! Host network configuration seam.
//!
//! Everything the server changes on the host (kernel forwarding switches,
//! masquerading, per-client TUN interfaces) goes through the
//! [`NetworkConfigurator`] trait so the lifecycle code can be exercised
//! without touching the machine it runs on.

use std::net::Ipv4Addr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Error type for host network configuration
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("TUN device creation failed: {0}")]
    Creation(String),

    #[error("TUN device configuration failed: {0}")]
    Configuration(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Command execution failed: {0}")]
    CommandError(String),
}

/// Addressing applied to a freshly created virtual interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceSettings {
    pub ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub prefix: u8,
    pub mtu: u16,
}

/// A configured virtual interface the relay can stream bytes through
pub trait VirtualInterface: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    fn name(&self) -> String;
}

/// Forwarding state found on the host before the server touched it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalNetworkState {
    /// Interface carrying the default route, masqueraded while serving
    pub default_interface: String,
    pub ipv4_forwarding: String,
    pub ipv6_forwarding: String,
}

/// Privileged host configuration used by the server.
///
/// Enable and disable operations are idempotent. Callers hold an
/// [`ElevatedScope`](crate::utils::system::ElevatedScope) around them.
pub trait NetworkConfigurator: Send + Sync + 'static {
    type Interface: VirtualInterface;

    fn default_network_interface(&self) -> Result<String, NetworkError>;

    fn ipv4_forwarding(&self) -> Result<String, NetworkError>;

    fn ipv6_forwarding(&self) -> Result<String, NetworkError>;

    fn set_ipv4_forwarding(&self, value: &str) -> Result<(), NetworkError>;

    fn set_ipv6_forwarding(&self, value: &str) -> Result<(), NetworkError>;

    fn enable_ipv4_forwarding(&self) -> Result<(), NetworkError> {
        self.set_ipv4_forwarding("1")
    }

    fn enable_ipv6_forwarding(&self) -> Result<(), NetworkError> {
        self.set_ipv6_forwarding("1")
    }

    fn enable_masquerading(&self, interface: &str) -> Result<(), NetworkError>;

    fn disable_masquerading(&self, interface: &str) -> Result<(), NetworkError>;

    fn create_virtual_interface(&self) -> Result<Self::Interface, NetworkError>;

    fn configure_virtual_interface(
        &self,
        interface: &mut Self::Interface,
        settings: &InterfaceSettings,
    ) -> Result<(), NetworkError>;

    /// Snapshot the values `serve` has to put back on shutdown
    fn capture_original_state(&self) -> Result<OriginalNetworkState, NetworkError> {
        Ok(OriginalNetworkState {
            default_interface: self.default_network_interface()?,
            ipv4_forwarding: self.ipv4_forwarding()?,
            ipv6_forwarding: self.ipv6_forwarding()?,
        })
    }
}
