// src/network/tun.rs
//! TUN device and host routing management.
//!
//! This module is the Linux implementation of [`NetworkConfigurator`]:
//! kernel forwarding switches through procfs (falling back to `sysctl`),
//! masquerading through `iptables`, and per-client TUN devices through the
//! `tun` crate.

use ipnetwork::Ipv4Network;
use std::fs;
use std::process::{Command, Output};
use tracing::{debug, error, info, warn};
use tun::Device as _;

use crate::config::constants::{
    IPV4_FORWARDING_PATH, IPV4_FORWARDING_SYSCTL, IPV6_FORWARDING_PATH, IPV6_FORWARDING_SYSCTL,
};
use crate::network::configurator::{
    InterfaceSettings, NetworkConfigurator, NetworkError, VirtualInterface,
};

impl VirtualInterface for tun::AsyncDevice {
    fn name(&self) -> String {
        self.get_ref().name().to_string()
    }
}

/// Host network configuration backed by procfs, iptables and /dev/net/tun
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemNetwork;

impl SystemNetwork {
    pub fn new() -> Self {
        Self
    }
}

impl NetworkConfigurator for SystemNetwork {
    type Interface = tun::AsyncDevice;

    fn default_network_interface(&self) -> Result<String, NetworkError> {
        get_main_interface()
    }

    fn ipv4_forwarding(&self) -> Result<String, NetworkError> {
        read_forwarding(IPV4_FORWARDING_PATH)
    }

    fn ipv6_forwarding(&self) -> Result<String, NetworkError> {
        read_forwarding(IPV6_FORWARDING_PATH)
    }

    fn set_ipv4_forwarding(&self, value: &str) -> Result<(), NetworkError> {
        write_forwarding(IPV4_FORWARDING_PATH, IPV4_FORWARDING_SYSCTL, value)
    }

    fn set_ipv6_forwarding(&self, value: &str) -> Result<(), NetworkError> {
        write_forwarding(IPV6_FORWARDING_PATH, IPV6_FORWARDING_SYSCTL, value)
    }

    fn enable_masquerading(&self, interface: &str) -> Result<(), NetworkError> {
        if masquerade_rule_present(interface)? {
            debug!("MASQUERADE rule for {} already present", interface);
            return Ok(());
        }
        run_iptables(&masquerade_rule("-A", interface))?;
        info!("Enabled IP masquerading on {}", interface);
        Ok(())
    }

    fn disable_masquerading(&self, interface: &str) -> Result<(), NetworkError> {
        if !masquerade_rule_present(interface)? {
            debug!("No MASQUERADE rule for {} to remove", interface);
            return Ok(());
        }
        run_iptables(&masquerade_rule("-D", interface))?;
        info!("Disabled IP masquerading on {}", interface);
        Ok(())
    }

    fn create_virtual_interface(&self) -> Result<Self::Interface, NetworkError> {
        // Addressing is applied separately once the device exists
        let config = tun::Configuration::default();

        let device = tun::create_as_async(&config).map_err(|e| {
            let err_str = e.to_string();
            if err_str.contains("permission denied") || err_str.contains("Operation not permitted") {
                NetworkError::PermissionDenied(
                    "Permission denied when creating TUN device. Run as root or with CAP_NET_ADMIN."
                        .into(),
                )
            } else {
                NetworkError::Creation(err_str)
            }
        })?;

        debug!("Allocated TUN device {}", device.name());
        Ok(device)
    }

    fn configure_virtual_interface(
        &self,
        interface: &mut Self::Interface,
        settings: &InterfaceSettings,
    ) -> Result<(), NetworkError> {
        let netmask = Ipv4Network::new(settings.ip, settings.prefix)
            .map_err(|e| NetworkError::Configuration(format!("Invalid prefix: {}", e)))?
            .mask();

        debug!(
            "TUN configuration: IP={}, Gateway={}, Mask={}, MTU={}",
            settings.ip, settings.gateway, netmask, settings.mtu
        );

        let device = interface.get_mut();
        let name = device.name().to_string();
        let configure = |step: &str, result: Result<(), tun::Error>| {
            result.map_err(|e| {
                error!("Failed to set {} on {}: {}", step, name, e);
                NetworkError::Configuration(format!("{} on {}: {}", step, name, e))
            })
        };

        configure("address", device.set_address(settings.ip))?;
        configure("destination", device.set_destination(settings.gateway))?;
        configure("netmask", device.set_netmask(netmask))?;
        configure("mtu", device.set_mtu(i32::from(settings.mtu)))?;
        configure("link state", device.enabled(true))?;

        info!(
            "TUN device {} configured with IP {}/{} via {}",
            name, settings.ip, settings.prefix, settings.gateway
        );
        Ok(())
    }
}

fn read_forwarding(path: &str) -> Result<String, NetworkError> {
    let value = fs::read_to_string(path)?;
    Ok(value.trim().to_string())
}

fn write_forwarding(path: &str, sysctl_key: &str, value: &str) -> Result<(), NetworkError> {
    let err = match fs::write(path, value) {
        Ok(()) => {
            debug!("Set {} = {} via /proc/sys", sysctl_key, value);
            return Ok(());
        }
        Err(e) => e,
    };

    // Try using sysctl as fallback if the direct write fails
    let assignment = format!("{}={}", sysctl_key, value);
    let output = Command::new("sysctl")
        .args(["-w", assignment.as_str()])
        .output()
        .map_err(|io_err| NetworkError::CommandError(format!("Failed to execute sysctl: {}", io_err)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!(
            "Failed to set {} using /proc/sys ({}) and sysctl ({}). Check permissions.",
            sysctl_key, err, stderr
        );
        return Err(NetworkError::Configuration(format!(
            "Failed to set {} = {} (tried /proc/sys and sysctl): {}, {}",
            sysctl_key, value, err, stderr
        )));
    }

    debug!("Set {} = {} via sysctl", sysctl_key, value);
    Ok(())
}

fn masquerade_rule<'a>(action: &'a str, interface: &'a str) -> [&'a str; 8] {
    ["-t", "nat", action, "POSTROUTING", "-o", interface, "-j", "MASQUERADE"]
}

fn masquerade_rule_present(interface: &str) -> Result<bool, NetworkError> {
    let output = iptables(&masquerade_rule("-C", interface))?;
    Ok(output.status.success())
}

fn iptables(args: &[&str]) -> Result<Output, NetworkError> {
    Command::new("iptables")
        .args(args)
        .output()
        .map_err(|e| NetworkError::CommandError(format!("Failed to execute iptables: {}", e)))
}

fn run_iptables(args: &[&str]) -> Result<(), NetworkError> {
    let output = iptables(args)?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!("iptables command failed ({:?}): {}", args, stderr);
        return Err(NetworkError::Configuration(format!(
            "Failed to apply iptables rule ({:?}): {}",
            args, stderr
        )));
    }
    debug!("iptables rule applied successfully: {:?}", args);
    Ok(())
}

/// Get the main network interface for outgoing traffic
fn get_main_interface() -> Result<String, NetworkError> {
    let output = Command::new("ip")
        .args(["route", "show", "default"])
        .output()
        .map_err(|e| NetworkError::CommandError(format!("Failed to execute 'ip route': {}", e)))?;

    if output.status.success() {
        if let Some(iface) = parse_dev_field(&String::from_utf8_lossy(&output.stdout)) {
            return Ok(iface);
        }
    }

    // Try 'route -n' as fallback
    warn!("'ip route' did not report a default interface, trying 'route -n'");
    let output_route = Command::new("route")
        .arg("-n")
        .output()
        .map_err(|e| NetworkError::CommandError(format!("Failed to execute 'route -n': {}", e)))?;
    if output_route.status.success() {
        if let Some(iface) = parse_route_table(&String::from_utf8_lossy(&output_route.stdout)) {
            return Ok(iface);
        }
    }

    Err(NetworkError::Configuration(
        "Could not determine default route interface".into(),
    ))
}

/// Pull the interface name out of `ip route` output
fn parse_dev_field(output: &str) -> Option<String> {
    let mut parts = output.split_whitespace();
    while let Some(part) = parts.next() {
        if part == "dev" {
            return parts.next().map(str::to_string);
        }
    }
    None
}

/// Find the default route's interface in `route -n` output
fn parse_route_table(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 8 && parts[0] == "0.0.0.0" && parts[2] == "0.0.0.0" {
            Some(parts[7].to_string())
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dev_field() {
        let output = "default via 192.168.1.1 dev enp3s0 proto dhcp metric 100\n";
        assert_eq!(parse_dev_field(output).as_deref(), Some("enp3s0"));
        assert_eq!(parse_dev_field("default via 10.0.0.1"), None);
        assert_eq!(parse_dev_field(""), None);
    }

    #[test]
    fn test_parse_route_table() {
        let output = "\
Kernel IP routing table
Destination     Gateway         Genmask         Flags Metric Ref    Use Iface
0.0.0.0         192.168.1.1     0.0.0.0         UG    100    0        0 eth0
192.168.1.0     0.0.0.0         255.255.255.0   U     100    0        0 eth0
";
        assert_eq!(parse_route_table(output).as_deref(), Some("eth0"));
        assert_eq!(parse_route_table("Kernel IP routing table\n"), None);
    }

    #[test]
    fn test_masquerade_rule_shape() {
        assert_eq!(
            masquerade_rule("-A", "eth0"),
            ["-t", "nat", "-A", "POSTROUTING", "-o", "eth0", "-j", "MASQUERADE"]
        );
    }
}
