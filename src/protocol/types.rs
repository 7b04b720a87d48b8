// src/protocol/types.rs
//! Handshake message types.
//!
//! A session starts with exactly one exchange: the client sends a
//! [`ClientHello`], the server answers with a [`ServerHello`]. Both travel
//! as single JSON objects over the accepted stream.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Outcome of a handshake as reported to the client.
///
/// Encoded on the wire as its integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum HandshakeStatus {
    Ok = 0,
    Forbidden = 1,
    BadRequest = 2,
    NoFreeIps = 3,
    InternalError = 4,
}

#[derive(Debug, Error)]
#[error("Unknown handshake status code: {0}")]
pub struct UnknownStatus(pub u8);

impl From<HandshakeStatus> for u8 {
    fn from(status: HandshakeStatus) -> Self {
        status as u8
    }
}

impl TryFrom<u8> for HandshakeStatus {
    type Error = UnknownStatus;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Ok),
            1 => Ok(Self::Forbidden),
            2 => Ok(Self::BadRequest),
            3 => Ok(Self::NoFreeIps),
            4 => Ok(Self::InternalError),
            other => Err(UnknownStatus(other)),
        }
    }
}

impl fmt::Display for HandshakeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "OK",
            Self::Forbidden => "Forbidden",
            Self::BadRequest => "BadRequest",
            Self::NoFreeIps => "NoFreeIPs",
            Self::InternalError => "InternalError",
        };
        f.write_str(name)
    }
}

/// First message of a session, sent by the client
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHello {
    /// Shared passcode, empty if the client has none
    #[serde(default)]
    pub passcode: String,
    /// Addresses already in use on the client side. Kept as strings so a
    /// malformed entry can be answered with `BadRequest`. `null` reads as
    /// an empty list.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub unavailable_private_ips: Vec<String>,
}

impl ClientHello {
    pub fn new(passcode: impl Into<String>) -> Self {
        Self {
            passcode: passcode.into(),
            unavailable_private_ips: Vec::new(),
        }
    }

    pub fn with_unavailable_ips<I, S>(mut self, ips: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unavailable_private_ips = ips.into_iter().map(Into::into).collect();
        self
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

// The passcode is never written to logs
impl fmt::Debug for ClientHello {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHello")
            .field("passcode", &if self.passcode.is_empty() { "" } else { "<redacted>" })
            .field("unavailable_private_ips", &self.unavailable_private_ips)
            .finish()
    }
}

/// Server answer to a [`ClientHello`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHello {
    pub status: HandshakeStatus,
    /// Address of the client-side TUN (OK only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tun_ip: Option<Ipv4Addr>,
    /// Gateway of the client-side TUN (OK only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tun_gateway: Option<Ipv4Addr>,
}

impl ServerHello {
    /// Successful handshake carrying the client's tunnel addresses
    pub fn ok(tun_ip: Ipv4Addr, tun_gateway: Ipv4Addr) -> Self {
        Self {
            status: HandshakeStatus::Ok,
            tun_ip: Some(tun_ip),
            tun_gateway: Some(tun_gateway),
        }
    }

    /// Rejection; rejected hellos never carry addresses
    pub fn rejected(status: HandshakeStatus) -> Self {
        Self {
            status,
            tun_ip: None,
            tun_gateway: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_codes() {
        let json = serde_json::to_string(&ServerHello::rejected(HandshakeStatus::NoFreeIps)).unwrap();
        assert_eq!(json, r#"{"status":3}"#);

        let parsed: ServerHello = serde_json::from_str(r#"{"status":1}"#).unwrap();
        assert_eq!(parsed, ServerHello::rejected(HandshakeStatus::Forbidden));

        assert!(serde_json::from_str::<ServerHello>(r#"{"status":9}"#).is_err());
    }

    #[test]
    fn test_ok_hello_carries_addresses() {
        let hello = ServerHello::ok(Ipv4Addr::new(10, 0, 0, 4), Ipv4Addr::new(10, 0, 0, 3));
        let json = serde_json::to_value(hello).unwrap();

        assert_eq!(json["status"], 0);
        assert_eq!(json["tun_ip"], "10.0.0.4");
        assert_eq!(json["tun_gateway"], "10.0.0.3");
    }

    #[test]
    fn test_client_hello_defaults_missing_fields() {
        let hello: ClientHello = serde_json::from_str("{}").unwrap();
        assert_eq!(hello, ClientHello::default());

        let hello: ClientHello = serde_json::from_str(
            r#"{"passcode":"pw","unavailable_private_ips":["192.168.0.1","oops"]}"#,
        )
        .unwrap();
        assert_eq!(hello.unavailable_private_ips, vec!["192.168.0.1", "oops"]);
    }

    #[test]
    fn test_client_hello_accepts_null_address_list() {
        let hello: ClientHello =
            serde_json::from_str(r#"{"unavailable_private_ips":null,"passcode":"pw"}"#).unwrap();
        assert_eq!(hello, ClientHello::new("pw"));

        assert!(serde_json::from_str::<ClientHello>(r#"{"unavailable_private_ips":"10.0.0.1"}"#).is_err());
    }

    #[test]
    fn test_client_hello_debug_hides_passcode() {
        let hello = ClientHello::new("hunter2");
        assert!(!format!("{:?}", hello).contains("hunter2"));
    }
}
