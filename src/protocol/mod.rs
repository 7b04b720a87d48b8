// src/protocol/mod.rs
//! Protocol module for the tunnel server.
//!
//! This module defines the handshake messages exchanged when a client
//! connects and the JSON framing they travel in.

pub mod codec;
pub mod types;

// Re-export commonly used items
pub use codec::{ClientCodec, CodecError, JsonCodec, ServerCodec};
pub use types::{ClientHello, HandshakeStatus, ServerHello};
