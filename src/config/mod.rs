// src/config/mod.rs
//! Configuration module for the tunnel server.
//!
//! This module manages server settings, constants, and default configurations.

pub mod constants;
pub mod defaults;
pub mod settings;

pub use settings::{ConfigError, ServerArgs, ServerConfig};
