// src/utils/mod.rs
//! Utility functions and helpers.
//!
//! This module contains general-purpose utilities used across
//! the application.

pub mod logging;
pub mod system;

/// Compare two byte strings without exiting early on the first mismatch
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}
