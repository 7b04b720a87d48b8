// src/utils/logging.rs
//! Logging utilities for the application.
//!
//! This module provides functions for initializing and configuring
//! the logging system.

use std::ffi::OsStr;
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// `RUST_LOG` wins over the configured level when it is set
fn build_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level))
}

fn init_error(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(
        io::ErrorKind::Other,
        format!("Failed to initialize logging: {}", e),
    )
}

/// Initialize the logging system with console output
pub fn init_logging(log_level: &str) -> io::Result<()> {
    let console_layer = fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_thread_names(true)
        .with_writer(io::stdout);

    tracing_subscriber::registry()
        .with(console_layer.with_filter(build_filter(log_level)))
        .try_init()
        .map_err(init_error)
}

/// Console output plus a daily-rotated log file.
///
/// The returned guard flushes the file writer when dropped; keep it alive
/// for as long as the process logs.
pub fn init_file_logging(log_level: &str, log_file: &Path) -> io::Result<WorkerGuard> {
    let log_dir = log_file
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = log_file
        .file_name()
        .unwrap_or_else(|| OsStr::new("aeronyx-tunnel.log"));

    std::fs::create_dir_all(log_dir)?;
    let file_appender = rolling::daily(log_dir, file_name);
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_thread_names(true)
        .with_writer(non_blocking_writer)
        .with_ansi(false);

    let console_layer = fmt::layer().with_writer(io::stdout).with_ansi(true);

    tracing_subscriber::registry()
        .with(file_layer.with_filter(build_filter(log_level)))
        .with(console_layer.with_filter(build_filter(log_level)))
        .try_init()
        .map_err(init_error)?;

    Ok(guard)
}

/// Log a security event with structured fields
pub fn log_security_event(event_type: &str, details: &str) {
    tracing::warn!(
        security_event.type = event_type,
        security_event.details = details,
        "Security event: [{}] {}",
        event_type,
        details
    );
}
