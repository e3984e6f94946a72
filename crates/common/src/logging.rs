//! Logging utilities for the dhcp6 supplicant.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing with sensible defaults.
///
/// Uses the RUST_LOG environment variable to control log levels,
/// falling back to `default_level` (e.g. "info").
pub fn init(default_level: &str) {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();
}

/// Initialize tracing with JSON formatting (useful for structured logging).
pub fn init_json(default_level: &str) {
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();
}
