//! Common error types for the dhcp6 supplicant.

use std::fmt;

/// A specialized Result type for supplicant operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for supplicant operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("DUID error: {0}")]
    Duid(String),

    #[error("Link error: {0}")]
    Link(String),

    #[error("Lease error: {0}")]
    Lease(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown error: {0}")]
    Other(String),
}

impl Error {
    /// Create a new configuration error.
    pub fn config(msg: impl fmt::Display) -> Self {
        Error::Config(msg.to_string())
    }

    /// Create a new DUID error.
    pub fn duid(msg: impl fmt::Display) -> Self {
        Error::Duid(msg.to_string())
    }

    /// Create a new link error.
    pub fn link(msg: impl fmt::Display) -> Self {
        Error::Link(msg.to_string())
    }

    /// Create a new lease error.
    pub fn lease(msg: impl fmt::Display) -> Self {
        Error::Lease(msg.to_string())
    }

    /// Create a new other error.
    pub fn other(msg: impl fmt::Display) -> Self {
        Error::Other(msg.to_string())
    }
}
