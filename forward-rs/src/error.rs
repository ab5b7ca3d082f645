//! Error types for forward-rs

use thiserror::Error;

/// Result type alias for forward-rs operations
pub type Result<T> = std::result::Result<T, ForwardError>;

/// Forwarding error types
#[derive(Error, Debug)]
pub enum ForwardError {
    /// Configuration error (settings or hosts file)
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Host is not routed, so no certificate may be issued for it
    #[error("Host not configured: {host}")]
    HostDenied { host: String },

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(String),
}
