//! Error types shared across the daemon.

use thiserror::Error;

/// Errors raised on the server-link path.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("DNS lookup for connect block in progress")]
    DnsPending,
    #[error("DNS lookup for connect block failed")]
    DnsFailed,
    #[error("connect timeout")]
    ConnectTimeout,
    #[error("timeout during TLS handshake")]
    TlsTimeout,
    #[error("TLS handshake failed: {0}")]
    Tls(String),
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),
}
