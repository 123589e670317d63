//! Error types for the proxy listener and TLS interception.

use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from the local certificate authority.
#[derive(Debug, Error)]
pub enum CaError {
    /// Could not create the CA directory or set its permissions.
    #[error("Failed to prepare CA directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to read CA material.
    #[error("Failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to write CA material.
    #[error("Failed to write {path}: {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to generate or load a key pair.
    #[error("Failed to generate key pair: {0}")]
    KeyGeneration(String),

    /// Failed to build a certificate.
    #[error("Failed to generate certificate: {0}")]
    CertGeneration(String),

    /// A host name cannot be placed in a certificate.
    #[error("Invalid certificate name '{0}'")]
    InvalidName(String),
}

/// Unified error type for proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error (socket operations, file access).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hyper HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Could not bind the listener.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The listener may only be exposed on loopback.
    #[error("Refusing to listen on non-loopback address {0}")]
    NonLoopback(SocketAddr),

    /// Malformed proxy request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// TLS error during handshake or certificate operations.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Certificate authority failure.
    #[error("Certificate authority error: {0}")]
    Ca(#[from] CaError),

    /// Connection timeout.
    #[error("Connection timeout")]
    Timeout,

    /// Failed to connect to upstream server.
    #[error("Failed to connect to upstream '{addr}': {message}")]
    UpstreamConnect {
        /// The address we tried to connect to.
        addr: String,
        /// Error message.
        message: String,
    },
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::Tls(err.to_string())
    }
}
