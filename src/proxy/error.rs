//! Error types for proxy operations.
//!
//! - Server errors (binding, accept, shutdown)
//! - Tunnel errors (malformed CONNECT targets, upstream dials)
//! - Pipeline errors (decoding, incomplete responses, upstream trust)
//! - Transport wrappers (I/O, hyper, rustls, tungstenite)

use crate::ca::CaError;
use thiserror::Error;

/// Unified error type for proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error (socket operations, file access).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hyper HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Certificate issuance or root CA failure.
    #[error("Certificate error: {0}")]
    Cert(#[from] CaError),

    /// A listener could not be bound.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// The address we tried to bind.
        addr: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to connect to upstream server.
    #[error("Failed to connect to upstream '{addr}': {message}")]
    UpstreamConnect {
        /// The address we tried to connect to.
        addr: String,
        /// Error message.
        message: String,
    },

    /// A response body could not be decoded.
    #[error("Failed to decode {encoding} body: {message}")]
    Decode {
        /// The content encoding being decoded.
        encoding: String,
        /// Error message.
        message: String,
    },

    /// A hook produced a response without a required field.
    #[error("Response is missing {0}")]
    MissingResponseField(&'static str),

    /// The upstream certificate was rejected.
    #[error("Untrusted upstream certificate for '{host}': {message}")]
    Trust {
        /// Host whose certificate failed verification.
        host: String,
        /// Verification error.
        message: String,
    },

    /// The CONNECT target could not be parsed.
    #[error("Invalid CONNECT target: {0}")]
    ProtocolSniff(String),

    /// A proxied request could not be understood or rebuilt.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// TLS error during handshake or configuration.
    #[error("TLS error: {0}")]
    Tls(String),

    /// WebSocket protocol or transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Upgrade to tunnel or WebSocket failed.
    #[error("HTTP upgrade failed: {0}")]
    UpgradeFailed(String),

    /// Server assembled with incomplete configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An operation exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Server shutdown requested.
    #[error("Server shutdown")]
    Shutdown,
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

impl ProxyError {
    /// Whether this error came from upstream certificate verification.
    pub fn is_trust_error(&self) -> bool {
        matches!(self, ProxyError::Trust { .. })
    }

    /// Whether this error is a routine peer disconnect.
    pub fn is_connection_reset(&self) -> bool {
        let msg = self.to_string().to_lowercase();
        msg.contains("connection reset")
            || msg.contains("broken pipe")
            || msg.contains("connection closed before message completed")
    }
}

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::Tls(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ProxyError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ProxyError::WebSocket(err.to_string())
    }
}

impl From<hyper::http::Error> for ProxyError {
    fn from(err: hyper::http::Error) -> Self {
        ProxyError::InvalidRequest(err.to_string())
    }
}
