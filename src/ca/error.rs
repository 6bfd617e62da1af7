//! Error types for certificate authority operations.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from root CA management and leaf issuance.
#[derive(Debug, Error)]
pub enum CaError {
    /// Root certificate or key is not present in the certificate directory.
    #[error("Root CA not found in {0}")]
    RootMissing(PathBuf),

    /// A root already exists and overwriting was not requested.
    #[error("Root CA already exists in {0}")]
    RootExists(PathBuf),

    /// Failed to read a certificate or key file.
    #[error("Failed to read {path}: {source}")]
    ReadFile {
        /// The file that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to write a certificate or key file.
    #[error("Failed to write {path}: {source}")]
    WriteFile {
        /// The file or directory that could not be written.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The root certificate or key on disk could not be parsed.
    #[error("Malformed root CA: {0}")]
    MalformedRoot(String),

    /// Key pair generation failed.
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// Certificate parameters could not be built or self-signed.
    #[error("Certificate generation failed: {0}")]
    CertGeneration(String),

    /// Signing a leaf with the root failed.
    #[error("Signing failed: {0}")]
    Signing(String),

    /// The requested hostname cannot appear in a certificate.
    #[error("Invalid hostname for certificate: '{0}'")]
    InvalidHostname(String),
}
