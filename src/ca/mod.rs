//! Certificate authority for TLS interception.
//!
//! Owns the long-lived root used to forge per-host leaf certificates. The
//! root must be trusted by clients for interception to be transparent;
//! installing it into a trust store is left to the operator.

mod authority;
mod error;

pub use authority::{
    CA_CERT_FILENAME, CA_KEY_FILENAME, LEAF_ORGANIZATION, LeafCertificate, ROOT_COMMON_NAME,
    RootAuthority, default_root_dir, is_root_present, read_pem_certificates,
};
pub use error::CaError;
