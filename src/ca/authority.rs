//! Root certificate authority and per-host leaf issuance.
//!
//! The root lives on disk as a PEM pair (`proxyRootCA.crt` / `proxyRootCA.key`)
//! and is created once, either by `eden-proxy init-ca` or on first start. After
//! loading it is never mutated; every intercepted host gets a leaf signed by it.
//!
//! # Leaf Shape
//!
//! - Fresh RSA-2048 key pair per issuance, SHA-256 signature
//! - Subject: `CN=<hostname>, O=Eden Proxy Authority`
//! - SAN: exactly the hostname (an IP SAN for literal addresses), no wildcards
//! - Extended key usage: serverAuth + clientAuth
//! - Validity: one day back-dated, two calendar years long
//!
//! # Example
//!
//! ```ignore
//! use eden_proxy::ca::RootAuthority;
//!
//! let root = RootAuthority::load_or_generate(&dir)?;
//! let leaf = root.issue_leaf("api.example.com")?;
//! println!("{}", leaf.certificate_pem);
//! ```

use super::error::CaError;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, PKCS_RSA_SHA256, SanType,
    SerialNumber,
};
use rustls_pki_types::CertificateDer;
use rustls_pki_types::pem::PemObject;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::net::IpAddr;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};
use uuid::Uuid;

/// File name of the root certificate inside the certificate directory.
pub const CA_CERT_FILENAME: &str = "proxyRootCA.crt";

/// File name of the root private key inside the certificate directory.
pub const CA_KEY_FILENAME: &str = "proxyRootCA.key";

/// Common name of generated roots.
pub const ROOT_COMMON_NAME: &str = "Eden Proxy Root CA";

/// Organization written into every leaf subject.
pub const LEAF_ORGANIZATION: &str = "Eden Proxy Authority";

const ROOT_ORGANIZATIONAL_UNIT: &str = "Eden Proxy SSL Authority";
const ROOT_VALIDITY_YEARS: i32 = 10;
const LEAF_VALIDITY_YEARS: i32 = 2;
const BACKDATE_DAYS: i64 = 1;

/// The trusted root used to sign leaf certificates.
pub struct RootAuthority {
    /// Directory holding the PEM pair.
    dir: PathBuf,
    /// Signing material (root parameters + root key).
    issuer: Issuer<'static, KeyPair>,
    /// PEM-encoded root certificate.
    cert_pem: String,
    /// DER-encoded root certificate.
    cert_der: CertificateDer<'static>,
    /// Subject common name of the root.
    common_name: String,
}

/// A certificate issued for a single hostname.
#[derive(Debug, Clone)]
pub struct LeafCertificate {
    /// Hostname the certificate was issued for.
    pub hostname: String,
    /// PKCS#8 private key, PEM.
    pub private_key_pem: String,
    /// SubjectPublicKeyInfo, PEM.
    pub public_key_pem: String,
    /// The signed certificate, PEM.
    pub certificate_pem: String,
    /// Serial number as lowercase hex.
    pub serial_number: String,
    /// Start of validity.
    pub not_before: OffsetDateTime,
    /// End of validity.
    pub not_after: OffsetDateTime,
}

/// Default certificate directory: `~/.eden-proxy/certificates`.
pub fn default_root_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".eden-proxy"))
        .unwrap_or_else(|| PathBuf::from(".eden-proxy"))
        .join("certificates")
}

/// Check whether both root files exist in `dir`.
pub fn is_root_present(dir: &Path) -> bool {
    dir.join(CA_CERT_FILENAME).is_file() && dir.join(CA_KEY_FILENAME).is_file()
}

/// Read every certificate from a PEM bundle, e.g. an extra upstream root.
pub fn read_pem_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, CaError> {
    let pem = fs::read(path).map_err(|source| CaError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| CaError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(CaError::MalformedRoot(format!(
            "{} contains no certificates",
            path.display()
        )));
    }
    Ok(certs)
}

impl RootAuthority {
    /// Generate a new root and write it to `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`CaError::RootExists`] if a root is already present and
    /// `overwrite` is false, or an I/O / crypto error.
    pub fn generate(dir: &Path, overwrite: bool) -> Result<Self, CaError> {
        if is_root_present(dir) && !overwrite {
            return Err(CaError::RootExists(dir.to_path_buf()));
        }

        info!("Generating root CA in {:?}", dir);

        fs::create_dir_all(dir).map_err(|source| CaError::WriteFile {
            path: dir.to_path_buf(),
            source,
        })?;

        let key_pair = generate_key_pair()?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(ROOT_COMMON_NAME.to_string()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String(ROOT_COMMON_NAME.to_string()),
        );
        dn.push(
            DnType::OrganizationalUnitName,
            DnValue::Utf8String(ROOT_ORGANIZATIONAL_UNIT.to_string()),
        );
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.serial_number = Some(random_serial().0);

        let not_before = OffsetDateTime::now_utc() - Duration::days(BACKDATE_DAYS);
        params.not_before = not_before;
        params.not_after = add_years(not_before, ROOT_VALIDITY_YEARS);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CaError::CertGeneration(e.to_string()))?;

        let cert_pem = cert.pem();
        let cert_der = cert.der().clone();

        let cert_path = dir.join(CA_CERT_FILENAME);
        fs::write(&cert_path, &cert_pem).map_err(|source| CaError::WriteFile {
            path: cert_path.clone(),
            source,
        })?;
        write_restricted_file(&dir.join(CA_KEY_FILENAME), &key_pair.serialize_pem())?;

        debug!("Root CA written to {:?}", cert_path);

        Ok(Self {
            dir: dir.to_path_buf(),
            issuer: Issuer::new(params, key_pair),
            cert_pem,
            cert_der,
            common_name: ROOT_COMMON_NAME.to_string(),
        })
    }

    /// Load an existing root from `dir`.
    pub fn load(dir: &Path) -> Result<Self, CaError> {
        if !is_root_present(dir) {
            return Err(CaError::RootMissing(dir.to_path_buf()));
        }

        let cert_pem = read_file(&dir.join(CA_CERT_FILENAME))?;
        let key_pem = read_file(&dir.join(CA_KEY_FILENAME))?;

        let key_pair =
            KeyPair::from_pem(&key_pem).map_err(|e| CaError::MalformedRoot(e.to_string()))?;
        let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes())
            .map_err(|e| CaError::MalformedRoot(e.to_string()))?;
        let common_name = root_common_name(&cert_der)?;
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| CaError::MalformedRoot(e.to_string()))?;

        debug!("Loaded root CA '{}' from {:?}", common_name, dir);

        Ok(Self {
            dir: dir.to_path_buf(),
            issuer,
            cert_pem,
            cert_der,
            common_name,
        })
    }

    /// Load the root from `dir`, generating one first if none exists.
    pub fn load_or_generate(dir: &Path) -> Result<Self, CaError> {
        if is_root_present(dir) {
            Self::load(dir)
        } else {
            Self::generate(dir, false)
        }
    }

    /// Issue a leaf certificate for `hostname`.
    ///
    /// Every call generates a new key pair and signs a new certificate.
    pub fn issue_leaf(&self, hostname: &str) -> Result<LeafCertificate, CaError> {
        let hostname = hostname.trim().trim_start_matches('[').trim_end_matches(']');
        if hostname.is_empty() {
            return Err(CaError::InvalidHostname(hostname.to_string()));
        }

        debug!("Issuing leaf certificate for {}", hostname);

        let key_pair = generate_key_pair()?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(hostname.to_string()));
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String(LEAF_ORGANIZATION.to_string()),
        );
        params.distinguished_name = dn;
        params.subject_alt_names = vec![subject_alt_name(hostname)?];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];

        let (serial, serial_hex) = random_serial();
        params.serial_number = Some(serial);

        let not_before = OffsetDateTime::now_utc() - Duration::days(BACKDATE_DAYS);
        let not_after = add_years(not_before, LEAF_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        let cert = params
            .signed_by(&key_pair, &self.issuer)
            .map_err(|e| CaError::Signing(e.to_string()))?;

        Ok(LeafCertificate {
            hostname: hostname.to_string(),
            private_key_pem: key_pair.serialize_pem(),
            public_key_pem: key_pair.public_key_pem(),
            certificate_pem: cert.pem(),
            serial_number: serial_hex,
            not_before,
            not_after,
        })
    }

    /// Directory the root was loaded from.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the root certificate file.
    pub fn cert_path(&self) -> PathBuf {
        self.dir.join(CA_CERT_FILENAME)
    }

    /// Path of the root key file.
    pub fn key_path(&self) -> PathBuf {
        self.dir.join(CA_KEY_FILENAME)
    }

    /// Root certificate as PEM.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Root certificate as DER, for building client trust stores.
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// Subject common name of the root.
    pub fn common_name(&self) -> &str {
        &self.common_name
    }
}

impl std::fmt::Debug for RootAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootAuthority")
            .field("dir", &self.dir)
            .field("common_name", &self.common_name)
            .finish()
    }
}

/// Subject CN of a root certificate.
fn root_common_name(cert_der: &CertificateDer<'_>) -> Result<String, CaError> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der.as_ref())
        .map_err(|e| CaError::MalformedRoot(e.to_string()))?;
    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or(ROOT_COMMON_NAME);
    Ok(common_name.to_string())
}

fn generate_key_pair() -> Result<KeyPair, CaError> {
    KeyPair::generate_for(&PKCS_RSA_SHA256).map_err(|e| CaError::KeyGeneration(e.to_string()))
}

fn subject_alt_name(hostname: &str) -> Result<SanType, CaError> {
    if let Ok(ip) = hostname.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    let name = hostname
        .try_into()
        .map_err(|_| CaError::InvalidHostname(hostname.to_string()))?;
    Ok(SanType::DnsName(name))
}

/// Random positive serial, returned with its hex rendering.
fn random_serial() -> (SerialNumber, String) {
    let mut bytes = Uuid::new_v4().into_bytes();
    bytes[0] &= 0x7f;
    if bytes[0] == 0 {
        bytes[0] = 0x01;
    }
    let hex = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    (SerialNumber::from_slice(&bytes), hex)
}

/// Add calendar years, landing on Feb 28 + 1 day when the source is Feb 29.
fn add_years(from: OffsetDateTime, years: i32) -> OffsetDateTime {
    from.replace_year(from.year() + years)
        .unwrap_or_else(|_| from + Duration::days(365 * i64::from(years) + 1))
}

fn read_file(path: &Path) -> Result<String, CaError> {
    fs::read_to_string(path).map_err(|source| CaError::ReadFile {
        path: path.to_path_buf(),
        source,
    })
}

/// Write a file with restricted permissions (0600).
fn write_restricted_file(path: &Path, content: &str) -> Result<(), CaError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(|source| CaError::WriteFile {
            path: path.to_path_buf(),
            source,
        })?;

    file.write_all(content.as_bytes())
        .map_err(|source| CaError::WriteFile {
            path: path.to_path_buf(),
            source,
        })
}
