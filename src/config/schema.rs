//! Configuration schema definitions.
//!
//! This module defines the structure of the eden-proxy configuration files:
//!
//! ```toml
//! [general]
//! log_level = "info"
//!
//! [proxy]
//! port = 8001
//! protocol = "http"          # or "https", which requires `hostname`
//! hostname = "localhost"
//! force_intercept = false
//! ws_intercept = false
//! ignore_unauthorized = false
//! throttle_kbps = 0          # 0 = off
//! chunk_threshold = 209715200
//! upstream_timeout_secs = 30
//! drain_timeout_secs = 5
//!
//! [certificates]
//! dir = "~/.eden-proxy/certificates"
//! cache_leaves = false
//! extra_roots = ["/etc/ssl/corp-root.pem"]
//! ```
//!
//! Every scalar is optional in a file so a later layer only overrides what it
//! sets. The accessors on [`Config`] fill in the defaults.

use super::error::ConfigError;
use crate::ca::{default_root_dir, is_root_present};
use crate::proxy::server::{DEFAULT_CHUNK_THRESHOLD, DEFAULT_DRAIN_TIMEOUT, DEFAULT_UPSTREAM_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main port used when none is configured.
pub const DEFAULT_PORT: u16 = 8001;

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Listener and pipeline settings.
    #[serde(default)]
    pub proxy: ProxySettings,

    /// Root CA and leaf settings.
    #[serde(default)]
    pub certificates: CertificatesConfig,
}

/// General application settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub log_level: String,
}

impl GeneralConfig {
    fn merge(&mut self, other: GeneralConfig) {
        // Scalars are overridden if non-default
        if !other.log_level.is_empty() {
            self.log_level = other.log_level;
        }
    }
}

/// Protocol of the main port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenProtocol {
    /// Plain HTTP.
    #[default]
    Http,
    /// HTTPS with a leaf for the configured hostname.
    Https,
}

/// `[proxy]` section.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ProxySettings {
    /// Main port.
    pub port: Option<u16>,
    /// Address the main port binds to.
    pub bind_address: Option<IpAddr>,
    /// Protocol of the main port.
    pub protocol: Option<ListenProtocol>,
    /// Hostname the main port presents when serving HTTPS.
    pub hostname: Option<String>,
    /// Intercept tunnels when no rule decides.
    pub force_intercept: Option<bool>,
    /// Route plaintext WebSocket tunnels through the pipeline.
    pub ws_intercept: Option<bool>,
    /// Skip upstream certificate verification.
    pub ignore_unauthorized: Option<bool>,
    /// Bandwidth cap in KiB/s, 0 for none.
    pub throttle_kbps: Option<u64>,
    /// Bytes buffered before a response body is streamed.
    pub chunk_threshold: Option<usize>,
    /// Upstream dial and response timeout.
    pub upstream_timeout_secs: Option<u64>,
    /// Time connections get to drain on shutdown.
    pub drain_timeout_secs: Option<u64>,
}

impl ProxySettings {
    fn merge(&mut self, other: ProxySettings) {
        override_with(&mut self.port, other.port);
        override_with(&mut self.bind_address, other.bind_address);
        override_with(&mut self.protocol, other.protocol);
        override_with(&mut self.hostname, other.hostname);
        override_with(&mut self.force_intercept, other.force_intercept);
        override_with(&mut self.ws_intercept, other.ws_intercept);
        override_with(&mut self.ignore_unauthorized, other.ignore_unauthorized);
        override_with(&mut self.throttle_kbps, other.throttle_kbps);
        override_with(&mut self.chunk_threshold, other.chunk_threshold);
        override_with(&mut self.upstream_timeout_secs, other.upstream_timeout_secs);
        override_with(&mut self.drain_timeout_secs, other.drain_timeout_secs);
    }
}

/// `[certificates]` section.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct CertificatesConfig {
    /// Directory holding the root CA pair. `~` is expanded.
    pub dir: Option<PathBuf>,
    /// Cache issued leaves.
    pub cache_leaves: Option<bool>,
    /// PEM bundles trusted for upstream TLS in addition to the system roots.
    #[serde(default)]
    pub extra_roots: Vec<PathBuf>,
}

impl CertificatesConfig {
    fn merge(&mut self, other: CertificatesConfig) {
        override_with(&mut self.dir, other.dir);
        override_with(&mut self.cache_leaves, other.cache_leaves);
        // Lists are merged (appended)
        self.extra_roots.extend(other.extra_roots);
    }
}

fn override_with<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

impl Config {
    /// Merge another config into this one.
    ///
    /// Scalars set in `other` override; lists are appended.
    pub fn merge(&mut self, other: Config) {
        self.general.merge(other.general);
        self.proxy.merge(other.proxy);
        self.certificates.merge(other.certificates);
    }

    /// Check the merged configuration before starting the proxy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port() == 0 {
            return Err(ConfigError::invalid("proxy.port", "must be non-zero"));
        }
        if self.protocol() == ListenProtocol::Https
            && self.proxy.hostname.as_deref().is_none_or(str::is_empty)
        {
            return Err(ConfigError::invalid(
                "proxy.hostname",
                "required when protocol is \"https\"",
            ));
        }
        if self.throttle_kbps().checked_mul(1024).is_none() {
            return Err(ConfigError::invalid("proxy.throttle_kbps", "too large"));
        }
        if self.chunk_threshold() == 0 {
            return Err(ConfigError::invalid("proxy.chunk_threshold", "must be positive"));
        }
        if self.force_intercept() && !is_root_present(&self.certificates_dir()) {
            return Err(ConfigError::invalid(
                "proxy.force_intercept",
                format!(
                    "no root CA in {}; run `eden-proxy init-ca` first",
                    self.certificates_dir().display()
                ),
            ));
        }
        Ok(())
    }

    /// Main port.
    pub fn port(&self) -> u16 {
        self.proxy.port.unwrap_or(DEFAULT_PORT)
    }

    /// Bind address of the main port.
    pub fn bind_address(&self) -> IpAddr {
        self.proxy
            .bind_address
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    /// Protocol of the main port.
    pub fn protocol(&self) -> ListenProtocol {
        self.proxy.protocol.unwrap_or_default()
    }

    /// Hostname for the main port when it serves HTTPS.
    pub fn https_hostname(&self) -> Option<&str> {
        match self.protocol() {
            ListenProtocol::Https => self.proxy.hostname.as_deref(),
            ListenProtocol::Http => None,
        }
    }

    /// Intercept tunnels when no rule decides.
    pub fn force_intercept(&self) -> bool {
        self.proxy.force_intercept.unwrap_or(false)
    }

    /// Route plaintext WebSocket tunnels through the pipeline.
    pub fn ws_intercept(&self) -> bool {
        self.proxy.ws_intercept.unwrap_or(false)
    }

    /// Skip upstream certificate verification.
    pub fn ignore_unauthorized(&self) -> bool {
        self.proxy.ignore_unauthorized.unwrap_or(false)
    }

    /// Bandwidth cap in KiB/s, 0 for none.
    pub fn throttle_kbps(&self) -> u64 {
        self.proxy.throttle_kbps.unwrap_or(0)
    }

    /// Bytes buffered before a response body is streamed.
    pub fn chunk_threshold(&self) -> usize {
        self.proxy.chunk_threshold.unwrap_or(DEFAULT_CHUNK_THRESHOLD)
    }

    /// Upstream dial and response timeout.
    pub fn upstream_timeout(&self) -> Duration {
        self.proxy
            .upstream_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT)
    }

    /// Time connections get to drain on shutdown.
    pub fn drain_timeout(&self) -> Duration {
        self.proxy
            .drain_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_DRAIN_TIMEOUT)
    }

    /// Root CA directory, with `~` expanded.
    pub fn certificates_dir(&self) -> PathBuf {
        match &self.certificates.dir {
            Some(dir) => expand_home(dir),
            None => default_root_dir(),
        }
    }

    /// Cache issued leaves.
    pub fn cache_leaves(&self) -> bool {
        self.certificates.cache_leaves.unwrap_or(false)
    }

    /// Extra upstream roots, with `~` expanded.
    pub fn extra_roots(&self) -> Vec<PathBuf> {
        self.certificates
            .extra_roots
            .iter()
            .map(|p| expand_home(p))
            .collect()
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
            [general]
            log_level = "debug"

            [proxy]
            port = 9000
            bind_address = "127.0.0.1"
            protocol = "https"
            hostname = "proxy.local"
            force_intercept = true
            ws_intercept = true
            ignore_unauthorized = true
            throttle_kbps = 64
            chunk_threshold = 1024
            upstream_timeout_secs = 10
            drain_timeout_secs = 2

            [certificates]
            dir = "/var/lib/eden-proxy"
            cache_leaves = true
            extra_roots = ["/etc/ssl/corp.pem"]
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.port(), 9000);
        assert_eq!(config.bind_address(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.https_hostname(), Some("proxy.local"));
        assert!(config.force_intercept());
        assert!(config.ws_intercept());
        assert!(config.ignore_unauthorized());
        assert_eq!(config.throttle_kbps(), 64);
        assert_eq!(config.chunk_threshold(), 1024);
        assert_eq!(config.upstream_timeout(), Duration::from_secs(10));
        assert_eq!(config.drain_timeout(), Duration::from_secs(2));
        assert_eq!(config.certificates_dir(), PathBuf::from("/var/lib/eden-proxy"));
        assert!(config.cache_leaves());
        assert_eq!(config.extra_roots(), vec![PathBuf::from("/etc/ssl/corp.pem")]);
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port(), DEFAULT_PORT);
        assert_eq!(config.protocol(), ListenProtocol::Http);
        assert!(config.https_hostname().is_none());
        assert!(!config.force_intercept());
        assert_eq!(config.throttle_kbps(), 0);
        assert_eq!(config.chunk_threshold(), DEFAULT_CHUNK_THRESHOLD);
        assert_eq!(config.certificates_dir(), default_root_dir());
    }

    #[test]
    fn test_merge_scalars_override_when_set() {
        let mut base: Config = toml::from_str(
            r#"
            [proxy]
            port = 8001
            force_intercept = true
        "#,
        )
        .unwrap();
        let overlay: Config = toml::from_str(
            r#"
            [proxy]
            force_intercept = false
        "#,
        )
        .unwrap();

        base.merge(overlay);
        assert_eq!(base.port(), 8001);
        assert!(!base.force_intercept());
    }

    #[test]
    fn test_merge_lists_append() {
        let mut base: Config = toml::from_str(
            r#"
            [certificates]
            extra_roots = ["/a.pem"]
        "#,
        )
        .unwrap();
        let overlay: Config = toml::from_str(
            r#"
            [certificates]
            extra_roots = ["/b.pem"]
        "#,
        )
        .unwrap();

        base.merge(overlay);
        assert_eq!(
            base.extra_roots(),
            vec![PathBuf::from("/a.pem"), PathBuf::from("/b.pem")]
        );
    }

    #[test]
    fn test_validate_rejects_zero_port() {
        let mut config = Config::default();
        config.proxy.port = Some(0);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "proxy.port"));
    }

    #[test]
    fn test_validate_https_requires_hostname() {
        let mut config = Config::default();
        config.proxy.protocol = Some(ListenProtocol::Https);
        assert!(config.validate().is_err());

        config.proxy.hostname = Some("proxy.local".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_chunk_threshold() {
        let mut config = Config::default();
        config.proxy.chunk_threshold = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_force_intercept_requires_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.proxy.force_intercept = Some(true);
        config.certificates.dir = Some(dir.path().to_path_buf());
        assert!(config.validate().is_err());

        crate::ca::RootAuthority::generate(dir.path(), false).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_expand_home() {
        let absolute = PathBuf::from("/etc/eden-proxy");
        assert_eq!(expand_home(&absolute), absolute);

        if let Some(home) = dirs::home_dir() {
            assert_eq!(
                expand_home(Path::new("~/.eden-proxy")),
                home.join(".eden-proxy")
            );
        }
    }

    #[test]
    fn test_unknown_protocol_rejected() {
        let result: Result<Config, _> = toml::from_str(
            r#"
            [proxy]
            protocol = "gopher"
        "#,
        );
        assert!(result.is_err());
    }
}
