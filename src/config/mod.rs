//! Configuration system for eden-proxy.
//!
//! This module provides TOML configuration loading with hierarchy merging.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. System config: `/etc/eden-proxy/config.toml`
//! 2. User config: `~/.config/eden-proxy/config.toml`
//! 3. Additional config file (via `--config` flag)
//! 4. CLI flags (highest priority)
//!
//! No file is required; every setting has a default.
//!
//! # Merge Behavior
//!
//! - **Lists** (`certificates.extra_roots`) are **merged** (appended)
//! - **Scalars** (port, log_level, etc.) are **overridden** when set

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::{ConfigLoader, SYSTEM_CONFIG_PATH};
pub use schema::{
    CertificatesConfig, Config, DEFAULT_PORT, GeneralConfig, ListenProtocol, ProxySettings,
    expand_home,
};
