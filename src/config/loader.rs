//! Configuration loading with hierarchy merging.
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Built-in defaults
//! 2. System config: `/etc/eden-proxy/config.toml`
//! 3. User config: `~/.config/eden-proxy/config.toml`
//! 4. Additional config file (via `--config` flag)
//! 5. CLI flags (highest priority)
//!
//! Lists (extra_roots) are **merged** (appended).
//! Scalars (port, log_level) are **overridden**.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::ConfigError;
use super::schema::{Config, ListenProtocol, ProxySettings};
use crate::cli::RunArgs;

/// System-wide configuration path.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/eden-proxy/config.toml";

/// User configuration directory name.
pub const USER_CONFIG_DIR: &str = "eden-proxy";

/// User configuration filename.
pub const USER_CONFIG_FILE: &str = "config.toml";

/// Configuration loader with support for hierarchy merging.
pub struct ConfigLoader {
    /// Path to system-wide configuration.
    system_path: PathBuf,
    /// Path to user configuration.
    user_path: PathBuf,
}

impl ConfigLoader {
    /// Create a new ConfigLoader with default paths.
    #[must_use]
    pub fn new() -> Self {
        let user_config_dir = dirs::config_dir()
            .map(|p| p.join(USER_CONFIG_DIR))
            .unwrap_or_else(|| PathBuf::from(".config").join(USER_CONFIG_DIR));

        Self {
            system_path: PathBuf::from(SYSTEM_CONFIG_PATH),
            user_path: user_config_dir.join(USER_CONFIG_FILE),
        }
    }

    /// Create a ConfigLoader with custom paths (for testing).
    #[must_use]
    pub fn with_paths(system_path: PathBuf, user_path: PathBuf) -> Self {
        Self {
            system_path,
            user_path,
        }
    }

    /// Load and merge configuration from all sources.
    ///
    /// Missing system and user files are skipped. A missing `--config` file
    /// and invalid TOML anywhere are errors.
    pub fn load(&self, args: &RunArgs) -> Result<Config, ConfigError> {
        let mut config = Config::default();

        for (layer, path) in [("system", &self.system_path), ("user", &self.user_path)] {
            match self.load_file(path)? {
                Some(file_config) => {
                    config.merge(file_config);
                    debug!("Merged {} config from {:?}", layer, path);
                }
                None => debug!("No {} config at {:?}", layer, path),
            }
        }

        if let Some(path) = &args.config {
            let extra = self.load_file(path)?.ok_or_else(|| ConfigError::ReadError {
                path: path.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Specified config file not found",
                ),
            })?;
            config.merge(extra);
            debug!("Merged --config file {:?}", path);
        }

        config.merge(Self::cli_layer(args));
        Ok(config)
    }

    /// Config layer built from command-line flags. Unset flags leave the
    /// lower layers untouched.
    fn cli_layer(args: &RunArgs) -> Config {
        Config {
            proxy: ProxySettings {
                port: args.port,
                protocol: args.https.then_some(ListenProtocol::Https),
                hostname: args.hostname.clone(),
                force_intercept: args.intercept.then_some(true),
                ws_intercept: args.ws_intercept.then_some(true),
                ignore_unauthorized: args.ignore_unauthorized.then_some(true),
                throttle_kbps: args.throttle,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Load a config file, returning None if it doesn't exist.
    fn load_file(&self, path: &Path) -> Result<Option<Config>, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config: Config =
                    toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
                        path: path.to_path_buf(),
                        source: e,
                    })?;
                Ok(Some(config))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ConfigError::ReadError {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
