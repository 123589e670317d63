//! Configuration loading with hierarchy merging.
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Embedded defaults (compiled into binary)
//! 2. System config: `/etc/rashomon/config.toml`
//! 3. User config: `~/.config/rashomon/config.toml`
//! 4. Additional config file (via `--config` flag)
//! 5. CLI flags (highest priority)
//!
//! Lists (bypass_domains) are **merged** (appended).
//! Scalars (listen, timeouts) are **overridden**.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::ConfigError;
use super::schema::{APP_DIR, Config, Settings};
use crate::cli::Cli;

/// System-wide configuration path.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/rashomon/config.toml";

/// User configuration filename.
pub const USER_CONFIG_FILE: &str = "config.toml";

const EMBEDDED_DEFAULTS: &str = include_str!("defaults.toml");

/// Configuration loader with support for hierarchy merging.
pub struct ConfigLoader {
    system_path: PathBuf,
    user_path: PathBuf,
}

impl ConfigLoader {
    /// Create a new ConfigLoader with default paths.
    #[must_use]
    pub fn new() -> Self {
        let user_config_dir = dirs::config_dir()
            .map(|p| p.join(APP_DIR))
            .unwrap_or_else(|| PathBuf::from(".config").join(APP_DIR));

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

    /// Load, merge and validate configuration from all sources.
    ///
    /// Missing system/user files are skipped. A missing `--config` file and
    /// invalid TOML anywhere are errors.
    pub fn load(&self, cli: &Cli) -> Result<Settings, ConfigError> {
        let mut config = Self::embedded_defaults()?;
        debug!("Loaded embedded default configuration");

        for path in [&self.system_path, &self.user_path] {
            if let Some(layer) = Self::load_file(path)? {
                config.merge(layer);
                debug!("Loaded config from {:?}", path);
            } else {
                debug!("No config found at {:?}", path);
            }
        }

        if let Some(ref cli_config_path) = cli.config {
            match Self::load_file(cli_config_path)? {
                Some(layer) => {
                    config.merge(layer);
                    debug!("Loaded additional config from {:?}", cli_config_path);
                }
                None => {
                    // Unlike system/user config, a missing CLI-specified config is an error
                    return Err(ConfigError::ReadError {
                        path: cli_config_path.clone(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "Specified config file not found",
                        ),
                    });
                }
            }
        }

        config.merge(Self::cli_layer(cli));
        config.resolve()
    }

    fn embedded_defaults() -> Result<Config, ConfigError> {
        toml::from_str(EMBEDDED_DEFAULTS).map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<embedded:defaults.toml>"),
            source: e,
        })
    }

    fn cli_layer(cli: &Cli) -> Config {
        let mut layer = Config::default();
        layer.proxy.listen = cli.listen.clone();
        if cli.no_tls_intercept {
            layer.proxy.intercept_tls = Some(false);
        }
        layer.storage.data_dir = cli.data_dir.clone();
        layer.policies.dir = cli.policy_dir.clone();
        layer
    }

    /// Load a config file, returning None if it doesn't exist.
    fn load_file(path: &Path) -> Result<Option<Config>, ConfigError> {
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
