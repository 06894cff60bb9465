use super::types::*;
use crate::error_handling::types::ConfigError;
use log::{debug, info};
use serde::Deserialize;
use std::path::Path;

/// Application configuration structure that defines all runtime parameters.
///
/// The configuration is read from a TOML file whose path is given on the command line.
/// Every section is optional and falls back to its defaults, except `deploy.script` which
/// must name the deployment script run on the target host.
///
/// # Examples
///
/// ```
/// use opsdesk::configuration::config::Config;
///
/// let config = Config::from_toml_str(r#"
///     [deploy]
///     script = "./scripts/deploy.sh"
///
///     [tailing.sources]
///     api = "/var/log/api/app.log"
/// "#).unwrap();
/// assert_eq!(config.web.port, 8765);
/// ```
///
/// # Fields Overview
///
/// - `storage`: location of the SQLite database
/// - `web`: bind address and port of the webhook / JSON API
/// - `alerts`: notification cooldown and retention sweep
/// - `tailing`: poll interval, duration bounds, retry policy and the log sources
/// - `deploy`: working copies, script, timeout and optional SSH transport
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub web: WebConfig,
    pub alerts: AlertConfig,
    pub tailing: TailConfig,
    pub deploy: DeployConfig,
}

impl Config {
    /// Reads and validates the configuration file at `path`.
    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        info!("Loading configuration from {}", path.display());
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Parses and validates a configuration from TOML text.
    pub fn from_toml_str(raw: &str) -> Result<Config, ConfigError> {
        let config: Config =
            toml::from_str(raw).map_err(|e| ConfigError::TomlError(e.to_string()))?;
        config.validate()?;
        debug!("Configuration loaded: {:?}", config);
        Ok(config)
    }

    /// Command-line overrides win over the file.
    pub fn apply_overrides(&mut self, bind_address: Option<String>, port: Option<u16>) {
        if let Some(address) = bind_address {
            self.web.bind_address = address;
        }
        if let Some(port) = port {
            self.web.port = port;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.web.port == 0 {
            return Err(ConfigError::NotInRange("web.port must be non-zero".into()));
        }
        if self.alerts.retention_days == 0 {
            return Err(ConfigError::NotInRange(
                "alerts.retention_days must be at least 1".into(),
            ));
        }
        if self.alerts.sweep_interval_secs == 0 {
            return Err(ConfigError::NotInRange(
                "alerts.sweep_interval_secs must be non-zero".into(),
            ));
        }
        if self.tailing.poll_interval_secs == 0 {
            return Err(ConfigError::NotInRange(
                "tailing.poll_interval_secs must be non-zero".into(),
            ));
        }
        if self.tailing.retry_attempts == 0 {
            return Err(ConfigError::NotInRange(
                "tailing.retry_attempts must be at least 1".into(),
            ));
        }
        if self.tailing.batch_limit == 0 {
            return Err(ConfigError::NotInRange(
                "tailing.batch_limit must be at least 1".into(),
            ));
        }
        if self.tailing.default_duration_secs == 0
            || self.tailing.max_duration_secs < self.tailing.default_duration_secs
        {
            return Err(ConfigError::NotInRange(format!(
                "tailing durations: default {}s must be non-zero and below max {}s",
                self.tailing.default_duration_secs, self.tailing.max_duration_secs
            )));
        }
        if self.deploy.script.trim().is_empty() {
            return Err(ConfigError::Missing("deploy.script".into()));
        }
        if self.deploy.timeout_secs == 0 {
            return Err(ConfigError::NotInRange(
                "deploy.timeout_secs must be non-zero".into(),
            ));
        }
        if self.deploy.summary_max_chars == 0 || self.deploy.summary_max_lines == 0 {
            return Err(ConfigError::NotInRange(
                "deploy summary limits must be non-zero".into(),
            ));
        }
        if let Some(parent) = self.storage.database_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                return Err(ConfigError::DirectoryDoesNotExist(format!(
                    "{} (parent of storage.database_path)",
                    parent.display()
                )));
            }
        }
        Ok(())
    }
}
