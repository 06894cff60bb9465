use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, PartialEq, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite file holding both the alert and the deployment tables
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("opsdesk.sqlite3"),
        }
    }
}

#[derive(Debug, PartialEq, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub bind_address: String,
    pub port: u16,
    /// Upper bound on inbound webhook bodies, in bytes
    pub max_body_bytes: u64,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8765,
            max_body_bytes: 256 * 1024,
        }
    }
}

#[derive(Debug, PartialEq, Clone, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// At most one notification per dedup key inside this window
    pub notification_cooldown_secs: u64,
    /// Records whose `last_seen_at` is older than this are purged and no longer deduplicated against
    pub retention_days: u32,
    pub sweep_interval_secs: u64,
    /// Environment assumed when a payload does not carry one
    pub default_environment: String,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            notification_cooldown_secs: 300,
            retention_days: 30,
            sweep_interval_secs: 3600,
            default_environment: "production".to_string(),
        }
    }
}

impl AlertConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.notification_cooldown_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }
}

#[derive(Debug, PartialEq, Clone, Deserialize)]
#[serde(default)]
pub struct TailConfig {
    pub poll_interval_secs: u64,
    pub default_duration_secs: u64,
    pub max_duration_secs: u64,
    /// Attempts per poll before a transient error fails the session
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    /// Lines requested from the source per poll
    pub batch_limit: usize,
    /// Source name -> log file read by the file log source
    pub sources: BTreeMap<String, PathBuf>,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            default_duration_secs: 60,
            max_duration_secs: 300,
            retry_attempts: 3,
            retry_base_delay_ms: 500,
            batch_limit: 100,
            sources: BTreeMap::new(),
        }
    }
}

#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct SshConfig {
    pub host: String,
    #[serde(default = "default_ssh_user")]
    pub user: String,
    pub key_path: Option<PathBuf>,
    pub port: Option<u16>,
}

fn default_ssh_user() -> String {
    "ubuntu".to_string()
}

#[derive(Debug, PartialEq, Clone, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Local working copy synchronized before each direct deployment
    pub repo_path: PathBuf,
    /// Checkout on the target host, queried by `status()`
    pub remote_repo_path: PathBuf,
    /// Deployment script run over the remote transport
    pub script: String,
    /// Working directory of the script on the target host
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    /// Command used for `method = ci`; `{ref}` is substituted
    pub ci_command: Option<String>,
    pub timeout_secs: u64,
    /// How long the watchdog waits for the remote process to die after a timeout
    pub grace_period_secs: u64,
    pub summary_max_lines: usize,
    pub summary_max_chars: usize,
    pub ssh: Option<SshConfig>,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from("."),
            remote_repo_path: PathBuf::from("."),
            script: String::new(),
            working_dir: PathBuf::from("."),
            env: BTreeMap::new(),
            ci_command: None,
            timeout_secs: 600,
            grace_period_secs: 10,
            summary_max_lines: 40,
            summary_max_chars: 1900,
            ssh: None,
        }
    }
}
