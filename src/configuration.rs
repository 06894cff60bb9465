pub mod config;
pub mod types;

pub use config::Config;
pub use types::{AlertConfig, DeployConfig, SshConfig, StorageConfig, TailConfig, WebConfig};
