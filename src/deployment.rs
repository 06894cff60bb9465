//! Deployment subsystem
//!
//! Triggers deployments of a git ref to the target host, one at a time, and keeps their
//! history.
//!
//! Components:
//! - `types`: deployment records, requests, executor state and progress events.
//! - `remote_exec`: the command execution capability (local `sh` or `ssh`).
//! - `source_control`: the git capability used to sync and inspect working copies.
//! - `executor`: the single-flight `DeploymentExecutor`.

pub mod executor;
pub mod remote_exec;
pub mod source_control;
pub mod types;

#[cfg(test)]
mod tests;

pub use executor::{DeployBackends, DeploymentExecutor, DeploymentTicket, OUTCOME_NOT_RECORDED};
pub use remote_exec::{CommandSpec, ProcessExecutor, RemoteExecutor, RunningCommand};
pub use source_control::{GitCli, SourceControl};
pub use types::{
    DeployEvent, DeployMethod, DeployRequest, DeploymentRecord, DeploymentStatus, ExecutorState,
};
