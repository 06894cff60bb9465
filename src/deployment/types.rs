//! Core types used by the deployment subsystem.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Queued => "queued",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Succeeded => "succeeded",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::TimedOut => "timed-out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeploymentStatus::Queued | DeploymentStatus::Running)
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(DeploymentStatus::Queued),
            "running" => Ok(DeploymentStatus::Running),
            "succeeded" => Ok(DeploymentStatus::Succeeded),
            "failed" => Ok(DeploymentStatus::Failed),
            "timed-out" => Ok(DeploymentStatus::TimedOut),
            other => Err(format!("unknown deployment status '{}'", other)),
        }
    }
}

/// How the deployment is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployMethod {
    /// Sync the working copy and run the deployment script over the remote transport.
    Direct,
    /// Hand the ref to the CI pipeline through the configured CI command.
    Ci,
}

impl DeployMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployMethod::Direct => "direct",
            DeployMethod::Ci => "ci",
        }
    }
}

impl fmt::Display for DeployMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeployMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(DeployMethod::Direct),
            "ci" | "github-actions" => Ok(DeployMethod::Ci),
            other => Err(format!("unknown deployment method '{}'", other)),
        }
    }
}

/// One deployment attempt. Immutable once `status` is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: Uuid,
    pub git_ref: String,
    pub commit_hash: Option<String>,
    pub method: DeployMethod,
    pub status: DeploymentStatus,
    pub triggered_by: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    /// Truncated tail of the captured output
    pub output_summary: String,
    pub error_message: Option<String>,
}

impl DeploymentRecord {
    pub fn queued(request: &DeployRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            git_ref: request.git_ref.clone(),
            commit_hash: None,
            method: request.method,
            status: DeploymentStatus::Queued,
            triggered_by: request.triggered_by.clone(),
            started_at: Utc::now(),
            finished_at: None,
            duration_seconds: None,
            output_summary: String::new(),
            error_message: None,
        }
    }

    /// Moves the record into a terminal status and stamps its end time.
    pub fn finish(&mut self, status: DeploymentStatus, error_message: Option<String>) {
        let now = Utc::now();
        self.status = status;
        self.finished_at = Some(now);
        self.duration_seconds = Some((now - self.started_at).num_seconds());
        self.error_message = error_message;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployRequest {
    pub git_ref: String,
    pub method: DeployMethod,
    pub triggered_by: String,
}

/// Single-flight machine state of an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ExecutorState {
    Idle,
    Queued { deployment_id: Uuid },
    Running { deployment_id: Uuid },
}

impl ExecutorState {
    pub fn deployment_id(&self) -> Option<Uuid> {
        match self {
            ExecutorState::Idle => None,
            ExecutorState::Queued { deployment_id } | ExecutorState::Running { deployment_id } => {
                Some(*deployment_id)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

impl OutputLine {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stderr,
            text: text.into(),
        }
    }
}

/// Progress surface of the executor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeployEvent {
    Progress { deployment_id: Uuid, line: OutputLine },
    Finished { record: DeploymentRecord },
}

/// Latest commit of a checkout, as reported by `git log -1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitInfo {
    pub hash: String,
    pub author: String,
    pub relative_time: String,
    pub subject: String,
}

impl CommitInfo {
    pub fn short_hash(&self) -> &str {
        let end = self.hash.len().min(8);
        &self.hash[..end]
    }
}

/// Answer to "what is running in production right now".
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentStatusReport {
    pub state: ExecutorState,
    pub deployed_commit: Option<CommitInfo>,
    pub deployed_commit_error: Option<String>,
    pub last_deployment: Option<DeploymentRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!DeploymentStatus::Queued.is_terminal());
        assert!(!DeploymentStatus::Running.is_terminal());
        assert!(DeploymentStatus::Succeeded.is_terminal());
        assert!(DeploymentStatus::Failed.is_terminal());
        assert!(DeploymentStatus::TimedOut.is_terminal());
    }

    #[test]
    fn status_strings_round_trip_through_storage_form() {
        for status in [
            DeploymentStatus::Queued,
            DeploymentStatus::Running,
            DeploymentStatus::Succeeded,
            DeploymentStatus::Failed,
            DeploymentStatus::TimedOut,
        ] {
            assert_eq!(status.as_str().parse::<DeploymentStatus>(), Ok(status));
        }
    }

    #[test]
    fn finish_stamps_end_time() {
        let mut record = DeploymentRecord::queued(&DeployRequest {
            git_ref: "main".into(),
            method: DeployMethod::Direct,
            triggered_by: "ops".into(),
        });
        record.finish(DeploymentStatus::Failed, Some("exit code 1".into()));
        assert_eq!(record.status, DeploymentStatus::Failed);
        assert!(record.finished_at.is_some());
        assert!(record.duration_seconds.unwrap() >= 0);
        assert_eq!(record.error_message.as_deref(), Some("exit code 1"));
    }

    #[test]
    fn executor_state_serializes_with_tag() {
        let id = Uuid::new_v4();
        let json = serde_json::to_value(ExecutorState::Running { deployment_id: id }).unwrap();
        assert_eq!(json["state"], "running");
        assert_eq!(json["deployment_id"], id.to_string());
        assert_eq!(ExecutorState::Idle.deployment_id(), None);
    }
}
