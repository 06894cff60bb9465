use crate::configuration::DeployConfig;
use crate::deployment::remote_exec::{CommandSpec, RemoteExecutor};
use crate::deployment::source_control::{validate_ref, SourceControl};
use crate::deployment::types::{
    DeployEvent, DeployMethod, DeployRequest, DeploymentRecord, DeploymentStatus,
    DeploymentStatusReport, ExecutorState, OutputLine,
};
use crate::error_handling::types::{DeployError, ExternalError, StorageError};
use crate::storage::DeploymentStore;
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{timeout, timeout_at, Instant};
use uuid::Uuid;

const EVENT_BUFFER: usize = 1024;
const OUTCOME_WRITE_ATTEMPTS: u32 = 3;
const OUTCOME_RETRY_DELAY: Duration = Duration::from_millis(100);
pub const INTERRUPTED_BY_RESTART: &str = "interrupted by restart";
pub const OUTCOME_NOT_RECORDED: &str = "outcome could not be recorded";

/// External collaborators of the executor.
#[derive(Clone)]
pub struct DeployBackends {
    /// Local working copy, synced before direct deployments
    pub local_git: Arc<dyn SourceControl>,
    /// Checkout on the target host, queried for the deployed commit
    pub remote_git: Arc<dyn SourceControl>,
    /// Runs the deployment script on the target host
    pub remote: Arc<dyn RemoteExecutor>,
    /// Runs the CI trigger command
    pub local: Arc<dyn RemoteExecutor>,
}

/// The structure related to deployments
///
/// Enforces at most one deployment in flight, drives it through
/// `idle -> queued -> running -> {succeeded, failed, timed-out} -> idle`, streams its
/// output as `DeployEvent::Progress` and records the outcome.
///
/// # Fields Overview
///
/// - `store`: deployment history
/// - `backends`: source control and command execution
/// - `config`: script, working directories, timeout and summary limits
/// - `state`: the single-flight gate
/// - `events`: progress and completion events
pub struct DeploymentExecutor {
    store: Arc<dyn DeploymentStore>,
    backends: DeployBackends,
    config: DeployConfig,
    state: Arc<Mutex<ExecutorState>>,
    events: broadcast::Sender<DeployEvent>,
}

/// An accepted deployment holding the single-flight slot until it is executed or dropped.
pub struct DeploymentTicket {
    record: DeploymentRecord,
    slot: SlotGuard,
}

impl DeploymentTicket {
    pub fn record(&self) -> &DeploymentRecord {
        &self.record
    }
}

/// Returns the executor to idle however the deployment ends.
struct SlotGuard {
    state: Arc<Mutex<ExecutorState>>,
}

impl SlotGuard {
    fn set(&self, next: ExecutorState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.set(ExecutorState::Idle);
    }
}

enum CommandOutcome {
    Exited(i32),
    TimedOut { terminated: bool },
    Error(ExternalError),
}

impl DeploymentExecutor {
    pub fn new(store: Arc<dyn DeploymentStore>, backends: DeployBackends, config: DeployConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            store,
            backends,
            config,
            state: Arc::new(Mutex::new(ExecutorState::Idle)),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeployEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ExecutorState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs a deployment to completion and returns its terminal record.
    ///
    /// Fails immediately with `InProgress` when another deployment holds the slot; no
    /// record is created in that case.
    pub async fn trigger(&self, request: DeployRequest) -> Result<DeploymentRecord, DeployError> {
        let ticket = self.accept(request).await?;
        self.execute(ticket).await
    }

    /// Claims the single-flight slot and persists the queued record.
    pub async fn accept(&self, request: DeployRequest) -> Result<DeploymentTicket, DeployError> {
        validate_ref(&request.git_ref).map_err(DeployError::Validation)?;
        if request.method == DeployMethod::Ci && self.config.ci_command.is_none() {
            return Err(DeployError::Validation(
                "ci deployments need deploy.ci_command".into(),
            ));
        }

        let record = DeploymentRecord::queued(&request);
        let slot = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(current) = state.deployment_id() {
                info!(
                    "[{}] Rejecting deployment of {}: another one is in progress",
                    current, request.git_ref
                );
                return Err(DeployError::InProgress(current));
            }
            *state = ExecutorState::Queued {
                deployment_id: record.id,
            };
            SlotGuard {
                state: self.state.clone(),
            }
        };

        match self.store.create(&record).await {
            Ok(()) => {}
            Err(StorageError::Conflict(reason)) => {
                // an in-flight record left behind by another process
                warn!("[{}] Store refused queued record: {}", record.id, reason);
                let existing = self
                    .store
                    .list_recent(1)
                    .await?
                    .into_iter()
                    .find(|r| !r.status.is_terminal())
                    .map(|r| r.id)
                    .unwrap_or(record.id);
                return Err(DeployError::InProgress(existing));
            }
            Err(e) => return Err(e.into()),
        }
        info!(
            "[{}] Deployment of {} ({}) queued by {}",
            record.id, record.git_ref, record.method, record.triggered_by
        );
        Ok(DeploymentTicket { record, slot })
    }

    /// Drives an accepted deployment to its terminal state.
    pub async fn execute(&self, ticket: DeploymentTicket) -> Result<DeploymentRecord, DeployError> {
        let DeploymentTicket { mut record, slot } = ticket;
        let id = record.id;
        let deadline = Instant::now() + self.timeout();
        let mut output = OutputTail::new(self.config.summary_max_lines, self.config.summary_max_chars);

        let verdict = match record.method {
            DeployMethod::Direct => match self.sync(&mut record, deadline).await {
                Ok(()) => None,
                Err(verdict) => Some(verdict),
            },
            DeployMethod::Ci => None,
        };

        let (status, error_message) = match verdict {
            Some(verdict) => verdict,
            None => {
                slot.set(ExecutorState::Running { deployment_id: id });
                record.status = DeploymentStatus::Running;
                if let Err(e) = self.store.update(&record).await {
                    error!("[{}] Unable to record running state: {}", id, e);
                }
                info!("[{}] Running {} deployment of {}", id, record.method, record.git_ref);

                let (executor, spec) = self.command_for(&record);
                let outcome = self
                    .run_command(executor.as_ref(), &spec, deadline, &mut output, id)
                    .await;
                self.verdict(outcome)
            }
        };

        record.output_summary = output.summary();
        record.finish(status, error_message);
        let persisted = self.persist_outcome(&record).await;
        drop(slot);

        match record.status {
            DeploymentStatus::Succeeded => info!("[{}] Deployment succeeded", id),
            _ => warn!(
                "[{}] Deployment {}: {}",
                id,
                record.status,
                record.error_message.as_deref().unwrap_or("")
            ),
        }
        let _ = self.events.send(DeployEvent::Finished {
            record: record.clone(),
        });

        persisted?;
        Ok(record)
    }

    /// Writes the terminal record. When every attempt fails the in-flight rows are failed
    /// instead, so the store keeps accepting new deployments.
    async fn persist_outcome(&self, record: &DeploymentRecord) -> Result<(), DeployError> {
        let mut attempt = 1;
        let err = loop {
            match self.store.update(record).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= OUTCOME_WRITE_ATTEMPTS => break e,
                Err(e) => {
                    warn!(
                        "[{}] Unable to persist outcome (attempt {}): {}",
                        record.id, attempt, e
                    );
                    tokio::time::sleep(OUTCOME_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
            }
        };
        error!("[{}] Giving up on persisting outcome: {}", record.id, err);
        match self.store.fail_in_flight(OUTCOME_NOT_RECORDED).await {
            Ok(count) => warn!("[{}] Marked {} in-flight record(s) as failed", record.id, count),
            Err(e) => error!("[{}] Unable to release in-flight records: {}", record.id, e),
        }
        Err(DeployError::Storage(err))
    }

    /// Machine state, the commit running on the target host, and the last finished deployment.
    pub async fn status(&self) -> Result<DeploymentStatusReport, DeployError> {
        let state = self.state();
        let (deployed_commit, deployed_commit_error) = match self
            .backends
            .remote_git
            .current_commit(&self.config.remote_repo_path)
            .await
        {
            Ok(commit) => (Some(commit), None),
            Err(e) => {
                warn!("Unable to read deployed commit: {}", e);
                (None, Some(e.to_string()))
            }
        };
        let last_deployment = self.store.latest_terminal().await?;
        Ok(DeploymentStatusReport {
            state,
            deployed_commit,
            deployed_commit_error,
            last_deployment,
        })
    }

    pub async fn history(&self, limit: u64) -> Result<Vec<DeploymentRecord>, DeployError> {
        Ok(self.store.list_recent(limit).await?)
    }

    pub async fn last_successful(&self) -> Result<Option<DeploymentRecord>, DeployError> {
        Ok(self.store.last_successful().await?)
    }

    pub async fn get(&self, id: Uuid) -> Result<DeploymentRecord, DeployError> {
        self.store
            .get(id)
            .await?
            .ok_or(DeployError::NotFound(id))
    }

    /// Fails records a previous process left queued or running.
    pub async fn recover(&self) -> Result<u64, DeployError> {
        Ok(self.store.fail_in_flight(INTERRUPTED_BY_RESTART).await?)
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    async fn sync(
        &self,
        record: &mut DeploymentRecord,
        deadline: Instant,
    ) -> Result<(), (DeploymentStatus, Option<String>)> {
        let repo = &self.config.repo_path;
        debug!("[{}] Syncing {} to {}", record.id, repo.display(), record.git_ref);
        match timeout_at(deadline, self.backends.local_git.sync_to(repo, &record.git_ref)).await {
            Err(_) => {
                return Err((
                    DeploymentStatus::TimedOut,
                    Some(format!(
                        "timed out after {}s while syncing the working copy",
                        self.config.timeout_secs
                    )),
                ))
            }
            Ok(Err(e)) => {
                return Err((
                    DeploymentStatus::Failed,
                    Some(format!("sync to {} failed: {}", record.git_ref, e)),
                ))
            }
            Ok(Ok(())) => {}
        }
        match timeout_at(deadline, self.backends.local_git.current_commit(repo)).await {
            Ok(Ok(commit)) => record.commit_hash = Some(commit.hash),
            Ok(Err(e)) => warn!("[{}] Unable to read synced commit: {}", record.id, e),
            Err(_) => warn!("[{}] Timed out reading synced commit", record.id),
        }
        Ok(())
    }

    fn command_for(&self, record: &DeploymentRecord) -> (Arc<dyn RemoteExecutor>, CommandSpec) {
        match record.method {
            DeployMethod::Direct => (
                self.backends.remote.clone(),
                CommandSpec::new(self.config.script.clone())
                    .in_dir(self.config.working_dir.clone())
                    .with_env(self.config.env.clone()),
            ),
            DeployMethod::Ci => {
                let template = self.config.ci_command.as_deref().unwrap_or_default();
                (
                    self.backends.local.clone(),
                    CommandSpec::new(template.replace("{ref}", &record.git_ref))
                        .in_dir(self.config.repo_path.clone())
                        .with_env(self.config.env.clone()),
                )
            }
        }
    }

    async fn run_command(
        &self,
        executor: &dyn RemoteExecutor,
        spec: &CommandSpec,
        deadline: Instant,
        output: &mut OutputTail,
        id: Uuid,
    ) -> CommandOutcome {
        let mut running = match timeout_at(deadline, executor.run(spec)).await {
            Ok(Ok(running)) => running,
            Ok(Err(e)) => return CommandOutcome::Error(e),
            Err(_) => {
                // a half-started remote command has no handle to terminate
                warn!("[{}] Deadline reached before the command started", id);
                return CommandOutcome::TimedOut { terminated: false };
            }
        };

        let finished = timeout_at(deadline, async {
            while let Some(line) = running.next_line().await {
                output.push(&line);
                let _ = self.events.send(DeployEvent::Progress {
                    deployment_id: id,
                    line,
                });
            }
            running.wait().await
        })
        .await;

        match finished {
            Ok(Ok(code)) => CommandOutcome::Exited(code),
            Ok(Err(e)) => CommandOutcome::Error(e),
            Err(_) => {
                warn!("[{}] Deadline reached, terminating command", id);
                let grace = Duration::from_secs(self.config.grace_period_secs);
                let terminated = match timeout(grace, running.terminate()).await {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        warn!("[{}] Termination not confirmed: {}", id, e);
                        false
                    }
                    Err(_) => {
                        warn!("[{}] Termination still pending after {:?}", id, grace);
                        false
                    }
                };
                CommandOutcome::TimedOut { terminated }
            }
        }
    }

    fn verdict(&self, outcome: CommandOutcome) -> (DeploymentStatus, Option<String>) {
        match outcome {
            CommandOutcome::Exited(0) => (DeploymentStatus::Succeeded, None),
            CommandOutcome::Exited(code) => (
                DeploymentStatus::Failed,
                Some(format!("command exited with code {}", code)),
            ),
            CommandOutcome::Error(e) => (DeploymentStatus::Failed, Some(e.to_string())),
            CommandOutcome::TimedOut { terminated } => {
                let mut message = format!("timed out after {}s", self.config.timeout_secs);
                if !terminated {
                    message.push_str("; remote process status unknown");
                }
                (DeploymentStatus::TimedOut, Some(message))
            }
        }
    }
}

/// Bounded tail of captured output, rendered into `output_summary`.
pub struct OutputTail {
    lines: VecDeque<String>,
    max_lines: usize,
    max_chars: usize,
}

impl OutputTail {
    pub fn new(max_lines: usize, max_chars: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(max_lines),
            max_lines,
            max_chars,
        }
    }

    pub fn push(&mut self, line: &OutputLine) {
        if self.lines.len() == self.max_lines {
            self.lines.pop_front();
        }
        self.lines.push_back(line.text.clone());
    }

    /// Last lines joined, cut from the front to at most `max_chars` characters.
    pub fn summary(&self) -> String {
        let joined = self.lines.iter().cloned().collect::<Vec<_>>().join("\n");
        let total = joined.chars().count();
        if total <= self.max_chars {
            return joined;
        }
        joined.chars().skip(total - self.max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_tail_keeps_last_lines() {
        let mut tail = OutputTail::new(2, 100);
        for text in ["one", "two", "three"] {
            tail.push(&OutputLine::stdout(text));
        }
        assert_eq!(tail.summary(), "two\nthree");
    }

    #[test]
    fn output_tail_cuts_from_the_front() {
        let mut tail = OutputTail::new(10, 5);
        tail.push(&OutputLine::stderr("abcdefgh"));
        assert_eq!(tail.summary(), "defgh");
        assert_eq!(OutputTail::new(3, 3).summary(), "");
    }
}
