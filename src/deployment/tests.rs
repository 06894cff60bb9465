use super::*;
use crate::configuration::DeployConfig;
use crate::deployment::types::{CommitInfo, OutputLine};
use crate::error_handling::types::{DeployError, ExternalError, StorageError};
use crate::storage::DeploymentStore;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

/// Deployment history kept in memory with the same rules as the SQLite repository.
#[derive(Default)]
struct MemoryDeploymentStore {
    records: Mutex<Vec<DeploymentRecord>>,
    /// Number of upcoming terminal writes to refuse
    failing_terminal_writes: AtomicUsize,
}

#[async_trait]
impl DeploymentStore for MemoryDeploymentStore {
    async fn create(&self, record: &DeploymentRecord) -> Result<(), StorageError> {
        let mut records = self.records.lock().unwrap();
        if !record.status.is_terminal() && records.iter().any(|r| !r.status.is_terminal()) {
            return Err(StorageError::Conflict("in flight".into()));
        }
        records.push(record.clone());
        Ok(())
    }

    async fn update(&self, record: &DeploymentRecord) -> Result<(), StorageError> {
        if record.status.is_terminal()
            && self
                .failing_terminal_writes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(StorageError::WriteFailed);
        }
        let mut records = self.records.lock().unwrap();
        let stored = records
            .iter_mut()
            .find(|r| r.id == record.id)
            .ok_or_else(|| StorageError::NotFound(record.id.to_string()))?;
        if stored.status.is_terminal() {
            return Err(StorageError::Immutable(record.id));
        }
        *stored = record.clone();
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeploymentRecord>, StorageError> {
        Ok(self.records.lock().unwrap().iter().find(|r| r.id == id).cloned())
    }

    async fn list_recent(&self, limit: u64) -> Result<Vec<DeploymentRecord>, StorageError> {
        let records = self.records.lock().unwrap();
        Ok(records.iter().rev().take(limit as usize).cloned().collect())
    }

    async fn latest_terminal(&self) -> Result<Option<DeploymentRecord>, StorageError> {
        let records = self.records.lock().unwrap();
        Ok(records.iter().rev().find(|r| r.status.is_terminal()).cloned())
    }

    async fn last_successful(&self) -> Result<Option<DeploymentRecord>, StorageError> {
        let records = self.records.lock().unwrap();
        Ok(records
            .iter()
            .rev()
            .find(|r| r.status == DeploymentStatus::Succeeded)
            .cloned())
    }

    async fn fail_in_flight(&self, reason: &str) -> Result<u64, StorageError> {
        let mut records = self.records.lock().unwrap();
        let mut count = 0;
        for record in records.iter_mut().filter(|r| !r.status.is_terminal()) {
            record.finish(DeploymentStatus::Failed, Some(reason.to_string()));
            count += 1;
        }
        Ok(count)
    }
}

struct FakeGit {
    syncs: AtomicUsize,
    sync_error: Option<ExternalError>,
    commit: Result<CommitInfo, ExternalError>,
}

impl FakeGit {
    fn at(hash: &str) -> Self {
        Self {
            syncs: AtomicUsize::new(0),
            sync_error: None,
            commit: Ok(CommitInfo {
                hash: hash.to_string(),
                author: "Ops Bot".into(),
                relative_time: "1 minute ago".into(),
                subject: "Release".into(),
            }),
        }
    }
}

#[async_trait]
impl SourceControl for FakeGit {
    async fn sync_to(&self, _path: &Path, _git_ref: &str) -> Result<(), ExternalError> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        match &self.sync_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    async fn current_commit(&self, _path: &Path) -> Result<CommitInfo, ExternalError> {
        self.commit.clone()
    }
}

#[derive(Default)]
struct FakeRemote {
    lines: Vec<OutputLine>,
    code: i32,
    /// Output never ends; only the deadline stops the command
    hang: bool,
    /// The command never gets started
    hang_on_start: bool,
    terminate_fails: bool,
    seen: Mutex<Vec<CommandSpec>>,
}

impl FakeRemote {
    fn exiting(code: i32, lines: &[&str]) -> Self {
        Self {
            lines: lines.iter().map(|l| OutputLine::stdout(*l)).collect(),
            code,
            ..Default::default()
        }
    }

    fn runs(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

struct FakeRun {
    lines: VecDeque<OutputLine>,
    code: i32,
    hang: bool,
    terminate_fails: bool,
}

#[async_trait]
impl RunningCommand for FakeRun {
    async fn next_line(&mut self) -> Option<OutputLine> {
        if let Some(line) = self.lines.pop_front() {
            return Some(line);
        }
        if self.hang {
            std::future::pending::<()>().await;
        }
        None
    }

    async fn wait(&mut self) -> Result<i32, ExternalError> {
        Ok(self.code)
    }

    async fn terminate(&mut self) -> Result<(), ExternalError> {
        if self.terminate_fails {
            return Err(ExternalError::Fatal("remote process may still be running".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteExecutor for FakeRemote {
    async fn run(&self, spec: &CommandSpec) -> Result<Box<dyn RunningCommand>, ExternalError> {
        self.seen.lock().unwrap().push(spec.clone());
        if self.hang_on_start {
            std::future::pending::<()>().await;
        }
        Ok(Box::new(FakeRun {
            lines: self.lines.iter().cloned().collect(),
            code: self.code,
            hang: self.hang,
            terminate_fails: self.terminate_fails,
        }))
    }
}

struct Fixture {
    store: Arc<MemoryDeploymentStore>,
    local_git: Arc<FakeGit>,
    remote: Arc<FakeRemote>,
    local: Arc<FakeRemote>,
    executor: DeploymentExecutor,
}

fn config() -> DeployConfig {
    DeployConfig {
        script: "./deploy.sh".into(),
        working_dir: "/srv/app".into(),
        ci_command: Some("gh workflow run deploy.yml --ref {ref}".into()),
        timeout_secs: 5,
        grace_period_secs: 1,
        summary_max_lines: 40,
        summary_max_chars: 1900,
        ..Default::default()
    }
}

fn fixture_with(
    config: DeployConfig,
    local_git: FakeGit,
    remote_git: FakeGit,
    remote: FakeRemote,
) -> Fixture {
    let store = Arc::new(MemoryDeploymentStore::default());
    let local_git = Arc::new(local_git);
    let remote = Arc::new(remote);
    let local = Arc::new(FakeRemote::exiting(0, &["workflow dispatched"]));
    let backends = DeployBackends {
        local_git: local_git.clone(),
        remote_git: Arc::new(remote_git),
        remote: remote.clone(),
        local: local.clone(),
    };
    let executor = DeploymentExecutor::new(store.clone(), backends, config);
    Fixture {
        store,
        local_git,
        remote,
        local,
        executor,
    }
}

fn fixture(remote: FakeRemote) -> Fixture {
    fixture_with(config(), FakeGit::at("abc123"), FakeGit::at("abc123"), remote)
}

fn request(git_ref: &str, method: DeployMethod) -> DeployRequest {
    DeployRequest {
        git_ref: git_ref.into(),
        method,
        triggered_by: "alice".into(),
    }
}

#[tokio::test]
async fn test_successful_direct_deployment() {
    let _ = env_logger::builder().is_test(true).try_init();
    let fx = fixture(FakeRemote::exiting(0, &["pulling images", "restarting", "done"]));
    let mut events = fx.executor.subscribe();

    let record = assert_ok!(fx.executor.trigger(request("main", DeployMethod::Direct)).await);
    assert_eq!(record.status, DeploymentStatus::Succeeded);
    assert_eq!(record.commit_hash.as_deref(), Some("abc123"));
    assert_eq!(record.error_message, None);
    assert_eq!(record.output_summary, "pulling images\nrestarting\ndone");
    assert!(record.finished_at.is_some());
    assert_eq!(fx.executor.state(), ExecutorState::Idle);
    assert_eq!(fx.local_git.syncs.load(Ordering::SeqCst), 1);

    let spec = fx.remote.seen.lock().unwrap()[0].clone();
    assert_eq!(spec.command, "./deploy.sh");
    assert_eq!(spec.working_dir.as_deref(), Some(Path::new("/srv/app")));

    let mut progress = Vec::new();
    loop {
        match events.recv().await.unwrap() {
            DeployEvent::Progress { deployment_id, line } => {
                assert_eq!(deployment_id, record.id);
                progress.push(line.text);
            }
            DeployEvent::Finished { record: finished } => {
                assert_eq!(finished, record);
                break;
            }
        }
    }
    assert_eq!(progress, vec!["pulling images", "restarting", "done"]);

    let stored = fx.store.get(record.id).await.unwrap().unwrap();
    assert_eq!(stored, record);
}

#[tokio::test]
async fn test_failing_script_is_recorded_as_failed() {
    let fx = fixture(FakeRemote::exiting(1, &["migrating", "error: relation missing"]));

    let record = assert_ok!(fx.executor.trigger(request("v1.4.0", DeployMethod::Direct)).await);
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert_eq!(record.error_message.as_deref(), Some("command exited with code 1"));
    assert!(record.output_summary.contains("error: relation missing"));
    assert_eq!(fx.executor.state(), ExecutorState::Idle);
    assert_eq!(
        fx.executor.last_successful().await.unwrap(),
        None,
        "a failed run is never the last successful one"
    );
}

#[tokio::test]
async fn test_second_trigger_is_rejected_while_in_flight() {
    let fx = fixture(FakeRemote::exiting(0, &["ok"]));

    let ticket = assert_ok!(fx.executor.accept(request("main", DeployMethod::Direct)).await);
    let first = ticket.record().id;
    assert_eq!(
        fx.executor.state(),
        ExecutorState::Queued {
            deployment_id: first
        }
    );

    let err = assert_err!(fx.executor.trigger(request("hotfix", DeployMethod::Direct)).await);
    assert!(matches!(err, DeployError::InProgress(id) if id == first));
    assert_eq!(fx.store.list_recent(10).await.unwrap().len(), 1);
    assert_eq!(fx.remote.runs(), 0);

    let record = assert_ok!(fx.executor.execute(ticket).await);
    assert_eq!(record.status, DeploymentStatus::Succeeded);
    assert_eq!(fx.executor.state(), ExecutorState::Idle);

    assert_ok!(fx.executor.trigger(request("hotfix", DeployMethod::Direct)).await);
    let history = fx.executor.history(10).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].git_ref, "hotfix");
}

#[tokio::test(start_paused = true)]
async fn test_deadline_terminates_the_command() {
    let fx = fixture(FakeRemote {
        lines: vec![OutputLine::stdout("starting")],
        hang: true,
        ..Default::default()
    });

    let record = assert_ok!(fx.executor.trigger(request("main", DeployMethod::Direct)).await);
    assert_eq!(record.status, DeploymentStatus::TimedOut);
    assert_eq!(record.error_message.as_deref(), Some("timed out after 5s"));
    assert_eq!(record.output_summary, "starting");
    assert_eq!(fx.executor.state(), ExecutorState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_unconfirmed_termination_is_reported() {
    let fx = fixture(FakeRemote {
        hang: true,
        terminate_fails: true,
        ..Default::default()
    });

    let record = assert_ok!(fx.executor.trigger(request("main", DeployMethod::Direct)).await);
    assert_eq!(record.status, DeploymentStatus::TimedOut);
    assert_eq!(
        record.error_message.as_deref(),
        Some("timed out after 5s; remote process status unknown")
    );
    assert_eq!(fx.executor.state(), ExecutorState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_while_starting_leaves_remote_state_unknown() {
    let fx = fixture(FakeRemote {
        hang_on_start: true,
        ..Default::default()
    });

    let record = assert_ok!(fx.executor.trigger(request("main", DeployMethod::Direct)).await);
    assert_eq!(record.status, DeploymentStatus::TimedOut);
    assert_eq!(
        record.error_message.as_deref(),
        Some("timed out after 5s; remote process status unknown")
    );
    assert_eq!(fx.remote.runs(), 1);
    assert_eq!(fx.executor.state(), ExecutorState::Idle);
}

#[tokio::test]
async fn test_outcome_write_is_retried() {
    let fx = fixture(FakeRemote::exiting(0, &["ok"]));
    fx.store.failing_terminal_writes.store(1, Ordering::SeqCst);

    let record = assert_ok!(fx.executor.trigger(request("main", DeployMethod::Direct)).await);
    assert_eq!(record.status, DeploymentStatus::Succeeded);
    let stored = fx.executor.get(record.id).await.unwrap();
    assert_eq!(stored, record);
}

#[tokio::test]
async fn test_unrecorded_outcome_does_not_block_later_deployments() {
    let fx = fixture(FakeRemote::exiting(0, &["ok"]));
    fx.store.failing_terminal_writes.store(3, Ordering::SeqCst);

    let err = assert_err!(fx.executor.trigger(request("main", DeployMethod::Direct)).await);
    assert!(matches!(err, DeployError::Storage(StorageError::WriteFailed)));
    assert_eq!(fx.executor.state(), ExecutorState::Idle);
    let stored = fx.store.list_recent(1).await.unwrap().remove(0);
    assert_eq!(stored.status, DeploymentStatus::Failed);
    assert_eq!(stored.error_message.as_deref(), Some(OUTCOME_NOT_RECORDED));

    let record = assert_ok!(fx.executor.trigger(request("hotfix", DeployMethod::Direct)).await);
    assert_eq!(record.status, DeploymentStatus::Succeeded);
    assert_eq!(fx.executor.history(10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_ci_method_runs_ci_command_without_sync() {
    let fx = fixture(FakeRemote::exiting(0, &[]));

    let record = assert_ok!(fx.executor.trigger(request("release/2.0", DeployMethod::Ci)).await);
    assert_eq!(record.status, DeploymentStatus::Succeeded);
    assert_eq!(record.method, DeployMethod::Ci);
    assert_eq!(record.commit_hash, None);
    assert_eq!(fx.local_git.syncs.load(Ordering::SeqCst), 0);
    assert_eq!(fx.remote.runs(), 0);
    assert_eq!(
        fx.local.seen.lock().unwrap()[0].command,
        "gh workflow run deploy.yml --ref release/2.0"
    );
}

#[tokio::test]
async fn test_ci_method_needs_ci_command() {
    let mut config = config();
    config.ci_command = None;
    let fx = fixture_with(
        config,
        FakeGit::at("abc123"),
        FakeGit::at("abc123"),
        FakeRemote::exiting(0, &[]),
    );

    let err = assert_err!(fx.executor.trigger(request("main", DeployMethod::Ci)).await);
    assert!(matches!(err, DeployError::Validation(_)));
    assert!(fx.store.list_recent(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sync_failure_fails_the_deployment() {
    let mut local_git = FakeGit::at("abc123");
    local_git.sync_error = Some(ExternalError::Fatal(
        "git exited with code 1: pathspec 'nope' did not match".into(),
    ));
    let fx = fixture_with(
        config(),
        local_git,
        FakeGit::at("abc123"),
        FakeRemote::exiting(0, &[]),
    );

    let record = assert_ok!(fx.executor.trigger(request("nope", DeployMethod::Direct)).await);
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert!(record.error_message.unwrap().starts_with("sync to nope failed"));
    assert_eq!(fx.remote.runs(), 0);
    assert_eq!(fx.executor.state(), ExecutorState::Idle);
}

#[tokio::test]
async fn test_invalid_ref_is_rejected_before_anything_runs() {
    let fx = fixture(FakeRemote::exiting(0, &[]));

    for bad in ["", "main; reboot", "--upload-pack=x"] {
        let err = assert_err!(fx.executor.trigger(request(bad, DeployMethod::Direct)).await);
        assert!(matches!(err, DeployError::Validation(_)), "{:?} accepted", bad);
    }
    assert!(fx.store.list_recent(10).await.unwrap().is_empty());
    assert_eq!(fx.executor.state(), ExecutorState::Idle);
}

#[tokio::test]
async fn test_recover_fails_leftover_records() {
    let fx = fixture(FakeRemote::exiting(0, &[]));
    let mut leftover = DeploymentRecord::queued(&request("main", DeployMethod::Direct));
    leftover.status = DeploymentStatus::Running;
    fx.store.create(&leftover).await.unwrap();

    assert_eq!(fx.executor.recover().await.unwrap(), 1);
    let stored = fx.executor.get(leftover.id).await.unwrap();
    assert_eq!(stored.status, DeploymentStatus::Failed);
    assert_eq!(stored.error_message.as_deref(), Some("interrupted by restart"));
    assert_eq!(fx.executor.recover().await.unwrap(), 0);

    let err = assert_err!(fx.executor.get(Uuid::new_v4()).await);
    assert!(matches!(err, DeployError::NotFound(_)));
}

#[tokio::test]
async fn test_status_reports_deployed_commit_and_last_outcome() {
    let fx = fixture(FakeRemote::exiting(0, &[]));

    let report = fx.executor.status().await.unwrap();
    assert_eq!(report.state, ExecutorState::Idle);
    assert_eq!(report.deployed_commit.unwrap().hash, "abc123");
    assert_eq!(report.last_deployment, None);

    let record = fx
        .executor
        .trigger(request("main", DeployMethod::Direct))
        .await
        .unwrap();
    let report = fx.executor.status().await.unwrap();
    assert_eq!(report.last_deployment, Some(record));
}

#[tokio::test]
async fn test_status_survives_unreachable_host() {
    let mut remote_git = FakeGit::at("abc123");
    remote_git.commit = Err(ExternalError::Transient("ssh: connect timed out".into()));
    let fx = fixture_with(config(), FakeGit::at("abc123"), remote_git, FakeRemote::default());

    let report = fx.executor.status().await.unwrap();
    assert_eq!(report.deployed_commit, None);
    assert!(report.deployed_commit_error.unwrap().contains("connect timed out"));
}
