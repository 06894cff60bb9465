use crate::deployment::remote_exec::{shell_quote, CommandSpec, RemoteExecutor};
use crate::deployment::types::{CommitInfo, OutputStream};
use crate::error_handling::types::ExternalError;
use async_trait::async_trait;
use log::{debug, info};
use std::path::Path;
use std::sync::Arc;

const COMMIT_FORMAT: &str = "%H|%an|%ar|%s";

#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Brings the working copy at `path` to `git_ref`.
    async fn sync_to(&self, path: &Path, git_ref: &str) -> Result<(), ExternalError>;

    async fn current_commit(&self, path: &Path) -> Result<CommitInfo, ExternalError>;
}

/// `git` driven through an executor, so the same code serves the local working copy and
/// the checkout on the target host.
pub struct GitCli {
    executor: Arc<dyn RemoteExecutor>,
}

impl GitCli {
    pub fn new(executor: Arc<dyn RemoteExecutor>) -> Self {
        Self { executor }
    }

    /// Runs `command` in `path`, returning stdout lines, or the stderr tail on failure.
    async fn git(&self, path: &Path, command: String) -> Result<Vec<String>, ExternalError> {
        debug!("git in {}: {}", path.display(), command);
        let spec = CommandSpec::new(command).in_dir(path);
        let mut running = self.executor.run(&spec).await?;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(line) = running.next_line().await {
            match line.stream {
                OutputStream::Stdout => stdout.push(line.text),
                OutputStream::Stderr => stderr.push(line.text),
            }
        }
        match running.wait().await? {
            0 => Ok(stdout),
            code => Err(ExternalError::Fatal(format!(
                "git exited with code {}: {}",
                code,
                stderr.last().map(String::as_str).unwrap_or("no error output")
            ))),
        }
    }
}

#[async_trait]
impl SourceControl for GitCli {
    async fn sync_to(&self, path: &Path, git_ref: &str) -> Result<(), ExternalError> {
        let quoted = shell_quote(git_ref);
        let remote_branch = shell_quote(&format!("origin/{}", git_ref));
        let command = format!(
            "git fetch --prune origin && git checkout --force {quoted} && \
             if git rev-parse --verify --quiet {remote_branch} >/dev/null; \
             then git reset --hard {remote_branch}; fi"
        );
        self.git(path, command).await?;
        info!("Working copy {} synced to {}", path.display(), git_ref);
        Ok(())
    }

    async fn current_commit(&self, path: &Path) -> Result<CommitInfo, ExternalError> {
        let lines = self
            .git(path, format!("git log -1 --format={}", shell_quote(COMMIT_FORMAT)))
            .await?;
        lines
            .first()
            .and_then(|line| parse_commit_line(line))
            .ok_or_else(|| ExternalError::Fatal("unexpected git log output".into()))
    }
}

/// Parses one `%H|%an|%ar|%s` line; the subject may itself contain `|`.
pub fn parse_commit_line(line: &str) -> Option<CommitInfo> {
    let mut parts = line.trim().splitn(4, '|');
    let hash = parts.next().filter(|h| !h.is_empty())?;
    Some(CommitInfo {
        hash: hash.to_string(),
        author: parts.next()?.to_string(),
        relative_time: parts.next()?.to_string(),
        subject: parts.next()?.to_string(),
    })
}

/// Refs are limited to `[A-Za-z0-9._/-]` and may not look like an option.
pub fn validate_ref(git_ref: &str) -> Result<(), String> {
    if git_ref.is_empty() {
        return Err("empty ref".into());
    }
    if git_ref.starts_with('-') {
        return Err(format!("ref '{}' may not start with '-'", git_ref));
    }
    if git_ref.contains("..") {
        return Err(format!("ref '{}' may not contain '..'", git_ref));
    }
    match git_ref
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-')))
    {
        Some(c) => Err(format!("ref '{}' contains invalid character '{}'", git_ref, c)),
        None => Ok(()),
    }
}
