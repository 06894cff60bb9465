//! Command execution capability: locally through `sh -c` or on the target host over `ssh`.

use crate::configuration::SshConfig;
use crate::deployment::types::OutputLine;
use crate::error_handling::types::ExternalError;
use async_trait::async_trait;
use log::{debug, error, warn};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

/// What to run, where, and with which environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    /// Shell command line
    pub command: String,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new<S: Into<String>>(command: S) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn in_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

/// A started command whose output is consumed line by line.
#[async_trait]
pub trait RunningCommand: Send {
    /// Next stdout/stderr line in arrival order; `None` once both streams are closed.
    async fn next_line(&mut self) -> Option<OutputLine>;

    /// Exit code once the command has ended.
    async fn wait(&mut self) -> Result<i32, ExternalError>;

    /// Asks the command to stop. `Ok` means the process is confirmed gone.
    async fn terminate(&mut self) -> Result<(), ExternalError>;
}

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<Box<dyn RunningCommand>, ExternalError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transport {
    Local,
    Ssh(SshConfig),
}

/// Runs commands as child processes of this one.
pub struct ProcessExecutor {
    transport: Transport,
}

impl ProcessExecutor {
    pub fn local() -> Self {
        Self {
            transport: Transport::Local,
        }
    }

    pub fn ssh(config: SshConfig) -> Self {
        Self {
            transport: Transport::Ssh(config),
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    fn build_command(&self, spec: &CommandSpec) -> Command {
        match &self.transport {
            Transport::Local => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(&spec.command).envs(&spec.env);
                if let Some(dir) = &spec.working_dir {
                    cmd.current_dir(dir);
                }
                cmd
            }
            Transport::Ssh(ssh) => {
                let mut cmd = Command::new("ssh");
                cmd.arg("-o")
                    .arg("BatchMode=yes")
                    .arg("-o")
                    .arg("StrictHostKeyChecking=accept-new");
                if let Some(key) = &ssh.key_path {
                    cmd.arg("-i").arg(key);
                }
                if let Some(port) = ssh.port {
                    cmd.arg("-p").arg(port.to_string());
                }
                cmd.arg(format!("{}@{}", ssh.user, ssh.host))
                    .arg("--")
                    .arg(remote_command_line(spec));
                cmd
            }
        }
    }
}

#[async_trait]
impl RemoteExecutor for ProcessExecutor {
    async fn run(&self, spec: &CommandSpec) -> Result<Box<dyn RunningCommand>, ExternalError> {
        let mut cmd = self.build_command(spec);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!("Spawning {:?}", cmd.as_std());

        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn '{}': {}", spec.command, e);
            ExternalError::Fatal(format!("failed to spawn command: {}", e))
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, tx.clone(), OutputLine::stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, tx, OutputLine::stderr);
        }

        Ok(Box::new(ProcessHandle {
            child,
            lines: rx,
            remote: matches!(self.transport, Transport::Ssh(_)),
        }))
    }
}

struct ProcessHandle {
    child: Child,
    lines: mpsc::UnboundedReceiver<OutputLine>,
    remote: bool,
}

#[async_trait]
impl RunningCommand for ProcessHandle {
    async fn next_line(&mut self) -> Option<OutputLine> {
        self.lines.recv().await
    }

    async fn wait(&mut self) -> Result<i32, ExternalError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| ExternalError::Transient(format!("failed to wait for command: {}", e)))?;
        // killed by a signal
        Ok(status.code().unwrap_or(-1))
    }

    async fn terminate(&mut self) -> Result<(), ExternalError> {
        self.child
            .kill()
            .await
            .map_err(|e| ExternalError::Fatal(format!("failed to kill command: {}", e)))?;
        if self.remote {
            warn!("ssh client killed; the remote process may still be running");
            return Err(ExternalError::Fatal(
                "remote process may still be running".into(),
            ));
        }
        Ok(())
    }
}

fn forward_lines<R>(
    stream: R,
    tx: mpsc::UnboundedSender<OutputLine>,
    wrap: fn(String) -> OutputLine,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(stream).lines();
    tokio::spawn(async move {
        while let Ok(Some(line)) = reader.next_line().await {
            if tx.send(wrap(line)).is_err() {
                break;
            }
        }
    });
}

/// Single-quotes `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Command line sent over ssh: `cd` into the working dir, export the env, run.
fn remote_command_line(spec: &CommandSpec) -> String {
    let mut parts = Vec::new();
    if let Some(dir) = &spec.working_dir {
        parts.push(format!("cd {}", shell_quote(&dir.to_string_lossy())));
    }
    let exports: Vec<String> = spec
        .env
        .iter()
        .map(|(k, v)| format!("{}={}", k, shell_quote(v)))
        .collect();
    if exports.is_empty() {
        parts.push(spec.command.clone());
    } else {
        parts.push(format!("export {} && {}", exports.join(" "), spec.command));
    }
    parts.join(" && ")
}
