use crate::alerting::retention::spawn_retention_sweeper;
use crate::alerting::IngestionPipeline;
use crate::configuration::config::Config;
use crate::deployment::{
    DeployBackends, DeployEvent, DeploymentExecutor, GitCli, ProcessExecutor, RemoteExecutor,
};
use crate::error_handling::types::*;
use crate::session_management::{FileLogSource, LoggingSink, TailSessionManager};
use crate::storage::database::connect;
use crate::storage::{AlertRepository, DeploymentRepository};
use crate::web_interface::WebServer;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Owns the configuration and wires every subsystem together for one process lifetime.
pub struct Controller {
    pub config: Config,
    cancel: CancellationToken,
}

impl Controller {
    pub fn new(config: Config) -> Result<Self, ControllerError> {
        config.validate()?;
        Ok(Self {
            config,
            cancel: CancellationToken::new(),
        })
    }

    /// Token cancelled on shutdown; background tasks watch it.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Starts every subsystem and serves until ctrl-c or `shutdown()`.
    pub async fn run(&mut self) -> Result<(), ControllerError> {
        info!("Opening database {}", self.config.storage.database_path.display());
        let db = connect(&self.config.storage.database_path).await?;

        let pipeline = Arc::new(IngestionPipeline::new(
            Arc::new(AlertRepository::new(db.clone())),
            self.config.alerts.clone(),
        ));
        let sweeper = spawn_retention_sweeper(
            pipeline.clone(),
            self.config.alerts.retention(),
            Duration::from_secs(self.config.alerts.sweep_interval_secs),
            self.cancel.clone(),
        );
        let alert_log = log_alert_notifications(&pipeline, self.cancel.clone());

        let tails = Arc::new(TailSessionManager::new(
            Arc::new(FileLogSource::new(self.config.tailing.sources.clone())),
            self.config.tailing.clone(),
        ));

        let executor = Arc::new(self.build_executor(db));
        match executor.recover().await {
            Ok(0) => {}
            Ok(count) => warn!("Marked {} interrupted deployment(s) as failed", count),
            Err(e) => error!("Unable to recover interrupted deployments: {}", e),
        }
        let deploy_log = log_deploy_events(&executor, self.cancel.clone());

        let server = WebServer::new(
            pipeline,
            executor,
            tails.clone(),
            Arc::new(LoggingSink),
            self.config.web.clone(),
        );

        let cancel = self.cancel.clone();
        let served = tokio::select! {
            result = server.start(cancel.clone()) => result,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received");
                Ok(())
            }
        };

        self.shutdown();
        tails.shutdown_all().await;
        for task in [sweeper, alert_log, deploy_log] {
            if let Err(e) = task.await {
                error!("Background task ended abnormally: {:?}", e);
            }
        }
        info!("Shutdown complete");
        served.map_err(ControllerError::from)
    }

    pub fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            info!("Shutting down");
            self.cancel.cancel();
        }
    }

    fn build_executor(&self, db: sea_orm::DatabaseConnection) -> DeploymentExecutor {
        let deploy = &self.config.deploy;
        let local: Arc<dyn RemoteExecutor> = Arc::new(ProcessExecutor::local());
        let remote: Arc<dyn RemoteExecutor> = match &deploy.ssh {
            Some(ssh) => {
                info!("Deployments run on {}@{} over ssh", ssh.user, ssh.host);
                Arc::new(ProcessExecutor::ssh(ssh.clone()))
            }
            None => {
                info!("No [deploy.ssh] section, deployments run locally");
                local.clone()
            }
        };
        DeploymentExecutor::new(
            Arc::new(DeploymentRepository::new(db)),
            DeployBackends {
                local_git: Arc::new(GitCli::new(local.clone())),
                remote_git: Arc::new(GitCli::new(remote.clone())),
                remote,
                local,
            },
            deploy.clone(),
        )
    }
}

fn log_alert_notifications(
    pipeline: &IngestionPipeline,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut notifications = pipeline.subscribe();
    tokio::spawn(async move {
        loop {
            let notification = tokio::select! {
                _ = cancel.cancelled() => break,
                received = notifications.recv() => received,
            };
            match notification {
                Ok(n) => {
                    let record = &n.record;
                    info!(
                        "[{}] {} alert {} in {}/{}: {} (x{})",
                        record.short_id(),
                        if n.is_new_occurrence { "New" } else { "Repeated" },
                        record.severity,
                        record.service,
                        record.environment,
                        record.message,
                        record.occurrence_count
                    );
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!("Alert notification log lagged, {} skipped", missed)
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn log_deploy_events(executor: &DeploymentExecutor, cancel: CancellationToken) -> JoinHandle<()> {
    let mut events = executor.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                received = events.recv() => received,
            };
            match event {
                Ok(DeployEvent::Progress {
                    deployment_id,
                    line,
                }) => debug!("[{}] {}", deployment_id, line.text),
                Ok(DeployEvent::Finished { record }) => info!(
                    "[{}] Finished {} in {}s",
                    record.id,
                    record.status,
                    record.duration_seconds.unwrap_or_default()
                ),
                Err(RecvError::Lagged(missed)) => {
                    warn!("Deployment event log lagged, {} skipped", missed)
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
