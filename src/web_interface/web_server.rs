use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use log::info;
use tokio_util::sync::CancellationToken;
use warp::Filter;

use super::routes::*;
use crate::alerting::IngestionPipeline;
use crate::configuration::WebConfig;
use crate::deployment::DeploymentExecutor;
use crate::error_handling::types::WebError;
use crate::session_management::{TailSessionManager, TailSink};

/// Webhook receiver and JSON API
pub struct WebServer {
    pipeline: Arc<IngestionPipeline>,
    executor: Arc<DeploymentExecutor>,
    tails: Arc<TailSessionManager>,
    tail_sink: Arc<dyn TailSink>,
    config: WebConfig,
}

impl WebServer {
    pub fn new(
        pipeline: Arc<IngestionPipeline>,
        executor: Arc<DeploymentExecutor>,
        tails: Arc<TailSessionManager>,
        tail_sink: Arc<dyn TailSink>,
        config: WebConfig,
    ) -> Self {
        Self {
            pipeline,
            executor,
            tails,
            tail_sink,
            config,
        }
    }

    pub fn address(&self) -> Result<SocketAddr, WebError> {
        let ip: IpAddr = self
            .config
            .bind_address
            .parse()
            .map_err(|_| WebError::BadBindAddress(self.config.bind_address.clone()))?;
        Ok(SocketAddr::new(ip, self.config.port))
    }

    /// Serves until `cancel` fires.
    pub async fn start(&self, cancel: CancellationToken) -> Result<(), WebError> {
        let addr = self.address()?;
        let max_body = self.config.max_body_bytes;

        let alerts = ingest_alert_route(self.pipeline.clone(), max_body)
            .or(sns_route(self.pipeline.clone(), max_body))
            .or(list_alerts_route(self.pipeline.clone()))
            .or(acknowledge_alert_route(self.pipeline.clone()))
            .or(get_alert_route(self.pipeline.clone()));

        // status before :id so "status" is not parsed as an id
        let deployments = deployment_status_route(self.executor.clone())
            .or(list_deployments_route(self.executor.clone()))
            .or(trigger_deployment_route(self.executor.clone()))
            .or(get_deployment_route(self.executor.clone()));

        let tails = list_tails_route(self.tails.clone())
            .or(start_tail_route(self.tails.clone(), self.tail_sink.clone()))
            .or(stop_tail_route(self.tails.clone()));

        let routes = health_route()
            .or(alerts)
            .or(deployments)
            .or(tails)
            .recover(handle_rejection)
            .with(warp::log("opsdesk::http"));

        info!("Web interface listening on {}", addr);
        tokio::select! {
            _ = warp::serve(routes).run(addr) => {}
            _ = cancel.cancelled() => info!("Web interface shutting down"),
        }
        Ok(())
    }
}
