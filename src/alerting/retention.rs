use crate::alerting::ingestion::IngestionPipeline;
use log::{debug, error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Runs one sweep: purges expired records and stale cooldown entries.
pub async fn sweep_once(pipeline: &IngestionPipeline, retention: chrono::Duration) -> u64 {
    let purged = match pipeline.store().purge_older_than(retention).await {
        Ok(count) => count,
        Err(e) => {
            error!("Retention sweep failed: {}", e);
            0
        }
    };
    let pruned = pipeline.prune_cooldowns();
    debug!(
        "Retention sweep done: {} record(s) purged, {} cooldown(s) pruned",
        purged, pruned
    );
    purged
}

/// Sweeps immediately, then every `every`, until `cancel` fires.
pub fn spawn_retention_sweeper(
    pipeline: Arc<IngestionPipeline>,
    retention: chrono::Duration,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "Retention sweeper started (retention {} day(s), every {:?})",
            retention.num_days(),
            every
        );
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    sweep_once(&pipeline, retention).await;
                }
            }
        }
        info!("Retention sweeper stopped");
    })
}
