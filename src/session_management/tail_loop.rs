//! Polling loop driving one tail session.

use crate::error_handling::types::ExternalError;
use crate::session_management::log_source::LogSource;
use crate::session_management::sink::TailSink;
use crate::session_management::types::{
    EndReason, LogBatch, LogCursor, SessionKey, TailEvent, TailStatus,
};
use log::{debug, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Bounded exponential backoff for transient source errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): base, 2*base, 4*base...
    pub fn delay(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)))
    }
}

pub(crate) struct TailLoop {
    pub key: SessionKey,
    pub source: Arc<dyn LogSource>,
    pub sink: Arc<dyn TailSink>,
    pub cancel: CancellationToken,
    pub deadline: Instant,
    pub poll_interval: Duration,
    pub batch_limit: usize,
    pub retry: RetryPolicy,
    pub status: Arc<watch::Sender<TailStatus>>,
}

impl TailLoop {
    /// Runs until stopped, expired or failed. Never panics on source or sink errors.
    pub async fn run(self) -> EndReason {
        let reason = self.poll_until_done().await;
        info!("[{}] Tail loop ended: {:?}", self.key, reason);
        reason
    }

    async fn poll_until_done(&self) -> EndReason {
        let source = self.key.source.clone();
        let mut cursor = match self
            .retrying(|| self.source.current_cursor(&source))
            .await
        {
            Ok(cursor) => cursor,
            Err(reason) => return reason,
        };
        debug!("[{}] Tailing from cursor {:?}", self.key, cursor);

        loop {
            if let Some(reason) = self.interruption() {
                return reason;
            }

            let batch = match self
                .retrying(|| {
                    self.source
                        .query(&source, &self.key.filter, cursor, self.batch_limit)
                })
                .await
            {
                Ok(batch) => batch,
                Err(reason) => return reason,
            };

            // lines read past the deadline are not delivered
            if Instant::now() >= self.deadline {
                if let Some(reason) = self.interruption() {
                    return reason;
                }
            }

            if batch.reset {
                info!("[{}] Source restarted, following it from the beginning", self.key);
            }
            match self.deliver(batch, cursor).await {
                Ok(next) => cursor = next,
                Err(reason) => return reason,
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = sleep_until(self.deadline) => {}
                _ = sleep(self.poll_interval) => {}
            }
        }
    }

    /// Delivers lines in order, advancing the cursor only past delivered ones.
    async fn deliver(&self, batch: LogBatch, cursor: LogCursor) -> Result<LogCursor, EndReason> {
        let mut cursor = if batch.reset { LogCursor::default() } else { cursor };
        for line in batch.lines {
            if line.cursor <= cursor {
                continue;
            }
            let line_cursor = line.cursor;
            let event = TailEvent::LogLine {
                session_key: self.key.clone(),
                line,
            };
            match self.sink.deliver(event).await {
                Ok(()) => cursor = line_cursor,
                Err(ExternalError::Transient(e)) => {
                    warn!("[{}] Delivery failed, retrying next poll: {}", self.key, e);
                    return Ok(cursor);
                }
                Err(ExternalError::Fatal(e)) => {
                    return Err(EndReason::Failed(format!("delivery failed: {}", e)));
                }
            }
        }
        Ok(cursor.max(batch.next_cursor))
    }

    async fn retrying<T, F, Fut>(&self, mut operation: F) -> Result<T, EndReason>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExternalError>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(ExternalError::Fatal(e)) => return Err(EndReason::Failed(e)),
                Err(ExternalError::Transient(e)) if attempt >= self.retry.attempts => {
                    return Err(EndReason::Failed(format!(
                        "giving up after {} attempts: {}",
                        attempt, e
                    )));
                }
                Err(ExternalError::Transient(e)) => {
                    let delay = self.retry.delay(attempt);
                    warn!(
                        "[{}] Transient source error (attempt {}), retrying in {:?}: {}",
                        self.key, attempt, delay, e
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        _ = sleep_until(self.deadline) => {}
                        _ = sleep(delay) => {}
                    }
                    if let Some(reason) = self.interruption() {
                        return Err(reason);
                    }
                    attempt += 1;
                }
            }
        }
    }

    fn interruption(&self) -> Option<EndReason> {
        let reason = if self.cancel.is_cancelled() {
            EndReason::Stopped
        } else if Instant::now() >= self.deadline {
            EndReason::Expired
        } else {
            return None;
        };
        self.status.send_if_modified(|status| {
            if *status == TailStatus::Running {
                *status = TailStatus::Stopping;
                true
            } else {
                false
            }
        });
        Some(reason)
    }
}
