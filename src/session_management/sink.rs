use crate::error_handling::types::ExternalError;
use crate::session_management::types::TailEvent;
use async_trait::async_trait;
use log::{info, warn};
use tokio::sync::mpsc;

/// Caller-supplied destination of tail events.
///
/// A transient error leaves the line undelivered and it is offered again on the next
/// poll; a fatal error ends the session.
#[async_trait]
pub trait TailSink: Send + Sync {
    async fn deliver(&self, event: TailEvent) -> Result<(), ExternalError>;
}

#[async_trait]
impl TailSink for mpsc::Sender<TailEvent> {
    async fn deliver(&self, event: TailEvent) -> Result<(), ExternalError> {
        self.send(event)
            .await
            .map_err(|_| ExternalError::Fatal("tail event receiver closed".into()))
    }
}

#[async_trait]
impl TailSink for mpsc::UnboundedSender<TailEvent> {
    async fn deliver(&self, event: TailEvent) -> Result<(), ExternalError> {
        self.send(event)
            .map_err(|_| ExternalError::Fatal("tail event receiver closed".into()))
    }
}

/// Writes tail events to the process log. Used for sessions started over HTTP, which have
/// no caller waiting on a channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

#[async_trait]
impl TailSink for LoggingSink {
    async fn deliver(&self, event: TailEvent) -> Result<(), ExternalError> {
        match event {
            TailEvent::LogLine { session_key, line } => {
                info!("[{}] {} {}", session_key, line.level, line.message)
            }
            TailEvent::SessionEnded {
                session_key,
                reason,
            } => warn!("[{}] Tail session ended: {:?}", session_key, reason),
        }
        Ok(())
    }
}
