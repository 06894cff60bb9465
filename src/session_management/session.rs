use crate::session_management::types::{SessionKey, TailStatus};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use uuid::Uuid;

/// Caller-side view of a started tail session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: Uuid,
    pub key: SessionKey,
    pub expires_at: DateTime<Utc>,
    status: watch::Receiver<TailStatus>,
}

impl SessionHandle {
    pub(crate) fn new(
        id: Uuid,
        key: SessionKey,
        expires_at: DateTime<Utc>,
        status: watch::Receiver<TailStatus>,
    ) -> Self {
        Self {
            id,
            key,
            expires_at,
            status,
        }
    }

    pub fn status(&self) -> TailStatus {
        *self.status.borrow()
    }

    /// Resolves with the terminal status once the session has ended.
    pub async fn finished(&mut self) -> TailStatus {
        match self.status.wait_for(TailStatus::is_terminal).await {
            Ok(status) => *status,
            // the loop task is gone without publishing a terminal state
            Err(_) => TailStatus::Failed,
        }
    }
}
