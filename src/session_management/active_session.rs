use crate::session_management::types::{SessionKey, TailSessionInfo, TailStatus};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Manager-side entry of a running tail session: the controls of its task.
pub(crate) struct ActiveSession {
    pub id: Uuid,
    pub key: SessionKey,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub cancel: CancellationToken,
    pub status: Arc<watch::Sender<TailStatus>>,
}

impl ActiveSession {
    /// Cancels the loop and flags the session as stopping.
    pub fn request_stop(&self) {
        self.status.send_if_modified(|status| {
            if *status == TailStatus::Running {
                *status = TailStatus::Stopping;
                true
            } else {
                false
            }
        });
        self.cancel.cancel();
    }

    pub fn info(&self) -> TailSessionInfo {
        TailSessionInfo {
            id: self.id,
            key: self.key.clone(),
            status: *self.status.borrow(),
            started_at: self.started_at,
            expires_at: self.expires_at,
        }
    }
}
