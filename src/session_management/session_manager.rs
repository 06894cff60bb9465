use crate::configuration::TailConfig;
use crate::error_handling::types::TailError;
use crate::session_management::active_session::ActiveSession;
use crate::session_management::log_source::{LogFilter, LogSource};
use crate::session_management::session::SessionHandle;
use crate::session_management::sink::TailSink;
use crate::session_management::tail_loop::{RetryPolicy, TailLoop};
use crate::session_management::types::{
    EndReason, SessionKey, TailEvent, TailSessionInfo, TailStatus,
};
use chrono::Utc;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

type SessionMap = Arc<Mutex<HashMap<SessionKey, ActiveSession>>>;

/// The structure related to live log tailing
///
/// Owns every active tail session. Each session is a tokio task polling the log source
/// for one (source, filter) key and pushing lines to the caller's sink until it is
/// stopped, reaches its deadline, or fails.
///
/// # Fields Overview
///
/// - `source`: the log backend every session polls
/// - `config`: poll interval, duration bounds and retry policy
/// - `sessions`: active sessions by key; an entry is removed as soon as its loop ends
pub struct TailSessionManager {
    source: Arc<dyn LogSource>,
    config: TailConfig,
    sessions: SessionMap,
}

impl TailSessionManager {
    pub fn new(source: Arc<dyn LogSource>, config: TailConfig) -> Self {
        Self {
            source,
            config,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Starts tailing `key` for `duration` (default when `None`, clamped to the maximum).
    pub fn start(
        &self,
        key: SessionKey,
        duration: Option<Duration>,
        sink: Arc<dyn TailSink>,
    ) -> Result<SessionHandle, TailError> {
        if key.source.is_empty() {
            return Err(TailError::Validation("missing log source".into()));
        }
        LogFilter::parse(&key.filter)?;
        let duration = self.effective_duration(duration)?;

        let mut sessions = self.lock_sessions();
        if sessions.contains_key(&key) {
            return Err(TailError::AlreadyRunning(key.to_string()));
        }

        let id = Uuid::new_v4();
        let started_at = Utc::now();
        let expires_at = started_at
            + chrono::Duration::from_std(duration)
                .map_err(|_| TailError::Validation("duration out of range".into()))?;
        let (status_tx, status_rx) = watch::channel(TailStatus::Running);
        let status = Arc::new(status_tx);
        let cancel = CancellationToken::new();

        let tail_loop = TailLoop {
            key: key.clone(),
            source: self.source.clone(),
            sink: sink.clone(),
            cancel: cancel.clone(),
            deadline: Instant::now() + duration,
            poll_interval: Duration::from_secs(self.config.poll_interval_secs),
            batch_limit: self.config.batch_limit,
            retry: RetryPolicy {
                attempts: self.config.retry_attempts,
                base_delay: Duration::from_millis(self.config.retry_base_delay_ms),
            },
            status: status.clone(),
        };

        sessions.insert(
            key.clone(),
            ActiveSession {
                id,
                key: key.clone(),
                started_at,
                expires_at,
                cancel,
                status: status.clone(),
            },
        );
        drop(sessions);

        tokio::spawn(supervise(
            tail_loop,
            self.sessions.clone(),
            id,
            key.clone(),
            status,
            sink,
        ));
        info!("[{}] Tail session {} started for {:?}", key, id, duration);

        Ok(SessionHandle::new(id, key, expires_at, status_rx))
    }

    /// Requests a stop and waits for the in-flight poll to finish.
    pub async fn stop(&self, key: &SessionKey) -> Result<TailStatus, TailError> {
        let mut status = {
            let sessions = self.lock_sessions();
            let session = sessions
                .get(key)
                .ok_or_else(|| TailError::NotFound(key.to_string()))?;
            session.request_stop();
            session.status.subscribe()
        };
        debug!("[{}] Stop requested", key);
        let final_status = match status.wait_for(TailStatus::is_terminal).await {
            Ok(status) => *status,
            Err(_) => TailStatus::Failed,
        };
        Ok(final_status)
    }

    pub fn list_active(&self) -> Vec<TailSessionInfo> {
        let mut active: Vec<TailSessionInfo> =
            self.lock_sessions().values().map(ActiveSession::info).collect();
        active.sort_by(|a, b| a.key.cmp(&b.key));
        active
    }

    pub fn is_active(&self, key: &SessionKey) -> bool {
        self.lock_sessions().contains_key(key)
    }

    /// Stops every session and waits for all of them to end.
    pub async fn shutdown_all(&self) {
        let keys: Vec<SessionKey> = self.lock_sessions().keys().cloned().collect();
        if !keys.is_empty() {
            info!("Stopping {} tail session(s)", keys.len());
        }
        for key in keys {
            // NotFound only means the session ended on its own meanwhile
            if let Ok(status) = self.stop(&key).await {
                debug!("[{}] Ended as {:?}", key, status);
            }
        }
    }

    fn effective_duration(&self, requested: Option<Duration>) -> Result<Duration, TailError> {
        let max = Duration::from_secs(self.config.max_duration_secs);
        match requested {
            None => Ok(Duration::from_secs(self.config.default_duration_secs).min(max)),
            Some(d) if d.is_zero() => Err(TailError::Validation(
                "duration must be greater than zero".into(),
            )),
            Some(d) if d > max => {
                debug!("Clamping tail duration {:?} to {:?}", d, max);
                Ok(max)
            }
            Some(d) => Ok(d),
        }
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<SessionKey, ActiveSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Runs the loop in its own task so a panic still releases the key and ends the session.
async fn supervise(
    tail_loop: TailLoop,
    sessions: SessionMap,
    id: Uuid,
    key: SessionKey,
    status: Arc<watch::Sender<TailStatus>>,
    sink: Arc<dyn TailSink>,
) {
    let reason = match tokio::spawn(tail_loop.run()).await {
        Ok(reason) => reason,
        Err(e) => {
            error!("[{}] Tail task aborted: {}", key, e);
            EndReason::Failed("tail task aborted".into())
        }
    };

    {
        let mut sessions = sessions.lock().unwrap_or_else(PoisonError::into_inner);
        // only remove our own entry
        if sessions.get(&key).is_some_and(|s| s.id == id) {
            sessions.remove(&key);
        }
    }
    status.send_replace(reason.status());

    let ended = TailEvent::SessionEnded {
        session_key: key.clone(),
        reason,
    };
    if let Err(e) = sink.deliver(ended).await {
        warn!("[{}] Could not deliver end of session: {}", key, e);
    }
}
