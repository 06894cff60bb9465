use crate::alerting::dedup::dedup_key;
use crate::alerting::types::{AlertNotification, AlertPayload, AlertRecord, NewOccurrence, Severity};
use crate::configuration::AlertConfig;
use crate::error_handling::types::AlertError;
use crate::storage::AlertStore;
use chrono::Utc;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tokio::time::Instant;

const NOTIFICATION_BUFFER: usize = 256;
const DEFAULT_EXCEPTION_KIND: &str = "UnknownError";

/// Entry point for every inbound alert.
///
/// Ingestions sharing a dedup key are serialized; different keys proceed concurrently.
/// Each ingestion that creates a record, or folds into one whose last notification is
/// older than the cooldown, emits exactly one `AlertNotification`.
pub struct IngestionPipeline {
    store: Arc<dyn AlertStore>,
    config: AlertConfig,
    key_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    last_notified: Mutex<HashMap<String, Instant>>,
    notifications: broadcast::Sender<AlertNotification>,
}

impl IngestionPipeline {
    pub fn new(store: Arc<dyn AlertStore>, config: AlertConfig) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_BUFFER);
        Self {
            store,
            config,
            key_locks: Mutex::new(HashMap::new()),
            last_notified: Mutex::new(HashMap::new()),
            notifications,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AlertNotification> {
        self.notifications.subscribe()
    }

    pub fn store(&self) -> &Arc<dyn AlertStore> {
        &self.store
    }

    pub async fn ingest(&self, payload: AlertPayload) -> Result<AlertRecord, AlertError> {
        let occurrence = self.validate(payload)?;
        let key = occurrence.dedup_key.clone();

        let lock = self.key_lock(&key);
        let outcome = {
            let _guard = lock.lock().await;
            self.fold_and_notify(&occurrence).await
        };
        drop(lock);
        self.release_key_lock(&key);
        outcome
    }

    /// Rejects payloads without service or message and fills in defaults.
    pub fn validate(&self, payload: AlertPayload) -> Result<NewOccurrence, AlertError> {
        let service = non_blank(payload.service)
            .ok_or_else(|| AlertError::Validation("missing service name".into()))?;
        let message = non_blank(payload.message)
            .ok_or_else(|| AlertError::Validation("missing message".into()))?;
        let exception_kind = non_blank(payload.exception_kind)
            .unwrap_or_else(|| DEFAULT_EXCEPTION_KIND.to_string());
        let environment = non_blank(payload.environment)
            .unwrap_or_else(|| self.config.default_environment.clone());
        let severity = match non_blank(payload.severity) {
            Some(raw) => raw.parse::<Severity>().map_err(AlertError::Validation)?,
            None => Severity::Error,
        };

        let mut context = match payload.context {
            Some(serde_json::Value::Object(map)) => map,
            Some(serde_json::Value::Null) | None => serde_json::Map::new(),
            Some(other) => {
                let mut map = serde_json::Map::new();
                map.insert("context".into(), other);
                map
            }
        };
        for (field, value) in payload.extra {
            context.entry(field).or_insert(value);
        }

        Ok(NewOccurrence {
            dedup_key: dedup_key(&service, &exception_kind, &message, &environment),
            service,
            exception_kind,
            message,
            environment,
            severity,
            context: serde_json::Value::Object(context),
            seen_at: Utc::now(),
        })
    }

    /// Forgets cooldown entries that can no longer suppress anything.
    pub fn prune_cooldowns(&self) -> usize {
        let cooldown = self.config.cooldown();
        let now = Instant::now();
        let mut last_notified = self
            .last_notified
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = last_notified.len();
        last_notified.retain(|_, at| now.duration_since(*at) < cooldown);
        before - last_notified.len()
    }

    async fn fold_and_notify(&self, occurrence: &NewOccurrence) -> Result<AlertRecord, AlertError> {
        let not_before = occurrence.seen_at - self.config.retention();
        let (record, created) = self
            .store
            .record_occurrence(occurrence, not_before)
            .await?;

        if self.claim_notification(&record.dedup_key, created) {
            let notification = AlertNotification {
                record: record.clone(),
                is_new_occurrence: created,
            };
            if self.notifications.send(notification).is_err() {
                warn!("[{}] No subscriber for alert notifications", record.short_id());
            }
        } else {
            debug!(
                "[{}] Notification suppressed by cooldown ({} occurrences)",
                record.short_id(),
                record.occurrence_count
            );
        }

        info!(
            "[{}] Ingested {} alert for {} ({} occurrence(s))",
            record.short_id(),
            record.severity,
            record.service,
            record.occurrence_count
        );
        Ok(record)
    }

    /// New records always notify; repeats only once the cooldown has elapsed.
    fn claim_notification(&self, dedup_key: &str, created: bool) -> bool {
        let now = Instant::now();
        let mut last_notified = self
            .last_notified
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !created {
            if let Some(at) = last_notified.get(dedup_key) {
                if now.duration_since(*at) < self.config.cooldown() {
                    return false;
                }
            }
        }
        last_notified.insert(dedup_key.to_string(), now);
        true
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.key_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(key.to_string()).or_default().clone()
    }

    fn release_key_lock(&self, key: &str) {
        let mut locks = self.key_locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(key);
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
