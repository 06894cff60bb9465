use crate::error_handling::types::StorageError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Query criteria for `AlertStore::list`. Results are always newest-first by `last_seen_at`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertFilter {
    pub unacknowledged_only: bool,
    /// Only records seen at or after this instant
    pub since: Option<DateTime<Utc>>,
    pub service: Option<String>,
    pub limit: Option<u64>,
}

impl AlertFilter {
    pub fn unacknowledged() -> Self {
        Self {
            unacknowledged_only: true,
            ..Default::default()
        }
    }

    pub fn for_service<S: Into<String>>(service: S) -> Self {
        Self {
            service: Some(service.into()),
            ..Default::default()
        }
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Storage form of a timestamp: fixed-width, microsecond precision, `Z` suffix.
pub fn to_db_time(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn from_db_time(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| StorageError::ReadFailed)
}
