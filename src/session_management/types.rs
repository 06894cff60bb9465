use crate::alerting::types::Severity;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Identity of a tail session: at most one active session per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionKey {
    pub source: String,
    /// Filter expression; empty means every line
    pub filter: String,
}

impl SessionKey {
    pub fn new<S: Into<String>, F: Into<String>>(source: S, filter: F) -> Self {
        Self {
            source: source.into().trim().to_string(),
            filter: filter.into().trim().to_string(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.filter.is_empty() {
            write!(f, "{}", self.source)
        } else {
            write!(f, "{}[{}]", self.source, self.filter)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TailStatus {
    Running,
    Stopping,
    Stopped,
    Expired,
    Failed,
}

impl TailStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TailStatus::Stopped | TailStatus::Expired | TailStatus::Failed
        )
    }
}

/// Opaque, ordered position in a log source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct LogCursor(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    /// Position just past this line; strictly increasing until the source resets
    pub cursor: LogCursor,
    pub timestamp: Option<DateTime<Utc>>,
    pub level: Severity,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogBatch {
    pub lines: Vec<LogLine>,
    /// Where the next query should resume once every line is delivered
    pub next_cursor: LogCursor,
    /// The source restarted (rotation, truncation): cursors in this batch begin a new
    /// sequence and are not comparable with the one queried from
    pub reset: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "lowercase")]
pub enum EndReason {
    Stopped,
    Expired,
    Failed(String),
}

impl EndReason {
    pub fn status(&self) -> TailStatus {
        match self {
            EndReason::Stopped => TailStatus::Stopped,
            EndReason::Expired => TailStatus::Expired,
            EndReason::Failed(_) => TailStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TailEvent {
    LogLine { session_key: SessionKey, line: LogLine },
    SessionEnded { session_key: SessionKey, reason: EndReason },
}

/// Snapshot of an active session, for listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TailSessionInfo {
    pub id: Uuid,
    pub key: SessionKey,
    pub status: TailStatus,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
