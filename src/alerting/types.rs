//! Core types used by the alerting subsystem.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Ordered alert severity, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }

    /// Keyword scan used to classify free-form log lines; the most severe keyword wins.
    pub fn detect(message: &str) -> Severity {
        let upper = message.to_uppercase();
        for (keyword, severity) in [
            ("CRITICAL", Severity::Critical),
            ("ERROR", Severity::Error),
            ("WARNING", Severity::Warning),
            ("INFO", Severity::Info),
            ("DEBUG", Severity::Debug),
        ] {
            if upper.contains(keyword) {
                return severity;
            }
        }
        Severity::Info
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(Severity::Debug),
            "info" => Ok(Severity::Info),
            "warn" | "warning" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            "critical" | "fatal" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkKind {
    PullRequest,
    Issue,
}

/// Pointer from an alert to a tracked fix or ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalLink {
    pub kind: LinkKind,
    pub external_id: String,
    pub url: String,
}

/// One deduplicated fault, folded over all of its occurrences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: Uuid,
    pub dedup_key: String,
    pub service: String,
    pub exception_kind: String,
    pub message: String,
    pub environment: String,
    pub severity: Severity,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub occurrence_count: u64,
    /// Opaque payload of the latest occurrence
    pub context: serde_json::Value,
    pub acknowledged: bool,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub external_links: Vec<ExternalLink>,
}

impl AlertRecord {
    /// First eight characters of the id, as shown in chat.
    pub fn short_id(&self) -> String {
        self.id.to_string()[..8].to_string()
    }
}

/// Untrusted inbound alert body.
///
/// Accepts both the camelCase field names and the snake_case names used by the
/// Django forwarder (`service_name`, `exception_type`, `error_message`). Any other top-level
/// field (stack trace, request path, instance id...) is folded into the context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertPayload {
    #[serde(default, alias = "service_name")]
    pub service: Option<String>,
    #[serde(default, alias = "exception_type", alias = "exception_kind")]
    pub exception_kind: Option<String>,
    #[serde(default, alias = "error_message")]
    pub message: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Validated occurrence, ready to be folded into the repository.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOccurrence {
    pub dedup_key: String,
    pub service: String,
    pub exception_kind: String,
    pub message: String,
    pub environment: String,
    pub severity: Severity,
    pub context: serde_json::Value,
    pub seen_at: DateTime<Utc>,
}

/// Emitted towards the chat front end.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertNotification {
    pub record: AlertRecord,
    /// `true` when this ingestion created the record, `false` when it was folded into an existing one
    pub is_new_occurrence: bool,
}
