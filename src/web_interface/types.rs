use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::alerting::types::AlertRecord;
use crate::deployment::types::{DeployMethod, DeployRequest};
use crate::session_management::{SessionHandle, SessionKey, TailStatus};
use crate::storage::types::AlertFilter;

pub const DEFAULT_PAGE: u64 = 50;
pub const MAX_PAGE: u64 = 500;

/// API error payload
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiError {
    pub message: String,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct StatusMessage {
    pub status: String,
}

impl StatusMessage {
    pub fn new<S: Into<String>>(status: S) -> Self {
        Self {
            status: status.into(),
        }
    }
}

/// Answer to an accepted alert.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct IngestResponse {
    pub id: Uuid,
    pub short_id: String,
    pub occurrence_count: u64,
}

impl From<&AlertRecord> for IngestResponse {
    fn from(record: &AlertRecord) -> Self {
        Self {
            id: record.id,
            short_id: record.short_id(),
            occurrence_count: record.occurrence_count,
        }
    }
}

/// Query string of `GET /alerts`.
#[derive(Debug, Default, Deserialize)]
pub struct AlertListQuery {
    pub unacknowledged: Option<bool>,
    pub service: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<u64>,
}

impl AlertListQuery {
    pub fn into_filter(self) -> AlertFilter {
        AlertFilter {
            unacknowledged_only: self.unacknowledged.unwrap_or(false),
            since: self.since,
            service: self.service.filter(|s| !s.trim().is_empty()),
            limit: Some(clamp_limit(self.limit)),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<u64>,
}

pub fn clamp_limit(limit: Option<u64>) -> u64 {
    limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE)
}

#[derive(Debug, Deserialize)]
pub struct AckBody {
    pub by: String,
}

/// Body of `POST /deployments`.
#[derive(Debug, Deserialize)]
pub struct DeployBody {
    #[serde(rename = "ref", alias = "git_ref")]
    pub git_ref: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub triggered_by: Option<String>,
}

impl DeployBody {
    pub fn into_request(self) -> Result<DeployRequest, String> {
        let method = match self.method {
            Some(raw) => raw.parse::<DeployMethod>()?,
            None => DeployMethod::Direct,
        };
        Ok(DeployRequest {
            git_ref: self.git_ref.trim().to_string(),
            method,
            triggered_by: self
                .triggered_by
                .filter(|who| !who.trim().is_empty())
                .unwrap_or_else(|| "api".to_string()),
        })
    }
}

/// Query string of `DELETE /tail`.
#[derive(Debug, Deserialize)]
pub struct TailKeyQuery {
    pub source: String,
    #[serde(default)]
    pub filter: String,
}

impl TailKeyQuery {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.source.clone(), self.filter.clone())
    }
}

#[derive(Debug, Serialize)]
pub struct TailStarted {
    pub id: Uuid,
    pub key: SessionKey,
    pub expires_at: DateTime<Utc>,
}

impl From<&SessionHandle> for TailStarted {
    fn from(handle: &SessionHandle) -> Self {
        Self {
            id: handle.id,
            key: handle.key.clone(),
            expires_at: handle.expires_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TailStopped {
    pub key: SessionKey,
    pub status: TailStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_query_defaults_and_clamps() {
        let filter = AlertListQuery::default().into_filter();
        assert!(!filter.unacknowledged_only);
        assert_eq!(filter.limit, Some(DEFAULT_PAGE));

        let filter = AlertListQuery {
            unacknowledged: Some(true),
            service: Some("  ".into()),
            limit: Some(10_000),
            ..Default::default()
        }
        .into_filter();
        assert!(filter.unacknowledged_only);
        assert_eq!(filter.service, None);
        assert_eq!(filter.limit, Some(MAX_PAGE));
        assert_eq!(clamp_limit(Some(0)), 1);
    }

    #[test]
    fn deploy_body_accepts_ref_and_method_names() {
        let body: DeployBody =
            serde_json::from_str(r#"{"ref": " main ", "method": "github-actions"}"#).unwrap();
        let request = body.into_request().unwrap();
        assert_eq!(request.git_ref, "main");
        assert_eq!(request.method, DeployMethod::Ci);
        assert_eq!(request.triggered_by, "api");

        let body: DeployBody =
            serde_json::from_str(r#"{"git_ref": "v2", "triggered_by": "bob"}"#).unwrap();
        let request = body.into_request().unwrap();
        assert_eq!(request.method, DeployMethod::Direct);
        assert_eq!(request.triggered_by, "bob");

        let body: DeployBody =
            serde_json::from_str(r#"{"ref": "main", "method": "carrier-pigeon"}"#).unwrap();
        assert!(body.into_request().is_err());
    }
}
