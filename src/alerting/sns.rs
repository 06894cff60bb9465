//! SNS notifications carrying CloudWatch alarms.

use crate::alerting::types::AlertPayload;
use serde::Deserialize;
use serde_json::{json, Value};

pub const SUBSCRIPTION_CONFIRMATION: &str = "SubscriptionConfirmation";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SnsEnvelope {
    #[serde(default, rename = "Type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub alarm_name: Option<String>,
    #[serde(default)]
    pub topic_arn: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SnsOutcome {
    /// Subscription handshake; acknowledged, nothing ingested
    SubscriptionPending,
    Alert(AlertPayload),
    /// Notification that is not an alarm
    Ignored,
}

/// Classifies an SNS delivery. `message_type` is the `x-amz-sns-message-type` header.
pub fn classify(message_type: Option<&str>, envelope: SnsEnvelope) -> SnsOutcome {
    let kind = message_type.or(envelope.kind.as_deref());
    if kind == Some(SUBSCRIPTION_CONFIRMATION) {
        return SnsOutcome::SubscriptionPending;
    }
    if !envelope.message.contains("AlarmName") {
        return SnsOutcome::Ignored;
    }

    // the alarm body is usually JSON nested in the message string
    let alarm: Value = serde_json::from_str(&envelope.message).unwrap_or(Value::Null);
    let alarm_name = alarm
        .get("AlarmName")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or(envelope.alarm_name)
        .or(envelope.subject)
        .unwrap_or_else(|| "CloudWatch alarm".to_string());

    let mut context = json!({ "raw_message": envelope.message });
    if let Some(arn) = envelope.topic_arn {
        context["topic_arn"] = Value::String(arn);
    }
    if let Some(reason) = alarm.get("NewStateReason").and_then(Value::as_str) {
        context["state_reason"] = Value::String(reason.to_string());
    }

    SnsOutcome::Alert(AlertPayload {
        service: Some("cloudwatch".into()),
        exception_kind: Some("CloudWatch Alarm".into()),
        message: Some(alarm_name),
        severity: Some("warning".into()),
        environment: None,
        context: Some(context),
        extra: Default::default(),
    })
}
