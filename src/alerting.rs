//! Alert subsystem
//!
//! Inbound alert payloads are validated, reduced to a dedup key, folded into the alert
//! repository and announced to subscribers.
//!
//! Components:
//! - `types`: alert records, payloads and notifications.
//! - `dedup`: message normalization and dedup key derivation.
//! - `ingestion`: the `IngestionPipeline` (per-key serialization and notification cooldown).
//! - `retention`: the background sweep purging records that have not been seen for a while.
//! - `sns`: translation of SNS / CloudWatch alarm notifications into alert payloads.

pub mod dedup;
pub mod ingestion;
pub mod retention;
pub mod sns;
pub mod types;

pub use ingestion::IngestionPipeline;
pub use types::{AlertNotification, AlertPayload, AlertRecord, Severity};
