//! Repository traits
//!
//! This module defines the two storage seams of the engine:
//! - `AlertStore`: deduplicated alert records with acknowledgement and link state
//! - `DeploymentStore`: history of deployment attempts
//!
//! Implementors must make every mutation a single atomic step from the point of view of
//! other tasks. Backend errors are mapped to `StorageError` and never leak.

use crate::alerting::types::{AlertRecord, ExternalLink, NewOccurrence};
use crate::deployment::types::DeploymentRecord;
use crate::error_handling::types::StorageError;
use crate::storage::types::AlertFilter;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<AlertRecord>, StorageError>;

    /// Most recent record with `dedup_key` whose `last_seen_at` is not before `not_before`.
    async fn find_active_by_dedup_key(
        &self,
        dedup_key: &str,
        not_before: DateTime<Utc>,
    ) -> Result<Option<AlertRecord>, StorageError>;

    /// Folds an occurrence into the active record for its key, or creates one.
    ///
    /// Returns the resulting record and `true` when it was created by this call.
    async fn record_occurrence(
        &self,
        occurrence: &NewOccurrence,
        not_before: DateTime<Utc>,
    ) -> Result<(AlertRecord, bool), StorageError>;

    async fn list(&self, filter: &AlertFilter) -> Result<Vec<AlertRecord>, StorageError>;

    /// Idempotent: an already acknowledged record is returned unchanged.
    async fn acknowledge(&self, id: Uuid, by: &str) -> Result<AlertRecord, StorageError>;

    async fn add_external_link(
        &self,
        id: Uuid,
        link: ExternalLink,
    ) -> Result<AlertRecord, StorageError>;

    /// Deletes records whose `last_seen_at` is older than `age`; the only delete path.
    async fn purge_older_than(&self, age: chrono::Duration) -> Result<u64, StorageError>;
}

#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Fails with `Conflict` when the record is in flight and another one already is.
    async fn create(&self, record: &DeploymentRecord) -> Result<(), StorageError>;

    /// Fails with `Immutable` once the stored record is terminal.
    async fn update(&self, record: &DeploymentRecord) -> Result<(), StorageError>;

    async fn get(&self, id: Uuid) -> Result<Option<DeploymentRecord>, StorageError>;

    /// Newest first.
    async fn list_recent(&self, limit: u64) -> Result<Vec<DeploymentRecord>, StorageError>;

    async fn latest_terminal(&self) -> Result<Option<DeploymentRecord>, StorageError>;

    async fn last_successful(&self) -> Result<Option<DeploymentRecord>, StorageError>;

    /// Marks every queued or running record as failed with `reason`.
    async fn fail_in_flight(&self, reason: &str) -> Result<u64, StorageError>;
}
