//! SQLite-backed `DeploymentStore`.

use crate::deployment::types::{DeployMethod, DeploymentRecord, DeploymentStatus};
use crate::error_handling::types::StorageError;
use crate::storage::db_entities::deployments;
use crate::storage::storage_trait::DeploymentStore;
use crate::storage::types::{from_db_time, to_db_time};
use async_trait::async_trait;
use chrono::Utc;
use log::{error, info, warn};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set,
};
use tokio::sync::Mutex;
use uuid::Uuid;

const IN_FLIGHT: [&str; 2] = ["queued", "running"];

pub struct DeploymentRepository {
    db: DatabaseConnection,
    write_gate: Mutex<()>,
}

impl DeploymentRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            write_gate: Mutex::new(()),
        }
    }

    async fn newest_with_status(
        &self,
        statuses: &[&str],
    ) -> Result<Option<DeploymentRecord>, StorageError> {
        deployments::Entity::find()
            .filter(deployments::Column::Status.is_in(statuses.iter().copied()))
            .order_by_desc(deployments::Column::StartedAt)
            .one(&self.db)
            .await
            .map_err(read_failed)?
            .map(to_record)
            .transpose()
    }
}

#[async_trait]
impl DeploymentStore for DeploymentRepository {
    async fn create(&self, record: &DeploymentRecord) -> Result<(), StorageError> {
        let _gate = self.write_gate.lock().await;
        if !record.status.is_terminal() {
            let in_flight = deployments::Entity::find()
                .filter(deployments::Column::Status.is_in(IN_FLIGHT))
                .count(&self.db)
                .await
                .map_err(read_failed)?;
            if in_flight > 0 {
                warn!("[{}] Refusing second in-flight deployment", record.id);
                return Err(StorageError::Conflict(
                    "a deployment is already queued or running".into(),
                ));
            }
        }
        deployments::Entity::insert(to_active_model(record))
            .exec_without_returning(&self.db)
            .await
            .map_err(write_failed)?;
        Ok(())
    }

    async fn update(&self, record: &DeploymentRecord) -> Result<(), StorageError> {
        let _gate = self.write_gate.lock().await;
        let stored = deployments::Entity::find_by_id(record.id.to_string())
            .one(&self.db)
            .await
            .map_err(read_failed)?
            .ok_or_else(|| StorageError::NotFound(record.id.to_string()))?;
        let stored_status: DeploymentStatus =
            stored.status.parse().map_err(|_| StorageError::ReadFailed)?;
        if stored_status.is_terminal() {
            return Err(StorageError::Immutable(record.id));
        }
        to_active_model(record)
            .update(&self.db)
            .await
            .map_err(write_failed)?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeploymentRecord>, StorageError> {
        deployments::Entity::find_by_id(id.to_string())
            .one(&self.db)
            .await
            .map_err(read_failed)?
            .map(to_record)
            .transpose()
    }

    async fn list_recent(&self, limit: u64) -> Result<Vec<DeploymentRecord>, StorageError> {
        deployments::Entity::find()
            .order_by_desc(deployments::Column::StartedAt)
            .limit(limit)
            .all(&self.db)
            .await
            .map_err(read_failed)?
            .into_iter()
            .map(to_record)
            .collect()
    }

    async fn latest_terminal(&self) -> Result<Option<DeploymentRecord>, StorageError> {
        self.newest_with_status(&["succeeded", "failed", "timed-out"])
            .await
    }

    async fn last_successful(&self) -> Result<Option<DeploymentRecord>, StorageError> {
        self.newest_with_status(&["succeeded"]).await
    }

    async fn fail_in_flight(&self, reason: &str) -> Result<u64, StorageError> {
        let _gate = self.write_gate.lock().await;
        let result = deployments::Entity::update_many()
            .col_expr(deployments::Column::Status, Expr::value("failed"))
            .col_expr(
                deployments::Column::FinishedAt,
                Expr::value(to_db_time(Utc::now())),
            )
            .col_expr(deployments::Column::ErrorMessage, Expr::value(reason))
            .filter(deployments::Column::Status.is_in(IN_FLIGHT))
            .exec(&self.db)
            .await
            .map_err(write_failed)?;
        if result.rows_affected > 0 {
            info!(
                "Marked {} interrupted deployment(s) as failed",
                result.rows_affected
            );
        }
        Ok(result.rows_affected)
    }
}

fn read_failed(e: DbErr) -> StorageError {
    error!("Deployment read failed: {}", e);
    StorageError::ReadFailed
}

fn write_failed(e: DbErr) -> StorageError {
    error!("Deployment write failed: {}", e);
    StorageError::WriteFailed
}

fn to_active_model(record: &DeploymentRecord) -> deployments::ActiveModel {
    deployments::ActiveModel {
        id: Set(record.id.to_string()),
        git_ref: Set(record.git_ref.clone()),
        commit_hash: Set(record.commit_hash.clone()),
        method: Set(record.method.as_str().to_string()),
        status: Set(record.status.as_str().to_string()),
        triggered_by: Set(record.triggered_by.clone()),
        started_at: Set(to_db_time(record.started_at)),
        finished_at: Set(record.finished_at.map(to_db_time)),
        duration_seconds: Set(record.duration_seconds),
        output_summary: Set(record.output_summary.clone()),
        error_message: Set(record.error_message.clone()),
    }
}

fn to_record(model: deployments::Model) -> Result<DeploymentRecord, StorageError> {
    Ok(DeploymentRecord {
        id: Uuid::parse_str(&model.id).map_err(|_| StorageError::ReadFailed)?,
        method: model
            .method
            .parse::<DeployMethod>()
            .map_err(|_| StorageError::ReadFailed)?,
        status: model
            .status
            .parse::<DeploymentStatus>()
            .map_err(|_| StorageError::ReadFailed)?,
        started_at: from_db_time(&model.started_at)?,
        finished_at: match model.finished_at {
            Some(ref raw) => Some(from_db_time(raw)?),
            None => None,
        },
        git_ref: model.git_ref,
        commit_hash: model.commit_hash,
        triggered_by: model.triggered_by,
        duration_seconds: model.duration_seconds,
        output_summary: model.output_summary,
        error_message: model.error_message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::types::DeployRequest;
    use crate::storage::database::connect;
    use chrono::{Duration, SubsecRound};
    use tempfile::TempDir;

    async fn temp_db() -> DeploymentRepository {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.sqlite3");
        // Keep TempDir alive by leaking it for the test duration
        Box::leak(Box::new(dir));
        DeploymentRepository::new(connect(&path).await.unwrap())
    }

    fn queued(git_ref: &str) -> DeploymentRecord {
        let mut record = DeploymentRecord::queued(&DeployRequest {
            git_ref: git_ref.into(),
            method: DeployMethod::Direct,
            triggered_by: "ops".into(),
        });
        record.started_at = record.started_at.trunc_subsecs(6);
        record
    }

    fn finished(git_ref: &str, status: DeploymentStatus, ago: Duration) -> DeploymentRecord {
        let mut record = queued(git_ref);
        record.started_at = record.started_at - ago;
        record.finish(status, None);
        record.finished_at = record.finished_at.map(|t| t.trunc_subsecs(6));
        record
    }

    #[tokio::test]
    async fn test_create_update_get() {
        let repo = temp_db().await;
        let mut record = queued("main");
        repo.create(&record).await.unwrap();
        assert_eq!(repo.get(record.id).await.unwrap(), Some(record.clone()));

        record.status = DeploymentStatus::Running;
        record.commit_hash = Some("abc123".into());
        repo.update(&record).await.unwrap();

        record.output_summary = "deployed".into();
        record.finish(DeploymentStatus::Succeeded, None);
        record.finished_at = record.finished_at.map(|t| t.trunc_subsecs(6));
        repo.update(&record).await.unwrap();

        let stored = repo.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored, record);
    }

    #[tokio::test]
    async fn test_terminal_records_are_immutable() {
        let repo = temp_db().await;
        let mut record = finished("main", DeploymentStatus::Failed, Duration::zero());
        repo.create(&record).await.unwrap();
        record.output_summary = "rewritten".into();
        assert!(matches!(
            repo.update(&record).await,
            Err(StorageError::Immutable(id)) if id == record.id
        ));
        assert!(matches!(
            repo.update(&queued("main")).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_single_in_flight_record() {
        let repo = temp_db().await;
        repo.create(&queued("main")).await.unwrap();
        assert!(matches!(
            repo.create(&queued("release")).await,
            Err(StorageError::Conflict(_))
        ));
        // terminal history is always accepted
        repo.create(&finished("old", DeploymentStatus::Succeeded, Duration::hours(1)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_history_queries() {
        let repo = temp_db().await;
        let ok_old = finished("v1", DeploymentStatus::Succeeded, Duration::hours(3));
        let ok_new = finished("v2", DeploymentStatus::Succeeded, Duration::hours(2));
        let timed_out = finished("v3", DeploymentStatus::TimedOut, Duration::hours(1));
        for record in [&ok_old, &ok_new, &timed_out] {
            repo.create(record).await.unwrap();
        }
        let running = queued("v4");
        repo.create(&running).await.unwrap();

        let recent = repo.list_recent(10).await.unwrap();
        let refs: Vec<&str> = recent.iter().map(|r| r.git_ref.as_str()).collect();
        assert_eq!(refs, ["v4", "v3", "v2", "v1"]);
        assert_eq!(repo.list_recent(2).await.unwrap().len(), 2);

        assert_eq!(repo.latest_terminal().await.unwrap().unwrap().id, timed_out.id);
        assert_eq!(repo.last_successful().await.unwrap().unwrap().id, ok_new.id);
    }

    #[tokio::test]
    async fn test_fail_in_flight_marks_interrupted_records() {
        let repo = temp_db().await;
        let record = queued("main");
        repo.create(&record).await.unwrap();

        assert_eq!(repo.fail_in_flight("interrupted by restart").await.unwrap(), 1);
        let stored = repo.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeploymentStatus::Failed);
        assert!(stored.finished_at.is_some());
        assert_eq!(stored.error_message.as_deref(), Some("interrupted by restart"));

        assert_eq!(repo.fail_in_flight("again").await.unwrap(), 0);
    }
}
