//! SQLite-backed `AlertStore`.

use crate::alerting::types::{AlertRecord, ExternalLink, NewOccurrence, Severity};
use crate::error_handling::types::StorageError;
use crate::storage::db_entities::alerts;
use crate::storage::storage_trait::AlertStore;
use crate::storage::types::{from_db_time, to_db_time, AlertFilter};
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use log::{debug, error, info};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use tokio::sync::Mutex;
use uuid::Uuid;

pub struct AlertRepository {
    db: DatabaseConnection,
    // serializes read-modify-write sequences
    write_gate: Mutex<()>,
}

impl AlertRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            write_gate: Mutex::new(()),
        }
    }

    async fn find_model(&self, id: Uuid) -> Result<Option<alerts::Model>, StorageError> {
        alerts::Entity::find_by_id(id.to_string())
            .one(&self.db)
            .await
            .map_err(read_failed)
    }

    async fn find_active_model(
        &self,
        dedup_key: &str,
        not_before: DateTime<Utc>,
    ) -> Result<Option<alerts::Model>, StorageError> {
        alerts::Entity::find()
            .filter(alerts::Column::DedupKey.eq(dedup_key))
            .filter(alerts::Column::LastSeenAt.gte(to_db_time(not_before)))
            .order_by_desc(alerts::Column::LastSeenAt)
            .one(&self.db)
            .await
            .map_err(read_failed)
    }

    async fn save(&self, record: &AlertRecord) -> Result<(), StorageError> {
        to_active_model(record)?
            .update(&self.db)
            .await
            .map_err(write_failed)?;
        Ok(())
    }
}

#[async_trait]
impl AlertStore for AlertRepository {
    async fn get(&self, id: Uuid) -> Result<Option<AlertRecord>, StorageError> {
        self.find_model(id).await?.map(to_record).transpose()
    }

    async fn find_active_by_dedup_key(
        &self,
        dedup_key: &str,
        not_before: DateTime<Utc>,
    ) -> Result<Option<AlertRecord>, StorageError> {
        self.find_active_model(dedup_key, not_before)
            .await?
            .map(to_record)
            .transpose()
    }

    async fn record_occurrence(
        &self,
        occurrence: &NewOccurrence,
        not_before: DateTime<Utc>,
    ) -> Result<(AlertRecord, bool), StorageError> {
        let _gate = self.write_gate.lock().await;
        // stored timestamps have microsecond precision
        let seen_at = occurrence.seen_at.trunc_subsecs(6);

        if let Some(model) = self
            .find_active_model(&occurrence.dedup_key, not_before)
            .await?
        {
            let mut record = to_record(model)?;
            record.occurrence_count += 1;
            record.last_seen_at = record.last_seen_at.max(seen_at);
            record.context = occurrence.context.clone();
            record.severity = record.severity.max(occurrence.severity);
            self.save(&record).await?;
            debug!(
                "[{}] Occurrence #{} folded into existing alert",
                record.short_id(),
                record.occurrence_count
            );
            return Ok((record, false));
        }

        let record = AlertRecord {
            id: Uuid::new_v4(),
            dedup_key: occurrence.dedup_key.clone(),
            service: occurrence.service.clone(),
            exception_kind: occurrence.exception_kind.clone(),
            message: occurrence.message.clone(),
            environment: occurrence.environment.clone(),
            severity: occurrence.severity,
            first_seen_at: seen_at,
            last_seen_at: seen_at,
            occurrence_count: 1,
            context: occurrence.context.clone(),
            acknowledged: false,
            acknowledged_by: None,
            acknowledged_at: None,
            external_links: Vec::new(),
        };
        alerts::Entity::insert(to_active_model(&record)?)
            .exec_without_returning(&self.db)
            .await
            .map_err(write_failed)?;
        info!(
            "[{}] New alert for {} / {}",
            record.short_id(),
            record.service,
            record.exception_kind
        );
        Ok((record, true))
    }

    async fn list(&self, filter: &AlertFilter) -> Result<Vec<AlertRecord>, StorageError> {
        let mut query = alerts::Entity::find();
        if filter.unacknowledged_only {
            query = query.filter(alerts::Column::Acknowledged.eq(false));
        }
        if let Some(since) = filter.since {
            query = query.filter(alerts::Column::LastSeenAt.gte(to_db_time(since)));
        }
        if let Some(ref service) = filter.service {
            query = query.filter(alerts::Column::Service.eq(service.as_str()));
        }
        query = query
            .order_by_desc(alerts::Column::LastSeenAt)
            .order_by_desc(alerts::Column::FirstSeenAt);
        if let Some(limit) = filter.limit {
            query = query.limit(limit);
        }

        let rows = query.all(&self.db).await.map_err(read_failed)?;
        rows.into_iter().map(to_record).collect()
    }

    async fn acknowledge(&self, id: Uuid, by: &str) -> Result<AlertRecord, StorageError> {
        let _gate = self.write_gate.lock().await;
        let model = self
            .find_model(id)
            .await?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        let mut record = to_record(model)?;
        if record.acknowledged {
            return Ok(record);
        }
        record.acknowledged = true;
        record.acknowledged_by = Some(by.to_string());
        record.acknowledged_at = Some(Utc::now().trunc_subsecs(6));
        self.save(&record).await?;
        info!("[{}] Acknowledged by {}", record.short_id(), by);
        Ok(record)
    }

    async fn add_external_link(
        &self,
        id: Uuid,
        link: ExternalLink,
    ) -> Result<AlertRecord, StorageError> {
        let _gate = self.write_gate.lock().await;
        let model = self
            .find_model(id)
            .await?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        let mut record = to_record(model)?;
        record.external_links.push(link);
        self.save(&record).await?;
        Ok(record)
    }

    async fn purge_older_than(&self, age: chrono::Duration) -> Result<u64, StorageError> {
        let _gate = self.write_gate.lock().await;
        let cutoff = Utc::now() - age;
        let result = alerts::Entity::delete_many()
            .filter(alerts::Column::LastSeenAt.lt(to_db_time(cutoff)))
            .exec(&self.db)
            .await
            .map_err(write_failed)?;
        if result.rows_affected > 0 {
            info!(
                "Purged {} alert(s) last seen before {}",
                result.rows_affected, cutoff
            );
        }
        Ok(result.rows_affected)
    }
}

fn read_failed(e: DbErr) -> StorageError {
    error!("Alert read failed: {}", e);
    StorageError::ReadFailed
}

fn write_failed(e: DbErr) -> StorageError {
    error!("Alert write failed: {}", e);
    StorageError::WriteFailed
}

fn to_active_model(record: &AlertRecord) -> Result<alerts::ActiveModel, StorageError> {
    let context = serde_json::to_string(&record.context).map_err(|_| StorageError::WriteFailed)?;
    let links =
        serde_json::to_string(&record.external_links).map_err(|_| StorageError::WriteFailed)?;
    let count = i64::try_from(record.occurrence_count).map_err(|_| StorageError::WriteFailed)?;
    Ok(alerts::ActiveModel {
        id: Set(record.id.to_string()),
        dedup_key: Set(record.dedup_key.clone()),
        service: Set(record.service.clone()),
        exception_kind: Set(record.exception_kind.clone()),
        message: Set(record.message.clone()),
        environment: Set(record.environment.clone()),
        severity: Set(record.severity.as_str().to_string()),
        first_seen_at: Set(to_db_time(record.first_seen_at)),
        last_seen_at: Set(to_db_time(record.last_seen_at)),
        occurrence_count: Set(count),
        context: Set(context),
        acknowledged: Set(record.acknowledged),
        acknowledged_by: Set(record.acknowledged_by.clone()),
        acknowledged_at: Set(record.acknowledged_at.map(to_db_time)),
        external_links: Set(links),
    })
}

fn to_record(model: alerts::Model) -> Result<AlertRecord, StorageError> {
    Ok(AlertRecord {
        id: Uuid::parse_str(&model.id).map_err(|_| StorageError::ReadFailed)?,
        severity: model
            .severity
            .parse::<Severity>()
            .map_err(|_| StorageError::ReadFailed)?,
        first_seen_at: from_db_time(&model.first_seen_at)?,
        last_seen_at: from_db_time(&model.last_seen_at)?,
        occurrence_count: u64::try_from(model.occurrence_count)
            .map_err(|_| StorageError::ReadFailed)?,
        context: serde_json::from_str(&model.context).map_err(|_| StorageError::ReadFailed)?,
        acknowledged_at: match model.acknowledged_at {
            Some(ref raw) => Some(from_db_time(raw)?),
            None => None,
        },
        external_links: serde_json::from_str(&model.external_links)
            .map_err(|_| StorageError::ReadFailed)?,
        dedup_key: model.dedup_key,
        service: model.service,
        exception_kind: model.exception_kind,
        message: model.message,
        environment: model.environment,
        acknowledged: model.acknowledged,
        acknowledged_by: model.acknowledged_by,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::dedup::dedup_key;
    use crate::alerting::types::LinkKind;
    use crate::storage::database::connect;
    use chrono::Duration;
    use tempfile::TempDir;

    async fn temp_db() -> AlertRepository {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.sqlite3");
        // Keep TempDir alive by leaking it for the test duration
        Box::leak(Box::new(dir));
        AlertRepository::new(connect(&path).await.unwrap())
    }

    fn occurrence(message: &str, seen_at: DateTime<Utc>) -> NewOccurrence {
        NewOccurrence {
            dedup_key: dedup_key("api", "KeyError", message, "production"),
            service: "api".into(),
            exception_kind: "KeyError".into(),
            message: message.into(),
            environment: "production".into(),
            severity: Severity::Error,
            context: serde_json::json!({ "path": "/orders", "seen": seen_at.to_rfc3339() }),
            seen_at,
        }
    }

    fn window() -> DateTime<Utc> {
        Utc::now() - Duration::days(30)
    }

    #[tokio::test]
    async fn test_occurrences_fold_into_one_record() {
        let repo = temp_db().await;
        let first = Utc::now();
        let (created, is_new) = repo
            .record_occurrence(&occurrence("dup id 42", first), window())
            .await
            .unwrap();
        assert!(is_new);
        assert_eq!(created.occurrence_count, 1);

        let later = first + Duration::seconds(5);
        let (folded, is_new) = repo
            .record_occurrence(&occurrence("dup id 43", later), window())
            .await
            .unwrap();
        assert!(!is_new);
        assert_eq!(folded.id, created.id);
        assert_eq!(folded.occurrence_count, 2);
        assert_eq!(folded.first_seen_at, created.first_seen_at);
        assert_eq!(folded.last_seen_at, later.trunc_subsecs(6));
        assert_eq!(folded.context["seen"], later.to_rfc3339());

        let stored = repo.get(created.id).await.unwrap().unwrap();
        assert_eq!(stored, folded);
    }

    #[tokio::test]
    async fn test_expired_record_is_not_matched() {
        let repo = temp_db().await;
        let old = Utc::now() - Duration::days(40);
        let (stale, _) = repo
            .record_occurrence(&occurrence("dup id 1", old), old - Duration::days(1))
            .await
            .unwrap();
        let (fresh, is_new) = repo
            .record_occurrence(&occurrence("dup id 1", Utc::now()), window())
            .await
            .unwrap();
        assert!(is_new);
        assert_ne!(stale.id, fresh.id);
    }

    #[tokio::test]
    async fn test_acknowledge_is_idempotent() {
        let repo = temp_db().await;
        let (record, _) = repo
            .record_occurrence(&occurrence("boom", Utc::now()), window())
            .await
            .unwrap();

        let first = repo.acknowledge(record.id, "alice").await.unwrap();
        assert!(first.acknowledged);
        assert_eq!(first.acknowledged_by.as_deref(), Some("alice"));
        assert!(first.acknowledged_at.is_some());

        let second = repo.acknowledge(record.id, "bob").await.unwrap();
        assert_eq!(second.acknowledged_by.as_deref(), Some("alice"));
        assert_eq!(second.acknowledged_at, first.acknowledged_at);
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let repo = temp_db().await;
        let id = Uuid::new_v4();
        assert!(repo.get(id).await.unwrap().is_none());
        assert!(matches!(
            repo.acknowledge(id, "alice").await,
            Err(StorageError::NotFound(_))
        ));
        let link = ExternalLink {
            kind: LinkKind::Issue,
            external_id: "7".into(),
            url: "https://example.com/issues/7".into(),
        };
        assert!(matches!(
            repo.add_external_link(id, link).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_external_links_are_appended_in_order() {
        let repo = temp_db().await;
        let (record, _) = repo
            .record_occurrence(&occurrence("boom", Utc::now()), window())
            .await
            .unwrap();
        for (kind, id) in [(LinkKind::Issue, "7"), (LinkKind::PullRequest, "12")] {
            repo.add_external_link(
                record.id,
                ExternalLink {
                    kind,
                    external_id: id.into(),
                    url: format!("https://example.com/{}", id),
                },
            )
            .await
            .unwrap();
        }
        let stored = repo.get(record.id).await.unwrap().unwrap();
        let ids: Vec<&str> = stored
            .external_links
            .iter()
            .map(|l| l.external_id.as_str())
            .collect();
        assert_eq!(ids, ["7", "12"]);
        assert_eq!(stored.external_links[1].kind, LinkKind::PullRequest);
    }

    #[tokio::test]
    async fn test_list_filters_and_orders_newest_first() {
        let repo = temp_db().await;
        let now = Utc::now();
        let (older, _) = repo
            .record_occurrence(&occurrence("first fault", now - Duration::hours(2)), window())
            .await
            .unwrap();
        let (newer, _) = repo
            .record_occurrence(&occurrence("second fault", now), window())
            .await
            .unwrap();
        repo.acknowledge(newer.id, "alice").await.unwrap();

        let all = repo.list(&AlertFilter::default()).await.unwrap();
        assert_eq!(
            all.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![newer.id, older.id]
        );

        let open = repo.list(&AlertFilter::unacknowledged()).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, older.id);

        let recent = repo
            .list(&AlertFilter::default().since(now - Duration::minutes(5)))
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, newer.id);

        let limited = repo.list(&AlertFilter::default().limit(1)).await.unwrap();
        assert_eq!(limited.len(), 1);

        let other = repo.list(&AlertFilter::for_service("worker")).await.unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn test_purge_keeps_recently_seen_records() {
        let repo = temp_db().await;
        let now = Utc::now();
        let long_ago = now - Duration::days(45);
        let (stale, _) = repo
            .record_occurrence(&occurrence("stale", long_ago), long_ago)
            .await
            .unwrap();
        // first seen long ago but seen again today
        let (recurring, _) = repo
            .record_occurrence(&occurrence("recurring", long_ago), long_ago)
            .await
            .unwrap();
        repo.record_occurrence(&occurrence("recurring", now), long_ago)
            .await
            .unwrap();

        let purged = repo.purge_older_than(Duration::days(30)).await.unwrap();
        assert_eq!(purged, 1);
        assert!(repo.get(stale.id).await.unwrap().is_none());
        assert!(repo.get(recurring.id).await.unwrap().is_some());
    }
}
