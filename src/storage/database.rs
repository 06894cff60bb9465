//! SQLite connection and schema bootstrap.

use crate::error_handling::types::StorageError;
use crate::storage::db_entities::{alerts, deployments};
use log::{debug, error, info};
use sea_orm::sea_query::{Index, IndexCreateStatement};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, EntityTrait, Schema};
use std::path::Path;
use std::time::Duration;

/// Opens (creating if missing) the SQLite database at `path` and makes sure the schema exists.
pub async fn connect(path: &Path) -> Result<DatabaseConnection, StorageError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                error!("Unable to create database directory {}: {}", parent.display(), e);
                StorageError::ConnectionFailed
            })?;
        }
    }

    let url = format!("sqlite://{}?mode=rwc", path.display());
    let mut options = ConnectOptions::new(url);
    options
        .max_connections(5)
        .connect_timeout(Duration::from_secs(10))
        .sqlx_logging(false);

    let db = Database::connect(options).await.map_err(|e| {
        error!("Unable to open database {}: {}", path.display(), e);
        StorageError::ConnectionFailed
    })?;

    create_schema(&db).await?;
    info!("Database ready at {}", path.display());
    Ok(db)
}

async fn create_schema(db: &DatabaseConnection) -> Result<(), StorageError> {
    create_table(db, alerts::Entity).await?;
    create_table(db, deployments::Entity).await?;

    let indexes: [IndexCreateStatement; 3] = [
        Index::create()
            .name("idx_alerts_dedup_key")
            .table(alerts::Entity)
            .col(alerts::Column::DedupKey)
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name("idx_alerts_last_seen_at")
            .table(alerts::Entity)
            .col(alerts::Column::LastSeenAt)
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name("idx_deployments_started_at")
            .table(deployments::Entity)
            .col(deployments::Column::StartedAt)
            .if_not_exists()
            .to_owned(),
    ];
    let backend = db.get_database_backend();
    for index in indexes {
        db.execute(backend.build(&index)).await.map_err(|e| {
            error!("Unable to create index: {}", e);
            StorageError::WriteFailed
        })?;
    }
    Ok(())
}

async fn create_table<E: EntityTrait>(db: &DatabaseConnection, entity: E) -> Result<(), StorageError> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);
    let mut statement = schema.create_table_from_entity(entity);
    statement.if_not_exists();
    db.execute(backend.build(&statement)).await.map_err(|e| {
        error!("Unable to create table {}: {}", entity.table_name(), e);
        StorageError::WriteFailed
    })?;
    debug!("Table {} ready", entity.table_name());
    Ok(())
}
