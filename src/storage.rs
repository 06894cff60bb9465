//! Storage subsystem
//!
//! This module persists alert records and deployment history in SQLite.
//!
//! Components:
//! - `storage_trait`: the `AlertStore` and `DeploymentStore` repository traits.
//! - `types`: query filters and timestamp encoding shared by the repositories.
//! - `database`: connection setup and schema creation.
//! - `alert_repository` / `deployment_repository`: SeaORM implementations of the traits.
//! - `db_entities`: SeaORM entity models for both tables.

pub mod alert_repository;
pub mod database;
pub mod db_entities;
pub mod deployment_repository;
pub mod storage_trait;
pub mod types;

pub use alert_repository::AlertRepository;
pub use deployment_repository::DeploymentRepository;
pub use storage_trait::{AlertStore, DeploymentStore};
