//! SeaORM entity models used by the repositories.
//!
//! These structs map to the SQLite tables created by `database`:
//! - `alerts`: one row per deduplicated alert record
//! - `deployments`: one row per deployment attempt
//!
//! Timestamps are fixed-width RFC 3339 UTC strings so that lexical order is time order.

/// Alerts table entity models.
pub mod alerts {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "alerts")]
    pub struct Model {
        /// UUID as string primary key
        #[sea_orm(primary_key, auto_increment = false)]
        pub id: String,
        /// Hex digest; not unique on its own, only among non-expired rows
        pub dedup_key: String,
        pub service: String,
        pub exception_kind: String,
        pub message: String,
        pub environment: String,
        /// Severity as lowercase string
        pub severity: String,
        pub first_seen_at: String,
        pub last_seen_at: String,
        pub occurrence_count: i64,
        /// Compact JSON of the latest occurrence context
        pub context: String,
        pub acknowledged: bool,
        pub acknowledged_by: Option<String>,
        pub acknowledged_at: Option<String>,
        /// JSON array of external links, append-only
        pub external_links: String,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// Deployments table entity models.
pub mod deployments {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "deployments")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub id: String,
        pub git_ref: String,
        pub commit_hash: Option<String>,
        pub method: String,
        pub status: String,
        pub triggered_by: String,
        pub started_at: String,
        pub finished_at: Option<String>,
        pub duration_seconds: Option<i64>,
        pub output_summary: String,
        pub error_message: Option<String>,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}
