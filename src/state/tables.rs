//! sea-orm entity definitions for the state store.
//!
//! Every table carries `tenant_id`, and every composite natural key leads
//! with it. Embedded documents (plan JSON, approvals, audit metadata) use
//! the dialect-aware JSON column type.

pub mod models {
    use sea_orm::entity::prelude::*;

    /// Current metadata for one model name.
    #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
    #[sea_orm(table_name = "models")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub tenant_id: String,
        #[sea_orm(primary_key, auto_increment = false)]
        pub model_name: String,
        pub kind: String,
        pub materialization: String,
        pub time_column: Option<String>,
        pub unique_key: Option<String>,
        pub owner: Option<String>,
        /// Comma-joined tag list.
        pub tags: Option<String>,
        pub contract_mode: Option<String>,
        /// Version id of the latest registered model version.
        pub current_version: Option<String>,
        pub created_at: DateTimeUtc,
        pub updated_at: DateTimeUtc,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod model_versions {
    use sea_orm::entity::prelude::*;

    /// One immutable version of a model's SQL.
    #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
    #[sea_orm(table_name = "model_versions")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub version_id: String,
        pub tenant_id: String,
        pub model_name: String,
        #[sea_orm(column_type = "Text")]
        pub canonical_sql: String,
        pub content_hash: String,
        pub metadata_hash: Option<String>,
        pub created_at: DateTimeUtc,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod snapshots {
    use sea_orm::entity::prelude::*;

    /// Immutable `{model_name → version_id}` capture per environment.
    #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
    #[sea_orm(table_name = "snapshots")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub snapshot_id: String,
        pub tenant_id: String,
        pub environment: String,
        pub versions: Json,
        pub created_at: DateTimeUtc,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod plans {
    use sea_orm::entity::prelude::*;

    /// Persisted execution plan with its approval trail.
    #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
    #[sea_orm(table_name = "plans")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub tenant_id: String,
        #[sea_orm(primary_key, auto_increment = false)]
        pub plan_id: String,
        pub base_sha: String,
        pub target_sha: String,
        pub plan_json: Json,
        pub approvals_json: Option<Json>,
        pub created_at: DateTimeUtc,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod runs {
    use sea_orm::entity::prelude::*;

    /// Outcome of executing one plan step. Immutable once terminal.
    #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
    #[sea_orm(table_name = "runs")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub run_id: String,
        pub tenant_id: String,
        pub plan_id: String,
        pub step_id: String,
        pub model_name: String,
        pub status: String,
        pub started_at: Option<DateTimeUtc>,
        pub finished_at: Option<DateTimeUtc>,
        pub input_range_start: Option<Date>,
        pub input_range_end: Option<Date>,
        #[sea_orm(column_type = "Text", nullable)]
        pub error_message: Option<String>,
        pub cluster_used: Option<String>,
        pub executor_version: String,
        pub retry_count: i32,
        pub cost_usd: Option<f64>,
        pub external_run_id: Option<String>,
        pub created_at: DateTimeUtc,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod watermarks {
    use sea_orm::entity::prelude::*;

    /// Highest contiguous partition range materialised for a model.
    #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
    #[sea_orm(table_name = "watermarks")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub tenant_id: String,
        #[sea_orm(primary_key, auto_increment = false)]
        pub model_name: String,
        #[sea_orm(primary_key, auto_increment = false)]
        pub partition_start: Date,
        #[sea_orm(primary_key, auto_increment = false)]
        pub partition_end: Date,
        pub row_count: Option<i64>,
        pub last_updated: DateTimeUtc,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod locks {
    use sea_orm::entity::prelude::*;

    /// TTL-bounded advisory lock on a model partition range.
    #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
    #[sea_orm(table_name = "locks")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub tenant_id: String,
        #[sea_orm(primary_key, auto_increment = false)]
        pub model_name: String,
        #[sea_orm(primary_key, auto_increment = false)]
        pub range_start: Date,
        #[sea_orm(primary_key, auto_increment = false)]
        pub range_end: Date,
        pub locked_by: String,
        pub locked_at: DateTimeUtc,
        pub ttl_seconds: i64,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod telemetry {
    use sea_orm::entity::prelude::*;

    /// Per-run execution metrics.
    #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
    #[sea_orm(table_name = "telemetry")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i64,
        pub tenant_id: String,
        pub run_id: String,
        pub model_name: String,
        pub runtime_seconds: f64,
        pub shuffle_bytes: i64,
        pub input_rows: i64,
        pub output_rows: i64,
        pub partition_count: i32,
        pub captured_at: DateTimeUtc,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod audit_log {
    use sea_orm::entity::prelude::*;

    /// Append-only, per-tenant, hash-chained audit entry.
    #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
    #[sea_orm(table_name = "audit_log")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub id: String,
        pub tenant_id: String,
        pub actor: String,
        pub action: String,
        pub entity_type: Option<String>,
        pub entity_id: Option<String>,
        pub metadata: Option<Json>,
        pub previous_hash: Option<String>,
        pub entry_hash: String,
        pub created_at: DateTimeUtc,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod backfill_checkpoints {
    use sea_orm::entity::prelude::*;

    /// Progress record for a chunked backfill, resumable on failure.
    #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
    #[sea_orm(table_name = "backfill_checkpoints")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub tenant_id: String,
        #[sea_orm(primary_key, auto_increment = false)]
        pub backfill_id: String,
        pub model_name: String,
        pub overall_start: Date,
        pub overall_end: Date,
        pub chunk_size_days: i32,
        pub status: String,
        /// Last chunk-end date fully materialised, inclusive.
        pub completed_through: Option<Date>,
        pub total_chunks: i32,
        pub completed_chunks: i32,
        #[sea_orm(column_type = "Text", nullable)]
        pub error_message: Option<String>,
        pub cluster_size: Option<String>,
        pub plan_id: Option<String>,
        pub created_at: DateTimeUtc,
        pub updated_at: DateTimeUtc,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod backfill_audit {
    use sea_orm::entity::prelude::*;

    /// One row per executed backfill chunk.
    #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
    #[sea_orm(table_name = "backfill_audit")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i64,
        pub tenant_id: String,
        pub backfill_id: String,
        pub model_name: String,
        pub chunk_start: Date,
        pub chunk_end: Date,
        pub status: String,
        pub run_id: Option<String>,
        #[sea_orm(column_type = "Text", nullable)]
        pub error_message: Option<String>,
        pub duration_seconds: Option<f64>,
        pub executed_at: DateTimeUtc,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod reconciliation_checks {
    use sea_orm::entity::prelude::*;

    /// One comparison of control-plane run state against warehouse reality.
    #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
    #[sea_orm(table_name = "reconciliation_checks")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub id: String,
        pub tenant_id: String,
        pub run_id: String,
        pub model_name: Option<String>,
        pub expected_status: String,
        pub warehouse_status: Option<String>,
        pub discrepancy_type: Option<String>,
        pub resolved: bool,
        pub resolved_by: Option<String>,
        #[sea_orm(column_type = "Text", nullable)]
        pub resolution_note: Option<String>,
        pub checked_at: DateTimeUtc,
        pub resolved_at: Option<DateTimeUtc>,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod reconciliation_schedules {
    use sea_orm::entity::prelude::*;

    /// Cron trigger definition for a background reconciliation loop.
    #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
    #[sea_orm(table_name = "reconciliation_schedules")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub tenant_id: String,
        #[sea_orm(primary_key, auto_increment = false)]
        pub schedule_type: String,
        pub cron_expression: String,
        pub enabled: bool,
        pub last_run_at: Option<DateTimeUtc>,
        pub updated_at: DateTimeUtc,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod credentials {
    use sea_orm::entity::prelude::*;

    /// Credential ciphertext store. Plaintext never lands here.
    #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
    #[sea_orm(table_name = "credentials")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub tenant_id: String,
        #[sea_orm(primary_key, auto_increment = false)]
        pub credential_name: String,
        #[sea_orm(column_type = "Text")]
        pub ciphertext: String,
        pub created_at: DateTimeUtc,
        pub updated_at: DateTimeUtc,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}
