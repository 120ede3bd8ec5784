//! Backfill bookkeeping: checkpoints and per-chunk audit rows.

use chrono::{NaiveDate, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::ActiveValue::Set;
use sea_orm::{
    ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
};

use crate::errors::CoreError;
use crate::state::repository::clip_error;
use crate::state::tables::{backfill_audit, backfill_checkpoints};

/// Lifecycle states of a chunked backfill.
pub const BACKFILL_RUNNING: &str = "RUNNING";
pub const BACKFILL_COMPLETED: &str = "COMPLETED";
pub const BACKFILL_FAILED: &str = "FAILED";

/// Progress records for chunked backfills.
pub struct BackfillCheckpointRepository<'c, C: ConnectionTrait> {
    conn: &'c C,
    tenant_id: String,
}

impl<'c, C: ConnectionTrait> BackfillCheckpointRepository<'c, C> {
    pub fn new(conn: &'c C, tenant_id: impl Into<String>) -> Self {
        Self {
            conn,
            tenant_id: tenant_id.into(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        backfill_id: &str,
        model_name: &str,
        overall_start: NaiveDate,
        overall_end: NaiveDate,
        chunk_size_days: i32,
        total_chunks: i32,
        cluster_size: Option<&str>,
        plan_id: Option<&str>,
    ) -> Result<(), CoreError> {
        let now = Utc::now();
        let row = backfill_checkpoints::ActiveModel {
            tenant_id: Set(self.tenant_id.clone()),
            backfill_id: Set(backfill_id.to_string()),
            model_name: Set(model_name.to_string()),
            overall_start: Set(overall_start),
            overall_end: Set(overall_end),
            chunk_size_days: Set(chunk_size_days),
            status: Set(BACKFILL_RUNNING.to_string()),
            completed_through: Set(None),
            total_chunks: Set(total_chunks),
            completed_chunks: Set(0),
            error_message: Set(None),
            cluster_size: Set(cluster_size.map(String::from)),
            plan_id: Set(plan_id.map(String::from)),
            created_at: Set(now),
            updated_at: Set(now),
        };
        backfill_checkpoints::Entity::insert(row)
            .exec_without_returning(self.conn)
            .await?;
        Ok(())
    }

    pub async fn get(
        &self,
        backfill_id: &str,
    ) -> Result<Option<backfill_checkpoints::Model>, CoreError> {
        let row = backfill_checkpoints::Entity::find()
            .filter(backfill_checkpoints::Column::TenantId.eq(&self.tenant_id))
            .filter(backfill_checkpoints::Column::BackfillId.eq(backfill_id))
            .one(self.conn)
            .await?;
        Ok(row)
    }

    /// Advance the checkpoint after a successful chunk.
    pub async fn update_progress(
        &self,
        backfill_id: &str,
        completed_through: NaiveDate,
        completed_chunks: i32,
    ) -> Result<(), CoreError> {
        backfill_checkpoints::Entity::update_many()
            .col_expr(
                backfill_checkpoints::Column::CompletedThrough,
                Expr::value(completed_through),
            )
            .col_expr(
                backfill_checkpoints::Column::CompletedChunks,
                Expr::value(completed_chunks),
            )
            .col_expr(
                backfill_checkpoints::Column::UpdatedAt,
                Expr::value(Utc::now()),
            )
            .filter(backfill_checkpoints::Column::TenantId.eq(&self.tenant_id))
            .filter(backfill_checkpoints::Column::BackfillId.eq(backfill_id))
            .exec(self.conn)
            .await?;
        Ok(())
    }

    pub async fn mark_completed(&self, backfill_id: &str) -> Result<(), CoreError> {
        self.set_status(backfill_id, BACKFILL_COMPLETED, None).await
    }

    pub async fn mark_running(&self, backfill_id: &str) -> Result<(), CoreError> {
        self.set_status(backfill_id, BACKFILL_RUNNING, None).await
    }

    pub async fn mark_failed(
        &self,
        backfill_id: &str,
        error_message: &str,
    ) -> Result<(), CoreError> {
        self.set_status(backfill_id, BACKFILL_FAILED, Some(error_message))
            .await
    }

    async fn set_status(
        &self,
        backfill_id: &str,
        status: &str,
        error_message: Option<&str>,
    ) -> Result<(), CoreError> {
        let mut update = backfill_checkpoints::Entity::update_many()
            .col_expr(backfill_checkpoints::Column::Status, Expr::value(status))
            .col_expr(
                backfill_checkpoints::Column::UpdatedAt,
                Expr::value(Utc::now()),
            )
            .filter(backfill_checkpoints::Column::TenantId.eq(&self.tenant_id))
            .filter(backfill_checkpoints::Column::BackfillId.eq(backfill_id));
        if let Some(message) = error_message {
            update = update.col_expr(
                backfill_checkpoints::Column::ErrorMessage,
                Expr::value(clip_error(message)),
            );
        }
        update.exec(self.conn).await?;
        Ok(())
    }

    /// Checkpoints in FAILED or RUNNING status, newest first, optionally
    /// filtered by model.
    pub async fn resumable(
        &self,
        model_name: Option<&str>,
    ) -> Result<Vec<backfill_checkpoints::Model>, CoreError> {
        let mut query = backfill_checkpoints::Entity::find()
            .filter(backfill_checkpoints::Column::TenantId.eq(&self.tenant_id))
            .filter(
                backfill_checkpoints::Column::Status
                    .is_in([BACKFILL_FAILED, BACKFILL_RUNNING]),
            );
        if let Some(model_name) = model_name {
            query = query.filter(backfill_checkpoints::Column::ModelName.eq(model_name));
        }
        let rows = query
            .order_by_desc(backfill_checkpoints::Column::CreatedAt)
            .all(self.conn)
            .await?;
        Ok(rows)
    }

    /// All checkpoints for a model, newest first.
    pub async fn list_for_model(
        &self,
        model_name: &str,
        limit: u64,
    ) -> Result<Vec<backfill_checkpoints::Model>, CoreError> {
        let rows = backfill_checkpoints::Entity::find()
            .filter(backfill_checkpoints::Column::TenantId.eq(&self.tenant_id))
            .filter(backfill_checkpoints::Column::ModelName.eq(model_name))
            .order_by_desc(backfill_checkpoints::Column::CreatedAt)
            .limit(limit)
            .all(self.conn)
            .await?;
        Ok(rows)
    }
}

/// Per-chunk execution audit trail.
pub struct BackfillAuditRepository<'c, C: ConnectionTrait> {
    conn: &'c C,
    tenant_id: String,
}

impl<'c, C: ConnectionTrait> BackfillAuditRepository<'c, C> {
    pub fn new(conn: &'c C, tenant_id: impl Into<String>) -> Self {
        Self {
            conn,
            tenant_id: tenant_id.into(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn record_chunk(
        &self,
        backfill_id: &str,
        model_name: &str,
        chunk_start: NaiveDate,
        chunk_end: NaiveDate,
        status: &str,
        run_id: Option<&str>,
        error_message: Option<&str>,
        duration_seconds: Option<f64>,
    ) -> Result<(), CoreError> {
        let row = backfill_audit::ActiveModel {
            tenant_id: Set(self.tenant_id.clone()),
            backfill_id: Set(backfill_id.to_string()),
            model_name: Set(model_name.to_string()),
            chunk_start: Set(chunk_start),
            chunk_end: Set(chunk_end),
            status: Set(status.to_string()),
            run_id: Set(run_id.map(String::from)),
            error_message: Set(error_message.map(clip_error)),
            duration_seconds: Set(duration_seconds),
            executed_at: Set(Utc::now()),
            ..Default::default()
        };
        backfill_audit::Entity::insert(row)
            .exec_without_returning(self.conn)
            .await?;
        Ok(())
    }

    /// Audit rows for one backfill, ordered by chunk start.
    pub async fn get_for_backfill(
        &self,
        backfill_id: &str,
    ) -> Result<Vec<backfill_audit::Model>, CoreError> {
        let rows = backfill_audit::Entity::find()
            .filter(backfill_audit::Column::TenantId.eq(&self.tenant_id))
            .filter(backfill_audit::Column::BackfillId.eq(backfill_id))
            .order_by_asc(backfill_audit::Column::ChunkStart)
            .order_by_asc(backfill_audit::Column::ExecutedAt)
            .all(self.conn)
            .await?;
        Ok(rows)
    }

    /// Recent chunk history for a model, newest first.
    pub async fn get_history(
        &self,
        model_name: &str,
        limit: u64,
    ) -> Result<Vec<backfill_audit::Model>, CoreError> {
        let rows = backfill_audit::Entity::find()
            .filter(backfill_audit::Column::TenantId.eq(&self.tenant_id))
            .filter(backfill_audit::Column::ModelName.eq(model_name))
            .order_by_desc(backfill_audit::Column::ExecutedAt)
            .limit(limit)
            .all(self.conn)
            .await?;
        Ok(rows)
    }
}
