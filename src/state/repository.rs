//! Tenant-scoped repositories over the state store.
//!
//! Every repository takes `(connection, tenant_id)` and adds the tenant
//! predicate to every query; a cross-tenant query here is a bug. Mutating
//! methods write but do not commit — transaction boundaries belong to the
//! caller, which may hand repositories a transaction instead of a bare
//! connection.

use chrono::{Duration, NaiveDate, Utc};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::ActiveValue::Set;
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseBackend, EntityTrait, IntoActiveModel, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Statement, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::CoreError;
use crate::model::definition::ModelDefinition;
use crate::plan::planner::ModelRunStats;
use crate::plan::{RunRecord, RunStatus};
use crate::snapshot::Snapshot;
use crate::state::tables::{
    credentials, locks, model_versions, models, plans, reconciliation_checks,
    reconciliation_schedules, runs, snapshots, telemetry, watermarks,
};

/// Window of past runs feeding planner estimates.
const RUN_STATS_WINDOW: u64 = 30;

/// Longest error text persisted per row.
pub(crate) const MAX_ERROR_LEN: usize = 2000;

pub(crate) fn clip_error(message: &str) -> String {
    message.chars().take(MAX_ERROR_LEN).collect()
}

// ---------------------------------------------------------------------------
// ModelRepository
// ---------------------------------------------------------------------------

/// CRUD access to models and their immutable versions.
pub struct ModelRepository<'c, C: ConnectionTrait> {
    conn: &'c C,
    tenant_id: String,
}

impl<'c, C: ConnectionTrait> ModelRepository<'c, C> {
    pub fn new(conn: &'c C, tenant_id: impl Into<String>) -> Self {
        Self {
            conn,
            tenant_id: tenant_id.into(),
        }
    }

    /// Upsert the model row and record a new immutable version. Returns the
    /// version id.
    pub async fn register(&self, definition: &ModelDefinition) -> Result<String, CoreError> {
        let now = Utc::now();
        let version_id =
            crate::hash::deterministic_id(&[&definition.name, &definition.content_hash]);

        let row = models::ActiveModel {
            tenant_id: Set(self.tenant_id.clone()),
            model_name: Set(definition.name.clone()),
            kind: Set(definition.kind.as_str().to_string()),
            materialization: Set(definition.materialization.as_str().to_string()),
            time_column: Set(definition.time_column.clone()),
            unique_key: Set(definition.unique_key.clone()),
            owner: Set(definition.owner.clone()),
            tags: Set((!definition.tags.is_empty()).then(|| definition.tags.join(","))),
            contract_mode: Set(Some(format!("{:?}", definition.contract_mode).to_uppercase())),
            current_version: Set(Some(version_id.clone())),
            created_at: Set(now),
            updated_at: Set(now),
        };
        models::Entity::insert(row)
            .on_conflict(
                OnConflict::columns([models::Column::TenantId, models::Column::ModelName])
                    .update_columns([
                        models::Column::Kind,
                        models::Column::Materialization,
                        models::Column::TimeColumn,
                        models::Column::UniqueKey,
                        models::Column::Owner,
                        models::Column::Tags,
                        models::Column::ContractMode,
                        models::Column::CurrentVersion,
                        models::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(self.conn)
            .await?;

        let version = model_versions::ActiveModel {
            version_id: Set(version_id.clone()),
            tenant_id: Set(self.tenant_id.clone()),
            model_name: Set(definition.name.clone()),
            canonical_sql: Set(definition.clean_sql.clone()),
            content_hash: Set(definition.content_hash.clone()),
            metadata_hash: Set(None),
            created_at: Set(now),
        };
        model_versions::Entity::insert(version)
            .on_conflict(
                OnConflict::column(model_versions::Column::VersionId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(self.conn)
            .await?;

        Ok(version_id)
    }

    pub async fn get(&self, model_name: &str) -> Result<Option<models::Model>, CoreError> {
        let row = models::Entity::find()
            .filter(models::Column::TenantId.eq(&self.tenant_id))
            .filter(models::Column::ModelName.eq(model_name))
            .one(self.conn)
            .await?;
        Ok(row)
    }

    pub async fn list_all(&self) -> Result<Vec<models::Model>, CoreError> {
        let rows = models::Entity::find()
            .filter(models::Column::TenantId.eq(&self.tenant_id))
            .order_by_asc(models::Column::ModelName)
            .all(self.conn)
            .await?;
        Ok(rows)
    }

    /// Latest registered canonical SQL for a model, if any.
    pub async fn latest_sql(&self, model_name: &str) -> Result<Option<String>, CoreError> {
        let row = model_versions::Entity::find()
            .filter(model_versions::Column::TenantId.eq(&self.tenant_id))
            .filter(model_versions::Column::ModelName.eq(model_name))
            .order_by_desc(model_versions::Column::CreatedAt)
            .one(self.conn)
            .await?;
        Ok(row.map(|r| r.canonical_sql))
    }

    pub async fn delete(&self, model_name: &str) -> Result<bool, CoreError> {
        let result = models::Entity::delete_many()
            .filter(models::Column::TenantId.eq(&self.tenant_id))
            .filter(models::Column::ModelName.eq(model_name))
            .exec(self.conn)
            .await?;
        Ok(result.rows_affected > 0)
    }
}

// ---------------------------------------------------------------------------
// SnapshotRepository
// ---------------------------------------------------------------------------

/// Persistence for immutable snapshots.
pub struct SnapshotRepository<'c, C: ConnectionTrait> {
    conn: &'c C,
    tenant_id: String,
}

impl<'c, C: ConnectionTrait> SnapshotRepository<'c, C> {
    pub fn new(conn: &'c C, tenant_id: impl Into<String>) -> Self {
        Self {
            conn,
            tenant_id: tenant_id.into(),
        }
    }

    /// Persist a snapshot. Re-persisting the same snapshot id is a no-op —
    /// snapshots are immutable and content-addressed.
    pub async fn create(&self, snapshot: &Snapshot) -> Result<(), CoreError> {
        let versions = serde_json::to_value(&snapshot.versions)
            .map_err(|e| CoreError::Serialization(e.to_string()))?;
        let row = snapshots::ActiveModel {
            snapshot_id: Set(snapshot.snapshot_id.clone()),
            tenant_id: Set(self.tenant_id.clone()),
            environment: Set(snapshot.environment.clone()),
            versions: Set(versions),
            created_at: Set(snapshot.created_at),
        };
        snapshots::Entity::insert(row)
            .on_conflict(
                OnConflict::column(snapshots::Column::SnapshotId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(self.conn)
            .await?;
        Ok(())
    }

    pub async fn get(&self, snapshot_id: &str) -> Result<Option<snapshots::Model>, CoreError> {
        let row = snapshots::Entity::find()
            .filter(snapshots::Column::TenantId.eq(&self.tenant_id))
            .filter(snapshots::Column::SnapshotId.eq(snapshot_id))
            .one(self.conn)
            .await?;
        Ok(row)
    }

    pub async fn get_latest(
        &self,
        environment: &str,
    ) -> Result<Option<snapshots::Model>, CoreError> {
        let row = snapshots::Entity::find()
            .filter(snapshots::Column::TenantId.eq(&self.tenant_id))
            .filter(snapshots::Column::Environment.eq(environment))
            .order_by_desc(snapshots::Column::CreatedAt)
            .one(self.conn)
            .await?;
        Ok(row)
    }
}

// ---------------------------------------------------------------------------
// WatermarkRepository
// ---------------------------------------------------------------------------

/// High-water marks for incremental models.
pub struct WatermarkRepository<'c, C: ConnectionTrait> {
    conn: &'c C,
    tenant_id: String,
}

impl<'c, C: ConnectionTrait> WatermarkRepository<'c, C> {
    pub fn new(conn: &'c C, tenant_id: impl Into<String>) -> Self {
        Self {
            conn,
            tenant_id: tenant_id.into(),
        }
    }

    /// Latest partition range for a model, by most recent update.
    pub async fn get_watermark(
        &self,
        model_name: &str,
    ) -> Result<Option<(NaiveDate, NaiveDate)>, CoreError> {
        let row = watermarks::Entity::find()
            .filter(watermarks::Column::TenantId.eq(&self.tenant_id))
            .filter(watermarks::Column::ModelName.eq(model_name))
            .order_by_desc(watermarks::Column::LastUpdated)
            .one(self.conn)
            .await?;
        Ok(row.map(|r| (r.partition_start, r.partition_end)))
    }

    /// Upsert a watermark keyed on the full partition range.
    pub async fn update_watermark(
        &self,
        model_name: &str,
        partition_start: NaiveDate,
        partition_end: NaiveDate,
        row_count: Option<i64>,
    ) -> Result<(), CoreError> {
        let row = watermarks::ActiveModel {
            tenant_id: Set(self.tenant_id.clone()),
            model_name: Set(model_name.to_string()),
            partition_start: Set(partition_start),
            partition_end: Set(partition_end),
            row_count: Set(row_count),
            last_updated: Set(Utc::now()),
        };
        watermarks::Entity::insert(row)
            .on_conflict(
                OnConflict::columns([
                    watermarks::Column::TenantId,
                    watermarks::Column::ModelName,
                    watermarks::Column::PartitionStart,
                    watermarks::Column::PartitionEnd,
                ])
                .update_columns([watermarks::Column::RowCount, watermarks::Column::LastUpdated])
                .to_owned(),
            )
            .exec_without_returning(self.conn)
            .await?;
        Ok(())
    }

    /// Every recorded range for a model, ordered by partition start.
    pub async fn history(&self, model_name: &str) -> Result<Vec<watermarks::Model>, CoreError> {
        let rows = watermarks::Entity::find()
            .filter(watermarks::Column::TenantId.eq(&self.tenant_id))
            .filter(watermarks::Column::ModelName.eq(model_name))
            .order_by_asc(watermarks::Column::PartitionStart)
            .all(self.conn)
            .await?;
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// RunRepository
// ---------------------------------------------------------------------------

/// CRUD access to run records.
pub struct RunRepository<'c, C: ConnectionTrait> {
    conn: &'c C,
    tenant_id: String,
}

impl<'c, C: ConnectionTrait> RunRepository<'c, C> {
    pub fn new(conn: &'c C, tenant_id: impl Into<String>) -> Self {
        Self {
            conn,
            tenant_id: tenant_id.into(),
        }
    }

    pub async fn create(&self, record: &RunRecord) -> Result<(), CoreError> {
        let row = runs::ActiveModel {
            run_id: Set(record.run_id.clone()),
            tenant_id: Set(self.tenant_id.clone()),
            plan_id: Set(record.plan_id.clone()),
            step_id: Set(record.step_id.clone()),
            model_name: Set(record.model_name.clone()),
            status: Set(record.status.as_str().to_string()),
            started_at: Set(record.started_at),
            finished_at: Set(record.finished_at),
            input_range_start: Set(record.input_range_start),
            input_range_end: Set(record.input_range_end),
            error_message: Set(record.error_message.as_deref().map(clip_error)),
            cluster_used: Set(record.cluster_used.clone()),
            executor_version: Set(record.executor_version.clone()),
            retry_count: Set(record.retry_count),
            cost_usd: Set(record.cost_usd),
            external_run_id: Set(record.external_run_id.clone()),
            created_at: Set(Utc::now()),
        };
        runs::Entity::insert(row)
            .exec_without_returning(self.conn)
            .await?;
        Ok(())
    }

    pub async fn update_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error_message: Option<&str>,
    ) -> Result<(), CoreError> {
        let mut update = runs::Entity::update_many()
            .col_expr(runs::Column::Status, Expr::value(status.as_str()))
            .filter(runs::Column::TenantId.eq(&self.tenant_id))
            .filter(runs::Column::RunId.eq(run_id));
        if let Some(message) = error_message {
            update = update.col_expr(
                runs::Column::ErrorMessage,
                Expr::value(clip_error(message)),
            );
        }
        update.exec(self.conn).await?;
        Ok(())
    }

    pub async fn update_cost(&self, run_id: &str, cost_usd: f64) -> Result<(), CoreError> {
        runs::Entity::update_many()
            .col_expr(runs::Column::CostUsd, Expr::value(cost_usd))
            .filter(runs::Column::TenantId.eq(&self.tenant_id))
            .filter(runs::Column::RunId.eq(run_id))
            .exec(self.conn)
            .await?;
        Ok(())
    }

    pub async fn get(&self, run_id: &str) -> Result<Option<runs::Model>, CoreError> {
        let row = runs::Entity::find()
            .filter(runs::Column::TenantId.eq(&self.tenant_id))
            .filter(runs::Column::RunId.eq(run_id))
            .one(self.conn)
            .await?;
        Ok(row)
    }

    /// All runs of a plan, ordered by start time.
    pub async fn get_by_plan(&self, plan_id: &str) -> Result<Vec<runs::Model>, CoreError> {
        let rows = runs::Entity::find()
            .filter(runs::Column::TenantId.eq(&self.tenant_id))
            .filter(runs::Column::PlanId.eq(plan_id))
            .order_by_asc(runs::Column::CreatedAt)
            .all(self.conn)
            .await?;
        Ok(rows)
    }

    pub async fn get_recent(&self, limit: u64) -> Result<Vec<runs::Model>, CoreError> {
        let rows = runs::Entity::find()
            .filter(runs::Column::TenantId.eq(&self.tenant_id))
            .order_by_desc(runs::Column::CreatedAt)
            .limit(limit)
            .all(self.conn)
            .await?;
        Ok(rows)
    }

    pub async fn count_by_status(
        &self,
        model_name: &str,
        status: RunStatus,
    ) -> Result<u64, CoreError> {
        let count = runs::Entity::find()
            .filter(runs::Column::TenantId.eq(&self.tenant_id))
            .filter(runs::Column::ModelName.eq(model_name))
            .filter(runs::Column::Status.eq(status.as_str()))
            .count(self.conn)
            .await?;
        Ok(count)
    }

    /// Mean runtime and cost over the most recent successful runs of a
    /// model. Purely advisory; feeds planner estimates.
    pub async fn historical_stats(&self, model_name: &str) -> Result<ModelRunStats, CoreError> {
        let rows = runs::Entity::find()
            .filter(runs::Column::TenantId.eq(&self.tenant_id))
            .filter(runs::Column::ModelName.eq(model_name))
            .filter(runs::Column::Status.eq(RunStatus::Success.as_str()))
            .filter(runs::Column::StartedAt.is_not_null())
            .filter(runs::Column::FinishedAt.is_not_null())
            .order_by_desc(runs::Column::FinishedAt)
            .limit(RUN_STATS_WINDOW)
            .all(self.conn)
            .await?;

        if rows.is_empty() {
            return Ok(ModelRunStats::default());
        }

        let mut runtime_total = 0.0;
        let mut cost_total = 0.0;
        for row in &rows {
            if let (Some(started), Some(finished)) = (row.started_at, row.finished_at) {
                runtime_total += (finished - started).num_milliseconds() as f64 / 1000.0;
            }
            cost_total += row.cost_usd.unwrap_or(0.0);
        }
        let samples = rows.len() as f64;
        Ok(ModelRunStats {
            avg_runtime_seconds: runtime_total / samples,
            avg_cost_usd: cost_total / samples,
        })
    }
}

// ---------------------------------------------------------------------------
// PlanRepository
// ---------------------------------------------------------------------------

/// One approval on a plan.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Approval {
    pub user: String,
    pub comment: String,
    pub at: String,
}

/// Persistence for plans and their approval trail.
pub struct PlanRepository<'c, C: ConnectionTrait + TransactionTrait> {
    conn: &'c C,
    tenant_id: String,
}

impl<'c, C: ConnectionTrait + TransactionTrait> PlanRepository<'c, C> {
    pub fn new(conn: &'c C, tenant_id: impl Into<String>) -> Self {
        Self {
            conn,
            tenant_id: tenant_id.into(),
        }
    }

    pub async fn save(
        &self,
        plan_id: &str,
        base_sha: &str,
        target_sha: &str,
        plan_json: serde_json::Value,
    ) -> Result<(), CoreError> {
        let row = plans::ActiveModel {
            tenant_id: Set(self.tenant_id.clone()),
            plan_id: Set(plan_id.to_string()),
            base_sha: Set(base_sha.to_string()),
            target_sha: Set(target_sha.to_string()),
            plan_json: Set(plan_json),
            approvals_json: Set(None),
            created_at: Set(Utc::now()),
        };
        plans::Entity::insert(row)
            .on_conflict(
                OnConflict::columns([plans::Column::TenantId, plans::Column::PlanId])
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(self.conn)
            .await?;
        Ok(())
    }

    pub async fn get(&self, plan_id: &str) -> Result<Option<plans::Model>, CoreError> {
        let row = plans::Entity::find()
            .filter(plans::Column::TenantId.eq(&self.tenant_id))
            .filter(plans::Column::PlanId.eq(plan_id))
            .one(self.conn)
            .await?;
        Ok(row)
    }

    /// Append an approval atomically.
    ///
    /// On PostgreSQL this is a single JSONB concatenation, so concurrent
    /// approvals cannot overwrite each other. Elsewhere the read-modify-write
    /// runs inside a nested transaction.
    pub async fn add_approval(
        &self,
        plan_id: &str,
        user: &str,
        comment: &str,
    ) -> Result<(), CoreError> {
        let approval = Approval {
            user: user.to_string(),
            comment: comment.to_string(),
            at: Utc::now().to_rfc3339(),
        };

        if self.conn.get_database_backend() == DatabaseBackend::Postgres {
            let entry = serde_json::to_string(&vec![&approval])
                .map_err(|e| CoreError::Serialization(e.to_string()))?;
            let result = self
                .conn
                .execute(Statement::from_sql_and_values(
                    DatabaseBackend::Postgres,
                    "UPDATE plans \
                     SET approvals_json = COALESCE(approvals_json, '[]'::jsonb) || $1::jsonb \
                     WHERE tenant_id = $2 AND plan_id = $3",
                    [entry.into(), self.tenant_id.clone().into(), plan_id.into()],
                ))
                .await?;
            if result.rows_affected() == 0 {
                return Err(CoreError::NotFound(format!("Plan {plan_id} not found")));
            }
            return Ok(());
        }

        let txn = self.conn.begin().await?;
        let row = plans::Entity::find()
            .filter(plans::Column::TenantId.eq(&self.tenant_id))
            .filter(plans::Column::PlanId.eq(plan_id))
            .one(&txn)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Plan {plan_id} not found")))?;

        let mut approvals: Vec<Approval> = row
            .approvals_json
            .as_ref()
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
            .map_err(|e| CoreError::Serialization(e.to_string()))?
            .unwrap_or_default();
        approvals.push(approval);
        let approvals_value = serde_json::to_value(&approvals)
            .map_err(|e| CoreError::Serialization(e.to_string()))?;

        plans::Entity::update_many()
            .col_expr(plans::Column::ApprovalsJson, Expr::value(approvals_value))
            .filter(plans::Column::TenantId.eq(&self.tenant_id))
            .filter(plans::Column::PlanId.eq(plan_id))
            .exec(&txn)
            .await?;
        txn.commit().await?;
        Ok(())
    }

    /// The plan's approvals, oldest first.
    pub async fn approvals(&self, plan_id: &str) -> Result<Vec<Approval>, CoreError> {
        let row = self
            .get(plan_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Plan {plan_id} not found")))?;
        let approvals = row
            .approvals_json
            .as_ref()
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
            .map_err(|e| CoreError::Serialization(e.to_string()))?
            .unwrap_or_default();
        Ok(approvals)
    }

    pub async fn list_recent(&self, limit: u64) -> Result<Vec<plans::Model>, CoreError> {
        let rows = plans::Entity::find()
            .filter(plans::Column::TenantId.eq(&self.tenant_id))
            .order_by_desc(plans::Column::CreatedAt)
            .limit(limit)
            .all(self.conn)
            .await?;
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// LockRepository
// ---------------------------------------------------------------------------

/// Advisory lock rows for model partition ranges.
///
/// `acquire` is an atomic reap-then-conditional-insert: a separate
/// SELECT-then-INSERT would race between the check and the write.
pub struct LockRepository<'c, C: ConnectionTrait> {
    conn: &'c C,
    tenant_id: String,
}

impl<'c, C: ConnectionTrait> LockRepository<'c, C> {
    pub fn new(conn: &'c C, tenant_id: impl Into<String>) -> Self {
        Self {
            conn,
            tenant_id: tenant_id.into(),
        }
    }

    /// Attempt to acquire a lock. Returns false when a live lock exists for
    /// the same `(model, range_start, range_end)`; expired locks are reaped
    /// first.
    pub async fn acquire(
        &self,
        model_name: &str,
        range_start: NaiveDate,
        range_end: NaiveDate,
        locked_by: &str,
        ttl_seconds: i64,
    ) -> Result<bool, CoreError> {
        let now = Utc::now();

        // Reap any expired lock for this exact key. The expiry predicate is
        // embedded in the delete itself, so a fresh lock written by a racing
        // contender between this statement and the insert is never touched.
        self.delete_expired(Some((model_name, range_start, range_end)))
            .await?;

        let row = locks::ActiveModel {
            tenant_id: Set(self.tenant_id.clone()),
            model_name: Set(model_name.to_string()),
            range_start: Set(range_start),
            range_end: Set(range_end),
            locked_by: Set(locked_by.to_string()),
            locked_at: Set(now),
            ttl_seconds: Set(ttl_seconds),
        };
        let inserted = locks::Entity::insert(row)
            .on_conflict(
                OnConflict::columns([
                    locks::Column::TenantId,
                    locks::Column::ModelName,
                    locks::Column::RangeStart,
                    locks::Column::RangeEnd,
                ])
                .do_nothing()
                .to_owned(),
            )
            .exec_without_returning(self.conn)
            .await?;
        Ok(inserted > 0)
    }

    /// Unconditionally delete the lock row; safe when no lock is held.
    pub async fn release(
        &self,
        model_name: &str,
        range_start: NaiveDate,
        range_end: NaiveDate,
    ) -> Result<(), CoreError> {
        locks::Entity::delete_many()
            .filter(locks::Column::TenantId.eq(&self.tenant_id))
            .filter(locks::Column::ModelName.eq(model_name))
            .filter(locks::Column::RangeStart.eq(range_start))
            .filter(locks::Column::RangeEnd.eq(range_end))
            .exec(self.conn)
            .await?;
        Ok(())
    }

    /// True when a non-expired lock exists for the range.
    pub async fn check(
        &self,
        model_name: &str,
        range_start: NaiveDate,
        range_end: NaiveDate,
    ) -> Result<bool, CoreError> {
        let now = Utc::now();
        Ok(self
            .find(model_name, range_start, range_end)
            .await?
            .is_some_and(|row| row.locked_at + Duration::seconds(row.ttl_seconds) >= now))
    }

    pub async fn find(
        &self,
        model_name: &str,
        range_start: NaiveDate,
        range_end: NaiveDate,
    ) -> Result<Option<locks::Model>, CoreError> {
        let row = locks::Entity::find()
            .filter(locks::Column::TenantId.eq(&self.tenant_id))
            .filter(locks::Column::ModelName.eq(model_name))
            .filter(locks::Column::RangeStart.eq(range_start))
            .filter(locks::Column::RangeEnd.eq(range_end))
            .one(self.conn)
            .await?;
        Ok(row)
    }

    /// Delete every lock whose TTL has elapsed. Returns the reap count.
    pub async fn expire_stale(&self) -> Result<u64, CoreError> {
        self.delete_expired(None).await
    }

    /// Delete expired lock rows in one predicate-scoped statement: the
    /// `locked_at + ttl < now` condition runs inside the DELETE, never as a
    /// read followed by a delete-by-key. With a key the reap is limited to
    /// that exact range; without one it sweeps the tenant.
    ///
    /// The per-row interval arithmetic is the one lock operation that cannot
    /// be expressed through the query builder portably, so the statement is
    /// raw per backend, like the approval append and the audit chain lock.
    async fn delete_expired(
        &self,
        key: Option<(&str, NaiveDate, NaiveDate)>,
    ) -> Result<u64, CoreError> {
        let now = Utc::now();
        let backend = self.conn.get_database_backend();

        let statement = if backend == DatabaseBackend::Postgres {
            match key {
                Some((model_name, range_start, range_end)) => Statement::from_sql_and_values(
                    backend,
                    "DELETE FROM locks \
                     WHERE tenant_id = $1 AND model_name = $2 \
                       AND range_start = $3 AND range_end = $4 \
                       AND locked_at + ttl_seconds * interval '1 second' < $5",
                    [
                        self.tenant_id.clone().into(),
                        model_name.into(),
                        range_start.into(),
                        range_end.into(),
                        now.into(),
                    ],
                ),
                None => Statement::from_sql_and_values(
                    backend,
                    "DELETE FROM locks \
                     WHERE tenant_id = $1 \
                       AND locked_at + ttl_seconds * interval '1 second' < $2",
                    [self.tenant_id.clone().into(), now.into()],
                ),
            }
        } else {
            // SQLite stores timestamps as ISO-8601 text; julianday keeps
            // sub-second precision through the comparison.
            match key {
                Some((model_name, range_start, range_end)) => Statement::from_sql_and_values(
                    backend,
                    "DELETE FROM locks \
                     WHERE tenant_id = ? AND model_name = ? \
                       AND range_start = ? AND range_end = ? \
                       AND julianday(locked_at) + ttl_seconds / 86400.0 < julianday(?)",
                    [
                        self.tenant_id.clone().into(),
                        model_name.into(),
                        range_start.into(),
                        range_end.into(),
                        now.to_rfc3339().into(),
                    ],
                ),
                None => Statement::from_sql_and_values(
                    backend,
                    "DELETE FROM locks \
                     WHERE tenant_id = ? \
                       AND julianday(locked_at) + ttl_seconds / 86400.0 < julianday(?)",
                    [self.tenant_id.clone().into(), now.to_rfc3339().into()],
                ),
            }
        };

        let result = self.conn.execute(statement).await?;
        Ok(result.rows_affected())
    }
}

// ---------------------------------------------------------------------------
// TelemetryRepository
// ---------------------------------------------------------------------------

/// Execution metrics captured after a successful run.
#[derive(Clone, Debug)]
pub struct TelemetryRecord {
    pub run_id: String,
    pub model_name: String,
    pub runtime_seconds: f64,
    pub shuffle_bytes: i64,
    pub input_rows: i64,
    pub output_rows: i64,
    pub partition_count: i32,
}

pub struct TelemetryRepository<'c, C: ConnectionTrait> {
    conn: &'c C,
    tenant_id: String,
}

impl<'c, C: ConnectionTrait> TelemetryRepository<'c, C> {
    pub fn new(conn: &'c C, tenant_id: impl Into<String>) -> Self {
        Self {
            conn,
            tenant_id: tenant_id.into(),
        }
    }

    pub async fn record(&self, record: &TelemetryRecord) -> Result<(), CoreError> {
        let row = telemetry::ActiveModel {
            tenant_id: Set(self.tenant_id.clone()),
            run_id: Set(record.run_id.clone()),
            model_name: Set(record.model_name.clone()),
            runtime_seconds: Set(record.runtime_seconds),
            shuffle_bytes: Set(record.shuffle_bytes),
            input_rows: Set(record.input_rows),
            output_rows: Set(record.output_rows),
            partition_count: Set(record.partition_count),
            captured_at: Set(Utc::now()),
            ..Default::default()
        };
        telemetry::Entity::insert(row)
            .exec_without_returning(self.conn)
            .await?;
        Ok(())
    }

    pub async fn get_for_run(&self, run_id: &str) -> Result<Vec<telemetry::Model>, CoreError> {
        let rows = telemetry::Entity::find()
            .filter(telemetry::Column::TenantId.eq(&self.tenant_id))
            .filter(telemetry::Column::RunId.eq(run_id))
            .all(self.conn)
            .await?;
        Ok(rows)
    }

    pub async fn get_for_model(
        &self,
        model_name: &str,
        limit: u64,
    ) -> Result<Vec<telemetry::Model>, CoreError> {
        let rows = telemetry::Entity::find()
            .filter(telemetry::Column::TenantId.eq(&self.tenant_id))
            .filter(telemetry::Column::ModelName.eq(model_name))
            .order_by_desc(telemetry::Column::CapturedAt)
            .limit(limit)
            .all(self.conn)
            .await?;
        Ok(rows)
    }

    /// Delete telemetry older than the retention window. Returns the number
    /// of rows removed.
    pub async fn cleanup_old(&self, retention_days: i64) -> Result<u64, CoreError> {
        let cutoff = Utc::now() - Duration::days(retention_days);
        let result = telemetry::Entity::delete_many()
            .filter(telemetry::Column::TenantId.eq(&self.tenant_id))
            .filter(telemetry::Column::CapturedAt.lt(cutoff))
            .exec(self.conn)
            .await?;
        Ok(result.rows_affected)
    }
}

// ---------------------------------------------------------------------------
// ReconciliationRepository
// ---------------------------------------------------------------------------

/// Aggregate reconciliation counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconciliationStats {
    pub total_checks: u64,
    pub unresolved: u64,
}

pub struct ReconciliationRepository<'c, C: ConnectionTrait> {
    conn: &'c C,
    tenant_id: String,
}

impl<'c, C: ConnectionTrait> ReconciliationRepository<'c, C> {
    pub fn new(conn: &'c C, tenant_id: impl Into<String>) -> Self {
        Self {
            conn,
            tenant_id: tenant_id.into(),
        }
    }

    /// Record one comparison. The check starts resolved when expectation and
    /// warehouse agree.
    pub async fn record_check(
        &self,
        run_id: &str,
        model_name: Option<&str>,
        expected_status: &str,
        warehouse_status: Option<&str>,
        discrepancy_type: Option<&str>,
    ) -> Result<reconciliation_checks::Model, CoreError> {
        let resolved = discrepancy_type.is_none();
        let row = reconciliation_checks::Model {
            id: Uuid::new_v4().simple().to_string(),
            tenant_id: self.tenant_id.clone(),
            run_id: run_id.to_string(),
            model_name: model_name.map(String::from),
            expected_status: expected_status.to_string(),
            warehouse_status: warehouse_status.map(String::from),
            discrepancy_type: discrepancy_type.map(String::from),
            resolved,
            resolved_by: None,
            resolution_note: None,
            checked_at: Utc::now(),
            resolved_at: resolved.then(Utc::now),
        };
        reconciliation_checks::Entity::insert(row.clone().into_active_model())
            .exec_without_returning(self.conn)
            .await?;
        Ok(row)
    }

    pub async fn get_unresolved(
        &self,
        limit: u64,
    ) -> Result<Vec<reconciliation_checks::Model>, CoreError> {
        let rows = reconciliation_checks::Entity::find()
            .filter(reconciliation_checks::Column::TenantId.eq(&self.tenant_id))
            .filter(reconciliation_checks::Column::Resolved.eq(false))
            .order_by_desc(reconciliation_checks::Column::CheckedAt)
            .limit(limit)
            .all(self.conn)
            .await?;
        Ok(rows)
    }

    /// Resolve a discrepancy with an operator note.
    pub async fn resolve(
        &self,
        check_id: &str,
        resolved_by: &str,
        note: &str,
    ) -> Result<bool, CoreError> {
        let result = reconciliation_checks::Entity::update_many()
            .col_expr(reconciliation_checks::Column::Resolved, Expr::value(true))
            .col_expr(
                reconciliation_checks::Column::ResolvedBy,
                Expr::value(resolved_by),
            )
            .col_expr(
                reconciliation_checks::Column::ResolutionNote,
                Expr::value(note),
            )
            .col_expr(
                reconciliation_checks::Column::ResolvedAt,
                Expr::value(Utc::now()),
            )
            .filter(reconciliation_checks::Column::TenantId.eq(&self.tenant_id))
            .filter(reconciliation_checks::Column::Id.eq(check_id))
            .exec(self.conn)
            .await?;
        Ok(result.rows_affected > 0)
    }

    pub async fn stats(&self) -> Result<ReconciliationStats, CoreError> {
        let total_checks = reconciliation_checks::Entity::find()
            .filter(reconciliation_checks::Column::TenantId.eq(&self.tenant_id))
            .count(self.conn)
            .await?;
        let unresolved = reconciliation_checks::Entity::find()
            .filter(reconciliation_checks::Column::TenantId.eq(&self.tenant_id))
            .filter(reconciliation_checks::Column::Resolved.eq(false))
            .count(self.conn)
            .await?;
        Ok(ReconciliationStats {
            total_checks,
            unresolved,
        })
    }
}

// ---------------------------------------------------------------------------
// ReconciliationScheduleRepository
// ---------------------------------------------------------------------------

pub struct ReconciliationScheduleRepository<'c, C: ConnectionTrait> {
    conn: &'c C,
    tenant_id: String,
}

impl<'c, C: ConnectionTrait> ReconciliationScheduleRepository<'c, C> {
    pub fn new(conn: &'c C, tenant_id: impl Into<String>) -> Self {
        Self {
            conn,
            tenant_id: tenant_id.into(),
        }
    }

    pub async fn upsert(
        &self,
        schedule_type: &str,
        cron_expression: &str,
        enabled: bool,
    ) -> Result<(), CoreError> {
        let row = reconciliation_schedules::ActiveModel {
            tenant_id: Set(self.tenant_id.clone()),
            schedule_type: Set(schedule_type.to_string()),
            cron_expression: Set(cron_expression.to_string()),
            enabled: Set(enabled),
            last_run_at: Set(None),
            updated_at: Set(Utc::now()),
        };
        reconciliation_schedules::Entity::insert(row)
            .on_conflict(
                OnConflict::columns([
                    reconciliation_schedules::Column::TenantId,
                    reconciliation_schedules::Column::ScheduleType,
                ])
                .update_columns([
                    reconciliation_schedules::Column::CronExpression,
                    reconciliation_schedules::Column::Enabled,
                    reconciliation_schedules::Column::UpdatedAt,
                ])
                .to_owned(),
            )
            .exec_without_returning(self.conn)
            .await?;
        Ok(())
    }

    pub async fn get(
        &self,
        schedule_type: &str,
    ) -> Result<Option<reconciliation_schedules::Model>, CoreError> {
        let row = reconciliation_schedules::Entity::find()
            .filter(reconciliation_schedules::Column::TenantId.eq(&self.tenant_id))
            .filter(reconciliation_schedules::Column::ScheduleType.eq(schedule_type))
            .one(self.conn)
            .await?;
        Ok(row)
    }

    pub async fn all_enabled(&self) -> Result<Vec<reconciliation_schedules::Model>, CoreError> {
        let rows = reconciliation_schedules::Entity::find()
            .filter(reconciliation_schedules::Column::TenantId.eq(&self.tenant_id))
            .filter(reconciliation_schedules::Column::Enabled.eq(true))
            .all(self.conn)
            .await?;
        Ok(rows)
    }

    pub async fn touch_last_run(&self, schedule_type: &str) -> Result<(), CoreError> {
        reconciliation_schedules::Entity::update_many()
            .col_expr(
                reconciliation_schedules::Column::LastRunAt,
                Expr::value(Utc::now()),
            )
            .filter(reconciliation_schedules::Column::TenantId.eq(&self.tenant_id))
            .filter(reconciliation_schedules::Column::ScheduleType.eq(schedule_type))
            .exec(self.conn)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CredentialRepository
// ---------------------------------------------------------------------------

/// Ciphertext-only credential storage. Callers encrypt before storing; the
/// plaintext passes through memory once and is never persisted or logged.
pub struct CredentialRepository<'c, C: ConnectionTrait> {
    conn: &'c C,
    tenant_id: String,
}

impl<'c, C: ConnectionTrait> CredentialRepository<'c, C> {
    pub fn new(conn: &'c C, tenant_id: impl Into<String>) -> Self {
        Self {
            conn,
            tenant_id: tenant_id.into(),
        }
    }

    pub async fn store(&self, credential_name: &str, ciphertext: &str) -> Result<(), CoreError> {
        let now = Utc::now();
        let row = credentials::ActiveModel {
            tenant_id: Set(self.tenant_id.clone()),
            credential_name: Set(credential_name.to_string()),
            ciphertext: Set(ciphertext.to_string()),
            created_at: Set(now),
            updated_at: Set(now),
        };
        credentials::Entity::insert(row)
            .on_conflict(
                OnConflict::columns([
                    credentials::Column::TenantId,
                    credentials::Column::CredentialName,
                ])
                .update_columns([
                    credentials::Column::Ciphertext,
                    credentials::Column::UpdatedAt,
                ])
                .to_owned(),
            )
            .exec_without_returning(self.conn)
            .await?;
        Ok(())
    }

    pub async fn get(&self, credential_name: &str) -> Result<Option<String>, CoreError> {
        let row = credentials::Entity::find()
            .filter(credentials::Column::TenantId.eq(&self.tenant_id))
            .filter(credentials::Column::CredentialName.eq(credential_name))
            .one(self.conn)
            .await?;
        Ok(row.map(|r| r.ciphertext))
    }

    pub async fn delete(&self, credential_name: &str) -> Result<bool, CoreError> {
        let result = credentials::Entity::delete_many()
            .filter(credentials::Column::TenantId.eq(&self.tenant_id))
            .filter(credentials::Column::CredentialName.eq(credential_name))
            .exec(self.conn)
            .await?;
        Ok(result.rows_affected > 0)
    }

    pub async fn list_names(&self) -> Result<Vec<String>, CoreError> {
        let rows = credentials::Entity::find()
            .filter(credentials::Column::TenantId.eq(&self.tenant_id))
            .order_by_asc(credentials::Column::CredentialName)
            .all(self.conn)
            .await?;
        Ok(rows.into_iter().map(|r| r.credential_name).collect())
    }
}

/// Convert a persisted run row back into the domain record.
pub fn run_record_from_row(row: &runs::Model) -> RunRecord {
    RunRecord {
        run_id: row.run_id.clone(),
        plan_id: row.plan_id.clone(),
        step_id: row.step_id.clone(),
        model_name: row.model_name.clone(),
        status: RunStatus::parse(&row.status).unwrap_or(RunStatus::Failed),
        started_at: row.started_at,
        finished_at: row.finished_at,
        input_range_start: row.input_range_start,
        input_range_end: row.input_range_end,
        error_message: row.error_message.clone(),
        cluster_used: row.cluster_used.clone(),
        executor_version: row.executor_version.clone(),
        retry_count: row.retry_count,
        cost_usd: row.cost_usd,
        external_run_id: row.external_run_id.clone(),
    }
}
