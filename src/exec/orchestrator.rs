//! Execution orchestrator.
//!
//! Applies a plan step by step: authorization gate, per-step idempotency,
//! partition-range locking for incremental steps, delegation to the compute
//! backend, run recording, watermark advancement, and best-effort telemetry
//! and cost accounting. A failed step does not abort the plan; every outcome
//! is recorded and the caller decides policy from the returned run list.

use std::fmt;

use chrono::Utc;
use sea_orm::{ConnectionTrait, TransactionTrait};
use uuid::Uuid;

use crate::config::Environment;
use crate::errors::CoreError;
use crate::exec::backend::{cost_rate, ComputeBackend, ExecutionParams, EXECUTOR_VERSION};
use crate::lock::DEFAULT_LOCK_TTL_SECONDS;
use crate::plan::{Plan, PlanStep, RunRecord, RunStatus, RunType};
use crate::state::backfill::{BackfillAuditRepository, BackfillCheckpointRepository};
use crate::state::repository::{
    LockRepository, ModelRepository, PlanRepository, RunRepository, TelemetryRecord,
    TelemetryRepository, WatermarkRepository,
};

/// Caller roles recognised by the authorization gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Admin,
    Engineer,
    Operator,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "ADMIN",
            Role::Engineer => "ENGINEER",
            Role::Operator => "OPERATOR",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Executes plans and backfills against the configured compute backend.
pub struct ExecutionService<'c, C: ConnectionTrait + TransactionTrait> {
    pub(crate) conn: &'c C,
    pub(crate) backend: &'c dyn ComputeBackend,
    pub(crate) tenant_id: String,
    pub(crate) environment: Environment,
    pub(crate) default_cluster_size: String,
}

impl<'c, C: ConnectionTrait + TransactionTrait> ExecutionService<'c, C> {
    pub fn new(
        conn: &'c C,
        backend: &'c dyn ComputeBackend,
        tenant_id: impl Into<String>,
        environment: Environment,
    ) -> Self {
        Self {
            conn,
            backend,
            tenant_id: tenant_id.into(),
            environment,
            default_cluster_size: "small".to_string(),
        }
    }

    pub(crate) fn runs(&self) -> RunRepository<'c, C> {
        RunRepository::new(self.conn, self.tenant_id.clone())
    }

    pub(crate) fn plans(&self) -> PlanRepository<'c, C> {
        PlanRepository::new(self.conn, self.tenant_id.clone())
    }

    pub(crate) fn locks(&self) -> LockRepository<'c, C> {
        LockRepository::new(self.conn, self.tenant_id.clone())
    }

    pub(crate) fn models(&self) -> ModelRepository<'c, C> {
        ModelRepository::new(self.conn, self.tenant_id.clone())
    }

    pub(crate) fn watermarks(&self) -> WatermarkRepository<'c, C> {
        WatermarkRepository::new(self.conn, self.tenant_id.clone())
    }

    pub(crate) fn telemetry(&self) -> TelemetryRepository<'c, C> {
        TelemetryRepository::new(self.conn, self.tenant_id.clone())
    }

    pub(crate) fn checkpoints(&self) -> BackfillCheckpointRepository<'c, C> {
        BackfillCheckpointRepository::new(self.conn, self.tenant_id.clone())
    }

    pub(crate) fn chunk_audit(&self) -> BackfillAuditRepository<'c, C> {
        BackfillAuditRepository::new(self.conn, self.tenant_id.clone())
    }

    /// Execute every step of a persisted plan in plan order.
    ///
    /// `auto_approve` bypasses the approval gate and requires the admin
    /// role. In non-dev environments without `auto_approve`, the plan must
    /// already carry at least one approval.
    pub async fn apply_plan(
        &self,
        plan_id: &str,
        approved_by: Option<&str>,
        cluster_override: Option<&str>,
        auto_approve: bool,
        caller_role: Option<Role>,
    ) -> Result<Vec<RunRecord>, CoreError> {
        if auto_approve && caller_role != Some(Role::Admin) {
            return Err(CoreError::Unauthorized(format!(
                "auto_approve requires ADMIN role; current role '{}' is insufficient",
                caller_role.map(|r| r.as_str()).unwrap_or("UNKNOWN")
            )));
        }

        let plan_row = self
            .plans()
            .get(plan_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Plan {plan_id} not found")))?;

        if !auto_approve && self.environment != Environment::Dev {
            let approvals = self.plans().approvals(plan_id).await?;
            if approvals.is_empty() {
                return Err(CoreError::Unauthorized(format!(
                    "Plan {plan_id} has no approvals; approval is required in '{}' environment",
                    self.environment
                )));
            }
        }

        let plan: Plan = serde_json::from_value(plan_row.plan_json.clone())
            .map_err(|e| CoreError::Serialization(format!("stored plan is invalid: {e}")))?;

        // Idempotency baseline: steps that already succeeded are skipped.
        let completed: Vec<String> = self
            .runs()
            .get_by_plan(plan_id)
            .await?
            .into_iter()
            .filter(|r| r.status == RunStatus::Success.as_str())
            .map(|r| r.step_id)
            .collect();

        let mut run_records = Vec::new();

        for step in &plan.steps {
            if completed.contains(&step.step_id) {
                tracing::info!(
                    "skipping step {} for {}: already completed",
                    &step.step_id[..12.min(step.step_id.len())],
                    step.model
                );
                continue;
            }

            // Partition-range lock for incremental steps. A contender that
            // fails to acquire records a CANCELLED run and moves on.
            let mut locked = false;
            if step.run_type == RunType::Incremental {
                if let Some(range) = &step.input_range {
                    locked = self
                        .locks()
                        .acquire(
                            &step.model,
                            range.start,
                            range.end,
                            approved_by.unwrap_or("orchestrator"),
                            DEFAULT_LOCK_TTL_SECONDS,
                        )
                        .await?;
                    if !locked {
                        tracing::warn!(
                            "could not acquire lock for {} {}; recording CANCELLED run",
                            step.model,
                            range
                        );
                        let record = self.cancelled_record(plan_id, step, "Lock acquisition failed");
                        self.runs().create(&record).await?;
                        run_records.push(record);
                        continue;
                    }
                }
            }

            let outcome: Result<RunRecord, CoreError> = async {
                let record = self.execute_step(plan_id, step, cluster_override).await;
                self.runs().create(&record).await?;

                if record.status == RunStatus::Success {
                    if let (Some(start), Some(end)) =
                        (record.input_range_start, record.input_range_end)
                    {
                        self.watermarks()
                            .update_watermark(&record.model_name, start, end, None)
                            .await?;
                    }
                    self.record_side_effects(&record, cluster_override).await;
                }
                Ok(record)
            }
            .await;

            // The lock releases on every exit path, including errors from
            // run persistence or watermark advancement.
            if locked {
                if let Some(range) = &step.input_range {
                    if let Err(err) = self.locks().release(&step.model, range.start, range.end).await
                    {
                        tracing::error!("failed to release lock for {}: {err}", step.model);
                    }
                }
            }

            run_records.push(outcome?);
        }

        Ok(run_records)
    }

    /// Run one step through the compute backend. Backend failures become a
    /// FAILED record rather than an error — the plan continues.
    pub(crate) async fn execute_step(
        &self,
        plan_id: &str,
        step: &PlanStep,
        cluster_override: Option<&str>,
    ) -> RunRecord {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();

        tracing::info!(
            "executing step {} for model {} (run {})",
            &step.step_id[..12.min(step.step_id.len())],
            step.model,
            &run_id[..12]
        );

        let sql = match self.models().latest_sql(&step.model).await {
            Ok(sql) => sql.unwrap_or_default(),
            Err(err) => {
                tracing::warn!(
                    "could not fetch SQL for model {}: {err}; proceeding without it",
                    step.model
                );
                String::new()
            }
        };

        let params = ExecutionParams {
            start_date: step.input_range.map(|r| r.start),
            end_date: step.input_range.map(|r| r.end),
            cluster_id: cluster_override.map(String::from),
        };

        let (status, finished_at, error_message, external_run_id) =
            match self.backend.execute_step(step, &sql, &params).await {
                Ok(result) => (
                    result.status,
                    result.finished_at,
                    result.error_message,
                    result.external_run_id,
                ),
                Err(err) => {
                    tracing::error!("step {} failed for model {}: {err}", step.step_id, step.model);
                    (
                        RunStatus::Failed,
                        Some(Utc::now()),
                        Some(err.to_string()),
                        None,
                    )
                }
            };

        RunRecord {
            run_id,
            plan_id: plan_id.to_string(),
            step_id: step.step_id.clone(),
            model_name: step.model.clone(),
            status,
            started_at: Some(started_at),
            finished_at,
            input_range_start: step.input_range.map(|r| r.start),
            input_range_end: step.input_range.map(|r| r.end),
            error_message,
            cluster_used: cluster_override
                .map(String::from)
                .or_else(|| Some(self.default_cluster_size.clone())),
            executor_version: EXECUTOR_VERSION.to_string(),
            retry_count: 0,
            cost_usd: None,
            external_run_id,
        }
    }

    /// Telemetry and cost accounting after a successful run. Best-effort:
    /// failures are logged and never fail the run itself.
    pub(crate) async fn record_side_effects(
        &self,
        record: &RunRecord,
        cluster_override: Option<&str>,
    ) {
        let Some(runtime_seconds) = record.runtime_seconds() else {
            return;
        };

        let telemetry = TelemetryRecord {
            run_id: record.run_id.clone(),
            model_name: record.model_name.clone(),
            runtime_seconds,
            shuffle_bytes: 0,
            input_rows: 0,
            output_rows: 0,
            partition_count: 1,
        };
        if let Err(err) = self.telemetry().record(&telemetry).await {
            tracing::warn!("failed to record telemetry for run {}: {err}", record.run_id);
        }

        let cluster_size = cluster_override.unwrap_or(&self.default_cluster_size);
        match cost_rate(cluster_size) {
            Some(rate) => {
                let cost = runtime_seconds * rate;
                if let Err(err) = self.runs().update_cost(&record.run_id, cost).await {
                    tracing::warn!("failed to store cost for run {}: {err}", record.run_id);
                }
            }
            None => {
                tracing::warn!("unknown cluster size '{cluster_size}'; skipping cost computation");
            }
        }
    }

    pub(crate) fn cancelled_record(
        &self,
        plan_id: &str,
        step: &PlanStep,
        reason: &str,
    ) -> RunRecord {
        let now = Utc::now();
        RunRecord {
            run_id: Uuid::new_v4().to_string(),
            plan_id: plan_id.to_string(),
            step_id: step.step_id.clone(),
            model_name: step.model.clone(),
            status: RunStatus::Cancelled,
            started_at: Some(now),
            finished_at: Some(now),
            input_range_start: step.input_range.map(|r| r.start),
            input_range_end: step.input_range.map(|r| r.end),
            error_message: Some(reason.to_string()),
            cluster_used: None,
            executor_version: EXECUTOR_VERSION.to_string(),
            retry_count: 0,
            cost_usd: None,
            external_run_id: None,
        }
    }
}
