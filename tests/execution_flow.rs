//! Orchestrator, backfill, and reconciliation scenarios over in-memory
//! SQLite with the local sandbox executor (and a scripted failing backend
//! for mid-run failure injection).

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use sea_orm::DatabaseConnection;

use tidemark::config::Environment;
use tidemark::diff::compute_structural_diff;
use tidemark::errors::CoreError;
use tidemark::exec::backend::{ComputeBackend, ExecutionParams, RemoteRun, RunResult};
use tidemark::exec::{BackfillStatus, ExecutionService, LocalExecutor, Role};
use tidemark::graph::build_dag;
use tidemark::lock::DEFAULT_LOCK_TTL_SECONDS;
use tidemark::model::definition::{Materialization, ModelDefinition, ModelKind};
use tidemark::plan::planner::{generate_plan, PlannerConfig, PlannerInputs};
use tidemark::plan::{Plan, PlanStep, RunStatus};
use tidemark::state::repository::{
    LockRepository, ModelRepository, PlanRepository, RunRepository, WatermarkRepository,
};
use tidemark::state::{connect, init_schema};

const TENANT: &str = "default";

fn date(s: &str) -> NaiveDate {
    s.parse().expect("date")
}

fn model(name: &str, kind: ModelKind, dependencies: &[&str], sql: &str) -> ModelDefinition {
    ModelDefinition {
        name: name.to_string(),
        kind,
        materialization: Materialization::Table,
        time_column: (kind == ModelKind::IncrementalByTimeRange).then(|| "event_date".to_string()),
        unique_key: None,
        partition_by: None,
        incremental_strategy: None,
        owner: None,
        tags: Vec::new(),
        raw_sql: sql.to_string(),
        clean_sql: sql.to_string(),
        content_hash: format!("hash-{name}"),
        dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
        contract_mode: Default::default(),
        contract_columns: Vec::new(),
    }
}

fn fixture_models() -> Vec<ModelDefinition> {
    vec![
        model(
            "raw.events",
            ModelKind::FullRefresh,
            &[],
            "SELECT 1 AS event_id",
        ),
        model(
            "analytics.orders_daily",
            ModelKind::IncrementalByTimeRange,
            &["raw.events"],
            "SELECT '{{ start_date }}' AS window_start",
        ),
    ]
}

async fn store() -> DatabaseConnection {
    let db = connect("sqlite::memory:").await.expect("connect");
    init_schema(&db).await.expect("schema");
    db
}

/// Register the fixture models and persist a plan that rebuilds everything.
async fn seed_plan(db: &DatabaseConnection, as_of: &str) -> Plan {
    let models = fixture_models();
    let model_repo = ModelRepository::new(db, TENANT);
    for definition in &models {
        model_repo.register(definition).await.expect("register model");
    }

    let dag = build_dag(&models).expect("dag");
    let model_map: BTreeMap<String, ModelDefinition> = models
        .iter()
        .cloned()
        .map(|m| (m.name.clone(), m))
        .collect();

    let base: BTreeMap<String, String> = BTreeMap::new();
    let target: BTreeMap<String, String> = model_map
        .iter()
        .map(|(name, m)| (name.clone(), m.content_hash.clone()))
        .collect();
    let diff = compute_structural_diff(&base, &target);

    let plan = generate_plan(&PlannerInputs {
        models: &model_map,
        diff: &diff,
        dag: &dag,
        watermarks: &BTreeMap::new(),
        run_stats: &BTreeMap::new(),
        contract_results: &BTreeMap::new(),
        config: PlannerConfig::default(),
        base: "snap-base",
        target: "snap-target",
        as_of_date: Some(date(as_of)),
    })
    .expect("plan");

    PlanRepository::new(db, TENANT)
        .save(
            &plan.plan_id,
            &plan.base,
            &plan.target,
            serde_json::to_value(&plan).expect("plan json"),
        )
        .await
        .expect("save plan");

    plan
}

// ---------------------------------------------------------------------------
// apply_plan
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_apply_plan_executes_all_steps_and_advances_watermark() {
    let db = store().await;
    let plan = seed_plan(&db, "2025-06-15").await;
    let sandbox = LocalExecutor::in_memory().await.expect("sandbox");
    let service = ExecutionService::new(&db, &sandbox, TENANT, Environment::Dev);

    let runs = service
        .apply_plan(&plan.plan_id, Some("tester"), None, false, None)
        .await
        .expect("apply");

    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.status == RunStatus::Success));

    // The incremental step advanced its model's watermark to the planned
    // range.
    let incremental = plan
        .steps
        .iter()
        .find(|s| s.model == "analytics.orders_daily")
        .expect("incremental step");
    let range = incremental.input_range.expect("range");
    let watermark = WatermarkRepository::new(&db, TENANT)
        .get_watermark("analytics.orders_daily")
        .await
        .expect("watermark")
        .expect("present");
    assert_eq!(watermark, (range.start, range.end));

    // Locks are released on the happy path.
    assert!(!LockRepository::new(&db, TENANT)
        .check("analytics.orders_daily", range.start, range.end)
        .await
        .expect("lock check"));
}

#[tokio::test]
async fn test_reapplying_a_plan_skips_completed_steps() {
    let db = store().await;
    let plan = seed_plan(&db, "2025-06-15").await;
    let sandbox = LocalExecutor::in_memory().await.expect("sandbox");
    let service = ExecutionService::new(&db, &sandbox, TENANT, Environment::Dev);

    let first = service
        .apply_plan(&plan.plan_id, Some("tester"), None, false, None)
        .await
        .expect("first apply");
    assert_eq!(first.len(), 2);

    let second = service
        .apply_plan(&plan.plan_id, Some("tester"), None, false, None)
        .await
        .expect("second apply");
    assert!(second.is_empty());

    // No duplicate run rows were written.
    let rows = RunRepository::new(&db, TENANT)
        .get_by_plan(&plan.plan_id)
        .await
        .expect("runs");
    assert_eq!(rows.len(), 2);
}

#[tokio::test]
async fn test_lock_contention_records_cancelled_run() {
    let db = store().await;
    let plan = seed_plan(&db, "2025-06-15").await;
    let sandbox = LocalExecutor::in_memory().await.expect("sandbox");
    let service = ExecutionService::new(&db, &sandbox, TENANT, Environment::Dev);

    let incremental = plan
        .steps
        .iter()
        .find(|s| s.model == "analytics.orders_daily")
        .expect("incremental step");
    let range = incremental.input_range.expect("range");

    // A competing holder owns the partition-range lock.
    assert!(LockRepository::new(&db, TENANT)
        .acquire(
            "analytics.orders_daily",
            range.start,
            range.end,
            "competitor",
            DEFAULT_LOCK_TTL_SECONDS,
        )
        .await
        .expect("competitor lock"));

    let runs = service
        .apply_plan(&plan.plan_id, Some("tester"), None, false, None)
        .await
        .expect("apply");

    let cancelled = runs
        .iter()
        .find(|r| r.model_name == "analytics.orders_daily")
        .expect("orders run");
    assert_eq!(cancelled.status, RunStatus::Cancelled);
    assert_eq!(
        cancelled.error_message.as_deref(),
        Some("Lock acquisition failed")
    );

    // The contender did not touch the watermark, and the competitor's lock
    // is still held.
    assert!(WatermarkRepository::new(&db, TENANT)
        .get_watermark("analytics.orders_daily")
        .await
        .expect("watermark")
        .is_none());
    assert!(LockRepository::new(&db, TENANT)
        .check("analytics.orders_daily", range.start, range.end)
        .await
        .expect("still locked"));

    // The full-refresh step was unaffected.
    assert!(runs
        .iter()
        .any(|r| r.model_name == "raw.events" && r.status == RunStatus::Success));
}

#[tokio::test]
async fn test_auto_approve_requires_admin() {
    let db = store().await;
    let plan = seed_plan(&db, "2025-06-15").await;
    let sandbox = LocalExecutor::in_memory().await.expect("sandbox");
    let service = ExecutionService::new(&db, &sandbox, TENANT, Environment::Dev);

    let err = service
        .apply_plan(&plan.plan_id, Some("tester"), None, true, Some(Role::Engineer))
        .await
        .expect_err("engineer may not auto-approve");
    assert!(matches!(err, CoreError::Unauthorized(_)));

    let runs = service
        .apply_plan(&plan.plan_id, Some("tester"), None, true, Some(Role::Admin))
        .await
        .expect("admin may auto-approve");
    assert_eq!(runs.len(), 2);
}

#[tokio::test]
async fn test_non_dev_environment_requires_approval() {
    let db = store().await;
    let plan = seed_plan(&db, "2025-06-15").await;
    let sandbox = LocalExecutor::in_memory().await.expect("sandbox");
    let service = ExecutionService::new(&db, &sandbox, TENANT, Environment::Staging);

    let err = service
        .apply_plan(&plan.plan_id, Some("tester"), None, false, None)
        .await
        .expect_err("unapproved plan rejected");
    assert!(matches!(err, CoreError::Unauthorized(_)));

    PlanRepository::new(&db, TENANT)
        .add_approval(&plan.plan_id, "alice", "reviewed")
        .await
        .expect("approve");

    let runs = service
        .apply_plan(&plan.plan_id, Some("tester"), None, false, None)
        .await
        .expect("approved plan executes");
    assert_eq!(runs.len(), 2);
}

#[tokio::test]
async fn test_unknown_plan_is_not_found() {
    let db = store().await;
    let sandbox = LocalExecutor::in_memory().await.expect("sandbox");
    let service = ExecutionService::new(&db, &sandbox, TENANT, Environment::Dev);

    let err = service
        .apply_plan("no-such-plan", None, None, false, None)
        .await
        .expect_err("missing plan");
    assert!(matches!(err, CoreError::NotFound(_)));
}

// ---------------------------------------------------------------------------
// Failure injection backend
// ---------------------------------------------------------------------------

/// Succeeds everywhere except a scripted chunk start date.
struct FlakyBackend {
    fail_on_start: NaiveDate,
}

#[async_trait]
impl ComputeBackend for FlakyBackend {
    async fn execute_step(
        &self,
        _step: &PlanStep,
        _sql: &str,
        params: &ExecutionParams,
    ) -> Result<RunResult, CoreError> {
        let started_at = Utc::now();
        if params.start_date == Some(self.fail_on_start) {
            Ok(RunResult::failure(started_at, "warehouse exploded"))
        } else {
            Ok(RunResult::success(started_at, None))
        }
    }

    async fn lookup_run(&self, _external_run_id: &str) -> Result<Option<RemoteRun>, CoreError> {
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// Backfills
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_single_range_backfill_updates_watermark() {
    let db = store().await;
    seed_plan(&db, "2025-06-15").await;
    let sandbox = LocalExecutor::in_memory().await.expect("sandbox");
    let service = ExecutionService::new(&db, &sandbox, TENANT, Environment::Dev);

    let (plan_id, run) = service
        .backfill(
            "analytics.orders_daily",
            date("2024-02-01"),
            date("2024-02-07"),
            Some("small"),
        )
        .await
        .expect("backfill");

    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(plan_id.len(), 64);
    let watermark = WatermarkRepository::new(&db, TENANT)
        .get_watermark("analytics.orders_daily")
        .await
        .expect("watermark")
        .expect("present");
    assert_eq!(watermark, (date("2024-02-01"), date("2024-02-07")));
}

#[tokio::test]
async fn test_backfill_validates_inputs() {
    let db = store().await;
    seed_plan(&db, "2025-06-15").await;
    let sandbox = LocalExecutor::in_memory().await.expect("sandbox");
    let service = ExecutionService::new(&db, &sandbox, TENANT, Environment::Dev);

    let err = service
        .backfill("ghost.model", date("2024-01-01"), date("2024-01-07"), None)
        .await
        .expect_err("unknown model");
    assert!(matches!(err, CoreError::NotFound(_)));

    let err = service
        .backfill(
            "analytics.orders_daily",
            date("2024-01-07"),
            date("2024-01-01"),
            None,
        )
        .await
        .expect_err("reversed range");
    assert!(matches!(err, CoreError::Validation(_)));

    let err = service
        .chunked_backfill(
            "analytics.orders_daily",
            date("2024-01-01"),
            date("2024-01-07"),
            None,
            0,
        )
        .await
        .expect_err("zero chunk size");
    assert!(matches!(err, CoreError::Validation(_)));
}

#[tokio::test]
async fn test_chunked_backfill_failure_and_resume() {
    let db = store().await;
    seed_plan(&db, "2025-06-15").await;

    // Chunk 2 (starting 2024-01-08) fails on the first attempt.
    let flaky = FlakyBackend {
        fail_on_start: date("2024-01-08"),
    };
    let service = ExecutionService::new(&db, &flaky, TENANT, Environment::Dev);

    let outcome = service
        .chunked_backfill(
            "analytics.orders_daily",
            date("2024-01-01"),
            date("2024-01-21"),
            Some("small"),
            7,
        )
        .await
        .expect("chunked backfill");

    assert_eq!(outcome.status, BackfillStatus::Failed);
    assert_eq!(outcome.completed_chunks, 1);
    assert_eq!(outcome.total_chunks, 3);
    assert_eq!(outcome.error.as_deref(), Some("warehouse exploded"));

    let report = service
        .get_backfill_status(&outcome.backfill_id)
        .await
        .expect("status");
    assert_eq!(report.status, "FAILED");
    assert_eq!(report.completed_through, Some(date("2024-01-07")));
    assert_eq!(report.chunks.len(), 2);
    assert_eq!(report.chunks[0].status, "SUCCESS");
    assert_eq!(report.chunks[1].status, "FAILED");

    // Watermark reflects only the successful chunk.
    let watermark = WatermarkRepository::new(&db, TENANT)
        .get_watermark("analytics.orders_daily")
        .await
        .expect("watermark")
        .expect("present");
    assert_eq!(watermark, (date("2024-01-01"), date("2024-01-07")));

    // Resume with a healthy backend replays chunks 2 and 3 only.
    let sandbox = LocalExecutor::in_memory().await.expect("sandbox");
    let resumed_service = ExecutionService::new(&db, &sandbox, TENANT, Environment::Dev);
    let resumed = resumed_service
        .resume_backfill(&outcome.backfill_id)
        .await
        .expect("resume");

    assert_eq!(resumed.status, BackfillStatus::Completed);
    assert_eq!(resumed.completed_chunks, 3);
    assert_eq!(resumed.total_chunks, 3);
    assert_eq!(resumed.runs.len(), 2);

    // Prior audit rows are preserved; retries add new rows.
    let report = resumed_service
        .get_backfill_status(&outcome.backfill_id)
        .await
        .expect("final status");
    assert_eq!(report.status, "COMPLETED");
    assert_eq!(report.completed_through, Some(date("2024-01-21")));
    assert_eq!(report.chunks.len(), 4);

    let watermark = WatermarkRepository::new(&db, TENANT)
        .get_watermark("analytics.orders_daily")
        .await
        .expect("watermark")
        .expect("present");
    assert_eq!(watermark, (date("2024-01-15"), date("2024-01-21")));

    // Resuming a completed backfill is a conflict.
    let err = resumed_service
        .resume_backfill(&outcome.backfill_id)
        .await
        .expect_err("already completed");
    assert!(matches!(err, CoreError::Conflict(_)));
}

#[tokio::test]
async fn test_rerunning_chunked_backfill_resumes_existing_checkpoint() {
    let db = store().await;
    seed_plan(&db, "2025-06-15").await;

    let flaky = FlakyBackend {
        fail_on_start: date("2024-01-08"),
    };
    let service = ExecutionService::new(&db, &flaky, TENANT, Environment::Dev);
    let first = service
        .chunked_backfill(
            "analytics.orders_daily",
            date("2024-01-01"),
            date("2024-01-14"),
            None,
            7,
        )
        .await
        .expect("first attempt");
    assert_eq!(first.status, BackfillStatus::Failed);

    // The identical command resumes the same checkpoint row instead of
    // starting over.
    let sandbox = LocalExecutor::in_memory().await.expect("sandbox");
    let retry_service = ExecutionService::new(&db, &sandbox, TENANT, Environment::Dev);
    let retried = retry_service
        .chunked_backfill(
            "analytics.orders_daily",
            date("2024-01-01"),
            date("2024-01-14"),
            None,
            7,
        )
        .await
        .expect("rerun resumes");
    assert_eq!(retried.backfill_id, first.backfill_id);
    assert_eq!(retried.status, BackfillStatus::Completed);
    assert_eq!(retried.runs.len(), 1);

    let history = retry_service
        .get_backfill_history("analytics.orders_daily", 10)
        .await
        .expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, "COMPLETED");
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

/// Reports a fixed status for every looked-up run.
struct StubWarehouse {
    reported: Option<RunStatus>,
}

#[async_trait]
impl ComputeBackend for StubWarehouse {
    async fn execute_step(
        &self,
        _step: &PlanStep,
        _sql: &str,
        _params: &ExecutionParams,
    ) -> Result<RunResult, CoreError> {
        Ok(RunResult::success(Utc::now(), None))
    }

    async fn lookup_run(&self, _external_run_id: &str) -> Result<Option<RemoteRun>, CoreError> {
        Ok(self.reported.map(|status| RemoteRun {
            status,
            state_message: None,
        }))
    }
}

#[tokio::test]
async fn test_reconciliation_detects_status_mismatch() {
    use tidemark::exec::ReconciliationService;
    use tidemark::plan::RunRecord;

    let db = store().await;
    let runs = RunRepository::new(&db, TENANT);
    let now = Utc::now();
    let record = RunRecord {
        run_id: "run-ext".to_string(),
        plan_id: "p".to_string(),
        step_id: "s".to_string(),
        model_name: "m".to_string(),
        status: RunStatus::Success,
        started_at: Some(now),
        finished_at: Some(now),
        input_range_start: None,
        input_range_end: None,
        error_message: None,
        cluster_used: None,
        executor_version: "test".to_string(),
        retry_count: 0,
        cost_usd: None,
        external_run_id: Some("stmt-42".to_string()),
    };
    runs.create(&record).await.expect("run");

    // Warehouse claims the run failed.
    let warehouse = StubWarehouse {
        reported: Some(RunStatus::Failed),
    };
    let service = ReconciliationService::new(&db, &warehouse, TENANT);

    let check = service.reconcile_run("run-ext").await.expect("reconcile");
    assert!(!check.resolved);
    assert_eq!(check.discrepancy_type.as_deref(), Some("status_mismatch"));
    assert_eq!(check.warehouse_status.as_deref(), Some("FAILED"));

    assert_eq!(service.unresolved(10).await.expect("unresolved").len(), 1);
    service
        .resolve(&check.id, "operator", "confirmed duplicate submission")
        .await
        .expect("resolve");
    assert!(service.unresolved(10).await.expect("none left").is_empty());
}

#[tokio::test]
async fn test_reconciliation_detects_missing_run() {
    use tidemark::exec::ReconciliationService;
    use tidemark::plan::RunRecord;

    let db = store().await;
    let runs = RunRepository::new(&db, TENANT);
    let now = Utc::now();
    let record = RunRecord {
        run_id: "run-lost".to_string(),
        plan_id: "p".to_string(),
        step_id: "s".to_string(),
        model_name: "m".to_string(),
        status: RunStatus::Success,
        started_at: Some(now),
        finished_at: Some(now),
        input_range_start: None,
        input_range_end: None,
        error_message: None,
        cluster_used: None,
        executor_version: "test".to_string(),
        retry_count: 0,
        cost_usd: None,
        external_run_id: Some("stmt-404".to_string()),
    };
    runs.create(&record).await.expect("run");

    let warehouse = StubWarehouse { reported: None };
    let service = ReconciliationService::new(&db, &warehouse, TENANT);

    let check = service.reconcile_run("run-lost").await.expect("reconcile");
    assert!(!check.resolved);
    assert_eq!(
        check.discrepancy_type.as_deref(),
        Some("missing_in_warehouse")
    );

    let checks = service.reconcile_recent(10).await.expect("recent");
    assert_eq!(checks.len(), 1);

    service.set_schedule("hourly", "0 * * * *", true).await.expect("schedule");
    service.touch_schedule("hourly").await.expect("touch");
}
