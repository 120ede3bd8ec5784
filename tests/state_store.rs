//! State-store behaviour over in-memory SQLite: tenant scoping, watermark
//! upserts, atomic lock acquisition with TTL expiry, plan approvals, and the
//! hash-chained audit log.

use chrono::{NaiveDate, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};

use tidemark::lock::{LockManager, DEFAULT_LOCK_TTL_SECONDS};
use tidemark::model::definition::{Materialization, ModelDefinition, ModelKind};
use tidemark::plan::{RunRecord, RunStatus};
use tidemark::state::audit::AuditRepository;
use tidemark::state::backfill::{BackfillAuditRepository, BackfillCheckpointRepository};
use tidemark::state::repository::{
    CredentialRepository, LockRepository, ModelRepository, PlanRepository,
    ReconciliationRepository, RunRepository, TelemetryRecord, TelemetryRepository,
    WatermarkRepository,
};
use tidemark::state::tables::audit_log;
use tidemark::state::{connect, init_schema};

async fn store() -> DatabaseConnection {
    let db = connect("sqlite::memory:").await.expect("connect");
    init_schema(&db).await.expect("schema");
    db
}

fn date(s: &str) -> NaiveDate {
    s.parse().expect("date")
}

fn sample_model(name: &str) -> ModelDefinition {
    ModelDefinition {
        name: name.to_string(),
        kind: ModelKind::IncrementalByTimeRange,
        materialization: Materialization::Table,
        time_column: Some("event_date".to_string()),
        unique_key: None,
        partition_by: None,
        incremental_strategy: None,
        owner: Some("analytics".to_string()),
        tags: vec!["analytics".to_string()],
        raw_sql: "SELECT 1 AS one".to_string(),
        clean_sql: "SELECT 1 AS one".to_string(),
        content_hash: format!("hash-{name}"),
        dependencies: Vec::new(),
        contract_mode: Default::default(),
        contract_columns: Vec::new(),
    }
}

fn run_record(plan_id: &str, step_id: &str, model: &str, status: RunStatus) -> RunRecord {
    let now = Utc::now();
    RunRecord {
        run_id: uuid::Uuid::new_v4().to_string(),
        plan_id: plan_id.to_string(),
        step_id: step_id.to_string(),
        model_name: model.to_string(),
        status,
        started_at: Some(now - chrono::Duration::seconds(10)),
        finished_at: Some(now),
        input_range_start: None,
        input_range_end: None,
        error_message: None,
        cluster_used: Some("small".to_string()),
        executor_version: "test".to_string(),
        retry_count: 0,
        cost_usd: Some(0.5),
        external_run_id: None,
    }
}

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_model_register_and_fetch() {
    let db = store().await;
    let repo = ModelRepository::new(&db, "default");

    let version_id = repo.register(&sample_model("analytics.orders")).await.expect("register");
    assert_eq!(version_id.len(), 64);

    let row = repo
        .get("analytics.orders")
        .await
        .expect("get")
        .expect("present");
    assert_eq!(row.kind, "INCREMENTAL_BY_TIME_RANGE");
    assert_eq!(row.current_version.as_deref(), Some(version_id.as_str()));

    let sql = repo.latest_sql("analytics.orders").await.expect("sql");
    assert_eq!(sql.as_deref(), Some("SELECT 1 AS one"));
}

#[tokio::test]
async fn test_model_reregistration_is_idempotent_per_content() {
    let db = store().await;
    let repo = ModelRepository::new(&db, "default");
    let first = repo.register(&sample_model("analytics.orders")).await.expect("register");
    let second = repo.register(&sample_model("analytics.orders")).await.expect("register again");
    assert_eq!(first, second);
    assert_eq!(repo.list_all().await.expect("list").len(), 1);
}

#[tokio::test]
async fn test_models_are_tenant_scoped() {
    let db = store().await;
    ModelRepository::new(&db, "acme")
        .register(&sample_model("analytics.orders"))
        .await
        .expect("register");

    let other = ModelRepository::new(&db, "globex")
        .get("analytics.orders")
        .await
        .expect("get");
    assert!(other.is_none());
}

// ---------------------------------------------------------------------------
// Watermarks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_watermark_upsert_and_latest() {
    let db = store().await;
    let repo = WatermarkRepository::new(&db, "default");

    assert!(repo.get_watermark("m").await.expect("empty").is_none());

    repo.update_watermark("m", date("2025-01-01"), date("2025-03-31"), Some(100))
        .await
        .expect("first");
    repo.update_watermark("m", date("2025-04-01"), date("2025-06-10"), None)
        .await
        .expect("second");

    let latest = repo.get_watermark("m").await.expect("get").expect("present");
    assert_eq!(latest, (date("2025-04-01"), date("2025-06-10")));

    // Re-upserting the same range refreshes rather than duplicating.
    repo.update_watermark("m", date("2025-04-01"), date("2025-06-10"), Some(5))
        .await
        .expect("upsert");
    assert_eq!(repo.history("m").await.expect("history").len(), 2);
}

// ---------------------------------------------------------------------------
// Locks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_lock_acquire_is_exclusive_until_released() {
    let db = store().await;
    let repo = LockRepository::new(&db, "default");
    let (start, end) = (date("2024-01-01"), date("2024-01-07"));

    assert!(repo
        .acquire("m", start, end, "first", DEFAULT_LOCK_TTL_SECONDS)
        .await
        .expect("acquire"));
    assert!(!repo
        .acquire("m", start, end, "second", DEFAULT_LOCK_TTL_SECONDS)
        .await
        .expect("contended acquire"));
    assert!(repo.check("m", start, end).await.expect("check"));

    repo.release("m", start, end).await.expect("release");
    assert!(!repo.check("m", start, end).await.expect("check after release"));
    assert!(repo
        .acquire("m", start, end, "second", DEFAULT_LOCK_TTL_SECONDS)
        .await
        .expect("reacquire"));
}

#[tokio::test]
async fn test_expired_lock_can_be_reacquired() {
    let db = store().await;
    let repo = LockRepository::new(&db, "default");
    let (start, end) = (date("2024-01-01"), date("2024-01-07"));

    // A TTL that has already elapsed leaves the lock immediately expired.
    assert!(repo.acquire("m", start, end, "first", -5).await.expect("acquire"));
    assert!(!repo.check("m", start, end).await.expect("expired check"));
    assert!(repo
        .acquire("m", start, end, "second", DEFAULT_LOCK_TTL_SECONDS)
        .await
        .expect("reacquire after expiry"));

    let row = repo.find("m", start, end).await.expect("find").expect("row");
    assert_eq!(row.locked_by, "second");
}

#[tokio::test]
async fn test_expire_stale_reaps_only_expired_rows() {
    let db = store().await;
    let repo = LockRepository::new(&db, "default");

    repo.acquire("a", date("2024-01-01"), date("2024-01-02"), "x", -5)
        .await
        .expect("expired lock");
    repo.acquire("b", date("2024-01-01"), date("2024-01-02"), "x", DEFAULT_LOCK_TTL_SECONDS)
        .await
        .expect("live lock");

    let reaped = repo.expire_stale().await.expect("reap");
    assert_eq!(reaped, 1);
    assert!(repo
        .check("b", date("2024-01-01"), date("2024-01-02"))
        .await
        .expect("live survives"));
}

#[tokio::test]
async fn test_force_release_writes_audited_owner() {
    let db = store().await;
    let manager = LockManager::new(&db, "default");
    let (start, end) = (date("2024-01-01"), date("2024-01-07"));

    manager
        .acquire("analytics.orders", start, end, "stuck-worker", DEFAULT_LOCK_TTL_SECONDS)
        .await
        .expect("acquire");

    let released = manager
        .force_release("analytics.orders", start, end, "operator", "worker crashed")
        .await
        .expect("force release");
    assert!(released);
    assert!(!manager.check("analytics.orders", start, end).await.expect("check"));

    // Force-releasing again is a no-op.
    assert!(!manager
        .force_release("analytics.orders", start, end, "operator", "again")
        .await
        .expect("second force release"));

    let audit = AuditRepository::new(&db, "default");
    let entries = audit
        .query(Some("lock.force_release"), None, None, 10)
        .await
        .expect("audit query");
    assert_eq!(entries.len(), 1);
    let metadata = entries[0].metadata.as_ref().expect("metadata");
    assert_eq!(metadata["original_owner"], "stuck-worker");
    assert_eq!(metadata["reason"], "worker crashed");
}

// ---------------------------------------------------------------------------
// Audit chain
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_audit_chain_links_and_verifies() {
    let db = store().await;
    let audit = AuditRepository::new(&db, "default");

    for index in 0..5 {
        audit
            .log(
                "alice",
                "plan.apply",
                Some("plan"),
                Some(&format!("plan-{index}")),
                Some(serde_json::json!({"index": index})),
            )
            .await
            .expect("log");
    }

    let (valid, checked) = audit.verify_chain(100).await.expect("verify");
    assert!(valid);
    assert_eq!(checked, 5);
}

#[tokio::test]
async fn test_audit_chains_are_per_tenant() {
    let db = store().await;
    AuditRepository::new(&db, "acme")
        .log("a", "x", None, None, None)
        .await
        .expect("log acme");
    AuditRepository::new(&db, "globex")
        .log("b", "y", None, None, None)
        .await
        .expect("log globex");

    let (valid_acme, checked_acme) = AuditRepository::new(&db, "acme")
        .verify_chain(10)
        .await
        .expect("verify acme");
    assert!(valid_acme);
    assert_eq!(checked_acme, 1);
}

#[tokio::test]
async fn test_tampered_audit_entry_breaks_the_chain() {
    let db = store().await;
    let audit = AuditRepository::new(&db, "default");

    for index in 0..4 {
        audit
            .log("alice", "plan.apply", Some("plan"), Some(&format!("p{index}")), None)
            .await
            .expect("log");
    }

    // Mutate the second entry's content behind the repository's back.
    let victim = audit_log::Entity::find()
        .filter(audit_log::Column::TenantId.eq("default"))
        .filter(audit_log::Column::EntityId.eq("p1"))
        .one(&db)
        .await
        .expect("query")
        .expect("row");
    audit_log::Entity::update_many()
        .col_expr(audit_log::Column::Actor, Expr::value("mallory"))
        .filter(audit_log::Column::Id.eq(victim.id))
        .exec(&db)
        .await
        .expect("tamper");

    let (valid, checked) = audit.verify_chain(100).await.expect("verify");
    assert!(!valid);
    assert!(checked <= 1);
}

// ---------------------------------------------------------------------------
// Plans + approvals
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_plan_save_and_approvals_append() {
    let db = store().await;
    let repo = PlanRepository::new(&db, "default");

    repo.save("plan-1", "base", "target", serde_json::json!({"steps": []}))
        .await
        .expect("save");

    assert!(repo.approvals("plan-1").await.expect("empty").is_empty());

    repo.add_approval("plan-1", "alice", "lgtm").await.expect("first approval");
    repo.add_approval("plan-1", "bob", "ship it").await.expect("second approval");

    let approvals = repo.approvals("plan-1").await.expect("approvals");
    assert_eq!(approvals.len(), 2);
    assert_eq!(approvals[0].user, "alice");
    assert_eq!(approvals[1].comment, "ship it");
}

#[tokio::test]
async fn test_approving_unknown_plan_is_not_found() {
    let db = store().await;
    let repo = PlanRepository::new(&db, "default");
    let err = repo.add_approval("ghost", "alice", "??").await.expect_err("missing");
    assert!(err.to_string().contains("not found"));
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_run_stats_average_recent_successes() {
    let db = store().await;
    let repo = RunRepository::new(&db, "default");

    for index in 0..3 {
        repo.create(&run_record("p", &format!("s{index}"), "m", RunStatus::Success))
            .await
            .expect("create");
    }
    repo.create(&run_record("p", "s-failed", "m", RunStatus::Failed))
        .await
        .expect("failed run");

    let stats = repo.historical_stats("m").await.expect("stats");
    assert!((stats.avg_runtime_seconds - 10.0).abs() < 0.5);
    assert!((stats.avg_cost_usd - 0.5).abs() < f64::EPSILON);

    assert_eq!(
        repo.count_by_status("m", RunStatus::Success).await.expect("count"),
        3
    );
    assert_eq!(
        repo.count_by_status("m", RunStatus::Failed).await.expect("count"),
        1
    );
}

#[tokio::test]
async fn test_update_status_and_cost() {
    let db = store().await;
    let repo = RunRepository::new(&db, "default");
    let record = run_record("p", "s", "m", RunStatus::Running);
    repo.create(&record).await.expect("create");

    repo.update_status(&record.run_id, RunStatus::Failed, Some("boom"))
        .await
        .expect("status");
    repo.update_cost(&record.run_id, 1.25).await.expect("cost");

    let row = repo.get(&record.run_id).await.expect("get").expect("row");
    assert_eq!(row.status, "FAILED");
    assert_eq!(row.error_message.as_deref(), Some("boom"));
    assert_eq!(row.cost_usd, Some(1.25));
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_telemetry_record_and_cleanup() {
    let db = store().await;
    let repo = TelemetryRepository::new(&db, "default");

    repo.record(&TelemetryRecord {
        run_id: "r1".to_string(),
        model_name: "m".to_string(),
        runtime_seconds: 12.5,
        shuffle_bytes: 1024,
        input_rows: 10,
        output_rows: 9,
        partition_count: 1,
    })
    .await
    .expect("record");

    assert_eq!(repo.get_for_run("r1").await.expect("for run").len(), 1);
    assert_eq!(repo.get_for_model("m", 10).await.expect("for model").len(), 1);

    // Fresh rows survive the retention sweep.
    assert_eq!(repo.cleanup_old(30).await.expect("cleanup"), 0);
}

// ---------------------------------------------------------------------------
// Backfill bookkeeping
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_checkpoint_lifecycle() {
    let db = store().await;
    let checkpoints = BackfillCheckpointRepository::new(&db, "default");
    let audit = BackfillAuditRepository::new(&db, "default");

    checkpoints
        .create(
            "bf-1",
            "m",
            date("2024-01-01"),
            date("2024-01-21"),
            7,
            3,
            Some("small"),
            Some("plan-1"),
        )
        .await
        .expect("create");

    checkpoints
        .update_progress("bf-1", date("2024-01-07"), 1)
        .await
        .expect("progress");
    checkpoints.mark_failed("bf-1", "chunk 2 failed").await.expect("fail");

    let row = checkpoints.get("bf-1").await.expect("get").expect("row");
    assert_eq!(row.status, "FAILED");
    assert_eq!(row.completed_chunks, 1);
    assert_eq!(row.completed_through, Some(date("2024-01-07")));
    assert_eq!(row.error_message.as_deref(), Some("chunk 2 failed"));

    let resumable = checkpoints.resumable(Some("m")).await.expect("resumable");
    assert_eq!(resumable.len(), 1);

    audit
        .record_chunk(
            "bf-1",
            "m",
            date("2024-01-01"),
            date("2024-01-07"),
            "SUCCESS",
            Some("run-1"),
            None,
            Some(4.2),
        )
        .await
        .expect("chunk audit");
    assert_eq!(audit.get_for_backfill("bf-1").await.expect("trail").len(), 1);
    assert_eq!(audit.get_history("m", 10).await.expect("history").len(), 1);
}

// ---------------------------------------------------------------------------
// Reconciliation + credentials
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_reconciliation_record_and_resolve() {
    let db = store().await;
    let repo = ReconciliationRepository::new(&db, "default");

    let agreeing = repo
        .record_check("run-1", Some("m"), "SUCCESS", Some("SUCCESS"), None)
        .await
        .expect("agreeing check");
    assert!(agreeing.resolved);

    let disagreeing = repo
        .record_check("run-2", Some("m"), "SUCCESS", Some("FAILED"), Some("status_mismatch"))
        .await
        .expect("disagreeing check");
    assert!(!disagreeing.resolved);

    let unresolved = repo.get_unresolved(10).await.expect("unresolved");
    assert_eq!(unresolved.len(), 1);

    assert!(repo
        .resolve(&disagreeing.id, "operator", "warehouse retried out of band")
        .await
        .expect("resolve"));
    assert!(repo.get_unresolved(10).await.expect("now empty").is_empty());

    let stats = repo.stats().await.expect("stats");
    assert_eq!(stats.total_checks, 2);
    assert_eq!(stats.unresolved, 0);
}

#[tokio::test]
async fn test_credentials_store_only_ciphertext() {
    let db = store().await;
    let repo = CredentialRepository::new(&db, "default");

    repo.store("warehouse_token", "enc:v1:abcdef").await.expect("store");
    repo.store("warehouse_token", "enc:v1:rotated").await.expect("rotate");

    assert_eq!(
        repo.get("warehouse_token").await.expect("get").as_deref(),
        Some("enc:v1:rotated")
    );
    assert_eq!(repo.list_names().await.expect("names"), vec!["warehouse_token"]);
    assert!(repo.delete("warehouse_token").await.expect("delete"));
    assert!(repo.get("warehouse_token").await.expect("gone").is_none());
}
