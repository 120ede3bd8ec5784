//! Full pipeline end-to-end test:
//! loader -> DAG -> snapshot -> diff -> planner -> serializer.
//!
//! Uses a temporary directory for all file operations; no database or
//! compute backend is required.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tempfile::TempDir;

use tidemark::diff::{compute_structural_diff, DiffResult};
use tidemark::graph::build_dag;
use tidemark::model::definition::{ModelDefinition, ModelKind};
use tidemark::model::loader::load_models_from_directory;
use tidemark::plan::planner::{generate_plan, PlannerConfig, PlannerInputs};
use tidemark::plan::serializer::{deserialize_plan, save_plan_file, serialize_plan};
use tidemark::plan::{Plan, RunType};
use tidemark::snapshot::Snapshot;

const RAW_EVENTS_SQL: &str = "\
-- name: raw.events
-- kind: FULL_REFRESH
-- materialization: TABLE
-- owner: data-platform
-- tags: raw, events

SELECT
    event_id,
    user_id,
    event_type,
    event_timestamp,
    amount
FROM source_system.raw_events
WHERE _ingested_at >= '{{ start_date }}'
    AND _ingested_at < '{{ end_date }}'
";

const STAGING_EVENTS_SQL: &str = "\
-- name: staging.events_clean
-- kind: FULL_REFRESH
-- materialization: TABLE
-- owner: data-platform
-- tags: staging, events
-- dependencies: raw.events

SELECT
    event_id,
    user_id,
    LOWER(event_type) AS event_type,
    event_timestamp,
    COALESCE(amount, 0) AS amount
FROM {{ ref('raw.events') }}
WHERE event_id IS NOT NULL
";

const ORDERS_DAILY_SQL: &str = "\
-- name: analytics.orders_daily
-- kind: INCREMENTAL_BY_TIME_RANGE
-- materialization: TABLE
-- time_column: order_date
-- owner: analytics
-- tags: analytics, orders
-- dependencies: staging.events_clean

SELECT
    CAST(event_timestamp AS DATE) AS order_date,
    COUNT(DISTINCT event_id) AS total_orders,
    COUNT(DISTINCT user_id) AS unique_customers,
    SUM(amount) AS total_revenue
FROM {{ ref('staging.events_clean') }}
WHERE event_type = 'purchase'
GROUP BY CAST(event_timestamp AS DATE)
";

const USER_METRICS_SQL: &str = "\
-- name: analytics.user_metrics
-- kind: FULL_REFRESH
-- materialization: TABLE
-- owner: analytics
-- tags: analytics, users
-- dependencies: staging.events_clean

SELECT
    user_id,
    COUNT(DISTINCT event_id) AS total_events,
    SUM(CASE WHEN event_type = 'purchase' THEN amount ELSE 0 END) AS lifetime_value,
    MIN(event_timestamp) AS first_activity,
    MAX(event_timestamp) AS last_activity
FROM {{ ref('staging.events_clean') }}
GROUP BY user_id
";

const REVENUE_SUMMARY_SQL: &str = "\
-- name: analytics.revenue_summary
-- kind: FULL_REFRESH
-- materialization: TABLE
-- owner: analytics
-- tags: analytics, executive
-- dependencies: analytics.orders_daily, analytics.user_metrics

SELECT
    o.order_date,
    o.total_orders,
    o.total_revenue,
    um.total_users,
    o.total_revenue / um.total_users AS revenue_per_user
FROM {{ ref('analytics.orders_daily') }} o
CROSS JOIN (
    SELECT COUNT(DISTINCT user_id) AS total_users
    FROM {{ ref('analytics.user_metrics') }}
) um
";

fn write_models(dir: &Path) {
    let files = [
        ("raw.events.sql", RAW_EVENTS_SQL),
        ("staging.events_clean.sql", STAGING_EVENTS_SQL),
        ("analytics.orders_daily.sql", ORDERS_DAILY_SQL),
        ("analytics.user_metrics.sql", USER_METRICS_SQL),
        ("analytics.revenue_summary.sql", REVENUE_SUMMARY_SQL),
    ];
    for (name, content) in files {
        std::fs::write(dir.join(name), content).expect("write model file");
    }
}

fn models_dir() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().expect("tempdir");
    let dir = tmp.path().join("models");
    std::fs::create_dir(&dir).expect("mkdir");
    write_models(&dir);
    (tmp, dir)
}

fn load(dir: &Path) -> Vec<ModelDefinition> {
    load_models_from_directory(dir).expect("load models")
}

fn hash_map(models: &[ModelDefinition]) -> BTreeMap<String, String> {
    models
        .iter()
        .map(|m| (m.name.clone(), m.content_hash.clone()))
        .collect()
}

fn date(s: &str) -> NaiveDate {
    s.parse().expect("date")
}

fn plan_from(
    models: &[ModelDefinition],
    diff: &DiffResult,
    watermarks: &BTreeMap<String, (NaiveDate, NaiveDate)>,
    as_of: &str,
) -> Plan {
    let dag = build_dag(models).expect("dag");
    let model_map: BTreeMap<String, ModelDefinition> =
        models.iter().cloned().map(|m| (m.name.clone(), m)).collect();
    generate_plan(&PlannerInputs {
        models: &model_map,
        diff,
        dag: &dag,
        watermarks,
        run_stats: &BTreeMap::new(),
        contract_results: &BTreeMap::new(),
        config: PlannerConfig::default(),
        base: "snap-base",
        target: "snap-target",
        as_of_date: Some(date(as_of)),
    })
    .expect("plan")
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

#[test]
fn test_all_models_load_with_expected_metadata() {
    let (_tmp, dir) = models_dir();
    let models = load(&dir);
    assert_eq!(models.len(), 5);

    let orders = models
        .iter()
        .find(|m| m.name == "analytics.orders_daily")
        .expect("orders model");
    assert_eq!(orders.kind, ModelKind::IncrementalByTimeRange);
    assert_eq!(orders.time_column.as_deref(), Some("order_date"));
    assert_eq!(orders.dependencies, vec!["staging.events_clean"]);

    // ref() macros resolved; discovered deps match declared ones.
    assert!(orders.clean_sql.contains("FROM staging.events_clean"));
    assert!(!orders.clean_sql.contains("ref("));

    let raw = models.iter().find(|m| m.name == "raw.events").expect("raw");
    // source_system.raw_events is not a model, so raw.events has no deps.
    assert!(raw.dependencies.is_empty());
}

#[test]
fn test_content_hashes_are_stable_across_reloads() {
    let (_tmp, dir) = models_dir();
    let first = hash_map(&load(&dir));
    let second = hash_map(&load(&dir));
    assert_eq!(first, second);
}

#[test]
fn test_cosmetic_edit_keeps_content_hash() {
    let (_tmp, dir) = models_dir();
    let before = hash_map(&load(&dir));

    // Reformat and add comments; semantics unchanged.
    let cosmetic = STAGING_EVENTS_SQL.replace(
        "WHERE event_id IS NOT NULL",
        "-- keep only rows with an id\nWHERE    event_id   IS NOT NULL",
    );
    std::fs::write(dir.join("staging.events_clean.sql"), cosmetic).expect("rewrite");

    let after = hash_map(&load(&dir));
    assert_eq!(before, after);
}

// ---------------------------------------------------------------------------
// DAG
// ---------------------------------------------------------------------------

#[test]
fn test_dag_structure_and_depths() {
    let (_tmp, dir) = models_dir();
    let models = load(&dir);
    let dag = build_dag(&models).expect("dag");

    assert_eq!(dag.len(), 5);
    assert_eq!(dag.depth("raw.events"), Some(0));
    assert_eq!(dag.depth("staging.events_clean"), Some(1));
    assert_eq!(dag.depth("analytics.orders_daily"), Some(2));
    assert_eq!(dag.depth("analytics.user_metrics"), Some(2));
    assert_eq!(dag.depth("analytics.revenue_summary"), Some(3));

    let downstream = dag.downstream_closure("raw.events");
    assert_eq!(downstream.len(), 4);
}

// ---------------------------------------------------------------------------
// Snapshot + diff
// ---------------------------------------------------------------------------

#[test]
fn test_identical_snapshots_produce_empty_diff_and_empty_plan() {
    let (_tmp, dir) = models_dir();
    let models = load(&dir);
    let snapshot = Snapshot::from_models("default", "test", &models);
    assert_eq!(snapshot.len(), 5);

    let diff = compute_structural_diff(&snapshot.hash_map(), &snapshot.hash_map());
    assert!(diff.is_empty());

    let plan = plan_from(&models, &diff, &BTreeMap::new(), "2025-06-15");
    assert_eq!(plan.summary.total_steps, 0);
    assert_eq!(plan.summary.estimated_cost_usd, 0.0);
    assert!(plan.summary.models_changed.is_empty());
}

#[test]
fn test_modified_added_and_removed_models_are_detected() {
    let (_tmp, dir) = models_dir();
    let models = load(&dir);
    let base = hash_map(&models);

    // Modify one model, add one, remove one.
    let mut target = base.clone();
    target.insert("staging.events_clean".to_string(), "new-hash".to_string());
    target.insert("analytics.cohorts".to_string(), "h-new".to_string());
    target.remove("analytics.user_metrics");

    let diff = compute_structural_diff(&base, &target);
    assert_eq!(diff.modified_models, vec!["staging.events_clean"]);
    assert_eq!(diff.added_models, vec!["analytics.cohorts"]);
    assert_eq!(diff.removed_models, vec!["analytics.user_metrics"]);
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

#[test]
fn test_leaf_change_produces_single_full_refresh_step() {
    let (_tmp, dir) = models_dir();
    let models = load(&dir);
    let base = hash_map(&models);
    let mut target = base.clone();
    target.insert(
        "analytics.revenue_summary".to_string(),
        "modified".to_string(),
    );

    let diff = compute_structural_diff(&base, &target);
    let plan = plan_from(&models, &diff, &BTreeMap::new(), "2025-06-15");

    assert_eq!(plan.summary.total_steps, 1);
    assert_eq!(plan.steps[0].model, "analytics.revenue_summary");
    assert_eq!(plan.steps[0].run_type, RunType::FullRefresh);
    assert!(plan.steps[0].depends_on.is_empty());
}

#[test]
fn test_root_change_cascades_to_every_downstream_model() {
    let (_tmp, dir) = models_dir();
    let models = load(&dir);
    let base = hash_map(&models);
    let mut target = base.clone();
    target.insert("raw.events".to_string(), "modified".to_string());

    let diff = compute_structural_diff(&base, &target);
    assert_eq!(diff.modified_models, vec!["raw.events"]);

    let plan = plan_from(&models, &diff, &BTreeMap::new(), "2025-06-15");
    assert_eq!(plan.summary.total_steps, 5);

    let by_model: BTreeMap<&str, _> = plan
        .steps
        .iter()
        .map(|s| (s.model.as_str(), s))
        .collect();

    let orders = by_model["analytics.orders_daily"];
    assert_eq!(orders.run_type, RunType::Incremental);
    assert_eq!(orders.input_range.expect("range").end, date("2025-06-15"));

    assert!(
        by_model["analytics.revenue_summary"].parallel_group
            > by_model["analytics.orders_daily"].parallel_group
    );
    assert_eq!(
        by_model["analytics.orders_daily"].parallel_group,
        by_model["analytics.user_metrics"].parallel_group
    );

    // Every dependency edge points at a step in this plan with a strictly
    // smaller parallel group.
    for step in &plan.steps {
        for dep in &step.depends_on {
            let upstream = plan.step(dep).expect("dependency present in plan");
            assert!(upstream.parallel_group < step.parallel_group);
        }
    }
}

#[test]
fn test_watermark_narrows_incremental_range() {
    let (_tmp, dir) = models_dir();
    let models = load(&dir);
    let base = hash_map(&models);
    let mut target = base.clone();
    target.insert("staging.events_clean".to_string(), "modified".to_string());
    let diff = compute_structural_diff(&base, &target);

    let mut watermarks = BTreeMap::new();
    watermarks.insert(
        "analytics.orders_daily".to_string(),
        (date("2025-05-01"), date("2025-06-10")),
    );

    let plan = plan_from(&models, &diff, &watermarks, "2025-06-15");
    let orders = plan
        .steps
        .iter()
        .find(|s| s.model == "analytics.orders_daily")
        .expect("orders step");
    let range = orders.input_range.expect("range");
    assert_eq!(range.start, date("2025-06-10"));
    assert_eq!(range.end, date("2025-06-15"));
}

#[test]
fn test_plan_generation_is_deterministic() {
    let (_tmp, dir) = models_dir();
    let models = load(&dir);
    let base = hash_map(&models);
    let mut target = base.clone();
    target.insert("raw.events".to_string(), "modified".to_string());
    let diff = compute_structural_diff(&base, &target);

    let first = plan_from(&models, &diff, &BTreeMap::new(), "2025-06-15");
    let second = plan_from(&models, &diff, &BTreeMap::new(), "2025-06-15");

    assert_eq!(first.plan_id, second.plan_id);
    assert_eq!(
        first.steps.iter().map(|s| &s.step_id).collect::<Vec<_>>(),
        second.steps.iter().map(|s| &s.step_id).collect::<Vec<_>>()
    );
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

#[test]
fn test_serialize_deserialize_round_trip() {
    let (_tmp, dir) = models_dir();
    let models = load(&dir);
    let base = hash_map(&models);
    let mut target = base.clone();
    target.insert("raw.events".to_string(), "modified".to_string());
    let diff = compute_structural_diff(&base, &target);
    let plan = plan_from(&models, &diff, &BTreeMap::new(), "2025-06-15");

    let serialized = serialize_plan(&plan).expect("serialize");
    let restored = deserialize_plan(&serialized).expect("deserialize");

    assert_eq!(restored.plan_id, plan.plan_id);
    assert_eq!(restored.steps.len(), plan.steps.len());
    for (original, roundtripped) in plan.steps.iter().zip(&restored.steps) {
        assert_eq!(original.step_id, roundtripped.step_id);
        assert_eq!(original.parallel_group, roundtripped.parallel_group);
        assert_eq!(original.input_range, roundtripped.input_range);
    }

    // Double serialization is byte-identical.
    assert_eq!(serialized, serialize_plan(&restored).expect("reserialize"));
}

#[test]
fn test_plan_file_save_and_reload() {
    let (_tmp, dir) = models_dir();
    let models = load(&dir);
    let base = hash_map(&models);
    let mut target = base.clone();
    target.insert(
        "analytics.revenue_summary".to_string(),
        "modified".to_string(),
    );
    let diff = compute_structural_diff(&base, &target);
    let plan = plan_from(&models, &diff, &BTreeMap::new(), "2025-06-15");

    let out = TempDir::new().expect("tempdir");
    let path = out.path().join("plan.json");
    save_plan_file(&plan, &path).expect("save");
    let restored = tidemark::plan::serializer::load_plan_file(&path).expect("load");
    assert_eq!(restored.plan_id, plan.plan_id);
    assert_eq!(restored.summary.total_steps, 1);
}
