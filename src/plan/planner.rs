//! DAG-aware interval planner.
//!
//! Turns a structural diff into a totally ordered set of steps. The affected
//! set is the added and modified models plus everything transitively
//! downstream of them plus any model carrying a contract violation; removed
//! models generate no steps. Incremental steps get a date range computed
//! from the model's watermark, falling back to a configured lookback window.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{Duration, NaiveDate, Utc};

use crate::diff::DiffResult;
use crate::errors::CoreError;
use crate::graph::ModelDag;
use crate::model::contract::ContractViolation;
use crate::model::definition::ModelDefinition;
use crate::plan::{DateRange, Plan, PlanStep, PlanSummary, RunType};

/// Planner tuning knobs.
#[derive(Clone, Copy, Debug)]
pub struct PlannerConfig {
    /// Days of history an incremental model reprocesses when it has no
    /// watermark yet.
    pub default_lookback_days: i64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            default_lookback_days: 30,
        }
    }
}

/// Historical execution statistics for one model, used for advisory
/// estimates only.
#[derive(Clone, Copy, Debug, Default)]
pub struct ModelRunStats {
    pub avg_runtime_seconds: f64,
    pub avg_cost_usd: f64,
}

/// Everything the planner consumes.
pub struct PlannerInputs<'a> {
    pub models: &'a BTreeMap<String, ModelDefinition>,
    pub diff: &'a DiffResult,
    pub dag: &'a ModelDag,
    /// Per-model `(partition_start, partition_end)` high-water marks.
    pub watermarks: &'a BTreeMap<String, (NaiveDate, NaiveDate)>,
    pub run_stats: &'a BTreeMap<String, ModelRunStats>,
    pub contract_results: &'a BTreeMap<String, Vec<ContractViolation>>,
    pub config: PlannerConfig,
    pub base: &'a str,
    pub target: &'a str,
    /// Planning date; defaults to today when `None`.
    pub as_of_date: Option<NaiveDate>,
}

/// Generate a deterministic plan from a diff. Running this twice with the
/// same inputs yields an identical plan id and step sequence.
pub fn generate_plan(inputs: &PlannerInputs<'_>) -> Result<Plan, CoreError> {
    let as_of_date = inputs
        .as_of_date
        .unwrap_or_else(|| Utc::now().date_naive());

    // Affected set: changed models, their transitive consumers, and models
    // with contract findings.
    let mut affected: BTreeSet<String> = BTreeSet::new();
    let changed: BTreeSet<String> = inputs
        .diff
        .added_models
        .iter()
        .chain(inputs.diff.modified_models.iter())
        .cloned()
        .collect();
    for name in &changed {
        if !inputs.dag.contains(name) {
            return Err(CoreError::Validation(format!(
                "Changed model `{name}` is not present in the dependency graph"
            )));
        }
        affected.insert(name.clone());
        affected.extend(inputs.dag.downstream_closure(name));
    }
    for (name, violations) in inputs.contract_results {
        if !violations.is_empty() && inputs.dag.contains(name) {
            affected.insert(name.clone());
        }
    }

    let added: BTreeSet<&String> = inputs.diff.added_models.iter().collect();
    let modified: BTreeSet<&String> = inputs.diff.modified_models.iter().collect();

    // Steps in topological order; a step id per affected model first, then
    // dependency edges between affected models only.
    let mut step_ids: BTreeMap<String, String> = BTreeMap::new();
    let mut steps = Vec::new();

    for model_name in inputs.dag.topological_order() {
        if !affected.contains(&model_name) {
            continue;
        }
        let Some(model) = inputs.models.get(&model_name) else {
            return Err(CoreError::Validation(format!(
                "Affected model `{model_name}` has no definition"
            )));
        };

        let run_type = if model.is_incremental() {
            RunType::Incremental
        } else {
            RunType::FullRefresh
        };

        let input_range = if run_type == RunType::Incremental {
            Some(incremental_range(
                inputs.watermarks.get(&model_name),
                as_of_date,
                inputs.config.default_lookback_days,
            ))
        } else {
            None
        };

        let step_id = PlanStep::compute_id(
            &model_name,
            inputs.base,
            inputs.target,
            run_type,
            input_range.as_ref(),
        );
        step_ids.insert(model_name.clone(), step_id.clone());

        let depends_on: Vec<String> = model
            .dependencies
            .iter()
            .filter_map(|dep| step_ids.get(dep).cloned())
            .collect();

        let reason = if added.contains(&model_name) {
            "new model added"
        } else if modified.contains(&model_name) {
            "model SQL changed"
        } else if changed
            .iter()
            .any(|c| inputs.dag.downstream_closure(c).contains(&model_name))
        {
            "upstream changed"
        } else {
            "contract violation"
        };

        let stats = inputs
            .run_stats
            .get(&model_name)
            .copied()
            .unwrap_or_default();
        let contract_violations = inputs
            .contract_results
            .get(&model_name)
            .cloned()
            .unwrap_or_default();

        steps.push(PlanStep {
            step_id,
            model: model_name.clone(),
            run_type,
            input_range,
            depends_on,
            parallel_group: inputs.dag.depth(&model_name).unwrap_or(0),
            reason: reason.to_string(),
            estimated_compute_seconds: stats.avg_runtime_seconds,
            estimated_cost_usd: stats.avg_cost_usd,
            contract_violations,
        });
    }

    steps.sort_by(|a, b| {
        (a.parallel_group, &a.model).cmp(&(b.parallel_group, &b.model))
    });

    let all_step_ids: Vec<String> = steps.iter().map(|s| s.step_id.clone()).collect();
    let plan_id = Plan::compute_id(inputs.base, inputs.target, &all_step_ids);

    let contract_violations_count = steps.iter().map(|s| s.contract_violations.len()).sum();
    let breaking_contract_violations = steps
        .iter()
        .flat_map(|s| &s.contract_violations)
        .filter(|v| v.is_breaking())
        .count();

    let summary = PlanSummary {
        total_steps: steps.len(),
        estimated_cost_usd: steps.iter().map(|s| s.estimated_cost_usd).sum(),
        models_changed: affected.into_iter().collect(),
        contract_violations_count,
        breaking_contract_violations,
    };

    Ok(Plan {
        plan_id,
        base: inputs.base.to_string(),
        target: inputs.target.to_string(),
        created_at: Utc::now(),
        summary,
        steps,
    })
}

/// Date range for an incremental step: from the watermark's end (or the
/// lookback window) through the planning date. A watermark already past the
/// planning date clamps to a single-day reprocess; the range never reverses.
fn incremental_range(
    watermark: Option<&(NaiveDate, NaiveDate)>,
    as_of_date: NaiveDate,
    default_lookback_days: i64,
) -> DateRange {
    let end = as_of_date;
    let start = match watermark {
        Some((_, watermark_end)) => *watermark_end,
        None => end - Duration::days(default_lookback_days),
    };
    let start = start.min(end);
    DateRange::new(start, end)
}
