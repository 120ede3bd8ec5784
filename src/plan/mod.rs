//! Execution plans.
//!
//! A plan is the complete, deterministic instruction set to move one
//! snapshot to another: an ordered list of steps with per-step date ranges,
//! dependency edges, and cost estimates. The same inputs always produce the
//! same plan id and step sequence, which is what makes plans reviewable,
//! approvable, and replayable.

pub mod planner;
pub mod serializer;

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::hash::deterministic_id;
use crate::model::contract::ContractViolation;

/// How a step recomputes its model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunType {
    FullRefresh,
    Incremental,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunType::FullRefresh => "FULL_REFRESH",
            RunType::Incremental => "INCREMENTAL",
        }
    }
}

impl fmt::Display for RunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal and in-flight states of a run. Immutable once terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Success => "SUCCESS",
            RunStatus::Failed => "FAILED",
            RunStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(RunStatus::Pending),
            "RUNNING" => Some(RunStatus::Running),
            "SUCCESS" => Some(RunStatus::Success),
            "FAILED" => Some(RunStatus::Failed),
            "CANCELLED" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive date range an incremental step processes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// Number of days covered, inclusive of both endpoints.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Stable serialized form used in deterministic id derivation.
    pub fn id_part(&self) -> String {
        format!("{}..{}", self.start, self.end)
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// One unit of work in a plan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Deterministic: the same inputs produce the same id across runs.
    pub step_id: String,
    /// Canonical model name.
    pub model: String,
    pub run_type: RunType,
    /// Present iff `run_type` is `INCREMENTAL`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_range: Option<DateRange>,
    /// Step ids of upstream steps in this plan.
    pub depends_on: Vec<String>,
    /// Steps sharing a group have no ordering requirement between them.
    /// Always greater than the group of every upstream step.
    pub parallel_group: u32,
    pub reason: String,
    pub estimated_compute_seconds: f64,
    pub estimated_cost_usd: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contract_violations: Vec<ContractViolation>,
}

impl PlanStep {
    /// Derive the deterministic step id from its identity inputs.
    pub fn compute_id(
        model: &str,
        base: &str,
        target: &str,
        run_type: RunType,
        input_range: Option<&DateRange>,
    ) -> String {
        let range = input_range.map(DateRange::id_part).unwrap_or_default();
        deterministic_id(&[model, base, target, run_type.as_str(), &range])
    }
}

/// Roll-up of a plan's steps.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub total_steps: usize,
    pub estimated_cost_usd: f64,
    pub models_changed: Vec<String>,
    #[serde(default)]
    pub contract_violations_count: usize,
    #[serde(default)]
    pub breaking_contract_violations: usize,
}

/// The complete instruction set to move one snapshot to another.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    /// Base snapshot id or ref (e.g. a commit SHA).
    pub base: String,
    pub target: String,
    pub created_at: DateTime<Utc>,
    pub summary: PlanSummary,
    /// Sorted by `(parallel_group, model)`.
    pub steps: Vec<PlanStep>,
}

impl Plan {
    /// Derive the deterministic plan id: a hash over base, target, and the
    /// sorted step ids.
    pub fn compute_id(base: &str, target: &str, step_ids: &[String]) -> String {
        let mut sorted: Vec<&str> = step_ids.iter().map(|s| s.as_str()).collect();
        sorted.sort_unstable();
        let mut parts = vec![base, target];
        parts.extend(sorted);
        deterministic_id(&parts)
    }

    pub fn step(&self, step_id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }
}

/// Outcome of executing a single step. Persisted by the run repository.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub plan_id: String,
    pub step_id: String,
    pub model_name: String,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub input_range_start: Option<NaiveDate>,
    pub input_range_end: Option<NaiveDate>,
    pub error_message: Option<String>,
    pub cluster_used: Option<String>,
    pub executor_version: String,
    pub retry_count: i32,
    pub cost_usd: Option<f64>,
    pub external_run_id: Option<String>,
}

impl RunRecord {
    /// Wall-clock runtime in seconds, when both timestamps are present.
    pub fn runtime_seconds(&self) -> Option<f64> {
        match (self.started_at, self.finished_at) {
            (Some(started), Some(finished)) => {
                Some((finished - started).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        s.parse().expect("date")
    }

    #[test]
    fn test_date_range_days_is_inclusive() {
        let range = DateRange::new(date("2024-01-01"), date("2024-01-07"));
        assert_eq!(range.days(), 7);
        assert_eq!(DateRange::new(date("2024-01-01"), date("2024-01-01")).days(), 1);
    }

    #[test]
    fn test_step_id_depends_on_range() {
        let with_range = PlanStep::compute_id(
            "m",
            "base",
            "target",
            RunType::Incremental,
            Some(&DateRange::new(date("2024-01-01"), date("2024-01-07"))),
        );
        let without_range =
            PlanStep::compute_id("m", "base", "target", RunType::Incremental, None);
        assert_ne!(with_range, without_range);
    }

    #[test]
    fn test_plan_id_ignores_step_order() {
        let ids = vec!["s1".to_string(), "s2".to_string()];
        let reversed = vec!["s2".to_string(), "s1".to_string()];
        assert_eq!(
            Plan::compute_id("base", "target", &ids),
            Plan::compute_id("base", "target", &reversed)
        );
    }

    #[test]
    fn test_run_status_round_trip() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Success,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("DONE"), None);
    }

    #[test]
    fn test_runtime_seconds() {
        let started = Utc::now();
        let record = RunRecord {
            run_id: "r".to_string(),
            plan_id: "p".to_string(),
            step_id: "s".to_string(),
            model_name: "m".to_string(),
            status: RunStatus::Success,
            started_at: Some(started),
            finished_at: Some(started + chrono::Duration::milliseconds(2500)),
            input_range_start: None,
            input_range_end: None,
            error_message: None,
            cluster_used: None,
            executor_version: "test".to_string(),
            retry_count: 0,
            cost_usd: None,
            external_run_id: None,
        };
        assert_eq!(record.runtime_seconds(), Some(2.5));
    }
}
