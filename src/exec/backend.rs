//! Compute backend contract.
//!
//! The orchestrator's boundary to the engine that actually runs SQL. Two
//! interchangeable implementations exist: a local sandbox for development
//! and a remote warehouse executor for production.

use chrono::{DateTime, NaiveDate, Utc};
use async_trait::async_trait;

use crate::errors::CoreError;
use crate::plan::{PlanStep, RunStatus};

/// Version tag written into every run record.
pub const EXECUTOR_VERSION: &str = "tidemark-control-plane/0.1.0";

/// Per-second cost rate for a named cluster size, or `None` for an
/// unrecognised size.
pub fn cost_rate(cluster_size: &str) -> Option<f64> {
    match cluster_size {
        "small" => Some(0.000_055_6),
        "medium" => Some(0.000_222_2),
        "large" => Some(0.000_888_9),
        _ => None,
    }
}

/// Execution parameters passed alongside the SQL.
#[derive(Clone, Debug, Default)]
pub struct ExecutionParams {
    /// Inclusive processing window for incremental steps.
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub cluster_id: Option<String>,
}

/// Outcome the backend reports for one step execution.
#[derive(Clone, Debug)]
pub struct RunResult {
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Backend-assigned id for reconciliation lookups.
    pub external_run_id: Option<String>,
}

impl RunResult {
    pub fn success(started_at: DateTime<Utc>, external_run_id: Option<String>) -> Self {
        Self {
            status: RunStatus::Success,
            started_at: Some(started_at),
            finished_at: Some(Utc::now()),
            error_message: None,
            external_run_id,
        }
    }

    pub fn failure(started_at: DateTime<Utc>, error_message: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            started_at: Some(started_at),
            finished_at: Some(Utc::now()),
            error_message: Some(error_message.into()),
            external_run_id: None,
        }
    }
}

/// A run as the warehouse reports it, for reconciliation.
#[derive(Clone, Debug)]
pub struct RemoteRun {
    pub status: RunStatus,
    pub state_message: Option<String>,
}

/// Pluggable compute engine.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Execute one step. Implementations report failures through the
    /// returned status rather than an error wherever possible; errors are
    /// reserved for conditions where no run happened at all.
    async fn execute_step(
        &self,
        step: &PlanStep,
        sql: &str,
        params: &ExecutionParams,
    ) -> Result<RunResult, CoreError>;

    /// Look up a previously executed run by its backend-assigned id.
    /// `None` means the warehouse has no record of it.
    async fn lookup_run(&self, external_run_id: &str) -> Result<Option<RemoteRun>, CoreError>;
}

/// Substitute `{{ name }}` template parameters in SQL.
///
/// Recognised names: `start_date`, `end_date`. Unknown placeholders are left
/// verbatim.
pub fn substitute_parameters(sql: &str, params: &ExecutionParams) -> String {
    let mut output = String::with_capacity(sql.len());
    let mut rest = sql;

    while let Some(open) = rest.find("{{") {
        let (before, after_open) = rest.split_at(open);
        output.push_str(before);
        let Some(close) = after_open.find("}}") else {
            output.push_str(after_open);
            return output;
        };
        let inner = after_open[2..close].trim();
        let replacement = match inner {
            "start_date" => params.start_date.map(|d| d.to_string()),
            "end_date" => params.end_date.map(|d| d.to_string()),
            _ => None,
        };
        match replacement {
            Some(value) => output.push_str(&value),
            None => output.push_str(&after_open[..close + 2]),
        }
        rest = &after_open[close + 2..];
    }
    output.push_str(rest);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_rates() {
        assert!(cost_rate("small").is_some());
        assert!(cost_rate("medium").unwrap() > cost_rate("small").unwrap());
        assert!(cost_rate("large").unwrap() > cost_rate("medium").unwrap());
        assert!(cost_rate("galactic").is_none());
    }

    #[test]
    fn test_parameter_substitution() {
        let params = ExecutionParams {
            start_date: Some("2024-01-01".parse().expect("date")),
            end_date: Some("2024-01-07".parse().expect("date")),
            cluster_id: None,
        };
        let sql = "SELECT * FROM t WHERE d >= '{{ start_date }}' AND d < '{{ end_date }}'";
        assert_eq!(
            substitute_parameters(sql, &params),
            "SELECT * FROM t WHERE d >= '2024-01-01' AND d < '2024-01-07'"
        );
    }

    #[test]
    fn test_unknown_placeholders_survive() {
        let params = ExecutionParams::default();
        let sql = "SELECT '{{ mystery }}' AS tag";
        assert_eq!(substitute_parameters(sql, &params), sql);
    }
}
