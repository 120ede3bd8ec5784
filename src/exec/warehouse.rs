//! Remote warehouse executor.
//!
//! Submits statements to the warehouse's SQL execution HTTP API and polls
//! until the statement reaches a terminal state. The HTTP client carries its
//! own timeout; the control plane has no per-request cancellation primitive,
//! so a hung backend call is bounded here.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use crate::config::WarehouseConfig;
use crate::errors::CoreError;
use crate::exec::backend::{
    substitute_parameters, ComputeBackend, ExecutionParams, RemoteRun, RunResult,
};
use crate::plan::{PlanStep, RunStatus};

/// Polling bound: a statement still running after this many polls is
/// reported as a transient failure rather than blocking forever.
const MAX_POLLS: u32 = 300;

/// HTTP client for the warehouse SQL-statements API.
pub struct WarehouseExecutor {
    http: reqwest::Client,
    endpoint: String,
    token: String,
    warehouse_id: Option<String>,
    poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
struct StatementResponse {
    statement_id: String,
    status: StatementStatus,
}

#[derive(Debug, Deserialize)]
struct StatementStatus {
    state: String,
    #[serde(default)]
    error: Option<StatementError>,
}

#[derive(Debug, Deserialize)]
struct StatementError {
    #[serde(default)]
    message: String,
}

impl WarehouseExecutor {
    pub fn new(config: &WarehouseConfig) -> Result<Self, CoreError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| CoreError::Transient(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            warehouse_id: config.warehouse_id.clone(),
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
        })
    }

    fn map_state(state: &str) -> RunStatus {
        match state {
            "SUCCEEDED" => RunStatus::Success,
            "FAILED" => RunStatus::Failed,
            "CANCELED" | "CLOSED" => RunStatus::Cancelled,
            "PENDING" => RunStatus::Pending,
            _ => RunStatus::Running,
        }
    }

    async fn submit(&self, sql: &str, cluster_id: Option<&str>) -> Result<StatementResponse, CoreError> {
        let mut body = json!({ "statement": sql });
        if let Some(warehouse_id) = cluster_id.or(self.warehouse_id.as_deref()) {
            body["warehouse_id"] = json!(warehouse_id);
        }

        let response = self
            .http
            .post(format!("{}/api/2.0/sql/statements", self.endpoint))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::Transient(format!("warehouse submit failed: {e}")))?;

        if !response.status().is_success() {
            return Err(CoreError::Transient(format!(
                "warehouse submit returned HTTP {}",
                response.status()
            )));
        }
        response
            .json::<StatementResponse>()
            .await
            .map_err(|e| CoreError::Transient(format!("warehouse submit response invalid: {e}")))
    }

    async fn poll(&self, statement_id: &str) -> Result<StatementResponse, CoreError> {
        let response = self
            .http
            .get(format!(
                "{}/api/2.0/sql/statements/{statement_id}",
                self.endpoint
            ))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| CoreError::Transient(format!("warehouse poll failed: {e}")))?;

        if !response.status().is_success() {
            return Err(CoreError::Transient(format!(
                "warehouse poll returned HTTP {}",
                response.status()
            )));
        }
        response
            .json::<StatementResponse>()
            .await
            .map_err(|e| CoreError::Transient(format!("warehouse poll response invalid: {e}")))
    }
}

#[async_trait]
impl ComputeBackend for WarehouseExecutor {
    async fn execute_step(
        &self,
        step: &PlanStep,
        sql: &str,
        params: &ExecutionParams,
    ) -> Result<RunResult, CoreError> {
        let started_at = Utc::now();
        let bound = substitute_parameters(sql, params);

        tracing::info!(
            "submitting step for model {} to warehouse at {}",
            step.model,
            self.endpoint
        );
        let mut current = self
            .submit(&bound, params.cluster_id.as_deref())
            .await?;
        let statement_id = current.statement_id.clone();

        let mut polls = 0;
        loop {
            let status = Self::map_state(&current.status.state);
            if status.is_terminal() {
                let error_message = current
                    .status
                    .error
                    .map(|e| e.message)
                    .filter(|m| !m.is_empty());
                return Ok(RunResult {
                    status,
                    started_at: Some(started_at),
                    finished_at: Some(Utc::now()),
                    error_message,
                    external_run_id: Some(statement_id),
                });
            }

            polls += 1;
            if polls > MAX_POLLS {
                return Ok(RunResult {
                    status: RunStatus::Failed,
                    started_at: Some(started_at),
                    finished_at: Some(Utc::now()),
                    error_message: Some(format!(
                        "statement {statement_id} still {} after {MAX_POLLS} polls",
                        current.status.state
                    )),
                    external_run_id: Some(statement_id),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
            current = self.poll(&statement_id).await?;
        }
    }

    async fn lookup_run(&self, external_run_id: &str) -> Result<Option<RemoteRun>, CoreError> {
        match self.poll(external_run_id).await {
            Ok(response) => Ok(Some(RemoteRun {
                status: Self::map_state(&response.status.state),
                state_message: response.status.error.map(|e| e.message),
            })),
            Err(CoreError::Transient(message)) if message.contains("HTTP 404") => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(WarehouseExecutor::map_state("SUCCEEDED"), RunStatus::Success);
        assert_eq!(WarehouseExecutor::map_state("FAILED"), RunStatus::Failed);
        assert_eq!(WarehouseExecutor::map_state("CANCELED"), RunStatus::Cancelled);
        assert_eq!(WarehouseExecutor::map_state("RUNNING"), RunStatus::Running);
        assert_eq!(WarehouseExecutor::map_state("PENDING"), RunStatus::Pending);
    }

    #[test]
    fn test_endpoint_is_normalised() {
        let executor = WarehouseExecutor::new(&WarehouseConfig {
            endpoint: "https://dbx.example.com/".to_string(),
            token: "secret".to_string(),
            warehouse_id: Some("wh-1".to_string()),
            request_timeout_secs: 5,
            poll_interval_secs: 0,
        })
        .expect("executor");
        assert_eq!(executor.endpoint, "https://dbx.example.com");
        assert_eq!(executor.poll_interval, Duration::from_secs(1));
    }
}
