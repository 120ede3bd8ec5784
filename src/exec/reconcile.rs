//! Reconciliation: control-plane run status vs warehouse reality.
//!
//! For every checked run a `ReconciliationCheck` row is written; it starts
//! resolved when the two sides agree, otherwise it surfaces through
//! `unresolved` until an operator resolves it with a note. The background
//! trigger loop that fires on a cron schedule is an external collaborator —
//! this service only exposes the operations it invokes.

use sea_orm::ConnectionTrait;

use crate::errors::CoreError;
use crate::exec::backend::ComputeBackend;
use crate::plan::RunStatus;
use crate::state::repository::{
    ReconciliationRepository, ReconciliationScheduleRepository, ReconciliationStats, RunRepository,
};
use crate::state::tables::reconciliation_checks;

/// Discrepancy classifications.
pub const DISCREPANCY_STATUS_MISMATCH: &str = "status_mismatch";
pub const DISCREPANCY_MISSING_IN_WAREHOUSE: &str = "missing_in_warehouse";

/// Compares recorded runs against the warehouse and records the outcome.
pub struct ReconciliationService<'c, C: ConnectionTrait> {
    conn: &'c C,
    backend: &'c dyn ComputeBackend,
    tenant_id: String,
}

impl<'c, C: ConnectionTrait> ReconciliationService<'c, C> {
    pub fn new(conn: &'c C, backend: &'c dyn ComputeBackend, tenant_id: impl Into<String>) -> Self {
        Self {
            conn,
            backend,
            tenant_id: tenant_id.into(),
        }
    }

    fn runs(&self) -> RunRepository<'c, C> {
        RunRepository::new(self.conn, self.tenant_id.clone())
    }

    fn checks(&self) -> ReconciliationRepository<'c, C> {
        ReconciliationRepository::new(self.conn, self.tenant_id.clone())
    }

    fn schedules(&self) -> ReconciliationScheduleRepository<'c, C> {
        ReconciliationScheduleRepository::new(self.conn, self.tenant_id.clone())
    }

    /// Reconcile one run against the warehouse. Runs without an external id
    /// (sandbox executions) reconcile trivially against their own record.
    pub async fn reconcile_run(
        &self,
        run_id: &str,
    ) -> Result<reconciliation_checks::Model, CoreError> {
        let run = self
            .runs()
            .get(run_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Run {run_id} not found")))?;

        let Some(external_run_id) = run.external_run_id.as_deref() else {
            return self
                .checks()
                .record_check(run_id, Some(&run.model_name), &run.status, None, None)
                .await;
        };

        let remote = self.backend.lookup_run(external_run_id).await?;
        let (warehouse_status, discrepancy) = match remote {
            None => {
                // The control plane believes this ran, the warehouse has no
                // record of it.
                (None, Some(DISCREPANCY_MISSING_IN_WAREHOUSE))
            }
            Some(remote) => {
                let matches = RunStatus::parse(&run.status) == Some(remote.status);
                (
                    Some(remote.status.as_str()),
                    (!matches).then_some(DISCREPANCY_STATUS_MISMATCH),
                )
            }
        };

        self.checks()
            .record_check(
                run_id,
                Some(&run.model_name),
                &run.status,
                warehouse_status,
                discrepancy,
            )
            .await
    }

    /// Reconcile the most recent terminal runs. Returns the checks written.
    pub async fn reconcile_recent(
        &self,
        limit: u64,
    ) -> Result<Vec<reconciliation_checks::Model>, CoreError> {
        let runs = self.runs().get_recent(limit).await?;
        let mut checks = Vec::new();
        for run in runs {
            let terminal = RunStatus::parse(&run.status)
                .map(|s| s.is_terminal())
                .unwrap_or(false);
            if !terminal || run.external_run_id.is_none() {
                continue;
            }
            match self.reconcile_run(&run.run_id).await {
                Ok(check) => checks.push(check),
                Err(err) => {
                    tracing::warn!("reconciliation failed for run {}: {err}", run.run_id);
                }
            }
        }
        Ok(checks)
    }

    /// Unresolved discrepancies, newest first.
    pub async fn unresolved(
        &self,
        limit: u64,
    ) -> Result<Vec<reconciliation_checks::Model>, CoreError> {
        self.checks().get_unresolved(limit).await
    }

    /// Operator resolution with a note.
    pub async fn resolve(
        &self,
        check_id: &str,
        resolved_by: &str,
        note: &str,
    ) -> Result<(), CoreError> {
        let updated = self.checks().resolve(check_id, resolved_by, note).await?;
        if !updated {
            return Err(CoreError::NotFound(format!(
                "Reconciliation check {check_id} not found"
            )));
        }
        Ok(())
    }

    pub async fn stats(&self) -> Result<ReconciliationStats, CoreError> {
        self.checks().stats().await
    }

    /// Upsert the cron schedule the external trigger loop reads.
    pub async fn set_schedule(
        &self,
        schedule_type: &str,
        cron_expression: &str,
        enabled: bool,
    ) -> Result<(), CoreError> {
        self.schedules()
            .upsert(schedule_type, cron_expression, enabled)
            .await
    }

    /// Record that the trigger loop fired a schedule.
    pub async fn touch_schedule(&self, schedule_type: &str) -> Result<(), CoreError> {
        self.schedules().touch_last_run(schedule_type).await
    }
}
