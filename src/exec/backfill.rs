//! Backfill engine.
//!
//! Single-range backfills run one synthetic incremental step under a lock.
//! Chunked backfills split the range into day-aligned chunks, execute them
//! strictly in date order, and checkpoint progress after every chunk so a
//! failed backfill resumes from the first unprocessed day. Audit rows from
//! earlier attempts are preserved; retries add new rows.

use chrono::{Duration, NaiveDate, Utc};
use sea_orm::{ConnectionTrait, TransactionTrait};
use serde::{Deserialize, Serialize};

use crate::errors::CoreError;
use crate::exec::orchestrator::ExecutionService;
use crate::hash::deterministic_id;
use crate::lock::DEFAULT_LOCK_TTL_SECONDS;
use crate::plan::{DateRange, PlanStep, RunRecord, RunStatus, RunType};
use crate::state::backfill::{BACKFILL_COMPLETED, BACKFILL_FAILED, BACKFILL_RUNNING};

/// Final state of a backfill invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackfillStatus {
    Running,
    Completed,
    Failed,
}

impl BackfillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackfillStatus::Running => BACKFILL_RUNNING,
            BackfillStatus::Completed => BACKFILL_COMPLETED,
            BackfillStatus::Failed => BACKFILL_FAILED,
        }
    }
}

/// Result of a chunked backfill or resume invocation.
#[derive(Clone, Debug)]
pub struct BackfillOutcome {
    pub backfill_id: String,
    pub status: BackfillStatus,
    pub completed_chunks: i32,
    pub total_chunks: i32,
    pub runs: Vec<RunRecord>,
    pub error: Option<String>,
}

/// Checkpoint state plus its ordered chunk audit trail.
#[derive(Clone, Debug)]
pub struct BackfillReport {
    pub backfill_id: String,
    pub model_name: String,
    pub overall_start: NaiveDate,
    pub overall_end: NaiveDate,
    pub chunk_size_days: i32,
    pub status: String,
    pub completed_through: Option<NaiveDate>,
    pub total_chunks: i32,
    pub completed_chunks: i32,
    pub error_message: Option<String>,
    pub chunks: Vec<ChunkAudit>,
}

/// One executed chunk, as recorded in the audit trail.
#[derive(Clone, Debug)]
pub struct ChunkAudit {
    pub chunk_start: NaiveDate,
    pub chunk_end: NaiveDate,
    pub status: String,
    pub run_id: Option<String>,
    pub error_message: Option<String>,
    pub duration_seconds: Option<f64>,
}

/// Split an inclusive date range into contiguous, day-aligned chunks of at
/// most `chunk_size_days`, the final chunk ending exactly on `end`.
pub fn compute_chunks(
    start: NaiveDate,
    end: NaiveDate,
    chunk_size_days: i64,
) -> Vec<(NaiveDate, NaiveDate)> {
    let mut chunks = Vec::new();
    let mut cursor = start;
    while cursor <= end {
        let chunk_end = (cursor + Duration::days(chunk_size_days - 1)).min(end);
        chunks.push((cursor, chunk_end));
        cursor = chunk_end + Duration::days(1);
    }
    chunks
}

impl<C: ConnectionTrait + TransactionTrait> ExecutionService<'_, C> {
    /// Run a single-range backfill: one synthetic incremental step under a
    /// partition-range lock, watermark advanced on success.
    pub async fn backfill(
        &self,
        model_name: &str,
        start_date: NaiveDate,
        end_date: NaiveDate,
        cluster_size: Option<&str>,
    ) -> Result<(String, RunRecord), CoreError> {
        if self.models().get(model_name).await?.is_none() {
            return Err(CoreError::NotFound(format!("Model {model_name} not found")));
        }
        if start_date > end_date {
            return Err(CoreError::Validation(
                "start_date must be <= end_date".to_string(),
            ));
        }

        if self.locks().check(model_name, start_date, end_date).await? {
            return Err(CoreError::Conflict(format!(
                "Model {model_name} is locked for range [{start_date}, {end_date}]"
            )));
        }
        let locked = self
            .locks()
            .acquire(
                model_name,
                start_date,
                end_date,
                "backfill",
                DEFAULT_LOCK_TTL_SECONDS,
            )
            .await?;
        if !locked {
            return Err(CoreError::Conflict(format!(
                "Model {model_name} is locked for range [{start_date}, {end_date}]"
            )));
        }

        let step = synthetic_step(model_name, start_date, end_date, "manual backfill", None);
        let plan_id = deterministic_id(&[
            "backfill",
            model_name,
            &start_date.to_string(),
            &end_date.to_string(),
        ]);

        let outcome: Result<RunRecord, CoreError> = async {
            let record = self.execute_step(&plan_id, &step, cluster_size).await;
            self.runs().create(&record).await?;
            if record.status == RunStatus::Success {
                self.watermarks()
                    .update_watermark(model_name, start_date, end_date, None)
                    .await?;
                self.record_side_effects(&record, cluster_size).await;
            }
            Ok(record)
        }
        .await;

        if let Err(err) = self.locks().release(model_name, start_date, end_date).await {
            tracing::error!("failed to release backfill lock for {model_name}: {err}");
        }

        Ok((plan_id, outcome?))
    }

    /// Run a chunked backfill with checkpoint-based resume.
    ///
    /// The backfill id is deterministic over the request parameters, so a
    /// rerun of the same command finds the existing checkpoint: a completed
    /// backfill is a conflict, an interrupted one resumes.
    pub async fn chunked_backfill(
        &self,
        model_name: &str,
        start_date: NaiveDate,
        end_date: NaiveDate,
        cluster_size: Option<&str>,
        chunk_size_days: i64,
    ) -> Result<BackfillOutcome, CoreError> {
        if self.models().get(model_name).await?.is_none() {
            return Err(CoreError::NotFound(format!("Model {model_name} not found")));
        }
        if start_date > end_date {
            return Err(CoreError::Validation(
                "start_date must be <= end_date".to_string(),
            ));
        }
        if chunk_size_days < 1 {
            return Err(CoreError::Validation(
                "chunk_size_days must be >= 1".to_string(),
            ));
        }

        let chunks = compute_chunks(start_date, end_date, chunk_size_days);
        let backfill_id = deterministic_id(&[
            "chunked_backfill",
            model_name,
            &start_date.to_string(),
            &end_date.to_string(),
            &chunk_size_days.to_string(),
        ]);
        let plan_id = deterministic_id(&[
            "chunked_backfill_plan",
            model_name,
            &start_date.to_string(),
            &end_date.to_string(),
        ]);

        if let Some(existing) = self.checkpoints().get(&backfill_id).await? {
            if existing.status == BACKFILL_COMPLETED {
                return Err(CoreError::Conflict(format!(
                    "Backfill {backfill_id} already completed"
                )));
            }
            tracing::info!(
                "backfill {} already exists with status {}; resuming",
                &backfill_id[..12.min(backfill_id.len())],
                existing.status
            );
            return self.resume_backfill(&backfill_id).await;
        }

        self.checkpoints()
            .create(
                &backfill_id,
                model_name,
                start_date,
                end_date,
                chunk_size_days as i32,
                chunks.len() as i32,
                cluster_size,
                Some(&plan_id),
            )
            .await?;

        self.execute_chunks(&backfill_id, model_name, &plan_id, &chunks, cluster_size, 0)
            .await
    }

    /// Resume a FAILED or interrupted RUNNING backfill from the first day
    /// after `completed_through`.
    pub async fn resume_backfill(&self, backfill_id: &str) -> Result<BackfillOutcome, CoreError> {
        let checkpoint = self
            .checkpoints()
            .get(backfill_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Backfill {backfill_id} not found")))?;

        if checkpoint.status == BACKFILL_COMPLETED {
            return Err(CoreError::Conflict(format!(
                "Backfill {backfill_id} is already completed; nothing to resume"
            )));
        }
        if checkpoint.status != BACKFILL_FAILED && checkpoint.status != BACKFILL_RUNNING {
            return Err(CoreError::Conflict(format!(
                "Backfill {backfill_id} has unexpected status '{}' and cannot be resumed",
                checkpoint.status
            )));
        }

        let resume_start = match checkpoint.completed_through {
            Some(completed_through) => completed_through + Duration::days(1),
            None => checkpoint.overall_start,
        };

        // Idempotent fast path: everything already ran.
        if resume_start > checkpoint.overall_end {
            self.checkpoints().mark_completed(backfill_id).await?;
            return Ok(BackfillOutcome {
                backfill_id: backfill_id.to_string(),
                status: BackfillStatus::Completed,
                completed_chunks: checkpoint.total_chunks,
                total_chunks: checkpoint.total_chunks,
                runs: Vec::new(),
                error: None,
            });
        }

        let remaining = compute_chunks(
            resume_start,
            checkpoint.overall_end,
            i64::from(checkpoint.chunk_size_days),
        );
        tracing::info!(
            "resuming backfill {} from {} ({} chunks remaining)",
            &backfill_id[..12.min(backfill_id.len())],
            resume_start,
            remaining.len()
        );

        self.checkpoints().mark_running(backfill_id).await?;

        let plan_id = checkpoint.plan_id.clone().unwrap_or_else(|| {
            deterministic_id(&[
                "chunked_backfill_plan",
                &checkpoint.model_name,
                &checkpoint.overall_start.to_string(),
                &checkpoint.overall_end.to_string(),
            ])
        });

        self.execute_chunks(
            backfill_id,
            &checkpoint.model_name,
            &plan_id,
            &remaining,
            checkpoint.cluster_size.as_deref(),
            checkpoint.completed_chunks,
        )
        .await
    }

    /// Execute chunks strictly sequentially. On the first failure the
    /// checkpoint is marked FAILED and no further chunks run.
    pub(crate) async fn execute_chunks(
        &self,
        backfill_id: &str,
        model_name: &str,
        plan_id: &str,
        chunks: &[(NaiveDate, NaiveDate)],
        cluster_size: Option<&str>,
        start_chunk_index: i32,
    ) -> Result<BackfillOutcome, CoreError> {
        let checkpoint = self.checkpoints().get(backfill_id).await?;
        let total_chunks = checkpoint
            .as_ref()
            .map(|c| c.total_chunks)
            .unwrap_or(chunks.len() as i32 + start_chunk_index);
        if checkpoint.is_some() {
            debug_assert_eq!(
                start_chunk_index + chunks.len() as i32,
                total_chunks,
                "remaining chunks disagree with checkpoint accounting"
            );
        }

        let mut runs = Vec::new();
        let mut completed = start_chunk_index;

        for (index, &(chunk_start, chunk_end)) in chunks.iter().enumerate() {
            let chunk_number = start_chunk_index + index as i32 + 1;
            let reason = format!("manual backfill chunk {chunk_number}/{total_chunks}");
            let step = synthetic_step(model_name, chunk_start, chunk_end, &reason, Some("chunk"));

            let locked = self
                .locks()
                .acquire(
                    model_name,
                    chunk_start,
                    chunk_end,
                    &format!("chunked_backfill:{}", &backfill_id[..12.min(backfill_id.len())]),
                    DEFAULT_LOCK_TTL_SECONDS,
                )
                .await?;
            if !locked {
                let error = format!(
                    "Lock acquisition failed for chunk [{chunk_start}, {chunk_end}]"
                );
                self.chunk_audit()
                    .record_chunk(
                        backfill_id,
                        model_name,
                        chunk_start,
                        chunk_end,
                        RunStatus::Failed.as_str(),
                        None,
                        Some(&error),
                        None,
                    )
                    .await?;
                self.checkpoints().mark_failed(backfill_id, &error).await?;
                return Ok(BackfillOutcome {
                    backfill_id: backfill_id.to_string(),
                    status: BackfillStatus::Failed,
                    completed_chunks: completed,
                    total_chunks,
                    runs,
                    error: Some(error),
                });
            }

            let chunk_outcome: Result<(RunRecord, f64), CoreError> = async {
                let chunk_started = Utc::now();
                let record = self.execute_step(plan_id, &step, cluster_size).await;
                let duration =
                    (Utc::now() - chunk_started).num_milliseconds() as f64 / 1000.0;
                self.runs().create(&record).await?;
                Ok((record, duration))
            }
            .await;

            if let Err(err) = self.locks().release(model_name, chunk_start, chunk_end).await {
                tracing::error!("failed to release chunk lock for {model_name}: {err}");
            }

            let (record, duration) = chunk_outcome?;

            if record.status == RunStatus::Success {
                self.watermarks()
                    .update_watermark(model_name, chunk_start, chunk_end, None)
                    .await?;
                self.record_side_effects(&record, cluster_size).await;
                self.chunk_audit()
                    .record_chunk(
                        backfill_id,
                        model_name,
                        chunk_start,
                        chunk_end,
                        RunStatus::Success.as_str(),
                        Some(&record.run_id),
                        None,
                        Some(duration),
                    )
                    .await?;
                completed += 1;
                self.checkpoints()
                    .update_progress(backfill_id, chunk_end, completed)
                    .await?;
                runs.push(record);
            } else {
                let error = record
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "Chunk execution failed".to_string());
                self.chunk_audit()
                    .record_chunk(
                        backfill_id,
                        model_name,
                        chunk_start,
                        chunk_end,
                        RunStatus::Failed.as_str(),
                        Some(&record.run_id),
                        Some(&error),
                        Some(duration),
                    )
                    .await?;
                self.checkpoints().mark_failed(backfill_id, &error).await?;
                runs.push(record);
                return Ok(BackfillOutcome {
                    backfill_id: backfill_id.to_string(),
                    status: BackfillStatus::Failed,
                    completed_chunks: completed,
                    total_chunks,
                    runs,
                    error: Some(error),
                });
            }
        }

        self.checkpoints().mark_completed(backfill_id).await?;
        Ok(BackfillOutcome {
            backfill_id: backfill_id.to_string(),
            status: BackfillStatus::Completed,
            completed_chunks: completed,
            total_chunks,
            runs,
            error: None,
        })
    }

    /// Current checkpoint state plus the ordered chunk audit trail.
    pub async fn get_backfill_status(&self, backfill_id: &str) -> Result<BackfillReport, CoreError> {
        let checkpoint = self
            .checkpoints()
            .get(backfill_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Backfill {backfill_id} not found")))?;
        let chunks = self
            .chunk_audit()
            .get_for_backfill(backfill_id)
            .await?
            .into_iter()
            .map(|row| ChunkAudit {
                chunk_start: row.chunk_start,
                chunk_end: row.chunk_end,
                status: row.status,
                run_id: row.run_id,
                error_message: row.error_message,
                duration_seconds: row.duration_seconds,
            })
            .collect();

        Ok(BackfillReport {
            backfill_id: checkpoint.backfill_id,
            model_name: checkpoint.model_name,
            overall_start: checkpoint.overall_start,
            overall_end: checkpoint.overall_end,
            chunk_size_days: checkpoint.chunk_size_days,
            status: checkpoint.status,
            completed_through: checkpoint.completed_through,
            total_chunks: checkpoint.total_chunks,
            completed_chunks: checkpoint.completed_chunks,
            error_message: checkpoint.error_message,
            chunks,
        })
    }

    /// Recent backfills for a model, newest first.
    pub async fn get_backfill_history(
        &self,
        model_name: &str,
        limit: u64,
    ) -> Result<Vec<BackfillReport>, CoreError> {
        let checkpoints = self.checkpoints().list_for_model(model_name, limit).await?;
        Ok(checkpoints
            .into_iter()
            .map(|checkpoint| BackfillReport {
                backfill_id: checkpoint.backfill_id,
                model_name: checkpoint.model_name,
                overall_start: checkpoint.overall_start,
                overall_end: checkpoint.overall_end,
                chunk_size_days: checkpoint.chunk_size_days,
                status: checkpoint.status,
                completed_through: checkpoint.completed_through,
                total_chunks: checkpoint.total_chunks,
                completed_chunks: checkpoint.completed_chunks,
                error_message: checkpoint.error_message,
                chunks: Vec::new(),
            })
            .collect())
    }
}

/// Build the synthetic one-model incremental step backfills execute.
fn synthetic_step(
    model_name: &str,
    start: NaiveDate,
    end: NaiveDate,
    reason: &str,
    id_tag: Option<&str>,
) -> PlanStep {
    let step_id = match id_tag {
        Some(tag) => deterministic_id(&[model_name, tag, &start.to_string(), &end.to_string()]),
        None => deterministic_id(&[model_name, &start.to_string(), &end.to_string()]),
    };
    PlanStep {
        step_id,
        model: model_name.to_string(),
        run_type: RunType::Incremental,
        input_range: Some(DateRange::new(start, end)),
        depends_on: Vec::new(),
        parallel_group: 0,
        reason: reason.to_string(),
        estimated_compute_seconds: 0.0,
        estimated_cost_usd: 0.0,
        contract_violations: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        s.parse().expect("date")
    }

    #[test]
    fn test_chunks_cover_range_without_gaps_or_overlaps() {
        let chunks = compute_chunks(date("2024-01-01"), date("2024-01-21"), 7);
        assert_eq!(
            chunks,
            vec![
                (date("2024-01-01"), date("2024-01-07")),
                (date("2024-01-08"), date("2024-01-14")),
                (date("2024-01-15"), date("2024-01-21")),
            ]
        );

        let covered: i64 = chunks
            .iter()
            .map(|(start, end)| (*end - *start).num_days() + 1)
            .sum();
        assert_eq!(covered, 21);
        for window in chunks.windows(2) {
            assert_eq!(window[0].1 + Duration::days(1), window[1].0);
        }
    }

    #[test]
    fn test_final_chunk_ends_exactly_on_end() {
        let chunks = compute_chunks(date("2024-01-01"), date("2024-01-10"), 7);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1], (date("2024-01-08"), date("2024-01-10")));
    }

    #[test]
    fn test_single_day_range_is_one_chunk() {
        let chunks = compute_chunks(date("2024-01-01"), date("2024-01-01"), 7);
        assert_eq!(chunks, vec![(date("2024-01-01"), date("2024-01-01"))]);
    }

    #[test]
    fn test_chunk_size_of_one_day() {
        let chunks = compute_chunks(date("2024-01-01"), date("2024-01-03"), 1);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|(start, end)| start == end));
    }

    #[test]
    fn test_synthetic_step_ids_differ_by_range() {
        let a = synthetic_step("m", date("2024-01-01"), date("2024-01-07"), "r", Some("chunk"));
        let b = synthetic_step("m", date("2024-01-08"), date("2024-01-14"), "r", Some("chunk"));
        assert_ne!(a.step_id, b.step_id);
        assert_eq!(a.run_type, RunType::Incremental);
    }
}
