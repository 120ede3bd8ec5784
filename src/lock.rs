//! Lock manager.
//!
//! A thin behavioural layer over the lock repository: non-blocking acquire
//! with a default TTL, unconditional release, observational check, audited
//! force-release, and stale-lock reaping. Callers bracket locked operations
//! so release runs on every exit path.

use chrono::NaiveDate;
use sea_orm::ConnectionTrait;

use crate::errors::CoreError;
use crate::state::audit::AuditRepository;
use crate::state::repository::LockRepository;

/// Default lock lifetime.
pub const DEFAULT_LOCK_TTL_SECONDS: i64 = 3600;

/// Behavioural facade over partition-range advisory locks.
pub struct LockManager<'c, C: ConnectionTrait> {
    locks: LockRepository<'c, C>,
    audit: AuditRepository<'c, C>,
}

impl<'c, C: ConnectionTrait> LockManager<'c, C> {
    pub fn new(conn: &'c C, tenant_id: impl Into<String>) -> Self {
        let tenant_id = tenant_id.into();
        Self {
            locks: LockRepository::new(conn, tenant_id.clone()),
            audit: AuditRepository::new(conn, tenant_id),
        }
    }

    /// Non-blocking acquire. Returns false when another owner holds a live
    /// lock on the same range.
    pub async fn acquire(
        &self,
        model_name: &str,
        range_start: NaiveDate,
        range_end: NaiveDate,
        owner: &str,
        ttl_seconds: i64,
    ) -> Result<bool, CoreError> {
        self.locks
            .acquire(model_name, range_start, range_end, owner, ttl_seconds)
            .await
    }

    /// Unconditional release; safe to call when no lock is held.
    pub async fn release(
        &self,
        model_name: &str,
        range_start: NaiveDate,
        range_end: NaiveDate,
    ) -> Result<(), CoreError> {
        self.locks.release(model_name, range_start, range_end).await
    }

    /// Observational: is a live lock held on the range?
    pub async fn check(
        &self,
        model_name: &str,
        range_start: NaiveDate,
        range_end: NaiveDate,
    ) -> Result<bool, CoreError> {
        self.locks.check(model_name, range_start, range_end).await
    }

    /// Forcibly release a lock, recording the original owner in the audit
    /// log before the row is deleted. Returns false when no lock existed.
    pub async fn force_release(
        &self,
        model_name: &str,
        range_start: NaiveDate,
        range_end: NaiveDate,
        released_by: &str,
        reason: &str,
    ) -> Result<bool, CoreError> {
        let Some(lock) = self.locks.find(model_name, range_start, range_end).await? else {
            return Ok(false);
        };

        self.audit
            .log(
                released_by,
                "lock.force_release",
                Some("lock"),
                Some(&format!("{model_name}:{range_start}:{range_end}")),
                Some(serde_json::json!({
                    "original_owner": lock.locked_by,
                    "reason": reason,
                    "model_name": model_name,
                    "range": format!("{range_start}:{range_end}"),
                })),
            )
            .await?;

        self.locks.release(model_name, range_start, range_end).await?;
        Ok(true)
    }

    /// Background maintenance: delete every expired lock.
    pub async fn expire_stale(&self) -> Result<u64, CoreError> {
        self.locks.expire_stale().await
    }
}
