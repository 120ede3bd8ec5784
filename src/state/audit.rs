//! Append-only, hash-chained audit log.
//!
//! Each entry embeds the `entry_hash` of its predecessor, so mutating any
//! persisted entry breaks verification for everything after it. Writes for a
//! tenant are serialised by a per-tenant advisory lock on backends that
//! support one; two concurrent inserts must not observe the same
//! `previous_hash` and fork the chain.

use chrono::{DateTime, Utc};
use sea_orm::ActiveValue::Set;
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseBackend, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Statement,
};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::CoreError;
use crate::hash::{canonicalize_json, ContentHash};
use crate::state::tables::audit_log;

/// Append-only audit repository.
pub struct AuditRepository<'c, C: ConnectionTrait> {
    conn: &'c C,
    tenant_id: String,
}

impl<'c, C: ConnectionTrait> AuditRepository<'c, C> {
    pub fn new(conn: &'c C, tenant_id: impl Into<String>) -> Self {
        Self {
            conn,
            tenant_id: tenant_id.into(),
        }
    }

    /// Hash over the entry's content fields joined with `|`; absent fields
    /// hash as the empty string. Metadata is serialized with sorted keys.
    fn compute_hash(
        tenant_id: &str,
        actor: &str,
        action: &str,
        entity_type: Option<&str>,
        entity_id: Option<&str>,
        metadata: Option<&Value>,
        previous_hash: Option<&str>,
        created_at: DateTime<Utc>,
    ) -> String {
        let metadata_text = metadata
            .map(|value| {
                let mut canonical = value.clone();
                canonicalize_json(&mut canonical);
                canonical.to_string()
            })
            .unwrap_or_default();
        let parts = [
            tenant_id,
            actor,
            action,
            entity_type.unwrap_or(""),
            entity_id.unwrap_or(""),
            &metadata_text,
            previous_hash.unwrap_or(""),
            &created_at.to_rfc3339(),
        ];
        ContentHash::compute(parts.join("|").as_bytes()).to_hex()
    }

    /// The `entry_hash` of the newest entry in this tenant's chain.
    pub async fn latest_hash(&self) -> Result<Option<String>, CoreError> {
        let row = audit_log::Entity::find()
            .filter(audit_log::Column::TenantId.eq(&self.tenant_id))
            .order_by_desc(audit_log::Column::CreatedAt)
            .one(self.conn)
            .await?;
        Ok(row.map(|r| r.entry_hash))
    }

    /// Append an entry to the tenant's chain. Returns the entry id.
    pub async fn log(
        &self,
        actor: &str,
        action: &str,
        entity_type: Option<&str>,
        entity_id: Option<&str>,
        metadata: Option<Value>,
    ) -> Result<String, CoreError> {
        // Serialise chain appends per tenant: without this, two concurrent
        // writers can read the same head and fork the chain.
        if self.conn.get_database_backend() == DatabaseBackend::Postgres {
            let lock_key = format!("audit_chain_{}", self.tenant_id);
            let lock_id = advisory_lock_id(&lock_key);
            self.conn
                .execute(Statement::from_sql_and_values(
                    DatabaseBackend::Postgres,
                    "SELECT pg_advisory_xact_lock($1)",
                    [lock_id.into()],
                ))
                .await?;
        }
        // SQLite has single-writer semantics; no advisory lock needed.

        let entry_id = Uuid::new_v4().simple().to_string();
        let created_at = Utc::now();
        let previous_hash = self.latest_hash().await?;

        let entry_hash = Self::compute_hash(
            &self.tenant_id,
            actor,
            action,
            entity_type,
            entity_id,
            metadata.as_ref(),
            previous_hash.as_deref(),
            created_at,
        );

        let row = audit_log::ActiveModel {
            id: Set(entry_id.clone()),
            tenant_id: Set(self.tenant_id.clone()),
            actor: Set(actor.to_string()),
            action: Set(action.to_string()),
            entity_type: Set(entity_type.map(String::from)),
            entity_id: Set(entity_id.map(String::from)),
            metadata: Set(metadata),
            previous_hash: Set(previous_hash),
            entry_hash: Set(entry_hash),
            created_at: Set(created_at),
        };
        audit_log::Entity::insert(row)
            .exec_without_returning(self.conn)
            .await?;

        tracing::info!(
            "audit: tenant={} actor={actor} action={action} entity={}/{}",
            self.tenant_id,
            entity_type.unwrap_or("-"),
            entity_id.unwrap_or("-"),
        );
        Ok(entry_id)
    }

    /// Query entries, most recent first. All filters are optional.
    pub async fn query(
        &self,
        action: Option<&str>,
        entity_type: Option<&str>,
        since: Option<DateTime<Utc>>,
        limit: u64,
    ) -> Result<Vec<audit_log::Model>, CoreError> {
        let mut query = audit_log::Entity::find()
            .filter(audit_log::Column::TenantId.eq(&self.tenant_id));
        if let Some(action) = action {
            query = query.filter(audit_log::Column::Action.eq(action));
        }
        if let Some(entity_type) = entity_type {
            query = query.filter(audit_log::Column::EntityType.eq(entity_type));
        }
        if let Some(since) = since {
            query = query.filter(audit_log::Column::CreatedAt.gte(since));
        }
        let rows = query
            .order_by_desc(audit_log::Column::CreatedAt)
            .limit(limit)
            .all(self.conn)
            .await?;
        Ok(rows)
    }

    /// Verify the chain over the oldest `limit` entries.
    ///
    /// Recomputes each `entry_hash` and checks each `previous_hash` link.
    /// Returns `(is_valid, entries_checked)`; a break stops verification at
    /// the first bad entry. Detection only — the log is never repaired.
    pub async fn verify_chain(&self, limit: u64) -> Result<(bool, usize), CoreError> {
        let entries = audit_log::Entity::find()
            .filter(audit_log::Column::TenantId.eq(&self.tenant_id))
            .order_by_asc(audit_log::Column::CreatedAt)
            .limit(limit)
            .all(self.conn)
            .await?;

        let mut checked = 0;
        let mut previous_hash: Option<String> = None;

        for entry in &entries {
            if entry.previous_hash != previous_hash {
                tracing::warn!(
                    "audit chain break at entry {}: expected previous_hash={:?}, got={:?}",
                    entry.id,
                    previous_hash,
                    entry.previous_hash
                );
                return Ok((false, checked));
            }

            let expected_hash = Self::compute_hash(
                &entry.tenant_id,
                &entry.actor,
                &entry.action,
                entry.entity_type.as_deref(),
                entry.entity_id.as_deref(),
                entry.metadata.as_ref(),
                entry.previous_hash.as_deref(),
                entry.created_at,
            );
            if entry.entry_hash != expected_hash {
                tracing::warn!(
                    "audit hash mismatch at entry {}: stored={}, computed={}",
                    entry.id,
                    entry.entry_hash,
                    expected_hash
                );
                return Ok((false, checked));
            }

            previous_hash = Some(entry.entry_hash.clone());
            checked += 1;
        }

        Ok((true, checked))
    }
}

/// Positive 31-bit advisory lock id derived from a stable string.
fn advisory_lock_id(key: &str) -> i64 {
    let digest = ContentHash::compute(key.as_bytes());
    let bytes = digest.as_bytes();
    let raw = i64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]);
    raw & 0x7FFF_FFFF
}
