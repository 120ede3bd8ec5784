//! Error types for the Tidemark crate.
//!
//! This module defines a unified error enumeration used across model loading,
//! planning, persistence, locking, and execution. It integrates with
//! `thiserror` to provide rich `Display` implementations and error source
//! chaining where applicable.
//!
//! Notes:
//! - Each variant corresponds to one category of the error taxonomy: input
//!   validation, authorization, conflict, not-found, integrity, transient,
//!   and fatal failures.
//! - SQL toolkit errors and database errors are wrapped via `#[from]`.

use thiserror::Error;

use crate::sql::types::{SafetyViolation, SqlToolkitError};

#[derive(Error, Debug)]
/// Unified error enumeration for the Tidemark control plane.
pub enum CoreError {
    /// Invalid caller input: bad dates, unknown model, chunk size < 1, etc.
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Caller lacks the role or approval required for the operation.
    #[error("Permission denied: {0}")]
    Unauthorized(String),

    /// Operation conflicts with current state (lock held, backfill exists).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Referenced entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The model dependency graph contains a cycle.
    #[error("Cycle detected in model graph: {0}")]
    CyclicGraph(String),

    /// A destructive SQL operation was detected by the safety guard.
    #[error("Destructive SQL rejected: {} violation(s) detected", violations.len())]
    UnsafeSql {
        /// The individual violations, most severe first.
        violations: Vec<SafetyViolation>,
    },

    /// A schema contract was broken for a model.
    #[error("Contract violation for model `{model}`: {detail}")]
    Contract { model: String, detail: String },

    /// Transient execution failure; the run is marked FAILED and the plan continues.
    #[error("Transient execution failure: {0}")]
    Transient(String),

    /// SQL toolkit failure (parse, normalize, transpile, lineage).
    #[error("SQL toolkit error: {0}")]
    Sql(#[from] SqlToolkitError),

    /// Database failure from the state store.
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    /// Plan or snapshot JSON could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error from the filesystem.
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    /// Fatal internal invariant breach (hash-chain break, corrupted state).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// True when the error represents a retryable, transient condition.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::Transient(_))
    }
}
