//! Plan execution: compute backends, the orchestrator, the backfill engine,
//! and reconciliation.
pub mod backend;
pub mod backfill;
pub mod local;
pub mod orchestrator;
pub mod reconcile;
pub mod warehouse;

pub use backend::{ComputeBackend, ExecutionParams, RemoteRun, RunResult, EXECUTOR_VERSION};
pub use backfill::{compute_chunks, BackfillOutcome, BackfillReport, BackfillStatus};
pub use local::LocalExecutor;
pub use orchestrator::{ExecutionService, Role};
pub use reconcile::ReconciliationService;
pub use warehouse::WarehouseExecutor;
