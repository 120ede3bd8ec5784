//! Model catalogue: definitions, loading, and schema contracts.
pub mod contract;
pub mod definition;
pub mod loader;

pub use contract::{ContractSeverity, ContractViolation};
pub use definition::{
    ContractColumn, ContractMode, Materialization, ModelDefinition, ModelKind,
};
pub use loader::load_models_from_directory;
