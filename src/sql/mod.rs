//! Dialect-agnostic SQL toolkit.
//!
//! Provides parse, render, transpile, normalize, diff, safety, rewrite, and
//! column-lineage capabilities over a pluggable backend. Consumers obtain the
//! active backend through [`toolkit`] and interact only with the capability
//! traits in [`backend`] and the types in [`types`]; the parsing library is
//! an implementation detail of [`engine`].
//!
//! At most one backend instance exists per process. It is lazily constructed
//! on first use and immutable afterwards. Tests may swap the implementation
//! with [`register_implementation`] and restore the default with
//! [`reset_toolkit`].

pub mod backend;
pub mod engine;
pub mod types;

use std::sync::{Arc, RwLock};

use crate::sql::backend::SqlBackend;
use crate::sql::engine::ParserEngine;

type BackendFactory = Box<dyn Fn() -> Arc<dyn SqlBackend> + Send + Sync>;

static FACTORY: RwLock<Option<BackendFactory>> = RwLock::new(None);
static INSTANCE: RwLock<Option<Arc<dyn SqlBackend>>> = RwLock::new(None);

/// Return the active SQL backend, lazily constructing it on first call.
///
/// Defaults to the built-in [`ParserEngine`] when no custom factory has been
/// registered.
pub fn toolkit() -> Arc<dyn SqlBackend> {
    if let Some(instance) = INSTANCE.read().expect("toolkit lock poisoned").as_ref() {
        return Arc::clone(instance);
    }

    let mut slot = INSTANCE.write().expect("toolkit lock poisoned");
    // A racing caller may have installed the instance between the locks.
    if let Some(instance) = slot.as_ref() {
        return Arc::clone(instance);
    }

    let instance: Arc<dyn SqlBackend> = match FACTORY.read().expect("toolkit lock poisoned").as_ref()
    {
        Some(factory) => factory(),
        None => Arc::new(ParserEngine::new()),
    };
    *slot = Some(Arc::clone(&instance));
    instance
}

/// Register a factory for creating backend instances.
///
/// Called once at application startup; any existing instance is discarded so
/// the next [`toolkit`] call constructs through the new factory.
pub fn register_implementation<F>(factory: F)
where
    F: Fn() -> Arc<dyn SqlBackend> + Send + Sync + 'static,
{
    let mut factory_slot = FACTORY.write().expect("toolkit lock poisoned");
    let mut instance_slot = INSTANCE.write().expect("toolkit lock poisoned");
    *factory_slot = Some(Box::new(factory));
    *instance_slot = None;
}

/// Reset the singleton and any registered factory. **For testing only.**
pub fn reset_toolkit() {
    let mut factory_slot = FACTORY.write().expect("toolkit lock poisoned");
    let mut instance_slot = INSTANCE.write().expect("toolkit lock poisoned");
    *factory_slot = None;
    *instance_slot = None;
}
