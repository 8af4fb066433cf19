// ============================================================================
// Entity Registry
// ============================================================================
//
// The single shared mutable resource of the engine. Aggregates, rows,
// baselines and the placeholder <-> server identity map live in one
// `EntityRegistry` behind one lock. Async code reaches it only through the
// closure helpers of `SharedRegistry`, so no guard ever lives across an
// `.await`.
//
// ============================================================================

pub mod identity;
pub mod materializer;
pub mod store;
pub mod toggler;

pub use identity::IdentityMap;
pub use materializer::{
    Materialization, commit_materialization, ensure_materialized, materialize_placeholder,
};
pub use store::EntityRegistry;
pub use toggler::{toggle_membership, toggled};

use crate::core::Result;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Default)]
pub struct SharedRegistry {
    inner: Arc<RwLock<EntityRegistry>>,
}

impl SharedRegistry {
    pub fn new(registry: EntityRegistry) -> Self {
        Self {
            inner: Arc::new(RwLock::new(registry)),
        }
    }

    pub fn read<T>(&self, f: impl FnOnce(&EntityRegistry) -> Result<T>) -> Result<T> {
        let guard = self.inner.read()?;
        f(&guard)
    }

    pub fn write<T>(&self, f: impl FnOnce(&mut EntityRegistry) -> Result<T>) -> Result<T> {
        let mut guard = self.inner.write()?;
        f(&mut guard)
    }
}
