// ============================================================================
// optisync Library
// ============================================================================
//
// Optimistic synchronization of editable tables against a remote API:
// debounced field saves, lazily created template rows, snapshot based dirty
// tracking and exact rollback of failed writes.
//
// ============================================================================

pub mod client;
pub mod config;
pub mod core;
pub mod debounce;
pub mod engine;
pub mod model;
pub mod registry;
pub mod rollback;
pub mod snapshot;
pub mod validation;

// Re-export main types for convenience
pub use client::{FailureMode, InMemorySyncClient, SyncClient, SyncResponse};
pub use config::EngineConfig;
pub use core::{AggregateId, EntityId, Result, SyncError};
pub use debounce::{DebounceCoalescer, TimerKey};
pub use engine::{BatchFailure, BatchReport, SaveOutcome, SyncEngine, SyncEvent};
pub use model::{
    AggregateRoot, AggregateSeed, Entity, EntityKind, EntitySeed, LineCategory, MemberSet,
    PersistStatus, Slot, SyncMode, Template,
};
pub use rollback::{AttemptOutcome, PersistRequest};
pub use snapshot::{Scalar, Snapshot, SnapshotRow};
pub use validation::{RowViolation, ViolationReason};
