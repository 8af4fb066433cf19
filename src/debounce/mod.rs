// ============================================================================
// Debounce
// ============================================================================
//
// Collapses bursts of edits into one persistence call per quiet window.
// Timers are keyed by subject (an entity id, or an aggregate for whole
// aggregate saves) and operation (the edited field, or `save`).
//
// ============================================================================

pub mod coalescer;

pub use coalescer::DebounceCoalescer;

use crate::core::{AggregateId, EntityId};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TimerKey {
    pub subject: String,
    pub operation: String,
}

impl TimerKey {
    pub fn new(subject: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            operation: operation.into(),
        }
    }

    /// Debounced save of one field of one entity.
    pub fn field(entity: &EntityId, field: &str) -> Self {
        Self::new(entity.to_string(), format!("field:{}", field))
    }

    /// Debounced save of a whole atomically persisted aggregate.
    pub fn aggregate_save(aggregate: &AggregateId) -> Self {
        Self::new(Self::aggregate_subject(aggregate), "save")
    }

    pub fn aggregate_subject(aggregate: &AggregateId) -> String {
        format!("aggregate:{}", aggregate)
    }
}

impl fmt::Display for TimerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.subject, self.operation)
    }
}
