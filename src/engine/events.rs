use crate::core::{AggregateId, EntityId};
use crate::model::Slot;
use crate::validation::RowViolation;
use serde::Serialize;

/// Notifications published on the engine's broadcast channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    EntityChanged {
        aggregate_id: AggregateId,
        entity_id: EntityId,
        slot: Slot,
    },
    Materialized {
        aggregate_id: AggregateId,
        entity_id: EntityId,
        template_key: String,
    },
    Committed {
        aggregate_id: AggregateId,
        entity_id: EntityId,
        #[serde(skip_serializing_if = "Option::is_none")]
        remapped_from: Option<EntityId>,
    },
    RolledBack {
        aggregate_id: AggregateId,
        entity_id: EntityId,
        error: String,
    },
    ValidationFailed {
        aggregate_id: AggregateId,
        violations: Vec<RowViolation>,
    },
    EntityRemoved {
        aggregate_id: AggregateId,
        entity_id: EntityId,
    },
    CascadeConfirmationRequired {
        aggregate_id: AggregateId,
        entity_id: EntityId,
    },
    AggregateSaved {
        aggregate_id: AggregateId,
        remote_id: String,
        created: bool,
    },
    SaveFailed {
        aggregate_id: AggregateId,
        error: String,
    },
    AggregateRemoved {
        aggregate_id: AggregateId,
    },
}

impl SyncEvent {
    pub fn aggregate_id(&self) -> &AggregateId {
        match self {
            Self::EntityChanged { aggregate_id, .. }
            | Self::Materialized { aggregate_id, .. }
            | Self::Committed { aggregate_id, .. }
            | Self::RolledBack { aggregate_id, .. }
            | Self::ValidationFailed { aggregate_id, .. }
            | Self::EntityRemoved { aggregate_id, .. }
            | Self::CascadeConfirmationRequired { aggregate_id, .. }
            | Self::AggregateSaved { aggregate_id, .. }
            | Self::SaveFailed { aggregate_id, .. }
            | Self::AggregateRemoved { aggregate_id } => aggregate_id,
        }
    }
}
