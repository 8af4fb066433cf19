use crate::core::{AggregateId, EntityId};
use crate::model::{Entity, Slot};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Call the engine is about to make for one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PersistRequest {
    Create { payload: Value },
    Update { id: String, payload: Value },
}

impl PersistRequest {
    pub fn is_create(&self) -> bool {
        matches!(self, Self::Create { .. })
    }

    pub fn payload(&self) -> &Value {
        match self {
            Self::Create { payload } | Self::Update { payload, .. } => payload,
        }
    }
}

/// A dispatched request together with what it takes to undo it.
#[derive(Debug, Clone)]
pub struct PendingMutation {
    pub aggregate_id: AggregateId,
    pub entity_id: EntityId,
    /// The entity with the written slots at their last confirmed value.
    pub pre_state: Entity,
    pub slots: Vec<Slot>,
    pub request: PersistRequest,
    pub dispatched_at: DateTime<Utc>,
}
