//! Serializable shapes used to load server state into the registry.

use super::aggregate::{AggregateRoot, SyncMode, Template};
use super::entity::{Entity, MemberSet, PersistStatus};
use super::kind::EntityKind;
use crate::core::{AggregateId, EntityId, Result, SyncError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySeed {
    pub id: String,
    pub kind: EntityKind,
    #[serde(default)]
    pub template_key: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    #[serde(default)]
    pub relationships: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateSeed {
    pub id: String,
    #[serde(default)]
    pub remote_id: Option<String>,
    #[serde(default)]
    pub mode: SyncMode,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    #[serde(default)]
    pub attachments: BTreeSet<String>,
    #[serde(default)]
    pub templates: Vec<Template>,
    #[serde(default)]
    pub entities: Vec<EntitySeed>,
}

impl AggregateSeed {
    /// Splits the seed into the aggregate root and its loaded entities.
    ///
    /// Seeded rows of an aggregate that is already on the server are
    /// persisted; rows of a new aggregate are local drafts.
    pub fn into_parts(self) -> Result<(AggregateRoot, Vec<Entity>)> {
        let aggregate_id = AggregateId::new(self.id);
        let mut root = AggregateRoot::new(aggregate_id.clone(), self.mode);
        root.remote_id = self.remote_id;
        root.fields = self.fields;
        root.attachments = self.attachments;
        for template in self.templates {
            root = root.with_template(template);
        }

        let mut entities = Vec::with_capacity(self.entities.len());
        for seed in self.entities {
            let id: EntityId = seed.id.parse()?;
            let status = match (&id, root.is_persisted()) {
                (EntityId::Virtual(_), _) => {
                    return Err(SyncError::InvalidIdentifier(format!(
                        "seeded entity '{id}' cannot use a virtual identifier"
                    )));
                }
                (EntityId::Local(_), false) => PersistStatus::Virtual,
                _ => PersistStatus::Persisted,
            };
            let mut entity = Entity::new(id, aggregate_id.clone(), seed.kind, status);
            entity.template_key = seed.template_key;
            entity.fields = seed.fields;
            entity.relationships = seed
                .relationships
                .into_iter()
                .map(|(name, members)| (name, members.into_iter().collect::<MemberSet>()))
                .filter(|(_, members)| !members.is_empty())
                .collect();
            entities.push(entity);
        }
        Ok((root, entities))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_seed_into_parts() {
        let seed: AggregateSeed = serde_json::from_value(json!({
            "id": "lot-3",
            "remote_id": "lot-3",
            "templates": [{"key": "Delivery", "kind": {"kind": "stage"}}],
            "entities": [
                {"id": "st-1", "kind": {"kind": "stage"}, "fields": {"name": "Cutting"},
                 "relationships": {"assigned_to": ["emp-2", "emp-1"]}}
            ]
        }))
        .unwrap();

        let (root, entities) = seed.into_parts().unwrap();
        assert!(root.is_persisted());
        assert!(root.template("Delivery").is_some());
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].status, PersistStatus::Persisted);
        let members: Vec<String> = entities[0].relation("assigned_to").into_iter().collect();
        assert_eq!(members, vec!["emp-1".to_string(), "emp-2".to_string()]);
    }

    #[test]
    fn test_seed_rejects_virtual_ids() {
        let seed: AggregateSeed = serde_json::from_value(json!({
            "id": "lot-3",
            "entities": [{"id": "temp:lot-3/Delivery", "kind": {"kind": "stage"}}]
        }))
        .unwrap();
        assert!(seed.into_parts().is_err());
    }
}
