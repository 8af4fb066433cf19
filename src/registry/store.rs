use super::identity::IdentityMap;
use crate::core::{AggregateId, EntityId, Result, SyncError};
use crate::model::{AggregateRoot, Entity};
use crate::snapshot::{Snapshot, is_complete, normalize};
use std::collections::HashMap;

/// Every aggregate, entity and baseline the engine knows about.
///
/// Lookups go through the identity map, so a placeholder id handed out before
/// a create completed still finds the row afterwards.
#[derive(Debug, Default)]
pub struct EntityRegistry {
    aggregates: HashMap<AggregateId, AggregateRoot>,
    entities: HashMap<EntityId, Entity>,
    baselines: HashMap<AggregateId, Snapshot>,
    identities: IdentityMap,
    next_local: u64,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads an aggregate with its rows, replacing any previous copy.
    ///
    /// The loaded state becomes the baseline of a persisted aggregate; a new
    /// aggregate starts from the empty baseline.
    pub fn insert_aggregate(
        &mut self,
        mut root: AggregateRoot,
        entities: Vec<Entity>,
    ) -> Result<()> {
        if self.aggregates.contains_key(&root.id) {
            self.remove_aggregate(&root.id)?;
        }

        let aggregate_id = root.id.clone();
        let baseline = if root.is_persisted() {
            let loaded = root.clone();
            root.confirm(&loaded);
            normalize(&root, entities.iter().filter(|entity| !entity.is_virtual()))
        } else {
            Snapshot::empty(aggregate_id.clone())
        };
        self.aggregates.insert(aggregate_id.clone(), root);
        for entity in entities {
            self.insert_entity(entity)?;
        }
        self.baselines.insert(aggregate_id, baseline);
        Ok(())
    }

    pub fn insert_entity(&mut self, entity: Entity) -> Result<()> {
        if self.entities.contains_key(&entity.id) {
            return Err(SyncError::IdentityConflict(format!(
                "entity '{}' already exists",
                entity.id
            )));
        }
        let root = self
            .aggregates
            .get_mut(&entity.aggregate_id)
            .ok_or_else(|| SyncError::AggregateNotFound(entity.aggregate_id.to_string()))?;
        root.add_member(entity.id.clone());

        if let EntityId::Local(key) = &entity.id {
            if let Ok(n) = key.parse::<u64>() {
                self.next_local = self.next_local.max(n);
            }
        }
        self.entities.insert(entity.id.clone(), entity);
        Ok(())
    }

    /// Fresh `row:<n>` identity.
    pub fn next_local_id(&mut self) -> EntityId {
        self.next_local += 1;
        EntityId::Local(self.next_local.to_string())
    }

    pub fn resolve(&self, id: &EntityId) -> EntityId {
        self.identities.resolve(id)
    }

    /// Identity that stays stable across a remap: the placeholder the entity
    /// was born with, or its own id.
    pub fn queue_key(&self, id: &EntityId) -> EntityId {
        let live = self.resolve(id);
        self.identities.origin(&live).cloned().unwrap_or(live)
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.entities.contains_key(&self.resolve(id))
    }

    pub fn entity(&self, id: &EntityId) -> Result<&Entity> {
        self.entities
            .get(&self.resolve(id))
            .ok_or_else(|| SyncError::EntityNotFound(id.to_string()))
    }

    pub fn entity_mut(&mut self, id: &EntityId) -> Result<&mut Entity> {
        let live = self.resolve(id);
        self.entities
            .get_mut(&live)
            .ok_or_else(|| SyncError::EntityNotFound(id.to_string()))
    }

    pub fn aggregate(&self, id: &AggregateId) -> Result<&AggregateRoot> {
        self.aggregates
            .get(id)
            .ok_or_else(|| SyncError::AggregateNotFound(id.to_string()))
    }

    pub fn aggregate_mut(&mut self, id: &AggregateId) -> Result<&mut AggregateRoot> {
        self.aggregates
            .get_mut(id)
            .ok_or_else(|| SyncError::AggregateNotFound(id.to_string()))
    }

    pub fn aggregate_ids(&self) -> Vec<AggregateId> {
        let mut ids: Vec<AggregateId> = self.aggregates.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Rows of an aggregate in insertion order.
    pub fn members(&self, aggregate: &AggregateId) -> Result<Vec<&Entity>> {
        let root = self.aggregate(aggregate)?;
        Ok(root
            .members()
            .iter()
            .filter_map(|id| self.entities.get(id))
            .collect())
    }

    /// Removes one entity and every edge pointing at it.
    pub fn remove_entity(&mut self, id: &EntityId) -> Result<Entity> {
        let live = self.resolve(id);
        let entity = self
            .entities
            .remove(&live)
            .ok_or_else(|| SyncError::EntityNotFound(id.to_string()))?;

        if let Some(root) = self.aggregates.get_mut(&entity.aggregate_id) {
            root.remove_member(&live);
        }
        let mut handles = vec![live.to_string()];
        if let Some(origin) = self.identities.origin(&live) {
            handles.push(origin.to_string());
        }
        for other in self.entities.values_mut() {
            for handle in &handles {
                other.drop_member(handle);
            }
        }
        self.identities.forget(&live);
        Ok(entity)
    }

    pub fn remove_aggregate(&mut self, id: &AggregateId) -> Result<(AggregateRoot, Vec<Entity>)> {
        let members: Vec<EntityId> = self.aggregate(id)?.members().to_vec();
        let mut removed = Vec::with_capacity(members.len());
        for member in members {
            removed.push(self.remove_entity(&member)?);
        }
        self.baselines.remove(id);
        let root = self
            .aggregates
            .remove(id)
            .ok_or_else(|| SyncError::AggregateNotFound(id.to_string()))?;
        Ok((root, removed))
    }

    /// Replaces a provisional identity by the server's.
    ///
    /// The row, its aggregate membership and every edge naming the old id move
    /// in one step; the old id keeps resolving through the identity map.
    pub fn remap(&mut self, from: &EntityId, to: EntityId) -> Result<()> {
        let live = self.resolve(from);
        if live == to {
            return Ok(());
        }
        if self.entities.contains_key(&to) {
            return Err(SyncError::IdentityConflict(format!(
                "cannot replace '{}' by '{}': target already exists",
                live, to
            )));
        }
        let mut entity = self
            .entities
            .remove(&live)
            .ok_or_else(|| SyncError::EntityNotFound(from.to_string()))?;
        entity.id = to.clone();

        if let Some(root) = self.aggregates.get_mut(&entity.aggregate_id) {
            root.rename_member(&live, &to);
        }
        let (old_handle, new_handle) = (live.to_string(), to.to_string());
        entity.rename_member(&old_handle, &new_handle);
        for other in self.entities.values_mut() {
            other.rename_member(&old_handle, &new_handle);
        }
        self.entities.insert(to.clone(), entity);
        self.identities.record(live, to);
        Ok(())
    }

    /// Current projection of an aggregate, pending edits included.
    pub fn snapshot(&self, aggregate: &AggregateId) -> Result<Snapshot> {
        let root = self.aggregate(aggregate)?;
        let members = self.members(aggregate)?;
        Ok(normalize(root, members))
    }

    pub fn baseline(&self, aggregate: &AggregateId) -> Result<Snapshot> {
        self.aggregate(aggregate)?;
        Ok(self
            .baselines
            .get(aggregate)
            .cloned()
            .unwrap_or_else(|| Snapshot::empty(aggregate.clone())))
    }

    pub fn set_baseline(&mut self, aggregate: &AggregateId, baseline: Snapshot) -> Result<()> {
        self.aggregate(aggregate)?;
        self.baselines.insert(aggregate.clone(), baseline);
        Ok(())
    }

    /// Recomputes the rows of the baseline from what the server has confirmed.
    ///
    /// Aggregate-level values only change through an aggregate save, so they
    /// are carried over from the previous baseline.
    pub fn refresh_baseline(&mut self, aggregate: &AggregateId) -> Result<Snapshot> {
        let previous = self.baseline(aggregate)?;
        let root = self.aggregate(aggregate)?;
        let confirmed: Vec<Entity> = self
            .members(aggregate)?
            .into_iter()
            .filter(|entity| !entity.is_virtual())
            .map(Entity::confirmed)
            .collect();
        let mut next = normalize(root, &confirmed);
        next.fields = previous.fields;
        next.attachments = previous.attachments;
        self.baselines.insert(aggregate.clone(), next.clone());
        Ok(next)
    }

    /// Rows the server knows about.
    pub fn persisted_count(&self, aggregate: &AggregateId) -> Result<usize> {
        Ok(self
            .members(aggregate)?
            .iter()
            .filter(|entity| !entity.is_virtual())
            .count())
    }

    /// Rows that take part in the aggregate's projection.
    pub fn complete_count(&self, aggregate: &AggregateId) -> Result<usize> {
        Ok(self
            .members(aggregate)?
            .iter()
            .filter(|entity| is_complete(entity))
            .count())
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityKind, PersistStatus, SyncMode};
    use serde_json::json;

    fn loaded() -> EntityRegistry {
        let mut registry = EntityRegistry::new();
        let lot = AggregateId::new("lot-1");
        let root = AggregateRoot::new(lot.clone(), SyncMode::PerEntity).with_remote_id("lot-1");
        let cutting = Entity::persisted("st-1", lot.clone(), EntityKind::Stage)
            .with_field("name", json!("Cutting"));
        let helper = Entity::new(
            EntityId::virtual_for(&lot, "Helper"),
            lot.clone(),
            EntityKind::Stage,
            PersistStatus::Virtual,
        )
        .with_field("name", json!("Helper"));
        let linked = Entity::persisted("st-2", lot, EntityKind::Stage)
            .with_field("name", json!("Assembly"))
            .with_members("depends_on", ["temp:lot-1/Helper", "st-1"]);
        registry
            .insert_aggregate(root, vec![cutting, helper, linked])
            .unwrap();
        registry
    }

    #[test]
    fn test_loaded_state_is_baseline() {
        let registry = loaded();
        let lot = AggregateId::new("lot-1");
        assert_eq!(registry.snapshot(&lot).unwrap().rows.len(), 3);
        // The virtual row is not on the server yet.
        assert_eq!(registry.baseline(&lot).unwrap().rows.len(), 2);
        assert_eq!(registry.persisted_count(&lot).unwrap(), 2);
    }

    #[test]
    fn test_remap_moves_edges_and_keeps_old_handle() {
        let mut registry = loaded();
        let placeholder: EntityId = "temp:lot-1/Helper".parse().unwrap();
        registry
            .remap(&placeholder, EntityId::persisted("st-9"))
            .unwrap();

        assert_eq!(registry.entity(&placeholder).unwrap().id, EntityId::persisted("st-9"));
        assert_eq!(registry.queue_key(&EntityId::persisted("st-9")), placeholder);
        let linked = registry.entity(&EntityId::persisted("st-2")).unwrap();
        assert!(linked.relation("depends_on").contains("st-9"));
        assert!(!linked.relation("depends_on").contains("temp:lot-1/Helper"));
    }

    #[test]
    fn test_remap_onto_existing_id_conflicts() {
        let mut registry = loaded();
        let placeholder: EntityId = "temp:lot-1/Helper".parse().unwrap();
        let err = registry
            .remap(&placeholder, EntityId::persisted("st-1"))
            .unwrap_err();
        assert!(matches!(err, SyncError::IdentityConflict(_)));
        assert!(registry.contains(&placeholder));
    }

    #[test]
    fn test_remove_entity_drops_edges() {
        let mut registry = loaded();
        registry.remove_entity(&EntityId::persisted("st-1")).unwrap();
        let linked = registry.entity(&EntityId::persisted("st-2")).unwrap();
        assert!(!linked.relation("depends_on").contains("st-1"));
        assert_eq!(registry.members(&AggregateId::new("lot-1")).unwrap().len(), 2);
    }

    #[test]
    fn test_refresh_baseline_ignores_pending_edits() {
        let mut registry = loaded();
        let lot = AggregateId::new("lot-1");
        registry
            .entity_mut(&EntityId::persisted("st-1"))
            .unwrap()
            .stage_field("name", json!("Sawing"));
        let before = registry.baseline(&lot).unwrap();
        assert_eq!(registry.refresh_baseline(&lot).unwrap(), before);
        assert_ne!(registry.snapshot(&lot).unwrap(), before);
    }

    #[test]
    fn test_local_ids_do_not_collide_with_loaded_rows() {
        let mut registry = EntityRegistry::new();
        let order = AggregateId::new("order-1");
        let row = Entity::new(
            EntityId::Local("7".into()),
            order.clone(),
            EntityKind::Note,
            PersistStatus::Virtual,
        );
        registry
            .insert_aggregate(AggregateRoot::new(order, SyncMode::Atomic), vec![row])
            .unwrap();
        assert_eq!(registry.next_local_id(), EntityId::Local("8".into()));
    }
}
