use super::store::EntityRegistry;
use crate::core::{AggregateId, EntityId, Result, SyncError};
use crate::model::{Entity, PersistStatus};

/// Result of [`ensure_materialized`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Materialization {
    /// A row for the template already existed (virtual or persisted).
    Existing(EntityId),
    /// A new virtual row was added to the registry.
    Created(EntityId),
}

impl Materialization {
    pub fn id(&self) -> &EntityId {
        match self {
            Self::Existing(id) | Self::Created(id) => id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Makes sure the template row `key` of `aggregate` exists locally.
///
/// Idempotent: calling it again returns the row produced the first time,
/// including after that row was created on the server under a new id.
pub fn ensure_materialized(
    registry: &mut EntityRegistry,
    aggregate: &AggregateId,
    key: &str,
) -> Result<Materialization> {
    let key = key.trim();
    let root = registry.aggregate(aggregate)?;
    let template = root
        .template(key)
        .cloned()
        .ok_or_else(|| SyncError::UnknownTemplate {
            aggregate: aggregate.to_string(),
            key: key.to_string(),
        })?;

    let placeholder = EntityId::virtual_for(aggregate, key);
    if registry.contains(&placeholder) {
        return Ok(Materialization::Existing(registry.resolve(&placeholder)));
    }
    if let Some(existing) = registry
        .members(aggregate)?
        .into_iter()
        .find(|entity| entity.template_key.as_deref() == Some(key))
    {
        return Ok(Materialization::Existing(existing.id.clone()));
    }

    let mut entity = Entity::new(
        placeholder.clone(),
        aggregate.clone(),
        template.kind.clone(),
        PersistStatus::Virtual,
    )
    .with_template_key(key);
    for (field, value) in template.defaults {
        entity = entity.with_field(field, value);
    }
    registry.insert_entity(entity)?;
    Ok(Materialization::Created(placeholder))
}

/// Materializes the template row a placeholder id stands for, when that row
/// is not in the registry yet.
///
/// Returns `None` for ids that are registered or do not name a template.
pub fn materialize_placeholder(
    registry: &mut EntityRegistry,
    id: &EntityId,
) -> Result<Option<Materialization>> {
    let EntityId::Virtual(key) = id else {
        return Ok(None);
    };
    if registry.contains(id) {
        return Ok(None);
    }
    // Aggregate ids may themselves contain '/'.
    for (split, _) in key.match_indices('/') {
        let aggregate = AggregateId::new(&key[..split]);
        let template = &key[split + 1..];
        let known = registry
            .aggregate(&aggregate)
            .is_ok_and(|root| root.template(template).is_some());
        if known {
            return ensure_materialized(registry, &aggregate, template).map(Some);
        }
    }
    Ok(None)
}

/// Swaps the placeholder for the id the server assigned.
pub fn commit_materialization(
    registry: &mut EntityRegistry,
    placeholder: &EntityId,
    assigned: EntityId,
) -> Result<()> {
    registry.remap(placeholder, assigned.clone())?;
    registry.entity_mut(&assigned)?.status = PersistStatus::Persisted;
    Ok(())
}
