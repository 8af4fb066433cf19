use super::store::EntityRegistry;
use crate::core::{EntityId, Result};
use crate::model::MemberSet;

/// `set` with `member` flipped: removed when present, added otherwise.
pub fn toggled(set: &MemberSet, member: &str) -> MemberSet {
    let mut next = set.clone();
    if next.remove(member).is_none() {
        next.insert(member.to_string());
    }
    next
}

/// Flips `member` in `relation` of an entity and stages the new set.
pub fn toggle_membership(
    registry: &mut EntityRegistry,
    id: &EntityId,
    relation: &str,
    member: &str,
) -> Result<MemberSet> {
    let entity = registry.entity_mut(id)?;
    let next = toggled(&entity.relation(relation), member.trim());
    entity.stage_relation(relation, next.clone());
    Ok(next)
}
