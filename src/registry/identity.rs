use crate::core::EntityId;
use std::collections::HashMap;

/// Bidirectional placeholder <-> server identity map.
///
/// Handles taken before a row was created on the server keep resolving to the
/// live entity after the remap.
#[derive(Debug, Default, Clone)]
pub struct IdentityMap {
    forward: HashMap<EntityId, EntityId>,
    reverse: HashMap<EntityId, EntityId>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, placeholder: EntityId, real: EntityId) {
        self.reverse.insert(real.clone(), placeholder.clone());
        self.forward.insert(placeholder, real);
    }

    /// Live identity of `id`; unknown ids resolve to themselves.
    pub fn resolve(&self, id: &EntityId) -> EntityId {
        self.forward.get(id).cloned().unwrap_or_else(|| id.clone())
    }

    /// Placeholder a server identity was born from.
    pub fn origin(&self, real: &EntityId) -> Option<&EntityId> {
        self.reverse.get(real)
    }

    /// Drops both directions for an entity known by either identity.
    pub fn forget(&mut self, id: &EntityId) {
        if let Some(placeholder) = self.reverse.remove(id) {
            self.forward.remove(&placeholder);
        }
        if let Some(real) = self.forward.remove(id) {
            self.reverse.remove(&real);
        }
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_and_origin() {
        let mut map = IdentityMap::new();
        let placeholder: EntityId = "temp:lot-1/Delivery".parse().unwrap();
        let real = EntityId::persisted("srv-4");
        map.record(placeholder.clone(), real.clone());

        assert_eq!(map.resolve(&placeholder), real);
        assert_eq!(map.resolve(&real), real);
        assert_eq!(map.origin(&real), Some(&placeholder));
    }

    #[test]
    fn test_forget_by_either_side() {
        let mut map = IdentityMap::new();
        let placeholder = EntityId::Local("2".into());
        let real = EntityId::persisted("srv-9");
        map.record(placeholder.clone(), real.clone());
        map.forget(&real);
        assert!(map.is_empty());
        assert_eq!(map.resolve(&placeholder), placeholder);
    }
}
