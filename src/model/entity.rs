use super::kind::EntityKind;
use crate::core::{AggregateId, EntityId};
use im::OrdSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Membership of a many-to-many relation (foreign identifiers, sorted).
pub type MemberSet = OrdSet<String>;

/// Persistence status of an entity.
///
/// `Virtual -> Materializing -> Persisted`, `Persisted -> Saving -> Persisted`.
/// A failed create falls back to `Virtual`, a failed save to `Persisted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistStatus {
    Virtual,
    Materializing,
    Persisted,
    Saving,
}

/// Addressable piece of an entity's editable surface.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "slot", content = "name", rename_all = "snake_case")]
pub enum Slot {
    Field(String),
    Relation(String),
}

impl Slot {
    pub fn field(name: impl Into<String>) -> Self {
        Self::Field(name.into())
    }

    pub fn relation(name: impl Into<String>) -> Self {
        Self::Relation(name.into())
    }
}

/// Value stored in a [`Slot`]. An absent field is `Field(None)`.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotValue {
    Field(Option<Value>),
    Relation(MemberSet),
}

/// Which slots a persistence request carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadScope {
    /// Only the slots written by the mutation.
    Slots,
    /// Every field and relation of the entity.
    Full,
}

/// Field and relation values sent to the server for one entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EntityPayload {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub relationships: BTreeMap<String, Vec<String>>,
}

impl EntityPayload {
    pub fn slot_values(&self) -> Vec<(Slot, SlotValue)> {
        let fields = self.fields.iter().map(|(name, value)| {
            let value = if value.is_null() {
                None
            } else {
                Some(value.clone())
            };
            (Slot::Field(name.clone()), SlotValue::Field(value))
        });
        let relations = self.relationships.iter().map(|(name, members)| {
            (
                Slot::Relation(name.clone()),
                SlotValue::Relation(members.iter().cloned().collect()),
            )
        });
        fields.chain(relations).collect()
    }
}

/// Unit of synchronized state.
///
/// Besides its visible values, an entity remembers the last confirmed value of
/// every slot that was changed locally and not yet acknowledged by the server
/// (`origins`). That record is what rollback restores and what the dirty gate
/// consults before dispatching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub aggregate_id: AggregateId,
    pub kind: EntityKind,
    #[serde(default)]
    pub template_key: Option<String>,
    pub status: PersistStatus,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    #[serde(default)]
    pub relationships: BTreeMap<String, MemberSet>,
    #[serde(skip)]
    origins: BTreeMap<Slot, SlotValue>,
}

impl Entity {
    pub fn new(
        id: EntityId,
        aggregate_id: AggregateId,
        kind: EntityKind,
        status: PersistStatus,
    ) -> Self {
        Self {
            id,
            aggregate_id,
            kind,
            template_key: None,
            status,
            fields: BTreeMap::new(),
            relationships: BTreeMap::new(),
            origins: BTreeMap::new(),
        }
    }

    /// Entity as loaded from the server.
    pub fn persisted(id: impl Into<String>, aggregate_id: AggregateId, kind: EntityKind) -> Self {
        Self::new(
            EntityId::Persisted(id.into()),
            aggregate_id,
            kind,
            PersistStatus::Persisted,
        )
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        let name = name.into();
        self.write_slot(&Slot::Field(name), SlotValue::Field(Some(value)));
        self
    }

    pub fn with_members<I, S>(mut self, relation: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let members: MemberSet = members.into_iter().map(Into::into).collect();
        self.relationships.insert(relation.into(), members);
        self
    }

    pub fn with_template_key(mut self, key: impl Into<String>) -> Self {
        self.template_key = Some(key.into());
        self
    }

    /// Virtual until the server has acknowledged a create.
    pub fn is_virtual(&self) -> bool {
        matches!(
            self.status,
            PersistStatus::Virtual | PersistStatus::Materializing
        )
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).filter(|value| !value.is_null())
    }

    pub fn relation(&self, name: &str) -> MemberSet {
        self.relationships.get(name).cloned().unwrap_or_default()
    }

    pub fn read_slot(&self, slot: &Slot) -> SlotValue {
        match slot {
            Slot::Field(name) => SlotValue::Field(self.field(name).cloned()),
            Slot::Relation(name) => SlotValue::Relation(self.relation(name)),
        }
    }

    fn write_slot(&mut self, slot: &Slot, value: SlotValue) {
        match (slot, value) {
            (Slot::Field(name), SlotValue::Field(Some(value))) if !value.is_null() => {
                self.fields.insert(name.clone(), value);
            }
            (Slot::Field(name), SlotValue::Field(_) | SlotValue::Relation(_)) => {
                self.fields.remove(name);
            }
            (Slot::Relation(name), SlotValue::Relation(members)) => {
                if members.is_empty() {
                    self.relationships.remove(name);
                } else {
                    self.relationships.insert(name.clone(), members);
                }
            }
            (Slot::Relation(name), SlotValue::Field(_)) => {
                self.relationships.remove(name);
            }
        }
    }

    /// Applies an optimistic local change, remembering the confirmed value.
    ///
    /// Returns `false` when the slot already held `value`. Writing the
    /// confirmed value back clears the pending marker.
    pub fn stage(&mut self, slot: Slot, value: SlotValue) -> bool {
        let current = self.read_slot(&slot);
        if current == value {
            return false;
        }

        match self.origins.get(&slot) {
            Some(origin) if *origin == value => {
                self.origins.remove(&slot);
            }
            Some(_) => {}
            None => {
                self.origins.insert(slot.clone(), current);
            }
        }
        self.write_slot(&slot, value);
        true
    }

    pub fn stage_field(&mut self, name: &str, value: Value) -> bool {
        let value = if value.is_null() { None } else { Some(value) };
        self.stage(Slot::field(name), SlotValue::Field(value))
    }

    pub fn stage_relation(&mut self, name: &str, members: MemberSet) -> bool {
        self.stage(Slot::relation(name), SlotValue::Relation(members))
    }

    pub fn is_unsettled(&self, slot: &Slot) -> bool {
        self.origins.contains_key(slot)
    }

    pub fn has_unsettled(&self) -> bool {
        !self.origins.is_empty()
    }

    pub fn unsettled_slots(&self) -> impl Iterator<Item = &Slot> {
        self.origins.keys()
    }

    /// Copy of this entity with `slots` back at their confirmed values.
    pub fn with_slots_reverted(&self, slots: &[Slot]) -> Entity {
        let mut copy = self.clone();
        for slot in slots {
            if let Some(origin) = copy.origins.remove(slot) {
                copy.write_slot(slot, origin);
            }
        }
        copy
    }

    /// Copy of this entity as the server last confirmed it.
    pub fn confirmed(&self) -> Entity {
        let slots: Vec<Slot> = self.origins.keys().cloned().collect();
        self.with_slots_reverted(&slots)
    }

    /// Puts `slots` back to the values they hold in `pre_state`.
    pub fn restore_slots(&mut self, pre_state: &Entity, slots: &[Slot]) {
        for slot in slots {
            let value = pre_state.read_slot(slot);
            self.write_slot(slot, value);
            match pre_state.origins.get(slot) {
                Some(origin) => {
                    self.origins.insert(slot.clone(), origin.clone());
                }
                None => {
                    self.origins.remove(slot);
                }
            }
        }
    }

    /// Records the server's acknowledgement of `sent` values.
    ///
    /// A slot edited again while the request was in flight stays pending, with
    /// the acknowledged value as its new confirmed value.
    pub fn settle(&mut self, sent: &[(Slot, SlotValue)]) {
        for (slot, value) in sent {
            if self.read_slot(slot) == *value {
                self.origins.remove(slot);
            } else {
                self.origins.insert(slot.clone(), value.clone());
            }
        }
    }

    /// Settles every pending slot against a copy taken when a request was built.
    pub fn settle_against(&mut self, sent: &Entity) {
        let pending: Vec<Slot> = self.origins.keys().cloned().collect();
        let acknowledged: Vec<(Slot, SlotValue)> = pending
            .into_iter()
            .map(|slot| {
                let value = sent.read_slot(&slot);
                (slot, value)
            })
            .collect();
        self.settle(&acknowledged);
    }

    pub fn payload(&self, slots: &[Slot], scope: PayloadScope) -> EntityPayload {
        let mut payload = EntityPayload::default();
        match scope {
            PayloadScope::Full => {
                payload.fields = self
                    .fields
                    .iter()
                    .filter(|(_, value)| !value.is_null())
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect();
                payload.relationships = self
                    .relationships
                    .iter()
                    .map(|(name, members)| (name.clone(), members.iter().cloned().collect()))
                    .collect();
                // Cleared slots still have to reach the server.
                for slot in slots {
                    match self.read_slot(slot) {
                        SlotValue::Field(None) => {
                            if let Slot::Field(name) = slot {
                                payload.fields.insert(name.clone(), Value::Null);
                            }
                        }
                        SlotValue::Relation(members) if members.is_empty() => {
                            if let Slot::Relation(name) = slot {
                                payload.relationships.insert(name.clone(), Vec::new());
                            }
                        }
                        _ => {}
                    }
                }
            }
            PayloadScope::Slots => {
                for slot in slots {
                    match (slot, self.read_slot(slot)) {
                        (Slot::Field(name), SlotValue::Field(value)) => {
                            payload
                                .fields
                                .insert(name.clone(), value.unwrap_or(Value::Null));
                        }
                        (Slot::Relation(name), SlotValue::Relation(members)) => {
                            payload
                                .relationships
                                .insert(name.clone(), members.iter().cloned().collect());
                        }
                        _ => {}
                    }
                }
            }
        }
        payload
    }

    /// Replaces `from` by `to` in every relation. Returns whether anything moved.
    pub fn rename_member(&mut self, from: &str, to: &str) -> bool {
        let mut moved = false;
        for members in self.relationships.values_mut() {
            if members.remove(from).is_some() {
                members.insert(to.to_string());
                moved = true;
            }
        }
        for origin in self.origins.values_mut() {
            if let SlotValue::Relation(members) = origin {
                if members.remove(from).is_some() {
                    members.insert(to.to_string());
                }
            }
        }
        moved
    }

    /// Drops `member` from every relation.
    pub fn drop_member(&mut self, member: &str) -> bool {
        let mut dropped = false;
        for members in self.relationships.values_mut() {
            dropped |= members.remove(member).is_some();
        }
        self.relationships.retain(|_, members| !members.is_empty());
        for origin in self.origins.values_mut() {
            if let SlotValue::Relation(members) = origin {
                members.remove(member);
            }
        }
        dropped
    }

    /// True when the user has typed anything into the row.
    pub fn has_content(&self) -> bool {
        self.fields.values().any(|value| match value {
            Value::Null => false,
            Value::String(text) => !text.trim().is_empty(),
            _ => true,
        }) || self.relationships.values().any(|members| !members.is_empty())
    }
}
