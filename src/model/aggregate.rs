use super::kind::EntityKind;
use crate::core::{AggregateId, EntityId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// How an aggregate reaches the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Each row is created/updated on its own, with debounced field saves.
    #[default]
    PerEntity,
    /// The whole aggregate is created/updated in one request.
    Atomic,
}

/// Predefined row the UI shows before it exists on the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub key: String,
    pub kind: EntityKind,
    #[serde(default)]
    pub defaults: BTreeMap<String, Value>,
}

impl Template {
    pub fn new(key: impl Into<String>, kind: EntityKind) -> Self {
        Self {
            key: key.into(),
            kind,
            defaults: BTreeMap::new(),
        }
    }

    pub fn with_default(mut self, field: impl Into<String>, value: Value) -> Self {
        self.defaults.insert(field.into(), value);
        self
    }
}

/// Persistence-atomic container of entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRoot {
    pub id: AggregateId,
    /// Server identifier, `None` until the aggregate has been created.
    #[serde(default)]
    pub remote_id: Option<String>,
    #[serde(default)]
    pub mode: SyncMode,
    /// Aggregate-level fields (e.g. `notes`).
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    /// References of attached files; the engine never transfers them.
    #[serde(default)]
    pub attachments: BTreeSet<String>,
    #[serde(default)]
    members: Vec<EntityId>,
    #[serde(default)]
    templates: BTreeMap<String, Template>,
    /// Aggregate-level values as the server last acknowledged them.
    #[serde(skip)]
    confirmed_fields: BTreeMap<String, Value>,
    #[serde(skip)]
    confirmed_attachments: BTreeSet<String>,
}

impl AggregateRoot {
    pub fn new(id: impl Into<AggregateId>, mode: SyncMode) -> Self {
        Self {
            id: id.into(),
            remote_id: None,
            mode,
            fields: BTreeMap::new(),
            attachments: BTreeSet::new(),
            members: Vec::new(),
            templates: BTreeMap::new(),
            confirmed_fields: BTreeMap::new(),
            confirmed_attachments: BTreeSet::new(),
        }
    }

    pub fn with_remote_id(mut self, remote_id: impl Into<String>) -> Self {
        self.remote_id = Some(remote_id.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn with_attachment(mut self, reference: impl Into<String>) -> Self {
        self.attachments.insert(reference.into());
        self
    }

    pub fn with_template(mut self, template: Template) -> Self {
        self.templates.insert(template.key.clone(), template);
        self
    }

    pub fn is_persisted(&self) -> bool {
        self.remote_id.is_some()
    }

    /// Identifier used on the wire: the server id when known.
    pub fn remote_key(&self) -> String {
        self.remote_id
            .clone()
            .unwrap_or_else(|| self.id.as_str().to_string())
    }

    pub fn template(&self, key: &str) -> Option<&Template> {
        self.templates.get(key.trim())
    }

    pub fn templates(&self) -> impl Iterator<Item = &Template> {
        self.templates.values()
    }

    pub fn members(&self) -> &[EntityId] {
        &self.members
    }

    pub(crate) fn add_member(&mut self, id: EntityId) {
        if !self.members.contains(&id) {
            self.members.push(id);
        }
    }

    pub(crate) fn remove_member(&mut self, id: &EntityId) -> bool {
        let before = self.members.len();
        self.members.retain(|member| member != id);
        before != self.members.len()
    }

    /// Records `sent` aggregate-level values as acknowledged by the server.
    pub(crate) fn confirm(&mut self, sent: &AggregateRoot) {
        self.confirmed_fields = sent.fields.clone();
        self.confirmed_attachments = sent.attachments.clone();
    }

    /// Undoes the aggregate-level edits carried by a rejected save.
    ///
    /// Values changed again since `sent` was taken are left alone.
    pub(crate) fn revert_unconfirmed(&mut self, sent: &AggregateRoot) {
        let names: BTreeSet<&String> = sent
            .fields
            .keys()
            .chain(self.confirmed_fields.keys())
            .collect();
        for name in names {
            if self.fields.get(name) != sent.fields.get(name) {
                continue;
            }
            match self.confirmed_fields.get(name) {
                Some(value) => {
                    self.fields.insert(name.clone(), value.clone());
                }
                None => {
                    self.fields.remove(name);
                }
            }
        }
        if self.attachments == sent.attachments {
            self.attachments = self.confirmed_attachments.clone();
        }
    }

    pub(crate) fn rename_member(&mut self, from: &EntityId, to: &EntityId) {
        for member in &mut self.members {
            if member == from {
                *member = to.clone();
            }
        }
    }
}
