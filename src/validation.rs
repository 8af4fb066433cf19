//! Checks run before anything is dispatched to the server.
//!
//! Violations are reported per offending row and never roll back local state.

use crate::core::EntityId;
use crate::model::Entity;
use crate::snapshot::canonical_number;
use serde::Serialize;
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationReason {
    Missing,
    NotNumeric,
    NotPositive,
}

impl fmt::Display for ViolationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Missing => "is required",
            Self::NotNumeric => "must be a number",
            Self::NotPositive => "must be greater than zero",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowViolation {
    pub entity_id: EntityId,
    pub field: String,
    pub reason: ViolationReason,
}

impl fmt::Display for RowViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} {}", self.entity_id, self.field, self.reason)
    }
}

/// Checks one numeric value; `None` when it is acceptable.
pub fn check_numeric(value: Option<&Value>) -> Option<ViolationReason> {
    let Some(value) = value.filter(|value| match value {
        Value::String(text) => !text.trim().is_empty(),
        other => !other.is_null(),
    }) else {
        return Some(ViolationReason::Missing);
    };

    let Some(number) = canonical_number(value).and_then(|scalar| scalar.as_f64()) else {
        return Some(ViolationReason::NotNumeric);
    };

    if number > 0.0 {
        None
    } else {
        Some(ViolationReason::NotPositive)
    }
}

/// Validates the single field a debounced save is about to send.
pub fn check_field(entity: &Entity, field: &str) -> Vec<RowViolation> {
    if !entity.kind.is_numeric_field(field) {
        return Vec::new();
    }
    check_numeric(entity.field(field))
        .map(|reason| RowViolation {
            entity_id: entity.id.clone(),
            field: field.to_string(),
            reason,
        })
        .into_iter()
        .collect()
}

/// Validates a whole row. Rows the user has not touched yet are skipped.
pub fn validate_entity(entity: &Entity) -> Vec<RowViolation> {
    if !entity.has_content() {
        return Vec::new();
    }

    let mut violations = Vec::new();
    let identity_field = entity.kind.identity_field();
    let identity_missing = match entity.field(identity_field) {
        Some(Value::String(text)) => text.trim().is_empty(),
        Some(_) => false,
        None => true,
    };
    if identity_missing {
        violations.push(RowViolation {
            entity_id: entity.id.clone(),
            field: identity_field.to_string(),
            reason: ViolationReason::Missing,
        });
    }

    for numeric in entity.kind.numeric_fields() {
        if let Some(reason) = check_numeric(entity.field(numeric)) {
            violations.push(RowViolation {
                entity_id: entity.id.clone(),
                field: (*numeric).to_string(),
                reason,
            });
        }
    }
    violations
}

pub fn validate_rows<'a, I>(entities: I) -> Vec<RowViolation>
where
    I: IntoIterator<Item = &'a Entity>,
{
    entities.into_iter().flat_map(validate_entity).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AggregateId;
    use crate::model::{EntityKind, LineCategory, PersistStatus};
    use serde_json::json;

    fn slide(n: &str) -> Entity {
        Entity::new(
            EntityId::Local(n.into()),
            AggregateId::new("order-1"),
            EntityKind::line_item(LineCategory::Slide),
            PersistStatus::Virtual,
        )
    }

    #[test]
    fn test_check_numeric_reasons() {
        assert_eq!(check_numeric(None), Some(ViolationReason::Missing));
        assert_eq!(check_numeric(Some(&json!(" "))), Some(ViolationReason::Missing));
        assert_eq!(check_numeric(Some(&json!("x"))), Some(ViolationReason::NotNumeric));
        assert_eq!(check_numeric(Some(&json!(0))), Some(ViolationReason::NotPositive));
        assert_eq!(check_numeric(Some(&json!("-2"))), Some(ViolationReason::NotPositive));
        assert_eq!(check_numeric(Some(&json!("3"))), None);
    }

    #[test]
    fn test_rows_reported_individually() {
        let good = slide("1")
            .with_field("slide_id", json!("sl-1"))
            .with_field("quantity", json!(2));
        let zero = slide("2")
            .with_field("slide_id", json!("sl-2"))
            .with_field("quantity", json!(0));
        let orphan = slide("3").with_field("quantity", json!(5));
        let untouched = slide("4");

        let violations = validate_rows([&good, &zero, &orphan, &untouched]);
        assert_eq!(
            violations,
            vec![
                RowViolation {
                    entity_id: EntityId::Local("2".into()),
                    field: "quantity".into(),
                    reason: ViolationReason::NotPositive,
                },
                RowViolation {
                    entity_id: EntityId::Local("3".into()),
                    field: "slide_id".into(),
                    reason: ViolationReason::Missing,
                },
            ]
        );
    }

    #[test]
    fn test_check_field_ignores_text_fields() {
        let row = slide("1").with_field("quantity", json!(-1));
        assert!(check_field(&row, "slide_id").is_empty());
        assert_eq!(check_field(&row, "quantity").len(), 1);
    }
}
