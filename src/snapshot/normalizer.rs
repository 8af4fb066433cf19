use super::{Scalar, Snapshot, SnapshotRow};
use crate::model::{AggregateRoot, Entity};
use serde_json::{Number, Value};
use std::collections::BTreeMap;

/// Projects an aggregate's editable surface into its comparable form.
///
/// Pure and total: rows without an identity (or without a required numeric
/// value) are in-progress input and are left out instead of failing.
pub fn normalize<'a, I>(root: &AggregateRoot, entities: I) -> Snapshot
where
    I: IntoIterator<Item = &'a Entity>,
{
    let mut rows: Vec<SnapshotRow> = entities
        .into_iter()
        .filter(|entity| entity.aggregate_id == root.id)
        .filter_map(normalize_row)
        .collect();
    rows.sort();

    let fields = root
        .fields
        .iter()
        .filter_map(|(name, value)| canonical_scalar(value).map(|scalar| (name.clone(), scalar)))
        .collect();

    let attachments = root
        .attachments
        .iter()
        .map(|reference| reference.trim())
        .filter(|reference| !reference.is_empty())
        .map(str::to_string)
        .collect();

    Snapshot {
        aggregate_id: root.id.clone(),
        fields,
        attachments,
        rows,
    }
}

/// Whether the row carries enough data to be part of the aggregate.
pub fn is_complete(entity: &Entity) -> bool {
    normalize_row(entity).is_some()
}

pub fn normalize_row(entity: &Entity) -> Option<SnapshotRow> {
    let kind = &entity.kind;
    let identity_field = kind.identity_field();
    let identity = entity.field(identity_field).and_then(canonical_scalar)?;

    let mut fields = BTreeMap::new();
    for numeric in kind.numeric_fields() {
        let value = entity.field(numeric).and_then(canonical_number)?;
        fields.insert((*numeric).to_string(), value);
    }

    for (name, value) in &entity.fields {
        if name == identity_field || kind.is_numeric_field(name) {
            continue;
        }
        if let Some(scalar) = canonical_scalar(value) {
            fields.insert(name.clone(), scalar);
        }
    }

    for (name, value) in kind.descriptor() {
        if let Some(scalar) = canonical_scalar(&value) {
            fields.insert(name.to_string(), scalar);
        }
    }

    let relationships = entity
        .relationships
        .iter()
        .filter(|(_, members)| !members.is_empty())
        .map(|(name, members)| (name.clone(), members.iter().cloned().collect()))
        .collect();

    Some(SnapshotRow {
        kind: kind.label(),
        identity,
        fields,
        relationships,
    })
}

/// Canonical form of a plain value; `None` is the absent value.
pub fn canonical_scalar(value: &Value) -> Option<Scalar> {
    match value {
        Value::Null => None,
        Value::Bool(flag) => Some(Scalar::Flag(*flag)),
        Value::Number(number) => Some(number_scalar(number)),
        Value::String(text) => {
            let text = text.trim();
            if text.is_empty() {
                None
            } else {
                Some(Scalar::Text(text.to_string()))
            }
        }
        Value::Array(_) | Value::Object(_) => None,
    }
}

/// Canonical form of a numeric input; numeric text counts as a number.
pub fn canonical_number(value: &Value) -> Option<Scalar> {
    match value {
        Value::Number(number) => Some(number_scalar(number)),
        Value::String(text) => text
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|parsed| parsed.is_finite())
            .map(float_scalar),
        _ => None,
    }
}

fn number_scalar(number: &Number) -> Scalar {
    if let Some(int) = number.as_i64() {
        return Scalar::Int(int);
    }
    match number.as_f64() {
        Some(float) => float_scalar(float),
        None => Scalar::Decimal(number.to_string()),
    }
}

fn float_scalar(float: f64) -> Scalar {
    if float.fract() == 0.0 && float.abs() < 9.0e15 {
        Scalar::Int(float as i64)
    } else {
        Scalar::Decimal(format!("{float}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AggregateId, EntityId};
    use crate::model::{EntityKind, LineCategory, PersistStatus, SyncMode};
    use serde_json::json;

    fn order() -> AggregateRoot {
        AggregateRoot::new("order-1", SyncMode::Atomic)
    }

    fn line(n: &str, item: Value, quantity: Value) -> Entity {
        Entity::new(
            EntityId::Local(n.to_string()),
            AggregateId::new("order-1"),
            EntityKind::line_item(LineCategory::Handle),
            PersistStatus::Virtual,
        )
        .with_field("handle_id", item)
        .with_field("quantity", quantity)
    }

    #[test]
    fn test_incomplete_rows_are_excluded() {
        let rows = vec![
            line("1", json!("h-10"), json!(4)),
            line("2", json!(""), json!(2)),
            line("3", json!("h-11"), json!("   ")),
            line("4", json!("h-12"), json!("abc")),
        ];
        let snapshot = normalize(&order(), &rows);
        assert_eq!(snapshot.rows.len(), 1);
        assert_eq!(snapshot.rows[0].identity, Scalar::Text("h-10".into()));
    }

    #[test]
    fn test_numeric_text_and_numbers_match() {
        let typed = normalize(&order(), &[line("1", json!(" h-10 "), json!("4"))]);
        let loaded = normalize(&order(), &[line("9", json!("h-10"), json!(4.0))]);
        assert_eq!(typed, loaded);
    }

    #[test]
    fn test_order_independent() {
        let a = line("1", json!("h-10"), json!(4));
        let b = line("2", json!("h-11"), json!(1))
            .with_members("delivered_by", ["emp-2", "emp-1"]);
        let forward = normalize(&order(), [&a, &b]);
        let backward = normalize(&order(), [&b, &a]);
        assert_eq!(forward, backward);
        assert_eq!(
            backward.rows[1].relationships.get("delivered_by"),
            Some(&vec!["emp-1".to_string(), "emp-2".to_string()])
        );
    }

    #[test]
    fn test_category_payload_is_compared() {
        let kind = |mm| EntityKind::line_item(LineCategory::Sheet { thickness_mm: Some(mm) });
        let mut thin = line("1", json!("s-1"), json!(2));
        thin.kind = kind(16);
        thin.fields.insert("sheet_id".into(), json!("s-1"));
        let mut thick = thin.clone();
        thick.kind = kind(18);
        assert_ne!(normalize(&order(), [&thin]), normalize(&order(), [&thick]));
    }

    #[test]
    fn test_rows_of_other_aggregates_are_ignored() {
        let mut foreign = line("1", json!("h-10"), json!(4));
        foreign.aggregate_id = AggregateId::new("order-2");
        assert!(normalize(&order(), [&foreign]).rows.is_empty());
    }

    #[test]
    fn test_decimal_scalars() {
        assert_eq!(canonical_number(&json!("2.50")), Some(Scalar::Decimal("2.5".into())));
        assert_eq!(canonical_number(&json!(true)), None);
        assert_eq!(canonical_scalar(&json!([1, 2])), None);
    }
}
