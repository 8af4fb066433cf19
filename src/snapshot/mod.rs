// ============================================================================
// Snapshots
// ============================================================================
//
// A snapshot is the normalized, order-independent projection of an
// aggregate's editable surface. It is only ever compared, never mutated:
// the registry keeps one per aggregate as the last persisted baseline and
// the dirty detector compares the current projection against it.
//
// ============================================================================

pub mod dirty;
pub mod normalizer;

pub use dirty::{can_persist, has_minimum_content, is_dirty};
pub use normalizer::{canonical_number, canonical_scalar, is_complete, normalize, normalize_row};

use crate::core::AggregateId;
use serde::Serialize;
use std::collections::BTreeMap;

/// Canonical scalar of the comparison shape.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(untagged)]
pub enum Scalar {
    Flag(bool),
    Int(i64),
    /// Non-integral number in its shortest decimal rendering.
    Decimal(String),
    Text(String),
}

impl Scalar {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(int) => Some(*int as f64),
            Self::Decimal(text) => text.parse().ok(),
            Self::Flag(_) | Self::Text(_) => None,
        }
    }
}

/// One complete row in comparison shape.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct SnapshotRow {
    pub kind: String,
    pub identity: Scalar,
    pub fields: BTreeMap<String, Scalar>,
    pub relationships: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub aggregate_id: AggregateId,
    pub fields: BTreeMap<String, Scalar>,
    pub attachments: Vec<String>,
    pub rows: Vec<SnapshotRow>,
}

impl Snapshot {
    /// Baseline of an aggregate that has never been persisted.
    pub fn empty(aggregate_id: AggregateId) -> Self {
        Self {
            aggregate_id,
            fields: BTreeMap::new(),
            attachments: Vec::new(),
            rows: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.fields.is_empty() && self.attachments.is_empty()
    }
}
