// ============================================================================
// Entity Kinds
// ============================================================================
//
// Closed set of row shapes the engine synchronizes. Every per-kind rule
// (identity field, required numeric values, extra comparison fields) is a
// `match` on these enums instead of a string-keyed lookup table.
//
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Category of a materials-to-order line item, with its category payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum LineCategory {
    Sheet {
        #[serde(default)]
        thickness_mm: Option<u16>,
    },
    Edging {
        #[serde(default)]
        width_mm: Option<u16>,
    },
    Handle,
    Hinge,
    Slide,
}

impl LineCategory {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Sheet { .. } => "sheet",
            Self::Edging { .. } => "edging",
            Self::Handle => "handle",
            Self::Hinge => "hinge",
            Self::Slide => "slide",
        }
    }

    /// Field holding the catalogue reference of the ordered item.
    pub fn item_field(&self) -> &'static str {
        match self {
            Self::Sheet { .. } => "sheet_id",
            Self::Edging { .. } => "edging_id",
            Self::Handle => "handle_id",
            Self::Hinge => "hinge_id",
            Self::Slide => "slide_id",
        }
    }

    fn descriptor(&self) -> Vec<(&'static str, Value)> {
        match self {
            Self::Sheet {
                thickness_mm: Some(mm),
            } => vec![("thickness_mm", json!(mm))],
            Self::Edging { width_mm: Some(mm) } => vec![("width_mm", json!(mm))],
            _ => Vec::new(),
        }
    }
}

/// Shape of a synchronized row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityKind {
    /// A production stage of a lot (predefined names are templates).
    Stage,
    /// A line of a materials-to-order list.
    LineItem { category: LineCategory },
    /// A free-text note attached to a lot.
    Note,
    /// An entry of a maintenance checklist.
    ChecklistItem,
}

impl EntityKind {
    pub fn line_item(category: LineCategory) -> Self {
        Self::LineItem { category }
    }

    pub fn label(&self) -> String {
        match self {
            Self::Stage => "stage".to_string(),
            Self::LineItem { category } => format!("line_item/{}", category.label()),
            Self::Note => "note".to_string(),
            Self::ChecklistItem => "checklist_item".to_string(),
        }
    }

    /// Field whose value identifies the row for comparison purposes.
    pub fn identity_field(&self) -> &'static str {
        match self {
            Self::Stage => "name",
            Self::LineItem { category } => category.item_field(),
            Self::Note => "body",
            Self::ChecklistItem => "label",
        }
    }

    /// Numeric fields that must be present and positive before dispatch.
    pub fn numeric_fields(&self) -> &'static [&'static str] {
        match self {
            Self::LineItem { .. } => &["quantity"],
            Self::Stage | Self::Note | Self::ChecklistItem => &[],
        }
    }

    pub fn is_numeric_field(&self, field: &str) -> bool {
        self.numeric_fields().contains(&field)
    }

    /// Category payload contributed to the comparison shape.
    pub fn descriptor(&self) -> Vec<(&'static str, Value)> {
        match self {
            Self::LineItem { category } => category.descriptor(),
            _ => Vec::new(),
        }
    }
}
