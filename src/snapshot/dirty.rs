use super::Snapshot;

/// Structural comparison of two projections.
pub fn is_dirty(current: &Snapshot, baseline: &Snapshot) -> bool {
    current != baseline
}

/// An aggregate with no rows, no aggregate-level values and no attachments is
/// never worth creating.
pub fn has_minimum_content(current: &Snapshot) -> bool {
    !current.is_empty()
}

pub fn can_persist(current: &Snapshot, baseline: &Snapshot) -> bool {
    has_minimum_content(current) && is_dirty(current, baseline)
}
