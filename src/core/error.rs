use crate::validation::RowViolation;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Validation failed for {} row(s): {}", .0.len(), render_violations(.0))]
    Validation(Vec<RowViolation>),

    #[error("Persistence failed for '{target}': {message}")]
    Persistence { target: String, message: String },

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Identity conflict: {0}")]
    IdentityConflict(String),

    #[error(
        "Deleting '{entity}' would leave aggregate '{aggregate}' empty; cascade confirmation required"
    )]
    CascadeDeleteHazard { aggregate: String, entity: String },

    #[error("Entity '{0}' not found")]
    EntityNotFound(String),

    #[error("Aggregate '{0}' not found")]
    AggregateNotFound(String),

    #[error("Template '{key}' is not registered for aggregate '{aggregate}'")]
    UnknownTemplate { aggregate: String, key: String },

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// True for failures that came back from (or never reached) the remote side.
    pub fn is_remote_failure(&self) -> bool {
        matches!(
            self,
            Self::Persistence { .. } | Self::Rejected(_) | Self::Transport(_)
        )
    }

    pub(crate) fn persistence(target: impl ToString, err: SyncError) -> Self {
        let message = match err {
            Self::Rejected(message) | Self::Transport(message) => message,
            Self::Persistence { message, .. } => message,
            other => other.to_string(),
        };
        Self::Persistence {
            target: target.to_string(),
            message,
        }
    }
}

fn render_violations(violations: &[RowViolation]) -> String {
    violations
        .iter()
        .map(|violation| violation.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl<T> From<std::sync::PoisonError<T>> for SyncError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encoding(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EntityId;
    use crate::validation::ViolationReason;

    #[test]
    fn test_persistence_wraps_remote_message() {
        let err = SyncError::persistence("srv-1", SyncError::Rejected("quota exceeded".into()));
        assert_eq!(
            err,
            SyncError::Persistence {
                target: "srv-1".into(),
                message: "quota exceeded".into()
            }
        );
        assert!(err.is_remote_failure());
    }

    #[test]
    fn test_validation_message_lists_rows() {
        let err = SyncError::Validation(vec![RowViolation {
            entity_id: EntityId::Local("3".into()),
            field: "quantity".into(),
            reason: ViolationReason::NotPositive,
        }]);
        let text = err.to_string();
        assert!(text.contains("1 row(s)"));
        assert!(text.contains("row:3"));
        assert!(!err.is_remote_failure());
    }
}
