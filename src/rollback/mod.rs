// ============================================================================
// Rollback
// ============================================================================
//
// Optimistic writes with a way back. A mutation is applied locally, the
// matching request is dispatched, and the outcome either confirms the
// written slots or restores them from the pre-mutation copy kept in the
// pending mutation.
//
// ============================================================================

pub mod manager;
pub mod pending;

pub use manager::{AttemptOutcome, MailboxGuard, RollbackManager};
pub use pending::{PendingMutation, PersistRequest};
