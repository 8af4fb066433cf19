use super::pending::{PendingMutation, PersistRequest};
use crate::client::SyncResponse;
use crate::core::{EntityId, Result, SyncError};
use crate::model::{Entity, PayloadScope, PersistStatus, Slot, SlotValue};
use crate::registry::{EntityRegistry, SharedRegistry, commit_materialization};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{Level, event};

/// What became of one persistence attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// The server accepted the change. `remapped_from` is set when the call
    /// created the entity and its placeholder id was replaced.
    Committed {
        entity_id: EntityId,
        remapped_from: Option<EntityId>,
        response: SyncResponse,
    },
    /// Nothing was pending, so no call was made.
    Skipped { entity_id: EntityId },
    /// The entity was deleted before the result could be applied.
    Discarded { entity_id: EntityId },
}

impl AttemptOutcome {
    pub fn entity_id(&self) -> &EntityId {
        match self {
            Self::Committed { entity_id, .. }
            | Self::Skipped { entity_id }
            | Self::Discarded { entity_id } => entity_id,
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }
}

/// Per-entity queue. Commands take the gate in arrival order.
struct EntityMailbox {
    gate: Arc<AsyncMutex<()>>,
    pending: u64,
    last_command_at: DateTime<Utc>,
}

struct MailboxRegistration<'a> {
    manager: &'a RollbackManager,
    key: String,
}

impl Drop for MailboxRegistration<'_> {
    fn drop(&mut self) {
        self.manager.complete(&self.key);
    }
}

/// Exclusive turn on one entity's queue; released on drop.
pub struct MailboxGuard<'a> {
    _gate: OwnedMutexGuard<()>,
    _registration: MailboxRegistration<'a>,
}

struct Dispatch {
    mutation: PendingMutation,
    acknowledged: Vec<(Slot, SlotValue)>,
    prior_status: PersistStatus,
}

enum Prepared {
    Ready(Box<Dispatch>),
    Skipped(EntityId),
    Gone,
}

/// Applies optimistic mutations and undoes them when the server says no.
///
/// Every attempt on an entity runs on that entity's queue, keyed by the
/// identity the entity was born with so a create and the edits queued behind
/// it stay ordered across the placeholder remap. Attempts on different
/// entities never wait for each other.
#[derive(Default)]
pub struct RollbackManager {
    mailboxes: Mutex<HashMap<String, EntityMailbox>>,
    in_flight: Mutex<HashMap<String, PendingMutation>>,
}

impl RollbackManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for the turn of `key` on its queue.
    pub async fn enter(&self, key: impl Into<String>) -> Result<MailboxGuard<'_>> {
        let key = key.into();
        let gate = {
            let mut mailboxes = self.mailboxes.lock()?;
            let mailbox = mailboxes.entry(key.clone()).or_insert_with(|| EntityMailbox {
                gate: Arc::new(AsyncMutex::new(())),
                pending: 0,
                last_command_at: Utc::now(),
            });
            mailbox.pending = mailbox.pending.saturating_add(1);
            mailbox.last_command_at = Utc::now();
            Arc::clone(&mailbox.gate)
        };
        let registration = MailboxRegistration { manager: self, key };
        let turn = gate.lock_owned().await;
        Ok(MailboxGuard {
            _gate: turn,
            _registration: registration,
        })
    }

    fn complete(&self, key: &str) {
        let Ok(mut mailboxes) = self.mailboxes.lock() else {
            return;
        };
        if let Some(mailbox) = mailboxes.get_mut(key) {
            mailbox.pending = mailbox.pending.saturating_sub(1);
            mailbox.last_command_at = Utc::now();
            if mailbox.pending == 0 {
                mailboxes.remove(key);
            }
        }
    }

    /// Runs `work` on the queue of `key`.
    pub async fn exclusive<F, Fut, T>(&self, key: impl Into<String>, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _turn = self.enter(key).await?;
        work().await
    }

    /// Entities with a command running or waiting.
    pub fn busy_entities(&self) -> Result<usize> {
        Ok(self.mailboxes.lock()?.len())
    }

    /// When the queue of `key` last accepted or finished a command.
    pub fn last_command_at(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .mailboxes
            .lock()?
            .get(key)
            .map(|mailbox| mailbox.last_command_at))
    }

    pub fn in_flight(&self, key: &str) -> Result<Option<PendingMutation>> {
        Ok(self.in_flight.lock()?.get(key).cloned())
    }

    pub fn in_flight_count(&self) -> Result<usize> {
        Ok(self.in_flight.lock()?.len())
    }

    /// One optimistic round trip for one entity.
    ///
    /// `mutate_local` writes `slots`; the request carries either those slots
    /// or the whole entity (`scope`), and a virtual entity is always created
    /// with its full state. On success the written slots become the confirmed
    /// state. On failure they go back to the values they had before the
    /// optimistic write, the status is restored and the error is returned.
    pub async fn attempt<M, P, Fut>(
        &self,
        registry: &SharedRegistry,
        entity_id: &EntityId,
        slots: Vec<Slot>,
        scope: PayloadScope,
        mutate_local: M,
        persist: P,
    ) -> Result<AttemptOutcome>
    where
        M: FnOnce(&mut Entity) -> Result<()>,
        P: FnOnce(PersistRequest) -> Fut,
        Fut: Future<Output = Result<SyncResponse>>,
    {
        let key = registry.read(|reg| Ok(reg.queue_key(entity_id)))?.to_string();
        let _turn = self.enter(key.clone()).await?;

        let prepared =
            registry.write(|reg| prepare(reg, entity_id, &slots, scope, mutate_local))?;
        let dispatch = match prepared {
            Prepared::Ready(dispatch) => dispatch,
            Prepared::Skipped(entity_id) => {
                event!(Level::DEBUG, entity = %entity_id, "nothing pending, persistence skipped");
                return Ok(AttemptOutcome::Skipped { entity_id });
            }
            Prepared::Gone => {
                event!(Level::DEBUG, entity = %entity_id, "entity removed before dispatch");
                return Ok(AttemptOutcome::Discarded {
                    entity_id: entity_id.clone(),
                });
            }
        };

        self.in_flight
            .lock()?
            .insert(key.clone(), dispatch.mutation.clone());
        let result = persist(dispatch.mutation.request.clone())
            .await
            .and_then(SyncResponse::into_result);
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.remove(&key);
        }

        let committed = match result {
            Ok(response) => registry.write(|reg| commit(reg, &dispatch, response)),
            Err(err) => Err(err),
        };
        match committed {
            Ok(outcome) => {
                event!(Level::DEBUG, entity = %outcome.entity_id(), "persistence committed");
                Ok(outcome)
            }
            Err(err) => {
                let sent_as = dispatch.mutation.entity_id.clone();
                let restored = registry.write(|reg| Ok(restore(reg, &dispatch)))?;
                if !restored {
                    event!(
                        Level::DEBUG,
                        entity = %sent_as,
                        "entity removed while in flight, failure dropped"
                    );
                    return Ok(AttemptOutcome::Discarded { entity_id: sent_as });
                }
                event!(
                    Level::WARN,
                    entity = %sent_as,
                    error = %err,
                    "persistence failed, local state restored"
                );
                if err.is_remote_failure() {
                    Err(SyncError::persistence(&sent_as, err))
                } else {
                    Err(err)
                }
            }
        }
    }
}

fn prepare<M>(
    reg: &mut EntityRegistry,
    entity_id: &EntityId,
    slots: &[Slot],
    scope: PayloadScope,
    mutate_local: M,
) -> Result<Prepared>
where
    M: FnOnce(&mut Entity) -> Result<()>,
{
    if !reg.contains(entity_id) {
        return Ok(Prepared::Gone);
    }
    let aggregate_id = reg.entity(entity_id)?.aggregate_id.clone();
    let aggregate_key = reg.aggregate(&aggregate_id)?.remote_key();

    let entity = reg.entity_mut(entity_id)?;
    let pre_state = entity.with_slots_reverted(slots);
    let before = entity.clone();
    if let Err(err) = mutate_local(entity) {
        *entity = before;
        return Err(err);
    }

    let creating = entity.is_virtual();
    let worth_sending = if creating {
        entity.has_unsettled()
    } else {
        slots.iter().any(|slot| entity.is_unsettled(slot))
    };
    if !worth_sending {
        return Ok(Prepared::Skipped(entity.id.clone()));
    }

    let (request, sent_slots) = if creating {
        let payload = entity.payload(slots, PayloadScope::Full);
        let request = PersistRequest::Create {
            payload: json!({
                "aggregate_id": aggregate_key,
                "kind": entity.kind,
                "template_key": entity.template_key,
                "fields": payload.fields,
                "relationships": payload.relationships,
            }),
        };
        (request, entity.unsettled_slots().cloned().collect::<Vec<_>>())
    } else {
        let request = PersistRequest::Update {
            id: entity.id.to_string(),
            payload: serde_json::to_value(entity.payload(slots, scope))?,
        };
        let sent_slots = match scope {
            PayloadScope::Full => entity.unsettled_slots().cloned().collect(),
            PayloadScope::Slots => slots.to_vec(),
        };
        (request, sent_slots)
    };

    let acknowledged = sent_slots
        .into_iter()
        .map(|slot| {
            let value = entity.read_slot(&slot);
            (slot, value)
        })
        .collect();
    let prior_status = entity.status;
    entity.status = if creating {
        PersistStatus::Materializing
    } else {
        PersistStatus::Saving
    };

    Ok(Prepared::Ready(Box::new(Dispatch {
        mutation: PendingMutation {
            aggregate_id,
            entity_id: entity.id.clone(),
            pre_state,
            slots: slots.to_vec(),
            request,
            dispatched_at: Utc::now(),
        },
        acknowledged,
        prior_status,
    })))
}

fn commit(
    reg: &mut EntityRegistry,
    dispatch: &Dispatch,
    response: SyncResponse,
) -> Result<AttemptOutcome> {
    let sent_as = &dispatch.mutation.entity_id;
    if !reg.contains(sent_as) {
        return Ok(AttemptOutcome::Discarded {
            entity_id: sent_as.clone(),
        });
    }

    let mut live = reg.resolve(sent_as);
    let mut remapped_from = None;
    if dispatch.mutation.request.is_create() {
        let assigned = response.assigned_id().ok_or_else(|| {
            SyncError::Rejected(format!("create of '{}' returned no identifier", sent_as))
        })?;
        let assigned = EntityId::persisted(assigned);
        commit_materialization(reg, &live, assigned.clone())?;
        remapped_from = Some(live);
        live = assigned;
    }

    let entity = reg.entity_mut(&live)?;
    entity.settle(&dispatch.acknowledged);
    entity.status = PersistStatus::Persisted;
    let aggregate_id = entity.aggregate_id.clone();
    reg.refresh_baseline(&aggregate_id)?;

    Ok(AttemptOutcome::Committed {
        entity_id: live,
        remapped_from,
        response,
    })
}

fn restore(reg: &mut EntityRegistry, dispatch: &Dispatch) -> bool {
    match reg.entity_mut(&dispatch.mutation.entity_id) {
        Ok(entity) => {
            entity.restore_slots(&dispatch.mutation.pre_state, &dispatch.mutation.slots);
            entity.status = dispatch.prior_status;
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AggregateId;
    use crate::model::{AggregateRoot, EntityKind, SyncMode};
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    fn registry() -> SharedRegistry {
        let mut registry = EntityRegistry::new();
        let lot = AggregateId::new("lot-1");
        let cutting = Entity::persisted("st-1", lot.clone(), EntityKind::Stage)
            .with_field("name", json!("Cutting"))
            .with_members("assigned_to", ["emp-1"]);
        let delivery = Entity::new(
            EntityId::virtual_for(&lot, "Delivery"),
            lot.clone(),
            EntityKind::Stage,
            PersistStatus::Virtual,
        )
        .with_field("name", json!("Delivery"))
        .with_template_key("Delivery");
        registry
            .insert_aggregate(
                AggregateRoot::new(lot, SyncMode::PerEntity).with_remote_id("lot-1"),
                vec![cutting, delivery],
            )
            .unwrap();
        SharedRegistry::new(registry)
    }

    fn snapshot_of(registry: &SharedRegistry, id: &EntityId) -> Entity {
        registry.read(|reg| Ok(reg.entity(id)?.clone())).unwrap()
    }

    fn rename(value: &'static str) -> impl FnOnce(&mut Entity) -> Result<()> {
        move |entity: &mut Entity| {
            entity.stage_field("name", json!(value));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failure_restores_exact_pre_state() {
        let registry = registry();
        let manager = RollbackManager::new();
        let id = EntityId::persisted("st-1");
        let before = snapshot_of(&registry, &id);

        let err = manager
            .attempt(
                &registry,
                &id,
                vec![Slot::field("name")],
                PayloadScope::Slots,
                rename("Sawing"),
                |_| async { Err(SyncError::Transport("connection reset".into())) },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Persistence { .. }));
        assert_eq!(snapshot_of(&registry, &id), before);
        assert_eq!(manager.in_flight_count().unwrap(), 0);
        assert_eq!(manager.busy_entities().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_success_settles_and_refreshes_baseline() {
        let registry = registry();
        let manager = RollbackManager::new();
        let id = EntityId::persisted("st-1");

        let outcome = manager
            .attempt(
                &registry,
                &id,
                vec![Slot::field("name")],
                PayloadScope::Slots,
                rename("Sawing"),
                |request| async move {
                    assert_eq!(
                        request,
                        PersistRequest::Update {
                            id: "st-1".into(),
                            payload: json!({"fields": {"name": "Sawing"}}),
                        }
                    );
                    Ok(SyncResponse::ok(None))
                },
            )
            .await
            .unwrap();

        assert!(outcome.is_committed());
        let entity = snapshot_of(&registry, &id);
        assert!(!entity.has_unsettled());
        assert_eq!(entity.status, PersistStatus::Persisted);
        let lot = AggregateId::new("lot-1");
        let clean = registry
            .read(|reg| Ok(reg.snapshot(&lot)?.rows == reg.baseline(&lot)?.rows))
            .unwrap();
        // The virtual row is still only local.
        assert!(!clean);
    }

    #[tokio::test]
    async fn test_nothing_pending_makes_no_call() {
        let registry = registry();
        let manager = RollbackManager::new();
        let calls = AtomicUsize::new(0);

        let outcome = manager
            .attempt(
                &registry,
                &EntityId::persisted("st-1"),
                vec![Slot::field("name")],
                PayloadScope::Slots,
                rename("Cutting"),
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(SyncResponse::ok(None)) }
                },
            )
            .await
            .unwrap();

        assert!(matches!(outcome, AttemptOutcome::Skipped { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_create_replaces_placeholder() {
        let registry = registry();
        let manager = RollbackManager::new();
        let placeholder: EntityId = "temp:lot-1/Delivery".parse().unwrap();

        let outcome = manager
            .attempt(
                &registry,
                &placeholder,
                vec![Slot::field("notes")],
                PayloadScope::Slots,
                |entity| {
                    entity.stage_field("notes", json!("by truck"));
                    Ok(())
                },
                |request| async move {
                    let payload: &Value = request.payload();
                    assert!(request.is_create());
                    assert_eq!(payload["fields"]["name"], json!("Delivery"));
                    assert_eq!(payload["aggregate_id"], json!("lot-1"));
                    Ok(SyncResponse::ok(Some(json!({"id": "st-7"}))))
                },
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            AttemptOutcome::Committed {
                entity_id: EntityId::persisted("st-7"),
                remapped_from: Some(placeholder.clone()),
                response: SyncResponse::ok(Some(json!({"id": "st-7"}))),
            }
        );
        let entity = snapshot_of(&registry, &placeholder);
        assert_eq!(entity.id, EntityId::persisted("st-7"));
        assert_eq!(entity.status, PersistStatus::Persisted);
    }

    #[tokio::test]
    async fn test_failed_create_stays_virtual() {
        let registry = registry();
        let manager = RollbackManager::new();
        let placeholder: EntityId = "temp:lot-1/Delivery".parse().unwrap();
        let before = snapshot_of(&registry, &placeholder);

        let result = manager
            .attempt(
                &registry,
                &placeholder,
                vec![Slot::relation("assigned_to")],
                PayloadScope::Full,
                |entity| {
                    let members = ["emp-3".to_string()].into_iter().collect();
                    entity.stage_relation("assigned_to", members);
                    Ok(())
                },
                |_| async { Ok(SyncResponse::rejected("stage limit reached")) },
            )
            .await;

        assert!(matches!(result, Err(SyncError::Persistence { .. })));
        assert_eq!(snapshot_of(&registry, &placeholder), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_on_one_entity_are_serialized() {
        let registry = registry();
        let manager = RollbackManager::new();
        let id = EntityId::persisted("st-1");
        let log = Mutex::new(Vec::new());

        let first = manager.attempt(
            &registry,
            &id,
            vec![Slot::field("name")],
            PayloadScope::Slots,
            rename("Sawing"),
            |_| async {
                log.lock().unwrap().push("first:start");
                sleep(Duration::from_millis(50)).await;
                log.lock().unwrap().push("first:end");
                Ok(SyncResponse::ok(None))
            },
        );
        let second = manager.attempt(
            &registry,
            &id,
            vec![Slot::field("name")],
            PayloadScope::Slots,
            rename("Planing"),
            |_| async {
                log.lock().unwrap().push("second:start");
                Ok(SyncResponse::ok(None))
            },
        );
        let (first, second) = tokio::join!(first, second);
        assert!(first.unwrap().is_committed());
        assert!(second.unwrap().is_committed());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:start", "first:end", "second:start"]
        );
        assert_eq!(
            snapshot_of(&registry, &id).field("name"),
            Some(&json!("Planing"))
        );
    }
}
