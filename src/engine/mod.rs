// ============================================================================
// Sync Engine
// ============================================================================
//
// Facade over the registry, the debounce coalescer, the rollback manager and
// the sync client. Cheap to clone; every clone drives the same state.
//
// Edits are applied to the registry at once and persisted later: per field
// through debounced timers for rows synchronized one by one, or through a
// debounced save of the whole aggregate for atomically persisted aggregates.
// Toggles, deletes and batch updates go out immediately. Everything that
// happens is published on a broadcast channel of `SyncEvent`s.
//
// The implementation is split into focused parts that share this module's
// imports and visibility.
//
// ============================================================================

pub mod events;

pub use events::SyncEvent;

use crate::client::{SyncClient, SyncResponse};
use crate::config::EngineConfig;
use crate::core::{AggregateId, EntityId, Result, SyncError};
use crate::debounce::{DebounceCoalescer, TimerKey};
use crate::model::{
    AggregateRoot, AggregateSeed, Entity, EntityKind, MemberSet, PayloadScope, PersistStatus,
    Slot, SyncMode,
};
use crate::registry::{
    Materialization, SharedRegistry, ensure_materialized, materialize_placeholder,
    toggle_membership,
};
use crate::rollback::{AttemptOutcome, PersistRequest, RollbackManager};
use crate::snapshot::{self, Snapshot, is_complete};
use crate::validation::{check_field, validate_entity, validate_rows};
use futures::future::join_all;
use serde::{Serialize, Serializer};
use serde_json::{Value, json};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{Instrument, Level, event, info_span};

include!("engine_impl/editing.rs");
include!("engine_impl/saving.rs");
include!("engine_impl/removal.rs");
include!("engine_impl/batch.rs");

struct EngineShared {
    config: EngineConfig,
    registry: SharedRegistry,
    client: Arc<dyn SyncClient>,
    coalescer: DebounceCoalescer,
    rollback: RollbackManager,
    events: broadcast::Sender<SyncEvent>,
}

/// Result of an aggregate save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SaveOutcome {
    Saved { remote_id: String, created: bool },
    /// Nothing worth persisting: clean, or no content at all.
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchFailure {
    pub entity_id: EntityId,
    #[serde(serialize_with = "serialize_error")]
    pub error: SyncError,
}

/// Per-row results of a batch update. Rows fail and roll back one by one.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub committed: Vec<EntityId>,
    /// Rows that already held the value on the server.
    pub unchanged: Vec<EntityId>,
    /// Rows of atomically persisted aggregates, saved with their aggregate.
    pub deferred: Vec<EntityId>,
    pub failed: Vec<BatchFailure>,
}

impl BatchReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

fn serialize_error<S: Serializer>(
    err: &SyncError,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(err)
}

/// Optimistic synchronization engine.
#[derive(Clone)]
pub struct SyncEngine {
    shared: Arc<EngineShared>,
}

impl SyncEngine {
    pub fn new(config: EngineConfig, client: Arc<dyn SyncClient>) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(config.event_capacity);
        let shared = EngineShared {
            coalescer: DebounceCoalescer::new(config.debounce_window()),
            config,
            registry: SharedRegistry::default(),
            client,
            rollback: RollbackManager::new(),
            events,
        };
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    fn from_shared(shared: Arc<EngineShared>) -> Self {
        Self { shared }
    }

    fn downgrade(&self) -> Weak<EngineShared> {
        Arc::downgrade(&self.shared)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.events.subscribe()
    }

    /// Loads server state for one aggregate, replacing any local copy.
    pub fn load_aggregate(&self, seed: AggregateSeed) -> Result<AggregateId> {
        let (root, entities) = seed.into_parts()?;
        self.insert_aggregate(root, entities)
    }

    pub fn insert_aggregate(
        &self,
        root: AggregateRoot,
        entities: Vec<Entity>,
    ) -> Result<AggregateId> {
        let aggregate_id = root.id.clone();
        self.shared.coalescer.cancel_scope(&aggregate_id)?;
        let rows = entities.len();
        self.shared
            .registry
            .write(|reg| reg.insert_aggregate(root, entities))?;
        event!(Level::INFO, aggregate = %aggregate_id, rows, "aggregate loaded");
        Ok(aggregate_id)
    }

    pub fn aggregate(&self, aggregate_id: &AggregateId) -> Result<AggregateRoot> {
        self.shared
            .registry
            .read(|reg| Ok(reg.aggregate(aggregate_id)?.clone()))
    }

    pub fn aggregate_ids(&self) -> Result<Vec<AggregateId>> {
        self.shared.registry.read(|reg| Ok(reg.aggregate_ids()))
    }

    pub fn get_snapshot(&self, aggregate_id: &AggregateId) -> Result<Snapshot> {
        self.shared.registry.read(|reg| reg.snapshot(aggregate_id))
    }

    /// Projection of the last state the server acknowledged.
    pub fn baseline(&self, aggregate_id: &AggregateId) -> Result<Snapshot> {
        self.shared.registry.read(|reg| reg.baseline(aggregate_id))
    }

    pub fn is_dirty(&self, aggregate_id: &AggregateId) -> Result<bool> {
        self.shared.registry.read(|reg| {
            Ok(snapshot::is_dirty(
                &reg.snapshot(aggregate_id)?,
                &reg.baseline(aggregate_id)?,
            ))
        })
    }

    pub fn can_persist(&self, aggregate_id: &AggregateId) -> Result<bool> {
        self.shared.registry.read(|reg| {
            Ok(snapshot::can_persist(
                &reg.snapshot(aggregate_id)?,
                &reg.baseline(aggregate_id)?,
            ))
        })
    }

    /// Current copy of an entity; placeholder ids resolve after a remap.
    pub fn entity(&self, id: &EntityId) -> Result<Entity> {
        self.shared.registry.read(|reg| Ok(reg.entity(id)?.clone()))
    }

    pub fn entities(&self, aggregate_id: &AggregateId) -> Result<Vec<Entity>> {
        self.shared.registry.read(|reg| {
            Ok(reg
                .members(aggregate_id)?
                .into_iter()
                .cloned()
                .collect())
        })
    }

    pub fn resolve(&self, id: &EntityId) -> Result<EntityId> {
        self.shared.registry.read(|reg| Ok(reg.resolve(id)))
    }

    pub fn pending_timers(&self) -> Result<Vec<TimerKey>> {
        self.shared.coalescer.pending_keys()
    }

    /// Drops every pending save of an aggregate whose view was closed.
    ///
    /// Calls already in flight still complete.
    pub fn close_view(&self, aggregate_id: &AggregateId) -> Result<usize> {
        let cancelled = self.shared.coalescer.cancel_scope(aggregate_id)?;
        event!(Level::DEBUG, aggregate = %aggregate_id, cancelled, "view closed");
        Ok(cancelled)
    }

    pub fn shutdown(&self) -> Result<usize> {
        let cancelled = self.shared.coalescer.cancel_all()?;
        event!(Level::INFO, cancelled, "engine shut down");
        Ok(cancelled)
    }

    fn emit(&self, event: SyncEvent) {
        // No subscriber is not an error.
        let _ = self.shared.events.send(event);
    }

    async fn dispatch(&self, request: PersistRequest) -> Result<SyncResponse> {
        match request {
            PersistRequest::Create { payload } => self.shared.client.create(payload).await,
            PersistRequest::Update { id, payload } => {
                self.shared.client.update(&id, payload).await
            }
        }
    }

    /// Publishes the result of an attempt and migrates timers on remap.
    fn settle_outcome(
        &self,
        aggregate_id: &AggregateId,
        sent_as: &EntityId,
        result: Result<AttemptOutcome>,
    ) -> Result<AttemptOutcome> {
        match result {
            Ok(AttemptOutcome::Committed {
                entity_id,
                remapped_from,
                response,
            }) => {
                if let Some(placeholder) = &remapped_from {
                    self.shared
                        .coalescer
                        .rekey_subject(&placeholder.to_string(), &entity_id.to_string())?;
                    event!(
                        Level::INFO,
                        placeholder = %placeholder,
                        entity = %entity_id,
                        "virtual row materialized"
                    );
                }
                self.emit(SyncEvent::Committed {
                    aggregate_id: aggregate_id.clone(),
                    entity_id: entity_id.clone(),
                    remapped_from: remapped_from.clone(),
                });
                Ok(AttemptOutcome::Committed {
                    entity_id,
                    remapped_from,
                    response,
                })
            }
            Ok(other) => Ok(other),
            Err(err) => {
                if !matches!(err, SyncError::Validation(_)) {
                    self.emit(SyncEvent::RolledBack {
                        aggregate_id: aggregate_id.clone(),
                        entity_id: sent_as.clone(),
                        error: err.to_string(),
                    });
                }
                Err(err)
            }
        }
    }

    fn schedule_autosave(&self, aggregate_id: &AggregateId) -> Result<()> {
        if !self.shared.config.autosave_aggregates {
            return Ok(());
        }
        let weak = self.downgrade();
        let target = aggregate_id.clone();
        self.shared.coalescer.schedule(
            TimerKey::aggregate_save(aggregate_id),
            aggregate_id.clone(),
            (),
            move |()| async move {
                let Some(shared) = weak.upgrade() else {
                    log::warn!("autosave of '{}' dropped: engine is gone", target);
                    return;
                };
                let engine = SyncEngine::from_shared(shared);
                if let Err(err) = engine.save_aggregate(&target).await {
                    event!(
                        Level::DEBUG,
                        aggregate = %target,
                        error = %err,
                        "autosave did not persist"
                    );
                }
            },
        )?;
        Ok(())
    }

    /// Id, aggregate and sync mode of an entity, resolved through remaps.
    ///
    /// A placeholder of a template row that was never shown is materialized
    /// first.
    fn locate(&self, id: &EntityId) -> Result<(EntityId, AggregateId, SyncMode)> {
        let created = self
            .shared
            .registry
            .write(|reg| materialize_placeholder(reg, id))?;
        if let Some(Materialization::Created(placeholder)) = created {
            self.announce_materialized(&placeholder)?;
        }
        self.shared.registry.read(|reg| {
            let entity = reg.entity(id)?;
            let mode = reg.aggregate(&entity.aggregate_id)?.mode;
            Ok((entity.id.clone(), entity.aggregate_id.clone(), mode))
        })
    }
}
