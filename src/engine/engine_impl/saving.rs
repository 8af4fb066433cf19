/// Request body of an aggregate save.
///
/// Atomically persisted aggregates carry their complete rows; row-synchronized
/// aggregates only carry aggregate-level values.
fn aggregate_payload(root: &AggregateRoot, rows: &[Entity]) -> Value {
    let fields: serde_json::Map<String, Value> = root
        .fields
        .iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    let mut payload = json!({
        "fields": fields,
        "attachments": root.attachments,
    });
    if root.mode == SyncMode::Atomic {
        let rows: Vec<Value> = rows
            .iter()
            .filter(|entity| is_complete(entity))
            .map(|entity| {
                let body = entity.payload(&[], PayloadScope::Full);
                json!({
                    "kind": entity.kind,
                    "template_key": entity.template_key,
                    "fields": body.fields,
                    "relationships": body.relationships,
                })
            })
            .collect();
        payload["rows"] = Value::Array(rows);
    }
    payload
}

/// A row as it left with an aggregate save.
struct SentRow {
    sent: Entity,
    pre_state: Entity,
    slots: Vec<Slot>,
    status: PersistStatus,
}

impl SentRow {
    /// Rolls back the slots that still hold the sent value.
    fn restore(&self, entity: &mut Entity) {
        let untouched: Vec<Slot> = self
            .slots
            .iter()
            .filter(|slot| entity.read_slot(slot) == self.sent.read_slot(slot))
            .cloned()
            .collect();
        entity.restore_slots(&self.pre_state, &untouched);
        entity.status = self.status;
    }
}

impl SyncEngine {
    /// Saves an aggregate now, replacing any pending autosave.
    pub async fn save(&self, aggregate_id: &AggregateId) -> Result<SaveOutcome> {
        self.shared
            .coalescer
            .cancel(&TimerKey::aggregate_save(aggregate_id))?;
        self.save_aggregate(aggregate_id).await
    }

    /// Creates or updates the aggregate in one call.
    ///
    /// Blocked by validation (nothing is sent, nothing is undone) and skipped
    /// when the current projection has no content or equals the baseline.
    /// On success the sent projection becomes the baseline.
    async fn save_aggregate(&self, aggregate_id: &AggregateId) -> Result<SaveOutcome> {
        let span = info_span!("engine.save_aggregate", aggregate = %aggregate_id);
        let queue = TimerKey::aggregate_subject(aggregate_id);
        self.shared
            .rollback
            .exclusive(queue, || self.save_aggregate_now(aggregate_id))
            .instrument(span)
            .await
    }

    async fn save_aggregate_now(&self, aggregate_id: &AggregateId) -> Result<SaveOutcome> {
        let registry = &self.shared.registry;
        let (root, rows, current, baseline) = registry.read(|reg| {
            let root = reg.aggregate(aggregate_id)?.clone();
            let rows: Vec<Entity> = reg.members(aggregate_id)?.into_iter().cloned().collect();
            Ok((root, rows, reg.snapshot(aggregate_id)?, reg.baseline(aggregate_id)?))
        })?;

        let violations = match root.mode {
            SyncMode::Atomic => validate_rows(&rows),
            SyncMode::PerEntity => Vec::new(),
        };
        if !violations.is_empty() {
            event!(Level::INFO, rows = violations.len(), "aggregate save blocked by validation");
            self.emit(SyncEvent::ValidationFailed {
                aggregate_id: aggregate_id.clone(),
                violations: violations.clone(),
            });
            return Err(SyncError::Validation(violations));
        }

        let worth_saving = match root.mode {
            SyncMode::Atomic => snapshot::can_persist(&current, &baseline),
            SyncMode::PerEntity => {
                let own_values_changed = current.fields != baseline.fields
                    || current.attachments != baseline.attachments;
                let has_values = !current.fields.is_empty() || !current.attachments.is_empty();
                own_values_changed && (has_values || root.is_persisted())
            }
        };
        if !worth_saving {
            event!(Level::DEBUG, "aggregate unchanged, save skipped");
            return Ok(SaveOutcome::Unchanged);
        }

        let payload = aggregate_payload(&root, &rows);
        let creating = !root.is_persisted();
        let sent_rows: Vec<EntityId> = rows
            .iter()
            .filter(|entity| root.mode == SyncMode::Atomic && is_complete(entity))
            .map(|entity| entity.id.clone())
            .collect();
        let in_flight = registry.write(|reg| {
            let mut sent = Vec::with_capacity(sent_rows.len());
            for id in &sent_rows {
                let entity = reg.entity_mut(id)?;
                let slots: Vec<Slot> = entity.unsettled_slots().cloned().collect();
                sent.push(SentRow {
                    pre_state: entity.with_slots_reverted(&slots),
                    sent: entity.clone(),
                    slots,
                    status: entity.status,
                });
                entity.status = if entity.is_virtual() {
                    PersistStatus::Materializing
                } else {
                    PersistStatus::Saving
                };
            }
            Ok(sent)
        })?;

        let response = match &root.remote_id {
            Some(remote_id) => self.shared.client.update(remote_id, payload).await,
            None => self.shared.client.create(payload).await,
        }
        .and_then(SyncResponse::into_result)
        .and_then(|response| {
            if creating {
                response.assigned_id().ok_or_else(|| {
                    SyncError::Rejected("aggregate create returned no identifier".to_string())
                })
            } else {
                Ok(root.remote_key())
            }
        });

        match response {
            Ok(remote_id) => {
                registry.write(|reg| {
                    // Removed while the call was in flight.
                    if reg.aggregate(aggregate_id).is_err() {
                        return Ok(());
                    }
                    let saved = reg.aggregate_mut(aggregate_id)?;
                    saved.remote_id = Some(remote_id.clone());
                    saved.confirm(&root);
                    for sent in rows.iter().filter(|entity| sent_rows.contains(&entity.id)) {
                        if let Ok(entity) = reg.entity_mut(&sent.id) {
                            entity.settle_against(sent);
                            entity.status = PersistStatus::Persisted;
                        }
                    }
                    match root.mode {
                        SyncMode::Atomic => reg.set_baseline(aggregate_id, current.clone()),
                        SyncMode::PerEntity => {
                            let mut next = reg.baseline(aggregate_id)?;
                            next.fields = current.fields.clone();
                            next.attachments = current.attachments.clone();
                            reg.set_baseline(aggregate_id, next)
                        }
                    }
                })?;
                event!(Level::INFO, remote_id = %remote_id, created = creating, "aggregate saved");
                self.emit(SyncEvent::AggregateSaved {
                    aggregate_id: aggregate_id.clone(),
                    remote_id: remote_id.clone(),
                    created: creating,
                });
                Ok(SaveOutcome::Saved {
                    remote_id,
                    created: creating,
                })
            }
            Err(err) => {
                registry.write(|reg| {
                    if let Ok(current_root) = reg.aggregate_mut(aggregate_id) {
                        current_root.revert_unconfirmed(&root);
                    }
                    for row in &in_flight {
                        if let Ok(entity) = reg.entity_mut(&row.sent.id) {
                            row.restore(entity);
                        }
                    }
                    Ok(())
                })?;
                event!(
                    Level::WARN,
                    error = %err,
                    rows = in_flight.len(),
                    "aggregate save failed, edits rolled back"
                );
                let err = SyncError::persistence(aggregate_id, err);
                self.emit(SyncEvent::SaveFailed {
                    aggregate_id: aggregate_id.clone(),
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }
}
