impl SyncEngine {
    /// Makes the template row `key` exist locally and returns its id.
    ///
    /// Materializing twice returns the same row. Nothing is sent until the
    /// row is edited.
    pub fn materialize(&self, aggregate_id: &AggregateId, key: &str) -> Result<EntityId> {
        let materialization = self
            .shared
            .registry
            .write(|reg| ensure_materialized(reg, aggregate_id, key))?;
        if let Materialization::Created(id) = &materialization {
            self.announce_materialized(id)?;
        }
        Ok(materialization.id().clone())
    }

    fn announce_materialized(&self, id: &EntityId) -> Result<()> {
        let (aggregate_id, template_key) = self.shared.registry.read(|reg| {
            let entity = reg.entity(id)?;
            Ok((entity.aggregate_id.clone(), entity.template_key.clone().unwrap_or_default()))
        })?;
        event!(
            Level::DEBUG,
            aggregate = %aggregate_id,
            entity = %id,
            "template row materialized"
        );
        self.emit(SyncEvent::Materialized {
            aggregate_id,
            entity_id: id.clone(),
            template_key,
        });
        Ok(())
    }

    /// Appends an empty row. It reaches the server once it has content.
    pub fn add_row(&self, aggregate_id: &AggregateId, kind: EntityKind) -> Result<EntityId> {
        self.shared.registry.write(|reg| {
            reg.aggregate(aggregate_id)?;
            let id = reg.next_local_id();
            let entity =
                Entity::new(id.clone(), aggregate_id.clone(), kind, PersistStatus::Virtual);
            reg.insert_entity(entity)?;
            Ok(id)
        })
    }

    /// Optimistically writes a field and schedules its debounced save.
    ///
    /// `Value::Null` clears the field. Must be called inside a Tokio runtime.
    pub fn edit(&self, id: &EntityId, field: &str, value: Value) -> Result<()> {
        let (live, aggregate_id, mode) = self.locate(id)?;
        let changed = self
            .shared
            .registry
            .write(|reg| Ok(reg.entity_mut(&live)?.stage_field(field, value.clone())))?;
        if changed {
            self.emit(SyncEvent::EntityChanged {
                aggregate_id: aggregate_id.clone(),
                entity_id: live.clone(),
                slot: Slot::field(field),
            });
        }

        match mode {
            SyncMode::PerEntity => self.schedule_field_save(&live, &aggregate_id, field, value),
            SyncMode::Atomic => self.schedule_autosave(&aggregate_id),
        }
    }

    fn schedule_field_save(
        &self,
        id: &EntityId,
        aggregate_id: &AggregateId,
        field: &str,
        value: Value,
    ) -> Result<()> {
        let weak = self.downgrade();
        let target = id.clone();
        let field_name = field.to_string();
        self.shared.coalescer.schedule(
            TimerKey::field(id, field),
            aggregate_id.clone(),
            value,
            move |value| async move {
                let Some(shared) = weak.upgrade() else {
                    log::warn!("save of '{}.{}' dropped: engine is gone", target, field_name);
                    return;
                };
                let engine = SyncEngine::from_shared(shared);
                if let Err(err) = engine.persist_field(&target, &field_name, value).await {
                    event!(
                        Level::DEBUG,
                        entity = %target,
                        field = %field_name,
                        error = %err,
                        "debounced save did not persist"
                    );
                }
            },
        )?;
        Ok(())
    }

    /// Sends one field of one entity, creating the entity when it is virtual.
    ///
    /// Rows that fail validation are reported and left as they are; a failed
    /// call restores the field to its last confirmed value.
    pub async fn persist_field(
        &self,
        id: &EntityId,
        field: &str,
        value: Value,
    ) -> Result<AttemptOutcome> {
        let span = info_span!("engine.persist_field", entity = %id, field = %field);
        async move {
            let registry = &self.shared.registry;
            let candidate = registry.read(|reg| {
                if !reg.contains(id) {
                    return Ok(None);
                }
                let mut candidate = reg.entity(id)?.clone();
                candidate.stage_field(field, value.clone());
                Ok(Some(candidate))
            })?;
            let Some(candidate) = candidate else {
                event!(Level::DEBUG, "entity removed before its save fired");
                return Ok(AttemptOutcome::Discarded {
                    entity_id: id.clone(),
                });
            };

            let violations = if candidate.is_virtual() {
                validate_entity(&candidate)
            } else {
                check_field(&candidate, field)
            };
            if !violations.is_empty() {
                event!(Level::INFO, rows = violations.len(), "save blocked by validation");
                self.emit(SyncEvent::ValidationFailed {
                    aggregate_id: candidate.aggregate_id.clone(),
                    violations: violations.clone(),
                });
                return Err(SyncError::Validation(violations));
            }

            let owned_field = field.to_string();
            let result = self
                .shared
                .rollback
                .attempt(
                    registry,
                    id,
                    vec![Slot::field(field)],
                    PayloadScope::Slots,
                    move |entity| {
                        entity.stage_field(&owned_field, value);
                        Ok(())
                    },
                    |request| self.dispatch(request),
                )
                .await;
            self.settle_outcome(&candidate.aggregate_id, &candidate.id, result)
        }
        .instrument(span)
        .await
    }

    /// Flips `member` in `relation` and persists the whole entity.
    ///
    /// The new set is visible at once. Rows of atomically persisted aggregates
    /// are saved with their aggregate instead.
    pub async fn toggle(&self, id: &EntityId, relation: &str, member: &str) -> Result<MemberSet> {
        let span =
            info_span!("engine.toggle", entity = %id, relation = %relation, member = %member);
        async move {
            let (live, aggregate_id, mode) = self.locate(id)?;
            let toggled = self
                .shared
                .registry
                .write(|reg| toggle_membership(reg, &live, relation, member))?;
            self.emit(SyncEvent::EntityChanged {
                aggregate_id: aggregate_id.clone(),
                entity_id: live.clone(),
                slot: Slot::relation(relation),
            });

            if mode == SyncMode::Atomic {
                self.schedule_autosave(&aggregate_id)?;
                return Ok(toggled);
            }

            // Replayed inside the queue so an earlier rollback cannot swallow it.
            let member = member.trim().to_string();
            let present = toggled.contains(&member);
            let owned_relation = relation.to_string();
            let result = self
                .shared
                .rollback
                .attempt(
                    &self.shared.registry,
                    &live,
                    vec![Slot::relation(relation)],
                    PayloadScope::Full,
                    move |entity| {
                        let mut members = entity.relation(&owned_relation);
                        if present {
                            members.insert(member);
                        } else {
                            members.remove(&member);
                        }
                        entity.stage_relation(&owned_relation, members);
                        Ok(())
                    },
                    |request| self.dispatch(request),
                )
                .await;
            self.settle_outcome(&aggregate_id, &live, result)?;

            self.shared
                .registry
                .read(|reg| Ok(reg.entity(&live)?.relation(relation)))
        }
        .instrument(span)
        .await
    }

    /// Writes an aggregate-level field (`Value::Null` clears it).
    pub fn set_aggregate_field(
        &self,
        aggregate_id: &AggregateId,
        field: &str,
        value: Value,
    ) -> Result<()> {
        let mode = self.shared.registry.write(|reg| {
            let root = reg.aggregate_mut(aggregate_id)?;
            if value.is_null() {
                root.fields.remove(field);
            } else {
                root.fields.insert(field.to_string(), value);
            }
            Ok(root.mode)
        })?;
        self.after_aggregate_edit(aggregate_id, mode)
    }

    /// Adds a file reference to the aggregate. Files are never transferred.
    pub fn attach(&self, aggregate_id: &AggregateId, reference: &str) -> Result<()> {
        let mode = self.shared.registry.write(|reg| {
            let root = reg.aggregate_mut(aggregate_id)?;
            root.attachments.insert(reference.trim().to_string());
            Ok(root.mode)
        })?;
        self.after_aggregate_edit(aggregate_id, mode)
    }

    pub fn detach(&self, aggregate_id: &AggregateId, reference: &str) -> Result<()> {
        let mode = self.shared.registry.write(|reg| {
            let root = reg.aggregate_mut(aggregate_id)?;
            root.attachments.remove(reference.trim());
            Ok(root.mode)
        })?;
        self.after_aggregate_edit(aggregate_id, mode)
    }

    fn after_aggregate_edit(&self, aggregate_id: &AggregateId, mode: SyncMode) -> Result<()> {
        match mode {
            SyncMode::Atomic => self.schedule_autosave(aggregate_id),
            // Aggregate-level values of row-synchronized aggregates go out on `save`.
            SyncMode::PerEntity => Ok(()),
        }
    }
}
