impl SyncEngine {
    /// Deletes one entity.
    ///
    /// Removing the last live entity of an aggregate would leave an empty
    /// aggregate behind, so it is refused with `CascadeDeleteHazard` and has
    /// to go through [`confirm_cascade_remove`](Self::confirm_cascade_remove).
    pub async fn remove(&self, id: &EntityId) -> Result<()> {
        let span = info_span!("engine.remove", entity = %id);
        async move {
            let aggregate_id = self
                .shared
                .registry
                .read(|reg| Ok(reg.entity(id)?.aggregate_id.clone()))?;
            // The last-live check and the delete must not interleave with
            // another removal from the same aggregate.
            let queue = TimerKey::aggregate_subject(&aggregate_id);
            let removed = self
                .shared
                .rollback
                .exclusive(queue, || self.remove_guarded(id, &aggregate_id))
                .await?;
            let Some((removed, mode)) = removed else {
                return Ok(());
            };

            // Pending saves are only dropped once the row is really gone.
            self.shared.coalescer.cancel_subject(&removed.to_string())?;
            event!(Level::INFO, entity = %removed, "entity removed");
            self.emit(SyncEvent::EntityRemoved {
                aggregate_id: aggregate_id.clone(),
                entity_id: removed,
            });
            if mode == SyncMode::Atomic {
                self.schedule_autosave(&aggregate_id)?;
            }
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Runs on the aggregate's queue.
    async fn remove_guarded(
        &self,
        id: &EntityId,
        aggregate_id: &AggregateId,
    ) -> Result<Option<(EntityId, SyncMode)>> {
        let target = self.shared.registry.read(|reg| {
            if !reg.contains(id) {
                return Ok(None);
            }
            let entity = reg.entity(id)?;
            let root = reg.aggregate(aggregate_id)?;
            let last_live = match root.mode {
                SyncMode::PerEntity => {
                    !entity.is_virtual() && reg.persisted_count(&root.id)? == 1
                }
                SyncMode::Atomic => {
                    root.is_persisted()
                        && is_complete(entity)
                        && reg.complete_count(&root.id)? == 1
                }
            };
            Ok(Some((
                entity.id.clone(),
                root.mode,
                last_live,
                reg.queue_key(id).to_string(),
            )))
        })?;
        // Already removed by a call queued ahead of this one.
        let Some((live, mode, last_live, queue)) = target else {
            return Ok(None);
        };

        if last_live {
            event!(
                Level::INFO,
                aggregate = %aggregate_id,
                "last live entity, cascade confirmation required"
            );
            self.emit(SyncEvent::CascadeConfirmationRequired {
                aggregate_id: aggregate_id.clone(),
                entity_id: live.clone(),
            });
            return Err(SyncError::CascadeDeleteHazard {
                aggregate: aggregate_id.to_string(),
                entity: live.to_string(),
            });
        }

        let removed = self
            .shared
            .rollback
            .exclusive(queue, || self.remove_now(id, aggregate_id, mode))
            .await?;
        Ok(removed.map(|removed| (removed, mode)))
    }

    /// Runs on the entity's queue, after every earlier save of it finished.
    async fn remove_now(
        &self,
        id: &EntityId,
        aggregate_id: &AggregateId,
        mode: SyncMode,
    ) -> Result<Option<EntityId>> {
        let registry = &self.shared.registry;
        let target = registry.read(|reg| {
            if !reg.contains(id) {
                return Ok(None);
            }
            let entity = reg.entity(id)?;
            Ok(Some((entity.id.clone(), !entity.is_virtual())))
        })?;
        let Some((live, on_server)) = target else {
            return Ok(None);
        };

        if mode == SyncMode::PerEntity && on_server {
            let deleted = self
                .shared
                .client
                .delete(&live.to_string())
                .await
                .and_then(SyncResponse::into_result);
            if let Err(err) = deleted {
                event!(Level::WARN, error = %err, "delete failed, entity kept");
                let err = SyncError::persistence(&live, err);
                self.emit(SyncEvent::RolledBack {
                    aggregate_id: aggregate_id.clone(),
                    entity_id: live.clone(),
                    error: err.to_string(),
                });
                return Err(err);
            }
        }

        registry.write(|reg| {
            reg.remove_entity(&live)?;
            if mode == SyncMode::PerEntity {
                reg.refresh_baseline(aggregate_id)?;
            }
            Ok(())
        })?;
        Ok(Some(live))
    }

    /// Deletes a whole aggregate after the user confirmed removing its last
    /// live entity.
    pub async fn confirm_cascade_remove(&self, aggregate_id: &AggregateId) -> Result<()> {
        let span = info_span!("engine.confirm_cascade_remove", aggregate = %aggregate_id);
        async move {
            self.shared.coalescer.cancel_scope(aggregate_id)?;
            let queue = TimerKey::aggregate_subject(aggregate_id);
            self.shared
                .rollback
                .exclusive(queue, || self.remove_aggregate_now(aggregate_id))
                .await?;
            // Edits racing the removal may have scheduled new timers.
            self.shared.coalescer.cancel_scope(aggregate_id)?;

            event!(Level::INFO, "aggregate removed");
            self.emit(SyncEvent::AggregateRemoved {
                aggregate_id: aggregate_id.clone(),
            });
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn remove_aggregate_now(&self, aggregate_id: &AggregateId) -> Result<()> {
        let registry = &self.shared.registry;
        let (remote_id, rows_on_server) = registry.read(|reg| {
            let root = reg.aggregate(aggregate_id)?;
            let rows: Vec<EntityId> = match root.mode {
                SyncMode::PerEntity => reg
                    .members(aggregate_id)?
                    .into_iter()
                    .filter(|entity| !entity.is_virtual())
                    .map(|entity| entity.id.clone())
                    .collect(),
                SyncMode::Atomic => Vec::new(),
            };
            Ok((root.remote_id.clone(), rows))
        })?;

        match remote_id {
            // The server drops the rows with their aggregate.
            Some(remote_id) => {
                self.shared
                    .client
                    .delete(&remote_id)
                    .await
                    .and_then(SyncResponse::into_result)
                    .map_err(|err| SyncError::persistence(aggregate_id, err))?;
            }
            None => {
                for row in rows_on_server {
                    let deleted = self
                        .shared
                        .client
                        .delete(&row.to_string())
                        .await
                        .and_then(SyncResponse::into_result);
                    if let Err(err) = deleted {
                        // Rows deleted so far are already gone locally.
                        registry.write(|reg| {
                            reg.refresh_baseline(aggregate_id)?;
                            Ok(())
                        })?;
                        return Err(SyncError::persistence(&row, err));
                    }
                    registry.write(|reg| {
                        reg.remove_entity(&row)?;
                        Ok(())
                    })?;
                }
            }
        }

        registry.write(|reg| {
            reg.remove_aggregate(aggregate_id)?;
            Ok(())
        })
    }
}
