impl SyncEngine {
    /// Sets `field` to `value` on every entity in `ids` (e.g. "mark all done").
    ///
    /// Every row is written locally at once and saved on its own. A failing
    /// row rolls back alone; the report lists which rows made it.
    pub async fn mark_all(
        &self,
        ids: &[EntityId],
        field: &str,
        value: Value,
    ) -> Result<BatchReport> {
        let span = info_span!("engine.mark_all", field = %field, rows = ids.len());
        async move {
            let mut report = BatchReport::default();
            let mut immediate = Vec::new();

            for id in ids {
                let located = self.locate(id).and_then(|(live, aggregate_id, mode)| {
                    let changed = self
                        .shared
                        .registry
                        .write(|reg| Ok(reg.entity_mut(&live)?.stage_field(field, value.clone())))?;
                    Ok((live, aggregate_id, mode, changed))
                });
                let (live, aggregate_id, mode, changed) = match located {
                    Ok(located) => located,
                    Err(err) => {
                        report.failed.push(BatchFailure {
                            entity_id: id.clone(),
                            error: err,
                        });
                        continue;
                    }
                };
                if changed {
                    self.emit(SyncEvent::EntityChanged {
                        aggregate_id: aggregate_id.clone(),
                        entity_id: live.clone(),
                        slot: Slot::field(field),
                    });
                }

                match mode {
                    SyncMode::Atomic => {
                        self.schedule_autosave(&aggregate_id)?;
                        report.deferred.push(live);
                    }
                    SyncMode::PerEntity => {
                        // Superseded by the immediate save below.
                        self.shared.coalescer.cancel(&TimerKey::field(&live, field))?;
                        immediate.push(live);
                    }
                }
            }

            let saves = immediate
                .iter()
                .map(|id| self.persist_field(id, field, value.clone()));
            let results = join_all(saves).await;

            for (id, result) in immediate.into_iter().zip(results) {
                match result {
                    Ok(AttemptOutcome::Committed { entity_id, .. }) => {
                        report.committed.push(entity_id)
                    }
                    Ok(AttemptOutcome::Skipped { entity_id }) => report.unchanged.push(entity_id),
                    Ok(AttemptOutcome::Discarded { entity_id }) => report.failed.push(BatchFailure {
                        error: SyncError::EntityNotFound(entity_id.to_string()),
                        entity_id,
                    }),
                    Err(error) => report.failed.push(BatchFailure {
                        entity_id: id,
                        error,
                    }),
                }
            }

            if report.all_succeeded() {
                event!(Level::INFO, committed = report.committed.len(), "batch update applied");
            } else {
                event!(
                    Level::WARN,
                    committed = report.committed.len(),
                    failed = report.failed.len(),
                    "batch update partially failed"
                );
            }
            Ok(report)
        }
        .instrument(span)
        .await
    }
}
