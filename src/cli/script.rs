//! Scripted editing sessions replayed against an in-memory server.
//!
//! A script seeds aggregates, then runs steps the way a user would click
//! through the tables. Rows created by `materialize` or `add_row` can be
//! given an alias (`"$delivery"`) that later steps use in place of an id.

use optisync::{
    AggregateId, AggregateSeed, EngineConfig, EntityId, EntityKind, FailureMode,
    InMemorySyncClient, SyncEngine, SyncError, SyncEvent,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

const ALIAS_PREFIX: char = '$';

#[derive(Debug, Deserialize)]
pub struct Script {
    #[serde(default)]
    pub config: Option<EngineConfig>,
    #[serde(default)]
    pub aggregates: Vec<AggregateSeed>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

fn one() -> usize {
    1
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Edit {
        entity: String,
        field: String,
        value: Value,
    },
    Toggle {
        entity: String,
        relation: String,
        member: String,
    },
    Materialize {
        aggregate: String,
        template: String,
        #[serde(default)]
        alias: Option<String>,
    },
    AddRow {
        aggregate: String,
        kind: EntityKind,
        #[serde(default)]
        alias: Option<String>,
    },
    SetField {
        aggregate: String,
        field: String,
        value: Value,
    },
    Attach {
        aggregate: String,
        reference: String,
    },
    Detach {
        aggregate: String,
        reference: String,
    },
    Remove {
        entity: String,
    },
    ConfirmRemove {
        aggregate: String,
    },
    Save {
        aggregate: String,
    },
    MarkAll {
        entities: Vec<String>,
        field: String,
        value: Value,
    },
    CloseView {
        aggregate: String,
    },
    Wait {
        ms: u64,
    },
    FailNext {
        #[serde(default = "one")]
        count: usize,
        #[serde(default)]
        transport: bool,
    },
    FailId {
        id: String,
        #[serde(default)]
        transport: bool,
    },
    RecoverId {
        id: String,
    },
    Snapshot {
        aggregate: String,
    },
}

impl Step {
    fn name(&self) -> &'static str {
        match self {
            Self::Edit { .. } => "edit",
            Self::Toggle { .. } => "toggle",
            Self::Materialize { .. } => "materialize",
            Self::AddRow { .. } => "add_row",
            Self::SetField { .. } => "set_field",
            Self::Attach { .. } => "attach",
            Self::Detach { .. } => "detach",
            Self::Remove { .. } => "remove",
            Self::ConfirmRemove { .. } => "confirm_remove",
            Self::Save { .. } => "save",
            Self::MarkAll { .. } => "mark_all",
            Self::CloseView { .. } => "close_view",
            Self::Wait { .. } => "wait",
            Self::FailNext { .. } => "fail_next",
            Self::FailId { .. } => "fail_id",
            Self::RecoverId { .. } => "recover_id",
            Self::Snapshot { .. } => "snapshot",
        }
    }
}

impl Script {
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| SyncError::Config(format!("cannot read '{}': {err}", path.display())))?;
        serde_json::from_str(&raw).map_err(|err| SyncError::Encoding(err.to_string()))
    }
}

fn failure_mode(transport: bool) -> FailureMode {
    if transport {
        FailureMode::Transport
    } else {
        FailureMode::Reject
    }
}

/// Drives one script and prints every step result and event as a JSON line.
pub struct ScriptRunner {
    engine: SyncEngine,
    client: Arc<InMemorySyncClient>,
    events: broadcast::Receiver<SyncEvent>,
    aliases: HashMap<String, EntityId>,
}

impl ScriptRunner {
    pub fn new(config: EngineConfig, client: InMemorySyncClient) -> Result<Self, SyncError> {
        let client = Arc::new(client);
        let engine = SyncEngine::new(config, client.clone())?;
        let events = engine.subscribe();
        Ok(Self {
            engine,
            client,
            events,
            aliases: HashMap::new(),
        })
    }

    pub async fn run(mut self, script: Script) -> Result<(), SyncError> {
        for seed in script.aggregates {
            let aggregate_id = self.engine.load_aggregate(seed)?;
            emit_line(&json!({"loaded": aggregate_id}));
        }

        for (index, step) in script.steps.into_iter().enumerate() {
            let op = step.name();
            let line = match self.apply(step).await {
                Ok(result) => json!({"step": index, "op": op, "ok": true, "result": result}),
                Err(err) => json!({"step": index, "op": op, "ok": false, "error": err.to_string()}),
            };
            emit_line(&line);
            self.drain_events();
        }

        self.settle().await?;
        self.drain_events();

        for aggregate_id in self.engine.aggregate_ids()? {
            let snapshot = self.engine.get_snapshot(&aggregate_id)?;
            let dirty = self.engine.is_dirty(&aggregate_id)?;
            emit_line(&json!({"final": aggregate_id, "dirty": dirty, "snapshot": snapshot}));
        }
        emit_line(&json!({"remote_calls": self.client.call_count()?}));
        Ok(())
    }

    async fn apply(&mut self, step: Step) -> Result<Value, SyncError> {
        match step {
            Step::Edit {
                entity,
                field,
                value,
            } => {
                let id = self.entity(&entity)?;
                self.engine.edit(&id, &field, value)?;
                Ok(Value::Null)
            }
            Step::Toggle {
                entity,
                relation,
                member,
            } => {
                let id = self.entity(&entity)?;
                let members = self.engine.toggle(&id, &relation, &member).await?;
                Ok(json!(members))
            }
            Step::Materialize {
                aggregate,
                template,
                alias,
            } => {
                let id = self
                    .engine
                    .materialize(&AggregateId::new(aggregate), &template)?;
                self.remember(alias, &id);
                Ok(json!(id))
            }
            Step::AddRow {
                aggregate,
                kind,
                alias,
            } => {
                let id = self.engine.add_row(&AggregateId::new(aggregate), kind)?;
                self.remember(alias, &id);
                Ok(json!(id))
            }
            Step::SetField {
                aggregate,
                field,
                value,
            } => {
                self.engine
                    .set_aggregate_field(&AggregateId::new(aggregate), &field, value)?;
                Ok(Value::Null)
            }
            Step::Attach {
                aggregate,
                reference,
            } => {
                self.engine.attach(&AggregateId::new(aggregate), &reference)?;
                Ok(Value::Null)
            }
            Step::Detach {
                aggregate,
                reference,
            } => {
                self.engine.detach(&AggregateId::new(aggregate), &reference)?;
                Ok(Value::Null)
            }
            Step::Remove { entity } => {
                let id = self.entity(&entity)?;
                self.engine.remove(&id).await?;
                Ok(Value::Null)
            }
            Step::ConfirmRemove { aggregate } => {
                self.engine
                    .confirm_cascade_remove(&AggregateId::new(aggregate))
                    .await?;
                Ok(Value::Null)
            }
            Step::Save { aggregate } => {
                let outcome = self.engine.save(&AggregateId::new(aggregate)).await?;
                Ok(json!(outcome))
            }
            Step::MarkAll {
                entities,
                field,
                value,
            } => {
                let ids = entities
                    .iter()
                    .map(|entity| self.entity(entity))
                    .collect::<Result<Vec<_>, _>>()?;
                let report = self.engine.mark_all(&ids, &field, value).await?;
                Ok(json!(report))
            }
            Step::CloseView { aggregate } => {
                let cancelled = self.engine.close_view(&AggregateId::new(aggregate))?;
                Ok(json!({"cancelled": cancelled}))
            }
            Step::Wait { ms } => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(Value::Null)
            }
            Step::FailNext { count, transport } => {
                self.client.fail_next(count, failure_mode(transport))?;
                Ok(Value::Null)
            }
            Step::FailId { id, transport } => {
                self.client.fail_id(id, failure_mode(transport))?;
                Ok(Value::Null)
            }
            Step::RecoverId { id } => {
                self.client.recover_id(&id)?;
                Ok(Value::Null)
            }
            Step::Snapshot { aggregate } => {
                let snapshot = self.engine.get_snapshot(&AggregateId::new(aggregate))?;
                Ok(json!(snapshot))
            }
        }
    }

    fn entity(&self, reference: &str) -> Result<EntityId, SyncError> {
        match reference.strip_prefix(ALIAS_PREFIX) {
            Some(alias) => self
                .aliases
                .get(alias)
                .cloned()
                .ok_or_else(|| {
                    SyncError::InvalidIdentifier(format!("unknown alias '{reference}'"))
                }),
            None => reference.parse(),
        }
    }

    fn remember(&mut self, alias: Option<String>, id: &EntityId) {
        if let Some(alias) = alias {
            let alias = alias.trim_start_matches(ALIAS_PREFIX).to_string();
            self.aliases.insert(alias, id.clone());
        }
    }

    /// Lets every pending debounced save fire before the final report.
    async fn settle(&self) -> Result<(), SyncError> {
        let window = self.engine.config().debounce_window();
        while !self.engine.pending_timers()?.is_empty() {
            tokio::time::sleep(window).await;
        }
        // Timers that already fired may still be waiting on the server.
        tokio::time::sleep(window).await;
        Ok(())
    }

    fn drain_events(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(event) => emit_line(&json!({"event": event})),
                Err(TryRecvError::Lagged(skipped)) => {
                    log::warn!("event stream lagged, {} events skipped", skipped);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }
}

fn emit_line(line: &Value) {
    println!("{line}");
}
