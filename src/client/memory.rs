use super::{SyncClient, SyncResponse};
use crate::core::{Result, SyncError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Create,
    Update,
    Delete,
}

/// How a scripted failure surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// The server answers with `status: false`.
    Reject,
    /// The call never produces a response.
    Transport,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedCall {
    pub at: DateTime<Utc>,
    pub kind: CallKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

#[derive(Default)]
struct MemoryState {
    records: BTreeMap<String, Value>,
    calls: Vec<RecordedCall>,
    fail_next: Vec<FailureMode>,
    failing_ids: HashMap<String, FailureMode>,
}

impl MemoryState {
    fn scripted_failure(&mut self, target: Option<&str>) -> Option<FailureMode> {
        if let Some(mode) = target.and_then(|id| self.failing_ids.get(id)) {
            return Some(*mode);
        }
        if self.fail_next.is_empty() {
            None
        } else {
            Some(self.fail_next.remove(0))
        }
    }
}

/// In-process stand-in for the remote API.
///
/// Keeps created records in memory, assigns UUID identifiers and logs every
/// call. Failures can be scripted for the next calls or for specific ids.
pub struct InMemorySyncClient {
    state: Mutex<MemoryState>,
    latency: Duration,
}

impl Default for InMemorySyncClient {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySyncClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            latency: Duration::ZERO,
        }
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Stores a record as if it had been created earlier.
    pub fn seed_record(&self, id: impl Into<String>, record: Value) -> Result<()> {
        self.state.lock()?.records.insert(id.into(), record);
        Ok(())
    }

    /// Fails the next `count` calls.
    pub fn fail_next(&self, count: usize, mode: FailureMode) -> Result<()> {
        let mut state = self.state.lock()?;
        state.fail_next.extend(std::iter::repeat_n(mode, count));
        Ok(())
    }

    /// Fails every call targeting `id` until [`recover_id`](Self::recover_id).
    pub fn fail_id(&self, id: impl Into<String>, mode: FailureMode) -> Result<()> {
        self.state.lock()?.failing_ids.insert(id.into(), mode);
        Ok(())
    }

    pub fn recover_id(&self, id: &str) -> Result<()> {
        self.state.lock()?.failing_ids.remove(id);
        Ok(())
    }

    pub fn calls(&self) -> Result<Vec<RecordedCall>> {
        Ok(self.state.lock()?.calls.clone())
    }

    pub fn call_count(&self) -> Result<usize> {
        Ok(self.state.lock()?.calls.len())
    }

    pub fn record(&self, id: &str) -> Result<Option<Value>> {
        Ok(self.state.lock()?.records.get(id).cloned())
    }

    pub fn record_ids(&self) -> Result<Vec<String>> {
        Ok(self.state.lock()?.records.keys().cloned().collect())
    }

    async fn begin(
        &self,
        kind: CallKind,
        target: Option<&str>,
        payload: Option<&Value>,
    ) -> Result<Option<FailureMode>> {
        {
            let mut state = self.state.lock()?;
            state.calls.push(RecordedCall {
                at: Utc::now(),
                kind,
                target: target.map(str::to_string),
                payload: payload.cloned(),
            });
        }
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
        let mut state = self.state.lock()?;
        Ok(state.scripted_failure(target))
    }
}

fn scripted(mode: FailureMode, what: &str) -> Result<SyncResponse> {
    match mode {
        FailureMode::Reject => Ok(SyncResponse::rejected(format!("{} rejected", what))),
        FailureMode::Transport => Err(SyncError::Transport(format!("{} timed out", what))),
    }
}

/// JSON merge patch: objects merge recursively, `null` removes a key, any
/// other value replaces the target.
fn merge_patch(target: &mut Value, patch: Value) {
    match patch {
        Value::Object(patch) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            if let Value::Object(target) = target {
                for (key, value) in patch {
                    if value.is_null() {
                        target.remove(&key);
                    } else {
                        merge_patch(target.entry(key).or_insert(Value::Null), value);
                    }
                }
            }
        }
        other => *target = other,
    }
}

#[async_trait]
impl SyncClient for InMemorySyncClient {
    async fn create(&self, payload: Value) -> Result<SyncResponse> {
        if let Some(mode) = self.begin(CallKind::Create, None, Some(&payload)).await? {
            return scripted(mode, "create");
        }

        let id = Uuid::new_v4().to_string();
        let mut record = payload;
        if let Value::Object(fields) = &mut record {
            fields.insert("id".to_string(), Value::String(id.clone()));
        }
        self.state.lock()?.records.insert(id, record.clone());
        Ok(SyncResponse::ok(Some(record)))
    }

    async fn update(&self, id: &str, payload: Value) -> Result<SyncResponse> {
        if let Some(mode) = self
            .begin(CallKind::Update, Some(id), Some(&payload))
            .await?
        {
            return scripted(mode, &format!("update of '{}'", id));
        }

        let mut state = self.state.lock()?;
        let Some(record) = state.records.get_mut(id) else {
            return Ok(SyncResponse::rejected(format!("record '{}' not found", id)));
        };
        merge_patch(record, payload);
        Ok(SyncResponse::ok(Some(record.clone())))
    }

    async fn delete(&self, id: &str) -> Result<SyncResponse> {
        if let Some(mode) = self.begin(CallKind::Delete, Some(id), None).await? {
            return scripted(mode, &format!("delete of '{}'", id));
        }

        let mut state = self.state.lock()?;
        if state.records.remove(id).is_none() {
            return Ok(SyncResponse::rejected(format!("record '{}' not found", id)));
        }
        // Rows created on behalf of an aggregate go with it.
        state.records.retain(|_, record| {
            record.get("aggregate_id").and_then(Value::as_str) != Some(id)
        });
        Ok(SyncResponse::ok(None))
    }
}
