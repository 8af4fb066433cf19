// ============================================================================
// Sync Client
// ============================================================================
//
// Contract of the remote API the engine persists through. Requests carry
// JSON payloads and answer with `{ status, message?, data? }`; a `false`
// status is a rejection, an `Err` means the call never produced a response.
//
// ============================================================================

pub mod memory;

pub use memory::{CallKind, FailureMode, InMemorySyncClient, RecordedCall};

use crate::core::{Result, SyncError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub status: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl SyncResponse {
    pub fn ok(data: Option<Value>) -> Self {
        Self {
            status: true,
            message: None,
            data,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            status: false,
            message: Some(message.into()),
            data: None,
        }
    }

    /// Identifier the server assigned to a created record (`data.id`).
    pub fn assigned_id(&self) -> Option<String> {
        match self.data.as_ref()?.get("id")? {
            Value::String(id) if !id.trim().is_empty() => Some(id.trim().to_string()),
            Value::Number(id) => Some(id.to_string()),
            _ => None,
        }
    }

    /// Turns a `false` status into [`SyncError::Rejected`].
    pub fn into_result(self) -> Result<Self> {
        if self.status {
            Ok(self)
        } else {
            Err(SyncError::Rejected(
                self.message
                    .unwrap_or_else(|| "request rejected by server".to_string()),
            ))
        }
    }
}

#[async_trait]
pub trait SyncClient: Send + Sync {
    async fn create(&self, payload: Value) -> Result<SyncResponse>;

    async fn update(&self, id: &str, payload: Value) -> Result<SyncResponse>;

    async fn delete(&self, id: &str) -> Result<SyncResponse>;
}
