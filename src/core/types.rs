use super::error::SyncError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const VIRTUAL_PREFIX: &str = "temp:";
const LOCAL_PREFIX: &str = "row:";

/// Identity of an entity held in the registry.
///
/// - `Persisted` carries the identifier issued by the server.
/// - `Virtual` is the deterministic placeholder of a template row that has no
///   server counterpart yet (`temp:<aggregate>/<template>`).
/// - `Local` names a row of an atomically persisted aggregate; the row has no
///   identity of its own on the server (`row:<n>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum EntityId {
    Persisted(String),
    Virtual(String),
    Local(String),
}

impl EntityId {
    pub fn persisted(id: impl Into<String>) -> Self {
        Self::Persisted(id.into())
    }

    /// Placeholder identity of a template row. Same inputs, same id.
    pub fn virtual_for(aggregate: &AggregateId, template_key: &str) -> Self {
        Self::Virtual(format!("{}/{}", aggregate, template_key.trim()))
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self, Self::Virtual(_))
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Persisted(id) => write!(f, "{id}"),
            Self::Virtual(key) => write!(f, "{VIRTUAL_PREFIX}{key}"),
            Self::Local(key) => write!(f, "{LOCAL_PREFIX}{key}"),
        }
    }
}

impl FromStr for EntityId {
    type Err = SyncError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        let parsed = if let Some(key) = raw.strip_prefix(VIRTUAL_PREFIX) {
            Self::Virtual(key.to_string())
        } else if let Some(key) = raw.strip_prefix(LOCAL_PREFIX) {
            Self::Local(key.to_string())
        } else {
            Self::Persisted(raw.to_string())
        };

        let inner = match &parsed {
            Self::Persisted(value) | Self::Virtual(value) | Self::Local(value) => value,
        };
        if inner.is_empty() {
            return Err(SyncError::InvalidIdentifier(format!(
                "empty entity identifier '{raw}'"
            )));
        }
        Ok(parsed)
    }
}

impl From<EntityId> for String {
    fn from(value: EntityId) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for EntityId {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Client-side handle of an aggregate root. Stable for the lifetime of the
/// registry; the server id, once known, lives on the aggregate itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateId(String);

impl AggregateId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AggregateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AggregateId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for AggregateId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_id_is_deterministic() {
        let lot = AggregateId::new("lot-7");
        let first = EntityId::virtual_for(&lot, "Delivery");
        let second = EntityId::virtual_for(&lot, " Delivery ");
        assert_eq!(first, second);
        assert_eq!(first.to_string(), "temp:lot-7/Delivery");
    }

    #[test]
    fn test_parse_round_trips_each_kind() {
        for raw in ["srv-12", "temp:lot-7/Delivery", "row:4"] {
            let id: EntityId = raw.parse().unwrap();
            assert_eq!(id.to_string(), raw);
        }
        assert!("temp:".parse::<EntityId>().is_err());
        assert!("  ".parse::<EntityId>().is_err());
    }

    #[test]
    fn test_serde_uses_display_form() {
        let id = EntityId::Local("9".into());
        let encoded = serde_json::to_string(&id).unwrap();
        assert_eq!(encoded, "\"row:9\"");
        let decoded: EntityId = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, id);
    }
}
