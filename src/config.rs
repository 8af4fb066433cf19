use crate::core::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine configuration
///
/// Every field has a default, so a partial JSON document is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Quiet period after the last edit of a field before it is saved
    pub debounce_window_ms: u64,

    /// Capacity of the event broadcast channel
    pub event_capacity: usize,

    /// Schedule a debounced save of the whole aggregate after edits
    /// in atomically persisted aggregates
    pub autosave_aggregates: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_window_ms: 1_000,
            event_capacity: 256,
            autosave_aggregates: true,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the debounce window
    pub fn debounce_window_ms(mut self, window_ms: u64) -> Self {
        self.debounce_window_ms = window_ms;
        self
    }

    /// Set the event channel capacity
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Enable or disable aggregate autosave
    pub fn autosave_aggregates(mut self, enabled: bool) -> Self {
        self.autosave_aggregates = enabled;
        self
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|err| SyncError::Config(format!("invalid config: {}", err)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|err| SyncError::Config(format!("{}: {}", path.display(), err)))?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.debounce_window_ms == 0 {
            return Err(SyncError::Config(
                "debounce_window_ms must be greater than zero".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(SyncError::Config(
                "event_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_partial_document_uses_defaults() {
        let config = EngineConfig::from_json_str(r#"{"debounce_window_ms": 250}"#).unwrap();
        assert_eq!(config.debounce_window(), Duration::from_millis(250));
        assert_eq!(config.event_capacity, 256);
        assert!(config.autosave_aggregates);
    }

    #[test]
    fn test_zero_window_is_rejected() {
        let err = EngineConfig::new().debounce_window_ms(0).validate().unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"autosave_aggregates": false, "event_capacity": 8}}"#).unwrap();
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config, EngineConfig::new().event_capacity(8).autosave_aggregates(false));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = EngineConfig::load("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }
}
