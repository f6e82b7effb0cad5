use crate::EngineError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Tunables for the execution engine and node library.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Total attempts (first try included) for retryable node kinds
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub max_nesting_level: u32,
    pub max_loop_depth: usize,
    pub http_timeout_secs: u64,
    /// Response bodies longer than this many characters are truncated
    pub response_body_limit: usize,
    pub default_event_timeout_secs: i64,
    pub event_buffer_size: usize,
    /// Node executions one walk may perform before the instance is failed
    pub max_steps_per_traversal: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 1000,
            max_nesting_level: 5,
            max_loop_depth: 3,
            http_timeout_secs: 30,
            response_body_limit: 1000,
            default_event_timeout_secs: 86_400,
            event_buffer_size: 1000,
            max_steps_per_traversal: 1000,
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document; missing keys fall back to defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self, EngineError> {
        toml::from_str(raw).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            EngineError::Config(format!("cannot read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml_str(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str("max_attempts = 5\nretry_delay_ms = 0\n").unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.retry_delay_ms, 0);
        assert_eq!(config.max_nesting_level, 5);
        assert_eq!(config.max_loop_depth, 3);
        assert_eq!(config.max_steps_per_traversal, 1000);
    }

    #[test]
    fn malformed_toml_is_rejected() {
        assert!(EngineConfig::from_toml_str("max_attempts = \"many\"").is_err());
    }
}
