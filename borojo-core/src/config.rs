// borojo-core/src/config.rs
//! Database configuration.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::query::operators::DEFAULT_REGEX_CACHE_CAPACITY;
use crate::update::UpdateOptions;

/// Settings applied when a [`Database`](crate::Database) is created.
///
/// Every field has a default, so `{}` is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Policy used by `update_one` / `update_many` on collection handles.
    pub update: UpdateOptions,
    /// Capacity of the process-wide compiled regex cache.
    pub regex_cache_capacity: usize,
    /// Default log filter for front ends that install a subscriber.
    pub log_level: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            update: UpdateOptions::default(),
            regex_cache_capacity: DEFAULT_REGEX_CACHE_CAPACITY,
            log_level: "warn".to_string(),
        }
    }
}

impl DatabaseConfig {
    pub fn from_json(value: &Value) -> Result<Self> {
        let config: DatabaseConfig = serde_json::from_value(value.clone())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_json(&value)
    }

    pub fn validate(&self) -> Result<()> {
        if self.regex_cache_capacity == 0 {
            return Err(StoreError::invalid("regex_cache_capacity must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_from_empty_object() {
        let config = DatabaseConfig::from_json(&json!({})).unwrap();
        assert_eq!(config, DatabaseConfig::default());
        assert_eq!(config.regex_cache_capacity, 100);
        assert_eq!(config.log_level, "warn");
        assert!(!config.update.absent_as_zero);
    }

    #[test]
    fn test_partial_override() {
        let config = DatabaseConfig::from_json_str(
            r#"{"update": {"absent_as_zero": true}, "log_level": "debug"}"#,
        )
        .unwrap();
        assert!(config.update.absent_as_zero);
        assert!(!config.update.skip_type_mismatch);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.regex_cache_capacity, 100);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(DatabaseConfig::from_json(&json!({"regex_cache_capacity": 0})).is_err());
        assert!(DatabaseConfig::from_json(&json!({"log_level": 3})).is_err());
        assert!(DatabaseConfig::from_json_str("not json").is_err());
    }
}
