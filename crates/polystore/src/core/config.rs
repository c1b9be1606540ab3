//! Store configuration shared by every backend.
//!
//! Every recognised option is a field with a documented default. Backend
//! configs embed a [`StoreConfig`] and are validated once, when the store
//! is constructed.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by configuration validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required string option is empty.
    #[error("configuration option '{option}' must not be empty")]
    Empty {
        /// The option name.
        option: String,
    },

    /// A numeric option is out of range.
    #[error("configuration option '{option}' is out of range: {message}")]
    OutOfRange {
        /// The option name.
        option: String,
        /// What is wrong with the value.
        message: String,
    },

    /// A value is malformed.
    #[error("configuration option '{option}' is invalid: {message}")]
    Invalid {
        /// The option name.
        option: String,
        /// What is wrong with the value.
        message: String,
    },

    /// Two options conflict.
    #[error("conflicting configuration: {0}")]
    Conflict(String),
}

impl ConfigError {
    pub(crate) fn empty(option: &str) -> Self {
        ConfigError::Empty {
            option: option.to_string(),
        }
    }
}

/// Returns an error if the string option is empty.
pub(crate) fn require_non_empty(option: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        Err(ConfigError::empty(option))
    } else {
        Ok(())
    }
}

/// Returns an error unless the value is a plain identifier
/// (`[A-Za-z_][A-Za-z0-9_]*`), as required for table and index names.
pub(crate) fn require_identifier(option: &str, value: &str) -> Result<(), ConfigError> {
    let mut chars = value.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            option: option.to_string(),
            message: format!("'{}' is not an identifier", value),
        })
    }
}

/// What `delete` does with an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeleteMode {
    /// Remove the object physically.
    #[default]
    Hard,
    /// Keep the object as a tombstone, invisible to reads, until purged.
    Tombstone,
}

/// Options common to every store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store name, used in events, logs and errors.
    pub name: String,

    /// Attribute holding the object identifier.
    #[serde(default = "default_id_field")]
    pub id_field: String,

    /// Attribute holding the last-update timestamp (RFC 3339).
    #[serde(default = "default_last_update_field")]
    pub last_update_field: String,

    /// Behaviour of `delete`.
    #[serde(default)]
    pub delete_mode: DeleteMode,

    /// Page size when a query has no limit.
    #[serde(default = "default_page_size")]
    pub default_page_size: u32,

    /// Upper bound on any page size.
    #[serde(default = "default_max_page_size")]
    pub max_page_size: u32,

    /// Rows fetched per native round trip while a residual filter is applied.
    #[serde(default = "default_scan_batch_size")]
    pub scan_batch_size: u32,
}

fn default_id_field() -> String {
    "uuid".to_string()
}

fn default_last_update_field() -> String {
    "_lastUpdate".to_string()
}

fn default_page_size() -> u32 {
    100
}

fn default_max_page_size() -> u32 {
    1000
}

fn default_scan_batch_size() -> u32 {
    200
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new("default")
    }
}

impl StoreConfig {
    /// Creates a configuration with defaults for everything but the name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id_field: default_id_field(),
            last_update_field: default_last_update_field(),
            delete_mode: DeleteMode::default(),
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
            scan_batch_size: default_scan_batch_size(),
        }
    }

    /// Sets the delete mode.
    pub fn with_delete_mode(mut self, mode: DeleteMode) -> Self {
        self.delete_mode = mode;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_non_empty("name", &self.name)?;
        require_non_empty("id_field", &self.id_field)?;
        require_non_empty("last_update_field", &self.last_update_field)?;
        if self.id_field == self.last_update_field {
            return Err(ConfigError::Conflict(format!(
                "id_field and last_update_field are both '{}'",
                self.id_field
            )));
        }
        if self.default_page_size == 0 {
            return Err(ConfigError::OutOfRange {
                option: "default_page_size".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.max_page_size < self.default_page_size {
            return Err(ConfigError::OutOfRange {
                option: "max_page_size".to_string(),
                message: format!(
                    "{} is below default_page_size {}",
                    self.max_page_size, self.default_page_size
                ),
            });
        }
        if self.scan_batch_size == 0 {
            return Err(ConfigError::OutOfRange {
                option: "scan_batch_size".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Resolves a requested page size against the defaults and the cap.
    pub fn page_size(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.default_page_size)
            .clamp(1, self.max_page_size)
    }
}

/// Serde adapter for `Duration` fields written as `"5s"`, `"250ms"`.
pub(crate) mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_json() {
        let config: StoreConfig = serde_json::from_str(r#"{"name": "users"}"#).unwrap();
        assert_eq!(config, StoreConfig::new("users"));
        assert_eq!(config.id_field, "uuid");
        assert_eq!(config.last_update_field, "_lastUpdate");
        assert_eq!(config.delete_mode, DeleteMode::Hard);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = StoreConfig::new("");
        assert_eq!(config.validate(), Err(ConfigError::empty("name")));

        config = StoreConfig::new("s");
        config.last_update_field = "uuid".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Conflict(_))));

        config = StoreConfig::new("s");
        config.max_page_size = 10;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_require_identifier() {
        assert!(require_identifier("table", "users_2").is_ok());
        assert!(require_identifier("table", "2users").is_err());
        assert!(require_identifier("table", "users; drop").is_err());
        assert!(require_identifier("table", "").is_err());
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Timeouts {
        #[serde(with = "humantime_serde")]
        connect: std::time::Duration,
    }

    #[test]
    fn test_humantime_durations() {
        let parsed: Timeouts = serde_json::from_str(r#"{"connect": "1s 500ms"}"#).unwrap();
        assert_eq!(parsed.connect, std::time::Duration::from_millis(1500));
        assert!(serde_json::from_str::<Timeouts>(r#"{"connect": "soon"}"#).is_err());
    }

    #[test]
    fn test_page_size() {
        let config = StoreConfig::new("s");
        assert_eq!(config.page_size(None), 100);
        assert_eq!(config.page_size(Some(5000)), 1000);
        assert_eq!(config.page_size(Some(0)), 1);
    }
}
