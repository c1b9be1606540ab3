//! Stored objects and their bookkeeping fields.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StorageResult, ValidationError};
use crate::expr::AttributePath;

use super::config::StoreConfig;

/// Visibility state of a persisted object.
///
/// Absence is not a state: an absent object is simply not returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectState {
    /// Visible to reads and mutations.
    #[default]
    Present,
    /// Deleted but retained until purged; invisible to reads and mutations.
    Tombstoned,
}

/// A JSON object owned by one store.
///
/// The content always carries the identifier and last-update fields named
/// by the store's [`StoreConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredObject {
    id: String,
    content: Value,
    last_updated: DateTime<Utc>,
    #[serde(default)]
    state: ObjectState,
}

impl StoredObject {
    /// Creates a present object.
    pub fn new(id: impl Into<String>, content: Value, last_updated: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            content,
            last_updated,
            state: ObjectState::Present,
        }
    }

    /// Sets the state.
    pub fn with_state(mut self, state: ObjectState) -> Self {
        self.state = state;
        self
    }

    /// Returns the identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the JSON content.
    pub fn content(&self) -> &Value {
        &self.content
    }

    /// Consumes the object, returning its content.
    pub fn into_content(self) -> Value {
        self.content
    }

    /// Returns when the object was last mutated.
    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    /// Returns the visibility state.
    pub fn state(&self) -> ObjectState {
        self.state
    }

    /// Returns true if the object is tombstoned.
    pub fn is_tombstoned(&self) -> bool {
        self.state == ObjectState::Tombstoned
    }

    /// Returns a top-level attribute.
    pub fn get(&self, attribute: &str) -> Option<&Value> {
        self.content.get(attribute)
    }

    /// Resolves a (possibly nested) attribute path.
    pub fn resolve(&self, path: &AttributePath) -> Option<&Value> {
        path.resolve(&self.content)
    }
}

/// Current time truncated to the precision persisted by backends.
pub(crate) fn now() -> DateTime<Utc> {
    let now = Utc::now();
    parse_timestamp(&format_timestamp(now)).unwrap_or(now)
}

pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Rejects identifiers that cannot be stored under every backend.
pub(crate) fn validate_id(id: &str) -> Result<(), ValidationError> {
    if id.is_empty() {
        return Err(ValidationError::InvalidIdentifier {
            id: id.to_string(),
            message: "identifier must not be empty".to_string(),
        });
    }
    if id.contains('/') || id.contains('\\') || id == "." || id == ".." || id.chars().any(char::is_control) {
        return Err(ValidationError::InvalidIdentifier {
            id: id.to_string(),
            message: "identifier must not contain path separators or control characters".to_string(),
        });
    }
    Ok(())
}

fn require_object(value: &Value) -> Result<(), ValidationError> {
    if value.is_object() {
        Ok(())
    } else {
        Err(ValidationError::InvalidObject {
            message: format!("expected a JSON object, got {}", type_name(value)),
        })
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Prepares a new object for `save`: checks its shape, assigns an id if
/// absent and stamps the last-update field.
pub(crate) fn prepare_new(
    config: &StoreConfig,
    mut content: Value,
) -> StorageResult<(String, Value, DateTime<Utc>)> {
    require_object(&content)?;
    let id = match content.get(&config.id_field) {
        Some(Value::String(id)) => id.clone(),
        None | Some(Value::Null) => uuid::Uuid::new_v4().to_string(),
        Some(other) => {
            return Err(ValidationError::InvalidIdentifier {
                id: other.to_string(),
                message: format!("'{}' must be a string", config.id_field),
            }
            .into());
        }
    };
    validate_id(&id)?;
    let now = now();
    content[config.id_field.as_str()] = Value::String(id.clone());
    content[config.last_update_field.as_str()] = Value::String(format_timestamp(now));
    Ok((id, content, now))
}

/// Prepares a full replacement for `update`.
pub(crate) fn prepare_replacement(
    config: &StoreConfig,
    id: &str,
    mut content: Value,
) -> StorageResult<(Value, DateTime<Utc>)> {
    require_object(&content)?;
    match content.get(&config.id_field) {
        None | Some(Value::Null) => {}
        Some(Value::String(payload)) if payload == id => {}
        Some(other) => {
            return Err(ValidationError::IdentifierMismatch {
                payload: other.as_str().map_or_else(|| other.to_string(), str::to_string),
                target: id.to_string(),
            }
            .into());
        }
    }
    let now = now();
    content[config.id_field.as_str()] = Value::String(id.to_string());
    content[config.last_update_field.as_str()] = Value::String(format_timestamp(now));
    Ok((content, now))
}

/// Checks a merge patch document and strips the bookkeeping fields from it,
/// so a patch can neither rename nor back-date an object.
pub(crate) fn prepare_patch(config: &StoreConfig, mut patch: Value) -> StorageResult<Value> {
    require_object(&patch)?;
    if let Some(map) = patch.as_object_mut() {
        map.remove(&config.id_field);
        map.remove(&config.last_update_field);
    }
    Ok(patch)
}

/// Rejects attribute names that would address bookkeeping fields.
pub(crate) fn check_mutable_attribute(config: &StoreConfig, attribute: &str) -> StorageResult<()> {
    if attribute.is_empty() || attribute == config.id_field || attribute == config.last_update_field {
        return Err(ValidationError::InvalidObject {
            message: format!("attribute '{}' cannot be mutated directly", attribute),
        }
        .into());
    }
    Ok(())
}

/// Stamps the last-update field.
pub(crate) fn touch(config: &StoreConfig, content: &mut Value, at: DateTime<Utc>) {
    if let Some(map) = content.as_object_mut() {
        map.insert(
            config.last_update_field.clone(),
            Value::String(format_timestamp(at)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prepare_new_assigns_id_and_timestamp() {
        let config = StoreConfig::new("users");
        let (id, content, at) = prepare_new(&config, json!({"name": "a"})).unwrap();
        assert_eq!(content["uuid"], json!(id));
        let stamped = content[config.last_update_field.as_str()].as_str().unwrap();
        assert_eq!(parse_timestamp(stamped), Some(at));
    }

    #[test]
    fn test_prepare_new_keeps_given_id() {
        let config = StoreConfig::new("users");
        let (id, _, _) = prepare_new(&config, json!({"uuid": "u1"})).unwrap();
        assert_eq!(id, "u1");
        assert!(prepare_new(&config, json!({"uuid": 5})).is_err());
        assert!(prepare_new(&config, json!({"uuid": "a/b"})).is_err());
        assert!(prepare_new(&config, json!([1])).is_err());
    }

    #[test]
    fn test_prepare_replacement_checks_id() {
        let config = StoreConfig::new("users");
        let (content, _) = prepare_replacement(&config, "u1", json!({"a": 1})).unwrap();
        assert_eq!(content["uuid"], json!("u1"));
        assert!(prepare_replacement(&config, "u1", json!({"uuid": "u2"})).is_err());
    }

    #[test]
    fn test_prepare_patch_strips_bookkeeping() {
        let config = StoreConfig::new("users");
        let patch = prepare_patch(&config, json!({"uuid": "x", "_lastUpdate": "y", "a": 1})).unwrap();
        assert_eq!(patch, json!({"a": 1}));
    }

    #[test]
    fn test_timestamp_round_trip() {
        let at = now();
        assert_eq!(parse_timestamp(&format_timestamp(at)), Some(at));
    }
}
