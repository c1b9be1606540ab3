//! Declarative relation between a source store and a target collection.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::config::{require_non_empty, ConfigError};

/// Keeps projections of source objects in a collection of target objects.
///
/// A source object whose `source_key_field` holds the id of a target
/// object is listed in that target's `target_collection_field` as
/// `{ <source id field>: <source id>, ...copied_fields }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapperLink {
    /// Name of the store holding the source objects.
    pub source_store: String,

    /// Source attribute holding the target id.
    pub source_key_field: String,

    /// Name of the store holding the target objects.
    pub target_store: String,

    /// Target attribute holding the projections.
    pub target_collection_field: String,

    /// Source attributes copied into each projection.
    #[serde(default)]
    pub copied_fields: Vec<String>,

    /// Delete the listed source objects when a target is deleted.
    #[serde(default)]
    pub cascade_delete: bool,

    /// How many times a projection write is retried after the collection
    /// changed underneath it.
    #[serde(default = "default_max_replay_attempts")]
    pub max_replay_attempts: u32,
}

fn default_max_replay_attempts() -> u32 {
    3
}

impl MapperLink {
    /// Creates a link without copied fields or cascade.
    pub fn new(
        source_store: impl Into<String>,
        source_key_field: impl Into<String>,
        target_store: impl Into<String>,
        target_collection_field: impl Into<String>,
    ) -> Self {
        Self {
            source_store: source_store.into(),
            source_key_field: source_key_field.into(),
            target_store: target_store.into(),
            target_collection_field: target_collection_field.into(),
            copied_fields: Vec::new(),
            cascade_delete: false,
            max_replay_attempts: default_max_replay_attempts(),
        }
    }

    /// Sets the copied fields.
    pub fn with_copied_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.copied_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Enables cascade delete.
    pub fn with_cascade_delete(mut self, cascade: bool) -> Self {
        self.cascade_delete = cascade;
        self
    }

    /// Validates the link on its own; [`Mapper::new`](super::Mapper::new)
    /// also checks it against the bound stores.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_non_empty("source_store", &self.source_store)?;
        require_non_empty("source_key_field", &self.source_key_field)?;
        require_non_empty("target_store", &self.target_store)?;
        require_non_empty("target_collection_field", &self.target_collection_field)?;
        if self.source_store == self.target_store {
            return Err(ConfigError::Conflict(format!(
                "store '{}' cannot be both source and target of a link",
                self.source_store
            )));
        }
        for (i, field) in self.copied_fields.iter().enumerate() {
            require_non_empty("copied_fields", field)?;
            if self.copied_fields[..i].contains(field) {
                return Err(ConfigError::Invalid {
                    option: "copied_fields".to_string(),
                    message: format!("'{}' is listed twice", field),
                });
            }
        }
        if self.max_replay_attempts == 0 {
            return Err(ConfigError::OutOfRange {
                option: "max_replay_attempts".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Returns the target id a source object points at.
    pub fn target_of<'a>(&self, source: &'a Value) -> Option<&'a str> {
        source.get(&self.source_key_field).and_then(Value::as_str)
    }

    /// Builds the projection of a source object.
    pub fn project(&self, id_field: &str, id: &str, source: &Value) -> Value {
        let mut projection = Map::new();
        projection.insert(id_field.to_string(), Value::String(id.to_string()));
        for field in &self.copied_fields {
            if let Some(value) = source.get(field) {
                projection.insert(field.clone(), value.clone());
            }
        }
        Value::Object(projection)
    }
}
