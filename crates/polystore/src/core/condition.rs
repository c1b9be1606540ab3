//! Write conditions for optimistic concurrency control.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StorageError, StorageResult};
use crate::expr::eval::values_equal;

use super::partial::PartialUpdate;

/// Expected value of a top-level attribute at write time.
///
/// A backend checks the condition and performs the write in one atomic
/// step; if the stored value differs (or the attribute is missing) the
/// write is rejected with `UpdateConditionFailed` and nothing changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteCondition {
    /// Attribute to check.
    pub field: String,
    /// Value the attribute must hold.
    pub expected: Value,
}

impl WriteCondition {
    /// Creates a condition.
    pub fn new(field: impl Into<String>, expected: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            expected: expected.into(),
        }
    }

    /// Returns true if `target` satisfies the condition.
    ///
    /// Numbers compare by value; a missing attribute never matches.
    pub fn holds(&self, target: &Value) -> bool {
        target
            .get(&self.field)
            .is_some_and(|actual| values_equal(actual, &self.expected))
    }

    /// The error reported when the condition does not hold.
    pub fn failure(&self, id: &str) -> StorageError {
        StorageError::condition_failed(id, &self.field, &self.expected)
    }

    /// Checks the condition against `target`.
    pub fn check(&self, id: &str, target: &Value) -> StorageResult<()> {
        if self.holds(target) {
            Ok(())
        } else {
            Err(self.failure(id))
        }
    }
}

/// Checks an optional condition.
pub(crate) fn check_condition(
    condition: Option<&WriteCondition>,
    id: &str,
    target: &Value,
) -> StorageResult<()> {
    match condition {
        Some(c) => c.check(id, target),
        None => Ok(()),
    }
}

/// Checks an optional condition for a targeted update.
///
/// Index-addressed updates check the condition against the item at that
/// index. When the item does not exist the check passes and applying the
/// update reports the missing collection or index instead.
pub(crate) fn check_partial_condition(
    condition: Option<&WriteCondition>,
    update: &PartialUpdate,
    id: &str,
    content: &Value,
) -> StorageResult<()> {
    let Some(condition) = condition else {
        return Ok(());
    };
    match update.index() {
        None => condition.check(id, content),
        Some(_) => match update.addressed_item(content) {
            Some(item) => condition.check(id, item),
            None => Ok(()),
        },
    }
}
