//! Targeted mutations of a single attribute.

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::error::ValidationError;

/// A mutation that touches one attribute of an object.
///
/// Carried by `PartialUpdated` events so listeners can replay the same
/// change elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PartialUpdate {
    /// Atomic numeric increment.
    Increment {
        /// Numeric attribute.
        attribute: String,
        /// Amount added (may be negative).
        delta: i64,
    },
    /// Replace the item at `index`, or append when `index` is `None`.
    UpsertItem {
        /// Array attribute.
        collection: String,
        /// New item.
        item: Value,
        /// Position to replace.
        index: Option<usize>,
    },
    /// Remove the item at `index`.
    DeleteItem {
        /// Array attribute.
        collection: String,
        /// Position to remove.
        index: usize,
    },
    /// Remove the attribute.
    RemoveAttribute {
        /// Attribute to remove.
        attribute: String,
    },
}

impl PartialUpdate {
    /// Returns the attribute this update touches.
    pub fn attribute(&self) -> &str {
        match self {
            PartialUpdate::Increment { attribute, .. }
            | PartialUpdate::RemoveAttribute { attribute } => attribute,
            PartialUpdate::UpsertItem { collection, .. }
            | PartialUpdate::DeleteItem { collection, .. } => collection,
        }
    }

    /// Returns the collection index this update addresses, if any.
    pub fn index(&self) -> Option<usize> {
        match self {
            PartialUpdate::UpsertItem { index, .. } => *index,
            PartialUpdate::DeleteItem { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// Returns the item at the addressed index, which a collection write
    /// condition is checked against.
    pub fn addressed_item<'a>(&self, content: &'a Value) -> Option<&'a Value> {
        let index = self.index()?;
        content.get(self.attribute())?.as_array()?.get(index)
    }

    /// Applies the update to object content in place.
    ///
    /// Backends without a native targeted update run this inside their
    /// own atomic section; others use it to derive the after-state.
    pub fn apply(&self, content: &mut Value) -> Result<(), ValidationError> {
        let Some(map) = content.as_object_mut() else {
            return Err(ValidationError::InvalidObject {
                message: "content is not an object".to_string(),
            });
        };

        match self {
            PartialUpdate::Increment { attribute, delta } => {
                let next = match map.get(attribute) {
                    None | Some(Value::Null) => Value::from(*delta),
                    Some(Value::Number(n)) => increment(n, *delta).ok_or_else(|| {
                        ValidationError::NumericOverflow {
                            attribute: attribute.clone(),
                            delta: *delta,
                        }
                    })?,
                    Some(_) => {
                        return Err(ValidationError::NotANumber {
                            attribute: attribute.clone(),
                        });
                    }
                };
                map.insert(attribute.clone(), next);
            }
            PartialUpdate::UpsertItem {
                collection,
                item,
                index,
            } => {
                let slot = map
                    .entry(collection.clone())
                    .or_insert_with(|| Value::Array(Vec::new()));
                let Some(items) = slot.as_array_mut() else {
                    return Err(ValidationError::NotACollection {
                        attribute: collection.clone(),
                    });
                };
                match index {
                    Some(i) if *i < items.len() => items[*i] = item.clone(),
                    Some(i) => {
                        return Err(ValidationError::IndexOutOfRange {
                            attribute: collection.clone(),
                            index: *i,
                        });
                    }
                    None => items.push(item.clone()),
                }
            }
            PartialUpdate::DeleteItem { collection, index } => {
                let items = map
                    .get_mut(collection)
                    .and_then(Value::as_array_mut)
                    .ok_or_else(|| ValidationError::NotACollection {
                        attribute: collection.clone(),
                    })?;
                if *index >= items.len() {
                    return Err(ValidationError::IndexOutOfRange {
                        attribute: collection.clone(),
                        index: *index,
                    });
                }
                items.remove(*index);
            }
            PartialUpdate::RemoveAttribute { attribute } => {
                map.remove(attribute);
            }
        }
        Ok(())
    }
}

/// `current + delta`, or `None` when the sum leaves the number's range.
fn increment(current: &Number, delta: i64) -> Option<Value> {
    if let Some(i) = current.as_i64() {
        return i.checked_add(delta).map(Value::from);
    }
    if let Some(u) = current.as_u64() {
        return u.checked_add_signed(delta).map(Value::from);
    }
    let f = current.as_f64()? + delta as f64;
    Number::from_f64(f).map(Value::Number)
}
