//! Aggregation-expression rendering of filters and orderings.
//!
//! Filters become one `$expr` over the stored `data` sub-document.
//! Aggregation comparisons never traverse arrays the way query operators
//! do, and every value is wrapped in `$literal` so strings starting with
//! `$` are not read as field references.

use mongodb::bson::{doc, Bson, Document};
use serde_json::Value;

use crate::core::BackendKind;
use crate::error::QueryError;
use crate::expr::{AttributePath, Comparison, Operator};
use crate::query::{BackendCapabilities, IndexDefinition, OrderBy, QueryDialect, SortDirection};

/// Name of the sub-document holding the object.
pub(crate) const DATA: &str = "data";

/// Aggregation `$type` names of numeric values.
const NUMERIC_TYPES: [&str; 4] = ["int", "long", "double", "decimal"];

/// Query dialect for MongoDB aggregation expressions.
#[derive(Debug, Clone)]
pub struct MongoDialect {
    capabilities: BackendCapabilities,
}

impl MongoDialect {
    /// Creates a dialect that evaluates every operator natively.
    pub fn new() -> Self {
        Self::with_capabilities(BackendCapabilities::full(BackendKind::MongoDB))
    }

    /// Creates a dialect restricted to conjunctions the given compound
    /// indexes can serve.
    pub fn indexed(indexes: Vec<IndexDefinition>) -> Self {
        Self::with_capabilities(BackendCapabilities::indexed(BackendKind::MongoDB, indexes))
    }

    fn with_capabilities(mut capabilities: BackendCapabilities) -> Self {
        // Field paths treat `.` as a separator and a leading `$` as a
        // variable; numeric segments would address array positions.
        capabilities.paths.integer_segments = false;
        capabilities.paths.forbidden_chars = vec!['.', '$'];
        Self { capabilities }
    }

    /// Renders the pipeline stages that sort by `order`, then by id.
    ///
    /// Each clause sorts first by a type rank, so values of different JSON
    /// types order the same way the in-memory comparator orders them.
    pub fn order_stages(&self, order: &[OrderBy]) -> Result<Vec<Document>, QueryError> {
        let mut ranks = Document::new();
        let mut sort = Document::new();
        let mut cleanup = Document::new();
        for (i, clause) in order.iter().enumerate() {
            if !self.capabilities.paths.supports(&clause.path) {
                return Err(QueryError::CompilationUnsupported {
                    backend: BackendKind::MongoDB.to_string(),
                    message: format!("cannot order by '{}'", clause.path),
                });
            }
            let direction = match clause.direction {
                SortDirection::Ascending => 1,
                SortDirection::Descending => -1,
            };
            let field = field_path(&clause.path);
            let rank_key = format!("_order{}_rank", i);
            let value_key = format!("_order{}_value", i);
            ranks.insert(rank_key.clone(), type_rank(&field));
            ranks.insert(value_key.clone(), Bson::String(field));
            sort.insert(rank_key.clone(), direction);
            sort.insert(value_key.clone(), direction);
            cleanup.insert(rank_key, 0);
            cleanup.insert(value_key, 0);
        }
        sort.insert("_id", 1);

        let mut stages = Vec::new();
        if !ranks.is_empty() {
            stages.push(doc! { "$addFields": ranks });
        }
        stages.push(doc! { "$sort": sort });
        if !cleanup.is_empty() {
            stages.push(doc! { "$project": cleanup });
        }
        Ok(stages)
    }
}

impl Default for MongoDialect {
    fn default() -> Self {
        Self::new()
    }
}

/// `$data.a.b`
pub(crate) fn field_path(path: &AttributePath) -> String {
    format!("${}.{}", DATA, path.segments().join("."))
}

fn type_rank(field: &str) -> Document {
    let type_is = |name: &str| doc! { "$eq": [{ "$type": field }, name] };
    doc! {
        "$switch": {
            "branches": [
                { "case": type_is("missing"), "then": 0 },
                { "case": type_is("null"), "then": 1 },
                { "case": type_is("bool"), "then": 2 },
                { "case": { "$isNumber": field }, "then": 3 },
                { "case": type_is("string"), "then": 4 },
                { "case": type_is("array"), "then": 5 },
                { "case": type_is("object"), "then": 6 },
            ],
            "default": 7,
        }
    }
}

/// Converts a JSON value to BSON.
pub(crate) fn to_bson(value: &Value) -> Result<Bson, QueryError> {
    mongodb::bson::to_bson(value).map_err(|e| QueryError::InvalidExpression {
        message: format!("value {} cannot be stored in MongoDB: {}", value, e),
    })
}

fn literal(value: &Value) -> Result<Bson, QueryError> {
    Ok(Bson::Document(doc! { "$literal": to_bson(value)? }))
}

/// Translates a `LIKE` pattern into an anchored regular expression.
pub(crate) fn like_to_regex(pattern: &str) -> String {
    let mut regex = String::from(r"\A");
    for c in pattern.chars() {
        match c {
            '%' => regex.push_str(".*"),
            '_' => regex.push('.'),
            other => regex.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    regex.push_str(r"\z");
    regex
}

fn unsupported(what: &str) -> QueryError {
    QueryError::CompilationUnsupported {
        backend: BackendKind::MongoDB.to_string(),
        message: format!("unsupported {}", what),
    }
}

impl QueryDialect for MongoDialect {
    type Native = Bson;

    fn capabilities(&self) -> &BackendCapabilities {
        &self.capabilities
    }

    fn match_all(&self) -> Bson {
        Bson::Boolean(true)
    }

    fn match_none(&self) -> Bson {
        Bson::Boolean(false)
    }

    fn comparison(&self, comparison: &Comparison) -> Result<Bson, QueryError> {
        let field = field_path(comparison.path());
        let value = comparison.value();
        let rendered = match comparison.operator() {
            Operator::Eq => doc! { "$eq": [field, literal(value)?] },
            Operator::Ne => doc! { "$ne": [field, literal(value)?] },
            op @ (Operator::Lt | Operator::Le | Operator::Gt | Operator::Ge) => {
                let name = match op {
                    Operator::Lt => "$lt",
                    Operator::Le => "$lte",
                    Operator::Gt => "$gt",
                    _ => "$gte",
                };
                let guard = match value {
                    Value::Number(_) => doc! { "$in": [{ "$type": field.as_str() }, NUMERIC_TYPES.to_vec()] },
                    Value::String(_) => doc! { "$eq": [{ "$type": field.as_str() }, "string"] },
                    _ => return Err(unsupported("ordering operand")),
                };
                let mut compare = Document::new();
                compare.insert(name, vec![Bson::String(field), literal(value)?]);
                doc! { "$and": [guard, compare] }
            }
            Operator::In => {
                let items = comparison.in_values();
                if items.is_empty() {
                    return Ok(self.match_none());
                }
                let items = items.iter().map(to_bson).collect::<Result<Vec<_>, _>>()?;
                doc! { "$in": [field, { "$literal": items }] }
            }
            Operator::Like => {
                let pattern = value.as_str().ok_or_else(|| unsupported("LIKE pattern"))?;
                doc! {
                    "$cond": [
                        { "$eq": [{ "$type": field.as_str() }, "string"] },
                        { "$regexMatch": {
                            "input": field.as_str(),
                            "regex": like_to_regex(pattern),
                            "options": "s",
                        } },
                        false,
                    ]
                }
            }
        };
        Ok(Bson::Document(rendered))
    }

    fn and(&self, children: Vec<Bson>) -> Bson {
        Bson::Document(doc! { "$and": children })
    }

    fn or(&self, children: Vec<Bson>) -> Bson {
        Bson::Document(doc! { "$or": children })
    }
}
