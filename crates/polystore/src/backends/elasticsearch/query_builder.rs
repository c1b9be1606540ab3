//! Search documents and the query DSL rendered against them.
//!
//! An object is indexed as a flat, typed projection: every scalar reached
//! through nested objects lands in a field named after its type and its
//! path, with segments joined by `/` so that no two paths share an object
//! mapping.
//!
//! ```text
//! {"team": {"id": 3}, "name": "ada", "tags": ["x"]}
//!   => {"num": {"team/id": 3}, "str": {"name": "ada"}, "arr": {"tags": true}}
//! ```
//!
//! Each comparison therefore targets exactly one field whose mapping
//! matches the type of the compared value, and values of other types can
//! never match. Array contents are not indexed, as the expression model
//! does not traverse arrays.

use serde_json::{json, Map, Value};

use crate::core::BackendKind;
use crate::error::QueryError;
use crate::expr::{AttributePath, Comparison, Operator};
use crate::query::{BackendCapabilities, OrderBy, QueryDialect, SortDirection};

/// Separator between path segments in projected field names.
pub(crate) const SEGMENT_SEPARATOR: char = '/';

/// Field holding the object id.
pub(crate) const ID_FIELD: &str = "id";

/// Field holding the last-update timestamp.
pub(crate) const LAST_UPDATED_FIELD: &str = "last_updated";

/// Projection groups, one per indexed JSON type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ValueKind {
    Null,
    Bool,
    Number,
    String,
    Array,
}

impl ValueKind {
    pub(crate) const ALL: [ValueKind; 5] = [
        ValueKind::Null,
        ValueKind::Bool,
        ValueKind::Number,
        ValueKind::String,
        ValueKind::Array,
    ];

    /// The top-level field grouping values of this kind.
    pub(crate) fn group(self) -> &'static str {
        match self {
            ValueKind::Null => "nul",
            ValueKind::Bool => "bool",
            ValueKind::Number => "num",
            ValueKind::String => "str",
            ValueKind::Array => "arr",
        }
    }

    fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(ValueKind::Null),
            Value::Bool(_) => Some(ValueKind::Bool),
            Value::Number(_) => Some(ValueKind::Number),
            Value::String(_) => Some(ValueKind::String),
            Value::Array(_) => Some(ValueKind::Array),
            Value::Object(_) => None,
        }
    }
}

/// Full field name of `path` in the projection group for `kind`.
pub(crate) fn field(kind: ValueKind, path: &AttributePath) -> String {
    format!(
        "{}.{}",
        kind.group(),
        path.segments().join(&SEGMENT_SEPARATOR.to_string())
    )
}

/// Builds the search document for an object.
pub(crate) fn project(id: &str, content: &Value, last_updated: &str) -> Value {
    let mut groups: Vec<Map<String, Value>> = ValueKind::ALL.iter().map(|_| Map::new()).collect();
    if let Value::Object(map) = content {
        collect(map, &mut Vec::new(), &mut groups);
    }

    let mut document = Map::new();
    document.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
    document.insert(
        LAST_UPDATED_FIELD.to_string(),
        Value::String(last_updated.to_string()),
    );
    for (kind, values) in ValueKind::ALL.iter().zip(groups) {
        document.insert(kind.group().to_string(), Value::Object(values));
    }
    Value::Object(document)
}

fn collect<'a>(
    map: &'a Map<String, Value>,
    prefix: &mut Vec<&'a str>,
    groups: &mut [Map<String, Value>],
) {
    for (key, value) in map {
        // Keys the search engine would reinterpret are left out; paths
        // through them are never queried natively.
        if key.trim().is_empty() || key.contains('.') || key.contains(SEGMENT_SEPARATOR) {
            continue;
        }
        prefix.push(key);
        match value {
            Value::Object(inner) => collect(inner, prefix, groups),
            scalar => {
                if let Some(kind) = ValueKind::of(scalar) {
                    let indexed = match kind {
                        ValueKind::Null | ValueKind::Array => Value::Bool(true),
                        _ => scalar.clone(),
                    };
                    let name = prefix.join(&SEGMENT_SEPARATOR.to_string());
                    if let Some(slot) = ValueKind::ALL.iter().position(|k| *k == kind) {
                        groups[slot].insert(name, indexed);
                    }
                }
            }
        }
        prefix.pop();
    }
}

/// Translates a `LIKE` pattern into a wildcard query pattern.
pub(crate) fn like_to_wildcard(pattern: &str) -> String {
    let mut wildcard = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        match c {
            '%' => wildcard.push('*'),
            '_' => wildcard.push('?'),
            '*' | '?' | '\\' => {
                wildcard.push('\\');
                wildcard.push(c);
            }
            other => wildcard.push(other),
        }
    }
    wildcard
}

/// Painless script ranking the type of the value at a path, in the order
/// the in-memory comparator uses.
const RANK_SCRIPT: &str = "\
for (int i = 0; i < params.fields.length; i++) {\
  String f = params.fields[i];\
  if (doc.containsKey(f) && doc[f].size() > 0) { return params.ranks[i]; }\
}\
return 0;";

/// Query dialect for the Elasticsearch query DSL.
#[derive(Debug, Clone)]
pub struct EsDialect {
    capabilities: BackendCapabilities,
}

impl EsDialect {
    /// Creates the dialect.
    pub fn new() -> Self {
        let mut capabilities = BackendCapabilities::full(BackendKind::Elasticsearch);
        capabilities.paths.forbidden_chars = vec!['.', SEGMENT_SEPARATOR];
        // Numbers are indexed as doubles, so integers beyond 2^53 may
        // collide; the residual re-checks every match.
        capabilities.strict_typing = false;
        Self { capabilities }
    }

    /// Renders the `sort` array for `order`, ending with the id tie-break.
    pub fn sort(&self, order: &[OrderBy]) -> Result<Vec<Value>, QueryError> {
        let mut sort = Vec::new();
        for clause in order {
            if !self.capabilities.paths.supports(&clause.path) {
                return Err(QueryError::CompilationUnsupported {
                    backend: BackendKind::Elasticsearch.to_string(),
                    message: format!("cannot order by '{}'", clause.path),
                });
            }
            let direction = match clause.direction {
                SortDirection::Ascending => "asc",
                SortDirection::Descending => "desc",
            };
            let ranked = [
                (ValueKind::Null, 1),
                (ValueKind::Bool, 2),
                (ValueKind::Number, 3),
                (ValueKind::String, 4),
                (ValueKind::Array, 5),
            ];
            let fields: Vec<String> = ranked.iter().map(|(k, _)| field(*k, &clause.path)).collect();
            let ranks: Vec<i32> = ranked.iter().map(|(_, r)| *r).collect();
            sort.push(json!({
                "_script": {
                    "type": "number",
                    "order": direction,
                    "script": {
                        "lang": "painless",
                        "source": RANK_SCRIPT,
                        "params": { "fields": fields, "ranks": ranks }
                    }
                }
            }));
            for (kind, unmapped) in [
                (ValueKind::Bool, "boolean"),
                (ValueKind::Number, "double"),
                (ValueKind::String, "keyword"),
            ] {
                sort.push(json!({
                    field(kind, &clause.path): { "order": direction, "unmapped_type": unmapped }
                }));
            }
        }
        sort.push(json!({ ID_FIELD: { "order": "asc" } }));
        Ok(sort)
    }
}

impl Default for EsDialect {
    fn default() -> Self {
        Self::new()
    }
}

fn unsupported(what: &str) -> QueryError {
    QueryError::CompilationUnsupported {
        backend: BackendKind::Elasticsearch.to_string(),
        message: format!("unsupported {}", what),
    }
}

fn equals(path: &AttributePath, value: &Value) -> Result<Value, QueryError> {
    match value {
        Value::Null => Ok(json!({ "exists": { "field": field(ValueKind::Null, path) } })),
        Value::Bool(_) | Value::Number(_) | Value::String(_) => {
            let kind = ValueKind::of(value).ok_or_else(|| unsupported("comparison value"))?;
            Ok(json!({ "term": { field(kind, path): value } }))
        }
        _ => Err(unsupported("comparison value")),
    }
}

/// Returns false for an integer no stored number can round onto without
/// being equal to it, i.e. one beyond 2^53 in magnitude.
fn exact_as_double(value: &Value) -> bool {
    const LIMIT: u64 = 1 << 53;
    match value {
        Value::Number(n) => match (n.as_i64(), n.as_u64()) {
            (Some(i), _) => i.unsigned_abs() < LIMIT,
            (None, Some(u)) => u < LIMIT,
            _ => true,
        },
        _ => true,
    }
}

impl QueryDialect for EsDialect {
    type Native = Value;

    fn capabilities(&self) -> &BackendCapabilities {
        &self.capabilities
    }

    fn match_all(&self) -> Value {
        json!({ "match_all": {} })
    }

    fn match_none(&self) -> Value {
        json!({ "match_none": {} })
    }

    fn comparison(&self, comparison: &Comparison) -> Result<Value, QueryError> {
        let path = comparison.path();
        let value = comparison.value();
        match comparison.operator() {
            Operator::Eq => equals(path, value),
            // A stored integer beyond 2^53 can round onto the bound, so
            // exclusion is only safe for bounds below that magnitude.
            Operator::Ne if !exact_as_double(value) => Ok(self.match_all()),
            Operator::Ne => Ok(json!({ "bool": { "must_not": [equals(path, value)?] } })),
            op @ (Operator::Lt | Operator::Le | Operator::Gt | Operator::Ge) => {
                let kind = match value {
                    Value::Number(_) => ValueKind::Number,
                    Value::String(_) => ValueKind::String,
                    _ => return Err(unsupported("ordering operand")),
                };
                let inclusive = !exact_as_double(value);
                let bound = match op {
                    Operator::Lt if !inclusive => "lt",
                    Operator::Lt | Operator::Le => "lte",
                    Operator::Gt if !inclusive => "gt",
                    _ => "gte",
                };
                Ok(json!({ "range": { field(kind, path): { bound: value } } }))
            }
            Operator::In => {
                let items = comparison.in_values();
                let Some(first) = items.first() else {
                    return Ok(self.match_none());
                };
                match ValueKind::of(first) {
                    Some(ValueKind::Null) => equals(path, first),
                    Some(kind @ (ValueKind::Bool | ValueKind::Number | ValueKind::String)) => {
                        Ok(json!({ "terms": { field(kind, path): items } }))
                    }
                    _ => Err(unsupported("IN list")),
                }
            }
            Operator::Like => {
                let pattern = value.as_str().ok_or_else(|| unsupported("LIKE pattern"))?;
                Ok(json!({
                    "wildcard": {
                        field(ValueKind::String, path): {
                            "value": like_to_wildcard(pattern),
                            "case_insensitive": false
                        }
                    }
                }))
            }
        }
    }

    fn and(&self, children: Vec<Value>) -> Value {
        json!({ "bool": { "filter": children } })
    }

    fn or(&self, children: Vec<Value>) -> Value {
        json!({ "bool": { "should": children, "minimum_should_match": 1 } })
    }
}
