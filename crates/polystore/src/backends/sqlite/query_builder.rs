//! SQL rendering of filters, orderings and JSON paths for SQLite.
//!
//! Attribute paths become JSON path literals (`$."team"."id"`) inlined into
//! the statement; comparison values are bound as `?` parameters in order.
//! Every comparison is guarded by `json_type` so that, like the evaluator,
//! values of another JSON type never match.

use rusqlite::types::Value as SqlValue;
use serde_json::Value;

use crate::core::BackendKind;
use crate::error::QueryError;
use crate::expr::{AttributePath, Comparison, Operator};
use crate::query::{BackendCapabilities, OrderBy, QueryDialect, SortDirection};

/// A SQL boolean expression with its positional parameters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SqlFragment {
    /// SQL text with `?` placeholders.
    pub sql: String,
    /// Parameter values, in placeholder order.
    pub params: Vec<SqlValue>,
}

impl SqlFragment {
    fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    fn with_params(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    fn join(children: Vec<SqlFragment>, keyword: &str) -> Self {
        let mut params = Vec::new();
        let parts: Vec<String> = children
            .into_iter()
            .map(|child| {
                params.extend(child.params);
                format!("({})", child.sql)
            })
            .collect();
        Self {
            sql: parts.join(&format!(" {} ", keyword)),
            params,
        }
    }
}

/// Query dialect for the SQLite JSON functions.
#[derive(Debug, Clone)]
pub struct SqliteDialect {
    capabilities: BackendCapabilities,
}

impl SqliteDialect {
    /// Creates the dialect.
    pub fn new() -> Self {
        let mut capabilities = BackendCapabilities::full(BackendKind::Sqlite);
        // Quoted JSON path labels have no escape for the quote itself.
        capabilities.paths.forbidden_chars = vec!['"'];
        Self { capabilities }
    }

    /// Renders an `ORDER BY` list (without the keyword), ending with the id
    /// tie-break.
    pub fn order_by(&self, order: &[OrderBy]) -> Result<String, QueryError> {
        let mut clauses = Vec::with_capacity(order.len() * 2 + 1);
        for clause in order {
            if !self.capabilities.paths.supports(&clause.path) {
                return Err(QueryError::CompilationUnsupported {
                    backend: BackendKind::Sqlite.to_string(),
                    message: format!("cannot order by '{}'", clause.path),
                });
            }
            let path = path_literal(&clause.path);
            let direction = match clause.direction {
                SortDirection::Ascending => "ASC",
                SortDirection::Descending => "DESC",
            };
            clauses.push(format!(
                "CASE WHEN json_type(data, {p}) IS NULL THEN 0 \
                 WHEN json_type(data, {p}) = 'null' THEN 1 \
                 WHEN json_type(data, {p}) IN ('true', 'false') THEN 2 \
                 WHEN json_type(data, {p}) IN ('integer', 'real') THEN 3 \
                 WHEN json_type(data, {p}) = 'text' THEN 4 \
                 WHEN json_type(data, {p}) = 'array' THEN 5 ELSE 6 END {d}",
                p = path,
                d = direction
            ));
            clauses.push(format!("json_extract(data, {}) {}", path, direction));
        }
        clauses.push("id ASC".to_string());
        Ok(clauses.join(", "))
    }
}

impl Default for SqliteDialect {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryDialect for SqliteDialect {
    type Native = SqlFragment;

    fn capabilities(&self) -> &BackendCapabilities {
        &self.capabilities
    }

    fn match_all(&self) -> SqlFragment {
        SqlFragment::new("1")
    }

    fn match_none(&self) -> SqlFragment {
        SqlFragment::new("0")
    }

    fn comparison(&self, comparison: &Comparison) -> Result<SqlFragment, QueryError> {
        let path = path_literal(comparison.path());
        let value = comparison.value();
        match comparison.operator() {
            Operator::Eq => equals(&path, value),
            Operator::Ne => {
                let eq = equals(&path, value)?;
                Ok(SqlFragment::with_params(
                    format!("NOT IFNULL(({}), 0)", eq.sql),
                    eq.params,
                ))
            }
            op @ (Operator::Lt | Operator::Le | Operator::Gt | Operator::Ge) => {
                ordering(&path, op, value)
            }
            Operator::In => in_list(&path, comparison.in_values()),
            Operator::Like => {
                let pattern = value.as_str().ok_or_else(|| unsupported("LIKE pattern"))?;
                Ok(SqlFragment::with_params(
                    format!(
                        "json_type(data, {p}) = 'text' AND json_extract(data, {p}) GLOB ?",
                        p = path
                    ),
                    vec![SqlValue::Text(like_to_glob(pattern))],
                ))
            }
        }
    }

    fn and(&self, children: Vec<SqlFragment>) -> SqlFragment {
        SqlFragment::join(children, "AND")
    }

    fn or(&self, children: Vec<SqlFragment>) -> SqlFragment {
        SqlFragment::join(children, "OR")
    }
}

fn unsupported(what: &str) -> QueryError {
    QueryError::CompilationUnsupported {
        backend: BackendKind::Sqlite.to_string(),
        message: format!("unsupported {}", what),
    }
}

/// JSON path text for a sequence of object keys: `$."a"."b"`.
pub(crate) fn json_path<S: AsRef<str>>(segments: &[S]) -> String {
    let mut path = String::from("$");
    for segment in segments {
        path.push_str(".\"");
        path.push_str(segment.as_ref());
        path.push('"');
    }
    path
}

/// The JSON path of an attribute path as a SQL string literal.
fn path_literal(path: &AttributePath) -> String {
    sql_literal(&json_path(path.segments()))
}

pub(crate) fn sql_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Binds a JSON scalar.
pub(crate) fn sql_value(value: &Value) -> Option<SqlValue> {
    match value {
        Value::Null => Some(SqlValue::Null),
        Value::Bool(b) => Some(SqlValue::Integer(i64::from(*b))),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(SqlValue::Integer(i)),
            None => n.as_f64().map(SqlValue::Real),
        },
        Value::String(s) => Some(SqlValue::Text(s.clone())),
        Value::Array(_) | Value::Object(_) => None,
    }
}

/// The `json_type` test a stored value must pass to equal `value`.
fn type_guard(value: &Value) -> Option<&'static str> {
    match value {
        Value::Null => Some("= 'null'"),
        Value::Bool(true) => Some("= 'true'"),
        Value::Bool(false) => Some("= 'false'"),
        Value::Number(_) => Some("IN ('integer', 'real')"),
        Value::String(_) => Some("= 'text'"),
        Value::Array(_) | Value::Object(_) => None,
    }
}

fn equals(path: &str, value: &Value) -> Result<SqlFragment, QueryError> {
    let guard = type_guard(value).ok_or_else(|| unsupported("comparison value"))?;
    match value {
        Value::Null | Value::Bool(_) => Ok(SqlFragment::new(format!(
            "json_type(data, {}) {}",
            path, guard
        ))),
        _ => {
            let bound = sql_value(value).ok_or_else(|| unsupported("comparison value"))?;
            Ok(SqlFragment::with_params(
                format!(
                    "json_type(data, {p}) {g} AND json_extract(data, {p}) = ?",
                    p = path,
                    g = guard
                ),
                vec![bound],
            ))
        }
    }
}

fn ordering(path: &str, op: Operator, value: &Value) -> Result<SqlFragment, QueryError> {
    match value {
        Value::Number(_) => {
            // SQLite orders INTEGER against REAL by exact value; only a
            // fractional bound is bound as REAL.
            let bound = sql_value(value).ok_or_else(|| unsupported("number"))?;
            Ok(SqlFragment::with_params(
                format!(
                    "json_type(data, {p}) IN ('integer', 'real') \
                     AND json_extract(data, {p}) {op} ?",
                    p = path,
                    op = op.symbol()
                ),
                vec![bound],
            ))
        }
        Value::String(s) => Ok(SqlFragment::with_params(
            format!(
                "json_type(data, {p}) = 'text' AND json_extract(data, {p}) {op} ?",
                p = path,
                op = op.symbol()
            ),
            vec![SqlValue::Text(s.clone())],
        )),
        _ => Err(unsupported("ordering operand")),
    }
}

fn in_list(path: &str, values: &[Value]) -> Result<SqlFragment, QueryError> {
    let Some(first) = values.first() else {
        return Ok(SqlFragment::new("0"));
    };
    match first {
        Value::Null => Ok(SqlFragment::new(format!("json_type(data, {}) = 'null'", path))),
        Value::Bool(_) => {
            let types: Vec<&str> = values
                .iter()
                .filter_map(Value::as_bool)
                .map(|b| if b { "'true'" } else { "'false'" })
                .collect();
            Ok(SqlFragment::new(format!(
                "json_type(data, {}) IN ({})",
                path,
                types.join(", ")
            )))
        }
        _ => {
            let guard = type_guard(first).ok_or_else(|| unsupported("IN value"))?;
            let params = values
                .iter()
                .map(|v| sql_value(v).ok_or_else(|| unsupported("IN value")))
                .collect::<Result<Vec<_>, _>>()?;
            let placeholders = vec!["?"; params.len()].join(", ");
            Ok(SqlFragment::with_params(
                format!(
                    "json_type(data, {p}) {g} AND json_extract(data, {p}) IN ({ph})",
                    p = path,
                    g = guard,
                    ph = placeholders
                ),
                params,
            ))
        }
    }
}

/// Converts a `LIKE` pattern to a case-sensitive `GLOB` pattern.
fn like_to_glob(pattern: &str) -> String {
    let mut glob = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        match c {
            '%' => glob.push('*'),
            '_' => glob.push('?'),
            '*' => glob.push_str("[*]"),
            '?' => glob.push_str("[?]"),
            '[' => glob.push_str("[[]"),
            other => glob.push(other),
        }
    }
    glob
}
