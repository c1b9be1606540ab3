//! SQL rendering of filters and orderings over a JSONB column.
//!
//! Nothing user-supplied is spliced into statement text: attribute paths
//! are bound as `text[]` parameters for `#>`/`#>>`, and values as `jsonb`,
//! `text` or numeric text. Fragments use `$#` for "next parameter"; the
//! final statement is numbered with [`number_placeholders`].

use serde_json::Value;
use tokio_postgres::types::ToSql;

use crate::core::BackendKind;
use crate::error::QueryError;
use crate::expr::{AttributePath, Comparison, Operator};
use crate::query::{BackendCapabilities, OrderBy, QueryDialect, SortDirection};

/// Marker for the next positional parameter in a fragment.
pub(crate) const NEXT: &str = "$#";

/// A bound statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum PgParam {
    /// `text`
    Text(String),
    /// `text[]`, used for JSON paths.
    TextArray(Vec<String>),
    /// `bigint`
    BigInt(i64),
    /// `jsonb`
    Json(Value),
    /// `jsonb[]`
    JsonArray(Vec<Value>),
}

impl PgParam {
    /// Boxes the value for the driver.
    pub(crate) fn to_boxed(&self) -> Box<dyn ToSql + Sync + Send> {
        match self.clone() {
            PgParam::Text(v) => Box::new(v),
            PgParam::TextArray(v) => Box::new(v),
            PgParam::BigInt(v) => Box::new(v),
            PgParam::Json(v) => Box::new(v),
            PgParam::JsonArray(v) => Box::new(v),
        }
    }
}

/// A SQL boolean expression with its parameters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PgFragment {
    /// SQL text with `$#` placeholders.
    pub sql: String,
    /// Parameter values, in placeholder order.
    pub params: Vec<PgParam>,
}

impl PgFragment {
    fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    fn join(children: Vec<PgFragment>, keyword: &str) -> Self {
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

/// Replaces each `$#` with `$1`, `$2`, ... in order.
pub(crate) fn number_placeholders(sql: &str) -> String {
    let mut numbered = String::with_capacity(sql.len() + 8);
    let mut rest = sql;
    let mut n = 0;
    while let Some(pos) = rest.find(NEXT) {
        n += 1;
        numbered.push_str(&rest[..pos]);
        numbered.push('$');
        numbered.push_str(&n.to_string());
        rest = &rest[pos + NEXT.len()..];
    }
    numbered.push_str(rest);
    numbered
}

/// Query dialect for PostgreSQL JSONB operators.
#[derive(Debug, Clone)]
pub struct PostgresDialect {
    capabilities: BackendCapabilities,
}

impl PostgresDialect {
    /// Creates the dialect.
    pub fn new() -> Self {
        let mut capabilities = BackendCapabilities::full(BackendKind::Postgres);
        // `#>` would step into arrays on integer segments.
        capabilities.paths.integer_segments = false;
        Self { capabilities }
    }

    /// Renders an `ORDER BY` list (without the keyword), ending with the id
    /// tie-break.
    pub fn order_by(&self, order: &[OrderBy]) -> Result<PgFragment, QueryError> {
        let mut clauses = Vec::new();
        let mut params = Vec::new();
        for clause in order {
            if !self.capabilities.paths.supports(&clause.path) {
                return Err(QueryError::CompilationUnsupported {
                    backend: BackendKind::Postgres.to_string(),
                    message: format!("cannot order by '{}'", clause.path),
                });
            }
            let direction = match clause.direction {
                SortDirection::Ascending => "ASC",
                SortDirection::Descending => "DESC",
            };
            let value = "(data #> $#::text[])";
            clauses.push(format!(
                "CASE jsonb_typeof{v} WHEN 'null' THEN 1 WHEN 'boolean' THEN 2 \
                 WHEN 'number' THEN 3 WHEN 'string' THEN 4 WHEN 'array' THEN 5 \
                 WHEN 'object' THEN 6 ELSE 0 END {d}",
                v = value,
                d = direction
            ));
            clauses.push(format!(
                "CASE WHEN jsonb_typeof{v} = 'number' THEN {v}::numeric END {d}",
                v = value,
                d = direction
            ));
            clauses.push(format!(
                "CASE WHEN jsonb_typeof{v} = 'string' THEN (data #>> $#::text[]) END COLLATE \"C\" {d}",
                v = value,
                d = direction
            ));
            clauses.push(format!("{} {}", value, direction));
            // One path parameter per `$#` above.
            for _ in 0..6 {
                params.push(path_param(&clause.path));
            }
        }
        clauses.push("id COLLATE \"C\" ASC".to_string());
        Ok(PgFragment {
            sql: clauses.join(", "),
            params,
        })
    }
}

impl Default for PostgresDialect {
    fn default() -> Self {
        Self::new()
    }
}

fn path_param(path: &AttributePath) -> PgParam {
    PgParam::TextArray(path.segments().to_vec())
}

fn unsupported(what: &str) -> QueryError {
    QueryError::CompilationUnsupported {
        backend: BackendKind::Postgres.to_string(),
        message: format!("unsupported {}", what),
    }
}

impl QueryDialect for PostgresDialect {
    type Native = PgFragment;

    fn capabilities(&self) -> &BackendCapabilities {
        &self.capabilities
    }

    fn match_all(&self) -> PgFragment {
        PgFragment::new("TRUE")
    }

    fn match_none(&self) -> PgFragment {
        PgFragment::new("FALSE")
    }

    fn comparison(&self, comparison: &Comparison) -> Result<PgFragment, QueryError> {
        let path = path_param(comparison.path());
        let value = comparison.value();
        match comparison.operator() {
            // jsonb equality is type-strict and numeric for numbers.
            Operator::Eq => Ok(PgFragment {
                sql: "(data #> $#::text[]) = $#::jsonb".to_string(),
                params: vec![path, PgParam::Json(value.clone())],
            }),
            Operator::Ne => Ok(PgFragment {
                sql: "(data #> $#::text[]) IS DISTINCT FROM $#::jsonb".to_string(),
                params: vec![path, PgParam::Json(value.clone())],
            }),
            op @ (Operator::Lt | Operator::Le | Operator::Gt | Operator::Ge) => match value {
                Value::Number(n) => Ok(PgFragment {
                    sql: format!(
                        "jsonb_typeof(data #> $#::text[]) = 'number' \
                         AND (data #> $#::text[])::numeric {} $#::text::numeric",
                        op.symbol()
                    ),
                    params: vec![path.clone(), path, PgParam::Text(n.to_string())],
                }),
                Value::String(s) => Ok(PgFragment {
                    sql: format!(
                        "jsonb_typeof(data #> $#::text[]) = 'string' \
                         AND (data #>> $#::text[]) COLLATE \"C\" {} $#::text",
                        op.symbol()
                    ),
                    params: vec![path.clone(), path, PgParam::Text(s.clone())],
                }),
                _ => Err(unsupported("ordering operand")),
            },
            Operator::In => {
                let items = comparison.in_values();
                if items.is_empty() {
                    return Ok(self.match_none());
                }
                Ok(PgFragment {
                    sql: "(data #> $#::text[]) = ANY($#::jsonb[])".to_string(),
                    params: vec![path, PgParam::JsonArray(items.to_vec())],
                })
            }
            Operator::Like => {
                let pattern = value.as_str().ok_or_else(|| unsupported("LIKE pattern"))?;
                Ok(PgFragment {
                    sql: "jsonb_typeof(data #> $#::text[]) = 'string' \
                          AND (data #>> $#::text[]) LIKE $#::text ESCAPE ''"
                        .to_string(),
                    params: vec![path.clone(), path, PgParam::Text(pattern.to_string())],
                })
            }
        }
    }

    fn and(&self, children: Vec<PgFragment>) -> PgFragment {
        PgFragment::join(children, "AND")
    }

    fn or(&self, children: Vec<PgFragment>) -> PgFragment {
        PgFragment::join(children, "OR")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parse;
    use crate::query::compile;
    use serde_json::json;

    fn render(filter: &str) -> PgFragment {
        let compiled = compile(&PostgresDialect::new(), &parse(filter).unwrap()).unwrap();
        assert!(!compiled.residual_applied());
        compiled.native
    }

    fn placeholders(sql: &str) -> usize {
        sql.matches(NEXT).count()
    }

    #[test]
    fn test_number_placeholders() {
        assert_eq!(
            number_placeholders("a = $#::jsonb AND b = ANY($#::jsonb[])"),
            "a = $1::jsonb AND b = ANY($2::jsonb[])"
        );
        assert_eq!(number_placeholders("TRUE"), "TRUE");
    }

    #[test]
    fn test_equality_binds_path_and_value() {
        let fragment = render("team.id = 3");
        assert_eq!(fragment.sql, "(data #> $#::text[]) = $#::jsonb");
        assert_eq!(
            fragment.params,
            vec![
                PgParam::TextArray(vec!["team".to_string(), "id".to_string()]),
                PgParam::Json(json!(3))
            ]
        );
    }

    #[test]
    fn test_every_fragment_binds_each_placeholder() {
        for filter in [
            "a != 'x'",
            "a < 5",
            "a >= 'm'",
            "a IN [1, 2]",
            "a LIKE 'x%'",
            "a = 1 AND (b = 2 OR c LIKE '_')",
        ] {
            let fragment = render(filter);
            assert_eq!(placeholders(&fragment.sql), fragment.params.len(), "{}", filter);
        }
    }

    #[test]
    fn test_integer_segments_stay_residual() {
        let compiled = compile(&PostgresDialect::new(), &parse("items.0 = 1").unwrap()).unwrap();
        assert!(compiled.residual_applied());
        assert_eq!(compiled.native.sql, "TRUE");
    }

    #[test]
    fn test_order_by_binds_paths() {
        let order = PostgresDialect::new()
            .order_by(&[OrderBy::parse("-age").unwrap(), OrderBy::parse("name").unwrap()])
            .unwrap();
        assert_eq!(placeholders(&order.sql), order.params.len());
        assert!(order.sql.ends_with("id COLLATE \"C\" ASC"));
    }
}
