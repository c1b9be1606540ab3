//! Expression tree types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::QueryError;

/// Keywords of the query grammar. Path segments spelled like one of these
/// are quoted in canonical output.
pub(crate) const KEYWORDS: &[&str] = &["and", "or", "in", "like", "true", "false", "null"];

/// An ordered, non-empty sequence of field names addressing a (possibly
/// nested) attribute of a JSON object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct AttributePath(Vec<String>);

impl AttributePath {
    /// Creates a path from its segments.
    ///
    /// Fails when the path is empty or any segment is empty.
    pub fn new<I, S>(segments: I) -> Result<Self, QueryError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(QueryError::InvalidExpression {
                message: "attribute path must not be empty".to_string(),
            });
        }
        if segments.iter().any(String::is_empty) {
            return Err(QueryError::InvalidExpression {
                message: "attribute path segments must not be empty".to_string(),
            });
        }
        Ok(Self(segments))
    }

    /// Creates a path from dot-separated notation (`team.id`).
    pub fn dotted(path: &str) -> Result<Self, QueryError> {
        Self::new(path.split('.'))
    }

    /// Returns the path segments.
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Returns true if the path addresses a top-level attribute.
    pub fn is_top_level(&self) -> bool {
        self.0.len() == 1
    }

    /// Returns the first segment.
    pub fn root(&self) -> &str {
        &self.0[0]
    }

    /// Returns the segments joined with dots.
    pub fn to_dotted(&self) -> String {
        self.0.join(".")
    }

    /// Resolves the path against a JSON value, walking objects only.
    pub fn resolve<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        self.0
            .iter()
            .try_fold(value, |current, segment| current.as_object()?.get(segment))
    }
}

impl TryFrom<Vec<String>> for AttributePath {
    type Error = QueryError;

    fn try_from(segments: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(segments)
    }
}

impl From<AttributePath> for Vec<String> {
    fn from(path: AttributePath) -> Self {
        path.0
    }
}

impl FromStr for AttributePath {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::dotted(s)
    }
}

impl fmt::Display for AttributePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            if is_plain_identifier(segment) {
                f.write_str(segment)?;
            } else {
                write!(f, "`{}`", segment.replace('`', "``"))?;
            }
        }
        Ok(())
    }
}

fn is_plain_identifier(segment: &str) -> bool {
    let mut chars = segment.chars();
    let starts_well = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    starts_well
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !KEYWORDS.contains(&segment.to_ascii_lowercase().as_str())
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    /// `=`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `IN`
    In,
    /// `LIKE`
    Like,
}

impl Operator {
    /// All operators, in canonical order.
    pub const ALL: [Operator; 8] = [
        Operator::Eq,
        Operator::Ne,
        Operator::Lt,
        Operator::Le,
        Operator::Gt,
        Operator::Ge,
        Operator::In,
        Operator::Like,
    ];

    /// Returns the canonical symbol of the operator.
    pub fn symbol(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::In => "IN",
            Operator::Like => "LIKE",
        }
    }

    /// Returns true for `<`, `<=`, `>` and `>=`.
    pub fn is_ordering(&self) -> bool {
        matches!(
            self,
            Operator::Lt | Operator::Le | Operator::Gt | Operator::Ge
        )
    }

    /// Returns true for operators that need a range or inequality scan
    /// rather than an equality lookup.
    pub fn is_inequality(&self) -> bool {
        self.is_ordering() || matches!(self, Operator::Ne | Operator::Like)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// A leaf predicate: `path op value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawComparison", into = "RawComparison")]
pub struct Comparison {
    operator: Operator,
    path: AttributePath,
    value: Value,
}

impl Comparison {
    /// Creates a comparison, validating the value against the operator.
    ///
    /// `IN` requires a list of scalars that share one JSON type; `LIKE`
    /// requires a string pattern; every other operator requires a scalar.
    pub fn new(operator: Operator, path: AttributePath, value: Value) -> Result<Self, QueryError> {
        match operator {
            Operator::In => {
                let Value::Array(items) = &value else {
                    return Err(invalid(format!("IN on '{}' requires a list value", path)));
                };
                if let Some(item) = items.iter().find(|item| !is_scalar(item)) {
                    return Err(invalid(format!("IN list item {} is not a scalar", item)));
                }
                if let Some(first) = items.first() {
                    let kind = scalar_kind(first);
                    if items.iter().any(|item| scalar_kind(item) != kind) {
                        return Err(invalid(format!(
                            "IN list on '{}' mixes value types",
                            path
                        )));
                    }
                }
            }
            Operator::Like => {
                if !value.is_string() {
                    return Err(invalid(format!(
                        "LIKE on '{}' requires a string pattern",
                        path
                    )));
                }
            }
            _ => {
                if !is_scalar(&value) {
                    return Err(invalid(format!(
                        "{} on '{}' requires a scalar value",
                        operator, path
                    )));
                }
            }
        }
        Ok(Self {
            operator,
            path,
            value,
        })
    }

    /// Returns the operator.
    pub fn operator(&self) -> Operator {
        self.operator
    }

    /// Returns the attribute path.
    pub fn path(&self) -> &AttributePath {
        &self.path
    }

    /// Returns the comparison value.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Returns the list items of an `IN` comparison (empty otherwise).
    pub fn in_values(&self) -> &[Value] {
        match (&self.operator, &self.value) {
            (Operator::In, Value::Array(items)) => items,
            _ => &[],
        }
    }

    /// Returns true if no object can ever satisfy this comparison.
    ///
    /// Ordering only applies to numbers and strings, so `< true` or
    /// `>= null` never match; neither does an empty `IN` list.
    pub fn is_unsatisfiable(&self) -> bool {
        match self.operator {
            Operator::In => self.in_values().is_empty(),
            op if op.is_ordering() => !(self.value.is_number() || self.value.is_string()),
            _ => false,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RawComparison {
    operator: Operator,
    path: AttributePath,
    value: Value,
}

impl TryFrom<RawComparison> for Comparison {
    type Error = QueryError;

    fn try_from(raw: RawComparison) -> Result<Self, Self::Error> {
        Comparison::new(raw.operator, raw.path, raw.value)
    }
}

impl From<Comparison> for RawComparison {
    fn from(c: Comparison) -> Self {
        RawComparison {
            operator: c.operator,
            path: c.path,
            value: c.value,
        }
    }
}

fn invalid(message: String) -> QueryError {
    QueryError::InvalidExpression { message }
}

fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Object(_))
}

fn scalar_kind(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// A boolean predicate over an object's attributes.
///
/// `And(vec![])` is the always-true expression and `Or(vec![])` the
/// always-false one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Expression {
    /// A leaf comparison.
    Comparison(Comparison),
    /// Conjunction of the children.
    And(Vec<Expression>),
    /// Disjunction of the children.
    Or(Vec<Expression>),
}

impl Expression {
    /// The always-true expression (`AND()`).
    pub const fn always_true() -> Self {
        Expression::And(Vec::new())
    }

    /// The always-false expression (`OR()`).
    pub const fn always_false() -> Self {
        Expression::Or(Vec::new())
    }

    /// Returns true for `AND()`.
    pub fn is_always_true(&self) -> bool {
        matches!(self, Expression::And(children) if children.is_empty())
    }

    /// Returns true for `OR()`.
    pub fn is_always_false(&self) -> bool {
        matches!(self, Expression::Or(children) if children.is_empty())
    }

    /// Builds a comparison from a dotted path.
    pub fn compare(
        path: &str,
        operator: Operator,
        value: impl Into<Value>,
    ) -> Result<Self, QueryError> {
        let path = AttributePath::dotted(path)?;
        Ok(Expression::Comparison(Comparison::new(
            operator,
            path,
            value.into(),
        )?))
    }

    /// `path = value`
    pub fn eq(path: &str, value: impl Into<Value>) -> Result<Self, QueryError> {
        Self::compare(path, Operator::Eq, value)
    }

    /// `path != value`
    pub fn ne(path: &str, value: impl Into<Value>) -> Result<Self, QueryError> {
        Self::compare(path, Operator::Ne, value)
    }

    /// `path IN [values]`
    pub fn in_list<V: Into<Value>>(
        path: &str,
        values: impl IntoIterator<Item = V>,
    ) -> Result<Self, QueryError> {
        let list: Vec<Value> = values.into_iter().map(Into::into).collect();
        Self::compare(path, Operator::In, Value::Array(list))
    }

    /// Conjunction of the given expressions.
    pub fn and(children: impl IntoIterator<Item = Expression>) -> Self {
        Expression::And(children.into_iter().collect())
    }

    /// Disjunction of the given expressions.
    pub fn or(children: impl IntoIterator<Item = Expression>) -> Self {
        Expression::Or(children.into_iter().collect())
    }

    /// Evaluates the expression against an object.
    pub fn evaluate(&self, object: &Value) -> bool {
        super::eval::evaluate(self, object)
    }

    /// Deterministic textual form, accepted back by [`super::parse`].
    pub fn to_canonical_string(&self) -> String {
        self.to_string()
    }

    /// Visits every comparison in the tree.
    pub fn comparisons(&self) -> Vec<&Comparison> {
        let mut out = Vec::new();
        self.collect_comparisons(&mut out);
        out
    }

    fn collect_comparisons<'a>(&'a self, out: &mut Vec<&'a Comparison>) {
        match self {
            Expression::Comparison(c) => out.push(c),
            Expression::And(children) | Expression::Or(children) => {
                for child in children {
                    child.collect_comparisons(out);
                }
            }
        }
    }

    fn fmt_child(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::And(children) | Expression::Or(children) if children.len() > 1 => {
                write!(f, "({})", self)
            }
            _ => write!(f, "{}", self),
        }
    }
}

impl From<Comparison> for Expression {
    fn from(c: Comparison) -> Self {
        Expression::Comparison(c)
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ", self.path, self.operator)?;
        write_literal(f, &self.value)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (children, keyword, identity) = match self {
            Expression::Comparison(c) => return write!(f, "{}", c),
            Expression::And(children) => (children, " AND ", "TRUE"),
            Expression::Or(children) => (children, " OR ", "FALSE"),
        };
        if children.is_empty() {
            return f.write_str(identity);
        }
        for (i, child) in children.iter().enumerate() {
            if i > 0 {
                f.write_str(keyword)?;
            }
            child.fmt_child(f)?;
        }
        Ok(())
    }
}

fn write_literal(f: &mut fmt::Formatter<'_>, value: &Value) -> fmt::Result {
    match value {
        Value::Null => f.write_str("null"),
        Value::Bool(b) => write!(f, "{}", b),
        Value::Number(n) => write!(f, "{}", n),
        Value::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
        Value::Array(items) => {
            f.write_str("[")?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write_literal(f, item)?;
            }
            f.write_str("]")
        }
        // Rejected at construction.
        Value::Object(_) => write!(f, "{}", value),
    }
}
