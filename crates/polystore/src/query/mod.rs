//! Queries, capability tables and per-backend compilation.
//!
//! A [`Query`] couples a filter [`Expression`] with ordering and
//! pagination. Stores compile the filter with [`compile`]: the generic
//! [`planner`] splits it according to the backend's [`BackendCapabilities`]
//! and the backend's [`QueryDialect`] renders the native part.

pub mod capabilities;
pub mod dialect;
pub mod planner;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::StoredObject;
use crate::error::QueryError;
use crate::expr::{AttributePath, Expression};

pub use capabilities::{
    BackendCapabilities, ConjunctionSupport, InListSupport, IndexDefinition, PathSupport,
};
pub use dialect::{compile, CompiledQuery, EvaluatorDialect, QueryDialect};
pub use planner::{plan, QueryPlan};

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    /// Ascending order.
    #[default]
    Ascending,
    /// Descending order.
    Descending,
}

/// One ordering clause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    /// Attribute to order by.
    pub path: AttributePath,
    /// Sort direction.
    #[serde(default)]
    pub direction: SortDirection,
}

impl OrderBy {
    /// Ascending order on a path.
    pub fn asc(path: AttributePath) -> Self {
        Self {
            path,
            direction: SortDirection::Ascending,
        }
    }

    /// Descending order on a path.
    pub fn desc(path: AttributePath) -> Self {
        Self {
            path,
            direction: SortDirection::Descending,
        }
    }

    /// Parses `field`, `team.id` or `-field` (descending).
    pub fn parse(s: &str) -> Result<Self, QueryError> {
        match s.strip_prefix('-') {
            Some(rest) => Ok(Self::desc(AttributePath::dotted(rest)?)),
            None => Ok(Self::asc(AttributePath::dotted(s)?)),
        }
    }
}

impl fmt::Display for OrderBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction {
            SortDirection::Ascending => write!(f, "{}", self.path),
            SortDirection::Descending => write!(f, "-{}", self.path),
        }
    }
}

/// A filtered, ordered, paginated query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Filter expression.
    pub filter: Expression,
    /// Ordering; the object id is always the final tie-break.
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
    /// Page size; the store's default when absent.
    #[serde(default)]
    pub limit: Option<u32>,
    /// Token from a previous page.
    #[serde(default)]
    pub continuation_token: Option<String>,
}

impl Query {
    /// A query with the given filter and no ordering.
    pub fn new(filter: Expression) -> Self {
        Self {
            filter,
            order_by: Vec::new(),
            limit: None,
            continuation_token: None,
        }
    }

    /// A query matching everything.
    pub fn all() -> Self {
        Self::new(Expression::always_true())
    }

    /// Parses the filter from its textual form.
    pub fn parse(filter: &str) -> Result<Self, QueryError> {
        Ok(Self::new(crate::expr::parse(filter)?))
    }

    /// Adds an ordering clause.
    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    /// Sets the page size.
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Continues from a previous page.
    pub fn with_continuation(mut self, token: impl Into<String>) -> Self {
        self.continuation_token = Some(token.into());
        self
    }
}

/// One page of results.
#[derive(Debug, Clone)]
pub struct FindResult {
    /// Matching objects, in query order.
    pub results: Vec<StoredObject>,
    /// Token for the next page, if more rows may exist.
    pub continuation_token: Option<String>,
    /// Whether an in-memory residual filter was applied.
    pub residual_applied: bool,
}

/// Position of the next page in the backend's native result order.
///
/// Opaque to callers; encoded as the decimal offset of the next unscanned
/// native row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContinuationToken {
    offset: u64,
}

impl ContinuationToken {
    /// Creates a token for the given native offset.
    pub fn new(offset: u64) -> Self {
        Self { offset }
    }

    /// Returns the native offset.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Encodes the token.
    pub fn encode(&self) -> String {
        self.offset.to_string()
    }

    /// Decodes a token produced by [`ContinuationToken::encode`].
    pub fn decode(token: &str) -> Result<Self, QueryError> {
        token
            .parse::<u64>()
            .map(Self::new)
            .map_err(|_| QueryError::InvalidContinuationToken {
                token: token.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_by_parse() {
        let order = OrderBy::parse("-team.id").unwrap();
        assert_eq!(order.direction, SortDirection::Descending);
        assert_eq!(order.path.segments(), ["team", "id"]);
        assert_eq!(order.to_string(), "-team.id");
        assert!(OrderBy::parse("-").is_err());
    }

    #[test]
    fn test_continuation_token() {
        let token = ContinuationToken::new(42);
        assert_eq!(ContinuationToken::decode(&token.encode()).unwrap(), token);
        assert!(matches!(
            ContinuationToken::decode("abc"),
            Err(QueryError::InvalidContinuationToken { .. })
        ));
    }

    #[test]
    fn test_query_builder() {
        let query = Query::parse("role = 4")
            .unwrap()
            .order_by(OrderBy::parse("name").unwrap())
            .with_limit(10)
            .with_continuation("20");
        assert_eq!(query.limit, Some(10));
        assert_eq!(query.order_by.len(), 1);
        assert_eq!(query.continuation_token.as_deref(), Some("20"));
    }
}
