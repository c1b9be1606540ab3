//! Rendering planned expressions into backend-native filters.

use tracing::debug;

use crate::error::QueryError;
use crate::expr::{Comparison, Expression};

use super::capabilities::BackendCapabilities;
use super::planner::plan;

/// Renders the native part of a plan into a backend's filter representation.
///
/// Implementations only see expressions the planner has already checked
/// against [`QueryDialect::capabilities`]; `comparison` may still refuse a
/// value it cannot encode, which surfaces as an error rather than a dropped
/// predicate.
pub trait QueryDialect {
    /// The backend-native filter type.
    type Native;

    /// The capability table the planner uses for this backend.
    fn capabilities(&self) -> &BackendCapabilities;

    /// A filter matching every object.
    fn match_all(&self) -> Self::Native;

    /// A filter matching no object.
    fn match_none(&self) -> Self::Native;

    /// Renders one comparison.
    fn comparison(&self, comparison: &Comparison) -> Result<Self::Native, QueryError>;

    /// Conjunction of rendered children (at least two).
    fn and(&self, children: Vec<Self::Native>) -> Self::Native;

    /// Disjunction of rendered children (at least two).
    fn or(&self, children: Vec<Self::Native>) -> Self::Native;

    /// Renders a whole native expression.
    fn render(&self, expression: &Expression) -> Result<Self::Native, QueryError> {
        match expression {
            Expression::Comparison(c) => self.comparison(c),
            Expression::And(children) if children.is_empty() => Ok(self.match_all()),
            Expression::Or(children) if children.is_empty() => Ok(self.match_none()),
            Expression::And(children) | Expression::Or(children) if children.len() == 1 => {
                self.render(&children[0])
            }
            Expression::And(children) => {
                let rendered = children
                    .iter()
                    .map(|child| self.render(child))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(self.and(rendered))
            }
            Expression::Or(children) => {
                let rendered = children
                    .iter()
                    .map(|child| self.render(child))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(self.or(rendered))
            }
        }
    }
}

/// A filter compiled for one backend.
#[derive(Debug, Clone)]
pub struct CompiledQuery<N> {
    /// Backend-native filter.
    pub native: N,
    /// Expression to re-check in memory; TRUE when `native` is exact.
    pub residual: Expression,
}

impl<N> CompiledQuery<N> {
    /// Returns true if rows must be re-checked against the residual.
    pub fn residual_applied(&self) -> bool {
        !self.residual.is_always_true()
    }

    /// Returns true if an object returned by the native filter is a match.
    pub fn accepts(&self, object: &serde_json::Value) -> bool {
        self.residual.evaluate(object)
    }
}

/// Plans `filter` against the dialect's capabilities and renders the native
/// part.
pub fn compile<D>(dialect: &D, filter: &Expression) -> Result<CompiledQuery<D::Native>, QueryError>
where
    D: QueryDialect + ?Sized,
{
    let plan = plan(filter, dialect.capabilities());
    debug!(
        backend = %dialect.capabilities().backend,
        filter = %filter,
        native = %plan.native,
        residual = %plan.residual,
        "Compiled query"
    );
    Ok(CompiledQuery {
        native: dialect.render(&plan.native)?,
        residual: plan.residual,
    })
}

/// Dialect for backends that evaluate the native part in process.
///
/// The rendered filter is the planned expression itself; the planner still
/// applies the capability table, so a restricted profile yields the same
/// native/residual split a real backend with that profile would.
#[derive(Debug, Clone, Copy)]
pub struct EvaluatorDialect<'a> {
    capabilities: &'a BackendCapabilities,
}

impl<'a> EvaluatorDialect<'a> {
    /// Creates a dialect over a capability table.
    pub fn new(capabilities: &'a BackendCapabilities) -> Self {
        Self { capabilities }
    }
}

impl QueryDialect for EvaluatorDialect<'_> {
    type Native = Expression;

    fn capabilities(&self) -> &BackendCapabilities {
        self.capabilities
    }

    fn match_all(&self) -> Expression {
        Expression::always_true()
    }

    fn match_none(&self) -> Expression {
        Expression::always_false()
    }

    fn comparison(&self, comparison: &Comparison) -> Result<Expression, QueryError> {
        Ok(Expression::Comparison(comparison.clone()))
    }

    fn and(&self, children: Vec<Expression>) -> Expression {
        Expression::And(children)
    }

    fn or(&self, children: Vec<Expression>) -> Expression {
        Expression::Or(children)
    }
}
