//! Generic query planner.
//!
//! [`plan`] splits an expression into the part a backend evaluates natively
//! and a residual that must be re-checked in memory. The split is driven
//! only by [`BackendCapabilities`]; backends never re-derive it.
//!
//! The planner guarantees that for every object `o`:
//!
//! ```text
//! expr(o)  ==  native(o) && residual(o)
//! ```
//!
//! with `native` possibly over-inclusive when `residual` is not TRUE, and
//! exact when it is. Predicates are never dropped.

use std::collections::HashSet;

use crate::expr::{Comparison, Expression, Operator};

use super::capabilities::{BackendCapabilities, ConjunctionSupport, InListSupport, IndexDefinition};

/// The native/residual split of an expression.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    /// Expression the backend evaluates; only uses native constructs.
    pub native: Expression,
    /// Expression still to be evaluated in memory (TRUE when exact).
    pub residual: Expression,
}

impl QueryPlan {
    /// Returns true if the native part alone is exact.
    pub fn is_exact(&self) -> bool {
        self.residual.is_always_true()
    }

    fn native(native: Expression) -> Self {
        Self {
            native,
            residual: Expression::always_true(),
        }
    }

    fn residual(residual: Expression) -> Self {
        Self {
            native: Expression::always_true(),
            residual,
        }
    }
}

/// Plans an expression against a capability table.
///
/// The input is never modified; the returned plan holds cloned subtrees.
pub fn plan(expression: &Expression, capabilities: &BackendCapabilities) -> QueryPlan {
    match expression {
        Expression::Comparison(c) => plan_comparison(c, capabilities),
        Expression::And(children) => plan_and(children, capabilities),
        Expression::Or(children) => plan_or(expression, children, capabilities),
    }
}

fn plan_comparison(comparison: &Comparison, caps: &BackendCapabilities) -> QueryPlan {
    if comparison.is_unsatisfiable() {
        return QueryPlan::native(Expression::always_false());
    }

    let native = match comparison.operator() {
        Operator::In => plan_in(comparison, caps),
        _ if caps.supports_comparison(comparison) => {
            Some(Expression::Comparison(comparison.clone()))
        }
        _ => None,
    };

    match native {
        Some(native) if caps.strict_typing => QueryPlan::native(native),
        Some(native) => QueryPlan {
            native,
            residual: Expression::Comparison(comparison.clone()),
        },
        None => QueryPlan::residual(Expression::Comparison(comparison.clone())),
    }
}

fn plan_in(comparison: &Comparison, caps: &BackendCapabilities) -> Option<Expression> {
    if !caps.paths.supports(comparison.path()) {
        return None;
    }
    match caps.in_lists {
        InListSupport::Native if caps.supports_operator(Operator::In) => {
            Some(Expression::Comparison(comparison.clone()))
        }
        InListSupport::ExpandToOr if caps.supports_operator(Operator::Eq) && caps.or_composition => {
            let equalities = comparison.in_values().iter().filter_map(|value| {
                Comparison::new(Operator::Eq, comparison.path().clone(), value.clone())
                    .ok()
                    .map(Expression::Comparison)
            });
            Some(or_of(equalities.collect()))
        }
        _ => None,
    }
}

fn plan_and(children: &[Expression], caps: &BackendCapabilities) -> QueryPlan {
    let plans: Vec<QueryPlan> = children.iter().map(|child| plan(child, caps)).collect();
    let mut natives = Vec::with_capacity(plans.len());
    let mut residuals = Vec::with_capacity(plans.len());
    for p in plans {
        natives.push(p.native);
        residuals.push(p.residual);
    }

    let plan = QueryPlan {
        native: and_of(natives),
        residual: and_of(residuals),
    };

    match &caps.conjunctions {
        ConjunctionSupport::Unrestricted => plan,
        ConjunctionSupport::Indexed(indexes) => restrict_to_indexes(plan, indexes),
    }
}

fn plan_or(whole: &Expression, children: &[Expression], caps: &BackendCapabilities) -> QueryPlan {
    if children.len() == 1 {
        return plan(&children[0], caps);
    }
    let plans: Vec<QueryPlan> = children.iter().map(|child| plan(child, caps)).collect();

    if plans.iter().all(|p| p.native.is_always_false()) {
        return QueryPlan::native(Expression::always_false());
    }
    if !caps.or_composition || plans.iter().any(|p| p.native.is_always_true()) {
        return QueryPlan::residual(whole.clone());
    }

    let exact = plans.iter().all(QueryPlan::is_exact);
    let native = or_of(plans.into_iter().map(|p| p.native).collect());
    if exact {
        QueryPlan::native(native)
    } else {
        QueryPlan {
            native,
            residual: whole.clone(),
        }
    }
}

/// Applies a restricted compound-index profile to a planned conjunction.
///
/// Equality conjuncts (`=`, `IN`) always stay native. Inequality conjuncts
/// stay native only for a single field, and only when no equality is
/// present or an index covers that field as its range together with every
/// equality field. Everything else moves to the residual.
fn restrict_to_indexes(plan: QueryPlan, indexes: &[IndexDefinition]) -> QueryPlan {
    let conjuncts = match plan.native {
        Expression::And(children) => children,
        other => vec![other],
    };

    let mut kept_equalities = Vec::new();
    let mut inequalities = Vec::new();
    let mut moved = Vec::new();
    for conjunct in conjuncts {
        match classify(&conjunct) {
            Conjunct::Equality => kept_equalities.push(conjunct),
            Conjunct::Inequality(field) => inequalities.push((field, conjunct)),
            Conjunct::Other => moved.push(conjunct),
        }
    }

    let equality_fields: HashSet<String> = kept_equalities
        .iter()
        .flat_map(|e| e.comparisons())
        .map(|c| c.path().to_dotted())
        .collect();

    let range_field = inequalities
        .iter()
        .map(|(field, _)| field.clone())
        .find(|field| {
            equality_fields.is_empty() || indexes.iter().any(|i| i.covers(&equality_fields, field))
        });

    let mut native = kept_equalities;
    for (field, conjunct) in inequalities {
        if Some(&field) == range_field.as_ref() {
            native.push(conjunct);
        } else {
            moved.push(conjunct);
        }
    }

    if moved.is_empty() {
        return QueryPlan {
            native: and_of(native),
            residual: plan.residual,
        };
    }

    let mut residual = match plan.residual {
        Expression::And(children) => children,
        other => vec![other],
    };
    residual.extend(moved);
    QueryPlan {
        native: and_of(native),
        residual: and_of(residual),
    }
}

enum Conjunct {
    Equality,
    Inequality(String),
    Other,
}

fn classify(conjunct: &Expression) -> Conjunct {
    match conjunct {
        Expression::Comparison(c) if matches!(c.operator(), Operator::Eq | Operator::In) => {
            Conjunct::Equality
        }
        Expression::Comparison(c) if c.operator().is_inequality() => {
            Conjunct::Inequality(c.path().to_dotted())
        }
        Expression::Or(_) if is_equality_disjunction(conjunct) => Conjunct::Equality,
        _ if conjunct.is_always_false() => Conjunct::Equality,
        _ => Conjunct::Other,
    }
}

fn is_equality_disjunction(expression: &Expression) -> bool {
    match expression {
        Expression::Or(children) => {
            let fields: HashSet<String> = children
                .iter()
                .flat_map(|c| c.comparisons())
                .map(|c| c.path().to_dotted())
                .collect();
            fields.len() == 1
                && children.iter().all(|child| {
                    matches!(child, Expression::Comparison(c) if c.operator() == Operator::Eq)
                })
        }
        _ => false,
    }
}

/// Builds a simplified conjunction: TRUE children vanish, a FALSE child
/// makes the whole conjunction FALSE, nested conjunctions are flattened.
pub(crate) fn and_of(children: Vec<Expression>) -> Expression {
    let mut out = Vec::with_capacity(children.len());
    for child in children {
        match child {
            Expression::And(grandchildren) => out.extend(grandchildren),
            c if c.is_always_false() => return Expression::always_false(),
            c => out.push(c),
        }
    }
    if out.len() == 1 {
        out.remove(0)
    } else {
        Expression::And(out)
    }
}

/// Builds a simplified disjunction: FALSE children vanish, a TRUE child
/// makes the whole disjunction TRUE, nested disjunctions are flattened.
pub(crate) fn or_of(children: Vec<Expression>) -> Expression {
    let mut out = Vec::with_capacity(children.len());
    for child in children {
        match child {
            Expression::Or(grandchildren) => out.extend(grandchildren),
            c if c.is_always_true() => return Expression::always_true(),
            c => out.push(c),
        }
    }
    if out.len() == 1 {
        out.remove(0)
    } else {
        Expression::Or(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::BackendKind;
    use crate::expr::parse;
    use crate::query::capabilities::PathSupport;

    fn full() -> BackendCapabilities {
        BackendCapabilities::full(BackendKind::Memory)
    }

    #[test]
    fn test_full_capabilities_are_exact() {
        let expr = parse("state = 'CA' AND (role = 4 OR role IN [1, 2]) AND name LIKE 'J%'").unwrap();
        let plan = plan(&expr, &full());
        assert!(plan.is_exact());
        assert_eq!(plan.native, expr);
    }

    #[test]
    fn test_scan_only_pushes_everything_to_residual() {
        let expr = parse("state = 'CA' AND role <= 4").unwrap();
        let plan = plan(&expr, &BackendCapabilities::scan_only(BackendKind::FileSystem));
        assert!(plan.native.is_always_true());
        assert_eq!(plan.residual, expr);
    }

    #[test]
    fn test_unsupported_operator_goes_to_residual() {
        let mut caps = full();
        caps.operators.retain(|op| *op != Operator::Like);
        let expr = parse("state = 'CA' AND name LIKE 'J%'").unwrap();
        let plan = plan(&expr, &caps);
        assert_eq!(plan.native, parse("state = 'CA'").unwrap());
        assert_eq!(plan.residual, parse("name LIKE 'J%'").unwrap());
    }

    #[test]
    fn test_or_with_residual_child_is_fully_residual() {
        let mut caps = full();
        caps.operators.retain(|op| *op != Operator::Like);
        let expr = parse("state = 'CA' OR name LIKE 'J%'").unwrap();
        let plan = plan(&expr, &caps);
        assert!(plan.native.is_always_true());
        assert_eq!(plan.residual, expr);
    }

    #[test]
    fn test_or_without_composition() {
        let mut caps = full();
        caps.or_composition = false;
        let expr = parse("a = 1 AND (b = 2 OR c = 3)").unwrap();
        let plan = plan(&expr, &caps);
        assert_eq!(plan.native, parse("a = 1").unwrap());
        assert_eq!(plan.residual, parse("b = 2 OR c = 3").unwrap());
    }

    #[test]
    fn test_in_list_strategies() {
        let expr = parse("role IN [1, 2]").unwrap();

        let mut caps = full();
        caps.in_lists = InListSupport::ExpandToOr;
        let plan_expanded = plan(&expr, &caps);
        assert!(plan_expanded.is_exact());
        assert_eq!(plan_expanded.native, parse("role = 1 OR role = 2").unwrap());

        caps.in_lists = InListSupport::Residual;
        let plan_residual = plan(&expr, &caps);
        assert!(plan_residual.native.is_always_true());
        assert_eq!(plan_residual.residual, expr);
    }

    #[test]
    fn test_unsatisfiable_comparisons_become_false() {
        let expr = parse("a = 1 AND b < true").unwrap();
        let plan = plan(&expr, &full());
        assert!(plan.native.is_always_false());
        assert!(plan.is_exact());
    }

    #[test]
    fn test_non_strict_typing_repeats_comparisons() {
        let mut caps = full();
        caps.strict_typing = false;
        let expr = parse("role = 4").unwrap();
        let plan = plan(&expr, &caps);
        assert_eq!(plan.native, expr);
        assert_eq!(plan.residual, expr);
    }

    #[test]
    fn test_unsupported_path_goes_to_residual() {
        let mut caps = full();
        caps.paths = PathSupport {
            nested: false,
            ..PathSupport::any()
        };
        let expr = parse("team.id = 4 AND role = 1").unwrap();
        let plan = plan(&expr, &caps);
        assert_eq!(plan.native, parse("role = 1").unwrap());
        assert_eq!(plan.residual, parse("team.id = 4").unwrap());
    }

    #[test]
    fn test_indexed_equality_conjunction_is_exact() {
        let caps = BackendCapabilities::indexed(
            BackendKind::Memory,
            vec![IndexDefinition::new(["state", "role"], None)],
        );
        let expr = parse("state = 'CA' AND role = 4").unwrap();
        let plan = plan(&expr, &caps);
        assert!(plan.is_exact());
        assert_eq!(plan.native, expr);
    }

    #[test]
    fn test_indexed_range_without_index_is_residual() {
        let caps = BackendCapabilities::indexed(
            BackendKind::Memory,
            vec![IndexDefinition::new(["state", "role"], None)],
        );
        let expr = parse("state = 'CA' AND role <= 4").unwrap();
        let plan = plan(&expr, &caps);
        assert_eq!(plan.native, parse("state = 'CA'").unwrap());
        assert_eq!(plan.residual, parse("role <= 4").unwrap());
    }

    #[test]
    fn test_indexed_range_with_covering_index() {
        let caps = BackendCapabilities::indexed(
            BackendKind::Memory,
            vec![IndexDefinition::new(["state"], Some("role"))],
        );
        let expr = parse("state = 'CA' AND role <= 4 AND role > 1 AND age > 3").unwrap();
        let plan = plan(&expr, &caps);
        assert_eq!(
            plan.native,
            parse("state = 'CA' AND role <= 4 AND role > 1").unwrap()
        );
        assert_eq!(plan.residual, parse("age > 3").unwrap());
    }

    #[test]
    fn test_indexed_single_inequality_needs_no_index() {
        let caps = BackendCapabilities::indexed(BackendKind::Memory, vec![]);
        let expr = parse("age > 3 AND age < 10 AND name != 'x'").unwrap();
        let plan = plan(&expr, &caps);
        assert_eq!(plan.native, parse("age > 3 AND age < 10").unwrap());
        assert_eq!(plan.residual, parse("name != 'x'").unwrap());
    }

    #[test]
    fn test_plan_does_not_modify_input() {
        let expr = parse("a = 1 OR b LIKE 'x%'").unwrap();
        let before = expr.clone();
        let _ = plan(&expr, &BackendCapabilities::scan_only(BackendKind::Memory));
        assert_eq!(expr, before);
    }
}
