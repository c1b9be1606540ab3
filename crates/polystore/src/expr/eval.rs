//! In-memory evaluation of expressions.
//!
//! This evaluator is the reference semantics every backend dialect must
//! agree with: the residual pass of a query and the memory backend both run
//! through it.

use std::cmp::Ordering;

use serde_json::{Number, Value};

use super::ast::{Comparison, Expression, Operator};

/// Evaluates an expression against a JSON object.
///
/// A missing attribute never matches, except under `!=`.
pub fn evaluate(expression: &Expression, object: &Value) -> bool {
    match expression {
        Expression::Comparison(c) => evaluate_comparison(c, object),
        Expression::And(children) => children.iter().all(|child| evaluate(child, object)),
        Expression::Or(children) => children.iter().any(|child| evaluate(child, object)),
    }
}

fn evaluate_comparison(comparison: &Comparison, object: &Value) -> bool {
    let Some(actual) = comparison.path().resolve(object) else {
        return comparison.operator() == Operator::Ne;
    };
    let expected = comparison.value();

    match comparison.operator() {
        Operator::Eq => values_equal(actual, expected),
        Operator::Ne => !values_equal(actual, expected),
        Operator::Lt => compare_values(actual, expected) == Some(Ordering::Less),
        Operator::Le => matches!(
            compare_values(actual, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        Operator::Gt => compare_values(actual, expected) == Some(Ordering::Greater),
        Operator::Ge => matches!(
            compare_values(actual, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Operator::In => comparison
            .in_values()
            .iter()
            .any(|candidate| values_equal(actual, candidate)),
        Operator::Like => match (actual, expected) {
            (Value::String(text), Value::String(pattern)) => like_matches(text, pattern),
            _ => false,
        },
    }
}

/// JSON equality with numbers compared by value (`3 == 3.0`).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => compare_numbers(x, y) == Some(Ordering::Equal),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x
                    .iter()
                    .all(|(k, v)| y.get(k).is_some_and(|other| values_equal(v, other)))
        }
        _ => a == b,
    }
}

/// Orders two values of the same comparable type.
///
/// Only number/number and string/string pairs are ordered; strings compare
/// by UTF-8 byte order. Every other pair returns `None`.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => compare_numbers(x, y),
        (Value::String(x), Value::String(y)) => Some(x.as_bytes().cmp(y.as_bytes())),
        _ => None,
    }
}

/// Orders two JSON numbers by exact value.
///
/// Integers never pass through `f64`, so `2^53 + 1 > 2^53` holds and an
/// integer compares exactly against a float bound.
pub fn compare_numbers(x: &Number, y: &Number) -> Option<Ordering> {
    match (integer_of(x), integer_of(y)) {
        (Some(x), Some(y)) => Some(x.cmp(&y)),
        (Some(x), None) => Some(compare_integer_float(x, y.as_f64()?)),
        (None, Some(y)) => Some(compare_integer_float(y, x.as_f64()?).reverse()),
        (None, None) => x.as_f64()?.partial_cmp(&y.as_f64()?),
    }
}

fn integer_of(n: &Number) -> Option<i128> {
    n.as_i64()
        .map(i128::from)
        .or_else(|| n.as_u64().map(i128::from))
}

fn compare_integer_float(int: i128, float: f64) -> Ordering {
    // JSON integers lie within [-2^63, 2^64).
    if float >= 18_446_744_073_709_551_616.0 {
        return Ordering::Less;
    }
    if float < -9_223_372_036_854_775_808.0 {
        return Ordering::Greater;
    }
    let floor = float.floor();
    match int.cmp(&(floor as i128)) {
        Ordering::Equal if float > floor => Ordering::Less,
        other => other,
    }
}

/// Total order used for in-memory sorting.
///
/// Missing sorts first, then null, booleans, numbers, strings, arrays and
/// objects; values of one type use [`compare_values`] where it applies.
pub fn sort_order(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(value: Option<&Value>) -> u8 {
        match value {
            None => 0,
            Some(Value::Null) => 1,
            Some(Value::Bool(_)) => 2,
            Some(Value::Number(_)) => 3,
            Some(Value::String(_)) => 4,
            Some(Value::Array(_)) => 5,
            Some(Value::Object(_)) => 6,
        }
    }

    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(x), Some(y)) if rank(a) == rank(b) => compare_values(x, y)
            .unwrap_or_else(|| x.to_string().cmp(&y.to_string())),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// SQL-style `LIKE` matching: `%` matches any run of characters, `_`
/// exactly one. Case-sensitive.
pub fn like_matches(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();

    let (mut t, mut p) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some('%') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some('_') => {
                t += 1;
                p += 1;
            }
            Some(c) if *c == text[t] => {
                t += 1;
                p += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    t = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|c| *c == '%')
}
