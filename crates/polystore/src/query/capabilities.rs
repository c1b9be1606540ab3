//! Backend capability descriptors.
//!
//! A [`BackendCapabilities`] value is the single table the generic planner
//! consults to decide which parts of an expression a backend can evaluate
//! natively. Adding a backend means filling in this table and writing a
//! [`QueryDialect`](super::QueryDialect) that renders the native part.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::core::BackendKind;
use crate::expr::{AttributePath, Comparison, Operator};

/// How a backend handles `IN` lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InListSupport {
    /// Multi-value equality is native.
    Native,
    /// Expanded into an `OR` of equalities before rendering.
    ExpandToOr,
    /// Evaluated in memory only.
    Residual,
}

/// A compound index usable by index-restricted backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    /// Fields (dotted) that the index serves by equality.
    pub equality_fields: Vec<String>,
    /// Field (dotted) the index can scan as a range, after the equality prefix.
    #[serde(default)]
    pub range_field: Option<String>,
}

impl IndexDefinition {
    /// Creates an index definition.
    pub fn new<S: Into<String>>(
        equality_fields: impl IntoIterator<Item = S>,
        range_field: Option<&str>,
    ) -> Self {
        Self {
            equality_fields: equality_fields.into_iter().map(Into::into).collect(),
            range_field: range_field.map(str::to_string),
        }
    }

    /// Returns true if the index can serve equality on every field in
    /// `fields` plus an inequality on `range`.
    pub fn covers(&self, fields: &HashSet<String>, range: &str) -> bool {
        self.range_field.as_deref() == Some(range)
            && fields.iter().all(|f| self.equality_fields.contains(f))
    }
}

/// Limits on how comparisons can be conjoined natively.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "indexes")]
pub enum ConjunctionSupport {
    /// Any conjunction is native.
    #[default]
    Unrestricted,
    /// Equality conjuncts merge freely; at most one inequality field per
    /// query, and only when one of the indexes covers it together with the
    /// native equality fields.
    Indexed(Vec<IndexDefinition>),
}

/// Attribute path support.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathSupport {
    /// Paths deeper than one segment can be addressed.
    pub nested: bool,
    /// Segments spelled as integers keep object-key meaning. Backends that
    /// reinterpret them as array positions must set this to false.
    pub integer_segments: bool,
    /// Characters a segment may not contain.
    pub forbidden_chars: Vec<char>,
}

impl PathSupport {
    /// Any path is addressable.
    pub fn any() -> Self {
        Self {
            nested: true,
            integer_segments: true,
            forbidden_chars: Vec::new(),
        }
    }

    /// Returns true if the path can be rendered natively.
    pub fn supports(&self, path: &AttributePath) -> bool {
        (self.nested || path.is_top_level())
            && path.segments().iter().all(|segment| {
                (self.integer_segments || segment.parse::<i64>().is_err())
                    && !segment.chars().any(|c| self.forbidden_chars.contains(&c))
            })
    }
}

/// What a backend can evaluate natively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendCapabilities {
    /// Backend this table describes.
    pub backend: BackendKind,
    /// Comparison operators with native support.
    pub operators: Vec<Operator>,
    /// Whether a disjunction of native children can itself be native.
    pub or_composition: bool,
    /// `IN` handling.
    pub in_lists: InListSupport,
    /// Conjunction restrictions.
    #[serde(default)]
    pub conjunctions: ConjunctionSupport,
    /// Addressable attribute paths.
    pub paths: PathSupport,
    /// When false, native comparisons may also match values of another JSON
    /// type (for example `"4"` for `4`), so each is repeated in the residual.
    pub strict_typing: bool,
    /// Whether `order_by` is applied by the backend.
    pub native_ordering: bool,
}

impl BackendCapabilities {
    /// Everything native, as the in-memory evaluator provides.
    pub fn full(backend: BackendKind) -> Self {
        Self {
            backend,
            operators: Operator::ALL.to_vec(),
            or_composition: true,
            in_lists: InListSupport::Native,
            conjunctions: ConjunctionSupport::Unrestricted,
            paths: PathSupport::any(),
            strict_typing: true,
            native_ordering: true,
        }
    }

    /// Nothing native: every row is scanned and filtered in memory.
    pub fn scan_only(backend: BackendKind) -> Self {
        Self {
            backend,
            operators: Vec::new(),
            or_composition: false,
            in_lists: InListSupport::Residual,
            conjunctions: ConjunctionSupport::Unrestricted,
            paths: PathSupport::any(),
            strict_typing: true,
            native_ordering: false,
        }
    }

    /// A document database that only answers conjunctions its indexes cover.
    pub fn indexed(backend: BackendKind, indexes: Vec<IndexDefinition>) -> Self {
        Self {
            backend,
            operators: Operator::ALL.to_vec(),
            or_composition: false,
            in_lists: InListSupport::Native,
            conjunctions: ConjunctionSupport::Indexed(indexes),
            paths: PathSupport::any(),
            strict_typing: true,
            native_ordering: true,
        }
    }

    /// Returns true if the operator is native.
    pub fn supports_operator(&self, operator: Operator) -> bool {
        self.operators.contains(&operator)
    }

    /// Returns true if the comparison can be rendered natively as-is.
    pub fn supports_comparison(&self, comparison: &Comparison) -> bool {
        self.supports_operator(comparison.operator()) && self.paths.supports(comparison.path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_support() {
        let paths = PathSupport {
            nested: true,
            integer_segments: false,
            forbidden_chars: vec!['.'],
        };
        assert!(paths.supports(&AttributePath::dotted("team.id").unwrap()));
        assert!(!paths.supports(&AttributePath::dotted("items.0").unwrap()));
        assert!(!paths.supports(&AttributePath::new(vec!["a.b"]).unwrap()));

        let flat = PathSupport {
            nested: false,
            ..PathSupport::any()
        };
        assert!(!flat.supports(&AttributePath::dotted("team.id").unwrap()));
    }

    #[test]
    fn test_index_covers() {
        let index = IndexDefinition::new(["state"], Some("role"));
        let fields: HashSet<String> = ["state".to_string()].into();
        assert!(index.covers(&fields, "role"));
        assert!(!index.covers(&fields, "age"));
        let fields: HashSet<String> = ["city".to_string()].into();
        assert!(!index.covers(&fields, "role"));
    }

    #[test]
    fn test_capabilities_deserialize() {
        let caps: BackendCapabilities = serde_json::from_value(serde_json::json!({
            "backend": "memory",
            "operators": ["eq", "in"],
            "or_composition": false,
            "in_lists": "expand_to_or",
            "conjunctions": {"mode": "indexed", "indexes": [
                {"equality_fields": ["state", "role"]}
            ]},
            "paths": {"nested": true, "integer_segments": true, "forbidden_chars": []},
            "strict_typing": true,
            "native_ordering": true
        }))
        .unwrap();
        assert!(caps.supports_operator(Operator::Eq));
        assert!(!caps.supports_operator(Operator::Lt));
        assert_eq!(caps.in_lists, InListSupport::ExpandToOr);
    }
}
