//! Query expression model.
//!
//! An [`Expression`] is an immutable tree of [`Comparison`] leaves joined by
//! `And`/`Or` nodes. Expressions can be evaluated in memory, printed in a
//! canonical textual form, and parsed back from that form.
//!
//! ```
//! use polystore::expr::{parse, Expression};
//! use serde_json::json;
//!
//! let filter = parse("state = 'CA' AND role <= 4").unwrap();
//! assert!(filter.evaluate(&json!({"state": "CA", "role": 2})));
//! assert!(!filter.evaluate(&json!({"state": "CA"})));
//! assert!(Expression::and(vec![]).is_always_true());
//! ```

mod ast;
pub mod eval;
mod parser;

pub use ast::{AttributePath, Comparison, Expression, Operator};
pub use eval::evaluate;
pub use parser::{parse, ExpressionParser};
