//! Parser for the textual query grammar.
//!
//! # Grammar
//!
//! ```text
//! expr        = and_expr ("OR" and_expr)*
//! and_expr    = primary ("AND" primary)*
//! primary     = "(" expr ")" / "TRUE" / "FALSE" / comparison
//! comparison  = path op value
//! path        = segment ("." segment)*
//! segment     = identifier / "`" ( any / "``" )* "`"
//! op          = "=" / "!=" / "<>" / "<" / "<=" / ">" / ">=" / "IN" / "LIKE"
//! value       = string / number / "true" / "false" / "null" / list
//! list        = "[" (value ("," value)*)? "]"
//! string      = "'" ( any / "''" )* "'" / DQUOTE any* DQUOTE
//! ```
//!
//! Keywords are case-insensitive. Single-quoted strings recognise only the
//! doubled quote as an escape. Double-quoted strings have no escapes at all,
//! so they cannot contain a `"`.
//!
//! # Example
//!
//! ```
//! use polystore::expr::parse;
//!
//! let expr = parse(r#"state = "CA" AND team.id < 5"#).unwrap();
//! assert_eq!(expr.to_canonical_string(), "state = 'CA' AND team.id < 5");
//! ```

use serde_json::Value;

use super::ast::{AttributePath, Comparison, Expression, Operator};
use crate::error::QueryError;

/// Parses a query string into an [`Expression`].
pub fn parse(input: &str) -> Result<Expression, QueryError> {
    ExpressionParser::parse(input)
}

/// Recursive-descent parser over the query grammar.
pub struct ExpressionParser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> ExpressionParser<'a> {
    /// Creates a new parser.
    pub fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    /// Parses the entire input as one expression.
    pub fn parse(input: &str) -> Result<Expression, QueryError> {
        let mut parser = ExpressionParser::new(input);
        let expr = parser.parse_or_expr()?;
        parser.skip_whitespace();
        if parser.pos < parser.input.len() {
            return Err(parser.error(format!(
                "unexpected characters after expression: '{}'",
                &parser.input[parser.pos..]
            )));
        }
        Ok(expr)
    }

    fn error(&self, message: impl Into<String>) -> QueryError {
        QueryError::Parse {
            message: message.into(),
            position: self.pos,
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if !c.is_whitespace() {
                break;
            }
            self.pos += c.len_utf8();
        }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn consume(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn expect(&mut self, expected: char) -> Result<(), QueryError> {
        self.skip_whitespace();
        if self.peek() == Some(expected) {
            self.consume();
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", expected)))
        }
    }

    /// Consumes `keyword` (case-insensitive) if it is next and followed by a
    /// word boundary.
    fn eat_keyword(&mut self, keyword: &str) -> bool {
        let rest = &self.input[self.pos..];
        let Some(candidate) = rest.get(..keyword.len()) else {
            return false;
        };
        if !candidate.eq_ignore_ascii_case(keyword) {
            return false;
        }
        let boundary = rest[keyword.len()..]
            .chars()
            .next()
            .is_none_or(|c| !(c.is_ascii_alphanumeric() || c == '_'));
        if boundary {
            self.pos += keyword.len();
        }
        boundary
    }

    fn parse_or_expr(&mut self) -> Result<Expression, QueryError> {
        let mut children = vec![self.parse_and_expr()?];
        loop {
            self.skip_whitespace();
            if !self.eat_keyword("or") {
                break;
            }
            children.push(self.parse_and_expr()?);
        }
        Ok(collapse(children, Expression::Or))
    }

    fn parse_and_expr(&mut self) -> Result<Expression, QueryError> {
        let mut children = vec![self.parse_primary()?];
        loop {
            self.skip_whitespace();
            if !self.eat_keyword("and") {
                break;
            }
            children.push(self.parse_primary()?);
        }
        Ok(collapse(children, Expression::And))
    }

    fn parse_primary(&mut self) -> Result<Expression, QueryError> {
        self.skip_whitespace();

        if self.peek() == Some('(') {
            self.consume();
            let expr = self.parse_or_expr()?;
            self.expect(')')?;
            return Ok(expr);
        }
        if self.eat_keyword("true") {
            return Ok(Expression::always_true());
        }
        if self.eat_keyword("false") {
            return Ok(Expression::always_false());
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expression, QueryError> {
        let start = self.pos;
        let path = self.parse_path()?;
        self.skip_whitespace();
        let operator = self.parse_operator()?;
        self.skip_whitespace();
        let value = self.parse_value()?;

        Comparison::new(operator, path, value)
            .map(Expression::Comparison)
            .map_err(|err| QueryError::Parse {
                message: err.to_string(),
                position: start,
            })
    }

    fn parse_path(&mut self) -> Result<AttributePath, QueryError> {
        let mut segments = vec![self.parse_segment()?];
        while self.peek() == Some('.') {
            self.consume();
            segments.push(self.parse_segment()?);
        }
        AttributePath::new(segments).map_err(|err| self.error(err.to_string()))
    }

    fn parse_segment(&mut self) -> Result<String, QueryError> {
        if self.peek() == Some('`') {
            return self.parse_delimited('`');
        }
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == '$' || c == '-' {
                self.consume();
            } else {
                break;
            }
        }
        if start == self.pos {
            return Err(self.error("expected attribute name"));
        }
        Ok(self.input[start..self.pos].to_string())
    }

    fn parse_operator(&mut self) -> Result<Operator, QueryError> {
        for (symbol, op) in [
            ("!=", Operator::Ne),
            ("<>", Operator::Ne),
            ("<=", Operator::Le),
            (">=", Operator::Ge),
            ("=", Operator::Eq),
            ("<", Operator::Lt),
            (">", Operator::Gt),
        ] {
            if self.input[self.pos..].starts_with(symbol) {
                self.pos += symbol.len();
                return Ok(op);
            }
        }
        if self.eat_keyword("in") {
            return Ok(Operator::In);
        }
        if self.eat_keyword("like") {
            return Ok(Operator::Like);
        }
        Err(self.error("expected comparison operator"))
    }

    fn parse_value(&mut self) -> Result<Value, QueryError> {
        self.skip_whitespace();
        match self.peek() {
            Some('\'') => self.parse_delimited('\'').map(Value::String),
            Some('"') => self.parse_double_quoted().map(Value::String),
            Some('[') => self.parse_list(),
            Some(c) if c == '-' || c.is_ascii_digit() => self.parse_number(),
            _ => {
                if self.eat_keyword("true") {
                    Ok(Value::Bool(true))
                } else if self.eat_keyword("false") {
                    Ok(Value::Bool(false))
                } else if self.eat_keyword("null") {
                    Ok(Value::Null)
                } else {
                    Err(self.error("expected value"))
                }
            }
        }
    }

    fn parse_list(&mut self) -> Result<Value, QueryError> {
        self.consume();
        let mut items = Vec::new();
        self.skip_whitespace();
        if self.peek() == Some(']') {
            self.consume();
            return Ok(Value::Array(items));
        }
        loop {
            items.push(self.parse_value()?);
            self.skip_whitespace();
            match self.consume() {
                Some(',') => continue,
                Some(']') => break,
                _ => return Err(self.error("expected ',' or ']' in list")),
            }
        }
        Ok(Value::Array(items))
    }

    fn parse_number(&mut self) -> Result<Value, QueryError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E') {
                self.consume();
            } else {
                break;
            }
        }
        let text = &self.input[start..self.pos];
        match serde_json::from_str::<Value>(text) {
            Ok(number @ Value::Number(_)) => Ok(number),
            _ => Err(QueryError::Parse {
                message: format!("invalid number '{}'", text),
                position: start,
            }),
        }
    }

    /// Parses a literal delimited by `quote`, where a doubled quote stands
    /// for one literal quote character.
    fn parse_delimited(&mut self, quote: char) -> Result<String, QueryError> {
        let start = self.pos;
        self.consume();
        let mut value = String::new();
        loop {
            match self.consume() {
                Some(c) if c == quote => {
                    if self.peek() == Some(quote) {
                        self.consume();
                        value.push(quote);
                    } else {
                        return Ok(value);
                    }
                }
                Some(c) => value.push(c),
                None => {
                    return Err(QueryError::Parse {
                        message: "unterminated literal".to_string(),
                        position: start,
                    });
                }
            }
        }
    }

    fn parse_double_quoted(&mut self) -> Result<String, QueryError> {
        let start = self.pos;
        self.consume();
        let mut value = String::new();
        loop {
            match self.consume() {
                Some('"') => {
                    if self.peek() == Some('"') {
                        return Err(self.error("'\"' is not allowed inside a double-quoted literal"));
                    }
                    return Ok(value);
                }
                Some(c) => value.push(c),
                None => {
                    return Err(QueryError::Parse {
                        message: "unterminated literal".to_string(),
                        position: start,
                    });
                }
            }
        }
    }
}

fn collapse(mut children: Vec<Expression>, build: fn(Vec<Expression>) -> Expression) -> Expression {
    if children.len() == 1 {
        children.remove(0)
    } else {
        build(children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_simple_comparison() {
        let expr = parse("role = 4").unwrap();
        let Expression::Comparison(c) = expr else {
            panic!("expected comparison");
        };
        assert_eq!(c.operator(), Operator::Eq);
        assert_eq!(c.path().segments(), ["role"]);
        assert_eq!(c.value(), &json!(4));
    }

    #[test]
    fn test_parse_double_quoted_string() {
        let expr = parse(r#"state = "CA" AND team.id < 5"#).unwrap();
        assert_eq!(expr.to_canonical_string(), "state = 'CA' AND team.id < 5");
    }

    #[test]
    fn test_embedded_double_quote_is_error() {
        let err = parse(r#"name = "a"b""#).unwrap_err();
        assert!(matches!(err, QueryError::Parse { .. }));
        let err = parse(r#"name = "a""b""#).unwrap_err();
        assert!(matches!(err, QueryError::Parse { .. }));
    }

    #[test]
    fn test_single_quote_escaping() {
        let expr = parse("name = 'it''s'").unwrap();
        let Expression::Comparison(c) = expr else {
            panic!("expected comparison");
        };
        assert_eq!(c.value(), &json!("it's"));
        // backslash has no special meaning
        let expr = parse(r"name = 'a\'").unwrap();
        assert_eq!(expr.to_canonical_string(), r"name = 'a\'");
    }

    #[test]
    fn test_precedence_and_parentheses() {
        let expr = parse("a = 1 OR b = 2 AND c = 3").unwrap();
        assert!(matches!(&expr, Expression::Or(children) if children.len() == 2));

        let expr = parse("(a = 1 or b = 2) and c = 3").unwrap();
        assert!(matches!(&expr, Expression::And(children) if children.len() == 2));
        assert_eq!(
            expr.to_canonical_string(),
            "(a = 1 OR b = 2) AND c = 3"
        );
    }

    #[test]
    fn test_parse_in_and_like() {
        let expr = parse("role IN [1,2,3] AND name LIKE 'J%'").unwrap();
        assert_eq!(
            expr.to_canonical_string(),
            "role IN [1, 2, 3] AND name LIKE 'J%'"
        );
        assert!(parse("role IN 3").is_err());
        assert!(parse("role IN [1, 'a']").is_err());
    }

    #[test]
    fn test_parse_constants_and_literals() {
        assert!(parse("TRUE").unwrap().is_always_true());
        assert!(parse("false").unwrap().is_always_false());
        let expr = parse("a != null AND b = true AND c >= -1.5e3").unwrap();
        assert_eq!(
            expr.to_canonical_string(),
            "a != null AND b = true AND c >= -1500.0"
        );
        assert!(parse("a <> 1").is_ok());
    }

    #[test]
    fn test_parse_quoted_segments() {
        let expr = parse("`first name`.`or` = 1").unwrap();
        let Expression::Comparison(c) = &expr else {
            panic!("expected comparison");
        };
        assert_eq!(c.path().segments(), ["first name", "or"]);
        assert_eq!(parse(&expr.to_canonical_string()).unwrap(), expr);
    }

    #[test]
    fn test_parse_errors_carry_position() {
        match parse("a = 1 AND").unwrap_err() {
            QueryError::Parse { position, .. } => assert_eq!(position, 9),
            other => panic!("unexpected error: {other}"),
        }
        assert!(parse("a = 'open").is_err());
        assert!(parse("a ~ 1").is_err());
        assert!(parse("a = 1 b").is_err());
    }
}
