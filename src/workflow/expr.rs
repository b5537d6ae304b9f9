//! Bounded condition expressions
//!
//! Conditional workflow steps name a predicate over the execution context.
//! The language is deliberately total and tiny: literals, `context.<key>`
//! lookups, comparisons, boolean connectives, and parentheses. There is no
//! code evaluation; a condition either parses and evaluates to a value, or
//! the step fails with `InvalidParams`.

use serde_json::Value;

use crate::error::{CoordinationError, Result};

/// Evaluates `expression` against `context`, coercing the result to a bool
///
/// # Errors
///
/// `InvalidParams` on a parse error, an unknown context path, or an
/// unsupported comparison.
pub fn evaluate(expression: &str, context: &Value) -> Result<bool> {
    let value = evaluate_value(expression, context)?;
    Ok(truthy(&value))
}

/// Evaluates `expression` to its value
///
/// # Errors
///
/// `InvalidParams` on a parse or evaluation error.
pub fn evaluate_value(expression: &str, context: &Value) -> Result<Value> {
    let tokens = tokenize(expression)?;
    let mut parser = Parser {
        tokens,
        position: 0,
        context,
    };
    let value = parser.expression()?;
    if parser.position != parser.tokens.len() {
        return Err(parse_error(format!(
            "unexpected trailing input at token {}",
            parser.position
        )));
    }
    Ok(value)
}

fn parse_error(reason: impl Into<String>) -> CoordinationError {
    CoordinationError::InvalidParams {
        reason: format!("condition: {}", reason.into()),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    Path(Vec<String>),
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end] != quote {
                    end += 1;
                }
                if end == chars.len() {
                    return Err(parse_error("unterminated string literal"));
                }
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                i = end + 1;
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let raw: String = chars[start..i].iter().collect();
                let number = raw
                    .parse::<f64>()
                    .map_err(|_| parse_error(format!("bad number literal {raw}")))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "true" => tokens.push(Token::Bool(true)),
                    "false" => tokens.push(Token::Bool(false)),
                    "null" => tokens.push(Token::Null),
                    _ => {
                        let segments: Vec<String> =
                            word.split('.').map(str::to_string).collect();
                        if segments.first().map(String::as_str) != Some("context") {
                            return Err(parse_error(format!(
                                "unknown identifier {word}; only context.<key> lookups are allowed"
                            )));
                        }
                        if segments.len() < 2 {
                            return Err(parse_error("context lookup needs a key"));
                        }
                        tokens.push(Token::Path(segments[1..].to_vec()));
                    }
                }
            }
            other => return Err(parse_error(format!("unexpected character {other:?}"))),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    position: usize,
    context: &'a Value,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn expression(&mut self) -> Result<Value> {
        let mut left = self.conjunction()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.conjunction()?;
            left = Value::Bool(truthy(&left) || truthy(&right));
        }
        Ok(left)
    }

    fn conjunction(&mut self) -> Result<Value> {
        let mut left = self.negation()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.negation()?;
            left = Value::Bool(truthy(&left) && truthy(&right));
        }
        Ok(left)
    }

    fn negation(&mut self) -> Result<Value> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            let value = self.negation()?;
            return Ok(Value::Bool(!truthy(&value)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Value> {
        let left = self.term()?;
        let operator = match self.peek() {
            Some(Token::Eq | Token::Ne | Token::Lt | Token::Le | Token::Gt | Token::Ge) => {
                self.advance().expect("peeked")
            }
            _ => return Ok(left),
        };
        let right = self.term()?;

        let result = match operator {
            Token::Eq => values_equal(&left, &right),
            Token::Ne => !values_equal(&left, &right),
            ordering => {
                let (a, b) = match (as_number(&left), as_number(&right)) {
                    (Some(a), Some(b)) => (a, b),
                    _ => {
                        return Err(parse_error(format!(
                            "ordering comparison requires numbers, got {left} and {right}"
                        )));
                    }
                };
                match ordering {
                    Token::Lt => a < b,
                    Token::Le => a <= b,
                    Token::Gt => a > b,
                    Token::Ge => a >= b,
                    _ => unreachable!("matched ordering operators above"),
                }
            }
        };
        Ok(Value::Bool(result))
    }

    fn term(&mut self) -> Result<Value> {
        match self.advance() {
            Some(Token::Number(number)) => Ok(Value::from(number)),
            Some(Token::Str(text)) => Ok(Value::String(text)),
            Some(Token::Bool(flag)) => Ok(Value::Bool(flag)),
            Some(Token::Null) => Ok(Value::Null),
            Some(Token::Path(segments)) => {
                let mut current = self.context;
                for segment in &segments {
                    current = current.get(segment).unwrap_or(&Value::Null);
                }
                Ok(current.clone())
            }
            Some(Token::LParen) => {
                let value = self.expression()?;
                if self.advance() != Some(Token::RParen) {
                    return Err(parse_error("expected closing parenthesis"));
                }
                Ok(value)
            }
            other => Err(parse_error(format!("unexpected token {other:?}"))),
        }
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => a == b,
        _ => left == right,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> Value {
        json!({
            "retries": 2,
            "status": "ok",
            "flags": {"urgent": true},
            "score": 0.75,
        })
    }

    #[test]
    fn literals_and_lookups() {
        assert!(evaluate("true", &context()).unwrap());
        assert!(!evaluate("false", &context()).unwrap());
        assert!(!evaluate("null", &context()).unwrap());
        assert!(evaluate("context.retries", &context()).unwrap());
        assert!(evaluate("context.flags.urgent", &context()).unwrap());
        assert!(!evaluate("context.missing", &context()).unwrap());
    }

    #[test]
    fn comparisons() {
        assert!(evaluate("context.retries == 2", &context()).unwrap());
        assert!(evaluate("context.retries != 3", &context()).unwrap());
        assert!(evaluate("context.score >= 0.5", &context()).unwrap());
        assert!(evaluate("context.retries < 5", &context()).unwrap());
        assert!(evaluate("context.status == 'ok'", &context()).unwrap());
        assert!(!evaluate("context.status == 'failed'", &context()).unwrap());
    }

    #[test]
    fn boolean_connectives_and_grouping() {
        assert!(evaluate(
            "context.retries < 5 && context.status == 'ok'",
            &context()
        )
        .unwrap());
        assert!(evaluate(
            "context.status == 'failed' || context.score > 0.5",
            &context()
        )
        .unwrap());
        assert!(evaluate("!(context.retries > 10)", &context()).unwrap());
        assert!(evaluate(
            "(context.retries == 2 || context.retries == 3) && context.flags.urgent",
            &context()
        )
        .unwrap());
    }

    #[test]
    fn negative_numbers() {
        assert!(evaluate("-1 < 0", &context()).unwrap());
        assert!(evaluate("context.score > -0.5", &context()).unwrap());
    }

    #[test]
    fn bad_expressions_are_rejected_not_evaluated() {
        for bad in [
            "import os",
            "context.retries ++ 1",
            "(context.retries",
            "'unterminated",
            "context.status < 'ok'",
            "system('rm')",
            "",
        ] {
            assert!(evaluate(bad, &context()).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn trailing_tokens_are_rejected() {
        assert!(evaluate("true false", &context()).is_err());
    }
}
