//! Boolean expressions for `condition` nodes.
//!
//! ```text
//! expr    := or
//! or      := and (("||" | "or") and)*
//! and     := unary (("&&" | "and") unary)*
//! unary   := ("!" | "not") unary | compare
//! compare := operand (("==" | "!=" | ">" | ">=" | "<" | "<=") operand)?
//! operand := number | string | true | false | null | path | "{" path "}" | "(" expr ")"
//! path    := ident ("." ident)*
//! ```
//!
//! Parsing happens once when a workflow definition is loaded. Evaluation never fails: paths that
//! do not resolve read as `null` and ordering between mismatched types is `false`.
//!
//! A condition holds at most [`MAX_TOKENS`] tokens and nests at most [`MAX_DEPTH`] levels of
//! `!` and parentheses, so the tree stays shallow enough to walk and drop recursively.

use std::cmp::Ordering;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::template::lookup;

pub const MAX_TOKENS: usize = 256;
pub const MAX_DEPTH: usize = 64;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid condition at offset {offset}: {message}")]
pub struct ExpressionError {
    pub offset: usize,
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expression {
    Literal(Value),
    Path(String),
    Not(Box<Expression>),
    And(Box<Expression>, Box<Expression>),
    Or(Box<Expression>, Box<Expression>),
    Compare { op: CompareOp, left: Box<Expression>, right: Box<Expression> },
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, position: 0, end: source.len(), depth: 0 };
        let expression = parser.parse_or()?;

        match parser.peek() {
            None => Ok(expression),
            Some((_, offset)) => Err(ExpressionError {
                offset: *offset,
                message: "unexpected trailing input".to_string(),
            }),
        }
    }

    pub fn evaluate(&self, context: &Map<String, Value>) -> bool {
        truthy(&self.value(context))
    }

    fn value(&self, context: &Map<String, Value>) -> Value {
        match self {
            Self::Literal(value) => value.clone(),
            Self::Path(path) => lookup(context, path).cloned().unwrap_or(Value::Null),
            Self::Not(inner) => Value::Bool(!inner.evaluate(context)),
            Self::And(left, right) => {
                Value::Bool(left.evaluate(context) && right.evaluate(context))
            }
            Self::Or(left, right) => Value::Bool(left.evaluate(context) || right.evaluate(context)),
            Self::Compare { op, left, right } => {
                Value::Bool(compare(*op, &left.value(context), &right.value(context)))
            }
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().map(|n| n != 0.0).unwrap_or(false),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> bool {
    match op {
        CompareOp::Eq => loose_eq(left, right),
        CompareOp::Ne => !loose_eq(left, right),
        CompareOp::Gt => ordering(left, right) == Some(Ordering::Greater),
        CompareOp::Ge => matches!(ordering(left, right), Some(Ordering::Greater | Ordering::Equal)),
        CompareOp::Lt => ordering(left, right) == Some(Ordering::Less),
        CompareOp::Le => matches!(ordering(left, right), Some(Ordering::Less | Ordering::Equal)),
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => left == right,
    }
}

fn ordering(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    BracedPath(String),
    Dot,
    LParen,
    RParen,
    Minus,
    Bang,
    AndAnd,
    OrOr,
    Op(CompareOp),
}

fn tokenize(source: &str) -> Result<Vec<(Token, usize)>, ExpressionError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut index = 0;

    let error = |offset: usize, message: &str| ExpressionError { offset, message: message.to_string() };

    while index < bytes.len() {
        let start = index;
        let byte = bytes[index];

        if tokens.len() >= MAX_TOKENS && !byte.is_ascii_whitespace() {
            return Err(error(start, &format!("condition exceeds {MAX_TOKENS} tokens")));
        }

        match byte {
            b' ' | b'\t' | b'\n' | b'\r' => {
                index += 1;
                continue;
            }
            b'(' => tokens.push((Token::LParen, start)),
            b')' => tokens.push((Token::RParen, start)),
            b'.' => tokens.push((Token::Dot, start)),
            b'-' => tokens.push((Token::Minus, start)),
            b'{' => {
                let close = source[start + 1..]
                    .find('}')
                    .ok_or_else(|| error(start, "unterminated `{` path"))?;
                let path = source[start + 1..start + 1 + close].trim();
                if path.is_empty() {
                    return Err(error(start, "empty `{}` path"));
                }
                tokens.push((Token::BracedPath(path.to_string()), start));
                index = start + close + 2;
                continue;
            }
            b'&' | b'|' => {
                if bytes.get(index + 1) != Some(&byte) {
                    return Err(error(start, "expected `&&` or `||`"));
                }
                let token = if byte == b'&' { Token::AndAnd } else { Token::OrOr };
                tokens.push((token, start));
                index += 2;
                continue;
            }
            b'=' | b'!' | b'<' | b'>' => {
                let followed_by_eq = bytes.get(index + 1) == Some(&b'=');
                let token = match (byte, followed_by_eq) {
                    (b'=', true) => Token::Op(CompareOp::Eq),
                    (b'!', true) => Token::Op(CompareOp::Ne),
                    (b'>', true) => Token::Op(CompareOp::Ge),
                    (b'<', true) => Token::Op(CompareOp::Le),
                    (b'>', false) => Token::Op(CompareOp::Gt),
                    (b'<', false) => Token::Op(CompareOp::Lt),
                    (b'!', false) => Token::Bang,
                    _ => return Err(error(start, "assignment is not allowed, use `==`")),
                };
                tokens.push((token, start));
                index += if followed_by_eq { 2 } else { 1 };
                continue;
            }
            b'\'' | b'"' => {
                let (text, consumed) = read_string(&source[start..], byte)
                    .ok_or_else(|| error(start, "unterminated string literal"))?;
                tokens.push((Token::Str(text), start));
                index += consumed;
                continue;
            }
            b'0'..=b'9' => {
                let mut end = index;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if end + 1 < bytes.len() && bytes[end] == b'.' && bytes[end + 1].is_ascii_digit() {
                    end += 1;
                    while end < bytes.len() && bytes[end].is_ascii_digit() {
                        end += 1;
                    }
                }
                let number = source[start..end]
                    .parse::<f64>()
                    .map_err(|_| error(start, "invalid number literal"))?;
                tokens.push((Token::Number(number), start));
                index = end;
                continue;
            }
            b if b.is_ascii_alphabetic() || b == b'_' => {
                let mut end = index;
                while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_')
                {
                    end += 1;
                }
                tokens.push((Token::Ident(source[start..end].to_string()), start));
                index = end;
                continue;
            }
            _ => return Err(error(start, "unexpected character")),
        }

        index += 1;
    }

    Ok(tokens)
}

/// Reads a quoted literal starting at the opening quote. Returns the text and bytes consumed.
fn read_string(input: &str, quote: u8) -> Option<(String, usize)> {
    let mut text = String::new();
    let mut chars = input.char_indices().skip(1);

    while let Some((offset, ch)) = chars.next() {
        match ch {
            '\\' => {
                let (_, escaped) = chars.next()?;
                text.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    other => other,
                });
            }
            ch if ch as u32 == u32::from(quote) => return Some((text, offset + 1)),
            ch => text.push(ch),
        }
    }

    None
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    position: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&(Token, usize)> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) -> Option<(Token, usize)> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn eat_keyword(&mut self, symbol: &Token, word: &str) -> bool {
        let matched = match self.peek() {
            Some((Token::Ident(ident), _)) => ident == word,
            Some((token, _)) => token == symbol,
            None => false,
        };
        if matched {
            self.position += 1;
        }
        matched
    }

    fn descend(&mut self, offset: usize) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExpressionError {
                offset,
                message: format!("condition nests deeper than {MAX_DEPTH} levels"),
            });
        }
        Ok(())
    }

    fn parse_or(&mut self) -> Result<Expression, ExpressionError> {
        let mut left = self.parse_and()?;
        while self.eat_keyword(&Token::OrOr, "or") {
            let right = self.parse_and()?;
            left = Expression::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expression, ExpressionError> {
        let mut left = self.parse_unary()?;
        while self.eat_keyword(&Token::AndAnd, "and") {
            let right = self.parse_unary()?;
            left = Expression::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expression, ExpressionError> {
        let offset = self.peek().map(|(_, offset)| *offset).unwrap_or(self.end);
        if self.eat_keyword(&Token::Bang, "not") {
            self.descend(offset)?;
            let inner = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Expression::Not(Box::new(inner)));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Expression, ExpressionError> {
        let left = self.parse_operand()?;
        let op = match self.peek() {
            Some((Token::Op(op), _)) => *op,
            _ => return Ok(left),
        };
        self.position += 1;
        let right = self.parse_operand()?;
        Ok(Expression::Compare { op, left: Box::new(left), right: Box::new(right) })
    }

    fn parse_operand(&mut self) -> Result<Expression, ExpressionError> {
        let Some((token, offset)) = self.advance() else {
            return Err(ExpressionError {
                offset: self.end,
                message: "expected a value but the condition ended".to_string(),
            });
        };

        match token {
            Token::Number(number) => Ok(number_literal(number)),
            Token::Minus => match self.advance() {
                Some((Token::Number(number), _)) => Ok(number_literal(-number)),
                _ => Err(ExpressionError {
                    offset,
                    message: "`-` must be followed by a number".to_string(),
                }),
            },
            Token::Str(text) => Ok(Expression::Literal(Value::String(text))),
            Token::BracedPath(path) => Ok(Expression::Path(path)),
            Token::LParen => {
                self.descend(offset)?;
                let inner = self.parse_or()?;
                self.depth -= 1;
                match self.advance() {
                    Some((Token::RParen, _)) => Ok(inner),
                    _ => Err(ExpressionError { offset, message: "unclosed `(`".to_string() }),
                }
            }
            Token::Ident(ident) => match ident.as_str() {
                "true" | "True" => Ok(Expression::Literal(Value::Bool(true))),
                "false" | "False" => Ok(Expression::Literal(Value::Bool(false))),
                "null" | "None" => Ok(Expression::Literal(Value::Null)),
                "and" | "or" | "not" => Err(ExpressionError {
                    offset,
                    message: format!("expected a value, found keyword `{ident}`"),
                }),
                _ => self.parse_path(ident),
            },
            _ => Err(ExpressionError { offset, message: "expected a value".to_string() }),
        }
    }

    fn parse_path(&mut self, first: String) -> Result<Expression, ExpressionError> {
        let mut path = first;
        while let Some((Token::Dot, offset)) = self.peek().cloned() {
            self.position += 1;
            match self.advance() {
                Some((Token::Ident(segment), _)) => {
                    path.push('.');
                    path.push_str(&segment);
                }
                _ => {
                    return Err(ExpressionError {
                        offset,
                        message: "expected a field name after `.`".to_string(),
                    })
                }
            }
        }
        Ok(Expression::Path(path))
    }
}

fn number_literal(number: f64) -> Expression {
    Expression::Literal(
        serde_json::Number::from_f64(number).map(Value::Number).unwrap_or(Value::Null),
    )
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::{Expression, MAX_DEPTH};

    fn context(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn eval(source: &str, value: Value) -> bool {
        Expression::parse(source).expect("condition parses").evaluate(&context(value))
    }

    #[test]
    fn numeric_thresholds_compare_numerically() {
        assert!(eval("confidence > 0.8", json!({ "confidence": 0.9 })));
        assert!(!eval("confidence > 0.8", json!({ "confidence": 0.5 })));
        assert!(eval("score >= 50", json!({ "score": 50 })));
        assert!(eval("score == 50.0", json!({ "score": 50 })));
        assert!(eval("delta < -1", json!({ "delta": -3 })));
    }

    #[test]
    fn paths_reach_into_node_outputs_and_braced_form_allows_dashes() {
        let ctx = json!({
            "qualify-lead": { "confidence": 0.95 },
            "trigger": { "source": "webinar" }
        });

        assert!(eval("{qualify-lead.confidence} > 0.8 and trigger.source == 'webinar'", ctx));
    }

    #[test]
    fn missing_paths_read_as_null() {
        assert!(!eval("confidence > 0.8", json!({})));
        assert!(eval("owner == null", json!({})));
        assert!(!eval("owner", json!({})));
    }

    #[test]
    fn mixed_type_ordering_is_false_in_both_directions() {
        assert!(!eval("score > 'high'", json!({ "score": 10 })));
        assert!(!eval("score <= 'high'", json!({ "score": 10 })));
        assert!(eval("score != 'high'", json!({ "score": 10 })));
    }

    #[test]
    fn boolean_operators_and_grouping() {
        let ctx = json!({ "a": true, "b": false, "status": "NEW" });

        assert!(eval("a && !b", ctx.clone()));
        assert!(eval("not (a and b) or b", ctx.clone()));
        assert!(eval("b || status == \"NEW\"", ctx.clone()));
        assert!(!eval("a and (b or status != 'NEW')", ctx));
    }

    #[test]
    fn python_style_literals_are_accepted() {
        assert!(eval("flag == True and other == None", json!({ "flag": true })));
    }

    #[test]
    fn malformed_conditions_fail_to_parse() {
        for source in [
            "",
            "score >",
            "a == b == c",
            "'unterminated",
            "eval(code)",
            "score = 5",
            "a & b",
            "(a or b",
            "{}",
            "lead.",
        ] {
            assert!(Expression::parse(source).is_err(), "`{source}` should be rejected");
        }
    }

    #[test]
    fn runaway_nesting_is_rejected_instead_of_recursing() {
        let negations = format!("{}a", "!".repeat(200_000));
        let error = Expression::parse(&negations).expect_err("too many tokens");
        assert!(error.message.contains("tokens"), "{}", error.message);

        let parens = format!("{}a{}", "(".repeat(100), ")".repeat(100));
        let error = Expression::parse(&parens).expect_err("too deep");
        assert_eq!(error.message, format!("condition nests deeper than {MAX_DEPTH} levels"));

        let hops = format!("{}a", "not ".repeat(MAX_DEPTH + 1));
        assert!(Expression::parse(&hops).is_err());

        let chain = vec!["a"; 500].join(" && ");
        assert!(Expression::parse(&chain).is_err());
    }

    #[test]
    fn nesting_up_to_the_limit_still_evaluates() {
        let parens = format!("{}a{}", "(".repeat(MAX_DEPTH), ")".repeat(MAX_DEPTH));
        assert!(eval(&parens, json!({ "a": true })));

        let negations = format!("{}a", "!".repeat(MAX_DEPTH));
        assert!(eval(&negations, json!({ "a": true })));

        let chain = vec!["a"; 100].join(" && ");
        assert!(eval(&chain, json!({ "a": 1 })));
    }
}
