//! A small expression language evaluated against event maps.
//!
//! Matchers, extractors and template variables all share this engine: a
//! tokenizer, a precedence-climbing parser and a tree-walking evaluator over
//! [`Value`]s, with function calls dispatched through a [`HelperRegistry`].

mod functions;

use std::fmt;

use crate::value::{Value, VarMap};

pub use functions::HelperRegistry;

/// Evaluation or parse failure.
///
/// Missing-variable errors carry the `No parameter` prefix so callers can
/// distinguish "this event simply lacks the key" (skip the expression) from
/// real failures, since partially populated event maps are normal between
/// protocols.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DslError {
    message: String,
}

impl DslError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn missing_parameter(name: &str) -> Self {
        Self {
            message: format!("No parameter '{name}' found"),
        }
    }

    /// True when the error only signals an absent event-map key.
    pub fn is_missing_parameter(&self) -> bool {
        self.message.starts_with("No parameter")
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for DslError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for DslError {}

/// Parse and evaluate `src` in one go.
pub fn evaluate(src: &str, vars: &VarMap, helpers: &HelperRegistry) -> Result<Value, DslError> {
    CompiledExpression::parse(src)?.eval(vars, helpers)
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    OrOr,
    AndAnd,
    EqEq,
    NotEq,
    Le,
    Ge,
    Lt,
    Gt,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    LParen,
    RParen,
    Comma,
}

fn tokenize(src: &str) -> Result<Vec<Token>, DslError> {
    let mut tokens = Vec::new();
    let mut chars = src.char_indices().peekable();
    while let Some(&(pos, ch)) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            c if c.is_ascii_digit() => {
                let mut end = pos;
                let mut is_float = false;
                while let Some(&(i, c)) = chars.peek() {
                    if c.is_ascii_digit() {
                        end = i + c.len_utf8();
                        chars.next();
                    } else if c == '.' && !is_float {
                        is_float = true;
                        end = i + c.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let text = &src[pos..end];
                let token = if is_float {
                    Token::Float(
                        text.parse()
                            .map_err(|_| DslError::new(format!("invalid number: {text}")))?,
                    )
                } else {
                    Token::Int(
                        text.parse()
                            .map_err(|_| DslError::new(format!("invalid number: {text}")))?,
                    )
                };
                tokens.push(token);
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut end = pos;
                while let Some(&(i, c)) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        end = i + c.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(src[pos..end].to_string()));
            }
            '\'' | '"' => {
                chars.next();
                let quote = ch;
                let mut text = String::new();
                let mut closed = false;
                while let Some((_, c)) = chars.next() {
                    if c == '\\' {
                        match chars.next() {
                            Some((_, 'n')) => text.push('\n'),
                            Some((_, 'r')) => text.push('\r'),
                            Some((_, 't')) => text.push('\t'),
                            Some((_, other)) => text.push(other),
                            None => break,
                        }
                    } else if c == quote {
                        closed = true;
                        break;
                    } else {
                        text.push(c);
                    }
                }
                if !closed {
                    return Err(DslError::new("unterminated string literal"));
                }
                tokens.push(Token::Str(text));
            }
            '|' => {
                chars.next();
                match chars.peek() {
                    Some(&(_, '|')) => {
                        chars.next();
                        tokens.push(Token::OrOr);
                    }
                    _ => return Err(DslError::new("unexpected character: |")),
                }
            }
            '&' => {
                chars.next();
                match chars.peek() {
                    Some(&(_, '&')) => {
                        chars.next();
                        tokens.push(Token::AndAnd);
                    }
                    _ => return Err(DslError::new("unexpected character: &")),
                }
            }
            '=' => {
                chars.next();
                match chars.peek() {
                    Some(&(_, '=')) => {
                        chars.next();
                        tokens.push(Token::EqEq);
                    }
                    _ => return Err(DslError::new("unexpected character: =")),
                }
            }
            '!' => {
                chars.next();
                if let Some(&(_, '=')) = chars.peek() {
                    chars.next();
                    tokens.push(Token::NotEq);
                } else {
                    tokens.push(Token::Bang);
                }
            }
            '<' => {
                chars.next();
                if let Some(&(_, '=')) = chars.peek() {
                    chars.next();
                    tokens.push(Token::Le);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if let Some(&(_, '=')) = chars.peek() {
                    chars.next();
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '%' => {
                chars.next();
                tokens.push(Token::Percent);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            other => return Err(DslError::new(format!("unexpected character: {other}"))),
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Var(String),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<(), DslError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(DslError::new(format!("expected {what}")))
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, DslError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, DslError> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::OrOr) {
            let right = self.parse_and()?;
            left = Expr::Binary {
                op: BinaryOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, DslError> {
        let mut left = self.parse_equality()?;
        while self.eat(&Token::AndAnd) {
            let right = self.parse_equality()?;
            left = Expr::Binary {
                op: BinaryOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, DslError> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinaryOp::Eq,
                Some(Token::NotEq) => BinaryOp::Ne,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_comparison()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, DslError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::Le) => BinaryOp::Le,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::Ge) => BinaryOp::Ge,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_additive()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, DslError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, DslError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, DslError> {
        if self.eat(&Token::Bang) {
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        if self.eat(&Token::Minus) {
            return Ok(Expr::Neg(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, DslError> {
        match self.next() {
            Some(Token::Int(n)) => Ok(Expr::Literal(Value::Int(n))),
            Some(Token::Float(f)) => Ok(Expr::Literal(Value::Float(f))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::Str(s))),
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    let mut args = Vec::new();
                    if !self.eat(&Token::RParen) {
                        loop {
                            args.push(self.parse_expr()?);
                            if self.eat(&Token::Comma) {
                                continue;
                            }
                            self.expect(&Token::RParen, ")")?;
                            break;
                        }
                    }
                    return Ok(Expr::Call { name, args });
                }
                match name.as_str() {
                    "true" => Ok(Expr::Literal(Value::Bool(true))),
                    "false" => Ok(Expr::Literal(Value::Bool(false))),
                    _ => Ok(Expr::Var(name)),
                }
            }
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen, ")")?;
                Ok(inner)
            }
            other => Err(DslError::new(format!(
                "unexpected token in expression: {other:?}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Compiled expression
// ---------------------------------------------------------------------------

/// A parsed DSL expression, retaining its source for re-substitution passes.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledExpression {
    src: String,
    expr: Expr,
}

impl CompiledExpression {
    pub fn parse(src: &str) -> Result<Self, DslError> {
        let tokens = tokenize(src)?;
        if tokens.is_empty() {
            return Err(DslError::new("empty expression"));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_expr()?;
        if parser.peek().is_some() {
            return Err(DslError::new("trailing tokens in expression"));
        }
        Ok(Self {
            src: src.to_string(),
            expr,
        })
    }

    /// The original source text, as needed by variable re-substitution.
    pub fn source(&self) -> &str {
        &self.src
    }

    pub fn eval(&self, vars: &VarMap, helpers: &HelperRegistry) -> Result<Value, DslError> {
        eval_expr(&self.expr, vars, helpers)
    }
}

impl fmt::Display for CompiledExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.src)
    }
}

fn eval_expr(expr: &Expr, vars: &VarMap, helpers: &HelperRegistry) -> Result<Value, DslError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Var(name) => vars
            .get(name)
            .cloned()
            .ok_or_else(|| DslError::missing_parameter(name)),
        Expr::Not(inner) => {
            let value = eval_expr(inner, vars, helpers)?;
            let b = value
                .as_bool()
                .ok_or_else(|| DslError::new("! expects a boolean operand"))?;
            Ok(Value::Bool(!b))
        }
        Expr::Neg(inner) => {
            let value = eval_expr(inner, vars, helpers)?;
            match value {
                Value::Int(n) => Ok(Value::Int(-n)),
                other => {
                    let f = other
                        .as_f64()
                        .ok_or_else(|| DslError::new("unary - expects a number"))?;
                    Ok(Value::Float(-f))
                }
            }
        }
        Expr::Binary { op, left, right } => eval_binary(*op, left, right, vars, helpers),
        Expr::Call { name, args } => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval_expr(arg, vars, helpers)?);
            }
            helpers.call(name, &values)
        }
    }
}

fn eval_binary(
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
    vars: &VarMap,
    helpers: &HelperRegistry,
) -> Result<Value, DslError> {
    // Logical operators short-circuit; everything else is strict.
    if matches!(op, BinaryOp::Or | BinaryOp::And) {
        let lhs = eval_expr(left, vars, helpers)?;
        let lhs = lhs
            .as_bool()
            .ok_or_else(|| DslError::new("logical operator expects booleans"))?;
        return match (op, lhs) {
            (BinaryOp::Or, true) => Ok(Value::Bool(true)),
            (BinaryOp::And, false) => Ok(Value::Bool(false)),
            _ => {
                let rhs = eval_expr(right, vars, helpers)?;
                let rhs = rhs
                    .as_bool()
                    .ok_or_else(|| DslError::new("logical operator expects booleans"))?;
                Ok(Value::Bool(rhs))
            }
        };
    }

    let lhs = eval_expr(left, vars, helpers)?;
    let rhs = eval_expr(right, vars, helpers)?;
    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(&lhs, &rhs))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(&lhs, &rhs))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare_values(&lhs, &rhs);
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering == std::cmp::Ordering::Less,
                BinaryOp::Le => ordering != std::cmp::Ordering::Greater,
                BinaryOp::Gt => ordering == std::cmp::Ordering::Greater,
                _ => ordering != std::cmp::Ordering::Less,
            }))
        }
        BinaryOp::Add => match (lhs.as_f64(), rhs.as_f64()) {
            (Some(_), Some(_)) => numeric(&lhs, &rhs, op),
            _ => Ok(Value::Str(format!("{lhs}{rhs}"))),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => numeric(&lhs, &rhs, op),
        BinaryOp::Or | BinaryOp::And => unreachable!("handled above"),
    }
}

fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    if let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) {
        // Only compare numerically when at least one side is a real number;
        // two strings that happen to look numeric still compare as strings.
        if !matches!((lhs, rhs), (Value::Str(_), Value::Str(_))) {
            return (a - b).abs() < f64::EPSILON;
        }
    }
    lhs.to_string() == rhs.to_string()
}

fn compare_values(lhs: &Value, rhs: &Value) -> std::cmp::Ordering {
    if let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) {
        return a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal);
    }
    lhs.to_string().cmp(&rhs.to_string())
}

fn numeric(lhs: &Value, rhs: &Value, op: BinaryOp) -> Result<Value, DslError> {
    if let (Value::Int(a), Value::Int(b)) = (lhs, rhs) {
        let result = match op {
            BinaryOp::Add => a.checked_add(*b),
            BinaryOp::Sub => a.checked_sub(*b),
            BinaryOp::Mul => a.checked_mul(*b),
            BinaryOp::Div => a.checked_div(*b),
            BinaryOp::Rem => a.checked_rem(*b),
            _ => None,
        };
        return result
            .map(Value::Int)
            .ok_or_else(|| DslError::new("integer arithmetic failed"));
    }
    let a = lhs
        .as_f64()
        .ok_or_else(|| DslError::new("arithmetic expects numbers"))?;
    let b = rhs
        .as_f64()
        .ok_or_else(|| DslError::new("arithmetic expects numbers"))?;
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        BinaryOp::Rem => a % b,
        _ => return Err(DslError::new("arithmetic expects numbers")),
    };
    Ok(Value::Float(result))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn eval(src: &str, vars: &VarMap) -> Value {
        evaluate(src, vars, &HelperRegistry::default()).unwrap()
    }

    fn scope(pairs: &[(&str, Value)]) -> VarMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn literals_and_arithmetic() {
        assert_eq!(eval("1 + 2 * 3", &VarMap::new()), Value::Int(7));
        assert_eq!(eval("(1 + 2) * 3", &VarMap::new()), Value::Int(9));
        assert_eq!(eval("10 % 3", &VarMap::new()), Value::Int(1));
        assert_eq!(eval("-4 + 6", &VarMap::new()), Value::Int(2));
    }

    #[test]
    fn string_concatenation() {
        assert_eq!(
            eval("'a' + 'b'", &VarMap::new()),
            Value::Str("ab".into())
        );
    }

    #[test]
    fn comparisons_and_logic() {
        let vars = scope(&[("status_code", Value::Int(200))]);
        assert_eq!(eval("status_code == 200", &vars), Value::Bool(true));
        assert_eq!(
            eval("status_code == 200 && status_code < 300", &vars),
            Value::Bool(true)
        );
        assert_eq!(
            eval("status_code == 404 || status_code == 200", &vars),
            Value::Bool(true)
        );
        assert_eq!(eval("!(status_code == 200)", &vars), Value::Bool(false));
    }

    #[test]
    fn numeric_strings_compare_numerically_against_numbers() {
        let vars = scope(&[("content_length", Value::Str("1024".into()))]);
        assert_eq!(eval("content_length > 1000", &vars), Value::Bool(true));
    }

    #[test]
    fn missing_variable_is_flagged() {
        let err = evaluate("nope == 1", &VarMap::new(), &HelperRegistry::default()).unwrap_err();
        assert!(err.is_missing_parameter());
        assert!(err.message().starts_with("No parameter"));
    }

    #[test]
    fn helper_calls_nest() {
        let vars = scope(&[("body", Value::Str("Server: Apache".into()))]);
        assert_eq!(
            eval("contains(to_lower(body), 'apache')", &vars),
            Value::Bool(true)
        );
    }

    #[test]
    fn parse_errors_are_reported() {
        assert!(CompiledExpression::parse("1 +").is_err());
        assert!(CompiledExpression::parse("contains(a").is_err());
        assert!(CompiledExpression::parse("").is_err());
        assert!(CompiledExpression::parse("'open").is_err());
    }

    #[test]
    fn logical_operators_short_circuit() {
        // The right side references a missing variable but must not be
        // evaluated.
        assert_eq!(
            eval("true || missing == 1", &VarMap::new()),
            Value::Bool(true)
        );
        assert_eq!(
            eval("false && missing == 1", &VarMap::new()),
            Value::Bool(false)
        );
    }
}
