//! Guard expressions of the reference data model.
//!
//! Guards are boolean expressions over the data model context, the event
//! being processed and the active configuration. The language supports:
//!
//! - `ctx.field` - context field access (truthy check)
//! - `ctx.field.nested` - nested field access
//! - `_event.name`, `_event.data.field` - fields of the current event
//! - `ctx.field == value` / `!=` - equality (strings, numbers, booleans, null)
//! - `ctx.field > value` / `>=` / `<` / `<=` - numeric comparisons
//! - `In("state")` - true while the state is active
//! - `true`, `false` - literals
//! - `!expr`, `expr && expr`, `expr || expr`, `(expr)`
//!
//! `&&` binds tighter than `||`.

use crate::error::ExpressionError;
use serde_json::Value;

/// What a guard can see while it is evaluated.
pub trait GuardContext {
    /// The data model context, addressed by `ctx.`.
    fn ctx(&self) -> &Value;

    /// The current event, addressed by `_event.`.
    fn event(&self) -> Option<&Value> {
        None
    }

    /// Whether the state with this id is active.
    fn in_state(&self, _id: &str) -> bool {
        false
    }
}

/// A bare context: no event, no active states.
impl GuardContext for Value {
    fn ctx(&self) -> &Value {
        self
    }
}

/// The root a field path is resolved against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRoot {
    Ctx,
    Event,
}

/// A dotted path below `ctx.` or `_event.`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub root: FieldRoot,
    pub path: String,
}

impl Field {
    /// Resolves the field, yielding `null` for anything missing.
    pub fn resolve<C: GuardContext + ?Sized>(&self, env: &C) -> Value {
        let base = match self.root {
            FieldRoot::Ctx => Some(env.ctx()),
            FieldRoot::Event => env.event(),
        };
        base.map(|v| get_field(v, &self.path)).unwrap_or(Value::Null)
    }
}

/// A parsed guard expression.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardExpr {
    /// Literal `true` or `false`.
    Literal(bool),
    /// Field is truthy.
    Truthy(Field),
    /// Equality comparison.
    Eq(Field, Value),
    /// Inequality comparison.
    Ne(Field, Value),
    /// Greater than.
    Gt(Field, f64),
    /// Greater or equal.
    Ge(Field, f64),
    /// Less than.
    Lt(Field, f64),
    /// Less or equal.
    Le(Field, f64),
    /// State membership.
    In(String),
    /// Logical AND.
    And(Box<GuardExpr>, Box<GuardExpr>),
    /// Logical OR.
    Or(Box<GuardExpr>, Box<GuardExpr>),
    /// Logical NOT.
    Not(Box<GuardExpr>),
}

impl GuardExpr {
    /// Parses a guard expression from a string.
    pub fn parse(s: &str) -> Result<Self, ExpressionError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ExpressionError::new(s, "empty guard expression"));
        }

        let mut parser = Parser::new(s);
        let expr = parser.parse_expr()?;
        parser.skip_whitespace();
        if parser.pos < s.len() {
            return Err(parser.error(format!("unexpected input at offset {}", parser.pos)));
        }
        Ok(expr)
    }

    /// Evaluates the guard.
    pub fn evaluate<C: GuardContext + ?Sized>(&self, env: &C) -> bool {
        match self {
            GuardExpr::Literal(b) => *b,
            GuardExpr::Truthy(field) => is_truthy(&field.resolve(env)),
            GuardExpr::Eq(field, expected) => values_equal(&field.resolve(env), expected),
            GuardExpr::Ne(field, expected) => !values_equal(&field.resolve(env), expected),
            GuardExpr::Gt(field, expected) => compare(env, field, |v| v > *expected),
            GuardExpr::Ge(field, expected) => compare(env, field, |v| v >= *expected),
            GuardExpr::Lt(field, expected) => compare(env, field, |v| v < *expected),
            GuardExpr::Le(field, expected) => compare(env, field, |v| v <= *expected),
            GuardExpr::In(state) => env.in_state(state),
            GuardExpr::And(left, right) => left.evaluate(env) && right.evaluate(env),
            GuardExpr::Or(left, right) => left.evaluate(env) || right.evaluate(env),
            GuardExpr::Not(inner) => !inner.evaluate(env),
        }
    }
}

fn compare<C, F>(env: &C, field: &Field, op: F) -> bool
where
    C: GuardContext + ?Sized,
    F: Fn(f64) -> bool,
{
    as_f64(&field.resolve(env)).map(op).unwrap_or(false)
}

/// Walks a dotted path through nested objects.
pub(crate) fn get_field(root: &Value, path: &str) -> Value {
    let mut current = root;

    for part in path.split('.') {
        match current {
            Value::Object(map) => {
                current = map.get(part).unwrap_or(&Value::Null);
            }
            _ => return Value::Null,
        }
    }

    current.clone()
}

pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .map(|(a, b)| (a - b).abs() < f64::EPSILON)
            .unwrap_or(false),
        (Value::String(a), Value::String(b)) => a == b,
        _ => false,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Recursive descent parser for guard expressions.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn error(&self, message: impl Into<String>) -> ExpressionError {
        ExpressionError::new(self.input, message)
    }

    fn parse_expr(&mut self) -> Result<GuardExpr, ExpressionError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<GuardExpr, ExpressionError> {
        let mut left = self.parse_and()?;
        self.skip_whitespace();

        while self.peek_str("||") {
            self.pos += 2;
            self.skip_whitespace();
            let right = self.parse_and()?;
            left = GuardExpr::Or(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<GuardExpr, ExpressionError> {
        let mut left = self.parse_unary()?;
        self.skip_whitespace();

        while self.peek_str("&&") {
            self.pos += 2;
            self.skip_whitespace();
            let right = self.parse_unary()?;
            left = GuardExpr::And(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<GuardExpr, ExpressionError> {
        self.skip_whitespace();

        if self.peek_char() == Some('!') && !self.peek_str("!=") {
            self.pos += 1;
            self.skip_whitespace();
            let inner = self.parse_unary()?;
            return Ok(GuardExpr::Not(Box::new(inner)));
        }

        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<GuardExpr, ExpressionError> {
        self.skip_whitespace();

        if self.peek_char() == Some('(') {
            self.pos += 1;
            let expr = self.parse_expr()?;
            self.skip_whitespace();
            if self.peek_char() != Some(')') {
                return Err(self.error("expected ')'"));
            }
            self.pos += 1;
            return Ok(expr);
        }

        if self.peek_str("In(") {
            return self.parse_in();
        }
        if self.peek_keyword("true") {
            self.pos += 4;
            return Ok(GuardExpr::Literal(true));
        }
        if self.peek_keyword("false") {
            self.pos += 5;
            return Ok(GuardExpr::Literal(false));
        }

        self.parse_comparison()
    }

    fn parse_in(&mut self) -> Result<GuardExpr, ExpressionError> {
        self.pos += 3;
        self.skip_whitespace();
        let state = match self.parse_string_value()? {
            Value::String(s) => s,
            _ => return Err(self.error("In() expects a state id")),
        };
        self.skip_whitespace();
        if self.peek_char() != Some(')') {
            return Err(self.error("expected ')' after In(\"...\""));
        }
        self.pos += 1;
        Ok(GuardExpr::In(state))
    }

    fn parse_comparison(&mut self) -> Result<GuardExpr, ExpressionError> {
        self.skip_whitespace();
        let field = self.parse_field()?;
        self.skip_whitespace();

        if self.peek_str("==") {
            self.pos += 2;
            let value = self.parse_value()?;
            return Ok(GuardExpr::Eq(field, value));
        }
        if self.peek_str("!=") {
            self.pos += 2;
            let value = self.parse_value()?;
            return Ok(GuardExpr::Ne(field, value));
        }
        if self.peek_str(">=") {
            self.pos += 2;
            let num = self.parse_number()?;
            return Ok(GuardExpr::Ge(field, num));
        }
        if self.peek_str("<=") {
            self.pos += 2;
            let num = self.parse_number()?;
            return Ok(GuardExpr::Le(field, num));
        }
        if self.peek_char() == Some('>') {
            self.pos += 1;
            let num = self.parse_number()?;
            return Ok(GuardExpr::Gt(field, num));
        }
        if self.peek_char() == Some('<') {
            self.pos += 1;
            let num = self.parse_number()?;
            return Ok(GuardExpr::Lt(field, num));
        }

        Ok(GuardExpr::Truthy(field))
    }

    fn parse_field(&mut self) -> Result<Field, ExpressionError> {
        let root = if self.peek_str("ctx.") {
            self.pos += 4;
            FieldRoot::Ctx
        } else if self.peek_str("_event.") {
            self.pos += 7;
            FieldRoot::Event
        } else {
            return Err(self.error("field must start with 'ctx.' or '_event.'"));
        };

        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' || c == '.' {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }

        let path = &self.input[start..self.pos];
        if path.is_empty() {
            return Err(self.error("empty field name"));
        }

        Ok(Field {
            root,
            path: path.to_string(),
        })
    }

    fn parse_value(&mut self) -> Result<Value, ExpressionError> {
        self.skip_whitespace();

        if self.peek_keyword("true") {
            self.pos += 4;
            return Ok(Value::Bool(true));
        }
        if self.peek_keyword("false") {
            self.pos += 5;
            return Ok(Value::Bool(false));
        }
        if self.peek_keyword("null") {
            self.pos += 4;
            return Ok(Value::Null);
        }
        if matches!(self.peek_char(), Some('"') | Some('\'')) {
            return self.parse_string_value();
        }

        let num = self.parse_number()?;
        serde_json::Number::from_f64(num)
            .map(Value::Number)
            .ok_or_else(|| self.error(format!("number out of range: {}", num)))
    }

    /// Parses a single- or double-quoted string.
    fn parse_string_value(&mut self) -> Result<Value, ExpressionError> {
        let quote = match self.peek_char() {
            Some(q @ ('"' | '\'')) => q,
            _ => return Err(self.error("expected string")),
        };
        self.pos += 1;

        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c == quote {
                let s = &self.input[start..self.pos];
                self.pos += 1;
                return Ok(Value::String(s.to_string()));
            }
            if c == '\\' {
                self.pos += 1;
                if let Some(escaped) = self.peek_char() {
                    self.pos += escaped.len_utf8();
                }
            } else {
                self.pos += c.len_utf8();
            }
        }

        Err(self.error("unterminated string"))
    }

    fn parse_number(&mut self) -> Result<f64, ExpressionError> {
        self.skip_whitespace();
        let start = self.pos;

        if self.peek_char() == Some('-') {
            self.pos += 1;
        }
        self.skip_digits();
        if self.peek_char() == Some('.') {
            self.pos += 1;
            self.skip_digits();
        }

        let num_str = &self.input[start..self.pos];
        num_str
            .parse::<f64>()
            .map_err(|_| self.error(format!("invalid number: '{}'", num_str)))
    }

    fn skip_digits(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_str(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }

    /// Matches `word` only when it is not the prefix of a longer identifier.
    fn peek_keyword(&self, word: &str) -> bool {
        let rest = &self.input[self.pos..];
        rest.starts_with(word)
            && !rest[word.len()..]
                .chars()
                .next()
                .map(|c| c.is_alphanumeric() || c == '_')
                .unwrap_or(false)
    }
}
