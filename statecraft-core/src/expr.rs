//! Expression language of the built-in data model.
//!
//! Expressions evaluate to [`Data`] against a [`Scope`]:
//!
//! - literals: `12`, `-0.5`, `"text"`, `'text'`, `true`, `false`, `null`,
//!   object and array literals such as `{"a": [1, 2]}`
//! - paths: `count`, `order.items[0].sku`, `_event.data`, `cfg['key']`
//! - `In('state')` - true if the state is active
//! - `!expr`, `-expr`
//! - `+`, `-` (numbers; `+` concatenates when either side is a string)
//! - `==`, `!=`, `<`, `<=`, `>`, `>=`
//! - `&&` (binds tighter than `||`), `||`
//! - `(expr)` for grouping
//!
//! Scripts are `;`-separated assignments: `count = count + 1; last = _event.name`.

use crate::codec;
use crate::data::{is_numeric, AtomKind, Data};
use crate::error::CoreError;

/// Variables and state membership visible to an expression.
pub trait Scope {
    /// Looks up a top-level variable.
    fn variable(&self, name: &str) -> Option<&Data>;

    /// Returns true if the state with this id is active.
    fn in_state(&self, id: &str) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
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
}

/// One step into a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// A variable with an optional chain of keys and indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    pub root: String,
    pub segments: Vec<Segment>,
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Data),
    Path(Path),
    In(String),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

/// `location = expr`.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub location: Path,
    pub value: Expr,
}

/// A parsed script.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Script {
    pub statements: Vec<Statement>,
}

fn syntax(reason: impl Into<String>) -> CoreError {
    CoreError::InvalidExpr {
        reason: reason.into(),
    }
}

fn eval_error(reason: impl Into<String>) -> CoreError {
    CoreError::Evaluation {
        reason: reason.into(),
    }
}

impl Expr {
    /// Parses an expression.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(syntax("empty expression"));
        }

        let mut parser = Parser::new(s);
        let expr = parser.parse_expr()?;
        parser.expect_end()?;
        Ok(expr)
    }

    /// Evaluates the expression.
    pub fn evaluate(&self, scope: &dyn Scope) -> Result<Data, CoreError> {
        match self {
            Expr::Literal(data) => Ok(data.clone()),
            Expr::Path(path) => path.lookup(scope),
            Expr::In(id) => Ok(Data::from(scope.in_state(id))),
            Expr::Not(inner) => Ok(Data::from(!inner.evaluate(scope)?.is_truthy())),
            Expr::Neg(inner) => {
                let value = inner.evaluate(scope)?;
                let n = number(&value).ok_or_else(|| {
                    eval_error(format!("cannot negate non-number {}", value))
                })?;
                Ok(Data::from(-n))
            }
            Expr::Binary(BinOp::And, left, right) => {
                if !left.evaluate(scope)?.is_truthy() {
                    return Ok(Data::from(false));
                }
                Ok(Data::from(right.evaluate(scope)?.is_truthy()))
            }
            Expr::Binary(BinOp::Or, left, right) => {
                if left.evaluate(scope)?.is_truthy() {
                    return Ok(Data::from(true));
                }
                Ok(Data::from(right.evaluate(scope)?.is_truthy()))
            }
            Expr::Binary(op, left, right) => {
                let a = left.evaluate(scope)?;
                let b = right.evaluate(scope)?;
                apply(*op, &a, &b)
            }
        }
    }

    /// Evaluates the expression for its truth value.
    pub fn evaluate_bool(&self, scope: &dyn Scope) -> Result<bool, CoreError> {
        Ok(self.evaluate(scope)?.is_truthy())
    }
}

fn apply(op: BinOp, a: &Data, b: &Data) -> Result<Data, CoreError> {
    match op {
        BinOp::Eq => Ok(Data::from(values_equal(a, b))),
        BinOp::Ne => Ok(Data::from(!values_equal(a, b))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = compare(a, b)?;
            let result = match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::Le => ordering.is_le(),
                BinOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            };
            Ok(Data::from(result))
        }
        BinOp::Add => {
            if let (Some(x), Some(y)) = (number(a), number(b)) {
                return Ok(Data::from(x + y));
            }
            if is_string(a) || is_string(b) {
                return Ok(Data::verbatim(format!("{}{}", text_of(a), text_of(b))));
            }
            Err(eval_error(format!("cannot add {} and {}", a, b)))
        }
        BinOp::Sub => match (number(a), number(b)) {
            (Some(x), Some(y)) => Ok(Data::from(x - y)),
            _ => Err(eval_error(format!("cannot subtract {} from {}", b, a))),
        },
        BinOp::And => Ok(Data::from(a.is_truthy() && b.is_truthy())),
        BinOp::Or => Ok(Data::from(a.is_truthy() || b.is_truthy())),
    }
}

fn number(data: &Data) -> Option<f64> {
    match data {
        Data::Atom { text, .. } if is_numeric(text) => text.parse().ok(),
        _ => None,
    }
}

fn is_string(data: &Data) -> bool {
    matches!(
        data,
        Data::Atom {
            kind: AtomKind::Verbatim,
            ..
        }
    )
}

fn text_of(data: &Data) -> String {
    match data {
        Data::Atom { text, .. } => text.clone(),
        Data::Undefined => "undefined".to_string(),
        other => codec::encode(other),
    }
}

fn values_equal(a: &Data, b: &Data) -> bool {
    if let (Some(x), Some(y)) = (number(a), number(b)) {
        return (x - y).abs() < f64::EPSILON;
    }
    match (a, b) {
        (Data::Atom { text: x, .. }, Data::Atom { text: y, .. }) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Data, b: &Data) -> Result<std::cmp::Ordering, CoreError> {
    if let (Some(x), Some(y)) = (number(a), number(b)) {
        return x
            .partial_cmp(&y)
            .ok_or_else(|| eval_error("cannot compare NaN"));
    }
    match (a, b) {
        (Data::Atom { text: x, .. }, Data::Atom { text: y, .. }) => Ok(x.cmp(y)),
        _ => Err(eval_error(format!("cannot compare {} and {}", a, b))),
    }
}

impl Path {
    /// Parses a location such as `a.b[2]`.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let s = s.trim();
        let mut parser = Parser::new(s);
        let path = parser.parse_path()?;
        parser.expect_end()?;
        Ok(path)
    }

    /// Resolves the path. An unknown root variable is an error; a missing key
    /// or index below it is undefined.
    pub fn lookup(&self, scope: &dyn Scope) -> Result<Data, CoreError> {
        let root = scope
            .variable(&self.root)
            .ok_or_else(|| eval_error(format!("'{}' is not defined", self.root)))?;

        let mut current = root;
        for segment in &self.segments {
            let next = match segment {
                Segment::Key(key) => current.get(key),
                Segment::Index(i) => current.get_index(*i),
            };
            match next {
                Some(value) => current = value,
                None => return Ok(Data::Undefined),
            }
        }
        Ok(current.clone())
    }

    /// Writes `value` below `target` along the path segments, creating
    /// intermediate compounds where the value is undefined.
    pub fn assign_into(&self, target: &mut Data, value: Data) -> Result<(), CoreError> {
        set_in(target, &self.segments, value)
    }
}

impl std::fmt::Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.root)?;
        for segment in &self.segments {
            match segment {
                Segment::Key(key) => write!(f, ".{}", key)?,
                Segment::Index(i) => write!(f, "[{}]", i)?,
            }
        }
        Ok(())
    }
}

fn set_in(target: &mut Data, segments: &[Segment], value: Data) -> Result<(), CoreError> {
    let Some((first, rest)) = segments.split_first() else {
        *target = value;
        return Ok(());
    };

    match first {
        Segment::Key(key) => {
            if target.is_undefined() {
                *target = Data::compound();
            }
            match target {
                Data::Compound(map) => {
                    let slot = map.entry(key.clone()).or_default();
                    set_in(slot, rest, value)
                }
                other => Err(eval_error(format!("cannot set key '{}' on {}", key, other))),
            }
        }
        Segment::Index(i) => match target {
            Data::Array(items) if *i < items.len() => set_in(&mut items[*i], rest, value),
            Data::Array(items) if *i == items.len() => {
                let mut slot = Data::Undefined;
                set_in(&mut slot, rest, value)?;
                items.push(slot);
                Ok(())
            }
            other => Err(eval_error(format!("index {} out of range for {}", i, other))),
        },
    }
}

impl Script {
    /// Parses a script. Empty statements are allowed.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let mut parser = Parser::new(s);
        let mut statements = Vec::new();

        loop {
            parser.skip_whitespace();
            while parser.peek_char() == Some(';') {
                parser.pos += 1;
                parser.skip_whitespace();
            }
            if parser.at_end() {
                break;
            }

            let location = parser.parse_path()?;
            parser.skip_whitespace();
            if parser.peek_char() != Some('=') || parser.peek_str("==") {
                return Err(syntax(format!("expected '=' after '{}'", location)));
            }
            parser.pos += 1;
            let value = parser.parse_expr()?;
            statements.push(Statement { location, value });

            parser.skip_whitespace();
            match parser.peek_char() {
                Some(';') => parser.pos += 1,
                None => break,
                Some(c) => return Err(syntax(format!("unexpected '{}' in script", c))),
            }
        }

        Ok(Script { statements })
    }
}

/// Recursive descent parser for expressions and scripts.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse_expr(&mut self) -> Result<Expr, CoreError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, CoreError> {
        let mut left = self.parse_and()?;
        self.skip_whitespace();

        while self.peek_str("||") {
            self.pos += 2;
            let right = self.parse_and()?;
            left = Expr::Binary(BinOp::Or, Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, CoreError> {
        let mut left = self.parse_equality()?;
        self.skip_whitespace();

        while self.peek_str("&&") {
            self.pos += 2;
            let right = self.parse_equality()?;
            left = Expr::Binary(BinOp::And, Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, CoreError> {
        let mut left = self.parse_relational()?;
        loop {
            self.skip_whitespace();
            let op = if self.peek_str("==") {
                BinOp::Eq
            } else if self.peek_str("!=") {
                BinOp::Ne
            } else {
                return Ok(left);
            };
            self.pos += 2;
            let right = self.parse_relational()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_relational(&mut self) -> Result<Expr, CoreError> {
        let mut left = self.parse_additive()?;
        loop {
            self.skip_whitespace();
            let (op, len) = if self.peek_str("<=") {
                (BinOp::Le, 2)
            } else if self.peek_str(">=") {
                (BinOp::Ge, 2)
            } else if self.peek_char() == Some('<') {
                (BinOp::Lt, 1)
            } else if self.peek_char() == Some('>') {
                (BinOp::Gt, 1)
            } else {
                return Ok(left);
            };
            self.pos += len;
            let right = self.parse_additive()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, CoreError> {
        let mut left = self.parse_unary()?;
        loop {
            self.skip_whitespace();
            let op = match self.peek_char() {
                Some('+') => BinOp::Add,
                Some('-') => BinOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, CoreError> {
        self.skip_whitespace();

        match self.peek_char() {
            Some('!') => {
                self.pos += 1;
                let inner = self.parse_unary()?;
                Ok(Expr::Not(Box::new(inner)))
            }
            Some('-') if !self.next_is_digit() => {
                self.pos += 1;
                let inner = self.parse_unary()?;
                Ok(Expr::Neg(Box::new(inner)))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, CoreError> {
        self.skip_whitespace();

        match self.peek_char() {
            Some('(') => {
                self.pos += 1;
                let expr = self.parse_expr()?;
                self.skip_whitespace();
                if self.peek_char() != Some(')') {
                    return Err(syntax("expected ')'"));
                }
                self.pos += 1;
                Ok(expr)
            }
            Some('"') | Some('\'') => Ok(Expr::Literal(Data::verbatim(self.parse_string()?))),
            Some('{') | Some('[') => self.parse_structured(),
            Some(c) if c.is_ascii_digit() || c == '-' => self.parse_number(),
            Some(c) if is_ident_start(c) => {
                let start = self.pos;
                let ident = self.parse_ident()?;
                match ident.as_str() {
                    "true" => Ok(Expr::Literal(Data::from(true))),
                    "false" => Ok(Expr::Literal(Data::from(false))),
                    "null" | "undefined" => Ok(Expr::Literal(Data::Undefined)),
                    "In" if self.peek_after_whitespace() == Some('(') => self.parse_in(),
                    _ => {
                        self.pos = start;
                        Ok(Expr::Path(self.parse_path()?))
                    }
                }
            }
            Some(c) => Err(syntax(format!("unexpected '{}'", c))),
            None => Err(syntax("unexpected end of expression")),
        }
    }

    fn parse_in(&mut self) -> Result<Expr, CoreError> {
        self.skip_whitespace();
        self.pos += 1; // (
        self.skip_whitespace();
        let id = self.parse_string()?;
        self.skip_whitespace();
        if self.peek_char() != Some(')') {
            return Err(syntax("expected ')' after In argument"));
        }
        self.pos += 1;
        Ok(Expr::In(id))
    }

    fn parse_path(&mut self) -> Result<Path, CoreError> {
        self.skip_whitespace();
        let root = self.parse_ident()?;
        let mut segments = Vec::new();

        loop {
            match self.peek_char() {
                Some('.') => {
                    self.pos += 1;
                    segments.push(Segment::Key(self.parse_ident()?));
                }
                Some('[') => {
                    self.pos += 1;
                    self.skip_whitespace();
                    let segment = match self.peek_char() {
                        Some('"') | Some('\'') => Segment::Key(self.parse_string()?),
                        _ => {
                            let start = self.pos;
                            while self.peek_char().is_some_and(|c| c.is_ascii_digit()) {
                                self.pos += 1;
                            }
                            let digits = &self.input[start..self.pos];
                            Segment::Index(
                                digits
                                    .parse()
                                    .map_err(|_| syntax(format!("invalid index '{}'", digits)))?,
                            )
                        }
                    };
                    self.skip_whitespace();
                    if self.peek_char() != Some(']') {
                        return Err(syntax("expected ']'"));
                    }
                    self.pos += 1;
                    segments.push(segment);
                }
                _ => break,
            }
        }

        Ok(Path { root, segments })
    }

    fn parse_ident(&mut self) -> Result<String, CoreError> {
        let start = self.pos;
        match self.peek_char() {
            Some(c) if is_ident_start(c) => self.pos += c.len_utf8(),
            _ => return Err(syntax("expected identifier")),
        }
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' || c == '$' {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
        Ok(self.input[start..self.pos].to_string())
    }

    fn parse_string(&mut self) -> Result<String, CoreError> {
        let quote = match self.peek_char() {
            Some(q @ ('"' | '\'')) => q,
            _ => return Err(syntax("expected string")),
        };
        self.pos += 1;

        let mut out = String::new();
        while let Some(c) = self.peek_char() {
            self.pos += c.len_utf8();
            if c == quote {
                return Ok(out);
            }
            if c == '\\' {
                let escaped = self
                    .peek_char()
                    .ok_or_else(|| syntax("unterminated string"))?;
                self.pos += escaped.len_utf8();
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    other => other,
                });
            } else {
                out.push(c);
            }
        }

        Err(syntax("unterminated string"))
    }

    fn parse_number(&mut self) -> Result<Expr, CoreError> {
        let start = self.pos;

        if self.peek_char() == Some('-') {
            self.pos += 1;
        }
        let mut seen_dot = false;
        let mut seen_exp = false;
        while let Some(c) = self.peek_char() {
            match c {
                '0'..='9' => self.pos += 1,
                '.' if !seen_dot && !seen_exp => {
                    seen_dot = true;
                    self.pos += 1;
                }
                'e' | 'E' if !seen_exp => {
                    seen_exp = true;
                    self.pos += 1;
                    if matches!(self.peek_char(), Some('+') | Some('-')) {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }

        let token = &self.input[start..self.pos];
        if !is_numeric(token) {
            return Err(syntax(format!("invalid number: '{}'", token)));
        }
        Ok(Expr::Literal(Data::interpreted(token)))
    }

    /// Object and array literals, handed to the data codec.
    fn parse_structured(&mut self) -> Result<Expr, CoreError> {
        let start = self.pos;
        let mut depth = 0usize;
        let mut in_string: Option<char> = None;

        while let Some(c) = self.peek_char() {
            self.pos += c.len_utf8();
            match in_string {
                Some(q) => {
                    if c == '\\' {
                        if let Some(next) = self.peek_char() {
                            self.pos += next.len_utf8();
                        }
                    } else if c == q {
                        in_string = None;
                    }
                }
                None => match c {
                    '"' => in_string = Some('"'),
                    '{' | '[' => depth += 1,
                    '}' | ']' => {
                        depth -= 1;
                        if depth == 0 {
                            let literal = codec::decode(&self.input[start..self.pos])
                                .map_err(|e| syntax(e.to_string()))?;
                            return Ok(Expr::Literal(literal));
                        }
                    }
                    _ => {}
                },
            }
        }

        Err(syntax("unterminated literal"))
    }

    fn expect_end(&mut self) -> Result<(), CoreError> {
        self.skip_whitespace();
        match self.peek_char() {
            None => Ok(()),
            Some(c) => Err(syntax(format!("unexpected '{}' at offset {}", c, self.pos))),
        }
    }

    fn next_is_digit(&self) -> bool {
        self.input[self.pos..]
            .chars()
            .nth(1)
            .is_some_and(|c| c.is_ascii_digit())
    }

    fn peek_after_whitespace(&self) -> Option<char> {
        self.input[self.pos..].chars().find(|c| !c.is_whitespace())
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
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
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::{BTreeMap, HashSet};

    struct TestScope {
        vars: BTreeMap<String, Data>,
        active: HashSet<String>,
    }

    impl TestScope {
        fn new(value: serde_json::Value) -> Self {
            let vars = match Data::from_json(&value) {
                Data::Compound(map) => map,
                _ => BTreeMap::new(),
            };
            Self {
                vars,
                active: HashSet::new(),
            }
        }
    }

    impl Scope for TestScope {
        fn variable(&self, name: &str) -> Option<&Data> {
            self.vars.get(name)
        }

        fn in_state(&self, id: &str) -> bool {
            self.active.contains(id)
        }
    }

    fn eval(expr: &str, scope: &TestScope) -> Data {
        Expr::parse(expr).unwrap().evaluate(scope).unwrap()
    }

    fn truthy(expr: &str, scope: &TestScope) -> bool {
        Expr::parse(expr).unwrap().evaluate_bool(scope).unwrap()
    }

    #[test]
    fn test_arithmetic() {
        let scope = TestScope::new(json!({"count": 2}));
        assert_eq!(eval("count + 1", &scope), Data::from(3));
        assert_eq!(eval("count - 5", &scope), Data::from(-3));
        assert_eq!(eval("-count", &scope), Data::from(-2));
        assert_eq!(eval("1.5 + 1", &scope), Data::from(2.5));
    }

    #[test]
    fn test_string_concatenation() {
        let scope = TestScope::new(json!({"name": "door"}));
        assert_eq!(eval("'the ' + name", &scope), Data::verbatim("the door"));
        assert_eq!(eval("name + 1", &scope), Data::verbatim("door1"));
    }

    #[test]
    fn test_comparison() {
        let scope = TestScope::new(json!({"amount": 150, "status": "active"}));
        assert!(truthy("amount > 100", &scope));
        assert!(truthy("amount >= 150", &scope));
        assert!(!truthy("amount < 150", &scope));
        assert!(truthy("amount <= 150", &scope));
        assert!(truthy("status == \"active\"", &scope));
        assert!(truthy("status != 'inactive'", &scope));
        assert!(truthy("amount == 150.0", &scope));
    }

    #[test]
    fn test_logic_precedence() {
        let scope = TestScope::new(json!({"a": true, "b": false, "c": false}));
        assert!(truthy("a && b || !c", &scope));
        assert!(!truthy("a && (b || c)", &scope));
        assert!(truthy("!!a", &scope));
    }

    #[test]
    fn test_short_circuit_skips_errors() {
        let scope = TestScope::new(json!({"a": false}));
        assert!(!truthy("a && missing > 1", &scope));
        assert!(truthy("!a || missing", &scope));
    }

    #[test]
    fn test_paths() {
        let scope = TestScope::new(json!({
            "order": {"items": [{"sku": "x1"}, {"sku": "x2"}], "key with space": 1}
        }));
        assert_eq!(eval("order.items[1].sku", &scope), Data::verbatim("x2"));
        assert_eq!(eval("order['key with space']", &scope), Data::from(1));
        assert_eq!(eval("order.missing.deeper", &scope), Data::Undefined);
        assert_eq!(eval("order.items[5]", &scope), Data::Undefined);
    }

    #[test]
    fn test_unknown_variable_is_error() {
        let scope = TestScope::new(json!({}));
        let expr = Expr::parse("nope + 1").unwrap();
        assert!(matches!(
            expr.evaluate(&scope),
            Err(CoreError::Evaluation { .. })
        ));
    }

    #[test]
    fn test_type_mismatch_is_error() {
        let scope = TestScope::new(json!({"obj": {"a": 1}}));
        assert!(Expr::parse("obj - 1").unwrap().evaluate(&scope).is_err());
        assert!(Expr::parse("obj < 1").unwrap().evaluate(&scope).is_err());
    }

    #[test]
    fn test_in_predicate() {
        let mut scope = TestScope::new(json!({}));
        scope.active.insert("running".to_string());
        assert!(truthy("In('running')", &scope));
        assert!(!truthy("In(\"stopped\")", &scope));
        assert!(truthy("!In('stopped') && In('running')", &scope));
    }

    #[test]
    fn test_structured_literals() {
        let scope = TestScope::new(json!({}));
        let value = eval("{\"a\": [1, \"}\"], \"b\": true}", &scope);
        assert_eq!(value.get("a").unwrap().get_index(1), Some(&Data::verbatim("}")));
        assert_eq!(eval("[1, 2]", &scope).len(), Some(2));
        assert_eq!(eval("null", &scope), Data::Undefined);
    }

    #[test]
    fn test_parse_errors() {
        assert!(Expr::parse("").is_err());
        assert!(Expr::parse("   ").is_err());
        assert!(Expr::parse("(a && b").is_err());
        assert!(Expr::parse("a ==").is_err());
        assert!(Expr::parse("'open").is_err());
        assert!(Expr::parse("a b").is_err());
        assert!(Expr::parse("a[x]").is_err());
        assert!(Expr::parse("{\"a\": 1").is_err());
    }

    #[test]
    fn test_script_parse() {
        let script = Script::parse("count = count + 1; last = _event.name;").unwrap();
        assert_eq!(script.statements.len(), 2);
        assert_eq!(script.statements[1].location.root, "last");

        assert!(Script::parse("").unwrap().statements.is_empty());
        assert!(Script::parse("a == 1").is_err());
        assert!(Script::parse("a = 1 b = 2").is_err());
    }

    #[test]
    fn test_assign_into() {
        let mut value = Data::Undefined;
        Path::parse("x.y").unwrap().assign_into(&mut value, Data::from(1)).unwrap();
        assert_eq!(value.get("y"), Some(&Data::from(1)));

        let mut list: Data = vec![Data::from(1)].into_iter().collect();
        Path::parse("x[1]").unwrap().assign_into(&mut list, Data::from(2)).unwrap();
        assert_eq!(list.len(), Some(2));
        assert!(Path::parse("x[5]")
            .unwrap()
            .assign_into(&mut list, Data::from(3))
            .is_err());

        let mut atom = Data::from(3);
        assert!(Path::parse("x.k")
            .unwrap()
            .assign_into(&mut atom, Data::from(1))
            .is_err());
    }

    #[test]
    fn test_path_display() {
        let path = Path::parse("a.b[3].c").unwrap();
        assert_eq!(path.to_string(), "a.b[3].c");
    }
}
