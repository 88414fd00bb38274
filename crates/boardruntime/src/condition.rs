//! Connection conditions
//!
//! Conditions are a small, side-effect-free expression language: comparisons,
//! boolean logic, membership tests and dotted-path access into the run
//! context. Nothing in an expression can call out of the evaluator.
//!
//! ```text
//! expr    := or
//! or      := and (("||" | "or") and)*
//! and     := not (("&&" | "and") not)*
//! not     := ("!" | "not") not | compare
//! compare := operand (op operand)?
//! op      := "==" | "!=" | "<" | "<=" | ">" | ">=" | "in" | "not in" | "contains"
//! operand := literal | path | list | "(" expr ")"
//! path    := ident ("." (ident | int) | "[" int "]")*
//! ident   := [A-Za-z_][A-Za-z0-9_-]* | uuid
//! ```

use boardcore::{ConditionError, Connection, PathSegment, Value};

/// Longest accepted expression, in bytes.
pub const MAX_EXPRESSION_LEN: usize = 4096;

/// Deepest accepted nesting of sub-expressions.
pub const MAX_DEPTH: usize = 64;

/// A parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(Vec<PathSegment>),
    List(Vec<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Contains,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self, ConditionError> {
        if source.len() > MAX_EXPRESSION_LEN {
            return Err(ConditionError::TooComplex(format!(
                "expression is {} bytes, limit is {}",
                source.len(),
                MAX_EXPRESSION_LEN
            )));
        }
        let tokens = lex(source)?;
        let mut parser = Parser {
            source,
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.parse_expr()?;
        if let Some(tok) = parser.peek() {
            return Err(parser.error_at(tok.pos, format!("unexpected {}", tok.kind.describe())));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against `scope`. The expression must produce a boolean.
    pub fn evaluate(&self, scope: &Value) -> Result<bool, ConditionError> {
        let result = eval(&self.expr, scope).map_err(|message| self.eval_error(message))?;
        match result {
            Value::Bool(b) => Ok(b),
            other => Err(self.eval_error(format!(
                "expression produced {} instead of bool",
                other.type_name()
            ))),
        }
    }

    fn eval_error(&self, message: String) -> ConditionError {
        ConditionError::Evaluation {
            expression: self.source.clone(),
            message,
        }
    }
}

/// Decides whether connections are live for a given run context.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Whether `connection` is satisfied. A connection without a condition
    /// always is; an expression that fails to parse or evaluate never is.
    pub fn evaluate(&self, connection: &Connection, scope: &Value) -> bool {
        match self.try_evaluate(connection, scope) {
            Ok(satisfied) => satisfied,
            Err(e) => {
                tracing::warn!(
                    connection = %connection.id,
                    "Condition evaluation error, treating as unsatisfied: {}",
                    e
                );
                false
            }
        }
    }

    pub fn try_evaluate(&self, connection: &Connection, scope: &Value) -> Result<bool, ConditionError> {
        match connection.condition.as_deref() {
            None => Ok(true),
            Some(src) if src.trim().is_empty() => Ok(true),
            Some(src) => Condition::parse(src)?.evaluate(scope),
        }
    }
}

// ---------------------------------------------------------------------------
// Lexer

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Number(f64),
    Str(String),
    Ident(String),
    Dot,
    Comma,
    Minus,
    LParen,
    RParen,
    LBracket,
    RBracket,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Bang,
}

impl TokenKind {
    fn describe(&self) -> String {
        match self {
            TokenKind::Number(n) => format!("number {}", n),
            TokenKind::Str(s) => format!("string {:?}", s),
            TokenKind::Ident(s) => format!("'{}'", s),
            other => format!("{:?}", other),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    pos: usize,
}

const UUID_LEN: usize = 36;

/// Whether a hyphenated UUID starts at `i`, so node ids with a leading
/// digit still lex as one identifier.
fn uuid_at(chars: &[(usize, char)], i: usize) -> bool {
    let Some(window) = chars.get(i..i + UUID_LEN) else {
        return false;
    };
    let shaped = window.iter().enumerate().all(|(n, (_, c))| match n {
        8 | 13 | 18 | 23 => *c == '-',
        _ => c.is_ascii_hexdigit(),
    });
    let bounded = chars
        .get(i + UUID_LEN)
        .map_or(true, |(_, c)| !(c.is_alphanumeric() || *c == '_' || *c == '-'));
    shaped && bounded
}

fn lex(source: &str) -> Result<Vec<Token>, ConditionError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens: Vec<Token> = Vec::new();
    let mut i = 0;

    let err = |pos: usize, message: String| ConditionError::Parse {
        expression: source.to_string(),
        position: pos,
        message,
    };

    while i < chars.len() {
        let (pos, c) = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let after_dot = matches!(tokens.last(), Some(Token { kind: TokenKind::Dot, .. }));
        let single = match c {
            '.' => Some(TokenKind::Dot),
            ',' => Some(TokenKind::Comma),
            '-' => Some(TokenKind::Minus),
            '(' => Some(TokenKind::LParen),
            ')' => Some(TokenKind::RParen),
            '[' => Some(TokenKind::LBracket),
            ']' => Some(TokenKind::RBracket),
            _ => None,
        };
        if let Some(kind) = single {
            tokens.push(Token { kind, pos });
            i += 1;
            continue;
        }

        let next = chars.get(i + 1).map(|(_, c)| *c);
        let double = match (c, next) {
            ('=', Some('=')) => Some(TokenKind::EqEq),
            ('!', Some('=')) => Some(TokenKind::NotEq),
            ('<', Some('=')) => Some(TokenKind::Le),
            ('>', Some('=')) => Some(TokenKind::Ge),
            ('&', Some('&')) => Some(TokenKind::AndAnd),
            ('|', Some('|')) => Some(TokenKind::OrOr),
            _ => None,
        };
        if let Some(kind) = double {
            tokens.push(Token { kind, pos });
            i += 2;
            continue;
        }

        match c {
            '<' => {
                tokens.push(Token { kind: TokenKind::Lt, pos });
                i += 1;
            }
            '>' => {
                tokens.push(Token { kind: TokenKind::Gt, pos });
                i += 1;
            }
            '!' => {
                tokens.push(Token { kind: TokenKind::Bang, pos });
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    let Some(&(_, ch)) = chars.get(i) else {
                        return Err(err(pos, "unterminated string".to_string()));
                    };
                    i += 1;
                    match ch {
                        '\\' => {
                            let Some(&(_, escaped)) = chars.get(i) else {
                                return Err(err(pos, "unterminated string".to_string()));
                            };
                            i += 1;
                            text.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => other,
                            });
                        }
                        ch if ch == quote => break,
                        ch => text.push(ch),
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::Str(text),
                    pos,
                });
            }
            c if c.is_ascii_digit() && !after_dot && uuid_at(&chars, i) => {
                let text: String = chars[i..i + UUID_LEN].iter().map(|(_, c)| c).collect();
                tokens.push(Token {
                    kind: TokenKind::Ident(text),
                    pos,
                });
                i += UUID_LEN;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && chars[i].1.is_ascii_digit() {
                    i += 1;
                }
                // path indices like `items.0.name` never take a fraction
                if !after_dot
                    && i + 1 < chars.len()
                    && chars[i].1 == '.'
                    && chars[i + 1].1.is_ascii_digit()
                {
                    i += 1;
                    while i < chars.len() && chars[i].1.is_ascii_digit() {
                        i += 1;
                    }
                }
                let text: String = chars[start..i].iter().map(|(_, c)| c).collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|e| err(pos, format!("bad number '{}': {}", text, e)))?;
                tokens.push(Token {
                    kind: TokenKind::Number(value),
                    pos,
                });
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_alphanumeric() || chars[i].1 == '_' || chars[i].1 == '-') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().map(|(_, c)| c).collect();
                tokens.push(Token {
                    kind: TokenKind::Ident(text),
                    pos,
                });
            }
            other => return Err(err(pos, format!("unexpected character '{}'", other))),
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> Option<&TokenKind> {
        self.peek().map(|t| &t.kind)
    }

    fn peek_ident(&self, offset: usize) -> Option<&str> {
        match self.tokens.get(self.pos + offset).map(|t| &t.kind) {
            Some(TokenKind::Ident(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn end_pos(&self) -> usize {
        self.source.len()
    }

    fn error_at(&self, position: usize, message: String) -> ConditionError {
        ConditionError::Parse {
            expression: self.source.to_string(),
            position,
            message,
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<(), ConditionError> {
        match self.advance() {
            Some(tok) if tok.kind == kind => Ok(()),
            Some(tok) => Err(self.error_at(
                tok.pos,
                format!("expected {:?}, found {}", kind, tok.kind.describe()),
            )),
            None => Err(self.error_at(self.end_pos(), format!("expected {:?}", kind))),
        }
    }

    fn enter(&mut self) -> Result<(), ConditionError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ConditionError::TooComplex(format!(
                "nesting deeper than {}",
                MAX_DEPTH
            )));
        }
        Ok(())
    }

    fn parse_expr(&mut self) -> Result<Expr, ConditionError> {
        self.enter()?;
        let expr = self.parse_or();
        self.depth -= 1;
        expr
    }

    fn parse_or(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_and()?;
        loop {
            let is_or = matches!(self.peek_kind(), Some(TokenKind::OrOr)) || self.peek_ident(0) == Some("or");
            if !is_or {
                return Ok(left);
            }
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
    }

    fn parse_and(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_not()?;
        loop {
            let is_and =
                matches!(self.peek_kind(), Some(TokenKind::AndAnd)) || self.peek_ident(0) == Some("and");
            if !is_and {
                return Ok(left);
            }
            self.advance();
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
    }

    fn parse_not(&mut self) -> Result<Expr, ConditionError> {
        let is_not = matches!(self.peek_kind(), Some(TokenKind::Bang)) || self.peek_ident(0) == Some("not");
        if is_not {
            self.advance();
            self.enter()?;
            let inner = self.parse_not();
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner?)));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Expr, ConditionError> {
        let left = self.parse_operand()?;

        let op = match self.peek_kind() {
            Some(TokenKind::EqEq) => Some((CmpOp::Eq, 1)),
            Some(TokenKind::NotEq) => Some((CmpOp::Ne, 1)),
            Some(TokenKind::Lt) => Some((CmpOp::Lt, 1)),
            Some(TokenKind::Le) => Some((CmpOp::Le, 1)),
            Some(TokenKind::Gt) => Some((CmpOp::Gt, 1)),
            Some(TokenKind::Ge) => Some((CmpOp::Ge, 1)),
            Some(TokenKind::Ident(word)) => match word.as_str() {
                "in" => Some((CmpOp::In, 1)),
                "contains" => Some((CmpOp::Contains, 1)),
                "not" if self.peek_ident(1) == Some("in") => Some((CmpOp::NotIn, 2)),
                _ => None,
            },
            _ => None,
        };

        let Some((op, width)) = op else {
            return Ok(left);
        };
        self.pos += width;
        let right = self.parse_operand()?;
        Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
    }

    fn parse_operand(&mut self) -> Result<Expr, ConditionError> {
        let Some(tok) = self.advance() else {
            return Err(self.error_at(self.end_pos(), "unexpected end of expression".to_string()));
        };

        match tok.kind {
            TokenKind::Number(n) => Ok(Expr::Literal(Value::Number(n))),
            TokenKind::Minus => match self.advance() {
                Some(Token {
                    kind: TokenKind::Number(n),
                    ..
                }) => Ok(Expr::Literal(Value::Number(-n))),
                _ => Err(self.error_at(tok.pos, "'-' must precede a number".to_string())),
            },
            TokenKind::Str(s) => Ok(Expr::Literal(Value::String(s))),
            TokenKind::LParen => {
                let inner = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            TokenKind::LBracket => {
                self.enter()?;
                let list = self.parse_list();
                self.depth -= 1;
                list
            }
            TokenKind::Ident(word) => match word.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                "and" | "or" | "not" | "in" | "contains" => {
                    Err(self.error_at(tok.pos, format!("unexpected keyword '{}'", word)))
                }
                _ => self.parse_path(word),
            },
            other => Err(self.error_at(tok.pos, format!("unexpected {}", other.describe()))),
        }
    }

    /// Items of a list literal; the opening bracket is already consumed.
    fn parse_list(&mut self) -> Result<Expr, ConditionError> {
        let mut items = Vec::new();
        if matches!(self.peek_kind(), Some(TokenKind::RBracket)) {
            self.advance();
            return Ok(Expr::List(items));
        }
        loop {
            items.push(self.parse_operand()?);
            match self.advance() {
                Some(Token {
                    kind: TokenKind::Comma,
                    ..
                }) => continue,
                Some(Token {
                    kind: TokenKind::RBracket,
                    ..
                }) => break,
                Some(other) => {
                    return Err(self.error_at(
                        other.pos,
                        format!("expected ',' or ']', found {}", other.kind.describe()),
                    ))
                }
                None => return Err(self.error_at(self.end_pos(), "unterminated list".to_string())),
            }
        }
        Ok(Expr::List(items))
    }

    fn parse_path(&mut self, head: String) -> Result<Expr, ConditionError> {
        let mut segments = vec![PathSegment::Key(head)];
        loop {
            match self.peek_kind() {
                Some(TokenKind::Dot) => {
                    self.advance();
                    match self.advance() {
                        Some(Token {
                            kind: TokenKind::Ident(key),
                            ..
                        }) => segments.push(PathSegment::Key(key)),
                        Some(Token {
                            kind: TokenKind::Number(n),
                            pos,
                        }) => segments.push(PathSegment::Index(self.index_from(n, pos)?)),
                        Some(other) => {
                            return Err(self.error_at(
                                other.pos,
                                format!("expected field name, found {}", other.kind.describe()),
                            ))
                        }
                        None => return Err(self.error_at(self.end_pos(), "expected field name".to_string())),
                    }
                }
                Some(TokenKind::LBracket) => {
                    self.advance();
                    match self.advance() {
                        Some(Token {
                            kind: TokenKind::Number(n),
                            pos,
                        }) => segments.push(PathSegment::Index(self.index_from(n, pos)?)),
                        Some(Token {
                            kind: TokenKind::Str(key),
                            ..
                        }) => segments.push(PathSegment::Key(key)),
                        Some(other) => {
                            return Err(self.error_at(
                                other.pos,
                                format!("expected index, found {}", other.kind.describe()),
                            ))
                        }
                        None => return Err(self.error_at(self.end_pos(), "expected index".to_string())),
                    }
                    self.expect(TokenKind::RBracket)?;
                }
                _ => return Ok(Expr::Path(segments)),
            }
        }
    }

    fn index_from(&self, n: f64, pos: usize) -> Result<usize, ConditionError> {
        if n >= 0.0 && n.fract() == 0.0 {
            Ok(n as usize)
        } else {
            Err(self.error_at(pos, format!("invalid index {}", n)))
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation

fn eval(expr: &Expr, scope: &Value) -> Result<Value, String> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Path(path) => Ok(scope.lookup(path).cloned().unwrap_or(Value::Null)),
        Expr::List(items) => items
            .iter()
            .map(|e| eval(e, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Expr::Not(inner) => Ok(Value::Bool(!eval_bool(inner, scope)?)),
        Expr::And(l, r) => Ok(Value::Bool(eval_bool(l, scope)? && eval_bool(r, scope)?)),
        Expr::Or(l, r) => Ok(Value::Bool(eval_bool(l, scope)? || eval_bool(r, scope)?)),
        Expr::Compare(op, l, r) => {
            let left = eval(l, scope)?;
            let right = eval(r, scope)?;
            compare(*op, &left, &right).map(Value::Bool)
        }
    }
}

fn eval_bool(expr: &Expr, scope: &Value) -> Result<bool, String> {
    match eval(expr, scope)? {
        Value::Bool(b) => Ok(b),
        other => Err(format!("expected bool, found {}", other.type_name())),
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, String> {
    match op {
        CmpOp::Eq => Ok(left == right),
        CmpOp::Ne => Ok(left != right),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let ordering = match (left, right) {
                (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            }
            .ok_or_else(|| {
                format!(
                    "cannot order {} against {}",
                    left.type_name(),
                    right.type_name()
                )
            })?;
            Ok(match op {
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Le => ordering.is_le(),
                CmpOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            })
        }
        CmpOp::In => member(left, right),
        CmpOp::NotIn => member(left, right).map(|found| !found),
        CmpOp::Contains => member(right, left),
    }
}

/// Whether `needle` is contained in `haystack`.
fn member(needle: &Value, haystack: &Value) -> Result<bool, String> {
    match (needle, haystack) {
        (_, Value::Array(items)) => Ok(items.contains(needle)),
        (Value::String(n), Value::String(h)) => Ok(h.contains(n.as_str())),
        (Value::String(key), Value::Object(map)) => Ok(map.contains_key(key)),
        _ => Err(format!(
            "cannot test {} membership in {}",
            needle.type_name(),
            haystack.type_name()
        )),
    }
}
