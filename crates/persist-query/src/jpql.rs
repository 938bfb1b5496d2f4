//! JPQL lexer and parser.
//!
//! Supports the subset the query pipeline executes:
//!
//! ```text
//! SELECT [DISTINCT] e | item [AS name], ... FROM Entity [AS] e
//!     [WHERE cond] [GROUP BY path, ...] [ORDER BY item [ASC|DESC], ...]
//! UPDATE Entity [AS] e SET e.attr = expr, ... [WHERE cond]
//! DELETE FROM Entity [AS] e [WHERE cond]
//! ```
//!
//! Attribute paths are returned relative to the identification variable.

use crate::expr::{AggregateFunction, BinaryOp, Expression, OrderItem, Parameter, ReportItem};
use persist_core::{Error, ParseError, Result, Value};
use std::iter::Peekable;
use std::str::CharIndices;

// ============================================================================
// Tokens
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident(String),
    Integer(i64),
    Decimal(f64),
    Str(String),
    Named(String),
    Positional(usize),
    Comma,
    Dot,
    LParen,
    RParen,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Eof,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    pos: usize,
}

fn parse_error(query: &str, position: usize, message: impl Into<String>) -> Error {
    Error::Parse(ParseError {
        message: message.into(),
        query: query.to_string(),
        position,
    })
}

// ============================================================================
// Lexer
// ============================================================================

struct Lexer<'a> {
    source: &'a str,
    chars: Peekable<CharIndices<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().peekable(),
        }
    }

    fn tokenize(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let is_eof = token.kind == TokenKind::Eof;
            tokens.push(token);
            if is_eof {
                break;
            }
        }
        Ok(tokens)
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    fn pos(&mut self) -> usize {
        self.chars.peek().map_or(self.source.len(), |&(i, _)| i)
    }

    fn next_token(&mut self) -> Result<Token> {
        while self.peek_char().is_some_and(char::is_whitespace) {
            self.chars.next();
        }
        let pos = self.pos();
        let Some(c) = self.peek_char() else {
            return Ok(Token {
                kind: TokenKind::Eof,
                pos,
            });
        };

        let single = |kind: TokenKind| -> Result<Token> { Ok(Token { kind, pos }) };
        let kind = match c {
            ',' => TokenKind::Comma,
            '.' => TokenKind::Dot,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '+' => TokenKind::Plus,
            '-' => TokenKind::Minus,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '=' => TokenKind::Eq,
            '<' => {
                self.chars.next();
                return match self.peek_char() {
                    Some('=') => {
                        self.chars.next();
                        single(TokenKind::Le)
                    }
                    Some('>') => {
                        self.chars.next();
                        single(TokenKind::Ne)
                    }
                    _ => single(TokenKind::Lt),
                };
            }
            '>' => {
                self.chars.next();
                return if self.peek_char() == Some('=') {
                    self.chars.next();
                    single(TokenKind::Ge)
                } else {
                    single(TokenKind::Gt)
                };
            }
            '!' => {
                self.chars.next();
                if self.peek_char() == Some('=') {
                    self.chars.next();
                    return single(TokenKind::Ne);
                }
                return Err(parse_error(self.source, pos, "unexpected character '!'"));
            }
            '\'' => return self.scan_string(pos),
            ':' => {
                self.chars.next();
                let name = self.scan_word();
                if name.is_empty() {
                    return Err(parse_error(self.source, pos, "expected parameter name after ':'"));
                }
                return single(TokenKind::Named(name));
            }
            '?' => {
                self.chars.next();
                let digits = self.scan_digits();
                let index = digits
                    .parse::<usize>()
                    .ok()
                    .filter(|i| *i > 0)
                    .ok_or_else(|| parse_error(self.source, pos, "expected parameter index after '?'"))?;
                return single(TokenKind::Positional(index));
            }
            c if c.is_ascii_digit() => return self.scan_number(pos),
            c if c.is_alphabetic() || c == '_' => {
                let word = self.scan_word();
                return single(TokenKind::Ident(word));
            }
            c => {
                return Err(parse_error(
                    self.source,
                    pos,
                    format!("unexpected character '{}'", c),
                ));
            }
        };
        self.chars.next();
        single(kind)
    }

    fn scan_word(&mut self) -> String {
        let mut word = String::new();
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' {
                word.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        word
    }

    fn scan_digits(&mut self) -> String {
        let mut digits = String::new();
        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() {
                digits.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        digits
    }

    fn scan_number(&mut self, pos: usize) -> Result<Token> {
        let mut text = self.scan_digits();
        let mut is_decimal = false;
        if self.peek_char() == Some('.') {
            // Lookahead: "1.5" is a decimal; "e.name" never reaches here.
            let mut ahead = self.chars.clone();
            ahead.next();
            if ahead.peek().is_some_and(|&(_, c)| c.is_ascii_digit()) {
                self.chars.next();
                text.push('.');
                text.push_str(&self.scan_digits());
                is_decimal = true;
            }
        }
        let kind = if is_decimal {
            text.parse::<f64>()
                .map(TokenKind::Decimal)
                .map_err(|e| parse_error(self.source, pos, e.to_string()))?
        } else {
            text.parse::<i64>()
                .map(TokenKind::Integer)
                .map_err(|e| parse_error(self.source, pos, e.to_string()))?
        };
        Ok(Token { kind, pos })
    }

    fn scan_string(&mut self, pos: usize) -> Result<Token> {
        self.chars.next();
        let mut value = String::new();
        loop {
            match self.chars.next() {
                Some((_, '\'')) => {
                    if self.peek_char() == Some('\'') {
                        self.chars.next();
                        value.push('\'');
                    } else {
                        return Ok(Token {
                            kind: TokenKind::Str(value),
                            pos,
                        });
                    }
                }
                Some((_, c)) => value.push(c),
                None => return Err(parse_error(self.source, pos, "unterminated string literal")),
            }
        }
    }
}

// ============================================================================
// Parsed statement
// ============================================================================

/// Statement kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JpqlStatementKind {
    Select,
    Update,
    Delete,
}

/// A parsed select-list entry.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    /// The identification variable itself: an object query.
    Entity,
    Item(ReportItem),
}

/// A parsed JPQL statement, paths relative to `alias`.
#[derive(Debug, Clone, PartialEq)]
pub struct JpqlStatement {
    pub kind: JpqlStatementKind,
    pub entity: String,
    pub alias: String,
    pub distinct: bool,
    pub select: Vec<SelectItem>,
    pub selection: Option<Expression>,
    pub group_by: Vec<Expression>,
    pub order_by: Vec<OrderItem>,
    pub assignments: Vec<(Vec<String>, Expression)>,
    /// Argument names, in first-use order.
    pub parameters: Vec<String>,
}

impl JpqlStatement {
    /// True for `SELECT e FROM ...` without report items.
    pub fn selects_entity(&self) -> bool {
        self.kind == JpqlStatementKind::Select
            && self.select.iter().all(|s| matches!(s, SelectItem::Entity))
    }
}

/// Parse a JPQL statement.
pub fn parse(text: &str) -> Result<JpqlStatement> {
    let tokens = Lexer::new(text).tokenize()?;
    let mut parser = Parser {
        text,
        tokens,
        idx: 0,
    };
    let statement = parser.statement()?;
    tracing::trace!(
        entity = %statement.entity,
        kind = ?statement.kind,
        parameters = statement.parameters.len(),
        "Parsed JPQL"
    );
    Ok(statement)
}

// ============================================================================
// Parser
// ============================================================================

/// Raw select item before the alias is known.
struct RawItem {
    expr: Expression,
    name: Option<String>,
}

struct Parser<'a> {
    text: &'a str,
    tokens: Vec<Token>,
    idx: usize,
}

impl Parser<'_> {
    fn peek(&self) -> &TokenKind {
        self.tokens
            .get(self.idx)
            .map_or(&TokenKind::Eof, |t| &t.kind)
    }

    fn peek_at(&self, offset: usize) -> &TokenKind {
        self.tokens
            .get(self.idx + offset)
            .map_or(&TokenKind::Eof, |t| &t.kind)
    }

    fn pos(&self) -> usize {
        self.tokens
            .get(self.idx)
            .map_or(self.text.len(), |t| t.pos)
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.peek().clone();
        if self.idx < self.tokens.len() {
            self.idx += 1;
        }
        kind
    }

    fn error(&self, message: impl Into<String>) -> Error {
        parse_error(self.text, self.pos(), message)
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), TokenKind::Ident(w) if w.eq_ignore_ascii_case(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.is_keyword(keyword) {
            self.idx += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.error(format!("expected {}", keyword)))
        }
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek() == kind {
            self.idx += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<()> {
        if self.eat(kind) {
            Ok(())
        } else {
            Err(self.error(format!("expected {}", what)))
        }
    }

    fn identifier(&mut self, what: &str) -> Result<String> {
        match self.peek().clone() {
            TokenKind::Ident(w) if !is_reserved(&w) => {
                self.idx += 1;
                Ok(w)
            }
            _ => Err(self.error(format!("expected {}", what))),
        }
    }

    fn statement(&mut self) -> Result<JpqlStatement> {
        let statement = if self.eat_keyword("SELECT") {
            self.select()?
        } else if self.eat_keyword("UPDATE") {
            self.update()?
        } else if self.eat_keyword("DELETE") {
            self.delete()?
        } else {
            return Err(self.error("expected SELECT, UPDATE or DELETE"));
        };
        if *self.peek() != TokenKind::Eof {
            return Err(self.error("unexpected trailing input"));
        }
        Ok(statement)
    }

    fn range_declaration(&mut self) -> Result<(String, String)> {
        let entity = self.identifier("entity name")?;
        self.eat_keyword("AS");
        let alias = self.identifier("identification variable")?;
        Ok((entity, alias))
    }

    fn select(&mut self) -> Result<JpqlStatement> {
        let distinct = self.eat_keyword("DISTINCT");
        let mut raw_items = vec![self.select_item()?];
        while self.eat(&TokenKind::Comma) {
            raw_items.push(self.select_item()?);
        }
        self.expect_keyword("FROM")?;
        let (entity, alias) = self.range_declaration()?;

        let selection = self.where_clause()?;
        let mut group_by = Vec::new();
        if self.eat_keyword("GROUP") {
            self.expect_keyword("BY")?;
            loop {
                group_by.push(self.additive()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        let mut order_by = Vec::new();
        if self.eat_keyword("ORDER") {
            self.expect_keyword("BY")?;
            loop {
                let expr = self.additive()?;
                let descending = if self.eat_keyword("DESC") {
                    true
                } else {
                    self.eat_keyword("ASC");
                    false
                };
                order_by.push(OrderItem { expr, descending });
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }

        let mut select = Vec::with_capacity(raw_items.len());
        for raw in raw_items {
            if matches!(&raw.expr, Expression::Attribute(p) if p.len() == 1 && p[0] == alias) {
                select.push(SelectItem::Entity);
                continue;
            }
            let name = raw.name.unwrap_or_else(|| default_item_name(&raw.expr, &alias));
            let expr = self.relativize(raw.expr, &alias)?;
            select.push(SelectItem::Item(ReportItem { name, expr }));
        }
        if select.iter().any(|s| matches!(s, SelectItem::Entity)) && select.len() > 1 {
            return Err(parse_error(
                self.text,
                0,
                "an entity select cannot be combined with report items",
            ));
        }

        let selection = selection
            .map(|s| self.relativize(s, &alias))
            .transpose()?;
        let group_by = group_by
            .into_iter()
            .map(|g| self.relativize(g, &alias))
            .collect::<Result<Vec<_>>>()?;
        let order_by = order_by
            .into_iter()
            .map(|o| {
                Ok(OrderItem {
                    expr: self.relativize(o.expr, &alias)?,
                    descending: o.descending,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut parameters = Vec::new();
        for item in &select {
            if let SelectItem::Item(i) = item {
                i.expr.collect_parameters(&mut parameters);
            }
        }
        if let Some(s) = &selection {
            s.collect_parameters(&mut parameters);
        }

        Ok(JpqlStatement {
            kind: JpqlStatementKind::Select,
            entity,
            alias,
            distinct,
            select,
            selection,
            group_by,
            order_by,
            assignments: Vec::new(),
            parameters,
        })
    }

    fn select_item(&mut self) -> Result<RawItem> {
        let expr = self.additive()?;
        let name = if self.eat_keyword("AS") {
            Some(self.identifier("result variable")?)
        } else {
            None
        };
        Ok(RawItem { expr, name })
    }

    fn update(&mut self) -> Result<JpqlStatement> {
        let (entity, alias) = self.range_declaration()?;
        self.expect_keyword("SET")?;
        let mut raw_assignments = Vec::new();
        loop {
            let target = self.path()?;
            self.expect(&TokenKind::Eq, "'='")?;
            let value = self.additive()?;
            raw_assignments.push((target, value));
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        let selection = self.where_clause()?;

        let mut assignments = Vec::with_capacity(raw_assignments.len());
        let mut parameters = Vec::new();
        for (target, value) in raw_assignments {
            let Expression::Attribute(path) = self.relativize(target, &alias)? else {
                return Err(parse_error(self.text, 0, "SET target must be an attribute path"));
            };
            let value = self.relativize(value, &alias)?;
            value.collect_parameters(&mut parameters);
            assignments.push((path, value));
        }
        let selection = selection
            .map(|s| self.relativize(s, &alias))
            .transpose()?;
        if let Some(s) = &selection {
            s.collect_parameters(&mut parameters);
        }

        Ok(JpqlStatement {
            kind: JpqlStatementKind::Update,
            entity,
            alias,
            distinct: false,
            select: Vec::new(),
            selection,
            group_by: Vec::new(),
            order_by: Vec::new(),
            assignments,
            parameters,
        })
    }

    fn delete(&mut self) -> Result<JpqlStatement> {
        self.expect_keyword("FROM")?;
        let (entity, alias) = self.range_declaration()?;
        let selection = self
            .where_clause()?
            .map(|s| self.relativize(s, &alias))
            .transpose()?;
        let mut parameters = Vec::new();
        if let Some(s) = &selection {
            s.collect_parameters(&mut parameters);
        }
        Ok(JpqlStatement {
            kind: JpqlStatementKind::Delete,
            entity,
            alias,
            distinct: false,
            select: Vec::new(),
            selection,
            group_by: Vec::new(),
            order_by: Vec::new(),
            assignments: Vec::new(),
            parameters,
        })
    }

    fn where_clause(&mut self) -> Result<Option<Expression>> {
        if self.eat_keyword("WHERE") {
            Ok(Some(self.or_expr()?))
        } else {
            Ok(None)
        }
    }

    // ------------------------------------------------------------------------
    // Conditions
    // ------------------------------------------------------------------------

    fn or_expr(&mut self) -> Result<Expression> {
        let mut left = self.and_expr()?;
        while self.eat_keyword("OR") {
            let right = self.and_expr()?;
            left = left.or(right);
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expression> {
        let mut left = self.not_expr()?;
        while self.eat_keyword("AND") {
            let right = self.not_expr()?;
            left = left.and(right);
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expression> {
        if self.eat_keyword("NOT") {
            return Ok(self.not_expr()?.not());
        }
        self.predicate()
    }

    fn predicate(&mut self) -> Result<Expression> {
        let left = self.additive()?;

        let op = match self.peek() {
            TokenKind::Eq => Some(BinaryOp::Eq),
            TokenKind::Ne => Some(BinaryOp::Ne),
            TokenKind::Lt => Some(BinaryOp::Lt),
            TokenKind::Le => Some(BinaryOp::Le),
            TokenKind::Gt => Some(BinaryOp::Gt),
            TokenKind::Ge => Some(BinaryOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let right = self.additive()?;
            return Ok(Expression::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            });
        }

        if self.eat_keyword("IS") {
            let negated = self.eat_keyword("NOT");
            self.expect_keyword("NULL")?;
            return Ok(Expression::IsNull {
                expr: Box::new(left),
                negated,
            });
        }

        let negated = if self.is_keyword("NOT")
            && matches!(self.peek_at(1), TokenKind::Ident(w)
                if ["LIKE", "IN", "BETWEEN"].iter().any(|k| w.eq_ignore_ascii_case(k)))
        {
            self.idx += 1;
            true
        } else {
            false
        };

        if self.eat_keyword("LIKE") {
            let pattern = self.additive()?;
            return Ok(Expression::Like {
                expr: Box::new(left),
                pattern: Box::new(pattern),
                negated,
            });
        }
        if self.eat_keyword("IN") {
            self.expect(&TokenKind::LParen, "'('")?;
            let mut values = vec![self.additive()?];
            while self.eat(&TokenKind::Comma) {
                values.push(self.additive()?);
            }
            self.expect(&TokenKind::RParen, "')'")?;
            return Ok(Expression::In {
                expr: Box::new(left),
                values,
                negated,
            });
        }
        if self.eat_keyword("BETWEEN") {
            let low = self.additive()?;
            self.expect_keyword("AND")?;
            let high = self.additive()?;
            return Ok(Expression::Between {
                expr: Box::new(left),
                low: Box::new(low),
                high: Box::new(high),
                negated,
            });
        }
        if negated {
            return Err(self.error("expected LIKE, IN or BETWEEN after NOT"));
        }
        Ok(left)
    }

    // ------------------------------------------------------------------------
    // Scalar expressions
    // ------------------------------------------------------------------------

    fn additive(&mut self) -> Result<Expression> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.multiplicative()?;
            left = Expression::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
    }

    fn multiplicative(&mut self) -> Result<Expression> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.unary()?;
            left = Expression::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
    }

    fn unary(&mut self) -> Result<Expression> {
        if self.eat(&TokenKind::Minus) {
            return Ok(match self.unary()? {
                Expression::Literal(Value::BigInt(v)) => Expression::Literal(Value::BigInt(-v)),
                Expression::Literal(Value::Double(v)) => Expression::Literal(Value::Double(-v)),
                other => Expression::Binary {
                    left: Box::new(Expression::Literal(Value::BigInt(0))),
                    op: BinaryOp::Sub,
                    right: Box::new(other),
                },
            });
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expression> {
        match self.peek().clone() {
            TokenKind::Integer(v) => {
                self.advance();
                Ok(Expression::Literal(Value::BigInt(v)))
            }
            TokenKind::Decimal(v) => {
                self.advance();
                Ok(Expression::Literal(Value::Double(v)))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(Expression::Literal(Value::Text(s)))
            }
            TokenKind::Named(n) => {
                self.advance();
                Ok(Expression::Parameter(Parameter::Named(n)))
            }
            TokenKind::Positional(i) => {
                self.advance();
                Ok(Expression::Parameter(Parameter::Positional(i)))
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.or_expr()?;
                self.expect(&TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::Ident(w) => {
                if w.eq_ignore_ascii_case("TRUE") {
                    self.advance();
                    return Ok(Expression::Literal(Value::Bool(true)));
                }
                if w.eq_ignore_ascii_case("FALSE") {
                    self.advance();
                    return Ok(Expression::Literal(Value::Bool(false)));
                }
                if w.eq_ignore_ascii_case("NULL") {
                    self.advance();
                    return Ok(Expression::Literal(Value::Null));
                }
                if let Some(function) = aggregate_function(&w) {
                    if *self.peek_at(1) == TokenKind::LParen {
                        self.idx += 2;
                        let distinct = self.eat_keyword("DISTINCT");
                        let arg = self.path()?;
                        self.expect(&TokenKind::RParen, "')'")?;
                        return Ok(Expression::Aggregate {
                            function,
                            arg: Some(Box::new(arg)),
                            distinct,
                        });
                    }
                }
                self.path()
            }
            _ => Err(self.error("expected an expression")),
        }
    }

    /// `alias` or `alias.attr.attr`, kept absolute until `relativize`.
    fn path(&mut self) -> Result<Expression> {
        let mut segments = vec![self.identifier("path")?];
        while self.eat(&TokenKind::Dot) {
            match self.advance() {
                TokenKind::Ident(w) => segments.push(w),
                _ => return Err(self.error("expected attribute name after '.'")),
            }
        }
        Ok(Expression::Attribute(segments))
    }

    /// Strip the identification variable from every path.
    fn relativize(&self, expr: Expression, alias: &str) -> Result<Expression> {
        let rel = |e: Box<Expression>| self.relativize(*e, alias).map(Box::new);
        Ok(match expr {
            Expression::Attribute(mut path) => {
                if path.first().map(String::as_str) != Some(alias) {
                    return Err(parse_error(
                        self.text,
                        0,
                        format!(
                            "'{}' does not start with identification variable '{}'",
                            path.join("."),
                            alias
                        ),
                    ));
                }
                path.remove(0);
                if path.is_empty() {
                    return Err(parse_error(
                        self.text,
                        0,
                        format!("'{}' cannot be used as a value here", alias),
                    ));
                }
                Expression::Attribute(path)
            }
            Expression::Aggregate {
                function,
                arg,
                distinct,
            } => {
                let arg = match arg {
                    Some(a) if matches!(a.as_ref(), Expression::Attribute(p) if p.len() == 1 && p[0] == alias) => {
                        None
                    }
                    Some(a) => Some(rel(a)?),
                    None => None,
                };
                Expression::Aggregate {
                    function,
                    arg,
                    distinct,
                }
            }
            Expression::Binary { left, op, right } => Expression::Binary {
                left: rel(left)?,
                op,
                right: rel(right)?,
            },
            Expression::Not(e) => Expression::Not(rel(e)?),
            Expression::Like {
                expr,
                pattern,
                negated,
            } => Expression::Like {
                expr: rel(expr)?,
                pattern: rel(pattern)?,
                negated,
            },
            Expression::In {
                expr,
                values,
                negated,
            } => Expression::In {
                expr: rel(expr)?,
                values: values
                    .into_iter()
                    .map(|v| self.relativize(v, alias))
                    .collect::<Result<Vec<_>>>()?,
                negated,
            },
            Expression::IsNull { expr, negated } => Expression::IsNull {
                expr: rel(expr)?,
                negated,
            },
            Expression::Between {
                expr,
                low,
                high,
                negated,
            } => Expression::Between {
                expr: rel(expr)?,
                low: rel(low)?,
                high: rel(high)?,
                negated,
            },
            e @ (Expression::Literal(_) | Expression::Parameter(_)) => e,
        })
    }
}

const RESERVED: &[&str] = &[
    "SELECT", "FROM", "WHERE", "AND", "OR", "NOT", "LIKE", "IN", "IS", "NULL", "BETWEEN",
    "DISTINCT", "ORDER", "GROUP", "BY", "ASC", "DESC", "UPDATE", "SET", "DELETE", "AS", "TRUE",
    "FALSE",
];

fn is_reserved(word: &str) -> bool {
    RESERVED.iter().any(|k| word.eq_ignore_ascii_case(k))
}

fn aggregate_function(word: &str) -> Option<AggregateFunction> {
    match word.to_ascii_uppercase().as_str() {
        "COUNT" => Some(AggregateFunction::Count),
        "SUM" => Some(AggregateFunction::Sum),
        "AVG" => Some(AggregateFunction::Avg),
        "MIN" => Some(AggregateFunction::Min),
        "MAX" => Some(AggregateFunction::Max),
        _ => None,
    }
}

fn default_item_name(expr: &Expression, alias: &str) -> String {
    let strip = |p: &[String]| -> String {
        match p.split_first() {
            Some((head, rest)) if head == alias && !rest.is_empty() => rest.join("."),
            _ => p.join("."),
        }
    };
    match expr {
        Expression::Attribute(p) => strip(p),
        Expression::Aggregate { function, arg, .. } => match arg.as_deref() {
            Some(Expression::Attribute(p)) if !(p.len() == 1 && p[0] == alias) => {
                format!("{}_{}", function.as_str().to_ascii_lowercase(), strip(p))
            }
            _ => function.as_str().to_ascii_lowercase(),
        },
        _ => "value".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_entity_select() {
        let s = parse(
            "SELECT e FROM Employee e WHERE e.name = :name AND e.salary > ?1 ORDER BY e.name DESC",
        )
        .unwrap();
        assert_eq!(s.kind, JpqlStatementKind::Select);
        assert!(s.selects_entity());
        assert_eq!(s.entity, "Employee");
        assert_eq!(s.alias, "e");
        assert_eq!(s.parameters, vec!["name", "1"]);
        assert_eq!(
            s.selection,
            Some(
                Expression::attr("name")
                    .equal(Expression::param("name"))
                    .and(
                        Expression::attr("salary")
                            .greater_than(Expression::Parameter(Parameter::Positional(1)))
                    )
            )
        );
        assert_eq!(s.order_by, vec![OrderItem::desc(Expression::attr("name"))]);
    }

    #[test]
    fn parses_report_items_and_grouping() {
        let s = parse(
            "select e.department.id, count(e), avg(e.salary) as pay from Employee as e group by e.department.id",
        )
        .unwrap();
        assert!(!s.selects_entity());
        let names: Vec<_> = s
            .select
            .iter()
            .map(|i| match i {
                SelectItem::Item(r) => r.name.clone(),
                SelectItem::Entity => "e".to_string(),
            })
            .collect();
        assert_eq!(names, vec!["department.id", "count", "pay"]);
        assert_eq!(s.group_by, vec![Expression::path("department.id")]);
        match &s.select[1] {
            SelectItem::Item(r) => assert_eq!(
                r.expr,
                Expression::aggregate(AggregateFunction::Count, None)
            ),
            SelectItem::Entity => panic!("expected report item"),
        }
    }

    #[test]
    fn parses_predicates() {
        let s = parse(
            "SELECT e FROM Employee e WHERE e.name NOT LIKE 'A%' OR e.id IN (1, 2, -3) \
             OR e.manager IS NOT NULL OR e.salary NOT BETWEEN 1.5 AND 10 OR NOT (e.id = 4)",
        )
        .unwrap();
        let mut params = Vec::new();
        s.selection.as_ref().unwrap().collect_parameters(&mut params);
        assert!(params.is_empty());
        let Some(Expression::Binary { right, .. }) = &s.selection else {
            panic!("expected OR chain");
        };
        assert_eq!(
            **right,
            Expression::attr("id").equal(4_i64).not()
        );
    }

    #[test]
    fn parses_update_and_delete() {
        let u = parse("UPDATE Employee e SET e.salary = e.salary * 2, e.name = :n WHERE e.id = :id")
            .unwrap();
        assert_eq!(u.kind, JpqlStatementKind::Update);
        assert_eq!(u.assignments.len(), 2);
        assert_eq!(u.assignments[0].0, vec!["salary".to_string()]);
        assert_eq!(u.parameters, vec!["n", "id"]);

        let d = parse("DELETE FROM Employee e WHERE e.id = 1").unwrap();
        assert_eq!(d.kind, JpqlStatementKind::Delete);
        assert!(d.selection.is_some());
    }

    #[test]
    fn string_literals_unescape_quotes() {
        let s = parse("SELECT e FROM Employee e WHERE e.name = 'O''Brien'").unwrap();
        assert_eq!(
            s.selection,
            Some(Expression::attr("name").equal("O'Brien"))
        );
    }

    #[test]
    fn errors_carry_positions() {
        let err = parse("SELECT e FROM Employee e WHERE e.name = ").unwrap_err();
        match err {
            Error::Parse(p) => assert_eq!(p.position, 40),
            other => panic!("unexpected error {other}"),
        }
        assert!(matches!(parse("SELECT e FROM Employee x"), Err(Error::Parse(_))));
        assert!(matches!(parse("FROM Employee e"), Err(Error::Parse(_))));
        assert!(matches!(
            parse("SELECT e FROM Employee e WHERE e.name = 'open"),
            Err(Error::Parse(_))
        ));
        assert!(matches!(
            parse("SELECT e FROM Employee e WHERE x.name = 1"),
            Err(Error::Parse(_))
        ));
    }
}
