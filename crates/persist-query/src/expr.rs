//! Selection-criteria expressions.
//!
//! An [`Expression`] is written against attribute paths of the reference
//! entity, not columns. It is translated to SQL through a [`SqlContext`] at
//! prepare time, and can also be evaluated in memory against an [`Entity`]
//! for conforming and cache lookups.

use crate::call::{ParameterSource, TranslationRow};
use persist_core::{
    AttributeType, ClassDescriptor, Dialect, Entity, Error, Mapping, PrimaryKey, Project, Result,
    Value,
};
use regex::Regex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

/// A query parameter reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Parameter {
    /// `:name`
    Named(String),
    /// `?1`
    Positional(usize),
}

impl Parameter {
    /// Name of the query argument this parameter reads.
    pub fn argument_name(&self) -> String {
        match self {
            Parameter::Named(n) => n.clone(),
            Parameter::Positional(i) => i.to_string(),
        }
    }
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
        }
    }

    pub const fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }
}

/// Report aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunction {
    pub const fn as_str(self) -> &'static str {
        match self {
            AggregateFunction::Count => "COUNT",
            AggregateFunction::Sum => "SUM",
            AggregateFunction::Avg => "AVG",
            AggregateFunction::Min => "MIN",
            AggregateFunction::Max => "MAX",
        }
    }
}

/// An expression over the attributes of the reference entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// Attribute path relative to the reference entity, e.g. `["period", "start"]`.
    Attribute(Vec<String>),
    Literal(Value),
    Parameter(Parameter),
    Binary {
        left: Box<Expression>,
        op: BinaryOp,
        right: Box<Expression>,
    },
    Not(Box<Expression>),
    Like {
        expr: Box<Expression>,
        pattern: Box<Expression>,
        negated: bool,
    },
    In {
        expr: Box<Expression>,
        values: Vec<Expression>,
        negated: bool,
    },
    IsNull {
        expr: Box<Expression>,
        negated: bool,
    },
    Between {
        expr: Box<Expression>,
        low: Box<Expression>,
        high: Box<Expression>,
        negated: bool,
    },
    /// `arg` of `None` is `COUNT(*)` over the reference entity.
    Aggregate {
        function: AggregateFunction,
        arg: Option<Box<Expression>>,
        distinct: bool,
    },
}

/// One ORDER BY item.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderItem {
    pub expr: Expression,
    pub descending: bool,
}

impl OrderItem {
    pub fn asc(expr: Expression) -> Self {
        Self {
            expr,
            descending: false,
        }
    }

    pub fn desc(expr: Expression) -> Self {
        Self {
            expr,
            descending: true,
        }
    }
}

/// One column of a report query.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportItem {
    pub name: String,
    pub expr: Expression,
}

impl ReportItem {
    pub fn new(name: impl Into<String>, expr: Expression) -> Self {
        Self {
            name: name.into(),
            expr,
        }
    }
}

// ============================================================================
// Construction
// ============================================================================

impl Expression {
    /// A top-level attribute.
    pub fn attr(name: impl Into<String>) -> Self {
        Expression::Attribute(vec![name.into()])
    }

    /// A dotted attribute path such as `period.start`.
    pub fn path(path: &str) -> Self {
        Expression::Attribute(path.split('.').map(str::to_string).collect())
    }

    pub fn lit(value: impl Into<Value>) -> Self {
        Expression::Literal(value.into())
    }

    pub fn param(name: impl Into<String>) -> Self {
        Expression::Parameter(Parameter::Named(name.into()))
    }

    fn binary(self, op: BinaryOp, other: Expression) -> Self {
        Expression::Binary {
            left: Box::new(self),
            op,
            right: Box::new(other),
        }
    }

    pub fn equal(self, other: impl Into<Expression>) -> Self {
        self.binary(BinaryOp::Eq, other.into())
    }

    pub fn not_equal(self, other: impl Into<Expression>) -> Self {
        self.binary(BinaryOp::Ne, other.into())
    }

    pub fn less_than(self, other: impl Into<Expression>) -> Self {
        self.binary(BinaryOp::Lt, other.into())
    }

    pub fn less_than_equal(self, other: impl Into<Expression>) -> Self {
        self.binary(BinaryOp::Le, other.into())
    }

    pub fn greater_than(self, other: impl Into<Expression>) -> Self {
        self.binary(BinaryOp::Gt, other.into())
    }

    pub fn greater_than_equal(self, other: impl Into<Expression>) -> Self {
        self.binary(BinaryOp::Ge, other.into())
    }

    pub fn and(self, other: Expression) -> Self {
        self.binary(BinaryOp::And, other)
    }

    pub fn or(self, other: Expression) -> Self {
        self.binary(BinaryOp::Or, other)
    }

    pub fn not(self) -> Self {
        Expression::Not(Box::new(self))
    }

    pub fn like(self, pattern: impl Into<Expression>) -> Self {
        Expression::Like {
            expr: Box::new(self),
            pattern: Box::new(pattern.into()),
            negated: false,
        }
    }

    pub fn in_list(self, values: Vec<Expression>) -> Self {
        Expression::In {
            expr: Box::new(self),
            values,
            negated: false,
        }
    }

    pub fn is_null(self) -> Self {
        Expression::IsNull {
            expr: Box::new(self),
            negated: false,
        }
    }

    pub fn is_not_null(self) -> Self {
        Expression::IsNull {
            expr: Box::new(self),
            negated: true,
        }
    }

    pub fn between(self, low: impl Into<Expression>, high: impl Into<Expression>) -> Self {
        Expression::Between {
            expr: Box::new(self),
            low: Box::new(low.into()),
            high: Box::new(high.into()),
            negated: false,
        }
    }

    pub fn aggregate(function: AggregateFunction, arg: Option<Expression>) -> Self {
        Expression::Aggregate {
            function,
            arg: arg.map(Box::new),
            distinct: false,
        }
    }

    /// Argument names referenced by this expression, in first-use order.
    pub fn collect_parameters(&self, out: &mut Vec<String>) {
        match self {
            Expression::Parameter(p) => {
                let name = p.argument_name();
                if !out.contains(&name) {
                    out.push(name);
                }
            }
            Expression::Attribute(_) | Expression::Literal(_) => {}
            Expression::Binary { left, right, .. } => {
                left.collect_parameters(out);
                right.collect_parameters(out);
            }
            Expression::Not(e) | Expression::IsNull { expr: e, .. } => e.collect_parameters(out),
            Expression::Like { expr, pattern, .. } => {
                expr.collect_parameters(out);
                pattern.collect_parameters(out);
            }
            Expression::In { expr, values, .. } => {
                expr.collect_parameters(out);
                for v in values {
                    v.collect_parameters(out);
                }
            }
            Expression::Between {
                expr, low, high, ..
            } => {
                expr.collect_parameters(out);
                low.collect_parameters(out);
                high.collect_parameters(out);
            }
            Expression::Aggregate { arg, .. } => {
                if let Some(a) = arg {
                    a.collect_parameters(out);
                }
            }
        }
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, Expression::Aggregate { .. })
    }
}

impl From<Value> for Expression {
    fn from(value: Value) -> Self {
        Expression::Literal(value)
    }
}

impl From<i64> for Expression {
    fn from(value: i64) -> Self {
        Expression::Literal(Value::BigInt(value))
    }
}

impl From<&str> for Expression {
    fn from(value: &str) -> Self {
        Expression::Literal(Value::Text(value.to_string()))
    }
}

// ============================================================================
// Path resolution
// ============================================================================

/// The column an attribute path maps onto, plus its declared type.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedColumn {
    pub column: String,
    pub attribute_type: Option<AttributeType>,
}

/// Resolve an attribute path to a column of `desc`'s table.
///
/// `reference` and `reference.<key>` both resolve to the foreign-key column;
/// embedded paths resolve through the embeddable.
pub fn resolve_column(
    project: &Project,
    desc: &ClassDescriptor,
    path: &[String],
) -> Result<ResolvedColumn> {
    let unknown = || {
        Error::illegal_argument(format!(
            "'{}' is not a mapped path of '{}'",
            path.join("."),
            desc.entity_name()
        ))
    };
    let (head, rest) = path.split_first().ok_or_else(unknown)?;
    match desc.mapping(head).ok_or_else(unknown)? {
        Mapping::Direct {
            column,
            attribute_type,
            ..
        } if rest.is_empty() => Ok(ResolvedColumn {
            column: column.clone(),
            attribute_type: Some(*attribute_type),
        }),
        Mapping::Reference {
            target,
            foreign_key,
            ..
        } => {
            let target_desc = project.require(target)?;
            let key_attr = target_desc.primary_key().first().ok_or_else(unknown)?;
            match rest {
                [] => {}
                [attr] if attr == key_attr => {}
                _ => return Err(unknown()),
            }
            Ok(ResolvedColumn {
                column: foreign_key.clone(),
                attribute_type: target_desc.attribute_type(key_attr),
            })
        }
        Mapping::Embedded { embeddable, .. } if !rest.is_empty() => {
            resolve_column(project, project.require(embeddable)?, rest)
        }
        _ => Err(unknown()),
    }
}

// ============================================================================
// SQL generation
// ============================================================================

/// State threaded through SQL generation for one statement.
pub struct SqlContext<'a> {
    project: &'a Project,
    descriptor: Option<&'a ClassDescriptor>,
    dialect: Dialect,
    qualifier: Option<String>,
    bind_literals: bool,
    parameters: Vec<ParameterSource>,
}

impl<'a> SqlContext<'a> {
    /// `descriptor` of `None` treats attribute paths as raw column names.
    pub fn new(
        project: &'a Project,
        descriptor: Option<&'a ClassDescriptor>,
        dialect: Dialect,
    ) -> Self {
        Self {
            project,
            descriptor,
            dialect,
            qualifier: None,
            bind_literals: false,
            parameters: Vec::new(),
        }
    }

    /// Qualify columns with a table alias.
    pub fn qualified(mut self, alias: impl Into<String>) -> Self {
        self.qualifier = Some(alias.into());
        self
    }

    /// Bind literals as parameters instead of inlining them.
    pub fn binding_literals(mut self, bind: bool) -> Self {
        self.bind_literals = bind;
        self
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn parameters(&self) -> &[ParameterSource] {
        &self.parameters
    }

    pub fn into_parameters(self) -> Vec<ParameterSource> {
        self.parameters
    }

    /// Register a parameter and return its placeholder.
    pub fn push(&mut self, source: ParameterSource) -> String {
        self.parameters.push(source);
        self.dialect.placeholder(self.parameters.len())
    }

    /// A quoted, optionally qualified column reference.
    pub fn column(&self, column: &str) -> String {
        let quoted = self.dialect.quote_identifier(column);
        match &self.qualifier {
            Some(q) => format!("{}.{}", q, quoted),
            None => quoted,
        }
    }

    fn attribute_sql(&self, path: &[String]) -> Result<String> {
        match self.descriptor {
            Some(desc) => {
                let resolved = resolve_column(self.project, desc, path)?;
                Ok(self.column(&resolved.column))
            }
            None => Ok(self.column(&path.join("."))),
        }
    }
}

fn inline_literal(value: &Value, dialect: Dialect) -> Option<String> {
    match value {
        Value::Null => Some("NULL".to_string()),
        Value::Bool(b) => Some(match dialect {
            Dialect::Sqlite => if *b { "1" } else { "0" }.to_string(),
            Dialect::Postgres | Dialect::Mysql => if *b { "TRUE" } else { "FALSE" }.to_string(),
        }),
        Value::Int(v) => Some(v.to_string()),
        Value::BigInt(v) => Some(v.to_string()),
        Value::Double(v) if v.is_finite() => Some(format!("{:?}", v)),
        Value::Decimal(s) => Some(s.clone()),
        Value::Text(s) => Some(format!("'{}'", s.replace('\'', "''"))),
        Value::Double(_) | Value::Bytes(_) | Value::Json(_) => None,
    }
}

impl Expression {
    /// Render this expression as SQL, registering parameters on `ctx`.
    pub fn to_sql(&self, ctx: &mut SqlContext<'_>) -> Result<String> {
        match self {
            Expression::Attribute(path) => ctx.attribute_sql(path),
            Expression::Literal(value) => {
                if !ctx.bind_literals && !value.is_null() {
                    if let Some(sql) = inline_literal(value, ctx.dialect) {
                        return Ok(sql);
                    }
                }
                if value.is_null() {
                    return Ok("NULL".to_string());
                }
                Ok(ctx.push(ParameterSource::Literal(value.clone())))
            }
            Expression::Parameter(p) => Ok(ctx.push(ParameterSource::Argument(p.argument_name()))),
            Expression::Binary { left, op, right } => {
                let l = left.to_sql(ctx)?;
                let r = right.to_sql(ctx)?;
                match op {
                    BinaryOp::And
                    | BinaryOp::Or
                    | BinaryOp::Add
                    | BinaryOp::Sub
                    | BinaryOp::Mul
                    | BinaryOp::Div => Ok(format!("({} {} {})", l, op.as_str(), r)),
                    _ => Ok(format!("{} {} {}", l, op.as_str(), r)),
                }
            }
            Expression::Not(e) => Ok(format!("NOT ({})", e.to_sql(ctx)?)),
            Expression::Like {
                expr,
                pattern,
                negated,
            } => {
                let e = expr.to_sql(ctx)?;
                let p = pattern.to_sql(ctx)?;
                let not_str = if *negated { "NOT " } else { "" };
                Ok(format!("{} {}LIKE {}", e, not_str, p))
            }
            Expression::In {
                expr,
                values,
                negated,
            } => {
                let e = expr.to_sql(ctx)?;
                let vs = values
                    .iter()
                    .map(|v| v.to_sql(ctx))
                    .collect::<Result<Vec<_>>>()?;
                let not_str = if *negated { "NOT " } else { "" };
                Ok(format!("{} {}IN ({})", e, not_str, vs.join(", ")))
            }
            Expression::IsNull { expr, negated } => {
                let e = expr.to_sql(ctx)?;
                let not_str = if *negated { " NOT" } else { "" };
                Ok(format!("{} IS{} NULL", e, not_str))
            }
            Expression::Between {
                expr,
                low,
                high,
                negated,
            } => {
                let e = expr.to_sql(ctx)?;
                let lo = low.to_sql(ctx)?;
                let hi = high.to_sql(ctx)?;
                let not_str = if *negated { "NOT " } else { "" };
                Ok(format!("{} {}BETWEEN {} AND {}", e, not_str, lo, hi))
            }
            Expression::Aggregate {
                function,
                arg,
                distinct,
            } => {
                let inner = match arg {
                    Some(a) => a.to_sql(ctx)?,
                    None => "*".to_string(),
                };
                let distinct_str = if *distinct { "DISTINCT " } else { "" };
                Ok(format!("{}({}{})", function.as_str(), distinct_str, inner))
            }
        }
    }
}

// ============================================================================
// In-memory evaluation
// ============================================================================

/// What in-memory evaluation resolves attribute paths and parameters against.
pub struct ConformContext<'a> {
    pub project: &'a Project,
    pub descriptor: &'a ClassDescriptor,
    pub arguments: &'a TranslationRow,
}

impl<'a> ConformContext<'a> {
    pub fn new(
        project: &'a Project,
        descriptor: &'a ClassDescriptor,
        arguments: &'a TranslationRow,
    ) -> Self {
        Self {
            project,
            descriptor,
            arguments,
        }
    }
}

fn path_value(
    project: &Project,
    desc: &ClassDescriptor,
    entity: &Entity,
    path: &[String],
) -> Option<Value> {
    let (head, rest) = path.split_first()?;
    match desc.mapping(head)? {
        Mapping::Direct { .. } if rest.is_empty() => {
            Some(entity.value(head).cloned().unwrap_or(Value::Null))
        }
        Mapping::Reference { target, .. } => {
            let target_desc = project.descriptor(target)?;
            let key_attr = target_desc.primary_key().first()?;
            match rest {
                [] => {}
                [attr] if attr == key_attr => {}
                _ => return None,
            }
            Some(
                entity
                    .reference(head)
                    .and_then(|h| h.key())
                    .cloned()
                    .unwrap_or(Value::Null),
            )
        }
        Mapping::Embedded { embeddable, .. } if !rest.is_empty() => {
            let inner_desc = project.descriptor(embeddable)?;
            match entity.embedded(head) {
                Some(inner) => path_value(project, inner_desc, inner, rest),
                None => Some(Value::Null),
            }
        }
        _ => None,
    }
}

fn arithmetic(op: BinaryOp, l: &Value, r: &Value) -> Option<Value> {
    if l.is_null() || r.is_null() {
        return Some(Value::Null);
    }
    if let (Some(a), Some(b)) = (int_of(l), int_of(r)) {
        let v = match op {
            BinaryOp::Add => a.checked_add(b)?,
            BinaryOp::Sub => a.checked_sub(b)?,
            BinaryOp::Mul => a.checked_mul(b)?,
            BinaryOp::Div => a.checked_div(b)?,
            _ => return None,
        };
        return Some(Value::BigInt(v));
    }
    let (a, b) = (l.as_f64()?, r.as_f64()?);
    let v = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        _ => return None,
    };
    Some(Value::Double(v))
}

fn int_of(v: &Value) -> Option<i64> {
    match v {
        Value::Int(i) => Some(i64::from(*i)),
        Value::BigInt(i) => Some(*i),
        _ => None,
    }
}

fn truth(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Int(_) | Value::BigInt(_) => v.as_i64().map(|i| i != 0),
        _ => None,
    }
}

fn from_truth(t: Option<bool>) -> Value {
    t.map_or(Value::Null, Value::Bool)
}

/// Compiled LIKE patterns, shared process-wide.
fn like_regex(pattern: &str) -> Option<Regex> {
    static CACHE: OnceLock<RwLock<HashMap<String, Regex>>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| RwLock::new(HashMap::new()));
    if let Some(re) = persist_core::sync::read(cache).get(pattern) {
        return Some(re.clone());
    }
    let mut source = String::from("(?s)^");
    for c in pattern.chars() {
        match c {
            '%' => source.push_str(".*"),
            '_' => source.push('.'),
            c => source.push_str(&regex::escape(&c.to_string())),
        }
    }
    source.push('$');
    match Regex::new(&source) {
        Ok(re) => {
            persist_core::sync::write(cache).insert(pattern.to_string(), re.clone());
            Some(re)
        }
        Err(e) => {
            tracing::warn!(pattern = pattern, error = %e, "Unusable LIKE pattern");
            None
        }
    }
}

impl Expression {
    /// Evaluate against an in-memory instance.
    ///
    /// `None` means the expression cannot be evaluated in memory (aggregates,
    /// unresolvable paths, missing arguments). SQL NULL is `Some(Value::Null)`.
    pub fn evaluate(&self, ctx: &ConformContext<'_>, entity: &Entity) -> Option<Value> {
        match self {
            Expression::Attribute(path) => path_value(ctx.project, ctx.descriptor, entity, path),
            Expression::Literal(v) => Some(v.normalized()),
            Expression::Parameter(p) => ctx.arguments.get(&p.argument_name()).cloned(),
            Expression::Binary { left, op, right } => {
                let l = left.evaluate(ctx, entity)?;
                match op {
                    BinaryOp::And => {
                        let lt = truth(&l);
                        if lt == Some(false) {
                            return Some(Value::Bool(false));
                        }
                        let rt = truth(&right.evaluate(ctx, entity)?);
                        Some(match (lt, rt) {
                            (_, Some(false)) => Value::Bool(false),
                            (Some(true), Some(true)) => Value::Bool(true),
                            _ => Value::Null,
                        })
                    }
                    BinaryOp::Or => {
                        let lt = truth(&l);
                        if lt == Some(true) {
                            return Some(Value::Bool(true));
                        }
                        let rt = truth(&right.evaluate(ctx, entity)?);
                        Some(match (lt, rt) {
                            (_, Some(true)) => Value::Bool(true),
                            (Some(false), Some(false)) => Value::Bool(false),
                            _ => Value::Null,
                        })
                    }
                    op if op.is_comparison() => {
                        let r = right.evaluate(ctx, entity)?;
                        let ord = l.compare(&r);
                        Some(from_truth(ord.map(|o| match op {
                            BinaryOp::Eq => o == Ordering::Equal,
                            BinaryOp::Ne => o != Ordering::Equal,
                            BinaryOp::Lt => o == Ordering::Less,
                            BinaryOp::Le => o != Ordering::Greater,
                            BinaryOp::Gt => o == Ordering::Greater,
                            _ => o != Ordering::Less,
                        })))
                    }
                    op => arithmetic(*op, &l, &right.evaluate(ctx, entity)?),
                }
            }
            Expression::Not(e) => {
                let v = e.evaluate(ctx, entity)?;
                Some(from_truth(truth(&v).map(|b| !b)))
            }
            Expression::Like {
                expr,
                pattern,
                negated,
            } => {
                let v = expr.evaluate(ctx, entity)?;
                let p = pattern.evaluate(ctx, entity)?;
                match (v.as_str(), p.as_str()) {
                    (Some(s), Some(p)) => {
                        let matched = like_regex(p)?.is_match(s);
                        Some(Value::Bool(matched != *negated))
                    }
                    _ => Some(Value::Null),
                }
            }
            Expression::In {
                expr,
                values,
                negated,
            } => {
                let v = expr.evaluate(ctx, entity)?;
                if v.is_null() {
                    return Some(Value::Null);
                }
                let mut saw_null = false;
                for candidate in values {
                    let c = candidate.evaluate(ctx, entity)?;
                    if c.is_null() {
                        saw_null = true;
                    } else if v.sql_eq(&c) {
                        return Some(Value::Bool(!*negated));
                    }
                }
                if saw_null {
                    Some(Value::Null)
                } else {
                    Some(Value::Bool(*negated))
                }
            }
            Expression::IsNull { expr, negated } => {
                let v = expr.evaluate(ctx, entity)?;
                Some(Value::Bool(v.is_null() != *negated))
            }
            Expression::Between {
                expr,
                low,
                high,
                negated,
            } => {
                let v = expr.evaluate(ctx, entity)?;
                let lo = low.evaluate(ctx, entity)?;
                let hi = high.evaluate(ctx, entity)?;
                let inside = match (v.compare(&lo), v.compare(&hi)) {
                    (Some(a), Some(b)) => Some(a != Ordering::Less && b != Ordering::Greater),
                    _ => None,
                };
                Some(from_truth(inside.map(|b| b != *negated)))
            }
            Expression::Aggregate { .. } => None,
        }
    }

    /// Whether `entity` satisfies this condition; `None` if undecidable in memory.
    pub fn conforms(&self, ctx: &ConformContext<'_>, entity: &Entity) -> Option<bool> {
        let v = self.evaluate(ctx, entity)?;
        Some(truth(&v).unwrap_or(false))
    }

    /// Extract a primary key when the whole condition is key equalities.
    pub fn primary_key(
        &self,
        desc: &ClassDescriptor,
        arguments: &TranslationRow,
    ) -> Option<PrimaryKey> {
        let mut found: HashMap<&str, Value> = HashMap::new();
        if !self.collect_key_equalities(desc, arguments, &mut found) {
            return None;
        }
        if found.len() != desc.primary_key().len() {
            return None;
        }
        let values = desc
            .primary_key()
            .iter()
            .map(|attr| found.remove(attr.as_str()))
            .collect::<Option<Vec<_>>>()?;
        let key = PrimaryKey::new(values);
        (!key.is_null()).then_some(key)
    }

    fn collect_key_equalities<'d>(
        &self,
        desc: &'d ClassDescriptor,
        arguments: &TranslationRow,
        out: &mut HashMap<&'d str, Value>,
    ) -> bool {
        match self {
            Expression::Binary {
                left,
                op: BinaryOp::And,
                right,
            } => {
                left.collect_key_equalities(desc, arguments, out)
                    && right.collect_key_equalities(desc, arguments, out)
            }
            Expression::Binary {
                left,
                op: BinaryOp::Eq,
                right,
            } => {
                let (path, operand) = match (left.as_ref(), right.as_ref()) {
                    (Expression::Attribute(p), other) | (other, Expression::Attribute(p)) => {
                        (p, other)
                    }
                    _ => return false,
                };
                let [attr] = path.as_slice() else {
                    return false;
                };
                let Some(key_attr) = desc.primary_key().iter().find(|k| *k == attr) else {
                    return false;
                };
                let value = match operand {
                    Expression::Literal(v) => v.normalized(),
                    Expression::Parameter(p) => match arguments.get(&p.argument_name()) {
                        Some(v) => v.clone(),
                        None => return false,
                    },
                    _ => return false,
                };
                out.insert(key_attr.as_str(), value);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project() -> Project {
        let mut p = Project::new()
            .with(
                ClassDescriptor::entity("Employee", "EMPLOYEE")
                    .id("id", "EMP_ID", AttributeType::Integer)
                    .direct("name", "NAME", AttributeType::Text)
                    .direct("salary", "SALARY", AttributeType::Integer)
                    .many_to_one("department", "Department", "DEPT_ID")
                    .embedded("period", "Period"),
            )
            .with(
                ClassDescriptor::entity("Department", "DEPARTMENT")
                    .id("id", "DEPT_ID", AttributeType::Integer),
            )
            .with(
                ClassDescriptor::embeddable("Period")
                    .direct("start", "START_YEAR", AttributeType::Integer),
            );
        p.initialize().unwrap();
        p
    }

    fn employee() -> Entity {
        let mut e = Entity::new("Employee")
            .with("id", 1_i64)
            .with("name", "Alice")
            .with("salary", 100_i64);
        e.set_reference_key("department", Value::BigInt(10));
        e.set_attribute(
            "period",
            persist_core::AttributeValue::Embedded(Some(Box::new(
                Entity::new("Period").with("start", 2020_i64),
            ))),
        );
        e
    }

    #[test]
    fn sql_generation_resolves_paths() {
        let p = project();
        let desc = p.require("Employee").unwrap();
        let expr = Expression::attr("name")
            .equal(Expression::param("name"))
            .and(Expression::path("department.id").equal(10_i64))
            .and(Expression::path("period.start").greater_than(2000_i64));
        let mut ctx = SqlContext::new(&p, Some(desc), Dialect::Sqlite).qualified("t0");
        let sql = expr.to_sql(&mut ctx).unwrap();
        assert_eq!(
            sql,
            "((t0.\"NAME\" = ?1 AND t0.\"DEPT_ID\" = 10) AND t0.\"START_YEAR\" > 2000)"
        );
        assert_eq!(
            ctx.parameters(),
            &[ParameterSource::Argument("name".into())]
        );
    }

    #[test]
    fn bound_literals_become_parameters() {
        let p = project();
        let desc = p.require("Employee").unwrap();
        let expr = Expression::attr("name").equal("O'Brien");
        let mut inline = SqlContext::new(&p, Some(desc), Dialect::Sqlite);
        assert_eq!(expr.to_sql(&mut inline).unwrap(), "\"NAME\" = 'O''Brien'");

        let mut bound = SqlContext::new(&p, Some(desc), Dialect::Sqlite).binding_literals(true);
        assert_eq!(expr.to_sql(&mut bound).unwrap(), "\"NAME\" = ?1");
        assert_eq!(
            bound.into_parameters(),
            vec![ParameterSource::Literal(Value::Text("O'Brien".into()))]
        );
    }

    #[test]
    fn unknown_paths_are_rejected() {
        let p = project();
        let desc = p.require("Employee").unwrap();
        let mut ctx = SqlContext::new(&p, Some(desc), Dialect::Sqlite);
        assert!(Expression::attr("nope").to_sql(&mut ctx).is_err());
        assert!(Expression::path("department.name").to_sql(&mut ctx).is_err());
    }

    #[test]
    fn conforming_in_memory() {
        let p = project();
        let desc = p.require("Employee").unwrap();
        let args = TranslationRow::new().with("min", 50_i64);
        let ctx = ConformContext::new(&p, desc, &args);
        let e = employee();

        let cond = Expression::attr("salary").greater_than(Expression::param("min"));
        assert_eq!(cond.conforms(&ctx, &e), Some(true));
        assert_eq!(
            Expression::attr("name").like("A%").conforms(&ctx, &e),
            Some(true)
        );
        assert_eq!(
            Expression::attr("name").like("B_").conforms(&ctx, &e),
            Some(false)
        );
        assert_eq!(
            Expression::path("department.id").equal(10_i64).conforms(&ctx, &e),
            Some(true)
        );
        assert_eq!(
            Expression::path("period.start")
                .between(2019_i64, 2021_i64)
                .conforms(&ctx, &e),
            Some(true)
        );
        // Missing argument: cannot decide in memory.
        assert_eq!(
            Expression::attr("salary")
                .equal(Expression::param("other"))
                .conforms(&ctx, &e),
            None
        );
    }

    #[test]
    fn null_comparisons_do_not_conform() {
        let p = project();
        let desc = p.require("Employee").unwrap();
        let args = TranslationRow::new();
        let ctx = ConformContext::new(&p, desc, &args);
        let e = Entity::new("Employee").with("id", 2_i64).with("name", Value::Null);
        assert_eq!(
            Expression::attr("name").equal("x").conforms(&ctx, &e),
            Some(false)
        );
        assert_eq!(
            Expression::attr("name").equal("x").not().conforms(&ctx, &e),
            Some(false)
        );
        assert_eq!(Expression::attr("name").is_null().conforms(&ctx, &e), Some(true));
    }

    #[test]
    fn primary_key_extraction() {
        let p = project();
        let desc = p.require("Employee").unwrap();
        let args = TranslationRow::new().with("id", Value::Int(5));
        let by_param = Expression::attr("id").equal(Expression::param("id"));
        assert_eq!(
            by_param.primary_key(desc, &args),
            Some(PrimaryKey::single(5_i64))
        );
        let with_extra = by_param.clone().and(Expression::attr("name").equal("x"));
        assert_eq!(with_extra.primary_key(desc, &args), None);
        assert_eq!(
            Expression::attr("name").equal("x").primary_key(desc, &args),
            None
        );
    }

    #[test]
    fn parameters_are_collected_once() {
        let expr = Expression::param("a")
            .equal(Expression::param("b"))
            .or(Expression::param("a").is_null());
        let mut names = Vec::new();
        expr.collect_parameters(&mut names);
        assert_eq!(names, vec!["a", "b"]);
    }
}
