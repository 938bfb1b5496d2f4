//! Calls: the compiled, executable form of a query.
//!
//! A [`PreparedCall`] is SQL with dialect placeholders plus the ordered list of
//! [`ParameterSource`]s that fill them. It is built once at prepare time and
//! re-bound against a [`TranslationRow`] on every execution.

use persist_core::{AttributeType, Dialect, Error, LockMode, Result, Value};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;

/// `#name` argument markers in raw SQL.
fn sql_argument_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"#([A-Za-z_][A-Za-z0-9_]*)").expect("valid argument regex"))
}

/// Byte ranges of `'...'`, `"..."`, `-- ...` and `/* ... */` regions.
/// Unterminated regions run to the end of the text.
fn skipped_regions(sql: &str) -> Vec<std::ops::Range<usize>> {
    let bytes = sql.as_bytes();
    let mut regions = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let start = i;
        let end = match bytes[i] {
            quote @ (b'\'' | b'"') => {
                // doubled quotes are escapes and keep the region open
                let mut j = i + 1;
                loop {
                    match bytes[j..].iter().position(|&b| b == quote) {
                        Some(p) if bytes.get(j + p + 1) == Some(&quote) => j += p + 2,
                        Some(p) => break j + p + 1,
                        None => break bytes.len(),
                    }
                }
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => bytes[i..]
                .iter()
                .position(|&b| b == b'\n')
                .map_or(bytes.len(), |p| i + p),
            b'/' if bytes.get(i + 1) == Some(&b'*') => sql[i + 2..]
                .find("*/")
                .map_or(bytes.len(), |p| i + 2 + p + 2),
            _ => {
                i += 1;
                continue;
            }
        };
        regions.push(start..end);
        i = end;
    }
    regions
}

// ============================================================================
// Translation rows
// ============================================================================

/// Argument values for one execution, keyed by argument name.
///
/// Positional JPQL parameters (`?1`) are keyed by their index as text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranslationRow(BTreeMap<String, Value>);

impl TranslationRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into().normalized());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Values in `names` order, used as the query-results cache key.
    pub fn key_for(&self, names: &[String]) -> Vec<Value> {
        names
            .iter()
            .map(|n| self.0.get(n).cloned().unwrap_or(Value::Null))
            .collect()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for TranslationRow {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut row = TranslationRow::new();
        for (k, v) in iter {
            row.insert(k, v);
        }
        row
    }
}

// ============================================================================
// Prepared call
// ============================================================================

/// Where a placeholder's value comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterSource {
    /// A query argument, by name.
    Argument(String),
    /// A literal bound rather than inlined.
    Literal(Value),
}

/// Mapping of one query argument onto the database field it is compared with.
#[derive(Debug, Clone, PartialEq)]
pub struct ArgumentField {
    pub name: String,
    pub attribute_type: Option<AttributeType>,
    pub column: Option<String>,
}

/// What the call returns when executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallResult {
    Rows,
    RowCount,
}

/// The compiled form of a query.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedCall {
    pub sql: String,
    pub parameters: Vec<ParameterSource>,
    pub argument_fields: Vec<ArgumentField>,
    /// Resolved once at prepare time; `None` is no limit.
    pub timeout: Option<Duration>,
    pub result: CallResult,
    /// Raw SQL with no declared arguments, executed verbatim.
    pub custom_selection: bool,
    pub lock_mode: LockMode,
    /// Ask the connection to keep the compiled statement.
    pub cache_statement: bool,
}

impl PreparedCall {
    pub fn returns_rows(&self) -> bool {
        self.result == CallResult::Rows
    }

    /// Bind the parameters for one execution.
    pub fn bind(&self, row: &TranslationRow) -> Result<Vec<Value>> {
        if self.custom_selection {
            return Ok(Vec::new());
        }
        self.parameters
            .iter()
            .map(|source| match source {
                ParameterSource::Literal(v) => Ok(v.clone()),
                ParameterSource::Argument(name) => {
                    let value = row.get(name).ok_or_else(|| {
                        Error::illegal_argument(format!(
                            "no value supplied for query argument '{}'",
                            name
                        ))
                    })?;
                    self.coerce(name, value)
                }
            })
            .collect()
    }

    /// Check `value` against the field it is compared with and convert it to
    /// the column's storage form.
    fn coerce(&self, name: &str, value: &Value) -> Result<Value> {
        let field = self.argument_fields.iter().find(|f| f.name == name);
        let declared = field.and_then(|f| f.attribute_type);
        if let Some(ty) = declared {
            if !ty.accepts(value) {
                return Err(Error::illegal_argument(format!(
                    "argument '{}' expects {:?}{}, got {}",
                    name,
                    ty,
                    field
                        .and_then(|f| f.column.as_deref())
                        .map(|c| format!(" for column {}", c))
                        .unwrap_or_default(),
                    value.type_name()
                )));
            }
        }
        Ok(match (declared, value) {
            (Some(AttributeType::Boolean), Value::Bool(b)) => Value::BigInt(i64::from(*b)),
            (Some(AttributeType::Json), Value::Json(j)) => Value::Text(j.to_string()),
            _ => value.clone(),
        })
    }
}

// ============================================================================
// Custom calls
// ============================================================================

/// Raw SQL with `#name` argument markers.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlCall {
    sql: String,
}

impl SqlCall {
    pub fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into() }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Argument names in order of appearance (repeats included).
    pub fn argument_names(&self) -> Vec<String> {
        self.markers().map(|(_, name)| name.to_string()).collect()
    }

    /// `#name` markers outside string literals, quoted identifiers and comments.
    fn markers(&self) -> impl Iterator<Item = (std::ops::Range<usize>, &str)> + '_ {
        let skipped = skipped_regions(&self.sql);
        sql_argument_pattern()
            .captures_iter(&self.sql)
            .filter_map(move |c| {
                let whole = c.get(0)?;
                let name = c.get(1)?;
                let inside = skipped
                    .iter()
                    .any(|r| r.start <= whole.start() && whole.start() < r.end);
                (!inside).then(|| (whole.range(), name.as_str()))
            })
    }

    /// Rewrite `#name` markers into dialect placeholders.
    pub fn translate(&self, dialect: Dialect) -> (String, Vec<ParameterSource>) {
        let mut params = Vec::new();
        let mut sql = String::with_capacity(self.sql.len());
        let mut last = 0;
        for (range, name) in self.markers() {
            sql.push_str(&self.sql[last..range.start]);
            params.push(ParameterSource::Argument(name.to_string()));
            sql.push_str(&dialect.placeholder(params.len()));
            last = range.end;
        }
        sql.push_str(&self.sql[last..]);
        (sql, params)
    }

    /// Whether the statement reads rows.
    pub fn is_select(&self) -> bool {
        let head = self.sql.trim_start().to_ascii_uppercase();
        head.starts_with("SELECT") || head.starts_with("WITH") || head.starts_with("VALUES")
    }
}

/// A stored procedure or function invoked with positional arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredProcedureCall {
    name: String,
    arguments: Vec<String>,
    returns_rows: bool,
}

impl StoredProcedureCall {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: Vec::new(),
            returns_rows: true,
        }
    }

    /// Bind the next positional argument to query argument `name`.
    pub fn argument(mut self, name: impl Into<String>) -> Self {
        self.arguments.push(name.into());
        self
    }

    pub fn returns_row_count(mut self) -> Self {
        self.returns_rows = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn argument_names(&self) -> &[String] {
        &self.arguments
    }

    pub fn returns_rows(&self) -> bool {
        self.returns_rows
    }

    pub fn translate(&self, dialect: Dialect) -> (String, Vec<ParameterSource>) {
        let sql = dialect.procedure_call(&self.name, self.arguments.len());
        let params = self
            .arguments
            .iter()
            .cloned()
            .map(ParameterSource::Argument)
            .collect();
        (sql, params)
    }
}

/// A user-supplied call.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Sql(SqlCall),
    StoredProcedure(StoredProcedureCall),
}

impl Call {
    pub fn sql(sql: impl Into<String>) -> Self {
        Call::Sql(SqlCall::new(sql))
    }

    pub fn argument_names(&self) -> Vec<String> {
        match self {
            Call::Sql(c) => c.argument_names(),
            Call::StoredProcedure(c) => c.argument_names().to_vec(),
        }
    }

    pub fn translate(&self, dialect: Dialect) -> (String, Vec<ParameterSource>) {
        match self {
            Call::Sql(c) => c.translate(dialect),
            Call::StoredProcedure(c) => c.translate(dialect),
        }
    }

    pub fn returns_rows(&self) -> bool {
        match self {
            Call::Sql(c) => c.is_select(),
            Call::StoredProcedure(c) => c.returns_rows(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sql_call_rewrites_named_arguments() {
        let call = SqlCall::new("SELECT * FROM EMPLOYEE WHERE EMP_ID = #id AND NAME = #name");
        assert_eq!(call.argument_names(), vec!["id", "name"]);
        let (sql, params) = call.translate(Dialect::Sqlite);
        assert_eq!(sql, "SELECT * FROM EMPLOYEE WHERE EMP_ID = ?1 AND NAME = ?2");
        assert_eq!(
            params,
            vec![
                ParameterSource::Argument("id".into()),
                ParameterSource::Argument("name".into())
            ]
        );
        assert!(call.is_select());
    }

    #[test]
    fn sql_call_ignores_markers_in_literals_and_comments() {
        let call = SqlCall::new(
            "SELECT '#x', \"#col\" FROM T /* #b */ WHERE A = #a AND N = 'it''s #y' -- #c",
        );
        assert_eq!(call.argument_names(), vec!["a"]);
        let (sql, params) = call.translate(Dialect::Sqlite);
        assert_eq!(
            sql,
            "SELECT '#x', \"#col\" FROM T /* #b */ WHERE A = ?1 AND N = 'it''s #y' -- #c"
        );
        assert_eq!(params, vec![ParameterSource::Argument("a".into())]);

        let multi_line = SqlCall::new("SELECT * FROM T -- #skip\nWHERE A = #a");
        assert_eq!(multi_line.argument_names(), vec!["a"]);
    }

    #[test]
    fn stored_procedure_translation() {
        let call = StoredProcedureCall::new("raise")
            .argument("pct")
            .returns_row_count();
        let (sql, params) = call.translate(Dialect::Postgres);
        assert_eq!(sql, "CALL raise($1)");
        assert_eq!(params.len(), 1);
        assert!(!call.returns_rows());
    }

    #[test]
    fn bind_reports_missing_arguments() {
        let call = PreparedCall {
            sql: "SELECT 1 WHERE ?1".into(),
            parameters: vec![
                ParameterSource::Argument("id".into()),
                ParameterSource::Literal(Value::BigInt(3)),
            ],
            argument_fields: vec![],
            timeout: None,
            result: CallResult::Rows,
            custom_selection: false,
            lock_mode: LockMode::None,
            cache_statement: false,
        };
        let bound = call
            .bind(&TranslationRow::new().with("id", Value::Int(1)))
            .unwrap();
        assert_eq!(bound, vec![Value::BigInt(1), Value::BigInt(3)]);
        let err = call.bind(&TranslationRow::new()).unwrap_err();
        assert_eq!(
            err.usage_kind(),
            Some(persist_core::UsageErrorKind::IllegalArgument)
        );
    }

    #[test]
    fn custom_selection_binds_nothing() {
        let call = PreparedCall {
            sql: "SELECT * FROM T".into(),
            parameters: vec![ParameterSource::Argument("ignored".into())],
            argument_fields: vec![],
            timeout: None,
            result: CallResult::Rows,
            custom_selection: true,
            lock_mode: LockMode::None,
            cache_statement: false,
        };
        assert!(call.bind(&TranslationRow::new()).unwrap().is_empty());
    }

    #[test]
    fn bind_checks_inferred_field_types() {
        let call = PreparedCall {
            sql: "SELECT * FROM T WHERE \"ACTIVE\" = ?1".into(),
            parameters: vec![ParameterSource::Argument("active".into())],
            argument_fields: vec![ArgumentField {
                name: "active".into(),
                attribute_type: Some(AttributeType::Boolean),
                column: Some("ACTIVE".into()),
            }],
            timeout: None,
            result: CallResult::Rows,
            custom_selection: false,
            lock_mode: LockMode::None,
            cache_statement: false,
        };
        let bound = call
            .bind(&TranslationRow::new().with("active", true))
            .unwrap();
        assert_eq!(bound, vec![Value::BigInt(1)]);
        let err = call
            .bind(&TranslationRow::new().with("active", "yes"))
            .unwrap_err();
        assert!(err.to_string().contains("ACTIVE"));
    }
}
