//! Query mechanisms: how a query becomes SQL.
//!
//! - [`QueryMechanism::Expression`] builds SQL from the query's selection
//!   criteria, ordering and report items
//! - [`QueryMechanism::Statement`] runs a fixed statement with `?` markers
//! - [`QueryMechanism::Call`] runs user SQL with `#name` markers or a stored
//!   procedure
//! - [`QueryMechanism::Jpql`] builds SQL like `Expression` from the fields
//!   populated when the JPQL text was parsed
//!
//! The mechanism is compiled once into a [`PreparedCall`](crate::call::PreparedCall);
//! every execution only re-binds parameters.

use crate::call::{ArgumentField, Call, CallResult, ParameterSource};
use crate::expr::{Expression, SqlContext, resolve_column};
use crate::query::{DatabaseQuery, QueryKind};
use persist_core::{ClassDescriptor, Dialect, Error, Project, Result};

// ============================================================================
// Statements
// ============================================================================

/// A fixed SQL statement whose `?` markers bind to arguments in order.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    sql: String,
    arguments: Vec<String>,
}

impl SqlStatement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            arguments: Vec::new(),
        }
    }

    /// Bind the next `?` marker to query argument `name`.
    pub fn argument(mut self, name: impl Into<String>) -> Self {
        self.arguments.push(name.into());
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    /// Rewrite `?` markers outside string literals into dialect placeholders.
    pub fn translate(&self, dialect: Dialect) -> Result<(String, Vec<ParameterSource>)> {
        let mut out = String::with_capacity(self.sql.len() + 8);
        let mut params = Vec::new();
        let mut quote: Option<char> = None;
        for c in self.sql.chars() {
            match (quote, c) {
                (Some(q), c) if c == q => {
                    quote = None;
                    out.push(c);
                }
                (Some(_), c) => out.push(c),
                (None, '\'' | '"') => {
                    quote = Some(c);
                    out.push(c);
                }
                (None, '?') => {
                    let name = self.arguments.get(params.len()).ok_or_else(|| {
                        Error::illegal_state(format!(
                            "statement has more markers than the {} bound arguments",
                            self.arguments.len()
                        ))
                    })?;
                    params.push(ParameterSource::Argument(name.clone()));
                    out.push_str(&dialect.placeholder(params.len()));
                }
                (None, c) => out.push(c),
            }
        }
        if params.len() != self.arguments.len() {
            return Err(Error::illegal_state(format!(
                "statement has {} markers but {} bound arguments",
                params.len(),
                self.arguments.len()
            )));
        }
        Ok((out, params))
    }
}

/// Strategy that turns a query into SQL.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum QueryMechanism {
    #[default]
    Expression,
    Statement(SqlStatement),
    Call(Call),
    /// Parsed JPQL; the text is kept for diagnostics.
    Jpql(String),
}

impl QueryMechanism {
    pub fn name(&self) -> &'static str {
        match self {
            QueryMechanism::Expression => "expression",
            QueryMechanism::Statement(_) => "statement",
            QueryMechanism::Call(_) => "call",
            QueryMechanism::Jpql(_) => "jpql",
        }
    }

    /// Whether SQL is generated from the query's criteria.
    pub fn builds_sql(&self) -> bool {
        matches!(self, QueryMechanism::Expression | QueryMechanism::Jpql(_))
    }

    /// Arguments referenced by the mechanism itself (custom SQL markers).
    pub fn argument_names(&self) -> Vec<String> {
        match self {
            QueryMechanism::Expression | QueryMechanism::Jpql(_) => Vec::new(),
            QueryMechanism::Statement(s) => s.arguments().to_vec(),
            QueryMechanism::Call(c) => c.argument_names(),
        }
    }
}

// ============================================================================
// Call building
// ============================================================================

/// SQL and parameter sources produced at prepare time.
#[derive(Debug)]
pub(crate) struct BuiltCall {
    pub sql: String,
    pub parameters: Vec<ParameterSource>,
    pub result: CallResult,
    pub custom_selection: bool,
}

pub(crate) fn build_call(
    query: &DatabaseQuery,
    project: &Project,
    dialect: Dialect,
    bind_all: bool,
) -> Result<BuiltCall> {
    let result = if query.kind().is_read_query() {
        CallResult::Rows
    } else {
        CallResult::RowCount
    };
    match query.mechanism() {
        QueryMechanism::Statement(statement) => {
            let (sql, parameters) = statement.translate(dialect)?;
            Ok(BuiltCall {
                sql,
                parameters,
                result,
                custom_selection: false,
            })
        }
        QueryMechanism::Call(call) => {
            let (sql, parameters) = call.translate(dialect);
            let custom_selection = parameters.is_empty() && query.arguments().is_empty();
            if query.kind().is_read_query() && !call.returns_rows() {
                return Err(Error::illegal_state(format!(
                    "read query '{}' uses a call that returns no rows",
                    query.display_name()
                )));
            }
            Ok(BuiltCall {
                sql,
                parameters,
                result,
                custom_selection,
            })
        }
        QueryMechanism::Expression | QueryMechanism::Jpql(_) => {
            let desc = reference_descriptor(query, project)?;
            let mut ctx = SqlContext::new(project, Some(desc), dialect).binding_literals(bind_all);
            let sql = match query.kind() {
                QueryKind::ReadObject | QueryKind::ReadAll => {
                    ctx = ctx.qualified("t0");
                    select_objects(query, project, desc, &mut ctx)?
                }
                QueryKind::Report => {
                    ctx = ctx.qualified("t0");
                    select_report(query, desc, &mut ctx)?
                }
                QueryKind::UpdateAll => update_all(query, project, desc, &mut ctx)?,
                QueryKind::DeleteAll => delete_all(query, desc, &mut ctx)?,
                QueryKind::DataRead | QueryKind::DataModify => {
                    return Err(Error::illegal_state(format!(
                        "data query '{}' needs a statement or call",
                        query.display_name()
                    )));
                }
            };
            Ok(BuiltCall {
                sql,
                parameters: ctx.into_parameters(),
                result,
                custom_selection: false,
            })
        }
    }
}

fn reference_descriptor<'p>(query: &DatabaseQuery, project: &'p Project) -> Result<&'p ClassDescriptor> {
    let entity = query.reference_entity().ok_or_else(|| {
        Error::illegal_state(format!(
            "query '{}' has no reference entity",
            query.display_name()
        ))
    })?;
    project.require(entity)
}

fn select_objects(
    query: &DatabaseQuery,
    project: &Project,
    desc: &ClassDescriptor,
    ctx: &mut SqlContext<'_>,
) -> Result<String> {
    let dialect = ctx.dialect();
    let columns = project
        .select_columns(desc)
        .iter()
        .map(|c| format!("{} AS {}", ctx.column(c), dialect.quote_identifier(c)))
        .collect::<Vec<_>>()
        .join(", ");
    let mut sql = select_head(query);
    sql.push_str(&columns);
    sql.push_str(" FROM ");
    sql.push_str(&dialect.quote_identifier(desc.table()));
    sql.push_str(" t0");
    push_where(&mut sql, query.selection_criteria(), ctx)?;
    push_order_by(&mut sql, query, ctx)?;
    push_limit(&mut sql, query, dialect);
    if let Some(clause) = dialect.lock_clause(query.lock_mode()) {
        sql.push_str(clause);
    }
    Ok(sql)
}

fn select_report(
    query: &DatabaseQuery,
    desc: &ClassDescriptor,
    ctx: &mut SqlContext<'_>,
) -> Result<String> {
    let dialect = ctx.dialect();
    if query.report_items().is_empty() {
        return Err(Error::illegal_state(format!(
            "report query '{}' has no items",
            query.display_name()
        )));
    }
    let mut items = Vec::with_capacity(query.report_items().len());
    for item in query.report_items() {
        let expr = item.expr.to_sql(ctx)?;
        items.push(format!("{} AS {}", expr, dialect.quote_identifier(&item.name)));
    }
    let mut sql = select_head(query);
    sql.push_str(&items.join(", "));
    sql.push_str(" FROM ");
    sql.push_str(&dialect.quote_identifier(desc.table()));
    sql.push_str(" t0");
    push_where(&mut sql, query.selection_criteria(), ctx)?;
    if !query.group_by().is_empty() {
        let groups = query
            .group_by()
            .iter()
            .map(|g| g.to_sql(ctx))
            .collect::<Result<Vec<_>>>()?;
        sql.push_str(" GROUP BY ");
        sql.push_str(&groups.join(", "));
    }
    push_order_by(&mut sql, query, ctx)?;
    push_limit(&mut sql, query, dialect);
    Ok(sql)
}

fn update_all(
    query: &DatabaseQuery,
    project: &Project,
    desc: &ClassDescriptor,
    ctx: &mut SqlContext<'_>,
) -> Result<String> {
    let dialect = ctx.dialect();
    if query.assignments().is_empty() {
        return Err(Error::illegal_state(format!(
            "update query '{}' sets nothing",
            query.display_name()
        )));
    }
    let mut sets = Vec::with_capacity(query.assignments().len());
    for (path, value) in query.assignments() {
        let column = resolve_column(project, desc, path)?.column;
        let value = value.to_sql(ctx)?;
        sets.push(format!("{} = {}", dialect.quote_identifier(&column), value));
    }
    let mut sql = format!(
        "UPDATE {} SET {}",
        dialect.quote_identifier(desc.table()),
        sets.join(", ")
    );
    push_where(&mut sql, query.selection_criteria(), ctx)?;
    Ok(sql)
}

fn delete_all(
    query: &DatabaseQuery,
    desc: &ClassDescriptor,
    ctx: &mut SqlContext<'_>,
) -> Result<String> {
    let mut sql = format!("DELETE FROM {}", ctx.dialect().quote_identifier(desc.table()));
    push_where(&mut sql, query.selection_criteria(), ctx)?;
    Ok(sql)
}

/// `SELECT `, the verbatim hint string and `DISTINCT`.
fn select_head(query: &DatabaseQuery) -> String {
    let mut sql = String::from("SELECT ");
    if let Some(hint) = query.hint_string() {
        sql.push_str(hint);
        sql.push(' ');
    }
    if query.is_distinct() {
        sql.push_str("DISTINCT ");
    }
    sql
}

fn push_where(
    sql: &mut String,
    criteria: Option<&Expression>,
    ctx: &mut SqlContext<'_>,
) -> Result<()> {
    if let Some(criteria) = criteria {
        sql.push_str(" WHERE ");
        sql.push_str(&criteria.to_sql(ctx)?);
    }
    Ok(())
}

fn push_order_by(sql: &mut String, query: &DatabaseQuery, ctx: &mut SqlContext<'_>) -> Result<()> {
    if query.ordering().is_empty() {
        return Ok(());
    }
    let mut items = Vec::with_capacity(query.ordering().len());
    for item in query.ordering() {
        let expr = item.expr.to_sql(ctx)?;
        items.push(if item.descending {
            format!("{} DESC", expr)
        } else {
            format!("{} ASC", expr)
        });
    }
    sql.push_str(" ORDER BY ");
    sql.push_str(&items.join(", "));
    Ok(())
}

fn push_limit(sql: &mut String, query: &DatabaseQuery, dialect: Dialect) {
    let offset = query.first_result();
    match (query.max_rows(), offset) {
        (Some(n), 0) => sql.push_str(&format!(" LIMIT {}", n)),
        (Some(n), m) => sql.push_str(&format!(" LIMIT {} OFFSET {}", n, m)),
        (None, 0) => {}
        (None, m) => match dialect {
            Dialect::Sqlite => sql.push_str(&format!(" LIMIT -1 OFFSET {}", m)),
            Dialect::Mysql => sql.push_str(&format!(" LIMIT 18446744073709551615 OFFSET {}", m)),
            Dialect::Postgres => sql.push_str(&format!(" OFFSET {}", m)),
        },
    }
}

// ============================================================================
// Argument fields
// ============================================================================

/// Map each query argument onto the field it is compared with.
///
/// Declared argument types win; otherwise the type is taken from the
/// attribute the argument is compared with or assigned to.
pub(crate) fn argument_fields(
    query: &DatabaseQuery,
    project: &Project,
    custom_selection: bool,
) -> Vec<ArgumentField> {
    if custom_selection {
        return Vec::new();
    }
    let mut bindings: Vec<(Vec<String>, String)> = Vec::new();
    if query.mechanism().builds_sql() {
        if let Some(criteria) = query.selection_criteria() {
            collect_bindings(criteria, &mut bindings);
        }
        for (path, value) in query.assignments() {
            if let Expression::Parameter(p) = value {
                bindings.push((path.clone(), p.argument_name()));
            }
        }
    }
    let desc = query.reference_entity().and_then(|e| project.descriptor(e));

    query
        .arguments()
        .iter()
        .map(|arg| {
            let resolved = desc.and_then(|desc| {
                bindings
                    .iter()
                    .find(|(_, name)| *name == arg.name)
                    .and_then(|(path, _)| resolve_column(project, desc, path).ok())
            });
            ArgumentField {
                name: arg.name.clone(),
                attribute_type: arg
                    .attribute_type
                    .or_else(|| resolved.as_ref().and_then(|r| r.attribute_type)),
                column: resolved.map(|r| r.column),
            }
        })
        .collect()
}

fn collect_bindings(expr: &Expression, out: &mut Vec<(Vec<String>, String)>) {
    match expr {
        Expression::Binary { left, op, right } if op.is_comparison() => {
            pair(left, right, out);
            pair(right, left, out);
        }
        Expression::Like { expr, pattern, .. } => pair(expr, pattern, out),
        Expression::In { expr, values, .. } => {
            for v in values {
                pair(expr, v, out);
            }
        }
        Expression::Between { expr, low, high, .. } => {
            pair(expr, low, out);
            pair(expr, high, out);
        }
        Expression::Binary { left, right, .. } => {
            collect_bindings(left, out);
            collect_bindings(right, out);
        }
        Expression::Not(inner) => collect_bindings(inner, out),
        _ => {}
    }
}

fn pair(path: &Expression, operand: &Expression, out: &mut Vec<(Vec<String>, String)>) {
    if let (Expression::Attribute(p), Expression::Parameter(param)) = (path, operand) {
        out.push((p.clone(), param.argument_name()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{AggregateFunction, OrderItem, ReportItem};
    use persist_core::{AttributeType, ClassDescriptor, LockMode};

    fn project() -> Project {
        let mut project = Project::new()
            .with(
                ClassDescriptor::entity("Employee", "EMPLOYEE")
                    .id("id", "EMP_ID", AttributeType::Integer)
                    .direct("name", "NAME", AttributeType::Text)
                    .direct("salary", "SALARY", AttributeType::Integer)
                    .many_to_one("department", "Department", "DEPT_ID"),
            )
            .with(
                ClassDescriptor::entity("Department", "DEPARTMENT")
                    .id("id", "DEPT_ID", AttributeType::Integer)
                    .direct("name", "DNAME", AttributeType::Text),
            );
        project.initialize().unwrap();
        project
    }

    #[test]
    fn statement_markers_skip_string_literals() {
        let statement = SqlStatement::new("SELECT '?' FROM T WHERE A = ? AND B = ?")
            .argument("a")
            .argument("b");
        let (sql, params) = statement.translate(Dialect::Sqlite).unwrap();
        assert_eq!(sql, "SELECT '?' FROM T WHERE A = ?1 AND B = ?2");
        assert_eq!(params.len(), 2);

        let short = SqlStatement::new("SELECT * FROM T WHERE A = ?");
        assert!(short.translate(Dialect::Sqlite).is_err());
    }

    #[test]
    fn object_select_with_criteria_order_and_limit() {
        let project = project();
        let mut query = DatabaseQuery::read_all("Employee");
        query.set_selection_criteria(Expression::attr("salary").greater_than(Expression::param("min")));
        query.add_argument("min", None);
        query.add_ordering(OrderItem::desc(Expression::attr("name")));
        query.set_max_rows(Some(10));
        query.set_first_result(5);

        let built = build_call(&query, &project, Dialect::Sqlite, false).unwrap();
        assert_eq!(
            built.sql,
            "SELECT t0.\"EMP_ID\" AS \"EMP_ID\", t0.\"NAME\" AS \"NAME\", t0.\"SALARY\" AS \"SALARY\", \
             t0.\"DEPT_ID\" AS \"DEPT_ID\" FROM \"EMPLOYEE\" t0 WHERE t0.\"SALARY\" > ?1 \
             ORDER BY t0.\"NAME\" DESC LIMIT 10 OFFSET 5"
        );
        assert_eq!(built.result, CallResult::Rows);

        let fields = argument_fields(&query, &project, false);
        assert_eq!(fields[0].column.as_deref(), Some("SALARY"));
        assert_eq!(fields[0].attribute_type, Some(AttributeType::Integer));
    }

    #[test]
    fn hint_and_lock_clause() {
        let project = project();
        let mut query = DatabaseQuery::read_all("Employee");
        query.set_hint_string(Some("/*+ FULL(t0) */".to_string()));
        query.set_lock_mode(LockMode::Pessimistic);
        let built = build_call(&query, &project, Dialect::Postgres, false).unwrap();
        assert!(built.sql.starts_with("SELECT /*+ FULL(t0) */ t0."));
        assert!(built.sql.ends_with(" FOR UPDATE"));
    }

    #[test]
    fn report_with_group_by() {
        let project = project();
        let mut query = DatabaseQuery::report("Employee");
        query.add_report_item(ReportItem::new("department", Expression::attr("department")));
        query.add_report_item(ReportItem::new(
            "total",
            Expression::aggregate(AggregateFunction::Sum, Some(Expression::attr("salary"))),
        ));
        query.add_group_by(Expression::attr("department"));
        let built = build_call(&query, &project, Dialect::Sqlite, false).unwrap();
        assert_eq!(
            built.sql,
            "SELECT t0.\"DEPT_ID\" AS \"department\", SUM(t0.\"SALARY\") AS \"total\" \
             FROM \"EMPLOYEE\" t0 GROUP BY t0.\"DEPT_ID\""
        );
    }

    #[test]
    fn update_and_delete_all_are_unqualified() {
        let project = project();
        let mut update = DatabaseQuery::update_all("Employee");
        update.add_assignment(vec!["salary".into()], Expression::param("pay"));
        update.add_argument("pay", None);
        update.set_selection_criteria(Expression::attr("name").equal("Bob"));
        let built = build_call(&update, &project, Dialect::Sqlite, true).unwrap();
        assert_eq!(
            built.sql,
            "UPDATE \"EMPLOYEE\" SET \"SALARY\" = ?1 WHERE \"NAME\" = ?2"
        );
        assert_eq!(built.result, CallResult::RowCount);
        let fields = argument_fields(&update, &project, false);
        assert_eq!(fields[0].attribute_type, Some(AttributeType::Integer));

        let delete = DatabaseQuery::delete_all("Employee");
        let built = build_call(&delete, &project, Dialect::Sqlite, false).unwrap();
        assert_eq!(built.sql, "DELETE FROM \"EMPLOYEE\"");
    }

    #[test]
    fn call_without_arguments_is_custom_selection() {
        let project = project();
        let query = DatabaseQuery::data_read(Call::sql("SELECT * FROM EMPLOYEE"));
        let built = build_call(&query, &project, Dialect::Sqlite, false).unwrap();
        assert!(built.custom_selection);

        let query = DatabaseQuery::data_read(Call::sql("SELECT * FROM EMPLOYEE WHERE EMP_ID = #id"));
        let built = build_call(&query, &project, Dialect::Sqlite, false).unwrap();
        assert!(!built.custom_selection);
        assert_eq!(built.sql, "SELECT * FROM EMPLOYEE WHERE EMP_ID = ?1");
    }

    #[test]
    fn data_query_needs_sql() {
        let project = project();
        let mut query = DatabaseQuery::data_read(Call::sql("SELECT 1"));
        query.set_query_mechanism(QueryMechanism::Expression);
        let err = build_call(&query, &project, Dialect::Sqlite, false).unwrap_err();
        assert_eq!(
            err.usage_kind(),
            Some(persist_core::UsageErrorKind::IllegalState)
        );
    }
}
