//! SQL text builders
//!
//! The builders render complete statements with every value inlined through
//! the backend's [`SqlDialect`] quoting, so the result can be handed to the
//! connection's query choke point as-is. Table references passed in are
//! already resolved (prefixed and quoted) by the connection.

use super::error::{DatabaseError, Result};
use super::value::{DatabaseRow, DatabaseValue};
use crate::backends::{InsertIgnoreStyle, SqlDialect, UpsertStyle};

/// SQL comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// Equal to (=)
    Eq,
    /// Not equal to (!=)
    Ne,
    /// Less than (<)
    Lt,
    /// Less than or equal (<=)
    Le,
    /// Greater than (>)
    Gt,
    /// Greater than or equal (>=)
    Ge,
}

impl Operator {
    fn as_sql(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
        }
    }
}

/// One piece of a LIKE pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LikeMatch {
    /// Text matched literally (wildcards escaped)
    Literal(String),
    /// `%`
    AnyString,
    /// `_`
    AnyChar,
}

/// WHERE clause condition
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Compare {
        column: String,
        operator: Operator,
        value: DatabaseValue,
    },
    In {
        column: String,
        values: Vec<DatabaseValue>,
    },
    IsNull {
        column: String,
        negated: bool,
    },
    Like {
        column: String,
        pattern: Vec<LikeMatch>,
    },
    /// Verbatim SQL expression
    Raw(String),
}

impl Condition {
    fn render(&self, d: &dyn SqlDialect) -> String {
        match self {
            Condition::Compare {
                column,
                operator,
                value,
            } => {
                if value.is_null() {
                    match operator {
                        Operator::Eq => return format!("{} IS NULL", column),
                        Operator::Ne => return format!("{} IS NOT NULL", column),
                        _ => {}
                    }
                }
                format!("{} {} {}", column, operator.as_sql(), d.add_quotes(value))
            }
            Condition::In { column, values } => match values.as_slice() {
                [] => "1 = 0".to_string(),
                [single] => Condition::Compare {
                    column: column.clone(),
                    operator: Operator::Eq,
                    value: single.clone(),
                }
                .render(d),
                many => {
                    let list: Vec<String> = many.iter().map(|v| d.add_quotes(v)).collect();
                    format!("{} IN ({})", column, list.join(","))
                }
            },
            Condition::IsNull { column, negated } => {
                if *negated {
                    format!("{} IS NOT NULL", column)
                } else {
                    format!("{} IS NULL", column)
                }
            }
            Condition::Like { column, pattern } => format!("{}{}", column, d.build_like(pattern)),
            Condition::Raw(sql) => format!("({})", sql),
        }
    }
}

/// ANDed WHERE conditions
///
/// An empty set matches nothing for `update`/`delete` unless it was built with
/// [`Conditions::all_rows`], which makes touching every row explicit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conditions {
    items: Vec<Condition>,
    all_rows: bool,
}

impl Conditions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicitly match every row
    pub fn all_rows() -> Self {
        Self {
            items: Vec::new(),
            all_rows: true,
        }
    }

    /// Add a `column = value` condition (`IS NULL` for a null value)
    #[must_use]
    pub fn eq(self, column: &str, value: impl Into<DatabaseValue>) -> Self {
        self.compare(column, Operator::Eq, value)
    }

    /// Add a `column != value` condition
    #[must_use]
    pub fn ne(self, column: &str, value: impl Into<DatabaseValue>) -> Self {
        self.compare(column, Operator::Ne, value)
    }

    /// Add a `column < value` condition
    #[must_use]
    pub fn lt(self, column: &str, value: impl Into<DatabaseValue>) -> Self {
        self.compare(column, Operator::Lt, value)
    }

    /// Add a `column <= value` condition
    #[must_use]
    pub fn le(self, column: &str, value: impl Into<DatabaseValue>) -> Self {
        self.compare(column, Operator::Le, value)
    }

    /// Add a `column > value` condition
    #[must_use]
    pub fn gt(self, column: &str, value: impl Into<DatabaseValue>) -> Self {
        self.compare(column, Operator::Gt, value)
    }

    /// Add a `column >= value` condition
    #[must_use]
    pub fn ge(self, column: &str, value: impl Into<DatabaseValue>) -> Self {
        self.compare(column, Operator::Ge, value)
    }

    #[must_use]
    pub fn compare(mut self, column: &str, operator: Operator, value: impl Into<DatabaseValue>) -> Self {
        self.items.push(Condition::Compare {
            column: column.to_string(),
            operator,
            value: value.into(),
        });
        self
    }

    /// Add a `column IN (...)` condition
    #[must_use]
    pub fn in_list<V: Into<DatabaseValue>>(mut self, column: &str, values: impl IntoIterator<Item = V>) -> Self {
        self.items.push(Condition::In {
            column: column.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Add a `column IS NULL` condition
    #[must_use]
    pub fn null(mut self, column: &str) -> Self {
        self.items.push(Condition::IsNull {
            column: column.to_string(),
            negated: false,
        });
        self
    }

    /// Add a `column IS NOT NULL` condition
    #[must_use]
    pub fn not_null(mut self, column: &str) -> Self {
        self.items.push(Condition::IsNull {
            column: column.to_string(),
            negated: true,
        });
        self
    }

    /// Add a `column LIKE pattern` condition
    #[must_use]
    pub fn like(mut self, column: &str, pattern: Vec<LikeMatch>) -> Self {
        self.items.push(Condition::Like {
            column: column.to_string(),
            pattern,
        });
        self
    }

    /// Add a verbatim SQL condition
    #[must_use]
    pub fn raw(mut self, sql: impl Into<String>) -> Self {
        self.items.push(Condition::Raw(sql.into()));
        self
    }

    pub fn push(&mut self, condition: Condition) {
        self.items.push(condition);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_all_rows(&self) -> bool {
        self.all_rows && self.items.is_empty()
    }

    /// The WHERE body, or `None` when there is nothing to filter on
    pub fn render(&self, d: &dyn SqlDialect) -> Option<String> {
        if self.items.is_empty() {
            return None;
        }
        let parts: Vec<String> = self.items.iter().map(|c| c.render(d)).collect();
        Some(parts.join(" AND "))
    }

    /// Fail unless there is at least one condition or all rows were requested
    pub fn require_filter(&self, fname: &str) -> Result<()> {
        if self.items.is_empty() && !self.all_rows {
            return Err(DatabaseError::expected(format!(
                "{}: refusing to touch every row; use Conditions::all_rows()",
                fname
            )));
        }
        Ok(())
    }
}

impl<K: Into<String>, V: Into<DatabaseValue>> FromIterator<(K, V)> for Conditions {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut conds = Conditions::new();
        for (k, v) in iter {
            let column: String = k.into();
            conds.items.push(Condition::Compare {
                column,
                operator: Operator::Eq,
                value: v.into(),
            });
        }
        conds
    }
}

/// JOIN types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    /// INNER JOIN
    Inner,
    /// LEFT JOIN
    Left,
}

impl JoinType {
    fn as_sql(&self) -> &'static str {
        match self {
            JoinType::Inner => "JOIN",
            JoinType::Left => "LEFT JOIN",
        }
    }
}

/// JOIN clause against an unresolved table name
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub join_type: JoinType,
    pub table: String,
    pub on: Conditions,
}

impl Join {
    pub fn inner(table: impl Into<String>, on: Conditions) -> Self {
        Self {
            join_type: JoinType::Inner,
            table: table.into(),
            on,
        }
    }

    pub fn left(table: impl Into<String>, on: Conditions) -> Self {
        Self {
            join_type: JoinType::Left,
            table: table.into(),
            on,
        }
    }
}

/// ORDER BY direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDirection {
    /// Ascending order
    Asc,
    /// Descending order
    Desc,
}

impl OrderDirection {
    fn as_sql(&self) -> &'static str {
        match self {
            OrderDirection::Asc => "ASC",
            OrderDirection::Desc => "DESC",
        }
    }
}

/// Modifiers of a SELECT
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectOptions {
    pub distinct: bool,
    pub group_by: Vec<String>,
    pub having: Option<String>,
    pub order_by: Vec<(String, OrderDirection)>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub for_update: bool,
}

impl SelectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    #[must_use]
    pub fn group_by(mut self, columns: &[&str]) -> Self {
        self.group_by = columns.iter().map(|s| s.to_string()).collect();
        self
    }

    #[must_use]
    pub fn having(mut self, expr: impl Into<String>) -> Self {
        self.having = Some(expr.into());
        self
    }

    #[must_use]
    pub fn order_by(mut self, column: &str, direction: OrderDirection) -> Self {
        self.order_by.push((column.to_string(), direction));
        self
    }

    #[must_use]
    pub fn order_by_asc(self, column: &str) -> Self {
        self.order_by(column, OrderDirection::Asc)
    }

    #[must_use]
    pub fn order_by_desc(self, column: &str) -> Self {
        self.order_by(column, OrderDirection::Desc)
    }

    #[must_use]
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    #[must_use]
    pub fn for_update(mut self) -> Self {
        self.for_update = true;
        self
    }
}

/// SELECT statement over resolved table references
#[derive(Debug, Clone)]
pub struct SelectBuilder {
    from: Vec<String>,
    columns: Vec<String>,
    joins: Vec<(JoinType, String, Conditions)>,
    conds: Conditions,
    options: SelectOptions,
}

impl SelectBuilder {
    pub fn new(from: Vec<String>) -> Self {
        Self {
            from,
            columns: Vec::new(),
            joins: Vec::new(),
            conds: Conditions::new(),
            options: SelectOptions::default(),
        }
    }

    /// Select these expressions (`*` when none are given)
    #[must_use]
    pub fn columns(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|s| s.to_string()).collect();
        self
    }

    #[must_use]
    pub fn conditions(mut self, conds: Conditions) -> Self {
        self.conds = conds;
        self
    }

    #[must_use]
    pub fn options(mut self, options: SelectOptions) -> Self {
        self.options = options;
        self
    }

    /// Join a resolved table reference
    #[must_use]
    pub fn join(mut self, join_type: JoinType, table: impl Into<String>, on: Conditions) -> Self {
        self.joins.push((join_type, table.into(), on));
        self
    }

    /// Render the statement
    pub fn build(&self, d: &dyn SqlDialect) -> String {
        let columns = if self.columns.is_empty() {
            "*".to_string()
        } else {
            self.columns.join(",")
        };
        let mut sql = format!(
            "SELECT {}{}",
            if self.options.distinct { "DISTINCT " } else { "" },
            columns
        );

        if !self.from.is_empty() {
            sql.push_str(" FROM ");
            sql.push_str(&self.from.join(","));
        }

        for (join_type, table, on) in &self.joins {
            sql.push_str(&format!(" {} {}", join_type.as_sql(), table));
            if let Some(on) = on.render(d) {
                sql.push_str(&format!(" ON ({})", on));
            }
        }

        if let Some(conds) = self.conds.render(d) {
            sql.push_str(" WHERE ");
            sql.push_str(&conds);
        }

        if !self.options.group_by.is_empty() {
            sql.push_str(&format!(" GROUP BY {}", self.options.group_by.join(",")));
        }

        if let Some(having) = &self.options.having {
            sql.push_str(&format!(" HAVING {}", having));
        }

        if !self.options.order_by.is_empty() {
            let order: Vec<String> = self
                .options
                .order_by
                .iter()
                .map(|(col, dir)| format!("{} {}", col, dir.as_sql()))
                .collect();
            sql.push_str(&format!(" ORDER BY {}", order.join(",")));
        }

        sql.push_str(&d.limit_clause(self.options.limit, self.options.offset));

        if self.options.for_update && d.database_type() != crate::core::DatabaseType::Sqlite {
            sql.push_str(" FOR UPDATE");
        }

        sql
    }
}

/// INSERT statement for one or more rows with identical columns
#[derive(Debug, Clone)]
pub struct InsertBuilder {
    table: String,
    rows: Vec<DatabaseRow>,
    ignore: bool,
}

impl InsertBuilder {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            rows: Vec::new(),
            ignore: false,
        }
    }

    #[must_use]
    pub fn row(mut self, row: DatabaseRow) -> Self {
        self.rows.push(row);
        self
    }

    #[must_use]
    pub fn rows(mut self, rows: impl IntoIterator<Item = DatabaseRow>) -> Self {
        self.rows.extend(rows);
        self
    }

    /// Skip rows that would violate a unique key
    #[must_use]
    pub fn ignore(mut self, ignore: bool) -> Self {
        self.ignore = ignore;
        self
    }

    /// Render the statement
    pub fn build(&self, d: &dyn SqlDialect) -> Result<String> {
        let columns = shared_columns(&self.rows)?;
        let body = format!(
            "{} ({}) VALUES {}",
            self.table,
            columns.join(","),
            values_list(d, &self.rows)
        );
        Ok(if self.ignore {
            ignore_insert(d, &body)
        } else {
            format!("INSERT INTO {}", body)
        })
    }
}

/// Right-hand side of a SET clause
#[derive(Debug, Clone, PartialEq)]
pub enum Assignment {
    /// A literal value
    Value(DatabaseValue),
    /// A verbatim SQL expression such as `hits + 1`
    Raw(String),
    /// The value the surrounding upsert tried to insert into this column
    Excluded(String),
}

/// Ordered SET clause
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Assignments {
    items: Vec<(String, Assignment)>,
}

impl Assignments {
    pub fn new() -> Self {
        Self::default()
    }

    /// `column = value`
    #[must_use]
    pub fn set(mut self, column: &str, value: impl Into<DatabaseValue>) -> Self {
        self.items
            .push((column.to_string(), Assignment::Value(value.into())));
        self
    }

    /// `column = <expr>`
    #[must_use]
    pub fn raw(mut self, column: &str, expr: impl Into<String>) -> Self {
        self.items.push((column.to_string(), Assignment::Raw(expr.into())));
        self
    }

    /// `column = <value the upsert tried to insert into source_column>`
    #[must_use]
    pub fn excluded(mut self, column: &str, source_column: &str) -> Self {
        self.items.push((
            column.to_string(),
            Assignment::Excluded(source_column.to_string()),
        ));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Render `a = x,b = y`
    pub fn render(&self, d: &dyn SqlDialect) -> String {
        let parts: Vec<String> = self
            .items
            .iter()
            .map(|(column, assignment)| {
                let rhs = match assignment {
                    Assignment::Value(v) => d.add_quotes(v),
                    Assignment::Raw(expr) => expr.clone(),
                    Assignment::Excluded(source) => d.build_excluded_value(source),
                };
                format!("{} = {}", column, rhs)
            })
            .collect();
        parts.join(",")
    }
}

impl From<&DatabaseRow> for Assignments {
    fn from(row: &DatabaseRow) -> Self {
        Self {
            items: row
                .iter()
                .map(|(c, v)| (c.to_string(), Assignment::Value(v.clone())))
                .collect(),
        }
    }
}

/// UPDATE statement
#[derive(Debug, Clone)]
pub struct UpdateBuilder {
    table: String,
    set: Assignments,
    conds: Conditions,
}

impl UpdateBuilder {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            set: Assignments::new(),
            conds: Conditions::new(),
        }
    }

    #[must_use]
    pub fn set(mut self, set: Assignments) -> Self {
        self.set = set;
        self
    }

    #[must_use]
    pub fn conditions(mut self, conds: Conditions) -> Self {
        self.conds = conds;
        self
    }

    /// Render the statement
    pub fn build(&self, d: &dyn SqlDialect) -> Result<String> {
        if self.set.is_empty() {
            return Err(DatabaseError::unexpected("UPDATE without any assignment"));
        }
        let mut sql = format!("UPDATE {} SET {}", self.table, self.set.render(d));
        if let Some(conds) = self.conds.render(d) {
            sql.push_str(" WHERE ");
            sql.push_str(&conds);
        }
        Ok(sql)
    }
}

/// DELETE statement
#[derive(Debug, Clone)]
pub struct DeleteBuilder {
    table: String,
    conds: Conditions,
}

impl DeleteBuilder {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            conds: Conditions::new(),
        }
    }

    #[must_use]
    pub fn conditions(mut self, conds: Conditions) -> Self {
        self.conds = conds;
        self
    }

    /// Render the statement
    pub fn build(&self, d: &dyn SqlDialect) -> String {
        let mut sql = format!("DELETE FROM {}", self.table);
        if let Some(conds) = self.conds.render(d) {
            sql.push_str(" WHERE ");
            sql.push_str(&conds);
        }
        sql
    }
}

/// Native upsert: insert `rows`, applying `set` to rows whose `unique_key`
/// already exists
pub fn upsert_sql(
    d: &dyn SqlDialect,
    table: &str,
    rows: &[DatabaseRow],
    unique_key: &[&str],
    set: &Assignments,
) -> Result<String> {
    if set.is_empty() {
        return Err(DatabaseError::unexpected("Upsert without any assignment"));
    }
    check_unique_key(rows, unique_key)?;
    let columns = shared_columns(rows)?;
    let insert = format!(
        "INSERT INTO {} ({}) VALUES {}",
        table,
        columns.join(","),
        values_list(d, rows)
    );
    Ok(match d.upsert_style() {
        UpsertStyle::OnConflict => format!(
            "{} ON CONFLICT ({}) DO UPDATE SET {}",
            insert,
            unique_key.join(","),
            set.render(d)
        ),
        UpsertStyle::OnDuplicateKey => {
            format!("{} ON DUPLICATE KEY UPDATE {}", insert, set.render(d))
        }
    })
}

/// Native `REPLACE INTO`
pub fn replace_sql(d: &dyn SqlDialect, table: &str, rows: &[DatabaseRow]) -> Result<String> {
    let columns = shared_columns(rows)?;
    Ok(format!(
        "REPLACE INTO {} ({}) VALUES {}",
        table,
        columns.join(","),
        values_list(d, rows)
    ))
}

/// `INSERT INTO table (columns) <select>`
pub fn insert_select_sql(
    d: &dyn SqlDialect,
    table: &str,
    columns: &[&str],
    select: &str,
    ignore: bool,
) -> String {
    let body = format!("{} ({}) {}", table, columns.join(","), select);
    if ignore {
        ignore_insert(d, &body)
    } else {
        format!("INSERT INTO {}", body)
    }
}

/// Equality conditions on the unique key columns of `row`
pub fn unique_key_conditions(row: &DatabaseRow, unique_key: &[&str]) -> Result<Conditions> {
    let mut conds = Conditions::new();
    for column in unique_key {
        let value = row.get(column).ok_or_else(|| {
            DatabaseError::unexpected(format!("Row is missing unique key column '{}'", column))
        })?;
        conds = conds.eq(column, value.clone());
    }
    Ok(conds)
}

/// Verify that every row carries every unique key column
pub fn check_unique_key(rows: &[DatabaseRow], unique_key: &[&str]) -> Result<()> {
    if unique_key.is_empty() {
        return Err(DatabaseError::unexpected("Empty unique key"));
    }
    for row in rows {
        unique_key_conditions(row, unique_key)?;
    }
    Ok(())
}

fn shared_columns(rows: &[DatabaseRow]) -> Result<&[String]> {
    let first = rows
        .first()
        .ok_or_else(|| DatabaseError::unexpected("INSERT without any row"))?;
    if first.is_empty() {
        return Err(DatabaseError::unexpected("INSERT row without any column"));
    }
    if rows.iter().any(|r| r.columns() != first.columns()) {
        return Err(DatabaseError::unexpected(
            "Multi-row INSERT rows must have identical columns",
        ));
    }
    Ok(first.columns())
}

fn values_list(d: &dyn SqlDialect, rows: &[DatabaseRow]) -> String {
    let tuples: Vec<String> = rows
        .iter()
        .map(|row| {
            let values: Vec<String> = row.iter().map(|(_, v)| d.add_quotes(v)).collect();
            format!("({})", values.join(","))
        })
        .collect();
    tuples.join(",")
}

fn ignore_insert(d: &dyn SqlDialect, body: &str) -> String {
    match d.insert_ignore_style() {
        InsertIgnoreStyle::Keyword => format!("INSERT IGNORE INTO {}", body),
        InsertIgnoreStyle::OrIgnore => format!("INSERT OR IGNORE INTO {}", body),
        InsertIgnoreStyle::OnConflictDoNothing => {
            format!("INSERT INTO {} ON CONFLICT DO NOTHING", body)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DatabaseType;

    struct Dialect(UpsertStyle, InsertIgnoreStyle);

    impl SqlDialect for Dialect {
        fn database_type(&self) -> DatabaseType {
            DatabaseType::Postgres
        }

        fn upsert_style(&self) -> UpsertStyle {
            self.0
        }

        fn insert_ignore_style(&self) -> InsertIgnoreStyle {
            self.1
        }
    }

    fn pg() -> Dialect {
        Dialect(UpsertStyle::OnConflict, InsertIgnoreStyle::OnConflictDoNothing)
    }

    fn row(pairs: Vec<(&str, DatabaseValue)>) -> DatabaseRow {
        pairs.into_iter().collect()
    }

    #[test]
    fn test_select_basic() {
        let sql = SelectBuilder::new(vec!["\"users\"".into()]).build(&pg());
        assert_eq!(sql, "SELECT * FROM \"users\"");
    }

    #[test]
    fn test_select_where() {
        let sql = SelectBuilder::new(vec!["users".into()])
            .columns(&["id", "name"])
            .conditions(Conditions::new().eq("id", 42).eq("status", "active"))
            .build(&pg());
        assert_eq!(
            sql,
            "SELECT id,name FROM users WHERE id = 42 AND status = 'active'"
        );
    }

    #[test]
    fn test_select_complex() {
        let sql = SelectBuilder::new(vec!["users".into()])
            .columns(&["id"])
            .join(JoinType::Left, "orders", Conditions::new().raw("users.id = orders.user_id"))
            .conditions(Conditions::new().gt("age", 18).null("deleted_at"))
            .options(
                SelectOptions::new()
                    .distinct()
                    .order_by_asc("name")
                    .limit(100)
                    .offset(20),
            )
            .build(&pg());

        assert!(sql.starts_with("SELECT DISTINCT id FROM users LEFT JOIN orders ON ((users.id = orders.user_id))"));
        assert!(sql.contains("WHERE age > 18 AND deleted_at IS NULL"));
        assert!(sql.contains("ORDER BY name ASC"));
        assert!(sql.ends_with(" LIMIT 100 OFFSET 20"));
    }

    #[test]
    fn test_in_list_forms() {
        let d = pg();
        let empty = Conditions::new().in_list("id", Vec::<i64>::new());
        assert_eq!(empty.render(&d).as_deref(), Some("1 = 0"));

        let one = Conditions::new().in_list("id", vec![7i64]);
        assert_eq!(one.render(&d).as_deref(), Some("id = 7"));

        let many = Conditions::new().in_list("id", vec![1i64, 2, 3]);
        assert_eq!(many.render(&d).as_deref(), Some("id IN (1,2,3)"));
    }

    #[test]
    fn test_null_equality() {
        let d = pg();
        let conds = Conditions::new().eq("a", DatabaseValue::Null);
        assert_eq!(conds.render(&d).as_deref(), Some("a IS NULL"));
    }

    #[test]
    fn test_require_filter() {
        assert!(Conditions::new().require_filter("f").is_err());
        assert!(Conditions::all_rows().require_filter("f").is_ok());
        assert!(Conditions::new().eq("a", 1).require_filter("f").is_ok());
    }

    #[test]
    fn test_insert_multi_row() {
        let sql = InsertBuilder::new("t")
            .row(row(vec![("a", 1.into()), ("b", "x".into())]))
            .row(row(vec![("a", 2.into()), ("b", "y".into())]))
            .build(&pg())
            .unwrap();
        assert_eq!(sql, "INSERT INTO t (a,b) VALUES (1,'x'),(2,'y')");
    }

    #[test]
    fn test_insert_rejects_mismatched_rows() {
        let result = InsertBuilder::new("t")
            .row(row(vec![("a", 1.into())]))
            .row(row(vec![("b", 2.into())]))
            .build(&pg());
        assert!(matches!(result, Err(DatabaseError::Unexpected(_))));
    }

    #[test]
    fn test_insert_ignore_styles() {
        let r = row(vec![("a", 1.into())]);
        let mysql = Dialect(UpsertStyle::OnDuplicateKey, InsertIgnoreStyle::Keyword);
        let sqlite = Dialect(UpsertStyle::OnConflict, InsertIgnoreStyle::OrIgnore);

        let b = InsertBuilder::new("t").row(r).ignore(true);
        assert_eq!(b.build(&mysql).unwrap(), "INSERT IGNORE INTO t (a) VALUES (1)");
        assert_eq!(b.build(&sqlite).unwrap(), "INSERT OR IGNORE INTO t (a) VALUES (1)");
        assert_eq!(
            b.build(&pg()).unwrap(),
            "INSERT INTO t (a) VALUES (1) ON CONFLICT DO NOTHING"
        );
    }

    #[test]
    fn test_update_and_delete() {
        let d = pg();
        let sql = UpdateBuilder::new("t")
            .set(Assignments::new().set("name", "Bob").raw("hits", "hits + 1"))
            .conditions(Conditions::new().eq("id", 1))
            .build(&d)
            .unwrap();
        assert_eq!(sql, "UPDATE t SET name = 'Bob',hits = hits + 1 WHERE id = 1");

        let sql = DeleteBuilder::new("t")
            .conditions(Conditions::new().eq("id", 42))
            .build(&d);
        assert_eq!(sql, "DELETE FROM t WHERE id = 42");
    }

    #[test]
    fn test_upsert_styles() {
        let rows = vec![row(vec![("k", 1.into()), ("v", "a".into())])];
        let set = Assignments::new().excluded("v", "v");

        let sql = upsert_sql(&pg(), "t", &rows, &["k"], &set).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO t (k,v) VALUES (1,'a') ON CONFLICT (k) DO UPDATE SET v = excluded.\"v\""
        );

        let mysql = Dialect(UpsertStyle::OnDuplicateKey, InsertIgnoreStyle::Keyword);
        let sql = upsert_sql(&mysql, "t", &rows, &["k"], &Assignments::new().raw("v", "'b'")).unwrap();
        assert_eq!(sql, "INSERT INTO t (k,v) VALUES (1,'a') ON DUPLICATE KEY UPDATE v = 'b'");
    }

    #[test]
    fn test_upsert_requires_key_columns() {
        let rows = vec![row(vec![("v", "a".into())])];
        let set = Assignments::new().set("v", "b");
        assert!(upsert_sql(&pg(), "t", &rows, &["k"], &set).is_err());
        assert!(upsert_sql(&pg(), "t", &rows, &[], &set).is_err());
    }

    #[test]
    fn test_unique_key_conditions() {
        let r = row(vec![("k", 5.into()), ("v", "a".into())]);
        let conds = unique_key_conditions(&r, &["k"]).unwrap();
        assert_eq!(conds.render(&pg()).as_deref(), Some("k = 5"));
    }
}
