//! Statement descriptors
//!
//! A [`Query`] describes one statement before it runs; a [`QueryStatus`]
//! records what happened when a driver attempted it. Both are created fresh
//! per statement and never mutated afterwards.

use super::value::DatabaseResult;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::time::Duration;

bitflags::bitflags! {
    /// Per-statement execution flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct QueryFlags: u32 {
        /// Log failures quietly; pair with `try_silently` to get `None` back
        const SILENCE_ERRORS = 1;
        /// Do not open the implicit `ConnectionFlags::TRX` transaction
        const IGNORE_DBO_TRX = 2;
        /// Never transparently retry after a lost connection
        const NO_RETRY = 4;
        /// Write to a session-scoped temporary table (allowed on read-only servers)
        const PSEUDO_PERMANENT = 8;
        /// Statement is safe to run against a replica
        const REPLICA_ROLE = 16;
        /// Statement changes nothing
        const CHANGE_NONE = 32;
        /// Statement begins or ends a transaction
        const CHANGE_TRX = 64 | Self::IGNORE_DBO_TRX.bits();
        /// Statement changes rows
        const CHANGE_ROWS = 128;
        /// Statement changes the schema
        const CHANGE_SCHEMA = 256 | Self::IGNORE_DBO_TRX.bits();
        /// Statement acquires or releases named locks
        const CHANGE_LOCKS = 512 | Self::IGNORE_DBO_TRX.bits();
    }
}

/// Leading keyword category of a statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryVerb {
    Select,
    Insert,
    Update,
    Delete,
    Replace,
    Create,
    Alter,
    Drop,
    Truncate,
    Begin,
    Commit,
    Rollback,
    Savepoint,
    Release,
    RollbackToSavepoint,
    Set,
    Use,
    Show,
    Explain,
    Pragma,
    Other,
}

impl QueryVerb {
    /// Statements that modify persistent rows or schema
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            QueryVerb::Insert
                | QueryVerb::Update
                | QueryVerb::Delete
                | QueryVerb::Replace
                | QueryVerb::Create
                | QueryVerb::Alter
                | QueryVerb::Drop
                | QueryVerb::Truncate
                | QueryVerb::Other
        )
    }

    /// Statements that begin or end a transaction or a savepoint
    pub fn is_transaction_control(&self) -> bool {
        matches!(
            self,
            QueryVerb::Begin
                | QueryVerb::Commit
                | QueryVerb::Rollback
                | QueryVerb::Savepoint
                | QueryVerb::Release
                | QueryVerb::RollbackToSavepoint
        )
    }

    /// Statements that change the schema
    pub fn is_schema_change(&self) -> bool {
        matches!(
            self,
            QueryVerb::Create | QueryVerb::Alter | QueryVerb::Drop | QueryVerb::Truncate
        )
    }

    /// Statements whose insert id is meaningful
    pub fn generates_insert_id(&self) -> bool {
        matches!(self, QueryVerb::Insert | QueryVerb::Replace)
    }
}

impl fmt::Display for QueryVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

static LEADING_COMMENTS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?s:\s+|/\*.*?\*/|--[^\n]*(?:\n|$))*").expect("valid regex"));

static WRITE_TARGET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)^\s*(?:INSERT(?:\s+OR\s+\w+)?(?:\s+IGNORE)?\s+INTO|REPLACE\s+INTO|UPDATE(?:\s+OR\s+\w+)?(?:\s+IGNORE)?|DELETE\s+FROM|CREATE\s+(?:TEMPORARY\s+)?TABLE(?:\s+IF\s+NOT\s+EXISTS)?|ALTER\s+TABLE|DROP\s+TABLE(?:\s+IF\s+EXISTS)?|TRUNCATE(?:\s+TABLE)?)\s+([`"\[]?[\w.$]+[`"\]]?)"#,
    )
    .expect("valid regex")
});

static WITH_SELECT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)^WITH\b.*\)\s*SELECT\b").expect("valid regex"));

/// An immutable description of one SQL statement
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    sql: String,
    flags: QueryFlags,
    verb: QueryVerb,
    write_table: Option<String>,
    display_sql: Option<String>,
    server_wait: Duration,
}

impl Query {
    /// Describe a statement, sniffing its verb and target table
    pub fn new(sql: impl Into<String>, flags: QueryFlags) -> Self {
        let sql = sql.into();
        let body = strip_leading_comments(&sql);
        let verb = sniff_verb(body);
        let write_table = WRITE_TARGET
            .captures(body)
            .and_then(|c| c.get(1))
            .map(|m| {
                m.as_str()
                    .trim_matches(|c| c == '`' || c == '"' || c == '[' || c == ']')
                    .to_string()
            });
        Self {
            sql,
            flags,
            verb,
            write_table,
            display_sql: None,
            server_wait: Duration::ZERO,
        }
    }

    /// Let the server block for up to `wait` on top of the statement timeout
    pub fn with_server_wait(mut self, wait: Duration) -> Self {
        self.server_wait = wait;
        self
    }

    /// How long the server may block before the statement starts running
    pub fn server_wait(&self) -> Duration {
        self.server_wait
    }

    /// Attach a shortened/sanitized rendering for logs
    pub fn with_display_sql(mut self, display: impl Into<String>) -> Self {
        self.display_sql = Some(display.into());
        self
    }

    /// Statement text
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Text to use in logs and error messages
    pub fn display_sql(&self) -> &str {
        self.display_sql.as_deref().unwrap_or(&self.sql)
    }

    /// Execution flags
    pub fn flags(&self) -> QueryFlags {
        self.flags
    }

    /// Whether a flag is set
    pub fn has_flag(&self, flag: QueryFlags) -> bool {
        self.flags.contains(flag)
    }

    /// Leading keyword category
    pub fn verb(&self) -> QueryVerb {
        self.verb
    }

    /// Table written to, when the statement is a simple single-table write
    pub fn write_table(&self) -> Option<&str> {
        self.write_table.as_deref()
    }

    /// Whether the statement changes persistent rows or schema
    pub fn is_write(&self) -> bool {
        if self.flags.contains(QueryFlags::CHANGE_NONE) {
            return false;
        }
        if self.flags.contains(QueryFlags::CHANGE_ROWS) {
            return true;
        }
        self.verb.is_write()
    }

    /// Whether the statement begins/ends a transaction or savepoint
    pub fn changes_transaction(&self) -> bool {
        self.verb.is_transaction_control() || self.flags.contains(QueryFlags::CHANGE_TRX)
    }
}

fn strip_leading_comments(sql: &str) -> &str {
    LEADING_COMMENTS
        .find(sql)
        .map_or(sql, |m| &sql[m.end()..])
}

fn sniff_verb(body: &str) -> QueryVerb {
    let mut words = body
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .filter(|w| !w.is_empty())
        .map(|w| w.to_ascii_uppercase());
    let first = words.next().unwrap_or_default();
    match first.as_str() {
        "SELECT" | "VALUES" => QueryVerb::Select,
        "WITH" if WITH_SELECT.is_match(body) => QueryVerb::Select,
        "INSERT" => QueryVerb::Insert,
        "UPDATE" => QueryVerb::Update,
        "DELETE" => QueryVerb::Delete,
        "REPLACE" => QueryVerb::Replace,
        "CREATE" => QueryVerb::Create,
        "ALTER" => QueryVerb::Alter,
        "DROP" => QueryVerb::Drop,
        "TRUNCATE" => QueryVerb::Truncate,
        "BEGIN" | "START" => QueryVerb::Begin,
        "COMMIT" | "END" => QueryVerb::Commit,
        "ROLLBACK" => match words.next().as_deref() {
            Some("TO") => QueryVerb::RollbackToSavepoint,
            _ => QueryVerb::Rollback,
        },
        "SAVEPOINT" => QueryVerb::Savepoint,
        "RELEASE" => QueryVerb::Release,
        "SET" => QueryVerb::Set,
        "USE" => QueryVerb::Use,
        "SHOW" | "DESCRIBE" | "DESC" => QueryVerb::Show,
        "EXPLAIN" => QueryVerb::Explain,
        "PRAGMA" => QueryVerb::Pragma,
        _ => QueryVerb::Other,
    }
}

/// Backend error code: numeric errno (MySQL, SQLite) or SQLSTATE (Postgres)
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ErrorCode(String);

impl ErrorCode {
    /// No error
    pub fn none() -> Self {
        Self(String::new())
    }

    /// Numeric code
    pub fn numeric(code: i64) -> Self {
        Self(code.to_string())
    }

    /// Textual code such as a SQLSTATE
    pub fn text(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    /// The code as a number, if it is one
    pub fn as_i64(&self) -> Option<i64> {
        self.0.parse().ok()
    }

    /// Raw code text
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether no code is set
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of attempting one statement
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryStatus {
    rows: Option<DatabaseResult>,
    affected_rows: u64,
    insert_id: Option<i64>,
    error: String,
    errno: ErrorCode,
}

impl QueryStatus {
    /// A read that produced rows
    pub fn rows(rows: DatabaseResult) -> Self {
        Self {
            rows: Some(rows),
            ..Self::default()
        }
    }

    /// A write that changed `affected_rows` rows
    pub fn affected(affected_rows: u64, insert_id: Option<i64>) -> Self {
        Self {
            affected_rows,
            insert_id,
            ..Self::default()
        }
    }

    /// Attach the id generated by the statement
    #[must_use]
    pub fn with_insert_id(mut self, insert_id: Option<i64>) -> Self {
        self.insert_id = insert_id;
        self
    }

    /// Record rows changed by a statement that also returned rows
    #[must_use]
    pub fn with_affected_rows(mut self, affected_rows: u64) -> Self {
        self.affected_rows = affected_rows;
        self
    }

    /// A failed attempt
    pub fn failed(errno: ErrorCode, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            errno,
            ..Self::default()
        }
    }

    /// Whether the attempt succeeded
    pub fn is_ok(&self) -> bool {
        self.error.is_empty() && self.errno.is_empty()
    }

    /// Result rows, for reads
    pub fn result_rows(&self) -> Option<&DatabaseResult> {
        self.rows.as_ref()
    }

    /// Take the result rows
    pub fn take_rows(&mut self) -> DatabaseResult {
        self.rows.take().unwrap_or_default()
    }

    /// Rows changed, for writes
    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    /// Generated auto-increment value, for inserts
    pub fn insert_id(&self) -> Option<i64> {
        self.insert_id
    }

    /// Error message (empty on success)
    pub fn error(&self) -> &str {
        &self.error
    }

    /// Error code (empty on success)
    pub fn errno(&self) -> &ErrorCode {
        &self.errno
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verb_sniffing() {
        assert_eq!(Query::new("SELECT 1", QueryFlags::empty()).verb(), QueryVerb::Select);
        assert_eq!(
            Query::new("  /* caller */ insert into t (a) values (1)", QueryFlags::empty()).verb(),
            QueryVerb::Insert
        );
        assert_eq!(
            Query::new("ROLLBACK TO SAVEPOINT sp1", QueryFlags::empty()).verb(),
            QueryVerb::RollbackToSavepoint
        );
        assert_eq!(Query::new("ROLLBACK", QueryFlags::empty()).verb(), QueryVerb::Rollback);
        assert_eq!(
            Query::new("START TRANSACTION", QueryFlags::empty()).verb(),
            QueryVerb::Begin
        );
        assert_eq!(
            Query::new("WITH x AS (SELECT 1) SELECT * FROM x", QueryFlags::empty()).verb(),
            QueryVerb::Select
        );
    }

    #[test]
    fn test_multiline_leading_comment() {
        let query = Query::new("/* caller\n */ SELECT 1", QueryFlags::empty());
        assert_eq!(query.verb(), QueryVerb::Select);
        assert!(!query.is_write());

        let query = Query::new(
            "/* Maintenance::run\n * batch 3\n */\n-- retry\nDELETE FROM jobs WHERE id = 1",
            QueryFlags::empty(),
        );
        assert_eq!(query.verb(), QueryVerb::Delete);
        assert_eq!(query.write_table(), Some("jobs"));
    }

    #[test]
    fn test_server_wait() {
        let q = Query::new("SELECT GET_LOCK('job', 10)", QueryFlags::CHANGE_LOCKS);
        assert_eq!(q.server_wait(), Duration::ZERO);
        let q = q.with_server_wait(Duration::from_secs(10));
        assert_eq!(q.server_wait(), Duration::from_secs(10));
        assert_eq!(q.verb(), QueryVerb::Select);
    }

    #[test]
    fn test_write_detection() {
        assert!(Query::new("DELETE FROM t WHERE id = 1", QueryFlags::empty()).is_write());
        assert!(!Query::new("SELECT * FROM t", QueryFlags::empty()).is_write());
        assert!(!Query::new("BEGIN", QueryFlags::empty()).is_write());
        assert!(!Query::new("UPDATE t SET a = 1", QueryFlags::CHANGE_NONE).is_write());
        assert!(Query::new("SELECT nextval('s')", QueryFlags::CHANGE_ROWS).is_write());
    }

    #[test]
    fn test_write_table() {
        let q = Query::new("INSERT INTO \"page\" (a) VALUES (1)", QueryFlags::empty());
        assert_eq!(q.write_table(), Some("page"));

        let q = Query::new("UPDATE `user` SET a = 1", QueryFlags::empty());
        assert_eq!(q.write_table(), Some("user"));

        let q = Query::new("CREATE TABLE IF NOT EXISTS t (id INT)", QueryFlags::empty());
        assert_eq!(q.write_table(), Some("t"));

        assert_eq!(Query::new("SELECT 1", QueryFlags::empty()).write_table(), None);
    }

    #[test]
    fn test_composite_flags() {
        assert!(QueryFlags::CHANGE_TRX.contains(QueryFlags::IGNORE_DBO_TRX));
        assert!(QueryFlags::CHANGE_LOCKS.contains(QueryFlags::IGNORE_DBO_TRX));
        assert!(!QueryFlags::CHANGE_ROWS.contains(QueryFlags::IGNORE_DBO_TRX));
    }

    #[test]
    fn test_status() {
        let ok = QueryStatus::affected(2, Some(7));
        assert!(ok.is_ok());
        assert_eq!(ok.affected_rows(), 2);
        assert_eq!(ok.insert_id(), Some(7));

        let failed = QueryStatus::failed(ErrorCode::numeric(1213), "Deadlock");
        assert!(!failed.is_ok());
        assert_eq!(failed.errno().as_i64(), Some(1213));
    }
}
