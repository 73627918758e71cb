//! Database backend drivers
//!
//! Every backend implements [`SqlDialect`] (pure SQL text generation) and
//! [`BackendDriver`] (native I/O plus error classification). The connection
//! core only ever talks to a `Box<dyn BackendDriver>`.

use crate::core::config::ConnectionConfig;
use crate::core::database_types::DatabaseType;
use crate::core::error::{QueryErrorKind, Result};
use crate::core::query::{ErrorCode, Query, QueryStatus};
use crate::core::query_builder::{LikeMatch, SelectOptions};
use crate::core::value::DatabaseValue;
use crate::core::DatabaseError;
use async_trait::async_trait;
use locks::LockManager;
use std::time::Duration;

pub mod locks;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "mysql")]
pub mod mysql;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteDriver;

#[cfg(feature = "postgres")]
pub use postgres::PostgresDriver;

#[cfg(feature = "mysql")]
pub use mysql::MysqlDriver;

/// Escape character used in generated LIKE patterns
pub const LIKE_ESCAPE_CHAR: char = '`';

/// How a backend writes "insert or update on key conflict"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertStyle {
    /// `INSERT ... ON CONFLICT (key) DO UPDATE SET ...`
    OnConflict,
    /// `INSERT ... ON DUPLICATE KEY UPDATE ...`
    OnDuplicateKey,
}

/// How a backend writes "delete conflicting rows then insert"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceStyle {
    /// `REPLACE INTO ...`
    Native,
    /// DELETE + INSERT inside an atomic section
    Emulated,
}

/// How `INSERT IGNORE` is spelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertIgnoreStyle {
    /// `INSERT IGNORE INTO`
    Keyword,
    /// `INSERT OR IGNORE INTO`
    OrIgnore,
    /// `... ON CONFLICT DO NOTHING`
    OnConflictDoNothing,
}

/// What selecting another database costs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseSwitch {
    /// A statement (`USE db`) on the live session
    Statement,
    /// A fresh session to the other database
    Reconnect,
    /// Not possible on an open handle
    Unsupported,
}

/// Server-side named lock statements
///
/// Each statement returns a single row whose first column is truthy on
/// success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockStatements {
    pub acquire: String,
    /// The server waits up to the timeout itself; otherwise the caller polls
    pub blocking: bool,
    pub release: String,
    pub is_free: String,
}

/// Statement reporting replication lag, and the column to read it from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LagQuery {
    pub sql: String,
    pub column: String,
}

/// SQL text generation for one backend family
pub trait SqlDialect: Send + Sync {
    /// Backend family
    fn database_type(&self) -> DatabaseType;

    /// Quote one identifier (no dots are interpreted)
    fn add_identifier_quotes(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    /// Whether `name` is already wrapped in identifier quotes
    fn is_quoted_identifier(&self, name: &str) -> bool {
        name.len() >= 2 && name.starts_with('"') && name.ends_with('"')
    }

    /// Quote a string literal
    fn quote_string(&self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    /// Quote a binary literal
    fn quote_bytes(&self, value: &[u8]) -> String {
        format!("X'{}'", hex::encode_upper(value))
    }

    fn quote_bool(&self, value: bool) -> String {
        if value { "1" } else { "0" }.to_string()
    }

    /// Render a value as an SQL literal
    fn add_quotes(&self, value: &DatabaseValue) -> String {
        match value {
            DatabaseValue::Null => "NULL".to_string(),
            DatabaseValue::Bool(v) => self.quote_bool(*v),
            DatabaseValue::Int(v) => v.to_string(),
            DatabaseValue::Long(v) => v.to_string(),
            DatabaseValue::Timestamp(v) => v.to_string(),
            DatabaseValue::Float(v) => format_float(f64::from(*v)),
            DatabaseValue::Double(v) => format_float(*v),
            DatabaseValue::String(s) => self.quote_string(s),
            DatabaseValue::Bytes(b) => self.quote_bytes(b),
        }
    }

    /// ` LIKE '<pattern>' ESCAPE '`'` with wildcard characters of literal
    /// parts escaped
    fn build_like(&self, parts: &[LikeMatch]) -> String {
        let mut pattern = String::new();
        for part in parts {
            match part {
                LikeMatch::Literal(text) => {
                    for c in text.chars() {
                        if c == '%' || c == '_' || c == LIKE_ESCAPE_CHAR {
                            pattern.push(LIKE_ESCAPE_CHAR);
                        }
                        pattern.push(c);
                    }
                }
                LikeMatch::AnyString => pattern.push('%'),
                LikeMatch::AnyChar => pattern.push('_'),
            }
        }
        format!(
            " LIKE {} ESCAPE '{}'",
            self.quote_string(&pattern),
            LIKE_ESCAPE_CHAR
        )
    }

    /// Schemas group tables inside one database
    fn supports_schemas(&self) -> bool {
        false
    }

    /// A session sees one database only
    fn databases_are_independent(&self) -> bool {
        false
    }

    /// How another database is selected
    fn database_switch(&self) -> DatabaseSwitch {
        if self.databases_are_independent() {
            DatabaseSwitch::Reconnect
        } else {
            DatabaseSwitch::Statement
        }
    }

    /// Statement selecting another database on the live session
    fn use_database_sql(&self, database: &str) -> String {
        format!("USE {}", self.add_identifier_quotes(database))
    }

    /// Statement selecting another schema
    fn set_schema_sql(&self, schema: &str) -> Option<String> {
        let _ = schema;
        None
    }

    fn upsert_style(&self) -> UpsertStyle {
        UpsertStyle::OnConflict
    }

    fn replace_style(&self) -> ReplaceStyle {
        ReplaceStyle::Emulated
    }

    fn insert_ignore_style(&self) -> InsertIgnoreStyle {
        InsertIgnoreStyle::OnConflictDoNothing
    }

    /// Reference to the value an upsert tried to insert into `column`
    fn build_excluded_value(&self, column: &str) -> String {
        format!("excluded.{}", self.add_identifier_quotes(column))
    }

    fn begin_sql(&self) -> String {
        "BEGIN".to_string()
    }

    fn commit_sql(&self) -> String {
        "COMMIT".to_string()
    }

    fn rollback_sql(&self) -> String {
        "ROLLBACK".to_string()
    }

    fn savepoint_sql(&self, name: &str) -> String {
        format!("SAVEPOINT {}", self.add_identifier_quotes(name))
    }

    fn release_savepoint_sql(&self, name: &str) -> String {
        format!("RELEASE SAVEPOINT {}", self.add_identifier_quotes(name))
    }

    fn rollback_to_savepoint_sql(&self, name: &str) -> String {
        format!("ROLLBACK TO SAVEPOINT {}", self.add_identifier_quotes(name))
    }

    /// Server-side named lock statements; `None` means the driver manages
    /// locks out of band through `do_lock` and friends
    fn lock_statements(&self, name: &str, timeout: Duration) -> Option<LockStatements> {
        let _ = (name, timeout);
        None
    }

    /// ` LIMIT n [OFFSET m]`
    fn limit_clause(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        match (limit, offset) {
            (Some(limit), Some(offset)) => format!(" LIMIT {} OFFSET {}", limit, offset),
            (Some(limit), None) => format!(" LIMIT {}", limit),
            (None, Some(offset)) => format!(" LIMIT -1 OFFSET {}", offset),
            (None, None) => String::new(),
        }
    }
}

/// Native I/O for one backend
#[async_trait]
pub trait BackendDriver: SqlDialect {
    /// Open a session; failures are `DatabaseError::Connection`
    async fn open(&mut self, config: &ConnectionConfig) -> Result<()>;

    /// Close the session, releasing anything it held
    async fn close(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// This driver as its SQL dialect
    fn dialect(&self) -> &dyn SqlDialect;

    /// Whether the session still answers
    async fn ping(&mut self) -> bool;

    /// Run exactly one statement and report what happened
    async fn do_single_statement_query(&mut self, query: &Query) -> QueryStatus;

    /// The error means the session is gone
    fn is_connection_error(&self, errno: &ErrorCode) -> bool;

    /// The error is a statement timeout
    fn is_query_timeout_error(&self, errno: &ErrorCode) -> bool;

    /// The server rolled back only the failed statement, so an open
    /// transaction stays usable
    fn is_known_statement_rollback_error(&self, errno: &ErrorCode) -> bool;

    /// Map a backend error code onto the common classification
    fn classify_error(&self, errno: &ErrorCode) -> QueryErrorKind {
        if self.is_connection_error(errno) {
            QueryErrorKind::ConnectionLost
        } else if self.is_query_timeout_error(errno) {
            QueryErrorKind::QueryTimeout
        } else {
            QueryErrorKind::Other
        }
    }

    /// Acquire a named lock out of band
    async fn do_lock(&mut self, name: &str, timeout: Duration) -> Result<bool> {
        let _ = (name, timeout);
        Err(DatabaseError::unexpected(format!(
            "{} has no out-of-band lock manager",
            self.database_type()
        )))
    }

    /// Release a named lock out of band
    async fn do_unlock(&mut self, name: &str) -> Result<bool> {
        let _ = name;
        Err(DatabaseError::unexpected(format!(
            "{} has no out-of-band lock manager",
            self.database_type()
        )))
    }

    /// Whether a named lock is free, out of band
    async fn do_lock_is_free(&mut self, name: &str) -> Result<bool> {
        let _ = name;
        Err(DatabaseError::unexpected(format!(
            "{} has no out-of-band lock manager",
            self.database_type()
        )))
    }

    /// Handle on the out-of-band lock manager, usable without the driver;
    /// lets a dropped scoped lock release itself while the session is idle
    fn lock_manager(&self) -> Option<LockManager> {
        None
    }

    /// Server software and version
    async fn server_info(&mut self) -> Result<String>;

    /// Statement reporting replication lag, for backends that replicate
    fn lag_query(&self) -> Option<LagQuery> {
        None
    }

    /// Whether INSERT...SELECT may run natively with these select options
    fn is_insert_select_safe(&self, options: &SelectOptions) -> bool {
        let _ = options;
        true
    }

    /// Normalize the affected-row count of a replace or upsert
    fn adjust_upsert_affected_rows(&self, affected: u64, row_count: usize) -> u64 {
        let _ = row_count;
        affected
    }
}

fn format_float(v: f64) -> String {
    if v.is_finite() {
        let s = v.to_string();
        if s.contains('.') || s.contains('e') {
            s
        } else {
            format!("{}.0", s)
        }
    } else {
        "NULL".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain;

    impl SqlDialect for Plain {
        fn database_type(&self) -> DatabaseType {
            DatabaseType::Sqlite
        }
    }

    #[test]
    fn test_default_quoting() {
        let d = Plain;
        assert_eq!(d.add_identifier_quotes("a\"b"), "\"a\"\"b\"");
        assert_eq!(d.add_quotes(&"it's".into()), "'it''s'");
        assert_eq!(d.add_quotes(&DatabaseValue::Null), "NULL");
        assert_eq!(d.add_quotes(&DatabaseValue::Bool(true)), "1");
        assert_eq!(d.add_quotes(&DatabaseValue::Double(2.0)), "2.0");
        assert_eq!(d.add_quotes(&DatabaseValue::Bytes(vec![0xab, 0x01])), "X'AB01'");
    }

    #[test]
    fn test_build_like_escapes_wildcards() {
        let d = Plain;
        let like = d.build_like(&[
            LikeMatch::Literal("50%_off`".into()),
            LikeMatch::AnyString,
        ]);
        assert_eq!(like, " LIKE '50`%`_off``%' ESCAPE '`'");
    }

    #[test]
    fn test_limit_clause() {
        let d = Plain;
        assert_eq!(d.limit_clause(Some(5), None), " LIMIT 5");
        assert_eq!(d.limit_clause(Some(5), Some(10)), " LIMIT 5 OFFSET 10");
        assert_eq!(d.limit_clause(None, None), "");
    }
}
