//! SQLite backend driver
//!
//! Each statement runs on the blocking thread pool against a
//! `rusqlite::Connection` guarded by an async mutex. A statement that outlives
//! the receive timeout is interrupted through the connection's interrupt
//! handle.

use super::locks::LockManager;
use super::{BackendDriver, DatabaseSwitch, InsertIgnoreStyle, ReplaceStyle, SqlDialect, UpsertStyle};
use crate::core::config::{ConnectionConfig, SqliteTrxMode};
use crate::core::database_types::DatabaseType;
use crate::core::error::{DatabaseError, QueryErrorKind, Result};
use crate::core::query::{ErrorCode, Query, QueryStatus};
use crate::core::value::{DatabaseRow, DatabaseValue};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{Connection, InterruptHandle, Row};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Primary result codes (extended codes are masked down to these)
const SQLITE_ERROR: i64 = 1;
const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;
const SQLITE_READONLY: i64 = 8;
const SQLITE_INTERRUPT: i64 = 9;
const SQLITE_CANTOPEN: i64 = 14;
const SQLITE_TOOBIG: i64 = 18;
const SQLITE_CONSTRAINT: i64 = 19;
const SQLITE_MISMATCH: i64 = 20;
const SQLITE_RANGE: i64 = 25;

static PRAGMA_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_]+$").expect("valid regex"));
static PRAGMA_VALUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_\-]+$").expect("valid regex"));

/// SQLite driver
pub struct SqliteDriver {
    connection: Arc<Mutex<Option<Connection>>>,
    interrupt: Option<InterruptHandle>,
    locks: Option<LockManager>,
    trx_mode: SqliteTrxMode,
    timeout: Duration,
    path: Option<String>,
}

impl SqliteDriver {
    /// Create an unopened driver
    pub fn new() -> Self {
        Self {
            connection: Arc::new(Mutex::new(None)),
            interrupt: None,
            locks: None,
            trx_mode: SqliteTrxMode::Deferred,
            timeout: Duration::from_secs(30),
            path: None,
        }
    }

    /// Database file the driver opened (or `:memory:`)
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Resolve the database file from the config
    pub fn database_path(config: &ConnectionConfig) -> Result<String> {
        if let Some(path) = &config.db_file_path {
            return Ok(path.clone());
        }
        match (&config.db_directory, &config.dbname) {
            (Some(dir), Some(name)) => Ok(Path::new(dir)
                .join(format!("{}.sqlite", name))
                .to_string_lossy()
                .into_owned()),
            _ => Err(DatabaseError::connection(
                config.display_server(),
                "SQLite needs either dbFilePath or dbDirectory plus dbname",
            )),
        }
    }

    fn lock_manager_for(config: &ConnectionConfig, path: &str) -> LockManager {
        if let Some(dir) = &config.lock_directory {
            return LockManager::files(dir);
        }
        if let Some(dir) = &config.db_directory {
            return LockManager::files(Path::new(dir).join("locks"));
        }
        LockManager::memory(path)
    }

    /// Convert a rusqlite Row to a DatabaseRow
    fn row_to_database_row(row: &Row) -> rusqlite::Result<DatabaseRow> {
        let mut db_row = DatabaseRow::new();
        let column_count = row.as_ref().column_count();

        for i in 0..column_count {
            let column_name = row.as_ref().column_name(i)?.to_string();
            let value = match row.get_ref(i)? {
                rusqlite::types::ValueRef::Null => DatabaseValue::Null,
                rusqlite::types::ValueRef::Integer(v) => DatabaseValue::Long(v),
                rusqlite::types::ValueRef::Real(v) => DatabaseValue::Double(v),
                rusqlite::types::ValueRef::Text(v) => {
                    DatabaseValue::String(String::from_utf8_lossy(v).to_string())
                }
                rusqlite::types::ValueRef::Blob(v) => DatabaseValue::Bytes(v.to_vec()),
            };
            db_row.insert(column_name, value);
        }

        Ok(db_row)
    }

    fn run_statement(conn: &Connection, sql: &str, wants_insert_id: bool) -> rusqlite::Result<QueryStatus> {
        let mut stmt = conn.prepare(sql)?;
        if stmt.column_count() > 0 {
            let rows = stmt.query_map([], Self::row_to_database_row)?;
            let mut results = Vec::new();
            for row_result in rows {
                results.push(row_result?);
            }
            return Ok(QueryStatus::rows(results));
        }
        let affected = stmt.execute([])? as u64;
        let insert_id = if wants_insert_id && affected > 0 {
            Some(conn.last_insert_rowid())
        } else {
            None
        };
        Ok(QueryStatus::affected(affected, insert_id))
    }

    fn status_from_error(error: &rusqlite::Error) -> QueryStatus {
        match error {
            rusqlite::Error::SqliteFailure(err, message) => QueryStatus::failed(
                ErrorCode::numeric(i64::from(err.extended_code & 0xff)),
                message.clone().unwrap_or_else(|| err.to_string()),
            ),
            other => QueryStatus::failed(ErrorCode::numeric(SQLITE_ERROR), other.to_string()),
        }
    }

    fn code(errno: &ErrorCode) -> i64 {
        errno.as_i64().unwrap_or(SQLITE_ERROR)
    }

    fn locks(&self) -> Result<&LockManager> {
        self.locks
            .as_ref()
            .ok_or_else(|| DatabaseError::unexpected("SQLite lock manager used before open()"))
    }
}

impl Default for SqliteDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SqlDialect for SqliteDriver {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Sqlite
    }

    fn databases_are_independent(&self) -> bool {
        true
    }

    fn database_switch(&self) -> DatabaseSwitch {
        DatabaseSwitch::Unsupported
    }

    fn upsert_style(&self) -> UpsertStyle {
        UpsertStyle::OnConflict
    }

    fn replace_style(&self) -> ReplaceStyle {
        ReplaceStyle::Native
    }

    fn insert_ignore_style(&self) -> InsertIgnoreStyle {
        InsertIgnoreStyle::OrIgnore
    }

    fn begin_sql(&self) -> String {
        self.trx_mode.begin_sql().to_string()
    }
}

#[async_trait]
impl BackendDriver for SqliteDriver {
    async fn open(&mut self, config: &ConnectionConfig) -> Result<()> {
        self.close().await?;

        let path = Self::database_path(config)?;
        for (name, value) in &config.variables {
            if !PRAGMA_NAME.is_match(name) || !PRAGMA_VALUE.is_match(value) {
                return Err(DatabaseError::unexpected(format!(
                    "Invalid SQLite pragma '{}' = '{}'",
                    name, value
                )));
            }
        }

        let server = config.display_server();
        let busy_timeout = config.connect_timeout();
        let variables = config.variables.clone();
        let open_path = path.clone();
        let connection_arc = Arc::clone(&self.connection);

        // Offload blocking database operations to blocking thread pool with timeout
        let mut task = tokio::task::spawn_blocking(move || -> rusqlite::Result<InterruptHandle> {
            let conn = Connection::open(&open_path)?;
            conn.busy_timeout(busy_timeout)?;
            conn.execute_batch("PRAGMA foreign_keys = ON")?;
            for (name, value) in &variables {
                conn.execute_batch(&format!("PRAGMA {} = {}", name, value))?;
            }
            let interrupt = conn.get_interrupt_handle();

            let mut connection = connection_arc.blocking_lock();
            *connection = Some(conn);
            Ok(interrupt)
        });

        let interrupt = tokio::select! {
            result = &mut task => {
                result
                    .map_err(|e| DatabaseError::connection(&server, format!("Task join error: {}", e)))?
                    .map_err(|e| DatabaseError::connection_with_source(&server, format!("Cannot open {}", path), Box::new(e)))?
            }
            _ = tokio::time::sleep(config.connect_timeout()) => {
                task.abort();
                return Err(DatabaseError::connection(&server, format!("Timed out opening {}", path)));
            }
        };

        self.interrupt = Some(interrupt);
        if let Some(stale) = self.locks.replace(Self::lock_manager_for(config, &path)) {
            stale.release_all();
        }
        self.trx_mode = config.trx_mode;
        self.timeout = config.statement_timeout();
        tracing::debug!(target: "rdbms::connection", path = %path, "opened SQLite database");
        self.path = Some(path);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(locks) = self.locks.take() {
            locks.release_all();
        }
        self.interrupt = None;
        let mut connection = self.connection.lock().await;
        *connection = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.connection
            .try_lock()
            .map(|conn| conn.is_some())
            .unwrap_or(true)
    }

    fn dialect(&self) -> &dyn SqlDialect {
        self
    }

    async fn ping(&mut self) -> bool {
        let status = self
            .do_single_statement_query(&Query::new("SELECT 1", Default::default()))
            .await;
        status.is_ok()
    }

    async fn do_single_statement_query(&mut self, query: &Query) -> QueryStatus {
        let sql = query.sql().to_string();
        let wants_insert_id = query.verb().generates_insert_id();
        let connection_arc = Arc::clone(&self.connection);

        let mut task = tokio::task::spawn_blocking(move || -> QueryStatus {
            let connection = connection_arc.blocking_lock();
            let Some(conn) = connection.as_ref() else {
                return QueryStatus::failed(
                    ErrorCode::numeric(SQLITE_CANTOPEN),
                    "Not connected to database",
                );
            };
            Self::run_statement(conn, &sql, wants_insert_id)
                .unwrap_or_else(|e| Self::status_from_error(&e))
        });

        tokio::select! {
            result = &mut task => {
                result.unwrap_or_else(|e| {
                    QueryStatus::failed(ErrorCode::numeric(SQLITE_ERROR), format!("Task join error: {}", e))
                })
            }
            _ = tokio::time::sleep(self.timeout) => {
                if let Some(handle) = &self.interrupt {
                    handle.interrupt();
                }
                // The interrupted statement returns promptly; wait so the
                // handle is free for the next statement
                match task.await {
                    Ok(status) if status.is_ok() => status,
                    _ => QueryStatus::failed(
                        ErrorCode::numeric(SQLITE_INTERRUPT),
                        format!("Statement exceeded the {}s timeout", self.timeout.as_secs()),
                    ),
                }
            }
        }
    }

    fn is_connection_error(&self, errno: &ErrorCode) -> bool {
        Self::code(errno) == SQLITE_CANTOPEN
    }

    fn is_query_timeout_error(&self, errno: &ErrorCode) -> bool {
        Self::code(errno) == SQLITE_INTERRUPT
    }

    fn is_known_statement_rollback_error(&self, errno: &ErrorCode) -> bool {
        matches!(
            Self::code(errno),
            SQLITE_BUSY | SQLITE_TOOBIG | SQLITE_CONSTRAINT | SQLITE_MISMATCH | SQLITE_RANGE
        )
    }

    fn classify_error(&self, errno: &ErrorCode) -> QueryErrorKind {
        match Self::code(errno) {
            SQLITE_BUSY | SQLITE_LOCKED => QueryErrorKind::LockWaitTimeout,
            SQLITE_INTERRUPT => QueryErrorKind::QueryTimeout,
            SQLITE_READONLY => QueryErrorKind::ReadOnly,
            SQLITE_CANTOPEN => QueryErrorKind::ConnectionLost,
            _ => QueryErrorKind::Other,
        }
    }

    async fn do_lock(&mut self, name: &str, timeout: Duration) -> Result<bool> {
        self.locks()?.lock(name, timeout).await
    }

    async fn do_unlock(&mut self, name: &str) -> Result<bool> {
        self.locks()?.unlock(name)
    }

    async fn do_lock_is_free(&mut self, name: &str) -> Result<bool> {
        self.locks()?.is_free(name)
    }

    fn lock_manager(&self) -> Option<LockManager> {
        self.locks.clone()
    }

    async fn server_info(&mut self) -> Result<String> {
        Ok(rusqlite::version().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::query::QueryFlags;

    fn q(sql: &str) -> Query {
        Query::new(sql, QueryFlags::empty())
    }

    async fn open_memory() -> SqliteDriver {
        let mut driver = SqliteDriver::new();
        driver
            .open(&ConnectionConfig::sqlite(":memory:"))
            .await
            .unwrap();
        driver
    }

    #[tokio::test]
    async fn test_sqlite_open_close() {
        let mut driver = open_memory().await;
        assert!(driver.is_open());
        assert!(driver.ping().await);
        driver.close().await.unwrap();
        assert!(!driver.is_open());

        let status = driver.do_single_statement_query(&q("SELECT 1")).await;
        assert!(driver.is_connection_error(status.errno()));
    }

    #[tokio::test]
    async fn test_sqlite_rows_and_writes() {
        let mut driver = open_memory().await;
        let status = driver
            .do_single_statement_query(&q("CREATE TABLE test (id INTEGER PRIMARY KEY, name TEXT)"))
            .await;
        assert!(status.is_ok());

        let status = driver
            .do_single_statement_query(&q("INSERT INTO test (name) VALUES ('Alice')"))
            .await;
        assert_eq!(status.affected_rows(), 1);
        assert_eq!(status.insert_id(), Some(1));

        let mut status = driver
            .do_single_statement_query(&q("SELECT * FROM test"))
            .await;
        let rows = status.take_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name").unwrap().as_string(), "Alice");
    }

    #[tokio::test]
    async fn test_sqlite_error_codes() {
        let mut driver = open_memory().await;
        driver
            .do_single_statement_query(&q("CREATE TABLE u (id INTEGER PRIMARY KEY)"))
            .await;
        driver
            .do_single_statement_query(&q("INSERT INTO u (id) VALUES (1)"))
            .await;

        let dup = driver
            .do_single_statement_query(&q("INSERT INTO u (id) VALUES (1)"))
            .await;
        assert_eq!(dup.errno().as_i64(), Some(SQLITE_CONSTRAINT));
        assert!(driver.is_known_statement_rollback_error(dup.errno()));
        assert_eq!(driver.classify_error(dup.errno()), QueryErrorKind::Other);

        let missing = driver
            .do_single_statement_query(&q("SELECT * FROM nope"))
            .await;
        assert_eq!(missing.errno().as_i64(), Some(SQLITE_ERROR));
        assert!(!driver.is_connection_error(missing.errno()));
    }

    #[tokio::test]
    async fn test_sqlite_pragmas_from_variables() {
        let mut config = ConnectionConfig::sqlite(":memory:");
        config.variables.insert("cache_size".into(), "-4000".into());
        let mut driver = SqliteDriver::new();
        driver.open(&config).await.unwrap();

        let mut status = driver
            .do_single_statement_query(&q("PRAGMA cache_size"))
            .await;
        let rows = status.take_rows();
        assert_eq!(rows[0].get_index(0).unwrap().as_long(), Some(-4000));

        config.variables.insert("x; DROP".into(), "1".into());
        assert!(driver.open(&config).await.is_err());
    }

    #[test]
    fn test_database_path() {
        let config = ConnectionConfig::builder()
            .db_directory("/data")
            .database("wiki")
            .build();
        assert_eq!(
            SqliteDriver::database_path(&config).unwrap(),
            Path::new("/data").join("wiki.sqlite").to_string_lossy()
        );
        assert!(SqliteDriver::database_path(&ConnectionConfig::default()).is_err());
    }

    #[test]
    fn test_begin_sql_follows_trx_mode() {
        let mut driver = SqliteDriver::new();
        assert_eq!(driver.begin_sql(), "BEGIN");
        driver.trx_mode = SqliteTrxMode::Immediate;
        assert_eq!(driver.begin_sql(), "BEGIN IMMEDIATE");
    }
}
