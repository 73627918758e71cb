//! MySQL / MariaDB backend driver
//!
//! Uses `mysql_async` over the text protocol. Result values arrive as bytes
//! and are typed from the column metadata. Named locks use the server's
//! `GET_LOCK()` family and databases are switched with `USE`.

use super::locks::hash_lock_name;
use super::{BackendDriver, InsertIgnoreStyle, LagQuery, LockStatements, ReplaceStyle, SqlDialect, UpsertStyle};
use crate::core::config::{ConnectionConfig, ConnectionFlags};
use crate::core::database_types::DatabaseType;
use crate::core::error::{DatabaseError, QueryErrorKind, Result};
use crate::core::query::{ErrorCode, Query, QueryStatus};
use crate::core::query_builder::SelectOptions;
use crate::core::value::{DatabaseRow, DatabaseValue};
use async_trait::async_trait;
use mysql_async::consts::ColumnType;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, OptsBuilder, Row, Value};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const ER_DUP_KEYNAME: i64 = 1022;
const ER_BAD_NULL_ERROR: i64 = 1048;
const ER_BAD_TABLE_ERROR: i64 = 1051;
const ER_SERVER_SHUTDOWN: i64 = 1053;
const ER_BAD_FIELD_ERROR: i64 = 1054;
const ER_DUP_ENTRY: i64 = 1062;
const ER_TOO_MANY_ROWS: i64 = 1137;
const ER_NO_SUCH_TABLE: i64 = 1146;
const ER_LOCK_WAIT_TIMEOUT: i64 = 1205;
const ER_LOCK_DEADLOCK: i64 = 1213;
const ER_NO_REFERENCED_ROW: i64 = 1216;
const ER_ROW_IS_REFERENCED: i64 = 1217;
const ER_WARN_DATA_OUT_OF_RANGE: i64 = 1264;
const ER_OPTION_PREVENTS_STATEMENT: i64 = 1290;
const ER_CANT_EXECUTE_IN_READ_ONLY_TRANSACTION: i64 = 1792;
const ER_READ_ONLY_MODE: i64 = 1836;
const ER_CONNECTION_KILLED: i64 = 1927;
const ER_STATEMENT_TIMEOUT: i64 = 1969;
const ER_QUERY_TIMEOUT: i64 = 3024;
const ER_CLIENT_INTERACTION_TIMEOUT: i64 = 4031;
const CR_CONN_HOST_ERROR: i64 = 2003;
const CR_SERVER_GONE_ERROR: i64 = 2006;
const CR_SERVER_LOST: i64 = 2013;
const CR_NET_READ_INTERRUPTED: i64 = 2062;

const MAX_LOCK_NAME_BYTES: usize = 64;
const BINARY_CHARSET: u16 = 63;

static VARIABLE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"));

/// MySQL / MariaDB driver
pub struct MysqlDriver {
    conn: Arc<Mutex<Option<Conn>>>,
    server: String,
    timeout: Duration,
}

impl MysqlDriver {
    /// Create an unopened driver
    pub fn new() -> Self {
        Self {
            conn: Arc::new(Mutex::new(None)),
            server: String::new(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Server-side lock name; names over 64 bytes keep a readable prefix and
    /// a hash of the whole name
    pub fn lock_name(name: &str) -> String {
        if name.len() <= MAX_LOCK_NAME_BYTES {
            return name.to_string();
        }
        let hash = hash_lock_name(name);
        let mut cut = MAX_LOCK_NAME_BYTES - 33;
        while !name.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}:{}", &name[..cut], &hash[..32])
    }

    /// `GET_LOCK()` takes whole seconds; round up so a short wait still waits
    fn lock_wait_secs(timeout: Duration) -> u64 {
        timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0)
    }

    fn options(config: &ConnectionConfig, driver: &MysqlDriver) -> Result<OptsBuilder> {
        let mut init = vec!["SET NAMES utf8mb4".to_string()];
        for (name, value) in &config.variables {
            if !VARIABLE_NAME.is_match(name) {
                return Err(DatabaseError::unexpected(format!(
                    "Invalid MySQL session variable '{}'",
                    name
                )));
            }
            init.push(format!("SET SESSION {} = {}", name, driver.quote_string(value)));
        }

        let mut opts = OptsBuilder::default()
            .ip_or_hostname(config.host.clone().unwrap_or_else(|| "localhost".to_string()))
            .tcp_port(config.port.unwrap_or(3306))
            .user(config.user.clone())
            .pass(config.password.clone())
            .db_name(config.dbname.clone())
            .init(init);
        if config.has_flag(ConnectionFlags::SSL) {
            opts = opts.ssl_opts(Some(mysql_async::SslOpts::default()));
        }
        if config.has_flag(ConnectionFlags::COMPRESS) {
            opts = opts.compression(Some(mysql_async::Compression::default()));
        }
        Ok(opts)
    }

    fn convert_value(value: &Value, column_type: ColumnType, binary: bool) -> DatabaseValue {
        match value {
            Value::NULL => DatabaseValue::Null,
            Value::Int(v) => DatabaseValue::Long(*v),
            Value::UInt(v) => i64::try_from(*v)
                .map(DatabaseValue::Long)
                .unwrap_or_else(|_| DatabaseValue::String(v.to_string())),
            Value::Float(v) => DatabaseValue::Float(*v),
            Value::Double(v) => DatabaseValue::Double(*v),
            Value::Bytes(bytes) => Self::convert_bytes(bytes, column_type, binary),
            Value::Date(y, mo, d, h, mi, s, us) => DatabaseValue::String(format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
                y, mo, d, h, mi, s, us
            )),
            Value::Time(neg, days, h, mi, s, us) => DatabaseValue::String(format!(
                "{}{:02}:{:02}:{:02}.{:06}",
                if *neg { "-" } else { "" },
                u32::from(*h) + days * 24,
                mi,
                s,
                us
            )),
        }
    }

    fn convert_bytes(bytes: &[u8], column_type: ColumnType, binary: bool) -> DatabaseValue {
        let text = || String::from_utf8_lossy(bytes).into_owned();
        match column_type {
            ColumnType::MYSQL_TYPE_TINY
            | ColumnType::MYSQL_TYPE_SHORT
            | ColumnType::MYSQL_TYPE_INT24
            | ColumnType::MYSQL_TYPE_LONG
            | ColumnType::MYSQL_TYPE_LONGLONG
            | ColumnType::MYSQL_TYPE_YEAR => text()
                .parse::<i64>()
                .map(DatabaseValue::Long)
                .unwrap_or_else(|_| DatabaseValue::String(text())),
            ColumnType::MYSQL_TYPE_FLOAT | ColumnType::MYSQL_TYPE_DOUBLE => text()
                .parse::<f64>()
                .map(DatabaseValue::Double)
                .unwrap_or_else(|_| DatabaseValue::String(text())),
            ColumnType::MYSQL_TYPE_TINY_BLOB
            | ColumnType::MYSQL_TYPE_MEDIUM_BLOB
            | ColumnType::MYSQL_TYPE_LONG_BLOB
            | ColumnType::MYSQL_TYPE_BLOB
            | ColumnType::MYSQL_TYPE_STRING
            | ColumnType::MYSQL_TYPE_VAR_STRING
            | ColumnType::MYSQL_TYPE_VARCHAR
            | ColumnType::MYSQL_TYPE_BIT
                if binary =>
            {
                DatabaseValue::Bytes(bytes.to_vec())
            }
            _ => DatabaseValue::String(text()),
        }
    }

    fn row_to_database_row(row: &Row) -> DatabaseRow {
        let mut db_row = DatabaseRow::new();
        for (idx, column) in row.columns_ref().iter().enumerate() {
            let binary = column.character_set() == BINARY_CHARSET;
            let value = row
                .as_ref(idx)
                .map(|v| Self::convert_value(v, column.column_type(), binary))
                .unwrap_or(DatabaseValue::Null);
            db_row.insert(column.name_str().into_owned(), value);
        }
        db_row
    }

    fn status_from_error(error: &mysql_async::Error) -> QueryStatus {
        match error {
            mysql_async::Error::Server(server) => QueryStatus::failed(
                ErrorCode::numeric(i64::from(server.code)),
                server.message.clone(),
            ),
            // Socket and protocol failures leave the session unusable
            other => QueryStatus::failed(ErrorCode::numeric(CR_SERVER_LOST), other.to_string()),
        }
    }

    fn code(errno: &ErrorCode) -> i64 {
        errno.as_i64().unwrap_or(0)
    }
}

impl Default for MysqlDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SqlDialect for MysqlDriver {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Mysql
    }

    fn add_identifier_quotes(&self, name: &str) -> String {
        format!("`{}`", name.replace('`', "``"))
    }

    fn is_quoted_identifier(&self, name: &str) -> bool {
        name.len() >= 2 && name.starts_with('`') && name.ends_with('`')
    }

    fn quote_string(&self, value: &str) -> String {
        let mut quoted = String::with_capacity(value.len() + 2);
        quoted.push('\'');
        for c in value.chars() {
            match c {
                '\\' => quoted.push_str("\\\\"),
                '\'' => quoted.push_str("\\'"),
                '"' => quoted.push_str("\\\""),
                '\0' => quoted.push_str("\\0"),
                '\n' => quoted.push_str("\\n"),
                '\r' => quoted.push_str("\\r"),
                '\x1a' => quoted.push_str("\\Z"),
                c => quoted.push(c),
            }
        }
        quoted.push('\'');
        quoted
    }

    fn upsert_style(&self) -> UpsertStyle {
        UpsertStyle::OnDuplicateKey
    }

    fn replace_style(&self) -> ReplaceStyle {
        ReplaceStyle::Native
    }

    fn insert_ignore_style(&self) -> InsertIgnoreStyle {
        InsertIgnoreStyle::Keyword
    }

    fn build_excluded_value(&self, column: &str) -> String {
        format!("VALUES({})", self.add_identifier_quotes(column))
    }

    fn lock_statements(&self, name: &str, timeout: Duration) -> Option<LockStatements> {
        let name = self.quote_string(&Self::lock_name(name));
        Some(LockStatements {
            acquire: format!("SELECT GET_LOCK({}, {}) AS acquired", name, Self::lock_wait_secs(timeout)),
            blocking: true,
            release: format!("SELECT RELEASE_LOCK({}) AS released", name),
            is_free: format!("SELECT IS_FREE_LOCK({}) AS free", name),
        })
    }

    fn limit_clause(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        match (limit, offset) {
            (Some(limit), Some(offset)) => format!(" LIMIT {} OFFSET {}", limit, offset),
            (Some(limit), None) => format!(" LIMIT {}", limit),
            (None, Some(offset)) => format!(" LIMIT {} OFFSET {}", u64::MAX, offset),
            (None, None) => String::new(),
        }
    }
}

#[async_trait]
impl BackendDriver for MysqlDriver {
    async fn open(&mut self, config: &ConnectionConfig) -> Result<()> {
        self.close().await?;

        let server = config.display_server();
        let opts = Self::options(config, self)?;
        let conn = tokio::time::timeout(config.connect_timeout(), Conn::new(opts))
            .await
            .map_err(|_| DatabaseError::connection(&server, "Timed out connecting"))?
            .map_err(|e| DatabaseError::connection_with_source(&server, "Cannot connect", Box::new(e)))?;

        *self.conn.lock().await = Some(conn);
        self.timeout = config.statement_timeout();
        tracing::debug!(target: "rdbms::connection", server = %server, "opened MySQL connection");
        self.server = server;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let conn = self.conn.lock().await.take();
        if let Some(conn) = conn {
            if let Err(e) = conn.disconnect().await {
                tracing::debug!(target: "rdbms::connection", server = %self.server, error = %e, "MySQL disconnect failed");
            }
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.conn
            .try_lock()
            .map(|conn| conn.is_some())
            .unwrap_or(true)
    }

    fn dialect(&self) -> &dyn SqlDialect {
        self
    }

    async fn ping(&mut self) -> bool {
        let mut guard = self.conn.lock().await;
        let Some(conn) = guard.as_mut() else {
            return false;
        };
        matches!(tokio::time::timeout(self.timeout, conn.ping()).await, Ok(Ok(())))
    }

    async fn do_single_statement_query(&mut self, query: &Query) -> QueryStatus {
        let mut guard = self.conn.lock().await;
        let Some(conn) = guard.as_mut() else {
            return QueryStatus::failed(
                ErrorCode::numeric(CR_SERVER_GONE_ERROR),
                "Not connected to database",
            );
        };

        let wants_insert_id = query.verb().generates_insert_id();
        let work = async {
            let rows: Vec<Row> = conn.query(query.sql()).await?;
            Ok::<_, mysql_async::Error>((rows, conn.affected_rows(), conn.last_insert_id()))
        };

        let limit = self.timeout + query.server_wait();
        match tokio::time::timeout(limit, work).await {
            Ok(Ok((rows, affected, last_insert_id))) => {
                let insert_id = if wants_insert_id {
                    last_insert_id.and_then(|id| i64::try_from(id).ok()).filter(|id| *id > 0)
                } else {
                    None
                };
                if rows.is_empty() && query.is_write() {
                    return QueryStatus::affected(affected, insert_id);
                }
                QueryStatus::rows(rows.iter().map(Self::row_to_database_row).collect())
                    .with_affected_rows(if query.is_write() { affected } else { 0 })
                    .with_insert_id(insert_id)
            }
            Ok(Err(e)) => Self::status_from_error(&e),
            Err(_) => {
                // The protocol state is unknown after an abandoned read
                guard.take();
                QueryStatus::failed(
                    ErrorCode::numeric(CR_NET_READ_INTERRUPTED),
                    format!("Statement exceeded the {:?} timeout", limit),
                )
            }
        }
    }

    fn is_connection_error(&self, errno: &ErrorCode) -> bool {
        matches!(
            Self::code(errno),
            CR_CONN_HOST_ERROR
                | CR_SERVER_GONE_ERROR
                | CR_SERVER_LOST
                | ER_SERVER_SHUTDOWN
                | ER_CONNECTION_KILLED
                | ER_CLIENT_INTERACTION_TIMEOUT
        )
    }

    fn is_query_timeout_error(&self, errno: &ErrorCode) -> bool {
        matches!(
            Self::code(errno),
            ER_QUERY_TIMEOUT | ER_STATEMENT_TIMEOUT | CR_NET_READ_INTERRUPTED
        )
    }

    fn is_known_statement_rollback_error(&self, errno: &ErrorCode) -> bool {
        matches!(
            Self::code(errno),
            ER_DUP_KEYNAME
                | ER_BAD_NULL_ERROR
                | ER_BAD_TABLE_ERROR
                | ER_BAD_FIELD_ERROR
                | ER_DUP_ENTRY
                | ER_TOO_MANY_ROWS
                | ER_NO_SUCH_TABLE
                | ER_LOCK_WAIT_TIMEOUT
                | ER_NO_REFERENCED_ROW
                | ER_ROW_IS_REFERENCED
                | ER_WARN_DATA_OUT_OF_RANGE
        )
    }

    fn classify_error(&self, errno: &ErrorCode) -> QueryErrorKind {
        match Self::code(errno) {
            ER_LOCK_DEADLOCK => QueryErrorKind::Deadlock,
            ER_LOCK_WAIT_TIMEOUT => QueryErrorKind::LockWaitTimeout,
            ER_OPTION_PREVENTS_STATEMENT | ER_READ_ONLY_MODE | ER_CANT_EXECUTE_IN_READ_ONLY_TRANSACTION => {
                QueryErrorKind::ReadOnly
            }
            _ if self.is_query_timeout_error(errno) => QueryErrorKind::QueryTimeout,
            _ if self.is_connection_error(errno) => QueryErrorKind::ConnectionLost,
            _ => QueryErrorKind::Other,
        }
    }

    async fn server_info(&mut self) -> Result<String> {
        let guard = self.conn.lock().await;
        let conn = guard
            .as_ref()
            .ok_or_else(|| DatabaseError::connection(&self.server, "Not connected to database"))?;
        let (major, minor, patch) = conn.server_version();
        Ok(format!("MySQL {}.{}.{}", major, minor, patch))
    }

    fn lag_query(&self) -> Option<LagQuery> {
        Some(LagQuery {
            sql: "SHOW SLAVE STATUS".to_string(),
            column: "Seconds_Behind_Master".to_string(),
        })
    }

    fn is_insert_select_safe(&self, options: &SelectOptions) -> bool {
        // LIMIT without a total order is non-deterministic under
        // statement-based replication
        options.limit.is_none()
    }

    fn adjust_upsert_affected_rows(&self, affected: u64, row_count: usize) -> u64 {
        // A replaced or updated row is counted twice by the server
        affected.min(row_count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::query::QueryFlags;

    #[test]
    fn test_mysql_quoting() {
        let d = MysqlDriver::new();
        assert_eq!(d.add_identifier_quotes("user"), "`user`");
        assert_eq!(d.add_identifier_quotes("a`b"), "`a``b`");
        assert_eq!(d.add_quotes(&"it's \\ here".into()), "'it\\'s \\\\ here'");
        assert_eq!(d.build_excluded_value("hits"), "VALUES(`hits`)");
        assert_eq!(d.use_database_sql("wiki"), "USE `wiki`");
        assert_eq!(
            d.limit_clause(None, Some(3)),
            format!(" LIMIT {} OFFSET 3", u64::MAX)
        );
    }

    #[test]
    fn test_lock_names() {
        assert_eq!(MysqlDriver::lock_name("short"), "short");
        let long = "x".repeat(100);
        let hashed = MysqlDriver::lock_name(&long);
        assert_eq!(hashed.len(), MAX_LOCK_NAME_BYTES);
        assert!(hashed.starts_with("xxxx"));
        assert_ne!(hashed, MysqlDriver::lock_name(&"x".repeat(101)));

        let d = MysqlDriver::new();
        let statements = d.lock_statements("job", Duration::from_secs(5)).unwrap();
        assert_eq!(statements.acquire, "SELECT GET_LOCK('job', 5) AS acquired");
        assert!(statements.blocking);
    }

    #[test]
    fn test_sub_second_lock_wait_rounds_up() {
        let d = MysqlDriver::new();
        let statements = d.lock_statements("job", Duration::from_millis(300)).unwrap();
        assert_eq!(statements.acquire, "SELECT GET_LOCK('job', 1) AS acquired");
        let statements = d.lock_statements("job", Duration::from_millis(2500)).unwrap();
        assert_eq!(statements.acquire, "SELECT GET_LOCK('job', 3) AS acquired");
        let statements = d.lock_statements("job", Duration::ZERO).unwrap();
        assert_eq!(statements.acquire, "SELECT GET_LOCK('job', 0) AS acquired");
    }

    #[test]
    fn test_error_classification() {
        let d = MysqlDriver::new();
        assert!(d.is_connection_error(&ErrorCode::numeric(2006)));
        assert!(d.is_connection_error(&ErrorCode::numeric(2013)));
        assert!(!d.is_connection_error(&ErrorCode::numeric(1062)));
        assert!(d.is_known_statement_rollback_error(&ErrorCode::numeric(1062)));
        assert!(!d.is_known_statement_rollback_error(&ErrorCode::numeric(1213)));
        assert_eq!(d.classify_error(&ErrorCode::numeric(1213)), QueryErrorKind::Deadlock);
        assert_eq!(d.classify_error(&ErrorCode::numeric(1205)), QueryErrorKind::LockWaitTimeout);
        assert_eq!(d.classify_error(&ErrorCode::numeric(3024)), QueryErrorKind::QueryTimeout);
        assert_eq!(d.classify_error(&ErrorCode::numeric(1836)), QueryErrorKind::ReadOnly);
    }

    #[test]
    fn test_upsert_rules() {
        let d = MysqlDriver::new();
        assert_eq!(d.adjust_upsert_affected_rows(4, 2), 2);
        assert_eq!(d.adjust_upsert_affected_rows(1, 2), 1);
        assert!(d.is_insert_select_safe(&SelectOptions::new()));
        assert!(!d.is_insert_select_safe(&SelectOptions::new().limit(10)));
    }

    #[tokio::test]
    #[ignore] // Run with: MYSQL_HOST=... cargo test --features mysql -- --ignored
    async fn test_mysql_statements() {
        let Ok(host) = std::env::var("MYSQL_HOST") else {
            eprintln!("Skipping test: MYSQL_HOST not set");
            return;
        };
        let config = ConnectionConfig::builder()
            .host(host)
            .database(std::env::var("MYSQL_DATABASE").unwrap_or_else(|_| "test".into()))
            .username(std::env::var("MYSQL_USER").unwrap_or_else(|_| "root".into()))
            .password(std::env::var("MYSQL_PASSWORD").unwrap_or_default())
            .build();
        let mut driver = MysqlDriver::new();
        driver.open(&config).await.unwrap();
        assert!(driver.ping().await);

        let q = |sql: &str| Query::new(sql, QueryFlags::empty());
        driver.do_single_statement_query(&q("DROP TABLE IF EXISTS rdbms_my_test")).await;
        let status = driver
            .do_single_statement_query(&q(
                "CREATE TABLE rdbms_my_test (id INT AUTO_INCREMENT PRIMARY KEY, name VARCHAR(32))",
            ))
            .await;
        assert!(status.is_ok(), "{}", status.error());

        let status = driver
            .do_single_statement_query(&q("INSERT INTO rdbms_my_test (name) VALUES ('Alice')"))
            .await;
        assert_eq!(status.affected_rows(), 1);
        assert_eq!(status.insert_id(), Some(1));

        let mut status = driver
            .do_single_statement_query(&q("SELECT id, name FROM rdbms_my_test"))
            .await;
        let rows = status.take_rows();
        assert_eq!(rows[0].get("id").unwrap().as_long(), Some(1));
        assert_eq!(rows[0].get("name").unwrap().as_str(), Some("Alice"));

        driver.do_single_statement_query(&q("DROP TABLE rdbms_my_test")).await;
        driver.close().await.unwrap();
    }
}
