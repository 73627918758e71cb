//! PostgreSQL backend driver
//!
//! Uses `tokio-postgres`. Every statement is prepared and then executed or
//! queried depending on whether it produces columns, so rows come back with
//! their native types. The schema is selected through `search_path`, named
//! locks map onto advisory locks and the database is switched by
//! reconnecting.

use super::locks::hash_lock_name;
use super::{BackendDriver, InsertIgnoreStyle, LagQuery, LockStatements, ReplaceStyle, SqlDialect, UpsertStyle};
use crate::core::config::{postgres_connection_string, ConnectionConfig};
use crate::core::database_types::DatabaseType;
use crate::core::error::{DatabaseError, QueryErrorKind, Result};
use crate::core::query::{ErrorCode, Query, QueryStatus};
use crate::core::value::{DatabaseRow, DatabaseValue};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_postgres::types::FromSql;
use tokio_postgres::{Client, NoTls, Row};

const CONNECTION_DOES_NOT_EXIST: &str = "08003";
const CONNECTION_FAILURE: &str = "08006";
const QUERY_CANCELED: &str = "57014";
const DEADLOCK_DETECTED: &str = "40P01";
const LOCK_NOT_AVAILABLE: &str = "55P03";
const READ_ONLY_SQL_TRANSACTION: &str = "25006";
/// Reported for client-side failures (bad conversions, protocol errors)
const CLIENT_ERROR: &str = "XX000";

static SETTING_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.]*$").expect("valid regex"));

/// PostgreSQL driver
pub struct PostgresDriver {
    client: Arc<Mutex<Option<Client>>>,
    server: String,
    timeout: Duration,
}

impl PostgresDriver {
    /// Create an unopened driver
    pub fn new() -> Self {
        Self {
            client: Arc::new(Mutex::new(None)),
            server: String::new(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Advisory lock key for a lock name: the first 60 bits of its SHA-256
    pub fn advisory_lock_key(name: &str) -> i64 {
        let hash = hash_lock_name(name);
        i64::from_str_radix(&hash[..15], 16).unwrap_or(0)
    }

    fn value<'a, T: FromSql<'a>>(row: &'a Row, idx: usize) -> Option<T> {
        row.try_get::<_, Option<T>>(idx).ok().flatten()
    }

    /// Convert a tokio_postgres Row to a DatabaseRow
    fn row_to_database_row(row: &Row) -> DatabaseRow {
        let mut db_row = DatabaseRow::new();

        for (idx, column) in row.columns().iter().enumerate() {
            let value = match column.type_().name() {
                "bool" => Self::value::<bool>(row, idx).map(DatabaseValue::Bool),
                "int2" => Self::value::<i16>(row, idx).map(|v| DatabaseValue::Int(i32::from(v))),
                "int4" => Self::value::<i32>(row, idx).map(DatabaseValue::Int),
                "oid" => Self::value::<u32>(row, idx).map(|v| DatabaseValue::Long(i64::from(v))),
                "int8" => Self::value::<i64>(row, idx).map(DatabaseValue::Long),
                "float4" => Self::value::<f32>(row, idx).map(DatabaseValue::Float),
                "float8" => Self::value::<f64>(row, idx).map(DatabaseValue::Double),
                "bytea" => Self::value::<Vec<u8>>(row, idx).map(DatabaseValue::Bytes),
                "timestamp" => Self::value::<chrono::NaiveDateTime>(row, idx)
                    .map(|v| DatabaseValue::Timestamp(v.and_utc().timestamp_micros())),
                "timestamptz" => Self::value::<chrono::DateTime<chrono::Utc>>(row, idx)
                    .map(|v| DatabaseValue::Timestamp(v.timestamp_micros())),
                // text, varchar, bpchar, name and anything else readable as text
                _ => Self::value::<String>(row, idx).map(DatabaseValue::String),
            };
            db_row.insert(column.name(), value.unwrap_or(DatabaseValue::Null));
        }

        db_row
    }

    fn status_from_error(error: &tokio_postgres::Error) -> QueryStatus {
        let lost = error.is_closed()
            || std::error::Error::source(error).is_some_and(|e| e.is::<std::io::Error>());
        let code = Self::error_state(error.code().map(|state| state.code()), lost).to_string();
        let message = error
            .as_db_error()
            .map(|db| db.message().to_string())
            .unwrap_or_else(|| error.to_string());
        QueryStatus::failed(ErrorCode::text(code), message)
    }

    /// SQLSTATE to report; errors raised in the client only count as a
    /// connection failure when the socket is gone
    fn error_state(sqlstate: Option<&str>, connection_lost: bool) -> &str {
        match sqlstate {
            Some(state) => state,
            None if connection_lost => CONNECTION_FAILURE,
            None => CLIENT_ERROR,
        }
    }

    fn session_setup(config: &ConnectionConfig, driver: &PostgresDriver) -> Result<Vec<String>> {
        let mut statements = vec![
            "SET client_encoding = 'UTF8'".to_string(),
            "SET standard_conforming_strings = on".to_string(),
            "SET timezone = 'GMT'".to_string(),
        ];
        if let Some(schema) = &config.schema {
            statements.push(format!("SET search_path = {}", driver.add_identifier_quotes(schema)));
        }
        for (name, value) in &config.variables {
            if !SETTING_NAME.is_match(name) {
                return Err(DatabaseError::unexpected(format!(
                    "Invalid Postgres setting name '{}'",
                    name
                )));
            }
            statements.push(format!("SET {} = {}", name, driver.quote_string(value)));
        }
        Ok(statements)
    }
}

impl Default for PostgresDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SqlDialect for PostgresDriver {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Postgres
    }

    fn quote_bool(&self, value: bool) -> String {
        if value { "TRUE" } else { "FALSE" }.to_string()
    }

    fn quote_bytes(&self, value: &[u8]) -> String {
        format!("'\\x{}'::bytea", hex::encode(value))
    }

    fn supports_schemas(&self) -> bool {
        true
    }

    fn databases_are_independent(&self) -> bool {
        true
    }

    fn set_schema_sql(&self, schema: &str) -> Option<String> {
        Some(format!("SET search_path = {}", self.add_identifier_quotes(schema)))
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

    fn lock_statements(&self, name: &str, _timeout: Duration) -> Option<LockStatements> {
        let key = Self::advisory_lock_key(name);
        Some(LockStatements {
            acquire: format!("SELECT pg_try_advisory_lock({}) AS acquired", key),
            blocking: false,
            release: format!("SELECT pg_advisory_unlock({}) AS released", key),
            is_free: format!(
                "SELECT (CASE WHEN pg_try_advisory_lock({key}) THEN pg_advisory_unlock({key}) ELSE FALSE END) AS free",
                key = key
            ),
        })
    }

    fn limit_clause(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        match (limit, offset) {
            (Some(limit), Some(offset)) => format!(" LIMIT {} OFFSET {}", limit, offset),
            (Some(limit), None) => format!(" LIMIT {}", limit),
            (None, Some(offset)) => format!(" OFFSET {}", offset),
            (None, None) => String::new(),
        }
    }
}

#[async_trait]
impl BackendDriver for PostgresDriver {
    async fn open(&mut self, config: &ConnectionConfig) -> Result<()> {
        self.close().await?;

        let server = config.display_server();
        let setup = Self::session_setup(config, self)?;
        let connection_string = postgres_connection_string(config);

        let connect = tokio_postgres::connect(&connection_string, NoTls);
        let (client, connection) = tokio::time::timeout(config.connect_timeout(), connect)
            .await
            .map_err(|_| DatabaseError::connection(&server, "Timed out connecting"))?
            .map_err(|e| DatabaseError::connection_with_source(&server, "Cannot connect", Box::new(e)))?;

        // The connection object drives the socket until the client is dropped
        let log_server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(target: "rdbms::connection", server = %log_server, error = %e, "Postgres connection ended");
            }
        });

        for sql in &setup {
            client
                .batch_execute(sql)
                .await
                .map_err(|e| DatabaseError::connection_with_source(&server, format!("Session setup failed: {}", sql), Box::new(e)))?;
        }

        *self.client.lock().await = Some(client);
        self.timeout = config.statement_timeout();
        tracing::debug!(target: "rdbms::connection", server = %server, "opened Postgres connection");
        self.server = server;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let mut client = self.client.lock().await;
        *client = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.client
            .try_lock()
            .map(|client| client.as_ref().is_some_and(|c| !c.is_closed()))
            .unwrap_or(true)
    }

    fn dialect(&self) -> &dyn SqlDialect {
        self
    }

    async fn ping(&mut self) -> bool {
        let client = self.client.lock().await;
        let Some(client) = client.as_ref() else {
            return false;
        };
        matches!(
            tokio::time::timeout(self.timeout, client.batch_execute("SELECT 1")).await,
            Ok(Ok(()))
        )
    }

    async fn do_single_statement_query(&mut self, query: &Query) -> QueryStatus {
        let guard = self.client.lock().await;
        let Some(client) = guard.as_ref() else {
            return QueryStatus::failed(
                ErrorCode::text(CONNECTION_DOES_NOT_EXIST),
                "Not connected to database",
            );
        };

        let wants_insert_id = query.verb().generates_insert_id();
        let is_write = query.is_write();
        let work = async {
            let statement = client.prepare(query.sql()).await?;
            if statement.columns().is_empty() {
                let affected = client.execute(&statement, &[]).await?;
                return Ok::<_, tokio_postgres::Error>(QueryStatus::affected(affected, None));
            }
            let rows = client.query(&statement, &[]).await?;
            let rows: Vec<DatabaseRow> = rows.iter().map(Self::row_to_database_row).collect();
            // INSERT ... RETURNING: the first returned column is the new id
            let insert_id = if wants_insert_id {
                rows.first().and_then(|r| r.get_index(0)).and_then(|v| v.as_long())
            } else {
                None
            };
            let affected = if is_write { rows.len() as u64 } else { 0 };
            Ok(QueryStatus::rows(rows)
                .with_affected_rows(affected)
                .with_insert_id(insert_id))
        };

        match tokio::time::timeout(self.timeout, work).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => Self::status_from_error(&e),
            Err(_) => {
                if let Err(e) = client.cancel_token().cancel_query(NoTls).await {
                    tracing::debug!(target: "rdbms::connection", error = %e, "cannot cancel timed out statement");
                }
                QueryStatus::failed(
                    ErrorCode::text(QUERY_CANCELED),
                    format!("Statement exceeded the {}s timeout", self.timeout.as_secs()),
                )
            }
        }
    }

    fn is_connection_error(&self, errno: &ErrorCode) -> bool {
        let code = errno.as_str();
        code.starts_with("08") || matches!(code, "57P01" | "57P02" | "57P03")
    }

    fn is_query_timeout_error(&self, errno: &ErrorCode) -> bool {
        errno.as_str() == QUERY_CANCELED
    }

    fn is_known_statement_rollback_error(&self, _errno: &ErrorCode) -> bool {
        // Any failed statement aborts the whole Postgres transaction
        false
    }

    fn classify_error(&self, errno: &ErrorCode) -> QueryErrorKind {
        match errno.as_str() {
            DEADLOCK_DETECTED => QueryErrorKind::Deadlock,
            LOCK_NOT_AVAILABLE => QueryErrorKind::LockWaitTimeout,
            QUERY_CANCELED => QueryErrorKind::QueryTimeout,
            READ_ONLY_SQL_TRANSACTION => QueryErrorKind::ReadOnly,
            _ if self.is_connection_error(errno) => QueryErrorKind::ConnectionLost,
            _ => QueryErrorKind::Other,
        }
    }

    async fn server_info(&mut self) -> Result<String> {
        let client = self.client.lock().await;
        let client = client
            .as_ref()
            .ok_or_else(|| DatabaseError::connection(&self.server, "Not connected to database"))?;
        let row = client
            .query_one("SHOW server_version", &[])
            .await
            .map_err(|e| DatabaseError::connection_with_source(&self.server, "Cannot read server version", Box::new(e)))?;
        Ok(format!("PostgreSQL {}", row.try_get::<_, String>(0).unwrap_or_default()))
    }

    fn lag_query(&self) -> Option<LagQuery> {
        Some(LagQuery {
            sql: "SELECT CASE WHEN pg_is_in_recovery() \
                  THEN EXTRACT(EPOCH FROM now() - pg_last_xact_replay_timestamp())::float8 \
                  ELSE 0 END AS lag"
                .to_string(),
            column: "lag".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::query::QueryFlags;

    fn test_config() -> Option<ConnectionConfig> {
        let host = std::env::var("PGHOST").ok()?;
        let mut builder = ConnectionConfig::builder()
            .host(host)
            .database(std::env::var("PGDATABASE").unwrap_or_else(|_| "postgres".into()));
        if let Ok(user) = std::env::var("PGUSER") {
            builder = builder.username(user);
        }
        if let Ok(password) = std::env::var("PGPASSWORD") {
            builder = builder.password(password);
        }
        Some(builder.build())
    }

    #[test]
    fn test_postgres_dialect() {
        let d = PostgresDriver::new();
        assert_eq!(d.add_quotes(&DatabaseValue::Bool(true)), "TRUE");
        assert_eq!(d.add_quotes(&DatabaseValue::Bytes(vec![0xde, 0xad])), "'\\xdead'::bytea");
        assert_eq!(d.set_schema_sql("main").as_deref(), Some("SET search_path = \"main\""));
        assert_eq!(d.limit_clause(None, Some(20)), " OFFSET 20");
        assert_eq!(d.limit_clause(Some(5), Some(20)), " LIMIT 5 OFFSET 20");
        assert!(d.supports_schemas());
        assert_eq!(d.replace_style(), ReplaceStyle::Emulated);
    }

    #[test]
    fn test_advisory_lock_key() {
        let key = PostgresDriver::advisory_lock_key("job");
        assert!(key > 0);
        assert!(key < 1 << 60);
        assert_eq!(key, PostgresDriver::advisory_lock_key("job"));
        assert_ne!(key, PostgresDriver::advisory_lock_key("other job"));

        let d = PostgresDriver::new();
        let statements = d.lock_statements("job", Duration::ZERO).unwrap();
        assert!(!statements.blocking);
        assert!(statements.acquire.contains(&key.to_string()));
    }

    #[test]
    fn test_error_classification() {
        let d = PostgresDriver::new();
        assert!(d.is_connection_error(&ErrorCode::text("08006")));
        assert!(d.is_connection_error(&ErrorCode::text("57P01")));
        assert!(!d.is_connection_error(&ErrorCode::text("23505")));
        assert_eq!(d.classify_error(&ErrorCode::text("40P01")), QueryErrorKind::Deadlock);
        assert_eq!(d.classify_error(&ErrorCode::text("57014")), QueryErrorKind::QueryTimeout);
        assert!(!d.is_known_statement_rollback_error(&ErrorCode::text("23505")));
    }

    #[test]
    fn test_client_errors_are_not_connection_loss() {
        let d = PostgresDriver::new();
        let state = |sqlstate, lost| ErrorCode::text(PostgresDriver::error_state(sqlstate, lost));

        assert_eq!(d.classify_error(&state(None, true)), QueryErrorKind::ConnectionLost);
        assert_eq!(d.classify_error(&state(None, false)), QueryErrorKind::Other);
        assert!(!d.is_connection_error(&state(None, false)));
        assert_eq!(d.classify_error(&state(Some("40P01"), true)), QueryErrorKind::Deadlock);
    }

    #[tokio::test]
    #[ignore] // Run with: PGHOST=... cargo test --features postgres -- --ignored
    async fn test_postgres_statements() {
        let Some(config) = test_config() else {
            eprintln!("Skipping test: PGHOST not set");
            return;
        };
        let mut driver = PostgresDriver::new();
        driver.open(&config).await.unwrap();
        assert!(driver.ping().await);

        let q = |sql: &str| Query::new(sql, QueryFlags::empty());
        driver.do_single_statement_query(&q("DROP TABLE IF EXISTS rdbms_pg_test")).await;
        let status = driver
            .do_single_statement_query(&q("CREATE TABLE rdbms_pg_test (id SERIAL PRIMARY KEY, name TEXT)"))
            .await;
        assert!(status.is_ok(), "{}", status.error());

        let status = driver
            .do_single_statement_query(&q("INSERT INTO rdbms_pg_test (name) VALUES ('Alice') RETURNING id"))
            .await;
        assert_eq!(status.insert_id(), Some(1));
        assert_eq!(status.affected_rows(), 1);

        let mut status = driver
            .do_single_statement_query(&q("SELECT id, name FROM rdbms_pg_test"))
            .await;
        let rows = status.take_rows();
        assert_eq!(rows[0].get("name").unwrap().as_str(), Some("Alice"));

        let dup = driver
            .do_single_statement_query(&q("INSERT INTO rdbms_pg_test (id, name) VALUES (1, 'x')"))
            .await;
        assert_eq!(dup.errno().as_str(), "23505");

        driver.do_single_statement_query(&q("DROP TABLE rdbms_pg_test")).await;
        driver.close().await.unwrap();
        assert!(!driver.is_open());
    }
}
