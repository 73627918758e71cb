//! Shared helpers for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rdbms_layer::backends::locks::LockManager;
use rdbms_layer::backends::{
    BackendDriver, DatabaseSwitch, InsertIgnoreStyle, ReplaceStyle, SqlDialect, SqliteDriver,
    UpsertStyle,
};
use rdbms_layer::core::query::{ErrorCode, Query, QueryStatus};
use rdbms_layer::core::{
    Connection, ConnectionConfig, DatabaseType, QueryErrorKind, Result,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// SQLITE_CANTOPEN, which the SQLite driver treats as a lost session
pub const LOST_SESSION_ERRNO: i64 = 14;

/// Knobs and observations shared between a test and its [`FlakyDriver`]
#[derive(Clone, Default)]
pub struct FaultPlan {
    fail_next: Arc<AtomicUsize>,
    statements: Arc<Mutex<Vec<String>>>,
    opens: Arc<AtomicUsize>,
}

impl FaultPlan {
    /// Make the next `n` statements fail as if the server went away
    pub fn drop_session(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Statements that reached the driver, in order
    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().clone()
    }

    pub fn statement_count(&self) -> usize {
        self.statements.lock().len()
    }

    pub fn clear(&self) {
        self.statements.lock().clear();
    }

    /// How many times the session was opened
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

/// SQLite driver that records statements and can simulate session loss
pub struct FlakyDriver {
    inner: SqliteDriver,
    faults: FaultPlan,
}

impl FlakyDriver {
    pub fn new(faults: FaultPlan) -> Self {
        Self {
            inner: SqliteDriver::new(),
            faults,
        }
    }
}

impl SqlDialect for FlakyDriver {
    fn database_type(&self) -> DatabaseType {
        self.inner.database_type()
    }

    fn databases_are_independent(&self) -> bool {
        self.inner.databases_are_independent()
    }

    fn database_switch(&self) -> DatabaseSwitch {
        self.inner.database_switch()
    }

    fn upsert_style(&self) -> UpsertStyle {
        self.inner.upsert_style()
    }

    fn replace_style(&self) -> ReplaceStyle {
        self.inner.replace_style()
    }

    fn insert_ignore_style(&self) -> InsertIgnoreStyle {
        self.inner.insert_ignore_style()
    }

    fn begin_sql(&self) -> String {
        self.inner.begin_sql()
    }
}

#[async_trait]
impl BackendDriver for FlakyDriver {
    async fn open(&mut self, config: &ConnectionConfig) -> Result<()> {
        self.faults.opens.fetch_add(1, Ordering::SeqCst);
        self.inner.open(config).await
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn dialect(&self) -> &dyn SqlDialect {
        self.inner.dialect()
    }

    async fn ping(&mut self) -> bool {
        self.faults.fail_next.load(Ordering::SeqCst) == 0 && self.inner.ping().await
    }

    async fn do_single_statement_query(&mut self, query: &Query) -> QueryStatus {
        self.faults.statements.lock().push(query.sql().to_string());
        let pending = self.faults.fail_next.load(Ordering::SeqCst);
        if pending > 0 {
            self.faults.fail_next.store(pending - 1, Ordering::SeqCst);
            return QueryStatus::failed(
                ErrorCode::numeric(LOST_SESSION_ERRNO),
                "unable to open database file",
            );
        }
        self.inner.do_single_statement_query(query).await
    }

    fn is_connection_error(&self, errno: &ErrorCode) -> bool {
        self.inner.is_connection_error(errno)
    }

    fn is_query_timeout_error(&self, errno: &ErrorCode) -> bool {
        self.inner.is_query_timeout_error(errno)
    }

    fn is_known_statement_rollback_error(&self, errno: &ErrorCode) -> bool {
        self.inner.is_known_statement_rollback_error(errno)
    }

    fn classify_error(&self, errno: &ErrorCode) -> QueryErrorKind {
        self.inner.classify_error(errno)
    }

    async fn do_lock(&mut self, name: &str, timeout: Duration) -> Result<bool> {
        self.inner.do_lock(name, timeout).await
    }

    async fn do_unlock(&mut self, name: &str) -> Result<bool> {
        self.inner.do_unlock(name).await
    }

    async fn do_lock_is_free(&mut self, name: &str) -> Result<bool> {
        self.inner.do_lock_is_free(name).await
    }

    fn lock_manager(&self) -> Option<LockManager> {
        self.inner.lock_manager()
    }

    async fn server_info(&mut self) -> Result<String> {
        self.inner.server_info().await
    }
}

/// Open a connection over a [`FlakyDriver`]
pub async fn flaky_connection(config: ConnectionConfig) -> (Connection, FaultPlan) {
    let faults = FaultPlan::default();
    let driver = Box::new(FlakyDriver::new(faults.clone()));
    let mut conn = Connection::new(driver, config, DatabaseType::Sqlite.attributes());
    conn.open().await.expect("open flaky connection");
    (conn, faults)
}

/// Open an in-memory SQLite connection
pub async fn memory_connection(config: ConnectionConfig) -> Connection {
    let mut conn = Connection::new(
        Box::new(SqliteDriver::new()),
        config,
        DatabaseType::Sqlite.attributes(),
    );
    conn.open().await.expect("open sqlite connection");
    conn
}

/// Lock name unique to one test, since in-memory databases share a lock
/// namespace
pub fn unique_lock_name(test: &str) -> String {
    format!("{}-{}", test, std::process::id())
}
