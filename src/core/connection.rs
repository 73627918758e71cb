//! The backend-agnostic connection engine
//!
//! A [`Connection`] owns one backend driver and all session bookkeeping:
//! lifecycle state, the selected domain, the open transaction with its
//! atomic sections, and named locks. Every statement goes through
//! [`Connection::query`] (or its internal counterpart for transaction and
//! lock statements), which is the only place raw backend failures become
//! [`DatabaseError`]s.
//!
//! Transactions live in `atomic.rs`, named locks in `locking.rs` and the
//! CRUD helpers in `crud.rs`; they are further `impl Connection` blocks.

use super::config::{ConnectionConfig, ConnectionFlags, TopologyRole};
use super::database_types::{DatabaseAttributes, DatabaseType};
use super::domain::DatabaseDomain;
use super::error::{DatabaseError, Result};
use super::query::{Query, QueryFlags, QueryStatus, QueryVerb};
use super::transaction::{TransactionCallback, TransactionOutcome, TransactionState, TransactionStatus};
use super::value::ResultWrapper;
use crate::backends::{BackendDriver, DatabaseSwitch};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Lifecycle of the underlying session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not opened yet; opens on first use
    Unconnected,
    Connecting,
    Open,
    /// The session dropped; the next use reconnects
    Lost,
    Reconnecting,
    /// Closed on request; only `reopen()` leaves this state
    Closed,
}

/// A session-scoped named lock held by this connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedLock {
    pub acquired_at: DateTime<Utc>,
    /// Transaction open when the lock was first taken
    pub trx_id: Option<String>,
    /// Re-entrant acquisitions not yet released
    pub count: u32,
}

/// One logical database session
pub struct Connection {
    pub(crate) driver: Box<dyn BackendDriver>,
    pub(crate) config: ConnectionConfig,
    attributes: DatabaseAttributes,
    state: ConnectionState,
    domain: DatabaseDomain,
    pub(crate) trx: TransactionState,
    pub(crate) session_locks: Arc<Mutex<BTreeMap<String, NamedLock>>>,
    pub(crate) deferred_unlocks: Arc<Mutex<Vec<String>>>,
    affected_rows: u64,
    insert_id: Option<i64>,
    last_query: Option<String>,
    last_write: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("type", &self.driver.database_type())
            .field("server", &self.server_name())
            .field("state", &self.state)
            .field("domain", &self.domain.id())
            .field("trx", &self.trx)
            .field("session_locks", &*self.session_locks.lock())
            .finish()
    }
}

impl Connection {
    /// Wrap a driver; nothing is opened yet
    pub fn new(
        driver: Box<dyn BackendDriver>,
        config: ConnectionConfig,
        attributes: DatabaseAttributes,
    ) -> Self {
        let domain = config.initial_domain();
        Self {
            driver,
            config,
            attributes,
            state: ConnectionState::Unconnected,
            domain,
            trx: TransactionState::new(),
            session_locks: Arc::new(Mutex::new(BTreeMap::new())),
            deferred_unlocks: Arc::new(Mutex::new(Vec::new())),
            affected_rows: 0,
            insert_id: None,
            last_query: None,
            last_write: None,
        }
    }

    // Lifecycle

    /// Open the session (a no-op when already open)
    pub async fn open(&mut self) -> Result<()> {
        if self.state == ConnectionState::Open && self.driver.is_open() {
            return Ok(());
        }
        if self.state == ConnectionState::Closed {
            return Err(DatabaseError::unexpected(
                "Connection was closed; call reopen() first",
            ));
        }

        let previous = self.state;
        self.state = if previous == ConnectionState::Lost {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        };

        let config = self.session_config();
        match self.driver.open(&config).await {
            Ok(()) => {
                self.state = ConnectionState::Open;
                tracing::info!(
                    target: "rdbms::connection",
                    server = %self.server_name(),
                    domain = %self.domain,
                    "connection opened"
                );
                Ok(())
            }
            Err(e) => {
                self.state = if previous == ConnectionState::Lost {
                    ConnectionState::Lost
                } else {
                    ConnectionState::Unconnected
                };
                tracing::error!(
                    target: "rdbms::connection",
                    server = %self.server_name(),
                    error = %e,
                    "cannot open connection"
                );
                Err(e)
            }
        }
    }

    /// Open a closed connection again
    pub async fn reopen(&mut self) -> Result<()> {
        if self.state == ConnectionState::Closed {
            self.state = ConnectionState::Unconnected;
        }
        self.open().await
    }

    /// Close the session
    ///
    /// An open transaction is committed when it is an automatic one without
    /// pending writes or callbacks, and rolled back otherwise; in the latter
    /// case the connection is still closed and `Unexpected` is returned.
    pub async fn close(&mut self, fname: &str) -> Result<()> {
        let mut error = None;
        if self.trx.is_open() {
            if !self.trx.sections().is_empty() {
                let names: Vec<&str> = self.trx.sections().iter().map(|s| s.fname.as_str()).collect();
                error = Some(format!("{}: atomic sections {} are still open", fname, names.join(", ")));
            } else if self.trx.is_automatic() {
                if self.writes_or_callbacks_pending() {
                    error = Some(format!(
                        "{}: automatic transaction still expecting commit or rollback",
                        fname
                    ));
                }
            } else {
                error = Some(format!("{}: explicit transaction still active", fname));
            }

            let resolved = if error.is_some() {
                self.rollback(fname, super::transaction::FlushMode::Internal).await
            } else {
                self.commit(fname, super::transaction::FlushMode::Internal).await
            };
            if let Err(e) = resolved {
                tracing::warn!(target: "rdbms::connection", fname, error = %e, "cannot resolve transaction at close");
            }
        }

        self.release_deferred_locks(fname).await;
        self.session_locks.lock().clear();
        if let Err(e) = self.driver.close().await {
            tracing::warn!(target: "rdbms::connection", error = %e, "driver close failed");
        }
        self.state = ConnectionState::Closed;
        tracing::info!(target: "rdbms::connection", server = %self.server_name(), fname, "connection closed");

        match error {
            Some(message) => Err(DatabaseError::unexpected(message)),
            None => Ok(()),
        }
    }

    /// Whether the session is open
    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open && self.driver.is_open()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    /// Check the session is alive, reconnecting when nothing would be lost
    pub async fn ping(&mut self) -> Result<bool> {
        match self.state {
            ConnectionState::Closed => return Ok(false),
            ConnectionState::Open => {}
            _ => {
                self.open().await?;
                return Ok(true);
            }
        }
        if self.driver.ping().await {
            return Ok(true);
        }
        if self.trx.is_open() || !self.session_locks.lock().is_empty() {
            tracing::warn!(
                target: "rdbms::connection",
                server = %self.server_name(),
                "ping failed; not reconnecting because session state would be lost"
            );
            return Ok(false);
        }
        self.handle_session_loss().await;
        self.open().await?;
        Ok(true)
    }

    // Query dispatch

    /// Run one statement
    ///
    /// Transaction-control statements are rejected here; use `begin()`,
    /// `commit()`, `rollback()` and the atomic-section methods instead.
    pub async fn query(&mut self, sql: &str, fname: &str, flags: QueryFlags) -> Result<ResultWrapper> {
        let query = Query::new(sql, flags);
        if query.verb().is_transaction_control() {
            return Err(DatabaseError::expected(format!(
                "{}: use the transaction methods instead of raw '{}'",
                fname,
                query.verb()
            )));
        }
        self.execute_query(query, fname).await
    }

    /// Like [`Connection::query`], but a failed statement yields `None`
    pub async fn query_silently(
        &mut self,
        sql: &str,
        fname: &str,
        flags: QueryFlags,
    ) -> Result<Option<ResultWrapper>> {
        try_silently(self.query(sql, fname, flags | QueryFlags::SILENCE_ERRORS).await)
    }

    /// Run statements in order, stopping at the first failure
    pub async fn query_batch<I, S>(&mut self, statements: I, fname: &str, flags: QueryFlags) -> Result<Vec<ResultWrapper>>
    where
        I: IntoIterator<Item = S> + Send,
        I::IntoIter: Send,
        S: AsRef<str> + Send,
    {
        let mut results = Vec::new();
        for sql in statements {
            results.push(self.query(sql.as_ref(), fname, flags).await?);
        }
        Ok(results)
    }

    pub(crate) async fn execute_query(&mut self, query: Query, fname: &str) -> Result<ResultWrapper> {
        self.assert_not_closed(fname)?;

        if !self.trx.is_open() {
            self.release_deferred_locks(fname).await;
        }

        if query.is_write() && !query.has_flag(QueryFlags::PSEUDO_PERMANENT) {
            if let Some(reason) = self.read_only_reason() {
                return Err(DatabaseError::expected(format!(
                    "{}: server {} is read-only: {}",
                    fname,
                    self.server_name(),
                    reason
                )));
            }
        }

        self.check_trx_status(&query, fname)?;

        if self.config.has_flag(ConnectionFlags::TRX)
            && !query.has_flag(QueryFlags::IGNORE_DBO_TRX)
            && !self.trx.is_open()
        {
            self.begin_transaction(fname, true).await?;
        }

        let status = self.attempt_query(&query, fname).await?;
        self.finish_query(&query, status, fname)
    }

    /// Internal statements (transaction control, savepoints, locks, domain
    /// changes): no read-only check and no implicit transaction
    pub(crate) async fn run_statement(
        &mut self,
        sql: String,
        flags: QueryFlags,
        fname: &str,
    ) -> Result<ResultWrapper> {
        self.run_query(Query::new(sql, flags), fname).await
    }

    pub(crate) async fn run_query(&mut self, query: Query, fname: &str) -> Result<ResultWrapper> {
        self.assert_not_closed(fname)?;
        self.check_trx_status(&query, fname)?;
        let status = self.attempt_query(&query, fname).await?;
        self.finish_query(&query, status, fname)
    }

    fn assert_not_closed(&self, fname: &str) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Err(DatabaseError::unexpected(format!(
                "{}: connection to {} was closed",
                fname,
                self.server_name()
            )));
        }
        Ok(())
    }

    fn check_trx_status(&self, query: &Query, fname: &str) -> Result<()> {
        if self.trx.status() == TransactionStatus::Error
            && !matches!(query.verb(), QueryVerb::Rollback | QueryVerb::RollbackToSavepoint)
        {
            return Err(DatabaseError::expected(format!(
                "{}: cannot execute query while transaction status is ERROR",
                fname
            )));
        }
        Ok(())
    }

    pub(crate) async fn ensure_connected(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Open if self.driver.is_open() => Ok(()),
            _ => self.open().await,
        }
    }

    /// Run through the driver, recovering from a lost session when that is
    /// safe
    async fn attempt_query(&mut self, query: &Query, fname: &str) -> Result<QueryStatus> {
        self.ensure_connected().await?;
        self.last_query = Some(query.sql().to_string());
        self.log_statement(query, fname);

        let status = self.driver.do_single_statement_query(query).await;
        if status.is_ok() || !self.driver.is_connection_error(status.errno()) {
            return Ok(status);
        }

        let server = self.server_name();
        let trx_lost = self.trx.is_open();
        tracing::warn!(
            target: "rdbms::connection",
            server = %server,
            fname,
            errno = %status.errno(),
            error = status.error(),
            trx_lost,
            "lost connection"
        );
        self.handle_session_loss().await;

        if query.verb() == QueryVerb::Rollback {
            // Whatever was open is gone with the session
            if let Err(e) = self.open().await {
                tracing::warn!(target: "rdbms::connection", error = %e, "reconnect after lost ROLLBACK failed");
            }
            return Ok(QueryStatus::affected(0, None));
        }

        self.open().await?;

        if trx_lost {
            return Err(DatabaseError::connection(
                server,
                format!("{}: connection lost during a transaction; its changes were discarded", fname),
            ));
        }
        if query.has_flag(QueryFlags::NO_RETRY) || query.changes_transaction() {
            return Err(DatabaseError::connection(
                server,
                format!("{}: connection lost and the statement may not be retried: {}", fname, status.error()),
            ));
        }

        let retried = self.driver.do_single_statement_query(query).await;
        if !retried.is_ok() && self.driver.is_connection_error(retried.errno()) {
            self.handle_session_loss().await;
            return Err(DatabaseError::connection(
                server,
                format!("{}: {}", fname, retried.error()),
            ));
        }
        tracing::info!(target: "rdbms::connection", server = %server, fname, "reconnected and retried statement");
        Ok(retried)
    }

    fn finish_query(&mut self, query: &Query, mut status: QueryStatus, fname: &str) -> Result<ResultWrapper> {
        if status.is_ok() {
            if query.is_write() {
                self.last_write = Some(Utc::now());
                self.trx.note_write(fname);
                self.affected_rows = status.affected_rows();
            }
            if query.verb().generates_insert_id() {
                self.insert_id = status.insert_id();
            }
            let rows = status.take_rows();
            return Ok(ResultWrapper::new(rows, status.affected_rows(), status.insert_id()));
        }

        let errno = status.errno().clone();
        let kind = self.driver.classify_error(&errno);
        if self.trx.is_open() && !self.driver.is_known_statement_rollback_error(&errno) {
            self.trx.set_status(TransactionStatus::Error);
        }

        if query.has_flag(QueryFlags::SILENCE_ERRORS) {
            tracing::debug!(
                target: "rdbms::error",
                fname,
                errno = %errno,
                kind = %kind,
                error = status.error(),
                sql = query.display_sql(),
                "query failed (silenced)"
            );
        } else {
            tracing::error!(
                target: "rdbms::error",
                fname,
                errno = %errno,
                kind = %kind,
                error = status.error(),
                sql = query.display_sql(),
                "query failed"
            );
        }

        Err(DatabaseError::query(
            kind,
            errno.to_string(),
            status.error(),
            query.display_sql(),
            fname,
        ))
    }

    fn log_statement(&self, query: &Query, fname: &str) {
        if self.config.has_flag(ConnectionFlags::DEBUG) {
            tracing::debug!(
                target: "rdbms::query",
                server = %self.server_name(),
                fname,
                trx = self.trx.id().unwrap_or("-"),
                sql = query.display_sql(),
                "query"
            );
        } else {
            tracing::trace!(target: "rdbms::query", fname, sql = query.display_sql(), "query");
        }
    }

    /// Drop every piece of session state after the session died
    pub(crate) async fn handle_session_loss(&mut self) {
        let lost: Vec<String> = std::mem::take(&mut *self.session_locks.lock()).into_keys().collect();
        if !lost.is_empty() {
            tracing::warn!(target: "rdbms::connection", locks = ?lost, "named locks lost with the session");
        }
        self.deferred_unlocks.lock().clear();
        let callbacks = self.trx.reset();
        if let Err(e) = self.driver.close().await {
            tracing::debug!(target: "rdbms::connection", error = %e, "closing dead session failed");
        }
        self.state = ConnectionState::Lost;
        run_callbacks(callbacks);
    }

    /// Config with the current domain applied, used whenever the session is
    /// (re)opened
    fn session_config(&self) -> ConnectionConfig {
        let mut config = self.config.clone();
        config.dbname = self.domain.database().map(str::to_string);
        config.schema = self.domain.schema().map(str::to_string);
        config.table_prefix = self.domain.table_prefix().to_string();
        config
    }

    // Domain

    /// Switch the database/schema/prefix that unqualified tables resolve to
    ///
    /// A domain without a database keeps the current database.
    pub async fn select_domain(&mut self, domain: &DatabaseDomain) -> Result<()> {
        let fname = "Connection::select_domain";
        let current = self.domain.clone();
        let database = domain
            .database()
            .or(current.database())
            .map(str::to_string);
        let target = DatabaseDomain::new(
            database.clone(),
            domain.schema().map(str::to_string),
            domain.table_prefix(),
        )?;

        if target.schema().is_some() && !self.driver.supports_schemas() {
            return Err(DatabaseError::expected(format!(
                "{}: {} does not support schemas",
                fname,
                self.database_type()
            )));
        }

        let database_changes = target.database() != current.database();
        let mut reconnected = false;
        if database_changes {
            let name = database.unwrap_or_default();
            match self.driver.database_switch() {
                DatabaseSwitch::Unsupported => {
                    return Err(DatabaseError::expected(format!(
                        "{}: cannot switch to database '{}'; {} databases are independent",
                        fname,
                        name,
                        self.database_type()
                    )));
                }
                DatabaseSwitch::Statement => {
                    if self.is_open() {
                        let sql = self.driver.use_database_sql(&name);
                        self.run_statement(sql, QueryFlags::IGNORE_DBO_TRX | QueryFlags::NO_RETRY, fname)
                            .await?;
                    }
                }
                DatabaseSwitch::Reconnect => {
                    if self.trx.is_open() {
                        return Err(DatabaseError::expected(format!(
                            "{}: cannot switch to database '{}' while a transaction is open",
                            fname, name
                        )));
                    }
                    if !self.session_locks.lock().is_empty() {
                        return Err(DatabaseError::expected(format!(
                            "{}: cannot switch to database '{}' while named locks are held",
                            fname, name
                        )));
                    }
                    if self.is_open() {
                        self.driver.close().await?;
                        self.state = ConnectionState::Unconnected;
                        self.domain = target.clone();
                        self.open().await?;
                        reconnected = true;
                    }
                }
            }
        }

        if !reconnected && target.schema() != current.schema() && self.is_open() {
            if let Some(schema) = target.schema() {
                if let Some(sql) = self.driver.set_schema_sql(schema) {
                    self.run_statement(sql, QueryFlags::IGNORE_DBO_TRX, fname).await?;
                }
            }
        }

        if target != current {
            tracing::debug!(target: "rdbms::connection", from = %current, to = %target, "domain changed");
        }
        self.domain = target;
        Ok(())
    }

    /// Current domain
    pub fn domain(&self) -> &DatabaseDomain {
        &self.domain
    }

    /// Current domain ID
    pub fn get_domain_id(&self) -> String {
        self.domain.id()
    }

    /// Get the table prefix, optionally replacing it; returns the old prefix
    pub fn table_prefix(&mut self, prefix: Option<&str>) -> String {
        let old = self.domain.table_prefix().to_string();
        if let Some(prefix) = prefix {
            self.domain = self.domain.with_prefix(prefix);
        }
        old
    }

    /// Get the schema, optionally replacing it; returns the old schema
    pub fn db_schema(&mut self, schema: Option<&str>) -> Result<Option<String>> {
        let old = self.domain.schema().map(str::to_string);
        if let Some(schema) = schema {
            if self.domain.database().is_none() {
                return Err(DatabaseError::expected(format!(
                    "Cannot set schema '{}' while no database is selected",
                    schema
                )));
            }
            self.domain = self.domain.with_schema(Some(schema.to_string()));
        }
        Ok(old)
    }

    /// Fully qualified, quoted name for a table
    ///
    /// The table prefix is prepended to the last component. Names that are
    /// already quoted or look like expressions are returned untouched.
    pub fn table_name(&self, name: &str) -> String {
        if name.contains(|c: char| c.is_whitespace() || matches!(c, '(' | '`' | '"' | '[')) {
            return name.to_string();
        }
        let mut parts: Vec<&str> = name.split('.').collect();
        let table = parts.pop().unwrap_or_default();
        let mut quoted: Vec<String> = Vec::new();
        if parts.is_empty() {
            if self.driver.supports_schemas() {
                if let Some(schema) = self.domain.schema() {
                    quoted.push(self.driver.add_identifier_quotes(schema));
                }
            }
        } else {
            quoted.extend(parts.iter().map(|p| self.driver.add_identifier_quotes(p)));
        }
        quoted.push(
            self.driver
                .add_identifier_quotes(&format!("{}{}", self.domain.table_prefix(), table)),
        );
        quoted.join(".")
    }

    /// Table reference for FROM/JOIN clauses, aliased to its bare name when
    /// qualification changed it
    pub fn table_name_with_alias(&self, name: &str) -> String {
        let qualified = self.table_name(name);
        let bare = name.rsplit('.').next().unwrap_or(name);
        let alias = self.driver.add_identifier_quotes(bare);
        if qualified == alias || qualified == name {
            qualified
        } else {
            format!("{} {}", qualified, alias)
        }
    }

    // Introspection

    /// Backend family
    pub fn database_type(&self) -> DatabaseType {
        self.driver.database_type()
    }

    /// Capability attributes of the backend
    pub fn attributes(&self) -> DatabaseAttributes {
        self.attributes
    }

    /// Configuration the connection was created with
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Display name of the server
    pub fn server_name(&self) -> String {
        self.config.display_server()
    }

    /// Server software and version
    pub async fn server_info(&mut self) -> Result<String> {
        self.assert_not_closed("Connection::server_info")?;
        self.ensure_connected().await?;
        self.driver.server_info().await
    }

    /// Rows changed by the last write
    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    /// Id generated by the last insert
    pub fn insert_id(&self) -> Option<i64> {
        self.insert_id
    }

    /// Text of the last statement sent
    pub fn last_query(&self) -> Option<&str> {
        self.last_query.as_deref()
    }

    /// When the last write statement succeeded
    pub fn last_done_writes(&self) -> Option<DateTime<Utc>> {
        self.last_write
    }

    pub(crate) fn set_affected_rows(&mut self, affected: u64) {
        self.affected_rows = affected;
    }

    /// Why writes are refused, if they are
    pub fn read_only_reason(&self) -> Option<String> {
        self.config.read_only_reason()
    }

    /// Replication lag in seconds; `None` when it cannot be determined
    pub async fn get_lag(&mut self) -> Result<Option<f64>> {
        if self.config.topology_role == TopologyRole::Primary {
            return Ok(Some(0.0));
        }
        let Some(lag) = self.driver.lag_query() else {
            return Ok(Some(0.0));
        };
        let result = self
            .run_statement(lag.sql, QueryFlags::REPLICA_ROLE | QueryFlags::IGNORE_DBO_TRX, "Connection::get_lag")
            .await?;
        Ok(result
            .first()
            .and_then(|row| row.get(&lag.column))
            .and_then(|v| v.as_double()))
    }
}

/// Turn a statement failure into `None`; every other error still propagates
pub fn try_silently<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_query_error() => {
            tracing::debug!(target: "rdbms::error", error = %e, "ignored query error");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

pub(crate) fn run_callbacks(callbacks: Vec<(TransactionCallback, TransactionOutcome)>) {
    for (callback, outcome) in callbacks {
        callback(outcome);
    }
}
