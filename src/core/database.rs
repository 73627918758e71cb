//! Database handle contracts
//!
//! [`ReadableDatabase`] is the read-only surface handed to code that must not
//! write; [`Database`] adds writes, transactions and named locks. Both are
//! object safe, so callers can hold a `Box<dyn Database>`. [`Connection`]
//! implements both by delegation.

use super::connection::Connection;
use super::database_types::DatabaseType;
use super::domain::DatabaseDomain;
use super::error::Result;
use super::query::QueryFlags;
use super::query_builder::{Assignments, Conditions, Join, SelectOptions};
use super::transaction::{AtomicSectionId, Cancelable, FlushMode, TransactionMode};
use super::value::{DatabaseRow, DatabaseValue, ResultWrapper};
use async_trait::async_trait;
use std::time::Duration;

/// Read-only database handle
#[async_trait]
pub trait ReadableDatabase: Send {
    /// Backend family
    fn database_type(&self) -> DatabaseType;

    /// Display name of the server
    fn server_name(&self) -> String;

    /// Current domain ID
    fn get_domain_id(&self) -> String;

    /// Fully qualified, quoted name for a table
    fn table_name(&self, name: &str) -> String;

    /// Run a SELECT
    async fn select(
        &mut self,
        tables: &[&str],
        vars: &[&str],
        conds: &Conditions,
        fname: &str,
        options: &SelectOptions,
        joins: &[Join],
    ) -> Result<ResultWrapper>;

    /// First matching row
    async fn select_row(
        &mut self,
        tables: &[&str],
        vars: &[&str],
        conds: &Conditions,
        fname: &str,
        options: &SelectOptions,
        joins: &[Join],
    ) -> Result<Option<DatabaseRow>>;

    /// Single value of the first matching row
    async fn select_field(
        &mut self,
        tables: &[&str],
        var: &str,
        conds: &Conditions,
        fname: &str,
        options: &SelectOptions,
        joins: &[Join],
    ) -> Result<Option<DatabaseValue>>;

    /// One value per matching row
    async fn select_field_values(
        &mut self,
        tables: &[&str],
        var: &str,
        conds: &Conditions,
        fname: &str,
        options: &SelectOptions,
        joins: &[Join],
    ) -> Result<Vec<DatabaseValue>>;

    /// Number of matching rows
    async fn select_row_count(
        &mut self,
        tables: &[&str],
        var: &str,
        conds: &Conditions,
        fname: &str,
        options: &SelectOptions,
        joins: &[Join],
    ) -> Result<u64>;

    /// Whether nobody holds the named lock
    async fn lock_is_free(&mut self, name: &str, fname: &str) -> Result<bool>;

    /// Replication lag in seconds
    async fn get_lag(&mut self) -> Result<Option<f64>>;

    /// Server software and version
    async fn server_info(&mut self) -> Result<String>;
}

/// Read-write database handle
#[async_trait]
pub trait Database: ReadableDatabase {
    /// Run one statement
    async fn query(&mut self, sql: &str, fname: &str, flags: QueryFlags) -> Result<ResultWrapper>;

    async fn insert(&mut self, table: &str, rows: &[DatabaseRow], fname: &str, ignore: bool) -> Result<u64>;

    async fn update(
        &mut self,
        table: &str,
        set: &Assignments,
        conds: &Conditions,
        fname: &str,
    ) -> Result<u64>;

    async fn delete(&mut self, table: &str, conds: &Conditions, fname: &str) -> Result<u64>;

    async fn replace(
        &mut self,
        table: &str,
        unique_key: &[&str],
        rows: &[DatabaseRow],
        fname: &str,
    ) -> Result<u64>;

    async fn upsert(
        &mut self,
        table: &str,
        rows: &[DatabaseRow],
        unique_key: &[&str],
        set: &Assignments,
        fname: &str,
    ) -> Result<u64>;

    async fn begin(&mut self, fname: &str, mode: TransactionMode) -> Result<()>;

    async fn commit(&mut self, fname: &str, flush: FlushMode) -> Result<()>;

    async fn rollback(&mut self, fname: &str, flush: FlushMode) -> Result<()>;

    async fn start_atomic(&mut self, fname: &str, cancelable: Cancelable) -> Result<AtomicSectionId>;

    async fn end_atomic(&mut self, fname: &str) -> Result<()>;

    async fn cancel_atomic(&mut self, fname: &str, section: Option<AtomicSectionId>) -> Result<()>;

    async fn lock(&mut self, name: &str, fname: &str, timeout: Duration) -> Result<bool>;

    async fn unlock(&mut self, name: &str, fname: &str) -> Result<bool>;

    async fn select_domain(&mut self, domain: &DatabaseDomain) -> Result<()>;
}

#[async_trait]
impl ReadableDatabase for Connection {
    fn database_type(&self) -> DatabaseType {
        Connection::database_type(self)
    }

    fn server_name(&self) -> String {
        Connection::server_name(self)
    }

    fn get_domain_id(&self) -> String {
        Connection::get_domain_id(self)
    }

    fn table_name(&self, name: &str) -> String {
        Connection::table_name(self, name)
    }

    async fn select(
        &mut self,
        tables: &[&str],
        vars: &[&str],
        conds: &Conditions,
        fname: &str,
        options: &SelectOptions,
        joins: &[Join],
    ) -> Result<ResultWrapper> {
        Connection::select(self, tables, vars, conds, fname, options, joins).await
    }

    async fn select_row(
        &mut self,
        tables: &[&str],
        vars: &[&str],
        conds: &Conditions,
        fname: &str,
        options: &SelectOptions,
        joins: &[Join],
    ) -> Result<Option<DatabaseRow>> {
        Connection::select_row(self, tables, vars, conds, fname, options, joins).await
    }

    async fn select_field(
        &mut self,
        tables: &[&str],
        var: &str,
        conds: &Conditions,
        fname: &str,
        options: &SelectOptions,
        joins: &[Join],
    ) -> Result<Option<DatabaseValue>> {
        Connection::select_field(self, tables, var, conds, fname, options, joins).await
    }

    async fn select_field_values(
        &mut self,
        tables: &[&str],
        var: &str,
        conds: &Conditions,
        fname: &str,
        options: &SelectOptions,
        joins: &[Join],
    ) -> Result<Vec<DatabaseValue>> {
        Connection::select_field_values(self, tables, var, conds, fname, options, joins).await
    }

    async fn select_row_count(
        &mut self,
        tables: &[&str],
        var: &str,
        conds: &Conditions,
        fname: &str,
        options: &SelectOptions,
        joins: &[Join],
    ) -> Result<u64> {
        Connection::select_row_count(self, tables, var, conds, fname, options, joins).await
    }

    async fn lock_is_free(&mut self, name: &str, fname: &str) -> Result<bool> {
        Connection::lock_is_free(self, name, fname).await
    }

    async fn get_lag(&mut self) -> Result<Option<f64>> {
        Connection::get_lag(self).await
    }

    async fn server_info(&mut self) -> Result<String> {
        Connection::server_info(self).await
    }
}

#[async_trait]
impl Database for Connection {
    async fn query(&mut self, sql: &str, fname: &str, flags: QueryFlags) -> Result<ResultWrapper> {
        Connection::query(self, sql, fname, flags).await
    }

    async fn insert(&mut self, table: &str, rows: &[DatabaseRow], fname: &str, ignore: bool) -> Result<u64> {
        Connection::insert(self, table, rows, fname, ignore).await
    }

    async fn update(
        &mut self,
        table: &str,
        set: &Assignments,
        conds: &Conditions,
        fname: &str,
    ) -> Result<u64> {
        Connection::update(self, table, set, conds, fname).await
    }

    async fn delete(&mut self, table: &str, conds: &Conditions, fname: &str) -> Result<u64> {
        Connection::delete(self, table, conds, fname).await
    }

    async fn replace(
        &mut self,
        table: &str,
        unique_key: &[&str],
        rows: &[DatabaseRow],
        fname: &str,
    ) -> Result<u64> {
        Connection::replace(self, table, unique_key, rows, fname).await
    }

    async fn upsert(
        &mut self,
        table: &str,
        rows: &[DatabaseRow],
        unique_key: &[&str],
        set: &Assignments,
        fname: &str,
    ) -> Result<u64> {
        Connection::upsert(self, table, rows, unique_key, set, fname).await
    }

    async fn begin(&mut self, fname: &str, mode: TransactionMode) -> Result<()> {
        Connection::begin(self, fname, mode).await
    }

    async fn commit(&mut self, fname: &str, flush: FlushMode) -> Result<()> {
        Connection::commit(self, fname, flush).await
    }

    async fn rollback(&mut self, fname: &str, flush: FlushMode) -> Result<()> {
        Connection::rollback(self, fname, flush).await
    }

    async fn start_atomic(&mut self, fname: &str, cancelable: Cancelable) -> Result<AtomicSectionId> {
        Connection::start_atomic(self, fname, cancelable).await
    }

    async fn end_atomic(&mut self, fname: &str) -> Result<()> {
        Connection::end_atomic(self, fname).await
    }

    async fn cancel_atomic(&mut self, fname: &str, section: Option<AtomicSectionId>) -> Result<()> {
        Connection::cancel_atomic(self, fname, section).await
    }

    async fn lock(&mut self, name: &str, fname: &str, timeout: Duration) -> Result<bool> {
        Connection::lock(self, name, fname, timeout).await
    }

    async fn unlock(&mut self, name: &str, fname: &str) -> Result<bool> {
        Connection::unlock(self, name, fname).await
    }

    async fn select_domain(&mut self, domain: &DatabaseDomain) -> Result<()> {
        Connection::select_domain(self, domain).await
    }
}
