//! Session-scoped named locks
//!
//! Locks are reference counted per connection, so the backend only sees the
//! first acquisition and the last release. Backends with server-side named
//! locks are driven through their lock statements; the rest go through the
//! driver's out-of-band lock manager.

use super::connection::{Connection, NamedLock};
use super::error::{DatabaseError, Result};
use super::query::{Query, QueryFlags};
use super::transaction::FlushMode;
use super::value::ResultWrapper;
use crate::backends::locks::LockManager;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// A named lock released when dropped
///
/// While a transaction is open the release waits until it resolves. When
/// the connection is idle, a lock held through an out-of-band lock manager
/// (SQLite) is released on drop. Server-side locks (MySQL, Postgres) need a
/// statement on the session, so dropping one while idle releases it before
/// the next statement; use [`Connection::with_scoped_lock`] or
/// [`ScopedLock::release`] to give those back without waiting.
#[derive(Debug)]
#[must_use = "the lock is released as soon as this is dropped"]
pub struct ScopedLock {
    name: String,
    session_locks: Arc<Mutex<BTreeMap<String, NamedLock>>>,
    deferred: Arc<Mutex<Vec<String>>>,
    trx_open: Arc<AtomicBool>,
    manager: Option<LockManager>,
    released: bool,
}

impl ScopedLock {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release the lock now
    pub async fn release(mut self, conn: &mut Connection, fname: &str) -> Result<bool> {
        self.released = true;
        conn.unlock(&self.name, fname).await
    }

    /// Drop one acquisition through the lock manager; false when the
    /// release has to go through the connection instead
    fn release_detached(&self) -> bool {
        let Some(manager) = &self.manager else {
            return false;
        };
        if self.trx_open.load(Ordering::SeqCst) {
            return false;
        }

        let mut held = self.session_locks.lock();
        match held.get_mut(&self.name) {
            Some(lock) if lock.count > 1 => lock.count -= 1,
            Some(_) => {
                held.remove(&self.name);
                drop(held);
                match manager.unlock(&self.name) {
                    Ok(released) => {
                        tracing::debug!(target: "rdbms::connection", lock = %self.name, released, "released scoped lock on drop");
                    }
                    Err(e) => {
                        tracing::warn!(target: "rdbms::connection", lock = %self.name, error = %e, "cannot release scoped lock");
                    }
                }
            }
            // Already gone with the session
            None => {}
        }
        true
    }
}

impl Drop for ScopedLock {
    fn drop(&mut self) {
        if self.released || self.release_detached() {
            return;
        }
        self.deferred.lock().push(std::mem::take(&mut self.name));
    }
}

impl Connection {
    /// Acquire a named lock, waiting up to `timeout`
    ///
    /// Returns `Ok(false)` when the wait timed out. Acquiring a lock this
    /// connection already holds succeeds immediately.
    pub async fn lock(&mut self, name: &str, fname: &str, timeout: Duration) -> Result<bool> {
        if let Some(held) = self.session_locks.lock().get_mut(name) {
            held.count += 1;
            return Ok(true);
        }

        let acquired = self.backend_lock(name, fname, timeout).await?;
        if acquired {
            self.session_locks.lock().insert(
                name.to_string(),
                NamedLock {
                    acquired_at: Utc::now(),
                    trx_id: self.trx.id().map(str::to_string),
                    count: 1,
                },
            );
            tracing::debug!(target: "rdbms::connection", fname, lock = name, "acquired named lock");
        } else {
            tracing::info!(target: "rdbms::connection", fname, lock = name, ?timeout, "timed out waiting for named lock");
        }
        Ok(acquired)
    }

    /// Release one acquisition of a named lock
    ///
    /// Returns `Ok(false)` when this connection does not hold it.
    pub async fn unlock(&mut self, name: &str, fname: &str) -> Result<bool> {
        {
            let mut held = self.session_locks.lock();
            match held.get_mut(name) {
                None => {
                    tracing::debug!(target: "rdbms::connection", fname, lock = name, "unlock of a lock not held");
                    return Ok(false);
                }
                Some(lock) if lock.count > 1 => {
                    lock.count -= 1;
                    return Ok(true);
                }
                Some(_) => {
                    held.remove(name);
                }
            }
        }
        let released = self.backend_unlock(name, fname).await?;
        tracing::debug!(target: "rdbms::connection", fname, lock = name, released, "released named lock");
        Ok(released)
    }

    /// Whether nobody holds the named lock
    pub async fn lock_is_free(&mut self, name: &str, fname: &str) -> Result<bool> {
        if self.session_locks.lock().contains_key(name) {
            return Ok(false);
        }
        match self.driver.lock_statements(name, Duration::ZERO) {
            Some(statements) => {
                let result = self
                    .run_statement(statements.is_free, QueryFlags::CHANGE_LOCKS, fname)
                    .await?;
                Ok(first_value_truthy(&result))
            }
            None => {
                self.ensure_connected().await?;
                self.driver.do_lock_is_free(name).await
            }
        }
    }

    /// Named locks held by this session
    pub fn session_locks(&self) -> BTreeMap<String, NamedLock> {
        self.session_locks.lock().clone()
    }

    /// Acquire a lock for a unit of work that must see fresh data
    ///
    /// Fails with `Expected` when writes or callbacks are pending. Once the
    /// lock is held, an implicit snapshot transaction is committed so that
    /// the next read starts a new one. Returns `Ok(None)` on timeout.
    pub async fn get_scoped_lock_and_flush(
        &mut self,
        name: &str,
        fname: &str,
        timeout: Duration,
    ) -> Result<Option<ScopedLock>> {
        if self.writes_or_callbacks_pending() {
            return Err(DatabaseError::expected(format!(
                "{}: cannot flush snapshot for lock '{}'; writes or callbacks are pending from {}",
                fname,
                name,
                self.pending_write_callers().join(", ")
            )));
        }
        if !self.lock(name, fname, timeout).await? {
            return Ok(None);
        }
        if self.trx.is_open() && self.trx.is_automatic() && self.trx.sections().is_empty() {
            self.commit(fname, FlushMode::Internal).await?;
        }
        Ok(Some(ScopedLock {
            name: name.to_string(),
            session_locks: Arc::clone(&self.session_locks),
            deferred: Arc::clone(&self.deferred_unlocks),
            trx_open: self.trx.open_flag(),
            manager: self.driver.lock_manager(),
            released: false,
        }))
    }

    /// Run `f` while holding a scoped lock
    ///
    /// The lock is released when `f` returns if no transaction is open, or
    /// when the open transaction resolves. Returns `Ok(None)` without
    /// running `f` when the lock could not be acquired within `timeout`.
    pub async fn with_scoped_lock<F, T>(
        &mut self,
        name: &str,
        fname: &str,
        timeout: Duration,
        f: F,
    ) -> Result<Option<T>>
    where
        F: for<'a> FnOnce(&'a mut Connection) -> Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>
            + Send,
        T: Send,
    {
        let Some(lock) = self.get_scoped_lock_and_flush(name, fname, timeout).await? else {
            return Ok(None);
        };
        let outcome = f(self).await;
        if self.trx.is_open() {
            drop(lock);
        } else if let Err(e) = lock.release(self, fname).await {
            tracing::warn!(target: "rdbms::connection", fname, lock = name, error = %e, "cannot release scoped lock");
        }
        outcome.map(Some)
    }

    /// Release locks whose [`ScopedLock`] was dropped, unless a transaction
    /// is still open
    pub async fn release_deferred_locks(&mut self, fname: &str) {
        if self.trx.is_open() {
            return;
        }
        let names: Vec<String> = std::mem::take(&mut *self.deferred_unlocks.lock());
        for name in names {
            if let Err(e) = self.unlock(&name, fname).await {
                tracing::warn!(target: "rdbms::connection", fname, lock = %name, error = %e, "cannot release scoped lock");
            }
        }
    }

    async fn backend_lock(&mut self, name: &str, fname: &str, timeout: Duration) -> Result<bool> {
        let Some(statements) = self.driver.lock_statements(name, timeout) else {
            self.ensure_connected().await?;
            return self.driver.do_lock(name, timeout).await;
        };

        let deadline = Instant::now() + timeout;
        loop {
            let query = Query::new(statements.acquire.clone(), QueryFlags::CHANGE_LOCKS);
            let query = if statements.blocking {
                query.with_server_wait(timeout)
            } else {
                query
            };
            let result = self.run_query(query, fname).await?;
            let acquired = first_value_truthy(&result);
            if acquired || statements.blocking {
                return Ok(acquired);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn backend_unlock(&mut self, name: &str, fname: &str) -> Result<bool> {
        match self.driver.lock_statements(name, Duration::ZERO) {
            Some(statements) => {
                let result = self
                    .run_statement(statements.release, QueryFlags::CHANGE_LOCKS, fname)
                    .await?;
                Ok(first_value_truthy(&result))
            }
            None => {
                self.ensure_connected().await?;
                self.driver.do_unlock(name).await
            }
        }
    }
}

fn first_value_truthy(result: &ResultWrapper) -> bool {
    result
        .first()
        .and_then(|row| row.get_index(0))
        .is_some_and(|v| v.is_truthy())
}
