//! Transactions, atomic sections and transaction callbacks
//!
//! Only one real transaction exists per connection. Nesting is expressed
//! with atomic sections, which are optionally backed by savepoints so that
//! a section can be cancelled without losing the work around it.

use super::config::ConnectionFlags;
use super::connection::{run_callbacks, Connection};
use super::error::{DatabaseError, Result};
use super::query::QueryFlags;
use super::transaction::{
    AtomicSectionId, Cancelable, FlushMode, SavepointState, TransactionMode, TransactionOutcome,
    TransactionStatus,
};
use std::future::Future;
use std::pin::Pin;

impl Connection {
    /// Begin a transaction
    ///
    /// Fails with `Expected` while any transaction is open: there is no
    /// nesting besides atomic sections.
    pub async fn begin(&mut self, fname: &str, mode: TransactionMode) -> Result<()> {
        if self.trx.is_open() {
            let message = if !self.trx.sections().is_empty() {
                let names: Vec<&str> = self.trx.sections().iter().map(|s| s.fname.as_str()).collect();
                format!(
                    "{}: got explicit BEGIN while atomic section(s) {} are open",
                    fname,
                    names.join(", ")
                )
            } else if self.trx.is_automatic() {
                format!(
                    "{}: implicit transaction already active (from {})",
                    fname,
                    self.trx.fname().unwrap_or("?")
                )
            } else {
                format!(
                    "{}: explicit transaction already active (from {})",
                    fname,
                    self.trx.fname().unwrap_or("?")
                )
            };
            return Err(DatabaseError::expected(message));
        }
        if mode == TransactionMode::Explicit && self.config.has_flag(ConnectionFlags::TRX) {
            return Err(DatabaseError::expected(format!(
                "{}: explicit BEGIN is not allowed while DBO_TRX is set",
                fname
            )));
        }
        self.begin_transaction(fname, mode == TransactionMode::Internal).await
    }

    pub(crate) async fn begin_transaction(&mut self, fname: &str, automatic: bool) -> Result<()> {
        let sql = self.driver.begin_sql();
        self.run_statement(sql, QueryFlags::CHANGE_TRX, fname).await?;
        self.trx.mark_begun(fname, automatic);
        tracing::debug!(
            target: "rdbms::connection",
            fname,
            trx = self.trx.id().unwrap_or("-"),
            automatic,
            "transaction started"
        );
        Ok(())
    }

    /// Commit the open transaction
    pub async fn commit(&mut self, fname: &str, flush: FlushMode) -> Result<()> {
        if !self.trx.sections().is_empty() {
            let top = self.trx.top_section().map(|s| s.fname.clone()).unwrap_or_default();
            return Err(DatabaseError::expected(format!(
                "{}: cannot commit; atomic section {} is still open",
                fname, top
            )));
        }

        if flush.is_mass_flush() {
            if !self.trx.is_open() {
                return Ok(());
            }
            if !self.trx.is_automatic() {
                return Err(DatabaseError::expected(format!(
                    "{}: flushing an explicit transaction (from {})",
                    fname,
                    self.trx.fname().unwrap_or("?")
                )));
            }
        } else if !self.trx.is_open() {
            tracing::debug!(target: "rdbms::connection", fname, "no transaction to commit");
            return Ok(());
        } else if self.trx.is_automatic() {
            return Err(DatabaseError::expected(format!(
                "{}: implicit transaction must be committed with a mass flush",
                fname
            )));
        }

        let sql = self.driver.commit_sql();
        self.run_statement(sql, QueryFlags::CHANGE_TRX, fname).await?;
        let trx_id = self.trx.id().map(str::to_string);
        let callbacks = self.trx.mark_ended(TransactionOutcome::Commit);
        tracing::debug!(target: "rdbms::connection", fname, trx = trx_id.as_deref().unwrap_or("-"), "transaction committed");

        self.release_deferred_locks(fname).await;
        run_callbacks(callbacks);
        Ok(())
    }

    /// Roll back the open transaction
    ///
    /// A mass flush also discards any open atomic sections.
    pub async fn rollback(&mut self, fname: &str, flush: FlushMode) -> Result<()> {
        if flush == FlushMode::One {
            if self.config.has_flag(ConnectionFlags::TRX) {
                return Err(DatabaseError::expected(format!(
                    "{}: expected mass rollback of all peer transactions (DBO_TRX set)",
                    fname
                )));
            }
            if !self.trx.sections().is_empty() {
                let top = self.trx.top_section().map(|s| s.fname.clone()).unwrap_or_default();
                return Err(DatabaseError::expected(format!(
                    "{}: cannot roll back; atomic section {} is still open",
                    fname, top
                )));
            }
        } else {
            self.trx.clear_sections();
        }

        if !self.trx.is_open() {
            self.release_deferred_locks(fname).await;
            return Ok(());
        }

        let sql = self.driver.rollback_sql();
        let result = self.run_statement(sql, QueryFlags::CHANGE_TRX, fname).await;
        let callbacks = self.trx.mark_ended(TransactionOutcome::Rollback);
        match &result {
            Ok(_) => tracing::debug!(target: "rdbms::connection", fname, "transaction rolled back"),
            Err(e) => tracing::warn!(target: "rdbms::connection", fname, error = %e, "ROLLBACK failed; transaction state discarded"),
        }

        self.release_deferred_locks(fname).await;
        run_callbacks(callbacks);
        result.map(|_| ())
    }

    /// End an implicit snapshot transaction that did no writes
    pub async fn flush_snapshot(&mut self, fname: &str, flush: FlushMode) -> Result<()> {
        if flush == FlushMode::One && self.config.has_flag(ConnectionFlags::TRX) {
            return Err(DatabaseError::expected(format!(
                "{}: expected mass snapshot flush of all peer transactions (DBO_TRX set)",
                fname
            )));
        }
        if self.trx.is_open() && !self.trx.is_automatic() {
            return Err(DatabaseError::expected(format!(
                "{}: cannot flush snapshot; explicit transaction active (from {})",
                fname,
                self.trx.fname().unwrap_or("?")
            )));
        }
        if !self.trx.sections().is_empty() {
            return Err(DatabaseError::expected(format!(
                "{}: cannot flush snapshot; atomic sections are open",
                fname
            )));
        }
        if self.writes_or_callbacks_pending() {
            return Err(DatabaseError::expected(format!(
                "{}: cannot flush snapshot; writes pending from {}",
                fname,
                self.pending_write_and_callback_callers().join(", ")
            )));
        }
        self.commit(fname, FlushMode::Internal).await
    }

    /// 1 while a transaction is open, else 0
    pub fn trx_level(&self) -> u8 {
        self.trx.level()
    }

    pub fn trx_status(&self) -> TransactionStatus {
        self.trx.status()
    }

    /// Whether the open transaction has written anything
    pub fn writes_pending(&self) -> bool {
        self.trx.is_open() && self.trx.done_writes()
    }

    /// Whether the open transaction has writes or queued callbacks
    pub fn writes_or_callbacks_pending(&self) -> bool {
        self.trx.is_open() && (self.trx.done_writes() || self.trx.callbacks_pending())
    }

    /// Callers that wrote in the open transaction
    pub fn pending_write_callers(&self) -> Vec<String> {
        if self.trx.is_open() {
            self.trx.write_callers().to_vec()
        } else {
            Vec::new()
        }
    }

    fn pending_write_and_callback_callers(&self) -> Vec<String> {
        let mut callers = self.pending_write_callers();
        for caller in self.trx.callback_callers() {
            if !callers.contains(&caller) {
                callers.push(caller);
            }
        }
        callers
    }

    /// Open an atomic section, beginning a transaction when none is open
    pub async fn start_atomic(&mut self, fname: &str, cancelable: Cancelable) -> Result<AtomicSectionId> {
        let savepoint = if !self.trx.is_open() {
            self.begin_transaction(fname, true).await?;
            if self.config.has_flag(ConnectionFlags::TRX) {
                self.take_savepoint(fname).await?
            } else {
                self.trx.set_atomic_owned(true);
                match cancelable {
                    Cancelable::Yes => SavepointState::NotApplicable,
                    Cancelable::No => SavepointState::None,
                }
            }
        } else {
            match cancelable {
                Cancelable::Yes => self.take_savepoint(fname).await?,
                Cancelable::No => SavepointState::None,
            }
        };

        let id = self.trx.push_section(fname, savepoint);
        tracing::trace!(target: "rdbms::connection", fname, section = %id, level = self.trx.sections().len(), "atomic section started");
        Ok(id)
    }

    async fn take_savepoint(&mut self, fname: &str) -> Result<SavepointState> {
        let name = self.trx.next_savepoint_name();
        let sql = self.driver.savepoint_sql(&name);
        self.run_statement(sql, QueryFlags::CHANGE_TRX, fname).await?;
        Ok(SavepointState::Named(name))
    }

    /// Close the innermost atomic section, which must be `fname`
    pub async fn end_atomic(&mut self, fname: &str) -> Result<()> {
        let Some(top) = self.trx.top_section() else {
            return Err(DatabaseError::expected(format!(
                "No atomic section is open (got {})",
                fname
            )));
        };
        if top.fname != fname {
            return Err(DatabaseError::expected(format!(
                "Invalid atomic section ended (got {} but expected {})",
                fname, top.fname
            )));
        }

        let Some(section) = self.trx.pop_section() else {
            return Err(DatabaseError::unexpected("atomic section stack changed underneath"));
        };
        let parent = self.trx.current_section_id();
        self.trx.reassign_callbacks(section.id, parent);

        if self.trx.sections().is_empty() && self.trx.is_atomic_owned() {
            self.commit(fname, FlushMode::Internal).await?;
        } else if let SavepointState::Named(name) = &section.savepoint {
            let sql = self.driver.release_savepoint_sql(name);
            self.run_statement(sql, QueryFlags::CHANGE_TRX, fname).await?;
        }
        Ok(())
    }

    /// Undo an atomic section
    ///
    /// With `section` given, every section opened after it is discarded
    /// first. The section being cancelled must belong to `fname`.
    pub async fn cancel_atomic(&mut self, fname: &str, section: Option<AtomicSectionId>) -> Result<()> {
        if self.trx.sections().is_empty() {
            return Err(DatabaseError::expected(format!(
                "No atomic section is open (got {})",
                fname
            )));
        }

        let mut excised = match section {
            Some(id) => {
                let pos = self.trx.section_position(id).ok_or_else(|| {
                    DatabaseError::expected(format!("Atomic section {} not found (for {})", id, fname))
                })?;
                self.trx.truncate_sections(pos)
            }
            None => Vec::new(),
        };

        let top_fname = self.trx.top_section().map(|s| s.fname.clone()).unwrap_or_default();
        if top_fname != fname {
            self.trx.set_status(TransactionStatus::Error);
            return Err(DatabaseError::expected(format!(
                "Invalid atomic section ended (got {} but expected {})",
                fname, top_fname
            )));
        }

        let Some(cancelled) = self.trx.pop_section() else {
            return Err(DatabaseError::unexpected("atomic section stack changed underneath"));
        };
        let savepoint = cancelled.savepoint.clone();
        excised.push(cancelled);
        let ids: Vec<AtomicSectionId> = excised.iter().map(|s| s.id).collect();
        self.trx.cancel_callbacks(&ids);

        match savepoint {
            SavepointState::Named(name) => {
                let sql = self.driver.rollback_to_savepoint_sql(&name);
                self.run_statement(sql, QueryFlags::CHANGE_TRX, fname).await?;
                self.trx.set_status(TransactionStatus::Ok);
            }
            SavepointState::NotApplicable | SavepointState::None => {
                self.rollback(fname, FlushMode::Internal).await?;
            }
        }

        tracing::debug!(target: "rdbms::connection", fname, sections = ids.len(), "atomic section cancelled");
        self.set_affected_rows(0);
        Ok(())
    }

    /// Run `f` inside an atomic section
    ///
    /// The section ends when `f` succeeds. On error it is cancelled
    /// (cancelable) or the whole transaction is rolled back, and the
    /// original error is returned.
    pub async fn do_atomic_section<F, T>(&mut self, fname: &str, cancelable: Cancelable, f: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a mut Connection) -> Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>
            + Send,
        T: Send,
    {
        let id = self.start_atomic(fname, cancelable).await?;
        match f(self).await {
            Ok(value) => {
                self.end_atomic(fname).await?;
                Ok(value)
            }
            Err(e) => {
                let undone = match cancelable {
                    Cancelable::Yes => self.cancel_atomic(fname, Some(id)).await,
                    Cancelable::No => self.rollback(fname, FlushMode::Internal).await,
                };
                if let Err(undo_error) = undone {
                    tracing::warn!(
                        target: "rdbms::connection",
                        fname,
                        error = %undo_error,
                        "cannot undo failed atomic section"
                    );
                }
                Err(e)
            }
        }
    }

    /// Run `callback` after the transaction commits, or now if none is open
    ///
    /// The callback is dropped if the transaction, or the atomic section it
    /// was registered in, is rolled back.
    pub fn on_transaction_commit_or_idle<F>(&mut self, fname: &str, callback: F)
    where
        F: FnOnce(TransactionOutcome) + Send + Sync + 'static,
    {
        if self.trx.is_open() {
            self.trx.push_idle_callback(fname, Box::new(callback));
        } else {
            callback(TransactionOutcome::Commit);
        }
    }

    /// Run `callback` when the open transaction commits or rolls back
    pub fn on_transaction_resolution<F>(&mut self, fname: &str, callback: F) -> Result<()>
    where
        F: FnOnce(TransactionOutcome) + Send + Sync + 'static,
    {
        if !self.trx.is_open() {
            return Err(DatabaseError::unexpected(format!(
                "{}: no transaction is active",
                fname
            )));
        }
        self.trx.push_end_callback(fname, Box::new(callback));
        Ok(())
    }
}
