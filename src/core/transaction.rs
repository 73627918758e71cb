//! Transaction and atomic-section bookkeeping
//!
//! [`TransactionState`] is the per-connection record of the open transaction:
//! its level, who opened it, whether it is in an error state, which writes it
//! holds, the stack of atomic sections and the callbacks waiting on its
//! outcome. It never talks to the server itself; `Connection` drives it.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Identifies one atomic section for the lifetime of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AtomicSectionId(u64);

impl AtomicSectionId {
    /// Raw counter value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for AtomicSectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "section#{}", self.0)
    }
}

/// Whether an atomic section may be cancelled on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cancelable {
    /// The section can be rolled back without ending the transaction
    Yes,
    /// The section can only be undone with the whole transaction
    No,
}

/// How an atomic section can be undone
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SavepointState {
    /// Not cancelable; bookkeeping only
    None,
    /// Cancelable, undone by rolling back the transaction the section owns
    NotApplicable,
    /// Cancelable, backed by a SAVEPOINT of this name
    Named(String),
}

/// One entry of the atomic-section stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtomicSection {
    pub fname: String,
    pub id: AtomicSectionId,
    pub savepoint: SavepointState,
}

/// Scope of a COMMIT/ROLLBACK request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// The caller owns this one transaction
    One,
    /// Issued by the connection itself (atomic sections, snapshots, close)
    Internal,
    /// Issued by a manager flushing every connection it tracks
    AllPeers,
}

impl FlushMode {
    /// Internal and all-peer flushes may touch automatic transactions
    pub fn is_mass_flush(&self) -> bool {
        matches!(self, FlushMode::Internal | FlushMode::AllPeers)
    }
}

/// Who is starting a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    /// Application code calling `begin()`
    Explicit,
    /// The connection opening one implicitly
    Internal,
}

/// How a transaction ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    Commit,
    Rollback,
}

/// Health of the open transaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransactionStatus {
    /// No transaction
    #[default]
    None,
    /// Statements may run
    Ok,
    /// A statement failed in a way that left the transaction unusable;
    /// only ROLLBACK (or ROLLBACK TO SAVEPOINT) is accepted
    Error,
}

/// Callback run once the transaction resolves
pub type TransactionCallback = Box<dyn FnOnce(TransactionOutcome) + Send + Sync>;

struct PendingCallback {
    fname: String,
    section: Option<AtomicSectionId>,
    force_rollback: bool,
    callback: TransactionCallback,
}

/// Per-connection transaction state
#[derive(Default)]
pub struct TransactionState {
    level: u8,
    automatic: bool,
    atomic_owned: bool,
    id: Option<String>,
    fname: Option<String>,
    status: TransactionStatus,
    done_writes: bool,
    write_callers: Vec<String>,
    started_at: Option<DateTime<Utc>>,
    sections: Vec<AtomicSection>,
    section_counter: u64,
    savepoint_counter: u64,
    trx_counter: u64,
    idle_callbacks: Vec<PendingCallback>,
    end_callbacks: Vec<PendingCallback>,
    /// Mirrors `level > 0` for observers outside the connection
    open_flag: Arc<AtomicBool>,
}

impl fmt::Debug for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionState")
            .field("level", &self.level)
            .field("automatic", &self.automatic)
            .field("fname", &self.fname)
            .field("status", &self.status)
            .field("done_writes", &self.done_writes)
            .field("sections", &self.sections)
            .field("idle_callbacks", &self.idle_callbacks.len())
            .field("end_callbacks", &self.end_callbacks.len())
            .finish()
    }
}

impl TransactionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// 1 while a transaction is open, 0 otherwise
    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn is_open(&self) -> bool {
        self.level > 0
    }

    /// Shared flag that reads true while a transaction is open
    pub(crate) fn open_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.open_flag)
    }

    /// Opened implicitly (by `ConnectionFlags::TRX` or an atomic section)
    pub fn is_automatic(&self) -> bool {
        self.automatic
    }

    /// Opened by an outermost atomic section, which commits it when it ends
    pub fn is_atomic_owned(&self) -> bool {
        self.atomic_owned
    }

    pub fn set_atomic_owned(&mut self, owned: bool) {
        self.atomic_owned = owned;
    }

    /// Short identifier of the open transaction
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Caller that opened the transaction
    pub fn fname(&self) -> Option<&str> {
        self.fname.as_deref()
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn set_status(&mut self, status: TransactionStatus) {
        if self.level > 0 {
            self.status = status;
        }
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Record that the transaction is now open
    pub fn mark_begun(&mut self, fname: &str, automatic: bool) {
        self.trx_counter += 1;
        self.level = 1;
        self.open_flag.store(true, Ordering::SeqCst);
        self.automatic = automatic;
        self.atomic_owned = false;
        self.id = Some(format!("{:06x}", self.trx_counter));
        self.fname = Some(fname.to_string());
        self.status = TransactionStatus::Ok;
        self.done_writes = false;
        self.write_callers.clear();
        self.started_at = Some(Utc::now());
    }

    /// Record that the transaction ended and hand back the callbacks to run
    pub fn mark_ended(&mut self, outcome: TransactionOutcome) -> Vec<(TransactionCallback, TransactionOutcome)> {
        self.level = 0;
        self.open_flag.store(false, Ordering::SeqCst);
        self.automatic = false;
        self.atomic_owned = false;
        self.id = None;
        self.fname = None;
        self.status = TransactionStatus::None;
        self.done_writes = false;
        self.write_callers.clear();
        self.started_at = None;
        self.sections.clear();
        self.take_callbacks(outcome)
    }

    /// Record a write statement issued by `fname`
    pub fn note_write(&mut self, fname: &str) {
        if self.level == 0 {
            return;
        }
        self.done_writes = true;
        if !self.write_callers.iter().any(|c| c == fname) {
            self.write_callers.push(fname.to_string());
        }
    }

    pub fn done_writes(&self) -> bool {
        self.level > 0 && self.done_writes
    }

    pub fn write_callers(&self) -> &[String] {
        &self.write_callers
    }

    /// Whether any commit/resolution callbacks are queued
    pub fn callbacks_pending(&self) -> bool {
        !self.idle_callbacks.is_empty() || !self.end_callbacks.is_empty()
    }

    /// Callers that queued callbacks still waiting on this transaction
    pub fn callback_callers(&self) -> Vec<String> {
        self.idle_callbacks
            .iter()
            .chain(self.end_callbacks.iter())
            .map(|c| c.fname.clone())
            .collect()
    }

    // Atomic sections

    pub fn sections(&self) -> &[AtomicSection] {
        &self.sections
    }

    pub fn top_section(&self) -> Option<&AtomicSection> {
        self.sections.last()
    }

    pub fn current_section_id(&self) -> Option<AtomicSectionId> {
        self.sections.last().map(|s| s.id)
    }

    /// Allocate a fresh savepoint name
    pub fn next_savepoint_name(&mut self) -> String {
        self.savepoint_counter += 1;
        format!("rdbms_atomic{}", self.savepoint_counter)
    }

    /// Push a section onto the stack
    pub fn push_section(&mut self, fname: &str, savepoint: SavepointState) -> AtomicSectionId {
        self.section_counter += 1;
        let id = AtomicSectionId(self.section_counter);
        self.sections.push(AtomicSection {
            fname: fname.to_string(),
            id,
            savepoint,
        });
        id
    }

    pub fn pop_section(&mut self) -> Option<AtomicSection> {
        self.sections.pop()
    }

    /// Position of the most recent section with this id
    pub fn section_position(&self, id: AtomicSectionId) -> Option<usize> {
        self.sections.iter().rposition(|s| s.id == id)
    }

    /// Remove every section above `pos`, returning them bottom first
    pub fn truncate_sections(&mut self, pos: usize) -> Vec<AtomicSection> {
        self.sections.split_off(pos + 1)
    }

    pub fn clear_sections(&mut self) {
        self.sections.clear();
    }

    // Callbacks

    /// Queue a callback for after COMMIT; dropped if the transaction or its
    /// owning section is rolled back
    pub fn push_idle_callback(&mut self, fname: &str, callback: TransactionCallback) {
        let section = self.current_section_id();
        self.idle_callbacks.push(PendingCallback {
            fname: fname.to_string(),
            section,
            force_rollback: false,
            callback,
        });
    }

    /// Queue a callback for when the transaction resolves either way
    pub fn push_end_callback(&mut self, fname: &str, callback: TransactionCallback) {
        let section = self.current_section_id();
        self.end_callbacks.push(PendingCallback {
            fname: fname.to_string(),
            section,
            force_rollback: false,
            callback,
        });
    }

    /// Hand callbacks of an ended section to its parent
    pub fn reassign_callbacks(&mut self, from: AtomicSectionId, to: Option<AtomicSectionId>) {
        for cb in self
            .idle_callbacks
            .iter_mut()
            .chain(self.end_callbacks.iter_mut())
        {
            if cb.section == Some(from) {
                cb.section = to;
            }
        }
    }

    /// Fix up callbacks owned by cancelled sections: commit callbacks are
    /// dropped, resolution callbacks will observe a rollback
    pub fn cancel_callbacks(&mut self, cancelled: &[AtomicSectionId]) {
        let owned = |cb: &PendingCallback| cb.section.is_some_and(|id| cancelled.contains(&id));
        self.idle_callbacks.retain(|cb| !owned(cb));
        for cb in self.end_callbacks.iter_mut() {
            if owned(cb) {
                cb.force_rollback = true;
                cb.section = None;
            }
        }
    }

    fn take_callbacks(&mut self, outcome: TransactionOutcome) -> Vec<(TransactionCallback, TransactionOutcome)> {
        let mut run = Vec::new();
        let idle = std::mem::take(&mut self.idle_callbacks);
        if outcome == TransactionOutcome::Commit {
            run.extend(idle.into_iter().map(|cb| (cb.callback, TransactionOutcome::Commit)));
        }
        for cb in std::mem::take(&mut self.end_callbacks) {
            let seen = if cb.force_rollback {
                TransactionOutcome::Rollback
            } else {
                outcome
            };
            run.push((cb.callback, seen));
        }
        run
    }

    /// Forget everything after the session was lost; callers get the
    /// resolution callbacks to run with `Rollback`
    pub fn reset(&mut self) -> Vec<(TransactionCallback, TransactionOutcome)> {
        self.mark_ended(TransactionOutcome::Rollback)
    }
}
