//! Out-of-band named lock managers
//!
//! Backends without server-side named locks (SQLite) coordinate through one
//! of these. Ownership is per driver instance, so two connections in the same
//! process contend exactly like two server sessions would. A manager is a
//! cheap handle; clones share the same held set.
//!
//! File locks are OS advisory locks on an open handle, so a lock dies with
//! the process holding it. A lock file left on disk means nothing by itself.

use crate::core::error::{DatabaseError, Result};
use fs2::FileExt;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// Process-wide table of in-memory locks: `(namespace, name) -> owner`
static MEMORY_LOCKS: Lazy<Mutex<HashMap<(String, String), u64>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Where locks live
#[derive(Debug)]
enum Backing {
    /// One `<sha256>.lock` file per lock in a shared directory
    Files(PathBuf),
    /// The process-wide table, scoped by namespace
    Memory(String),
}

/// What keeps a held lock alive
#[derive(Debug)]
enum Hold {
    /// The locked handle; closing it releases the OS lock
    File(File),
    Memory,
}

#[derive(Debug)]
struct LockState {
    owner: u64,
    backing: Backing,
    held: HashMap<String, Hold>,
}

/// Named locks held by one driver instance
#[derive(Debug, Clone)]
pub struct LockManager {
    state: Arc<Mutex<LockState>>,
}

impl LockManager {
    /// Locks as files under `dir`, shared with other processes
    pub fn files(dir: impl Into<PathBuf>) -> Self {
        Self::with_backing(Backing::Files(dir.into()))
    }

    /// Locks in process memory, contended only by managers with the same
    /// namespace
    pub fn memory(namespace: impl Into<String>) -> Self {
        Self::with_backing(Backing::Memory(namespace.into()))
    }

    fn with_backing(backing: Backing) -> Self {
        Self {
            state: Arc::new(Mutex::new(LockState {
                owner: NEXT_OWNER.fetch_add(1, Ordering::Relaxed),
                backing,
                held: HashMap::new(),
            })),
        }
    }

    /// Names currently held by this manager
    pub fn held(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().held.keys().cloned().collect();
        names.sort();
        names
    }

    /// Try to take `name`, waiting up to `timeout`
    pub async fn lock(&self, name: &str, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_lock(name)? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(target: "rdbms::connection", lock = name, "lock wait timed out");
                return Ok(false);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Take `name` if nobody else holds it, without waiting
    pub fn try_lock(&self, name: &str) -> Result<bool> {
        let mut state = self.state.lock();
        if state.held.contains_key(name) {
            return Ok(true);
        }
        match state.try_acquire(name)? {
            Some(hold) => {
                state.held.insert(name.to_string(), hold);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Release `name`; false if this manager did not hold it
    pub fn unlock(&self, name: &str) -> Result<bool> {
        let mut state = self.state.lock();
        match state.held.remove(name) {
            Some(hold) => {
                state.release(name, hold);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Whether nobody (including this manager) holds `name`
    pub fn is_free(&self, name: &str) -> Result<bool> {
        let state = self.state.lock();
        if state.held.contains_key(name) {
            return Ok(false);
        }
        match &state.backing {
            Backing::Files(dir) => {
                let path = lock_file_path(dir, name);
                let file = match OpenOptions::new().write(true).open(&path) {
                    Ok(file) => file,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
                    Err(e) => return Err(lock_file_error("open", &path, e)),
                };
                // Dropping the handle gives the lock straight back
                try_lock_file(&file, &path)
            }
            Backing::Memory(ns) => Ok(!MEMORY_LOCKS
                .lock()
                .contains_key(&(ns.clone(), name.to_string()))),
        }
    }

    /// Release everything this manager holds
    pub fn release_all(&self) {
        self.state.lock().release_all();
    }
}

impl LockState {
    fn try_acquire(&self, name: &str) -> Result<Option<Hold>> {
        match &self.backing {
            Backing::Files(dir) => {
                std::fs::create_dir_all(dir).map_err(|e| lock_file_error("create directory", dir, e))?;
                let path = lock_file_path(dir, name);
                let mut file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)
                    .map_err(|e| lock_file_error("open", &path, e))?;
                if !try_lock_file(&file, &path)? {
                    return Ok(None);
                }
                file.set_len(0)
                    .and_then(|()| writeln!(file, "{}:{}", std::process::id(), self.owner))
                    .map_err(|e| lock_file_error("write", &path, e))?;
                Ok(Some(Hold::File(file)))
            }
            Backing::Memory(ns) => {
                let mut table = MEMORY_LOCKS.lock();
                let key = (ns.clone(), name.to_string());
                match table.get(&key) {
                    Some(owner) if *owner != self.owner => Ok(None),
                    _ => {
                        table.insert(key, self.owner);
                        Ok(Some(Hold::Memory))
                    }
                }
            }
        }
    }

    fn release(&self, name: &str, hold: Hold) {
        match (hold, &self.backing) {
            (Hold::File(file), _) => {
                if let Err(e) = FileExt::unlock(&file) {
                    tracing::warn!(target: "rdbms::connection", lock = name, error = %e, "cannot unlock lock file; closing it");
                }
            }
            (Hold::Memory, Backing::Memory(ns)) => {
                let mut table = MEMORY_LOCKS.lock();
                let key = (ns.clone(), name.to_string());
                if table.get(&key) == Some(&self.owner) {
                    table.remove(&key);
                }
            }
            (Hold::Memory, Backing::Files(_)) => {}
        }
    }

    fn release_all(&mut self) {
        let held: Vec<(String, Hold)> = self.held.drain().collect();
        for (name, hold) in held {
            self.release(&name, hold);
        }
    }
}

impl Drop for LockState {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// Non-blocking exclusive lock; `Ok(false)` when someone else holds it
fn try_lock_file(file: &File, path: &Path) -> Result<bool> {
    match file.try_lock_exclusive() {
        Ok(()) => Ok(true),
        Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => Ok(false),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(lock_file_error("lock", path, e)),
    }
}

fn lock_file_error(action: &str, path: &Path, e: std::io::Error) -> DatabaseError {
    DatabaseError::unexpected(format!("Cannot {} lock file {}: {}", action, path.display(), e))
}

/// Hex SHA-256 of a lock name
pub fn hash_lock_name(name: &str) -> String {
    hex::encode(Sha256::digest(name.as_bytes()))
}

fn lock_file_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.lock", hash_lock_name(name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_locks_contend() {
        let a = LockManager::memory("test_memory_locks_contend");
        let b = LockManager::memory("test_memory_locks_contend");

        assert!(a.lock("job", Duration::ZERO).await.unwrap());
        assert!(a.lock("job", Duration::ZERO).await.unwrap());
        assert!(!b.lock("job", Duration::from_millis(50)).await.unwrap());
        assert!(!b.is_free("job").unwrap());

        assert!(a.unlock("job").unwrap());
        assert!(b.is_free("job").unwrap());
        assert!(b.lock("job", Duration::ZERO).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_namespaces_are_separate() {
        let a = LockManager::memory("ns_one");
        let b = LockManager::memory("ns_two");
        assert!(a.lock("job", Duration::ZERO).await.unwrap());
        assert!(b.lock("job", Duration::ZERO).await.unwrap());
    }

    #[tokio::test]
    async fn test_clones_share_held_locks() {
        let a = LockManager::memory("test_clones_share_held_locks");
        let handle = a.clone();
        let other = LockManager::memory("test_clones_share_held_locks");

        assert!(a.lock("job", Duration::ZERO).await.unwrap());
        assert_eq!(handle.held(), vec!["job".to_string()]);
        assert!(handle.unlock("job").unwrap());
        assert!(a.held().is_empty());
        assert!(other.try_lock("job").unwrap());
    }

    #[tokio::test]
    async fn test_file_locks() {
        let dir = tempfile::tempdir().unwrap();
        let a = LockManager::files(dir.path());
        let b = LockManager::files(dir.path());

        assert!(a.lock("x", Duration::ZERO).await.unwrap());
        assert!(!b.lock("x", Duration::ZERO).await.unwrap());
        assert!(!b.is_free("x").unwrap());

        drop(a);
        assert!(b.is_free("x").unwrap());
        assert!(b.lock("x", Duration::ZERO).await.unwrap());
        assert!(!b.unlock("never-held").unwrap());
    }

    #[tokio::test]
    async fn test_leftover_lock_file_is_not_held() {
        let dir = tempfile::tempdir().unwrap();
        // What a killed holder leaves behind
        std::fs::write(lock_file_path(dir.path(), "job"), "4242:1\n").unwrap();

        let manager = LockManager::files(dir.path());
        assert!(manager.is_free("job").unwrap());
        assert!(manager.lock("job", Duration::from_millis(100)).await.unwrap());
        assert!(manager.unlock("job").unwrap());
        assert!(manager.lock("job", Duration::ZERO).await.unwrap());
    }

    #[test]
    fn test_hash_lock_name() {
        let h = hash_lock_name("abc");
        assert_eq!(h.len(), 64);
        assert_eq!(
            h,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
