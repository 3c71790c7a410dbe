//! # Lock Manager
//!
//! Per-resource exclusive locks with two layers:
//!
//! - an in-process `tokio` mutex per key, so waiters in this process queue
//!   without polling;
//! - an OS advisory lock (`fs2`) on `tmp/<name>.lock`, so processes sharing
//!   the cache directory exclude each other as well.
//!
//! The kernel drops advisory locks when the holding process exits, so a crashed
//! holder never leaves a stale lock behind. A holder that is alive but stuck is
//! never stolen from; waiters give up after the configured timeout instead.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::layout::CacheLayout;
use crate::error::{CacheError, CacheResult};

/// Resource protected by a lock
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKey {
    /// An in-progress download, keyed by its deterministic download key
    Download(String),
    /// A blob, keyed by its content id
    Content(String),
}

impl LockKey {
    fn name(&self) -> String {
        match self {
            Self::Download(key) => format!("download-{key}"),
            Self::Content(id) => format!("blob-{id}"),
        }
    }

    /// Inverse of the lock file naming; `None` for foreign files
    pub fn from_name(name: &str) -> Option<Self> {
        if let Some(key) = name.strip_prefix("download-") {
            return Some(Self::Download(key.to_owned()));
        }
        name.strip_prefix("blob-").map(|id| Self::Content(id.to_owned()))
    }
}

/// Diagnostic record written into a held lock file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub acquired_at: u64,
}

type Slot = Arc<AsyncMutex<()>>;

#[derive(Debug)]
pub struct LockManager {
    layout: CacheLayout,
    timeout: Option<Duration>,
    poll_interval: Duration,
    slots: Mutex<HashMap<String, Slot>>,
}

impl LockManager {
    pub fn new(layout: CacheLayout, timeout: Option<Duration>, poll_interval: Duration) -> Self {
        Self {
            layout,
            timeout,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for exclusive ownership of `key`.
    ///
    /// Fails with [`CacheError::LockTimeout`] when the configured timeout
    /// elapses first. Dropping the returned guard releases both layers.
    pub async fn acquire(self: &Arc<Self>, key: &LockKey) -> CacheResult<LockGuard> {
        let name = key.name();
        let started = Instant::now();
        let deadline = self.timeout.map(|timeout| started + timeout);

        let slot = self.slot(&name);
        let local = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, slot.lock_owned()).await {
                Ok(local) => local,
                Err(_) => {
                    self.release_slot(&name);
                    return Err(self.timed_out(&name, started.elapsed()));
                }
            },
            None => slot.lock_owned().await,
        };

        let mut guard = LockGuard {
            manager: Arc::clone(self),
            name,
            local: Some(local),
            file: None,
        };

        let path = self.layout.lock_path(&guard.name);
        loop {
            let file = self.open_lock_file(&guard.name)?;
            loop {
                match file.try_lock_exclusive() {
                    Ok(()) => break,
                    Err(e) if is_contended(&e) => {
                        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                            return Err(self.timed_out(&guard.name, started.elapsed()));
                        }
                        tokio::time::sleep(self.poll_interval).await;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            // The previous holder may have deleted the file we were waiting on
            if is_current(&file, &path) {
                record_holder(&file, &guard.name);
                guard.file = Some(file);
                break;
            }
            debug!(lock = %guard.name, "Lock file was replaced while waiting, reopening");
        }

        debug!(lock = %guard.name, waited = ?started.elapsed(), "Acquired lock");
        Ok(guard)
    }

    /// Take `key` only if it is free right now
    pub fn try_acquire(self: &Arc<Self>, key: &LockKey) -> CacheResult<Option<LockGuard>> {
        let name = key.name();
        let slot = self.slot(&name);
        let local = match slot.try_lock_owned() {
            Ok(local) => local,
            Err(_) => {
                self.release_slot(&name);
                return Ok(None);
            }
        };

        let mut guard = LockGuard {
            manager: Arc::clone(self),
            name,
            local: Some(local),
            file: None,
        };

        let path = self.layout.lock_path(&guard.name);
        loop {
            let file = self.open_lock_file(&guard.name)?;
            match file.try_lock_exclusive() {
                Ok(()) => {}
                Err(e) if is_contended(&e) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
            if is_current(&file, &path) {
                record_holder(&file, &guard.name);
                guard.file = Some(file);
                return Ok(Some(guard));
            }
        }
    }

    /// Delete the lock file of `key` if nobody holds it.
    ///
    /// Waiters that opened the old file notice it is gone once they lock it
    /// and reopen, so removal never lets two holders in.
    pub fn remove_lock_file(self: &Arc<Self>, key: &LockKey) -> CacheResult<bool> {
        let Some(guard) = self.try_acquire(key)? else {
            return Ok(false);
        };
        match std::fs::remove_file(self.layout.lock_path(&guard.name)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Read the diagnostic record of whoever last held `key`
    pub fn holder(&self, key: &LockKey) -> Option<LockHolder> {
        let contents = std::fs::read(self.layout.lock_path(&key.name())).ok()?;
        serde_json::from_slice(&contents).ok()
    }

    fn slot(&self, name: &str) -> Slot {
        let mut slots = self.slots.lock();
        Arc::clone(slots.entry(name.to_owned()).or_default())
    }

    // Drop the table entry once nobody but the table holds it
    fn release_slot(&self, name: &str) {
        let mut slots = self.slots.lock();
        if slots
            .get(name)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(name);
        }
    }

    fn open_lock_file(&self, name: &str) -> CacheResult<File> {
        let path = self.layout.lock_path(name);
        let open = || {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
        };
        match open() {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                std::fs::create_dir_all(self.layout.tmp_dir())?;
                Ok(open()?)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn timed_out(&self, name: &str, waited: Duration) -> CacheError {
        let holder = std::fs::read(self.layout.lock_path(name))
            .ok()
            .and_then(|contents| serde_json::from_slice::<LockHolder>(&contents).ok());
        warn!(
            lock = %name,
            waited = ?waited,
            holder_pid = holder.as_ref().map(|h| h.pid),
            "Gave up waiting for lock"
        );
        CacheError::LockTimeout {
            key: name.to_owned(),
            waited,
        }
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }
}

/// Exclusive ownership of one lock key; released on drop
#[derive(Debug)]
pub struct LockGuard {
    manager: Arc<LockManager>,
    name: String,
    local: Option<OwnedMutexGuard<()>>,
    file: Option<File>,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = FileExt::unlock(&file) {
                warn!(lock = %self.name, error = %e, "Failed to release file lock");
            }
        }
        drop(self.local.take());
        self.manager.release_slot(&self.name);
    }
}

// Whether `path` still names the file we locked
#[cfg(unix)]
fn is_current(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (file.metadata(), std::fs::metadata(path)) {
        (Ok(locked), Ok(named)) => locked.dev() == named.dev() && locked.ino() == named.ino(),
        _ => false,
    }
}

// Open files cannot be deleted here, so the name always matches
#[cfg(not(unix))]
fn is_current(_file: &File, path: &Path) -> bool {
    path.exists()
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn record_holder(file: &File, name: &str) {
    let holder = LockHolder {
        pid: std::process::id(),
        acquired_at: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default(),
    };
    let result = serde_json::to_vec(&holder)
        .map_err(io::Error::from)
        .and_then(|contents| {
            let mut file = file;
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&contents)
        });
    if let Err(e) = result {
        debug!(lock = %name, error = %e, "Failed to record lock holder");
    }
}
