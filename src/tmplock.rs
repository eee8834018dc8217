//! Temporary-directory lock
//!
//! Only one dhctl process may use a temporary directory (and therefore the
//! state cache inside it) at a time. The lock is a plain file recording who
//! holds it; it is removed when the guard is dropped.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const LOCK_FILE_NAME: &str = ".dhctl-tmp-dir.lock";

#[derive(Debug, Error)]
pub enum TmpLockError {
    #[error(
        "temporary directory is in use: lock file {path} is held by '{holder}'; \
         wait for it to finish or choose a different --tmp-dir"
    )]
    Held { path: PathBuf, holder: String },

    #[error("tmp dir lock I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Held lock; dropping it removes the lock file
#[derive(Debug)]
pub struct TmpDirLock {
    path: PathBuf,
    released: bool,
}

impl TmpDirLock {
    /// Acquire the lock for `dir`
    ///
    /// Fails if a lock file exists in `dir`, in any of its ancestors, or
    /// anywhere below it.
    ///
    /// # Arguments
    /// * `dir` - temporary directory to lock (created if missing)
    /// * `command` - command line recorded in the lock for diagnostics
    pub fn acquire(dir: &Path, command: &str) -> Result<Self, TmpLockError> {
        fs::create_dir_all(dir)?;

        if let Some((path, holder)) = find_existing_lock(dir)? {
            return Err(TmpLockError::Held { path, holder });
        }

        let path = dir.join(LOCK_FILE_NAME);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                // Lost a race with another process between the scan and create
                let holder = read_holder(&path);
                return Err(TmpLockError::Held { path, holder });
            }
            Err(e) => return Err(e.into()),
        };

        file.write_all(holder_identity(command).as_bytes())?;
        file.sync_all()?;

        info!(lock = %path.display(), "Acquired tmp dir lock");
        Ok(Self {
            path,
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release explicitly; equivalent to dropping the guard
    pub fn release(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(lock = %self.path.display(), "Released tmp dir lock"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(lock = %self.path.display(), error = %e, "Failed to remove tmp dir lock"),
        }
    }
}

impl Drop for TmpDirLock {
    fn drop(&mut self) {
        self.remove();
    }
}

/// `"<user>@<host> $ <command>"`
pub fn holder_identity(command: &str) -> String {
    format!("{}@{} $ {}", current_user(), current_host(), command)
}

pub(crate) fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

pub(crate) fn current_host() -> String {
    if let Ok(host) = std::env::var("HOSTNAME") {
        if !host.is_empty() {
            return host;
        }
    }
    fs::read_to_string("/etc/hostname")
        .map(|h| h.trim().to_string())
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn read_holder(path: &Path) -> String {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Look for a lock file in `dir`, its ancestors, then its subtree
fn find_existing_lock(dir: &Path) -> Result<Option<(PathBuf, String)>, TmpLockError> {
    let dir = dir.canonicalize()?;

    for ancestor in dir.ancestors() {
        let candidate = ancestor.join(LOCK_FILE_NAME);
        if candidate.is_file() {
            let holder = read_holder(&candidate);
            return Ok(Some((candidate, holder)));
        }
    }

    for entry in WalkDir::new(&dir).min_depth(1).into_iter() {
        let entry = match entry {
            Ok(entry) => entry,
            // Unreadable subdirectories cannot hold our lock
            Err(e) => {
                debug!(error = %e, "Skipping unreadable path during lock scan");
                continue;
            }
        };
        if entry.file_type().is_file() && entry.file_name() == LOCK_FILE_NAME {
            let path = entry.path().to_path_buf();
            let holder = read_holder(&path);
            return Ok(Some((path, holder)));
        }
    }

    Ok(None)
}

#[cfg(test)]
#[path = "tmplock_test.rs"]
mod tests;
