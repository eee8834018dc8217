use super::{validate_key, CacheError, StateCache, TMP_PREFIX, TOMBSTONE_KEY};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Directory name for a cluster identity: first 32 hex chars of its SHA-256
pub fn cache_dir_name(identity: &str) -> String {
    let digest = Sha256::digest(identity.as_bytes());
    let mut name = hex::encode(digest);
    name.truncate(32);
    name
}

/// Directory-backed cache, one file per key
#[derive(Debug)]
pub struct FileCache {
    dir: PathBuf,
    exhausted: AtomicBool,
}

impl FileCache {
    /// Open the cache for `identity` under `root`
    ///
    /// # Returns
    /// * `Ok(FileCache)` - directory exists (created if needed) and is usable
    /// * `Err(CacheError::Exhausted)` - a previous run cleaned this cache
    pub fn open(root: &Path, identity: &str) -> Result<Self, CacheError> {
        let dir = root.join(cache_dir_name(identity));
        Self::open_dir(&dir)
    }

    /// Open a cache at an explicit directory
    pub fn open_dir(dir: &Path) -> Result<Self, CacheError> {
        if dir.join(TOMBSTONE_KEY).exists() {
            return Err(CacheError::Exhausted(dir.to_path_buf()));
        }

        fs::create_dir_all(dir).map_err(|source| CacheError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        info!(dir = %dir.display(), "Opened state cache");
        Ok(Self {
            dir: dir.to_path_buf(),
            exhausted: AtomicBool::new(false),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn ensure_writable(&self) -> Result<(), CacheError> {
        if self.exhausted.load(Ordering::SeqCst) {
            return Err(CacheError::Exhausted(self.dir.clone()));
        }
        Ok(())
    }

    fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CacheError + '_ {
        move |source| CacheError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Keys currently stored, sorted
    fn keys(&self) -> Result<Vec<String>, CacheError> {
        let entries = fs::read_dir(&self.dir).map_err(Self::io_err(&self.dir))?;
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(Self::io_err(&self.dir))?;
            if !entry.path().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == TOMBSTONE_KEY || name.starts_with(TMP_PREFIX) {
                continue;
            }
            keys.push(name);
        }
        keys.sort();
        Ok(keys)
    }
}

impl StateCache for FileCache {
    fn save(&self, key: &str, value: &[u8]) -> Result<(), CacheError> {
        validate_key(key)?;
        self.ensure_writable()?;

        let target = self.dir.join(key);
        let tmp = self
            .dir
            .join(format!("{}{}", TMP_PREFIX, uuid::Uuid::new_v4()));

        // Write-then-rename keeps a crash from leaving a half-written entry
        let result = fs::write(&tmp, value).and_then(|_| fs::rename(&tmp, &target));
        if let Err(source) = result {
            warn!(key = %key, error = %source, "Failed to write cache entry");
            let _ = fs::remove_file(&tmp);
            return Err(CacheError::Io {
                path: target,
                source,
            });
        }

        debug!(key = %key, bytes = value.len(), "Saved cache entry");
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        validate_key(key)?;
        let path = self.dir.join(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(CacheError::NotFound(key.to_string())),
            Err(source) => Err(CacheError::Io { path, source }),
        }
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        validate_key(key)?;
        self.ensure_writable()?;
        let path = self.dir.join(key);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(key = %key, "Deleted cache entry");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CacheError::Io { path, source }),
        }
    }

    fn in_cache(&self, key: &str) -> Result<bool, CacheError> {
        validate_key(key)?;
        Ok(self.dir.join(key).is_file())
    }

    fn iterate(
        &self,
        visit: &mut dyn FnMut(&str, &[u8]) -> Result<(), CacheError>,
    ) -> Result<(), CacheError> {
        for key in self.keys()? {
            let value = match self.load(&key) {
                Ok(value) => value,
                // Deleted between listing and reading
                Err(CacheError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            visit(&key, &value)?;
        }
        Ok(())
    }

    fn clean(&self) -> Result<(), CacheError> {
        self.ensure_writable()?;

        let entries = fs::read_dir(&self.dir).map_err(Self::io_err(&self.dir))?;
        for entry in entries {
            let entry = entry.map_err(Self::io_err(&self.dir))?;
            let path = entry.path();
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match removed {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(source) => return Err(CacheError::Io { path, source }),
            }
        }

        let tombstone = self.dir.join(TOMBSTONE_KEY);
        fs::write(&tombstone, b"").map_err(Self::io_err(&tombstone))?;
        self.exhausted.store(true, Ordering::SeqCst);

        info!(dir = %self.dir.display(), "State cache cleaned");
        Ok(())
    }

    fn clean_with_exceptions(&self, keep: &[&str]) -> Result<(), CacheError> {
        self.ensure_writable()?;
        for key in self.keys()? {
            if keep.contains(&key.as_str()) {
                continue;
            }
            self.delete(&key)?;
        }
        debug!(kept = ?keep, "State cache cleaned with exceptions");
        Ok(())
    }

    fn get_path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }
}

#[cfg(test)]
#[path = "file_test.rs"]
mod tests;
