//! Persistent state cache
//!
//! A key to bytes store scoped to one cluster identity. Every destroy step
//! checkpoints into it so a re-run can pick up where the previous run stopped.
//!
//! - [`FileCache`]: one file per key in a directory named after the cluster identity
//! - [`DummyCache`]: accepts everything, stores nothing
//! - [`MemoryCache`]: process-local map, used by transient flows and tests

mod file;
mod memory;

pub use file::{cache_dir_name, FileCache};
pub use memory::{DummyCache, MemoryCache};

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Marker left in an exhausted cache directory
pub const TOMBSTONE_KEY: &str = ".tombstone";

/// Prefix of in-flight write files, never visible as keys
pub(crate) const TMP_PREFIX: &str = ".tmp-";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache {0} is exhausted (it was cleaned by a previous run); use another cache directory")]
    Exhausted(PathBuf),

    #[error("key {0} not found in cache")]
    NotFound(String),

    #[error("invalid cache key {0:?}")]
    InvalidKey(String),

    /// A structured entry could not be decoded; callers may regenerate it
    #[error("failed to decode cached value {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode value for {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("cache I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CacheError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound(_))
    }

    pub fn is_decode(&self) -> bool {
        matches!(self, CacheError::Decode { .. })
    }
}

/// Key to bytes store with tombstone semantics
///
/// `save` is last-writer-wins, `load` of a missing key fails with
/// [`CacheError::NotFound`]. `clean` removes every entry and leaves only the
/// tombstone behind; an exhausted cache refuses further writes.
pub trait StateCache: Send + Sync {
    fn save(&self, key: &str, value: &[u8]) -> Result<(), CacheError>;

    fn load(&self, key: &str) -> Result<Vec<u8>, CacheError>;

    /// Remove a key; removing a missing key is not an error
    fn delete(&self, key: &str) -> Result<(), CacheError>;

    fn in_cache(&self, key: &str) -> Result<bool, CacheError>;

    /// Visit every entry in key order
    fn iterate(
        &self,
        visit: &mut dyn FnMut(&str, &[u8]) -> Result<(), CacheError>,
    ) -> Result<(), CacheError>;

    /// Remove every entry and mark the cache exhausted
    fn clean(&self) -> Result<(), CacheError>;

    /// Remove every entry except `keep`; the cache stays usable
    fn clean_with_exceptions(&self, keep: &[&str]) -> Result<(), CacheError>;

    /// Location a key is (or would be) stored at
    fn get_path(&self, key: &str) -> PathBuf;
}

/// JSON helpers for structured values
///
/// serde_json writes struct fields in declaration order and map entries in
/// `BTreeMap` order, so encoding is deterministic for the types stored here.
pub trait StateCacheExt: StateCache {
    fn save_struct<T: Serialize>(&self, key: &str, value: &T) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(value).map_err(|source| CacheError::Encode {
            key: key.to_string(),
            source,
        })?;
        self.save(key, &bytes)
    }

    fn load_struct<T: DeserializeOwned>(&self, key: &str) -> Result<T, CacheError> {
        let bytes = self.load(key)?;
        serde_json::from_slice(&bytes).map_err(|source| CacheError::Decode {
            key: key.to_string(),
            source,
        })
    }

    /// Load a structured value, treating a missing key as `None`
    fn load_struct_opt<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.load_struct(key) {
            Ok(value) => Ok(Some(value)),
            Err(CacheError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl<C: StateCache + ?Sized> StateCacheExt for C {}

/// Reject keys that would escape the cache directory or collide with internals
pub(crate) fn validate_key(key: &str) -> Result<(), CacheError> {
    let invalid = key.is_empty()
        || key == "."
        || key == ".."
        || key == TOMBSTONE_KEY
        || key.starts_with(TMP_PREFIX)
        || key.contains('/')
        || key.contains('\\')
        || key.contains('\0');

    if invalid {
        return Err(CacheError::InvalidKey(key.to_string()));
    }
    Ok(())
}
