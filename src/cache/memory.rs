use super::{validate_key, CacheError, StateCache};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// Cache that stores nothing
///
/// Used for sub-flows that must not touch the persistent store, such as the
/// initial connectivity check.
#[derive(Debug, Default, Clone, Copy)]
pub struct DummyCache;

impl StateCache for DummyCache {
    fn save(&self, _key: &str, _value: &[u8]) -> Result<(), CacheError> {
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        Err(CacheError::NotFound(key.to_string()))
    }

    fn delete(&self, _key: &str) -> Result<(), CacheError> {
        Ok(())
    }

    fn in_cache(&self, _key: &str) -> Result<bool, CacheError> {
        Ok(false)
    }

    fn iterate(
        &self,
        _visit: &mut dyn FnMut(&str, &[u8]) -> Result<(), CacheError>,
    ) -> Result<(), CacheError> {
        Ok(())
    }

    fn clean(&self) -> Result<(), CacheError> {
        Ok(())
    }

    fn clean_with_exceptions(&self, _keep: &[&str]) -> Result<(), CacheError> {
        Ok(())
    }

    fn get_path(&self, key: &str) -> PathBuf {
        PathBuf::from(key)
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    entries: BTreeMap<String, Vec<u8>>,
    exhausted: bool,
}

/// Process-local cache with the same tombstone semantics as [`super::FileCache`]
#[derive(Debug, Default)]
pub struct MemoryCache {
    inner: Mutex<MemoryInner>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once `clean` has run
    pub fn is_exhausted(&self) -> bool {
        self.lock().exhausted
    }

    /// Snapshot of the stored keys
    pub fn keys(&self) -> Vec<String> {
        self.lock().entries.keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        // A poisoned map is still structurally valid
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn writable(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>, CacheError> {
        let guard = self.lock();
        if guard.exhausted {
            return Err(CacheError::Exhausted(PathBuf::from("memory")));
        }
        Ok(guard)
    }
}

impl StateCache for MemoryCache {
    fn save(&self, key: &str, value: &[u8]) -> Result<(), CacheError> {
        validate_key(key)?;
        self.writable()?
            .entries
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        validate_key(key)?;
        self.lock()
            .entries
            .get(key)
            .cloned()
            .ok_or_else(|| CacheError::NotFound(key.to_string()))
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        validate_key(key)?;
        self.writable()?.entries.remove(key);
        Ok(())
    }

    fn in_cache(&self, key: &str) -> Result<bool, CacheError> {
        validate_key(key)?;
        Ok(self.lock().entries.contains_key(key))
    }

    fn iterate(
        &self,
        visit: &mut dyn FnMut(&str, &[u8]) -> Result<(), CacheError>,
    ) -> Result<(), CacheError> {
        // Visit a snapshot so the callback may write back into the cache
        let snapshot = self.lock().entries.clone();
        for (key, value) in &snapshot {
            visit(key, value)?;
        }
        Ok(())
    }

    fn clean(&self) -> Result<(), CacheError> {
        let mut inner = self.writable()?;
        inner.entries.clear();
        inner.exhausted = true;
        Ok(())
    }

    fn clean_with_exceptions(&self, keep: &[&str]) -> Result<(), CacheError> {
        self.writable()?
            .entries
            .retain(|key, _| keep.contains(&key.as_str()));
        Ok(())
    }

    fn get_path(&self, key: &str) -> PathBuf {
        PathBuf::from("memory").join(key)
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
