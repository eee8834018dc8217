#![allow(clippy::unwrap_used)] // Tests can use unwrap for brevity

use super::*;
use crate::cache::StateCacheExt;

#[test]
fn test_dummy_cache_stores_nothing() {
    let cache = DummyCache;

    cache.save("node-user", b"secret").unwrap();

    assert!(!cache.in_cache("node-user").unwrap());
    assert!(cache.load("node-user").unwrap_err().is_not_found());
    cache.clean().unwrap();
    cache.save("node-user", b"again").unwrap();
}

#[test]
fn test_memory_cache_clean_marks_exhausted() {
    let cache = MemoryCache::new();
    cache.save("cluster-config", b"a").unwrap();

    cache.clean().unwrap();

    assert!(cache.is_exhausted());
    assert!(cache.keys().is_empty());
    assert!(matches!(
        cache.save("cluster-config", b"b"),
        Err(CacheError::Exhausted(_))
    ));
}

#[test]
fn test_memory_cache_iterate_allows_writes_from_callback() {
    let cache = MemoryCache::new();
    cache.save("a", b"1").unwrap();
    cache.save("b", b"2").unwrap();

    cache
        .iterate(&mut |key, value| cache.save(&format!("{key}.copy"), value))
        .unwrap();

    assert_eq!(cache.keys(), vec!["a", "a.copy", "b", "b.copy"]);
}

#[test]
fn test_memory_cache_load_struct_opt() {
    let cache = MemoryCache::new();

    let missing: Option<Vec<String>> = cache.load_struct_opt("cluster-hosts").unwrap();
    assert!(missing.is_none());

    cache
        .save_struct("cluster-hosts", &vec!["10.0.0.1".to_string()])
        .unwrap();
    let present: Option<Vec<String>> = cache.load_struct_opt("cluster-hosts").unwrap();
    assert_eq!(present, Some(vec!["10.0.0.1".to_string()]));
}
