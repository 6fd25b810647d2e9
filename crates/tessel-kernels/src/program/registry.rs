use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::key::program_hash;

/// Consumer-side cache of compiled artifacts keyed by program cache key.
///
/// Entries remember their full key so a hash collision is a miss, not a
/// wrong artifact.
pub struct ProgramRegistry<V> {
    inner: Mutex<HashMap<u64, (String, V)>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> Default for ProgramRegistry<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> ProgramRegistry<V> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let found = self.inner.lock().ok().and_then(|g| {
            g.get(&program_hash(key))
                .filter(|(stored, _)| stored == key)
                .map(|(_, v)| v.clone())
        });
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    pub fn insert(&self, key: &str, value: V) {
        if let Ok(mut g) = self.inner.lock() {
            g.insert(program_hash(key), (key.to_string(), value));
        }
    }

    /// Look up `key`, building and inserting the value on a miss.
    pub fn get_or_insert_with<E>(&self, key: &str, build: impl FnOnce() -> Result<V, E>) -> Result<V, E> {
        if let Some(v) = self.get(key) {
            return Ok(v);
        }
        let value = build()?;
        self.insert(key, value.clone());
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(hits, misses)` since creation or the last reset.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    pub fn reset_counters(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_hits_and_misses() {
        let registry: ProgramRegistry<u32> = ProgramRegistry::new();
        assert_eq!(registry.get("a"), None);
        registry.insert("a", 7);
        assert_eq!(registry.get("a"), Some(7));
        let built: Result<u32, ()> = registry.get_or_insert_with("b", || Ok(9));
        assert_eq!(built, Ok(9));
        assert_eq!(registry.get_or_insert_with::<()>("b", || Err(())), Ok(9));
        assert_eq!(registry.counters(), (2, 2));
        assert_eq!(registry.len(), 2);
        registry.reset_counters();
        assert_eq!(registry.counters(), (0, 0));
    }
}
