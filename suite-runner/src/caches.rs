// Run caches
// State that accumulates during a run and must be emptied between phases.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

/// A cache that can be emptied between test phases.
pub trait RunCache: Send + Sync {
    fn name(&self) -> &str;
    fn clear(&self);
}

/// Deduplication set for once-per-message log suppression.
#[derive(Debug, Clone, Default)]
pub struct LogDedupCache {
    seen: Arc<RwLock<HashSet<String>>>,
}

impl LogDedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a message key, returning true the first time it is seen.
    pub fn record(&self, key: &str) -> bool {
        self.seen
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string())
    }

    pub fn len(&self) -> usize {
        self.seen.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RunCache for LogDedupCache {
    fn name(&self) -> &str {
        "log-dedup"
    }

    fn clear(&self) {
        self.seen
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Memoized generated-code fragments keyed by expression text.
#[derive(Debug, Clone, Default)]
pub struct ExpressionCache {
    entries: Arc<RwLock<HashMap<String, String>>>,
}

impl ExpressionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, expression: &str, generated: String) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(expression.to_string(), generated);
    }

    pub fn get(&self, expression: &str) -> Option<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(expression)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RunCache for ExpressionCache {
    fn name(&self) -> &str {
        "expression"
    }

    fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// The caches a runner empties after every phase.
#[derive(Clone, Default)]
pub struct CacheSet {
    caches: Vec<Arc<dyn RunCache>>,
}

impl CacheSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set covering the caches the simulator populates during a run.
    pub fn standard() -> Self {
        let mut set = Self::new();
        set.register(Arc::new(LogDedupCache::new()));
        set.register(Arc::new(ExpressionCache::new()));
        set
    }

    pub fn register(&mut self, cache: Arc<dyn RunCache>) {
        self.caches.push(cache);
    }

    /// Empties every registered cache, returning how many were cleared.
    pub fn clear_all(&self) -> usize {
        for cache in &self.caches {
            cache.clear();
        }
        self.caches.len()
    }

    pub fn len(&self) -> usize {
        self.caches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_cache_reports_first_sighting() {
        let cache = LogDedupCache::new();
        assert!(cache.record("clock drift"));
        assert!(!cache.record("clock drift"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn expression_cache_round_trips() {
        let cache = ExpressionCache::new();
        cache.insert("v + 1*mV", "_tmp_0".to_string());
        assert_eq!(cache.get("v + 1*mV"), Some("_tmp_0".to_string()));
        assert_eq!(cache.get("w"), None);
    }

    #[test]
    fn clear_all_empties_every_cache() {
        let dedup = LogDedupCache::new();
        let expressions = ExpressionCache::new();
        dedup.record("warning");
        expressions.insert("x", "_tmp_1".to_string());

        let mut set = CacheSet::new();
        set.register(Arc::new(dedup.clone()));
        set.register(Arc::new(expressions.clone()));

        assert_eq!(set.clear_all(), 2);
        assert!(dedup.is_empty());
        assert!(expressions.is_empty());
    }

    #[test]
    fn standard_set_has_named_caches() {
        let set = CacheSet::standard();
        assert_eq!(set.len(), 2);
    }
}
