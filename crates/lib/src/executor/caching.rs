//! The second-level (per-namespace) cache coordinator. Writes are staged
//! in a per-session transactional buffer and only become visible to other
//! sessions when the owning session commits.

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use squill_core::Value;
use squill_core::cache::{Cache, CacheKey};
use squill_core::errors::Result;

use crate::executor::{BatchResult, Executor};
use crate::mapping::MappedStatement;
use crate::session::RowBounds;

pub struct CachingExecutor {
    delegate: Box<dyn Executor>,
    manager: TransactionalCacheManager,
}

impl CachingExecutor {
    pub fn new(delegate: Box<dyn Executor>) -> Self {
        Self {
            delegate,
            manager: TransactionalCacheManager::default(),
        }
    }
}

impl Executor for CachingExecutor {
    fn query(
        &mut self,
        statement: &Arc<MappedStatement>,
        parameter: Value,
        bounds: RowBounds,
    ) -> Result<Vec<Value>> {
        if let Some(cache) = statement.cache.clone() {
            if statement.flush_cache {
                self.manager.clear(&cache);
            }
            if statement.use_cache {
                let key = self
                    .delegate
                    .create_cache_key(statement, &parameter, &bounds)?;
                if let Some(Value::List(rows)) = self.manager.get(&cache, &key)? {
                    tracing::debug!(statement = %statement.id, "namespace cache hit");
                    return Ok(rows);
                }
                let rows = self.delegate.query(statement, parameter, bounds)?;
                self.manager.put(&cache, key, Value::List(rows.clone()));
                return Ok(rows);
            }
        }
        self.delegate.query(statement, parameter, bounds)
    }

    fn update(&mut self, statement: &Arc<MappedStatement>, parameter: &mut Value) -> Result<u64> {
        if let Some(cache) = statement.cache.clone()
            && statement.flush_cache
        {
            self.manager.clear(&cache);
        }
        self.delegate.update(statement, parameter)
    }

    fn flush_statements(&mut self) -> Result<Vec<BatchResult>> {
        self.delegate.flush_statements()
    }

    fn commit(&mut self, required: bool) -> Result<()> {
        self.delegate.commit(required)?;
        self.manager.commit()
    }

    fn rollback(&mut self, required: bool) -> Result<()> {
        let result = self.delegate.rollback(required);
        self.manager.rollback();
        result
    }

    fn create_cache_key(
        &self,
        statement: &Arc<MappedStatement>,
        parameter: &Value,
        bounds: &RowBounds,
    ) -> Result<CacheKey> {
        self.delegate.create_cache_key(statement, parameter, bounds)
    }

    fn is_cached(&self, statement: &Arc<MappedStatement>, key: &CacheKey) -> bool {
        self.delegate.is_cached(statement, key)
    }

    fn clear_local_cache(&mut self) {
        self.delegate.clear_local_cache();
    }

    fn close(&mut self, force_rollback: bool) -> Result<()> {
        if force_rollback {
            self.manager.rollback();
        } else {
            let _ = self.manager.commit();
        }
        self.delegate.close(force_rollback)
    }

    fn is_closed(&self) -> bool {
        self.delegate.is_closed()
    }
}

#[derive(Default)]
struct TransactionalCacheManager {
    caches: AHashMap<String, TransactionalCache>,
}

impl TransactionalCacheManager {
    fn entry(&mut self, cache: &Arc<dyn Cache>) -> &mut TransactionalCache {
        self.caches
            .entry(cache.id().to_string())
            .or_insert_with(|| TransactionalCache::new(cache.clone()))
    }

    fn clear(&mut self, cache: &Arc<dyn Cache>) {
        self.entry(cache).clear();
    }

    fn get(&mut self, cache: &Arc<dyn Cache>, key: &CacheKey) -> Result<Option<Value>> {
        self.entry(cache).get(key)
    }

    fn put(&mut self, cache: &Arc<dyn Cache>, key: CacheKey, value: Value) {
        self.entry(cache).put(key, value);
    }

    fn commit(&mut self) -> Result<()> {
        for transactional in self.caches.values_mut() {
            transactional.commit()?;
        }
        Ok(())
    }

    fn rollback(&mut self) {
        for transactional in self.caches.values_mut() {
            transactional.rollback();
        }
    }
}

/// Stages one namespace cache's writes until commit. Misses are recorded
/// so their blocking-cache latches get released on either outcome.
struct TransactionalCache {
    cache: Arc<dyn Cache>,
    clear_on_commit: bool,
    staged: AHashMap<CacheKey, Value>,
    missed: AHashSet<CacheKey>,
}

impl TransactionalCache {
    fn new(cache: Arc<dyn Cache>) -> Self {
        Self {
            cache,
            clear_on_commit: false,
            staged: AHashMap::new(),
            missed: AHashSet::new(),
        }
    }

    fn get(&mut self, key: &CacheKey) -> Result<Option<Value>> {
        let value = self.cache.get(key)?;
        if value.is_none() {
            self.missed.insert(key.clone());
        }
        // entries already scheduled for clearing must not be served
        if self.clear_on_commit {
            return Ok(None);
        }
        Ok(value)
    }

    fn put(&mut self, key: CacheKey, value: Value) {
        self.staged.insert(key, value);
    }

    fn clear(&mut self) {
        self.clear_on_commit = true;
        self.staged.clear();
    }

    fn commit(&mut self) -> Result<()> {
        if self.clear_on_commit {
            self.cache.clear()?;
        }
        for (key, value) in self.staged.drain() {
            self.missed.remove(&key);
            self.cache.put(key, value)?;
        }
        for key in self.missed.drain() {
            self.cache.remove(&key)?;
        }
        self.clear_on_commit = false;
        Ok(())
    }

    fn rollback(&mut self) {
        for key in self.missed.drain() {
            let _ = self.cache.remove(&key);
        }
        self.staged.clear();
        self.clear_on_commit = false;
    }
}

#[cfg(test)]
mod tests {
    use squill_core::cache::PerpetualCache;

    use super::*;

    fn key(n: i64) -> CacheKey {
        let mut key = CacheKey::new();
        key.update(Value::Int(n));
        key
    }

    #[test]
    fn staged_puts_are_invisible_until_commit() {
        let cache: Arc<dyn Cache> = Arc::new(PerpetualCache::new("ns"));
        let mut manager = TransactionalCacheManager::default();

        manager.put(&cache, key(1), Value::Int(42));
        assert_eq!(cache.get(&key(1)).unwrap(), None);

        manager.commit().unwrap();
        assert_eq!(cache.get(&key(1)).unwrap(), Some(Value::Int(42)));
    }

    #[test]
    fn rollback_discards_the_stage() {
        let cache: Arc<dyn Cache> = Arc::new(PerpetualCache::new("ns"));
        let mut manager = TransactionalCacheManager::default();

        manager.put(&cache, key(1), Value::Int(42));
        manager.rollback();
        manager.commit().unwrap();
        assert_eq!(cache.get(&key(1)).unwrap(), None);
    }

    #[test]
    fn clear_defers_until_commit() {
        let cache: Arc<dyn Cache> = Arc::new(PerpetualCache::new("ns"));
        cache.put(key(1), Value::Int(1)).unwrap();
        let mut manager = TransactionalCacheManager::default();

        manager.clear(&cache);
        // other sessions still see the entry before commit
        assert_eq!(cache.get(&key(1)).unwrap(), Some(Value::Int(1)));
        // but this session does not
        assert_eq!(manager.get(&cache, &key(1)).unwrap(), None);

        manager.commit().unwrap();
        assert_eq!(cache.get(&key(1)).unwrap(), None);
    }
}
