//! The cache interface and its composable decorators. A namespace cache
//! is always a stack: eviction at the bottom over the perpetual backing
//! map, policy decorators above it, and the locking boundary outermost.

pub mod decorators;
mod key;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ahash::AHashMap;
use strum_macros::{Display, EnumString};

use crate::errors::CacheError;
use crate::value::Value;

pub use key::CacheKey;

pub type CacheResult<T> = Result<T, CacheError>;

pub trait Cache: Send + Sync {
    fn id(&self) -> &str;

    fn size(&self) -> usize;

    fn put(&self, key: CacheKey, value: Value) -> CacheResult<()>;

    fn get(&self, key: &CacheKey) -> CacheResult<Option<Value>>;

    fn remove(&self, key: &CacheKey) -> CacheResult<Option<Value>>;

    fn clear(&self) -> CacheResult<()>;
}

/// The backing map every decorator stack bottoms out in.
pub struct PerpetualCache {
    id: String,
    map: Mutex<AHashMap<CacheKey, Value>>,
}

impl PerpetualCache {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            map: Mutex::new(AHashMap::new()),
        }
    }
}

impl Cache for PerpetualCache {
    fn id(&self) -> &str {
        &self.id
    }

    fn size(&self) -> usize {
        self.map.lock().expect("cache map lock").len()
    }

    fn put(&self, key: CacheKey, value: Value) -> CacheResult<()> {
        self.map.lock().expect("cache map lock").insert(key, value);
        Ok(())
    }

    fn get(&self, key: &CacheKey) -> CacheResult<Option<Value>> {
        Ok(self.map.lock().expect("cache map lock").get(key).cloned())
    }

    fn remove(&self, key: &CacheKey) -> CacheResult<Option<Value>> {
        Ok(self.map.lock().expect("cache map lock").remove(key))
    }

    fn clear(&self) -> CacheResult<()> {
        self.map.lock().expect("cache map lock").clear();
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum EvictionKind {
    #[default]
    Lru,
    Fifo,
    Soft,
    Weak,
    Perpetual,
}

/// Assembles a namespace cache stack from `<cache>` attributes. Assembly
/// order, outermost first: Blocking? -> Synchronized -> Logging ->
/// Serialized? -> Scheduled? -> eviction -> Perpetual.
#[derive(Debug)]
pub struct CacheBuilder {
    id: String,
    eviction: EvictionKind,
    clear_interval: Option<Duration>,
    size: Option<usize>,
    read_write: bool,
    blocking: bool,
    blocking_timeout: Option<Duration>,
}

impl CacheBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            eviction: EvictionKind::default(),
            clear_interval: None,
            size: None,
            read_write: false,
            blocking: false,
            blocking_timeout: None,
        }
    }

    pub fn eviction(mut self, eviction: EvictionKind) -> Self {
        self.eviction = eviction;
        self
    }

    pub fn clear_interval(mut self, interval: Option<Duration>) -> Self {
        self.clear_interval = interval;
        self
    }

    pub fn size(mut self, size: Option<usize>) -> Self {
        self.size = size;
        self
    }

    /// Read-write caches hand out decoupled copies by serializing entries.
    pub fn read_write(mut self, read_write: bool) -> Self {
        self.read_write = read_write;
        self
    }

    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn blocking_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.blocking_timeout = timeout;
        self
    }

    pub fn build(self) -> Arc<dyn Cache> {
        use decorators::*;

        let base: Box<dyn Cache> = Box::new(PerpetualCache::new(self.id.clone()));
        let mut cache: Box<dyn Cache> = match self.eviction {
            EvictionKind::Lru => Box::new(LruCache::new(base, self.size.unwrap_or(1024))),
            EvictionKind::Fifo => Box::new(FifoCache::new(base, self.size.unwrap_or(1024))),
            EvictionKind::Soft => Box::new(SoftCache::new(base, self.size.unwrap_or(256))),
            EvictionKind::Weak => Box::new(WeakCache::new(base)),
            EvictionKind::Perpetual => base,
        };
        if let Some(interval) = self.clear_interval {
            cache = Box::new(ScheduledCache::new(cache, interval));
        }
        if self.read_write {
            cache = Box::new(SerializedCache::new(cache));
        }
        cache = Box::new(LoggingCache::new(cache));
        cache = Box::new(SynchronizedCache::new(cache));
        if self.blocking {
            cache = Box::new(BlockingCache::new(cache, self.blocking_timeout));
        }
        Arc::from(cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: i64) -> CacheKey {
        let mut key = CacheKey::new();
        key.update(Value::Int(n));
        key
    }

    #[test]
    fn perpetual_cache_stores_and_clears() {
        let cache = PerpetualCache::new("test");
        cache.put(key(1), Value::Int(10)).unwrap();
        assert_eq!(cache.get(&key(1)).unwrap(), Some(Value::Int(10)));
        assert_eq!(cache.size(), 1);
        cache.clear().unwrap();
        assert_eq!(cache.get(&key(1)).unwrap(), None);
    }

    #[test]
    fn builder_assembles_a_working_stack() {
        let cache = CacheBuilder::new("ns")
            .eviction(EvictionKind::Lru)
            .size(Some(10))
            .read_write(true)
            .build();
        cache.put(key(1), Value::Str("v".into())).unwrap();
        assert_eq!(cache.get(&key(1)).unwrap(), Some(Value::Str("v".into())));
        assert_eq!(cache.id(), "ns");
    }
}
