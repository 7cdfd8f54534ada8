use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::cache::{Cache, CacheKey, CacheResult};
use crate::errors::CacheError;
use crate::value::Value;

/// Access-ordered eviction. The key list tracks recency; the entries
/// themselves live in the underlying cache.
pub struct LruCache {
    delegate: Box<dyn Cache>,
    keys: Mutex<IndexMap<CacheKey, ()>>,
    capacity: usize,
}

impl LruCache {
    pub fn new(delegate: Box<dyn Cache>, capacity: usize) -> Self {
        Self {
            delegate,
            keys: Mutex::new(IndexMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn touch(&self, key: &CacheKey) {
        let mut keys = self.keys.lock().expect("lru key lock");
        if keys.shift_remove(key).is_some() {
            keys.insert(key.clone(), ());
        }
    }
}

impl Cache for LruCache {
    fn id(&self) -> &str {
        self.delegate.id()
    }

    fn size(&self) -> usize {
        self.delegate.size()
    }

    fn put(&self, key: CacheKey, value: Value) -> CacheResult<()> {
        self.delegate.put(key.clone(), value)?;
        let evicted = {
            let mut keys = self.keys.lock().expect("lru key lock");
            keys.shift_remove(&key);
            keys.insert(key, ());
            if keys.len() > self.capacity {
                keys.shift_remove_index(0).map(|(key, ())| key)
            } else {
                None
            }
        };
        if let Some(evicted) = evicted {
            self.delegate.remove(&evicted)?;
        }
        Ok(())
    }

    fn get(&self, key: &CacheKey) -> CacheResult<Option<Value>> {
        let value = self.delegate.get(key)?;
        if value.is_some() {
            self.touch(key);
        }
        Ok(value)
    }

    fn remove(&self, key: &CacheKey) -> CacheResult<Option<Value>> {
        self.keys.lock().expect("lru key lock").shift_remove(key);
        self.delegate.remove(key)
    }

    fn clear(&self) -> CacheResult<()> {
        self.keys.lock().expect("lru key lock").clear();
        self.delegate.clear()
    }
}

/// Insertion-ordered eviction: the oldest entry goes first, whether or
/// not it was read.
pub struct FifoCache {
    delegate: Box<dyn Cache>,
    queue: Mutex<VecDeque<CacheKey>>,
    capacity: usize,
}

impl FifoCache {
    pub fn new(delegate: Box<dyn Cache>, capacity: usize) -> Self {
        Self {
            delegate,
            queue: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }
}

impl Cache for FifoCache {
    fn id(&self) -> &str {
        self.delegate.id()
    }

    fn size(&self) -> usize {
        self.delegate.size()
    }

    fn put(&self, key: CacheKey, value: Value) -> CacheResult<()> {
        self.delegate.put(key.clone(), value)?;
        let evicted = {
            let mut queue = self.queue.lock().expect("fifo queue lock");
            queue.push_back(key);
            if queue.len() > self.capacity {
                queue.pop_front()
            } else {
                None
            }
        };
        if let Some(evicted) = evicted {
            self.delegate.remove(&evicted)?;
        }
        Ok(())
    }

    fn get(&self, key: &CacheKey) -> CacheResult<Option<Value>> {
        self.delegate.get(key)
    }

    fn remove(&self, key: &CacheKey) -> CacheResult<Option<Value>> {
        self.queue
            .lock()
            .expect("fifo queue lock")
            .retain(|k| k != key);
        self.delegate.remove(key)
    }

    fn clear(&self) -> CacheResult<()> {
        self.queue.lock().expect("fifo queue lock").clear();
        self.delegate.clear()
    }
}

/// Clears everything once the configured interval has elapsed, checked on
/// every operation.
pub struct ScheduledCache {
    delegate: Box<dyn Cache>,
    interval: Duration,
    last_clear: Mutex<Instant>,
}

impl ScheduledCache {
    pub fn new(delegate: Box<dyn Cache>, interval: Duration) -> Self {
        Self {
            delegate,
            interval,
            last_clear: Mutex::new(Instant::now()),
        }
    }

    fn clear_when_stale(&self) -> CacheResult<()> {
        let mut last_clear = self.last_clear.lock().expect("scheduled cache lock");
        if last_clear.elapsed() >= self.interval {
            *last_clear = Instant::now();
            drop(last_clear);
            self.delegate.clear()?;
        }
        Ok(())
    }
}

impl Cache for ScheduledCache {
    fn id(&self) -> &str {
        self.delegate.id()
    }

    fn size(&self) -> usize {
        if self.clear_when_stale().is_err() {
            return 0;
        }
        self.delegate.size()
    }

    fn put(&self, key: CacheKey, value: Value) -> CacheResult<()> {
        self.clear_when_stale()?;
        self.delegate.put(key, value)
    }

    fn get(&self, key: &CacheKey) -> CacheResult<Option<Value>> {
        self.clear_when_stale()?;
        self.delegate.get(key)
    }

    fn remove(&self, key: &CacheKey) -> CacheResult<Option<Value>> {
        self.clear_when_stale()?;
        self.delegate.remove(key)
    }

    fn clear(&self) -> CacheResult<()> {
        *self.last_clear.lock().expect("scheduled cache lock") = Instant::now();
        self.delegate.clear()
    }
}

/// Round-trips entries through byte serialization so callers never share
/// instances with the cache.
pub struct SerializedCache {
    delegate: Box<dyn Cache>,
}

impl SerializedCache {
    pub fn new(delegate: Box<dyn Cache>) -> Self {
        Self { delegate }
    }

    fn serialization_error(&self, source: serde_json::Error) -> CacheError {
        CacheError::Serialization {
            id: self.delegate.id().to_string(),
            source,
        }
    }
}

impl Cache for SerializedCache {
    fn id(&self) -> &str {
        self.delegate.id()
    }

    fn size(&self) -> usize {
        self.delegate.size()
    }

    fn put(&self, key: CacheKey, value: Value) -> CacheResult<()> {
        let bytes = serde_json::to_vec(&value).map_err(|e| self.serialization_error(e))?;
        self.delegate.put(key, Value::Bytes(bytes))
    }

    fn get(&self, key: &CacheKey) -> CacheResult<Option<Value>> {
        match self.delegate.get(key)? {
            None => Ok(None),
            Some(Value::Bytes(bytes)) => {
                let value =
                    serde_json::from_slice(&bytes).map_err(|e| self.serialization_error(e))?;
                Ok(Some(value))
            }
            Some(_) => Err(CacheError::Decoration {
                id: self.delegate.id().to_string(),
                message: "serialized cache found a non-serialized entry".to_string(),
            }),
        }
    }

    fn remove(&self, key: &CacheKey) -> CacheResult<Option<Value>> {
        self.delegate.remove(key)
    }

    fn clear(&self) -> CacheResult<()> {
        self.delegate.clear()
    }
}

/// Soft references have no analog here, so this is a fixed-capacity LRU
/// holding the hot set the strong-reference queue would have pinned.
pub struct SoftCache {
    inner: LruCache,
}

impl SoftCache {
    pub fn new(delegate: Box<dyn Cache>, strong_capacity: usize) -> Self {
        Self {
            inner: LruCache::new(delegate, strong_capacity),
        }
    }
}

impl Cache for SoftCache {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn put(&self, key: CacheKey, value: Value) -> CacheResult<()> {
        self.inner.put(key, value)
    }

    fn get(&self, key: &CacheKey) -> CacheResult<Option<Value>> {
        self.inner.get(key)
    }

    fn remove(&self, key: &CacheKey) -> CacheResult<Option<Value>> {
        self.inner.remove(key)
    }

    fn clear(&self) -> CacheResult<()> {
        self.inner.clear()
    }
}

/// Weak references have no analog either; entries simply stay until
/// cleared. The mismatch is reported once, not silently papered over.
pub struct WeakCache {
    delegate: Box<dyn Cache>,
    warned: AtomicBool,
}

impl WeakCache {
    pub fn new(delegate: Box<dyn Cache>) -> Self {
        Self {
            delegate,
            warned: AtomicBool::new(false),
        }
    }

    fn warn_once(&self) {
        if !self.warned.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                cache = self.delegate.id(),
                "WEAK eviction behaves as PERPETUAL on this runtime; entries are only \
                 dropped by clear()"
            );
        }
    }
}

impl Cache for WeakCache {
    fn id(&self) -> &str {
        self.delegate.id()
    }

    fn size(&self) -> usize {
        self.delegate.size()
    }

    fn put(&self, key: CacheKey, value: Value) -> CacheResult<()> {
        self.warn_once();
        self.delegate.put(key, value)
    }

    fn get(&self, key: &CacheKey) -> CacheResult<Option<Value>> {
        self.delegate.get(key)
    }

    fn remove(&self, key: &CacheKey) -> CacheResult<Option<Value>> {
        self.delegate.remove(key)
    }

    fn clear(&self) -> CacheResult<()> {
        self.delegate.clear()
    }
}

struct Latch {
    holder: Mutex<Option<std::thread::ThreadId>>,
    released: Condvar,
}

/// Per-key single-flight: a `get` that misses holds the key's latch until
/// the matching `put` (or an explicit `remove`) releases it, so concurrent
/// loads of one key are serialized. The latch is reentrant for its holding
/// thread, since a session probes the same key again while its deferred
/// put is still pending; `put`/`remove` release it fully.
pub struct BlockingCache {
    delegate: Box<dyn Cache>,
    latches: Mutex<AHashMap<CacheKey, Arc<Latch>>>,
    timeout: Option<Duration>,
}

impl BlockingCache {
    pub fn new(delegate: Box<dyn Cache>, timeout: Option<Duration>) -> Self {
        Self {
            delegate,
            latches: Mutex::new(AHashMap::new()),
            timeout,
        }
    }

    fn acquire(&self, key: &CacheKey) -> CacheResult<()> {
        let latch = {
            let mut latches = self.latches.lock().expect("blocking cache latch map");
            latches
                .entry(key.clone())
                .or_insert_with(|| {
                    Arc::new(Latch {
                        holder: Mutex::new(None),
                        released: Condvar::new(),
                    })
                })
                .clone()
        };
        let current = std::thread::current().id();
        let mut holder = latch.holder.lock().expect("blocking cache latch");
        loop {
            match *holder {
                None => {
                    *holder = Some(current);
                    return Ok(());
                }
                Some(owner) if owner == current => return Ok(()),
                Some(_) => {
                    holder = match self.timeout {
                        Some(timeout) => {
                            let (guard, wait) = latch
                                .released
                                .wait_timeout(holder, timeout)
                                .expect("blocking cache latch");
                            if wait.timed_out() && guard.is_some() {
                                return Err(CacheError::LatchTimeout {
                                    id: self.delegate.id().to_string(),
                                });
                            }
                            guard
                        }
                        None => latch.released.wait(holder).expect("blocking cache latch"),
                    };
                }
            }
        }
    }

    fn release(&self, key: &CacheKey) {
        let latch = {
            let latches = self.latches.lock().expect("blocking cache latch map");
            latches.get(key).cloned()
        };
        if let Some(latch) = latch {
            let mut holder = latch.holder.lock().expect("blocking cache latch");
            *holder = None;
            latch.released.notify_all();
        }
    }
}

impl Cache for BlockingCache {
    fn id(&self) -> &str {
        self.delegate.id()
    }

    fn size(&self) -> usize {
        self.delegate.size()
    }

    fn put(&self, key: CacheKey, value: Value) -> CacheResult<()> {
        let result = self.delegate.put(key.clone(), value);
        self.release(&key);
        result
    }

    fn get(&self, key: &CacheKey) -> CacheResult<Option<Value>> {
        self.acquire(key)?;
        let value = self.delegate.get(key)?;
        if value.is_some() {
            self.release(key);
        }
        Ok(value)
    }

    /// Does not remove the entry; it only releases the latch so a failed
    /// load lets the next waiter through.
    fn remove(&self, key: &CacheKey) -> CacheResult<Option<Value>> {
        self.release(key);
        Ok(None)
    }

    fn clear(&self) -> CacheResult<()> {
        self.delegate.clear()
    }
}

/// Coarse lock across every operation, the visibility boundary the
/// executor relies on.
pub struct SynchronizedCache {
    delegate: Box<dyn Cache>,
    lock: Mutex<()>,
}

impl SynchronizedCache {
    pub fn new(delegate: Box<dyn Cache>) -> Self {
        Self {
            delegate,
            lock: Mutex::new(()),
        }
    }
}

impl Cache for SynchronizedCache {
    fn id(&self) -> &str {
        self.delegate.id()
    }

    fn size(&self) -> usize {
        let _guard = self.lock.lock().expect("synchronized cache lock");
        self.delegate.size()
    }

    fn put(&self, key: CacheKey, value: Value) -> CacheResult<()> {
        let _guard = self.lock.lock().expect("synchronized cache lock");
        self.delegate.put(key, value)
    }

    fn get(&self, key: &CacheKey) -> CacheResult<Option<Value>> {
        let _guard = self.lock.lock().expect("synchronized cache lock");
        self.delegate.get(key)
    }

    fn remove(&self, key: &CacheKey) -> CacheResult<Option<Value>> {
        let _guard = self.lock.lock().expect("synchronized cache lock");
        self.delegate.remove(key)
    }

    fn clear(&self) -> CacheResult<()> {
        let _guard = self.lock.lock().expect("synchronized cache lock");
        self.delegate.clear()
    }
}

/// Hit-ratio instrumentation.
pub struct LoggingCache {
    delegate: Box<dyn Cache>,
    requests: AtomicU64,
    hits: AtomicU64,
}

impl LoggingCache {
    pub fn new(delegate: Box<dyn Cache>) -> Self {
        Self {
            delegate,
            requests: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        }
    }

    pub fn hit_ratio(&self) -> f64 {
        let requests = self.requests.load(Ordering::Relaxed);
        if requests == 0 {
            0.0
        } else {
            self.hits.load(Ordering::Relaxed) as f64 / requests as f64
        }
    }
}

impl Cache for LoggingCache {
    fn id(&self) -> &str {
        self.delegate.id()
    }

    fn size(&self) -> usize {
        self.delegate.size()
    }

    fn put(&self, key: CacheKey, value: Value) -> CacheResult<()> {
        self.delegate.put(key, value)
    }

    fn get(&self, key: &CacheKey) -> CacheResult<Option<Value>> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let value = self.delegate.get(key)?;
        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        tracing::debug!(
            cache = self.delegate.id(),
            hit = value.is_some(),
            ratio = self.hit_ratio(),
            "cache lookup"
        );
        Ok(value)
    }

    fn remove(&self, key: &CacheKey) -> CacheResult<Option<Value>> {
        self.delegate.remove(key)
    }

    fn clear(&self) -> CacheResult<()> {
        self.delegate.clear()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::cache::PerpetualCache;

    fn key(n: i64) -> CacheKey {
        let mut key = CacheKey::new();
        key.update(Value::Int(n));
        key
    }

    fn perpetual() -> Box<dyn Cache> {
        Box::new(PerpetualCache::new("test"))
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        let cache = LruCache::new(perpetual(), 2);
        cache.put(key(1), Value::Str("A".into())).unwrap();
        cache.put(key(2), Value::Str("B".into())).unwrap();
        cache.get(&key(1)).unwrap();
        cache.put(key(3), Value::Str("C".into())).unwrap();

        assert!(cache.get(&key(1)).unwrap().is_some());
        assert!(cache.get(&key(2)).unwrap().is_none());
        assert!(cache.get(&key(3)).unwrap().is_some());
    }

    #[test]
    fn lru_overflow_drops_untouched_first_insert() {
        let cache = LruCache::new(perpetual(), 3);
        for n in 1..=4 {
            cache.put(key(n), Value::Int(n)).unwrap();
        }
        assert!(cache.get(&key(1)).unwrap().is_none());
        for n in 2..=4 {
            assert!(cache.get(&key(n)).unwrap().is_some());
        }
    }

    #[test]
    fn fifo_evicts_first_insert_regardless_of_access() {
        let cache = FifoCache::new(perpetual(), 2);
        cache.put(key(1), Value::Str("A".into())).unwrap();
        cache.put(key(2), Value::Str("B".into())).unwrap();
        cache.get(&key(1)).unwrap();
        cache.put(key(3), Value::Str("C".into())).unwrap();

        assert!(cache.get(&key(1)).unwrap().is_none());
        assert!(cache.get(&key(2)).unwrap().is_some());
    }

    #[test]
    fn serialized_cache_decouples_instances() {
        let cache = SerializedCache::new(perpetual());
        let stored = Value::List(vec![Value::Int(1), Value::Str("x".into())]);
        cache.put(key(1), stored.clone()).unwrap();
        let first = cache.get(&key(1)).unwrap().unwrap();
        let second = cache.get(&key(1)).unwrap().unwrap();
        assert_eq!(first, stored);
        assert_eq!(second, stored);
    }

    #[test]
    fn scheduled_cache_clears_after_interval() {
        let cache = ScheduledCache::new(perpetual(), Duration::from_millis(10));
        cache.put(key(1), Value::Int(1)).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(cache.get(&key(1)).unwrap().is_none());
    }

    #[test]
    fn blocking_cache_serializes_loads_of_one_key() {
        let cache = Arc::new(BlockingCache::new(perpetual(), None));
        // first miss holds the latch
        assert!(cache.get(&key(1)).unwrap().is_none());

        let contender = {
            let cache = cache.clone();
            thread::spawn(move || cache.get(&key(1)).unwrap())
        };
        // the contender blocks until this put releases the latch
        thread::sleep(Duration::from_millis(20));
        cache.put(key(1), Value::Int(42)).unwrap();
        assert_eq!(contender.join().unwrap(), Some(Value::Int(42)));
    }

    #[test]
    fn blocking_cache_remove_releases_without_deleting() {
        let cache = BlockingCache::new(perpetual(), None);
        cache.put(key(1), Value::Int(1)).unwrap();
        assert!(cache.get(&key(1)).unwrap().is_some());
        assert_eq!(cache.remove(&key(1)).unwrap(), None);
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn logging_cache_tracks_hit_ratio() {
        let cache = LoggingCache::new(perpetual());
        cache.put(key(1), Value::Int(1)).unwrap();
        cache.get(&key(1)).unwrap();
        cache.get(&key(2)).unwrap();
        assert_eq!(cache.hit_ratio(), 0.5);
    }
}
