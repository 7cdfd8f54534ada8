//! A synchronous, thread-safe connection pool. All list state lives under
//! one mutex with a condvar standing in for the monitor; hand-outs are
//! proxy connections whose `close` returns the real connection to the
//! pool instead of closing it.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use squill_core::driver::{
    Connection, Driver, DriverResult, IsolationLevel, Statement, StatementSpec,
};
use squill_core::errors::{ConfigError, DataStoreError, PoolError, Result};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_active: usize,
    pub max_idle: usize,
    pub max_checkout_time: Duration,
    pub wait_time: Duration,
    pub max_bad_tolerance: u32,
    pub ping_enabled: bool,
    pub ping_query: String,
    pub ping_if_idle_for: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_active: 10,
            max_idle: 5,
            max_checkout_time: Duration::from_secs(20),
            wait_time: Duration::from_secs(20),
            max_bad_tolerance: 3,
            ping_enabled: false,
            ping_query: "NO PING QUERY SET".to_string(),
            ping_if_idle_for: Duration::ZERO,
        }
    }
}

impl PoolConfig {
    /// Reads the `pool*` keys of a `<dataSource>` property set.
    pub fn from_properties(
        properties: &AHashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
            value.parse().map_err(|_| ConfigError::InvalidValue {
                what: format!("pool property '{key}'"),
                value: value.to_string(),
            })
        }

        let mut config = PoolConfig::default();
        for (key, value) in properties {
            match key.as_str() {
                "poolMaximumActiveConnections" => config.max_active = parse(key, value)?,
                "poolMaximumIdleConnections" => config.max_idle = parse(key, value)?,
                "poolMaximumCheckoutTime" => {
                    config.max_checkout_time = Duration::from_millis(parse(key, value)?)
                }
                "poolTimeToWait" => config.wait_time = Duration::from_millis(parse(key, value)?),
                "poolMaximumLocalBadConnectionTolerance" => {
                    config.max_bad_tolerance = parse(key, value)?
                }
                "poolPingEnabled" => config.ping_enabled = parse(key, value)?,
                "poolPingQuery" => config.ping_query = value.clone(),
                "poolPingConnectionsNotUsedFor" => {
                    config.ping_if_idle_for = Duration::from_millis(parse(key, value)?)
                }
                _ => {}
            }
        }
        Ok(config)
    }
}

/// Counters exposed for monitoring and tests.
#[derive(Debug, Clone, Default)]
pub struct PoolStatistics {
    pub request_count: u64,
    pub accumulated_request_time: Duration,
    pub accumulated_checkout_time: Duration,
    pub claimed_overdue_connection_count: u64,
    pub accumulated_checkout_time_of_overdue: Duration,
    pub bad_connection_count: u64,
    pub had_to_wait_count: u64,
    pub accumulated_wait_time: Duration,
}

/// Bookkeeping around one real connection. Cloning shares identity: the
/// wrapper in the active list and the wrapper inside a guard point at the
/// same validity flag and the same real connection.
#[derive(Clone)]
struct PoolEntry {
    real: Arc<Mutex<Box<dyn Connection>>>,
    valid: Arc<AtomicBool>,
    type_code: u64,
    created_at: Instant,
    last_used_at: Instant,
    checked_out_at: Instant,
}

impl PoolEntry {
    fn new(real: Box<dyn Connection>, type_code: u64) -> Self {
        let now = Instant::now();
        Self {
            real: Arc::new(Mutex::new(real)),
            valid: Arc::new(AtomicBool::new(true)),
            type_code,
            created_at: now,
            last_used_at: now,
            checked_out_at: now,
        }
    }

    /// A fresh wrapper around the same real connection; the old wrapper
    /// should be invalidated by the caller.
    fn rewrap(&self, type_code: u64) -> Self {
        let now = Instant::now();
        Self {
            real: self.real.clone(),
            valid: Arc::new(AtomicBool::new(true)),
            type_code,
            created_at: self.created_at,
            last_used_at: now,
            checked_out_at: now,
        }
    }

    fn is_marked_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }

    fn rollback_if_pending(&self) {
        let mut real = self.real.lock().expect("pooled connection lock");
        if !real.auto_commit() {
            if let Err(error) = real.rollback() {
                tracing::debug!(%error, "rollback on pool transition failed");
            }
        }
    }

    fn close_real(&self) {
        let mut real = self.real.lock().expect("pooled connection lock");
        if let Err(error) = real.close() {
            tracing::debug!(%error, "closing real connection failed");
        }
    }
}

#[derive(Default)]
struct PoolState {
    idle: Vec<PoolEntry>,
    active: Vec<PoolEntry>,
    stats: PoolStatistics,
}

struct PoolShared {
    driver: Arc<dyn Driver>,
    url: String,
    properties: AHashMap<String, String>,
    config: PoolConfig,
    expected_type_code: u64,
    state: Mutex<PoolState>,
    available: Condvar,
}

/// The pooling data source.
pub struct PooledDataSource {
    shared: Arc<PoolShared>,
}

impl PooledDataSource {
    pub fn new(
        driver: Arc<dyn Driver>,
        url: impl Into<String>,
        properties: AHashMap<String, String>,
        mut config: PoolConfig,
    ) -> Self {
        config.max_active = config.max_active.max(1);
        let url = url.into();
        let expected_type_code = type_code(
            &url,
            properties.get("username").map_or("", String::as_str),
            properties.get("password").map_or("", String::as_str),
        );
        Self {
            shared: Arc::new(PoolShared {
                driver,
                url,
                properties,
                config,
                expected_type_code,
                state: Mutex::new(PoolState::default()),
                available: Condvar::new(),
            }),
        }
    }

    pub fn expected_type_code(&self) -> u64 {
        self.shared.expected_type_code
    }

    pub fn statistics(&self) -> PoolStatistics {
        self.shared.state.lock().expect("pool state lock").stats.clone()
    }

    pub fn idle_count(&self) -> usize {
        self.shared.state.lock().expect("pool state lock").idle.len()
    }

    pub fn active_count(&self) -> usize {
        self.shared.state.lock().expect("pool state lock").active.len()
    }

    /// Invalidates and closes every pooled connection, idle and active.
    pub fn force_close_all(&self) {
        let entries: Vec<PoolEntry> = {
            let mut state = self.shared.state.lock().expect("pool state lock");
            let mut entries: Vec<PoolEntry> = state.idle.drain(..).collect();
            entries.extend(state.active.drain(..));
            entries
        };
        for entry in entries {
            entry.invalidate();
            entry.rollback_if_pending();
            entry.close_real();
        }
        self.shared.available.notify_all();
    }

    pub fn checkout(&self) -> Result<PoolGuard> {
        let shared = &self.shared;
        let started = Instant::now();
        let mut local_bad: u32 = 0;
        let mut state = shared.state.lock().expect("pool state lock");
        loop {
            let candidate = if let Some(entry) = state.idle.pop() {
                tracing::debug!("checked out connection from idle list");
                Some(entry)
            } else if state.active.len() < shared.config.max_active {
                let real = shared
                    .driver
                    .connect(&shared.url, &shared.properties)
                    .map_err(PoolError::DataStore)?;
                tracing::debug!("created new pooled connection");
                Some(PoolEntry::new(real, shared.expected_type_code))
            } else {
                let oldest_elapsed = state.active[0].checked_out_at.elapsed();
                if oldest_elapsed > shared.config.max_checkout_time {
                    let overdue = state.active.remove(0);
                    state.stats.claimed_overdue_connection_count += 1;
                    state.stats.accumulated_checkout_time_of_overdue += oldest_elapsed;
                    state.stats.accumulated_checkout_time += oldest_elapsed;
                    overdue.rollback_if_pending();
                    let replacement = overdue.rewrap(overdue.type_code);
                    overdue.invalidate();
                    tracing::warn!("claimed overdue connection from holder");
                    Some(replacement)
                } else {
                    state.stats.had_to_wait_count += 1;
                    let wait_started = Instant::now();
                    tracing::debug!("waiting for pooled connection");
                    let (guard, _) = shared
                        .available
                        .wait_timeout(state, shared.config.wait_time)
                        .expect("pool state lock");
                    state = guard;
                    state.stats.accumulated_wait_time += wait_started.elapsed();
                    None
                }
            };

            let Some(entry) = candidate else { continue };

            if self.is_usable(&entry) {
                entry.rollback_if_pending();
                let now = Instant::now();
                let mut entry = entry;
                entry.type_code = shared.expected_type_code;
                entry.checked_out_at = now;
                entry.last_used_at = now;
                state.active.push(entry.clone());
                state.stats.request_count += 1;
                state.stats.accumulated_request_time += started.elapsed();
                return Ok(PoolGuard {
                    shared: shared.clone(),
                    entry,
                    returned: false,
                });
            }

            tracing::debug!("discarded bad connection during checkout");
            state.stats.bad_connection_count += 1;
            local_bad += 1;
            entry.invalidate();
            let tolerance = shared.config.max_idle as u32 + shared.config.max_bad_tolerance;
            if local_bad > tolerance {
                return Err(PoolError::BadConnectionLimit {
                    bad: local_bad,
                    tolerance,
                }
                .into());
            }
        }
    }

    /// Liveness: the wrapper must still be marked valid, the real
    /// connection open, and, when pinging applies, the ping query must
    /// succeed. A failed ping closes the real connection.
    fn is_usable(&self, entry: &PoolEntry) -> bool {
        if !entry.is_marked_valid() {
            return false;
        }
        let mut real = entry.real.lock().expect("pooled connection lock");
        if real.is_closed() {
            return false;
        }
        let config = &self.shared.config;
        if config.ping_enabled && entry.last_used_at.elapsed() >= config.ping_if_idle_for {
            let ping = real
                .prepare(&StatementSpec::new(config.ping_query.clone()))
                .and_then(|mut stmt| stmt.execute_query());
            if let Err(error) = ping {
                tracing::warn!(%error, "connection failed ping, closing");
                let _ = real.close();
                return false;
            }
        }
        true
    }
}

/// Re-admits a wrapper to the pool. Valid wrappers with room and a
/// matching type code are re-wrapped onto the idle list; everything else
/// closes the real connection.
fn push_connection(shared: &Arc<PoolShared>, entry: &PoolEntry) {
    let mut state: MutexGuard<'_, PoolState> = shared.state.lock().expect("pool state lock");
    if let Some(position) = state
        .active
        .iter()
        .position(|active| Arc::ptr_eq(&active.valid, &entry.valid))
    {
        state.active.remove(position);
    }

    if entry.is_marked_valid() {
        state.stats.accumulated_checkout_time += entry.checked_out_at.elapsed();
        if state.idle.len() < shared.config.max_idle
            && entry.type_code == shared.expected_type_code
        {
            entry.rollback_if_pending();
            let recycled = entry.rewrap(entry.type_code);
            state.idle.push(recycled);
            entry.invalidate();
            tracing::debug!("returned connection to idle list");
            shared.available.notify_all();
        } else {
            entry.rollback_if_pending();
            entry.close_real();
            entry.invalidate();
            tracing::debug!("closed surplus returned connection");
        }
    } else {
        tracing::debug!("an invalidated connection attempted to return to the pool");
        state.stats.bad_connection_count += 1;
    }
}

impl crate::datasource::DataSource for PooledDataSource {
    fn connection(&self) -> Result<Box<dyn Connection>> {
        Ok(Box::new(self.checkout()?))
    }

    fn force_close_all(&self) {
        PooledDataSource::force_close_all(self);
    }
}

/// The proxy handed to callers. Transparent for statement work; `close`
/// (and drop) return the connection to the pool.
pub struct PoolGuard {
    shared: Arc<PoolShared>,
    entry: PoolEntry,
    returned: bool,
}

impl std::fmt::Debug for PoolGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGuard").field("returned", &self.returned).finish_non_exhaustive()
    }
}

impl PoolGuard {
    fn check(&self) -> DriverResult<()> {
        if self.returned || !self.entry.is_marked_valid() {
            Err(DataStoreError::Invalid)
        } else {
            Ok(())
        }
    }

    fn real(&self) -> MutexGuard<'_, Box<dyn Connection>> {
        self.entry.real.lock().expect("pooled connection lock")
    }
}

impl Connection for PoolGuard {
    fn prepare(&mut self, spec: &StatementSpec) -> DriverResult<Box<dyn Statement>> {
        self.check()?;
        self.real().prepare(spec)
    }

    fn commit(&mut self) -> DriverResult<()> {
        self.check()?;
        self.real().commit()
    }

    fn rollback(&mut self) -> DriverResult<()> {
        self.check()?;
        self.real().rollback()
    }

    fn set_auto_commit(&mut self, auto_commit: bool) -> DriverResult<()> {
        self.check()?;
        self.real().set_auto_commit(auto_commit)
    }

    fn auto_commit(&self) -> bool {
        if self.check().is_err() {
            return true;
        }
        self.real().auto_commit()
    }

    fn set_isolation(&mut self, level: IsolationLevel) -> DriverResult<()> {
        self.check()?;
        self.real().set_isolation(level)
    }

    fn close(&mut self) -> DriverResult<()> {
        if !self.returned {
            self.returned = true;
            push_connection(&self.shared, &self.entry);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.returned || !self.entry.is_marked_valid()
    }

    fn product_name(&self) -> String {
        if self.check().is_err() {
            return String::new();
        }
        self.real().product_name()
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if !self.returned {
            self.returned = true;
            push_connection(&self.shared, &self.entry);
        }
    }
}

fn type_code(url: &str, username: &str, password: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    url.hash(&mut hasher);
    username.hash(&mut hasher);
    password.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use std::thread;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::MemoryDriver;

    fn pool_with(config: PoolConfig) -> (PooledDataSource, Arc<MemoryDriver>) {
        let driver = Arc::new(MemoryDriver::new());
        let pool = PooledDataSource::new(
            driver.clone(),
            "mem://test",
            AHashMap::from_iter([("username".to_string(), "u".to_string())]),
            config,
        );
        (pool, driver)
    }

    #[test]
    fn reuses_idle_connections() {
        let (pool, driver) = pool_with(PoolConfig::default());
        {
            let mut guard = pool.checkout().unwrap();
            guard.close().unwrap();
        }
        {
            let mut guard = pool.checkout().unwrap();
            guard.close().unwrap();
        }
        assert_eq!(driver.connect_count(), 1);
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.statistics().request_count, 2);
    }

    #[test]
    fn respects_capacity_bounds() {
        let config = PoolConfig {
            max_active: 3,
            max_idle: 2,
            ..PoolConfig::default()
        };
        let (pool, _driver) = pool_with(config);
        let guards: Vec<_> = (0..3).map(|_| pool.checkout().unwrap()).collect();
        assert_eq!(pool.active_count(), 3);
        drop(guards);
        assert!(pool.idle_count() <= 2);
        assert_eq!(pool.active_count(), 0);
        assert!(pool.idle_count() + pool.active_count() <= 5);
    }

    #[test]
    fn every_idle_entry_has_the_expected_type_code() {
        let (pool, _driver) = pool_with(PoolConfig::default());
        let guard = pool.checkout().unwrap();
        drop(guard);
        let state = pool.shared.state.lock().unwrap();
        for entry in &state.idle {
            assert_eq!(entry.type_code, pool.shared.expected_type_code);
        }
    }

    #[test]
    fn overdue_connections_are_reclaimed() {
        let config = PoolConfig {
            max_active: 1,
            max_checkout_time: Duration::from_millis(10),
            wait_time: Duration::from_millis(50),
            ..PoolConfig::default()
        };
        let (pool, _driver) = pool_with(config);

        let mut held = pool.checkout().unwrap();
        thread::sleep(Duration::from_millis(30));

        // the holder is overdue, so this checkout claims its connection
        let reclaimed = pool.checkout().unwrap();
        assert_eq!(pool.statistics().claimed_overdue_connection_count, 1);
        assert_eq!(pool.active_count(), 1);

        // the original wrapper was invalidated; closing it must not
        // corrupt the pool
        assert!(held.is_closed());
        held.close().unwrap();
        assert_eq!(pool.active_count(), 1);
        assert_eq!(pool.idle_count(), 0);

        drop(reclaimed);
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn waiters_wake_when_a_connection_returns() {
        let config = PoolConfig {
            max_active: 1,
            max_checkout_time: Duration::from_secs(60),
            wait_time: Duration::from_secs(5),
            ..PoolConfig::default()
        };
        let (pool, _driver) = pool_with(config);
        let pool = Arc::new(pool);

        let guard = pool.checkout().unwrap();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let guard = pool.checkout().unwrap();
                drop(guard);
                started.elapsed()
            })
        };
        thread::sleep(Duration::from_millis(30));
        drop(guard);
        let waited = waiter.join().unwrap();
        assert!(waited < Duration::from_secs(5));
        assert!(pool.statistics().had_to_wait_count >= 1);
    }

    #[test]
    fn failed_ping_discards_the_connection() {
        let config = PoolConfig {
            ping_enabled: true,
            ping_query: "SELECT 1".to_string(),
            ping_if_idle_for: Duration::ZERO,
            ..PoolConfig::default()
        };
        let (pool, driver) = pool_with(config);
        {
            let _guard = pool.checkout().unwrap();
        }
        assert_eq!(pool.idle_count(), 1);

        driver.fail_next_pings(1);
        // the idle connection fails its ping and a replacement is opened
        let _guard = pool.checkout().unwrap();
        assert!(pool.statistics().bad_connection_count >= 1);
        assert_eq!(driver.connect_count(), 2);
    }

    #[test]
    fn bad_connection_tolerance_is_bounded() {
        let config = PoolConfig {
            max_idle: 0,
            max_bad_tolerance: 1,
            ping_enabled: true,
            ping_query: "SELECT 1".to_string(),
            ping_if_idle_for: Duration::ZERO,
            ..PoolConfig::default()
        };
        let (pool, driver) = pool_with(config);
        driver.fail_pings(true);
        let err = pool.checkout().unwrap_err();
        assert!(err.to_string().contains("bad connections"));
    }

    #[test]
    fn force_close_all_empties_both_lists() {
        let (pool, _driver) = pool_with(PoolConfig::default());
        let guard = pool.checkout().unwrap();
        {
            let mut second = pool.checkout().unwrap();
            second.close().unwrap();
        }
        pool.force_close_all();
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.active_count(), 0);
        drop(guard);
    }
}
