//! Ephemeral key/value primitives backing the dedupe lock and rate counters.
//!
//! Both operations are atomic per key. [`RedisFastStore`] shares state across service
//! instances; [`LocalFastStore`] keeps it in process; [`FailoverFastStore`] prefers the
//! former and degrades to the latter on any backend error.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{Client, Script};
use tracing::warn;

use crate::error::FastStoreError;

/// Result of a bounded increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterState {
    /// Counter value after the call; never exceeds the limit.
    pub count: u32,
    pub allowed: bool,
    /// Time until the window resets.
    pub reset_after: Duration,
}

pub trait FastStore: Send + Sync {
    /// Atomically create `key` with `ttl` unless it already exists. Returns `true` when
    /// the key was created by this call.
    fn set_if_absent(
        &self,
        key: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, FastStoreError>> + Send;

    /// Atomically increment the counter at `key` unless it already reached `limit`. The
    /// first increment in a window starts the `window` expiry.
    fn increment_bounded(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> impl Future<Output = Result<CounterState, FastStoreError>> + Send;
}

#[derive(Debug, Clone, Copy)]
struct LocalEntry {
    value: u32,
    expires_at: Instant,
}

impl LocalEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Map size at which inserts first sweep expired entries.
const DEFAULT_SWEEP_THRESHOLD: usize = 4_096;

#[derive(Debug)]
struct LocalState {
    entries: HashMap<String, LocalEntry>,
    next_sweep_at: usize,
}

/// In-process fast store. State is lost on restart and not shared across instances.
///
/// Expired entries are swept on insert once the map reaches the sweep threshold; the
/// threshold then tracks twice the live size so sweeps stay amortized.
#[derive(Debug)]
pub struct LocalFastStore {
    state: Mutex<LocalState>,
    sweep_threshold: usize,
}

impl Default for LocalFastStore {
    fn default() -> Self {
        Self::with_sweep_threshold(DEFAULT_SWEEP_THRESHOLD)
    }
}

impl LocalFastStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_sweep_threshold(sweep_threshold: usize) -> Self {
        let sweep_threshold = sweep_threshold.max(1);
        Self {
            state: Mutex::new(LocalState { entries: HashMap::new(), next_sweep_at: sweep_threshold }),
            sweep_threshold,
        }
    }

    /// Current live counter value at `key`, if any.
    #[must_use]
    pub fn counter(&self, key: &str) -> Option<u32> {
        let now = Instant::now();
        self.state.lock().entries.get(key).filter(|entry| entry.is_live(now)).map(|entry| entry.value)
    }

    /// Number of stored entries, expired ones included until the next sweep.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Drop expired entries now.
    pub fn purge_expired(&self) {
        let mut state = self.state.lock();
        self.sweep(&mut state, Instant::now());
    }

    fn sweep(&self, state: &mut LocalState, now: Instant) {
        state.entries.retain(|_, entry| entry.is_live(now));
        state.next_sweep_at = self.sweep_threshold.max(state.entries.len().saturating_mul(2));
    }

    fn insert(&self, state: &mut LocalState, key: &str, entry: LocalEntry, now: Instant) {
        if state.entries.len() >= state.next_sweep_at {
            self.sweep(state, now);
        }
        state.entries.insert(key.to_string(), entry);
    }

    fn set_if_absent_now(&self, key: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.entries.get(key).is_some_and(|entry| entry.is_live(now)) {
            return false;
        }
        self.insert(&mut state, key, LocalEntry { value: 1, expires_at: now + ttl }, now);
        true
    }

    fn increment_bounded_now(&self, key: &str, limit: u32, window: Duration) -> CounterState {
        let now = Instant::now();
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(key).filter(|entry| entry.is_live(now)) {
            let reset_after = entry.expires_at.saturating_duration_since(now);
            if entry.value >= limit {
                return CounterState { count: entry.value, allowed: false, reset_after };
            }
            entry.value += 1;
            return CounterState { count: entry.value, allowed: true, reset_after };
        }

        if limit == 0 {
            return CounterState { count: 0, allowed: false, reset_after: window };
        }
        self.insert(&mut state, key, LocalEntry { value: 1, expires_at: now + window }, now);
        CounterState { count: 1, allowed: true, reset_after: window }
    }
}

impl FastStore for LocalFastStore {
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, FastStoreError> {
        Ok(self.set_if_absent_now(key, ttl))
    }

    async fn increment_bounded(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<CounterState, FastStoreError> {
        Ok(self.increment_bounded_now(key, limit, window))
    }
}

// Returns {count, allowed, pttl}. Never increments past ARGV[1].
const BOUNDED_INCREMENT_LUA: &str = r"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local limit = tonumber(ARGV[1])
if current >= limit then
  return {current, 0, redis.call('PTTL', KEYS[1])}
end
local next_value = redis.call('INCR', KEYS[1])
if next_value == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return {next_value, 1, redis.call('PTTL', KEYS[1])}
";

/// Redis-backed fast store shared by every service instance.
#[derive(Clone)]
pub struct RedisFastStore {
    manager: ConnectionManager,
    increment_script: Script,
}

impl RedisFastStore {
    /// Connect with a short connection timeout and a single retry.
    ///
    /// # Errors
    /// Returns [`FastStoreError::Connection`] when the URL is invalid or the server is
    /// unreachable.
    pub async fn connect(redis_url: &str) -> Result<Self, FastStoreError> {
        let config = ConnectionManagerConfig::new()
            .set_number_of_retries(1)
            .set_connection_timeout(Duration::from_millis(100));

        let client =
            Client::open(redis_url).map_err(|err| FastStoreError::Connection(err.to_string()))?;
        let manager = client
            .get_connection_manager_with_config(config)
            .await
            .map_err(|err| FastStoreError::Connection(err.to_string()))?;

        Ok(Self { manager, increment_script: Script::new(BOUNDED_INCREMENT_LUA) })
    }
}

impl FastStore for RedisFastStore {
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, FastStoreError> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(duration_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn increment_bounded(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<CounterState, FastStoreError> {
        let mut conn = self.manager.clone();
        let (count, allowed, pttl): (i64, i64, i64) = self
            .increment_script
            .key(key)
            .arg(limit)
            .arg(duration_millis(window))
            .invoke_async(&mut conn)
            .await?;

        let reset_after = u64::try_from(pttl).map_or(window, Duration::from_millis);
        Ok(CounterState {
            count: u32::try_from(count).unwrap_or(limit),
            allowed: allowed == 1,
            reset_after,
        })
    }
}

/// Prefers the shared backend and falls back to an in-process store on any error.
pub struct FailoverFastStore {
    primary: Option<RedisFastStore>,
    fallback: LocalFastStore,
}

impl FailoverFastStore {
    #[must_use]
    pub fn new(primary: Option<RedisFastStore>) -> Self {
        Self { primary, fallback: LocalFastStore::new() }
    }

    #[must_use]
    pub fn local_only() -> Self {
        Self::new(None)
    }

    /// Connect to Redis when a URL is given; a failed connection degrades to local state.
    pub async fn connect(redis_url: Option<&str>) -> Self {
        let Some(redis_url) = redis_url else {
            return Self::local_only();
        };
        match RedisFastStore::connect(redis_url).await {
            Ok(primary) => Self::new(Some(primary)),
            Err(err) => {
                warn!(error = %err, "redis unavailable at startup; using in-process fast store");
                Self::local_only()
            }
        }
    }

    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.primary.is_some()
    }

    #[must_use]
    pub fn local(&self) -> &LocalFastStore {
        &self.fallback
    }
}

impl FastStore for FailoverFastStore {
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, FastStoreError> {
        if let Some(primary) = &self.primary {
            match primary.set_if_absent(key, ttl).await {
                Ok(acquired) => return Ok(acquired),
                Err(err) => warn!(key, error = %err, "fast store lock failed; using in-process lock"),
            }
        }
        self.fallback.set_if_absent(key, ttl).await
    }

    async fn increment_bounded(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<CounterState, FastStoreError> {
        if let Some(primary) = &self.primary {
            match primary.increment_bounded(key, limit, window).await {
                Ok(state) => return Ok(state),
                Err(err) => {
                    warn!(key, error = %err, "fast store counter failed; using in-process counter");
                }
            }
        }
        self.fallback.increment_bounded(key, limit, window).await
    }
}

fn duration_millis(value: Duration) -> u64 {
    u64::try_from(value.as_millis()).unwrap_or(u64::MAX).max(1)
}
