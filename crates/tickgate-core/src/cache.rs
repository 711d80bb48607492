//! In-memory caching for governed responses.
//!
//! Expiry is checked lazily: an entry past its deadline is dropped by the
//! lookup that finds it. There is no background sweeper; callers that want to
//! reclaim memory eagerly can call [`TtlCache::purge_expired`].

use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::config::{duration_secs, duration_secs_map};
use crate::error::CoreError;

/// Defines the behavior of the cache for a governed call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Read from the cache if a non-expired entry is present;
    /// otherwise fetch upstream and write the response to the cache. (Default)
    #[default]
    Use,
    /// Always fetch upstream, bypassing any cached entry,
    /// and write the new response to the cache.
    Refresh,
    /// Always fetch upstream and neither read from nor write to the cache.
    Bypass,
}

impl CacheMode {
    pub const fn reads(self) -> bool {
        matches!(self, Self::Use)
    }

    pub const fn writes(self) -> bool {
        matches!(self, Self::Use | Self::Refresh)
    }
}

/// Time-to-live table: a default plus per-operation overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(with = "duration_secs")]
    pub default_ttl: Duration,
    #[serde(with = "duration_secs_map")]
    pub ttls: BTreeMap<String, Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let ttls = [
            ("spot", 30),
            ("minute", 300),
            ("intraday", 300),
            ("news", 1_800),
            ("hist", 3_600),
            ("info", 3_600),
            ("index", 3_600),
        ]
        .into_iter()
        .map(|(operation, seconds)| (operation.to_owned(), Duration::from_secs(seconds)))
        .collect();

        Self {
            default_ttl: Duration::from_secs(300),
            ttls,
        }
    }
}

impl CacheConfig {
    pub fn ttl_for(&self, operation: &str) -> Duration {
        self.ttls.get(operation).copied().unwrap_or(self.default_ttl)
    }

    pub fn with_ttl(mut self, operation: impl Into<String>, ttl: Duration) -> Self {
        self.ttls.insert(operation.into(), ttl);
        self
    }
}

/// Content-addressed cache key.
///
/// Built from a namespace prefix, positional arguments and keyword arguments.
/// Keyword arguments are sorted by name before hashing, so two call sites that
/// pass the same keywords in a different order produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn builder(prefix: impl Into<String>) -> CacheKeyBuilder {
        CacheKeyBuilder {
            prefix: prefix.into(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        }
    }

    /// Uses `key` verbatim, without hashing.
    pub fn raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct CacheKeyBuilder {
    prefix: String,
    args: Vec<serde_json::Value>,
    kwargs: BTreeMap<String, serde_json::Value>,
}

impl CacheKeyBuilder {
    pub fn arg<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self, CoreError> {
        self.args.push(serde_json::to_value(value)?);
        Ok(self)
    }

    pub fn kwarg<T: Serialize + ?Sized>(
        mut self,
        name: impl Into<String>,
        value: &T,
    ) -> Result<Self, CoreError> {
        self.kwargs.insert(name.into(), serde_json::to_value(value)?);
        Ok(self)
    }

    /// SHA-256 over the JSON encoding of `(prefix, args, kwargs)`, hex encoded.
    pub fn build(self) -> Result<CacheKey, CoreError> {
        let encoded = serde_json::to_vec(&(&self.prefix, &self.args, &self.kwargs))?;
        let digest = Sha256::digest(&encoded);
        Ok(CacheKey(hex::encode(digest)))
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    /// `None` when `now + ttl` is past what `Instant` can represent.
    expires_at: Option<Instant>,
}

impl<V> CacheEntry<V> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |expires_at| now < expires_at)
    }
}

/// Thread-safe TTL cache.
///
/// `get`, `set` and `clear` are each atomic, but there is no get-or-compute:
/// two callers that miss at the same time will both fetch and the later
/// `set` wins.
pub struct TtlCache<V> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    clock: Arc<dyn Clock>,
}

impl<V: Clone> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> TtlCache<V> {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Returns the value if present and unexpired. An expired entry is removed.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.lock();
        let now = self.clock.now();

        match entries.get(key) {
            None => return None,
            Some(entry) if entry.is_live(now) => {
                debug!(key = short_key(key), "cache hit");
                return Some(entry.value.clone());
            }
            Some(_) => {}
        }

        entries.remove(key);
        debug!(key = short_key(key), "cache entry expired");
        None
    }

    /// Stores `value` until `now + ttl`, replacing any previous entry and its
    /// expiry. A zero `ttl` could never be read back, so it stores nothing.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        let mut entries = self.lock();
        if ttl.is_zero() {
            entries.remove(&key);
            return;
        }

        let expires_at = self.clock.now().checked_add(ttl);
        debug!(key = short_key(&key), ttl_ms = ttl.as_millis().min(u128::from(u64::MAX)) as u64, "cache write");
        entries.insert(key, CacheEntry { value, expires_at });
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.lock().remove(key).map(|entry| entry.value)
    }

    pub fn clear(&self) {
        self.lock().clear();
        info!("cache cleared");
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.lock();
        let now = self.clock.now();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    /// Number of stored entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<V> std::fmt::Debug for TtlCache<V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let len = self
            .entries
            .lock()
            .map(|entries| entries.len())
            .unwrap_or_default();
        f.debug_struct("TtlCache").field("len", &len).finish_non_exhaustive()
    }
}

fn short_key(key: &str) -> &str {
    key.get(..16).unwrap_or(key)
}
