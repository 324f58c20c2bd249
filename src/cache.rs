//! Namespaced in-memory TTL cache with single-flight loading.
//!
//! Entries live in one of five domains, each with its own default TTL and
//! counters. Expired entries are evicted lazily on read, opportunistically
//! every [`SWEEP_EVERY_SETS`] writes to a domain, and periodically by
//! [`CacheManager::spawn_sweeper`].

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::error::{Error, Result};

/// Writes to a single domain between opportunistic sweeps.
pub const SWEEP_EVERY_SETS: u32 = 100;

type Shared = Arc<dyn Any + Send + Sync>;
type FlightKey = (CacheDomain, String);
type Waiter = oneshot::Sender<Result<Shared>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheDomain {
    Price,
    Market,
    Analytics,
    Profile,
    Config,
}

impl CacheDomain {
    pub const ALL: [CacheDomain; 5] = [
        CacheDomain::Price,
        CacheDomain::Market,
        CacheDomain::Analytics,
        CacheDomain::Profile,
        CacheDomain::Config,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CacheDomain::Price => "price_data",
            CacheDomain::Market => "market_data",
            CacheDomain::Analytics => "analytics_data",
            CacheDomain::Profile => "profile_data",
            CacheDomain::Config => "config_data",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

struct CacheEntry {
    value: Shared,
    expires_at: Instant,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    hits: u64,
    misses: u64,
    sets: u64,
    deletes: u64,
    evictions: u64,
}

struct DomainCache {
    default_ttl: Duration,
    entries: HashMap<String, CacheEntry>,
    counters: Counters,
    sets_since_sweep: u32,
}

impl DomainCache {
    fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            entries: HashMap::new(),
            counters: Counters::default(),
            sets_since_sweep: 0,
        }
    }

    fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let removed = before - self.entries.len();
        self.counters.evictions += removed as u64;
        self.sets_since_sweep = 0;
        removed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainStats {
    pub total_items: usize,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    /// Percentage, rounded to two decimals.
    pub hit_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub domains: BTreeMap<&'static str, DomainStats>,
    pub total_items: usize,
    pub in_flight: usize,
}

pub struct CacheManager {
    domains: Vec<Mutex<DomainCache>>,
    inflight: Mutex<HashMap<FlightKey, Vec<Waiter>>>,
    max_key_len: usize,
}

impl CacheManager {
    pub fn new(config: &CacheConfig) -> Self {
        let domains = CacheDomain::ALL
            .iter()
            .map(|domain| {
                let ttl = match domain {
                    CacheDomain::Price => config.price_ttl,
                    CacheDomain::Market => config.market_ttl,
                    CacheDomain::Analytics => config.analytics_ttl,
                    CacheDomain::Profile => config.profile_ttl,
                    CacheDomain::Config => config.config_ttl,
                };
                Mutex::new(DomainCache::new(ttl))
            })
            .collect();

        Self {
            domains,
            inflight: Mutex::new(HashMap::new()),
            max_key_len: config.max_key_len,
        }
    }

    pub fn default_ttl(&self, domain: CacheDomain) -> Duration {
        self.domains[domain.index()].lock().default_ttl
    }

    /// Keys longer than the configured limit are replaced by a digest.
    fn storage_key(&self, key: &str) -> String {
        if key.len() > self.max_key_len {
            format!("sha256:{}", hex::encode(Sha256::digest(key.as_bytes())))
        } else {
            key.to_string()
        }
    }

    pub fn get<T>(&self, domain: CacheDomain, key: &str) -> Option<T>
    where
        T: Any + Send + Sync + Clone,
    {
        self.lookup(domain, &self.storage_key(key), true)
    }

    fn lookup<T>(&self, domain: CacheDomain, key: &str, count_miss: bool) -> Option<T>
    where
        T: Any + Send + Sync + Clone,
    {
        let now = Instant::now();
        let mut guard = self.domains[domain.index()].lock();
        let cache = &mut *guard;

        let expired = match cache.entries.get(key) {
            Some(entry) if entry.expires_at > now => {
                if let Some(value) = entry.value.downcast_ref::<T>() {
                    let value = value.clone();
                    cache.counters.hits += 1;
                    return Some(value);
                }
                false
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            cache.entries.remove(key);
            cache.counters.evictions += 1;
        }
        if count_miss {
            cache.counters.misses += 1;
        }
        None
    }

    /// Store `value`, with `ttl` overriding the domain default.
    pub fn set<T>(&self, domain: CacheDomain, key: &str, value: T, ttl: Option<Duration>)
    where
        T: Any + Send + Sync,
    {
        let key = self.storage_key(key);
        self.insert(domain, key, Arc::new(value), ttl);
    }

    fn insert(&self, domain: CacheDomain, key: String, value: Shared, ttl: Option<Duration>) {
        let now = Instant::now();
        let mut cache = self.domains[domain.index()].lock();
        let ttl = ttl.unwrap_or(cache.default_ttl);
        cache.entries.insert(key, CacheEntry { value, expires_at: now + ttl });
        cache.counters.sets += 1;
        cache.sets_since_sweep += 1;

        if cache.sets_since_sweep >= SWEEP_EVERY_SETS {
            let removed = cache.sweep(now);
            if removed > 0 {
                debug!(domain = domain.name(), removed, "cache sweep on write");
            }
        }
    }

    pub fn delete(&self, domain: CacheDomain, key: &str) -> bool {
        let key = self.storage_key(key);
        let mut cache = self.domains[domain.index()].lock();
        let removed = cache.entries.remove(&key).is_some();
        if removed {
            cache.counters.deletes += 1;
        }
        removed
    }

    pub fn clear(&self, domain: CacheDomain) {
        let mut cache = self.domains[domain.index()].lock();
        let removed = cache.entries.len();
        cache.entries.clear();
        cache.counters.deletes += removed as u64;
    }

    /// Return the cached value, or run `fetch` once for every concurrent
    /// caller of the same key. A failure reaches all callers waiting on that
    /// flight and is not cached.
    pub async fn get_or_fetch<T, F, Fut>(
        &self,
        domain: CacheDomain,
        key: &str,
        ttl: Option<Duration>,
        fetch: F,
    ) -> Result<T>
    where
        T: Any + Send + Sync + Clone,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let key = self.storage_key(key);
        if let Some(value) = self.lookup::<T>(domain, &key, true) {
            return Ok(value);
        }

        let flight = (domain, key.clone());
        let waiter = {
            let mut inflight = self.inflight.lock();
            // A leader may have finished between the miss above and taking the lock.
            if let Some(value) = self.lookup::<T>(domain, &key, false) {
                return Ok(value);
            }
            match inflight.get_mut(&flight) {
                Some(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                None => {
                    inflight.insert(flight.clone(), Vec::new());
                    None
                }
            }
        };

        if let Some(rx) = waiter {
            return match rx.await {
                Ok(Ok(shared)) => shared
                    .downcast_ref::<T>()
                    .cloned()
                    .ok_or_else(|| Error::FlightAbandoned(format!("{}:{key} (type mismatch)", domain.name()))),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(Error::FlightAbandoned(format!("{}:{key}", domain.name()))),
            };
        }

        let mut guard = FlightGuard { manager: self, flight: Some(flight) };
        let result = fetch().await;

        let shared: Result<Shared> = match &result {
            Ok(value) => {
                let shared: Shared = Arc::new(value.clone());
                self.insert(domain, key, shared.clone(), ttl);
                Ok(shared)
            }
            Err(err) => Err(err.clone()),
        };

        for tx in guard.finish() {
            let _ = tx.send(shared.clone());
        }
        result
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Evict every expired entry in every domain.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        CacheDomain::ALL
            .iter()
            .map(|domain| self.domains[domain.index()].lock().sweep(now))
            .sum()
    }

    pub fn stats(&self) -> CacheStats {
        let mut domains = BTreeMap::new();
        let mut total_items = 0;
        for domain in CacheDomain::ALL {
            let cache = self.domains[domain.index()].lock();
            let c = cache.counters;
            let lookups = c.hits + c.misses;
            let hit_rate = if lookups == 0 {
                0.0
            } else {
                (c.hits as f64 / lookups as f64 * 10_000.0).round() / 100.0
            };
            total_items += cache.entries.len();
            domains.insert(
                domain.name(),
                DomainStats {
                    total_items: cache.entries.len(),
                    hits: c.hits,
                    misses: c.misses,
                    sets: c.sets,
                    deletes: c.deletes,
                    evictions: c.evictions,
                    hit_rate,
                },
            );
        }
        CacheStats { domains, total_items, in_flight: self.in_flight() }
    }

    /// Periodic sweep. The task ends once the manager is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                let removed = manager.sweep();
                if removed > 0 {
                    debug!(removed, "periodic cache sweep");
                }
            }
        })
    }
}

/// Removes the in-flight marker even if the leading future is dropped, so
/// waiters observe `FlightAbandoned` instead of hanging.
struct FlightGuard<'a> {
    manager: &'a CacheManager,
    flight: Option<FlightKey>,
}

impl FlightGuard<'_> {
    fn finish(&mut self) -> Vec<Waiter> {
        match self.flight.take() {
            Some(flight) => self.manager.inflight.lock().remove(&flight).unwrap_or_default(),
            None => Vec::new(),
        }
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if let Some(flight) = self.flight.take() {
            let waiters = self.manager.inflight.lock().remove(&flight).unwrap_or_default();
            if !waiters.is_empty() {
                warn!(domain = flight.0.name(), key = %flight.1, waiters = waiters.len(), "in-flight fetch abandoned");
            }
        }
    }
}

/// Deterministic cache key: a prefix, positional parts, then named parts
/// sorted by name. `\`, `:` and `=` inside parts are backslash-escaped so
/// distinct part lists never render to the same key.
#[derive(Debug, Clone, Default)]
pub struct CacheKey {
    prefix: String,
    args: Vec<String>,
    named: BTreeMap<String, String>,
}

impl CacheKey {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into(), ..Default::default() }
    }

    pub fn arg(mut self, arg: impl Display) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn named(mut self, name: impl Into<String>, value: impl Display) -> Self {
        self.named.insert(name.into(), value.to_string());
        self
    }

    pub fn build(&self) -> String {
        let mut key = String::new();
        push_escaped(&mut key, &self.prefix);
        for arg in &self.args {
            key.push(':');
            push_escaped(&mut key, arg);
        }
        for (name, value) in &self.named {
            key.push(':');
            push_escaped(&mut key, name);
            key.push('=');
            push_escaped(&mut key, value);
        }
        key
    }
}

fn push_escaped(key: &mut String, part: &str) {
    for c in part.chars() {
        if matches!(c, '\\' | ':' | '=') {
            key.push('\\');
        }
        key.push(c);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_args_are_order_independent() {
        let a = CacheKey::new("ohlcv").arg("BTC/USDT").named("tf", "5m").named("limit", 20).build();
        let b = CacheKey::new("ohlcv").arg("BTC/USDT").named("limit", 20).named("tf", "5m").build();
        assert_eq!(a, b);
        assert_eq!(a, "ohlcv:BTC/USDT:limit=20:tf=5m");
    }

    #[test]
    fn test_separators_inside_parts_are_escaped() {
        let joined = CacheKey::new("ticker").arg("a:b").build();
        let split = CacheKey::new("ticker").arg("a").arg("b").build();
        assert_ne!(joined, split);
        assert_eq!(joined, r"ticker:a\:b");

        let named = CacheKey::new("k").named("tf", "5m:limit=20").build();
        let two = CacheKey::new("k").named("tf", "5m").named("limit", 20).build();
        assert_ne!(named, two);
        assert_ne!(CacheKey::new("k").arg(r"a\").arg("b").build(), CacheKey::new("k").arg(r"a\:b").build());
    }

    #[test]
    fn test_long_keys_are_digested() {
        let cache = CacheManager::new(&CacheConfig { max_key_len: 16, ..Default::default() });
        let key = cache.storage_key("a-key-that-is-clearly-longer-than-sixteen");
        assert!(key.starts_with("sha256:"));
        assert_eq!(key.len(), "sha256:".len() + 64);
        assert_eq!(cache.storage_key("short"), "short");
    }
}
