//! OpenFunnel TTL/LRU Cache
//!
//! Process-local key/value store with per-entry TTL, LRU eviction at
//! capacity, and hit/miss/eviction statistics. Shared leaf dependency of
//! the credential validator and the in-memory rate limiter.
//!
//! Expiry is enforced on access; the periodic sweep only reclaims memory
//! earlier and is not required for correctness.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Snapshot of cache statistics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub hit_rate: f64,
    pub evictions: u64,
}

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
    access_count: u64,
    last_access: Instant,
}

/// Generic TTL/LRU cache
///
/// All operations complete without blocking on I/O; absence is a normal
/// state, never an error.
pub struct TtlCache<K, V> {
    entries: DashMap<K, CacheEntry<V>>,
    max_entries: usize,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    // Serializes the evict-then-insert path so the store never exceeds
    // max_entries under concurrent set() calls.
    insert_lock: parking_lot::Mutex<()>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache bounded at `max_entries` with a default TTL
    pub fn new(max_entries: usize, default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            insert_lock: parking_lot::Mutex::new(()),
        }
    }

    /// Build from the shared cache configuration
    pub fn from_config(cfg: &funnel_common::CacheConfig) -> Self {
        Self::new(cfg.max_entries, Duration::from_secs(cfg.default_ttl_secs))
    }

    /// Look up a key, bumping its access stats
    ///
    /// An expired entry is removed on the spot and counts as a miss.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();

        if let Some(mut entry) = self.entries.get_mut(key) {
            if entry.expires_at <= now {
                drop(entry);
                // Re-check under the removal: a concurrent set() may have
                // refreshed the key since the guard was dropped.
                self.entries
                    .remove_if(key, |_, entry| entry.expires_at <= now);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            entry.access_count += 1;
            entry.last_access = now;
            let value = entry.value.clone();
            drop(entry);
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert or replace a value with the default TTL
    pub fn set(&self, key: K, value: V) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    /// Insert or replace a value with an explicit TTL
    ///
    /// Inserting a new key into a full store evicts the single
    /// least-recently-accessed entry first.
    pub fn set_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let now = Instant::now();
        let entry = CacheEntry {
            value,
            expires_at: now + ttl,
            access_count: 0,
            last_access: now,
        };

        let _guard = self.insert_lock.lock();
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            self.evict_lru();
        }
        self.entries.insert(key, entry);
    }

    /// Remove a key, reporting whether it was present
    pub fn delete(&self, key: &K) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Whether a live (unexpired) entry exists; does not touch access stats
    pub fn has(&self, key: &K) -> bool {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => true,
            Some(entry) => {
                drop(entry);
                self.entries
                    .remove_if(key, |_, entry| entry.expires_at <= now);
                false
            }
            None => false,
        }
    }

    /// Current entry count (may include not-yet-swept expired entries)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry; statistics are preserved
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Statistics snapshot
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            size: self.entries.len(),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Remove expired entries, snapshot-then-delete so foreground calls
    /// never wait behind a full scan. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|e| e.expires_at <= now)
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0;
        for key in expired {
            // Re-check under the removal so a concurrent set() refreshing
            // the entry is not clobbered.
            if self
                .entries
                .remove_if(&key, |_, entry| entry.expires_at <= now)
                .is_some()
            {
                removed += 1;
            }
        }
        removed
    }

    fn evict_lru(&self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|e| e.last_access)
            .map(|e| e.key().clone());

        if let Some(key) = victim {
            if self.entries.remove(&key).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Handle to the periodic expiry sweep; aborts the task when stopped
/// or dropped.
pub struct CacheSweeper {
    handle: JoinHandle<()>,
}

impl CacheSweeper {
    /// Start a sweep over `cache` every `interval`
    pub fn start<K, V>(cache: Arc<TtlCache<K, V>>, interval: Duration) -> Self
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; skip it so a fresh cache is
            // not swept at startup.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = cache.purge_expired();
                if removed > 0 {
                    tracing::debug!(removed, "cache sweep reclaimed expired entries");
                }
            }
        });
        Self { handle }
    }

    /// Stop the sweep
    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for CacheSweeper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
