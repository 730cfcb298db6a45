// =============================================================================
// TTL Cache — per-key expiring memoization of remote reads
// =============================================================================
//
// A pure TTL cache: no value-size limit, no LRU. Expiry is enforced at read
// time (an expired read removes the entry and misses); `sweep` additionally
// evicts anything older than a housekeeping horizon regardless of the TTL a
// reader would have asked for.
//
// Thread safety: the whole map sits behind one parking_lot::Mutex. Callers
// hold the lock only for map access, never across I/O.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// One cached value plus its write instant.
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    written_at: Instant,
    /// Rough serialized footprint, maintained for `stats`.
    approx_size: usize,
}

/// Counters reported by [`TtlCache::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entry_count: usize,
    pub approximate_size: usize,
}

/// Per-key expiring cache. `V` must be `Clone` because `get` hands back an
/// owned copy while the map stays shared.
pub struct TtlCache<V: Clone> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch `key` if it was written less than `ttl` ago.
    ///
    /// A read past the TTL evicts the entry and returns `None`; expiry never
    /// waits for `sweep`.
    pub fn get(&self, key: &str, ttl: Duration) -> Option<V> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.written_at.elapsed() < ttl => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store `value` under `key`, overwriting any prior entry regardless of
    /// its remaining TTL.
    pub fn set(&self, key: &str, value: V) {
        let approx_size = std::mem::size_of::<V>();
        self.entries.lock().insert(
            key.to_string(),
            CacheEntry {
                value,
                written_at: Instant::now(),
                approx_size,
            },
        );
    }

    /// Remove a single key.
    pub fn invalidate(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Housekeeping eviction: remove entries older than `horizon`,
    /// independent of the per-read TTL checks.
    pub fn sweep(&self, horizon: Duration) {
        self.entries
            .lock()
            .retain(|_, entry| entry.written_at.elapsed() <= horizon);
    }

    /// Keys currently present (expired-but-unswept entries included).
    pub fn keys(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock();
        CacheStats {
            entry_count: entries.len(),
            approximate_size: entries.values().map(|e| e.approx_size).sum(),
        }
    }
}

impl<V: Clone> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}
