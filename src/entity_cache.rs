//! Per-channel entity cache: a bounded, timestamped cache of record bytes
//! keyed by oid, with size-and-age eviction (design §4.4).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::oid::Oid;

struct CacheEntry {
    bytes: Vec<u8>,
    last_access: Instant,
}

impl CacheEntry {
    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

struct CacheState {
    entries: HashMap<Oid, CacheEntry>,
    current_size: u64,
    total_allocations: u64,
    total_evictions: u64,
    last_sweep_start: Option<Instant>,
    last_sweep_end: Option<Instant>,
}

/// Point-in-time counters (design §4.4, "observable counters").
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub total_allocations: u64,
    pub total_evictions: u64,
    pub entry_count: usize,
    pub current_size: u64,
}

impl CacheStats {
    /// `1 − evictions/allocations`, `1.0` when nothing has been allocated yet.
    pub fn approximate_hit_ratio(&self) -> f64 {
        if self.total_allocations == 0 {
            1.0
        } else {
            1.0 - (self.total_evictions as f64 / self.total_allocations as f64)
        }
    }
}

pub struct EntityCache {
    threshold: u64,
    timeout: Duration,
    soft_ratio: f64,
    state: Mutex<CacheState>,
}

impl EntityCache {
    pub fn new(threshold: u64, timeout: Duration, soft_ratio: f64) -> Self {
        EntityCache {
            threshold,
            timeout,
            soft_ratio,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                current_size: 0,
                total_allocations: 0,
                total_evictions: 0,
                last_sweep_start: None,
                last_sweep_end: None,
            }),
        }
    }

    fn target_size(&self) -> u64 {
        ((self.threshold as f64) * self.soft_ratio) as u64
    }

    /// Read-path and write-path admission (design §4.4: "every successful
    /// read populates the cache... every successful write populates the
    /// cache"). Admission is unconditional; eviction is reactive and runs
    /// inline right after, only when `currentSize > threshold`.
    pub fn admit(&self, oid: Oid, bytes: Vec<u8>) {
        let mut state = self.state.lock().expect("entity cache lock poisoned");
        let now = Instant::now();
        if let Some(prior) = state.entries.insert(oid, CacheEntry { bytes, last_access: now }) {
            state.current_size -= prior.size();
        }
        let new_size = state.entries.get(&oid).map(|e| e.size()).unwrap_or(0);
        state.current_size += new_size;
        state.total_allocations += 1;

        if state.current_size > self.threshold {
            self.evict_locked(&mut state, now);
        }
    }

    /// A cache hit updates `lastAccess` and returns a clone of the cached
    /// bytes; a miss leaves the cache untouched so the caller can reload
    /// from the data file and `admit()` the result.
    pub fn get(&self, oid: Oid) -> Option<Vec<u8>> {
        let mut state = self.state.lock().expect("entity cache lock poisoned");
        let now = Instant::now();
        if let Some(entry) = state.entries.get_mut(&oid) {
            entry.last_access = now;
            Some(entry.bytes.clone())
        } else {
            None
        }
    }

    /// Removes a single entry without touching the entity index (design
    /// §4.4: "evicting a cache entry must not remove its index entry").
    /// Used when a GC sweep determines an oid is unreachable: the cache
    /// entry is now meaningless, but the removal here is purely a cache
    /// operation, independent of the index delete that accompanies it.
    pub fn remove(&self, oid: Oid) {
        let mut state = self.state.lock().expect("entity cache lock poisoned");
        if let Some(entry) = state.entries.remove(&oid) {
            state.current_size -= entry.size();
        }
    }

    /// The periodic sweep (design §4.8 phase 1): evicts every entry older
    /// than `timeout` regardless of current size, then — if still over the
    /// soft-ratio target — evicts the least-recently-used entries until it
    /// is reached.
    pub fn sweep(&self) {
        let mut state = self.state.lock().expect("entity cache lock poisoned");
        let now = Instant::now();
        state.last_sweep_start = Some(now);
        self.evict_expired_locked(&mut state, now);
        if state.current_size > self.target_size() {
            self.evict_lru_locked(&mut state);
        }
        state.last_sweep_end = Some(Instant::now());
    }

    /// The reactive path's eviction: expired entries first, then LRU if
    /// still over the soft-ratio target.
    fn evict_locked(&self, state: &mut CacheState, now: Instant) {
        self.evict_expired_locked(state, now);
        if state.current_size > self.target_size() {
            self.evict_lru_locked(state);
        }
    }

    fn evict_expired_locked(&self, state: &mut CacheState, now: Instant) {
        let expired: Vec<Oid> = state
            .entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_access) > self.timeout)
            .map(|(&oid, _)| oid)
            .collect();
        for oid in expired {
            if let Some(entry) = state.entries.remove(&oid) {
                state.current_size -= entry.size();
                state.total_evictions += 1;
            }
        }
    }

    fn evict_lru_locked(&self, state: &mut CacheState) {
        let target = self.target_size();
        let mut by_age: Vec<(Oid, Instant)> =
            state.entries.iter().map(|(&oid, entry)| (oid, entry.last_access)).collect();
        by_age.sort_by_key(|(_, last_access)| *last_access);
        for (oid, _) in by_age {
            if state.current_size <= target {
                break;
            }
            if let Some(entry) = state.entries.remove(&oid) {
                state.current_size -= entry.size();
                state.total_evictions += 1;
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock().expect("entity cache lock poisoned");
        CacheStats {
            total_allocations: state.total_allocations,
            total_evictions: state.total_evictions,
            entry_count: state.entries.len(),
            current_size: state.current_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn admit_then_get_hits() {
        let cache = EntityCache::new(1024, Duration::from_secs(60), 0.8);
        cache.admit(1, b"hello".to_vec());
        assert_eq!(cache.get(1), Some(b"hello".to_vec()));
        assert_eq!(cache.stats().entry_count, 1);
    }

    #[test]
    fn get_miss_returns_none() {
        let cache = EntityCache::new(1024, Duration::from_secs(60), 0.8);
        assert_eq!(cache.get(42), None);
    }

    #[test]
    fn eviction_never_removes_from_outside_the_cache() {
        // Not an index test (entity_index has its own suite) — just
        // confirms the cache's own state is self-consistent after eviction:
        // removed entries are gone from both entries map and current_size.
        let cache = EntityCache::new(10, Duration::from_millis(10), 0.8);
        cache.admit(1, vec![0u8; 8]);
        sleep(Duration::from_millis(30));
        cache.admit(2, vec![0u8; 8]); // triggers reactive eviction of #1 (expired)
        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_some());
    }

    #[test]
    fn sweep_evicts_expired_then_lru_to_soft_ratio() {
        let cache = EntityCache::new(100, Duration::from_millis(20), 0.8);
        cache.admit(1, vec![0u8; 30]); // will expire
        sleep(Duration::from_millis(30));
        cache.admit(2, vec![0u8; 30]); // fresh
        cache.admit(3, vec![0u8; 30]); // fresh

        cache.sweep();
        let stats = cache.stats();
        // #1 should be expired-evicted; 2 and 3 total 60 bytes, under the
        // soft-ratio target of 80, so both survive.
        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_some());
        assert!(cache.get(3).is_some());
        assert!(stats.current_size <= 80);
        assert!(stats.entry_count > 0);
    }

    #[test]
    fn sweep_falls_back_to_lru_when_nothing_is_expired() {
        let cache = EntityCache::new(20, Duration::from_secs(600), 0.5); // target = 10
        cache.admit(1, vec![0u8; 10]);
        sleep(Duration::from_millis(5));
        cache.admit(2, vec![0u8; 10]);
        sleep(Duration::from_millis(5));
        cache.admit(3, vec![0u8; 10]); // reactive eviction already ran here

        cache.sweep();
        let stats = cache.stats();
        assert!(stats.current_size <= 10);
        // The oldest (#1) should be the one gone, not the newest.
        assert!(cache.get(3).is_some());
    }

    #[test]
    fn hit_ratio_reflects_allocations_and_evictions() {
        let cache = EntityCache::new(1024, Duration::from_secs(60), 0.8);
        cache.admit(1, b"a".to_vec());
        cache.admit(2, b"b".to_vec());
        let stats = cache.stats();
        assert_eq!(stats.approximate_hit_ratio(), 1.0); // no evictions yet
    }

    #[test]
    fn remove_does_not_affect_other_entries() {
        let cache = EntityCache::new(1024, Duration::from_secs(60), 0.8);
        cache.admit(1, b"a".to_vec());
        cache.admit(2, b"b".to_vec());
        cache.remove(1);
        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_some());
    }
}
