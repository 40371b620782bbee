//! Bounded descriptor cache
//!
//! Backends performing DS I/O open one descriptor per file and would
//! exhaust the process's descriptor table under concurrent load without
//! reuse. This cache maps a backend file identifier to a lazily-opened
//! descriptor, bounds the resident population, and ages entries out only
//! after a minimum dwell time — correctness favors bounded staleness over
//! strict capacity, so an over-capacity entry younger than the dwell time
//! survives.
//!
//! Callers drain `pop_expired` after every few acquisitions; eviction
//! never happens behind a holder's back.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Cache sizing.
#[derive(Debug, Clone, Copy)]
pub struct HandleCacheConfig {
    /// Resident entries beyond which expiry becomes possible.
    pub capacity: usize,
    /// Minimum time an entry stays resident after its last use.
    pub min_dwell: Duration,
}

impl Default for HandleCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            min_dwell: Duration::from_secs(30),
        }
    }
}

/// One cached descriptor slot.
///
/// Created on first use with no descriptor attached; the caller that
/// finds `descriptor()` empty opens one and attaches it for every later
/// holder to reuse.
pub struct CacheEntry<K, D> {
    key: K,
    descriptor: Mutex<Option<D>>,
    last_used: Mutex<Instant>,
    in_use: AtomicU32,
}

impl<K: Clone, D: Clone> CacheEntry<K, D> {
    /// The backend file identifier this entry caches.
    pub fn key(&self) -> K {
        self.key.clone()
    }

    /// The attached descriptor, if one has been opened.
    pub fn descriptor(&self) -> Option<D> {
        self.descriptor.lock().clone()
    }

    /// Attaches an opened descriptor for reuse.
    pub fn attach(&self, descriptor: D) {
        *self.descriptor.lock() = Some(descriptor);
    }

    /// True once a descriptor is attached.
    pub fn has_descriptor(&self) -> bool {
        self.descriptor.lock().is_some()
    }

    /// Number of current holders.
    pub fn holders(&self) -> u32 {
        self.in_use.load(Ordering::SeqCst)
    }
}

/// Bounded map of file identifier → descriptor entry.
pub struct HandleCache<K, D> {
    config: HandleCacheConfig,
    entries: Mutex<HashMap<K, Arc<CacheEntry<K, D>>>>,
}

impl<K, D> HandleCache<K, D>
where
    K: Eq + Hash + Clone,
    D: Clone,
{
    /// An empty cache.
    pub fn new(config: HandleCacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the existing entry for a file identifier or creates a
    /// fresh one with no descriptor. The returned entry counts as held
    /// until `release`d or `erase`d.
    pub fn acquire(&self, key: K) -> Arc<CacheEntry<K, D>> {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(CacheEntry {
                    key,
                    descriptor: Mutex::new(None),
                    last_used: Mutex::new(Instant::now()),
                    in_use: AtomicU32::new(0),
                })
            })
            .clone();
        entry.in_use.fetch_add(1, Ordering::SeqCst);
        *entry.last_used.lock() = Instant::now();
        entry
    }

    /// Returns an entry to the cache for reuse. The descriptor stays
    /// open and attached.
    pub fn release(&self, entry: &Arc<CacheEntry<K, D>>) {
        let prev = entry.in_use.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "cache entry released more than acquired");
        *entry.last_used.lock() = Instant::now();
    }

    /// Removes an entry immediately, dwell time notwithstanding. Used
    /// when the holder failed to establish a usable descriptor and the
    /// entry must not be reused.
    pub fn erase(&self, entry: &Arc<CacheEntry<K, D>>) {
        entry.in_use.fetch_sub(1, Ordering::SeqCst);
        self.entries.lock().remove(&entry.key);
    }

    /// Removes and returns one entry that is over capacity pressure, has
    /// no holders, and has aged past the minimum dwell time. Returns
    /// `None` when nothing qualifies.
    pub fn pop_expired(&self) -> Option<Arc<CacheEntry<K, D>>> {
        let mut entries = self.entries.lock();
        if entries.len() <= self.config.capacity {
            return None;
        }
        let now = Instant::now();
        let victim_key = entries
            .values()
            .filter(|e| e.in_use.load(Ordering::SeqCst) == 0)
            .filter(|e| now.duration_since(*e.last_used.lock()) >= self.config.min_dwell)
            .min_by_key(|e| *e.last_used.lock())
            .map(|e| e.key.clone())?;
        entries.remove(&victim_key)
    }

    /// Resident entry count.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when no entries are resident.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
