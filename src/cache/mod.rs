//! Keyed connection cache with eviction-triggered cleanup
//!
//! The cache bounds how many expensive resources (network sessions) stay
//! alive at once. Every entry that leaves the cache, whether through capacity
//! pressure, idle expiry, replacement or explicit invalidation, is handed to
//! the registered eviction callback exactly once. The cache itself performs
//! no I/O; closing sessions is the callback's job.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Default maximum number of live entries per cache
pub const DEFAULT_CAPACITY: usize = 32;

/// Cache configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of live entries
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Entries unused for longer than this are evicted (e.g. "2m", "30m")
    #[serde(default)]
    #[serde(with = "humantime_serde")]
    pub idle_ttl: Option<Duration>,
    /// How often the background sweeper purges idle entries
    #[serde(default)]
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Option<Duration>,
}

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            idle_ttl: None,
            sweep_interval: None,
        }
    }
}

impl CacheConfig {
    /// Bounded cache with an idle TTL swept at `sweep_interval`
    pub fn with_idle_ttl(capacity: usize, idle_ttl: Duration, sweep_interval: Duration) -> Self {
        Self {
            capacity,
            idle_ttl: Some(idle_ttl),
            sweep_interval: Some(sweep_interval),
        }
    }
}

/// Cleanup function invoked with every entry removed from the cache
pub type EvictionCallback<K, V> = Arc<dyn Fn(&K, V) + Send + Sync>;

struct CacheEntry<V> {
    value: V,
    last_access: Instant,
    /// Monotonic access counter; orders entries for LRU without clock ties
    tick: u64,
}

struct CacheState<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    tick: u64,
}

impl<K, V> CacheState<K, V> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

/// Size-bounded, thread-safe key to resource cache
pub struct ConnectionCache<K, V> {
    state: Mutex<CacheState<K, V>>,
    capacity: usize,
    idle_ttl: Option<Duration>,
    on_evict: RwLock<Option<EvictionCallback<K, V>>>,
}

impl<K, V> ConnectionCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a cache; a capacity of zero is treated as one slot
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                tick: 0,
            }),
            capacity: config.capacity.max(1),
            idle_ttl: config.idle_ttl,
            on_evict: RwLock::new(None),
        }
    }

    /// Register the cleanup function, replacing any previous one
    pub fn on_evict<F>(&self, callback: F)
    where
        F: Fn(&K, V) + Send + Sync + 'static,
    {
        *self.on_evict.write() = Some(Arc::new(callback));
    }

    /// Look up an entry by exact key equality
    ///
    /// A hit refreshes the entry's last access. An entry idle past the TTL is
    /// evicted and reported as absent.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut evicted = Vec::new();
        let found = {
            let mut state = self.state.lock();
            let tick = state.next_tick();
            let expired = match state.entries.get_mut(key) {
                None => return None,
                Some(entry) => {
                    if self.is_expired(entry) {
                        true
                    } else {
                        entry.last_access = Instant::now();
                        entry.tick = tick;
                        false
                    }
                }
            };
            if expired {
                if let Some((k, entry)) = state.entries.remove_entry(key) {
                    evicted.push((k, entry.value));
                }
                None
            } else {
                state.entries.get(key).map(|entry| entry.value.clone())
            }
        };
        self.fire(evicted);
        found
    }

    /// Insert or replace an entry
    ///
    /// A replaced value is handed to the eviction callback. When the cache is
    /// full the least recently used entry is evicted first.
    pub fn set(&self, key: K, value: V) {
        let mut evicted = Vec::new();
        {
            let mut state = self.state.lock();
            if let Some((k, old)) = state.entries.remove_entry(&key) {
                evicted.push((k, old.value));
            }
            while state.entries.len() >= self.capacity {
                let lru = state
                    .entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.tick)
                    .map(|(k, _)| k.clone());
                match lru.and_then(|k| state.entries.remove_entry(&k)) {
                    Some((k, entry)) => evicted.push((k, entry.value)),
                    None => break,
                }
            }
            let tick = state.next_tick();
            state.entries.insert(
                key,
                CacheEntry {
                    value,
                    last_access: Instant::now(),
                    tick,
                },
            );
        }
        if !evicted.is_empty() {
            trace!("cache set displaced {} entries", evicted.len());
        }
        self.fire(evicted);
    }

    /// Remove an entry explicitly; returns whether it was present
    pub fn invalidate(&self, key: &K) -> bool {
        let removed = self.state.lock().entries.remove_entry(key);
        match removed {
            Some((k, entry)) => {
                self.fire(vec![(k, entry.value)]);
                true
            }
            None => false,
        }
    }

    /// Evict every entry idle longer than the TTL; returns how many
    pub fn purge_expired(&self) -> usize {
        if self.idle_ttl.is_none() {
            return 0;
        }
        let evicted: Vec<(K, V)> = {
            let mut state = self.state.lock();
            let expired: Vec<K> = state
                .entries
                .iter()
                .filter(|(_, entry)| self.is_expired(entry))
                .map(|(k, _)| k.clone())
                .collect();
            expired
                .into_iter()
                .filter_map(|k| state.entries.remove_entry(&k))
                .map(|(k, entry)| (k, entry.value))
                .collect()
        };
        let count = evicted.len();
        self.fire(evicted);
        count
    }

    /// Evict every entry
    pub fn clear(&self) -> usize {
        let evicted: Vec<(K, V)> = self
            .state
            .lock()
            .entries
            .drain()
            .map(|(k, entry)| (k, entry.value))
            .collect();
        let count = evicted.len();
        self.fire(evicted);
        count
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn is_expired(&self, entry: &CacheEntry<V>) -> bool {
        self.idle_ttl
            .map(|ttl| entry.last_access.elapsed() > ttl)
            .unwrap_or(false)
    }

    /// Run the eviction callback outside the state lock
    fn fire(&self, evicted: Vec<(K, V)>) {
        if evicted.is_empty() {
            return;
        }
        let callback = self.on_evict.read().clone();
        for (key, value) in evicted {
            match &callback {
                Some(cb) => cb(&key, value),
                None => drop(value),
            }
        }
    }
}

impl<K, V> ConnectionCache<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Spawn a background task purging idle entries every `interval`
    ///
    /// The task holds only a weak reference and stops once the cache is
    /// dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let purged = cache.purge_expired();
                if purged > 0 {
                    debug!("cache sweeper evicted {} idle entries", purged);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recording_cache(capacity: usize) -> (ConnectionCache<String, u32>, Arc<Mutex<Vec<String>>>) {
        let cache = ConnectionCache::new(&CacheConfig {
            capacity,
            ..Default::default()
        });
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let log = evicted.clone();
        cache.on_evict(move |key: &String, _value| log.lock().push(key.clone()));
        (cache, evicted)
    }

    #[test]
    fn test_get_returns_inserted_value() {
        let (cache, evicted) = recording_cache(4);
        cache.set("a".to_string(), 1);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        assert_eq!(cache.get(&"b".to_string()), None);
        assert!(evicted.lock().is_empty());
    }

    #[test]
    fn test_capacity_evicts_exactly_one() {
        let (cache, evicted) = recording_cache(3);
        for (i, key) in ["a", "b", "c", "d"].iter().enumerate() {
            cache.set(key.to_string(), i as u32);
        }
        assert_eq!(cache.len(), 3);
        assert_eq!(*evicted.lock(), vec!["a".to_string()]);
        assert_eq!(cache.get(&"a".to_string()), None);
    }

    #[test]
    fn test_capacity_evicts_least_recently_used() {
        let (cache, evicted) = recording_cache(2);
        cache.set("a".to_string(), 1);
        cache.set("b".to_string(), 2);
        // Touch "a" so "b" becomes the LRU entry
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        cache.set("c".to_string(), 3);
        assert_eq!(*evicted.lock(), vec!["b".to_string()]);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
    }

    #[test]
    fn test_single_slot_replaces_sole_entry() {
        let (cache, evicted) = recording_cache(1);
        cache.set("a".to_string(), 1);
        cache.set("b".to_string(), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(*evicted.lock(), vec!["a".to_string()]);
    }

    #[test]
    fn test_zero_capacity_behaves_as_single_slot() {
        let (cache, _) = recording_cache(0);
        assert_eq!(cache.capacity(), 1);
        cache.set("a".to_string(), 1);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
    }

    #[test]
    fn test_replacement_fires_callback_for_old_value() {
        let cache: ConnectionCache<String, u32> = ConnectionCache::new(&CacheConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        cache.on_evict(move |_key: &String, value| log.lock().push(value));

        cache.set("a".to_string(), 1);
        cache.set("a".to_string(), 2);
        assert_eq!(*seen.lock(), vec![1]);
        assert_eq!(cache.get(&"a".to_string()), Some(2));
    }

    #[test]
    fn test_invalidate_fires_once() {
        let (cache, evicted) = recording_cache(4);
        cache.set("a".to_string(), 1);
        assert!(cache.invalidate(&"a".to_string()));
        assert!(!cache.invalidate(&"a".to_string()));
        assert_eq!(evicted.lock().len(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_idle_entries_expire_on_get_and_purge() {
        let cache: ConnectionCache<String, u32> = ConnectionCache::new(&CacheConfig {
            capacity: 8,
            idle_ttl: Some(Duration::from_millis(20)),
            sweep_interval: None,
        });
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        cache.on_evict(move |_key: &String, _value| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        cache.set("a".to_string(), 1);
        cache.set("b".to_string(), 2);
        std::thread::sleep(Duration::from_millis(40));

        assert_eq!(cache.get(&"a".to_string()), None);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_clear_evicts_everything() {
        let (cache, evicted) = recording_cache(4);
        cache.set("a".to_string(), 1);
        cache.set("b".to_string(), 2);
        assert_eq!(cache.clear(), 2);
        assert_eq!(evicted.lock().len(), 2);
    }

    #[test]
    fn test_callback_may_reenter_cache() {
        let cache: Arc<ConnectionCache<String, u32>> =
            Arc::new(ConnectionCache::new(&CacheConfig { capacity: 1, ..Default::default() }));
        let weak = Arc::downgrade(&cache);
        cache.on_evict(move |_key: &String, _value| {
            // Callbacks run after the lock is released
            if let Some(cache) = weak.upgrade() {
                let _ = cache.len();
            }
        });
        cache.set("a".to_string(), 1);
        cache.set("b".to_string(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_sweeper_purges_idle_entries() {
        let cache: Arc<ConnectionCache<String, u32>> = Arc::new(ConnectionCache::new(
            &CacheConfig::with_idle_ttl(4, Duration::from_millis(10), Duration::from_millis(10)),
        ));
        cache.set("a".to_string(), 1);
        let handle = cache.spawn_sweeper(Duration::from_millis(10));

        let mut waited = 0;
        while !cache.is_empty() && waited < 100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += 1;
        }
        assert!(cache.is_empty());
        handle.abort();
    }

    #[test]
    fn test_concurrent_set_and_get() {
        let cache: Arc<ConnectionCache<u32, u32>> =
            Arc::new(ConnectionCache::new(&CacheConfig { capacity: 8, ..Default::default() }));
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        cache.on_evict(move |_key: &u32, _value| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let threads: Vec<_> = (0..4)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let key = t * 100 + i;
                        cache.set(key, key);
                        let _ = cache.get(&key);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        // 400 distinct inserts into 8 slots
        assert_eq!(cache.len(), 8);
        assert_eq!(count.load(Ordering::SeqCst), 392);
    }
}
