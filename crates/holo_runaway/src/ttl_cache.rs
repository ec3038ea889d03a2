//! Capacity-bounded cache with per-entry expiry and observer hooks.
//!
//! Observers are notified after the internal lock is released, so a hook may
//! take its own locks (or read the cache) without deadlocking against the
//! caller that triggered it. Expiry is lazy for reads and enforced by
//! [`TtlCache::purge_expired`], which the owner runs periodically through
//! [`run_purge_loop`].

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Why an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    Deleted,
    /// Removed so another value could take the key.
    Superseded,
    Expired,
    CapacityReached,
}

/// Receives one `on_insert` per physical entry and one `on_evict` when it
/// leaves. Replacing the value of a live key fires neither.
pub trait CacheObserver<K, V>: Send + Sync {
    fn on_insert(&self, key: &K, value: &V);
    fn on_evict(&self, key: &K, value: &V, reason: EvictionReason);
}

struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
    seq: u64,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

struct CacheState<K, V> {
    entries: HashMap<K, Entry<V>>,
    // Insertion order for capacity eviction; refreshed on replace.
    order: BTreeMap<u64, K>,
    next_seq: u64,
}

impl<K: Eq + Hash + Clone, V> CacheState<K, V> {
    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn remove(&mut self, key: &K) -> Option<Entry<V>> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.seq);
        Some(entry)
    }
}

enum Event<K, V> {
    Inserted(K, V),
    Evicted(K, V, EvictionReason),
}

pub struct TtlCache<K, V> {
    capacity: usize,
    state: Mutex<CacheState<K, V>>,
    observer: Option<Arc<dyn CacheObserver<K, V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize, observer: Option<Arc<dyn CacheObserver<K, V>>>) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_seq: 0,
            }),
            observer,
        }
    }

    /// Returns the live value for `key`. Does not extend its lifetime.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let state = self.lock();
        state
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone())
    }

    /// Inserts or replaces `key`. `ttl == None` never expires.
    ///
    /// Returns the live value that was replaced, if any. An expired value
    /// still waiting for purge is evicted as `Expired` first.
    pub fn set(&self, key: K, value: V, ttl: Option<Duration>) -> Option<V> {
        let now = Instant::now();
        let expires_at = ttl.map(|ttl| now + ttl);
        let mut events = Vec::new();
        let replaced = {
            let mut state = self.lock();
            let seq = state.bump_seq();
            let live = state
                .entries
                .get(&key)
                .map(|entry| !entry.is_expired(now));
            match live {
                Some(true) => {
                    let old_seq = state.entries.get(&key).map(|entry| entry.seq);
                    if let Some(old_seq) = old_seq {
                        state.order.remove(&old_seq);
                    }
                    state.order.insert(seq, key.clone());
                    state.entries.get_mut(&key).map(|entry| {
                        entry.seq = seq;
                        entry.expires_at = expires_at;
                        std::mem::replace(&mut entry.value, value)
                    })
                }
                Some(false) | None => {
                    if let Some(stale) = state.remove(&key) {
                        events.push(Event::Evicted(key.clone(), stale.value, EvictionReason::Expired));
                    }
                    while state.entries.len() >= self.capacity {
                        let Some((_, oldest)) = state.order.pop_first() else {
                            break;
                        };
                        if let Some(entry) = state.entries.remove(&oldest) {
                            let reason = if entry.is_expired(now) {
                                EvictionReason::Expired
                            } else {
                                EvictionReason::CapacityReached
                            };
                            events.push(Event::Evicted(oldest, entry.value, reason));
                        }
                    }
                    state.order.insert(seq, key.clone());
                    state.entries.insert(
                        key.clone(),
                        Entry {
                            value: value.clone(),
                            expires_at,
                            seq,
                        },
                    );
                    events.push(Event::Inserted(key, value));
                    None
                }
            }
        };
        self.notify(events);
        replaced
    }

    /// Removes `key`, notifying the observer with [`EvictionReason::Deleted`].
    pub fn delete(&self, key: &K) -> Option<V> {
        self.remove(key, EvictionReason::Deleted)
    }

    /// Removes `key`, notifying the observer with `reason`.
    pub fn remove(&self, key: &K, reason: EvictionReason) -> Option<V> {
        let removed = self.lock().remove(key);
        let entry = removed?;
        self.notify(vec![Event::Evicted(key.clone(), entry.value.clone(), reason)]);
        Some(entry.value)
    }

    /// Evicts every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let events: Vec<_> = {
            let mut state = self.lock();
            let expired: Vec<K> = state
                .entries
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect();
            expired
                .into_iter()
                .filter_map(|key| {
                    state
                        .remove(&key)
                        .map(|entry| Event::Evicted(key, entry.value, EvictionReason::Expired))
                })
                .collect()
        };
        let purged = events.len();
        self.notify(events);
        purged
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn notify(&self, events: Vec<Event<K, V>>) {
        let Some(observer) = self.observer.as_ref() else {
            return;
        };
        for event in events {
            match event {
                Event::Inserted(key, value) => observer.on_insert(&key, &value),
                Event::Evicted(key, value, reason) => observer.on_evict(&key, &value, reason),
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState<K, V>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Purges expired entries every `interval` until shutdown is signaled.
pub async fn run_purge_loop<K, V>(
    cache: Arc<TtlCache<K, V>>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                // Decision: stop purging once sender dropped or shutdown flag is set.
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let purged = cache.purge_expired();
                if purged > 0 {
                    debug!(purged, "expired cache entries purged");
                }
            }
        }
    }
    info!("cache purge loop stopped");
}
