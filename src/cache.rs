//! Generic TTL cache
//!
//! A concurrent keyed registry whose entries expire unless their expiration
//! is slid forward on access. A background sweeper removes expired entries
//! and hands each evicted value to an optional hook.
//!
//! Entries are shared as `Arc<Entry<V>>`. While a caller still holds the
//! `Arc` obtained from the cache, the sweeper leaves the entry in place even
//! after it expires.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::debug;

/// Callback invoked with every value the cache evicts on expiry
pub type EvictHook<K, V> = Box<dyn Fn(&K, &V) + Send + Sync>;

/// Predicate marking a value as in use, which keeps it cached past expiry
pub type HoldCheck<V> = Box<dyn Fn(&V) -> bool + Send + Sync>;

/// A cached value plus its expiration
#[derive(Debug)]
pub struct Entry<V> {
    value: V,
    epoch: Instant,
    /// Nanoseconds after `epoch`
    expire_at: AtomicU64,
}

impl<V> Entry<V> {
    fn new(value: V, epoch: Instant, expire_at: Instant) -> Self {
        Self {
            value,
            epoch,
            expire_at: AtomicU64::new(nanos_since(epoch, expire_at)),
        }
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn expire_at(&self) -> Instant {
        self.epoch + Duration::from_nanos(self.expire_at.load(Ordering::Acquire))
    }

    /// Slide the expiration forward to `at`
    ///
    /// An earlier `at` than the current expiration is ignored.
    pub fn set_expiration(&self, at: Instant) {
        self.expire_at
            .fetch_max(nanos_since(self.epoch, at), Ordering::AcqRel);
    }

    /// Whether the entry is past its expiration at `now`
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expire_at() < now
    }
}

fn nanos_since(epoch: Instant, at: Instant) -> u64 {
    u64::try_from(at.saturating_duration_since(epoch).as_nanos()).unwrap_or(u64::MAX)
}

/// Concurrent map of keys to expiring entries
pub struct TtlCache<K, V> {
    entries: DashMap<K, Arc<Entry<V>>>,
    epoch: Instant,
    on_evict: Option<EvictHook<K, V>>,
    hold_check: Option<HoldCheck<V>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create an empty cache without an eviction hook
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            epoch: Instant::now(),
            on_evict: None,
            hold_check: None,
        }
    }

    /// Create an empty cache that calls `hook` for every evicted value
    pub fn with_evict_hook(hook: impl Fn(&K, &V) + Send + Sync + 'static) -> Self {
        Self {
            on_evict: Some(Box::new(hook)),
            ..Self::new()
        }
    }

    /// Treat entries whose value satisfies `check` as held
    ///
    /// A held entry is neither swept nor replaced by `load_or_store`, in
    /// addition to entries whose `Arc` is still shared.
    pub fn with_hold_check(mut self, check: impl Fn(&V) -> bool + Send + Sync + 'static) -> Self {
        self.hold_check = Some(Box::new(check));
        self
    }

    fn is_held(&self, entry: &Arc<Entry<V>>) -> bool {
        Arc::strong_count(entry) > 1
            || self
                .hold_check
                .as_ref()
                .is_some_and(|check| check(entry.value()))
    }

    /// Return the live entry under `key`, or install `value` with `ttl`
    ///
    /// The boolean is `true` when an existing entry was returned. An expired
    /// entry nobody holds is replaced and reported to the eviction hook. An
    /// expired entry that is held is returned with `loaded = true`, although
    /// `load` does not report it; callers should slide its expiration.
    pub fn load_or_store(&self, key: K, value: V, ttl: Duration) -> (Arc<Entry<V>>, bool) {
        self.load_or_store_at(key, value, ttl, Instant::now())
    }

    fn load_or_store_at(
        &self,
        key: K,
        value: V,
        ttl: Duration,
        now: Instant,
    ) -> (Arc<Entry<V>>, bool) {
        let fresh = Arc::new(Entry::new(value, self.epoch, now + ttl));

        let (entry, loaded, replaced) = match self.entries.entry(key.clone()) {
            MapEntry::Occupied(mut occupied) => {
                let current = occupied.get();
                if !current.is_expired_at(now) || self.is_held(current) {
                    (Arc::clone(current), true, None)
                } else {
                    let old = occupied.insert(Arc::clone(&fresh));
                    (fresh, false, Some(old))
                }
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&fresh));
                (fresh, false, None)
            }
        };

        if let Some(old) = replaced {
            self.evicted(&key, &old);
        }

        (entry, loaded)
    }

    /// Return the entry under `key` if it has not expired
    ///
    /// An expired entry that is still held stays hidden here even though
    /// `load_or_store` hands it back with `loaded = true`; refreshing it
    /// through `peek` makes it visible again.
    pub fn load(&self, key: &K) -> Option<Arc<Entry<V>>> {
        self.load_at(key, Instant::now())
    }

    fn load_at(&self, key: &K, now: Instant) -> Option<Arc<Entry<V>>> {
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired_at(now))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Return the entry under `key`, expired or not
    pub fn peek(&self, key: &K) -> Option<Arc<Entry<V>>> {
        self.entries.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove and return the entry under `key`, expired or not
    pub fn load_and_delete(&self, key: &K) -> Option<Arc<Entry<V>>> {
        self.entries.remove(key).map(|(_, entry)| entry)
    }

    /// Remove `key` only if it still maps to exactly `entry`
    pub fn compare_and_delete(&self, key: &K, entry: &Arc<Entry<V>>) -> bool {
        self.entries
            .remove_if(key, |_, current| Arc::ptr_eq(current, entry))
            .is_some()
    }

    /// Visit live entries until `f` returns `false`
    ///
    /// Iterates a snapshot taken up front, so `f` may freely call back into
    /// the cache. Entries inserted meanwhile are not visited.
    pub fn range(&self, mut f: impl FnMut(&K, &Arc<Entry<V>>) -> bool) {
        let now = Instant::now();
        let snapshot: Vec<(K, Arc<Entry<V>>)> = self
            .entries
            .iter()
            .filter(|item| !item.value().is_expired_at(now))
            .map(|item| (item.key().clone(), Arc::clone(item.value())))
            .collect();

        for (key, entry) in &snapshot {
            if !f(key, entry) {
                break;
            }
        }
    }

    /// Number of stored entries, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every expired entry nobody holds; returns how many were removed
    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(Instant::now())
    }

    fn evict_expired_at(&self, now: Instant) -> usize {
        let candidates: Vec<K> = self
            .entries
            .iter()
            .filter(|item| item.value().is_expired_at(now))
            .map(|item| item.key().clone())
            .collect();

        let mut evicted = 0;
        for key in candidates {
            let removed = self.entries.remove_if(&key, |_, entry| {
                entry.is_expired_at(now) && !self.is_held(entry)
            });
            if let Some((key, entry)) = removed {
                self.evicted(&key, &entry);
                evicted += 1;
            }
        }
        evicted
    }

    fn evicted(&self, key: &K, entry: &Entry<V>) {
        if let Some(hook) = &self.on_evict {
            hook(key, entry.value());
        }
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Spawn the background sweeper
    ///
    /// The task stops by itself once the cache is dropped; the handle can
    /// also be aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                let evicted = cache.evict_expired();
                if evicted > 0 {
                    debug!(evicted, remaining = cache.len(), "Cache sweep");
                }
            }
        })
    }
}

impl<K, V> Default for TtlCache<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
