//! A single cache tier: a map bounded by entry count (least recently used
//! goes first) and by age (entries older than the TTL are misses).

use std::{
    borrow::Borrow,
    fmt,
    hash::Hash,
    num::NonZeroUsize,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::ttl::SharedDuration;

/// Monotonic counters for one tier.
#[derive(Debug, Default)]
pub struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl TierCounters {
    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Read all counters.
    pub fn snapshot(&self) -> TierStats {
        TierStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`TierCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierStats {
    /// Lookups served from the tier.
    pub hits: u64,
    /// Lookups that found nothing usable.
    pub misses: u64,
    /// Entries dropped for capacity, age or because the caller rejected them.
    pub evictions: u64,
}

/// Outcome of [`Tier::lookup_with`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<V> {
    /// A fresh entry the caller accepted.
    Hit(V),
    /// No entry.
    Miss,
    /// The entry outlived the TTL and was removed.
    Expired,
    /// The entry was fresh, but the caller's check rejected it. It was removed.
    Rejected(V),
}

impl<V> Lookup<V> {
    /// The value, for hits only.
    pub fn hit(self) -> Option<V> {
        match self {
            Lookup::Hit(value) => Some(value),
            _ => None,
        }
    }
}

struct Slot<V> {
    value: V,
    inserted: Instant,
}

impl<V> Slot<V> {
    fn fresh(&self, ttl: Duration) -> bool {
        self.inserted.elapsed() < ttl
    }
}

struct Inner<K: Hash + Eq, V> {
    // Sized to at least one entry; `capacity` is what callers asked for.
    entries: LruCache<K, Slot<V>>,
    capacity: usize,
}

impl<K: Hash + Eq, V> Inner<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            entries: LruCache::new(bound(capacity)),
            capacity,
        }
    }
}

fn bound(capacity: usize) -> NonZeroUsize {
    NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)
}

/// One tier of the rewrite cache.
///
/// Every lookup checks the age of the entry before calling it a hit, and an
/// insert into a full tier evicts exactly one entry, the one that was looked
/// up or written longest ago. The lock is only held for map bookkeeping, so
/// callers must compute values outside of it.
pub struct Tier<K: Hash + Eq, V> {
    name: &'static str,
    inner: Mutex<Inner<K, V>>,
    ttl: SharedDuration,
    counters: TierCounters,
}

impl<K: Hash + Eq, V> fmt::Debug for Tier<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Tier")
            .field("name", &self.name)
            .field("len", &inner.entries.len())
            .field("capacity", &inner.capacity)
            .field("ttl", &self.ttl.get())
            .finish()
    }
}

impl<K, V> Tier<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Create a tier holding at most `capacity` entries for at most `ttl`.
    ///
    /// A capacity of zero disables the tier: inserts are dropped and every
    /// lookup misses.
    pub fn new(name: &'static str, capacity: usize, ttl: Duration) -> Self {
        Self {
            name,
            inner: Mutex::new(Inner::new(capacity)),
            ttl: SharedDuration::new(ttl),
            counters: TierCounters::default(),
        }
    }

    /// Name used in log events.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Fetch a fresh entry, marking it as recently used.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.lookup_with(key, |_| true).hit()
    }

    /// Fetch a fresh entry, and let the caller decide whether it is still
    /// usable. Rejected entries are removed and counted as evictions.
    pub fn lookup_with<Q, F>(&self, key: &Q, accept: F) -> Lookup<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&V) -> bool,
    {
        let ttl = self.ttl.get();
        let mut inner = self.inner.lock();

        let Some(slot) = inner.entries.peek(key) else {
            self.counters.miss();
            return Lookup::Miss;
        };

        if !slot.fresh(ttl) {
            inner.entries.pop(key);
            self.counters.eviction();
            self.counters.miss();
            tracing::trace!(tier = self.name, "expired entry removed");
            return Lookup::Expired;
        }

        if !accept(&slot.value) {
            let value = slot.value.clone();
            inner.entries.pop(key);
            self.counters.eviction();
            self.counters.miss();
            tracing::trace!(tier = self.name, "rejected entry removed");
            return Lookup::Rejected(value);
        }

        let value = slot.value.clone();
        inner.entries.promote(key);
        self.counters.hit();
        Lookup::Hit(value)
    }

    /// Check for a fresh entry without touching recency or counters.
    pub fn peek<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let ttl = self.ttl.get();
        let inner = self.inner.lock();
        inner
            .entries
            .peek(key)
            .filter(|slot| slot.fresh(ttl))
            .map(|slot| slot.value.clone())
    }

    /// Insert or refresh an entry. Returns the key evicted to make room, if any.
    pub fn insert(&self, key: K, value: V) -> Option<K> {
        let mut inner = self.inner.lock();
        if inner.capacity == 0 {
            return None;
        }

        let slot = Slot {
            value,
            inserted: Instant::now(),
        };
        if inner.entries.contains(&key) {
            inner.entries.put(key, slot);
            return None;
        }

        let mut evicted = None;
        while inner.entries.len() >= inner.capacity {
            let Some((key, _)) = inner.entries.pop_lru() else {
                break;
            };
            self.counters.eviction();
            evicted = Some(key);
        }
        if evicted.is_some() {
            tracing::trace!(tier = self.name, "evicted least recently used entry");
        }

        inner.entries.put(key, slot);
        evicted
    }

    /// Drop a single entry without counting it. Returns true if it existed.
    pub fn remove<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.lock().entries.pop(key).is_some()
    }

    /// Drop every entry. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let dropped = inner.entries.len();
        inner.entries.clear();
        dropped
    }

    /// Drop every entry and change the capacity.
    pub fn reset(&self, capacity: usize) -> usize {
        let mut inner = self.inner.lock();
        let dropped = inner.entries.len();
        inner.entries.clear();
        inner.entries.resize(bound(capacity));
        inner.capacity = capacity;
        dropped
    }

    /// Number of stored entries, including ones that have expired but not
    /// been looked up since.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// The TTL shared with this tier. Setting it affects existing entries.
    pub fn ttl(&self) -> &SharedDuration {
        &self.ttl
    }

    /// Hit, miss and eviction counters.
    pub fn stats(&self) -> TierStats {
        self.counters.snapshot()
    }
}
