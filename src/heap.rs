//! The in-process backend: a growable table with no capacity bound,
//! where eviction happens only on explicit `gc` or `reset`.  This is the
//! baseline strategy, suited to unbounded or ephemeral template sets
//! (one short-lived process per request) where memory growth is
//! acceptable, and it doubles as the reference implementation the other
//! backends are tested against.
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::Limits;
use crate::errors::{Error, Result};
use crate::stats::CacheStat;
use crate::sweep;
use crate::sweep::{Budget, Candidate};

/// One cached module and its bookkeeping.
#[derive(Clone, Debug)]
struct HeapEntry {
    // Shared with outstanding leases, so eviction of the map entry never
    // invalidates a payload a caller is still executing.
    payload: Arc<[u8]>,
    created_at: u64,
    last_access: u64,
    refcount: u32,
}

#[derive(Debug, Default)]
struct HeapInner {
    entries: HashMap<Box<[u8]>, HeapEntry>,
    hits: u64,
    misses: u64,
    current_size: u64,
}

/// A process-local cache of compiled modules.
#[derive(Debug)]
pub(crate) struct HeapCache {
    inner: Mutex<HeapInner>,
    limits: Limits,
}

impl HeapCache {
    pub fn new(limits: Limits) -> HeapCache {
        HeapCache {
            inner: Mutex::new(HeapInner::default()),
            limits,
        }
    }

    /// Returns a pinned handle to the module cached for `key`, if any.
    pub fn find(&self, key: &[u8]) -> Option<Arc<[u8]>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.refcount += 1;
                entry.last_access = sweep::unix_micros();
                inner.hits += 1;
                Some(Arc::clone(&entry.payload))
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Caches `module` under an owned copy of `key`.
    pub fn add(&self, key: &[u8], module: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();

        if inner.entries.contains_key(key) {
            return Err(Error::DuplicateKey);
        }

        let now = sweep::unix_micros();
        inner.entries.insert(
            key.into(),
            HeapEntry {
                payload: module.into(),
                created_at: now,
                last_access: now,
                refcount: 0,
            },
        );
        inner.current_size += module.len() as u64;
        Ok(())
    }

    /// Applies the configured limits and returns the number of entries
    /// removed.
    pub fn gc(&self) -> usize {
        let mut inner = self.inner.lock();

        let candidates: Vec<Candidate<Box<[u8]>>> = inner
            .entries
            .iter()
            .map(|(key, entry)| Candidate {
                token: key.clone(),
                size: entry.payload.len() as u64,
                created_at: entry.created_at,
                last_access: entry.last_access,
                pinned: entry.refcount > 0,
            })
            .collect();

        let victims = sweep::plan(
            candidates,
            self.limits.max_age,
            Budget::from_limits(&self.limits),
            sweep::unix_micros(),
        );

        for key in &victims {
            if let Some(entry) = inner.entries.remove(key) {
                inner.current_size -= entry.payload.len() as u64;
            }
        }

        if !victims.is_empty() {
            tracing::debug!(removed = victims.len(), "in-process cache sweep");
        }

        victims.len()
    }

    /// Unpins one reference on `key`'s entry, saturating at zero.
    pub fn release(&self, key: &[u8]) {
        let mut inner = self.inner.lock();

        if let Some(entry) = inner.entries.get_mut(key) {
            if entry.refcount > 0 {
                entry.refcount -= 1;
            } else {
                debug_assert!(false, "release without a matching find");
                tracing::warn!("release without a matching find; refcount stays at zero");
            }
        }
    }

    /// Drops every unpinned entry, regardless of limits.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();

        let mut freed = 0u64;
        inner.entries.retain(|_, entry| {
            if entry.refcount > 0 {
                true
            } else {
                freed += entry.payload.len() as u64;
                false
            }
        });
        inner.current_size -= freed;
    }

    pub fn stat(&self) -> CacheStat {
        let inner = self.inner.lock();

        let key_bytes: u64 = inner.entries.keys().map(|k| k.len() as u64).sum();
        let slot_bytes =
            std::mem::size_of::<(Box<[u8]>, HeapEntry)>() as u64 * inner.entries.capacity() as u64;

        CacheStat {
            backend: "in-process",
            hits: inner.hits,
            misses: inner.misses,
            current_entries: inner.entries.len(),
            current_size: inner.current_size,
            current_table_size: slot_bytes + key_bytes,
            current_data_size: inner.current_size,
            pinned: inner.entries.values().filter(|e| e.refcount > 0).count(),
            // Dynamic allocation: no fixed totals, no probing.
            ..CacheStat::default()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    /// Round-trip: what goes in comes back byte-equal, and the counters
    /// see one hit and one miss.
    #[test]
    fn test_round_trip() {
        let cache = HeapCache::new(Limits::none());

        cache.add(b"greeting", b"module-bytes").expect("add must succeed");

        let found = cache.find(b"greeting").expect("must be found");
        assert_eq!(&found[..], b"module-bytes");
        assert!(cache.find(b"missing").is_none());

        let stat = cache.stat();
        assert_eq!(stat.hits, 1);
        assert_eq!(stat.misses, 1);
        assert_eq!(stat.current_entries, 1);
        assert_eq!(stat.current_size, b"module-bytes".len() as u64);

        cache.release(b"greeting");
    }

    /// Adding the same key twice fails and leaves the first payload in
    /// place.
    #[test]
    fn test_duplicate_key() {
        let cache = HeapCache::new(Limits::none());

        cache.add(b"k", b"v1").expect("first add must succeed");
        assert!(matches!(cache.add(b"k", b"v2"), Err(Error::DuplicateKey)));

        let found = cache.find(b"k").expect("must be found");
        assert_eq!(&found[..], b"v1");
        cache.release(b"k");
    }

    /// Unbounded config: many adds all succeed and `gc` removes
    /// nothing.
    #[test]
    fn test_unbounded_gc_is_noop() {
        let cache = HeapCache::new(Limits::none());

        for i in 0..10_000u32 {
            cache
                .add(&i.to_le_bytes(), b"payload")
                .expect("add must succeed");
        }

        assert_eq!(cache.gc(), 0);
        assert_eq!(cache.stat().current_entries, 10_000);
    }

    /// The count bound applies only at `gc` time and keeps the most
    /// recently accessed entries.
    #[test]
    fn test_count_bound() {
        let cache = HeapCache::new(Limits::none().with_max_entries(2));

        cache.add(b"a", b"1").expect("add must succeed");
        cache.add(b"b", b"2").expect("add must succeed");
        cache.add(b"c", b"3").expect("add must succeed");
        assert_eq!(cache.stat().current_entries, 3);

        // Touch "a" so it is the most recently used.
        cache.find(b"a").expect("must be found");
        cache.release(b"a");

        assert_eq!(cache.gc(), 1);
        let stat = cache.stat();
        assert_eq!(stat.current_entries, 2);
        assert!(cache.find(b"a").is_some());
        cache.release(b"a");
    }

    /// Age expiry: a short `max_age` plus a sleep makes the entry
    /// eligible, and `find` then misses.
    #[test]
    fn test_age_expiry() {
        let cache = HeapCache::new(Limits::none().with_max_age(Duration::from_millis(50)));

        cache.add(b"t", b"payload").expect("add must succeed");
        std::thread::sleep(Duration::from_millis(120));

        assert_eq!(cache.gc(), 1);
        assert!(cache.find(b"t").is_none());
    }

    /// A pinned entry survives both `gc` and `reset` until released.
    #[test]
    fn test_pinning() {
        let cache = HeapCache::new(Limits::none().with_max_entries(1));

        cache.add(b"pinned", b"1").expect("add must succeed");
        cache.add(b"loose", b"2").expect("add must succeed");

        let _payload = cache.find(b"pinned").expect("must be found");

        // Over the bound by one; only the unpinned entry can go.
        assert_eq!(cache.gc(), 1);
        assert_eq!(cache.stat().pinned, 1);

        cache.reset();
        assert_eq!(cache.stat().current_entries, 1);

        cache.release(b"pinned");
        cache.reset();
        assert_eq!(cache.stat().current_entries, 0);
    }

    /// Stat sizes track the sum of live payload sizes.
    #[test]
    fn test_stat_size_consistency() {
        let cache = HeapCache::new(Limits::none());

        cache.add(b"a", &[0u8; 100]).expect("add must succeed");
        cache.add(b"b", &[0u8; 50]).expect("add must succeed");
        assert_eq!(cache.stat().current_size, 150);

        cache.reset();
        assert_eq!(cache.stat().current_size, 0);
    }
}
