//! Callers interact with the cache through the `Cache` struct defined
//! here.  A `Cache` hides the difference in behaviour between the
//! in-process, shared-memory, and durable strategies: a backend is
//! chosen at construction time and everything after that goes through
//! the same six operations, so the compiler/interpreter integration
//! layer never knows which strategy it is talking to.
//!
//! `find` returns a [`Lease`], a pinned handle to the module bytes.
//! The pin keeps the entry alive through sweeps while the interpreter
//! executes it; dropping the lease releases the pin.  An explicit
//! [`Cache::release`] also exists for callers that manage pairing by
//! hand; over-releasing saturates at zero rather than corrupting the
//! count.
use std::path::Path;
use std::sync::Arc;

use crate::config::Limits;
use crate::errors::Result;
use crate::heap::HeapCache;
use crate::persistent::PersistentCache;
use crate::region::RegionCache;
use crate::stats::CacheStat;

/// The closed set of storage strategies.  The set is fixed at compile
/// time, so dispatch is a plain match rather than a trait object.
#[derive(Debug)]
enum Backend {
    Heap(HeapCache),
    Region(RegionCache),
    Persistent(PersistentCache),
}

/// A cache of compiled template modules, keyed by byte strings.
///
/// All operations take `&self`; instances are safe to share across
/// threads, and a shared-memory cache additionally shares its contents
/// with every process attached to the same region file.
#[derive(Debug)]
pub struct Cache {
    backend: Backend,
}

/// Where a lease's payload bytes actually live.
#[derive(Debug)]
enum LeaseData<'a> {
    // In-process entries hand out another reference to their shared
    // payload.
    Shared(Arc<[u8]>),
    // Shared-memory entries are read in place; the pin guarantees the
    // arena bytes stay put for the life of the lease.
    Mapped(&'a [u8]),
    // Durable entries are copied out of the read transaction.
    Fetched(Vec<u8>),
}

/// A pinned view of one cached module.
///
/// Derefs to the module bytes.  While the lease is alive the entry's
/// refcount is non-zero, so no sweep will remove it; dropping the lease
/// releases the pin.
#[derive(Debug)]
pub struct Lease<'a> {
    cache: &'a Cache,
    key: Box<[u8]>,
    data: LeaseData<'a>,
}

impl Lease<'_> {
    /// The key this lease was found under.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Releases the pin now instead of at end of scope.
    pub fn release(self) {
        // Dropping does the work.
    }
}

impl std::ops::Deref for Lease<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.data {
            LeaseData::Shared(payload) => payload,
            LeaseData::Mapped(payload) => payload,
            LeaseData::Fetched(payload) => payload,
        }
    }
}

impl AsRef<[u8]> for Lease<'_> {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        self.cache.release(&self.key);
    }
}

impl Cache {
    /// A process-local cache with no capacity bound; entries are only
    /// removed by explicit `gc` or `reset` calls applying `limits`.
    pub fn in_process(limits: Limits) -> Cache {
        Cache {
            backend: Backend::Heap(HeapCache::new(limits)),
        }
    }

    /// A cache in a shared memory region backed by the file at `path`,
    /// `total_size` bytes in all with a fixed table of `entries` slots.
    /// The file is created if absent; constructing against an existing
    /// region attaches to it, and every attached process sees the same
    /// entries.  Use [`region_size`] to derive `total_size` from a
    /// desired arena.
    ///
    /// [`region_size`]: crate::region_size
    pub fn shared_region(
        path: impl AsRef<Path>,
        total_size: u64,
        entries: usize,
        limits: Limits,
    ) -> Result<Cache> {
        Ok(Cache {
            backend: Backend::Region(RegionCache::attach(
                path.as_ref(),
                total_size,
                entries,
                limits,
            )?),
        })
    }

    /// A crash-persistent cache in an embedded store at `path`,
    /// created if absent.
    pub fn persistent(path: impl AsRef<Path>, limits: Limits) -> Result<Cache> {
        Ok(Cache {
            backend: Backend::Persistent(PersistentCache::open(path.as_ref(), limits)?),
        })
    }

    /// Looks up the module cached under `key`.  A hit pins the entry
    /// and returns a lease on its bytes; a miss returns `Ok(None)`.
    /// Only the durable backend can actually fail here.
    pub fn find(&self, key: &[u8]) -> Result<Option<Lease<'_>>> {
        let data = match &self.backend {
            Backend::Heap(cache) => cache.find(key).map(LeaseData::Shared),
            Backend::Region(cache) => cache.find(key).map(LeaseData::Mapped),
            Backend::Persistent(cache) => cache.find(key)?.map(LeaseData::Fetched),
        };

        Ok(data.map(|data| Lease {
            cache: self,
            key: key.into(),
            data,
        }))
    }

    /// Caches `module` under an owned copy of `key`.
    ///
    /// Fails with [`Error::DuplicateKey`] if the key is already
    /// occupied, and with [`Error::CacheFull`] if a capacity-bounded
    /// backend cannot make room.  Callers should treat both as "skip
    /// caching this render", not as fatal.
    ///
    /// [`Error::DuplicateKey`]: crate::Error::DuplicateKey
    /// [`Error::CacheFull`]: crate::Error::CacheFull
    pub fn add(&self, key: &[u8], module: &[u8]) -> Result<()> {
        match &self.backend {
            Backend::Heap(cache) => cache.add(key, module),
            Backend::Region(cache) => cache.add(key, module),
            Backend::Persistent(cache) => cache.add(key, module),
        }
    }

    /// Sweeps unpinned entries violating the configured limits (age
    /// expiry first, then oldest-accessed-first until the count and
    /// size bounds hold) and returns how many were removed.  When the
    /// excess is pinned, the sweep removes what it can; that is not an
    /// error.
    pub fn gc(&self) -> Result<usize> {
        match &self.backend {
            Backend::Heap(cache) => Ok(cache.gc()),
            Backend::Region(cache) => Ok(cache.gc()),
            Backend::Persistent(cache) => cache.gc(),
        }
    }

    /// Unpins one reference on `key`'s entry.
    ///
    /// Dropping a [`Lease`] already does this; the explicit form is for
    /// callers that manage pairing by hand.  Releasing an unknown key
    /// is a no-op, and releasing more times than `find` returned
    /// saturates at zero (flagged by a debug assertion, since it means
    /// the caller's pairing is off).
    pub fn release(&self, key: &[u8]) {
        match &self.backend {
            Backend::Heap(cache) => cache.release(key),
            Backend::Region(cache) => cache.release(key),
            Backend::Persistent(cache) => cache.release(key),
        }
    }

    /// Removes every unpinned entry, ignoring the configured limits.
    /// Pinned entries remain until released, after which the next
    /// `gc`/`reset` can take them.
    pub fn reset(&self) -> Result<()> {
        match &self.backend {
            Backend::Heap(cache) => {
                cache.reset();
                Ok(())
            }
            Backend::Region(cache) => {
                cache.reset();
                Ok(())
            }
            Backend::Persistent(cache) => cache.reset(),
        }
    }

    /// A consistent snapshot of the cache's counters, taken under the
    /// same exclusion as mutations.
    pub fn stat(&self) -> Result<CacheStat> {
        match &self.backend {
            Backend::Heap(cache) => Ok(cache.stat()),
            Backend::Region(cache) => Ok(cache.stat()),
            Backend::Persistent(cache) => cache.stat(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::errors::Error;
    use crate::layout::region_size;

    /// Every backend behind the same facade, for the uniform-surface
    /// checks.
    fn all_backends(dir: &tempfile::TempDir) -> Vec<Cache> {
        vec![
            Cache::in_process(Limits::none()),
            Cache::shared_region(
                dir.path().join("region"),
                region_size(16, 1 << 16),
                16,
                Limits::none(),
            )
            .expect("shared region must construct"),
            Cache::persistent(dir.path().join("modules.redb"), Limits::none())
                .expect("persistent cache must construct"),
        ]
    }

    /// The same add/find/release/gc/reset conversation works against
    /// every backend.
    #[test]
    fn test_uniform_surface() {
        let dir = tempfile::tempdir().expect("tempdir must succeed");

        for cache in all_backends(&dir) {
            cache.add(b"index.tpl", b"module").expect("add must succeed");
            assert!(matches!(
                cache.add(b"index.tpl", b"other"),
                Err(Error::DuplicateKey)
            ));

            {
                let lease = cache
                    .find(b"index.tpl")
                    .expect("find must succeed")
                    .expect("must be found");
                assert_eq!(&*lease, b"module");
                assert_eq!(lease.key(), b"index.tpl");

                // Pinned: reset spares the entry.
                cache.reset().expect("reset must succeed");
                let stat = cache.stat().expect("stat must succeed");
                assert_eq!(
                    stat.current_entries, 1,
                    "{}: pinned entry must survive reset",
                    stat.backend
                );
            }

            // Lease dropped; now reset takes it.
            cache.reset().expect("reset must succeed");
            assert_eq!(cache.stat().expect("stat must succeed").current_entries, 0);

            let stat = cache.stat().expect("stat must succeed");
            assert_eq!(stat.misses, 0, "every find so far was a hit");
            assert!(cache.find(b"index.tpl").expect("find must succeed").is_none());
        }
    }

    /// Dropping the lease is what unpins: holding it across a gc keeps
    /// the entry alive even when the limits say otherwise.
    #[test]
    fn test_lease_pins_across_gc() {
        let cache = Cache::in_process(Limits::none().with_max_entries(0).with_max_size(1));

        cache.add(b"big", &[0u8; 64]).expect("add must succeed");

        let lease = cache
            .find(b"big")
            .expect("find must succeed")
            .expect("must be found");
        assert_eq!(cache.gc().expect("gc must succeed"), 0);

        drop(lease);
        assert_eq!(cache.gc().expect("gc must succeed"), 1);
    }

    /// Explicit release on top of the lease's own release saturates
    /// instead of corrupting the count.
    #[test]
    #[cfg(not(debug_assertions))]
    fn test_over_release_saturates() {
        let cache = Cache::in_process(Limits::none());

        cache.add(b"k", b"v").expect("add must succeed");
        let lease = cache
            .find(b"k")
            .expect("find must succeed")
            .expect("must be found");
        lease.release();

        // The lease already released; this one is the caller bug the
        // contract tolerates.
        cache.release(b"k");
        assert_eq!(cache.stat().expect("stat must succeed").pinned, 0);

        // The entry is evictable exactly once unpinned, no more.
        cache.reset().expect("reset must succeed");
        assert_eq!(cache.stat().expect("stat must succeed").current_entries, 0);
    }

    /// Releasing a key nothing knows about returns normally on every
    /// backend.
    #[test]
    fn test_release_missing_is_noop() {
        let dir = tempfile::tempdir().expect("tempdir must succeed");

        for cache in all_backends(&dir) {
            cache.release(b"missing");
            assert_eq!(cache.stat().expect("stat must succeed").pinned, 0);
        }
    }

    /// `hits + misses` equals the number of `find` calls issued.
    #[test]
    fn test_stat_counts_finds() {
        let dir = tempfile::tempdir().expect("tempdir must succeed");

        for cache in all_backends(&dir) {
            cache.add(b"present", b"m").expect("add must succeed");

            for _ in 0..3 {
                cache
                    .find(b"present")
                    .expect("find must succeed")
                    .expect("must be found");
            }
            for _ in 0..2 {
                assert!(cache.find(b"absent").expect("find must succeed").is_none());
            }

            let stat = cache.stat().expect("stat must succeed");
            assert_eq!(stat.hits, 3);
            assert_eq!(stat.misses, 2);
        }
    }
}
