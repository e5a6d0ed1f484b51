//! The shared-memory backend: a fixed-size mapped region holding a
//! header, a fixed-capacity open-addressing table, and a bump-allocated
//! data arena, attachable by any number of processes.
//!
//! Everything mutable lives inside the region and is touched only while
//! the header's lock word is held, so all operations are linearizable
//! across every attached process.  Cache operations are short relative
//! to template execution, which happens after `find` returns and the
//! lock is released, so a single region-wide critical section is the
//! right trade.
//!
//! The table never grows: running out of slots is a capacity condition
//! handled by eviction.  The arena never reclaims individual
//! allocations; its cursor rewinds only when a sweep leaves the table
//! empty, and an `add` that still cannot fit after a forced sweep fails
//! with `CacheFull`.  That trades fragmentation for simplicity.
//!
//! A process that dies while holding the lock word wedges the region,
//! and one that dies holding a pin leaves that entry unevictable.
//! Neither is auto-healed; the recovery path is deleting the region
//! file.
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use derivative::Derivative;
use memmap2::MmapRaw;

use crate::config::Limits;
use crate::errors::{Error, Result};
use crate::hash::{fnv1a, SlotHash};
use crate::layout::{
    self, Header, Slot, SLOT_EMPTY, SLOT_LIVE, SLOT_TOMBSTONE, STATE_BUILDING, STATE_RAW,
    STATE_READY,
};
use crate::stats::CacheStat;
use crate::sweep::{self, Budget, Candidate};

/// Placement parameters are derived at compile time so every attached
/// process agrees on slot assignment.
const PLACEMENT: SlotHash = SlotHash::new_keyed(b"module cache slot placement");

/// How long an attach waits for another process to finish initialising
/// the region before giving up.  A builder that died mid-initialisation
/// would otherwise wedge every attach forever.
const BUILD_WAIT: Duration = Duration::from_secs(5);

/// A cache of compiled modules in a file-backed shared memory region.
#[derive(Derivative)]
#[derivative(Debug)]
pub(crate) struct RegionCache {
    path: PathBuf,
    limits: Limits,
    total_size: u64,
    slot_count: usize,
    arena_size: u64,
    #[derivative(Debug = "ignore")]
    map: MmapRaw,
    // Process-local countdown; when it runs out, the next `add`
    // piggybacks an age-expiry sweep.  Randomised so independent
    // processes don't all sweep in lockstep.
    #[derivative(Debug = "ignore")]
    age_countdown: AtomicU64,
}

/// Holds the region's lock word; releases it on drop.
struct RegionGuard<'a> {
    lock: &'a AtomicU32,
}

impl Drop for RegionGuard<'_> {
    fn drop(&mut self) {
        self.lock.store(0, Ordering::Release);
    }
}

impl RegionCache {
    /// Creates the region at `path`, or attaches to it if another
    /// process already created it.  `total_size` and `entries` are fixed
    /// for the region's lifetime; attaching with a different geometry
    /// than the region carries fails with `CorruptedRegion`.
    pub fn attach(path: &Path, total_size: u64, entries: usize, limits: Limits) -> Result<RegionCache> {
        if entries == 0 {
            return Err(Error::invalid("shared region needs at least one entry slot"));
        }
        let min_size = layout::region_size(entries, 1);
        if total_size < min_size {
            return Err(Error::invalid(format!(
                "a region with {} slots needs at least {} bytes, got {}",
                entries, min_size, total_size
            )));
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| Error::invalid(format!("cannot open region file {}: {}", path.display(), e)))?;

        let len = file.metadata()?.len();
        if len == 0 {
            file.set_len(total_size)?;
        } else if len != total_size {
            return Err(Error::CorruptedRegion(format!(
                "region file {} holds {} bytes; expected {}",
                path.display(),
                len,
                total_size
            )));
        }

        let map = MmapRaw::map_raw(&file)?;
        let arena_size = total_size - layout::region_size(entries, 0);
        let cache = RegionCache {
            path: path.to_owned(),
            limits,
            total_size,
            slot_count: entries,
            arena_size,
            map,
            age_countdown: AtomicU64::new(1),
        };
        cache.reseed_age_countdown();
        cache.handshake()?;
        Ok(cache)
    }

    /// Initialises a raw region, or waits for the initialiser and
    /// validates the result.
    fn handshake(&self) -> Result<()> {
        let header = self.header();
        let won = header
            .state
            .compare_exchange(STATE_RAW, STATE_BUILDING, Ordering::Acquire, Ordering::Acquire)
            .is_ok();

        if won {
            // SAFETY: we hold the BUILDING state, so no other process
            // reads the plain header fields until the READY publish
            // below; the mapping is at least HEADER_SIZE bytes.
            unsafe {
                let h = self.map.as_mut_ptr().cast::<Header>();
                (*h).magic = layout::MAGIC;
                (*h).version = layout::VERSION;
                (*h).total_size = self.total_size;
                (*h).slot_count = self.slot_count as u64;
                (*h).arena_size = self.arena_size;
            }
            header.state.store(STATE_READY, Ordering::Release);
            tracing::debug!(
                path = %self.path.display(),
                slots = self.slot_count,
                arena = self.arena_size,
                "initialised shared cache region"
            );
            return Ok(());
        }

        let deadline = std::time::Instant::now() + BUILD_WAIT;
        let mut state = header.state.load(Ordering::Acquire);
        while state == STATE_BUILDING {
            if std::time::Instant::now() > deadline {
                return Err(Error::CorruptedRegion(
                    "region initialisation never completed".to_string(),
                ));
            }
            std::thread::yield_now();
            state = header.state.load(Ordering::Acquire);
        }
        if state != STATE_READY {
            return Err(Error::CorruptedRegion(format!(
                "unrecognised region initialisation state {}",
                state
            )));
        }

        header
            .validate(self.total_size, self.slot_count as u64)
            .map_err(Error::CorruptedRegion)?;
        tracing::debug!(path = %self.path.display(), "attached to shared cache region");
        Ok(())
    }

    fn header(&self) -> &Header {
        // SAFETY: the mapping is at least HEADER_SIZE bytes, the base is
        // page-aligned, and every mutable header field is an atomic, so
        // a shared reference is sound even while other processes write.
        unsafe { &*(self.map.as_ptr() as *const Header) }
    }

    fn slot_ptr(&self, index: usize) -> *mut Slot {
        debug_assert!(index < self.slot_count);
        // SAFETY: index < slot_count, and the table spans
        // [HEADER_SIZE, HEADER_SIZE + slot_count * SLOT_SIZE) within the
        // mapping.
        unsafe {
            self.map
                .as_mut_ptr()
                .add(layout::table_offset())
                .cast::<Slot>()
                .add(index)
        }
    }

    /// Key bytes of a live slot.  Caller must hold the region lock.
    fn key_bytes(&self, slot: &Slot) -> &[u8] {
        // SAFETY: live slots point at arena bytes written before the
        // slot went live; offsets are region-base-relative and bounded
        // by the arena.
        unsafe {
            std::slice::from_raw_parts(
                self.map.as_ptr().add(slot.key_off as usize),
                slot.key_len as usize,
            )
        }
    }

    /// Acquires the region-wide lock word.
    fn lock(&self) -> RegionGuard<'_> {
        let lock = &self.header().lock;
        let mut spins: u32 = 0;
        while lock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spins = spins.wrapping_add(1);
            if spins % 64 == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
        RegionGuard { lock }
    }

    /// Probes for the live slot holding `key`.  Caller must hold the
    /// region lock.  Counts every probe step beyond the first as a
    /// collision.
    fn probe_live(&self, digest: u64, key: &[u8]) -> Option<usize> {
        let header = self.header();
        let home = PLACEMENT.slot(digest, self.slot_count);

        for step in 0..self.slot_count {
            if step > 0 {
                header.collisions.fetch_add(1, Ordering::Relaxed);
            }

            let index = (home + step) % self.slot_count;
            // SAFETY: index is in bounds and the lock is held.
            let slot = unsafe { &*self.slot_ptr(index) };
            match slot.state {
                SLOT_EMPTY => return None,
                SLOT_TOMBSTONE => continue,
                _ => {
                    if slot.digest == digest
                        && slot.key_len as usize == key.len()
                        && self.key_bytes(slot) == key
                    {
                        return Some(index);
                    }
                }
            }
        }

        None
    }

    /// First reusable (empty or tombstoned) slot on `digest`'s probe
    /// path, or None when every slot on it is live.  Caller must hold
    /// the region lock.
    fn probe_free(&self, digest: u64) -> Option<usize> {
        let home = PLACEMENT.slot(digest, self.slot_count);

        for step in 0..self.slot_count {
            let index = (home + step) % self.slot_count;
            // SAFETY: index is in bounds and the lock is held.
            let state = unsafe { (*self.slot_ptr(index)).state };
            if state != SLOT_LIVE {
                return Some(index);
            }
        }

        None
    }

    /// Tombstones the live slot at `index` and updates the shared
    /// accounting.  Caller must hold the region lock.
    fn evict_slot(&self, index: usize) {
        let header = self.header();
        // SAFETY: index is in bounds and the lock is held.
        unsafe {
            let slot = self.slot_ptr(index);
            header
                .live_size
                .fetch_sub((*slot).payload_len as u64, Ordering::Relaxed);
            (*slot).state = SLOT_TOMBSTONE;
        }
        header.live_entries.fetch_sub(1, Ordering::Relaxed);
    }

    /// Once nothing is live there are no probe chains to preserve and
    /// no arena bytes anyone can still reach: clear the tombstones and
    /// rewind the arena.  Caller must hold the region lock.
    fn rewind_if_empty(&self) {
        let header = self.header();
        if header.live_entries.load(Ordering::Relaxed) != 0 {
            return;
        }

        for index in 0..self.slot_count {
            // SAFETY: index is in bounds and the lock is held.
            unsafe { (*self.slot_ptr(index)).state = SLOT_EMPTY };
        }
        header.arena_cursor.store(0, Ordering::Relaxed);
    }

    /// Policy sweep over the live slots.  Caller must hold the region
    /// lock.
    fn sweep_locked(&self, budget: Budget, max_age: Duration) -> usize {
        let mut candidates = Vec::new();
        for index in 0..self.slot_count {
            // SAFETY: index is in bounds and the lock is held.
            let slot = unsafe { &*self.slot_ptr(index) };
            if slot.state == SLOT_LIVE {
                candidates.push(Candidate {
                    token: index,
                    size: slot.payload_len as u64,
                    created_at: slot.created_at,
                    last_access: slot.last_access,
                    pinned: slot.refcount > 0,
                });
            }
        }

        let victims = sweep::plan(candidates, max_age, budget, sweep::unix_micros());
        for &index in &victims {
            self.evict_slot(index);
        }
        self.rewind_if_empty();

        if !victims.is_empty() {
            tracing::debug!(removed = victims.len(), "shared region sweep");
        }
        victims.len()
    }

    /// Re-arms the amortised age-sweep countdown with a jittered period
    /// of roughly a quarter of the table size.
    fn reseed_age_countdown(&self) {
        use rand::Rng;

        let period = (self.slot_count as u64 / 4).max(1);
        let next = rand::thread_rng().gen_range(1..=2 * period);
        self.age_countdown.store(next, Ordering::Relaxed);
    }

    /// True roughly once per countdown period of `add` calls.
    fn age_sweep_due(&self) -> bool {
        match self.age_countdown.fetch_sub(1, Ordering::Relaxed) {
            1 => {
                self.reseed_age_countdown();
                true
            }
            0 => {
                // Lost a race past zero; re-arm without sweeping.
                self.reseed_age_countdown();
                false
            }
            _ => false,
        }
    }

    /// Returns the payload for `key`, pinned until released.  The
    /// returned slice stays valid for the life of this handle: a pinned
    /// entry is never evicted, allocation only moves the cursor
    /// forward, and the cursor rewinds only when the table is empty,
    /// which a pinned entry prevents.
    pub fn find(&self, key: &[u8]) -> Option<&[u8]> {
        let digest = fnv1a(key);
        let _guard = self.lock();
        let header = self.header();

        match self.probe_live(digest, key) {
            Some(index) => {
                // SAFETY: probe_live returned a live in-bounds slot and
                // the lock is held.
                unsafe {
                    let slot = self.slot_ptr(index);
                    (*slot).refcount += 1;
                    (*slot).last_access = sweep::unix_micros();
                    header.hits.fetch_add(1, Ordering::Relaxed);
                    Some(std::slice::from_raw_parts(
                        self.map.as_ptr().add((*slot).payload_off as usize),
                        (*slot).payload_len as usize,
                    ))
                }
            }
            None => {
                header.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Copies `key` and `module` into the region.  Makes room by forced
    /// sweeps when the table or arena is full; fails with `CacheFull`
    /// when the unpinned population cannot yield enough.
    pub fn add(&self, key: &[u8], module: &[u8]) -> Result<()> {
        if key.len() > u32::MAX as usize || module.len() > u32::MAX as usize {
            return Err(Error::CacheFull);
        }

        let digest = fnv1a(key);
        let _guard = self.lock();
        let header = self.header();

        if self.probe_live(digest, key).is_some() {
            return Err(Error::DuplicateKey);
        }

        // A full probe path means the table itself is out of room:
        // sweep down to one spare slot, then look again.
        let mut free = self.probe_free(digest);
        if free.is_none() {
            if self.slot_count > 1 {
                self.sweep_locked(
                    Budget::from_limits(&self.limits).cap_entries(self.slot_count - 1),
                    self.limits.max_age,
                );
            } else {
                // A budget of zero entries would mean "unbounded", so a
                // single-slot table evicts its lone entry directly.
                // SAFETY: slot 0 is live (the probe found no free slot)
                // and the lock is held.
                if unsafe { (*self.slot_ptr(0)).refcount == 0 } {
                    self.evict_slot(0);
                    self.rewind_if_empty();
                }
            }
            free = self.probe_free(digest);
        }
        let free = match free {
            Some(index) => index,
            None => return Err(Error::CacheFull),
        };

        let need = (key.len() + module.len()) as u64;
        let mut cursor = header.arena_cursor.load(Ordering::Relaxed);
        if cursor + need > self.arena_size {
            // No per-entry reclaim: the sweep only helps if it empties
            // the table and rewinds the cursor.
            self.sweep_locked(Budget::from_limits(&self.limits), self.limits.max_age);
            cursor = header.arena_cursor.load(Ordering::Relaxed);
            if cursor + need > self.arena_size {
                return Err(Error::CacheFull);
            }
        }

        let key_off = layout::arena_offset(self.slot_count) as u64 + cursor;
        let payload_off = key_off + key.len() as u64;
        // SAFETY: [key_off, key_off + need) lies within the arena (the
        // cursor check above), and the lock is held.
        unsafe {
            std::ptr::copy_nonoverlapping(
                key.as_ptr(),
                self.map.as_mut_ptr().add(key_off as usize),
                key.len(),
            );
            std::ptr::copy_nonoverlapping(
                module.as_ptr(),
                self.map.as_mut_ptr().add(payload_off as usize),
                module.len(),
            );
        }
        header.arena_cursor.store(cursor + need, Ordering::Relaxed);

        let now = sweep::unix_micros();
        // SAFETY: `free` is a non-live in-bounds slot and the lock is
        // held.
        unsafe {
            *self.slot_ptr(free) = Slot {
                digest,
                key_off,
                payload_off,
                created_at: now,
                last_access: now,
                key_len: key.len() as u32,
                payload_len: module.len() as u32,
                refcount: 0,
                state: SLOT_LIVE,
                _pad: [0; 8],
            };
        }
        header.live_entries.fetch_add(1, Ordering::Relaxed);
        header.live_size.fetch_add(module.len() as u64, Ordering::Relaxed);

        // Keep configured bounds tight without waiting for an explicit
        // gc call.
        let over_entries = self.limits.max_entries > 0
            && header.live_entries.load(Ordering::Relaxed) > self.limits.max_entries as u64;
        let over_size = self.limits.max_size > 0
            && header.live_size.load(Ordering::Relaxed) > self.limits.max_size;
        if over_entries || over_size {
            self.sweep_locked(Budget::from_limits(&self.limits), self.limits.max_age);
        }

        // Amortised expiry: age violations don't threaten capacity, so
        // they are swept roughly once per countdown period instead of on
        // every insert.
        if !self.limits.max_age.is_zero() && self.age_sweep_due() {
            self.sweep_locked(Budget::default(), self.limits.max_age);
        }

        Ok(())
    }

    /// Applies the configured limits and returns the number of entries
    /// removed.
    pub fn gc(&self) -> usize {
        let _guard = self.lock();
        self.sweep_locked(Budget::from_limits(&self.limits), self.limits.max_age)
    }

    /// Unpins one reference on `key`'s entry, saturating at zero.
    pub fn release(&self, key: &[u8]) {
        let digest = fnv1a(key);
        let _guard = self.lock();

        if let Some(index) = self.probe_live(digest, key) {
            // SAFETY: live in-bounds slot, lock held.
            unsafe {
                let slot = self.slot_ptr(index);
                if (*slot).refcount > 0 {
                    (*slot).refcount -= 1;
                } else {
                    debug_assert!(false, "release without a matching find");
                    tracing::warn!("release without a matching find; refcount stays at zero");
                }
            }
        }
    }

    /// Drops every unpinned entry, regardless of limits.
    pub fn reset(&self) {
        let _guard = self.lock();

        for index in 0..self.slot_count {
            // SAFETY: index is in bounds and the lock is held.
            let evict = unsafe {
                let slot = self.slot_ptr(index);
                (*slot).state == SLOT_LIVE && (*slot).refcount == 0
            };
            if evict {
                self.evict_slot(index);
            }
        }
        self.rewind_if_empty();
    }

    pub fn stat(&self) -> CacheStat {
        let _guard = self.lock();
        let header = self.header();

        let mut pinned = 0;
        for index in 0..self.slot_count {
            // SAFETY: index is in bounds and the lock is held.
            let slot = unsafe { &*self.slot_ptr(index) };
            if slot.state == SLOT_LIVE && slot.refcount > 0 {
                pinned += 1;
            }
        }

        CacheStat {
            backend: "shared-memory",
            hits: header.hits.load(Ordering::Relaxed),
            misses: header.misses.load(Ordering::Relaxed),
            current_entries: header.live_entries.load(Ordering::Relaxed) as usize,
            total_entries: self.slot_count,
            current_size: header.live_size.load(Ordering::Relaxed),
            total_size: self.total_size,
            current_table_size: header.live_entries.load(Ordering::Relaxed)
                * layout::SLOT_SIZE as u64,
            total_table_size: (self.slot_count * layout::SLOT_SIZE) as u64,
            current_data_size: header.arena_cursor.load(Ordering::Relaxed),
            total_data_size: self.arena_size,
            collisions: header.collisions.load(Ordering::Relaxed),
            pinned,
        }
    }
}
