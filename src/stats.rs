//! Counters exposed by [`stat`].  The snapshot is taken under the same
//! exclusion as mutations, so the fields are mutually consistent: a
//! reader never observes, say, `current_entries` from before an eviction
//! together with `current_size` from after it.
//!
//! Backends that allocate dynamically (in-process, durable) report zero
//! for the `total_*` fields; only the fixed-geometry shared-memory
//! backend can fill them in.
//!
//! [`stat`]: crate::Cache::stat

/// A consistent snapshot of one cache instance's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct CacheStat {
    /// Name of the backing strategy ("in-process", "shared-memory",
    /// "durable").
    pub backend: &'static str,

    /// Number of `find` calls that returned an entry.
    pub hits: u64,

    /// Number of `find` calls that returned nothing.
    pub misses: u64,

    /// Live entries right now.
    pub current_entries: usize,

    /// Fixed entry capacity, or zero for dynamic allocation.
    pub total_entries: usize,

    /// Sum of payload sizes over live entries, in bytes.
    pub current_size: u64,

    /// Fixed total capacity in bytes, or zero for dynamic allocation.
    pub total_size: u64,

    /// Bytes of table currently holding live entries.
    pub current_table_size: u64,

    /// Fixed table size in bytes, or zero for dynamic allocation.
    pub total_table_size: u64,

    /// Bytes consumed from the data segment, including space owned by
    /// entries that have since been evicted but not reclaimed.
    pub current_data_size: u64,

    /// Fixed data segment size in bytes, or zero for dynamic allocation.
    pub total_data_size: u64,

    /// Occupied-slot conflicts resolved by probing to an alternate slot,
    /// across both lookups and placements.  Always zero for backends
    /// without a fixed hash table.
    pub collisions: u64,

    /// Entries currently pinned by an outstanding `find`.
    pub pinned: usize,
}
