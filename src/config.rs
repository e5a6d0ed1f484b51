//! Retention limits shared by every backend.  Each bound uses zero to
//! mean "unbounded", mirroring the way the cache is configured from
//! engine-level knobs where zero disables a limit.
use std::time::Duration;

/// Retention policy for a cache instance, applied by [`gc`] sweeps (and,
/// for the shared-memory backend, by the room-making sweeps that run
/// inside `add`).
///
/// [`gc`]: crate::Cache::gc
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Limits {
    /// Maximum time to keep an entry, measured from its creation.
    /// `Duration::ZERO` disables age-based expiry.
    pub max_age: Duration,

    /// Maximum number of live entries.  Zero disables the count bound.
    pub max_entries: usize,

    /// Maximum total payload bytes across live entries.  Zero disables
    /// the size bound.
    pub max_size: u64,
}

impl Limits {
    /// Fully unbounded limits: nothing is ever evicted by policy.
    pub const fn none() -> Limits {
        Limits {
            max_age: Duration::ZERO,
            max_entries: 0,
            max_size: 0,
        }
    }

    /// Returns these limits with `max_age` set.
    pub const fn with_max_age(mut self, max_age: Duration) -> Limits {
        self.max_age = max_age;
        self
    }

    /// Returns these limits with `max_entries` set.
    pub const fn with_max_entries(mut self, max_entries: usize) -> Limits {
        self.max_entries = max_entries;
        self
    }

    /// Returns these limits with `max_size` set.
    pub const fn with_max_size(mut self, max_size: u64) -> Limits {
        self.max_size = max_size;
        self
    }
}
