//! Failures are reported synchronously from the operation that detects
//! them, and never retried internally.  A failed `add` leaves the cache
//! unchanged: no partial entry is ever visible to other threads or
//! processes.
//!
//! Callers integrating the cache into a template pipeline should treat
//! `DuplicateKey` and `CacheFull` as "skip caching for this render" and
//! fall back to direct compilation; `CorruptedRegion` and
//! `InvalidConfiguration` are construction-time failures and appropriate
//! to abort initialisation on.
use thiserror::Error;

/// Alias for `std::result::Result` with this crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// The closed set of ways a cache operation can fail.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// `add` was called for a key that is already occupied.  The caller
    /// must wait for the old entry to be evicted (or `reset` the cache)
    /// before re-adding.
    #[error("key is already present in the cache")]
    DuplicateKey,

    /// A capacity-bounded backend could not make room: every eviction
    /// candidate is pinned, or the data arena is exhausted beyond what a
    /// forced sweep can recover.
    #[error("cache is full and eviction could not free enough unpinned space")]
    CacheFull,

    /// The shared region's header failed validation on attach.  The file
    /// was written by an incompatible version, sized with different
    /// geometry, or is not a cache region at all.
    #[error("shared region failed validation: {0}")]
    CorruptedRegion(String),

    /// An I/O or transaction failure in the backing store, surfaced
    /// verbatim.
    #[error("cache backend I/O failure: {0}")]
    BackendIo(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    /// The construction parameters cannot describe a usable cache:
    /// zero-sized region, zero entry count, or an unwritable path.
    #[error("invalid cache configuration: {0}")]
    InvalidConfiguration(String),
}

impl Error {
    /// Wraps an arbitrary backend failure in [`Error::BackendIo`].
    pub(crate) fn backend(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::BackendIo(Box::new(source))
    }

    /// Flags `source` as a construction-parameter problem.
    pub(crate) fn invalid(what: impl std::fmt::Display) -> Self {
        Error::InvalidConfiguration(what.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::backend(e)
    }
}
