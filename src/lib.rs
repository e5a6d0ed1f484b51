//! A cache of compiled template modules that sits between the template
//! compiler and the interpreter: compiling a template on every render
//! is wasteful, so the integration layer `add`s the compiled bytes
//! under a caller-chosen key (typically derived from the template
//! source or path) and the interpreter `find`s them back on later
//! renders.  The cache treats the module as opaque bytes; it never
//! inspects what it stores.
//!
//! One contract, three interchangeable storage strategies, chosen at
//! construction time and invisible afterwards:
//!
//! - [`Cache::in_process`] keeps entries in a growable process-local
//!   table with no capacity bound.  Entries are only removed by
//!   explicit [`Cache::gc`]/[`Cache::reset`] calls.  The right choice
//!   for ephemeral or unbounded template sets where memory growth is
//!   acceptable.
//! - [`Cache::shared_region`] lays a fixed-size cache out in a mapped
//!   file (header, fixed-capacity hash table, bump-allocated data
//!   arena) that any number of processes attach to concurrently.
//!   Capacity is fixed at construction; overflow is handled by evicting
//!   the least recently accessed unpinned entries, never by growing.
//! - [`Cache::persistent`] adapts an embedded transactional key-value
//!   store for crash-persistent caching across process restarts.
//!
//! Entries are *pinned* while in use: [`Cache::find`] returns a
//! [`Lease`] whose existence keeps the entry's refcount non-zero, and
//! no sweep, not even [`Cache::reset`], removes a pinned entry.  The
//! interpreter can therefore execute a module without fearing eviction
//! mid-render, and drops the lease when done.  Retention is otherwise
//! governed by [`Limits`]: age expiry first, then least recently
//! accessed first until the entry-count and byte-size bounds hold.
//!
//! # Sample usage
//!
//! The compile-or-reuse flow the engine integration runs per render:
//!
//! ```no_run
//! use tmpl_module_cache::{Cache, Limits};
//!
//! # fn compile(_: &[u8]) -> Vec<u8> { Vec::new() }
//! # fn execute(_: &[u8]) {}
//! # fn main() -> tmpl_module_cache::Result<()> {
//! let cache = Cache::in_process(Limits::none());
//!
//! let key = b"views/index.tpl";
//! if cache.find(key)?.is_none() {
//!     let module = compile(key);
//!     // A concurrent render may have won the race; a duplicate or
//!     // full cache just means "don't cache this one".
//!     let _ = cache.add(key, &module);
//! }
//!
//! if let Some(module) = cache.find(key)? {
//!     execute(&module); // runs while the entry is pinned
//! } // lease dropped: pin released
//! # Ok(())
//! # }
//! ```
//!
//! Several worker processes sharing one region:
//!
//! ```no_run
//! use tmpl_module_cache::{region_size, Cache, Limits};
//!
//! # fn main() -> tmpl_module_cache::Result<()> {
//! // 1024 table slots plus 8 MiB of module arena.  Every process that
//! // constructs against the same path attaches to the same region and
//! // must pass the same geometry.
//! let cache = Cache::shared_region(
//!     "/var/cache/templates.region",
//!     region_size(1024, 8 << 20),
//!     1024,
//!     Limits::none().with_max_age(std::time::Duration::from_secs(600)),
//! )?;
//! # let _ = cache;
//! # Ok(())
//! # }
//! ```
//!
//! # Error handling
//!
//! [`Error::DuplicateKey`] and [`Error::CacheFull`] are per-render
//! conditions: fall back to direct compilation and move on.
//! [`Error::CorruptedRegion`] and [`Error::InvalidConfiguration`] are
//! construction-time failures worth aborting startup for.
//! [`Error::BackendIo`] carries failures of the durable backend's
//! store verbatim; nothing is retried internally.
//!
//! # Crash robustness
//!
//! The shared region's lock and refcounts live inside the region, so a
//! process that dies while holding them leaves the region wedged or the
//! entry unevictable.  This is a deliberate, documented limitation of
//! the design (see DESIGN.md); the recovery path is deleting the region
//! file.

mod cache;
mod config;
mod errors;
mod hash;
mod heap;
mod layout;
mod persistent;
mod region;
mod stats;
mod sweep;

pub use cache::Cache;
pub use cache::Lease;
pub use config::Limits;
pub use errors::Error;
pub use errors::Result;
pub use layout::region_size;
pub use stats::CacheStat;
