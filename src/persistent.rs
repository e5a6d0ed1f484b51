//! The durable backend: a thin adapter over an embedded ordered
//! byte-string store.  Collision handling, page management, and
//! transactions are the store's problem; this module only decides what
//! a row means.
//!
//! Rows map `key → [created_at (8 bytes LE) | payload]`.  The stored
//! timestamp drives age expiry; pinning has no meaning to the store, so
//! refcounts (and a best-effort `last_access` for recency ordering)
//! live in an in-process shadow table.  Every operation serialises on
//! the shadow mutex, so a sweep can never delete a row that a
//! concurrent `find` in this process just pinned.  Pins held by *other*
//! processes are invisible here by construction; the shadow table is
//! process-local.
//!
//! Store failures surface as `BackendIo` and are never retried
//! internally.
use std::collections::HashMap;
use std::path::Path;

use derivative::Derivative;
use parking_lot::Mutex;
use redb::ReadableTable;

use crate::config::Limits;
use crate::errors::{Error, Result};
use crate::stats::CacheStat;
use crate::sweep;
use crate::sweep::{Budget, Candidate};

const MODULES: redb::TableDefinition<&[u8], &[u8]> = redb::TableDefinition::new("modules");

/// Width of the `created_at` prefix on every row.
const ROW_HEADER: usize = 8;

/// Process-local view of pins and counters the store cannot hold.
#[derive(Debug, Default)]
struct Shadow {
    pins: HashMap<Vec<u8>, PinState>,
    hits: u64,
    misses: u64,
}

#[derive(Clone, Copy, Debug)]
struct PinState {
    refcount: u32,
    last_access: u64,
}

/// A crash-persistent cache of compiled modules.
#[derive(Derivative)]
#[derivative(Debug)]
pub(crate) struct PersistentCache {
    #[derivative(Debug = "ignore")]
    db: redb::Database,
    shadow: Mutex<Shadow>,
    limits: Limits,
}

fn encode_row(created_at: u64, payload: &[u8]) -> Vec<u8> {
    let mut row = Vec::with_capacity(ROW_HEADER + payload.len());
    row.extend_from_slice(&created_at.to_le_bytes());
    row.extend_from_slice(payload);
    row
}

/// Splits a row into its creation timestamp and payload.  Rows shorter
/// than the header cannot have been written by `add`.
fn decode_row(row: &[u8]) -> Result<(u64, &[u8])> {
    if row.len() < ROW_HEADER {
        return Err(Error::backend(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("store row of {} bytes is shorter than its header", row.len()),
        )));
    }

    let mut stamp = [0u8; ROW_HEADER];
    stamp.copy_from_slice(&row[..ROW_HEADER]);
    Ok((u64::from_le_bytes(stamp), &row[ROW_HEADER..]))
}

impl PersistentCache {
    /// Opens (creating if absent) the store at `path`.  The path must
    /// be writable.
    pub fn open(path: &Path, limits: Limits) -> Result<PersistentCache> {
        let db = redb::Database::create(path)
            .map_err(|e| Error::invalid(format!("cannot open store at {}: {}", path.display(), e)))?;

        // Create the schema up front so reads never race table
        // creation.
        let txn = db.begin_write().map_err(Error::backend)?;
        txn.open_table(MODULES).map_err(Error::backend)?;
        txn.commit().map_err(Error::backend)?;

        Ok(PersistentCache {
            db,
            shadow: Mutex::new(Shadow::default()),
            limits,
        })
    }

    /// Transactional read of `key`'s module; a hit is pinned in the
    /// shadow table until released.
    pub fn find(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut shadow = self.shadow.lock();

        let txn = self.db.begin_read().map_err(Error::backend)?;
        let table = txn.open_table(MODULES).map_err(Error::backend)?;
        let payload = match table.get(key).map_err(Error::backend)? {
            Some(row) => {
                let (_, payload) = decode_row(row.value())?;
                Some(payload.to_vec())
            }
            None => None,
        };

        match payload {
            Some(payload) => {
                shadow.hits += 1;
                let now = sweep::unix_micros();
                let pin = shadow.pins.entry(key.to_vec()).or_insert(PinState {
                    refcount: 0,
                    last_access: now,
                });
                pin.refcount += 1;
                pin.last_access = now;
                Ok(Some(payload))
            }
            None => {
                shadow.misses += 1;
                Ok(None)
            }
        }
    }

    /// Writes `key → module` in one transaction; a previously committed
    /// row for the same key fails the add and aborts the transaction.
    pub fn add(&self, key: &[u8], module: &[u8]) -> Result<()> {
        let _shadow = self.shadow.lock();

        let txn = self.db.begin_write().map_err(Error::backend)?;
        {
            let mut table = txn.open_table(MODULES).map_err(Error::backend)?;
            if table.get(key).map_err(Error::backend)?.is_some() {
                // Dropping the transaction aborts it.
                return Err(Error::DuplicateKey);
            }

            let row = encode_row(sweep::unix_micros(), module);
            table.insert(key, row.as_slice()).map_err(Error::backend)?;
        }
        txn.commit().map_err(Error::backend)?;
        Ok(())
    }

    /// Scans the rows, plans a sweep, and deletes the victims in one
    /// transaction.  `unconditional` ignores the limits and removes
    /// every unpinned row (the `reset` semantics).
    fn sweep(&self, unconditional: bool) -> Result<usize> {
        let mut shadow = self.shadow.lock();

        let mut candidates = Vec::new();
        {
            let txn = self.db.begin_read().map_err(Error::backend)?;
            let table = txn.open_table(MODULES).map_err(Error::backend)?;
            for row in table.iter().map_err(Error::backend)? {
                let (key, value) = row.map_err(Error::backend)?;
                let key = key.value().to_vec();
                let (created_at, payload) = decode_row(value.value())?;
                let pin = shadow.pins.get(&key);
                candidates.push(Candidate {
                    size: payload.len() as u64,
                    created_at,
                    // Recency is process-local best effort; rows never
                    // seen by this process count as untouched since
                    // creation.
                    last_access: pin.map_or(created_at, |p| p.last_access),
                    pinned: pin.is_some_and(|p| p.refcount > 0),
                    token: key,
                });
            }
        }

        let victims = if unconditional {
            candidates
                .into_iter()
                .filter(|c| !c.pinned)
                .map(|c| c.token)
                .collect::<Vec<_>>()
        } else {
            sweep::plan(
                candidates,
                self.limits.max_age,
                Budget::from_limits(&self.limits),
                sweep::unix_micros(),
            )
        };
        if victims.is_empty() {
            return Ok(0);
        }

        let txn = self.db.begin_write().map_err(Error::backend)?;
        {
            let mut table = txn.open_table(MODULES).map_err(Error::backend)?;
            for key in &victims {
                table.remove(key.as_slice()).map_err(Error::backend)?;
            }
        }
        txn.commit().map_err(Error::backend)?;

        // Deleted rows were unpinned, so any shadow record they left
        // behind is just a stale last_access.
        for key in &victims {
            shadow.pins.remove(key);
        }

        tracing::debug!(removed = victims.len(), "durable store sweep");
        Ok(victims.len())
    }

    /// Applies the configured limits and returns the number of rows
    /// removed.
    pub fn gc(&self) -> Result<usize> {
        self.sweep(false)
    }

    /// Unpins one reference on `key`'s entry, saturating at zero.
    pub fn release(&self, key: &[u8]) {
        let mut shadow = self.shadow.lock();

        match shadow.pins.get_mut(key) {
            Some(pin) if pin.refcount > 0 => pin.refcount -= 1,
            Some(_) => {
                debug_assert!(false, "release without a matching find");
                tracing::warn!("release without a matching find; refcount stays at zero");
            }
            // An unknown key is indistinguishable from one whose row
            // and pin record were already swept; stay quiet.
            None => {}
        }
    }

    /// Removes every unpinned row, regardless of limits.
    pub fn reset(&self) -> Result<()> {
        self.sweep(true)?;
        Ok(())
    }

    pub fn stat(&self) -> Result<CacheStat> {
        let shadow = self.shadow.lock();

        let txn = self.db.begin_read().map_err(Error::backend)?;
        let table = txn.open_table(MODULES).map_err(Error::backend)?;

        let mut entries = 0usize;
        let mut size = 0u64;
        for row in table.iter().map_err(Error::backend)? {
            let (_, value) = row.map_err(Error::backend)?;
            let (_, payload) = decode_row(value.value())?;
            entries += 1;
            size += payload.len() as u64;
        }

        Ok(CacheStat {
            backend: "durable",
            hits: shadow.hits,
            misses: shadow.misses,
            current_entries: entries,
            current_size: size,
            current_data_size: size,
            pinned: shadow.pins.values().filter(|p| p.refcount > 0).count(),
            // The store owns its pages; totals and table accounting
            // are dynamic.
            ..CacheStat::default()
        })
    }
}
