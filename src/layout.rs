//! Persisted layout of the shared-memory region:
//! `[header][slot table][data arena]`.
//!
//! The region is mapped by independent processes, so every structure
//! here uses fixed-width fields, explicit padding, and `#[repr(C)]`, and
//! all intra-region references are plain byte offsets from the region
//! base, never process-local addresses.  The header carries a magic and
//! a version stamp so that an incompatible layout fails fast with
//! `CorruptedRegion` instead of being silently misread.
//!
//! Fields mutated after initialisation (the lock word, the arena cursor,
//! the statistics counters) are atomics; the geometry fields are written
//! once by whichever process wins the initialisation handshake and are
//! read-only from then on.
use std::sync::atomic::{AtomicU32, AtomicU64};

/// Identifies a file as a module-cache region.
pub(crate) const MAGIC: [u8; 8] = *b"TMODCA01";

/// Bumped on any incompatible change to `Header` or `Slot`.
pub(crate) const VERSION: u32 = 1;

/// Size of the fixed header at the start of the region.
pub(crate) const HEADER_SIZE: usize = 128;

/// Size of one hash-table slot.
pub(crate) const SLOT_SIZE: usize = 64;

/// `Header.state` values for the initialisation handshake.
pub(crate) const STATE_RAW: u32 = 0;
pub(crate) const STATE_BUILDING: u32 = 1;
pub(crate) const STATE_READY: u32 = 2;

/// `Slot.state` values.  A tombstone keeps probe chains intact after an
/// eviction; its slot is reusable by a later `add`.
pub(crate) const SLOT_EMPTY: u32 = 0;
pub(crate) const SLOT_LIVE: u32 = 1;
pub(crate) const SLOT_TOMBSTONE: u32 = 2;

/// Header at offset 0 of the region.  Fields are ordered 8-byte-aligned
/// first so `#[repr(C)]` introduces no implicit padding.
#[repr(C)]
pub(crate) struct Header {
    pub magic: [u8; 8],          // 0..8
    pub total_size: u64,         // 8..16
    pub slot_count: u64,         // 16..24
    pub arena_size: u64,         // 24..32
    pub arena_cursor: AtomicU64, // 32..40  bytes used within the arena
    pub hits: AtomicU64,         // 40..48
    pub misses: AtomicU64,       // 48..56
    pub collisions: AtomicU64,   // 56..64
    pub live_entries: AtomicU64, // 64..72
    pub live_size: AtomicU64,    // 72..80  sum of live payload sizes
    pub version: u32,            // 80..84
    pub state: AtomicU32,        // 84..88  initialisation handshake
    pub lock: AtomicU32,         // 88..92  region-wide exclusion word
    pub _pad: [u8; 36],          // 92..128
}

const _: () = assert!(std::mem::size_of::<Header>() == HEADER_SIZE);

/// One hash-table slot.  Key and payload bytes live in the arena; the
/// offsets are relative to the region base.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub(crate) struct Slot {
    pub digest: u64,      // 0..8   FNV-1a of the key
    pub key_off: u64,     // 8..16
    pub payload_off: u64, // 16..24
    pub created_at: u64,  // 24..32 microseconds since UNIX_EPOCH
    pub last_access: u64, // 32..40
    pub key_len: u32,     // 40..44
    pub payload_len: u32, // 44..48
    pub refcount: u32,    // 48..52
    pub state: u32,       // 52..56
    pub _pad: [u8; 8],    // 56..64
}

const _: () = assert!(std::mem::size_of::<Slot>() == SLOT_SIZE);

/// Offset of the slot table from the region base.
pub(crate) const fn table_offset() -> usize {
    HEADER_SIZE
}

/// Offset of the data arena from the region base.
pub(crate) const fn arena_offset(slot_count: usize) -> usize {
    HEADER_SIZE + slot_count * SLOT_SIZE
}

/// Total region size needed for a table of `entries` slots and
/// `arena_bytes` of payload arena.  Useful for sizing the region
/// argument of the shared-memory constructor.
pub const fn region_size(entries: usize, arena_bytes: u64) -> u64 {
    (HEADER_SIZE + entries * SLOT_SIZE) as u64 + arena_bytes
}

impl Header {
    /// Checks an attached, ready region against this process's expected
    /// geometry.  Returns the reason the region cannot be used, if any.
    pub fn validate(&self, total_size: u64, slot_count: u64) -> std::result::Result<(), String> {
        if self.magic != MAGIC {
            return Err("bad magic; not a module-cache region".to_string());
        }
        if self.version != VERSION {
            return Err(format!(
                "layout version {} is not the supported version {}",
                self.version, VERSION
            ));
        }
        if self.total_size != total_size {
            return Err(format!(
                "region holds {} bytes but {} were requested",
                self.total_size, total_size
            ));
        }
        if self.slot_count != slot_count {
            return Err(format!(
                "region holds {} slots but {} were requested",
                self.slot_count, slot_count
            ));
        }

        Ok(())
    }
}

/// Geometry helpers must agree with each other.
#[test]
fn test_geometry() {
    assert_eq!(table_offset(), HEADER_SIZE);
    assert_eq!(arena_offset(4), HEADER_SIZE + 4 * SLOT_SIZE);
    assert_eq!(region_size(4, 1024), (HEADER_SIZE + 4 * SLOT_SIZE) as u64 + 1024);
}

/// A freshly zeroed header is in the `STATE_RAW` handshake state and
/// does not validate.
#[test]
fn test_zeroed_header_is_raw() {
    use std::sync::atomic::Ordering;

    // SAFETY: Header is repr(C) with integer/atomic fields only; the
    // all-zero bit pattern is a valid value for every field.
    let header: Header = unsafe { std::mem::zeroed() };

    assert_eq!(header.state.load(Ordering::Relaxed), STATE_RAW);
    assert!(header.validate(0, 0).is_err());
}

/// Validation pinpoints each mismatch.
#[test]
fn test_validate_mismatches() {
    use std::sync::atomic::Ordering;

    // SAFETY: as above; all-zero is valid for every field.
    let mut header: Header = unsafe { std::mem::zeroed() };
    header.magic = MAGIC;
    header.version = VERSION;
    header.total_size = 4096;
    header.slot_count = 8;
    header.state.store(STATE_READY, Ordering::Relaxed);

    assert!(header.validate(4096, 8).is_ok());
    assert!(header.validate(8192, 8).unwrap_err().contains("bytes"));
    assert!(header.validate(4096, 16).unwrap_err().contains("slots"));

    header.version = VERSION + 1;
    assert!(header.validate(4096, 8).unwrap_err().contains("version"));

    header.magic = *b"NOTACACH";
    assert!(header.validate(4096, 8).unwrap_err().contains("magic"));
}
