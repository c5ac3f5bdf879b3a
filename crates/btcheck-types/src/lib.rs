//! Core type definitions for btcheck: block/row identifiers, the fixed page
//! layout, the entry (tuple) codec, and the cancellation context.
//!
//! The on-disk layout parsed here is a fixed external contract; these types
//! only read and (for test fixtures) write it, they never repair it.

use std::fmt;
use std::num::NonZeroU32;

pub mod cx;
pub mod entry;
pub mod page;

pub use entry::{Attr, AttrEncoding, Entry, EntryFlags, rle_compress, rle_decompress};
pub use page::{MetaPage, PageBuf, PageFlags, PageKind, Slot, SlotState, Special};

/// Fixed page size in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Size of the page header (version stamp, lower/upper bounds, special offset).
pub const PAGE_HEADER_SIZE: usize = 16;

/// Size of the per-page special area (sibling links, level, flags).
pub const SPECIAL_SIZE: usize = 16;

/// Size of one slot word in the item slot array.
pub const SLOT_SIZE: usize = 4;

/// Block number of the meta page.
pub const META_BLOCK: u32 = 0;

/// Magic number stored in the meta page.
pub const META_MAGIC: u32 = 0x42_54_43_4B;

/// Current on-disk format version.
pub const FORMAT_VERSION: u32 = 4;

/// Oldest format version verification still understands.
pub const MIN_FORMAT_VERSION: u32 = 2;

/// First format version with the strict key-space discipline (every non-pivot
/// entry carries a tie-breaking row reference, making sort keys fully unique).
pub const STRICT_KEYSPACE_VERSION: u32 = 4;

/// Bytes of usable item space on a page.
pub const USABLE_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE - SPECIAL_SIZE;

/// Encoded size of a tie-breaking row reference within an entry.
pub const TIEBREAK_SIZE: usize = 6;

/// Upper bound on entry size for entries that already carry a tie-breaker,
/// and for legacy-format entries. A page must fit at least three of them.
pub const MAX_ENTRY_SIZE: usize = (USABLE_SIZE - 3 * SLOT_SIZE) / 3;

/// Upper bound on entry size when space must stay reserved for a tie-breaker
/// to be appended later (leaf entries and truncation-produced pivots under
/// the strict key-space format).
pub const MAX_ENTRY_SIZE_RESERVED: usize = MAX_ENTRY_SIZE - TIEBREAK_SIZE;

/// Hard cap on slot count: every item needs a slot word plus at least an
/// entry header.
pub const MAX_ITEMS_PER_PAGE: u16 = (USABLE_SIZE / (SLOT_SIZE + entry::ENTRY_HEADER_SIZE)) as u16;

/// A 1-based item offset within a page. Offset 1 is the high key on pages
/// that have one.
pub type ItemOffset = u16;

/// Identifier of one tree block. Block 0 is the meta page and is never the
/// target of a sibling link or downlink, so the niche is free for `Option`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(NonZeroU32);

impl BlockId {
    /// Construct from a raw block number; zero means "no block".
    pub const fn new(raw: u32) -> Option<Self> {
        match NonZeroU32::new(raw) {
            Some(n) => Some(Self(n)),
            None => None,
        }
    }

    /// The raw block number.
    pub const fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to a row of the primary table, used as the tie-breaking key
/// attribute of non-pivot entries. Ordering is (block, slot), matching the
/// physical order a table scan produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowId {
    pub block: u32,
    pub slot: u16,
}

impl RowId {
    pub const fn new(block: u32, slot: u16) -> Self {
        Self { block, slot }
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.block, self.slot)
    }
}
