//! Fixed page layout: header, slotted item array, special area, meta page.
//!
//! ```text
//! ┌───────────────────────────┐
//! │ Page header (16 B)        │  version stamp, lower/upper bounds
//! ├───────────────────────────┤
//! │ Slot array                │  (4 bytes per item, grows up to `lower`)
//! ├───────────────────────────┤
//! │ Unallocated space         │
//! ├───────────────────────────┤
//! │ Item area                 │  (grows down from `upper`)
//! ├───────────────────────────┤
//! │ Special area (16 B)       │  sibling links, level, flags
//! └───────────────────────────┘
//! ```
//!
//! All multi-byte integers are little-endian. Offsets into the slot array are
//! 1-based; offset 1 is the high key on pages that carry one. Accessors here
//! are deliberately permissive: they surface whatever the bytes say, and the
//! verification core decides what counts as corruption.

use bitflags::bitflags;
use btcheck_error::{Result, VerifyError};

use crate::{
    BlockId, FORMAT_VERSION, ItemOffset, META_MAGIC, MIN_FORMAT_VERSION, PAGE_HEADER_SIZE,
    PAGE_SIZE, SLOT_SIZE, SPECIAL_SIZE,
};

fn read_u16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn read_u32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn read_u64(b: &[u8], at: usize) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&b[at..at + 8]);
    u64::from_le_bytes(out)
}

bitflags! {
    /// Raw page status bits stored in the special area.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u16 {
        const LEAF = 0x0001;
        const ROOT = 0x0002;
        const DELETED = 0x0004;
        const HALF_DEAD = 0x0008;
        const META = 0x0010;
        const INCOMPLETE_SPLIT = 0x0020;
    }
}

/// Closed classification of a page's role, derived once from the raw flags
/// and then matched exhaustively. Rightmost and incomplete-split are
/// orthogonal facts kept on [`Special`], not variants here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Leaf,
    Internal,
    /// Mid-removal: may still be reachable through sibling links or a stale
    /// downlink. Only leaf pages are ever half-dead in supported formats.
    HalfDead,
    /// Fully removed: no remaining reference to it is legitimate.
    Deleted,
}

impl PageKind {
    pub const fn classify(flags: PageFlags) -> Self {
        if flags.contains(PageFlags::DELETED) {
            Self::Deleted
        } else if flags.contains(PageFlags::HALF_DEAD) {
            Self::HalfDead
        } else if flags.contains(PageFlags::LEAF) {
            Self::Leaf
        } else {
            Self::Internal
        }
    }

    /// Whether a level walk steps over this page without verifying it.
    pub const fn is_ignorable(self) -> bool {
        matches!(self, Self::Deleted | Self::HalfDead)
    }
}

/// Storage state of one slot, from the two state bits of the slot word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    /// Slot exists but has no storage. Never produced by the index.
    Unused = 0,
    /// Live item.
    Normal = 1,
    /// Redirection stub. Never produced by the index.
    Redirect = 2,
    /// Item superseded and awaiting reclamation; storage still present.
    Dead = 3,
}

/// One decoded slot word: 15 bits offset, 2 bits state, 15 bits length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub offset: u16,
    pub len: u16,
    pub state: SlotState,
}

impl Slot {
    pub const fn new(offset: u16, len: u16, state: SlotState) -> Self {
        Self { offset, len, state }
    }

    pub fn unpack(word: u32) -> Self {
        let state = match (word >> 15) & 0x3 {
            0 => SlotState::Unused,
            1 => SlotState::Normal,
            2 => SlotState::Redirect,
            _ => SlotState::Dead,
        };
        Self {
            offset: (word & 0x7fff) as u16,
            len: (word >> 17) as u16,
            state,
        }
    }

    pub fn pack(self) -> u32 {
        u32::from(self.offset & 0x7fff) | ((self.state as u32) << 15) | (u32::from(self.len) << 17)
    }
}

/// Parsed special area of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Special {
    pub left: Option<BlockId>,
    pub right: Option<BlockId>,
    pub level: u32,
    pub flags: PageFlags,
}

impl Special {
    /// A page is rightmost in its level when it has no right sibling.
    pub const fn is_rightmost(&self) -> bool {
        self.right.is_none()
    }

    pub const fn is_incomplete_split(&self) -> bool {
        self.flags.contains(PageFlags::INCOMPLETE_SPLIT)
    }

    pub const fn is_root(&self) -> bool {
        self.flags.contains(PageFlags::ROOT)
    }

    pub const fn kind(&self) -> PageKind {
        PageKind::classify(self.flags)
    }
}

/// A private, stable-for-the-duration copy of one page's bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageBuf {
    bytes: Vec<u8>,
}

impl PageBuf {
    /// Wrap a raw page copy. Returns `None` unless it is exactly one page.
    pub fn from_bytes(bytes: Vec<u8>) -> Option<Self> {
        (bytes.len() == PAGE_SIZE).then_some(Self { bytes })
    }

    /// A fresh page with no items and the given special-area contents.
    pub fn new_empty(special: Special) -> Self {
        let mut page = Self {
            bytes: vec![0; PAGE_SIZE],
        };
        page.set_lower(PAGE_HEADER_SIZE as u16);
        page.set_upper((PAGE_SIZE - SPECIAL_SIZE) as u16);
        page.set_special(special);
        page
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Raw mutable access, for fixture construction and corruption injection.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Page version stamp, set by whatever last modified the page.
    pub fn stamp(&self) -> u64 {
        read_u64(&self.bytes, 0)
    }

    pub fn set_stamp(&mut self, stamp: u64) {
        self.bytes[0..8].copy_from_slice(&stamp.to_le_bytes());
    }

    /// End of the slot array.
    pub fn lower(&self) -> u16 {
        read_u16(&self.bytes, 8)
    }

    fn set_lower(&mut self, lower: u16) {
        self.bytes[8..10].copy_from_slice(&lower.to_le_bytes());
    }

    /// Start of the item area.
    pub fn upper(&self) -> u16 {
        read_u16(&self.bytes, 10)
    }

    fn set_upper(&mut self, upper: u16) {
        self.bytes[10..12].copy_from_slice(&upper.to_le_bytes());
    }

    /// Number of slots present, from the header's lower bound. A corrupt
    /// lower bound yields a garbage count; callers bound it before trusting.
    pub fn slot_count(&self) -> u16 {
        let lower = (self.lower() as usize).saturating_sub(PAGE_HEADER_SIZE);
        (lower / SLOT_SIZE) as u16
    }

    /// Decode the slot at a 1-based item offset, if within the slot array.
    pub fn slot(&self, offset: ItemOffset) -> Option<Slot> {
        if offset == 0 || offset > self.slot_count() {
            return None;
        }
        let at = PAGE_HEADER_SIZE + (offset as usize - 1) * SLOT_SIZE;
        Some(Slot::unpack(read_u32(&self.bytes, at)))
    }

    /// Overwrite a slot word in place. Fixture/corruption use only.
    pub fn set_slot(&mut self, offset: ItemOffset, slot: Slot) {
        assert!(offset >= 1 && offset <= self.slot_count(), "slot exists");
        let at = PAGE_HEADER_SIZE + (offset as usize - 1) * SLOT_SIZE;
        self.bytes[at..at + SLOT_SIZE].copy_from_slice(&slot.pack().to_le_bytes());
    }

    /// Raw item bytes for a slot, without any corruption policing beyond
    /// staying inside the page buffer.
    pub fn item_bytes(&self, slot: Slot) -> Option<&[u8]> {
        let start = slot.offset as usize;
        let end = start.checked_add(slot.len as usize)?;
        self.bytes.get(start..end)
    }

    /// Append an item, assigning it the next slot. Returns its 1-based
    /// offset, or `None` if the page is full.
    pub fn push_item(&mut self, item: &[u8]) -> Option<ItemOffset> {
        let lower = self.lower() as usize;
        let upper = self.upper() as usize;
        if lower + SLOT_SIZE + item.len() > upper {
            return None;
        }
        let start = upper - item.len();
        self.bytes[start..upper].copy_from_slice(item);
        let slot = Slot::new(start as u16, item.len() as u16, SlotState::Normal);
        self.bytes[lower..lower + SLOT_SIZE].copy_from_slice(&slot.pack().to_le_bytes());
        self.set_lower((lower + SLOT_SIZE) as u16);
        self.set_upper(start as u16);
        Some(self.slot_count())
    }

    pub fn special(&self) -> Special {
        let at = PAGE_SIZE - SPECIAL_SIZE;
        Special {
            left: BlockId::new(read_u32(&self.bytes, at)),
            right: BlockId::new(read_u32(&self.bytes, at + 4)),
            level: read_u32(&self.bytes, at + 8),
            flags: PageFlags::from_bits_truncate(read_u16(&self.bytes, at + 12)),
        }
    }

    pub fn set_special(&mut self, special: Special) {
        let at = PAGE_SIZE - SPECIAL_SIZE;
        let s = &mut self.bytes[at..];
        s[0..4].copy_from_slice(&special.left.map_or(0, BlockId::get).to_le_bytes());
        s[4..8].copy_from_slice(&special.right.map_or(0, BlockId::get).to_le_bytes());
        s[8..12].copy_from_slice(&special.level.to_le_bytes());
        s[12..14].copy_from_slice(&special.flags.bits().to_le_bytes());
    }
}

/// Parsed meta page (block 0): format identity plus root bookkeeping.
///
/// The true root and level are authoritative. The fast root may lag behind
/// after deletions empty out upper levels; a mismatch is harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaPage {
    pub version: u32,
    pub key_atts: u16,
    pub root: Option<BlockId>,
    pub root_level: u32,
    pub fast_root: Option<BlockId>,
    pub fast_level: u32,
}

impl MetaPage {
    /// Parse and validate the meta page body.
    pub fn parse(page: &PageBuf) -> Result<Self> {
        if !page.special().flags.contains(PageFlags::META) {
            return Err(VerifyError::MetaCorrupt {
                detail: "meta block lacks meta flag".to_owned(),
            });
        }
        let b = &page.bytes()[PAGE_HEADER_SIZE..];
        let magic = read_u32(b, 0);
        if magic != META_MAGIC {
            return Err(VerifyError::MetaCorrupt {
                detail: format!("bad magic {magic:#x}"),
            });
        }
        let version = read_u32(b, 4);
        if !(MIN_FORMAT_VERSION..=FORMAT_VERSION).contains(&version) {
            return Err(VerifyError::MetaVersion {
                version,
                min: MIN_FORMAT_VERSION,
                max: FORMAT_VERSION,
            });
        }
        let key_atts = read_u16(b, 8);
        if key_atts == 0 {
            return Err(VerifyError::MetaCorrupt {
                detail: "zero key attributes".to_owned(),
            });
        }
        Ok(Self {
            version,
            key_atts,
            root: BlockId::new(read_u32(b, 12)),
            root_level: read_u32(b, 16),
            fast_root: BlockId::new(read_u32(b, 20)),
            fast_level: read_u32(b, 24),
        })
    }

    /// Whether this format guarantees fully unique sort keys via the
    /// tie-breaking row reference.
    pub const fn strict_keyspace(&self) -> bool {
        self.version >= crate::STRICT_KEYSPACE_VERSION
    }

    /// Write the meta body into a page. Fixture construction only.
    pub fn write_to(&self, page: &mut PageBuf) {
        let b = &mut page.bytes_mut()[PAGE_HEADER_SIZE..];
        b[0..4].copy_from_slice(&META_MAGIC.to_le_bytes());
        b[4..8].copy_from_slice(&self.version.to_le_bytes());
        b[8..10].copy_from_slice(&self.key_atts.to_le_bytes());
        b[10..12].copy_from_slice(&0u16.to_le_bytes());
        b[12..16].copy_from_slice(&self.root.map_or(0, BlockId::get).to_le_bytes());
        b[16..20].copy_from_slice(&self.root_level.to_le_bytes());
        b[20..24].copy_from_slice(&self.fast_root.map_or(0, BlockId::get).to_le_bytes());
        b[24..28].copy_from_slice(&self.fast_level.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_special() -> Special {
        Special {
            left: None,
            right: None,
            level: 0,
            flags: PageFlags::LEAF,
        }
    }

    #[test]
    fn slot_word_round_trip() {
        for state in [
            SlotState::Unused,
            SlotState::Normal,
            SlotState::Redirect,
            SlotState::Dead,
        ] {
            let slot = Slot::new(3200, 57, state);
            assert_eq!(Slot::unpack(slot.pack()), slot);
        }
    }

    #[test]
    fn push_item_assigns_ascending_offsets() {
        let mut page = PageBuf::new_empty(leaf_special());
        assert_eq!(page.push_item(b"abc"), Some(1));
        assert_eq!(page.push_item(b"defgh"), Some(2));
        assert_eq!(page.slot_count(), 2);

        let slot = page.slot(2).unwrap();
        assert_eq!(slot.state, SlotState::Normal);
        assert_eq!(page.item_bytes(slot).unwrap(), b"defgh");
        assert!(page.slot(3).is_none());
        assert!(page.slot(0).is_none());
    }

    #[test]
    fn push_item_refuses_overflow() {
        let mut page = PageBuf::new_empty(leaf_special());
        let big = vec![0u8; crate::USABLE_SIZE];
        assert!(page.push_item(&big).is_none());
    }

    #[test]
    fn special_round_trip() {
        let special = Special {
            left: BlockId::new(4),
            right: None,
            level: 2,
            flags: PageFlags::ROOT | PageFlags::INCOMPLETE_SPLIT,
        };
        let page = PageBuf::new_empty(special);
        assert_eq!(page.special(), special);
        assert!(page.special().is_rightmost());
        assert!(page.special().is_incomplete_split());
        assert_eq!(page.special().kind(), PageKind::Internal);
    }

    #[test]
    fn classify_priority() {
        let deleted = PageFlags::LEAF | PageFlags::DELETED | PageFlags::HALF_DEAD;
        assert_eq!(PageKind::classify(deleted), PageKind::Deleted);
        assert_eq!(
            PageKind::classify(PageFlags::LEAF | PageFlags::HALF_DEAD),
            PageKind::HalfDead
        );
        assert_eq!(PageKind::classify(PageFlags::LEAF), PageKind::Leaf);
        assert_eq!(PageKind::classify(PageFlags::ROOT), PageKind::Internal);
        assert!(PageKind::Deleted.is_ignorable());
        assert!(PageKind::HalfDead.is_ignorable());
        assert!(!PageKind::Leaf.is_ignorable());
    }

    #[test]
    fn meta_round_trip_and_validation() {
        let mut page = PageBuf::new_empty(Special {
            left: None,
            right: None,
            level: 0,
            flags: PageFlags::META,
        });
        let meta = MetaPage {
            version: 4,
            key_atts: 2,
            root: BlockId::new(3),
            root_level: 1,
            fast_root: BlockId::new(3),
            fast_level: 1,
        };
        meta.write_to(&mut page);
        let parsed = MetaPage::parse(&page).unwrap();
        assert_eq!(parsed, meta);
        assert!(parsed.strict_keyspace());

        // Corrupt the magic.
        page.bytes_mut()[PAGE_HEADER_SIZE] ^= 0xff;
        assert!(matches!(
            MetaPage::parse(&page),
            Err(VerifyError::MetaCorrupt { .. })
        ));
    }

    #[test]
    fn meta_version_bounds() {
        let mut page = PageBuf::new_empty(Special {
            left: None,
            right: None,
            level: 0,
            flags: PageFlags::META,
        });
        MetaPage {
            version: 9,
            key_atts: 1,
            root: None,
            root_level: 0,
            fast_root: None,
            fast_level: 0,
        }
        .write_to(&mut page);
        assert!(matches!(
            MetaPage::parse(&page),
            Err(VerifyError::MetaVersion { version: 9, .. })
        ));
    }
}
