//! Page access: the [`PageSource`] trait plus the careful fetch and decode
//! helpers everything else is built on.
//!
//! Nothing here trusts the bytes it reads. Every page goes through the same
//! basic sanity checks on fetch, and every slot is bounds-checked before its
//! item is dereferenced, so that corrupt metadata surfaces as a structured
//! error instead of a wild slice index.

use btcheck_error::{Result, VerifyError};
use btcheck_types::entry::declared_size;
use btcheck_types::page::{PageFlags, SlotState};
use btcheck_types::{
    BlockId, Entry, ItemOffset, MAX_ITEMS_PER_PAGE, META_BLOCK, MetaPage, PAGE_SIZE, PageBuf,
    PageKind, Slot, Special, SPECIAL_SIZE,
};

/// Read access to the index file, one page at a time.
///
/// Implementations return a fresh copy of the page bytes; the verifier never
/// holds more than a couple of copies at once and never writes back.
pub trait PageSource {
    /// Number of blocks in the index, counting the meta page.
    fn page_count(&self) -> u32;

    /// Read one block. Must return [`VerifyError::BlockNotFound`] for blocks
    /// past the end rather than panicking.
    fn read_page(&self, block: u32) -> Result<Vec<u8>>;
}

/// One fetched page with its parsed special area.
#[derive(Debug, Clone)]
pub struct Node {
    pub block: BlockId,
    pub page: PageBuf,
    pub special: Special,
}

impl Node {
    pub fn kind(&self) -> PageKind {
        self.special.kind()
    }

    pub fn is_leaf(&self) -> bool {
        self.special.flags.contains(PageFlags::LEAF)
    }

    pub fn stamp(&self) -> u64 {
        self.page.stamp()
    }

    pub fn max_offset(&self) -> ItemOffset {
        self.page.slot_count()
    }

    /// 1-based offset of the first data item: 1 on rightmost pages, 2
    /// otherwise (offset 1 being the high key).
    pub fn first_data_offset(&self) -> ItemOffset {
        if self.special.is_rightmost() { 1 } else { 2 }
    }

    /// Whether this offset holds the internal-page negative infinity item,
    /// which has no key attributes and is exempt from ordering checks.
    pub fn offset_is_negative_infinity(&self, offset: ItemOffset) -> bool {
        !self.is_leaf() && offset == self.first_data_offset()
    }
}

/// Fetch a page and run the sanity checks every visitor relies on.
///
/// Deleted pages have no trustworthy level field, so the level checks only
/// apply to pages still carrying live data.
pub(crate) fn fetch_node(pages: &dyn PageSource, block: BlockId) -> Result<Node> {
    let raw = pages.read_page(block.get())?;
    let len = raw.len();
    let page = PageBuf::from_bytes(raw).ok_or(VerifyError::TruncatedPage {
        block: block.get(),
        len,
    })?;
    let special = page.special();
    let kind = special.kind();

    if special.flags.contains(PageFlags::META) {
        return Err(VerifyError::UnexpectedMetaFlag {
            block: block.get(),
        });
    }

    let leaf = special.flags.contains(PageFlags::LEAF);
    let deleted = kind == PageKind::Deleted;
    if leaf && !deleted && special.level != 0 {
        return Err(VerifyError::LeafLevelNonZero {
            block: block.get(),
            level: special.level,
        });
    }
    if !leaf && !deleted && special.level == 0 {
        return Err(VerifyError::InternalLevelZero {
            block: block.get(),
        });
    }

    let max_offset = page.slot_count();
    if max_offset > MAX_ITEMS_PER_PAGE {
        return Err(VerifyError::TooManyItems {
            block: block.get(),
            count: max_offset,
            max: MAX_ITEMS_PER_PAGE,
        });
    }

    // An internal page always has at least a negative infinity downlink,
    // and a non-rightmost leaf always has at least its high key. Deleted
    // pages may legitimately be empty.
    let first_data = if special.is_rightmost() { 1 } else { 2 };
    if !leaf && !deleted && max_offset < first_data {
        return Err(VerifyError::InternalMissingItems {
            block: block.get(),
        });
    }
    if leaf && !deleted && !special.is_rightmost() && max_offset < 1 {
        return Err(VerifyError::LeafMissingHighKey {
            block: block.get(),
        });
    }

    // Only leaf pages are ever marked half-dead.
    if !leaf && special.flags.contains(PageFlags::HALF_DEAD) {
        return Err(VerifyError::InternalHalfDead {
            block: block.get(),
        });
    }

    Ok(Node {
        block,
        page,
        special,
    })
}

/// Read and validate the meta page.
pub(crate) fn read_meta(pages: &dyn PageSource) -> Result<MetaPage> {
    let raw = pages.read_page(META_BLOCK)?;
    let len = raw.len();
    let page = PageBuf::from_bytes(raw).ok_or(VerifyError::TruncatedPage {
        block: META_BLOCK,
        len,
    })?;
    MetaPage::parse(&page)
}

/// Decode the slot at `offset`, validating it before anything dereferences
/// the item it points at.
///
/// Slot access elsewhere generally trusts slot words; a corrupt offset or
/// length would make the item slice undefined, so the two structural checks
/// happen here, once, for every code path.
pub(crate) fn slot_careful(node: &Node, offset: ItemOffset) -> Result<Slot> {
    let slot = node
        .page
        .slot(offset)
        .ok_or(VerifyError::SlotOutOfBounds {
            block: node.block.get(),
            offset,
            slot_off: 0,
            slot_len: 0,
        })?;

    if usize::from(slot.offset) + usize::from(slot.len) > PAGE_SIZE - SPECIAL_SIZE {
        return Err(VerifyError::SlotOutOfBounds {
            block: node.block.get(),
            offset,
            slot_off: slot.offset,
            slot_len: slot.len,
        });
    }

    // The index only ever produces Normal and Dead slots, and even Dead
    // slots keep their storage.
    if !matches!(slot.state, SlotState::Normal | SlotState::Dead) || slot.len == 0 {
        return Err(VerifyError::SlotStorage {
            block: node.block.get(),
            offset,
            slot_off: slot.offset,
            slot_len: slot.len,
            state: slot.state as u8,
        });
    }

    Ok(slot)
}

/// Validate the slot at `offset` and decode the entry it points at.
pub(crate) fn entry_at(node: &Node, offset: ItemOffset) -> Result<(Slot, Entry)> {
    let slot = slot_careful(node, offset)?;
    let bytes = node
        .page
        .item_bytes(slot)
        .ok_or(VerifyError::SlotOutOfBounds {
            block: node.block.get(),
            offset,
            slot_off: slot.offset,
            slot_len: slot.len,
        })?;
    let entry = Entry::decode(bytes).map_err(|detail| VerifyError::EntryDecode {
        block: node.block.get(),
        offset,
        detail,
    })?;
    Ok((slot, entry))
}

/// Entry's self-reported size, for comparison against the slot length.
pub(crate) fn entry_size_at(node: &Node, slot: Slot) -> usize {
    node.page
        .item_bytes(slot)
        .and_then(declared_size)
        .unwrap_or(0)
}

/// The child block an internal-page entry points at. Every internal entry
/// must carry one.
pub(crate) fn downlink_of(node: &Node, offset: ItemOffset, entry: &Entry) -> Result<BlockId> {
    entry.link.ok_or_else(|| VerifyError::EntryDecode {
        block: node.block.get(),
        offset,
        detail: "internal entry lacks downlink".to_owned(),
    })
}
