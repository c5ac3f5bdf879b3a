//! In-memory fixtures: a [`PageSource`] over a vector of pages, a
//! [`TableSource`] over literal rows, and a builder that assembles sound
//! multi-level trees from sorted rows.
//!
//! Everything here exists so that verification scenarios can be staged
//! deterministically: build a well-formed tree, then corrupt specific bytes
//! (or schedule a page to change between reads, standing in for a concurrent
//! writer) and watch the verifier react.

use std::cell::RefCell;

use btcheck_error::{Result, VerifyError};
use btcheck_types::entry::{Attr, EntryFlags};
use btcheck_types::page::{PageFlags, Slot, SlotState};
use btcheck_types::{BlockId, Entry, ItemOffset, MetaPage, PageBuf, RowId, Special};

use crate::crosscheck::TableSource;
use crate::source::PageSource;

/// A page source over an in-memory vector of pages, with hooks for swapping
/// a page's contents after a chosen number of reads.
pub struct MemPageSource {
    inner: RefCell<Inner>,
}

struct Inner {
    pages: Vec<PageBuf>,
    reads: Vec<u32>,
    swaps: Vec<Swap>,
}

struct Swap {
    block: u32,
    after_reads: u32,
    replacement: PageBuf,
}

impl MemPageSource {
    pub fn new(pages: Vec<PageBuf>) -> Self {
        let reads = vec![0; pages.len()];
        Self {
            inner: RefCell::new(Inner {
                pages,
                reads,
                swaps: Vec::new(),
            }),
        }
    }

    /// Edit one page in place, for corruption injection.
    pub fn mutate(&self, block: u32, edit: impl FnOnce(&mut PageBuf)) {
        let mut inner = self.inner.borrow_mut();
        edit(&mut inner.pages[block as usize]);
    }

    /// Inspect one page.
    pub fn with_page<R>(&self, block: u32, read: impl FnOnce(&PageBuf) -> R) -> R {
        read(&self.inner.borrow().pages[block as usize])
    }

    /// Replace `block` with `replacement` once it has been read `after_reads`
    /// times: the first `after_reads` reads return the original contents and
    /// every later read returns the replacement. This simulates a writer
    /// restructuring the tree between two looks at the same page.
    pub fn swap_after_reads(&self, block: u32, after_reads: u32, replacement: PageBuf) {
        self.inner.borrow_mut().swaps.push(Swap {
            block,
            after_reads,
            replacement,
        });
    }

    /// Number of times `block` has been read so far.
    pub fn reads_of(&self, block: u32) -> u32 {
        self.inner.borrow().reads[block as usize]
    }
}

impl PageSource for MemPageSource {
    fn page_count(&self) -> u32 {
        self.inner.borrow().pages.len() as u32
    }

    fn read_page(&self, block: u32) -> Result<Vec<u8>> {
        let mut inner = self.inner.borrow_mut();
        let index = block as usize;
        if index >= inner.pages.len() {
            return Err(VerifyError::BlockNotFound { block });
        }
        inner.reads[index] += 1;
        let count = inner.reads[index];
        let bytes = inner.pages[index].bytes().to_vec();
        if let Some(at) = inner
            .swaps
            .iter()
            .position(|s| s.block == block && s.after_reads == count)
        {
            let swap = inner.swaps.swap_remove(at);
            inner.pages[index] = swap.replacement;
        }
        Ok(bytes)
    }
}

/// A table source over literal rows.
pub struct MemTableSource {
    rows: Vec<(RowId, Vec<Vec<u8>>)>,
}

impl MemTableSource {
    pub fn new(rows: Vec<(RowId, Vec<Vec<u8>>)>) -> Self {
        Self { rows }
    }
}

impl TableSource for MemTableSource {
    fn for_each_row(
        &self,
        visit: &mut dyn FnMut(RowId, &[Vec<u8>]) -> Result<()>,
    ) -> Result<()> {
        for (row, values) in &self.rows {
            visit(*row, values)?;
        }
        Ok(())
    }

    fn row_estimate(&self) -> u64 {
        self.rows.len() as u64
    }
}

/// The pages of one assembled tree, plus the blocks of each level for tests
/// that need to aim at a particular page.
pub struct BuiltTree {
    /// Block 0 is the meta page.
    pub pages: Vec<PageBuf>,
    /// `levels[0]` is the leaf level left to right; the last level holds
    /// only the root. Empty for an empty tree.
    pub levels: Vec<Vec<u32>>,
}

impl BuiltTree {
    pub fn into_source(self) -> MemPageSource {
        MemPageSource::new(self.pages)
    }

    pub fn leaf_blocks(&self) -> &[u32] {
        self.levels.first().map_or(&[], Vec::as_slice)
    }

    pub fn root_block(&self) -> Option<u32> {
        self.levels.last().and_then(|l| l.first().copied())
    }
}

/// Builds a well-formed tree from rows already sorted by key (then by row
/// reference). Capacities are data items per page, deliberately tiny so tests
/// get multiple levels out of a handful of rows.
pub struct TreeBuilder {
    pub key_atts: u16,
    pub leaf_capacity: usize,
    pub branch_capacity: usize,
    pub version: u32,
}

impl Default for TreeBuilder {
    fn default() -> Self {
        Self {
            key_atts: 1,
            leaf_capacity: 4,
            branch_capacity: 4,
            version: btcheck_types::FORMAT_VERSION,
        }
    }
}

/// One child page as seen by the level above: its block and the lower bound
/// of its key space (`None` for the leftmost child of the tree).
struct Child {
    block: u32,
    lower_bound: Option<Vec<Vec<u8>>>,
}

impl TreeBuilder {
    /// Assemble the tree. Panics (it is fixture code) if a page overflows,
    /// which only happens when capacities and value sizes are picked badly.
    pub fn build(&self, rows: &[(RowId, Vec<Vec<u8>>)]) -> BuiltTree {
        let mut pages = vec![PageBuf::new_empty(Special {
            left: None,
            right: None,
            level: 0,
            flags: PageFlags::META,
        })];
        let mut levels: Vec<Vec<u32>> = Vec::new();

        let mut root = None;
        let mut root_level = 0;
        if !rows.is_empty() {
            let chunks: Vec<&[(RowId, Vec<Vec<u8>>)]> =
                rows.chunks(self.leaf_capacity).collect();

            // Leaves first, so their block numbers are known to the level
            // above. Boundary i separates chunk i from chunk i+1 and doubles
            // as leaf i's high key and leaf i+1's separator in the parent.
            let first_block = pages.len() as u32;
            let boundaries: Vec<Vec<Vec<u8>>> = chunks[1..]
                .iter()
                .map(|chunk| chunk[0].1.clone())
                .collect();
            let mut children = Vec::with_capacity(chunks.len());
            for (i, chunk) in chunks.iter().enumerate() {
                let block = first_block + i as u32;
                let single = chunks.len() == 1;
                let mut flags = PageFlags::LEAF;
                if single {
                    flags |= PageFlags::ROOT;
                }
                let mut page = PageBuf::new_empty(Special {
                    left: (i > 0).then(|| block_id(block - 1)),
                    right: (i + 1 < chunks.len()).then(|| block_id(block + 1)),
                    level: 0,
                    flags,
                });
                page.set_stamp(stamp_for(block));
                if let Some(bound) = boundaries.get(i) {
                    push_entry(&mut page, &pivot(bound, None));
                }
                for (row, values) in *chunk {
                    push_entry(&mut page, &data_entry(values, *row));
                }
                children.push(Child {
                    block,
                    lower_bound: (i > 0).then(|| boundaries[i - 1].clone()),
                });
                pages.push(page);
            }
            levels.push(children.iter().map(|c| c.block).collect());

            // Stack internal levels until one page remains.
            let mut level = 0u32;
            while children.len() > 1 {
                level += 1;
                children = self.build_internal_level(&mut pages, level, &children);
                levels.push(children.iter().map(|c| c.block).collect());
            }
            root = Some(children[0].block);
            root_level = level;
        }

        let meta = MetaPage {
            version: self.version,
            key_atts: self.key_atts,
            root: root.map(block_id),
            root_level,
            fast_root: root.map(block_id),
            fast_level: root_level,
        };
        meta.write_to(&mut pages[0]);
        pages[0].set_stamp(stamp_for(0));

        BuiltTree { pages, levels }
    }

    fn build_internal_level(
        &self,
        pages: &mut Vec<PageBuf>,
        level: u32,
        children: &[Child],
    ) -> Vec<Child> {
        let groups: Vec<&[Child]> = children.chunks(self.branch_capacity).collect();
        let first_block = pages.len() as u32;
        let mut parents = Vec::with_capacity(groups.len());
        for (i, group) in groups.iter().enumerate() {
            let block = first_block + i as u32;
            let single = groups.len() == 1;
            let mut flags = PageFlags::empty();
            if single {
                flags |= PageFlags::ROOT;
            }
            let mut page = PageBuf::new_empty(Special {
                left: (i > 0).then(|| block_id(block - 1)),
                right: (i + 1 < groups.len()).then(|| block_id(block + 1)),
                level,
                flags,
            });
            page.set_stamp(stamp_for(block));

            // High key bounds this page's key space from above; it is the
            // lower bound of the next group's first child.
            if let Some(next_group) = groups.get(i + 1) {
                let bound = next_group[0]
                    .lower_bound
                    .as_ref()
                    .map_or(&[][..], Vec::as_slice);
                push_entry(&mut page, &pivot(bound, None));
            }

            // First downlink is the negative infinity item; the rest carry
            // their child's lower bound as separator.
            push_entry(&mut page, &pivot(&[], Some(group[0].block)));
            for child in &group[1..] {
                let bound = child.lower_bound.as_ref().map_or(&[][..], Vec::as_slice);
                push_entry(&mut page, &pivot(bound, Some(child.block)));
            }

            parents.push(Child {
                block,
                lower_bound: group[0].lower_bound.clone(),
            });
            pages.push(page);
        }
        parents
    }
}

/// A leaf data entry for `values` owned by `row`.
pub fn data_entry(values: &[Vec<u8>], row: RowId) -> Entry {
    Entry {
        flags: EntryFlags::empty(),
        link: None,
        tiebreak: Some(row),
        attrs: values.iter().map(|v| Attr::plain(v.clone())).collect(),
    }
}

/// A pivot entry: high key when `link` is `None`, downlink carrier otherwise.
/// The tie-breaker is always truncated away, as splits do.
pub fn pivot(values: &[Vec<u8>], link: Option<u32>) -> Entry {
    Entry {
        flags: EntryFlags::PIVOT,
        link: link.map(block_id),
        tiebreak: None,
        attrs: values.iter().map(|v| Attr::plain(v.clone())).collect(),
    }
}

/// Overwrite the item at `offset` with `entry`, in place. Only possible when
/// the encodings are the same size; returns whether it happened. Corruption
/// scenarios rely on this to change an item without disturbing the layout.
pub fn replace_item(page: &mut PageBuf, offset: ItemOffset, entry: &Entry) -> bool {
    let Some(slot) = page.slot(offset) else {
        return false;
    };
    let bytes = entry.encode();
    if bytes.len() != usize::from(slot.len) {
        return false;
    }
    let start = usize::from(slot.offset);
    page.bytes_mut()[start..start + bytes.len()].copy_from_slice(&bytes);
    true
}

/// Flip one slot to the given state, keeping offset and length.
pub fn set_slot_state(page: &mut PageBuf, offset: ItemOffset, state: SlotState) {
    if let Some(slot) = page.slot(offset) {
        page.set_slot(offset, Slot::new(slot.offset, slot.len, state));
    }
}

/// Rows with single ascending fixed-width keys, the staple fixture diet.
pub fn ascending_rows(count: usize) -> Vec<(RowId, Vec<Vec<u8>>)> {
    (0..count)
        .map(|i| {
            let row = RowId::new(1 + (i / 16) as u32, (i % 16) as u16);
            (row, vec![format!("key{i:04}").into_bytes()])
        })
        .collect()
}

fn push_entry(page: &mut PageBuf, entry: &Entry) {
    let offset = page.push_item(&entry.encode());
    assert!(offset.is_some(), "fixture page overflow");
}

fn block_id(raw: u32) -> BlockId {
    match BlockId::new(raw) {
        Some(id) => id,
        None => unreachable!("fixture block numbers start at 1"),
    }
}

/// Distinct nonzero stamp per block.
fn stamp_for(block: u32) -> u64 {
    0xb1f0_0000_0000_0000 | u64::from(block + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use btcheck_types::PageKind;

    #[test]
    fn builder_produces_parseable_meta_and_linked_leaves() {
        let rows = ascending_rows(10);
        let tree = TreeBuilder {
            leaf_capacity: 4,
            ..TreeBuilder::default()
        }
        .build(&rows);

        assert_eq!(tree.leaf_blocks().len(), 3);
        let meta = MetaPage::parse(&tree.pages[0]).unwrap();
        assert_eq!(meta.root.map(BlockId::get), tree.root_block());
        assert_eq!(meta.root_level, 1);

        // Leaves are chained left to right.
        let leaves = tree.leaf_blocks().to_vec();
        for (i, &block) in leaves.iter().enumerate() {
            let special = tree.pages[block as usize].special();
            assert_eq!(special.kind(), PageKind::Leaf);
            assert_eq!(special.left.map(BlockId::get), (i > 0).then(|| leaves[i - 1]));
            assert_eq!(
                special.right.map(BlockId::get),
                leaves.get(i + 1).copied()
            );
        }
    }

    #[test]
    fn single_leaf_tree_is_its_own_root() {
        let tree = TreeBuilder::default().build(&ascending_rows(2));
        assert_eq!(tree.levels.len(), 1);
        let root = tree.root_block().unwrap();
        assert_eq!(tree.leaf_blocks(), [root]);
        let special = tree.pages[root as usize].special();
        assert!(special.is_root());
        assert_eq!(special.kind(), PageKind::Leaf);
    }

    #[test]
    fn empty_tree_has_meta_only() {
        let tree = TreeBuilder::default().build(&[]);
        assert_eq!(tree.pages.len(), 1);
        assert!(tree.levels.is_empty());
        let meta = MetaPage::parse(&tree.pages[0]).unwrap();
        assert!(meta.root.is_none());
    }

    #[test]
    fn scheduled_swap_takes_effect_after_nth_read() {
        let tree = TreeBuilder::default().build(&ascending_rows(2));
        let replacement = PageBuf::new_empty(Special {
            left: None,
            right: None,
            level: 0,
            flags: PageFlags::LEAF | PageFlags::HALF_DEAD,
        });
        let leaf = tree.leaf_blocks()[0];
        let source = tree.into_source();
        source.swap_after_reads(leaf, 1, replacement);

        let first = source.read_page(leaf).unwrap();
        let second = source.read_page(leaf).unwrap();
        assert_ne!(first, second);
        let swapped = PageBuf::from_bytes(second).unwrap();
        assert_eq!(swapped.special().kind(), PageKind::HalfDead);
        assert_eq!(source.reads_of(leaf), 2);
    }

    #[test]
    fn replace_item_requires_equal_size() {
        let mut tree = TreeBuilder::default().build(&ascending_rows(2));
        let leaf = tree.leaf_blocks()[0] as usize;
        let row = RowId::new(1, 0);
        assert!(replace_item(
            &mut tree.pages[leaf],
            1,
            &data_entry(&[b"key9999".to_vec()], row)
        ));
        assert!(!replace_item(
            &mut tree.pages[leaf],
            1,
            &data_entry(&[b"much longer key value".to_vec()], row)
        ));
    }

    #[test]
    fn table_source_knows_its_row_count_exactly() {
        let table = MemTableSource::new(ascending_rows(5));
        assert_eq!(table.row_estimate(), 5);
        assert_eq!(MemTableSource::new(Vec::new()).row_estimate(), 0);
    }

    #[test]
    fn out_of_range_block_is_reported() {
        let source = TreeBuilder::default().build(&ascending_rows(1)).into_source();
        assert!(matches!(
            source.read_page(99),
            Err(VerifyError::BlockNotFound { block: 99 })
        ));
    }
}
