//! Parent/child downlink verification. Strict runs only: both checks here
//! would race with concurrent page deletion, whose first phase moves a
//! downlink sideways while expanding the child's key space leftward.

use btcheck_error::{Result, VerifyError};
use btcheck_types::page::PageFlags;
use btcheck_types::{BlockId, PageKind};
use tracing::debug;

use crate::compare::{SearchKey, invariant_l_child_offset};
use crate::source::{Node, downlink_of, entry_at, fetch_node};
use crate::state::{CheckState, StrictGuard};

/// Verify one of the target's downlinks against its child page: the
/// separator key the downlink travels with must be a strict lower bound on
/// everything stored in the child.
///
/// The child is still blamed on the target's behalf; a bad separator was
/// inserted into the target, and there is no parent link to verify in the
/// other direction.
pub(crate) fn check_downlink(
    state: &CheckState<'_>,
    _guard: StrictGuard,
    target: &Node,
    separator: &SearchKey,
    child_block: BlockId,
) -> Result<()> {
    state.cx.checkpoint()?;

    let child = fetch_node(state.pages, child_block)?;

    // With no writers, no reference to a fully deleted page should survive
    // anywhere. A half-dead child is still checkable: an interrupted
    // multi-level deletion can leave a legitimate downlink to one, and all
    // of its data items are intact (only its high key was replaced, and
    // the high key is not examined here).
    if child.kind() == PageKind::Deleted {
        return Err(VerifyError::DownlinkToDeleted {
            parent: target.block.get(),
            child: child_block.get(),
            stamp: target.stamp(),
        });
    }

    for offset in child.first_data_offset()..=child.max_offset() {
        // The negative infinity item is a strict lower bound only with
        // respect to the subtree it roots; comparing it against the
        // separator would misfire by construction.
        if child.offset_is_negative_infinity(offset) {
            continue;
        }

        if !invariant_l_child_offset(separator, &child, offset)? {
            return Err(VerifyError::DownlinkLowerBound {
                parent: target.block.get(),
                child: child_block.get(),
                offset,
                separator: separator.render(),
                stamp: target.stamp(),
            });
        }
    }

    Ok(())
}

/// Verify that the target had a downlink in its parent, using the filter of
/// downlinks recorded while walking the level above.
///
/// A missing downlink has two benign explanations that must be ruled out
/// before reporting corruption: an interrupted page split (the downlink was
/// never inserted; the left sibling still carries the incomplete-split
/// flag), and an interrupted multi-level deletion (the target is the "top
/// parent" of a half-dead chain; its leftmost leaf descendant records that
/// in its high key link).
pub(crate) fn check_missing_downlink(
    state: &CheckState<'_>,
    _guard: StrictGuard,
    target: &Node,
) -> Result<()> {
    // The true root has no parent to hold a downlink.
    if target.special.is_root() {
        return Ok(());
    }

    if state.rightsplit {
        debug!(
            block = %target.block,
            level = target.special.level,
            left = ?target.special.left,
            "harmless interrupted page split detected"
        );
        return Ok(());
    }

    let Some(filter) = state.downlink_filter.as_ref() else {
        return Ok(());
    };
    if !filter.lacks(&target.block.get().to_le_bytes()) {
        return Ok(());
    }

    // A leaf can never be the top parent of a deletion chain; nothing
    // excuses it lacking a downlink.
    if target.is_leaf() {
        return Err(VerifyError::LeafMissingDownlink {
            block: target.block.get(),
            stamp: target.stamp(),
        });
    }

    debug!(
        block = %target.block,
        "checking for interrupted multi-level deletion behind missing downlink"
    );

    // Descend leftmost from the target to the leaf level, sanity-checking
    // levels on the way down.
    let mut level = target.special.level;
    let first = target.first_data_offset();
    let (_, entry) = entry_at(target, first)?;
    let mut child_block = downlink_of(target, first, &entry)?;
    let leaf = loop {
        state.cx.checkpoint()?;

        let child = fetch_node(state.pages, child_block)?;
        if child.special.flags.contains(PageFlags::LEAF) {
            break child;
        }

        if child.special.level != level - 1 {
            return Err(VerifyError::DownlinkLevel {
                parent: target.block.get(),
                child: child_block.get(),
                expected: level - 1,
                actual: child.special.level,
            });
        }
        level = child.special.level;

        let first = child.first_data_offset();
        let (_, entry) = entry_at(&child, first)?;
        child_block = downlink_of(&child, first, &entry)?;
    };

    // A deleted leaf here is a dangling downlink somewhere above: sibling
    // links were rewired around the page when it was finished off, so only
    // this descent can still reach it.
    if leaf.kind() == PageKind::Deleted {
        return Err(VerifyError::DeletedLeafDescendant {
            parent: target.block.get(),
            leaf: child_block.get(),
            stamp: target.stamp(),
        });
    }

    // Half-dead leaf naming the target as its top parent: consistent with
    // an interrupted multi-level deletion that can be resumed safely.
    if leaf.kind() == PageKind::HalfDead && !leaf.special.is_rightmost() {
        let (_, high_key) = entry_at(&leaf, 1)?;
        if high_key.link == Some(target.block) {
            return Ok(());
        }
    }

    Err(VerifyError::InternalMissingDownlink {
        block: target.block.get(),
        level: target.special.level,
        stamp: target.stamp(),
    })
}
