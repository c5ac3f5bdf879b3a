//! Per-page verification of the current walk target.

use btcheck_error::{Result, VerifyError};
use btcheck_types::page::SlotState;
use btcheck_types::{BlockId, Entry, ItemOffset, MAX_ENTRY_SIZE, MAX_ENTRY_SIZE_RESERVED};
use tracing::{debug, warn};

use crate::compare::{
    SearchKey, invariant_g_offset, invariant_l_offset, invariant_leq_offset,
};
use crate::downlink;
use crate::source::{Node, downlink_of, entry_at, entry_size_at, fetch_node, slot_careful};
use crate::state::CheckState;

/// Verify one target page.
///
/// Every slot is validated and every entry decoded; then, per entry:
/// attribute counts, the size budget, the high key bound, strict ascending
/// order within the page, and (for the last item) ascending order into the
/// right sibling. Strict runs additionally verify each downlink against the
/// child page and, in cross-check runs, that the target itself had a
/// downlink in its parent.
///
/// All items are checked against the high key rather than trusting
/// transitivity to carry the bound from the last item; a broken comparator
/// upstream should not let anything hide here.
pub(crate) fn check_target_page(state: &mut CheckState<'_>, target: &Node) -> Result<()> {
    let max = target.max_offset();
    let leaf = target.is_leaf();
    let rightmost = target.special.is_rightmost();
    let stamp = target.stamp();

    debug!(
        block = %target.block,
        items = max,
        leaf,
        "verifying target page"
    );

    // The high key is an entry too; its attribute count has its own rules.
    if !rightmost {
        let (_, high_key) = entry_at(target, 1)?;
        if !natts_valid(state, target, 1, &high_key) {
            return Err(VerifyError::HighKeyAttrCount {
                block: target.block.get(),
                natts: high_key.natts(),
                stamp,
            });
        }
    }

    for offset in target.first_data_offset()..=max {
        state.cx.checkpoint()?;

        let slot = slot_careful(target, offset)?;

        // The slot length is fully redundant with the entry's own size
        // field; a mismatch means one of them is torn or overwritten.
        let size = entry_size_at(target, slot);
        if size != usize::from(slot.len) {
            return Err(VerifyError::SizeMismatch {
                block: target.block.get(),
                offset,
                size,
                slot_len: slot.len,
                stamp,
            });
        }

        let (_, entry) = entry_at(target, offset)?;
        if !natts_valid(state, target, offset, &entry) {
            return Err(VerifyError::EntryAttrCount {
                block: target.block.get(),
                offset,
                natts: entry.natts(),
                stamp,
            });
        }

        // Record every downlink on parent levels so that lower-level pages
        // can later be confirmed to have one.
        if !leaf && state.is_strict() {
            if let Some(filter) = state.downlink_filter.as_mut() {
                let child = downlink_of(target, offset, &entry)?;
                filter.add(&child.get().to_le_bytes());
            }
        }

        // The negative infinity item has no attributes to compare.
        if target.offset_is_negative_infinity(offset) {
            continue;
        }

        if state.root_descend && leaf {
            let row = entry.tiebreak.ok_or(VerifyError::MissingTieBreaker {
                block: target.block.get(),
                offset,
            })?;
            if !crate::rootdescend::entry_is_findable(state, &entry)? {
                return Err(VerifyError::RootDescendMissing {
                    block: target.block.get(),
                    offset,
                    row_block: row.block,
                    row_slot: row.slot,
                    stamp,
                });
            }
        }

        let skey = SearchKey::for_bounds(&entry, state.heap_keyspace);

        // The strict key space reserves room in the entry budget for a
        // tie-breaker to be appended when a leaf entry later becomes a high
        // key. The full budget is only available once that room is used as
        // intended, which can only happen on pivot entries.
        let lower_limit = state.heap_keyspace && (leaf || entry.tiebreak.is_none());
        let limit = if lower_limit {
            MAX_ENTRY_SIZE_RESERVED
        } else {
            MAX_ENTRY_SIZE
        };
        if size > limit {
            return Err(VerifyError::OversizeEntry {
                block: target.block.get(),
                offset,
                size,
                max: limit,
                stamp,
            });
        }

        // Fingerprint live leaf entries for the table cross-check. Dead
        // entries are deliberately excluded: the table no longer vouches
        // for them.
        if leaf && slot.state != SlotState::Dead {
            if let Some(filter) = state.filter.as_mut() {
                filter.add(&entry.normalized().encode());
                state.entries_fingerprinted += 1;
            }
        }

        // High key bound. Leaf high keys may be untruncated copies of the
        // last item, so the leaf check is <=; separators on internal
        // levels are unique, so there the bound is strict.
        if !rightmost {
            let within = if leaf {
                invariant_leq_offset(&skey, target, 1)?
            } else {
                invariant_l_offset(&skey, target, 1)?
            };
            if !within {
                let (_, high_key) = entry_at(target, 1)?;
                return Err(VerifyError::HighKeyBound {
                    block: target.block.get(),
                    offset,
                    key: skey.render(),
                    high_key: SearchKey::for_bounds(&high_key, state.heap_keyspace).render(),
                    stamp,
                });
            }
        }

        if offset < max {
            // Items must be strictly ascending within the page.
            if !invariant_l_offset(&skey, target, offset + 1)? {
                let (_, upper) = entry_at(target, offset + 1)?;
                return Err(VerifyError::ItemOrder {
                    block: target.block.get(),
                    offset,
                    lower: skey.render(),
                    upper: SearchKey::for_bounds(&upper, state.heap_keyspace).render(),
                    stamp,
                });
            }
        } else if let Some((right_block, right_key)) = right_page_first_key(state, target)? {
            // The last item must sort below the first item of the right
            // sibling (or the first live page past it).
            if !invariant_g_offset(&right_key, target, max)? {
                // A tolerant run can hit this as a false positive in one
                // narrow race: the target was concurrently deleted and its
                // key space merged rightward. The canary is the target
                // becoming ignorable; re-fetch and look.
                if !state.is_strict() {
                    let fresh = fetch_node(state.pages, target.block)?;
                    if fresh.kind().is_ignorable() {
                        warn!(
                            block = %target.block,
                            right = %right_block,
                            "cross-page order failure suppressed: target deleted mid-check"
                        );
                        state.suppressed_races += 1;
                        return Ok(());
                    }
                }
                return Err(VerifyError::CrossPageOrder {
                    block: target.block.get(),
                    offset,
                    last_key: skey.render(),
                    right_key: right_key.render(),
                    stamp,
                });
            }
        }

        // Parent/child verification for each downlink, sound only without
        // concurrent deletions.
        if !leaf {
            if let Some(guard) = state.strict {
                let child = downlink_of(target, offset, &entry)?;
                downlink::check_downlink(state, guard, target, &skey, child)?;
            }
        }

        state.entries_checked += 1;
    }

    if let Some(guard) = state.strict {
        if state.downlink_filter.is_some() {
            downlink::check_missing_downlink(state, guard, target)?;
        }
    }

    Ok(())
}

/// Attribute-count rules per entry position:
///
/// - leaf data entries carry every key attribute;
/// - leaf high keys may be suffix-truncated under the strict key space;
/// - the internal negative infinity item carries none at all;
/// - other internal entries carry at least one, at most all, under the
///   strict key space, and exactly all under the legacy format.
fn natts_valid(
    state: &CheckState<'_>,
    node: &Node,
    offset: ItemOffset,
    entry: &Entry,
) -> bool {
    let key_atts = state.meta.key_atts;
    let natts = entry.natts();
    if node.is_leaf() {
        if offset >= node.first_data_offset() {
            natts == key_atts && !entry.is_pivot()
        } else if state.heap_keyspace {
            natts <= key_atts && entry.is_pivot()
        } else {
            natts == key_atts && entry.is_pivot()
        }
    } else if node.offset_is_negative_infinity(offset) {
        natts == 0 && entry.is_pivot()
    } else if state.heap_keyspace {
        (1..=key_atts).contains(&natts) && entry.is_pivot()
    } else {
        natts == key_atts && entry.is_pivot()
    }
}

/// First data item on the page to the right of the target, as a search key,
/// with the block it came from.
///
/// Steps over ignorable pages: their key space has merged into the first
/// live page to their right, so that page's first item is the correct
/// successor of the target's last item. Returns `None` when the level ends
/// first, or when the right page has no data items (an empty leaf, or an
/// internal page holding only its negative infinity item).
fn right_page_first_key(
    state: &CheckState<'_>,
    target: &Node,
) -> Result<Option<(BlockId, SearchKey)>> {
    let Some(mut next) = target.special.right else {
        return Ok(None);
    };

    let right = loop {
        state.cx.checkpoint()?;
        let right = fetch_node(state.pages, next)?;
        if !right.kind().is_ignorable() || right.special.is_rightmost() {
            break right;
        }
        debug!(
            block = %next,
            level = right.special.level,
            "deleted page found while locating right sibling's first item"
        );
        match right.special.right {
            Some(further) => next = further,
            None => return Ok(None),
        }
    };

    // Skip the high key, and on internal pages the negative infinity item.
    let first = if right.is_leaf() {
        right.first_data_offset()
    } else {
        right.first_data_offset() + 1
    };
    if first > right.max_offset() {
        debug!(block = %next, leaf = right.is_leaf(), "right page has no first data item");
        return Ok(None);
    }

    let (_, entry) = entry_at(&right, first)?;
    Ok(Some((
        right.block,
        SearchKey::for_bounds(&entry, state.heap_keyspace),
    )))
}
