//! Independent re-discovery of leaf entries by searching from the root.
//!
//! The structural checks bound each page by its parent separator and its
//! high key, but a separator is not always available (negative infinity
//! items carry none), so subtle transitive inconsistencies between cousin
//! pages can survive them. Re-finding every leaf entry by a fresh descent
//! catches those, and doubles as a direct test of the search path scans
//! use. Requires fully unique keys, hence the strict key-space format, and
//! a strict run, since a concurrent split would force move-rights that can
//! conceal exactly the inconsistencies being looked for.

use std::cmp::Ordering;

use btcheck_error::Result;
use btcheck_types::Entry;

use crate::compare::{SearchKey, compare_entry};
use crate::source::{downlink_of, entry_at, fetch_node};
use crate::state::CheckState;

/// Search for `entry` starting from the fast root, exactly as a scan
/// would. Returns whether a fully equal entry (tie-breaker included) was
/// found on the leaf level.
pub(crate) fn entry_is_findable(state: &CheckState<'_>, entry: &Entry) -> Result<bool> {
    let key = SearchKey::for_search(entry, true);

    // Searches start from the fast root; verifying that path as scans see
    // it is part of the point.
    let Some(mut block) = state.meta.fast_root else {
        return Ok(false);
    };

    loop {
        state.cx.checkpoint()?;
        let node = fetch_node(state.pages, block)?;

        // Step right past any high key below the search key; an
        // interrupted split can legitimately require one move.
        if !node.special.is_rightmost() {
            let (_, high_key) = entry_at(&node, 1)?;
            if compare_entry(&key, &high_key) == Ordering::Greater {
                if let Some(right) = node.special.right {
                    block = right;
                    continue;
                }
            }
        }

        if node.is_leaf() {
            // Binary search; leaf items are strictly ascending under the
            // fully unique key space, and the pages leading here were
            // already checked for exactly that.
            let mut lo = node.first_data_offset();
            let mut hi = node.max_offset();
            while lo <= hi {
                let mid = lo + (hi - lo) / 2;
                let (_, candidate) = entry_at(&node, mid)?;
                match compare_entry(&key, &candidate) {
                    Ordering::Greater => lo = mid + 1,
                    Ordering::Equal => return Ok(true),
                    Ordering::Less => {
                        if mid == 1 {
                            break;
                        }
                        hi = mid - 1;
                    }
                }
            }
            return Ok(false);
        }

        // Internal: descend through the last downlink whose separator is
        // at or below the key. The negative infinity item qualifies by
        // definition, so there is always a candidate.
        let first = node.first_data_offset();
        let mut chosen = first;
        for offset in (first + 1)..=node.max_offset() {
            let (_, separator) = entry_at(&node, offset)?;
            if compare_entry(&key, &separator) == Ordering::Less {
                break;
            }
            chosen = offset;
        }
        let (_, pivot) = entry_at(&node, chosen)?;
        block = downlink_of(&node, chosen, &pivot)?;
    }
}
