//! The level walk: follow right links across one level, verifying each page
//! and deriving the leftmost block of the level below.

use btcheck_error::{Result, VerifyError};
use btcheck_types::{BlockId, PageKind};
use tracing::debug;

use crate::source::{Node, downlink_of, entry_at, fetch_node};
use crate::state::{CheckState, StrictGuard};
use crate::target;

/// One level of the tree, identified by its leftmost block.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Level {
    pub number: u32,
    pub leftmost: BlockId,
    pub is_true_root: bool,
}

/// Outcome of walking one level.
pub(crate) enum NextLevel {
    /// Every page on the level was ignorable; there was nothing to derive
    /// the next level from. The caller reports this as corruption.
    Unset,
    /// The leaf level was walked; the tree is done.
    LeafDone,
    /// An internal level was walked; descend to this one next.
    Down(Level),
}

/// Walk `level` from its leftmost page rightward, verifying every
/// non-ignorable page, and return the leftmost block one level down.
///
/// Ignorable (half-dead or deleted) pages are stepped over: their key space
/// has already been consolidated into a live sibling, so there is nothing
/// on them to verify. Strict runs still insist that a fully deleted page is
/// unreachable, and that the rightmost page of a level is never ignorable.
pub(crate) fn check_level_from_leftmost(
    state: &mut CheckState<'_>,
    level: Level,
) -> Result<NextLevel> {
    let mut next = NextLevel::Unset;
    let mut leftcurrent: Option<BlockId> = None;
    let mut current = level.leftmost;

    debug!(
        level = level.number,
        leftmost = %level.leftmost,
        true_root = level.is_true_root,
        "verifying level"
    );

    loop {
        state.cx.checkpoint()?;

        let node = fetch_node(state.pages, current)?;
        state.pages_visited += 1;
        let special = node.special;

        if special.kind().is_ignorable() {
            // With no writers, nothing can reach a fully deleted page:
            // deletion removes every reference before the page is marked
            // dead. Half-dead is reachable (an interrupted deletion).
            if state.is_strict() && special.kind() == PageKind::Deleted {
                return Err(VerifyError::SiblingToDeleted {
                    block: current.get(),
                    left: leftcurrent.map_or(0, BlockId::get),
                    left_link: special.left.map_or(0, BlockId::get),
                });
            }
            if special.is_rightmost() {
                return Err(VerifyError::FellOffEnd {
                    block: current.get(),
                });
            }
            debug!(block = %current, "ignorable block skipped");
        } else {
            if matches!(next, NextLevel::Unset) {
                // First valid page of the level. A concurrent split could
                // legitimately leave a tolerant run starting off-leftmost,
                // so only strict runs hold the caller's expectations here.
                if let Some(guard) = state.strict {
                    if !leftmost_ignoring_half_dead(state, guard, &node)? {
                        return Err(VerifyError::NotLeftmost {
                            block: current.get(),
                        });
                    }
                    if level.is_true_root && !special.is_root() {
                        return Err(VerifyError::NotTrueRoot {
                            block: current.get(),
                        });
                    }
                }

                next = if node.is_leaf() {
                    NextLevel::LeafDone
                } else {
                    let first = node.first_data_offset();
                    let (_, entry) = entry_at(&node, first)?;
                    NextLevel::Down(Level {
                        number: special.level - 1,
                        leftmost: downlink_of(&node, first, &entry)?,
                        is_true_root: false,
                    })
                };
            }

            // Sibling links must agree: this page's left link should name
            // the page we arrived from. leftcurrent is None with a non-empty
            // left link when the page left of the low-key downlink is
            // half-dead, which the leftmost probe above already vetted.
            if state.is_strict() && leftcurrent.is_some() && special.left != leftcurrent {
                return Err(VerifyError::SiblingAgreement {
                    block: current.get(),
                    left: leftcurrent.map_or(0, BlockId::get),
                    left_link: special.left.map_or(0, BlockId::get),
                });
            }

            if special.level != level.number {
                return Err(VerifyError::LevelMismatch {
                    block: current.get(),
                    expected: level.number,
                    actual: special.level,
                });
            }

            target::check_target_page(state, &node)?;
        }

        // The page about to become the target may be the right half of an
        // unfinished split, which excuses a missing downlink.
        state.rightsplit = special.is_incomplete_split();

        leftcurrent = Some(current);
        match special.right {
            Some(right) => {
                // Cheap circular link detection: a right link back to the
                // page itself or to the page it arrived from.
                if right == current || Some(right) == special.left {
                    return Err(VerifyError::CircularChain { block: right.get() });
                }
                current = right;
            }
            None => break,
        }
    }

    Ok(next)
}

/// Accept an arbitrarily long chain of half-dead pages to the left of the
/// level's first valid page; each is an interrupted deletion whose downlink
/// is already gone, so the parent's low-key downlink legitimately lands to
/// their right.
fn leftmost_ignoring_half_dead(
    state: &CheckState<'_>,
    _guard: StrictGuard,
    start: &Node,
) -> Result<bool> {
    let mut reached = start.special.left;
    let mut reached_from = start.block;
    let mut all_half_dead = true;

    while let Some(block) = reached {
        if !all_half_dead {
            break;
        }
        state.cx.checkpoint()?;
        let node = fetch_node(state.pages, block)?;

        // Unlinked half-dead pages keep their side links; insist the chain
        // is consistent both ways to avoid looping on corrupt left links.
        all_half_dead = node.kind() == PageKind::HalfDead
            && block != start.block
            && block != reached_from
            && node.special.right == Some(reached_from);
        if all_half_dead {
            debug!(
                block = %block,
                right = %reached_from,
                "harmless interrupted page deletion detected"
            );
            reached_from = block;
            reached = node.special.left;
        }
    }

    Ok(all_half_dead)
}
