//! Integrity verification for the B-tree index format defined in
//! `btcheck-types`.
//!
//! The verifier walks the tree one level at a time, left to right and top to
//! bottom, holding a private copy of exactly one page at a time. On every
//! page it checks the slot array, decodes every entry, and enforces the
//! ordering invariants: every item is bounded by the page's high key, items
//! are strictly ascending within a page, and the last item of each page is
//! strictly below the first item of its right sibling.
//!
//! Two concurrency postures are supported, chosen through [`VerifyOptions`]:
//!
//! - **Tolerant**: safe to run while writers are active. Checks that cross
//!   pages are either skipped (parent/child relationships) or compensated
//!   for the one race that can produce a false positive (see the cross-page
//!   order check in `target`).
//! - **Strict**: requires the caller to have excluded writers. Adds sibling
//!   link agreement, parent/child downlink verification, missing-downlink
//!   detection, and optionally re-finds every leaf entry by an independent
//!   search from the root.
//!
//! Either posture can additionally cross-check the index against the primary
//! table it indexes: every live leaf entry is fingerprinted into a Bloom
//! filter, then every table row is probed against it. The filter proves
//! absence only, so a probe miss is definite (modulo tolerant-mode races)
//! while a probe hit proves nothing, which is exactly the right direction
//! for corruption detection.
//!
//! Verification stops at the first problem found and reports it as a
//! [`VerifyError`]; a clean run returns a [`VerifySummary`].

use btcheck_error::{Result, VerifyError};
use btcheck_types::cx::Cx;
use tracing::debug;

mod compare;
mod crosscheck;
mod downlink;
mod fingerprint;
mod level;
pub mod mem;
mod rootdescend;
mod source;
mod state;
mod target;

pub use btcheck_error::{ErrorKind, VerifyError as Error};
pub use crosscheck::TableSource;
pub use fingerprint::Bloom;
pub use source::{Node, PageSource};

use crate::level::{Level, NextLevel};
use crate::state::{CheckState, StrictGuard};

/// What to verify and under which concurrency posture.
///
/// The strict-only extras (downlink checks, root-descend probing) are only
/// expressible on the [`Strict`](VerifyOptions::Strict) variant, so a caller
/// cannot request them without asserting exclusive access. Passing a table
/// source is what requests the index/table cross-check.
#[derive(Clone, Copy)]
pub enum VerifyOptions<'a> {
    /// Concurrent writers may be active. Per-page checks only, with race
    /// compensation on the one cross-page check that remains.
    Tolerant {
        cross_check: Option<&'a dyn TableSource>,
    },
    /// Caller guarantees no concurrent writers. Enables parent/child
    /// verification and, optionally, per-entry search probing.
    Strict {
        cross_check: Option<&'a dyn TableSource>,
        root_descend: bool,
    },
}

impl<'a> VerifyOptions<'a> {
    fn table(&self) -> Option<&'a dyn TableSource> {
        match *self {
            Self::Tolerant { cross_check } | Self::Strict { cross_check, .. } => cross_check,
        }
    }

    const fn root_descend(&self) -> bool {
        matches!(
            self,
            Self::Strict {
                root_descend: true,
                ..
            }
        )
    }

    const fn strict_guard(&self) -> Option<StrictGuard> {
        match self {
            Self::Tolerant { .. } => None,
            Self::Strict { .. } => Some(StrictGuard::new()),
        }
    }
}

/// Statistics from a verification run that found no corruption.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifySummary {
    /// Tree levels walked, including the leaf level.
    pub levels: u32,
    /// Pages visited during the level walk, ignorable pages included.
    pub pages: u64,
    /// Entries that passed the per-entry checks.
    pub entries: u64,
    /// Live leaf entries fingerprinted for the table cross-check.
    pub entries_fingerprinted: u64,
    /// Table rows whose index entry was confirmed present.
    pub rows_present: u64,
    /// Cross-page order failures attributed to concurrent structural change
    /// and suppressed. Always zero for strict runs.
    pub suppressed_races: u64,
}

/// Verify the index served by `pages` according to `options`.
///
/// Returns the first corruption found, [`VerifyError::Interrupted`] if `cx`
/// was cancelled, or a [`VerifySummary`] for a clean run.
pub fn verify_index(
    pages: &dyn PageSource,
    options: &VerifyOptions<'_>,
    cx: &Cx,
) -> Result<VerifySummary> {
    let meta = source::read_meta(pages)?;

    // Finding entries by independent search relies on fully unique sort
    // keys, which only the strict key-space format guarantees.
    if options.root_descend() && !meta.strict_keyspace() {
        return Err(VerifyError::LegacyRootDescend);
    }

    let mut state = CheckState::new(pages, cx, meta, options);

    // Deletion patterns can leave the fast root lagging behind the true
    // root. The walk starts from the true root regardless; the mismatch
    // itself is harmless.
    if meta.fast_root != meta.root {
        debug!(
            fast_root = ?meta.fast_root,
            fast_level = meta.fast_level,
            root = ?meta.root,
            root_level = meta.root_level,
            "harmless fast root mismatch"
        );
    }

    // Walk every level, left to right, top to bottom. A meta page with no
    // root means a completely empty index, which has nothing to walk.
    let mut current = meta.root.map(|leftmost| Level {
        number: meta.root_level,
        leftmost,
        is_true_root: true,
    });
    let mut levels = 0u32;
    while let Some(level) = current {
        state.rightsplit = false;
        let number = level.number;
        current = match level::check_level_from_leftmost(&mut state, level)? {
            NextLevel::Unset => return Err(VerifyError::NoValidPages { level: number }),
            NextLevel::LeafDone => None,
            NextLevel::Down(next) => Some(next),
        };
        levels += 1;
    }

    let mut rows_present = 0;
    if let Some(table) = options.table() {
        rows_present = crosscheck::verify_rows_indexed(&mut state, table)?;
    }

    Ok(VerifySummary {
        levels,
        pages: state.pages_visited,
        entries: state.entries_checked,
        entries_fingerprinted: state.entries_fingerprinted,
        rows_present,
        suppressed_races: state.suppressed_races,
    })
}
