//! Shared run state threaded through the level walk.

use btcheck_types::cx::Cx;
use btcheck_types::{MAX_ITEMS_PER_PAGE, MetaPage};

use crate::fingerprint::Bloom;
use crate::{PageSource, VerifyOptions};

/// Proof token that the caller requested strict verification and thereby
/// asserted there are no concurrent writers. The checks that are only sound
/// under that assumption take one of these instead of re-checking a flag.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StrictGuard(());

impl StrictGuard {
    pub(crate) const fn new() -> Self {
        Self(())
    }
}

/// Mutable state for one verification run.
pub(crate) struct CheckState<'a> {
    pub pages: &'a dyn PageSource,
    pub cx: &'a Cx,
    pub meta: MetaPage,
    /// Present iff this is a strict run.
    pub strict: Option<StrictGuard>,
    pub root_descend: bool,
    /// Sort keys are fully unique (tie-breaking row reference is a key
    /// attribute). Derived from the format version.
    pub heap_keyspace: bool,
    /// Fingerprints of live leaf entries, for the table cross-check.
    pub filter: Option<Bloom>,
    /// Fingerprints of downlink block numbers seen on parent levels, for
    /// the missing-downlink check. Strict cross-check runs only.
    pub downlink_filter: Option<Bloom>,
    /// Whether the page about to become the walk target is the right half
    /// of an incomplete split. Goes stale immediately in tolerant runs.
    pub rightsplit: bool,
    pub pages_visited: u64,
    pub entries_checked: u64,
    pub entries_fingerprinted: u64,
    pub suppressed_races: u64,
}

impl<'a> CheckState<'a> {
    pub(crate) fn new(
        pages: &'a dyn PageSource,
        cx: &'a Cx,
        meta: MetaPage,
        options: &VerifyOptions<'a>,
    ) -> Self {
        let strict = options.strict_guard();
        let (filter, downlink_filter) = if let Some(table) = options.table() {
            let total_pages = u64::from(pages.page_count());
            // Size for the worst case of every page being a leaf packed
            // with small entries, unless the table's own row estimate says
            // even that undershoots; non-leaf pages are a rounding error.
            let total_entries = (total_pages.max(1) * u64::from(MAX_ITEMS_PER_PAGE / 5))
                .max(table.row_estimate());
            let seed = rand::random::<u64>();
            let filter = Some(Bloom::new(total_entries, seed));
            let downlink_filter = strict.map(|_| Bloom::new(total_pages.max(1), seed));
            (filter, downlink_filter)
        } else {
            (None, None)
        };

        Self {
            pages,
            cx,
            meta,
            strict,
            root_descend: options.root_descend(),
            heap_keyspace: meta.strict_keyspace(),
            filter,
            downlink_filter,
            rightsplit: false,
            pages_visited: 0,
            entries_checked: 0,
            entries_fingerprinted: 0,
            suppressed_races: 0,
        }
    }

    pub(crate) fn is_strict(&self) -> bool {
        self.strict.is_some()
    }
}
