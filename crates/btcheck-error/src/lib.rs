use thiserror::Error;

/// Primary error type for btcheck verification runs.
///
/// Every corruption finding gets its own variant carrying the structured
/// context needed to locate the exact violation: block number, item offset,
/// rendered keys, and the page version stamp that was current when the page
/// was copied. Verification aborts on the first finding; there is no
/// collect-all mode.
#[derive(Error, Debug)]
pub enum VerifyError {
    // === Malformed slots (page cannot be trusted further) ===
    /// A slot's offset/length reaches past the end of the page's item space.
    #[error(
        "slot points past end of item space: block={block} offset={offset} \
         slot_off={slot_off} slot_len={slot_len}"
    )]
    SlotOutOfBounds {
        block: u32,
        offset: u16,
        slot_off: u16,
        slot_len: u16,
    },

    /// A slot carries a storage state the index never produces
    /// (redirected, unused, or zero length).
    #[error(
        "invalid slot storage: block={block} offset={offset} \
         slot_off={slot_off} slot_len={slot_len} state={state}"
    )]
    SlotStorage {
        block: u32,
        offset: u16,
        slot_off: u16,
        slot_len: u16,
        state: u8,
    },

    /// Entry bytes at a well-formed slot could not be decoded.
    #[error("undecodable entry: block={block} offset={offset}: {detail}")]
    EntryDecode {
        block: u32,
        offset: u16,
        detail: String,
    },

    /// A non-pivot entry lacks the row reference that breaks key ties.
    #[error("non-pivot entry lacks tie-breaking row reference: block={block} offset={offset}")]
    MissingTieBreaker { block: u32, offset: u16 },

    // === Page-level sanity ===
    /// Page shorter than the fixed page size.
    #[error("short page read: block={block} got {len} bytes")]
    TruncatedPage { block: u32, len: usize },

    /// Meta page failed its own validation.
    #[error("meta page is corrupt: {detail}")]
    MetaCorrupt { detail: String },

    /// On-disk format version outside the supported range.
    #[error("format version mismatch: file version {version}, supported {min}..={max}")]
    MetaVersion { version: u32, min: u32, max: u32 },

    /// A non-meta block carries the meta flag.
    #[error("invalid meta page found at block {block}")]
    UnexpectedMetaFlag { block: u32 },

    /// A leaf page declares a non-zero level.
    #[error("invalid leaf page level {level} for block {block}")]
    LeafLevelNonZero { block: u32, level: u32 },

    /// An internal page declares level zero.
    #[error("invalid internal page level 0 for block {block}")]
    InternalLevelZero { block: u32 },

    /// More slots on a page than the page could possibly hold.
    #[error("number of items on block {block} exceeds per-page maximum ({count} > {max})")]
    TooManyItems { block: u32, count: u16, max: u16 },

    /// Internal page without a negative-infinity downlink item.
    #[error("internal block {block} lacks high key and/or at least one downlink")]
    InternalMissingItems { block: u32 },

    /// Non-rightmost leaf without a high key item.
    #[error("non-rightmost leaf block {block} lacks high key item")]
    LeafMissingHighKey { block: u32 },

    /// Internal pages are never marked half-dead by any supported version.
    #[error("internal block {block} is half-dead")]
    InternalHalfDead { block: u32 },

    // === Structural invariants ===
    /// A sibling or downlink led to a fully deleted page in strict mode.
    #[error(
        "sibling link points to deleted block: block={block} left={left} \
         left_link_from_block={left_link}"
    )]
    SiblingToDeleted { block: u32, left: u32, left_link: u32 },

    /// The rightmost page of a level was deleted or half-dead.
    #[error("block {block} fell off the end of the index")]
    FellOffEnd { block: u32 },

    /// The first valid page of a level is not actually leftmost.
    #[error("block {block} is not leftmost")]
    NotLeftmost { block: u32 },

    /// The page the meta page named as true root is not flagged as root.
    #[error("block {block} is not true root")]
    NotTrueRoot { block: u32 },

    /// Left link of a page disagrees with the block actually visited before it.
    #[error(
        "left link/right link pair not in agreement: block={block} left={left} \
         left_link_from_block={left_link}"
    )]
    SiblingAgreement { block: u32, left: u32, left_link: u32 },

    /// A page's declared level differs from the level being walked.
    #[error("block {block} declares level {actual}, expected {expected}")]
    LevelMismatch {
        block: u32,
        expected: u32,
        actual: u32,
    },

    /// Sibling chain revisits a recently seen block.
    #[error("circular link chain found at block {block}")]
    CircularChain { block: u32 },

    /// A level below the current one yielded no valid pages at all.
    #[error("no valid pages on level below {level} or first level")]
    NoValidPages { level: u32 },

    /// High key has an impossible number of key attributes.
    #[error("wrong number of high key attributes: block={block} natts={natts} stamp={stamp:#x}")]
    HighKeyAttrCount { block: u32, natts: u16, stamp: u64 },

    /// Entry has an impossible number of key attributes.
    #[error(
        "wrong number of entry attributes: block={block} offset={offset} natts={natts} \
         stamp={stamp:#x}"
    )]
    EntryAttrCount {
        block: u32,
        offset: u16,
        natts: u16,
        stamp: u64,
    },

    /// Entry's self-reported size disagrees with its slot length.
    #[error(
        "entry size does not equal slot length: block={block} offset={offset} \
         size={size} slot_len={slot_len} stamp={stamp:#x}"
    )]
    SizeMismatch {
        block: u32,
        offset: u16,
        size: usize,
        slot_len: u16,
        stamp: u64,
    },

    /// Entry exceeds the applicable per-entry size budget.
    #[error(
        "entry size {size} exceeds maximum {max}: block={block} offset={offset} stamp={stamp:#x}"
    )]
    OversizeEntry {
        block: u32,
        offset: u16,
        size: usize,
        max: usize,
        stamp: u64,
    },

    /// An entry is not bounded by the page's high key.
    #[error(
        "high key invariant violated: block={block} offset={offset} key={key} \
         high_key={high_key} stamp={stamp:#x}"
    )]
    HighKeyBound {
        block: u32,
        offset: u16,
        key: String,
        high_key: String,
        stamp: u64,
    },

    /// Adjacent entries on a page are not strictly ascending.
    #[error(
        "item order invariant violated: block={block} offset={offset} lower={lower} \
         upper={upper} stamp={stamp:#x}"
    )]
    ItemOrder {
        block: u32,
        offset: u16,
        lower: String,
        upper: String,
        stamp: u64,
    },

    /// Last entry of a page is not below the right sibling's first entry.
    #[error(
        "cross page item order invariant violated: block={block} offset={offset} \
         last_key={last_key} right_key={right_key} stamp={stamp:#x}"
    )]
    CrossPageOrder {
        block: u32,
        offset: u16,
        last_key: String,
        right_key: String,
        stamp: u64,
    },

    /// A leaf entry could not be found by an independent search from the root.
    #[error(
        "could not find entry using search from root: block={block} offset={offset} \
         row=({row_block},{row_slot}) stamp={stamp:#x}"
    )]
    RootDescendMissing {
        block: u32,
        offset: u16,
        row_block: u32,
        row_slot: u16,
        stamp: u64,
    },

    // === Downlink inconsistencies ===
    /// A downlink references a fully deleted page.
    #[error("downlink to deleted page: parent={parent} child={child} parent_stamp={stamp:#x}")]
    DownlinkToDeleted { parent: u32, child: u32, stamp: u64 },

    /// Parent separator key is not a strict lower bound on a child entry.
    #[error(
        "downlink lower bound invariant violated: parent={parent} child={child} \
         child_offset={offset} separator={separator} parent_stamp={stamp:#x}"
    )]
    DownlinkLowerBound {
        parent: u32,
        child: u32,
        offset: u16,
        separator: String,
        stamp: u64,
    },

    /// A downlink descent found a child whose level is not one level down.
    #[error(
        "downlink points to block whose level is not one level down: \
         top_parent={parent} child={child} expected={expected} actual={actual}"
    )]
    DownlinkLevel {
        parent: u32,
        child: u32,
        expected: u32,
        actual: u32,
    },

    /// The leftmost leaf descendant of an orphaned page is fully deleted.
    #[error(
        "downlink to deleted leaf page: top_parent={parent} leaf={leaf} \
         top_parent_stamp={stamp:#x}"
    )]
    DeletedLeafDescendant { parent: u32, leaf: u32, stamp: u64 },

    /// A leaf page has no downlink and no benign explanation.
    #[error("leaf block {block} lacks downlink: stamp={stamp:#x}")]
    LeafMissingDownlink { block: u32, stamp: u64 },

    /// An internal page has no downlink and its descent does not resolve to a
    /// consistent top-parent reference.
    #[error("internal block {block} (level {level}) lacks downlink: stamp={stamp:#x}")]
    InternalMissingDownlink { block: u32, level: u32, stamp: u64 },

    // === Cross-check mismatches ===
    /// A live table row has no matching index entry fingerprint.
    #[error("table row ({row_block},{row_slot}) lacks matching index entry")]
    RowNotIndexed {
        row_block: u32,
        row_slot: u16,
        /// Whether the run that found the mismatch was a tolerant-mode run,
        /// which cannot rule out a race as the cause.
        tolerant: bool,
    },

    // === Non-corruption outcomes ===
    /// Run aborted by the caller's cancellation signal.
    #[error("verification interrupted")]
    Interrupted,

    /// Independent-search probing requires the strict key-space format.
    #[error("cannot verify entries by independent search: index predates strict key space")]
    LegacyRootDescend,

    /// Page fetch failed below the verification layer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The page source has no page for the requested block.
    #[error("block {block} does not exist")]
    BlockNotFound { block: u32 },
}

/// Coarse classification of a verification failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// An item slot cannot be safely dereferenced.
    MalformedSlot,
    /// Ordering, linkage, level, attribute-count, or size invariant broken.
    StructuralInvariant,
    /// Parent/child downlink relationship broken.
    DownlinkInconsistency,
    /// Index and table disagree about row membership.
    CrossCheckMismatch,
    /// Run cancelled; not a corruption verdict.
    Interrupted,
    /// Requested check is not supported for this index format.
    Unsupported,
    /// Underlying page access failed.
    Io,
}

impl VerifyError {
    /// Classify this error per the verification taxonomy.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::SlotOutOfBounds { .. }
            | Self::SlotStorage { .. }
            | Self::EntryDecode { .. }
            | Self::MissingTieBreaker { .. } => ErrorKind::MalformedSlot,
            Self::TruncatedPage { .. }
            | Self::MetaCorrupt { .. }
            | Self::MetaVersion { .. }
            | Self::UnexpectedMetaFlag { .. }
            | Self::LeafLevelNonZero { .. }
            | Self::InternalLevelZero { .. }
            | Self::TooManyItems { .. }
            | Self::InternalMissingItems { .. }
            | Self::LeafMissingHighKey { .. }
            | Self::InternalHalfDead { .. }
            | Self::SiblingToDeleted { .. }
            | Self::FellOffEnd { .. }
            | Self::NotLeftmost { .. }
            | Self::NotTrueRoot { .. }
            | Self::SiblingAgreement { .. }
            | Self::LevelMismatch { .. }
            | Self::CircularChain { .. }
            | Self::NoValidPages { .. }
            | Self::HighKeyAttrCount { .. }
            | Self::EntryAttrCount { .. }
            | Self::SizeMismatch { .. }
            | Self::OversizeEntry { .. }
            | Self::HighKeyBound { .. }
            | Self::ItemOrder { .. }
            | Self::CrossPageOrder { .. }
            | Self::RootDescendMissing { .. } => ErrorKind::StructuralInvariant,
            Self::DownlinkToDeleted { .. }
            | Self::DownlinkLowerBound { .. }
            | Self::DownlinkLevel { .. }
            | Self::DeletedLeafDescendant { .. }
            | Self::LeafMissingDownlink { .. }
            | Self::InternalMissingDownlink { .. } => ErrorKind::DownlinkInconsistency,
            Self::RowNotIndexed { .. } => ErrorKind::CrossCheckMismatch,
            Self::Interrupted => ErrorKind::Interrupted,
            Self::LegacyRootDescend => ErrorKind::Unsupported,
            Self::Io(_) | Self::BlockNotFound { .. } => ErrorKind::Io,
        }
    }

    /// Whether this error is a corruption verdict (as opposed to a cancelled
    /// run, an unsupported request, or an I/O failure).
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::MalformedSlot
                | ErrorKind::StructuralInvariant
                | ErrorKind::DownlinkInconsistency
                | ErrorKind::CrossCheckMismatch
        )
    }

    /// Human-friendly suggestion for acting on this error.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::RowNotIndexed { tolerant: true, .. } => {
                Some("Re-run verification in strict mode; tolerant mode cannot rule out a race")
            }
            Self::SizeMismatch { .. } => Some("This could be a torn page problem"),
            Self::InternalHalfDead { .. } => {
                Some("This state predates the supported format; rebuild the index")
            }
            _ if self.is_corruption() => Some("Rebuild the index from the table"),
            _ => None,
        }
    }
}

/// Result type alias using `VerifyError`.
pub type Result<T> = std::result::Result<T, VerifyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_mapping() {
        let err = VerifyError::SlotOutOfBounds {
            block: 3,
            offset: 2,
            slot_off: 8000,
            slot_len: 64,
        };
        assert_eq!(err.kind(), ErrorKind::MalformedSlot);
        assert!(err.is_corruption());

        let err = VerifyError::ItemOrder {
            block: 3,
            offset: 2,
            lower: "0203".to_owned(),
            upper: "0101".to_owned(),
            stamp: 0x10,
        };
        assert_eq!(err.kind(), ErrorKind::StructuralInvariant);

        let err = VerifyError::DownlinkToDeleted {
            parent: 4,
            child: 9,
            stamp: 0,
        };
        assert_eq!(err.kind(), ErrorKind::DownlinkInconsistency);

        assert_eq!(VerifyError::Interrupted.kind(), ErrorKind::Interrupted);
        assert!(!VerifyError::Interrupted.is_corruption());
        assert_eq!(
            VerifyError::LegacyRootDescend.kind(),
            ErrorKind::Unsupported
        );
    }

    #[test]
    fn display_carries_context() {
        let err = VerifyError::CrossPageOrder {
            block: 7,
            offset: 12,
            last_key: "ff01".to_owned(),
            right_key: "aa00".to_owned(),
            stamp: 0x2a,
        };
        let msg = err.to_string();
        assert!(msg.contains("block=7"), "message: {msg}");
        assert!(msg.contains("last_key=ff01"), "message: {msg}");
        assert!(msg.contains("stamp=0x2a"), "message: {msg}");
    }

    #[test]
    fn tolerant_mismatch_suggests_strict_rerun() {
        let err = VerifyError::RowNotIndexed {
            row_block: 1,
            row_slot: 4,
            tolerant: true,
        };
        assert!(err.suggestion().unwrap().contains("strict"));

        let err = VerifyError::RowNotIndexed {
            row_block: 1,
            row_slot: 4,
            tolerant: false,
        };
        assert_eq!(err.suggestion(), Some("Rebuild the index from the table"));
    }

    #[test]
    fn io_error_from() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let err: VerifyError = io.into();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(!err.is_corruption());
    }
}
