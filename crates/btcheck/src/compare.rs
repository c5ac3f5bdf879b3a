//! Key comparison and the ordering invariant predicates.
//!
//! A [`SearchKey`] is built from an existing entry and compared against
//! other entries the way an index scan would compare them: attribute by
//! attribute, byte-wise, with the tie-breaking row reference as the last
//! implicit attribute. Pivot entries may have truncated attributes; a
//! truncated attribute sorts below every concrete value.
//!
//! The predicates return `Ok(false)` for an ordering violation (the caller
//! owns the error report, which needs page context) and `Err` only when the
//! bytes being compared are themselves malformed.

use std::cmp::Ordering;

use btcheck_error::{Result, VerifyError};
use btcheck_types::{Entry, ItemOffset, RowId};
use smallvec::SmallVec;

use crate::source::{Node, entry_at};

/// An insertion-ordered search key derived from an entry.
#[derive(Debug, Clone)]
pub(crate) struct SearchKey {
    pub attrs: SmallVec<[Vec<u8>; 4]>,
    pub tiebreak: Option<RowId>,
    /// Under the strict key space, a key that lacks a tie-breaker normally
    /// compares greater than an otherwise-equal entry that also lacks one,
    /// so that scans land past truncated pivots. Bounds checking needs the
    /// opposite: a key must never compare greater than the pivot its values
    /// came from, or corruption could be assumed away instead of verified.
    pub pivot_search: bool,
    pub heap_keyspace: bool,
}

impl SearchKey {
    /// Key from an entry's attributes and tie-breaker, for bounds checks.
    pub(crate) fn for_bounds(entry: &Entry, heap_keyspace: bool) -> Self {
        Self::from_entry(entry, heap_keyspace, true)
    }

    /// Key for an independent search, behaving exactly like a lookup of the
    /// entry would.
    pub(crate) fn for_search(entry: &Entry, heap_keyspace: bool) -> Self {
        Self::from_entry(entry, heap_keyspace, false)
    }

    fn from_entry(entry: &Entry, heap_keyspace: bool, pivot_search: bool) -> Self {
        Self {
            attrs: entry.attrs.iter().map(|a| a.value.clone()).collect(),
            tiebreak: if heap_keyspace { entry.tiebreak } else { None },
            pivot_search,
            heap_keyspace,
        }
    }

    pub(crate) fn natts(&self) -> u16 {
        self.attrs.len() as u16
    }

    /// Attribute values rendered in hex for error context.
    pub(crate) fn render(&self) -> String {
        let mut out = String::new();
        for (i, attr) in self.attrs.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            for byte in attr {
                out.push_str(&format!("{byte:02x}"));
            }
        }
        out
    }
}

/// Compare a search key against an entry.
///
/// Attributes the entry lacks (truncated pivots) compare below everything,
/// so a key with more attributes than the entry is greater outright. When
/// all common attributes are equal the tie-breaker decides; an entry
/// without one sorts below any key that has one.
pub(crate) fn compare_entry(key: &SearchKey, entry: &Entry) -> Ordering {
    let common = key.attrs.len().min(entry.attrs.len());
    for i in 0..common {
        match key.attrs[i].as_slice().cmp(entry.attrs[i].value.as_slice()) {
            Ordering::Equal => {}
            unequal => return unequal,
        }
    }
    if key.attrs.len() > entry.attrs.len() {
        return Ordering::Greater;
    }
    if !key.heap_keyspace {
        return Ordering::Equal;
    }

    match key.tiebreak {
        None => {
            // An untruncated key should land past an equal entry that also
            // has no tie-breaker, except when the caller is bounds-checking
            // against pivots (see `pivot_search`).
            if !key.pivot_search
                && key.attrs.len() == entry.attrs.len()
                && entry.tiebreak.is_none()
            {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        }
        Some(tid) => match entry.tiebreak {
            // Truncated tie-breaker is minus infinity.
            None => Ordering::Greater,
            Some(entry_tid) => tid.cmp(&entry_tid),
        },
    }
}

/// Key strictly below the item at `upper` on `node`?
///
/// Byte-wise comparison cannot tell that a key is *less than* an entry on
/// the basis of the key's own truncated attributes, so an equal comparison
/// gets an extra step simulating minus-infinity values for the omitted
/// attributes: the key is still strictly below when the item carries more
/// attributes, or an explicit tie-breaker the key lacks.
pub(crate) fn invariant_l_offset(key: &SearchKey, node: &Node, upper: ItemOffset) -> Result<bool> {
    if !key.heap_keyspace {
        // Legacy format allows equal sibling entries.
        return invariant_leq_offset(key, node, upper);
    }

    let (_, entry) = entry_at(node, upper)?;
    match compare_entry(key, &entry) {
        Ordering::Less => Ok(true),
        Ordering::Greater => Ok(false),
        Ordering::Equal => {
            require_tiebreak(node, upper, &entry)?;
            if key.natts() == entry.natts() {
                Ok(key.tiebreak.is_none() && entry.tiebreak.is_some())
            } else {
                Ok(key.natts() < entry.natts())
            }
        }
    }
}

/// Key at or below the item at `upper` on `node`?
pub(crate) fn invariant_leq_offset(
    key: &SearchKey,
    node: &Node,
    upper: ItemOffset,
) -> Result<bool> {
    let (_, entry) = entry_at(node, upper)?;
    Ok(compare_entry(key, &entry) != Ordering::Greater)
}

/// Key strictly above the item at `lower` on `node`?
///
/// There is no need to simulate minus-infinity key attributes here; the
/// comparison already resolves truncated entry attributes as below the key,
/// and equal-versus-less both indicate corruption to every caller.
pub(crate) fn invariant_g_offset(key: &SearchKey, node: &Node, lower: ItemOffset) -> Result<bool> {
    let (_, entry) = entry_at(node, lower)?;
    let cmp = compare_entry(key, &entry);
    if !key.heap_keyspace {
        // Legacy format allows equal sibling entries.
        return Ok(cmp != Ordering::Less);
    }
    Ok(cmp == Ordering::Greater)
}

/// [`invariant_l_offset`] against a page other than the walk target: used
/// to check a parent's separator key against child page items.
pub(crate) fn invariant_l_child_offset(
    key: &SearchKey,
    child: &Node,
    upper: ItemOffset,
) -> Result<bool> {
    invariant_l_offset(key, child, upper)
}

/// A non-pivot entry under the strict key space must carry its tie-breaker.
fn require_tiebreak(node: &Node, offset: ItemOffset, entry: &Entry) -> Result<()> {
    let nonpivot = node.is_leaf() && offset >= node.first_data_offset();
    if nonpivot && entry.tiebreak.is_none() {
        return Err(VerifyError::MissingTieBreaker {
            block: node.block.get(),
            offset,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use btcheck_types::entry::{Attr, EntryFlags};

    fn entry(values: &[&[u8]], tiebreak: Option<RowId>) -> Entry {
        Entry {
            flags: EntryFlags::empty(),
            link: None,
            tiebreak,
            attrs: values.iter().map(|v| Attr::plain(v.to_vec())).collect(),
        }
    }

    fn key(values: &[&[u8]], tiebreak: Option<RowId>, pivot_search: bool) -> SearchKey {
        SearchKey {
            attrs: values.iter().map(|v| v.to_vec()).collect(),
            tiebreak,
            pivot_search,
            heap_keyspace: true,
        }
    }

    #[test]
    fn attribute_bytes_dominate() {
        let e = entry(&[b"banana"], Some(RowId::new(1, 1)));
        assert_eq!(
            compare_entry(&key(&[b"apple"], None, true), &e),
            Ordering::Less
        );
        assert_eq!(
            compare_entry(&key(&[b"cherry"], None, true), &e),
            Ordering::Greater
        );
    }

    #[test]
    fn truncated_attributes_are_minus_infinity() {
        // Entry truncated to one attribute; key carries two.
        let truncated = entry(&[b"b"], None);
        let k = key(&[b"b", b"x"], None, true);
        assert_eq!(compare_entry(&k, &truncated), Ordering::Greater);
    }

    #[test]
    fn tiebreak_resolves_equal_attributes() {
        let e = entry(&[b"k"], Some(RowId::new(5, 2)));
        assert_eq!(
            compare_entry(&key(&[b"k"], Some(RowId::new(5, 1)), false), &e),
            Ordering::Less
        );
        assert_eq!(
            compare_entry(&key(&[b"k"], Some(RowId::new(5, 2)), false), &e),
            Ordering::Equal
        );
        assert_eq!(
            compare_entry(&key(&[b"k"], Some(RowId::new(5, 3)), false), &e),
            Ordering::Greater
        );
        // Entry without a tie-breaker sorts below any key with one.
        assert_eq!(
            compare_entry(&key(&[b"k"], Some(RowId::new(0, 0)), false), &entry(&[b"k"], None)),
            Ordering::Greater
        );
    }

    #[test]
    fn pivot_search_suppresses_past_pivot_tiebreak() {
        let pivot = entry(&[b"k"], None);
        // A plain search key lands past an equal truncated pivot.
        assert_eq!(
            compare_entry(&key(&[b"k"], None, false), &pivot),
            Ordering::Greater
        );
        // Bounds checking must not assume the same.
        assert_eq!(
            compare_entry(&key(&[b"k"], None, true), &pivot),
            Ordering::Equal
        );
    }
}
