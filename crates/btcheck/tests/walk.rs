//! Clean verification runs over sound trees: the walk should finish and the
//! summary should account for every page and entry.

use btcheck::mem::{MemTableSource, TreeBuilder, ascending_rows, set_slot_state};
use btcheck::{Error, VerifyOptions, verify_index};
use btcheck_types::cx::Cx;
use btcheck_types::page::{PageFlags, SlotState};

fn tolerant() -> VerifyOptions<'static> {
    VerifyOptions::Tolerant { cross_check: None }
}

fn strict() -> VerifyOptions<'static> {
    VerifyOptions::Strict {
        cross_check: None,
        root_descend: false,
    }
}

#[test]
fn empty_index_has_nothing_to_walk() {
    let source = TreeBuilder::default().build(&[]).into_source();
    let summary = verify_index(&source, &strict(), &Cx::new()).unwrap();
    assert_eq!(summary.levels, 0);
    assert_eq!(summary.pages, 0);
    assert_eq!(summary.entries, 0);
}

#[test]
fn single_leaf_tree_verifies() {
    let source = TreeBuilder::default().build(&ascending_rows(3)).into_source();
    let summary = verify_index(&source, &strict(), &Cx::new()).unwrap();
    assert_eq!(summary.levels, 1);
    assert_eq!(summary.pages, 1);
    assert_eq!(summary.entries, 3);
}

#[test]
fn two_level_tree_verifies_tolerant_and_strict() {
    let tree = TreeBuilder::default().build(&ascending_rows(10));
    let source = tree.into_source();

    for options in [tolerant(), strict()] {
        let summary = verify_index(&source, &options, &Cx::new()).unwrap();
        assert_eq!(summary.levels, 2);
        // Root plus three leaves.
        assert_eq!(summary.pages, 4);
        // Ten leaf entries plus two root separators; negative infinity
        // items and high keys are not data entries.
        assert_eq!(summary.entries, 12);
        assert_eq!(summary.suppressed_races, 0);
    }
}

#[test]
fn three_level_tree_with_all_checks_enabled() {
    let rows = ascending_rows(20);
    let tree = TreeBuilder::default().build(&rows);
    assert_eq!(tree.levels.len(), 3);
    let source = tree.into_source();
    let table = MemTableSource::new(rows);

    let options = VerifyOptions::Strict {
        cross_check: Some(&table),
        root_descend: true,
    };
    let summary = verify_index(&source, &options, &Cx::new()).unwrap();
    assert_eq!(summary.levels, 3);
    // Root, two internal pages, five leaves.
    assert_eq!(summary.pages, 8);
    // Twenty leaf entries, three separators on the left internal page,
    // one on the root.
    assert_eq!(summary.entries, 24);
    assert_eq!(summary.entries_fingerprinted, 20);
    assert_eq!(summary.rows_present, 20);
    assert_eq!(summary.suppressed_races, 0);
}

#[test]
fn legacy_format_tree_verifies() {
    let builder = TreeBuilder {
        version: 3,
        ..TreeBuilder::default()
    };
    let source = builder.build(&ascending_rows(10)).into_source();
    let summary = verify_index(&source, &strict(), &Cx::new()).unwrap();
    assert_eq!(summary.levels, 2);
    assert_eq!(summary.entries, 12);
}

#[test]
fn deleted_page_is_stepped_over_in_tolerant_mode() {
    let tree = TreeBuilder::default().build(&ascending_rows(10));
    let middle = tree.leaf_blocks()[1];
    let source = tree.into_source();
    source.mutate(middle, |page| {
        let mut special = page.special();
        special.flags |= PageFlags::DELETED;
        page.set_special(special);
    });

    let summary = verify_index(&source, &tolerant(), &Cx::new()).unwrap();
    // The deleted leaf is visited but not verified; the cross-page check
    // from its left sibling reaches over it.
    assert_eq!(summary.pages, 4);
    assert_eq!(summary.entries, 8);
}

#[test]
fn dead_entries_are_checked_but_not_fingerprinted() {
    let rows = ascending_rows(8);
    let tree = TreeBuilder::default().build(&rows);
    let first_leaf = tree.leaf_blocks()[0];
    let source = tree.into_source();
    // Offset 1 is the high key; offset 3 is the second data entry.
    source.mutate(first_leaf, |page| set_slot_state(page, 3, SlotState::Dead));

    // The table no longer holds the dead entry's row.
    let live_rows: Vec<_> = rows
        .iter()
        .filter(|(row, _)| *row != rows[1].0)
        .cloned()
        .collect();
    let table = MemTableSource::new(live_rows);
    let options = VerifyOptions::Strict {
        cross_check: Some(&table),
        root_descend: false,
    };

    let summary = verify_index(&source, &options, &Cx::new()).unwrap();
    // Eight leaf entries plus the root separator, dead one included.
    assert_eq!(summary.entries, 9);
    assert_eq!(summary.entries_fingerprinted, 7);
    assert_eq!(summary.rows_present, 7);
}

#[test]
fn cancellation_interrupts_the_walk() {
    let source = TreeBuilder::default().build(&ascending_rows(10)).into_source();
    let cx = Cx::new();
    cx.cancel();
    assert!(matches!(
        verify_index(&source, &strict(), &cx),
        Err(Error::Interrupted)
    ));
}
