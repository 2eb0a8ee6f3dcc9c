//! Properties of the persisted cell list <-> grid adapter

use std::collections::BTreeMap;

use gridsync_engine::{to_cells, to_grid, Grid, PersistedCell, RowId};
use proptest::prelude::*;

fn sparse_cells() -> impl Strategy<Value = BTreeMap<(i64, i64), String>> {
    prop::collection::btree_map((0i64..400, 0i64..26), "[a-zA-Z0-9 ]{1,10}", 0..40)
}

fn as_cells(cells: &BTreeMap<(i64, i64), String>) -> Vec<PersistedCell> {
    cells
        .iter()
        .map(|(&(row, col), value)| PersistedCell::scalar(row, col, value.clone()))
        .collect()
}

proptest! {
    #[test]
    fn sparse_list_survives_the_grid(cells in sparse_cells()) {
        let persisted = as_cells(&cells);
        let grid = to_grid(&persisted, |i| RowId::new(format!("r{i}")));

        let last_row = cells.keys().map(|(row, _)| *row as usize).max().unwrap_or(0);
        prop_assert_eq!(grid.len(), last_row.max(99) + 1);
        // BTreeMap order is row-then-column, the order cells are emitted in
        prop_assert_eq!(to_cells(&grid), persisted);
    }

    #[test]
    fn input_order_does_not_matter(cells in sparse_cells()) {
        let persisted = as_cells(&cells);
        let mut reversed = persisted.clone();
        reversed.reverse();
        let grid = to_grid(&reversed, |_| RowId::fresh());
        prop_assert_eq!(to_cells(&grid), persisted);
    }

    #[test]
    fn cells_outside_the_grid_are_dropped(
        cells in sparse_cells(),
        bad_col in 26i64..100,
        bad_row in -50i64..0,
    ) {
        let mut persisted = as_cells(&cells);
        let expected = persisted.clone();
        persisted.push(PersistedCell::scalar(0, bad_col, "outside"));
        persisted.push(PersistedCell::scalar(bad_row, 0, "negative"));
        prop_assert_eq!(to_cells(&to_grid(&persisted, |_| RowId::fresh())), expected);
    }

    #[test]
    fn document_records_rebuild_the_same_grid(cells in sparse_cells()) {
        let grid = to_grid(&as_cells(&cells), |i| RowId::new(format!("r{i}")));
        prop_assert_eq!(Grid::from_records(&grid.records()), grid);
    }
}

#[test]
fn empty_values_are_not_persisted() {
    let grid = to_grid(
        &[PersistedCell::scalar(5, 3, ""), PersistedCell::scalar(6, 3, "kept")],
        |_| RowId::fresh(),
    );
    assert_eq!(to_cells(&grid), vec![PersistedCell::scalar(6, 3, "kept")]);
}

#[test]
fn later_duplicate_wins() {
    let grid = to_grid(
        &[PersistedCell::scalar(1, 1, "old"), PersistedCell::scalar(1, 1, "new")],
        |_| RowId::fresh(),
    );
    assert_eq!(to_cells(&grid), vec![PersistedCell::scalar(1, 1, "new")]);
}
