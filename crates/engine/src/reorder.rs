//! Row reorder synchronizer
//!
//! After a drag reorder the widget reports the new row order. The whole
//! document sequence is rewritten in that order in one transaction, which
//! also brings any drifted rows back into the document and leaves a single
//! record per row id.

use std::collections::{HashMap, HashSet};

use crate::cell::RowId;
use crate::document::{SheetDocument, UpdateOrigin};
use crate::error::Result;
use crate::grid::{Grid, GridRow, SharedGrid};

/// Resolve a requested order into a permutation of the grid rows
///
/// Unknown ids are ignored, repeated ids keep their first occurrence, and
/// rows missing from `order` follow the listed ones in their current order.
pub fn resolve_order(grid: &Grid, order: &[RowId]) -> Vec<GridRow> {
    let mut placed: HashSet<&RowId> = HashSet::with_capacity(grid.len());
    let mut rows = Vec::with_capacity(grid.len());

    for id in order {
        if placed.contains(id) {
            continue;
        }
        match grid.row(id) {
            Some(row) => {
                placed.insert(&row.id);
                rows.push(row.clone());
            }
            None => tracing::warn!(row_id = %id, "Ignoring unknown row in reorder"),
        }
    }
    rows.extend(
        grid.rows()
            .iter()
            .filter(|row| !placed.contains(&row.id))
            .cloned(),
    );
    rows
}

/// Writes reorders through to the document
#[derive(Debug, Clone)]
pub struct RowReorderSynchronizer {
    grid: SharedGrid,
}

impl RowReorderSynchronizer {
    pub const fn new(grid: SharedGrid) -> Self {
        Self { grid }
    }

    /// Reorder rows to `order`, returning the number of rows written
    ///
    /// Row contents come from the document inside the transaction, so
    /// remote changes merged since the grid was last refreshed are written
    /// back rather than overwritten. Rows only the grid knows about (drifted
    /// rows) keep their grid contents.
    pub fn reorder(&self, document: &SheetDocument, order: &[RowId]) -> Result<usize> {
        let written = document.transact(UpdateOrigin::Local, |txn| {
            let mut grid = self.grid.lock();
            let current = Grid::from_records(&txn.records());
            let rows = resolve_order(&with_document_contents(&grid, &current), order);
            let records: Vec<_> = rows.iter().map(GridRow::to_record).collect();

            let len = txn.len();
            txn.delete_range(0, len);
            txn.insert(0, &records)?;
            grid.set_rows(rows);
            Ok(records.len())
        })?;

        let count = match written {
            Some(count) => count,
            None => {
                let mut grid = self.grid.lock();
                let rows = resolve_order(&grid, order);
                let count = rows.len();
                grid.set_rows(rows);
                count
            }
        };

        tracing::debug!(sheet_id = %document.sheet_id(), rows = count, "Rows reordered");
        Ok(count)
    }
}

/// The grid's row order with each row's contents taken from `document`
///
/// Document rows the grid has not seen yet follow in document order.
fn with_document_contents(grid: &Grid, document: &Grid) -> Grid {
    let by_id: HashMap<&RowId, &GridRow> = document.rows().iter().map(|row| (&row.id, row)).collect();
    let mut rows: Vec<GridRow> = grid
        .rows()
        .iter()
        .map(|row| by_id.get(&row.id).map_or_else(|| row.clone(), |fresh| (*fresh).clone()))
        .collect();
    let known: HashSet<&RowId> = grid.rows().iter().map(|row| &row.id).collect();
    rows.extend(
        document
            .rows()
            .iter()
            .filter(|row| !known.contains(&row.id))
            .cloned(),
    );
    Grid::new(rows)
}
