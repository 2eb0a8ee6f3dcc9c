//! Grid adapter
//!
//! Converts between the sparse persisted cell list and the dense in-memory
//! grid (rows x 26 columns). Persisted row numbers are always the row's
//! position in the grid; row identity travels separately in [`GridRow::id`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use gridsync_protocol::PersistedCell;

use crate::cell::{CellValue, Column, RowId, RowRecord, COLUMN_COUNT};

/// Highest row index a freshly loaded grid always materializes
pub const MIN_LAST_ROW: usize = 99;

/// Persisted rows at or beyond this index are treated as malformed
pub const MAX_ROWS: i64 = 100_000;

/// One dense grid row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridRow {
    pub id: RowId,
    cells: Vec<CellValue>,
}

impl GridRow {
    /// Empty row
    pub fn new(id: RowId) -> Self {
        Self {
            id,
            cells: vec![CellValue::empty(); COLUMN_COUNT],
        }
    }

    pub fn cell(&self, column: Column) -> &CellValue {
        &self.cells[column.index()]
    }

    pub fn cells(&self) -> &[CellValue] {
        &self.cells
    }

    /// Set a cell, returning whether the value changed
    pub fn set(&mut self, column: Column, value: CellValue) -> bool {
        let slot = &mut self.cells[column.index()];
        if *slot == value {
            false
        } else {
            *slot = value;
            true
        }
    }

    pub fn from_record(record: &RowRecord) -> Self {
        let mut row = Self::new(record.id.clone());
        for (column, value) in &record.columns {
            row.cells[column.index()] = value.clone();
        }
        row
    }

    pub fn to_record(&self) -> RowRecord {
        let mut record = RowRecord::new(self.id.clone());
        for column in Column::all() {
            record.set(column, self.cells[column.index()].clone());
        }
        record
    }
}

/// Dense grid in display order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Grid {
    rows: Vec<GridRow>,
}

impl Grid {
    pub const fn new(rows: Vec<GridRow>) -> Self {
        Self { rows }
    }

    /// Grid mirroring a document snapshot, one row per row id
    ///
    /// See [`collapse_records`] for records sharing an id.
    pub fn from_records(records: &[RowRecord]) -> Self {
        Self::new(collapse_records(records).iter().map(GridRow::from_record).collect())
    }

    pub fn rows(&self) -> &[GridRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn records(&self) -> Vec<RowRecord> {
        self.rows.iter().map(GridRow::to_record).collect()
    }

    /// Display index of a row (linear scan)
    pub fn position_of(&self, id: &RowId) -> Option<usize> {
        self.rows.iter().position(|row| &row.id == id)
    }

    pub fn row(&self, id: &RowId) -> Option<&GridRow> {
        self.rows.iter().find(|row| &row.id == id)
    }

    pub fn row_mut(&mut self, id: &RowId) -> Option<&mut GridRow> {
        self.rows.iter_mut().find(|row| &row.id == id)
    }

    pub fn push(&mut self, row: GridRow) {
        self.rows.push(row);
    }

    /// Replace the row order; callers guarantee `rows` is a permutation
    pub(crate) fn set_rows(&mut self, rows: Vec<GridRow>) {
        self.rows = rows;
    }
}

/// Merge records that carry the same row id
///
/// Concurrent edits of one row each swap in their own copy of the record,
/// so a merged document can hold several. They collapse into one record at
/// the position of the first copy; every cell takes the first non-empty
/// value in document order. All replicas see the same order, so all pick
/// the same result.
pub fn collapse_records(records: &[RowRecord]) -> Vec<RowRecord> {
    let mut positions: HashMap<&RowId, usize> = HashMap::with_capacity(records.len());
    let mut out: Vec<RowRecord> = Vec::with_capacity(records.len());
    for record in records {
        if let Some(&at) = positions.get(&record.id) {
            out[at].absorb(record);
        } else {
            positions.insert(&record.id, out.len());
            out.push(record.clone());
        }
    }
    out
}

/// Build the dense grid from a persisted cell list
///
/// The grid has `max(last_row_seen, 99) + 1` rows. Cells outside the 26
/// columns or beyond [`MAX_ROWS`] are dropped; a later duplicate of the same
/// coordinates wins. `assign_id` names the row created at each position.
pub fn to_grid(cells: &[PersistedCell], mut assign_id: impl FnMut(usize) -> RowId) -> Grid {
    let mut accepted: Vec<(usize, Column, CellValue)> = Vec::with_capacity(cells.len());
    for cell in cells {
        let Some((row, column)) = coordinates(cell) else {
            tracing::warn!(
                row = cell.row,
                col = cell.col,
                "Dropping persisted cell outside the grid"
            );
            continue;
        };
        accepted.push((row, column, cell_value(cell)));
    }

    let last_row = accepted
        .iter()
        .map(|(row, _, _)| *row)
        .max()
        .unwrap_or(0)
        .max(MIN_LAST_ROW);

    let mut rows: Vec<GridRow> = (0..=last_row).map(|i| GridRow::new(assign_id(i))).collect();
    for (row, column, value) in accepted {
        rows[row].set(column, value);
    }
    Grid::new(rows)
}

/// Flatten a grid into the sparse persisted cell list
///
/// Cells are emitted in row-then-column order, numbered by display position.
/// Scalar cells without text are never emitted; structured cells always are.
pub fn to_cells(grid: &Grid) -> Vec<PersistedCell> {
    let mut cells = Vec::new();
    for (row_index, row) in grid.rows().iter().enumerate() {
        for column in Column::all() {
            let value = row.cell(column);
            if value.is_empty() {
                continue;
            }
            let (row, col) = (row_index as i64, column.index() as i64);
            cells.push(match value {
                CellValue::Scalar { text } => PersistedCell::scalar(row, col, text.clone()),
                CellValue::Structured { text, kind, items } => {
                    PersistedCell::structured(row, col, text.clone(), *kind, items.clone())
                }
            });
        }
    }
    cells
}

fn coordinates(cell: &PersistedCell) -> Option<(usize, Column)> {
    if !(0..MAX_ROWS).contains(&cell.row) {
        return None;
    }
    let column = usize::try_from(cell.col).ok().and_then(Column::from_index)?;
    Some((usize::try_from(cell.row).ok()?, column))
}

fn cell_value(cell: &PersistedCell) -> CellValue {
    match cell.kind {
        Some(kind) => CellValue::Structured {
            text: cell.value.clone(),
            kind,
            items: cell.attachments.clone().unwrap_or_default(),
        },
        None => CellValue::scalar(cell.value.clone()),
    }
}

/// Grid snapshot shared between the session and the remote observer
///
/// Document observers and transactions may take this lock under the
/// document gate, so never open a transaction while holding it.
#[derive(Debug, Clone, Default)]
pub struct SharedGrid(Arc<Mutex<Grid>>);

impl SharedGrid {
    pub fn new(grid: Grid) -> Self {
        Self(Arc::new(Mutex::new(grid)))
    }

    pub fn lock(&self) -> MutexGuard<'_, Grid> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> Grid {
        self.lock().clone()
    }

    pub fn replace(&self, grid: Grid) {
        *self.lock() = grid;
    }
}
