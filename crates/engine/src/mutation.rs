//! Local mutation pipeline
//!
//! Turns a cell edit reported by the grid widget into one document
//! transaction. Each edit runs `Idle -> Editing -> Committing -> Idle`:
//! the grid row is updated first, then the document record carrying the same
//! row id is swapped for a copy of itself with the edit applied. Other copies
//! of that row left by concurrent edits are merged into it and removed.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::cell::{CellValue, Column, RowId};
use crate::document::{SheetDocument, UpdateOrigin};
use crate::error::{Result, SyncError};
use crate::grid::{GridRow, SharedGrid};

/// Where the pipeline currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EditPhase {
    #[default]
    Idle,
    Editing,
    Committing,
}

/// A cell edit reported by the widget
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellEdit {
    pub row_id: RowId,
    pub column: Column,
    pub value: CellValue,
}

impl CellEdit {
    pub fn new(row_id: RowId, column: Column, value: CellValue) -> Self {
        Self {
            row_id,
            column,
            value,
        }
    }
}

/// Result of one edit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    /// The document record at `index` now carries the edit
    Committed { index: u32 },
    /// No document record has this row id; only the grid holds the edit
    Drifted,
    /// The document is detached; only the grid holds the edit
    Detached,
    /// The cell already had this value
    Unchanged,
}

impl EditOutcome {
    /// Whether the grid changed and needs persisting
    pub const fn changed_grid(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Applies widget edits to the grid and the document
#[derive(Debug)]
pub struct LocalMutationPipeline {
    grid: SharedGrid,
    phase: Mutex<EditPhase>,
    /// Edits are applied one at a time
    serial: Mutex<()>,
}

impl LocalMutationPipeline {
    pub fn new(grid: SharedGrid) -> Self {
        Self {
            grid,
            phase: Mutex::new(EditPhase::Idle),
            serial: Mutex::new(()),
        }
    }

    pub fn phase(&self) -> EditPhase {
        *lock(&self.phase)
    }

    /// Apply one edit
    ///
    /// Fails with [`SyncError::UnknownRow`] if the grid has no such row, in
    /// which case nothing changes.
    pub fn apply(&self, document: &SheetDocument, edit: &CellEdit) -> Result<EditOutcome> {
        let _serial = lock(&self.serial);
        let _reset = PhaseReset(&self.phase);

        self.enter(EditPhase::Editing);
        {
            let mut grid = self.grid.lock();
            let row = grid
                .row_mut(&edit.row_id)
                .ok_or_else(|| SyncError::UnknownRow(edit.row_id.clone()))?;
            if !row.set(edit.column, edit.value.clone()) {
                return Ok(EditOutcome::Unchanged);
            }
        }

        // The record is rebuilt from the document under its gate, so changes
        // merged since the grid was last refreshed are kept
        self.enter(EditPhase::Committing);
        let committed = document.transact(UpdateOrigin::Local, |rows| {
            let records = rows.records();
            let mut copies = records
                .iter()
                .enumerate()
                .filter(|(_, record)| record.id == edit.row_id);
            let Some((index, first)) = copies.next() else {
                return Ok(None);
            };
            let mut record = first.clone();
            let mut duplicates = Vec::new();
            for (at, copy) in copies {
                record.absorb(copy);
                duplicates.push(at as u32);
            }
            record.set(edit.column, edit.value.clone());

            // Back to front so earlier indices stay valid
            for at in duplicates.into_iter().rev() {
                rows.delete_range(at, 1);
            }
            let index = index as u32;
            rows.replace_at(index, &record)?;

            if let Some(row) = self.grid.lock().row_mut(&edit.row_id) {
                *row = GridRow::from_record(&record);
            }
            Ok(Some(index))
        })?;

        let outcome = match committed {
            None => EditOutcome::Detached,
            Some(None) => {
                tracing::warn!(
                    sheet_id = %document.sheet_id(),
                    row_id = %edit.row_id,
                    column = %edit.column,
                    "Row missing from document, edit kept locally until the next reorder"
                );
                EditOutcome::Drifted
            }
            Some(Some(index)) => EditOutcome::Committed { index },
        };

        tracing::trace!(row_id = %edit.row_id, column = %edit.column, ?outcome, "Cell edit applied");
        Ok(outcome)
    }

    fn enter(&self, phase: EditPhase) {
        *lock(&self.phase) = phase;
    }
}

/// Puts the pipeline back to idle on every exit path
struct PhaseReset<'a>(&'a Mutex<EditPhase>);

impl Drop for PhaseReset<'_> {
    fn drop(&mut self) {
        *lock(self.0) = EditPhase::Idle;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
