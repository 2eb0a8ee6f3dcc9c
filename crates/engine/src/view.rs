//! Rendering widget boundary
//!
//! The grid widget reports `cell_edited` / `rows_reordered` through
//! [`crate::SheetSession`] and is refreshed through [`GridView::set_rows`].

use std::sync::{Mutex, PoisonError};

use crate::grid::GridRow;

/// Sink for grid snapshots produced by the engine
pub trait GridView: Send + Sync {
    /// Re-render from a full snapshot, in display order
    fn set_rows(&self, rows: &[GridRow]);
}

/// View that discards every snapshot (headless sessions)
#[derive(Debug, Default, Clone, Copy)]
pub struct NullView;

impl GridView for NullView {
    fn set_rows(&self, _rows: &[GridRow]) {}
}

/// View that keeps the last snapshot and counts renders
#[derive(Debug, Default)]
pub struct SnapshotView {
    state: Mutex<(Vec<GridRow>, usize)>,
}

impl SnapshotView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<GridRow> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .0
            .clone()
    }

    pub fn renders(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).1
    }
}

impl GridView for SnapshotView {
    fn set_rows(&self, rows: &[GridRow]) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.0 = rows.to_vec();
        state.1 += 1;
    }
}
