//! Remote mutation observer
//!
//! Rebuilds the whole local grid from the document after every change that
//! did not originate in this session and pushes it to the view. This is a
//! full replace rather than a patch: every remote keystroke costs one
//! O(rows) re-materialization, which is fine for sheets of a few tens of
//! thousands of cells.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::document::{Observation, SheetDocument, UpdateOrigin};
use crate::grid::{Grid, SharedGrid};
use crate::view::GridView;

/// Keeps a [`SharedGrid`] and a view in step with remote changes
pub struct RemoteMutationObserver {
    refreshes: Arc<AtomicUsize>,
    _observation: Observation,
}

impl RemoteMutationObserver {
    pub fn attach(document: &SheetDocument, grid: SharedGrid, view: Arc<dyn GridView>) -> Self {
        let refreshes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&refreshes);
        let sheet_id = document.sheet_id().to_string();

        let observation = document.observe(move |origin, rows| {
            // Local edits are already reflected in the grid
            if origin == UpdateOrigin::Local {
                return;
            }
            let fresh = Grid::from_records(rows);
            view.set_rows(fresh.rows());
            grid.replace(fresh);
            counter.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(sheet_id = %sheet_id, ?origin, rows = rows.len(), "Grid refreshed");
        });

        Self {
            refreshes,
            _observation: observation,
        }
    }

    /// Number of full re-materializations so far
    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{CellValue, Column, RowId, RowRecord};
    use crate::view::SnapshotView;

    fn row(id: &str, a: &str) -> RowRecord {
        RowRecord::new(RowId::from(id)).with(Column::from_letter('A').unwrap(), CellValue::scalar(a))
    }

    #[test]
    fn remote_changes_replace_grid_and_render() {
        let document = SheetDocument::with_client_id("s", 1);
        let grid = SharedGrid::default();
        let view = Arc::new(SnapshotView::new());
        let observer = RemoteMutationObserver::attach(&document, grid.clone(), view.clone());

        let peer = SheetDocument::with_client_id("s", 2);
        peer.transact(UpdateOrigin::Local, |rows| rows.insert(0, &[row("a", "1"), row("b", "2")]))
            .unwrap();
        document
            .apply_update(&peer.encode_state(), UpdateOrigin::Remote)
            .unwrap();

        assert_eq!(observer.refreshes(), 1);
        assert_eq!(grid.snapshot().len(), 2);
        assert_eq!(view.rows().len(), 2);
        assert_eq!(view.rows()[1].id, RowId::from("b"));
    }

    #[test]
    fn local_changes_are_skipped() {
        let document = SheetDocument::with_client_id("s", 1);
        let grid = SharedGrid::default();
        let view = Arc::new(SnapshotView::new());
        let observer = RemoteMutationObserver::attach(&document, grid.clone(), view.clone());

        document
            .transact(UpdateOrigin::Local, |rows| rows.insert(0, &[row("a", "1")]))
            .unwrap();

        assert_eq!(observer.refreshes(), 0);
        assert_eq!(view.renders(), 0);
        assert!(grid.snapshot().is_empty());
    }

    #[test]
    fn detaching_stops_refreshes() {
        let document = SheetDocument::with_client_id("s", 1);
        let observer =
            RemoteMutationObserver::attach(&document, SharedGrid::default(), Arc::new(SnapshotView::new()));
        document.detach();

        let peer = SheetDocument::with_client_id("s", 2);
        peer.transact(UpdateOrigin::Local, |rows| rows.insert(0, &[row("a", "1")]))
            .unwrap();
        document
            .apply_update(&peer.encode_state(), UpdateOrigin::Remote)
            .unwrap();
        assert_eq!(observer.refreshes(), 0);
    }
}
