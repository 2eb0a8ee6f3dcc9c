//! Sheet session
//!
//! One open sheet on one client: the replicated document, its sync channel,
//! the local grid and the persistence notifier, created together by
//! [`SheetSession::open`] and torn down together by [`SheetSession::close`]
//! or drop.

use std::sync::Arc;

use gridsync_protocol::{is_valid_sheet_id, AttachmentRef, CellKind, PersistedCell};

use crate::bootstrap::{bootstrap, BootstrapOutcome};
use crate::cell::{CellValue, Column, RowId};
use crate::channel::{ChannelStatus, SyncChannel};
use crate::config::EngineConfig;
use crate::document::{SheetDocument, UpdateOrigin};
use crate::error::{Result, SyncError};
use crate::grid::{to_cells, Grid, GridRow, SharedGrid};
use crate::mutation::{CellEdit, EditOutcome, EditPhase, LocalMutationPipeline};
use crate::observer::RemoteMutationObserver;
use crate::persist::PersistenceNotifier;
use crate::reorder::RowReorderSynchronizer;
use crate::store::SheetStore;
use crate::view::GridView;

/// An open sheet
pub struct SheetSession {
    sheet_id: String,
    document: SheetDocument,
    channel: Option<SyncChannel>,
    grid: SharedGrid,
    view: Arc<dyn GridView>,
    pipeline: LocalMutationPipeline,
    reorder: RowReorderSynchronizer,
    notifier: PersistenceNotifier,
    observer: RemoteMutationObserver,
    outcome: BootstrapOutcome,
}

impl SheetSession {
    /// Open `sheet_id`: load, connect, reconcile and render
    ///
    /// Must be called inside a tokio runtime.
    pub async fn open(
        config: &EngineConfig,
        sheet_id: &str,
        store: Arc<dyn SheetStore>,
        view: Arc<dyn GridView>,
    ) -> Result<Self> {
        if !is_valid_sheet_id(sheet_id) {
            return Err(SyncError::InvalidSheetId(sheet_id.to_string()));
        }

        let server_cells = store.load(sheet_id).await?;
        let document = SheetDocument::new(sheet_id);
        let grid = SharedGrid::default();

        // Registered before the first sync so no remote change is missed
        let observer = RemoteMutationObserver::attach(&document, grid.clone(), Arc::clone(&view));

        let channel = if config.offline {
            None
        } else {
            let channel = SyncChannel::connect(&config.endpoint, &document, config.reconnect_policy())?;
            if !channel.wait_synced(config.bootstrap_timeout()).await {
                tracing::info!(
                    sheet_id,
                    timeout_ms = config.bootstrap_timeout_ms,
                    "Relay not synced in time, reconciling against the local replica"
                );
            }
            Some(channel)
        };

        let outcome = bootstrap(&document, &server_cells)?;

        document.read(|rows| {
            let fresh = Grid::from_records(rows);
            view.set_rows(fresh.rows());
            grid.replace(fresh);
        });

        let notifier = PersistenceNotifier::spawn(sheet_id, store, config.save_debounce());

        tracing::info!(
            sheet_id,
            client_id = document.client_id(),
            rows = grid.lock().len(),
            ?outcome,
            online = channel.is_some(),
            "Sheet session opened"
        );

        Ok(Self {
            sheet_id: sheet_id.to_string(),
            pipeline: LocalMutationPipeline::new(grid.clone()),
            reorder: RowReorderSynchronizer::new(grid.clone()),
            document,
            channel,
            grid,
            view,
            notifier,
            observer,
            outcome,
        })
    }

    pub fn sheet_id(&self) -> &str {
        &self.sheet_id
    }

    pub fn document(&self) -> &SheetDocument {
        &self.document
    }

    pub const fn bootstrap_outcome(&self) -> BootstrapOutcome {
        self.outcome
    }

    /// Channel status, `None` for offline sessions
    pub fn status(&self) -> Option<ChannelStatus> {
        self.channel.as_ref().map(SyncChannel::status)
    }

    pub fn channel(&self) -> Option<&SyncChannel> {
        self.channel.as_ref()
    }

    pub fn edit_phase(&self) -> EditPhase {
        self.pipeline.phase()
    }

    /// Number of full grid refreshes caused by remote changes
    pub fn remote_refreshes(&self) -> usize {
        self.observer.refreshes()
    }

    /// Current grid snapshot
    pub fn grid(&self) -> Grid {
        self.grid.snapshot()
    }

    /// Current grid as the persisted cell list
    pub fn persisted_cells(&self) -> Vec<PersistedCell> {
        to_cells(&self.grid.lock())
    }

    /// The widget changed a cell
    pub fn cell_edited(&self, row_id: &RowId, column: Column, value: CellValue) -> Result<EditOutcome> {
        let edit = CellEdit::new(row_id.clone(), column, value);
        let outcome = self.pipeline.apply(&self.document, &edit)?;
        if outcome.changed_grid() {
            self.persist();
        }
        Ok(outcome)
    }

    /// The widget finished a drag reorder; `order` lists row ids top to bottom
    pub fn rows_reordered(&self, order: &[RowId]) -> Result<()> {
        self.reorder.reorder(&self.document, order)?;
        self.persist();
        Ok(())
    }

    /// Add an empty row at the bottom
    pub fn append_row(&self) -> Result<RowId> {
        let row = GridRow::new(RowId::fresh());
        let record = row.to_record();
        self.grid.lock().push(row);

        self.document.transact(UpdateOrigin::Local, |rows| {
            let end = rows.len();
            rows.insert(end, std::slice::from_ref(&record))
        })?;

        self.view.set_rows(self.grid.lock().rows());
        tracing::debug!(sheet_id = %self.sheet_id, row_id = %record.id, "Row appended");
        Ok(record.id)
    }

    /// An upload into a cell finished
    ///
    /// `upload` is `None` when the uploader returned no reference; the cell
    /// then keeps its prior value.
    pub fn attachment_uploaded(
        &self,
        row_id: &RowId,
        column: Column,
        kind: CellKind,
        upload: Option<AttachmentRef>,
    ) -> Result<EditOutcome> {
        let current = self
            .grid
            .lock()
            .row(row_id)
            .map(|row| row.cell(column).clone())
            .ok_or_else(|| SyncError::UnknownRow(row_id.clone()))?;

        match current.with_upload(kind, upload) {
            Some(value) => self.cell_edited(row_id, column, value),
            None => {
                tracing::info!(
                    sheet_id = %self.sheet_id,
                    row_id = %row_id,
                    column = %column,
                    "Upload returned no reference, cell unchanged"
                );
                Ok(EditOutcome::Unchanged)
            }
        }
    }

    /// Save pending changes now
    pub async fn flush(&self) -> Result<()> {
        self.notifier.flush().await
    }

    /// Flush, disconnect and detach
    ///
    /// Teardown always completes; a failed final save is returned after it.
    pub async fn close(self) -> Result<()> {
        let saved = self.notifier.flush().await;
        if let Err(e) = &saved {
            tracing::warn!(sheet_id = %self.sheet_id, error = %e, "Final save failed");
        }
        self.notifier.shutdown();
        if let Some(channel) = &self.channel {
            channel.disconnect().await;
        }
        self.document.detach();
        tracing::info!(sheet_id = %self.sheet_id, "Sheet session closed");
        saved
    }

    fn persist(&self) {
        self.notifier.notify(self.persisted_cells());
    }
}

impl Drop for SheetSession {
    fn drop(&mut self) {
        // Channel and notifier cancel themselves on drop
        self.document.detach();
    }
}

impl std::fmt::Debug for SheetSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SheetSession")
            .field("sheet_id", &self.sheet_id)
            .field("document", &self.document)
            .field("channel", &self.channel)
            .field("outcome", &self.outcome)
            .finish_non_exhaustive()
    }
}
