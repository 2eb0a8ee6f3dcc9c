// gridsync-engine
// Keeps a 26-column sheet consistent across every client that has it open.
//
// Data flow:
//   cell edit -> mutation -> document -> channel -> other replicas -> observer -> view
//   server load -> bootstrap -> document seed (if empty) -> grid

// Cell model and grid adapter
pub mod cell;
pub mod grid;

// Replicated document and its transport
pub mod channel;
pub mod document;

// Sync algorithms
pub mod bootstrap;
pub mod mutation;
pub mod observer;
pub mod reorder;

// Persistence boundary
pub mod persist;
pub mod store;

// Rendering boundary
pub mod view;

// Session facade
pub mod session;

// Configuration and errors
pub mod config;
pub mod error;

pub use bootstrap::{bootstrap, BootstrapOutcome, SeedPlan};
pub use cell::{CellValue, Column, RowId, RowRecord, COLUMN_COUNT};
pub use channel::{ChannelStatus, ReconnectPolicy, SyncChannel};
pub use config::EngineConfig;
pub use document::{DocumentHandle, Observation, SheetDocument, UpdateOrigin};
pub use error::{Result, SyncError};
pub use grid::{collapse_records, to_cells, to_grid, Grid, GridRow, SharedGrid};
pub use mutation::{CellEdit, EditOutcome, EditPhase, LocalMutationPipeline};
pub use observer::RemoteMutationObserver;
pub use persist::PersistenceNotifier;
pub use reorder::{resolve_order, RowReorderSynchronizer};
pub use session::SheetSession;
pub use store::{JsonFileStore, MemorySheetStore, SheetStore};
pub use view::{GridView, NullView, SnapshotView};

pub use gridsync_protocol::{AttachmentRef, CellKind, PersistedCell};
