//! Shared protocol types for gridsync
//!
//! Defines the sync frames exchanged between a sheet replica and the room
//! relay, the persisted cell shapes handed to the sheet persistence service,
//! and the room naming convention both sides agree on.

pub mod cells;
pub mod crdt;
pub mod room;

pub use cells::*;
pub use crdt::{SyncMessage, ROWS_ARRAY};
pub use room::*;
