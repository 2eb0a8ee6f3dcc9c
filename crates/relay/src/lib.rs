// gridsync-relay library
// Room relay that keeps every replica of a sheet in one sync room

// Configuration
pub mod config;

// Room state
pub mod replica;
pub mod room;

// WebSocket server
pub mod ws;

pub use config::RelayConfig;
pub use room::{create_registry, RoomRegistry, SharedRoomRegistry};
pub use ws::serve;
