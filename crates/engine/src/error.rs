//! Engine error type

use thiserror::Error;

use crate::cell::RowId;

/// Errors surfaced by the sync engine
///
/// Connectivity loss and identity drift are recovered internally and
/// never reach callers through this type.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A row record or frame could not be (de)serialized
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A CRDT update or state vector could not be decoded or applied
    #[error("invalid document update: {0}")]
    Update(String),

    /// The sheet persistence service rejected a load or save
    #[error("sheet store error: {0}")]
    Store(String),

    /// An edit named a row the local grid does not have
    #[error("unknown row {0}")]
    UnknownRow(RowId),

    /// A sheet id that cannot name a relay room
    #[error("invalid sheet id {0:?}")]
    InvalidSheetId(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// The sync endpoint address is unusable
    #[error("invalid sync endpoint {endpoint}: {reason}")]
    Endpoint { endpoint: String, reason: String },

    /// WebSocket transport failure (handled by the reconnect loop)
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;
