use serde::{Deserialize, Serialize};

/// Name of the root Y.Array holding a sheet's rows
pub const ROWS_ARRAY: &str = "rows";

/// Sync frames exchanged between a sheet replica and the room relay.
///
/// Frames travel as JSON text messages. Byte payloads are v1-encoded
/// Y-CRDT state vectors or updates, carried as base64 strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SyncMessage {
    /// Step 1: sender announces its state vector
    #[serde(rename = "sync1")]
    SyncStep1 {
        #[serde(with = "base64_bytes")]
        state_vector: Vec<u8>,
    },

    /// Step 2: everything the peer's state vector says it is missing
    #[serde(rename = "sync2")]
    SyncStep2 {
        #[serde(with = "base64_bytes")]
        update: Vec<u8>,
    },

    /// Incremental update from either side
    #[serde(rename = "update")]
    Update {
        #[serde(with = "base64_bytes")]
        update: Vec<u8>,
    },

    /// Awareness payload, relayed opaquely
    #[serde(rename = "awareness")]
    Awareness {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
}

impl SyncMessage {
    /// Encode as a JSON text frame
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decode a JSON text frame
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Short frame name for logging
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SyncStep1 { .. } => "sync1",
            Self::SyncStep2 { .. } => "sync2",
            Self::Update { .. } => "update",
            Self::Awareness { .. } => "awareness",
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
