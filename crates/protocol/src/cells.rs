//! Persisted cell shapes
//!
//! These are the exact JSON shapes accepted by the sheet persistence
//! service. Field names and ordering must not change.

use serde::{Deserialize, Serialize};

/// Kind of a structured (file-carrying) cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellKind {
    Image,
    Attachment,
}

/// Reference to an uploaded file, as returned by the upload service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    pub url: String,
    pub object_key: String,
    pub filename: String,
    pub size_bytes: u64,
    pub content_type: String,
}

/// One occupied cell in the sparse persisted representation
///
/// `row` and `col` are signed so that malformed input still deserializes
/// and can be rejected by the grid adapter instead of failing the whole load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedCell {
    pub row: i64,
    pub col: i64,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<CellKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<AttachmentRef>>,
}

impl PersistedCell {
    /// Plain text cell
    pub fn scalar(row: i64, col: i64, value: impl Into<String>) -> Self {
        Self {
            row,
            col,
            value: value.into(),
            kind: None,
            attachments: None,
        }
    }

    /// File-carrying cell
    pub fn structured(
        row: i64,
        col: i64,
        value: impl Into<String>,
        kind: CellKind,
        attachments: Vec<AttachmentRef>,
    ) -> Self {
        Self {
            row,
            col,
            value: value.into(),
            kind: Some(kind),
            attachments: Some(attachments),
        }
    }
}
