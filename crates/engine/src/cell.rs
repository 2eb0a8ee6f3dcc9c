//! Cell model
//!
//! A sheet has 26 fixed columns (`A`..`Z`). Each cell is either plain text
//! or a structured record holding uploaded files. Rows carry an immutable
//! identity that is independent of where they are displayed.

use std::collections::BTreeMap;
use std::fmt;

use gridsync_protocol::{AttachmentRef, CellKind};
use serde::{Deserialize, Serialize};

/// Number of fixed columns in a sheet
pub const COLUMN_COUNT: usize = 26;

/// A column letter `A`..`Z`, stored as its zero-based index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Column(u8);

impl Column {
    /// Column from a zero-based index, `None` outside `0..26`
    pub const fn from_index(index: usize) -> Option<Self> {
        if index < COLUMN_COUNT {
            Some(Self(index as u8))
        } else {
            None
        }
    }

    /// Column from a letter (case-insensitive), `None` outside `A..Z`
    pub fn from_letter(letter: char) -> Option<Self> {
        let upper = letter.to_ascii_uppercase();
        if upper.is_ascii_uppercase() {
            Some(Self(upper as u8 - b'A'))
        } else {
            None
        }
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub const fn letter(self) -> char {
        (b'A' + self.0) as char
    }

    /// All columns in order
    pub fn all() -> impl Iterator<Item = Self> {
        (0..COLUMN_COUNT as u8).map(Self)
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

impl TryFrom<String> for Column {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let mut chars = value.chars();
        match (chars.next(), chars.next()) {
            (Some(letter), None) => {
                Self::from_letter(letter).ok_or_else(|| format!("column out of range: {value}"))
            }
            _ => Err(format!("invalid column: {value}")),
        }
    }
}

impl From<Column> for String {
    fn from(column: Column) -> Self {
        column.letter().to_string()
    }
}

/// Value of a single cell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CellValue {
    /// Plain text or number entry
    Scalar { text: String },
    /// Cell holding uploaded files; `text` keeps a display/fallback value
    Structured {
        text: String,
        kind: CellKind,
        items: Vec<AttachmentRef>,
    },
}

impl CellValue {
    /// Empty scalar cell
    pub const fn empty() -> Self {
        Self::Scalar {
            text: String::new(),
        }
    }

    pub fn scalar(text: impl Into<String>) -> Self {
        Self::Scalar { text: text.into() }
    }

    pub fn text(&self) -> &str {
        match self {
            Self::Scalar { text } | Self::Structured { text, .. } => text,
        }
    }

    /// Whether the cell carries nothing worth persisting
    ///
    /// Only a scalar without text is empty. A structured cell always counts,
    /// even with no text and no attachments, so its kind survives a reload.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Scalar { text } => text.is_empty(),
            Self::Structured { .. } => false,
        }
    }

    /// Cell value after an upload completed
    ///
    /// `None` means the upload produced no reference, in which case the cell
    /// keeps its prior value and `None` is returned. Otherwise the reference
    /// is appended; a scalar cell becomes structured and keeps its text as
    /// the fallback value.
    pub fn with_upload(&self, kind: CellKind, upload: Option<AttachmentRef>) -> Option<Self> {
        let upload = upload?;
        Some(match self {
            Self::Scalar { text } => Self::Structured {
                text: if text.is_empty() {
                    upload.filename.clone()
                } else {
                    text.clone()
                },
                kind,
                items: vec![upload],
            },
            Self::Structured { text, items, .. } => {
                let mut items = items.clone();
                items.push(upload);
                Self::Structured {
                    text: text.clone(),
                    kind,
                    items,
                }
            }
        })
    }
}

impl Default for CellValue {
    fn default() -> Self {
        Self::empty()
    }
}

/// Immutable row identity
///
/// Assigned once when the row is created and never derived from the row's
/// position. Rows created by a user get a random token; rows created by
/// bootstrap seeding get a token derived from the seed snapshot so that
/// every replica seeding the same snapshot agrees on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(String);

impl RowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identity for a user-created row
    pub fn fresh() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Deterministic identity for the row at `index` of a seed snapshot
    pub fn seeded(digest_hex: &str, index: usize) -> Self {
        Self(format!("{digest_hex}-{index}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RowId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// One row as stored in the replicated document
///
/// Only non-empty cells are kept in `columns`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRecord {
    pub id: RowId,
    #[serde(default)]
    pub columns: BTreeMap<Column, CellValue>,
}

impl RowRecord {
    pub const fn new(id: RowId) -> Self {
        Self {
            id,
            columns: BTreeMap::new(),
        }
    }

    /// Builder-style cell setter (empty values are dropped)
    #[must_use]
    pub fn with(mut self, column: Column, value: CellValue) -> Self {
        self.set(column, value);
        self
    }

    pub fn get(&self, column: Column) -> Option<&CellValue> {
        self.columns.get(&column)
    }

    pub fn set(&mut self, column: Column, value: CellValue) {
        if value.is_empty() {
            self.columns.remove(&column);
        } else {
            self.columns.insert(column, value);
        }
    }

    /// Fill the cells this record lacks from another copy of the same row
    pub fn absorb(&mut self, other: &Self) {
        for (column, value) in &other.columns {
            self.columns.entry(*column).or_insert_with(|| value.clone());
        }
    }

    pub(crate) fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub(crate) fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
