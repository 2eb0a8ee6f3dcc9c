//! Sheet persistence service
//!
//! The server keeps one sparse cell list per sheet and every save is a full
//! replace. [`JsonFileStore`] stores each sheet as a JSON file under a data
//! directory; [`MemorySheetStore`] keeps them in memory.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use gridsync_protocol::PersistedCell;
use tokio::sync::Mutex;

use crate::error::{Result, SyncError};

/// Load/save of the authoritative cell list of a sheet
#[async_trait]
pub trait SheetStore: Send + Sync {
    /// Persisted cells of `sheet_id`, empty if the sheet was never saved
    async fn load(&self, sheet_id: &str) -> Result<Vec<PersistedCell>>;

    /// Replace the persisted cells of `sheet_id`
    async fn save(&self, sheet_id: &str, cells: &[PersistedCell]) -> Result<()>;
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemorySheetStore {
    sheets: Mutex<HashMap<String, Vec<PersistedCell>>>,
    saves: AtomicUsize,
}

impl MemorySheetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with one sheet
    pub fn with_cells(sheet_id: impl Into<String>, cells: Vec<PersistedCell>) -> Self {
        let mut store = Self::default();
        store.sheets.get_mut().insert(sheet_id.into(), cells);
        store
    }

    /// Last saved cells of `sheet_id`
    pub async fn cells(&self, sheet_id: &str) -> Option<Vec<PersistedCell>> {
        self.sheets.lock().await.get(sheet_id).cloned()
    }

    /// Number of completed saves
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SheetStore for MemorySheetStore {
    async fn load(&self, sheet_id: &str) -> Result<Vec<PersistedCell>> {
        Ok(self.cells(sheet_id).await.unwrap_or_default())
    }

    async fn save(&self, sheet_id: &str, cells: &[PersistedCell]) -> Result<()> {
        self.sheets
            .lock()
            .await
            .insert(sheet_id.to_string(), cells.to_vec());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// One `<sheet>.json` file per sheet
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    data_dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
        }
    }

    /// Default data directory (`<data_dir>/gridsync/sheets`)
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gridsync")
            .join("sheets")
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn sheet_path(&self, sheet_id: &str) -> PathBuf {
        self.data_dir
            .join(format!("{}.json", sanitize_component(sheet_id)))
    }
}

#[async_trait]
impl SheetStore for JsonFileStore {
    async fn load(&self, sheet_id: &str) -> Result<Vec<PersistedCell>> {
        let path = self.sheet_path(sheet_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                SyncError::Store(format!("{}: {e}", path.display()))
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save(&self, sheet_id: &str, cells: &[PersistedCell]) -> Result<()> {
        let path = self.sheet_path(sheet_id);
        tokio::fs::create_dir_all(&self.data_dir).await?;

        // Write next to the target and rename so readers never see a torn file
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, serde_json::to_vec(cells)?).await?;
        tokio::fs::rename(&staging, &path).await?;

        tracing::debug!(sheet_id, cells = cells.len(), path = %path.display(), "Sheet saved");
        Ok(())
    }
}

fn sanitize_component(input: &str) -> String {
    let out: String = input
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() {
        "untitled".to_string()
    } else {
        out
    }
}
