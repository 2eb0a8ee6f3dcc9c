//! Persistence notifier
//!
//! Every local change hands the full cell list to [`PersistenceNotifier::notify`].
//! A background task waits for the list to settle for `save_debounce` and
//! then writes the newest one through the [`SheetStore`]. Saves are always
//! full replaces.

use std::sync::Arc;
use std::time::Duration;

use gridsync_protocol::PersistedCell;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::store::SheetStore;

/// Latest cell list handed to the notifier
#[derive(Debug, Clone, Default)]
struct Pending {
    generation: u64,
    cells: Arc<Vec<PersistedCell>>,
}

struct Saver {
    sheet_id: String,
    store: Arc<dyn SheetStore>,
    /// Generation of the last successful save; also serializes saves
    saved: Mutex<u64>,
}

impl Saver {
    async fn save(&self, pending: Pending) -> Result<()> {
        let mut saved = self.saved.lock().await;
        if pending.generation <= *saved {
            return Ok(());
        }
        self.store.save(&self.sheet_id, &pending.cells).await?;
        *saved = pending.generation;
        tracing::debug!(
            sheet_id = %self.sheet_id,
            generation = pending.generation,
            cells = pending.cells.len(),
            "Persisted sheet"
        );
        Ok(())
    }
}

/// Debounced full-replace saver for one sheet
pub struct PersistenceNotifier {
    tx: watch::Sender<Pending>,
    saver: Arc<Saver>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PersistenceNotifier {
    /// Start the background saver; must be called inside a tokio runtime
    pub fn spawn(sheet_id: impl Into<String>, store: Arc<dyn SheetStore>, debounce: Duration) -> Self {
        let (tx, rx) = watch::channel(Pending::default());
        let saver = Arc::new(Saver {
            sheet_id: sheet_id.into(),
            store,
            saved: Mutex::new(0),
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(rx, Arc::clone(&saver), cancel.clone(), debounce));
        Self {
            tx,
            saver,
            cancel,
            task,
        }
    }

    /// Replace the pending cell list
    pub fn notify(&self, cells: Vec<PersistedCell>) {
        self.tx.send_modify(|pending| {
            pending.generation += 1;
            pending.cells = Arc::new(cells);
        });
    }

    /// Whether a change is waiting to be saved
    pub async fn is_dirty(&self) -> bool {
        let generation = self.tx.borrow().generation;
        generation > *self.saver.saved.lock().await
    }

    /// Save the pending list now instead of waiting for the debounce
    pub async fn flush(&self) -> Result<()> {
        let pending = self.tx.borrow().clone();
        self.saver.save(pending).await
    }

    /// Stop the background task; unsaved changes are dropped unless flushed
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for PersistenceNotifier {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

async fn run(
    mut rx: watch::Receiver<Pending>,
    saver: Arc<Saver>,
    cancel: CancellationToken,
    debounce: Duration,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        // Coalesce changes arriving during the debounce window
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(debounce) => {}
        }

        let pending = rx.borrow_and_update().clone();
        if let Err(e) = saver.save(pending).await {
            // Retried with the next change or on flush
            tracing::warn!(sheet_id = %saver.sheet_id, error = %e, "Failed to persist sheet");
        }
    }
    tracing::trace!(sheet_id = %saver.sheet_id, "Persistence task stopped");
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::error::SyncError;
    use crate::store::MemorySheetStore;

    fn cells(value: &str) -> Vec<PersistedCell> {
        vec![PersistedCell::scalar(0, 0, value)]
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_coalesces_bursts() {
        let store = Arc::new(MemorySheetStore::new());
        let notifier = PersistenceNotifier::spawn("s", store.clone(), Duration::from_millis(500));

        notifier.notify(cells("1"));
        notifier.notify(cells("2"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        notifier.notify(cells("3"));
        assert_eq!(store.save_count(), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        tokio::task::yield_now().await;
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.cells("s").await, Some(cells("3")));
        assert!(!notifier.is_dirty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_saves_immediately_and_once() {
        let store = Arc::new(MemorySheetStore::new());
        let notifier = PersistenceNotifier::spawn("s", store.clone(), Duration::from_secs(60));

        notifier.flush().await.unwrap();
        assert_eq!(store.save_count(), 0);

        notifier.notify(cells("x"));
        assert!(notifier.is_dirty().await);
        notifier.flush().await.unwrap();
        assert_eq!(store.save_count(), 1);

        // The debounced save finds nothing newer
        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;
        assert_eq!(store.save_count(), 1);
    }

    struct FailingStore;

    #[async_trait]
    impl SheetStore for FailingStore {
        async fn load(&self, _sheet_id: &str) -> Result<Vec<PersistedCell>> {
            Ok(Vec::new())
        }

        async fn save(&self, _sheet_id: &str, _cells: &[PersistedCell]) -> Result<()> {
            Err(SyncError::Store("offline".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_save_stays_dirty() {
        let notifier = PersistenceNotifier::spawn("s", Arc::new(FailingStore), Duration::from_millis(10));
        notifier.notify(cells("x"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(notifier.is_dirty().await);
        assert!(matches!(notifier.flush().await, Err(SyncError::Store(_))));
    }
}
