//! Replicated sheet document
//!
//! Wraps a Y.Doc holding one root array `rows`. Each element is a
//! [`RowRecord`] encoded as a JSON string; the element's position is the
//! row's display order. Concurrent inserts, deletes and replacements from
//! independent replicas converge through the Y-CRDT merge.
//!
//! Every transaction is tagged with an [`UpdateOrigin`]. Observers see the
//! origin together with the post-change rows, and only non-remote changes are
//! forwarded to outbound subscribers (the sync channel), so remote updates
//! are never echoed back.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use gridsync_protocol::crdt::ROWS_ARRAY as ROWS;
use tokio::sync::mpsc;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Array, ArrayRef, Doc, ReadTxn, StateVector, Transact, TransactionMut, Update};

use crate::cell::{RowId, RowRecord};
use crate::error::{Result, SyncError};

/// Where a document change came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// An edit or reorder made through this replica's session
    Local,
    /// Seed rows written by the bootstrap reconciler
    Bootstrap,
    /// An update received from another replica
    Remote,
}

type ChangeCallback = Arc<dyn Fn(UpdateOrigin, &[RowRecord]) + Send + Sync>;

struct Shared {
    sheet_id: String,
    doc: Doc,
    /// Serializes every yrs transaction on `doc`
    gate: Mutex<()>,
    attached: AtomicBool,
    observers: Mutex<Vec<(u64, ChangeCallback)>>,
    next_observer: AtomicU64,
    outbound: Mutex<Vec<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl Shared {
    fn gate(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Root array handle; must be fetched before opening a transaction
    fn rows_array(&self) -> ArrayRef {
        self.doc.get_or_insert_array(ROWS)
    }

    fn read_rows(&self) -> Vec<RowRecord> {
        let array = self.rows_array();
        let txn = self.doc.transact();
        decode_rows(&array, &txn)
    }

    fn publish(&self, origin: UpdateOrigin, rows: &[RowRecord], update: Option<Vec<u8>>) {
        let observers: Vec<ChangeCallback> = lock(&self.observers)
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in observers {
            callback(origin, rows);
        }

        if origin == UpdateOrigin::Remote {
            return;
        }
        if let Some(update) = update {
            lock(&self.outbound).retain(|tx| tx.send(update.clone()).is_ok());
        }
    }
}

/// The replicated ordered sequence of rows for one sheet
///
/// Owned by the sheet session. The sync channel only holds a
/// [`DocumentHandle`].
pub struct SheetDocument {
    shared: Arc<Shared>,
}

impl SheetDocument {
    /// Attach a new, empty replica with a random CRDT client id
    pub fn new(sheet_id: impl Into<String>) -> Self {
        Self::from_doc(sheet_id.into(), Doc::new())
    }

    /// Attach a new, empty replica with a fixed CRDT client id
    pub fn with_client_id(sheet_id: impl Into<String>, client_id: u64) -> Self {
        Self::from_doc(sheet_id.into(), Doc::with_client_id(client_id))
    }

    fn from_doc(sheet_id: String, doc: Doc) -> Self {
        // Pre-create the root array
        let _ = doc.get_or_insert_array(ROWS);
        Self {
            shared: Arc::new(Shared {
                sheet_id,
                doc,
                gate: Mutex::new(()),
                attached: AtomicBool::new(true),
                observers: Mutex::new(Vec::new()),
                next_observer: AtomicU64::new(1),
                outbound: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn sheet_id(&self) -> &str {
        &self.shared.sheet_id
    }

    pub fn client_id(&self) -> u64 {
        self.shared.doc.client_id()
    }

    pub fn is_attached(&self) -> bool {
        self.shared.attached.load(Ordering::Acquire)
    }

    /// Number of rows in the sequence
    pub fn len(&self) -> u32 {
        let _gate = self.shared.gate();
        let array = self.shared.rows_array();
        let txn = self.shared.doc.transact();
        array.len(&txn)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all rows in display order
    pub fn rows(&self) -> Vec<RowRecord> {
        let _gate = self.shared.gate();
        self.shared.read_rows()
    }

    /// Run `f` on the current rows with transactions held off
    ///
    /// Observers run under the same lock, so whatever `f` derives from the
    /// rows cannot be overtaken by an older observer refresh.
    pub fn read<R>(&self, f: impl FnOnce(&[RowRecord]) -> R) -> R {
        let _gate = self.shared.gate();
        f(&self.shared.read_rows())
    }

    /// Run `f` as one transaction: a single observable change and a single
    /// network delta
    ///
    /// Returns `Ok(None)` without running `f` when the document is detached.
    /// yrs has no rollback, so operations `f` performed before returning an
    /// error stay applied and are still published.
    pub fn transact<R>(
        &self,
        origin: UpdateOrigin,
        f: impl FnOnce(&mut RowTxn<'_, '_>) -> Result<R>,
    ) -> Result<Option<R>> {
        if !self.is_attached() {
            tracing::debug!(sheet_id = %self.sheet_id(), "Transaction on detached document ignored");
            return Ok(None);
        }

        let _gate = self.shared.gate();
        let array = self.shared.rows_array();
        let (result, update) = {
            let mut txn = self.shared.doc.transact_mut();
            let mut rows = RowTxn {
                array: &array,
                txn: &mut txn,
                mutated: false,
            };
            let result = f(&mut rows);
            let update = rows.mutated.then(|| txn.encode_update_v1());
            (result, update)
        };

        if update.is_some() {
            let rows = self.shared.read_rows();
            self.shared.publish(origin, &rows, update);
        }
        result.map(Some)
    }

    /// Integrate an encoded update, returning whether the rows changed
    ///
    /// Applying an update twice is harmless: already-integrated operations
    /// are skipped by the CRDT merge.
    pub fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> Result<bool> {
        if !self.is_attached() {
            return Ok(false);
        }
        let decoded =
            Update::decode_v1(update).map_err(|e| SyncError::Update(format!("decode: {e}")))?;

        let _gate = self.shared.gate();
        let before = self.shared.read_rows();
        {
            let mut txn = self.shared.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| SyncError::Update(format!("apply: {e}")))?;
        }
        let after = self.shared.read_rows();

        let changed = before != after;
        if changed {
            self.shared.publish(origin, &after, Some(update.to_vec()));
        }
        Ok(changed)
    }

    /// Current state vector (v1 encoding)
    pub fn state_vector(&self) -> Vec<u8> {
        let _gate = self.shared.gate();
        let txn = self.shared.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything a peer with `state_vector` is missing
    pub fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(state_vector)
            .map_err(|e| SyncError::Update(format!("state vector: {e}")))?;
        let _gate = self.shared.gate();
        let txn = self.shared.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Full state as a single update
    pub fn encode_state(&self) -> Vec<u8> {
        let _gate = self.shared.gate();
        let txn = self.shared.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Register a change observer
    ///
    /// The callback runs synchronously after every committed change, local or
    /// remote, with the change's origin and the resulting rows. It runs while
    /// the document is locked and must not call back into the document.
    /// Dropping the returned [`Observation`] unregisters it.
    pub fn observe<F>(&self, callback: F) -> Observation
    where
        F: Fn(UpdateOrigin, &[RowRecord]) + Send + Sync + 'static,
    {
        let id = self.shared.next_observer.fetch_add(1, Ordering::Relaxed);
        lock(&self.shared.observers).push((id, Arc::new(callback)));
        Observation {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Receive the encoded delta of every non-remote change
    pub fn subscribe_updates(&self) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.is_attached() {
            lock(&self.shared.outbound).push(tx);
        }
        rx
    }

    /// Non-owning reference for the sync channel
    pub fn downgrade(&self) -> DocumentHandle {
        DocumentHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Detach the replica
    ///
    /// Later transactions and updates become no-ops, observers are dropped
    /// and outbound subscribers see their stream end.
    pub fn detach(&self) {
        if self.shared.attached.swap(false, Ordering::AcqRel) {
            tracing::debug!(sheet_id = %self.sheet_id(), "Document detached");
        }
        let _gate = self.shared.gate();
        lock(&self.shared.observers).clear();
        lock(&self.shared.outbound).clear();
    }
}

impl std::fmt::Debug for SheetDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SheetDocument")
            .field("sheet_id", &self.shared.sheet_id)
            .field("client_id", &self.client_id())
            .field("attached", &self.is_attached())
            .finish_non_exhaustive()
    }
}

/// Weak reference to a [`SheetDocument`]
#[derive(Clone)]
pub struct DocumentHandle {
    shared: Weak<Shared>,
}

impl DocumentHandle {
    /// The document, if its session still holds it and it is attached
    pub fn upgrade(&self) -> Option<SheetDocument> {
        let shared = self.shared.upgrade()?;
        shared
            .attached
            .load(Ordering::Acquire)
            .then_some(SheetDocument { shared })
    }
}

/// Registration returned by [`SheetDocument::observe`]
pub struct Observation {
    id: u64,
    shared: Weak<Shared>,
}

impl Drop for Observation {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            lock(&shared.observers).retain(|(id, _)| *id != self.id);
        }
    }
}

/// Row operations available inside [`SheetDocument::transact`]
///
/// Indices are clamped to the current length instead of panicking.
pub struct RowTxn<'a, 'doc> {
    array: &'a ArrayRef,
    txn: &'a mut TransactionMut<'doc>,
    mutated: bool,
}

impl RowTxn<'_, '_> {
    pub fn len(&self) -> u32 {
        self.array.len(&*self.txn)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: u32) -> Option<RowRecord> {
        let value = self.array.get(&*self.txn, index)?;
        decode_row(&value.to_string(&*self.txn))
    }

    pub fn records(&self) -> Vec<RowRecord> {
        decode_rows(self.array, &*self.txn)
    }

    /// Index of the record carrying `id` (linear scan, O(n))
    pub fn position_of(&self, id: &RowId) -> Option<u32> {
        let txn = &*self.txn;
        self.array
            .iter(txn)
            .position(|value| decode_row(&value.to_string(txn)).is_some_and(|row| &row.id == id))
            .map(|index| index as u32)
    }

    /// Insert `records` starting at `index`
    pub fn insert(&mut self, index: u32, records: &[RowRecord]) -> Result<()> {
        let encoded = records
            .iter()
            .map(RowRecord::to_json)
            .collect::<serde_json::Result<Vec<_>>>()?;
        let mut at = index.min(self.len());
        for json in encoded {
            self.array.insert(&mut *self.txn, at, json);
            at += 1;
            self.mutated = true;
        }
        Ok(())
    }

    /// Remove up to `count` records starting at `start`
    pub fn delete_range(&mut self, start: u32, count: u32) {
        let len = self.len();
        let start = start.min(len);
        let count = count.min(len - start);
        if count > 0 {
            self.array.remove_range(&mut *self.txn, start, count);
            self.mutated = true;
        }
    }

    /// Swap the record at `index` for `record` (remove + insert)
    pub fn replace_at(&mut self, index: u32, record: &RowRecord) -> Result<()> {
        let json = record.to_json()?;
        if index >= self.len() {
            return Ok(());
        }
        self.array.remove_range(&mut *self.txn, index, 1);
        self.array.insert(&mut *self.txn, index, json);
        self.mutated = true;
        Ok(())
    }
}

/// Encode `records` as the full state of a fresh replica with `client_id`
///
/// Two calls with the same arguments produce the same operations, which
/// the CRDT merge treats as one.
pub(crate) fn encode_seed(client_id: u64, records: &[RowRecord]) -> Result<Vec<u8>> {
    let encoded = records
        .iter()
        .map(RowRecord::to_json)
        .collect::<serde_json::Result<Vec<_>>>()?;

    let doc = Doc::with_client_id(client_id);
    let array = doc.get_or_insert_array(ROWS);
    {
        let mut txn = doc.transact_mut();
        for (index, json) in encoded.into_iter().enumerate() {
            array.insert(&mut txn, index as u32, json);
        }
    }
    let txn = doc.transact();
    Ok(txn.encode_state_as_update_v1(&StateVector::default()))
}

fn decode_rows<T: ReadTxn>(array: &ArrayRef, txn: &T) -> Vec<RowRecord> {
    array
        .iter(txn)
        .filter_map(|value| decode_row(&value.to_string(txn)))
        .collect()
}

fn decode_row(json: &str) -> Option<RowRecord> {
    match RowRecord::from_json(json) {
        Ok(row) => Some(row),
        Err(e) => {
            tracing::warn!(error = %e, "Skipping undecodable row element");
            None
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
