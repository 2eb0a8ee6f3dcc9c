//! Room-level CRDT replica
//!
//! The relay keeps one Y.Doc per room so that late joiners can be served
//! the live document and reconnecting clients only receive what they miss.
//! The relay never writes to the document itself.

use anyhow::Context;
use gridsync_protocol::ROWS_ARRAY;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Array, Doc, ReadTxn, StateVector, Transact, Update};

/// CRDT document for a single room
#[derive(Debug)]
pub struct RoomReplica {
    doc: Doc,
    /// Number of updates merged (for logging)
    merged: u64,
}

impl RoomReplica {
    pub fn new() -> Self {
        let doc = Doc::new();
        // Pre-create the rows array
        let _ = doc.get_or_insert_array(ROWS_ARRAY);
        Self { doc, merged: 0 }
    }

    pub const fn merged(&self) -> u64 {
        self.merged
    }

    /// Number of rows currently in the room's sequence
    pub fn row_count(&self) -> u32 {
        let rows = self.doc.get_or_insert_array(ROWS_ARRAY);
        let txn = self.doc.transact();
        rows.len(&txn)
    }

    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Updates a peer with `state_vector` is missing
    pub fn encode_diff(&self, state_vector: &[u8]) -> anyhow::Result<Vec<u8>> {
        let sv = StateVector::decode_v1(state_vector).context("decoding state vector")?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Full state for a peer that lost track
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    pub fn apply_update(&mut self, update: &[u8]) -> anyhow::Result<()> {
        let update = Update::decode_v1(update).context("decoding update")?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| anyhow::anyhow!("applying update: {e}"))?;
        self.merged += 1;
        Ok(())
    }
}

impl Default for RoomReplica {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_update(rows: &[&str]) -> Vec<u8> {
        let doc = Doc::with_client_id(7);
        let array = doc.get_or_insert_array(ROWS_ARRAY);
        let mut txn = doc.transact_mut();
        for (i, row) in rows.iter().enumerate() {
            array.insert(&mut txn, i as u32, row.to_string());
        }
        txn.encode_update_v1()
    }

    #[test]
    fn merges_updates_and_serves_diffs() {
        let mut replica = RoomReplica::new();
        replica.apply_update(&client_update(&["a", "b"])).unwrap();
        assert_eq!(replica.row_count(), 2);
        assert_eq!(replica.merged(), 1);

        let late = Doc::new();
        let diff = replica
            .encode_diff(&late.transact().state_vector().encode_v1())
            .unwrap();
        late.transact_mut()
            .apply_update(Update::decode_v1(&diff).unwrap())
            .unwrap();
        let rows = late.get_or_insert_array(ROWS_ARRAY);
        assert_eq!(rows.len(&late.transact()), 2);
    }

    #[test]
    fn rejects_garbage() {
        let mut replica = RoomReplica::new();
        assert!(replica.apply_update(&[0xff, 0x00, 0xff]).is_err());
        assert!(replica.encode_diff(&[0xff, 0xff]).is_err());
        assert_eq!(replica.row_count(), 0);
    }
}
