//! Bootstrap reconciler
//!
//! Precedence rule applied when a session starts:
//!
//! * document empty: seed it from the server snapshot (first writer)
//! * document non-empty: the live document wins and the server snapshot is
//!   discarded, since collaborators may hold edits not yet persisted
//!
//! Seeds are written by a dedicated seed replica whose CRDT client id and
//! row ids are derived from a SHA-256 digest of the canonical snapshot. Two
//! clients racing to seed the same snapshot therefore emit identical
//! operations and the merge keeps one copy. Different snapshots produce
//! different operations and both seeds survive, in the same order on every
//! replica.

use gridsync_protocol::PersistedCell;
use sha2::{Digest, Sha256};

use crate::cell::{RowId, RowRecord};
use crate::document::{encode_seed, SheetDocument, UpdateOrigin};
use crate::error::Result;
use crate::grid::{to_cells, to_grid};

/// Seed client ids stay within 53 bits so JavaScript peers can hold them
const SEED_CLIENT_MASK: u64 = (1 << 53) - 1;

/// What the reconciler decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// The document was empty and now holds the server rows
    Seeded { rows: usize },
    /// The document was already live; the server snapshot was discarded
    Joined { rows: usize },
}

/// Deterministic seed derived from a server snapshot
#[derive(Debug, Clone)]
pub struct SeedPlan {
    pub digest_hex: String,
    pub client_id: u64,
    pub records: Vec<RowRecord>,
}

impl SeedPlan {
    pub fn from_cells(server_cells: &[PersistedCell]) -> Result<Self> {
        // Canonical form: malformed, duplicate and empty cells removed, sorted
        let canonical = to_cells(&to_grid(server_cells, |_| RowId::new("")));
        let digest = Sha256::digest(serde_json::to_vec(&canonical)?);

        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        let client_id = u64::from_be_bytes(prefix) & SEED_CLIENT_MASK;
        let digest_hex = hex::encode(prefix);

        let records = to_grid(&canonical, |index| RowId::seeded(&digest_hex, index)).records();
        Ok(Self {
            digest_hex,
            client_id,
            records,
        })
    }
}

/// Reconcile the document with the freshly loaded server snapshot
pub fn bootstrap(
    document: &SheetDocument,
    server_cells: &[PersistedCell],
) -> Result<BootstrapOutcome> {
    let live_rows = document.len() as usize;
    if live_rows > 0 {
        tracing::info!(
            sheet_id = %document.sheet_id(),
            live_rows,
            discarded_cells = server_cells.len(),
            "Document already live, discarding server snapshot"
        );
        return Ok(BootstrapOutcome::Joined { rows: live_rows });
    }

    let plan = SeedPlan::from_cells(server_cells)?;
    let update = encode_seed(plan.client_id, &plan.records)?;
    document.apply_update(&update, UpdateOrigin::Bootstrap)?;

    tracing::info!(
        sheet_id = %document.sheet_id(),
        rows = plan.records.len(),
        seed = %plan.digest_hex,
        "Seeded document from server snapshot"
    );
    Ok(BootstrapOutcome::Seeded {
        rows: plan.records.len(),
    })
}
