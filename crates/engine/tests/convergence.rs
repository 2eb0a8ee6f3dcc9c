//! Two replicas editing and reordering under arbitrary interleavings of
//! local operations and sync exchanges always converge

use std::sync::Arc;

use gridsync_engine::{
    bootstrap, to_cells, CellEdit, CellValue, Column, Grid, LocalMutationPipeline, NullView,
    PersistedCell, RemoteMutationObserver, RowReorderSynchronizer, SharedGrid, SheetDocument,
    UpdateOrigin,
};
use proptest::prelude::*;

struct Replica {
    document: SheetDocument,
    grid: SharedGrid,
    pipeline: LocalMutationPipeline,
    reorder: RowReorderSynchronizer,
    _observer: RemoteMutationObserver,
}

impl Replica {
    fn seeded(client_id: u64, cells: &[PersistedCell]) -> Self {
        let document = SheetDocument::with_client_id("s1", client_id);
        let grid = SharedGrid::default();
        let observer = RemoteMutationObserver::attach(&document, grid.clone(), Arc::new(NullView));
        bootstrap(&document, cells).unwrap();
        grid.replace(Grid::from_records(&document.rows()));
        Self {
            pipeline: LocalMutationPipeline::new(grid.clone()),
            reorder: RowReorderSynchronizer::new(grid.clone()),
            document,
            grid,
            _observer: observer,
        }
    }

    fn apply(&self, op: &Op) {
        let rows = self.grid.snapshot();
        match op {
            Op::Edit { row, col, value } => {
                let id = rows.rows()[row % rows.len()].id.clone();
                let column = Column::from_index(col % 26).unwrap();
                let edit = CellEdit::new(id, column, CellValue::scalar(value.clone()));
                self.pipeline.apply(&self.document, &edit).unwrap();
            }
            Op::MoveToTop { row } => {
                let id = rows.rows()[row % rows.len()].id.clone();
                self.reorder.reorder(&self.document, &[id]).unwrap();
            }
        }
    }
}

fn sync(from: &Replica, to: &Replica) {
    let update = from.document.encode_diff(&to.document.state_vector()).unwrap();
    to.document.apply_update(&update, UpdateOrigin::Remote).unwrap();
}

#[derive(Debug, Clone)]
enum Op {
    Edit { row: usize, col: usize, value: String },
    MoveToTop { row: usize },
}

#[derive(Debug, Clone)]
enum Step {
    Local { on_b: bool, op: Op },
    Sync { to_b: bool },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0usize..120, 0usize..26, "[a-z]{1,4}")
            .prop_map(|(row, col, value)| Op::Edit { row, col, value }),
        1 => (0usize..120).prop_map(|row| Op::MoveToTop { row }),
    ]
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => (any::<bool>(), op()).prop_map(|(on_b, op)| Step::Local { on_b, op }),
        1 => any::<bool>().prop_map(|to_b| Step::Sync { to_b }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn replicas_converge(steps in prop::collection::vec(step(), 0..24)) {
        let snapshot = vec![
            PersistedCell::scalar(0, 0, "1"),
            PersistedCell::scalar(1, 0, "2"),
            PersistedCell::scalar(2, 0, "3"),
        ];
        let a = Replica::seeded(1, &snapshot);
        let b = Replica::seeded(2, &snapshot);

        for step in &steps {
            match step {
                Step::Local { on_b, op } => {
                    if *on_b { b.apply(op) } else { a.apply(op) }
                }
                Step::Sync { to_b } => {
                    if *to_b { sync(&a, &b) } else { sync(&b, &a) }
                }
            }
        }
        sync(&a, &b);
        sync(&b, &a);

        let rows = a.document.rows();
        prop_assert_eq!(&rows, &b.document.rows());
        // Each grid mirrors its document once the last exchange has landed
        prop_assert_eq!(a.grid.snapshot(), Grid::from_records(&rows));
        prop_assert_eq!(b.grid.snapshot(), Grid::from_records(&rows));
    }

    #[test]
    fn same_snapshot_seeds_once_in_any_sync_order(
        values in prop::collection::vec("[a-z0-9]{1,6}", 1..8),
        a_first in any::<bool>(),
    ) {
        let snapshot: Vec<PersistedCell> = values
            .iter()
            .enumerate()
            .map(|(row, value)| PersistedCell::scalar(row as i64 * 7, 1, value.clone()))
            .collect();
        let a = Replica::seeded(1, &snapshot);
        let b = Replica::seeded(2, &snapshot);
        if a_first {
            sync(&a, &b);
            sync(&b, &a);
        } else {
            sync(&b, &a);
            sync(&a, &b);
        }

        let expected_rows = ((values.len() - 1) * 7).max(99) + 1;
        prop_assert_eq!(a.document.len() as usize, expected_rows);
        prop_assert_eq!(a.document.rows(), b.document.rows());
    }
}

#[test]
fn concurrent_edits_to_one_row_converge_to_a_single_row() {
    let snapshot = vec![PersistedCell::scalar(0, 0, "1"), PersistedCell::scalar(1, 0, "2")];
    let a = Replica::seeded(1, &snapshot);
    let b = Replica::seeded(2, &snapshot);
    sync(&a, &b);
    sync(&b, &a);

    let row = a.grid.snapshot().rows()[0].id.clone();
    a.apply(&Op::Edit { row: 0, col: 1, value: "from a".to_string() });
    b.apply(&Op::Edit { row: 0, col: 2, value: "from b".to_string() });
    sync(&a, &b);
    sync(&b, &a);

    let expected = vec![
        PersistedCell::scalar(0, 0, "1"),
        PersistedCell::scalar(0, 1, "from a"),
        PersistedCell::scalar(0, 2, "from b"),
        PersistedCell::scalar(1, 0, "2"),
    ];
    for replica in [&a, &b] {
        let grid = replica.grid.snapshot();
        assert_eq!(grid.len(), 100);
        assert_eq!(grid.rows()[0].id, row);
        assert_eq!(to_cells(&grid), expected);
    }

    // The next edit of that row leaves one record for it in the document
    a.apply(&Op::Edit { row: 0, col: 3, value: "later".to_string() });
    sync(&a, &b);
    assert_eq!(a.document.len(), 100);
    assert_eq!(a.document.rows(), b.document.rows());
    assert_eq!(b.grid.snapshot(), a.grid.snapshot());
}
