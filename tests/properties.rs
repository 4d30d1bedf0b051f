//! Property-based tests for watermark monotonicity and view convergence.
//!
//! Each case drives a watcher and a dispatcher by hand against an in-memory
//! backend, so the interleaving of backend writes and reads is chosen by the
//! generated schedule rather than by thread timing.

use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use table_mirror::{
    Bindings, ChangeDispatcher, ChangeEvent, ChangeNotifier, ChangeVersion, Fault,
    InMemoryTracker, Inline, JsonRowFetcher, LiveView, MirroredTable, Model, ModelType, RowId,
    SharedView, TableBinding, TableInfo, TableLocks, TableWatcher,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Order {
    id: i64,
    total: i64,
}

impl Model for Order {
    fn table_info() -> TableInfo {
        TableInfo::new("orders", &["id", "total"], "id")
    }

    fn row_id(&self) -> RowId {
        RowId(self.id)
    }
}

// =============================================================================
// Generators
// =============================================================================

#[derive(Clone, Debug)]
enum Step {
    /// Insert the row if absent; otherwise update it (`remove == false`) or
    /// delete it.
    Write { id: i64, total: i64, remove: bool },
    /// Read changes and dispatch them.
    Sync,
    /// Same as `Sync`, but the change read fails.
    FailedSync,
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        6 => (0i64..6, 0i64..1000, any::<bool>())
            .prop_map(|(id, total, remove)| Step::Write { id, total, remove }),
        2 => Just(Step::Sync),
        1 => Just(Step::FailedSync),
    ]
}

fn arb_schedule() -> impl Strategy<Value = Vec<Step>> {
    proptest::collection::vec(arb_step(), 0..60)
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    tracker: Arc<InMemoryTracker>,
    watcher: TableWatcher,
    dispatcher: ChangeDispatcher,
    view: SharedView<Order>,
    emitted: Vec<ChangeVersion>,
}

impl Harness {
    fn new(preloaded: &[i64]) -> Self {
        let tracker = Arc::new(InMemoryTracker::new());
        tracker.create_table("orders", &["id", "total"]);

        let view = SharedView::new();
        let mut rows = Vec::new();
        for &id in preloaded {
            let row = Order { id, total: 0 };
            tracker.insert("orders", RowId(id), &row).unwrap();
            rows.push(row);
        }
        view.reset(rows);

        let mut watcher = TableWatcher::new(
            tracker.clone(),
            &Order::table_info(),
            ModelType::of::<Order>(),
        );
        watcher.bootstrap();

        let binding: Arc<dyn TableBinding> = Arc::new(MirroredTable::new(
            view.clone(),
            Arc::new(JsonRowFetcher::<Order>::new(tracker.clone())),
        ));
        let mut bindings = Bindings::new();
        bindings.insert("orders".to_string(), binding);
        let dispatcher = ChangeDispatcher::new(
            Arc::new(bindings),
            Arc::new(TableLocks::new()),
            Arc::new(ChangeNotifier::new()),
            Arc::new(Inline),
        );

        Self {
            tracker,
            watcher,
            dispatcher,
            view,
            emitted: Vec::new(),
        }
    }

    fn write(&self, id: i64, total: i64, remove: bool) {
        let exists = self
            .tracker
            .rows("orders")
            .unwrap()
            .iter()
            .any(|row| row["id"] == id);
        let row = Order { id, total };
        let result = match (exists, remove) {
            (false, _) => self.tracker.insert("orders", RowId(id), &row),
            (true, false) => self.tracker.update("orders", RowId(id), &row),
            (true, true) => self.tracker.delete("orders", RowId(id)),
        };
        result.unwrap();
    }

    fn sync(&mut self) {
        let mut events: Vec<ChangeEvent> = Vec::new();
        self.watcher.get_changes(|event| events.push(event));
        for event in events {
            self.emitted.push(event.change_version);
            self.dispatcher.handle(event);
        }
    }

    fn backend_rows(&self) -> Vec<Order> {
        self.tracker
            .rows("orders")
            .unwrap()
            .into_iter()
            .map(|value| serde_json::from_value(value).unwrap())
            .collect()
    }

    fn view_rows(&self) -> Vec<Order> {
        let mut rows = self.view.snapshot();
        rows.sort_by_key(|row| row.id);
        rows
    }
}

// =============================================================================
// Property Tests
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// The watermark never decreases, and events leave the watcher in
    /// strictly ascending version order across reads.
    #[test]
    fn prop_watermark_is_monotonic(schedule in arb_schedule()) {
        let mut harness = Harness::new(&[]);
        let mut last = harness.watcher.last_change_version();

        for step in schedule {
            match step {
                Step::Write { id, total, remove } => harness.write(id, total, remove),
                Step::Sync => harness.sync(),
                Step::FailedSync => {
                    harness.tracker.inject_fault("orders", Fault::Changes, 1);
                    harness.sync();
                    prop_assert_eq!(harness.watcher.last_change_version(), last);
                }
            }
            let current = harness.watcher.last_change_version();
            prop_assert!(current >= last);
            last = current;
        }

        prop_assert!(harness.emitted.windows(2).all(|w| w[0] < w[1]));
        prop_assert!(last <= harness.tracker.version());
    }

    /// After a final read, the view holds exactly the rows the table holds,
    /// whatever the interleaving of writes, reads and failed reads.
    #[test]
    fn prop_view_converges_to_table(
        preloaded in proptest::collection::hash_set(0i64..6, 0..4),
        schedule in arb_schedule(),
    ) {
        let preloaded: Vec<i64> = preloaded.into_iter().collect();
        let mut harness = Harness::new(&preloaded);

        for step in schedule {
            match step {
                Step::Write { id, total, remove } => harness.write(id, total, remove),
                Step::Sync => harness.sync(),
                Step::FailedSync => {
                    harness.tracker.inject_fault("orders", Fault::Changes, 1);
                    harness.sync();
                }
            }
        }
        harness.sync();

        prop_assert_eq!(harness.view_rows(), harness.backend_rows());
        prop_assert_eq!(harness.watcher.last_change_version(), harness.tracker.version());
    }

    /// Head inserts that first remove the same key never leave duplicates.
    #[test]
    fn prop_view_keys_stay_unique(
        ops in proptest::collection::vec((0i64..8, any::<bool>()), 0..100)
    ) {
        let mut view = LiveView::<Order>::new();
        for (id, insert) in ops {
            if insert {
                view.remove_by_key(RowId(id));
                view.insert_head(Order { id, total: id });
                prop_assert_eq!(view.find_by_key(RowId(id)), Some(0));
            } else {
                view.remove_by_key(RowId(id));
                prop_assert!(view.get(RowId(id)).is_none());
            }
        }

        let keys: HashSet<i64> = view.iter().map(|o| o.id).collect();
        prop_assert_eq!(keys.len(), view.len());
    }
}
