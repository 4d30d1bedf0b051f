//! Change dispatcher: drains the change queue and applies each change to the
//! live view of its table.
//!
//! At most one change per table is in flight at any time. A change that
//! fails to fetch or apply is logged and dropped; the loop carries on.

use crate::cancel::CancelSignal;
use crate::error::{MirrorError, Result};
use crate::model::{Model, RowFetcher};
use crate::notify::{ChangeNotifier, TableChanged};
use crate::queue::ChangeQueue;
use crate::types::{ChangeEvent, FetchResult, ModelType, Operation, TableInfo};
use crate::view::SharedView;
use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

// --- Table locks ---

/// Registry of per-table mutual-exclusion locks.
///
/// Entries are created on first use and never removed.
#[derive(Default)]
pub struct TableLocks {
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl TableLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock for `table`, created if absent.
    pub fn lock_for(&self, table: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.read().get(table) {
            return Arc::clone(lock);
        }

        let mut locks = self.locks.write();
        Arc::clone(
            locks
                .entry(table.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    pub fn len(&self) -> usize {
        self.locks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.read().is_empty()
    }

    /// Whether the lock for `table` is currently held.
    pub fn is_locked(&self, table: &str) -> bool {
        self.locks
            .read()
            .get(table)
            .map_or(false, |lock| lock.is_locked())
    }
}

// --- Apply marshalling ---

/// A mutation of a live view. Returns true if the view changed.
pub type ApplyJob = Box<dyn FnOnce() -> bool + Send>;

/// Where live-view mutations run.
pub trait ApplyOn: Send + Sync {
    /// Run `job`, giving up with [`MirrorError::Shutdown`] if `cancel` fires
    /// before it starts.
    fn apply(&self, job: ApplyJob, cancel: &CancelSignal) -> Result<bool>;
}

/// Apply on the dispatcher thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct Inline;

impl ApplyOn for Inline {
    fn apply(&self, job: ApplyJob, _cancel: &CancelSignal) -> Result<bool> {
        Ok(job())
    }
}

struct MarshalledJob {
    job: ApplyJob,
    done: Sender<bool>,
    /// Set by whichever side gets to the job first: the pump running it or
    /// the dispatcher abandoning it.
    claimed: Arc<AtomicBool>,
}

impl MarshalledJob {
    /// Run the job unless it was abandoned. Returns true if it ran.
    fn run(self) -> bool {
        if self.claimed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.done.send((self.job)());
        true
    }
}

/// Forward mutations to a host-owned thread (e.g. a UI thread) and wait for
/// each to finish. The host drains the paired [`ApplyPump`].
///
/// A job the host has not started when the mirror stops is abandoned: the
/// pump later discards it, so stopping never waits on the host.
#[derive(Clone)]
pub struct MarshalledApply {
    sender: Sender<MarshalledJob>,
}

/// Host side of [`MarshalledApply`].
pub struct ApplyPump {
    receiver: Receiver<MarshalledJob>,
}

impl MarshalledApply {
    pub fn channel() -> (MarshalledApply, ApplyPump) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        (MarshalledApply { sender }, ApplyPump { receiver })
    }
}

impl ApplyOn for MarshalledApply {
    fn apply(&self, job: ApplyJob, cancel: &CancelSignal) -> Result<bool> {
        let (done, result) = bounded(1);
        let claimed = Arc::new(AtomicBool::new(false));
        self.sender
            .send(MarshalledJob {
                job,
                done,
                claimed: Arc::clone(&claimed),
            })
            .map_err(|_| MirrorError::Shutdown)?;

        select! {
            recv(result) -> changed => changed.map_err(|_| MirrorError::Shutdown),
            recv(cancel.receiver()) -> _ => {
                if claimed.swap(true, Ordering::AcqRel) {
                    // Already running on the host; let it finish.
                    result.recv().map_err(|_| MirrorError::Shutdown)
                } else {
                    Err(MirrorError::Shutdown)
                }
            }
        }
    }
}

impl ApplyPump {
    /// Run every job currently queued. Returns how many ran; abandoned jobs
    /// are discarded and not counted.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.receiver.try_recv() {
            if job.run() {
                ran += 1;
            }
        }
        ran
    }

    /// Wait up to `timeout` for one job and run it. Returns false on timeout,
    /// for an abandoned job, or once every [`MarshalledApply`] is gone.
    pub fn run_one(&self, timeout: Duration) -> bool {
        match self.receiver.recv_timeout(timeout) {
            Ok(job) => job.run(),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }
}

// --- Table bindings ---

/// What applying one change did to its view.
#[derive(Clone, Debug, PartialEq)]
pub enum ApplyOutcome {
    /// The view changed. Carries the fetched row for inserts and updates.
    Applied { row: Option<serde_json::Value> },
    /// Nothing to do: the row is gone from the table, or not in the view.
    Skipped { reason: &'static str },
}

/// Typed fetch-and-apply path for one table, erased behind a trait object.
pub trait TableBinding: Send + Sync {
    fn info(&self) -> &TableInfo;

    fn table(&self) -> &str {
        &self.info().table
    }

    fn model(&self) -> ModelType;

    /// Fetch the changed row if needed and apply `event` to the view.
    fn apply(
        &self,
        event: &ChangeEvent,
        apply_on: &dyn ApplyOn,
        cancel: &CancelSignal,
    ) -> Result<ApplyOutcome>;
}

/// Binding of a [`Model`] type to its live view and row fetcher.
pub struct MirroredTable<T: Model> {
    info: TableInfo,
    view: SharedView<T>,
    fetcher: Arc<dyn RowFetcher<T>>,
}

impl<T: Model> MirroredTable<T> {
    pub fn new(view: SharedView<T>, fetcher: Arc<dyn RowFetcher<T>>) -> Self {
        Self {
            info: T::table_info(),
            view,
            fetcher,
        }
    }

    fn fetch(&self, event: &ChangeEvent) -> Result<Option<T>> {
        match self.fetcher.get_row(&self.info.table, event.row_id) {
            FetchResult::Found(row) => Ok(Some(row)),
            FetchResult::NotFound => Ok(None),
            FetchResult::Error(reason) => Err(MirrorError::Fetch {
                table: self.info.table.clone(),
                row_id: event.row_id,
                reason,
            }),
        }
    }
}

impl<T: Model> TableBinding for MirroredTable<T> {
    fn info(&self) -> &TableInfo {
        &self.info
    }

    fn model(&self) -> ModelType {
        ModelType::of::<T>()
    }

    fn apply(
        &self,
        event: &ChangeEvent,
        apply_on: &dyn ApplyOn,
        cancel: &CancelSignal,
    ) -> Result<ApplyOutcome> {
        let id = event.row_id;
        let view = self.view.clone();

        match event.operation {
            Operation::Insert => {
                let Some(row) = self.fetch(event)? else {
                    return Ok(ApplyOutcome::Skipped {
                        reason: "row no longer exists",
                    });
                };
                let value = serde_json::to_value(&row)?;
                let job: ApplyJob = Box::new(move || {
                    let mut view = view.write();
                    // Replayed inserts must not duplicate the key.
                    view.remove_by_key(id);
                    view.insert_head(row);
                    true
                });
                apply_on.apply(job, cancel)?;
                Ok(ApplyOutcome::Applied { row: Some(value) })
            }
            Operation::Update => {
                let Some(row) = self.fetch(event)? else {
                    return Ok(ApplyOutcome::Skipped {
                        reason: "row no longer exists",
                    });
                };
                let value = serde_json::to_value(&row)?;
                let replaced = apply_on.apply(
                    Box::new(move || view.write().replace_by_key(row).is_some()),
                    cancel,
                )?;
                if replaced {
                    Ok(ApplyOutcome::Applied { row: Some(value) })
                } else {
                    Ok(ApplyOutcome::Skipped {
                        reason: "row not in view",
                    })
                }
            }
            Operation::Delete => {
                let removed = apply_on.apply(
                    Box::new(move || view.write().remove_by_key(id).is_some()),
                    cancel,
                )?;
                if removed {
                    Ok(ApplyOutcome::Applied { row: None })
                } else {
                    Ok(ApplyOutcome::Skipped {
                        reason: "row not in view",
                    })
                }
            }
        }
    }
}

// --- Dispatcher ---

/// Counters of processed changes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub applied: u64,
    pub skipped: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    applied: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

/// Table name to binding, fixed once listening starts.
pub type Bindings = HashMap<String, Arc<dyn TableBinding>>;

/// Applies queued changes to live views. Clones share all state, so one
/// dispatcher can back several worker threads.
#[derive(Clone)]
pub struct ChangeDispatcher {
    bindings: Arc<Bindings>,
    locks: Arc<TableLocks>,
    notifier: Arc<ChangeNotifier>,
    apply_on: Arc<dyn ApplyOn>,
    cancel: CancelSignal,
    counters: Arc<Counters>,
}

impl ChangeDispatcher {
    pub fn new(
        bindings: Arc<Bindings>,
        locks: Arc<TableLocks>,
        notifier: Arc<ChangeNotifier>,
        apply_on: Arc<dyn ApplyOn>,
    ) -> Self {
        Self {
            bindings,
            locks,
            notifier,
            apply_on,
            cancel: CancelSignal::never(),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Stop [`run`](Self::run) and abandon pending marshalled applies once
    /// `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn locks(&self) -> &TableLocks {
        &self.locks
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            applied: self.counters.applied.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Apply one change under its table's lock.
    pub fn process(&self, event: &ChangeEvent) -> Result<ApplyOutcome> {
        let lock = self.locks.lock_for(&event.table);
        let _guard = lock.lock();

        let binding = self
            .bindings
            .get(&event.table)
            .ok_or_else(|| MirrorError::TableNotFound(event.table.clone()))?;

        if binding.model() != event.model {
            return Err(MirrorError::ModelMismatch {
                table: event.table.clone(),
                expected: binding.model().name(),
                got: event.model.name(),
            });
        }

        binding.apply(event, self.apply_on.as_ref(), &self.cancel)
    }

    /// Process one change, logging and dropping it on failure, and notify
    /// subscribers once the table lock is released.
    pub fn handle(&self, event: ChangeEvent) {
        debug!(
            table = %event.table,
            row_id = %event.row_id,
            version = %event.change_version,
            operation = %event.operation,
            "processing change"
        );

        match self.process(&event) {
            Ok(ApplyOutcome::Applied { row }) => {
                self.counters.applied.fetch_add(1, Ordering::Relaxed);
                self.notifier.broadcast(&TableChanged::from_event(&event, row));
            }
            Ok(ApplyOutcome::Skipped { reason }) => {
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    table = %event.table,
                    row_id = %event.row_id,
                    reason,
                    "change skipped"
                );
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    table = %event.table,
                    row_id = %event.row_id,
                    version = %event.change_version,
                    error = %e,
                    "failed to process change, dropping it"
                );
            }
        }
    }

    /// Drain `queue` until cancelled, waiting up to `idle` when it is empty.
    pub fn run(&self, queue: ChangeQueue, idle: Duration) {
        info!("dispatcher started");
        while !self.cancel.is_cancelled() {
            if let Some(event) = queue.pop_timeout(idle) {
                self.handle(event);
            }
        }
        info!(remaining = queue.len(), "dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChangeVersion, RowId};
    use serde::Serialize;
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone, Debug, PartialEq, Serialize)]
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

    struct StubFetcher {
        rows: Mutex<HashMap<i64, FetchResult<Order>>>,
        calls: AtomicUsize,
    }

    impl StubFetcher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                rows: Mutex::new(HashMap::new()),
                calls: AtomicUsize::new(0),
            })
        }

        fn set(&self, id: i64, result: FetchResult<Order>) {
            self.rows.lock().insert(id, result);
        }
    }

    impl RowFetcher<Order> for StubFetcher {
        fn get_row(&self, _table: &str, id: RowId) -> FetchResult<Order> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.rows
                .lock()
                .get(&id.0)
                .cloned()
                .unwrap_or(FetchResult::NotFound)
        }
    }

    fn dispatcher(view: &SharedView<Order>, fetcher: Arc<StubFetcher>) -> ChangeDispatcher {
        let binding: Arc<dyn TableBinding> = Arc::new(MirroredTable::new(view.clone(), fetcher));
        let mut bindings = Bindings::new();
        bindings.insert("orders".to_string(), binding);
        ChangeDispatcher::new(
            Arc::new(bindings),
            Arc::new(TableLocks::new()),
            Arc::new(ChangeNotifier::new()),
            Arc::new(Inline),
        )
    }

    fn event(version: i64, operation: Operation, id: i64) -> ChangeEvent {
        ChangeEvent {
            change_version: ChangeVersion(version),
            operation,
            row_id: RowId(id),
            table: "orders".to_string(),
            model: ModelType::of::<Order>(),
        }
    }

    fn order(id: i64, total: i64) -> Order {
        Order { id, total }
    }

    #[test]
    fn test_table_locks_get_or_create() {
        let locks = TableLocks::new();
        let a = locks.lock_for("orders");
        let b = locks.lock_for("orders");
        let c = locks.lock_for("customers");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(locks.len(), 2);

        let _guard = a.lock();
        assert!(locks.is_locked("orders"));
        assert!(!locks.is_locked("customers"));
    }

    #[test]
    fn test_insert_update_delete() {
        let view = SharedView::new();
        let fetcher = StubFetcher::new();
        let d = dispatcher(&view, fetcher.clone());

        fetcher.set(5, FetchResult::Found(order(5, 10)));
        d.handle(event(1, Operation::Insert, 5));
        assert_eq!(view.snapshot(), vec![order(5, 10)]);

        fetcher.set(5, FetchResult::Found(order(5, 20)));
        d.handle(event(2, Operation::Update, 5));
        assert_eq!(view.snapshot(), vec![order(5, 20)]);

        let calls_before = fetcher.calls.load(Ordering::SeqCst);
        d.handle(event(3, Operation::Delete, 5));
        assert!(view.is_empty());
        // Deletes never fetch.
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), calls_before);

        assert_eq!(
            d.stats(),
            DispatchStats {
                applied: 3,
                skipped: 0,
                failed: 0
            }
        );
        assert!(!d.locks().is_locked("orders"));
    }

    #[test]
    fn test_update_keeps_position() {
        let view = SharedView::from_view(crate::view::LiveView::from_rows(vec![
            order(1, 1),
            order(2, 2),
            order(3, 3),
        ]));
        let fetcher = StubFetcher::new();
        let d = dispatcher(&view, fetcher.clone());

        fetcher.set(2, FetchResult::Found(order(2, 99)));
        d.handle(event(4, Operation::Update, 2));

        assert_eq!(view.snapshot(), vec![order(1, 1), order(2, 99), order(3, 3)]);
    }

    #[test]
    fn test_update_missing_from_view_is_skipped() {
        let view = SharedView::new();
        let fetcher = StubFetcher::new();
        let d = dispatcher(&view, fetcher.clone());

        fetcher.set(8, FetchResult::Found(order(8, 1)));
        let outcome = d.process(&event(1, Operation::Update, 8)).unwrap();

        assert!(matches!(outcome, ApplyOutcome::Skipped { .. }));
        assert!(view.is_empty());
    }

    #[test]
    fn test_fetch_error_on_update_leaves_item() {
        let view = SharedView::from_view(crate::view::LiveView::from_rows(vec![order(1, 1)]));
        let fetcher = StubFetcher::new();
        let d = dispatcher(&view, fetcher.clone());

        fetcher.set(1, FetchResult::Error("connection reset".into()));
        d.handle(event(2, Operation::Update, 1));

        assert_eq!(view.snapshot(), vec![order(1, 1)]);
        assert_eq!(d.stats().failed, 1);
        assert!(!d.locks().is_locked("orders"));
    }

    #[test]
    fn test_delete_missing_is_noop() {
        let view = SharedView::from_view(crate::view::LiveView::from_rows(vec![order(1, 1)]));
        let d = dispatcher(&view, StubFetcher::new());

        d.handle(event(1, Operation::Delete, 42));
        assert_eq!(view.snapshot(), vec![order(1, 1)]);
        assert_eq!(d.stats().skipped, 1);
    }

    #[test]
    fn test_replayed_insert_does_not_duplicate() {
        let view = SharedView::from_view(crate::view::LiveView::from_rows(vec![
            order(1, 1),
            order(2, 2),
        ]));
        let fetcher = StubFetcher::new();
        let d = dispatcher(&view, fetcher.clone());

        fetcher.set(2, FetchResult::Found(order(2, 2)));
        d.handle(event(1, Operation::Insert, 2));

        assert_eq!(view.snapshot(), vec![order(2, 2), order(1, 1)]);
    }

    #[test]
    fn test_unknown_table_and_model_mismatch() {
        let view = SharedView::new();
        let d = dispatcher(&view, StubFetcher::new());

        let mut unknown = event(1, Operation::Delete, 1);
        unknown.table = "ghosts".to_string();
        assert!(matches!(
            d.process(&unknown),
            Err(MirrorError::TableNotFound(_))
        ));

        let mut wrong = event(1, Operation::Delete, 1);
        wrong.model = ModelType::of::<String>();
        assert!(matches!(
            d.process(&wrong),
            Err(MirrorError::ModelMismatch { .. })
        ));
    }

    #[test]
    fn test_applied_change_is_broadcast() {
        let view = SharedView::new();
        let fetcher = StubFetcher::new();
        let d = dispatcher(&view, fetcher.clone());
        let handle = d.notifier.subscribe(Default::default());

        fetcher.set(3, FetchResult::Found(order(3, 30)));
        d.handle(event(7, Operation::Insert, 3));

        match handle.try_recv().unwrap() {
            crate::notify::MirrorEvent::Changed(change) => {
                assert_eq!(change.row_id, RowId(3));
                assert_eq!(change.change_version, ChangeVersion(7));
                assert_eq!(change.row.unwrap()["total"], 30);
            }
            other => panic!("Expected Changed event, got {:?}", other),
        }
    }

    #[test]
    fn test_marshalled_apply_runs_on_pump_thread() {
        let (apply, pump) = MarshalledApply::channel();
        let main_thread = std::thread::current().id();

        let worker = std::thread::spawn(move || {
            apply.apply(
                Box::new(move || std::thread::current().id() == main_thread),
                &CancelSignal::never(),
            )
        });

        assert!(pump.run_one(Duration::from_secs(5)));
        assert!(worker.join().unwrap().unwrap());
        assert_eq!(pump.run_pending(), 0);
    }

    #[test]
    fn test_marshalled_apply_after_pump_dropped() {
        let (apply, pump) = MarshalledApply::channel();
        drop(pump);
        assert!(matches!(
            apply.apply(Box::new(|| true), &CancelSignal::never()),
            Err(MirrorError::Shutdown)
        ));
    }

    #[test]
    fn test_marshalled_apply_abandoned_on_cancel() {
        let (apply, pump) = MarshalledApply::channel();
        let (cancel, signal) = crate::cancel::CancelHandle::new();
        let ran = Arc::new(AtomicBool::new(false));

        let worker = {
            let ran = Arc::clone(&ran);
            std::thread::spawn(move || {
                apply.apply(
                    Box::new(move || {
                        ran.store(true, Ordering::SeqCst);
                        true
                    }),
                    &signal,
                )
            })
        };

        // Nobody pumps; cancelling alone releases the worker.
        std::thread::sleep(Duration::from_millis(20));
        cancel.cancel();
        assert!(matches!(worker.join().unwrap(), Err(MirrorError::Shutdown)));

        // The abandoned job is discarded when the host catches up.
        assert_eq!(pump.run_pending(), 0);
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_run_stops_on_cancel() {
        let view = SharedView::new();
        let (cancel, signal) = crate::cancel::CancelHandle::new();
        let d = dispatcher(&view, StubFetcher::new()).with_cancel(signal);
        let queue = ChangeQueue::new();

        let worker = {
            let queue = queue.clone();
            std::thread::spawn(move || d.run(queue, Duration::from_millis(5)))
        };
        cancel.cancel();
        worker.join().unwrap();
        assert!(queue.is_empty());
    }
}
