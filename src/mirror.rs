//! Table mirror: wires watchers, the change queue and the dispatcher
//! together behind a start/stop control surface.

use crate::cancel::{CancelHandle, CancelSignal};
use crate::checkpoint::{WatermarkCheckpoint, Watermarks};
use crate::dispatcher::{
    ApplyOn, Bindings, ChangeDispatcher, DispatchStats, Inline, MirroredTable, TableBinding,
    TableLocks,
};
use crate::error::{MirrorError, Result};
use crate::model::{Model, RowFetcher};
use crate::notify::{ChangeNotifier, NotifierConfig, SubscriberHandle, SubscriberId, TableFilter};
use crate::queue::ChangeQueue;
use crate::tracker::ChangeTracker;
use crate::types::{ChangeVersion, ModelType, TableInfo};
use crate::view::SharedView;
use crate::watcher::{RetryPolicy, TableWatcher};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, warn};

/// Mirror configuration.
#[derive(Clone, Debug)]
pub struct MirrorConfig {
    /// How long an idle dispatcher worker waits before re-checking the queue.
    pub idle_interval: Duration,

    /// Number of dispatcher worker threads. Each worker drains its own queue
    /// and every table is routed to exactly one of them, so changes to a
    /// table stay in version order while different tables run in parallel.
    pub workers: usize,

    /// Backoff for re-arming a notification after a failure.
    pub arm_retry: RetryPolicy,

    /// Buffer size for subscribers created through [`TableMirror::subscribe`].
    pub subscriber_buffer: usize,

    /// Where to persist watermarks between runs (None = not persisted).
    pub checkpoint_path: Option<PathBuf>,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_millis(50),
            workers: 1,
            arm_retry: RetryPolicy::default(),
            subscriber_buffer: 1000,
            checkpoint_path: None,
        }
    }
}

/// Threads of one listening session.
struct Session {
    cancel: CancelHandle,
    watchers: Vec<JoinHandle<Option<TableWatcher>>>,
    workers: Vec<JoinHandle<()>>,
}

/// Live mirror of a set of tables.
///
/// Register every table first, then call [`start_listening`]. While
/// listening, the dispatcher is the only writer of the registered views.
///
/// [`start_listening`]: TableMirror::start_listening
pub struct TableMirror {
    config: MirrorConfig,
    tracker: Arc<dyn ChangeTracker>,
    /// One queue per dispatcher worker.
    queues: Vec<ChangeQueue>,
    locks: Arc<TableLocks>,
    notifier: Arc<ChangeNotifier>,
    apply_on: Arc<dyn ApplyOn>,

    bindings: RwLock<Bindings>,
    views: RwLock<HashMap<ModelType, Box<dyn Any + Send + Sync>>>,

    /// Watchers not currently running, in registration order.
    watchers: Mutex<Vec<TableWatcher>>,
    watermarks: RwLock<HashMap<String, Arc<AtomicI64>>>,

    checkpoint: Option<WatermarkCheckpoint>,
    session: Mutex<Option<Session>>,
    dispatcher: Mutex<Option<ChangeDispatcher>>,
}

impl TableMirror {
    pub fn new(tracker: Arc<dyn ChangeTracker>, config: MirrorConfig) -> Result<Self> {
        let checkpoint = match &config.checkpoint_path {
            Some(path) => Some(WatermarkCheckpoint::open(path)?),
            None => None,
        };

        let queues = (0..config.workers.max(1))
            .map(|_| ChangeQueue::new())
            .collect();

        Ok(Self {
            config,
            tracker,
            queues,
            locks: Arc::new(TableLocks::new()),
            notifier: Arc::new(ChangeNotifier::new()),
            apply_on: Arc::new(Inline),
            bindings: RwLock::new(Bindings::new()),
            views: RwLock::new(HashMap::new()),
            watchers: Mutex::new(Vec::new()),
            watermarks: RwLock::new(HashMap::new()),
            checkpoint,
            session: Mutex::new(None),
            dispatcher: Mutex::new(None),
        })
    }

    /// Run view mutations through `apply_on` instead of on dispatcher threads.
    pub fn with_apply_on(mut self, apply_on: Arc<dyn ApplyOn>) -> Self {
        self.apply_on = apply_on;
        self
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    // --- Registration ---

    /// Mirror the table of `T` into `view`, fetching changed rows with `fetcher`.
    pub fn register<T, F>(&self, view: SharedView<T>, fetcher: F) -> Result<()>
    where
        T: Model,
        F: RowFetcher<T> + 'static,
    {
        if self.is_running() {
            return Err(MirrorError::AlreadyRunning);
        }

        let info = T::table_info();
        let mut bindings = self.bindings.write();
        if bindings.contains_key(&info.table) {
            return Err(MirrorError::TableAlreadyRegistered(info.table));
        }

        let fetcher: Arc<dyn RowFetcher<T>> = Arc::new(fetcher);
        let binding: Arc<dyn TableBinding> = Arc::new(MirroredTable::new(view.clone(), fetcher));
        bindings.insert(info.table.clone(), binding);

        let watcher = TableWatcher::new(Arc::clone(&self.tracker), &info, ModelType::of::<T>());
        self.watermarks
            .write()
            .insert(info.table.clone(), watcher.watermark_handle());
        self.watchers.lock().push(watcher);
        self.views
            .write()
            .insert(ModelType::of::<T>(), Box::new(view));

        info!(
            table = %info.table,
            columns = ?info.columns,
            primary_key = %info.primary_key,
            "table registered"
        );
        Ok(())
    }

    /// The live view registered for `T`.
    pub fn view<T: Model>(&self) -> Option<SharedView<T>> {
        self.views
            .read()
            .get(&ModelType::of::<T>())
            .and_then(|view| view.downcast_ref::<SharedView<T>>())
            .cloned()
    }

    /// Seed the view of `T` with a full load before listening starts.
    pub fn load_initial<T: Model>(&self, rows: Vec<T>) -> Result<()> {
        if self.is_running() {
            return Err(MirrorError::AlreadyRunning);
        }
        let table = T::table_info().table;
        let view = self
            .view::<T>()
            .ok_or_else(|| MirrorError::TableNotFound(table.clone()))?;
        info!(table = %table, rows = rows.len(), "initial load");
        view.reset(rows);
        Ok(())
    }

    /// Schema of a registered table.
    pub fn table_info(&self, table: &str) -> Option<TableInfo> {
        self.bindings.read().get(table).map(|b| b.info().clone())
    }

    /// Registered table names.
    pub fn tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self.bindings.read().keys().cloned().collect();
        tables.sort();
        tables
    }

    // --- Control surface ---

    /// Bootstrap and arm every registered table, then start the dispatcher.
    ///
    /// Returns false without doing anything if already listening.
    pub fn start_listening(&self) -> Result<bool> {
        let mut session = self.session.lock();
        if session.is_some() {
            info!("mirror already listening");
            return Ok(false);
        }

        let resume_points = self.load_checkpoint();
        let (cancel, signal) = CancelHandle::new();
        let mut watchers = std::mem::take(&mut *self.watchers.lock());

        // Arm everything before any change can be dispatched.
        for watcher in watchers.iter_mut() {
            if let Some(version) = resume_points.get(watcher.table()) {
                if !watcher.has_baseline() {
                    watcher.resume_from(*version);
                    info!(table = %watcher.table(), version = %version, "resuming from checkpoint");
                }
            }
            if !watcher.has_baseline() {
                watcher.bootstrap();
            }
            let producer = self.queue_for(watcher.table()).producer();
            let _ = watcher.arm_and_catch_up(|event| {
                producer.push(event);
            });
        }

        let mut started = Session {
            cancel,
            watchers: Vec::new(),
            workers: Vec::new(),
        };

        let dispatcher = ChangeDispatcher::new(
            Arc::new(self.bindings.read().clone()),
            Arc::clone(&self.locks),
            Arc::clone(&self.notifier),
            Arc::clone(&self.apply_on),
        )
        .with_cancel(signal.clone());

        let spawned = self.spawn_threads(&mut started, watchers, &dispatcher, signal);
        if let Err(e) = spawned {
            error!(error = %e, "failed to start mirror threads");
            self.shutdown(started);
            return Err(e);
        }

        *self.dispatcher.lock() = Some(dispatcher);
        info!(
            tables = started.watchers.len(),
            workers = started.workers.len(),
            "mirror listening"
        );
        *session = Some(started);
        Ok(true)
    }

    fn spawn_threads(
        &self,
        session: &mut Session,
        watchers: Vec<TableWatcher>,
        dispatcher: &ChangeDispatcher,
        signal: CancelSignal,
    ) -> Result<()> {
        let mut pending = watchers.into_iter();
        while let Some(watcher) = pending.next() {
            let producer = self.queue_for(watcher.table()).producer();
            let signal = signal.clone();
            let retry = self.config.arm_retry.clone();
            let builder =
                thread::Builder::new().name(format!("mirror-watch-{}", watcher.table()));

            match spawn_owned(builder, watcher, move |watcher| {
                watcher.run(producer, signal, retry)
            }) {
                Ok(handle) => session.watchers.push(handle),
                Err((e, watcher)) => {
                    let mut idle = self.watchers.lock();
                    if let Some(watcher) = watcher {
                        error!(
                            table = %watcher.table(),
                            error = %e,
                            "failed to spawn table watcher"
                        );
                        idle.push(watcher);
                    }
                    idle.extend(pending);
                    return Err(e.into());
                }
            }
        }

        for (i, queue) in self.queues.iter().enumerate() {
            let dispatcher = dispatcher.clone();
            let queue = queue.clone();
            let idle = self.config.idle_interval;

            let handle = thread::Builder::new()
                .name(format!("mirror-dispatch-{}", i))
                .spawn(move || dispatcher.run(queue, idle))?;
            session.workers.push(handle);
        }

        Ok(())
    }

    /// The queue, and so the worker, that every change of `table` goes to.
    fn queue_for(&self, table: &str) -> &ChangeQueue {
        &self.queues[worker_index(table, self.queues.len())]
    }

    /// Signal cancellation and wait for every thread to finish.
    ///
    /// An in-flight change completes before its worker exits. Watchers keep
    /// their watermarks for the next start, and the checkpoint (if any) is
    /// written.
    pub fn stop_listening(&self) -> Result<()> {
        let Some(session) = self.session.lock().take() else {
            return Ok(());
        };

        self.shutdown(session);

        let result = self.save_checkpoint();
        info!(pending = self.queue_len(), "mirror stopped");
        result
    }

    fn shutdown(&self, session: Session) {
        session.cancel.cancel();

        for handle in session.workers {
            if handle.join().is_err() {
                error!("dispatcher worker panicked");
            }
        }

        let mut watchers = self.watchers.lock();
        for handle in session.watchers {
            match handle.join() {
                Ok(Some(watcher)) => watchers.push(watcher),
                Ok(None) => {}
                Err(_) => error!("table watcher panicked, its table is no longer watched"),
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.session.lock().is_some()
    }

    // --- Checkpoint ---

    fn load_checkpoint(&self) -> Watermarks {
        let Some(checkpoint) = &self.checkpoint else {
            return Watermarks::new();
        };
        match checkpoint.load() {
            Ok(marks) => marks,
            Err(e) => {
                warn!(
                    path = %checkpoint.path().display(),
                    error = %e,
                    "ignoring unreadable checkpoint"
                );
                Watermarks::new()
            }
        }
    }

    fn save_checkpoint(&self) -> Result<()> {
        let Some(checkpoint) = &self.checkpoint else {
            return Ok(());
        };
        let marks: Watermarks = self
            .watchers
            .lock()
            .iter()
            .map(|w| (w.table().to_string(), w.last_change_version()))
            .collect();
        checkpoint.save(&marks)
    }

    // --- Introspection ---

    /// Current watermark of `table`.
    pub fn watermark(&self, table: &str) -> Option<ChangeVersion> {
        self.watermarks
            .read()
            .get(table)
            .map(|v| ChangeVersion(v.load(Ordering::Acquire)))
    }

    /// Changes waiting for dispatch, across all workers.
    pub fn queue_len(&self) -> usize {
        self.queues.iter().map(ChangeQueue::len).sum()
    }

    /// Dispatch counters since the last start.
    pub fn stats(&self) -> DispatchStats {
        self.dispatcher
            .lock()
            .as_ref()
            .map(|d| d.stats())
            .unwrap_or_default()
    }

    pub fn locks(&self) -> &TableLocks {
        &self.locks
    }

    // --- Subscriptions ---

    /// Subscribe to applied changes of the tables matching `filter`.
    pub fn subscribe(&self, filter: TableFilter) -> SubscriberHandle {
        self.notifier.subscribe(NotifierConfig {
            buffer_size: self.config.subscriber_buffer,
            filter,
        })
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.notifier.unsubscribe(id);
    }
}

/// Worker index for `table` out of `workers`.
fn worker_index(table: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    table.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}

/// Spawn a thread running `f(value)`. If the thread cannot be started,
/// `value` is handed back alongside the error.
fn spawn_owned<T, R, F>(
    builder: thread::Builder,
    value: T,
    f: F,
) -> std::result::Result<JoinHandle<Option<R>>, (io::Error, Option<T>)>
where
    T: Send + 'static,
    R: Send + 'static,
    F: FnOnce(T) -> R + Send + 'static,
{
    let slot = Arc::new(Mutex::new(Some(value)));
    let owned = Arc::clone(&slot);

    let spawned = builder.spawn(move || {
        let value = owned.lock().take();
        value.map(f)
    });
    match spawned {
        Ok(handle) => Ok(handle),
        Err(e) => {
            let value = slot.lock().take();
            Err((e, value))
        }
    }
}

impl Drop for TableMirror {
    fn drop(&mut self) {
        // Best-effort stop on drop
        let _ = self.stop_listening();
    }
}
