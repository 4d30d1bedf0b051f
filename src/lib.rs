//! # Table Mirror
//!
//! Keeps live, in-process mirrors of database tables by replaying the
//! changes a change-tracking backend reports.
//!
//! ## Core Concepts
//!
//! - **Watchers**: one per table; bootstrap a watermark, arm a single-shot
//!   query notification, and read changes past the watermark each time it fires
//! - **Change queue**: unbounded FIFO between watchers and the dispatcher
//! - **Dispatcher**: applies each change under a per-table lock, fetching the
//!   changed row and inserting, replacing or removing it in the live view
//! - **Live views**: the mirrored collections the host application reads
//!
//! ## Example
//!
//! ```ignore
//! use table_mirror::{InMemoryTracker, JsonRowFetcher, MirrorConfig, SharedView, TableMirror};
//!
//! let tracker = Arc::new(InMemoryTracker::new());
//! tracker.create_table("orders", &["id", "total"]);
//!
//! let mirror = TableMirror::new(tracker.clone(), MirrorConfig::default())?;
//! let orders = SharedView::<Order>::new();
//! mirror.register(orders.clone(), JsonRowFetcher::new(tracker.clone()))?;
//! mirror.start_listening()?;
//!
//! tracker.insert("orders", RowId(1), &Order { id: 1, total: 10 })?;
//! // ...shortly after, `orders` holds the new row at its head.
//!
//! mirror.stop_listening()?;
//! ```

pub mod cancel;
pub mod checkpoint;
pub mod dispatcher;
pub mod error;
pub mod mirror;
pub mod model;
pub mod notify;
pub mod queue;
pub mod tracker;
pub mod types;
pub mod view;
pub mod watcher;

// Re-exports
pub use cancel::{CancelHandle, CancelSignal};
pub use checkpoint::{WatermarkCheckpoint, Watermarks};
pub use dispatcher::{
    ApplyJob, ApplyOn, ApplyOutcome, ApplyPump, Bindings, ChangeDispatcher, DispatchStats, Inline,
    MarshalledApply, MirroredTable, TableBinding, TableLocks,
};
pub use error::{MirrorError, Result};
pub use mirror::{MirrorConfig, TableMirror};
pub use model::{Model, RowFetcher};
pub use notify::{
    ChangeNotifier, DropReason, MirrorEvent, NotifierConfig, SubscriberHandle, SubscriberId,
    TableChanged, TableFilter,
};
pub use queue::{ChangeQueue, QueueProducer};
pub use tracker::{
    ChangeRow, ChangeTracker, Fault, InMemoryTracker, JsonRowFetcher, Notification, Subscription,
};
pub use types::*;
pub use view::{LiveView, SharedView};
pub use watcher::{RetryPolicy, TableWatcher, WatcherPhase, WatcherState};
