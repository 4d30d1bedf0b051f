//! Outbound change notifications.
//!
//! After the dispatcher applies a change it broadcasts a [`TableChanged`]
//! event to every interested subscriber. Each subscriber owns a bounded
//! buffer; a subscriber that falls behind is dropped rather than stalling
//! the dispatcher.
//!
//! # Example
//!
//! ```ignore
//! let handle = mirror.subscribe(TableFilter::tables(vec!["orders".to_string()]));
//!
//! loop {
//!     match handle.recv() {
//!         Ok(MirrorEvent::Changed(change)) => refresh(&change.table, change.row_id),
//!         Ok(MirrorEvent::Dropped { .. }) | Err(_) => break,
//!     }
//! }
//! ```

use crate::types::{ChangeEvent, ChangeVersion, Operation, RowId};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A change that has been applied to a live view.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableChanged {
    pub table: String,
    pub row_id: RowId,
    pub operation: Operation,
    pub change_version: ChangeVersion,
    /// The fetched row for inserts and updates, `None` for deletes.
    pub row: Option<serde_json::Value>,
}

impl TableChanged {
    pub fn from_event(event: &ChangeEvent, row: Option<serde_json::Value>) -> Self {
        Self {
            table: event.table.clone(),
            row_id: event.row_id,
            operation: event.operation,
            change_version: event.change_version,
            row,
        }
    }
}

/// Events delivered to subscribers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MirrorEvent {
    Changed(TableChanged),
    /// Subscription was dropped; no further events follow.
    Dropped { reason: DropReason },
}

/// Why a subscriber was dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
}

/// Which tables a subscriber hears about.
#[derive(Clone, Debug, Default)]
pub struct TableFilter {
    /// `None` means every table.
    pub tables: Option<Vec<String>>,
}

impl TableFilter {
    pub fn all() -> Self {
        Self { tables: None }
    }

    pub fn tables(tables: Vec<String>) -> Self {
        Self {
            tables: Some(tables),
        }
    }

    fn matches(&self, table: &str) -> bool {
        match &self.tables {
            Some(tables) => tables.iter().any(|t| t == table),
            None => true,
        }
    }
}

/// Configuration for one subscriber.
#[derive(Clone, Debug)]
pub struct NotifierConfig {
    /// Max buffered events before the subscriber is dropped.
    /// Default: 1000
    pub buffer_size: usize,

    pub filter: TableFilter,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            filter: TableFilter::all(),
        }
    }
}

/// Unique identifier for a subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriberId(pub u64);

/// Receiving end of a subscription.
pub struct SubscriberHandle {
    pub id: SubscriberId,
    pub receiver: Receiver<MirrorEvent>,
}

impl SubscriberHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<MirrorEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<MirrorEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<MirrorEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

struct Subscriber {
    filter: TableFilter,
    sender: Sender<MirrorEvent>,
}

impl Subscriber {
    /// Returns false if the buffer is full or the receiver is gone.
    fn try_send(&self, event: MirrorEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Fans applied changes out to subscribers.
pub struct ChangeNotifier {
    subscribers: RwLock<HashMap<SubscriberId, Subscriber>>,
    next_id: AtomicU64,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self, config: NotifierConfig) -> SubscriberHandle {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(config.buffer_size.max(1));

        self.subscribers.write().insert(
            id,
            Subscriber {
                filter: config.filter,
                sender,
            },
        );

        SubscriberHandle { id, receiver }
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        if let Some(sub) = self.subscribers.write().remove(&id) {
            let _ = sub.sender.try_send(MirrorEvent::Dropped {
                reason: DropReason::Unsubscribed,
            });
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Send `change` to matching subscribers, dropping any that cannot keep up.
    pub fn broadcast(&self, change: &TableChanged) {
        let mut to_remove = Vec::new();

        {
            let subs = self.subscribers.read();
            for (id, sub) in subs.iter() {
                if sub.filter.matches(&change.table)
                    && !sub.try_send(MirrorEvent::Changed(change.clone()))
                {
                    to_remove.push(*id);
                }
            }
        }

        if !to_remove.is_empty() {
            let mut subs = self.subscribers.write();
            for id in to_remove {
                if let Some(sub) = subs.remove(&id) {
                    tracing::warn!(subscriber = id.0, "dropping slow subscriber");
                    let _ = sub.sender.try_send(MirrorEvent::Dropped {
                        reason: DropReason::BufferOverflow,
                    });
                }
            }
        }
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}
