//! Change-tracking backend contract.
//!
//! A backend answers two queries per table, the baseline version and the
//! rows changed since a version, and offers a query notification that fires
//! at most once per arm. Every fire must be followed by a fresh `arm` or
//! further changes go unnoticed.

mod memory;

pub use memory::{Fault, InMemoryTracker, JsonRowFetcher};

use crate::error::Result;
use crate::types::{ChangeVersion, Operation, RowId};
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};

/// One row of a differential change-tracking read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChangeRow {
    pub version: ChangeVersion,
    pub operation: Operation,
    pub row_id: RowId,
}

/// What an armed subscription reported when it fired.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    /// The watched query's result set changed.
    Change,
    /// Anything else: schema change, timeout, backend restart, closed channel.
    Unexpected { info: String },
}

/// A single-shot query notification.
///
/// Fires at most once. The backend keeps the sending half and drops it after
/// firing; a subscription whose sender is dropped without firing reports
/// [`Notification::Unexpected`].
#[derive(Debug)]
pub struct Subscription {
    receiver: Receiver<Notification>,
}

impl Subscription {
    /// Create a subscription and the sender a backend fires it through.
    pub fn channel() -> (Sender<Notification>, Subscription) {
        let (sender, receiver) = bounded(1);
        (sender, Subscription { receiver })
    }

    /// Non-blocking check.
    pub fn try_fired(&self) -> Option<Notification> {
        match self.receiver.try_recv() {
            Ok(notification) => Some(notification),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Notification::closed()),
        }
    }

    pub(crate) fn receiver(&self) -> &Receiver<Notification> {
        &self.receiver
    }
}

impl Notification {
    pub(crate) fn closed() -> Self {
        Notification::Unexpected {
            info: "subscription closed by backend".into(),
        }
    }
}

/// Backend providing change tracking and query notifications for tables.
pub trait ChangeTracker: Send + Sync {
    /// Highest change version currently recorded for `table` (0 if none).
    fn current_version(&self, table: &str) -> Result<ChangeVersion>;

    /// Changes with version strictly greater than `since`, ascending by version.
    fn changes_since(&self, table: &str, since: ChangeVersion) -> Result<Vec<ChangeRow>>;

    /// Issue the watched query over `columns` and register a one-shot
    /// notification on its result set.
    fn arm(&self, table: &str, columns: &[String]) -> Result<Subscription>;
}

impl<T: ChangeTracker + ?Sized> ChangeTracker for std::sync::Arc<T> {
    fn current_version(&self, table: &str) -> Result<ChangeVersion> {
        (**self).current_version(table)
    }

    fn changes_since(&self, table: &str, since: ChangeVersion) -> Result<Vec<ChangeRow>> {
        (**self).changes_since(table, since)
    }

    fn arm(&self, table: &str, columns: &[String]) -> Result<Subscription> {
        (**self).arm(table, columns)
    }
}
