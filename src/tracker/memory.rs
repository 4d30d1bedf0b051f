//! In-memory change-tracking backend.
//!
//! Rows are stored as JSON values. Every mutation takes the next
//! database-wide version, updates the per-row change record, and fires every
//! subscription armed on the table (each exactly once).

use super::{ChangeRow, ChangeTracker, Notification, Subscription};
use crate::error::{MirrorError, Result};
use crate::model::RowFetcher;
use crate::types::{ChangeVersion, FetchResult, Operation, RowId};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::sync::Arc;

/// Backend call that can be made to fail on purpose.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Fault {
    Baseline,
    Changes,
    Arm,
    Fetch,
}

/// Per-row change-tracking record.
#[derive(Clone, Copy, Debug)]
struct RowChange {
    version: ChangeVersion,
    /// Version the current incarnation of the row was inserted at.
    created: Option<ChangeVersion>,
    deleted: bool,
}

#[derive(Default)]
struct TrackedTable {
    columns: Vec<String>,
    rows: BTreeMap<RowId, serde_json::Value>,
    changes: BTreeMap<RowId, RowChange>,
    armed: Vec<Sender<Notification>>,
}

impl TrackedTable {
    fn fire(&mut self, notification: Notification) {
        for sender in self.armed.drain(..) {
            let _ = sender.try_send(notification.clone());
        }
    }
}

#[derive(Default)]
struct TrackerInner {
    tables: HashMap<String, TrackedTable>,
    version: ChangeVersion,
    faults: HashMap<(String, Fault), u32>,
}

impl TrackerInner {
    fn table_mut(&mut self, table: &str) -> Result<&mut TrackedTable> {
        self.tables
            .get_mut(table)
            .ok_or_else(|| MirrorError::TableNotFound(table.to_string()))
    }

    fn check_fault(&mut self, table: &str, fault: Fault) -> Result<()> {
        let key = (table.to_string(), fault);
        if let Some(remaining) = self.faults.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(MirrorError::Backend(format!(
                    "injected {:?} failure on {}",
                    fault, table
                )));
            }
        }
        Ok(())
    }

    fn record(&mut self, table: &str, row_id: RowId, operation: Operation) -> Result<ChangeVersion> {
        let version = self.version.next();
        let tracked = self.table_mut(table)?;

        let previous = tracked.changes.get(&row_id).copied();
        let created = match operation {
            Operation::Insert => Some(version),
            _ => previous.and_then(|c| c.created),
        };
        tracked.changes.insert(
            row_id,
            RowChange {
                version,
                created,
                deleted: operation == Operation::Delete,
            },
        );
        tracked.fire(Notification::Change);

        self.version = version;
        Ok(version)
    }
}

/// Change-tracking backend held entirely in memory.
#[derive(Default)]
pub struct InMemoryTracker {
    inner: Mutex<TrackerInner>,
}

impl InMemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a tracked table. `columns` bounds what a watched query may select.
    pub fn create_table(&self, table: &str, columns: &[&str]) {
        let mut inner = self.inner.lock();
        inner.tables.entry(table.to_string()).or_insert_with(|| TrackedTable {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        });
    }

    /// Insert a new row.
    pub fn insert<T: Serialize>(&self, table: &str, id: RowId, row: &T) -> Result<ChangeVersion> {
        let value = serde_json::to_value(row)?;
        let mut inner = self.inner.lock();
        let tracked = inner.table_mut(table)?;
        if tracked.rows.contains_key(&id) {
            return Err(MirrorError::Backend(format!(
                "duplicate key {} in {}",
                id, table
            )));
        }
        tracked.rows.insert(id, value);
        inner.record(table, id, Operation::Insert)
    }

    /// Replace an existing row.
    pub fn update<T: Serialize>(&self, table: &str, id: RowId, row: &T) -> Result<ChangeVersion> {
        let value = serde_json::to_value(row)?;
        let mut inner = self.inner.lock();
        let tracked = inner.table_mut(table)?;
        match tracked.rows.get_mut(&id) {
            Some(existing) => *existing = value,
            None => {
                return Err(MirrorError::Backend(format!(
                    "row {} not found in {}",
                    id, table
                )))
            }
        }
        inner.record(table, id, Operation::Update)
    }

    /// Delete an existing row.
    pub fn delete(&self, table: &str, id: RowId) -> Result<ChangeVersion> {
        let mut inner = self.inner.lock();
        let tracked = inner.table_mut(table)?;
        if tracked.rows.remove(&id).is_none() {
            return Err(MirrorError::Backend(format!(
                "row {} not found in {}",
                id, table
            )));
        }
        inner.record(table, id, Operation::Delete)
    }

    /// Fire every armed subscription on `table` with an unexpected notification.
    pub fn notify_anomaly(&self, table: &str, info: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.table_mut(table)?.fire(Notification::Unexpected {
            info: info.to_string(),
        });
        Ok(())
    }

    /// Fail the next `times` calls of `fault` against `table`.
    pub fn inject_fault(&self, table: &str, fault: Fault, times: u32) {
        self.inner
            .lock()
            .faults
            .insert((table.to_string(), fault), times);
    }

    /// Current row as stored.
    pub fn row(&self, table: &str, id: RowId) -> Result<Option<serde_json::Value>> {
        let mut inner = self.inner.lock();
        inner.check_fault(table, Fault::Fetch)?;
        Ok(inner.table_mut(table)?.rows.get(&id).cloned())
    }

    /// All rows of a table, ordered by id.
    pub fn rows(&self, table: &str) -> Result<Vec<serde_json::Value>> {
        let mut inner = self.inner.lock();
        Ok(inner.table_mut(table)?.rows.values().cloned().collect())
    }

    /// Number of subscriptions currently armed on `table`.
    pub fn armed_count(&self, table: &str) -> usize {
        self.inner
            .lock()
            .tables
            .get(table)
            .map(|t| t.armed.len())
            .unwrap_or(0)
    }

    /// Database-wide current version.
    pub fn version(&self) -> ChangeVersion {
        self.inner.lock().version
    }
}

impl ChangeTracker for InMemoryTracker {
    fn current_version(&self, table: &str) -> Result<ChangeVersion> {
        let mut inner = self.inner.lock();
        inner.check_fault(table, Fault::Baseline)?;
        let tracked = inner.table_mut(table)?;
        Ok(tracked
            .changes
            .values()
            .map(|c| c.version)
            .max()
            .unwrap_or(ChangeVersion::ZERO))
    }

    fn changes_since(&self, table: &str, since: ChangeVersion) -> Result<Vec<ChangeRow>> {
        let mut inner = self.inner.lock();
        inner.check_fault(table, Fault::Changes)?;
        let tracked = inner.table_mut(table)?;

        let mut rows: Vec<ChangeRow> = tracked
            .changes
            .iter()
            .filter(|(_, change)| change.version > since)
            .map(|(id, change)| {
                // Net operation relative to `since`, as change tracking reports it.
                let operation = if change.deleted {
                    Operation::Delete
                } else if change.created.map_or(false, |created| created > since) {
                    Operation::Insert
                } else {
                    Operation::Update
                };
                ChangeRow {
                    version: change.version,
                    operation,
                    row_id: *id,
                }
            })
            .collect();
        rows.sort_by_key(|r| r.version);
        Ok(rows)
    }

    fn arm(&self, table: &str, columns: &[String]) -> Result<Subscription> {
        let mut inner = self.inner.lock();
        inner.check_fault(table, Fault::Arm)?;
        let tracked = inner.table_mut(table)?;

        if !tracked.columns.is_empty() {
            if let Some(unknown) = columns.iter().find(|c| !tracked.columns.contains(c)) {
                return Err(MirrorError::Backend(format!(
                    "invalid column name '{}' for {}",
                    unknown, table
                )));
            }
        }

        let (sender, subscription) = Subscription::channel();
        tracked.armed.push(sender);
        Ok(subscription)
    }
}

/// [`RowFetcher`] that reads rows from an [`InMemoryTracker`] and
/// deserializes them into `T`.
pub struct JsonRowFetcher<T> {
    tracker: Arc<InMemoryTracker>,
    _model: PhantomData<fn() -> T>,
}

impl<T> JsonRowFetcher<T> {
    pub fn new(tracker: Arc<InMemoryTracker>) -> Self {
        Self {
            tracker,
            _model: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> RowFetcher<T> for JsonRowFetcher<T> {
    fn get_row(&self, table: &str, id: RowId) -> FetchResult<T> {
        match self.tracker.row(table, id) {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(row) => FetchResult::Found(row),
                Err(e) => FetchResult::Error(format!("malformed row: {}", e)),
            },
            Ok(None) => FetchResult::NotFound,
            Err(e) => FetchResult::Error(e.to_string()),
        }
    }
}
