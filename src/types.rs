//! Core types for the table mirror.

use serde::{Deserialize, Serialize};
use std::any::TypeId;
use std::fmt;

/// Primary key value of a mirrored row.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowId(pub i64);

impl fmt::Debug for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RowId({})", self.0)
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Change-tracking version (database-wide, monotonically increasing).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct ChangeVersion(pub i64);

impl ChangeVersion {
    /// Version before any tracked change.
    pub const ZERO: ChangeVersion = ChangeVersion(0);

    pub fn next(self) -> Self {
        ChangeVersion(self.0 + 1)
    }
}

impl fmt::Debug for ChangeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Display for ChangeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Row operation recorded by change tracking.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    /// Parse a change-tracking operation code (`I`, `U`, `D`).
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "I" => Some(Operation::Insert),
            "U" => Some(Operation::Update),
            "D" => Some(Operation::Delete),
            _ => None,
        }
    }

    /// The single-letter change-tracking code.
    pub fn code(self) -> &'static str {
        match self {
            Operation::Insert => "I",
            Operation::Update => "U",
            Operation::Delete => "D",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Handle naming the Rust model bound to a table.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelType {
    id: TypeId,
    name: &'static str,
}

impl ModelType {
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModelType({})", self.name)
    }
}

/// A single detected row change, as emitted by a table watcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    pub change_version: ChangeVersion,
    pub operation: Operation,
    pub row_id: RowId,
    pub table: String,
    pub model: ModelType,
}

/// Table metadata resolved for a model type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableInfo {
    /// Table name as known to the change-tracking backend.
    pub table: String,
    /// Columns selected by the watched query, in order.
    pub columns: Vec<String>,
    /// Primary key column.
    pub primary_key: String,
}

impl TableInfo {
    pub fn new(table: impl Into<String>, columns: &[&str], primary_key: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            primary_key: primary_key.into(),
        }
    }
}

/// Outcome of fetching a single row.
#[derive(Clone, Debug, PartialEq)]
pub enum FetchResult<T> {
    Found(T),
    NotFound,
    Error(String),
}

impl<T> From<crate::error::Result<Option<T>>> for FetchResult<T> {
    fn from(result: crate::error::Result<Option<T>>) -> Self {
        match result {
            Ok(Some(row)) => FetchResult::Found(row),
            Ok(None) => FetchResult::NotFound,
            Err(e) => FetchResult::Error(e.to_string()),
        }
    }
}
