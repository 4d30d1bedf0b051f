//! Collaborator traits: table metadata and row fetching.
//!
//! A mirrored model type describes its own table through [`Model`], and the
//! host supplies a [`RowFetcher`] that loads one fully-populated row by id.

use crate::types::{FetchResult, RowId, TableInfo};
use serde::Serialize;

/// A row type that can be mirrored from a table.
pub trait Model: Clone + Serialize + Send + Sync + 'static {
    /// Table name, watched columns and primary key.
    fn table_info() -> TableInfo;

    /// Primary key of this instance.
    fn row_id(&self) -> RowId;
}

/// Loads a single row of `T` from its table.
///
/// Called once per insert/update change from dispatcher workers, so it must
/// be safe to call concurrently for different tables.
pub trait RowFetcher<T>: Send + Sync {
    fn get_row(&self, table: &str, id: RowId) -> FetchResult<T>;
}

impl<T, F> RowFetcher<T> for F
where
    F: Fn(&str, RowId) -> FetchResult<T> + Send + Sync,
{
    fn get_row(&self, table: &str, id: RowId) -> FetchResult<T> {
        self(table, id)
    }
}
