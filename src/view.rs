//! Live view: the mirrored, ordered collection of model instances.

use crate::model::Model;
use crate::types::RowId;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;

/// Ordered collection of rows keyed by primary key, most recent first.
///
/// Not synchronised. Share it through [`SharedView`].
#[derive(Clone, Debug)]
pub struct LiveView<T> {
    items: Vec<T>,
}

impl<T: Model> LiveView<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn from_rows(rows: Vec<T>) -> Self {
        Self { items: rows }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    /// Position of the row with primary key `id`.
    pub fn find_by_key(&self, id: RowId) -> Option<usize> {
        self.items.iter().position(|item| item.row_id() == id)
    }

    pub fn get(&self, id: RowId) -> Option<&T> {
        self.find_by_key(id).map(|index| &self.items[index])
    }

    /// Insert at `index`, clamped to the end of the view.
    pub fn insert_at(&mut self, index: usize, item: T) {
        let index = index.min(self.items.len());
        self.items.insert(index, item);
    }

    pub fn remove_at(&mut self, index: usize) -> Option<T> {
        if index < self.items.len() {
            Some(self.items.remove(index))
        } else {
            None
        }
    }

    pub fn insert_head(&mut self, item: T) {
        self.insert_at(0, item);
    }

    /// Replace the row with the same key in place. Returns the old row, or
    /// `None` (leaving the view untouched) if no row has that key.
    pub fn replace_by_key(&mut self, item: T) -> Option<T> {
        let index = self.find_by_key(item.row_id())?;
        Some(std::mem::replace(&mut self.items[index], item))
    }

    pub fn remove_by_key(&mut self, id: RowId) -> Option<T> {
        let index = self.find_by_key(id)?;
        self.remove_at(index)
    }

    /// Replace the whole content, e.g. with an initial full load.
    pub fn reset(&mut self, rows: Vec<T>) {
        self.items = rows;
    }
}

impl<T: Model> Default for LiveView<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Live view shared between the host application and the dispatcher.
pub struct SharedView<T> {
    inner: Arc<RwLock<LiveView<T>>>,
}

impl<T> Clone for SharedView<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Model> SharedView<T> {
    pub fn new() -> Self {
        Self::from_view(LiveView::new())
    }

    pub fn from_view(view: LiveView<T>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(view)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, LiveView<T>> {
        self.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, LiveView<T>> {
        self.inner.write()
    }

    /// Copy of the current rows.
    pub fn snapshot(&self) -> Vec<T> {
        self.inner.read().items().to_vec()
    }

    pub fn reset(&self, rows: Vec<T>) {
        self.inner.write().reset(rows);
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

impl<T: Model> Default for SharedView<T> {
    fn default() -> Self {
        Self::new()
    }
}
