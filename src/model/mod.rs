//! Layered belief model data types
//!
//! Five layers, each referencing the one below by string id only:
//!
//! ```text
//! Layer 5  IdentityCore   ──conviction_id──────────────┐
//! Layer 4  ContextFrame   ──conviction_id, trace_id──┐  │
//! Layer 3  ReasoningTrace ──conviction_id, signal_id─┤  │
//! Layer 2  Conviction     ──signal_id (evidence)─────┤◄─┘
//! Layer 1  Signal         (record store, read-only)  ◄┘
//! ```
//!
//! Derived layers live in id-indexed [`Arena`]s so ids can be rewritten on
//! merge and serialized without pointer fix-ups.

pub mod conviction;
pub mod frame;
pub mod identity;
pub mod signal;
pub mod trace;

pub use conviction::*;
pub use frame::*;
pub use identity::*;
pub use signal::*;
pub use trace::*;

use std::collections::HashMap;

/// Trait for records addressed by a string identifier.
pub trait HasId {
    fn id(&self) -> &str;
}

/// Insertion-ordered map from id to record.
///
/// Iteration order is the order records were first inserted, which keeps
/// persisted files and clustering input stable across runs.
#[derive(Debug, Clone)]
pub struct Arena<T: HasId> {
    items: Vec<T>,
    index: HashMap<String, usize>,
}

impl<T: HasId> Default for Arena<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T: HasId> Arena<T> {
    /// Create an empty arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an arena from records; a later record with a duplicate id
    /// replaces the earlier one in place.
    pub fn from_vec(items: Vec<T>) -> Self {
        let mut arena = Self::new();
        for item in items {
            arena.insert(item);
        }
        arena
    }

    /// Insert or replace a record. Returns the replaced record, if any.
    pub fn insert(&mut self, item: T) -> Option<T> {
        match self.index.get(item.id()) {
            Some(&pos) => Some(std::mem::replace(&mut self.items[pos], item)),
            None => {
                self.index.insert(item.id().to_string(), self.items.len());
                self.items.push(item);
                None
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.index.get(id).map(|&pos| &self.items[pos])
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut T> {
        match self.index.get(id) {
            Some(&pos) => Some(&mut self.items[pos]),
            None => None,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Remove a record, preserving the order of the rest.
    pub fn remove(&mut self, id: &str) -> Option<T> {
        let pos = self.index.remove(id)?;
        let item = self.items.remove(pos);
        for slot in self.index.values_mut() {
            if *slot > pos {
                *slot -= 1;
            }
        }
        Some(item)
    }

    /// Keep only records matching the predicate.
    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) {
        self.items.retain(|item| keep(item));
        self.reindex();
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    /// Mutable iteration. Ids must not be changed through this.
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.items.iter_mut()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|item| item.id())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    fn reindex(&mut self) {
        self.index = self
            .items
            .iter()
            .enumerate()
            .map(|(pos, item)| (item.id().to_string(), pos))
            .collect();
    }
}

impl<T: HasId> FromIterator<T> for Arena<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::from_vec(iter.into_iter().collect())
    }
}

impl<'a, T: HasId> IntoIterator for &'a Arena<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// Generate a short prefixed id such as `conv_1a2b3c4d`.
pub fn short_id(prefix: &str) -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &hex[..8])
}

/// Today's date in UTC
pub fn today() -> chrono::NaiveDate {
    chrono::Utc::now().date_naive()
}
