//! Typed per-connection property bag.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

/// String-keyed values of arbitrary `Send` types.
///
/// Handlers use it to keep protocol state (parsers, session ids, counters)
/// on the connection between requests.
#[derive(Default)]
pub struct Properties {
    values: HashMap<String, Box<dyn Any + Send>>,
}

impl Properties {
    /// Creates an empty bag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value under `name` if it exists and has type `T`.
    #[must_use]
    pub fn get<T: Any>(&self, name: &str) -> Option<&T> {
        self.values.get(name).and_then(|v| v.downcast_ref::<T>())
    }

    /// Mutable variant of [`get`](Self::get).
    pub fn get_mut<T: Any>(&mut self, name: &str) -> Option<&mut T> {
        self.values.get_mut(name).and_then(|v| v.downcast_mut::<T>())
    }

    /// Stores `value` under `name`. Returns `true` if a value was replaced.
    pub fn set<T: Any + Send>(&mut self, name: impl Into<String>, value: T) -> bool {
        self.values.insert(name.into(), Box::new(value)).is_some()
    }

    /// Removes the value under `name`. Returns `true` if one existed.
    pub fn unset(&mut self, name: &str) -> bool {
        self.values.remove(name).is_some()
    }

    /// Returns `true` if any value is stored under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Number of stored values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if the bag is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Drops every value.
    pub fn clear(&mut self) {
        self.values.clear();
    }
}

impl fmt::Debug for Properties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.values.keys().collect();
        names.sort();
        f.debug_set().entries(names).finish()
    }
}
