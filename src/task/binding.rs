//! Named read/write slots backing a task's inputs and outputs.
//!
//! # Invariants
//! - The key set of a [`SlotStore`] is fixed when the store is created
//! - A [`Binding`] can only be obtained for a key the store holds, so writes
//!   never create new slots

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Key-value container owned by a task.
///
/// Cloning yields another handle onto the same slots, which is how bindings
/// observe live values while a run is in progress.
#[derive(Debug, Clone, Default)]
pub struct SlotStore {
    slots: Arc<RwLock<HashMap<String, String>>>,
}

impl SlotStore {
    /// Create a store with every key initialised to the empty string.
    pub(crate) fn with_keys<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let slots = keys
            .into_iter()
            .map(|key| (key.into(), String::new()))
            .collect();
        Self {
            slots: Arc::new(RwLock::new(slots)),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read(|slots| slots.contains_key(key))
    }

    pub fn len(&self) -> usize {
        self.read(|slots| slots.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current value of `key`, or the empty string if it is unset or unknown.
    pub fn get(&self, key: &str) -> String {
        self.read(|slots| slots.get(key).cloned().unwrap_or_default())
    }

    /// Overwrite an existing slot. Returns `false` (and writes nothing) if
    /// `key` was not declared.
    pub(crate) fn set(&self, key: &str, value: impl Into<String>) -> bool {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        match slots.get_mut(key) {
            Some(slot) => {
                *slot = value.into();
                true
            }
            None => false,
        }
    }

    /// Declared keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys = self.read(|slots| slots.keys().cloned().collect::<Vec<_>>());
        keys.sort();
        keys
    }

    /// Copy of every slot at this instant.
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.read(|slots| slots.clone())
    }

    /// Accessor for `key`, if it was declared.
    pub fn binding(&self, key: &str) -> Option<Binding> {
        if self.contains(key) {
            Some(Binding {
                store: self.clone(),
                key: key.to_string(),
            })
        } else {
            None
        }
    }

    /// One binding per declared key, sorted by key.
    pub fn bindings(&self) -> Vec<Binding> {
        self.keys()
            .into_iter()
            .map(|key| Binding {
                store: self.clone(),
                key,
            })
            .collect()
    }

    fn read<T>(&self, f: impl FnOnce(&HashMap<String, String>) -> T) -> T {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        f(&slots)
    }
}

/// A view onto one slot of a [`SlotStore`].
///
/// Bindings own no data; every binding on the same store and key sees the
/// same value.
#[derive(Debug, Clone)]
pub struct Binding {
    store: SlotStore,
    key: String,
}

impl Binding {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> String {
        self.store.get(&self.key)
    }

    pub fn set(&self, value: impl Into<String>) {
        // Bindings are only handed out for declared keys.
        let written = self.store.set(&self.key, value);
        debug_assert!(written, "binding for undeclared key {}", self.key);
    }

    pub fn is_empty(&self) -> bool {
        self.value().is_empty()
    }
}
