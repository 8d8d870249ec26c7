//! Ordered unique tables and the constant pool of a compiled unit.
//!
//! Both keep their indices dense: entry `i` always lives at position `i`.
//! Keys are replaced in place so unrelated entries keep their index.

use std::collections::HashMap;
use std::hash::Hash;

use crate::operand::{ConstKey, Operand};

/// Insertion-ordered mapping from a key to a stable index.
#[derive(Debug, Clone)]
pub struct IndexedTable<K> {
    entries: Vec<K>,
    index: HashMap<K, usize>,
}

impl<K> Default for IndexedTable<K> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<K: Clone + Eq + Hash> IndexedTable<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    pub fn index_of(&self, key: &K) -> Option<usize> {
        self.index.get(key).copied()
    }

    pub fn get(&self, index: usize) -> Option<&K> {
        self.entries.get(index)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.iter()
    }

    /// Returns the index of `key`, appending it first when absent.
    pub fn get_index(&mut self, key: K) -> usize {
        if let Some(index) = self.index.get(&key) {
            return *index;
        }
        let index = self.entries.len();
        self.index.insert(key.clone(), index);
        self.entries.push(key);
        index
    }

    /// Moves `old`'s slot to `new` and returns the resulting index.
    ///
    /// When `new` is already present, `old` is dropped and `new`'s existing
    /// index is returned. When `old` is absent this is a plain insert.
    pub fn replace_key(&mut self, old: &K, new: K) -> usize {
        if old == &new {
            return self.get_index(new);
        }
        if self.contains(&new) {
            self.remove(old);
            return self.index_of(&new).unwrap_or_else(|| self.get_index(new));
        }
        match self.index.remove(old) {
            Some(index) => {
                self.index.insert(new.clone(), index);
                if let Some(slot) = self.entries.get_mut(index) {
                    *slot = new;
                }
                index
            }
            None => self.get_index(new),
        }
    }

    /// Removes `key`, shifting later entries down by one. Returns the index
    /// the key occupied.
    pub fn remove(&mut self, key: &K) -> Option<usize> {
        let index = self.index.remove(key)?;
        self.entries.remove(index);
        for (offset, entry) in self.entries.iter().enumerate().skip(index) {
            self.index.insert(entry.clone(), offset);
        }
        Some(index)
    }

    /// Whether removing `key` would leave the table without entries.
    pub fn would_become_empty(&self, key: &K) -> bool {
        self.contains(key) && self.len() == 1
    }
}

impl<K: Clone + Eq + Hash> FromIterator<K> for IndexedTable<K> {
    fn from_iter<I: IntoIterator<Item = K>>(iter: I) -> Self {
        let mut table = Self::new();
        for key in iter {
            table.get_index(key);
        }
        table
    }
}

/// Per-unit literal table keyed by [`ConstKey`].
#[derive(Debug, Clone, Default)]
pub struct ConstPool {
    keys: IndexedTable<ConstKey>,
    values: Vec<Operand>,
}

impl ConstPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn contains(&self, value: &Operand) -> bool {
        self.keys.contains(&value.key())
    }

    pub fn index_of(&self, value: &Operand) -> Option<usize> {
        self.keys.index_of(&value.key())
    }

    pub fn get(&self, index: usize) -> Option<&Operand> {
        self.values.get(index)
    }

    pub fn values(&self) -> impl Iterator<Item = &Operand> {
        self.values.iter()
    }

    pub fn get_index(&mut self, value: Operand) -> usize {
        let key = value.key();
        if let Some(index) = self.keys.index_of(&key) {
            return index;
        }
        self.values.push(value);
        self.keys.get_index(key)
    }

    /// Constant-pool counterpart of [`IndexedTable::replace_key`].
    pub fn replace(&mut self, old: &Operand, new: Operand) -> usize {
        let old_key = old.key();
        let new_key = new.key();
        if self.keys.contains(&new_key) || !self.keys.contains(&old_key) {
            if old_key != new_key {
                self.remove(old);
            }
            return self.get_index(new);
        }
        let index = self.keys.replace_key(&old_key, new_key);
        if let Some(slot) = self.values.get_mut(index) {
            *slot = new;
        }
        index
    }

    pub fn remove(&mut self, value: &Operand) -> Option<usize> {
        let index = self.keys.remove(&value.key())?;
        self.values.remove(index);
        Some(index)
    }

    pub fn would_become_empty(&self, value: &Operand) -> bool {
        self.keys.would_become_empty(&value.key())
    }
}
