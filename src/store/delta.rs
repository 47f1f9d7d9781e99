use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use indexmap::{IndexMap, IndexSet};

/// Contract violations on a [`DeltaMap`]. Both indicate a caller bug.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaError<K> {
    KeyConflict(K),
    UnknownKey(K),
}

/// Map over an immutable base snapshot plus the changes made since it was
/// loaded: fresh insertions and tombstones for deleted base keys.
///
/// Iteration follows insertion order: base entries first, in the order they
/// were loaded, then fresh insertions.
///
/// A live key can never be reassigned without deleting it first.
#[derive(Debug, Clone)]
pub struct DeltaMap<K, V> {
    base: IndexMap<K, V>,
    new: IndexMap<K, V>,
    deleted: IndexSet<K>,
}

impl<K, V> DeltaMap<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: PartialEq + Clone,
{
    pub fn new(base: IndexMap<K, V>) -> Self {
        Self {
            base,
            new: IndexMap::new(),
            deleted: IndexSet::new(),
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        if self.deleted.contains(key) {
            return None;
        }
        self.new.get(key).or_else(|| self.base.get(key))
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn set(&mut self, key: K, value: V) -> Result<(), DeltaError<K>> {
        if self.contains_key(&key) {
            return Err(DeltaError::KeyConflict(key));
        }
        self.deleted.shift_remove(&key);
        // Re-adding the base value after a delete just cancels the tombstone.
        if self.base.get(&key) != Some(&value) {
            self.new.insert(key, value);
        }
        Ok(())
    }

    pub fn delete(&mut self, key: &K) -> Result<(), DeltaError<K>> {
        if !self.contains_key(key) {
            return Err(DeltaError::UnknownKey(key.clone()));
        }
        if self.base.contains_key(key) {
            self.deleted.insert(key.clone());
        }
        self.new.shift_remove(key);
        Ok(())
    }

    /// Delete every live key mapped to `value`; returns how many went.
    pub fn delete_value(&mut self, value: &V) -> usize {
        let doomed: Vec<K> = self
            .iter()
            .filter(|(_, v)| *v == value)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            // Every key came from the live view, so this cannot fail.
            let _ = self.delete(key);
        }
        doomed.len()
    }

    /// Live entries: base entries first, then insertions in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        let base = self
            .base
            .iter()
            .filter(|(k, _)| !self.deleted.contains(*k) && !self.new.contains_key(*k));
        base.chain(self.new.iter())
    }

    pub fn snapshot(&self) -> HashMap<K, V> {
        self.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn changed(&self) -> bool {
        !(self.new.is_empty() && self.deleted.is_empty())
    }

    /// Insertions made since the snapshot was loaded.
    pub fn inserted(&self) -> &IndexMap<K, V> {
        &self.new
    }

    /// Base keys deleted since the snapshot was loaded.
    pub fn tombstones(&self) -> &IndexSet<K> {
        &self.deleted
    }
}
