use std::collections::btree_map::{self, BTreeMap};
use std::ops::RangeBounds;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A sorted map that can undo the changes made since [`begin`](Self::begin).
///
/// Only the first change to a key inside a transaction saves its original value, so
/// undoing costs as much as the transaction touched, not as much as the map holds.
#[derive(Clone, Debug)]
pub struct JournaledMap<K, V> {
    entries: BTreeMap<K, V>,
    /// Original value of every key changed in the open transaction.
    undo: Option<BTreeMap<K, Option<V>>>,
}

impl<K, V> Default for JournaledMap<K, V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            undo: None,
        }
    }
}

impl<K: Ord + Clone, V: Clone> JournaledMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts recording. A transaction that is still open is kept as it is.
    pub fn begin(&mut self) {
        if self.undo.is_none() {
            self.undo = Some(BTreeMap::new());
        }
    }

    /// True when a key changed since `begin`.
    pub fn is_dirty(&self) -> bool {
        self.undo.as_ref().is_some_and(|undo| !undo.is_empty())
    }

    /// Keeps the changes and stops recording.
    pub fn commit(&mut self) {
        self.undo = None;
    }

    /// Restores every changed key and returns those keys.
    pub fn rollback(&mut self) -> Vec<K> {
        let Some(undo) = self.undo.take() else {
            return Vec::new();
        };
        let mut touched = Vec::with_capacity(undo.len());
        for (key, original) in undo {
            match original {
                Some(value) => {
                    self.entries.insert(key.clone(), value);
                }
                None => {
                    self.entries.remove(&key);
                }
            }
            touched.push(key);
        }
        touched
    }

    /// Current value of every key changed since `begin`; `None` marks a removal.
    pub fn pending_changes(&self) -> Vec<(K, Option<V>)> {
        self.undo
            .iter()
            .flat_map(|undo| undo.keys())
            .map(|key| (key.clone(), self.entries.get(key).cloned()))
            .collect()
    }

    fn record(&mut self, key: &K) {
        if let Some(undo) = &mut self.undo {
            if !undo.contains_key(key) {
                undo.insert(key.clone(), self.entries.get(key).cloned());
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.record(&key);
        self.entries.insert(key, value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        if !self.entries.contains_key(key) {
            return None;
        }
        self.record(key);
        self.entries.remove(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        if self.entries.contains_key(key) {
            self.record(key);
        }
        self.entries.get_mut(key)
    }

    pub fn get_or_insert_default(&mut self, key: K) -> &mut V
    where
        V: Default,
    {
        self.record(&key);
        self.entries.entry(key).or_default()
    }

    pub fn clear(&mut self) {
        let keys: Vec<K> = self.entries.keys().cloned().collect();
        for key in &keys {
            self.record(key);
        }
        self.entries.clear();
    }

    pub fn iter(&self) -> btree_map::Iter<'_, K, V> {
        self.entries.iter()
    }

    pub fn range<R: RangeBounds<K>>(&self, range: R) -> btree_map::Range<'_, K, V> {
        self.entries.range(range)
    }

    pub fn keys(&self) -> btree_map::Keys<'_, K, V> {
        self.entries.keys()
    }

    pub fn values(&self) -> btree_map::Values<'_, K, V> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Ord, V> FromIterator<(K, V)> for JournaledMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
            undo: None,
        }
    }
}

impl<K, V> Serialize for JournaledMap<K, V>
where
    BTreeMap<K, V>: Serialize,
{
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.entries.serialize(serializer)
    }
}

impl<'de, K, V> Deserialize<'de> for JournaledMap<K, V>
where
    BTreeMap<K, V>: Deserialize<'de>,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self {
            entries: BTreeMap::deserialize(deserializer)?,
            undo: None,
        })
    }
}
