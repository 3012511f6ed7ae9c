use std::collections::BTreeSet;

use crate::firestore::local::journal::JournaledMap;
use crate::firestore::model::DocumentKey;

#[derive(Clone, Debug)]
enum ReferenceUndo {
    Add(DocumentKey, i32),
    Remove(DocumentKey, i32),
}

/// Two-way index of (document key, id) references.
///
/// Ids are target ids for local view references and limbo resolutions.
#[derive(Clone, Debug, Default)]
pub struct ReferenceSet {
    by_key: BTreeSet<(DocumentKey, i32)>,
    by_id: BTreeSet<(i32, DocumentKey)>,
    /// Inverse of every change since `begin`, newest last.
    undo: Option<Vec<ReferenceUndo>>,
}

impl ReferenceSet {
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub(crate) fn begin(&mut self) {
        if self.undo.is_none() {
            self.undo = Some(Vec::new());
        }
    }

    pub(crate) fn commit(&mut self) {
        self.undo = None;
    }

    pub(crate) fn rollback(&mut self) {
        let Some(undo) = self.undo.take() else {
            return;
        };
        for change in undo.into_iter().rev() {
            match change {
                ReferenceUndo::Add(key, id) => {
                    self.by_id.insert((id, key.clone()));
                    self.by_key.insert((key, id));
                }
                ReferenceUndo::Remove(key, id) => {
                    self.by_id.remove(&(id, key.clone()));
                    self.by_key.remove(&(key, id));
                }
            }
        }
    }

    pub fn add_reference(&mut self, key: DocumentKey, id: i32) {
        self.by_id.insert((id, key.clone()));
        if self.by_key.insert((key.clone(), id)) {
            if let Some(undo) = &mut self.undo {
                undo.push(ReferenceUndo::Remove(key, id));
            }
        }
    }

    pub fn add_references<'a, I>(&mut self, keys: I, id: i32)
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        for key in keys {
            self.add_reference(key.clone(), id);
        }
    }

    /// Returns true if the reference existed.
    pub fn remove_reference(&mut self, key: &DocumentKey, id: i32) -> bool {
        self.by_id.remove(&(id, key.clone()));
        let removed = self.by_key.remove(&(key.clone(), id));
        if removed {
            if let Some(undo) = &mut self.undo {
                undo.push(ReferenceUndo::Add(key.clone(), id));
            }
        }
        removed
    }

    pub fn remove_references<'a, I>(&mut self, keys: I, id: i32) -> Vec<DocumentKey>
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        keys.into_iter()
            .filter(|key| self.remove_reference(key, id))
            .cloned()
            .collect()
    }

    /// Removes every reference with `id`, returning the keys that were referenced.
    pub fn remove_references_for_id(&mut self, id: i32) -> Vec<DocumentKey> {
        let keys = self.references_for_id(id);
        for key in &keys {
            self.remove_reference(key, id);
        }
        keys.into_iter().collect()
    }

    pub fn remove_all_references(&mut self) -> Vec<DocumentKey> {
        let pairs: Vec<(DocumentKey, i32)> = self.by_key.iter().cloned().collect();
        for (key, id) in &pairs {
            self.remove_reference(key, *id);
        }
        let keys: BTreeSet<DocumentKey> = pairs.into_iter().map(|(key, _)| key).collect();
        keys.into_iter().collect()
    }

    pub fn references_for_id(&self, id: i32) -> BTreeSet<DocumentKey> {
        self.by_id
            .range((id, DocumentKey::min_key())..)
            .take_while(|(entry_id, _)| *entry_id == id)
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key
            .range((key.clone(), i32::MIN)..)
            .next()
            .is_some_and(|(entry_key, _)| entry_key == key)
    }
}

/// What keeps a document alive in the cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DocumentReferences {
    /// Targets whose remote result set contains the document.
    pub targets: u32,
    /// Views currently showing the document.
    pub local_views: u32,
    /// Pending mutation batches touching the document.
    pub mutations: u32,
}

impl DocumentReferences {
    pub fn total(&self) -> u32 {
        self.targets + self.local_views + self.mutations
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferenceKind {
    Target,
    LocalView,
    Mutation,
}

/// Reference-count table keyed by document key.
///
/// Counts change in the same transaction as the operation that adds or drops the
/// reference. Keys whose count falls to zero are remembered as orphans for the next
/// garbage collection pass.
#[derive(Clone, Debug, Default)]
pub struct ReferenceCounts {
    counts: JournaledMap<DocumentKey, DocumentReferences>,
    orphaned: JournaledMap<DocumentKey, ()>,
}

impl ReferenceCounts {
    pub(crate) fn begin(&mut self) {
        self.counts.begin();
        self.orphaned.begin();
    }

    pub(crate) fn commit(&mut self) {
        self.counts.commit();
        self.orphaned.commit();
    }

    pub(crate) fn rollback(&mut self) {
        self.counts.rollback();
        self.orphaned.rollback();
    }

    pub fn increment(&mut self, key: &DocumentKey, kind: ReferenceKind) {
        let entry = self.counts.get_or_insert_default(key.clone());
        match kind {
            ReferenceKind::Target => entry.targets += 1,
            ReferenceKind::LocalView => entry.local_views += 1,
            ReferenceKind::Mutation => entry.mutations += 1,
        }
        self.orphaned.remove(key);
    }

    pub fn decrement(&mut self, key: &DocumentKey, kind: ReferenceKind) {
        let Some(entry) = self.counts.get_mut(key) else {
            log::warn!("firestore::reference_counts: releasing unreferenced document {key}");
            self.orphaned.insert(key.clone(), ());
            return;
        };
        let slot = match kind {
            ReferenceKind::Target => &mut entry.targets,
            ReferenceKind::LocalView => &mut entry.local_views,
            ReferenceKind::Mutation => &mut entry.mutations,
        };
        *slot = slot.saturating_sub(1);
        if entry.total() == 0 {
            self.counts.remove(key);
            self.orphaned.insert(key.clone(), ());
        }
    }

    /// Marks a document as a collection candidate without touching its counts, e.g. a
    /// document written by the backend that no target references.
    pub fn mark_orphan_candidate(&mut self, key: &DocumentKey) {
        if !self.is_referenced(key) {
            self.orphaned.insert(key.clone(), ());
        }
    }

    pub fn get(&self, key: &DocumentKey) -> DocumentReferences {
        self.counts.get(key).copied().unwrap_or_default()
    }

    pub fn is_referenced(&self, key: &DocumentKey) -> bool {
        self.counts.contains_key(key)
    }

    /// Orphans that are still unreferenced; clears the orphan list.
    pub fn take_orphans(&mut self) -> BTreeSet<DocumentKey> {
        let orphans: Vec<DocumentKey> = self.orphaned.keys().cloned().collect();
        orphans
            .into_iter()
            .filter(|key| {
                self.orphaned.remove(key);
                !self.counts.contains_key(key)
            })
            .collect()
    }

    pub fn orphans(&self) -> impl Iterator<Item = &DocumentKey> {
        self.orphaned
            .keys()
            .filter(|key| !self.counts.contains_key(*key))
    }

    pub fn clear_orphan(&mut self, key: &DocumentKey) {
        self.orphaned.remove(key);
    }
}
