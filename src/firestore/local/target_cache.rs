use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::firestore::core::Query;
use crate::firestore::error::{data_loss, FirestoreResult};
use crate::firestore::local::journal::JournaledMap;
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::{DocumentKey, SnapshotVersion};

/// Targets the client has listened to, and which documents the backend said match them.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TargetCache {
    targets: JournaledMap<i32, TargetData>,
    highest_target_id: i32,
    highest_listen_sequence_number: i64,
    last_remote_snapshot_version: SnapshotVersion,
    documents_by_target: JournaledMap<i32, BTreeSet<DocumentKey>>,
    #[serde(skip)]
    target_id_by_canonical_id: JournaledMap<String, i32>,
}

/// Scalar counters of the target cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct TargetCounters {
    highest_target_id: i32,
    highest_listen_sequence_number: i64,
    last_remote_snapshot_version: SnapshotVersion,
}

impl TargetCache {
    pub(crate) fn begin(&mut self) -> TargetCounters {
        self.targets.begin();
        self.documents_by_target.begin();
        self.target_id_by_canonical_id.begin();
        self.counters()
    }

    pub(crate) fn counters(&self) -> TargetCounters {
        TargetCounters {
            highest_target_id: self.highest_target_id,
            highest_listen_sequence_number: self.highest_listen_sequence_number,
            last_remote_snapshot_version: self.last_remote_snapshot_version,
        }
    }

    pub(crate) fn has_changes_since(&self, savepoint: &TargetCounters) -> bool {
        self.targets.is_dirty() || self.documents_by_target.is_dirty() || self.counters() != *savepoint
    }

    pub(crate) fn pending_target_changes(&self) -> Vec<(i32, Option<TargetData>)> {
        self.targets.pending_changes()
    }

    pub(crate) fn pending_document_changes(&self) -> Vec<(i32, Option<BTreeSet<DocumentKey>>)> {
        self.documents_by_target.pending_changes()
    }

    /// Replays a stored change. Call `rebuild_index` once replay is done.
    pub(crate) fn restore(
        &mut self,
        targets: Vec<(i32, Option<TargetData>)>,
        documents: Vec<(i32, Option<BTreeSet<DocumentKey>>)>,
        counters: TargetCounters,
    ) {
        for (target_id, target) in targets {
            match target {
                Some(target) => self.targets.insert(target_id, target),
                None => self.targets.remove(&target_id),
            };
        }
        for (target_id, keys) in documents {
            match keys {
                Some(keys) => self.documents_by_target.insert(target_id, keys),
                None => self.documents_by_target.remove(&target_id),
            };
        }
        self.set_counters(counters);
    }

    pub(crate) fn commit(&mut self) {
        self.targets.commit();
        self.documents_by_target.commit();
        self.target_id_by_canonical_id.commit();
    }

    pub(crate) fn rollback(&mut self, savepoint: TargetCounters) {
        self.targets.rollback();
        self.documents_by_target.rollback();
        self.target_id_by_canonical_id.rollback();
        self.set_counters(savepoint);
    }

    fn set_counters(&mut self, counters: TargetCounters) {
        self.highest_target_id = counters.highest_target_id;
        self.highest_listen_sequence_number = counters.highest_listen_sequence_number;
        self.last_remote_snapshot_version = counters.last_remote_snapshot_version;
    }

    pub fn highest_target_id(&self) -> i32 {
        self.highest_target_id
    }

    pub fn highest_listen_sequence_number(&self) -> i64 {
        self.highest_listen_sequence_number
    }

    /// Hands out the next listen sequence number.
    pub fn next_sequence_number(&mut self) -> i64 {
        self.highest_listen_sequence_number += 1;
        self.highest_listen_sequence_number
    }

    pub fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.last_remote_snapshot_version
    }

    pub fn set_last_remote_snapshot_version(&mut self, version: SnapshotVersion) {
        self.last_remote_snapshot_version = version;
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    pub fn add_target_data(&mut self, target_data: TargetData) {
        self.update_target_data(target_data);
    }

    pub fn update_target_data(&mut self, target_data: TargetData) {
        self.highest_target_id = self.highest_target_id.max(target_data.target_id);
        self.highest_listen_sequence_number = self
            .highest_listen_sequence_number
            .max(target_data.sequence_number);
        self.target_id_by_canonical_id
            .insert(target_data.query.canonical_id(), target_data.target_id);
        self.targets.insert(target_data.target_id, target_data);
    }

    /// Drops the target and its document associations, returning the keys it held.
    pub fn remove_target_data(&mut self, target_id: i32) -> BTreeSet<DocumentKey> {
        if let Some(data) = self.targets.remove(&target_id) {
            let canonical_id = data.query.canonical_id();
            if self.target_id_by_canonical_id.get(&canonical_id) == Some(&target_id) {
                self.target_id_by_canonical_id.remove(&canonical_id);
            }
        }
        self.documents_by_target
            .remove(&target_id)
            .unwrap_or_default()
    }

    pub fn get_target_data(&self, query: &Query) -> Option<&TargetData> {
        self.target_id_by_canonical_id
            .get(&query.canonical_id())
            .and_then(|id| self.targets.get(id))
    }

    pub fn get_target_data_by_id(&self, target_id: i32) -> Option<&TargetData> {
        self.targets.get(&target_id)
    }

    pub fn targets(&self) -> impl Iterator<Item = &TargetData> {
        self.targets.values()
    }

    /// Adds the associations, returning the keys that were not associated before.
    pub fn add_matching_keys<'a, I>(&mut self, keys: I, target_id: i32) -> Vec<DocumentKey>
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        let entry = self.documents_by_target.get_or_insert_default(target_id);
        let added: Vec<DocumentKey> = keys
            .into_iter()
            .filter(|key| entry.insert((*key).clone()))
            .cloned()
            .collect();
        if entry.is_empty() {
            self.documents_by_target.remove(&target_id);
        }
        added
    }

    /// Every (target id, matching keys) association.
    pub fn all_matching_keys(&self) -> impl Iterator<Item = (i32, &BTreeSet<DocumentKey>)> {
        self.documents_by_target.iter().map(|(id, keys)| (*id, keys))
    }

    /// Removes the associations, returning the keys that were actually associated.
    pub fn remove_matching_keys<'a, I>(&mut self, keys: I, target_id: i32) -> Vec<DocumentKey>
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        let Some(entry) = self.documents_by_target.get_mut(&target_id) else {
            return Vec::new();
        };
        let removed = keys
            .into_iter()
            .filter(|key| entry.remove(*key))
            .cloned()
            .collect();
        if entry.is_empty() {
            self.documents_by_target.remove(&target_id);
        }
        removed
    }

    pub fn get_matching_keys_for_target_id(&self, target_id: i32) -> BTreeSet<DocumentKey> {
        self.documents_by_target
            .get(&target_id)
            .cloned()
            .unwrap_or_default()
    }

    /// True if any target references the document.
    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.documents_by_target
            .values()
            .any(|keys| keys.contains(key))
    }

    pub fn rebuild_index(&mut self) -> FirestoreResult<()> {
        self.target_id_by_canonical_id.clear();
        for (id, data) in self.targets.iter() {
            if *id != data.target_id || *id > self.highest_target_id {
                return Err(data_loss(format!(
                    "Target cache is corrupt: target stored under id {id} claims id {}",
                    data.target_id
                )));
            }
            self.target_id_by_canonical_id
                .insert(data.query.canonical_id(), *id);
        }
        Ok(())
    }
}
