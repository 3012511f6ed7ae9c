use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::core::Query;
use crate::firestore::error::{data_loss, internal_error, FirestoreResult};
use crate::firestore::model::mutation::{Mutation, MutationBatch, BATCH_ID_UNKNOWN};
use crate::firestore::model::{DocumentKey, Timestamp};
use crate::firestore::value::base64_bytes;

/// Ordered log of locally written batches that the backend has not acknowledged yet.
///
/// Batch ids increase strictly and are never reused; removing a batch leaves a gap.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MutationQueue {
    next_batch_id: i32,
    #[serde(with = "base64_bytes")]
    last_stream_token: Vec<u8>,
    batches: BTreeMap<i32, MutationBatch>,
    /// Secondary index of batch ids by the keys they touch. Rebuilt on load.
    #[serde(skip)]
    batches_by_key: BTreeMap<DocumentKey, BTreeSet<i32>>,
    /// Bumped by every change, so a transaction can tell whether the queue moved.
    #[serde(skip)]
    revision: u64,
}

impl Default for MutationQueue {
    fn default() -> Self {
        Self {
            next_batch_id: 1,
            last_stream_token: Vec::new(),
            batches: BTreeMap::new(),
            batches_by_key: BTreeMap::new(),
            revision: 0,
        }
    }
}

impl MutationQueue {
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub(crate) fn revision(&self) -> u64 {
        self.revision
    }

    pub fn add_mutation_batch(
        &mut self,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> MutationBatch {
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;
        self.revision += 1;
        let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);
        for key in batch.keys() {
            self.batches_by_key.entry(key).or_default().insert(batch_id);
        }
        self.batches.insert(batch_id, batch.clone());
        batch
    }

    pub fn lookup_mutation_batch(&self, batch_id: i32) -> Option<&MutationBatch> {
        self.batches.get(&batch_id)
    }

    /// First batch with an id greater than `batch_id`; pass [`BATCH_ID_UNKNOWN`] for the head.
    pub fn get_next_mutation_batch_after_batch_id(&self, batch_id: i32) -> Option<&MutationBatch> {
        self.batches
            .range(batch_id.saturating_add(1)..)
            .next()
            .map(|(_, batch)| batch)
    }

    pub fn get_highest_unacknowledged_batch_id(&self) -> i32 {
        self.batches
            .keys()
            .next_back()
            .copied()
            .unwrap_or(BATCH_ID_UNKNOWN)
    }

    pub fn get_all_mutation_batches(&self) -> Vec<&MutationBatch> {
        self.batches.values().collect()
    }

    /// Batches touching `key`, in ascending batch id order.
    pub fn get_all_mutation_batches_affecting_key(&self, key: &DocumentKey) -> Vec<&MutationBatch> {
        self.batches_for_ids(self.batches_by_key.get(key).into_iter().flatten())
    }

    pub fn get_all_mutation_batches_affecting_keys<'a, I>(&self, keys: I) -> Vec<&MutationBatch>
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        let ids: BTreeSet<i32> = keys
            .into_iter()
            .filter_map(|key| self.batches_by_key.get(key))
            .flatten()
            .copied()
            .collect();
        self.batches_for_ids(ids.iter())
    }

    pub fn get_all_mutation_batches_affecting_query(&self, query: &Query) -> Vec<&MutationBatch> {
        let prefix = query.path();
        let candidates: Vec<(&DocumentKey, &BTreeSet<i32>)> = match DocumentKey::first_key_under(prefix) {
            Some(start) => self
                .batches_by_key
                .range(start..)
                .take_while(|(key, _)| prefix.is_prefix_of(key.path()))
                .collect(),
            None => self.batches_by_key.iter().collect(),
        };
        let ids: BTreeSet<i32> = candidates
            .into_iter()
            .filter(|(key, _)| query.covers_key(key))
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect();
        self.batches_for_ids(ids.iter())
    }

    /// Keys with at least one pending mutation.
    pub fn mutated_keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.batches_by_key.keys()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.batches_by_key.contains_key(key)
    }

    /// Records the stream token that came with the acknowledgement of the head batch.
    pub fn acknowledge_batch(&mut self, batch: &MutationBatch, stream_token: Vec<u8>) -> FirestoreResult<()> {
        self.check_is_head(batch.batch_id, "acknowledge")?;
        self.last_stream_token = stream_token;
        self.revision += 1;
        Ok(())
    }

    /// Removes the head batch. Removing any other batch means the queue is out of order.
    pub fn remove_mutation_batch(&mut self, batch_id: i32) -> FirestoreResult<MutationBatch> {
        self.check_is_head(batch_id, "remove")?;
        let batch = self
            .batches
            .remove(&batch_id)
            .ok_or_else(|| internal_error(format!("Mutation batch {batch_id} not found")))?;
        self.revision += 1;
        for key in batch.keys() {
            if let Some(ids) = self.batches_by_key.get_mut(&key) {
                ids.remove(&batch_id);
                if ids.is_empty() {
                    self.batches_by_key.remove(&key);
                }
            }
        }
        Ok(batch)
    }

    pub fn last_stream_token(&self) -> &[u8] {
        &self.last_stream_token
    }

    pub fn set_last_stream_token(&mut self, token: Vec<u8>) {
        self.last_stream_token = token;
        self.revision += 1;
    }

    /// Rebuilds the key index after loading and verifies the batches are well formed.
    pub fn rebuild_index(&mut self) -> FirestoreResult<()> {
        self.batches_by_key.clear();
        for (id, batch) in &self.batches {
            if *id != batch.batch_id || *id >= self.next_batch_id {
                return Err(data_loss(format!(
                    "Mutation queue is corrupt: batch stored under id {id} claims id {} (next id {})",
                    batch.batch_id, self.next_batch_id
                )));
            }
            for key in batch.keys() {
                self.batches_by_key.entry(key).or_default().insert(*id);
            }
        }
        Ok(())
    }

    /// An empty queue must not leave anything behind in the key index.
    pub fn perform_consistency_check(&self) -> FirestoreResult<()> {
        if self.batches.is_empty() && !self.batches_by_key.is_empty() {
            return Err(internal_error(
                "Document leak: mutation queue is empty but keys are still indexed",
            ));
        }
        Ok(())
    }

    fn check_is_head(&self, batch_id: i32, action: &str) -> FirestoreResult<()> {
        match self.batches.keys().next() {
            Some(head) if *head == batch_id => Ok(()),
            Some(head) => Err(internal_error(format!(
                "Can only {action} the first batch in the mutation queue (head {head}, got {batch_id})"
            ))),
            None => Err(internal_error(format!(
                "Cannot {action} batch {batch_id}: the mutation queue is empty"
            ))),
        }
    }

    fn batches_for_ids<'a, I>(&self, ids: I) -> Vec<&MutationBatch>
    where
        I: IntoIterator<Item = &'a i32>,
    {
        ids.into_iter()
            .filter_map(|id| self.batches.get(id))
            .collect()
    }
}
