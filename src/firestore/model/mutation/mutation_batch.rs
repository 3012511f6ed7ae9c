use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::mutation::{Mutation, MutationResult};
use crate::firestore::model::{Document, DocumentKey, DocumentMap, FieldMask, SnapshotVersion, Timestamp};

/// Sentinel for "no batch", used when asking for the first batch in the queue.
pub const BATCH_ID_UNKNOWN: i32 = -1;

/// Mutations written together; committed or rejected atomically.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationBatch {
    pub batch_id: i32,
    pub local_write_time: Timestamp,
    /// Captured base values (see [`Mutation::extract_transform_base_value`]). Applied to
    /// the local view before `mutations`, never sent to the backend.
    pub base_mutations: Vec<Mutation>,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: i32,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations
            .iter()
            .map(|mutation| mutation.key().clone())
            .collect()
    }

    /// Applies every mutation for `doc`'s key using the acknowledged results.
    pub fn apply_to_remote_document(
        &self,
        doc: &mut Document,
        batch_result: &MutationBatchResult,
    ) -> FirestoreResult<()> {
        for (mutation, result) in self.mutations.iter().zip(batch_result.mutation_results.iter()) {
            if mutation.key() == doc.key() {
                mutation.apply_to_remote_document(doc, result)?;
            }
        }
        Ok(())
    }

    pub fn apply_to_local_view(
        &self,
        doc: &mut Document,
        mut mask: Option<FieldMask>,
    ) -> Option<FieldMask> {
        for mutation in self.base_mutations.iter().chain(self.mutations.iter()) {
            if mutation.key() == doc.key() {
                mask = mutation.apply_to_local_view(doc, mask, self.local_write_time);
            }
        }
        mask
    }

    /// Applies the batch to every document it touches in `docs`.
    pub fn apply_to_local_document_set(&self, docs: &mut DocumentMap) {
        for key in self.keys() {
            if let Some(doc) = docs.get_mut(&key) {
                self.apply_to_local_view(doc, Some(FieldMask::default()));
            }
        }
    }
}

/// A batch together with the backend's acknowledgement.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Vec<u8>,
    /// Version each document reached with this write.
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn create(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<Self> {
        if batch.mutations.len() != mutation_results.len() {
            return Err(internal_error(format!(
                "Mutations sent {} must equal results received {}",
                batch.mutations.len(),
                mutation_results.len()
            )));
        }
        let doc_versions = batch
            .mutations
            .iter()
            .zip(mutation_results.iter())
            .map(|(mutation, result)| (mutation.key().clone(), result.version))
            .collect();
        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::mutation::Precondition;
    use crate::firestore::model::FieldPath;
    use crate::firestore::value::{FirestoreValue, ObjectValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn set(path: &str, field: &str, value: i64) -> Mutation {
        let mut data = ObjectValue::empty();
        data.set(&FieldPath::from_dot_separated(field).unwrap(), FirestoreValue::from_integer(value));
        Mutation::Set {
            key: key(path),
            value: data,
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        }
    }

    #[test]
    fn result_count_must_match() {
        let batch = MutationBatch::new(1, Timestamp::now(), Vec::new(), vec![set("c/a", "x", 1)]);
        let err = MutationBatchResult::create(batch, SnapshotVersion::from_micros(1), Vec::new(), Vec::new())
            .unwrap_err();
        assert_eq!(err.code_str(), "firestore/internal");
    }

    #[test]
    fn records_document_versions() {
        let batch = MutationBatch::new(
            1,
            Timestamp::now(),
            Vec::new(),
            vec![set("c/a", "x", 1), set("c/b", "x", 2)],
        );
        let results = vec![
            MutationResult::new(SnapshotVersion::from_micros(5), Vec::new()),
            MutationResult::new(SnapshotVersion::from_micros(6), Vec::new()),
        ];
        let result =
            MutationBatchResult::create(batch, SnapshotVersion::from_micros(6), results, Vec::new())
                .unwrap();
        assert_eq!(result.doc_versions.get(&key("c/b")), Some(&SnapshotVersion::from_micros(6)));
    }

    #[test]
    fn applies_only_matching_mutations() {
        let batch = MutationBatch::new(
            1,
            Timestamp::now(),
            Vec::new(),
            vec![set("c/a", "x", 1), set("c/b", "x", 2)],
        );
        let mut doc = Document::new_invalid(key("c/b"));
        batch.apply_to_local_view(&mut doc, None);
        assert_eq!(
            doc.field(&FieldPath::from_dot_separated("x").unwrap()),
            Some(&FirestoreValue::from_integer(2))
        );
    }
}
