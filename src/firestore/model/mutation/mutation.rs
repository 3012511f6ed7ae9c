use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::mutation::{FieldTransform, Precondition};
use crate::firestore::model::{
    Document, DocumentKey, FieldMask, FieldPath, SnapshotVersion, Timestamp,
};
use crate::firestore::value::{FirestoreValue, ObjectValue};

/// Outcome the backend reported for one mutation of a committed batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationResult {
    /// Version of the document after the write. For a skipped (precondition failed)
    /// mutation the backend reports the commit version.
    pub version: SnapshotVersion,
    /// One entry per field transform, in declaration order.
    pub transform_results: Vec<FirestoreValue>,
}

impl MutationResult {
    pub fn new(version: SnapshotVersion, transform_results: Vec<FirestoreValue>) -> Self {
        Self {
            version,
            transform_results,
        }
    }
}

/// A single write to a single document.
///
/// Mutations are immutable once queued. Both application paths are pure functions of the
/// prior document plus the mutation (and, for acknowledged writes, the backend result).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    /// Replaces the whole document.
    Set {
        key: DocumentKey,
        value: ObjectValue,
        precondition: Precondition,
        field_transforms: Vec<FieldTransform>,
    },
    /// Writes the fields named in `mask`; masked fields absent from `value` are deleted.
    Patch {
        key: DocumentKey,
        value: ObjectValue,
        mask: FieldMask,
        precondition: Precondition,
        field_transforms: Vec<FieldTransform>,
    },
    Delete {
        key: DocumentKey,
        precondition: Precondition,
    },
    /// Asserts the precondition without changing the document.
    Verify {
        key: DocumentKey,
        precondition: Precondition,
    },
    /// Applies field transforms to an existing document.
    Transform {
        key: DocumentKey,
        field_transforms: Vec<FieldTransform>,
    },
}

impl Mutation {
    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set { key, .. }
            | Mutation::Patch { key, .. }
            | Mutation::Delete { key, .. }
            | Mutation::Verify { key, .. }
            | Mutation::Transform { key, .. } => key,
        }
    }

    pub fn precondition(&self) -> Precondition {
        match self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Verify { precondition, .. } => precondition.clone(),
            Mutation::Transform { .. } => Precondition::Exists(true),
        }
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        match self {
            Mutation::Set {
                field_transforms, ..
            }
            | Mutation::Patch {
                field_transforms, ..
            }
            | Mutation::Transform {
                field_transforms, ..
            } => field_transforms,
            Mutation::Delete { .. } | Mutation::Verify { .. } => &[],
        }
    }

    /// Folds the acknowledged write into the remote document baseline.
    pub fn apply_to_remote_document(
        &self,
        doc: &mut Document,
        result: &MutationResult,
    ) -> FirestoreResult<()> {
        self.verify_key_matches(doc)?;
        match self {
            Mutation::Set { value, .. } => {
                let mut data = value.clone();
                data.set_all(self.server_transform_results(doc, &result.transform_results)?);
                doc.convert_to_found(result.version, data)
                    .set_has_committed_mutations();
            }
            Mutation::Patch { .. } | Mutation::Transform { .. } => {
                if !self.precondition().is_valid_for(doc) {
                    // The backend skipped this write; we no longer know the contents.
                    doc.convert_to_unknown(result.version);
                    return Ok(());
                }
                let transforms = self.server_transform_results(doc, &result.transform_results)?;
                let mut data = doc.data().clone();
                data.set_all(self.patch_values());
                data.set_all(transforms);
                doc.convert_to_found(result.version, data)
                    .set_has_committed_mutations();
            }
            Mutation::Delete { .. } => {
                doc.convert_to_no_document(result.version)
                    .set_has_committed_mutations();
            }
            Mutation::Verify { .. } => {}
        }
        Ok(())
    }

    /// Applies the write optimistically to the local view of `doc`.
    ///
    /// Returns the mask of fields changed so far (`None` when the whole document was
    /// replaced). A mutation whose precondition fails leaves the document untouched.
    pub fn apply_to_local_view(
        &self,
        doc: &mut Document,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        if doc.key() != self.key() || !self.precondition().is_valid_for(doc) {
            return previous_mask;
        }
        match self {
            Mutation::Set { value, .. } => {
                let mut data = value.clone();
                data.set_all(self.local_transform_results(doc, local_write_time));
                let version = doc.version();
                doc.convert_to_found(version, data).set_has_local_mutations();
                None
            }
            Mutation::Patch { .. } | Mutation::Transform { .. } => {
                let transforms = self.local_transform_results(doc, local_write_time);
                let mut data = doc.data().clone();
                data.set_all(self.patch_values());
                data.set_all(transforms);
                let version = doc.version();
                doc.convert_to_found(version, data).set_has_local_mutations();

                let mut mask = previous_mask?;
                if let Mutation::Patch { mask: patch_mask, .. } = self {
                    mask = mask.union(patch_mask);
                }
                for transform in self.field_transforms() {
                    mask.insert(transform.field_path.clone());
                }
                Some(mask)
            }
            Mutation::Delete { .. } => {
                let version = doc.version();
                doc.convert_to_no_document(version).set_has_local_mutations();
                None
            }
            Mutation::Verify { .. } => previous_mask,
        }
    }

    /// Base values that make increments idempotent when re-applied over newer remote data.
    pub fn extract_transform_base_value(&self, doc: &Document) -> Option<ObjectValue> {
        let mut base: Option<ObjectValue> = None;
        for transform in self.field_transforms() {
            let existing = doc.field(&transform.field_path);
            if let Some(coerced) = transform.operation.compute_base_value(existing) {
                base.get_or_insert_with(ObjectValue::empty)
                    .set(&transform.field_path, coerced);
            }
        }
        base
    }

    fn patch_values(&self) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
        let mut values = BTreeMap::new();
        if let Mutation::Patch { value, mask, .. } = self {
            for path in mask.paths() {
                values.insert(path.clone(), value.get(path).cloned());
            }
        }
        values
    }

    fn server_transform_results(
        &self,
        doc: &Document,
        results: &[FirestoreValue],
    ) -> FirestoreResult<BTreeMap<FieldPath, Option<FirestoreValue>>> {
        let transforms = self.field_transforms();
        if transforms.len() != results.len() {
            return Err(internal_error(format!(
                "server transform result count ({}) should match field transform count ({})",
                results.len(),
                transforms.len()
            )));
        }
        Ok(transforms
            .iter()
            .zip(results.iter())
            .map(|(transform, result)| {
                let previous = doc.field(&transform.field_path);
                let value = transform
                    .operation
                    .apply_to_remote_document(previous, result.clone());
                (transform.field_path.clone(), Some(value))
            })
            .collect())
    }

    fn local_transform_results(
        &self,
        doc: &Document,
        local_write_time: Timestamp,
    ) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
        self.field_transforms()
            .iter()
            .map(|transform| {
                let previous = doc.field(&transform.field_path);
                let value = transform
                    .operation
                    .apply_to_local_view(previous, local_write_time);
                (transform.field_path.clone(), Some(value))
            })
            .collect()
    }

    fn verify_key_matches(&self, doc: &Document) -> FirestoreResult<()> {
        if doc.key() != self.key() {
            return Err(internal_error(format!(
                "Can only apply a mutation for {} to a document with the same key, got {}",
                self.key(),
                doc.key()
            )));
        }
        Ok(())
    }
}
