use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::firestore::model::{DocumentKey, FieldPath, SnapshotVersion};
use crate::firestore::value::{FirestoreValue, ObjectValue};

pub type DocumentMap = BTreeMap<DocumentKey, Document>;

/// What the cache knows about the document's existence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentType {
    /// Nothing is known about the document (a placeholder for cache misses).
    Invalid,
    FoundDocument,
    /// The document is known not to exist at `version`.
    NoDocument,
    /// The document exists at `version` but its contents are unknown, e.g. after a
    /// transform was acknowledged for a document we never read.
    UnknownDocument,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteState {
    Synced,
    HasLocalMutations,
    /// Acknowledged by the backend but not yet observed on the watch stream.
    HasCommittedMutations,
}

/// Summary state exposed to higher layers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentState {
    Synced,
    LocalMutations,
    NoDocument,
    Unknown,
}

/// A document in the local cache or in a view.
///
/// Documents are mutated in place by mutation application; everything else treats them as
/// values and clones them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    key: DocumentKey,
    document_type: DocumentType,
    version: SnapshotVersion,
    read_time: SnapshotVersion,
    value: ObjectValue,
    write_state: WriteState,
}

impl Document {
    pub fn new_invalid(key: DocumentKey) -> Self {
        Self {
            key,
            document_type: DocumentType::Invalid,
            version: SnapshotVersion::NONE,
            read_time: SnapshotVersion::NONE,
            value: ObjectValue::empty(),
            write_state: WriteState::Synced,
        }
    }

    pub fn new_found(key: DocumentKey, version: SnapshotVersion, value: ObjectValue) -> Self {
        let mut doc = Self::new_invalid(key);
        doc.convert_to_found(version, value);
        doc
    }

    pub fn new_no_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        let mut doc = Self::new_invalid(key);
        doc.convert_to_no_document(version);
        doc
    }

    pub fn new_unknown(key: DocumentKey, version: SnapshotVersion) -> Self {
        let mut doc = Self::new_invalid(key);
        doc.convert_to_unknown(version);
        doc
    }

    pub fn convert_to_found(&mut self, version: SnapshotVersion, value: ObjectValue) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::FoundDocument;
        self.value = value;
        self.write_state = WriteState::Synced;
        self
    }

    pub fn convert_to_no_document(&mut self, version: SnapshotVersion) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::NoDocument;
        self.value = ObjectValue::empty();
        self.write_state = WriteState::Synced;
        self
    }

    pub fn convert_to_unknown(&mut self, version: SnapshotVersion) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::UnknownDocument;
        self.value = ObjectValue::empty();
        self.write_state = WriteState::HasCommittedMutations;
        self
    }

    pub fn set_has_committed_mutations(&mut self) -> &mut Self {
        self.write_state = WriteState::HasCommittedMutations;
        self
    }

    pub fn set_has_local_mutations(&mut self) -> &mut Self {
        self.write_state = WriteState::HasLocalMutations;
        self.version = SnapshotVersion::NONE;
        self
    }

    pub fn set_read_time(&mut self, read_time: SnapshotVersion) -> &mut Self {
        self.read_time = read_time;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn document_type(&self) -> DocumentType {
        self.document_type
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn read_time(&self) -> SnapshotVersion {
        self.read_time
    }

    pub fn data(&self) -> &ObjectValue {
        &self.value
    }

    pub fn data_mut(&mut self) -> &mut ObjectValue {
        &mut self.value
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        self.value.get(path)
    }

    pub fn is_valid_document(&self) -> bool {
        self.document_type != DocumentType::Invalid
    }

    pub fn is_found_document(&self) -> bool {
        self.document_type == DocumentType::FoundDocument
    }

    pub fn is_no_document(&self) -> bool {
        self.document_type == DocumentType::NoDocument
    }

    pub fn is_unknown_document(&self) -> bool {
        self.document_type == DocumentType::UnknownDocument
    }

    pub fn has_local_mutations(&self) -> bool {
        self.write_state == WriteState::HasLocalMutations
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.write_state == WriteState::HasCommittedMutations
    }

    pub fn has_pending_writes(&self) -> bool {
        self.has_local_mutations() || self.has_committed_mutations()
    }

    pub fn state(&self) -> DocumentState {
        match self.document_type {
            DocumentType::NoDocument if !self.has_local_mutations() => DocumentState::NoDocument,
            DocumentType::UnknownDocument | DocumentType::Invalid => DocumentState::Unknown,
            _ if self.has_local_mutations() => DocumentState::LocalMutations,
            DocumentType::NoDocument => DocumentState::NoDocument,
            DocumentType::FoundDocument => DocumentState::Synced,
        }
    }

    pub fn estimate_byte_size(&self) -> usize {
        self.key.path().canonical_string().len() + self.value.estimate_byte_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn key() -> DocumentKey {
        DocumentKey::from_string("rooms/eros").unwrap()
    }

    #[test]
    fn tracks_write_state() {
        let mut doc = Document::new_found(
            key(),
            SnapshotVersion::from_micros(10),
            ObjectValue::from_map(BTreeMap::new()),
        );
        assert_eq!(doc.state(), DocumentState::Synced);

        doc.set_has_local_mutations();
        assert_eq!(doc.state(), DocumentState::LocalMutations);
        assert_eq!(doc.version(), SnapshotVersion::NONE);

        doc.convert_to_no_document(SnapshotVersion::from_micros(20));
        assert_eq!(doc.state(), DocumentState::NoDocument);
        assert!(!doc.has_pending_writes());
    }

    #[test]
    fn unknown_documents_have_committed_mutations() {
        let doc = Document::new_unknown(key(), SnapshotVersion::from_micros(3));
        assert!(doc.has_committed_mutations());
        assert_eq!(doc.state(), DocumentState::Unknown);
    }
}
