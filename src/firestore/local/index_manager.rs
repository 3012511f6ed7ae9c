//! Client-side field indexes over the remote document cache.
//!
//! An index covers one collection group and an ordered list of fields. Every remote
//! document that has all indexed fields gets one entry holding those field values.
//! Index scans yield candidate keys only; the query engine re-applies the full query
//! against the local view of each candidate.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::core::Query;
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{Document, DocumentKey, FieldPath, SnapshotVersion};
use crate::firestore::value::{ObjectValue, OrderedValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    Ascending,
    Descending,
    Contains,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSegment {
    pub field_path: FieldPath,
    pub kind: IndexKind,
}

impl IndexSegment {
    pub fn new(field_path: FieldPath, kind: IndexKind) -> Self {
        Self { field_path, kind }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldIndex {
    pub collection_group: String,
    pub segments: Vec<IndexSegment>,
}

impl FieldIndex {
    pub fn new(collection_group: impl Into<String>, segments: Vec<IndexSegment>) -> Self {
        Self {
            collection_group: collection_group.into(),
            segments,
        }
    }

    fn covers_field(&self, field: &FieldPath) -> bool {
        self.segments
            .iter()
            .any(|segment| &segment.field_path == field)
    }

    fn entry_values(&self, doc: &Document) -> Option<Vec<OrderedValue>> {
        self.segments
            .iter()
            .map(|segment| doc.field(&segment.field_path).cloned().map(OrderedValue))
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
struct IndexEntry {
    values: Vec<OrderedValue>,
    key: DocumentKey,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct IndexState {
    index: FieldIndex,
    entries: BTreeSet<IndexEntry>,
    /// Read time of the newest document folded into the index.
    updated_at: SnapshotVersion,
    #[serde(skip)]
    values_by_key: BTreeMap<DocumentKey, Vec<OrderedValue>>,
}

impl IndexState {
    fn new(index: FieldIndex) -> Self {
        Self {
            index,
            entries: BTreeSet::new(),
            updated_at: SnapshotVersion::NONE,
            values_by_key: BTreeMap::new(),
        }
    }

    fn remove_key(&mut self, key: &DocumentKey) {
        if let Some(values) = self.values_by_key.remove(key) {
            self.entries.remove(&IndexEntry {
                values,
                key: key.clone(),
            });
        }
    }

    fn update(&mut self, doc: &Document) {
        self.remove_key(doc.key());
        if !doc.is_found_document() {
            return;
        }
        if let Some(values) = self.index.entry_values(doc) {
            self.values_by_key.insert(doc.key().clone(), values.clone());
            self.entries.insert(IndexEntry {
                values,
                key: doc.key().clone(),
            });
        }
        self.updated_at = self.updated_at.max(doc.read_time());
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IndexManager {
    indexes: Vec<IndexState>,
}

impl IndexManager {
    pub fn field_indexes(&self) -> Vec<FieldIndex> {
        self.indexes.iter().map(|state| state.index.clone()).collect()
    }

    /// Replaces the configured indexes. Returns the indexes that are new and need backfill.
    pub fn configure(&mut self, indexes: Vec<FieldIndex>) -> FirestoreResult<Vec<FieldIndex>> {
        for index in &indexes {
            if index.segments.is_empty() {
                return Err(invalid_argument(format!(
                    "Index for collection group '{}' must list at least one field",
                    index.collection_group
                )));
            }
            if index.collection_group.is_empty() || index.collection_group.contains('/') {
                return Err(invalid_argument(format!(
                    "Invalid collection group '{}' in index configuration",
                    index.collection_group
                )));
            }
        }

        let mut previous: Vec<IndexState> = std::mem::take(&mut self.indexes);
        let mut added = Vec::new();
        for index in indexes {
            match previous.iter().position(|state| state.index == index) {
                Some(position) => self.indexes.push(previous.swap_remove(position)),
                None => {
                    added.push(index.clone());
                    self.indexes.push(IndexState::new(index));
                }
            }
        }
        Ok(added)
    }

    /// Folds a remote document write into every index on its collection group.
    pub fn update_document(&mut self, doc: &Document) {
        let group = doc.key().collection_group().to_string();
        for state in self
            .indexes
            .iter_mut()
            .filter(|state| state.index.collection_group == group)
        {
            state.update(doc);
        }
    }

    /// Highest read time folded into each index, in configuration order.
    pub(crate) fn watermarks(&self) -> Vec<SnapshotVersion> {
        self.indexes.iter().map(|state| state.updated_at).collect()
    }

    pub(crate) fn restore_watermarks(&mut self, watermarks: &[SnapshotVersion]) {
        for (state, updated_at) in self.indexes.iter_mut().zip(watermarks) {
            state.updated_at = *updated_at;
        }
    }

    pub fn remove_document(&mut self, key: &DocumentKey) {
        for state in &mut self.indexes {
            state.remove_key(key);
        }
    }

    /// Backfills one index from the given documents.
    pub fn backfill<'a, I>(&mut self, index: &FieldIndex, documents: I)
    where
        I: IntoIterator<Item = &'a Document>,
    {
        if let Some(state) = self.indexes.iter_mut().find(|state| &state.index == index) {
            for doc in documents {
                if doc.key().collection_group() == index.collection_group {
                    state.update(doc);
                }
            }
        }
    }

    /// Candidate keys for `query`, or `None` when no index serves it.
    ///
    /// An index serves a query when it is on the query's collection group and its fields
    /// are exactly the filtered fields. Candidates are a superset of the remote matches.
    pub fn get_documents_matching_query(&self, query: &Query) -> Option<BTreeSet<DocumentKey>> {
        if query.filters().is_empty() || query.is_document_query() {
            return None;
        }
        let group = query.target_collection_group()?;
        // Documents missing an indexed field have no entry, so every indexed field must
        // also be filtered on for the candidates to be complete.
        let state = self.indexes.iter().find(|state| {
            state.index.collection_group == group
                && query.filters().iter().all(|filter| {
                    filter.field().is_key_field() || state.index.covers_field(filter.field())
                })
                && state.index.segments.iter().all(|segment| {
                    query
                        .filters()
                        .iter()
                        .any(|filter| filter.field() == &segment.field_path)
                })
        })?;

        let keys = state
            .entries
            .iter()
            .filter(|entry| query.covers_key(&entry.key))
            .filter(|entry| {
                let doc = entry_document(&state.index, entry);
                // Key filters are left to the final query match.
                query
                    .filters()
                    .iter()
                    .all(|filter| filter.field().is_key_field() || filter.matches(&doc))
            })
            .map(|entry| entry.key.clone())
            .collect();
        log::debug!(
            "firestore::index_manager: serving {query} from index on '{}'",
            state.index.collection_group
        );
        Some(keys)
    }

    pub fn rebuild_index(&mut self) {
        for state in &mut self.indexes {
            state.values_by_key = state
                .entries
                .iter()
                .map(|entry| (entry.key.clone(), entry.values.clone()))
                .collect();
        }
    }
}

fn entry_document(index: &FieldIndex, entry: &IndexEntry) -> Document {
    let mut value = ObjectValue::empty();
    for (segment, field_value) in index.segments.iter().zip(entry.values.iter()) {
        value.set(&segment.field_path, field_value.0.clone());
    }
    Document::new_found(entry.key.clone(), SnapshotVersion::NONE, value)
}
