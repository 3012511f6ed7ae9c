use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::Query;
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::{Document, DocumentKey, DocumentSet};

/// How a document changed between two snapshots of a view.
///
/// The declaration order is the order changes are reported in: removals first, then
/// additions, then modifications.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChangeType {
    Removed,
    Added,
    Modified,
    /// Only the pending-write state of the document changed.
    Metadata,
}

impl ChangeType {
    fn report_order(self) -> u8 {
        match self {
            ChangeType::Removed => 0,
            ChangeType::Added => 1,
            ChangeType::Modified | ChangeType::Metadata => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub change_type: ChangeType,
    pub document: Document,
}

impl DocumentViewChange {
    pub fn new(change_type: ChangeType, document: Document) -> Self {
        Self {
            change_type,
            document,
        }
    }
}

/// Accumulates per-document changes, collapsing successive changes to the same key.
#[derive(Clone, Debug, Default)]
pub struct DocumentViewChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentViewChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn add_change(&mut self, change: DocumentViewChange) -> FirestoreResult<()> {
        let key = change.document.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return Ok(());
        };
        use ChangeType::*;
        let merged = match (old.change_type, change.change_type) {
            (Metadata, new_type) if new_type != Added => Some(change),
            (old_type, Metadata) if old_type != Removed => {
                Some(DocumentViewChange::new(old_type, change.document))
            }
            (Modified, Modified) => Some(change),
            (Added, Modified) => Some(DocumentViewChange::new(Added, change.document)),
            (Added, Removed) => None,
            (Modified, Removed) => Some(DocumentViewChange::new(Removed, old.document.clone())),
            (Removed, Added) => Some(DocumentViewChange::new(Modified, change.document)),
            (old_type, new_type) => {
                return Err(internal_error(format!(
                    "Unsupported combination of changes: {new_type:?} after {old_type:?}"
                )))
            }
        };
        match merged {
            Some(merged) => {
                self.changes.insert(key, merged);
            }
            None => {
                self.changes.remove(&key);
            }
        }
        Ok(())
    }

    /// Changes in key order.
    pub fn changes(&self) -> Vec<DocumentViewChange> {
        self.changes.values().cloned().collect()
    }
}

/// Sorts changes for delivery: by change kind, then by the query's document order.
pub(crate) fn sort_changes(changes: &mut [DocumentViewChange], query: &Query) {
    let comparator = query.comparator();
    changes.sort_by(|left, right| {
        left.change_type
            .report_order()
            .cmp(&right.change_type.report_order())
            .then_with(|| comparator(&left.document, &right.document))
    });
}

/// Immutable state of a query's results at one point in time, with the delta from the
/// previous snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewSnapshot {
    query: Query,
    documents: DocumentSet,
    old_documents: DocumentSet,
    changes: Vec<DocumentViewChange>,
    from_cache: bool,
    mutated_keys: BTreeSet<DocumentKey>,
    sync_state_changed: bool,
    excludes_metadata_changes: bool,
    has_cached_results: bool,
}

impl ViewSnapshot {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        query: Query,
        documents: DocumentSet,
        old_documents: DocumentSet,
        changes: Vec<DocumentViewChange>,
        from_cache: bool,
        mutated_keys: BTreeSet<DocumentKey>,
        sync_state_changed: bool,
        excludes_metadata_changes: bool,
        has_cached_results: bool,
    ) -> Self {
        Self {
            query,
            documents,
            old_documents,
            changes,
            from_cache,
            mutated_keys,
            sync_state_changed,
            excludes_metadata_changes,
            has_cached_results,
        }
    }

    /// Snapshot for a listener that joins a query whose view already has results: every
    /// document is reported as added.
    pub fn from_initial_documents(
        query: Query,
        documents: DocumentSet,
        mutated_keys: BTreeSet<DocumentKey>,
        from_cache: bool,
        excludes_metadata_changes: bool,
        has_cached_results: bool,
    ) -> Self {
        let changes = documents
            .iter()
            .map(|doc| DocumentViewChange::new(ChangeType::Added, doc.clone()))
            .collect();
        let old_documents = DocumentSet::new(query.comparator());
        Self::new(
            query,
            documents,
            old_documents,
            changes,
            from_cache,
            mutated_keys,
            true,
            excludes_metadata_changes,
            has_cached_results,
        )
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn documents(&self) -> &DocumentSet {
        &self.documents
    }

    pub fn old_documents(&self) -> &DocumentSet {
        &self.old_documents
    }

    pub fn changes(&self) -> &[DocumentViewChange] {
        &self.changes
    }

    /// The results may be incomplete or stale because the backend has not confirmed them.
    pub fn from_cache(&self) -> bool {
        self.from_cache
    }

    pub fn mutated_keys(&self) -> &BTreeSet<DocumentKey> {
        &self.mutated_keys
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }

    pub fn sync_state_changed(&self) -> bool {
        self.sync_state_changed
    }

    pub fn excludes_metadata_changes(&self) -> bool {
        self.excludes_metadata_changes
    }

    pub fn has_cached_results(&self) -> bool {
        self.has_cached_results
    }

    /// Copy with metadata-only changes removed, for listeners that do not want them.
    pub(crate) fn without_metadata_changes(&self) -> Self {
        let mut filtered = self.clone();
        filtered
            .changes
            .retain(|change| change.change_type != ChangeType::Metadata);
        filtered.excludes_metadata_changes = true;
        filtered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::SnapshotVersion;
    use crate::firestore::value::ObjectValue;

    fn doc(path: &str, version: i64) -> Document {
        Document::new_found(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(version),
            ObjectValue::empty(),
        )
    }

    fn single(set: &DocumentViewChangeSet) -> Option<ChangeType> {
        let changes = set.changes();
        assert!(changes.len() <= 1);
        changes.first().map(|change| change.change_type)
    }

    #[test]
    fn added_then_modified_stays_added() {
        let mut set = DocumentViewChangeSet::new();
        set.add_change(DocumentViewChange::new(ChangeType::Added, doc("c/a", 1))).unwrap();
        set.add_change(DocumentViewChange::new(ChangeType::Modified, doc("c/a", 2))).unwrap();
        assert_eq!(single(&set), Some(ChangeType::Added));
        assert_eq!(set.changes()[0].document.version(), SnapshotVersion::from_micros(2));
    }

    #[test]
    fn added_then_removed_cancels_out() {
        let mut set = DocumentViewChangeSet::new();
        set.add_change(DocumentViewChange::new(ChangeType::Added, doc("c/a", 1))).unwrap();
        set.add_change(DocumentViewChange::new(ChangeType::Removed, doc("c/a", 1))).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn removed_then_added_is_a_modification() {
        let mut set = DocumentViewChangeSet::new();
        set.add_change(DocumentViewChange::new(ChangeType::Removed, doc("c/a", 1))).unwrap();
        set.add_change(DocumentViewChange::new(ChangeType::Added, doc("c/a", 2))).unwrap();
        assert_eq!(single(&set), Some(ChangeType::Modified));
    }

    #[test]
    fn metadata_change_keeps_stronger_kind() {
        let mut set = DocumentViewChangeSet::new();
        set.add_change(DocumentViewChange::new(ChangeType::Modified, doc("c/a", 1))).unwrap();
        set.add_change(DocumentViewChange::new(ChangeType::Metadata, doc("c/a", 2))).unwrap();
        assert_eq!(single(&set), Some(ChangeType::Modified));
    }

    #[test]
    fn removed_then_removed_is_rejected() {
        let mut set = DocumentViewChangeSet::new();
        set.add_change(DocumentViewChange::new(ChangeType::Removed, doc("c/a", 1))).unwrap();
        assert!(set
            .add_change(DocumentViewChange::new(ChangeType::Removed, doc("c/a", 1)))
            .is_err());
    }

    #[test]
    fn changes_sort_removals_first() {
        let query = Query::collection("c").unwrap();
        let mut changes = vec![
            DocumentViewChange::new(ChangeType::Modified, doc("c/a", 1)),
            DocumentViewChange::new(ChangeType::Added, doc("c/c", 1)),
            DocumentViewChange::new(ChangeType::Added, doc("c/b", 1)),
            DocumentViewChange::new(ChangeType::Removed, doc("c/d", 1)),
        ];
        sort_changes(&mut changes, &query);
        let order: Vec<&str> = changes
            .iter()
            .map(|change| change.document.key().id())
            .collect();
        assert_eq!(order, vec!["d", "b", "c", "a"]);
    }
}
