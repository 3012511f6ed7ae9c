use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::firestore::core::view_snapshot::{
    sort_changes, ChangeType, DocumentViewChange, DocumentViewChangeSet, ViewSnapshot,
};
use crate::firestore::core::{LimitType, Query};
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::{Document, DocumentKey, DocumentMap, DocumentSet};
use crate::firestore::remote::{OnlineState, TargetChange};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SyncState {
    None,
    /// Results come only from the local cache.
    Local,
    /// The target is current and no document is in limbo.
    Synced,
}

/// A document entering or leaving the set of limbo documents of a view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

/// Candidate next state of a view, computed by [`View::compute_doc_changes`] and
/// committed by [`View::apply_changes`].
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    document_set: DocumentSet,
    change_set: DocumentViewChangeSet,
    mutated_keys: BTreeSet<DocumentKey>,
    /// A limit query lost documents from its window and must be recomputed with a full
    /// local query before the changes can be applied.
    needs_refill: bool,
}

impl ViewDocumentChanges {
    pub fn needs_refill(&self) -> bool {
        self.needs_refill
    }
}

#[derive(Clone, Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// The incrementally maintained result set of one query.
///
/// A view only knows what it is told: local document changes arrive through
/// [`compute_doc_changes`](Self::compute_doc_changes), and the backend's opinion about
/// membership arrives as a [`TargetChange`].
#[derive(Clone, Debug)]
pub struct View {
    query: Query,
    sync_state: SyncState,
    /// Whether the target has been marked current by the backend.
    current: bool,
    document_set: DocumentSet,
    /// Keys the backend says match the query.
    synced_documents: BTreeSet<DocumentKey>,
    limbo_documents: BTreeSet<DocumentKey>,
    /// Documents in the view with pending local writes.
    mutated_keys: BTreeSet<DocumentKey>,
}

impl View {
    pub fn new(query: Query, remote_documents: BTreeSet<DocumentKey>) -> Self {
        let document_set = DocumentSet::new(query.comparator());
        Self {
            query,
            sync_state: SyncState::None,
            current: false,
            document_set,
            synced_documents: remote_documents,
            limbo_documents: BTreeSet::new(),
            mutated_keys: BTreeSet::new(),
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn is_synced(&self) -> bool {
        self.sync_state == SyncState::Synced
    }

    pub fn is_current(&self) -> bool {
        self.current
    }

    pub fn synced_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.synced_documents
    }

    pub fn limbo_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.limbo_documents
    }

    pub fn document_set(&self) -> &DocumentSet {
        &self.document_set
    }

    pub fn mutated_keys(&self) -> &BTreeSet<DocumentKey> {
        &self.mutated_keys
    }

    /// Folds changed documents into a candidate result set without mutating the view.
    ///
    /// Pass the result of an earlier call as `previous` to continue from it, which is how
    /// a refill recomputes the window from the full local query.
    pub fn compute_doc_changes(
        &self,
        doc_changes: &DocumentMap,
        previous: Option<ViewDocumentChanges>,
    ) -> FirestoreResult<ViewDocumentChanges> {
        let continuing = previous.is_some();
        let (mut change_set, old_document_set, mut new_mutated_keys) = match previous {
            Some(previous) => (previous.change_set, previous.document_set, previous.mutated_keys),
            None => (
                DocumentViewChangeSet::new(),
                self.document_set.clone(),
                self.mutated_keys.clone(),
            ),
        };
        let mut new_document_set = old_document_set.clone();
        let mut needs_refill = false;
        let comparator = self.query.comparator();

        let full_window = self
            .query
            .limit()
            .is_some_and(|limit| old_document_set.len() == limit as usize);
        let last_doc_in_limit = match self.query.limit_type() {
            LimitType::First if full_window => old_document_set.last().cloned(),
            _ => None,
        };
        let first_doc_in_limit = match self.query.limit_type() {
            LimitType::Last if full_window => old_document_set.first().cloned(),
            _ => None,
        };

        for (key, candidate) in doc_changes {
            let old_doc = old_document_set.get(key);
            let new_doc = self.query.matches(candidate).then_some(candidate);

            let old_doc_had_pending_mutations =
                old_doc.is_some_and(|doc| new_mutated_keys.contains(doc.key()));
            // Committed mutations belong to an acknowledged batch and are no longer pending.
            let new_doc_has_pending_mutations = new_doc.is_some_and(Document::has_local_mutations);

            let mut change_applied = false;
            match (old_doc, new_doc) {
                (Some(old_doc), Some(new_doc)) => {
                    if old_doc.data() != new_doc.data() {
                        change_set.add_change(DocumentViewChange::new(
                            ChangeType::Modified,
                            new_doc.clone(),
                        ))?;
                        change_applied = true;
                        let leaves_window = last_doc_in_limit
                            .as_ref()
                            .is_some_and(|last| comparator(new_doc, last) == Ordering::Greater)
                            || first_doc_in_limit
                                .as_ref()
                                .is_some_and(|first| comparator(new_doc, first) == Ordering::Less);
                        if leaves_window {
                            // The document may have moved past documents that are
                            // only in the cache, not in this window.
                            needs_refill = true;
                        }
                    } else if old_doc_had_pending_mutations != new_doc_has_pending_mutations {
                        change_set.add_change(DocumentViewChange::new(
                            ChangeType::Metadata,
                            new_doc.clone(),
                        ))?;
                        change_applied = true;
                    }
                }
                (None, Some(new_doc)) => {
                    change_set.add_change(DocumentViewChange::new(ChangeType::Added, new_doc.clone()))?;
                    change_applied = true;
                }
                (Some(old_doc), None) => {
                    change_set.add_change(DocumentViewChange::new(ChangeType::Removed, old_doc.clone()))?;
                    change_applied = true;
                    if last_doc_in_limit.is_some() || first_doc_in_limit.is_some() {
                        // A slot opened in a full window; a cached document may fill it.
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if change_applied {
                match new_doc {
                    Some(new_doc) => {
                        new_document_set.insert(new_doc.clone());
                        if new_doc.has_local_mutations() {
                            new_mutated_keys.insert(key.clone());
                        } else {
                            new_mutated_keys.remove(key);
                        }
                    }
                    None => {
                        new_document_set.remove(key);
                        new_mutated_keys.remove(key);
                    }
                }
            }
        }

        // Trim the window back to the limit, evicting from the far end.
        if let Some(limit) = self.query.limit() {
            while new_document_set.len() > limit as usize {
                let evicted = match self.query.limit_type() {
                    LimitType::First => new_document_set.last().cloned(),
                    LimitType::Last => new_document_set.first().cloned(),
                };
                let Some(evicted) = evicted else { break };
                new_document_set.remove(evicted.key());
                new_mutated_keys.remove(evicted.key());
                change_set.add_change(DocumentViewChange::new(ChangeType::Removed, evicted))?;
            }
        }

        if needs_refill && continuing {
            return Err(internal_error("View changes that need a refill cannot be continued"));
        }

        Ok(ViewDocumentChanges {
            document_set: new_document_set,
            change_set,
            mutated_keys: new_mutated_keys,
            needs_refill,
        })
    }

    /// Commits computed changes plus an optional target change from the backend.
    ///
    /// Returns the snapshot to raise (if anything observable changed) and the limbo
    /// documents that appeared or disappeared.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        target_change: Option<&TargetChange>,
    ) -> FirestoreResult<ViewChange> {
        self.apply_changes_with_limbo(doc_changes, target_change, true)
    }

    /// Marks the view not current when the client goes offline, so its snapshot reports
    /// from-cache results instead of waiting for the backend.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> FirestoreResult<ViewChange> {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let unchanged = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentViewChangeSet::new(),
                mutated_keys: self.mutated_keys.clone(),
                needs_refill: false,
            };
            return self.apply_changes_with_limbo(unchanged, None, false);
        }
        Ok(ViewChange::default())
    }

    fn apply_changes_with_limbo(
        &mut self,
        doc_changes: ViewDocumentChanges,
        target_change: Option<&TargetChange>,
        update_limbo_documents: bool,
    ) -> FirestoreResult<ViewChange> {
        if doc_changes.needs_refill {
            return Err(internal_error("Cannot apply view changes that need a refill"));
        }
        let old_documents = std::mem::replace(&mut self.document_set, doc_changes.document_set);
        self.mutated_keys = doc_changes.mutated_keys;

        let mut changes = doc_changes.change_set.changes();
        sort_changes(&mut changes, &self.query);

        if let Some(target_change) = target_change {
            self.apply_target_change(target_change);
        }
        let limbo_changes = if update_limbo_documents {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current;
        let new_sync_state = if synced { SyncState::Synced } else { SyncState::Local };
        let sync_state_changed = new_sync_state != self.sync_state;
        self.sync_state = new_sync_state;

        let snapshot = if !changes.is_empty() || sync_state_changed {
            let has_cached_results =
                target_change.is_some_and(|change| !change.resume_token.is_empty());
            Some(ViewSnapshot::new(
                self.query.clone(),
                self.document_set.clone(),
                old_documents,
                changes,
                new_sync_state == SyncState::Local,
                self.mutated_keys.clone(),
                sync_state_changed,
                false,
                has_cached_results,
            ))
        } else {
            None
        };
        Ok(ViewChange {
            snapshot,
            limbo_changes,
        })
    }

    fn apply_target_change(&mut self, target_change: &TargetChange) {
        for key in &target_change.added_documents {
            self.synced_documents.insert(key.clone());
        }
        for key in &target_change.modified_documents {
            if !self.synced_documents.contains(key) {
                log::debug!("firestore::view: modified document {key:?} was not synced");
            }
        }
        for key in &target_change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = target_change.current;
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        // Only a current target knows its full membership.
        if !self.current {
            return Vec::new();
        }
        let old_limbo = std::mem::take(&mut self.limbo_documents);
        self.limbo_documents = self
            .document_set
            .iter()
            .filter(|doc| self.should_be_in_limbo(doc))
            .map(|doc| doc.key().clone())
            .collect();

        let removed = old_limbo
            .difference(&self.limbo_documents)
            .cloned()
            .map(LimboDocumentChange::Removed);
        let added = self
            .limbo_documents
            .difference(&old_limbo)
            .cloned()
            .map(LimboDocumentChange::Added);
        removed.chain(added).collect()
    }

    fn should_be_in_limbo(&self, doc: &Document) -> bool {
        // Local writes explain why the document is here without the backend's word.
        !self.synced_documents.contains(doc.key()) && !doc.has_local_mutations()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::firestore::core::{Direction, FilterOperator};
    use crate::firestore::model::SnapshotVersion;
    use crate::firestore::value::{FirestoreValue, ObjectValue};

    fn doc(path: &str, count: i64) -> Document {
        let mut fields = BTreeMap::new();
        fields.insert("count".to_string(), FirestoreValue::from_integer(count));
        Document::new_found(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(1),
            ObjectValue::from_map(fields),
        )
    }

    fn changes(docs: &[Document]) -> DocumentMap {
        docs.iter().map(|doc| (doc.key().clone(), doc.clone())).collect()
    }

    fn keys(view_snapshot: &ViewSnapshot) -> Vec<String> {
        view_snapshot
            .documents()
            .keys()
            .map(|key| key.id().to_string())
            .collect()
    }

    fn apply(view: &mut View, docs: &[Document], target_change: Option<&TargetChange>) -> ViewChange {
        let computed = view.compute_doc_changes(&changes(docs), None).unwrap();
        view.apply_changes(computed, target_change).unwrap()
    }

    fn current_change(added: &[&Document]) -> TargetChange {
        let mut change = TargetChange::create_synthesized(true);
        change.added_documents = added.iter().map(|doc| doc.key().clone()).collect();
        change
    }

    #[test]
    fn adds_documents_in_query_order() {
        let query = Query::collection("rooms").unwrap();
        let mut view = View::new(query, BTreeSet::new());
        let change = apply(&mut view, &[doc("rooms/b", 1), doc("rooms/a", 2)], None);
        let snapshot = change.snapshot.unwrap();
        assert_eq!(keys(&snapshot), vec!["a", "b"]);
        assert!(snapshot.from_cache());
        assert!(snapshot
            .changes()
            .iter()
            .all(|change| change.change_type == ChangeType::Added));
    }

    #[test]
    fn ignores_documents_outside_the_query() {
        let query = Query::collection("rooms").unwrap();
        let mut view = View::new(query, BTreeSet::new());
        let change = apply(&mut view, &[doc("messages/a", 1)], None);
        assert!(change.snapshot.unwrap().documents().is_empty());
    }

    #[test]
    fn removes_deleted_documents() {
        let query = Query::collection("rooms").unwrap();
        let mut view = View::new(query, BTreeSet::new());
        apply(&mut view, &[doc("rooms/a", 1)], None);
        let deleted = Document::new_no_document(
            DocumentKey::from_string("rooms/a").unwrap(),
            SnapshotVersion::from_micros(2),
        );
        let snapshot = apply(&mut view, &[deleted], None).snapshot.unwrap();
        assert!(snapshot.documents().is_empty());
        assert_eq!(snapshot.changes()[0].change_type, ChangeType::Removed);
    }

    #[test]
    fn becomes_synced_once_current_and_limbo_free() {
        let query = Query::collection("rooms").unwrap();
        let mut view = View::new(query, BTreeSet::new());
        let a = doc("rooms/a", 1);
        let snapshot = apply(&mut view, &[a.clone()], Some(&current_change(&[&a])))
            .snapshot
            .unwrap();
        assert!(!snapshot.from_cache());
        assert!(snapshot.sync_state_changed());
        assert!(view.is_synced());

        let offline = view.apply_online_state_change(OnlineState::Offline).unwrap();
        assert!(offline.snapshot.unwrap().from_cache());
    }

    #[test]
    fn unsynced_document_goes_into_limbo() {
        let query = Query::collection("rooms").unwrap();
        let mut view = View::new(query, BTreeSet::new());
        let a = doc("rooms/a", 1);
        let b = doc("rooms/b", 1);
        let change = apply(&mut view, &[a.clone(), b.clone()], Some(&current_change(&[&a])));
        assert_eq!(
            change.limbo_changes,
            vec![LimboDocumentChange::Added(b.key().clone())]
        );
        assert!(change.snapshot.unwrap().from_cache());

        let change = apply(&mut view, &[], Some(&current_change(&[&b])));
        assert_eq!(
            change.limbo_changes,
            vec![LimboDocumentChange::Removed(b.key().clone())]
        );
        assert!(!change.snapshot.unwrap().from_cache());
    }

    #[test]
    fn limit_window_evicts_highest_member() {
        let query = Query::collection("items")
            .unwrap()
            .where_field("count", FilterOperator::LessThanOrEqual, FirestoreValue::from_integer(5))
            .unwrap()
            .order_by("count", Direction::Ascending)
            .unwrap()
            .limit_to_first(3);
        let mut view = View::new(query, BTreeSet::new());
        apply(
            &mut view,
            &[doc("items/a", 1), doc("items/b", 3), doc("items/c", 4), doc("items/d", 5)],
            None,
        );
        let snapshot = apply(&mut view, &[doc("items/e", 2)], None).snapshot.unwrap();
        assert_eq!(keys(&snapshot), vec!["a", "e", "b"]);
        let kinds: Vec<(ChangeType, String)> = snapshot
            .changes()
            .iter()
            .map(|change| (change.change_type, change.document.key().id().to_string()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (ChangeType::Removed, "c".to_string()),
                (ChangeType::Added, "e".to_string())
            ]
        );
    }

    #[test]
    fn removal_from_full_window_needs_refill() {
        let query = Query::collection("items").unwrap().limit_to_first(2);
        let mut view = View::new(query, BTreeSet::new());
        apply(&mut view, &[doc("items/a", 1), doc("items/b", 2), doc("items/c", 3)], None);
        let deleted = Document::new_no_document(
            DocumentKey::from_string("items/a").unwrap(),
            SnapshotVersion::from_micros(2),
        );
        let computed = view.compute_doc_changes(&changes(&[deleted]), None).unwrap();
        assert!(computed.needs_refill());
    }

    #[test]
    fn pending_write_flip_is_a_metadata_change() {
        let query = Query::collection("rooms").unwrap();
        let mut view = View::new(query, BTreeSet::new());
        let mut local = doc("rooms/a", 1);
        local.set_has_local_mutations();
        let snapshot = apply(&mut view, &[local], None).snapshot.unwrap();
        assert!(snapshot.has_pending_writes());

        let snapshot = apply(&mut view, &[doc("rooms/a", 1)], None).snapshot.unwrap();
        assert_eq!(snapshot.changes()[0].change_type, ChangeType::Metadata);
        assert!(!snapshot.has_pending_writes());
    }

    #[test]
    fn acknowledged_write_clears_pending_writes() {
        let query = Query::collection("rooms").unwrap();
        let mut view = View::new(query, BTreeSet::new());
        let mut local = doc("rooms/a", 1);
        local.set_has_local_mutations();
        apply(&mut view, &[local], None);

        let mut committed = doc("rooms/a", 1);
        committed.set_has_committed_mutations();
        let snapshot = apply(&mut view, &[committed], None).snapshot.unwrap();
        assert_eq!(snapshot.changes().len(), 1);
        assert_eq!(snapshot.changes()[0].change_type, ChangeType::Metadata);
        assert!(!snapshot.has_pending_writes());
        assert!(view.mutated_keys().is_empty());

        // A later synced version with the same data raises nothing.
        assert!(apply(&mut view, &[doc("rooms/a", 1)], None).snapshot.is_none());
    }
}
