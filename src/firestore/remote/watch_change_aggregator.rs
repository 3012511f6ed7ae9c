use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::{QueryPurpose, TargetData};
use crate::firestore::model::{Document, DocumentKey, SnapshotVersion};
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::watch_change::{
    DocumentChange, DocumentDelete, DocumentRemove, ExistenceFilterChange, TargetChangeState,
    WatchTargetChange,
};

/// What the aggregator needs to know about the targets it is tracking.
pub trait TargetMetadataProvider {
    /// Keys the backend last reported for the target (as of the last remote event).
    fn get_remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey>;

    /// Target data for an active listen, or `None` if the target is no longer listened to.
    fn get_target_data_for_target(&self, target_id: i32) -> Option<&TargetData>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DocumentChangeKind {
    Added,
    Modified,
    Removed,
}

/// Per-target accumulation of changes since the last remote event.
#[derive(Debug)]
struct TargetState {
    /// Outstanding watch/unwatch requests. Changes for a target with pending responses
    /// belong to an earlier incarnation of it and are dropped.
    pending_responses: u32,
    current: bool,
    resume_token: Vec<u8>,
    document_changes: BTreeMap<DocumentKey, DocumentChangeKind>,
    has_pending_changes: bool,
}

impl TargetState {
    fn new() -> Self {
        Self {
            pending_responses: 0,
            current: false,
            resume_token: Vec::new(),
            document_changes: BTreeMap::new(),
            // A fresh target always reports at least once.
            has_pending_changes: true,
        }
    }

    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, token: &[u8]) {
        if !token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = token.to_vec();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..TargetChange::default()
        };
        for (key, kind) in &self.document_changes {
            let bucket = match kind {
                DocumentChangeKind::Added => &mut change.added_documents,
                DocumentChangeKind::Modified => &mut change.modified_documents,
                DocumentChangeKind::Removed => &mut change.removed_documents,
            };
            bucket.insert(key.clone());
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, kind: DocumentChangeKind) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, kind);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Folds individual watch changes into consistent [`RemoteEvent`]s.
///
/// Changes accumulate until the stream reports a global snapshot version, at which point
/// [`WatchChangeAggregator::create_remote_event`] emits everything seen since the last
/// event.
#[derive(Debug, Default)]
pub struct WatchChangeAggregator {
    target_states: BTreeMap<i32, TargetState>,
    pending_document_updates: BTreeMap<DocumentKey, Document>,
    /// Targets each changed document was reported for, used to detect limbo resolutions.
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<i32>>,
    pending_target_resets: BTreeSet<i32>,
}

impl WatchChangeAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_document_change(
        &mut self,
        change: DocumentChange,
        metadata: &dyn TargetMetadataProvider,
    ) {
        for target_id in &change.updated_target_ids {
            self.add_document_to_target(*target_id, change.document.clone(), metadata);
        }
        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(
                *target_id,
                change.document.key().clone(),
                Some(change.document.clone()),
                metadata,
            );
        }
    }

    pub fn handle_document_delete(
        &mut self,
        delete: DocumentDelete,
        metadata: &dyn TargetMetadataProvider,
    ) {
        let tombstone = Document::new_no_document(delete.key.clone(), delete.read_time);
        for target_id in delete.removed_target_ids {
            self.remove_document_from_target(
                target_id,
                delete.key.clone(),
                Some(tombstone.clone()),
                metadata,
            );
        }
    }

    pub fn handle_document_remove(
        &mut self,
        remove: DocumentRemove,
        metadata: &dyn TargetMetadataProvider,
    ) {
        for target_id in remove.removed_target_ids {
            self.remove_document_from_target(target_id, remove.key.clone(), None, metadata);
        }
    }

    pub fn handle_target_change(
        &mut self,
        change: &WatchTargetChange,
        metadata: &dyn TargetMetadataProvider,
    ) -> FirestoreResult<()> {
        let target_ids: Vec<i32> = if change.target_ids.is_empty() {
            self.target_states.keys().copied().collect()
        } else {
            change.target_ids.clone()
        };

        for target_id in target_ids {
            let is_active = self.is_active_target(target_id, metadata);
            let state = self.ensure_target_state(target_id);
            match change.state {
                TargetChangeState::NoChange => {
                    if is_active {
                        state.update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Add => {
                    // The backend acknowledged the listen; earlier changes were for a
                    // previous incarnation of the target.
                    state.pending_responses = state.pending_responses.saturating_sub(1);
                    if !state.is_pending() {
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                TargetChangeState::Remove => {
                    if change.cause.is_some() {
                        return Err(internal_error(
                            "Rejected targets must be handled before aggregation",
                        ));
                    }
                    state.pending_responses = state.pending_responses.saturating_sub(1);
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                }
                TargetChangeState::Current => {
                    if is_active {
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Reset => {
                    if is_active {
                        // Drop everything we know; the backend resends the full result set.
                        self.reset_target(target_id, metadata);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
        Ok(())
    }

    /// Compares the backend's document count with ours and resets the target on a mismatch.
    pub fn handle_existence_filter(
        &mut self,
        filter: ExistenceFilterChange,
        metadata: &dyn TargetMetadataProvider,
    ) -> FirestoreResult<()> {
        let target_id = filter.target_id;
        let Some(target_data) = self.target_data_for_active_target(target_id, metadata) else {
            return Ok(());
        };

        if target_data.query.is_document_query() {
            if filter.count == 0 {
                // The single document we are waiting for does not exist. A NoDocument at
                // version NONE is removed from the cache rather than stored.
                let key = DocumentKey::from_path(target_data.query.path().clone())?;
                let tombstone = Document::new_no_document(key.clone(), SnapshotVersion::NONE);
                self.remove_document_from_target(target_id, key, Some(tombstone), metadata);
            } else if filter.count != 1 {
                return Err(internal_error(format!(
                    "Single document existence filter with count {}",
                    filter.count
                )));
            }
            return Ok(());
        }

        let current_count = self.current_document_count_for_target(target_id, metadata);
        // A negative count can never match.
        let matches = usize::try_from(filter.count).is_ok_and(|expected| expected == current_count);
        if !matches {
            log::debug!(
                "firestore::watch: existence filter mismatch for target {target_id} (local {current_count}, remote {})",
                filter.count
            );
            self.reset_target(target_id, metadata);
            self.pending_target_resets.insert(target_id);
        }
        Ok(())
    }

    /// Emits everything accumulated since the last event, stamped with `snapshot_version`.
    pub fn create_remote_event(
        &mut self,
        snapshot_version: SnapshotVersion,
        metadata: &dyn TargetMetadataProvider,
    ) -> FirestoreResult<RemoteEvent> {
        let mut target_changes = BTreeMap::new();
        let target_ids: Vec<i32> = self.target_states.keys().copied().collect();

        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(target_id, metadata) else {
                continue;
            };
            let is_document_query = target_data.query.is_document_query();
            let document_path = target_data.query.path().clone();

            let current = self
                .target_states
                .get(&target_id)
                .map(|state| state.current)
                .unwrap_or(false);
            if current && is_document_query {
                // A current document target that never mentioned its document means the
                // document does not exist. Without this, a deleted document would stay in
                // limbo forever.
                let key = DocumentKey::from_path(document_path)?;
                if !self.pending_document_updates.contains_key(&key)
                    && !self.target_contains_document(target_id, &key, metadata)
                {
                    let tombstone = Document::new_no_document(key.clone(), snapshot_version);
                    self.remove_document_from_target(target_id, key, Some(tombstone), metadata);
                }
            }

            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let mut resolved_limbo_documents = BTreeSet::new();
        for (key, target_ids) in &self.pending_document_target_mapping {
            let only_limbo_targets = target_ids.iter().all(|target_id| {
                self.target_data_for_active_target(*target_id, metadata)
                    .map(|data| data.purpose == QueryPurpose::LimboResolution)
                    .unwrap_or(true)
            });
            if only_limbo_targets {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        let mut document_updates = std::mem::take(&mut self.pending_document_updates);
        for doc in document_updates.values_mut() {
            doc.set_read_time(snapshot_version);
        }
        self.pending_document_target_mapping.clear();

        Ok(RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        })
    }

    /// Called for every watch or unwatch request sent for the target.
    pub fn record_pending_target_request(&mut self, target_id: i32) {
        self.ensure_target_state(target_id).pending_responses += 1;
    }

    pub fn remove_target(&mut self, target_id: i32) {
        self.target_states.remove(&target_id);
    }

    fn ensure_target_state(&mut self, target_id: i32) -> &mut TargetState {
        self.target_states
            .entry(target_id)
            .or_insert_with(TargetState::new)
    }

    fn add_document_to_target(
        &mut self,
        target_id: i32,
        document: Document,
        metadata: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, metadata) {
            return;
        }
        let key = document.key().clone();
        let kind = if self.target_contains_document(target_id, &key, metadata) {
            DocumentChangeKind::Modified
        } else {
            DocumentChangeKind::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), kind);
        self.pending_document_updates.insert(key.clone(), document);
        self.pending_document_target_mapping
            .entry(key)
            .or_default()
            .insert(target_id);
    }

    /// `updated` carries the document's new state when it is known (a delete), and is
    /// `None` when the document merely stopped matching.
    fn remove_document_from_target(
        &mut self,
        target_id: i32,
        key: DocumentKey,
        updated: Option<Document>,
        metadata: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, metadata) {
            return;
        }
        if self.target_contains_document(target_id, &key, metadata) {
            self.ensure_target_state(target_id)
                .add_document_change(key.clone(), DocumentChangeKind::Removed);
        } else {
            // Never reported to the target, so there is nothing to remove.
            self.ensure_target_state(target_id)
                .remove_document_change(&key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(doc) = updated {
            self.pending_document_updates.insert(key, doc);
        }
    }

    fn reset_target(&mut self, target_id: i32, metadata: &dyn TargetMetadataProvider) {
        self.target_states.insert(target_id, TargetState::new());
        // Every document the target held is removed; the backend re-adds what still matches.
        for key in metadata.get_remote_keys_for_target(target_id) {
            self.remove_document_from_target(target_id, key, None, metadata);
        }
    }

    fn current_document_count_for_target(
        &self,
        target_id: i32,
        metadata: &dyn TargetMetadataProvider,
    ) -> usize {
        let existing = metadata.get_remote_keys_for_target(target_id).len();
        let Some(state) = self.target_states.get(&target_id) else {
            return existing;
        };
        let (added, removed) = state.document_changes.values().fold((0, 0), |(a, r), kind| match kind {
            DocumentChangeKind::Added => (a + 1, r),
            DocumentChangeKind::Removed => (a, r + 1),
            DocumentChangeKind::Modified => (a, r),
        });
        (existing + added).saturating_sub(removed)
    }

    fn target_contains_document(
        &self,
        target_id: i32,
        key: &DocumentKey,
        metadata: &dyn TargetMetadataProvider,
    ) -> bool {
        let pending = self
            .target_states
            .get(&target_id)
            .and_then(|state| state.document_changes.get(key));
        match pending {
            Some(kind) => *kind != DocumentChangeKind::Removed,
            None => metadata.get_remote_keys_for_target(target_id).contains(key),
        }
    }

    fn is_active_target(&self, target_id: i32, metadata: &dyn TargetMetadataProvider) -> bool {
        self.target_data_for_active_target(target_id, metadata)
            .is_some()
    }

    fn target_data_for_active_target<'m>(
        &self,
        target_id: i32,
        metadata: &'m dyn TargetMetadataProvider,
    ) -> Option<&'m TargetData> {
        match self.target_states.get(&target_id) {
            Some(state) if state.is_pending() => None,
            _ => metadata.get_target_data_for_target(target_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::Query;
    use crate::firestore::value::ObjectValue;

    #[derive(Default)]
    struct TestMetadata {
        targets: BTreeMap<i32, TargetData>,
        remote_keys: BTreeMap<i32, BTreeSet<DocumentKey>>,
    }

    impl TestMetadata {
        fn with_target(mut self, target_id: i32, query: Query, purpose: QueryPurpose) -> Self {
            self.targets
                .insert(target_id, TargetData::new(query, target_id, 1, purpose));
            self
        }

        fn with_remote_keys(mut self, target_id: i32, keys: &[&str]) -> Self {
            self.remote_keys
                .insert(target_id, keys.iter().map(|k| key(k)).collect());
            self
        }
    }

    impl TargetMetadataProvider for TestMetadata {
        fn get_remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey> {
            self.remote_keys.get(&target_id).cloned().unwrap_or_default()
        }

        fn get_target_data_for_target(&self, target_id: i32) -> Option<&TargetData> {
            self.targets.get(&target_id)
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(micros: i64) -> SnapshotVersion {
        SnapshotVersion::from_micros(micros)
    }

    fn doc(path: &str, at: i64) -> Document {
        Document::new_found(key(path), version(at), ObjectValue::empty())
    }

    fn update(target_ids: Vec<i32>, document: Document) -> DocumentChange {
        DocumentChange {
            updated_target_ids: target_ids,
            removed_target_ids: Vec::new(),
            document,
        }
    }

    fn collection_target(target_id: i32) -> TestMetadata {
        TestMetadata::default().with_target(target_id, Query::collection("c").unwrap(), QueryPurpose::Listen)
    }

    #[test]
    fn aggregates_document_changes() {
        let metadata = collection_target(2);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.record_pending_target_request(2);
        aggregator
            .handle_target_change(&WatchTargetChange::new(TargetChangeState::Add, vec![2]), &metadata)
            .unwrap();
        aggregator.handle_document_change(update(vec![2], doc("c/a", 5)), &metadata);
        aggregator
            .handle_target_change(
                &WatchTargetChange::new(TargetChangeState::Current, vec![2]).with_resume_token(vec![7]),
                &metadata,
            )
            .unwrap();

        let event = aggregator.create_remote_event(version(5), &metadata).unwrap();
        let change = &event.target_changes[&2];
        assert!(change.current);
        assert_eq!(change.resume_token, vec![7]);
        assert!(change.added_documents.contains(&key("c/a")));
        assert_eq!(event.document_updates[&key("c/a")].read_time(), version(5));
        assert!(event.resolved_limbo_documents.is_empty());
    }

    #[test]
    fn changes_for_pending_targets_are_dropped() {
        let metadata = collection_target(2);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.record_pending_target_request(2);
        aggregator.handle_document_change(update(vec![2], doc("c/a", 5)), &metadata);

        let event = aggregator.create_remote_event(version(5), &metadata).unwrap();
        assert!(event.target_changes.is_empty());
        assert!(event.document_updates.is_empty());
    }

    #[test]
    fn known_documents_are_reported_as_modified() {
        let metadata = collection_target(2).with_remote_keys(2, &["c/a"]);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_document_change(update(vec![2], doc("c/a", 6)), &metadata);
        aggregator.handle_document_remove(
            DocumentRemove {
                key: key("c/b"),
                removed_target_ids: vec![2],
            },
            &metadata,
        );

        let event = aggregator.create_remote_event(version(6), &metadata).unwrap();
        let change = &event.target_changes[&2];
        assert!(change.modified_documents.contains(&key("c/a")));
        assert!(change.removed_documents.is_empty());
    }

    #[test]
    fn existence_filter_mismatch_resets_target() {
        let metadata = collection_target(2).with_remote_keys(2, &["c/a", "c/b"]);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator
            .handle_existence_filter(ExistenceFilterChange { target_id: 2, count: 1 }, &metadata)
            .unwrap();

        let event = aggregator.create_remote_event(version(8), &metadata).unwrap();
        assert!(event.target_mismatches.contains(&2));
        let change = &event.target_changes[&2];
        assert_eq!(change.removed_documents.len(), 2);
        assert!(!change.current);
    }

    #[test]
    fn matching_existence_filter_is_ignored() {
        let metadata = collection_target(2).with_remote_keys(2, &["c/a"]);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator
            .handle_existence_filter(ExistenceFilterChange { target_id: 2, count: 1 }, &metadata)
            .unwrap();
        let event = aggregator.create_remote_event(version(8), &metadata).unwrap();
        assert!(event.target_mismatches.is_empty());
    }

    #[test]
    fn negative_existence_filter_count_is_a_mismatch() {
        let metadata = collection_target(2);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator
            .handle_existence_filter(ExistenceFilterChange { target_id: 2, count: -1 }, &metadata)
            .unwrap();
        let event = aggregator.create_remote_event(version(8), &metadata).unwrap();
        assert!(event.target_mismatches.contains(&2));
    }

    #[test]
    fn current_document_target_without_document_resolves_as_deleted() {
        let metadata = TestMetadata::default().with_target(
            1,
            Query::for_document(&key("c/missing")),
            QueryPurpose::LimboResolution,
        );
        let mut aggregator = WatchChangeAggregator::new();
        aggregator
            .handle_target_change(&WatchTargetChange::new(TargetChangeState::Current, vec![1]), &metadata)
            .unwrap();

        let event = aggregator.create_remote_event(version(9), &metadata).unwrap();
        let doc = &event.document_updates[&key("c/missing")];
        assert!(doc.is_no_document());
        assert_eq!(doc.version(), version(9));
        assert!(event.resolved_limbo_documents.contains(&key("c/missing")));
    }

    #[test]
    fn documents_seen_by_listen_targets_are_not_limbo_resolutions() {
        let metadata = collection_target(2).with_target(
            1,
            Query::for_document(&key("c/a")),
            QueryPurpose::LimboResolution,
        );
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_document_change(update(vec![1, 2], doc("c/a", 3)), &metadata);
        let event = aggregator.create_remote_event(version(3), &metadata).unwrap();
        assert!(event.resolved_limbo_documents.is_empty());
    }

    #[test]
    fn reset_clears_accumulated_changes() {
        let metadata = collection_target(2).with_remote_keys(2, &["c/old"]);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_document_change(update(vec![2], doc("c/new", 4)), &metadata);
        aggregator
            .handle_target_change(&WatchTargetChange::new(TargetChangeState::Reset, vec![2]), &metadata)
            .unwrap();

        let event = aggregator.create_remote_event(version(4), &metadata).unwrap();
        let change = &event.target_changes[&2];
        assert!(change.removed_documents.contains(&key("c/old")));
        assert!(change.added_documents.is_empty());
    }
}
