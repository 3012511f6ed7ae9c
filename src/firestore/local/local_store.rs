//! The local store: the single source of truth for cached documents, pending writes
//! and target metadata.
//!
//! Every mutating operation runs as one transaction. The larger tables journal the
//! entries a transaction touches and the small ones are copied at its start. A failed
//! operation or a failed commit to the persistence backend rolls all of them back, so
//! callers never observe a partial update. Transactions that change nothing stored
//! skip the backend commit.

use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::{Query, TargetIdGenerator};
use crate::firestore::error::{failed_precondition, internal_error, FirestoreResult};
use crate::firestore::local::index_manager::FieldIndex;
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::local::local_view_changes::LocalViewChanges;
use crate::firestore::local::lru_garbage_collector::{
    run_lru_collection, GarbageCollectorSettings, LruResults,
};
use crate::firestore::local::persistence::{PersistedSavepoint, PersistedState, Persistence};
use crate::firestore::local::query_engine::{QueryEngine, QueryStrategy};
use crate::firestore::local::reference_set::{
    DocumentReferences, ReferenceCounts, ReferenceKind, ReferenceSet,
};
use crate::firestore::local::target_data::{QueryPurpose, TargetData};
use crate::firestore::model::mutation::{
    Mutation, MutationBatch, MutationBatchResult, Precondition,
};
use crate::firestore::model::{Document, DocumentKey, DocumentMap, SnapshotVersion, Timestamp};
use crate::firestore::remote::{RemoteEvent, TargetChange};

/// Resume tokens older than this are re-persisted even without membership changes.
const RESUME_TOKEN_MAX_AGE_MICROS: i64 = 5 * 60 * 1_000_000;

#[derive(Clone, Debug)]
pub struct LocalWriteResult {
    pub batch_id: i32,
    /// Local view of every document the batch touched.
    pub changes: DocumentMap,
}

#[derive(Clone, Debug)]
pub struct QueryResult {
    pub documents: DocumentMap,
    /// Keys the backend last reported for the query's target.
    pub remote_keys: BTreeSet<DocumentKey>,
    pub strategy: QueryStrategy,
}

struct LocalStoreState {
    persisted: PersistedState,
    references: ReferenceCounts,
    /// Documents currently shown by views, keyed by target id. Never persisted.
    local_view_references: ReferenceSet,
    /// Active targets; may hold newer data than the target cache.
    target_data_by_target: BTreeMap<i32, TargetData>,
    target_id_by_canonical_id: BTreeMap<String, i32>,
    target_id_generator: TargetIdGenerator,
}

/// Start-of-transaction state of [`LocalStoreState`].
struct StateSavepoint {
    persisted: PersistedSavepoint,
    target_data_by_target: BTreeMap<i32, TargetData>,
    target_id_by_canonical_id: BTreeMap<String, i32>,
    target_id_generator: TargetIdGenerator,
}

impl LocalStoreState {
    fn begin(&mut self, snapshot_indexes: bool) -> StateSavepoint {
        self.references.begin();
        self.local_view_references.begin();
        StateSavepoint {
            persisted: self.persisted.begin(snapshot_indexes),
            target_data_by_target: self.target_data_by_target.clone(),
            target_id_by_canonical_id: self.target_id_by_canonical_id.clone(),
            target_id_generator: self.target_id_generator.clone(),
        }
    }

    fn commit(&mut self) {
        self.persisted.commit();
        self.references.commit();
        self.local_view_references.commit();
    }

    fn rollback(&mut self, savepoint: StateSavepoint) {
        self.persisted.rollback(savepoint.persisted);
        self.references.rollback();
        self.local_view_references.rollback();
        self.target_data_by_target = savepoint.target_data_by_target;
        self.target_id_by_canonical_id = savepoint.target_id_by_canonical_id;
        self.target_id_generator = savepoint.target_id_generator;
    }
}

pub struct LocalStore {
    persistence: Box<dyn Persistence>,
    garbage_collector: GarbageCollectorSettings,
    state: LocalStoreState,
    started: bool,
}

impl LocalStore {
    /// Loads the persisted state (if any) and rebuilds the in-memory reference table.
    pub fn new(
        mut persistence: Box<dyn Persistence>,
        garbage_collector: GarbageCollectorSettings,
    ) -> FirestoreResult<Self> {
        let persisted = persistence.load()?.unwrap_or_default();
        let references = rebuild_reference_counts(&persisted);
        let target_id_generator =
            TargetIdGenerator::for_target_cache(persisted.target_cache.highest_target_id());
        log::debug!(
            "firestore::local_store: started with {} documents, {} pending batches, {} targets",
            persisted.remote_documents.len(),
            persisted.mutation_queue.len(),
            persisted.target_cache.target_count()
        );
        Ok(Self {
            persistence,
            garbage_collector,
            state: LocalStoreState {
                persisted,
                references,
                local_view_references: ReferenceSet::default(),
                target_data_by_target: BTreeMap::new(),
                target_id_by_canonical_id: BTreeMap::new(),
                target_id_generator,
            },
            started: true,
        })
    }

    pub fn is_durable(&self) -> bool {
        self.persistence.is_durable()
    }

    pub fn garbage_collector(&self) -> GarbageCollectorSettings {
        self.garbage_collector
    }

    pub fn shutdown(&mut self) -> FirestoreResult<()> {
        if !self.started {
            return Ok(());
        }
        self.started = false;
        self.persistence.shutdown()
    }

    /// Appends a batch to the mutation queue and returns the resulting local view.
    pub fn write_locally(
        &mut self,
        mutations: Vec<Mutation>,
        local_write_time: Timestamp,
    ) -> FirestoreResult<LocalWriteResult> {
        self.run_transaction("Locally write mutations", |store| {
            let keys: BTreeSet<DocumentKey> =
                mutations.iter().map(|mutation| mutation.key().clone()).collect();
            let mut existing = store.local_documents().get_documents(keys.iter());

            // Transforms that depend on the current value (increments) capture it as a
            // base mutation, so later reapplication stays stable.
            let base_mutations: Vec<Mutation> = mutations
                .iter()
                .filter_map(|mutation| {
                    let doc = existing.get(mutation.key())?;
                    let base_value = mutation.extract_transform_base_value(doc)?;
                    Some(Mutation::Patch {
                        key: mutation.key().clone(),
                        mask: base_value.field_mask(),
                        value: base_value,
                        precondition: Precondition::Exists(true),
                        field_transforms: Vec::new(),
                    })
                })
                .collect();

            let batch = store.state.persisted.mutation_queue.add_mutation_batch(
                local_write_time,
                base_mutations,
                mutations,
            );
            for key in batch.keys() {
                store
                    .state
                    .references
                    .increment(&key, ReferenceKind::Mutation);
            }
            batch.apply_to_local_document_set(&mut existing);
            log::debug!(
                "firestore::local_store: wrote batch {} touching {} documents",
                batch.batch_id,
                keys.len()
            );
            Ok(LocalWriteResult {
                batch_id: batch.batch_id,
                changes: existing,
            })
        })
    }

    /// Folds an acknowledged batch into the remote documents and drops it from the queue.
    pub fn acknowledge_batch(&mut self, batch_result: &MutationBatchResult) -> FirestoreResult<DocumentMap> {
        self.run_transaction("Acknowledge batch", |store| {
            let batch = &batch_result.batch;
            store
                .state
                .persisted
                .mutation_queue
                .acknowledge_batch(batch, batch_result.stream_token.clone())?;
            store.apply_write_to_remote_documents(batch_result)?;
            store
                .state
                .persisted
                .mutation_queue
                .perform_consistency_check()?;
            Ok(store.local_documents().get_documents(batch.keys().iter()))
        })
    }

    /// Drops a batch the backend refused; its documents revert to their remote state.
    pub fn reject_batch(&mut self, batch_id: i32) -> FirestoreResult<DocumentMap> {
        self.run_transaction("Reject batch", |store| {
            let keys = store
                .state
                .persisted
                .mutation_queue
                .lookup_mutation_batch(batch_id)
                .map(MutationBatch::keys)
                .ok_or_else(|| internal_error(format!("Attempt to reject nonexistent batch {batch_id}")))?;
            store.remove_mutation_batch(batch_id)?;
            store
                .state
                .persisted
                .mutation_queue
                .perform_consistency_check()?;
            Ok(store.local_documents().get_documents(keys.iter()))
        })
    }

    pub fn get_highest_unacknowledged_batch_id(&self) -> i32 {
        self.state
            .persisted
            .mutation_queue
            .get_highest_unacknowledged_batch_id()
    }

    pub fn get_next_mutation_batch(&self, after_batch_id: i32) -> Option<MutationBatch> {
        self.state
            .persisted
            .mutation_queue
            .get_next_mutation_batch_after_batch_id(after_batch_id)
            .cloned()
    }

    pub fn lookup_mutation_batch(&self, batch_id: i32) -> Option<MutationBatch> {
        self.state
            .persisted
            .mutation_queue
            .lookup_mutation_batch(batch_id)
            .cloned()
    }

    pub fn get_last_stream_token(&self) -> Vec<u8> {
        self.state
            .persisted
            .mutation_queue
            .last_stream_token()
            .to_vec()
    }

    pub fn set_last_stream_token(&mut self, token: Vec<u8>) -> FirestoreResult<()> {
        self.run_transaction("Set stream token", |store| {
            store
                .state
                .persisted
                .mutation_queue
                .set_last_stream_token(token);
            Ok(())
        })
    }

    pub fn get_last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.state
            .persisted
            .target_cache
            .last_remote_snapshot_version()
    }

    /// Merges a remote event into the cache and returns the local view of every
    /// document that changed.
    pub fn apply_remote_event(&mut self, event: &RemoteEvent) -> FirestoreResult<DocumentMap> {
        self.run_transaction("Apply remote event", |store| {
            let remote_version = event.snapshot_version;
            let sequence_number = store.state.persisted.target_cache.next_sequence_number();

            for (target_id, change) in &event.target_changes {
                store.apply_target_change(
                    *target_id,
                    change,
                    remote_version,
                    sequence_number,
                    event.target_mismatches.contains(target_id),
                );
            }

            if matches!(store.garbage_collector, GarbageCollectorSettings::Lru(_)) {
                for key in event.document_updates.keys() {
                    if event.resolved_limbo_documents.contains(key) {
                        store
                            .state
                            .persisted
                            .document_sequence_numbers
                            .insert(key.clone(), sequence_number);
                    }
                }
            }

            let changed = store.populate_document_changes(&event.document_updates);

            if !remote_version.is_none() {
                let last_remote_version = store
                    .state
                    .persisted
                    .target_cache
                    .last_remote_snapshot_version();
                if remote_version < last_remote_version {
                    return Err(internal_error(format!(
                        "Watch stream reverted to previous snapshot ({remote_version} < {last_remote_version})"
                    )));
                }
                store
                    .state
                    .persisted
                    .target_cache
                    .set_last_remote_snapshot_version(remote_version);
            }

            Ok(store.local_documents().get_local_view_of_documents(changed))
        })
    }

    /// Pins the documents shown by views and records limbo-free versions.
    pub fn notify_local_view_changes(&mut self, view_changes: &[LocalViewChanges]) -> FirestoreResult<()> {
        self.run_transaction("Notify local view changes", |store| {
            // Allocated on the first release so that pinning alone stores nothing.
            let mut sequence_number = None;
            for change in view_changes {
                let target_id = change.target_id;
                for key in &change.added {
                    if !store
                        .state
                        .local_view_references
                        .references_for_id(target_id)
                        .contains(key)
                    {
                        store.state.local_view_references.add_reference(key.clone(), target_id);
                        store.state.references.increment(key, ReferenceKind::LocalView);
                    }
                }
                for key in store
                    .state
                    .local_view_references
                    .remove_references(change.removed.iter(), target_id)
                {
                    let sequence_number = *sequence_number.get_or_insert_with(|| {
                        store.state.persisted.target_cache.next_sequence_number()
                    });
                    store.remove_reference(&key, ReferenceKind::LocalView, sequence_number);
                }

                if !change.from_cache {
                    if let Some(target_data) = store.state.target_data_by_target.get(&target_id) {
                        // The view is in sync with the backend at the target's snapshot version.
                        let updated = target_data
                            .with_last_limbo_free_snapshot_version(target_data.snapshot_version);
                        store.state.target_data_by_target.insert(target_id, updated);
                    }
                }
            }
            Ok(())
        })
    }

    /// Reuses the cached target for an equivalent query or allocates a new target id.
    pub fn allocate_target(&mut self, query: &Query) -> FirestoreResult<TargetData> {
        self.run_transaction("Allocate target", |store| {
            let cached = store
                .state
                .persisted
                .target_cache
                .get_target_data(query)
                .cloned();
            let target_data = match cached {
                Some(cached) => cached,
                None => {
                    let target_id = store.state.target_id_generator.next_id();
                    let sequence_number = store.state.persisted.target_cache.next_sequence_number();
                    let target_data =
                        TargetData::new(query.clone(), target_id, sequence_number, QueryPurpose::Listen);
                    store
                        .state
                        .persisted
                        .target_cache
                        .add_target_data(target_data.clone());
                    target_data
                }
            };

            let target_id = target_data.target_id;
            if !store.state.target_data_by_target.contains_key(&target_id) {
                store
                    .state
                    .target_data_by_target
                    .insert(target_id, target_data.clone());
                store
                    .state
                    .target_id_by_canonical_id
                    .insert(query.canonical_id(), target_id);
            }
            Ok(store
                .state
                .target_data_by_target
                .get(&target_id)
                .cloned()
                .unwrap_or(target_data))
        })
    }

    /// Active target data for the query, falling back to the target cache.
    pub fn get_target_data(&self, query: &Query) -> Option<TargetData> {
        self.state
            .target_id_by_canonical_id
            .get(&query.canonical_id())
            .and_then(|id| self.state.target_data_by_target.get(id))
            .or_else(|| self.state.persisted.target_cache.get_target_data(query))
            .cloned()
    }

    /// Stops tracking a target. Its view references are dropped; eager collection
    /// also removes the target from the cache.
    pub fn release_target(&mut self, target_id: i32) -> FirestoreResult<()> {
        self.run_transaction("Release target", |store| {
            let target_data = store
                .state
                .target_data_by_target
                .remove(&target_id)
                .ok_or_else(|| internal_error(format!("Tried to release nonexistent target: {target_id}")))?;
            let canonical_id = target_data.query.canonical_id();
            if store.state.target_id_by_canonical_id.get(&canonical_id) == Some(&target_id) {
                store.state.target_id_by_canonical_id.remove(&canonical_id);
            }

            let sequence_number = store.state.persisted.target_cache.next_sequence_number();
            for key in store
                .state
                .local_view_references
                .remove_references_for_id(target_id)
            {
                store.remove_reference(&key, ReferenceKind::LocalView, sequence_number);
            }

            match store.garbage_collector {
                GarbageCollectorSettings::Eager => {
                    for key in store
                        .state
                        .persisted
                        .target_cache
                        .remove_target_data(target_id)
                    {
                        store.state.references.decrement(&key, ReferenceKind::Target);
                    }
                }
                GarbageCollectorSettings::Lru(_) => {
                    // Keep the newest resume token so a later listen can resume.
                    let updated = target_data.with_sequence_number(sequence_number);
                    store
                        .state
                        .persisted
                        .target_cache
                        .update_target_data(updated);
                }
            }
            log::debug!("firestore::local_store: released target {target_id}");
            Ok(())
        })
    }

    /// Runs a query against the local cache.
    ///
    /// With `use_previous_results`, the keys last synced for the query's target seed the
    /// result, which avoids a full scan when the target is limbo free.
    pub fn execute_query(&self, query: &Query, use_previous_results: bool) -> QueryResult {
        let (last_limbo_free, remote_keys) = match self.get_target_data(query) {
            Some(target_data) => (
                target_data.last_limbo_free_snapshot_version,
                self.state
                    .persisted
                    .target_cache
                    .get_matching_keys_for_target_id(target_data.target_id),
            ),
            None => (SnapshotVersion::NONE, BTreeSet::new()),
        };
        let engine = QueryEngine::new(self.local_documents(), &self.state.persisted.index_manager);
        let (documents, strategy) = engine.get_documents_matching_query(
            query,
            if use_previous_results {
                last_limbo_free
            } else {
                SnapshotVersion::NONE
            },
            &remote_keys,
        );
        QueryResult {
            documents,
            remote_keys,
            strategy,
        }
    }

    pub fn get_remote_document_keys(&self, target_id: i32) -> BTreeSet<DocumentKey> {
        self.state
            .persisted
            .target_cache
            .get_matching_keys_for_target_id(target_id)
    }

    /// Local view of a document, or an invalid document if nothing is known.
    pub fn read_document(&self, key: &DocumentKey) -> Document {
        self.local_documents().get_document(key)
    }

    pub fn read_documents<'a, I>(&self, keys: I) -> DocumentMap
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        self.local_documents().get_documents(keys)
    }

    /// Replaces the configured field indexes and backfills the new ones.
    pub fn configure_field_indexes(&mut self, indexes: Vec<FieldIndex>) -> FirestoreResult<()> {
        self.run_transaction_with("Configure indexes", true, |store| {
            let persisted = &mut store.state.persisted;
            let added = persisted.index_manager.configure(indexes)?;
            for index in &added {
                persisted
                    .index_manager
                    .backfill(index, persisted.remote_documents.documents());
            }
            log::debug!(
                "firestore::local_store: configured {} field indexes ({} new)",
                persisted.index_manager.field_indexes().len(),
                added.len()
            );
            Ok(())
        })
    }

    pub fn field_indexes(&self) -> Vec<FieldIndex> {
        self.state.persisted.index_manager.field_indexes()
    }

    /// Runs the configured garbage collector.
    pub fn collect_garbage(&mut self) -> FirestoreResult<LruResults> {
        self.run_transaction("Collect garbage", |store| {
            match store.garbage_collector {
                GarbageCollectorSettings::Eager => {
                    let removed = store.collect_orphaned_documents();
                    Ok(LruResults {
                        has_run: true,
                        documents_removed: removed,
                        ..LruResults::default()
                    })
                }
                GarbageCollectorSettings::Lru(params) => {
                    let active: BTreeSet<i32> =
                        store.state.target_data_by_target.keys().copied().collect();
                    let state = &mut store.state;
                    Ok(run_lru_collection(
                        &params,
                        &mut state.persisted,
                        &mut state.references,
                        &active,
                    ))
                }
            }
        })
    }

    /// Reference counts for a document, mostly useful for diagnostics.
    pub fn document_references(&self, key: &DocumentKey) -> DocumentReferences {
        self.state.references.get(key)
    }

    pub fn contains_remote_document(&self, key: &DocumentKey) -> bool {
        self.state.persisted.remote_documents.contains_key(key)
    }

    fn local_documents(&self) -> LocalDocumentsView<'_> {
        LocalDocumentsView::new(
            &self.state.persisted.remote_documents,
            &self.state.persisted.mutation_queue,
        )
    }

    fn run_transaction<T>(
        &mut self,
        action: &str,
        operation: impl FnOnce(&mut Self) -> FirestoreResult<T>,
    ) -> FirestoreResult<T> {
        self.run_transaction_with(action, false, operation)
    }

    /// `snapshot_indexes` copies the index manager up front, for operations that
    /// reconfigure indexes rather than follow document writes.
    fn run_transaction_with<T>(
        &mut self,
        action: &str,
        snapshot_indexes: bool,
        operation: impl FnOnce(&mut Self) -> FirestoreResult<T>,
    ) -> FirestoreResult<T> {
        if !self.started {
            return Err(failed_precondition(format!(
                "Cannot run '{action}': the local store has been shut down"
            )));
        }
        let savepoint = self.state.begin(snapshot_indexes);
        let result = operation(self).and_then(|value| {
            if self.garbage_collector == GarbageCollectorSettings::Eager {
                self.collect_orphaned_documents();
            }
            if self.state.persisted.has_changes(&savepoint.persisted) {
                self.persistence.commit(action, &self.state.persisted)?;
            } else {
                log::trace!("firestore::local_store: '{action}' changed nothing stored");
            }
            Ok(value)
        });
        match &result {
            Ok(_) => self.state.commit(),
            Err(err) => {
                log::warn!("firestore::local_store: '{action}' failed and was rolled back: {err}");
                self.state.rollback(savepoint);
            }
        }
        result
    }

    fn apply_target_change(
        &mut self,
        target_id: i32,
        change: &TargetChange,
        remote_version: SnapshotVersion,
        sequence_number: i64,
        mismatched: bool,
    ) {
        // Only active targets are tracked; limbo targets never reach the cache.
        let Some(old_target_data) = self.state.target_data_by_target.get(&target_id).cloned() else {
            return;
        };

        let removed = self
            .state
            .persisted
            .target_cache
            .remove_matching_keys(change.removed_documents.iter(), target_id);
        for key in removed {
            self.remove_reference(&key, ReferenceKind::Target, sequence_number);
        }
        let added = self
            .state
            .persisted
            .target_cache
            .add_matching_keys(change.added_documents.iter(), target_id);
        for key in added {
            self.state.references.increment(&key, ReferenceKind::Target);
        }

        let mut new_target_data = old_target_data.with_sequence_number(sequence_number);
        if mismatched {
            // The cached membership diverged; resuming would skip the reset.
            new_target_data = new_target_data
                .with_resume_token(Vec::new(), SnapshotVersion::NONE)
                .with_last_limbo_free_snapshot_version(SnapshotVersion::NONE);
        } else if !change.resume_token.is_empty() {
            new_target_data = new_target_data.with_resume_token(change.resume_token.clone(), remote_version);
        }

        if should_persist_target_data(&old_target_data, &new_target_data, change) {
            self.state
                .persisted
                .target_cache
                .update_target_data(new_target_data.clone());
        }
        self.state
            .target_data_by_target
            .insert(target_id, new_target_data);
    }

    /// Writes newer documents to the remote cache and returns the ones that changed.
    fn populate_document_changes(&mut self, updates: &BTreeMap<DocumentKey, Document>) -> DocumentMap {
        let mut changed = DocumentMap::new();
        for (key, doc) in updates {
            let existing = self.state.persisted.remote_documents.get(key);

            if doc.is_no_document() && doc.version().is_none() {
                // Synthesized deletes (rejected limbo listens) carry no version and must
                // not be cached as a versioned tombstone.
                self.state.persisted.remote_documents.remove(key);
                self.state.persisted.index_manager.remove_document(key);
                changed.insert(key.clone(), doc.clone());
            } else if !existing.is_valid_document()
                || doc.version() > existing.version()
                || (doc.version() == existing.version() && existing.has_pending_writes())
            {
                self.state
                    .persisted
                    .remote_documents
                    .add(doc.clone(), doc.read_time());
                self.state.persisted.index_manager.update_document(doc);
                changed.insert(key.clone(), doc.clone());
            } else {
                log::debug!(
                    "firestore::local_store: ignoring outdated watch update for {key} (current {}, update {})",
                    existing.version(),
                    doc.version()
                );
            }
            self.state.references.mark_orphan_candidate(key);
        }
        changed
    }

    fn apply_write_to_remote_documents(&mut self, batch_result: &MutationBatchResult) -> FirestoreResult<()> {
        let batch = &batch_result.batch;
        for key in batch.keys() {
            let mut doc = self.state.persisted.remote_documents.get(&key);
            let ack_version = batch_result
                .doc_versions
                .get(&key)
                .copied()
                .ok_or_else(|| internal_error(format!("Acknowledgement is missing a version for {key}")))?;
            // A newer watch update already reflects this write.
            if doc.version() < ack_version {
                batch.apply_to_remote_document(&mut doc, batch_result)?;
                if doc.is_valid_document() {
                    self.state.persisted.index_manager.update_document(&doc);
                    self.state
                        .persisted
                        .remote_documents
                        .add(doc, batch_result.commit_version);
                }
            }
        }
        self.remove_mutation_batch(batch.batch_id)
    }

    fn remove_mutation_batch(&mut self, batch_id: i32) -> FirestoreResult<()> {
        let batch = self
            .state
            .persisted
            .mutation_queue
            .remove_mutation_batch(batch_id)?;
        let sequence_number = self.state.persisted.target_cache.next_sequence_number();
        for key in batch.keys() {
            self.remove_reference(&key, ReferenceKind::Mutation, sequence_number);
        }
        Ok(())
    }

    fn remove_reference(&mut self, key: &DocumentKey, kind: ReferenceKind, sequence_number: i64) {
        self.state.references.decrement(key, kind);
        if matches!(self.garbage_collector, GarbageCollectorSettings::Lru(_)) {
            self.state
                .persisted
                .document_sequence_numbers
                .insert(key.clone(), sequence_number);
        }
    }

    /// Eager collection: drops every orphaned document that is still unreferenced.
    fn collect_orphaned_documents(&mut self) -> usize {
        let orphans = self.state.references.take_orphans();
        let mut removed = 0;
        for key in orphans {
            if self.state.persisted.remote_documents.remove(&key).is_some() {
                self.state.persisted.index_manager.remove_document(&key);
                self.state.persisted.document_sequence_numbers.remove(&key);
                removed += 1;
            }
        }
        if removed > 0 {
            log::debug!("firestore::local_store: eagerly collected {removed} documents");
        }
        removed
    }
}

/// Persists target data when the target gains its first resume token, when the token
/// is old enough, or when membership changed.
fn should_persist_target_data(old: &TargetData, new: &TargetData, change: &TargetChange) -> bool {
    if new.resume_token.is_empty() {
        return false;
    }
    if old.resume_token.is_empty() {
        return true;
    }
    let time_delta = new.snapshot_version.timestamp().to_micros()
        - old.snapshot_version.timestamp().to_micros();
    if time_delta >= RESUME_TOKEN_MAX_AGE_MICROS {
        return true;
    }
    change.change_count() > 0
}

fn rebuild_reference_counts(state: &PersistedState) -> ReferenceCounts {
    let mut references = ReferenceCounts::default();
    for (_, keys) in state.target_cache.all_matching_keys() {
        for key in keys {
            references.increment(key, ReferenceKind::Target);
        }
    }
    for batch in state.mutation_queue.get_all_mutation_batches() {
        for key in batch.keys() {
            references.increment(&key, ReferenceKind::Mutation);
        }
    }
    references
}
