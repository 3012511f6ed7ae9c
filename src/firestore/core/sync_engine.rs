use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use futures::channel::oneshot;

use crate::firestore::core::view::{LimboDocumentChange, View};
use crate::firestore::core::{
    DelayedTask, FirestoreSettings, Query, TargetIdGenerator, TimerId, TimerRegistry, ViewSnapshot,
};
use crate::firestore::error::{
    failed_precondition, internal_error, FirestoreError, FirestoreResult,
};
use crate::firestore::local::{
    FieldIndex, GarbageCollectorSettings, LocalStore, LocalViewChanges, QueryPurpose, ReferenceSet, TargetData,
};
use crate::firestore::model::mutation::{Mutation, MutationBatchResult, BATCH_ID_UNKNOWN};
use crate::firestore::model::{Document, DocumentKey, DocumentMap, SnapshotVersion, Timestamp};
use crate::firestore::remote::{
    OnlineState, RemoteEvent, RemoteStore, RemoteStoreEvent, RemoteSyncer, StreamEvent,
    TargetChange,
};

/// Limbo targets are never persisted, so they carry no listen sequence number.
const INVALID_SEQUENCE_NUMBER: i64 = -1;

pub type WriteAcknowledgement = oneshot::Receiver<FirestoreResult<()>>;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SyncEngineConfig {
    pub limbo_resolution_timeout: Duration,
    pub max_concurrent_limbo_resolutions: usize,
    pub gc_initial_delay: Duration,
    pub gc_regular_delay: Duration,
}

impl From<&FirestoreSettings> for SyncEngineConfig {
    fn from(settings: &FirestoreSettings) -> Self {
        Self {
            limbo_resolution_timeout: settings.limbo_resolution_timeout,
            max_concurrent_limbo_resolutions: settings.max_concurrent_limbo_resolutions,
            gc_initial_delay: settings.gc_initial_delay,
            gc_regular_delay: settings.gc_regular_delay,
        }
    }
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self::from(&FirestoreSettings::default())
    }
}

/// What the sync engine reports to the event manager.
#[derive(Clone, Debug)]
pub enum SyncEngineEvent {
    Snapshots(Vec<ViewSnapshot>),
    /// The backend rejected the query; its listeners get the error.
    QueryError { query: Query, error: FirestoreError },
    OnlineStateChanged(OnlineState),
}

#[derive(Debug)]
struct QueryView {
    target_id: i32,
    view: View,
}

#[derive(Clone, Debug)]
struct LimboResolution {
    key: DocumentKey,
    /// The limbo target has reported the document, so its membership is known.
    received_document: bool,
}

/// Views and limbo bookkeeping, split out so the remote store can read it while the
/// sync engine lends it the local store.
#[derive(Debug, Default)]
struct ViewRegistry {
    query_views: BTreeMap<String, QueryView>,
    queries_by_target: BTreeMap<i32, Vec<Query>>,
    /// Limbo documents waiting for a free resolution slot, oldest first.
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, i32>,
    active_limbo_resolutions_by_target: BTreeMap<i32, LimboResolution>,
    /// Which query targets hold each limbo document.
    limbo_document_refs: ReferenceSet,
}

impl RemoteSyncer for ViewRegistry {
    fn get_remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey> {
        if let Some(resolution) = self.active_limbo_resolutions_by_target.get(&target_id) {
            return if resolution.received_document {
                BTreeSet::from([resolution.key.clone()])
            } else {
                BTreeSet::new()
            };
        }
        let mut keys = BTreeSet::new();
        for query in self.queries_by_target.get(&target_id).into_iter().flatten() {
            if let Some(query_view) = self.query_views.get(&query.canonical_id()) {
                keys.extend(query_view.view.synced_documents().iter().cloned());
            }
        }
        keys
    }
}

/// Coordinates the local store, the remote store and the live views.
///
/// Every entry point runs to completion before the next one starts; the caller provides
/// that serialization. Outcomes for listeners are queued as [`SyncEngineEvent`]s.
pub struct SyncEngine {
    local_store: LocalStore,
    remote_store: RemoteStore,
    views: ViewRegistry,
    timers: TimerRegistry,
    config: SyncEngineConfig,
    limbo_target_id_generator: TargetIdGenerator,
    mutation_callbacks: BTreeMap<i32, oneshot::Sender<FirestoreResult<()>>>,
    /// Waiters of `wait_for_pending_writes`, keyed by the highest batch id at call time.
    pending_writes_callbacks: BTreeMap<i32, Vec<oneshot::Sender<FirestoreResult<()>>>>,
    online_state: OnlineState,
    events: Vec<SyncEngineEvent>,
}

impl SyncEngine {
    pub fn new(local_store: LocalStore, remote_store: RemoteStore, config: SyncEngineConfig) -> Self {
        Self {
            local_store,
            remote_store,
            views: ViewRegistry::default(),
            timers: TimerRegistry::default(),
            config,
            limbo_target_id_generator: TargetIdGenerator::for_sync_engine(),
            mutation_callbacks: BTreeMap::new(),
            pending_writes_callbacks: BTreeMap::new(),
            online_state: OnlineState::Unknown,
            events: Vec::new(),
        }
    }

    /// Connects the remote store and schedules cache collection for the LRU policy.
    pub fn start(&mut self) -> FirestoreResult<()> {
        self.remote_store.start(&self.local_store);
        if matches!(self.local_store.garbage_collector(), GarbageCollectorSettings::Lru(_)) {
            self.timers
                .schedule(TimerId::GarbageCollection, self.config.gc_initial_delay);
        }
        self.process_remote_events()
    }

    pub fn local_store(&self) -> &LocalStore {
        &self.local_store
    }

    pub fn remote_store(&self) -> &RemoteStore {
        &self.remote_store
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state
    }

    pub fn take_events(&mut self) -> Vec<SyncEngineEvent> {
        std::mem::take(&mut self.events)
    }

    /// Timers scheduled since the last call, from the sync engine and the remote store.
    pub fn drain_scheduled(&mut self) -> Vec<DelayedTask> {
        let mut tasks = self.remote_store.drain_scheduled();
        tasks.extend(self.timers.drain_scheduled());
        tasks
    }

    /// Keys of documents currently in limbo with an active resolution.
    pub fn active_limbo_document_resolutions(&self) -> BTreeMap<DocumentKey, i32> {
        self.views.active_limbo_targets_by_key.clone()
    }

    pub fn enqueued_limbo_document_resolutions(&self) -> Vec<DocumentKey> {
        self.views.enqueued_limbo_resolutions.iter().cloned().collect()
    }

    /// Starts listening to a query the caller is not yet listening to.
    ///
    /// The initial snapshot is computed from the cache and queued right away; the backend
    /// is asked to watch the target without waiting for it.
    pub fn listen(&mut self, query: Query) -> FirestoreResult<i32> {
        let canonical_id = query.canonical_id();
        if self.views.query_views.contains_key(&canonical_id) {
            return Err(internal_error(format!("Already listening to query {canonical_id}")));
        }
        let target_data = self.local_store.allocate_target(&query)?;
        let target_id = target_data.target_id;
        let snapshot =
            self.initialize_view_and_compute_snapshot(query, target_id, &target_data.resume_token)?;
        self.events.push(SyncEngineEvent::Snapshots(vec![snapshot]));
        self.remote_store.listen(target_data);
        self.process_remote_events()?;
        Ok(target_id)
    }

    pub fn stop_listening(&mut self, query: &Query) -> FirestoreResult<()> {
        let Some(query_view) = self.views.query_views.remove(&query.canonical_id()) else {
            log::debug!("firestore::sync_engine: stop listening to unknown query");
            return Ok(());
        };
        let target_id = query_view.target_id;
        let remaining = match self.views.queries_by_target.get_mut(&target_id) {
            Some(queries) => {
                queries.retain(|other| other != query);
                queries.len()
            }
            None => 0,
        };
        if remaining == 0 {
            self.local_store.release_target(target_id)?;
            self.remote_store.unlisten(target_id);
            self.remove_and_cleanup_target(target_id, None);
        }
        self.process_remote_events()
    }

    /// Applies the write locally, raises the optimistic snapshots and queues the batch
    /// for the backend. The receiver resolves when the backend accepts or rejects it.
    pub fn write_mutations(&mut self, mutations: Vec<Mutation>) -> FirestoreResult<(i32, WriteAcknowledgement)> {
        let result = self.local_store.write_locally(mutations, Timestamp::now())?;
        let (sender, receiver) = oneshot::channel();
        self.mutation_callbacks.insert(result.batch_id, sender);
        self.emit_new_snaps_and_notify_local_store(&result.changes, None)?;
        self.remote_store.fill_write_pipeline(&self.local_store);
        self.process_remote_events()?;
        Ok((result.batch_id, receiver))
    }

    /// Resolves once every batch written so far is acknowledged or rejected.
    pub fn wait_for_pending_writes(&mut self) -> WriteAcknowledgement {
        let (sender, receiver) = oneshot::channel();
        if !self.remote_store.can_use_network() {
            log::debug!(
                "firestore::sync_engine: the network is disabled; pending writes will not complete until it is enabled"
            );
        }
        let highest = self.local_store.get_highest_unacknowledged_batch_id();
        if highest == BATCH_ID_UNKNOWN {
            let _ = sender.send(Ok(()));
        } else {
            self.pending_writes_callbacks.entry(highest).or_default().push(sender);
        }
        receiver
    }

    pub fn get_document_from_local_cache(&self, key: &DocumentKey) -> Option<Document> {
        let document = self.local_store.read_document(key);
        document.is_found_document().then_some(document)
    }

    /// Runs the query against the cache only; the snapshot is always from cache.
    pub fn get_documents_from_local_cache(&self, query: &Query) -> FirestoreResult<ViewSnapshot> {
        let result = self.local_store.execute_query(query, true);
        let mut view = View::new(query.clone(), result.remote_keys);
        let changes = view.compute_doc_changes(&result.documents, None)?;
        view.apply_changes(changes, None)?
            .snapshot
            .ok_or_else(|| internal_error("A fresh view always produces a snapshot"))
    }

    pub fn configure_field_indexes(&mut self, indexes: Vec<FieldIndex>) -> FirestoreResult<()> {
        self.local_store.configure_field_indexes(indexes)
    }

    pub fn enable_network(&mut self) -> FirestoreResult<()> {
        self.remote_store.enable_network(&self.local_store);
        self.process_remote_events()
    }

    pub fn disable_network(&mut self) -> FirestoreResult<()> {
        self.remote_store.disable_network();
        self.process_remote_events()
    }

    /// Applies a transport notification and everything it triggers.
    pub fn handle_stream_event(&mut self, event: StreamEvent) -> FirestoreResult<()> {
        match event {
            StreamEvent::WatchOpen => self.remote_store.on_watch_stream_open(),
            StreamEvent::WatchChange(change) => {
                self.remote_store
                    .on_watch_change(change, &self.views, &self.local_store)?;
            }
            StreamEvent::WatchClose(error) => self.remote_store.on_watch_stream_close(error),
            StreamEvent::WriteOpen => self.remote_store.on_write_stream_open(),
            StreamEvent::WriteHandshake { stream_token } => {
                self.remote_store
                    .on_write_handshake(stream_token, &mut self.local_store)?;
            }
            StreamEvent::WriteResponse {
                stream_token,
                commit_version,
                results,
            } => {
                self.remote_store
                    .on_write_response(stream_token, commit_version, results)?;
            }
            StreamEvent::WriteClose(error) => {
                self.remote_store
                    .on_write_stream_close(error, &mut self.local_store)?;
            }
        }
        self.process_remote_events()
    }

    /// Runs a fired timer. Stale timers are ignored.
    pub fn handle_timer(&mut self, task: DelayedTask) -> FirestoreResult<()> {
        if !self.remote_store.handle_timer(&task) {
            match task.timer_id {
                TimerId::LimboResolution(target_id) => {
                    if self.timers.fire(&task) {
                        self.handle_limbo_timeout(target_id)?;
                    }
                }
                TimerId::GarbageCollection => {
                    if self.timers.fire(&task) {
                        let results = self.local_store.collect_garbage()?;
                        log::debug!("firestore::sync_engine: garbage collection finished: {results:?}");
                        self.timers
                            .schedule(TimerId::GarbageCollection, self.config.gc_regular_delay);
                    }
                }
                _ => {}
            }
        }
        self.process_remote_events()
    }

    /// Stops the network and fails every outstanding write acknowledgement.
    pub fn shutdown(&mut self) -> FirestoreResult<()> {
        self.remote_store.shutdown();
        self.timers.cancel_all();
        let terminated = || failed_precondition("The client has been terminated");
        for (_, sender) in std::mem::take(&mut self.mutation_callbacks) {
            let _ = sender.send(Err(terminated()));
        }
        for (_, senders) in std::mem::take(&mut self.pending_writes_callbacks) {
            for sender in senders {
                let _ = sender.send(Err(terminated()));
            }
        }
        self.remote_store.take_events();
        self.local_store.shutdown()
    }

    /// Handles every event the remote store raised. A failing event does not stop the
    /// ones after it; the first failure is returned once all were handled.
    fn process_remote_events(&mut self) -> FirestoreResult<()> {
        let mut first_error = None;
        loop {
            let events = self.remote_store.take_events();
            if events.is_empty() {
                return first_error.map_or(Ok(()), Err);
            }
            for event in events {
                let result = match event {
                    RemoteStoreEvent::RemoteEvent(remote_event) => self.handle_remote_event(remote_event),
                    RemoteStoreEvent::RejectedListen { target_id, error } => {
                        self.handle_rejected_listen(target_id, error)
                    }
                    RemoteStoreEvent::SuccessfulWrite(result) => self.handle_successful_write(result),
                    RemoteStoreEvent::RejectedWrite { batch_id, error } => {
                        self.handle_rejected_write(batch_id, error)
                    }
                    RemoteStoreEvent::OnlineStateChanged(state) => self.handle_online_state_change(state),
                };
                if let Err(err) = result {
                    log::warn!("firestore::sync_engine: failed to handle a remote store event: {err}");
                    first_error.get_or_insert(err);
                }
            }
        }
    }

    fn handle_remote_event(&mut self, event: RemoteEvent) -> FirestoreResult<()> {
        for (target_id, change) in &event.target_changes {
            let Some(resolution) = self.views.active_limbo_resolutions_by_target.get_mut(target_id) else {
                continue;
            };
            // A limbo target watches one document, so it changes by at most one key.
            if change.change_count() > 1 {
                return Err(internal_error("Limbo resolution for a single document changed multiple documents"));
            }
            if !change.added_documents.is_empty() {
                resolution.received_document = true;
            } else if !change.modified_documents.is_empty() {
                if !resolution.received_document {
                    return Err(internal_error("Received change for limbo target document without add"));
                }
            } else if !change.removed_documents.is_empty() {
                if !resolution.received_document {
                    return Err(internal_error("Received remove for limbo target document without add"));
                }
                resolution.received_document = false;
            }
        }
        let changes = self.local_store.apply_remote_event(&event)?;
        self.emit_new_snaps_and_notify_local_store(&changes, Some(&event))
    }

    fn handle_rejected_listen(&mut self, target_id: i32, error: FirestoreError) -> FirestoreResult<()> {
        if self.views.active_limbo_resolutions_by_target.contains_key(&target_id) {
            // The backend will not tell us about the document; assume it is gone.
            log::debug!("firestore::sync_engine: limbo resolution for target {target_id} rejected: {error}");
            return self.resolve_limbo_as_deleted(target_id);
        }
        self.local_store.release_target(target_id)?;
        self.remove_and_cleanup_target(target_id, Some(error));
        Ok(())
    }

    fn handle_limbo_timeout(&mut self, target_id: i32) -> FirestoreResult<()> {
        let Some(resolution) = self.views.active_limbo_resolutions_by_target.get(&target_id) else {
            return Ok(());
        };
        log::warn!(
            "firestore::sync_engine: limbo resolution for {:?} timed out; treating it as deleted",
            resolution.key
        );
        self.resolve_limbo_as_deleted(target_id)
    }

    fn resolve_limbo_as_deleted(&mut self, limbo_target_id: i32) -> FirestoreResult<()> {
        let Some(resolution) = self.views.active_limbo_resolutions_by_target.get(&limbo_target_id) else {
            return Ok(());
        };
        let key = resolution.key.clone();
        self.remove_limbo_target(&key);

        let mut event = RemoteEvent {
            snapshot_version: SnapshotVersion::NONE,
            ..RemoteEvent::default()
        };
        event
            .document_updates
            .insert(key.clone(), Document::new_no_document(key.clone(), SnapshotVersion::NONE));
        event.resolved_limbo_documents.insert(key);
        self.handle_remote_event(event)
    }

    fn handle_successful_write(&mut self, result: MutationBatchResult) -> FirestoreResult<()> {
        let batch_id = result.batch.batch_id;
        // Pending writes for the batch are gone from the cache once this returns.
        let changes = match self.local_store.acknowledge_batch(&result) {
            Ok(changes) => changes,
            Err(err) => {
                self.remote_store
                    .defer_write_outcome(RemoteStoreEvent::SuccessfulWrite(result));
                return Err(err);
            }
        };
        self.remote_store.settle_write(batch_id)?;
        log::debug!("firestore::sync_engine: batch {batch_id} acknowledged");
        self.notify_user(batch_id, Ok(()));
        self.resolve_pending_write_callbacks(batch_id);
        self.emit_new_snaps_and_notify_local_store(&changes, None)?;
        self.remote_store.fill_write_pipeline(&self.local_store);
        Ok(())
    }

    fn handle_rejected_write(&mut self, batch_id: i32, error: FirestoreError) -> FirestoreResult<()> {
        let changes = match self.local_store.reject_batch(batch_id) {
            Ok(changes) => changes,
            Err(err) => {
                self.remote_store
                    .defer_write_outcome(RemoteStoreEvent::RejectedWrite { batch_id, error });
                return Err(err);
            }
        };
        self.remote_store.settle_write(batch_id)?;
        self.notify_user(batch_id, Err(error));
        self.resolve_pending_write_callbacks(batch_id);
        self.emit_new_snaps_and_notify_local_store(&changes, None)?;
        self.remote_store.fill_write_pipeline(&self.local_store);
        Ok(())
    }

    fn handle_online_state_change(&mut self, online_state: OnlineState) -> FirestoreResult<()> {
        self.online_state = online_state;
        let mut snapshots = Vec::new();
        for query_view in self.views.query_views.values_mut() {
            let change = query_view.view.apply_online_state_change(online_state)?;
            if !change.limbo_changes.is_empty() {
                return Err(internal_error("Online state changes must not affect limbo documents"));
            }
            snapshots.extend(change.snapshot);
        }
        if !snapshots.is_empty() {
            self.events.push(SyncEngineEvent::Snapshots(snapshots));
        }
        self.events.push(SyncEngineEvent::OnlineStateChanged(online_state));
        Ok(())
    }

    fn initialize_view_and_compute_snapshot(
        &mut self,
        query: Query,
        target_id: i32,
        resume_token: &[u8],
    ) -> FirestoreResult<ViewSnapshot> {
        let result = self.local_store.execute_query(&query, true);

        // A query sharing its target with a synced view is just as current.
        let current = self
            .views
            .queries_by_target
            .get(&target_id)
            .and_then(|queries| queries.first())
            .and_then(|mirror| self.views.query_views.get(&mirror.canonical_id()))
            .is_some_and(|mirror| mirror.view.is_synced());
        let mut synthesized = TargetChange::create_synthesized(current);
        synthesized.resume_token = resume_token.to_vec();

        let mut view = View::new(query.clone(), result.remote_keys);
        let changes = view.compute_doc_changes(&result.documents, None)?;
        let view_change = view.apply_changes(changes, Some(&synthesized))?;
        self.update_tracked_limbos(target_id, view_change.limbo_changes);

        self.views
            .query_views
            .insert(query.canonical_id(), QueryView { target_id, view });
        self.views
            .queries_by_target
            .entry(target_id)
            .or_default()
            .push(query);
        view_change
            .snapshot
            .ok_or_else(|| internal_error("A fresh view always produces a snapshot"))
    }

    /// Recomputes every view against the changed documents and raises the snapshots.
    fn emit_new_snaps_and_notify_local_store(
        &mut self,
        changes: &DocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<()> {
        let mut snapshots = Vec::new();
        let mut view_changes = Vec::new();
        let mut limbo_updates = Vec::new();

        for query_view in self.views.query_views.values_mut() {
            let view = &mut query_view.view;
            let mut doc_changes = view.compute_doc_changes(changes, None)?;
            if doc_changes.needs_refill() {
                // Documents left a full limit window; documents past the limit that only
                // live in the cache may now belong in it.
                let result = self.local_store.execute_query(view.query(), false);
                doc_changes = view.compute_doc_changes(&result.documents, Some(doc_changes))?;
            }
            let target_change = remote_event.and_then(|event| event.target_changes.get(&query_view.target_id));
            let view_change = view.apply_changes(doc_changes, target_change)?;
            limbo_updates.push((query_view.target_id, view_change.limbo_changes));
            if let Some(snapshot) = view_change.snapshot {
                view_changes.push(LocalViewChanges::from_view_snapshot(query_view.target_id, &snapshot));
                snapshots.push(snapshot);
            }
        }

        for (target_id, limbo_changes) in limbo_updates {
            self.update_tracked_limbos(target_id, limbo_changes);
        }
        if !snapshots.is_empty() {
            self.events.push(SyncEngineEvent::Snapshots(snapshots));
        }
        self.local_store.notify_local_view_changes(&view_changes)
    }

    fn remove_and_cleanup_target(&mut self, target_id: i32, error: Option<FirestoreError>) {
        for query in self.views.queries_by_target.remove(&target_id).unwrap_or_default() {
            self.views.query_views.remove(&query.canonical_id());
            if let Some(error) = &error {
                self.events.push(SyncEngineEvent::QueryError {
                    query,
                    error: error.clone(),
                });
            }
        }

        let limbo_keys = self
            .views
            .limbo_document_refs
            .remove_references_for_id(target_id);
        for key in limbo_keys {
            if !self.views.limbo_document_refs.contains_key(&key) {
                // Nothing else needs this document resolved.
                self.remove_limbo_target(&key);
            }
        }
    }

    fn update_tracked_limbos(&mut self, target_id: i32, limbo_changes: Vec<LimboDocumentChange>) {
        for change in limbo_changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    self.views
                        .limbo_document_refs
                        .add_reference(key.clone(), target_id);
                    self.track_limbo_change(key);
                }
                LimboDocumentChange::Removed(key) => {
                    log::debug!("firestore::sync_engine: document no longer in limbo: {key:?}");
                    self.views
                        .limbo_document_refs
                        .remove_reference(&key, target_id);
                    if !self.views.limbo_document_refs.contains_key(&key) {
                        self.remove_limbo_target(&key);
                    }
                }
            }
        }
    }

    fn track_limbo_change(&mut self, key: DocumentKey) {
        if self.views.active_limbo_targets_by_key.contains_key(&key)
            || self.views.enqueued_limbo_resolutions.contains(&key)
        {
            return;
        }
        log::debug!("firestore::sync_engine: new document in limbo: {key:?}");
        self.views.enqueued_limbo_resolutions.push_back(key);
        self.pump_enqueued_limbo_resolutions();
    }

    /// Starts queued limbo resolutions while there is capacity.
    fn pump_enqueued_limbo_resolutions(&mut self) {
        while self.views.active_limbo_targets_by_key.len() < self.config.max_concurrent_limbo_resolutions {
            let Some(key) = self.views.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            let limbo_target_id = self.limbo_target_id_generator.next_id();
            self.views.active_limbo_resolutions_by_target.insert(
                limbo_target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            self.views
                .active_limbo_targets_by_key
                .insert(key.clone(), limbo_target_id);
            self.remote_store.listen(TargetData::new(
                Query::for_document(&key),
                limbo_target_id,
                INVALID_SEQUENCE_NUMBER,
                QueryPurpose::LimboResolution,
            ));
            self.timers.schedule(
                TimerId::LimboResolution(limbo_target_id),
                self.config.limbo_resolution_timeout,
            );
        }
    }

    fn remove_limbo_target(&mut self, key: &DocumentKey) {
        self.views.enqueued_limbo_resolutions.retain(|queued| queued != key);
        if let Some(limbo_target_id) = self.views.active_limbo_targets_by_key.remove(key) {
            self.remote_store.unlisten(limbo_target_id);
            self.views
                .active_limbo_resolutions_by_target
                .remove(&limbo_target_id);
            self.timers.cancel(TimerId::LimboResolution(limbo_target_id));
            self.pump_enqueued_limbo_resolutions();
        }
    }

    fn notify_user(&mut self, batch_id: i32, result: FirestoreResult<()>) {
        if let Some(sender) = self.mutation_callbacks.remove(&batch_id) {
            // The writer may have stopped waiting.
            let _ = sender.send(result);
        }
    }

    fn resolve_pending_write_callbacks(&mut self, batch_id: i32) {
        if let Some(senders) = self.pending_writes_callbacks.remove(&batch_id) {
            for sender in senders {
                let _ = sender.send(Ok(()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{Direction, FilterOperator};
    use crate::firestore::core::ChangeType;
    use crate::firestore::error::{permission_denied, FirestoreErrorCode};
    use crate::firestore::local::{MemoryPersistence, Persistence};
    use crate::firestore::model::mutation::MutationResult;
    use crate::firestore::remote::{
        DocumentChange, ExistenceFilterChange, RemoteStoreConfig, StreamRequest, TargetChangeState, WatchChange,
        WatchTargetChange,
    };
    use crate::firestore::test_support::{doc, fields, key, recording_connection, FlakyPersistence, RequestLog};
    use crate::firestore::value::{FirestoreValue, ObjectValue};

    struct Harness {
        engine: SyncEngine,
        requests: RequestLog,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(SyncEngineConfig::default())
        }

        fn with_config(config: SyncEngineConfig) -> Self {
            Self::with_parts(Box::new(MemoryPersistence::new()), config)
        }

        fn with_persistence(persistence: FlakyPersistence) -> Self {
            Self::with_parts(Box::new(persistence), SyncEngineConfig::default())
        }

        fn with_parts(persistence: Box<dyn Persistence>, config: SyncEngineConfig) -> Self {
            let (connection, requests) = recording_connection();
            let local_store = LocalStore::new(persistence, GarbageCollectorSettings::Eager).unwrap();
            let remote_store = RemoteStore::new(Box::new(connection), RemoteStoreConfig::default());
            let mut engine = SyncEngine::new(local_store, remote_store, config);
            engine.start().unwrap();
            Self { engine, requests }
        }

        fn requests(&self) -> Vec<StreamRequest> {
            self.requests.drain()
        }

        fn snapshots(&mut self) -> Vec<ViewSnapshot> {
            self.engine
                .take_events()
                .into_iter()
                .filter_map(|event| match event {
                    SyncEngineEvent::Snapshots(snapshots) => Some(snapshots),
                    _ => None,
                })
                .flatten()
                .collect()
        }

        fn watch(&mut self, change: WatchChange) {
            self.engine
                .handle_stream_event(StreamEvent::WatchChange(change))
                .unwrap();
        }

        fn open_watch(&mut self) {
            self.engine.handle_stream_event(StreamEvent::WatchOpen).unwrap();
        }

        fn ack_target(&mut self, target_id: i32, docs: &[Document], version: i64) {
            self.watch(WatchChange::TargetChange(WatchTargetChange::new(
                TargetChangeState::Add,
                vec![target_id],
            )));
            for doc in docs {
                self.watch(document_change(doc.clone(), target_id));
            }
            self.watch(WatchChange::TargetChange(
                WatchTargetChange::new(TargetChangeState::Current, vec![target_id])
                    .with_resume_token(vec![version as u8]),
            ));
            self.global_snapshot(version);
        }

        fn open_write(&mut self, stream_token: u8) {
            self.engine.handle_stream_event(StreamEvent::WriteOpen).unwrap();
            self.engine
                .handle_stream_event(StreamEvent::WriteHandshake {
                    stream_token: vec![stream_token],
                })
                .unwrap();
        }

        fn write_response(&mut self, version: i64) -> FirestoreResult<()> {
            self.engine.handle_stream_event(StreamEvent::WriteResponse {
                stream_token: vec![version as u8],
                commit_version: SnapshotVersion::from_micros(version),
                results: vec![MutationResult::new(SnapshotVersion::from_micros(version), Vec::new())],
            })
        }

        /// Batch ids of the writes sent since the last call, in send order.
        fn sent_batches(&self) -> Vec<i32> {
            self.requests
                .drain()
                .into_iter()
                .filter_map(|request| match request {
                    StreamRequest::Write { batch_id, .. } => Some(batch_id),
                    _ => None,
                })
                .collect()
        }

        fn global_snapshot(&mut self, version: i64) {
            self.watch(WatchChange::TargetChange(WatchTargetChange::global_snapshot(
                SnapshotVersion::from_micros(version),
                Vec::new(),
            )));
        }
    }

    fn document_change(doc: Document, target_id: i32) -> WatchChange {
        WatchChange::DocumentChange(DocumentChange {
            updated_target_ids: vec![target_id],
            removed_target_ids: Vec::new(),
            document: doc,
        })
    }

    fn ids(snapshot: &ViewSnapshot) -> Vec<String> {
        snapshot
            .documents()
            .keys()
            .map(|key| key.id().to_string())
            .collect()
    }

    #[test]
    fn listen_raises_cached_snapshot_and_watches_target() {
        let mut harness = Harness::new();
        let query = Query::collection("rooms").unwrap();
        let target_id = harness.engine.listen(query.clone()).unwrap();

        let snapshots = harness.snapshots();
        assert_eq!(snapshots.len(), 1);
        assert!(snapshots[0].from_cache());
        assert!(snapshots[0].documents().is_empty());
        assert_eq!(harness.requests(), vec![StreamRequest::OpenWatch]);

        harness.open_watch();
        let requests = harness.requests();
        assert!(matches!(requests.as_slice(), [StreamRequest::Watch(target)] if target.target_id == target_id));

        harness.ack_target(target_id, &[doc("rooms/a", 5, &[("n", 1)])], 5);
        let snapshots = harness.snapshots();
        let last = snapshots.last().unwrap();
        assert_eq!(ids(last), vec!["a"]);
        assert!(!last.from_cache());
    }

    #[test]
    fn offline_write_then_acknowledgement() {
        let mut harness = Harness::new();
        let query = Query::collection("rooms").unwrap();
        harness.engine.listen(query).unwrap();
        harness.snapshots();

        let (batch_id, mut ack) = harness
            .engine
            .write_mutations(vec![Mutation::set(key("rooms/d"), fields(&[("name", 1)])).unwrap()])
            .unwrap();
        let snapshots = harness.snapshots();
        let local = snapshots.last().unwrap();
        assert_eq!(ids(local), vec!["d"]);
        assert!(local.has_pending_writes());

        harness
            .engine
            .handle_stream_event(StreamEvent::WriteOpen)
            .unwrap();
        harness
            .engine
            .handle_stream_event(StreamEvent::WriteHandshake { stream_token: vec![1] })
            .unwrap();
        harness
            .engine
            .handle_stream_event(StreamEvent::WriteResponse {
                stream_token: vec![2],
                commit_version: SnapshotVersion::from_micros(20),
                results: vec![MutationResult::new(SnapshotVersion::from_micros(20), Vec::new())],
            })
            .unwrap();

        assert!(matches!(ack.try_recv(), Ok(Some(Ok(())))));
        let snapshots = harness.snapshots();
        let acked = snapshots.last().unwrap();
        assert_eq!(ids(acked), vec!["d"]);
        assert!(!acked.has_pending_writes());
        assert_eq!(
            acked.documents().get(&key("rooms/d")).unwrap().data(),
            local.documents().get(&key("rooms/d")).unwrap().data()
        );
        assert_eq!(harness.engine.local_store().get_highest_unacknowledged_batch_id(), BATCH_ID_UNKNOWN);
        assert!(batch_id > 0);
    }

    #[test]
    fn rejected_write_reverts_and_reports_error() {
        let mut harness = Harness::new();
        let (_, mut ack) = harness
            .engine
            .write_mutations(vec![Mutation::delete(key("rooms/a"))])
            .unwrap();
        let mut pending = harness.engine.wait_for_pending_writes();

        harness.engine.handle_stream_event(StreamEvent::WriteOpen).unwrap();
        harness
            .engine
            .handle_stream_event(StreamEvent::WriteHandshake { stream_token: vec![1] })
            .unwrap();
        harness
            .engine
            .handle_stream_event(StreamEvent::WriteClose(Some(permission_denied("denied"))))
            .unwrap();

        let err = ack.try_recv().unwrap().unwrap().unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::PermissionDenied);
        assert!(matches!(pending.try_recv(), Ok(Some(Ok(())))));
    }

    #[test]
    fn rejected_listen_reports_query_error() {
        let mut harness = Harness::new();
        let query = Query::collection("secret").unwrap();
        let target_id = harness.engine.listen(query.clone()).unwrap();
        harness.open_watch();
        harness.engine.take_events();

        harness.watch(WatchChange::TargetChange(
            WatchTargetChange::new(TargetChangeState::Remove, vec![target_id])
                .with_cause(permission_denied("no access")),
        ));
        let events = harness.engine.take_events();
        assert!(events.iter().any(|event| matches!(
            event,
            SyncEngineEvent::QueryError { query: failed, .. } if failed == &query
        )));
        // The query can be listened to again.
        harness.engine.listen(query).unwrap();
    }

    #[test]
    fn limit_query_evicts_highest_member_on_remote_update() {
        let mut harness = Harness::new();
        let query = Query::collection("items")
            .unwrap()
            .where_field("count", FilterOperator::LessThanOrEqual, FirestoreValue::from_integer(5))
            .unwrap()
            .order_by("count", Direction::Ascending)
            .unwrap()
            .limit_to_first(3);
        let target_id = harness.engine.listen(query).unwrap();
        harness.open_watch();
        harness.ack_target(
            target_id,
            &[
                doc("items/a", 1, &[("count", 1)]),
                doc("items/b", 1, &[("count", 3)]),
                doc("items/c", 1, &[("count", 4)]),
            ],
            10,
        );
        harness.snapshots();

        harness.watch(document_change(doc("items/d", 11, &[("count", 2)]), target_id));
        harness.watch(document_change(doc("items/c", 11, &[("count", 4)]), target_id));
        harness.global_snapshot(11);
        let snapshots = harness.snapshots();
        let last = snapshots.last().unwrap();
        assert_eq!(ids(last), vec!["a", "d", "b"]);
        let changes: Vec<(ChangeType, &str)> = last
            .changes()
            .iter()
            .map(|change| (change.change_type, change.document.key().id()))
            .collect();
        assert_eq!(changes, vec![(ChangeType::Removed, "c"), (ChangeType::Added, "d")]);
    }

    #[test]
    fn existence_filter_mismatch_relistens_target() {
        let mut harness = Harness::new();
        let query = Query::collection("rooms").unwrap();
        let target_id = harness.engine.listen(query).unwrap();
        harness.open_watch();
        harness.ack_target(
            target_id,
            &[doc("rooms/a", 5, &[]), doc("rooms/b", 5, &[])],
            5,
        );
        harness.requests();

        harness.watch(WatchChange::ExistenceFilter(ExistenceFilterChange {
            target_id,
            count: 1,
        }));
        harness.global_snapshot(6);
        let requests = harness.requests();
        assert!(requests.contains(&StreamRequest::Unwatch(target_id)));
        assert!(requests.iter().any(|request| matches!(
            request,
            StreamRequest::Watch(target)
                if target.target_id == target_id
                    && target.purpose == QueryPurpose::ExistenceFilterMismatch
                    && target.resume_token.is_empty()
        )));
    }

    #[test]
    fn unconfirmed_document_is_resolved_through_limbo() {
        let mut harness = Harness::with_config(SyncEngineConfig {
            max_concurrent_limbo_resolutions: 1,
            ..SyncEngineConfig::default()
        });
        let query = Query::collection("rooms").unwrap();
        let target_id = harness.engine.listen(query).unwrap();
        harness.open_watch();
        harness.ack_target(target_id, &[doc("rooms/a", 5, &[]), doc("rooms/b", 5, &[])], 5);
        harness.requests();

        // The backend resets the target and only reports `a`; `b` is now in limbo.
        harness.watch(WatchChange::TargetChange(WatchTargetChange::new(
            TargetChangeState::Reset,
            vec![target_id],
        )));
        harness.watch(document_change(doc("rooms/a", 6, &[]), target_id));
        harness.watch(WatchChange::TargetChange(WatchTargetChange::new(
            TargetChangeState::Current,
            vec![target_id],
        )));
        harness.global_snapshot(6);

        let active = harness.engine.active_limbo_document_resolutions();
        let limbo_target = *active.get(&key("rooms/b")).unwrap();
        assert_eq!(limbo_target % 2, 1);
        assert!(harness.snapshots().last().unwrap().from_cache());
        assert!(harness.requests().iter().any(|request| matches!(
            request,
            StreamRequest::Watch(target)
                if target.target_id == limbo_target && target.purpose == QueryPurpose::LimboResolution
        )));

        // The limbo target comes back current without the document: it was deleted.
        harness.watch(WatchChange::TargetChange(WatchTargetChange::new(
            TargetChangeState::Add,
            vec![limbo_target],
        )));
        harness.watch(WatchChange::TargetChange(WatchTargetChange::new(
            TargetChangeState::Current,
            vec![limbo_target],
        )));
        harness.global_snapshot(7);

        let last = harness.snapshots().pop().unwrap();
        assert_eq!(ids(&last), vec!["a"]);
        assert!(!last.from_cache());
        assert!(harness.engine.active_limbo_document_resolutions().is_empty());
    }

    #[test]
    fn limbo_timeout_treats_document_as_deleted() {
        let mut harness = Harness::new();
        let query = Query::collection("rooms").unwrap();
        let target_id = harness.engine.listen(query).unwrap();
        harness.open_watch();
        harness.ack_target(target_id, &[doc("rooms/a", 5, &[]), doc("rooms/b", 5, &[])], 5);
        harness.watch(WatchChange::TargetChange(WatchTargetChange::new(
            TargetChangeState::Reset,
            vec![target_id],
        )));
        harness.watch(document_change(doc("rooms/a", 6, &[]), target_id));
        harness.watch(WatchChange::TargetChange(WatchTargetChange::new(
            TargetChangeState::Current,
            vec![target_id],
        )));
        harness.global_snapshot(6);
        harness.snapshots();

        let timeout = harness
            .engine
            .drain_scheduled()
            .into_iter()
            .find(|task| matches!(task.timer_id, TimerId::LimboResolution(_)))
            .unwrap();
        harness.engine.handle_timer(timeout).unwrap();

        let last = harness.snapshots().pop().unwrap();
        assert_eq!(ids(&last), vec!["a"]);
        assert!(harness.engine.active_limbo_document_resolutions().is_empty());
    }

    #[test]
    fn going_offline_marks_views_from_cache() {
        let mut harness = Harness::new();
        let query = Query::collection("rooms").unwrap();
        let target_id = harness.engine.listen(query).unwrap();
        harness.open_watch();
        harness.ack_target(target_id, &[doc("rooms/a", 5, &[])], 5);
        harness.snapshots();

        harness
            .engine
            .handle_stream_event(StreamEvent::WatchClose(Some(
                crate::firestore::error::unavailable("network down"),
            )))
            .unwrap();
        harness.engine.disable_network().unwrap();
        let events = harness.engine.take_events();
        assert!(events
            .iter()
            .any(|event| matches!(event, SyncEngineEvent::OnlineStateChanged(OnlineState::Offline))));
        let from_cache = events.iter().any(|event| match event {
            SyncEngineEvent::Snapshots(snapshots) => snapshots.iter().any(|snapshot| snapshot.from_cache()),
            _ => false,
        });
        assert!(from_cache);
    }

    #[test]
    fn set_then_patch_merges_in_local_cache() {
        let mut harness = Harness::new();
        harness
            .engine
            .write_mutations(vec![Mutation::set(key("rooms/d"), fields(&[("a", 1)])).unwrap()])
            .unwrap();
        let mut patch = BTreeMap::new();
        patch.insert(
            crate::firestore::model::FieldPath::from_dot_separated("b").unwrap(),
            FirestoreValue::from_integer(2),
        );
        harness
            .engine
            .write_mutations(vec![Mutation::update(key("rooms/d"), patch).unwrap()])
            .unwrap();

        let document = harness
            .engine
            .get_document_from_local_cache(&key("rooms/d"))
            .unwrap();
        assert_eq!(document.data(), &ObjectValue::from_map(fields(&[("a", 1), ("b", 2)])));
        assert!(document.has_local_mutations());

        let snapshot = harness
            .engine
            .get_documents_from_local_cache(&Query::collection("rooms").unwrap())
            .unwrap();
        assert!(snapshot.from_cache());
        assert_eq!(ids(&snapshot), vec!["d"]);
    }

    #[test]
    fn failed_release_does_not_drop_later_rejections() {
        let persistence = FlakyPersistence::default();
        let mut harness = Harness::with_persistence(persistence.clone());
        let first = Query::collection("a").unwrap();
        let second = Query::collection("b").unwrap();
        let first_target = harness.engine.listen(first.clone()).unwrap();
        let second_target = harness.engine.listen(second.clone()).unwrap();
        harness.open_watch();
        harness.engine.take_events();

        // Releasing the first target fails; the second rejection is still reported.
        persistence.fail_next(1);
        let result = harness.engine.handle_stream_event(StreamEvent::WatchChange(WatchChange::TargetChange(
            WatchTargetChange::new(TargetChangeState::Remove, vec![first_target, second_target])
                .with_cause(permission_denied("no access")),
        )));
        assert!(result.is_err());
        let events = harness.engine.take_events();
        assert!(events.iter().any(|event| matches!(
            event,
            SyncEngineEvent::QueryError { query, .. } if query == &second
        )));
        assert!(!events.iter().any(|event| matches!(
            event,
            SyncEngineEvent::QueryError { query, .. } if query == &first
        )));
    }

    #[test]
    fn failed_acknowledgement_keeps_batch_until_applied() {
        let persistence = FlakyPersistence::default();
        let mut harness = Harness::with_persistence(persistence.clone());
        let (first, mut first_ack) = harness
            .engine
            .write_mutations(vec![Mutation::delete(key("rooms/a"))])
            .unwrap();
        harness.open_write(1);
        assert_eq!(harness.sent_batches(), vec![first]);

        persistence.fail_next(1);
        assert!(harness.write_response(10).is_err());
        assert!(matches!(first_ack.try_recv(), Ok(None)));
        assert_eq!(harness.engine.remote_store.write_pipeline_len(), 1);
        assert_eq!(harness.engine.local_store().get_highest_unacknowledged_batch_id(), first);

        // The answered batch is not resent; its outcome is applied ahead of the next one.
        let (second, mut second_ack) = harness
            .engine
            .write_mutations(vec![Mutation::delete(key("rooms/b"))])
            .unwrap();
        assert_eq!(harness.sent_batches(), vec![second]);
        harness.write_response(11).unwrap();
        assert!(matches!(first_ack.try_recv(), Ok(Some(Ok(())))));
        assert!(matches!(second_ack.try_recv(), Ok(Some(Ok(())))));
        assert_eq!(harness.engine.remote_store.write_pipeline_len(), 0);
        assert_eq!(
            harness.engine.local_store().get_highest_unacknowledged_batch_id(),
            BATCH_ID_UNKNOWN
        );
    }

    #[test]
    fn pipelined_batches_resend_in_order_after_stream_failures() {
        let mut harness = Harness::new();
        let mut batches = Vec::new();
        for path in ["rooms/a", "rooms/b", "rooms/c"] {
            batches.push(
                harness
                    .engine
                    .write_mutations(vec![Mutation::delete(key(path))])
                    .unwrap(),
            );
        }
        let ids: Vec<i32> = batches.iter().map(|(batch_id, _)| *batch_id).collect();
        harness.open_write(1);
        assert_eq!(harness.sent_batches(), ids);

        // A transient failure resends the whole pipeline after backoff.
        harness
            .engine
            .handle_stream_event(StreamEvent::WriteClose(Some(crate::firestore::error::unavailable(
                "reset",
            ))))
            .unwrap();
        let backoff = harness
            .engine
            .drain_scheduled()
            .into_iter()
            .find(|task| task.timer_id == TimerId::WriteStreamConnectionBackoff)
            .unwrap();
        harness.engine.handle_timer(backoff).unwrap();
        assert_eq!(harness.requests(), vec![StreamRequest::OpenWrite]);
        harness.open_write(2);
        assert_eq!(harness.sent_batches(), ids);

        // A permanent failure rejects the head batch and resends the rest right away.
        harness
            .engine
            .handle_stream_event(StreamEvent::WriteClose(Some(permission_denied("denied"))))
            .unwrap();
        let err = batches[0].1.try_recv().unwrap().unwrap().unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::PermissionDenied);
        assert_eq!(harness.requests(), vec![StreamRequest::OpenWrite]);
        harness.open_write(3);
        assert_eq!(harness.sent_batches(), ids[1..].to_vec());

        harness.write_response(20).unwrap();
        harness.write_response(21).unwrap();
        for (_, ack) in &mut batches[1..] {
            assert!(matches!(ack.try_recv(), Ok(Some(Ok(())))));
        }
        assert_eq!(harness.engine.remote_store.write_pipeline_len(), 0);
    }
}
