use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use crate::firestore::core::{DelayedTask, TimerId, TimerRegistry};
use crate::firestore::error::{
    internal_error, is_permanent_error, is_permanent_write_error, FirestoreError, FirestoreResult,
};
use crate::firestore::local::{LocalStore, QueryPurpose, TargetData};
use crate::firestore::model::mutation::{
    MutationBatch, MutationBatchResult, MutationResult, BATCH_ID_UNKNOWN,
};
use crate::firestore::model::{DocumentKey, SnapshotVersion};
use crate::firestore::remote::connection::RemoteConnection;
use crate::firestore::remote::online_state_tracker::{OnlineState, OnlineStateTracker};
use crate::firestore::remote::persistent_stream::{PersistentStream, StreamKind};
use crate::firestore::remote::remote_event::RemoteEvent;
use crate::firestore::remote::remote_syncer::RemoteSyncer;
use crate::firestore::remote::watch_change::{TargetChangeState, WatchChange};
use crate::firestore::remote::watch_change_aggregator::{
    TargetMetadataProvider, WatchChangeAggregator,
};
use crate::util::BackoffSettings;

/// Batches sent to the backend and not yet acknowledged, at most.
const MAX_PENDING_WRITES: usize = 10;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_ONLINE_STATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Reasons the remote store is not using the network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    Shutdown,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RemoteStoreConfig {
    pub backoff: BackoffSettings,
    /// A stream with nothing to do closes after this long.
    pub idle_timeout: Duration,
    /// How long the client stays in `Unknown` before assuming it is offline.
    pub online_state_timeout: Duration,
}

impl Default for RemoteStoreConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffSettings::default(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            online_state_timeout: DEFAULT_ONLINE_STATE_TIMEOUT,
        }
    }
}

/// What the remote store reports to the sync engine.
#[derive(Debug, Clone)]
pub enum RemoteStoreEvent {
    RemoteEvent(RemoteEvent),
    /// The backend refused the listen; the target is no longer watched.
    RejectedListen { target_id: i32, error: FirestoreError },
    SuccessfulWrite(MutationBatchResult),
    /// The backend refused the batch with a permanent error.
    RejectedWrite { batch_id: i32, error: FirestoreError },
    OnlineStateChanged(OnlineState),
}

/// Metadata view combining the store's listen targets with the syncer's remote keys.
struct ListenTargetMetadata<'a> {
    listen_targets: &'a BTreeMap<i32, TargetData>,
    syncer: &'a dyn RemoteSyncer,
}

impl TargetMetadataProvider for ListenTargetMetadata<'_> {
    fn get_remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey> {
        self.syncer.get_remote_keys_for_target(target_id)
    }

    fn get_target_data_for_target(&self, target_id: i32) -> Option<&TargetData> {
        self.listen_targets.get(&target_id)
    }
}

/// Owns the watch and write streams.
///
/// Translates listens into watch requests, folds watch messages into remote events,
/// and feeds pending mutation batches to the write stream in order. Everything it
/// learns is queued as [`RemoteStoreEvent`]s for the caller to drain.
pub struct RemoteStore {
    connection: Box<dyn RemoteConnection>,
    timers: TimerRegistry,
    /// Targets that should be watched, with their latest resume tokens.
    listen_targets: BTreeMap<i32, TargetData>,
    watch_stream: PersistentStream,
    write_stream: PersistentStream,
    /// Present while a watch stream is started.
    watch_change_aggregator: Option<WatchChangeAggregator>,
    online_state_tracker: OnlineStateTracker,
    /// Batches handed to the write stream, oldest first.
    write_pipeline: VecDeque<MutationBatch>,
    /// Leading pipeline batches the backend has answered whose outcome the local store
    /// has not applied yet. They leave the pipeline in `settle_write` and are never resent.
    answered_writes: usize,
    /// Outcomes whose local application failed, re-raised before the next outcome.
    deferred_outcomes: VecDeque<RemoteStoreEvent>,
    write_handshake_complete: bool,
    last_stream_token: Vec<u8>,
    offline_causes: BTreeSet<OfflineCause>,
    events: Vec<RemoteStoreEvent>,
}

impl RemoteStore {
    pub fn new(connection: Box<dyn RemoteConnection>, config: RemoteStoreConfig) -> Self {
        Self {
            connection,
            timers: TimerRegistry::default(),
            listen_targets: BTreeMap::new(),
            watch_stream: PersistentStream::new(StreamKind::Watch, config.backoff, config.idle_timeout),
            write_stream: PersistentStream::new(StreamKind::Write, config.backoff, config.idle_timeout),
            watch_change_aggregator: None,
            online_state_tracker: OnlineStateTracker::new(config.online_state_timeout),
            write_pipeline: VecDeque::new(),
            answered_writes: 0,
            deferred_outcomes: VecDeque::new(),
            write_handshake_complete: false,
            last_stream_token: Vec::new(),
            offline_causes: BTreeSet::new(),
            events: Vec::new(),
        }
    }

    pub fn start(&mut self, local_store: &LocalStore) {
        self.enable_network(local_store);
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state_tracker.state()
    }

    pub fn can_use_network(&self) -> bool {
        self.offline_causes.is_empty()
    }

    pub fn is_watch_stream_open(&self) -> bool {
        self.watch_stream.is_open()
    }

    pub fn is_write_stream_open(&self) -> bool {
        self.write_stream.is_open()
    }

    pub fn listen_target(&self, target_id: i32) -> Option<&TargetData> {
        self.listen_targets.get(&target_id)
    }

    pub fn write_pipeline_len(&self) -> usize {
        self.write_pipeline.len()
    }

    /// Events accumulated since the last call.
    pub fn take_events(&mut self) -> Vec<RemoteStoreEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn drain_scheduled(&mut self) -> Vec<DelayedTask> {
        self.timers.drain_scheduled()
    }

    pub fn enable_network(&mut self, local_store: &LocalStore) {
        self.offline_causes.remove(&OfflineCause::UserDisabled);
        if !self.can_use_network() {
            return;
        }
        log::debug!("firestore::remote_store: network enabled");
        self.last_stream_token = local_store.get_last_stream_token();
        if self.should_start_watch_stream() {
            self.start_watch_stream();
        } else {
            self.update_online_state(OnlineState::Unknown);
        }
        self.fill_write_pipeline(local_store);
    }

    pub fn disable_network(&mut self) {
        self.offline_causes.insert(OfflineCause::UserDisabled);
        log::debug!("firestore::remote_store: network disabled");
        self.disable_network_internal();
        // Queries answer from cache right away instead of waiting for a timeout.
        self.update_online_state(OnlineState::Offline);
    }

    pub fn shutdown(&mut self) {
        self.offline_causes.insert(OfflineCause::Shutdown);
        self.disable_network_internal();
        self.update_online_state(OnlineState::Unknown);
        self.timers.cancel_all();
    }

    /// Starts watching the target. A target already watched is left alone.
    pub fn listen(&mut self, target_data: TargetData) {
        let target_id = target_data.target_id;
        if self.listen_targets.contains_key(&target_id) {
            return;
        }
        log::debug!(
            "firestore::remote_store: listen to target {target_id} ({:?})",
            target_data.purpose
        );
        self.listen_targets.insert(target_id, target_data.clone());
        if self.should_start_watch_stream() {
            self.start_watch_stream();
        } else if self.watch_stream.is_open() {
            self.send_watch_request(&target_data);
        }
    }

    pub fn unlisten(&mut self, target_id: i32) {
        if self.listen_targets.remove(&target_id).is_none() {
            log::debug!("firestore::remote_store: unlisten of unknown target {target_id}");
            return;
        }
        log::debug!("firestore::remote_store: unlisten target {target_id}");
        if self.watch_stream.is_open() {
            self.send_unwatch_request(target_id);
        }
        if self.listen_targets.is_empty() {
            if self.watch_stream.is_open() {
                self.watch_stream.mark_idle(&mut self.timers);
            } else if self.can_use_network() {
                // Nothing is listening, so there is no reason to suspect we are offline.
                self.update_online_state(OnlineState::Unknown);
            }
        }
    }

    /// Moves pending batches from the mutation queue into the write pipeline.
    ///
    /// Call after every acknowledged or rejected write has been applied to the local
    /// store, so the queue no longer returns those batches.
    pub fn fill_write_pipeline(&mut self, local_store: &LocalStore) {
        let mut last_batch_id = self
            .write_pipeline
            .back()
            .map(|batch| batch.batch_id)
            .unwrap_or(BATCH_ID_UNKNOWN);
        while self.can_add_to_write_pipeline() {
            let Some(batch) = local_store.get_next_mutation_batch(last_batch_id) else {
                if self.write_pipeline.is_empty() {
                    self.write_stream.mark_idle(&mut self.timers);
                }
                break;
            };
            last_batch_id = batch.batch_id;
            self.add_to_write_pipeline(batch);
        }
        if self.should_start_write_stream() {
            self.start_write_stream();
        }
    }

    pub fn on_watch_stream_open(&mut self) {
        if !self.watch_stream.handle_open() {
            return;
        }
        let targets: Vec<TargetData> = self.listen_targets.values().cloned().collect();
        for target in &targets {
            self.send_watch_request(target);
        }
    }

    pub fn on_watch_change(
        &mut self,
        change: WatchChange,
        syncer: &dyn RemoteSyncer,
        local_store: &LocalStore,
    ) -> FirestoreResult<()> {
        if !self.watch_stream.is_open() {
            log::debug!("firestore::remote_store: ignoring watch change on a closed stream");
            return Ok(());
        }
        self.watch_stream.handle_message();
        // Any message from the backend proves we are online.
        self.update_online_state(OnlineState::Online);

        if let WatchChange::TargetChange(target_change) = &change {
            if target_change.state == TargetChangeState::Remove {
                if let Some(cause) = &target_change.cause {
                    self.handle_target_error(&target_change.target_ids, cause.clone());
                    return Ok(());
                }
            }
        }

        let snapshot_version = change.snapshot_version();
        {
            let metadata = ListenTargetMetadata {
                listen_targets: &self.listen_targets,
                syncer,
            };
            let aggregator = self
                .watch_change_aggregator
                .as_mut()
                .ok_or_else(|| internal_error("Watch stream is open without an aggregator"))?;
            match change {
                WatchChange::TargetChange(target_change) => {
                    aggregator.handle_target_change(&target_change, &metadata)?
                }
                WatchChange::DocumentChange(document_change) => {
                    aggregator.handle_document_change(document_change, &metadata)
                }
                WatchChange::DocumentDelete(delete) => aggregator.handle_document_delete(delete, &metadata),
                WatchChange::DocumentRemove(remove) => aggregator.handle_document_remove(remove, &metadata),
                WatchChange::ExistenceFilter(filter) => {
                    aggregator.handle_existence_filter(filter, &metadata)?
                }
            }
        }

        if !snapshot_version.is_none()
            && snapshot_version >= local_store.get_last_remote_snapshot_version()
        {
            self.raise_watch_snapshot(snapshot_version, syncer)?;
        }
        Ok(())
    }

    pub fn on_watch_stream_close(&mut self, error: Option<FirestoreError>) {
        if !self.watch_stream.handle_close(error.as_ref(), &mut self.timers) {
            return;
        }
        self.handle_watch_stream_closed(error);
    }

    pub fn on_write_stream_open(&mut self) {
        if !self.write_stream.handle_open() {
            return;
        }
        self.connection.send_handshake();
    }

    pub fn on_write_handshake(&mut self, stream_token: Vec<u8>, local_store: &mut LocalStore) -> FirestoreResult<()> {
        if !self.write_stream.is_open() {
            return Ok(());
        }
        self.write_stream.handle_message();
        local_store.set_last_stream_token(stream_token.clone())?;
        self.last_stream_token = stream_token;
        self.write_handshake_complete = true;
        self.raise_deferred_outcomes();
        log::debug!(
            "firestore::remote_store: write handshake complete, resending {} batches",
            self.write_pipeline.len() - self.answered_writes
        );
        for batch in self.write_pipeline.iter().skip(self.answered_writes) {
            self.connection
                .send_mutations(batch.batch_id, &self.last_stream_token, &batch.mutations);
        }
        Ok(())
    }

    /// The backend committed the oldest batch in the pipeline.
    pub fn on_write_response(
        &mut self,
        stream_token: Vec<u8>,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> FirestoreResult<()> {
        if !self.write_stream.is_open() || !self.write_handshake_complete {
            log::debug!("firestore::remote_store: ignoring write response on a closed stream");
            return Ok(());
        }
        self.write_stream.handle_message();
        self.last_stream_token = stream_token.clone();
        let batch = self
            .write_pipeline
            .get(self.answered_writes)
            .cloned()
            .ok_or_else(|| internal_error("Got a write response with an empty write pipeline"))?;
        let result = MutationBatchResult::create(batch, commit_version, results, stream_token)?;
        self.answered_writes += 1;
        self.raise_deferred_outcomes();
        self.events.push(RemoteStoreEvent::SuccessfulWrite(result));
        Ok(())
    }

    /// The local store applied the outcome of the oldest answered batch; it leaves the
    /// pipeline.
    pub fn settle_write(&mut self, batch_id: i32) -> FirestoreResult<()> {
        match self.write_pipeline.front() {
            Some(batch) if self.answered_writes > 0 && batch.batch_id == batch_id => {
                self.write_pipeline.pop_front();
                self.answered_writes -= 1;
                Ok(())
            }
            _ => Err(internal_error(format!(
                "Batch {batch_id} is not the oldest answered write in the pipeline"
            ))),
        }
    }

    /// Keeps an outcome the local store could not apply. Its batch stays answered at the
    /// head of the pipeline and the outcome is raised again with the next write handshake
    /// or ahead of the next outcome.
    pub fn defer_write_outcome(&mut self, outcome: RemoteStoreEvent) {
        log::warn!("firestore::remote_store: deferring a write outcome the local store could not apply");
        self.deferred_outcomes.push_back(outcome);
    }

    pub fn on_write_stream_close(
        &mut self,
        error: Option<FirestoreError>,
        local_store: &mut LocalStore,
    ) -> FirestoreResult<()> {
        if !self.write_stream.handle_close(error.as_ref(), &mut self.timers) {
            return Ok(());
        }
        let handshake_complete = std::mem::replace(&mut self.write_handshake_complete, false);
        if let Some(err) = error {
            if self.write_pipeline.len() > self.answered_writes {
                if handshake_complete {
                    self.handle_write_error(err);
                } else {
                    self.handle_write_handshake_error(err, local_store)?;
                }
            }
        }
        if self.should_start_write_stream() {
            self.start_write_stream();
        }
        Ok(())
    }

    /// Runs a fired timer owned by the remote store; returns false for timers it does not own.
    pub fn handle_timer(&mut self, task: &DelayedTask) -> bool {
        match task.timer_id {
            TimerId::ListenStreamConnectionBackoff => {
                if self.timers.fire(task) {
                    self.watch_stream
                        .handle_backoff_elapsed(self.connection.as_mut());
                }
            }
            TimerId::WriteStreamConnectionBackoff => {
                if self.timers.fire(task) {
                    self.write_stream
                        .handle_backoff_elapsed(self.connection.as_mut());
                }
            }
            TimerId::ListenStreamIdle => {
                if self.timers.fire(task)
                    && self
                        .watch_stream
                        .stop(self.connection.as_mut(), &mut self.timers)
                {
                    log::debug!("firestore::remote_store: closing idle watch stream");
                    self.handle_watch_stream_closed(None);
                }
            }
            TimerId::WriteStreamIdle => {
                if self.timers.fire(task)
                    && self
                        .write_stream
                        .stop(self.connection.as_mut(), &mut self.timers)
                {
                    log::debug!("firestore::remote_store: closing idle write stream");
                    self.write_handshake_complete = false;
                }
            }
            TimerId::OnlineStateTimeout => {
                if self.timers.fire(task) {
                    if let Some(state) = self.online_state_tracker.handle_online_state_timeout() {
                        self.events.push(RemoteStoreEvent::OnlineStateChanged(state));
                    }
                }
            }
            TimerId::LimboResolution(_) | TimerId::GarbageCollection => return false,
        }
        true
    }

    fn should_start_watch_stream(&self) -> bool {
        self.can_use_network() && !self.watch_stream.is_started() && !self.listen_targets.is_empty()
    }

    fn should_start_write_stream(&self) -> bool {
        self.can_use_network()
            && !self.write_stream.is_started()
            && self.write_pipeline.len() > self.answered_writes
    }

    fn can_add_to_write_pipeline(&self) -> bool {
        self.can_use_network() && self.write_pipeline.len() < MAX_PENDING_WRITES
    }

    fn start_watch_stream(&mut self) {
        self.watch_change_aggregator = Some(WatchChangeAggregator::new());
        self.watch_stream
            .start(self.connection.as_mut(), &mut self.timers);
        if let Some(state) = self
            .online_state_tracker
            .handle_watch_stream_start(&mut self.timers)
        {
            self.events.push(RemoteStoreEvent::OnlineStateChanged(state));
        }
    }

    fn start_write_stream(&mut self) {
        self.write_handshake_complete = false;
        self.write_stream
            .start(self.connection.as_mut(), &mut self.timers);
    }

    fn send_watch_request(&mut self, target_data: &TargetData) {
        if let Some(aggregator) = self.watch_change_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_data.target_id);
        }
        self.watch_stream.cancel_idle(&mut self.timers);
        self.connection.send_watch_request(target_data);
    }

    fn send_unwatch_request(&mut self, target_id: i32) {
        if let Some(aggregator) = self.watch_change_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        self.connection.send_unwatch_request(target_id);
    }

    fn add_to_write_pipeline(&mut self, batch: MutationBatch) {
        if self.write_stream.is_open() && self.write_handshake_complete {
            self.write_stream.cancel_idle(&mut self.timers);
            self.connection
                .send_mutations(batch.batch_id, &self.last_stream_token, &batch.mutations);
        }
        self.write_pipeline.push_back(batch);
    }

    fn raise_watch_snapshot(
        &mut self,
        snapshot_version: SnapshotVersion,
        syncer: &dyn RemoteSyncer,
    ) -> FirestoreResult<()> {
        let event = {
            let metadata = ListenTargetMetadata {
                listen_targets: &self.listen_targets,
                syncer,
            };
            let aggregator = self
                .watch_change_aggregator
                .as_mut()
                .ok_or_else(|| internal_error("Watch stream is open without an aggregator"))?;
            aggregator.create_remote_event(snapshot_version, &metadata)?
        };

        // Keep resume tokens current so a reconnect only receives the delta.
        for (target_id, change) in &event.target_changes {
            if change.resume_token.is_empty() {
                continue;
            }
            if let Some(target_data) = self.listen_targets.get_mut(target_id) {
                *target_data = target_data.with_resume_token(change.resume_token.clone(), snapshot_version);
            }
        }

        // Targets whose membership diverged are re-listened from scratch.
        for target_id in &event.target_mismatches {
            let Some(target_data) = self.listen_targets.get_mut(target_id) else {
                continue;
            };
            *target_data = target_data.with_resume_token(Vec::new(), target_data.snapshot_version);
            let request = TargetData::new(
                target_data.query.clone(),
                *target_id,
                target_data.sequence_number,
                QueryPurpose::ExistenceFilterMismatch,
            );
            self.send_unwatch_request(*target_id);
            self.send_watch_request(&request);
        }

        self.events.push(RemoteStoreEvent::RemoteEvent(event));
        Ok(())
    }

    fn handle_target_error(&mut self, target_ids: &[i32], error: FirestoreError) {
        for target_id in target_ids {
            if self.listen_targets.remove(target_id).is_some() {
                log::warn!("firestore::remote_store: listen for target {target_id} rejected: {error}");
                if let Some(aggregator) = self.watch_change_aggregator.as_mut() {
                    aggregator.remove_target(*target_id);
                }
                self.events.push(RemoteStoreEvent::RejectedListen {
                    target_id: *target_id,
                    error: error.clone(),
                });
            }
        }
    }

    fn handle_watch_stream_closed(&mut self, error: Option<FirestoreError>) {
        self.watch_change_aggregator = None;
        if self.should_start_watch_stream() {
            if let Some(state) = self
                .online_state_tracker
                .handle_watch_stream_failure(error.as_ref(), &mut self.timers)
            {
                self.events.push(RemoteStoreEvent::OnlineStateChanged(state));
            }
            self.start_watch_stream();
        } else {
            self.update_online_state(OnlineState::Unknown);
        }
    }

    fn handle_write_error(&mut self, error: FirestoreError) {
        if !is_permanent_write_error(error.code) {
            return;
        }
        if let Some(batch_id) = self
            .write_pipeline
            .get(self.answered_writes)
            .map(|batch| batch.batch_id)
        {
            log::warn!("firestore::remote_store: write batch {batch_id} rejected: {error}");
            self.answered_writes += 1;
            // Resend the remaining batches right away; the failure was this batch's fault.
            self.write_stream.inhibit_backoff();
            self.raise_deferred_outcomes();
            self.events.push(RemoteStoreEvent::RejectedWrite { batch_id, error });
        }
    }

    fn raise_deferred_outcomes(&mut self) {
        self.events.extend(self.deferred_outcomes.drain(..));
    }

    fn handle_write_handshake_error(
        &mut self,
        error: FirestoreError,
        local_store: &mut LocalStore,
    ) -> FirestoreResult<()> {
        if is_permanent_error(error.code) {
            log::debug!("firestore::remote_store: handshake failed ({error}); resetting stream token");
            self.last_stream_token.clear();
            local_store.set_last_stream_token(Vec::new())?;
        }
        Ok(())
    }

    fn disable_network_internal(&mut self) {
        if self
            .write_stream
            .stop(self.connection.as_mut(), &mut self.timers)
        {
            self.write_handshake_complete = false;
        }
        if self
            .watch_stream
            .stop(self.connection.as_mut(), &mut self.timers)
        {
            self.watch_change_aggregator = None;
        }
        // Answered batches stay until their outcome is applied locally.
        if self.write_pipeline.len() > self.answered_writes {
            log::debug!(
                "firestore::remote_store: dropping {} pending writes from the pipeline",
                self.write_pipeline.len() - self.answered_writes
            );
            self.write_pipeline.truncate(self.answered_writes);
        }
        self.watch_change_aggregator = None;
    }

    fn update_online_state(&mut self, state: OnlineState) {
        if let Some(changed) = self.online_state_tracker.update_state(state, &mut self.timers) {
            self.events.push(RemoteStoreEvent::OnlineStateChanged(changed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::Query;
    use crate::firestore::error::{failed_precondition, unavailable};
    use crate::firestore::local::{GarbageCollectorSettings, MemoryPersistence};
    use crate::firestore::model::mutation::Mutation;
    use crate::firestore::model::{Document, Timestamp};
    use crate::firestore::remote::connection::{ChannelConnection, StreamRequest};
    use crate::firestore::remote::watch_change::{DocumentChange, WatchTargetChange};
    use crate::firestore::value::ObjectValue;
    use async_channel::Receiver;

    struct NoKeys;

    impl RemoteSyncer for NoKeys {
        fn get_remote_keys_for_target(&self, _target_id: i32) -> BTreeSet<DocumentKey> {
            BTreeSet::new()
        }
    }

    fn setup() -> (RemoteStore, LocalStore, Receiver<StreamRequest>) {
        let (connection, requests) = ChannelConnection::new();
        let local_store =
            LocalStore::new(Box::new(MemoryPersistence::new()), GarbageCollectorSettings::Eager).unwrap();
        let mut remote_store = RemoteStore::new(Box::new(connection), RemoteStoreConfig::default());
        remote_store.start(&local_store);
        (remote_store, local_store, requests)
    }

    fn drain(requests: &Receiver<StreamRequest>) -> Vec<StreamRequest> {
        std::iter::from_fn(|| requests.try_recv().ok()).collect()
    }

    fn target(target_id: i32) -> TargetData {
        TargetData::new(Query::collection("c").unwrap(), target_id, 1, QueryPurpose::Listen)
    }

    fn version(micros: i64) -> SnapshotVersion {
        SnapshotVersion::from_micros(micros)
    }

    #[test]
    fn listen_opens_watch_stream_and_sends_targets_on_open() {
        let (mut remote_store, _local_store, requests) = setup();
        remote_store.listen(target(2));
        assert_eq!(drain(&requests), vec![StreamRequest::OpenWatch]);

        remote_store.on_watch_stream_open();
        assert_eq!(drain(&requests), vec![StreamRequest::Watch(target(2))]);

        remote_store.listen(target(4));
        assert_eq!(drain(&requests), vec![StreamRequest::Watch(target(4))]);
    }

    #[test]
    fn global_snapshot_raises_remote_event() {
        let (mut remote_store, local_store, _requests) = setup();
        remote_store.listen(target(2));
        remote_store.on_watch_stream_open();
        let changes = vec![
            WatchChange::TargetChange(WatchTargetChange::new(TargetChangeState::Add, vec![2])),
            WatchChange::DocumentChange(DocumentChange {
                updated_target_ids: vec![2],
                removed_target_ids: Vec::new(),
                document: Document::new_found(
                    DocumentKey::from_string("c/a").unwrap(),
                    version(5),
                    ObjectValue::empty(),
                ),
            }),
            WatchChange::TargetChange(
                WatchTargetChange::new(TargetChangeState::Current, vec![2]).with_resume_token(vec![1]),
            ),
            WatchChange::TargetChange(WatchTargetChange::global_snapshot(version(5), Vec::new())),
        ];
        for change in changes {
            remote_store.on_watch_change(change, &NoKeys, &local_store).unwrap();
        }

        let events = remote_store.take_events();
        assert!(matches!(
            events.first(),
            Some(RemoteStoreEvent::OnlineStateChanged(OnlineState::Online))
        ));
        let Some(RemoteStoreEvent::RemoteEvent(event)) = events.last() else {
            panic!("expected a remote event, got {events:?}");
        };
        assert!(event.target_changes[&2].current);
        assert_eq!(remote_store.listen_target(2).unwrap().resume_token, vec![1]);
    }

    #[test]
    fn rejected_listen_removes_target() {
        let (mut remote_store, local_store, _requests) = setup();
        remote_store.listen(target(2));
        remote_store.on_watch_stream_open();
        remote_store
            .on_watch_change(
                WatchChange::TargetChange(
                    WatchTargetChange::new(TargetChangeState::Remove, vec![2])
                        .with_cause(failed_precondition("missing index")),
                ),
                &NoKeys,
                &local_store,
            )
            .unwrap();
        assert!(remote_store.listen_target(2).is_none());
        assert!(remote_store
            .take_events()
            .iter()
            .any(|event| matches!(event, RemoteStoreEvent::RejectedListen { target_id: 2, .. })));
    }

    #[test]
    fn watch_failure_goes_offline_and_reconnects_with_backoff() {
        let (mut remote_store, _local_store, requests) = setup();
        remote_store.listen(target(2));
        remote_store.on_watch_stream_open();
        drain(&requests);
        remote_store.take_events();

        remote_store.on_watch_stream_close(Some(unavailable("network down")));
        assert_eq!(remote_store.online_state(), OnlineState::Offline);
        assert!(drain(&requests).is_empty());

        let backoff = remote_store
            .drain_scheduled()
            .into_iter()
            .find(|task| task.timer_id == TimerId::ListenStreamConnectionBackoff)
            .unwrap();
        assert!(remote_store.handle_timer(&backoff));
        assert_eq!(drain(&requests), vec![StreamRequest::OpenWatch]);

        remote_store.on_watch_stream_open();
        assert_eq!(drain(&requests), vec![StreamRequest::Watch(target(2))]);
    }

    #[test]
    fn writes_wait_for_handshake_and_resend_after_failure() {
        let (mut remote_store, mut local_store, requests) = setup();
        let write = local_store
            .write_locally(
                vec![Mutation::delete(DocumentKey::from_string("c/a").unwrap())],
                Timestamp::now(),
            )
            .unwrap();
        remote_store.fill_write_pipeline(&local_store);
        assert_eq!(drain(&requests), vec![StreamRequest::OpenWrite]);

        remote_store.on_write_stream_open();
        assert_eq!(drain(&requests), vec![StreamRequest::Handshake]);
        remote_store.on_write_handshake(vec![1], &mut local_store).unwrap();
        let sent = drain(&requests);
        assert!(matches!(
            sent.as_slice(),
            [StreamRequest::Write { batch_id, .. }] if *batch_id == write.batch_id
        ));

        remote_store
            .on_write_stream_close(Some(unavailable("reset")), &mut local_store)
            .unwrap();
        assert_eq!(remote_store.write_pipeline_len(), 1);
        let backoff = remote_store
            .drain_scheduled()
            .into_iter()
            .find(|task| task.timer_id == TimerId::WriteStreamConnectionBackoff)
            .unwrap();
        remote_store.handle_timer(&backoff);
        remote_store.on_write_stream_open();
        remote_store.on_write_handshake(vec![2], &mut local_store).unwrap();
        let resent = drain(&requests);
        assert!(resent
            .iter()
            .any(|request| matches!(request, StreamRequest::Write { batch_id, stream_token, .. }
                if *batch_id == write.batch_id && stream_token == &vec![2])));

        remote_store
            .on_write_response(vec![3], version(10), vec![MutationResult::new(version(10), Vec::new())])
            .unwrap();
        assert!(matches!(
            remote_store.take_events().as_slice(),
            [RemoteStoreEvent::SuccessfulWrite(result)] if result.batch.batch_id == write.batch_id
        ));
    }

    #[test]
    fn permanent_write_error_rejects_head_batch() {
        let (mut remote_store, mut local_store, _requests) = setup();
        local_store
            .write_locally(
                vec![Mutation::delete(DocumentKey::from_string("c/a").unwrap())],
                Timestamp::now(),
            )
            .unwrap();
        remote_store.fill_write_pipeline(&local_store);
        remote_store.on_write_stream_open();
        remote_store.on_write_handshake(vec![1], &mut local_store).unwrap();

        remote_store
            .on_write_stream_close(Some(failed_precondition("bad write")), &mut local_store)
            .unwrap();
        assert!(matches!(
            remote_store.take_events().as_slice(),
            [RemoteStoreEvent::RejectedWrite { batch_id: 1, .. }]
        ));
        // The batch leaves the pipeline only once the rejection is applied locally.
        assert_eq!(remote_store.write_pipeline_len(), 1);
        local_store.reject_batch(1).unwrap();
        remote_store.settle_write(1).unwrap();
        assert_eq!(remote_store.write_pipeline_len(), 0);
    }

    #[test]
    fn disable_network_goes_offline_and_closes_streams() {
        let (mut remote_store, _local_store, requests) = setup();
        remote_store.listen(target(2));
        remote_store.on_watch_stream_open();
        drain(&requests);

        remote_store.disable_network();
        assert_eq!(remote_store.online_state(), OnlineState::Offline);
        assert_eq!(drain(&requests), vec![StreamRequest::CloseWatch]);
        assert!(!remote_store.can_use_network());

        remote_store.listen(target(4));
        assert!(drain(&requests).is_empty());
    }
}
