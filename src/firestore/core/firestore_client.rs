use std::sync::{Arc, Weak};

use async_channel::Receiver;
use async_lock::Mutex;

use crate::firestore::core::event_manager::{EventManager, ListenOptions, ListenerId, QueryListener};
use crate::firestore::core::sync_engine::{SyncEngine, SyncEngineConfig, SyncEngineEvent, WriteAcknowledgement};
use crate::firestore::core::{CacheSettings, DelayedTask, FirestoreSettings, Query, ViewSnapshot};
use crate::firestore::error::{cancelled, failed_precondition, FirestoreResult};
use crate::firestore::local::{FieldIndex, FilePersistence, LocalStore, MemoryPersistence, Persistence};
use crate::firestore::model::mutation::Mutation;
use crate::firestore::model::{Document, DocumentKey};
use crate::firestore::remote::{OnlineState, RemoteConnection, RemoteStore, StreamEvent};
use crate::platform::runtime::{sleep, spawn_detached};

struct ClientState {
    sync_engine: SyncEngine,
    event_manager: EventManager,
    next_listener_id: ListenerId,
    terminated: bool,
}

impl ClientState {
    fn ensure_running(&self) -> FirestoreResult<()> {
        if self.terminated {
            return Err(failed_precondition("The client has already been terminated."));
        }
        Ok(())
    }

    /// Hands queued sync engine events to the listeners.
    fn dispatch_events(&mut self) {
        for event in self.sync_engine.take_events() {
            match event {
                SyncEngineEvent::Snapshots(snapshots) => self.event_manager.on_view_snapshots(snapshots),
                SyncEngineEvent::QueryError { query, error } => {
                    log::warn!(
                        "firestore::client: listen for {} failed: {error}",
                        query.canonical_id()
                    );
                    self.event_manager.on_error(&query, error);
                }
                SyncEngineEvent::OnlineStateChanged(state) => {
                    self.event_manager.handle_online_state_change(state)
                }
            }
        }
    }
}

/// Handle to a running sync engine.
///
/// Cloning is cheap and every clone talks to the same engine. All operations are
/// serialized through one lock; none of them waits for the network while holding it.
#[derive(Clone)]
pub struct FirestoreClient {
    state: Arc<Mutex<ClientState>>,
}

impl FirestoreClient {
    /// Builds and starts a client.
    ///
    /// Without an explicit `persistence` the backend follows `settings.cache`.
    pub fn new(
        settings: FirestoreSettings,
        persistence: Option<Box<dyn Persistence>>,
        connection: Box<dyn RemoteConnection>,
    ) -> FirestoreResult<Self> {
        settings.validate()?;
        let persistence = persistence.unwrap_or_else(|| match &settings.cache {
            CacheSettings::Memory { .. } => Box::new(MemoryPersistence::new()) as Box<dyn Persistence>,
            CacheSettings::Persistent { path, .. } => Box::new(FilePersistence::new(path)),
        });
        let local_store = LocalStore::new(persistence, settings.cache.garbage_collector())?;
        let remote_store = RemoteStore::new(connection, settings.remote_store_config());
        let mut sync_engine = SyncEngine::new(local_store, remote_store, SyncEngineConfig::from(&settings));
        sync_engine.start()?;

        let tasks = sync_engine.drain_scheduled();
        let mut state = ClientState {
            sync_engine,
            event_manager: EventManager::new(),
            next_listener_id: 1,
            terminated: false,
        };
        state.dispatch_events();

        let client = Self {
            state: Arc::new(Mutex::new(state)),
        };
        for task in tasks {
            schedule_timer(Arc::downgrade(&client.state), task);
        }
        log::debug!("firestore::client: started");
        Ok(client)
    }

    /// Subscribes to a query.
    ///
    /// The first snapshot comes from the local cache and is available without a network
    /// round trip. Snapshots are delivered in order; dropping the subscription stops it.
    pub async fn listen(&self, query: Query, options: ListenOptions) -> FirestoreResult<QuerySubscription> {
        let (sender, receiver) = async_channel::unbounded();
        let mut state = self.state.lock().await;
        state.ensure_running()?;
        let id = state.next_listener_id;
        state.next_listener_id += 1;

        let listener = QueryListener::new(id, query.clone(), options, sender);
        if state.event_manager.add_query_listener(listener) {
            if let Err(err) = state.sync_engine.listen(query.clone()) {
                state.event_manager.remove_query_listener(&query, id);
                return Err(err);
            }
        }
        self.flush(&mut state);
        Ok(QuerySubscription {
            client: self.clone(),
            query,
            id: Some(id),
            receiver,
        })
    }

    /// Applies the mutations locally right away and resolves once the backend accepts or
    /// rejects them. The future does not resolve while offline.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<()> {
        let ack = {
            let mut state = self.state.lock().await;
            state.ensure_running()?;
            let (batch_id, ack) = state.sync_engine.write_mutations(mutations)?;
            log::debug!("firestore::client: queued batch {batch_id}");
            self.flush(&mut state);
            ack
        };
        await_acknowledgement(ack).await
    }

    /// Resolves once every write issued before the call has been acknowledged or rejected.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        let ack = {
            let mut state = self.state.lock().await;
            state.ensure_running()?;
            state.sync_engine.wait_for_pending_writes()
        };
        await_acknowledgement(ack).await
    }

    /// The cached version of a document including pending writes, if it exists locally.
    pub async fn get_document_from_local_cache(&self, key: &DocumentKey) -> FirestoreResult<Option<Document>> {
        let state = self.state.lock().await;
        state.ensure_running()?;
        Ok(state.sync_engine.get_document_from_local_cache(key))
    }

    pub async fn get_documents_from_local_cache(&self, query: &Query) -> FirestoreResult<ViewSnapshot> {
        let state = self.state.lock().await;
        state.ensure_running()?;
        state.sync_engine.get_documents_from_local_cache(query)
    }

    pub async fn configure_field_indexes(&self, indexes: Vec<FieldIndex>) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        state.ensure_running()?;
        state.sync_engine.configure_field_indexes(indexes)
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        state.ensure_running()?;
        let result = state.sync_engine.enable_network();
        self.flush(&mut state);
        result
    }

    /// Closes both streams. Listeners see cached results and writes queue up locally.
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        state.ensure_running()?;
        let result = state.sync_engine.disable_network();
        self.flush(&mut state);
        result
    }

    pub async fn online_state(&self) -> OnlineState {
        self.state.lock().await.sync_engine.online_state()
    }

    /// Applies one notification from the transport.
    pub async fn handle_stream_event(&self, event: StreamEvent) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        state.ensure_running()?;
        let result = state.sync_engine.handle_stream_event(event);
        self.flush(&mut state);
        result
    }

    /// Applies transport notifications until the channel closes or the client terminates.
    pub async fn run_transport(&self, events: Receiver<StreamEvent>) -> FirestoreResult<()> {
        while let Ok(event) = events.recv().await {
            if let Err(err) = self.handle_stream_event(event).await {
                if self.state.lock().await.terminated {
                    return Ok(());
                }
                log::error!("firestore::client: failed to apply stream event: {err}");
                return Err(err);
            }
        }
        Ok(())
    }

    /// Shuts the engine down. Listeners are closed and outstanding writes fail; every
    /// later call returns `FailedPrecondition`.
    pub async fn terminate(&self) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        if state.terminated {
            return Ok(());
        }
        state.terminated = true;
        state.event_manager.clear();
        let result = state.sync_engine.shutdown();
        log::debug!("firestore::client: terminated");
        result
    }

    pub async fn is_terminated(&self) -> bool {
        self.state.lock().await.terminated
    }

    async fn stop_listening(&self, query: &Query, id: ListenerId) {
        let mut state = self.state.lock().await;
        if state.terminated {
            return;
        }
        if state.event_manager.remove_query_listener(query, id) {
            if let Err(err) = state.sync_engine.stop_listening(query) {
                log::warn!("firestore::client: failed to stop listening: {err}");
            }
        }
        self.flush(&mut state);
    }

    fn flush(&self, state: &mut ClientState) {
        state.dispatch_events();
        for task in state.sync_engine.drain_scheduled() {
            schedule_timer(Arc::downgrade(&self.state), task);
        }
    }
}

/// Sleeps for the task's delay and hands it back to the engine. The client may be gone
/// by then, in which case nothing happens.
fn schedule_timer(state: Weak<Mutex<ClientState>>, task: DelayedTask) {
    spawn_detached(async move {
        sleep(task.delay).await;
        let Some(shared) = state.upgrade() else {
            return;
        };
        let client = FirestoreClient { state: shared };
        let mut state = client.state.lock().await;
        if state.terminated {
            return;
        }
        if let Err(err) = state.sync_engine.handle_timer(task) {
            log::error!("firestore::client: timer {:?} failed: {err}", task.timer_id);
        }
        client.flush(&mut state);
    });
}

async fn await_acknowledgement(ack: WriteAcknowledgement) -> FirestoreResult<()> {
    ack.await
        .map_err(|_| cancelled("The client was terminated before the write completed"))?
}

/// A live query listen. Dropping it unsubscribes.
pub struct QuerySubscription {
    client: FirestoreClient,
    query: Query,
    id: Option<ListenerId>,
    receiver: Receiver<FirestoreResult<ViewSnapshot>>,
}

impl QuerySubscription {
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Waits for the next snapshot. `None` once the listen has ended, after an error or
    /// client termination.
    pub async fn next(&mut self) -> Option<FirestoreResult<ViewSnapshot>> {
        self.receiver.recv().await.ok()
    }

    /// The next already delivered snapshot, if any.
    pub fn try_next(&mut self) -> Option<FirestoreResult<ViewSnapshot>> {
        self.receiver.try_recv().ok()
    }

    /// Stops the listen; no snapshot is delivered after this returns.
    pub async fn unsubscribe(mut self) {
        if let Some(id) = self.id.take() {
            self.receiver.close();
            self.client.stop_listening(&self.query, id).await;
        }
    }
}

impl Drop for QuerySubscription {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.receiver.close();
            let client = self.client.clone();
            let query = self.query.clone();
            spawn_detached(async move {
                client.stop_listening(&query, id).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::ChangeType;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::model::SnapshotVersion;
    use crate::firestore::model::mutation::MutationResult;
    use crate::firestore::remote::{
        ChannelConnection, DocumentChange, StreamRequest, TargetChangeState, WatchChange, WatchTargetChange,
    };
    use crate::firestore::value::FirestoreValue;
    use std::collections::BTreeMap;

    fn client() -> (FirestoreClient, Receiver<StreamRequest>) {
        let (connection, requests) = ChannelConnection::new();
        let client = FirestoreClient::new(FirestoreSettings::default(), None, Box::new(connection)).unwrap();
        (client, requests)
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn set(path: &str, value: i64) -> Mutation {
        Mutation::set(
            key(path),
            BTreeMap::from([("value".to_string(), FirestoreValue::from_integer(value))]),
        )
        .unwrap()
    }

    async fn watch(client: &FirestoreClient, change: WatchChange) {
        client
            .handle_stream_event(StreamEvent::WatchChange(change))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn listen_delivers_cached_then_remote_snapshots() {
        let (client, requests) = client();
        let query = Query::collection("rooms").unwrap();
        let mut subscription = client
            .listen(query, ListenOptions::default().with_metadata_changes())
            .await
            .unwrap();
        // Nothing is cached and the client may be online, so the empty cache result is held back.
        assert!(subscription.try_next().is_none());
        assert_eq!(requests.try_recv().unwrap(), StreamRequest::OpenWatch);

        client.handle_stream_event(StreamEvent::WatchOpen).await.unwrap();
        let StreamRequest::Watch(target) = requests.try_recv().unwrap() else {
            panic!("expected a watch request");
        };
        let target_id = target.target_id;
        watch(&client, WatchChange::TargetChange(WatchTargetChange::new(TargetChangeState::Add, vec![target_id]))).await;
        watch(
            &client,
            WatchChange::DocumentChange(DocumentChange {
                updated_target_ids: vec![target_id],
                removed_target_ids: Vec::new(),
                document: Document::new_found(
                    key("rooms/a"),
                    SnapshotVersion::from_micros(3),
                    crate::firestore::value::ObjectValue::empty(),
                ),
            }),
        )
        .await;
        watch(&client, WatchChange::TargetChange(WatchTargetChange::new(TargetChangeState::Current, vec![target_id]))).await;
        watch(
            &client,
            WatchChange::TargetChange(WatchTargetChange::global_snapshot(SnapshotVersion::from_micros(3), vec![1])),
        )
        .await;

        let snapshot = subscription.next().await.unwrap().unwrap();
        assert!(!snapshot.from_cache());
        assert_eq!(snapshot.changes().len(), 1);
        assert_eq!(snapshot.changes()[0].change_type, ChangeType::Added);

        subscription.unsubscribe().await;
        assert!(std::iter::from_fn(|| requests.try_recv().ok()).any(|request| request == StreamRequest::Unwatch(target_id)));
    }

    #[tokio::test]
    async fn write_resolves_on_acknowledgement() {
        let (client, _requests) = client();
        let writer = client.clone();
        let write = tokio::spawn(async move { writer.write(vec![set("rooms/a", 1)]).await });
        tokio::task::yield_now().await;

        let cached = loop {
            if let Some(doc) = client.get_document_from_local_cache(&key("rooms/a")).await.unwrap() {
                break doc;
            }
            tokio::task::yield_now().await;
        };
        assert!(cached.has_local_mutations());

        client.handle_stream_event(StreamEvent::WriteOpen).await.unwrap();
        client
            .handle_stream_event(StreamEvent::WriteHandshake { stream_token: vec![1] })
            .await
            .unwrap();
        client
            .handle_stream_event(StreamEvent::WriteResponse {
                stream_token: vec![2],
                commit_version: SnapshotVersion::from_micros(9),
                results: vec![MutationResult::new(SnapshotVersion::from_micros(9), Vec::new())],
            })
            .await
            .unwrap();

        write.await.unwrap().unwrap();
        client.wait_for_pending_writes().await.unwrap();
    }

    #[tokio::test]
    async fn operations_fail_after_terminate() {
        let (client, _requests) = client();
        let writer = client.clone();
        let pending = tokio::spawn(async move { writer.write(vec![set("rooms/a", 1)]).await });
        while client.get_document_from_local_cache(&key("rooms/a")).await.unwrap().is_none() {
            tokio::task::yield_now().await;
        }

        client.terminate().await.unwrap();
        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::FailedPrecondition);

        let err = client
            .listen(Query::collection("rooms").unwrap(), ListenOptions::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.code, FirestoreErrorCode::FailedPrecondition);
        assert!(client.is_terminated().await);
    }

    #[tokio::test]
    async fn offline_listen_reports_cached_writes() {
        let (client, _requests) = client();
        client.disable_network().await.unwrap();
        let writer = client.clone();
        tokio::spawn(async move {
            let _ = writer.write(vec![set("rooms/a", 1)]).await;
        });
        while client.get_document_from_local_cache(&key("rooms/a")).await.unwrap().is_none() {
            tokio::task::yield_now().await;
        }

        let mut subscription = client
            .listen(Query::collection("rooms").unwrap(), ListenOptions::default())
            .await
            .unwrap();
        let snapshot = subscription.next().await.unwrap().unwrap();
        assert!(snapshot.from_cache());
        assert!(snapshot.has_pending_writes());
        assert_eq!(snapshot.documents().len(), 1);
        assert_eq!(client.online_state().await, OnlineState::Offline);
    }
}
