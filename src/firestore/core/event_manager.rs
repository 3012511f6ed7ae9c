use std::collections::BTreeMap;

use async_channel::Sender;

use crate::firestore::core::{Query, ViewSnapshot};
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::remote::OnlineState;

/// Per-listener delivery options.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Deliver snapshots whose only change is document or query metadata.
    pub include_metadata_changes: bool,
    /// Hold back the first from-cache snapshot while the backend may still answer.
    pub wait_for_sync_when_online: bool,
}

impl ListenOptions {
    pub fn with_metadata_changes(mut self) -> Self {
        self.include_metadata_changes = true;
        self
    }

    pub fn wait_for_sync(mut self) -> Self {
        self.wait_for_sync_when_online = true;
        self
    }
}

pub type ListenerId = u64;

pub type SnapshotSender = Sender<FirestoreResult<ViewSnapshot>>;

/// One registered listener and the rules deciding which snapshots it sees.
#[derive(Debug)]
pub struct QueryListener {
    id: ListenerId,
    query: Query,
    options: ListenOptions,
    sender: SnapshotSender,
    raised_initial_event: bool,
    /// Last snapshot handed to the listener's view of the query, raised or not.
    snapshot: Option<ViewSnapshot>,
    online_state: OnlineState,
}

impl QueryListener {
    pub fn new(id: ListenerId, query: Query, options: ListenOptions, sender: SnapshotSender) -> Self {
        Self {
            id,
            query,
            options,
            sender,
            raised_initial_event: false,
            snapshot: None,
            online_state: OnlineState::Unknown,
        }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Returns true if a snapshot was delivered.
    pub fn on_view_snapshot(&mut self, snapshot: ViewSnapshot) -> bool {
        let snapshot = if self.options.include_metadata_changes {
            snapshot
        } else {
            snapshot.without_metadata_changes()
        };

        let raised = if !self.raised_initial_event {
            if self.should_raise_initial_event(&snapshot, self.online_state) {
                self.raise_initial_event(&snapshot);
                true
            } else {
                false
            }
        } else if self.should_raise_event(&snapshot) {
            self.deliver(Ok(snapshot.clone()));
            true
        } else {
            false
        };
        self.snapshot = Some(snapshot);
        raised
    }

    pub fn on_error(&mut self, error: FirestoreError) {
        self.deliver(Err(error));
        self.sender.close();
    }

    /// Returns true if a held-back initial snapshot was delivered.
    pub fn on_online_state_changed(&mut self, online_state: OnlineState) -> bool {
        self.online_state = online_state;
        match &self.snapshot {
            Some(snapshot)
                if !self.raised_initial_event
                    && self.should_raise_initial_event(snapshot, online_state) =>
            {
                let snapshot = snapshot.clone();
                self.raise_initial_event(&snapshot);
                true
            }
            _ => false,
        }
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache() {
            return true;
        }
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        // An empty from-cache result is not worth raising while the backend may still answer.
        !snapshot.documents().is_empty() || snapshot.has_cached_results() || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.changes().is_empty() {
            return true;
        }
        let pending_writes_changed = self
            .snapshot
            .as_ref()
            .is_some_and(|previous| previous.has_pending_writes() != snapshot.has_pending_writes());
        if snapshot.sync_state_changed() || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }

    fn raise_initial_event(&mut self, snapshot: &ViewSnapshot) {
        let initial = ViewSnapshot::from_initial_documents(
            snapshot.query().clone(),
            snapshot.documents().clone(),
            snapshot.mutated_keys().clone(),
            snapshot.from_cache(),
            snapshot.excludes_metadata_changes(),
            snapshot.has_cached_results(),
        );
        self.raised_initial_event = true;
        self.deliver(Ok(initial));
    }

    fn deliver(&self, event: FirestoreResult<ViewSnapshot>) {
        if self.sender.try_send(event).is_err() {
            log::debug!("firestore::event_manager: listener {} is gone", self.id);
        }
    }
}

#[derive(Debug, Default)]
struct QueryListenersInfo {
    view_snapshot: Option<ViewSnapshot>,
    listeners: Vec<QueryListener>,
}

/// Fans view snapshots out to the listeners of each query.
///
/// Queries are keyed by canonical id, so equivalent queries share one view in the sync
/// engine. The first listener of a query asks the caller to start listening and the last
/// one to stop.
#[derive(Debug)]
pub struct EventManager {
    queries: BTreeMap<String, QueryListenersInfo>,
    online_state: OnlineState,
}

impl Default for EventManager {
    fn default() -> Self {
        Self {
            queries: BTreeMap::new(),
            online_state: OnlineState::Unknown,
        }
    }
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the listener. Returns true if it is the first for its query, in which
    /// case the caller must start listening in the sync engine.
    pub fn add_query_listener(&mut self, mut listener: QueryListener) -> bool {
        let canonical_id = listener.query().canonical_id();
        let info = self.queries.entry(canonical_id).or_default();
        let first = info.listeners.is_empty();

        listener.on_online_state_changed(self.online_state);
        if let Some(snapshot) = &info.view_snapshot {
            listener.on_view_snapshot(snapshot.clone());
        }
        info.listeners.push(listener);
        first
    }

    /// Removes the listener. Returns true if it was the last for its query, in which case
    /// the caller must stop listening in the sync engine.
    pub fn remove_query_listener(&mut self, query: &Query, id: ListenerId) -> bool {
        let canonical_id = query.canonical_id();
        let Some(info) = self.queries.get_mut(&canonical_id) else {
            return false;
        };
        let before = info.listeners.len();
        info.listeners.retain(|listener| listener.id() != id);
        if info.listeners.len() == before {
            return false;
        }
        if info.listeners.is_empty() {
            self.queries.remove(&canonical_id);
            return true;
        }
        false
    }

    pub fn has_listeners(&self, query: &Query) -> bool {
        self.queries.contains_key(&query.canonical_id())
    }

    pub fn on_view_snapshots(&mut self, snapshots: Vec<ViewSnapshot>) {
        for snapshot in snapshots {
            let Some(info) = self.queries.get_mut(&snapshot.query().canonical_id()) else {
                continue;
            };
            for listener in &mut info.listeners {
                listener.on_view_snapshot(snapshot.clone());
            }
            info.view_snapshot = Some(snapshot);
        }
    }

    /// The query failed; every listener receives the error and is dropped.
    pub fn on_error(&mut self, query: &Query, error: FirestoreError) {
        if let Some(info) = self.queries.remove(&query.canonical_id()) {
            for mut listener in info.listeners {
                listener.on_error(error.clone());
            }
        }
    }

    pub fn handle_online_state_change(&mut self, online_state: OnlineState) {
        self.online_state = online_state;
        for info in self.queries.values_mut() {
            for listener in &mut info.listeners {
                listener.on_online_state_changed(online_state);
            }
        }
    }

    /// Closes every listener's channel.
    pub fn clear(&mut self) {
        for info in std::mem::take(&mut self.queries).into_values() {
            for listener in info.listeners {
                listener.sender.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap as Map, BTreeSet};

    use super::*;
    use crate::firestore::core::View;
    use crate::firestore::error::permission_denied;
    use crate::firestore::model::{Document, DocumentKey, DocumentMap, SnapshotVersion};
    use crate::firestore::remote::TargetChange;
    use crate::firestore::value::ObjectValue;
    use async_channel::Receiver;

    fn query() -> Query {
        Query::collection("rooms").unwrap()
    }

    fn listener(id: ListenerId, options: ListenOptions) -> (QueryListener, Receiver<FirestoreResult<ViewSnapshot>>) {
        let (sender, receiver) = async_channel::unbounded();
        (QueryListener::new(id, query(), options, sender), receiver)
    }

    fn doc(path: &str) -> Document {
        Document::new_found(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(1),
            ObjectValue::from_map(Map::new()),
        )
    }

    fn snapshot(view: &mut View, docs: &[Document], current: bool) -> ViewSnapshot {
        let changes: DocumentMap = docs.iter().map(|doc| (doc.key().clone(), doc.clone())).collect();
        let computed = view.compute_doc_changes(&changes, None).unwrap();
        let mut target_change = TargetChange::create_synthesized(current);
        target_change.added_documents = docs.iter().map(|doc| doc.key().clone()).collect();
        view.apply_changes(computed, Some(&target_change))
            .unwrap()
            .snapshot
            .unwrap()
    }

    #[test]
    fn empty_cache_snapshot_waits_until_offline() {
        let mut manager = EventManager::new();
        let (listener, receiver) = listener(1, ListenOptions::default());
        assert!(manager.add_query_listener(listener));

        let mut view = View::new(query(), BTreeSet::new());
        manager.on_view_snapshots(vec![snapshot(&mut view, &[], false)]);
        assert!(receiver.try_recv().is_err());

        manager.handle_online_state_change(OnlineState::Offline);
        let delivered = receiver.try_recv().unwrap().unwrap();
        assert!(delivered.from_cache());
        assert!(delivered.documents().is_empty());
    }

    #[test]
    fn cached_documents_are_raised_immediately() {
        let mut manager = EventManager::new();
        let (listener, receiver) = listener(1, ListenOptions::default());
        manager.add_query_listener(listener);

        let mut view = View::new(query(), BTreeSet::new());
        manager.on_view_snapshots(vec![snapshot(&mut view, &[doc("rooms/a")], false)]);
        let delivered = receiver.try_recv().unwrap().unwrap();
        assert_eq!(delivered.documents().len(), 1);
        assert!(delivered.from_cache());
    }

    #[test]
    fn sync_state_change_only_reaches_metadata_listeners() {
        let mut manager = EventManager::new();
        let (plain, plain_rx) = listener(1, ListenOptions::default());
        let (metadata, metadata_rx) = listener(2, ListenOptions::default().with_metadata_changes());
        manager.add_query_listener(plain);
        assert!(!manager.add_query_listener(metadata));

        let mut view = View::new(query(), BTreeSet::new());
        let a = doc("rooms/a");
        manager.on_view_snapshots(vec![snapshot(&mut view, &[a.clone()], false)]);
        manager.on_view_snapshots(vec![snapshot(&mut view, &[], true)]);

        assert!(plain_rx.try_recv().is_ok());
        assert!(plain_rx.try_recv().is_err());
        assert!(metadata_rx.try_recv().is_ok());
        let synced = metadata_rx.try_recv().unwrap().unwrap();
        assert!(!synced.from_cache());
    }

    #[test]
    fn late_listener_gets_existing_results() {
        let mut manager = EventManager::new();
        let (first, _first_rx) = listener(1, ListenOptions::default());
        manager.add_query_listener(first);
        let mut view = View::new(query(), BTreeSet::new());
        manager.on_view_snapshots(vec![snapshot(&mut view, &[doc("rooms/a")], true)]);

        let (second, second_rx) = listener(2, ListenOptions::default());
        assert!(!manager.add_query_listener(second));
        let delivered = second_rx.try_recv().unwrap().unwrap();
        assert_eq!(delivered.changes().len(), 1);

        assert!(!manager.remove_query_listener(&query(), 1));
        assert!(manager.remove_query_listener(&query(), 2));
        assert!(!manager.has_listeners(&query()));
    }

    #[test]
    fn errors_close_the_listener() {
        let mut manager = EventManager::new();
        let (listener, receiver) = listener(1, ListenOptions::default());
        manager.add_query_listener(listener);
        manager.on_error(&query(), permission_denied("no access"));

        let err = receiver.try_recv().unwrap().unwrap_err();
        assert_eq!(err.code_str(), "firestore/permission-denied");
        assert!(receiver.is_closed());
        assert!(!manager.has_listeners(&query()));
    }
}
