use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::firestore::error::{data_loss, FirestoreResult};
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::journal::JournaledMap;
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::local::target_cache::{TargetCache, TargetCounters};
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::{Document, DocumentKey, SnapshotVersion};

pub const SCHEMA_VERSION: u32 = 1;

/// Everything the local store keeps durably.
///
/// Logical keyspaces: documents by key, mutation batches by id (with a by-key index that
/// is rebuilt on load), targets by id with their document associations, field index
/// entries and per-document LRU sequence numbers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedState {
    pub schema_version: u32,
    pub remote_documents: RemoteDocumentCache,
    pub mutation_queue: MutationQueue,
    pub target_cache: TargetCache,
    pub index_manager: IndexManager,
    /// Listen sequence number of the last time each document lost a reference.
    #[serde(default)]
    pub document_sequence_numbers: JournaledMap<DocumentKey, i64>,
    #[serde(skip)]
    transaction: Option<OpenTransaction>,
}

/// Marks of the open transaction that let the state describe what it changed.
#[derive(Clone, Copy, Debug)]
struct OpenTransaction {
    queue_revision: u64,
    reconfigures_indexes: bool,
}

/// What one transaction changed, in a form that can be stored and replayed.
///
/// Documents, sequence numbers and targets are listed per key. The mutation queue
/// and the index configuration are small and are stored whole when they changed.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StateDelta {
    #[serde(default)]
    documents: Vec<(DocumentKey, Option<Document>)>,
    #[serde(default)]
    sequence_numbers: Vec<(DocumentKey, Option<i64>)>,
    #[serde(default)]
    targets: Vec<(i32, Option<TargetData>)>,
    #[serde(default)]
    target_documents: Vec<(i32, Option<BTreeSet<DocumentKey>>)>,
    target_counters: Option<TargetCounters>,
    mutation_queue: Option<MutationQueue>,
    index_manager: Option<IndexManager>,
}

impl StateDelta {
    pub fn document_count(&self) -> usize {
        self.documents.len()
    }
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            remote_documents: RemoteDocumentCache::default(),
            mutation_queue: MutationQueue::default(),
            target_cache: TargetCache::default(),
            index_manager: IndexManager::default(),
            document_sequence_numbers: JournaledMap::new(),
            transaction: None,
        }
    }
}

impl PersistedState {
    /// Restores the secondary indexes that are not stored and checks the loaded data.
    pub fn rebuild_indexes(&mut self) -> FirestoreResult<()> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(data_loss(format!(
                "Unsupported local store schema version {} (expected {SCHEMA_VERSION})",
                self.schema_version
            )));
        }
        self.mutation_queue.rebuild_index()?;
        self.target_cache.rebuild_index()?;
        self.index_manager.rebuild_index();
        Ok(())
    }
}

/// What a write transaction needs to put [`PersistedState`] back as it found it.
///
/// Documents, target associations and sequence numbers keep their own undo journals.
/// The mutation queue holds only pending writes and is copied whole.
#[derive(Debug)]
pub(crate) struct PersistedSavepoint {
    mutation_queue: MutationQueue,
    targets: TargetCounters,
    index_watermarks: Vec<SnapshotVersion>,
    /// Full copy, taken only when the transaction may reconfigure the indexes.
    index_manager: Option<IndexManager>,
}

impl PersistedState {
    pub(crate) fn begin(&mut self, snapshot_indexes: bool) -> PersistedSavepoint {
        self.remote_documents.begin();
        self.document_sequence_numbers.begin();
        self.transaction = Some(OpenTransaction {
            queue_revision: self.mutation_queue.revision(),
            reconfigures_indexes: snapshot_indexes,
        });
        PersistedSavepoint {
            mutation_queue: self.mutation_queue.clone(),
            targets: self.target_cache.begin(),
            index_watermarks: self.index_manager.watermarks(),
            index_manager: snapshot_indexes.then(|| self.index_manager.clone()),
        }
    }

    /// True when the open transaction changed anything that is stored.
    pub(crate) fn has_changes(&self, savepoint: &PersistedSavepoint) -> bool {
        self.remote_documents.is_dirty()
            || self.document_sequence_numbers.is_dirty()
            || self.mutation_queue.revision() != savepoint.mutation_queue.revision()
            || self.target_cache.has_changes_since(&savepoint.targets)
            || savepoint
                .index_manager
                .as_ref()
                .is_some_and(|indexes| indexes.field_indexes() != self.index_manager.field_indexes())
    }

    /// Changes of the open transaction. Without one, the mutation queue and the target
    /// counters are reported whole.
    pub fn pending_delta(&self) -> StateDelta {
        let queue_changed = self
            .transaction
            .map_or(true, |open| open.queue_revision != self.mutation_queue.revision());
        let reconfigures_indexes = self
            .transaction
            .is_some_and(|open| open.reconfigures_indexes);
        StateDelta {
            documents: self.remote_documents.pending_changes(),
            sequence_numbers: self.document_sequence_numbers.pending_changes(),
            targets: self.target_cache.pending_target_changes(),
            target_documents: self.target_cache.pending_document_changes(),
            target_counters: Some(self.target_cache.counters()),
            mutation_queue: queue_changed.then(|| self.mutation_queue.clone()),
            index_manager: reconfigures_indexes.then(|| self.index_manager.clone()),
        }
    }

    /// Replays a stored delta. Call `rebuild_indexes` once replay is done.
    pub fn apply_delta(&mut self, delta: StateDelta) {
        if let Some(mut index_manager) = delta.index_manager {
            index_manager.rebuild_index();
            self.index_manager = index_manager;
        }
        for (key, doc) in delta.documents {
            match doc {
                Some(doc) => {
                    self.index_manager.update_document(&doc);
                    self.remote_documents.restore(doc);
                }
                None => {
                    self.remote_documents.remove(&key);
                    self.index_manager.remove_document(&key);
                }
            }
        }
        for (key, sequence_number) in delta.sequence_numbers {
            match sequence_number {
                Some(sequence_number) => self.document_sequence_numbers.insert(key, sequence_number),
                None => self.document_sequence_numbers.remove(&key),
            };
        }
        let counters = delta
            .target_counters
            .unwrap_or_else(|| self.target_cache.counters());
        self.target_cache
            .restore(delta.targets, delta.target_documents, counters);
        if let Some(mutation_queue) = delta.mutation_queue {
            self.mutation_queue = mutation_queue;
        }
    }

    pub(crate) fn commit(&mut self) {
        self.transaction = None;
        self.remote_documents.commit();
        self.document_sequence_numbers.commit();
        self.target_cache.commit();
    }

    pub(crate) fn rollback(&mut self, savepoint: PersistedSavepoint) {
        self.transaction = None;
        let touched = self.remote_documents.rollback();
        self.document_sequence_numbers.rollback();
        self.target_cache.rollback(savepoint.targets);
        self.mutation_queue = savepoint.mutation_queue;
        match savepoint.index_manager {
            Some(indexes) => self.index_manager = indexes,
            None => {
                // Index entries follow the cached documents, so re-deriving them for
                // the restored documents undoes the transaction.
                for key in &touched {
                    self.index_manager.remove_document(key);
                    if let Some(doc) = self.remote_documents.get_cached(key) {
                        self.index_manager.update_document(doc);
                    }
                }
                self.index_manager.restore_watermarks(&savepoint.index_watermarks);
            }
        }
    }
}

/// Storage backend for the local store.
///
/// The local store keeps the working state in memory and hands it to `commit` at the
/// end of every write transaction that changed stored data. While `commit` runs,
/// [`PersistedState::pending_delta`] describes what the transaction changed. A failed
/// commit aborts the transaction; the local store rolls its in-memory state back.
pub trait Persistence: Send {
    fn load(&mut self) -> FirestoreResult<Option<PersistedState>>;

    fn commit(&mut self, action: &str, state: &PersistedState) -> FirestoreResult<()>;

    /// False for volatile backends.
    fn is_durable(&self) -> bool;

    fn shutdown(&mut self) -> FirestoreResult<()> {
        Ok(())
    }
}

/// Volatile backend: transactions apply in order and nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    commits: u64,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed transactions.
    pub fn commit_count(&self) -> u64 {
        self.commits
    }
}

impl Persistence for MemoryPersistence {
    fn load(&mut self) -> FirestoreResult<Option<PersistedState>> {
        Ok(None)
    }

    fn commit(&mut self, action: &str, _state: &PersistedState) -> FirestoreResult<()> {
        self.commits += 1;
        log::trace!("firestore::persistence: committed '{action}' in memory");
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }
}
