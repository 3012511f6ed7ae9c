//! Durable client-side state: cached documents, pending writes, targets and the
//! indexes and garbage collection built on top of them.

mod file_persistence;
mod index_manager;
mod journal;
mod local_documents_view;
mod local_store;
mod local_view_changes;
mod lru_garbage_collector;
mod mutation_queue;
mod persistence;
mod query_engine;
mod reference_set;
mod remote_document_cache;
mod target_cache;
mod target_data;

pub use file_persistence::FilePersistence;
pub use index_manager::{FieldIndex, IndexKind, IndexManager, IndexSegment};
pub use journal::JournaledMap;
pub use local_documents_view::LocalDocumentsView;
pub use local_store::{LocalStore, LocalWriteResult, QueryResult};
pub use local_view_changes::LocalViewChanges;
pub use lru_garbage_collector::{
    GarbageCollectorSettings, LruParams, LruResults, COLLECTION_DISABLED, DEFAULT_CACHE_SIZE_BYTES,
};
pub use mutation_queue::MutationQueue;
pub use persistence::{MemoryPersistence, PersistedState, Persistence, StateDelta, SCHEMA_VERSION};
pub use query_engine::{QueryEngine, QueryStrategy};
pub use reference_set::{DocumentReferences, ReferenceCounts, ReferenceKind, ReferenceSet};
pub use remote_document_cache::RemoteDocumentCache;
pub use target_cache::TargetCache;
pub use target_data::{QueryPurpose, TargetData};
