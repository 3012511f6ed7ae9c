//! Query views, listener fan-out and the sync engine that ties the local and remote
//! stores together, plus the async client facade over all of it.

mod event_manager;
mod firestore_client;
mod query;
mod settings;
mod sync_engine;
mod target_id_generator;
mod timer;
mod view;
mod view_snapshot;

pub use event_manager::{EventManager, ListenOptions, ListenerId, QueryListener, SnapshotSender};
pub use firestore_client::{FirestoreClient, QuerySubscription};
pub use query::{
    apply_query_to_documents, Bound, Direction, FieldFilter, FilterOperator, LimitType, OrderBy, Query,
};
pub use settings::{
    CacheSettings, FirestoreSettings, DEFAULT_GC_INITIAL_DELAY, DEFAULT_GC_REGULAR_DELAY,
    DEFAULT_LIMBO_RESOLUTION_TIMEOUT, DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
};
pub use sync_engine::{SyncEngine, SyncEngineConfig, SyncEngineEvent, WriteAcknowledgement};
pub use target_id_generator::TargetIdGenerator;
pub use timer::{DelayedTask, TimerId, TimerRegistry};
pub use view::{LimboDocumentChange, View, ViewChange, ViewDocumentChanges};
pub use view_snapshot::{ChangeType, DocumentViewChange, DocumentViewChangeSet, ViewSnapshot};
