pub mod connection;
mod online_state_tracker;
mod persistent_stream;
mod remote_event;
mod remote_store;
mod remote_syncer;
pub mod watch_change;
mod watch_change_aggregator;

pub use connection::{ChannelConnection, RemoteConnection, StreamEvent, StreamRequest};
pub use online_state_tracker::{OnlineState, OnlineStateTracker};
pub use persistent_stream::{PersistentStream, StreamKind, StreamState};
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::{
    RemoteStore, RemoteStoreConfig, RemoteStoreEvent, DEFAULT_IDLE_TIMEOUT,
    DEFAULT_ONLINE_STATE_TIMEOUT,
};
pub use remote_syncer::RemoteSyncer;
pub use watch_change::{
    DocumentChange, DocumentDelete, DocumentRemove, ExistenceFilterChange, TargetChangeState,
    WatchChange, WatchTargetChange,
};
pub use watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
