//! Offline-first document sync engine: a durable local cache reconciled against a remote
//! watch stream, with live query views over the merged state.

pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;
pub mod value;

#[cfg(test)]
pub(crate) mod test_support;

pub use self::core::{
    CacheSettings, FirestoreClient, FirestoreSettings, ListenOptions, Query, QuerySubscription, ViewSnapshot,
};
pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
