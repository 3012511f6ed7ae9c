use std::collections::BTreeSet;

use crate::firestore::model::DocumentKey;

/// Callbacks the remote store needs from the layer above it.
///
/// Everything else flows upward as [`RemoteStoreEvent`](super::RemoteStoreEvent)s; only
/// the query membership lookup must be answered synchronously while a watch change is
/// being aggregated.
pub trait RemoteSyncer {
    /// Keys the backend has reported for the target, as tracked by the views (or the
    /// resolved document for a limbo target).
    fn get_remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey>;
}
