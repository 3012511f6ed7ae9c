use std::collections::BTreeSet;

use crate::firestore::core::{ChangeType, ViewSnapshot};
use crate::firestore::model::DocumentKey;

/// Documents that entered or left a view, reported back to the local store so it can
/// pin them against garbage collection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalViewChanges {
    pub target_id: i32,
    pub from_cache: bool,
    pub added: BTreeSet<DocumentKey>,
    pub removed: BTreeSet<DocumentKey>,
}

impl LocalViewChanges {
    pub fn from_view_snapshot(target_id: i32, snapshot: &ViewSnapshot) -> Self {
        let mut added = BTreeSet::new();
        let mut removed = BTreeSet::new();
        for change in snapshot.changes() {
            match change.change_type {
                ChangeType::Added => {
                    added.insert(change.document.key().clone());
                }
                ChangeType::Removed => {
                    removed.insert(change.document.key().clone());
                }
                ChangeType::Modified | ChangeType::Metadata => {}
            }
        }
        Self {
            target_id,
            from_cache: snapshot.from_cache(),
            added,
            removed,
        }
    }
}
