use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::model::{Document, DocumentKey, SnapshotVersion};

/// Aggregated result of a consistent batch of watch changes.
#[derive(Debug, Clone, Default)]
pub struct RemoteEvent {
    /// Version the watch stream is consistent at; every target below is at this version.
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<i32, TargetChange>,
    /// Targets whose existence filter count did not match; their cached membership is
    /// stale and they have been re-listened from scratch.
    pub target_mismatches: BTreeSet<i32>,
    /// Latest state of every changed document, stamped with `snapshot_version` as read time.
    pub document_updates: BTreeMap<DocumentKey, Document>,
    /// Documents whose limbo targets delivered a result (found or deleted).
    pub resolved_limbo_documents: BTreeSet<DocumentKey>,
}

impl RemoteEvent {
    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty()
            && self.document_updates.is_empty()
            && self.target_mismatches.is_empty()
            && self.resolved_limbo_documents.is_empty()
    }
}

/// What changed for one target within a remote event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetChange {
    /// Empty when the backend did not send a new token.
    pub resume_token: Vec<u8>,
    /// The target's result set is complete and consistent at the event's version.
    pub current: bool,
    pub added_documents: BTreeSet<DocumentKey>,
    pub modified_documents: BTreeSet<DocumentKey>,
    pub removed_documents: BTreeSet<DocumentKey>,
}

impl TargetChange {
    /// A change that only marks the target current; used for synthesized events.
    pub fn create_synthesized(current: bool) -> Self {
        Self {
            current,
            ..Self::default()
        }
    }

    pub fn change_count(&self) -> usize {
        self.added_documents.len() + self.modified_documents.len() + self.removed_documents.len()
    }
}
