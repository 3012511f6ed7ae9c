use crate::firestore::error::FirestoreError;
use crate::firestore::model::{Document, DocumentKey, SnapshotVersion};

/// One decoded message from the watch stream.
#[derive(Debug, Clone)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    /// A document was added to or modified in the listed targets.
    DocumentChange(DocumentChange),
    /// The document was deleted; it leaves the listed targets.
    DocumentDelete(DocumentDelete),
    /// The document no longer matches the listed targets but may still exist.
    DocumentRemove(DocumentRemove),
    ExistenceFilter(ExistenceFilterChange),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetChangeState {
    NoChange,
    Add,
    Remove,
    Current,
    Reset,
}

#[derive(Debug, Clone)]
pub struct WatchTargetChange {
    pub state: TargetChangeState,
    /// Empty means "every target".
    pub target_ids: Vec<i32>,
    pub resume_token: Vec<u8>,
    /// Only meaningful for a global `NoChange` (no target ids): the version the whole
    /// stream is consistent at.
    pub read_time: SnapshotVersion,
    /// Set when the backend removes a target because it rejected it.
    pub cause: Option<FirestoreError>,
}

impl WatchTargetChange {
    pub fn new(state: TargetChangeState, target_ids: Vec<i32>) -> Self {
        Self {
            state,
            target_ids,
            resume_token: Vec::new(),
            read_time: SnapshotVersion::NONE,
            cause: None,
        }
    }

    /// A global consistency marker: everything before it is consistent at `read_time`.
    pub fn global_snapshot(read_time: SnapshotVersion, resume_token: Vec<u8>) -> Self {
        Self {
            resume_token,
            read_time,
            ..Self::new(TargetChangeState::NoChange, Vec::new())
        }
    }

    pub fn with_resume_token(mut self, resume_token: Vec<u8>) -> Self {
        self.resume_token = resume_token;
        self
    }

    pub fn with_cause(mut self, cause: FirestoreError) -> Self {
        self.cause = Some(cause);
        self
    }
}

#[derive(Debug, Clone)]
pub struct DocumentChange {
    pub updated_target_ids: Vec<i32>,
    pub removed_target_ids: Vec<i32>,
    /// A found document carrying its backend version.
    pub document: Document,
}

#[derive(Debug, Clone)]
pub struct DocumentDelete {
    pub key: DocumentKey,
    pub read_time: SnapshotVersion,
    pub removed_target_ids: Vec<i32>,
}

#[derive(Debug, Clone)]
pub struct DocumentRemove {
    pub key: DocumentKey,
    pub removed_target_ids: Vec<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExistenceFilterChange {
    pub target_id: i32,
    /// Number of documents the backend says match the target.
    pub count: i32,
}

impl WatchChange {
    /// The version a whole batch of changes is consistent at, or `NONE` if this message
    /// does not close a batch.
    pub fn snapshot_version(&self) -> SnapshotVersion {
        match self {
            WatchChange::TargetChange(change)
                if change.state == TargetChangeState::NoChange && change.target_ids.is_empty() =>
            {
                change.read_time
            }
            _ => SnapshotVersion::NONE,
        }
    }
}
