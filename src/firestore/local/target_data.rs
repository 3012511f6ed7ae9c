use serde::{Deserialize, Serialize};

use crate::firestore::core::Query;
use crate::firestore::model::SnapshotVersion;
use crate::firestore::value::base64_bytes;

/// Why a target is being listened to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryPurpose {
    /// A regular, user-initiated listen.
    Listen,
    /// The target was re-listened after the watch count diverged from the local count.
    ExistenceFilterMismatch,
    /// A single-document listen resolving whether a limbo document still exists.
    LimboResolution,
}

/// Cached metadata about a target, as stored in the target cache.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetData {
    pub query: Query,
    pub target_id: i32,
    /// Listen sequence number of the last time the target was used; drives LRU eviction.
    pub sequence_number: i64,
    pub purpose: QueryPurpose,
    /// Version at which `resume_token` was issued.
    pub snapshot_version: SnapshotVersion,
    /// Last version at which the target was known to have no limbo documents.
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    #[serde(with = "base64_bytes")]
    pub resume_token: Vec<u8>,
}

impl TargetData {
    pub fn new(query: Query, target_id: i32, sequence_number: i64, purpose: QueryPurpose) -> Self {
        Self {
            query,
            target_id,
            sequence_number,
            purpose,
            snapshot_version: SnapshotVersion::NONE,
            last_limbo_free_snapshot_version: SnapshotVersion::NONE,
            resume_token: Vec::new(),
        }
    }

    pub fn with_sequence_number(&self, sequence_number: i64) -> Self {
        Self {
            sequence_number,
            ..self.clone()
        }
    }

    pub fn with_resume_token(&self, resume_token: Vec<u8>, snapshot_version: SnapshotVersion) -> Self {
        Self {
            resume_token,
            snapshot_version,
            ..self.clone()
        }
    }

    pub fn with_last_limbo_free_snapshot_version(&self, version: SnapshotVersion) -> Self {
        Self {
            last_limbo_free_snapshot_version: version,
            ..self.clone()
        }
    }

    pub fn with_purpose(&self, purpose: QueryPurpose) -> Self {
        Self {
            purpose,
            ..self.clone()
        }
    }
}
