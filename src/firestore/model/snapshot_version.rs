use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::firestore::model::Timestamp;

/// Logical clock attached to documents and remote events.
///
/// Versions come from the backend's commit/read timestamps and are totally ordered.
/// [`SnapshotVersion::NONE`] sorts before every real version.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct SnapshotVersion(Timestamp);

impl SnapshotVersion {
    pub const NONE: SnapshotVersion = SnapshotVersion(Timestamp {
        seconds: 0,
        nanos: 0,
    });

    pub fn new(timestamp: Timestamp) -> Self {
        Self(timestamp)
    }

    /// Convenience for tests and fixtures that think in microseconds.
    pub fn from_micros(micros: i64) -> Self {
        Self(Timestamp::from_micros(micros))
    }

    pub fn timestamp(&self) -> Timestamp {
        self.0
    }

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }
}

impl Display for SnapshotVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SnapshotVersion({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_sorts_first() {
        assert!(SnapshotVersion::NONE < SnapshotVersion::from_micros(1));
        assert!(SnapshotVersion::NONE.is_none());
        assert!(!SnapshotVersion::from_micros(5).is_none());
    }
}
