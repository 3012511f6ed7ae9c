use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::firestore::model::FieldPath;

/// Set of field paths touched by a patch or a local write.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FieldMask {
    paths: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn from_paths<I>(paths: I) -> Self
    where
        I: IntoIterator<Item = FieldPath>,
    {
        Self {
            paths: paths.into_iter().collect(),
        }
    }

    pub fn paths(&self) -> &BTreeSet<FieldPath> {
        &self.paths
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// True if `path` equals or sits below one of the mask entries.
    pub fn covers(&self, path: &FieldPath) -> bool {
        self.paths.iter().any(|mask| mask.is_prefix_of(path))
    }

    pub fn union(&self, other: &FieldMask) -> FieldMask {
        Self {
            paths: self.paths.union(&other.paths).cloned().collect(),
        }
    }

    pub fn insert(&mut self, path: FieldPath) {
        self.paths.insert(path);
    }
}
