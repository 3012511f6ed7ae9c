use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::local::persistence::PersistedState;
use crate::firestore::local::reference_set::{ReferenceCounts, ReferenceKind};

pub const DEFAULT_CACHE_SIZE_BYTES: i64 = 100 * 1024 * 1024;
pub const COLLECTION_DISABLED: i64 = -1;
const DEFAULT_PERCENTILE_TO_COLLECT: u32 = 10;
const DEFAULT_MAX_SEQUENCE_NUMBERS_TO_COLLECT: usize = 1_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LruParams {
    /// Cache size above which collection runs; [`COLLECTION_DISABLED`] turns it off.
    pub threshold_bytes: i64,
    pub percentile_to_collect: u32,
    pub maximum_sequence_numbers_to_collect: usize,
}

impl Default for LruParams {
    fn default() -> Self {
        Self {
            threshold_bytes: DEFAULT_CACHE_SIZE_BYTES,
            percentile_to_collect: DEFAULT_PERCENTILE_TO_COLLECT,
            maximum_sequence_numbers_to_collect: DEFAULT_MAX_SEQUENCE_NUMBERS_TO_COLLECT,
        }
    }
}

impl LruParams {
    pub fn disabled() -> Self {
        Self {
            threshold_bytes: COLLECTION_DISABLED,
            ..Self::default()
        }
    }

    pub fn with_cache_size(threshold_bytes: i64) -> Self {
        Self {
            threshold_bytes,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> FirestoreResult<()> {
        if self.percentile_to_collect == 0 || self.percentile_to_collect > 100 {
            return Err(invalid_argument(format!(
                "percentile_to_collect must be in (0, 100], got {}",
                self.percentile_to_collect
            )));
        }
        if self.threshold_bytes < COLLECTION_DISABLED {
            return Err(invalid_argument("threshold_bytes must be -1 or non-negative"));
        }
        Ok(())
    }
}

/// How unreferenced documents and released targets are reclaimed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum GarbageCollectorSettings {
    /// Documents go as soon as nothing references them; released targets are dropped.
    #[default]
    Eager,
    /// Released targets stay cached until the cache grows past the threshold.
    Lru(LruParams),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LruResults {
    pub has_run: bool,
    pub sequence_numbers_collected: usize,
    pub targets_removed: usize,
    pub documents_removed: usize,
}

impl LruResults {
    pub fn did_not_run() -> Self {
        Self::default()
    }
}

/// Removes the least recently used targets and orphaned documents once the cache
/// exceeds the threshold. Targets in `active_target_ids` are never removed.
pub(crate) fn run_lru_collection(
    params: &LruParams,
    state: &mut PersistedState,
    references: &mut ReferenceCounts,
    active_target_ids: &BTreeSet<i32>,
) -> LruResults {
    if params.threshold_bytes == COLLECTION_DISABLED {
        log::debug!("firestore::lru_gc: collection disabled");
        return LruResults::did_not_run();
    }
    let cache_size = state.remote_documents.byte_size() as i64;
    if cache_size < params.threshold_bytes {
        log::debug!(
            "firestore::lru_gc: cache size {cache_size} below threshold {}",
            params.threshold_bytes
        );
        return LruResults::did_not_run();
    }

    let mut sequence_numbers: Vec<i64> = state
        .target_cache
        .targets()
        .filter(|target| !active_target_ids.contains(&target.target_id))
        .map(|target| target.sequence_number)
        .collect();
    sequence_numbers.extend(
        state
            .remote_documents
            .documents()
            .filter(|doc| !references.is_referenced(doc.key()))
            .map(|doc| {
                state
                    .document_sequence_numbers
                    .get(doc.key())
                    .copied()
                    .unwrap_or(0)
            }),
    );
    sequence_numbers.sort_unstable();
    sequence_numbers.dedup();

    let to_collect = (sequence_numbers.len() * params.percentile_to_collect as usize / 100)
        .min(params.maximum_sequence_numbers_to_collect);
    if to_collect == 0 {
        return LruResults {
            has_run: true,
            ..LruResults::default()
        };
    }
    let upper_bound = sequence_numbers[to_collect - 1];

    let stale_targets: Vec<(i32, i64)> = state
        .target_cache
        .targets()
        .filter(|target| {
            target.sequence_number <= upper_bound && !active_target_ids.contains(&target.target_id)
        })
        .map(|target| (target.target_id, target.sequence_number))
        .collect();
    for (target_id, sequence_number) in &stale_targets {
        for key in state.target_cache.remove_target_data(*target_id) {
            references.decrement(&key, ReferenceKind::Target);
            let previous = state.document_sequence_numbers.get(&key).copied().unwrap_or(0);
            state
                .document_sequence_numbers
                .insert(key, previous.max(*sequence_number));
        }
    }

    let stale_documents: Vec<_> = state
        .remote_documents
        .keys()
        .into_iter()
        .filter(|key| !references.is_referenced(key))
        .filter(|key| state.document_sequence_numbers.get(key).copied().unwrap_or(0) <= upper_bound)
        .collect();
    for key in &stale_documents {
        state.remote_documents.remove(key);
        state.index_manager.remove_document(key);
        state.document_sequence_numbers.remove(key);
        references.clear_orphan(key);
    }

    let results = LruResults {
        has_run: true,
        sequence_numbers_collected: to_collect,
        targets_removed: stale_targets.len(),
        documents_removed: stale_documents.len(),
    };
    log::debug!("firestore::lru_gc: {results:?}");
    results
}
