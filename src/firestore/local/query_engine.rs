use std::collections::BTreeSet;

use crate::firestore::core::{LimitType, Query};
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::model::{Document, DocumentKey, DocumentMap, DocumentSet, SnapshotVersion};

/// Which strategy produced a query result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryStrategy {
    Index,
    PreviousResults,
    FullScan,
}

/// Runs queries against the local cache, picking the cheapest strategy that is sound.
///
/// Results contain every local match; the view applies limits.
pub struct QueryEngine<'a> {
    local_documents: LocalDocumentsView<'a>,
    index_manager: &'a IndexManager,
}

impl<'a> QueryEngine<'a> {
    pub fn new(local_documents: LocalDocumentsView<'a>, index_manager: &'a IndexManager) -> Self {
        Self {
            local_documents,
            index_manager,
        }
    }

    pub fn get_documents_matching_query(
        &self,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &BTreeSet<DocumentKey>,
    ) -> (DocumentMap, QueryStrategy) {
        if let Some(result) = self.perform_query_using_index(query) {
            return (result, QueryStrategy::Index);
        }
        if let Some(result) =
            self.perform_query_using_remote_keys(query, remote_keys, last_limbo_free_snapshot_version)
        {
            return (result, QueryStrategy::PreviousResults);
        }
        (
            self.execute_full_collection_scan(query),
            QueryStrategy::FullScan,
        )
    }

    fn perform_query_using_index(&self, query: &Query) -> Option<DocumentMap> {
        if query.matches_all_documents() {
            return None;
        }
        let candidates = self.index_manager.get_documents_matching_query(query)?;
        // The index only sees remote documents; pending writes are added back here.
        let mut keys = candidates;
        keys.extend(self.local_documents.mutated_keys_for_query(query));
        let mut docs = self.local_documents.get_documents(keys.iter());
        docs.retain(|_, doc| query.matches(doc));
        Some(docs)
    }

    /// Reuses the keys the backend last reported for the target, plus anything that
    /// changed locally since the last limbo-free snapshot.
    fn perform_query_using_remote_keys(
        &self,
        query: &Query,
        remote_keys: &BTreeSet<DocumentKey>,
        last_limbo_free_snapshot_version: SnapshotVersion,
    ) -> Option<DocumentMap> {
        if query.matches_all_documents() {
            return None;
        }
        if last_limbo_free_snapshot_version.is_none() {
            return None;
        }

        let documents = self.local_documents.get_documents(remote_keys.iter());
        let previous_results = apply_query(query, documents.into_values());
        if query.has_limit()
            && needs_refill(
                query,
                &previous_results,
                remote_keys,
                last_limbo_free_snapshot_version,
            )
        {
            return None;
        }

        log::debug!(
            "firestore::query_engine: re-using previous results for {query} (last limbo free at {last_limbo_free_snapshot_version})"
        );
        let mut results = self
            .local_documents
            .get_documents_matching_query(query, last_limbo_free_snapshot_version);
        for doc in previous_results.iter() {
            results.insert(doc.key().clone(), doc.clone());
        }
        Some(results)
    }

    fn execute_full_collection_scan(&self, query: &Query) -> DocumentMap {
        log::debug!("firestore::query_engine: using full collection scan for {query}");
        self.local_documents
            .get_documents_matching_query(query, SnapshotVersion::NONE)
    }
}

fn apply_query<I>(query: &Query, documents: I) -> DocumentSet
where
    I: IntoIterator<Item = Document>,
{
    let mut set = DocumentSet::new(query.comparator());
    for doc in documents {
        if query.matches(&doc) {
            set.insert(doc);
        }
    }
    set
}

/// Whether previous results of a limit query may be missing documents.
///
/// A document that left the result set (fewer local matches than remote keys) could
/// have been replaced by one we never saw. So could the edge document if it changed
/// after the last limbo-free snapshot.
fn needs_refill(
    query: &Query,
    sorted_previous_results: &DocumentSet,
    remote_keys: &BTreeSet<DocumentKey>,
    limbo_free_snapshot_version: SnapshotVersion,
) -> bool {
    if remote_keys.len() != sorted_previous_results.len() {
        return true;
    }
    let edge = match query.limit_type() {
        LimitType::First => sorted_previous_results.last(),
        LimitType::Last => sorted_previous_results.first(),
    };
    match edge {
        None => false,
        Some(doc) => doc.has_pending_writes() || doc.version() > limbo_free_snapshot_version,
    }
}
