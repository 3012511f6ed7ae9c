use std::collections::BTreeSet;

use crate::firestore::core::Query;
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::model::mutation::MutationBatch;
use crate::firestore::model::{Document, DocumentKey, DocumentMap, SnapshotVersion};

/// Read-only view combining remote documents with pending local mutations.
///
/// Batches are folded in ascending batch id order, which is the order they were
/// written in.
pub struct LocalDocumentsView<'a> {
    remote_documents: &'a RemoteDocumentCache,
    mutation_queue: &'a MutationQueue,
}

impl<'a> LocalDocumentsView<'a> {
    pub fn new(remote_documents: &'a RemoteDocumentCache, mutation_queue: &'a MutationQueue) -> Self {
        Self {
            remote_documents,
            mutation_queue,
        }
    }

    /// Local view of one document; invalid if nothing is known about it.
    pub fn get_document(&self, key: &DocumentKey) -> Document {
        let batches = self.mutation_queue.get_all_mutation_batches_affecting_key(key);
        let mut doc = self.remote_documents.get(key);
        apply_batches(&mut doc, &batches);
        doc
    }

    pub fn get_documents<'k, I>(&self, keys: I) -> DocumentMap
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        let docs = self.remote_documents.get_all(keys);
        self.get_local_view_of_documents(docs)
    }

    /// Applies pending batches on top of the given remote documents.
    pub fn get_local_view_of_documents(&self, mut docs: DocumentMap) -> DocumentMap {
        let batches = self
            .mutation_queue
            .get_all_mutation_batches_affecting_keys(docs.keys());
        for doc in docs.values_mut() {
            apply_batches(doc, &batches);
        }
        docs
    }

    /// Documents matching `query` in the local view, limited to remote documents read
    /// after `since_read_time` plus every document with pending mutations.
    pub fn get_documents_matching_query(
        &self,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> DocumentMap {
        if query.is_document_query() {
            return self.get_document_matching_document_query(query);
        }

        let mut results = self
            .remote_documents
            .get_documents_matching_query(query, since_read_time);
        let batches = self
            .mutation_queue
            .get_all_mutation_batches_affecting_query(query);

        // Mutated documents may match locally even if their remote version did not qualify.
        for batch in &batches {
            for mutation in &batch.mutations {
                let key = mutation.key();
                if query.covers_key(key) && !results.contains_key(key) {
                    results.insert(key.clone(), self.remote_documents.get(key));
                }
            }
        }

        for doc in results.values_mut() {
            apply_batches(doc, &batches);
        }
        results.retain(|_, doc| query.matches(doc));
        results
    }

    /// Keys under the query's path that have pending mutations.
    pub fn mutated_keys_for_query(&self, query: &Query) -> BTreeSet<DocumentKey> {
        self.mutation_queue
            .get_all_mutation_batches_affecting_query(query)
            .iter()
            .flat_map(|batch| batch.keys())
            .filter(|key| query.covers_key(key))
            .collect()
    }

    fn get_document_matching_document_query(&self, query: &Query) -> DocumentMap {
        let mut results = DocumentMap::new();
        if let Ok(key) = DocumentKey::from_path(query.path().clone()) {
            let doc = self.get_document(&key);
            if doc.is_found_document() {
                results.insert(key, doc);
            }
        }
        results
    }
}

fn apply_batches(doc: &mut Document, batches: &[&MutationBatch]) {
    for batch in batches {
        batch.apply_to_local_view(doc, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::mutation::Mutation;
    use crate::firestore::model::{FieldPath, Timestamp};
    use crate::firestore::value::{FirestoreValue, ObjectValue};
    use std::collections::BTreeMap;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn path(p: &str) -> FieldPath {
        FieldPath::from_dot_separated(p).unwrap()
    }

    fn data(field: &str, value: i64) -> BTreeMap<String, FirestoreValue> {
        BTreeMap::from([(field.to_string(), FirestoreValue::from_integer(value))])
    }

    #[test]
    fn folds_batches_in_order() {
        let remote = RemoteDocumentCache::default();
        let mut queue = MutationQueue::default();
        queue.add_mutation_batch(
            Timestamp::now(),
            Vec::new(),
            vec![Mutation::set(key("c/d"), data("a", 1)).unwrap()],
        );
        queue.add_mutation_batch(
            Timestamp::now(),
            Vec::new(),
            vec![Mutation::update(
                key("c/d"),
                BTreeMap::from([(path("b"), FirestoreValue::from_integer(2))]),
            )
            .unwrap()],
        );

        let view = LocalDocumentsView::new(&remote, &queue);
        let doc = view.get_document(&key("c/d"));
        assert!(doc.has_local_mutations());
        assert_eq!(doc.field(&path("a")), Some(&FirestoreValue::from_integer(1)));
        assert_eq!(doc.field(&path("b")), Some(&FirestoreValue::from_integer(2)));
    }

    #[test]
    fn query_includes_locally_written_documents() {
        let mut remote = RemoteDocumentCache::default();
        remote.add(
            Document::new_found(key("c/a"), SnapshotVersion::from_micros(1), ObjectValue::empty()),
            SnapshotVersion::from_micros(1),
        );
        let mut queue = MutationQueue::default();
        queue.add_mutation_batch(
            Timestamp::now(),
            Vec::new(),
            vec![Mutation::set(key("c/b"), data("a", 1)).unwrap()],
        );

        let view = LocalDocumentsView::new(&remote, &queue);
        let query = Query::collection("c").unwrap();
        let recent = view.get_documents_matching_query(&query, SnapshotVersion::from_micros(5));
        assert_eq!(recent.keys().cloned().collect::<Vec<_>>(), vec![key("c/b")]);
        let all = view.get_documents_matching_query(&query, SnapshotVersion::NONE);
        assert_eq!(all.len(), 2);
    }
}
