use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::firestore::core::Query;
use crate::firestore::local::journal::JournaledMap;
use crate::firestore::model::{Document, DocumentKey, DocumentMap, SnapshotVersion};

/// Last known backend state of every cached document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteDocumentCache {
    documents: JournaledMap<DocumentKey, Document>,
}

impl RemoteDocumentCache {
    pub(crate) fn begin(&mut self) {
        self.documents.begin();
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.documents.is_dirty()
    }

    pub(crate) fn commit(&mut self) {
        self.documents.commit();
    }

    /// Undoes the open transaction and returns the keys it had changed.
    pub(crate) fn rollback(&mut self) -> Vec<DocumentKey> {
        self.documents.rollback()
    }

    pub(crate) fn pending_changes(&self) -> Vec<(DocumentKey, Option<Document>)> {
        self.documents.pending_changes()
    }

    /// Puts back a stored document exactly as it was written.
    pub(crate) fn restore(&mut self, doc: Document) {
        self.documents.insert(doc.key().clone(), doc);
    }

    /// The cached document itself, without an invalid placeholder on a miss.
    pub fn get_cached(&self, key: &DocumentKey) -> Option<&Document> {
        self.documents.get(key)
    }

    /// Stores `doc`, stamping it with the time it was read from the backend.
    pub fn add(&mut self, mut doc: Document, read_time: SnapshotVersion) {
        doc.set_read_time(read_time);
        self.documents.insert(doc.key().clone(), doc);
    }

    pub fn remove(&mut self, key: &DocumentKey) -> Option<Document> {
        self.documents.remove(key)
    }

    /// Returns the cached document, or an invalid placeholder on a miss.
    pub fn get(&self, key: &DocumentKey) -> Document {
        self.documents
            .get(key)
            .cloned()
            .unwrap_or_else(|| Document::new_invalid(key.clone()))
    }

    pub fn get_all<'a, I>(&self, keys: I) -> DocumentMap
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        keys.into_iter()
            .map(|key| (key.clone(), self.get(key)))
            .collect()
    }

    /// Documents the query's path covers that were read after `since_read_time`.
    ///
    /// Filters are not applied; callers overlay local mutations first.
    pub fn get_documents_matching_query(
        &self,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> DocumentMap {
        let select = |(key, doc): (&DocumentKey, &Document)| {
            (query.covers_key(key) && doc.read_time() > since_read_time).then(|| (key.clone(), doc.clone()))
        };
        let prefix = query.path();
        match DocumentKey::first_key_under(prefix) {
            Some(start) => self
                .documents
                .range(start..)
                .take_while(|(key, _)| prefix.is_prefix_of(key.path()))
                .filter_map(select)
                .collect(),
            None => self.documents.iter().filter_map(select).collect(),
        }
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.documents.contains_key(key)
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.documents.keys().cloned().collect()
    }

    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.documents.values()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn byte_size(&self) -> usize {
        self.documents
            .values()
            .map(Document::estimate_byte_size)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::value::ObjectValue;

    fn doc(path: &str, version: i64) -> Document {
        Document::new_found(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(version),
            ObjectValue::empty(),
        )
    }

    #[test]
    fn missing_documents_are_invalid() {
        let cache = RemoteDocumentCache::default();
        let key = DocumentKey::from_string("c/missing").unwrap();
        assert!(!cache.get(&key).is_valid_document());
    }

    #[test]
    fn filters_by_path_and_read_time() {
        let mut cache = RemoteDocumentCache::default();
        cache.add(doc("c/a", 1), SnapshotVersion::from_micros(10));
        cache.add(doc("c/b", 1), SnapshotVersion::from_micros(20));
        cache.add(doc("c/b/sub/x", 1), SnapshotVersion::from_micros(30));
        cache.add(doc("other/a", 1), SnapshotVersion::from_micros(30));

        let query = Query::collection("c").unwrap();
        let all = cache.get_documents_matching_query(&query, SnapshotVersion::NONE);
        assert_eq!(all.len(), 2);

        let recent = cache.get_documents_matching_query(&query, SnapshotVersion::from_micros(10));
        assert_eq!(
            recent.keys().cloned().collect::<Vec<_>>(),
            vec![DocumentKey::from_string("c/b").unwrap()]
        );
    }

    #[test]
    fn scans_only_the_collection_range() {
        let mut cache = RemoteDocumentCache::default();
        for path in ["b/z", "c/a", "c/a/sub/x", "c/m", "ca/a", "d/a"] {
            cache.add(doc(path, 1), SnapshotVersion::from_micros(1));
        }
        let ids = |query: &Query| {
            cache
                .get_documents_matching_query(query, SnapshotVersion::NONE)
                .keys()
                .map(|key| key.to_string())
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(&Query::collection("c").unwrap()), vec!["c/a", "c/m"]);
        assert_eq!(ids(&Query::collection("c/a/sub").unwrap()), vec!["c/a/sub/x"]);
        assert_eq!(ids(&Query::collection_group("sub").unwrap()), vec!["c/a/sub/x"]);
    }

    #[test]
    fn rollback_drops_the_open_transaction() {
        let mut cache = RemoteDocumentCache::default();
        cache.add(doc("c/a", 1), SnapshotVersion::from_micros(1));
        cache.begin();
        cache.add(doc("c/a", 2), SnapshotVersion::from_micros(2));
        cache.add(doc("c/b", 2), SnapshotVersion::from_micros(2));
        assert!(cache.is_dirty());

        let touched = cache.rollback();
        assert_eq!(touched.len(), 2);
        assert_eq!(cache.len(), 1);
        let key = DocumentKey::from_string("c/a").unwrap();
        assert_eq!(cache.get(&key).version(), SnapshotVersion::from_micros(1));
    }
}
