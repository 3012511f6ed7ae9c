use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use crate::firestore::model::{Document, DocumentKey};

pub type DocumentComparator = Arc<dyn Fn(&Document, &Document) -> Ordering + Send + Sync>;

/// Documents kept in query order with O(log n) lookup by key.
///
/// The comparator must break ties by key so that the order is total.
#[derive(Clone)]
pub struct DocumentSet {
    comparator: DocumentComparator,
    by_key: BTreeMap<DocumentKey, Document>,
    sorted: Vec<Document>,
}

impl DocumentSet {
    pub fn new(comparator: DocumentComparator) -> Self {
        Self {
            comparator,
            by_key: BTreeMap::new(),
            sorted: Vec::new(),
        }
    }

    /// Set ordered purely by document key.
    pub fn key_ordered() -> Self {
        Self::new(Arc::new(|left: &Document, right: &Document| {
            left.key().cmp(right.key())
        }))
    }

    pub fn comparator(&self) -> &DocumentComparator {
        &self.comparator
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&Document> {
        self.by_key.get(key)
    }

    pub fn first(&self) -> Option<&Document> {
        self.sorted.first()
    }

    pub fn last(&self) -> Option<&Document> {
        self.sorted.last()
    }

    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        let doc = self.by_key.get(key)?;
        self.position(doc).ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Document> {
        self.sorted.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.sorted.iter().map(Document::key)
    }

    /// Inserts `doc`, replacing any previous document with the same key.
    pub fn insert(&mut self, doc: Document) {
        self.remove(doc.key());
        let index = match self.position(&doc) {
            Ok(index) | Err(index) => index,
        };
        self.by_key.insert(doc.key().clone(), doc.clone());
        self.sorted.insert(index, doc);
    }

    pub fn remove(&mut self, key: &DocumentKey) -> Option<Document> {
        let existing = self.by_key.remove(key)?;
        if let Ok(index) = self.position(&existing) {
            self.sorted.remove(index);
        } else if let Some(index) = self.sorted.iter().position(|doc| doc.key() == key) {
            self.sorted.remove(index);
        }
        Some(existing)
    }

    pub fn to_vec(&self) -> Vec<Document> {
        self.sorted.clone()
    }

    fn position(&self, doc: &Document) -> Result<usize, usize> {
        self.sorted
            .binary_search_by(|existing| (self.comparator)(existing, doc))
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.sorted == other.sorted
    }
}

impl Debug for DocumentSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.sorted.iter().map(|doc| doc.key().to_string()))
            .finish()
    }
}
