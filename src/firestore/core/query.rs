use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{
    Document, DocumentComparator, DocumentKey, FieldPath, IntoFieldPath, ResourcePath,
};
use crate::firestore::value::{
    canonical_value, compare_values, type_order, values_equal, FirestoreValue, ValueKind,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOperator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl FilterOperator {
    fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::LessThan => "<",
            FilterOperator::LessThanOrEqual => "<=",
            FilterOperator::Equal => "==",
            FilterOperator::NotEqual => "!=",
            FilterOperator::GreaterThan => ">",
            FilterOperator::GreaterThanOrEqual => ">=",
            FilterOperator::ArrayContains => "array_contains",
            FilterOperator::ArrayContainsAny => "array_contains_any",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "not_in",
        }
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            FilterOperator::LessThan
                | FilterOperator::LessThanOrEqual
                | FilterOperator::GreaterThan
                | FilterOperator::GreaterThanOrEqual
                | FilterOperator::NotEqual
                | FilterOperator::NotIn
        )
    }

    fn takes_array_operand(&self) -> bool {
        matches!(
            self,
            FilterOperator::ArrayContainsAny | FilterOperator::In | FilterOperator::NotIn
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    field: FieldPath,
    operator: FilterOperator,
    value: FirestoreValue,
}

impl FieldFilter {
    pub fn new(
        field: impl IntoFieldPath,
        operator: FilterOperator,
        value: FirestoreValue,
    ) -> FirestoreResult<Self> {
        let field = field.into_field_path()?;
        if value.is_sentinel() {
            return Err(invalid_argument("Sentinel values cannot be used in filters"));
        }
        if operator.takes_array_operand() {
            match value.as_array() {
                Some(array) if !array.values().is_empty() => {}
                _ => {
                    return Err(invalid_argument(format!(
                        "A non-empty array is required for '{}' filters",
                        operator.as_str()
                    )))
                }
            }
        }
        if field.is_key_field()
            && !matches!(value.kind(), ValueKind::Reference(_))
            && !operator.takes_array_operand()
        {
            return Err(invalid_argument(
                "Document id filters must compare against a reference value",
            ));
        }
        Ok(Self {
            field,
            operator,
            value,
        })
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn operator(&self) -> FilterOperator {
        self.operator
    }

    pub fn value(&self) -> &FirestoreValue {
        &self.value
    }

    pub fn is_inequality(&self) -> bool {
        self.operator.is_inequality()
    }

    pub fn matches(&self, doc: &Document) -> bool {
        let other = field_value(doc, &self.field);
        let Some(other) = other.as_ref() else {
            return false;
        };

        match self.operator {
            FilterOperator::ArrayContains => other
                .as_array()
                .map(|array| array.contains(&self.value))
                .unwrap_or(false),
            FilterOperator::ArrayContainsAny => match (other.as_array(), self.value.as_array()) {
                (Some(array), Some(needles)) => {
                    needles.values().iter().any(|needle| array.contains(needle))
                }
                _ => false,
            },
            FilterOperator::In => self
                .value
                .as_array()
                .map(|candidates| candidates.values().iter().any(|c| in_equals(c, other)))
                .unwrap_or(false),
            FilterOperator::NotIn => {
                let Some(candidates) = self.value.as_array() else {
                    return false;
                };
                if candidates.values().iter().any(FirestoreValue::is_null) {
                    return false;
                }
                !other.is_null() && !candidates.values().iter().any(|c| in_equals(c, other))
            }
            FilterOperator::NotEqual => compare_values(other, &self.value) != Ordering::Equal,
            _ => {
                // Only values of the same type class are comparable (ints and doubles are).
                type_order(other) == type_order(&self.value)
                    && self.matches_comparison(compare_values(other, &self.value))
            }
        }
    }

    fn matches_comparison(&self, ordering: Ordering) -> bool {
        match self.operator {
            FilterOperator::LessThan => ordering == Ordering::Less,
            FilterOperator::LessThanOrEqual => ordering != Ordering::Greater,
            FilterOperator::Equal => ordering == Ordering::Equal,
            FilterOperator::GreaterThan => ordering == Ordering::Greater,
            FilterOperator::GreaterThanOrEqual => ordering != Ordering::Less,
            _ => false,
        }
    }

    fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.operator.as_str(),
            canonical_value(&self.value)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: FieldPath,
    pub direction: Direction,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: Direction) -> Self {
        Self { field, direction }
    }

    pub fn compare(&self, left: &Document, right: &Document) -> Ordering {
        let ordering = if self.field.is_key_field() {
            left.key().cmp(right.key())
        } else {
            match (left.field(&self.field), right.field(&self.field)) {
                (Some(l), Some(r)) => compare_values(l, r),
                (Some(_), None) => Ordering::Greater,
                (None, Some(_)) => Ordering::Less,
                (None, None) => Ordering::Equal,
            }
        };
        match self.direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }
}

/// Cursor position (one value per order-by component).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub position: Vec<FirestoreValue>,
    pub inclusive: bool,
}

impl Bound {
    pub fn new(position: Vec<FirestoreValue>, inclusive: bool) -> Self {
        Self {
            position,
            inclusive,
        }
    }

    fn compare_to_document(&self, order_by: &[OrderBy], doc: &Document) -> Ordering {
        for (component, order) in self.position.iter().zip(order_by.iter()) {
            let ordering = if order.field.is_key_field() {
                match component.kind() {
                    ValueKind::Reference(path) => match DocumentKey::from_string(path) {
                        Ok(key) => key.cmp(doc.key()),
                        Err(_) => Ordering::Equal,
                    },
                    _ => Ordering::Equal,
                }
            } else {
                match doc.field(&order.field) {
                    Some(value) => compare_values(component, value),
                    None => Ordering::Equal,
                }
            };
            let ordering = match order.direction {
                Direction::Ascending => ordering,
                Direction::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Start bounds: true if the document is at or after the cursor.
    fn sorts_before_document(&self, order_by: &[OrderBy], doc: &Document) -> bool {
        let ordering = self.compare_to_document(order_by, doc);
        if self.inclusive {
            ordering != Ordering::Greater
        } else {
            ordering == Ordering::Less
        }
    }

    /// End bounds: true if the document is at or before the cursor.
    fn sorts_after_document(&self, order_by: &[OrderBy], doc: &Document) -> bool {
        let ordering = self.compare_to_document(order_by, doc);
        if self.inclusive {
            ordering != Ordering::Less
        } else {
            ordering == Ordering::Greater
        }
    }

    fn canonical_id(&self) -> String {
        let parts: Vec<String> = self.position.iter().map(canonical_value).collect();
        format!("{}{}", if self.inclusive { "b:" } else { "a:" }, parts.join(","))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitType {
    First,
    Last,
}

/// A query over a collection, a collection group or a single document.
///
/// Queries are cheap values; builder methods consume and return `self`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<FieldFilter>,
    explicit_order_by: Vec<OrderBy>,
    limit: Option<u32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    /// Query for the collection (or single document) at `path`.
    pub fn at_path(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    pub fn collection(path: &str) -> FirestoreResult<Self> {
        let path = ResourcePath::from_string(path)?;
        if DocumentKey::is_document_key(&path) {
            return Err(invalid_argument(format!(
                "Invalid collection path ({path}); it has an even number of segments"
            )));
        }
        Ok(Self::at_path(path))
    }

    /// Query matching every collection named `collection_id`, at any depth.
    pub fn collection_group(collection_id: impl Into<String>) -> FirestoreResult<Self> {
        let collection_id = collection_id.into();
        if collection_id.is_empty() || collection_id.contains('/') {
            return Err(invalid_argument(
                "Collection group ids must be non-empty and must not contain '/'",
            ));
        }
        let mut query = Self::at_path(ResourcePath::root());
        query.collection_group = Some(collection_id);
        Ok(query)
    }

    pub fn for_document(key: &DocumentKey) -> Self {
        Self::at_path(key.path().clone())
    }

    pub fn filter(mut self, filter: FieldFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn where_field(
        self,
        field: impl IntoFieldPath,
        operator: FilterOperator,
        value: FirestoreValue,
    ) -> FirestoreResult<Self> {
        Ok(self.filter(FieldFilter::new(field, operator, value)?))
    }

    pub fn order_by(mut self, field: impl IntoFieldPath, direction: Direction) -> FirestoreResult<Self> {
        if self.start_at.is_some() || self.end_at.is_some() {
            return Err(invalid_argument(
                "order_by() must be called before start_at()/end_at()",
            ));
        }
        self.explicit_order_by
            .push(OrderBy::new(field.into_field_path()?, direction));
        Ok(self)
    }

    pub fn limit_to_first(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        self
    }

    pub fn limit_to_last(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        self
    }

    pub fn start_at(mut self, bound: Bound) -> Self {
        self.start_at = Some(bound);
        self
    }

    pub fn end_at(mut self, bound: Bound) -> Self {
        self.end_at = Some(bound);
        self
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn start(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    /// Id of the collection whose documents this query can return.
    pub fn target_collection_group(&self) -> Option<&str> {
        match &self.collection_group {
            Some(group) => Some(group.as_str()),
            None if self.is_document_query() => self.path.get(self.path.len() - 2),
            None => self.path.last_segment(),
        }
    }

    /// True when the result is exactly every document in the collection.
    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && (self.explicit_order_by.is_empty()
                || (self.explicit_order_by.len() == 1
                    && self.explicit_order_by[0].field.is_key_field()))
    }

    /// Explicit orderings, then implicit orderings for inequality fields, then the key.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut result = self.explicit_order_by.clone();
        let mut seen: BTreeSet<FieldPath> = result.iter().map(|o| o.field.clone()).collect();
        let last_direction = result
            .last()
            .map(|o| o.direction)
            .unwrap_or(Direction::Ascending);

        let inequality_fields: BTreeSet<FieldPath> = self
            .filters
            .iter()
            .filter(|filter| filter.is_inequality())
            .map(|filter| filter.field.clone())
            .collect();
        for field in inequality_fields {
            if !field.is_key_field() && seen.insert(field.clone()) {
                result.push(OrderBy::new(field, last_direction));
            }
        }

        if !seen.contains(&FieldPath::document_id()) {
            result.push(OrderBy::new(FieldPath::document_id(), last_direction));
        }
        result
    }

    pub fn comparator(&self) -> DocumentComparator {
        let order_by = self.normalized_order_by();
        Arc::new(move |left: &Document, right: &Document| {
            for order in &order_by {
                match order.compare(left, right) {
                    Ordering::Equal => continue,
                    non_eq => return non_eq,
                }
            }
            Ordering::Equal
        })
    }

    pub fn matches(&self, doc: &Document) -> bool {
        doc.is_found_document()
            && self.covers_key(doc.key())
            && self.matches_order_by(doc)
            && self.filters.iter().all(|filter| filter.matches(doc))
            && self.matches_bounds(doc)
    }

    /// True if a document at `key` lives where this query looks, ignoring filters.
    pub fn covers_key(&self, key: &DocumentKey) -> bool {
        let doc_path = key.path();
        if let Some(group) = &self.collection_group {
            key.has_collection_id(group) && self.path.is_prefix_of(doc_path)
        } else if DocumentKey::is_document_key(&self.path) {
            &self.path == doc_path
        } else {
            self.path.is_immediate_parent_of(doc_path)
        }
    }

    fn matches_order_by(&self, doc: &Document) -> bool {
        self.explicit_order_by
            .iter()
            .all(|order| order.field.is_key_field() || doc.field(&order.field).is_some())
    }

    fn matches_bounds(&self, doc: &Document) -> bool {
        let order_by = self.normalized_order_by();
        if let Some(start) = &self.start_at {
            if !start.sorts_before_document(&order_by, doc) {
                return false;
            }
        }
        if let Some(end) = &self.end_at {
            if !end.sorts_after_document(&order_by, doc) {
                return false;
            }
        }
        true
    }

    /// Stable identifier: equal queries produce equal ids.
    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            id.push_str("|cg:");
            id.push_str(group);
        }
        id.push_str("|f:");
        for filter in &self.filters {
            id.push_str(&filter.canonical_id());
        }
        id.push_str("|ob:");
        for order in self.normalized_order_by() {
            id.push_str(&order.field.canonical_string());
            id.push_str(match order.direction {
                Direction::Ascending => "asc",
                Direction::Descending => "desc",
            });
        }
        if let Some(limit) = self.limit {
            id.push_str(&format!("|l:{limit}"));
            if self.limit_type == LimitType::Last {
                id.push_str("|lt:l");
            }
        }
        if let Some(start) = &self.start_at {
            id.push_str("|lb:");
            id.push_str(&start.canonical_id());
        }
        if let Some(end) = &self.end_at {
            id.push_str("|ub:");
            id.push_str(&end.canonical_id());
        }
        id
    }
}

impl Display for Query {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Query({})", self.canonical_id())
    }
}

/// Filters, orders and limits `documents` the way a listen on `query` would.
pub fn apply_query_to_documents<I>(documents: I, query: &Query) -> Vec<Document>
where
    I: IntoIterator<Item = Document>,
{
    let comparator = query.comparator();
    let mut matching: Vec<Document> = documents
        .into_iter()
        .filter(|doc| query.matches(doc))
        .collect();
    matching.sort_by(|left, right| comparator(left, right));

    if let Some(limit) = query.limit() {
        let limit = limit as usize;
        if matching.len() > limit {
            match query.limit_type() {
                LimitType::First => matching.truncate(limit),
                LimitType::Last => {
                    let start = matching.len() - limit;
                    matching.drain(0..start);
                }
            }
        }
    }
    matching
}

fn field_value(doc: &Document, field: &FieldPath) -> Option<FirestoreValue> {
    if field.is_key_field() {
        return Some(FirestoreValue::from_reference(
            doc.key().path().canonical_string(),
        ));
    }
    doc.field(field).cloned()
}

fn in_equals(candidate: &FirestoreValue, value: &FirestoreValue) -> bool {
    values_equal(candidate, value)
        || (candidate.is_number()
            && value.is_number()
            && compare_values(candidate, value) == Ordering::Equal)
}
