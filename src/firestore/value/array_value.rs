use serde::{Deserialize, Serialize};

use crate::firestore::value::{values_equal, FirestoreValue};

#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArrayValue {
    values: Vec<FirestoreValue>,
}

impl ArrayValue {
    pub fn new(values: Vec<FirestoreValue>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[FirestoreValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<FirestoreValue> {
        self.values
    }

    /// Membership using Firestore equality; integers and doubles never match each other.
    pub fn contains(&self, needle: &FirestoreValue) -> bool {
        self.values.iter().any(|value| values_equal(value, needle))
    }

    /// Appends each element that is not already present.
    pub fn union(&self, elements: &[FirestoreValue]) -> Self {
        let mut result = self.clone();
        for element in elements {
            if !result.contains(element) {
                result.values.push(element.clone());
            }
        }
        result
    }

    /// Drops every occurrence of each element.
    pub fn remove_all(&self, elements: &[FirestoreValue]) -> Self {
        let values = self
            .values
            .iter()
            .filter(|value| !elements.iter().any(|element| values_equal(value, element)))
            .cloned()
            .collect();
        Self { values }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_skips_existing_elements() {
        let array = ArrayValue::new(vec![FirestoreValue::from_integer(1)]);
        let merged = array.union(&[
            FirestoreValue::from_integer(1),
            FirestoreValue::from_integer(2),
            FirestoreValue::from_double(2.0),
        ]);
        assert_eq!(merged.values().len(), 3);
    }

    #[test]
    fn remove_drops_all_occurrences() {
        let array = ArrayValue::new(vec![
            FirestoreValue::from_string("a"),
            FirestoreValue::from_string("b"),
            FirestoreValue::from_string("a"),
        ]);
        let trimmed = array.remove_all(&[FirestoreValue::from_string("a")]);
        assert_eq!(trimmed.values(), &[FirestoreValue::from_string("b")]);
    }
}
