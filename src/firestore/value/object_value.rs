use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::firestore::model::{FieldMask, FieldPath};
use crate::firestore::value::{FirestoreValue, MapValue, ValueKind};

/// The field data of a document: a map value addressed by [`FieldPath`]s.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectValue {
    fields: MapValue,
}

impl ObjectValue {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_map(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self {
            fields: MapValue::new(fields),
        }
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        self.fields.fields()
    }

    pub fn as_map_value(&self) -> &MapValue {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.fields().is_empty()
    }

    pub fn get(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let (first, rest) = path.segments().split_first()?;
        let mut current = self.fields.get(first)?;
        for segment in rest {
            current = current.as_map()?.get(segment)?;
        }
        Some(current)
    }

    /// Writes `value` at `path`, creating (or replacing non-map) parents along the way.
    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) {
        set_in_map(self.fields.fields_mut(), path.segments(), value);
    }

    pub fn delete(&mut self, path: &FieldPath) {
        delete_in_map(self.fields.fields_mut(), path.segments());
    }

    /// Applies every entry: `Some` sets, `None` deletes.
    pub fn set_all(&mut self, data: BTreeMap<FieldPath, Option<FirestoreValue>>) {
        for (path, value) in data {
            match value {
                Some(value) => self.set(&path, value),
                None => self.delete(&path),
            }
        }
    }

    /// Mask of every leaf field. Empty maps count as leaves.
    pub fn field_mask(&self) -> FieldMask {
        let mut paths = Vec::new();
        collect_leaf_paths(self.fields.fields(), &[], &mut paths);
        FieldMask::from_paths(paths)
    }

    pub fn estimate_byte_size(&self) -> usize {
        self.fields
            .fields()
            .iter()
            .map(|(key, value)| key.len() + value.estimate_byte_size())
            .sum()
    }
}

fn set_in_map(map: &mut BTreeMap<String, FirestoreValue>, segments: &[String], value: FirestoreValue) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        map.insert(first.clone(), value);
        return;
    }

    let mut child = match map.remove(first).map(FirestoreValue::into_kind) {
        Some(ValueKind::Map(existing)) => existing.into_fields(),
        _ => BTreeMap::new(),
    };
    set_in_map(&mut child, rest, value);
    map.insert(first.clone(), FirestoreValue::from_map(child));
}

fn delete_in_map(map: &mut BTreeMap<String, FirestoreValue>, segments: &[String]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        map.remove(first);
        return;
    }

    let Some(existing) = map.get(first) else {
        return;
    };
    let Some(child) = existing.as_map() else {
        return;
    };
    let mut child = child.fields().clone();
    delete_in_map(&mut child, rest);
    map.insert(first.clone(), FirestoreValue::from_map(child));
}

fn collect_leaf_paths(
    map: &BTreeMap<String, FirestoreValue>,
    prefix: &[String],
    out: &mut Vec<FieldPath>,
) {
    for (key, value) in map {
        let mut segments = prefix.to_vec();
        segments.push(key.clone());
        match value.as_map() {
            Some(nested) if !nested.fields().is_empty() => {
                collect_leaf_paths(nested.fields(), &segments, out)
            }
            _ => {
                if let Ok(path) = FieldPath::new(segments) {
                    out.push(path);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &str) -> FieldPath {
        FieldPath::from_dot_separated(p).unwrap()
    }

    #[test]
    fn sets_nested_fields() {
        let mut object = ObjectValue::empty();
        object.set(&path("a.b.c"), FirestoreValue::from_integer(1));
        object.set(&path("a.d"), FirestoreValue::from_bool(true));
        assert_eq!(object.get(&path("a.b.c")), Some(&FirestoreValue::from_integer(1)));
        assert_eq!(object.get(&path("a.d")), Some(&FirestoreValue::from_bool(true)));
        assert!(object.get(&path("a.x")).is_none());
    }

    #[test]
    fn overwrites_scalar_parent() {
        let mut object = ObjectValue::empty();
        object.set(&path("a"), FirestoreValue::from_integer(1));
        object.set(&path("a.b"), FirestoreValue::from_integer(2));
        assert_eq!(object.get(&path("a.b")), Some(&FirestoreValue::from_integer(2)));
    }

    #[test]
    fn deletes_nested_field_and_reports_mask() {
        let mut object = ObjectValue::empty();
        object.set(&path("a.b"), FirestoreValue::from_integer(1));
        object.set(&path("a.c"), FirestoreValue::from_integer(2));
        object.delete(&path("a.b"));
        assert!(object.get(&path("a.b")).is_none());
        let mask = object.field_mask();
        assert!(mask.covers(&path("a.c")));
        assert!(!mask.covers(&path("a.b")));
    }
}
