//! Builds mutations from user-supplied maps, pulling sentinel values out into field
//! transforms and delete markers.

use std::collections::BTreeMap;

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::mutation::{
    FieldTransform, Mutation, Precondition, TransformOperation,
};
use crate::firestore::model::{DocumentKey, FieldMask, FieldPath, SnapshotVersion};
use crate::firestore::value::{FirestoreValue, ObjectValue, SentinelValue, ValueKind};

#[derive(Clone, Copy, PartialEq, Eq)]
enum WriteKind {
    Set,
    MergeSet,
    Update,
}

struct ParsedData {
    value: ObjectValue,
    transforms: Vec<FieldTransform>,
    /// Leaf paths written by the data, plus sentinel paths.
    touched: Vec<FieldPath>,
}

impl Mutation {
    /// Overwrites the document with `data`.
    pub fn set(key: DocumentKey, data: BTreeMap<String, FirestoreValue>) -> FirestoreResult<Self> {
        let parsed = parse_map(&data, WriteKind::Set)?;
        Ok(Mutation::Set {
            key,
            value: parsed.value,
            precondition: Precondition::None,
            field_transforms: parsed.transforms,
        })
    }

    /// Merges `data` into the document, creating it if missing.
    pub fn set_merge(
        key: DocumentKey,
        data: BTreeMap<String, FirestoreValue>,
    ) -> FirestoreResult<Self> {
        let parsed = parse_map(&data, WriteKind::MergeSet)?;
        if parsed.touched.is_empty() {
            return Err(invalid_argument(
                "merge set requires the data to contain at least one field",
            ));
        }
        let transform_paths: Vec<FieldPath> = parsed
            .transforms
            .iter()
            .map(|transform| transform.field_path.clone())
            .collect();
        let mask = FieldMask::from_paths(
            parsed
                .touched
                .into_iter()
                .filter(|path| !transform_paths.contains(path)),
        );
        Ok(Mutation::Patch {
            key,
            value: parsed.value,
            mask,
            precondition: Precondition::None,
            field_transforms: parsed.transforms,
        })
    }

    /// Updates the listed fields of an existing document.
    pub fn update(
        key: DocumentKey,
        updates: BTreeMap<FieldPath, FirestoreValue>,
    ) -> FirestoreResult<Self> {
        if updates.is_empty() {
            return Err(invalid_argument(
                "update requires at least one field/value pair",
            ));
        }

        let mut value = ObjectValue::empty();
        let mut mask = FieldMask::default();
        let mut transforms = Vec::new();
        for (path, update) in updates {
            match update.kind() {
                ValueKind::Sentinel(SentinelValue::Delete) => mask.insert(path),
                ValueKind::Sentinel(sentinel) => {
                    transforms.push(transform_from_sentinel(path, sentinel)?)
                }
                ValueKind::Map(map) => {
                    let parsed = parse_nested(map.fields(), &path, WriteKind::Update)?;
                    transforms.extend(parsed.transforms);
                    value.set(&path, FirestoreValue::from_map(parsed.value.fields().clone()));
                    mask.insert(path);
                }
                _ => {
                    assert_no_sentinel(&update, &path)?;
                    value.set(&path, update);
                    mask.insert(path);
                }
            }
        }
        Ok(Mutation::Patch {
            key,
            value,
            mask,
            precondition: Precondition::Exists(true),
            field_transforms: transforms,
        })
    }

    pub fn delete(key: DocumentKey) -> Self {
        Mutation::Delete {
            key,
            precondition: Precondition::None,
        }
    }

    /// Asserts that the document is still at `version` when the batch commits.
    pub fn verify(key: DocumentKey, version: SnapshotVersion) -> Self {
        let precondition = if version.is_none() {
            Precondition::Exists(false)
        } else {
            Precondition::UpdateTime(version)
        };
        Mutation::Verify { key, precondition }
    }

    pub fn transform(key: DocumentKey, field_transforms: Vec<FieldTransform>) -> Self {
        Mutation::Transform {
            key,
            field_transforms,
        }
    }
}

fn parse_map(data: &BTreeMap<String, FirestoreValue>, kind: WriteKind) -> FirestoreResult<ParsedData> {
    let mut parsed = ParsedData {
        value: ObjectValue::empty(),
        transforms: Vec::new(),
        touched: Vec::new(),
    };
    let fields = sanitize_map(data, &[], kind, &mut parsed)?;
    parsed.value = ObjectValue::from_map(fields);
    Ok(parsed)
}

fn parse_nested(
    data: &BTreeMap<String, FirestoreValue>,
    prefix: &FieldPath,
    kind: WriteKind,
) -> FirestoreResult<ParsedData> {
    let mut parsed = ParsedData {
        value: ObjectValue::empty(),
        transforms: Vec::new(),
        touched: Vec::new(),
    };
    let fields = sanitize_map(data, prefix.segments(), kind, &mut parsed)?;
    parsed.value = ObjectValue::from_map(fields);
    Ok(parsed)
}

fn sanitize_map(
    data: &BTreeMap<String, FirestoreValue>,
    parent_segments: &[String],
    kind: WriteKind,
    parsed: &mut ParsedData,
) -> FirestoreResult<BTreeMap<String, FirestoreValue>> {
    let mut cleaned = BTreeMap::new();
    for (key, value) in data {
        let mut segments = parent_segments.to_vec();
        segments.push(key.clone());
        let field_path = FieldPath::new(segments.clone())?;
        match value.kind() {
            ValueKind::Sentinel(SentinelValue::Delete) => {
                if kind != WriteKind::MergeSet {
                    return Err(invalid_argument(format!(
                        "delete_field() can only be used with update() and set() with merge (found in field {field_path})"
                    )));
                }
                parsed.touched.push(field_path);
            }
            ValueKind::Sentinel(sentinel) => {
                parsed
                    .transforms
                    .push(transform_from_sentinel(field_path.clone(), sentinel)?);
                parsed.touched.push(field_path);
            }
            ValueKind::Map(map) if !map.fields().is_empty() => {
                let nested = sanitize_map(map.fields(), &segments, kind, parsed)?;
                cleaned.insert(key.clone(), FirestoreValue::from_map(nested));
            }
            _ => {
                assert_no_sentinel(value, &field_path)?;
                cleaned.insert(key.clone(), value.clone());
                parsed.touched.push(field_path);
            }
        }
    }
    Ok(cleaned)
}

fn transform_from_sentinel(
    field_path: FieldPath,
    sentinel: &SentinelValue,
) -> FirestoreResult<FieldTransform> {
    let operation = match sentinel {
        SentinelValue::ServerTimestamp => TransformOperation::ServerTimestamp,
        SentinelValue::ArrayUnion(elements) => {
            for element in elements {
                assert_no_sentinel(element, &field_path)?;
            }
            TransformOperation::ArrayUnion(elements.clone())
        }
        SentinelValue::ArrayRemove(elements) => {
            for element in elements {
                assert_no_sentinel(element, &field_path)?;
            }
            TransformOperation::ArrayRemove(elements.clone())
        }
        SentinelValue::NumericIncrement(operand) => {
            if !operand.is_number() {
                return Err(invalid_argument(
                    "numeric_increment() requires a numeric operand",
                ));
            }
            TransformOperation::NumericIncrement(operand.as_ref().clone())
        }
        SentinelValue::Delete => {
            return Err(invalid_argument(format!(
                "delete_field() cannot be nested (found in field {field_path})"
            )))
        }
    };
    Ok(FieldTransform::new(field_path, operation))
}

fn assert_no_sentinel(value: &FirestoreValue, context: &FieldPath) -> FirestoreResult<()> {
    match value.kind() {
        ValueKind::Sentinel(_) => Err(invalid_argument(format!(
            "Invalid data. Sentinel values cannot be used inside arrays (field '{context}')."
        ))),
        ValueKind::Array(array) => array
            .values()
            .iter()
            .try_for_each(|element| assert_no_sentinel(element, context)),
        ValueKind::Map(map) => map
            .fields()
            .values()
            .try_for_each(|element| assert_no_sentinel(element, context)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> DocumentKey {
        DocumentKey::from_string("rooms/eros").unwrap()
    }

    fn path(p: &str) -> FieldPath {
        FieldPath::from_dot_separated(p).unwrap()
    }

    #[test]
    fn set_extracts_nested_transforms() {
        let mut nested = BTreeMap::new();
        nested.insert("updated".to_string(), FirestoreValue::server_timestamp());
        nested.insert("count".to_string(), FirestoreValue::from_integer(1));
        let mut data = BTreeMap::new();
        data.insert("meta".to_string(), FirestoreValue::from_map(nested));

        let mutation = Mutation::set(key(), data).unwrap();
        let Mutation::Set { value, field_transforms, .. } = mutation else {
            panic!("expected set mutation");
        };
        assert_eq!(field_transforms.len(), 1);
        assert_eq!(field_transforms[0].field_path, path("meta.updated"));
        assert!(value.get(&path("meta.updated")).is_none());
        assert_eq!(value.get(&path("meta.count")), Some(&FirestoreValue::from_integer(1)));
    }

    #[test]
    fn set_rejects_delete_sentinel() {
        let mut data = BTreeMap::new();
        data.insert("a".to_string(), FirestoreValue::delete_field());
        assert!(Mutation::set(key(), data).is_err());
    }

    #[test]
    fn update_masks_deleted_fields() {
        let mut updates = BTreeMap::new();
        updates.insert(path("a.b"), FirestoreValue::from_integer(1));
        updates.insert(path("c"), FirestoreValue::delete_field());
        updates.insert(path("n"), FirestoreValue::numeric_increment(FirestoreValue::from_integer(2)));

        let Mutation::Patch { value, mask, precondition, field_transforms, .. } =
            Mutation::update(key(), updates).unwrap()
        else {
            panic!("expected patch mutation");
        };
        assert!(mask.covers(&path("a.b")));
        assert!(mask.covers(&path("c")));
        assert!(!mask.covers(&path("n")));
        assert!(value.get(&path("c")).is_none());
        assert_eq!(precondition, Precondition::Exists(true));
        assert_eq!(field_transforms.len(), 1);
    }

    #[test]
    fn rejects_sentinel_inside_array() {
        let mut data = BTreeMap::new();
        data.insert(
            "a".to_string(),
            FirestoreValue::from_array(vec![FirestoreValue::server_timestamp()]),
        );
        assert!(Mutation::set(key(), data).is_err());
    }

    #[test]
    fn rejects_non_numeric_increment() {
        let mut data = BTreeMap::new();
        data.insert(
            "a".to_string(),
            FirestoreValue::numeric_increment(FirestoreValue::from_string("x")),
        );
        assert!(Mutation::set(key(), data).is_err());
    }
}
