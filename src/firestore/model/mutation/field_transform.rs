use serde::{Deserialize, Serialize};

use crate::firestore::model::{FieldPath, Timestamp};
use crate::firestore::value::{
    server_timestamp_placeholder, ArrayValue, FirestoreValue, ValueKind,
};

/// Server-side operation applied to a single field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(FirestoreValue),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldTransform {
    pub field_path: FieldPath,
    pub operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field_path: FieldPath, operation: TransformOperation) -> Self {
        Self {
            field_path,
            operation,
        }
    }
}

impl TransformOperation {
    /// Speculative value shown before the backend has applied the transform.
    pub fn apply_to_local_view(
        &self,
        previous: Option<&FirestoreValue>,
        local_write_time: Timestamp,
    ) -> FirestoreValue {
        match self {
            TransformOperation::ServerTimestamp => {
                server_timestamp_placeholder(local_write_time, previous)
            }
            TransformOperation::ArrayUnion(elements) => {
                FirestoreValue::from_kind(ValueKind::Array(coerce_array(previous).union(elements)))
            }
            TransformOperation::ArrayRemove(elements) => FirestoreValue::from_kind(
                ValueKind::Array(coerce_array(previous).remove_all(elements)),
            ),
            TransformOperation::NumericIncrement(operand) => {
                let base = self
                    .compute_base_value(previous)
                    .unwrap_or_else(|| FirestoreValue::from_integer(0));
                increment(&base, operand)
            }
        }
    }

    /// Final value once the backend acknowledged the write.
    ///
    /// Array transforms are not echoed by the backend, so they are recomputed locally.
    pub fn apply_to_remote_document(
        &self,
        previous: Option<&FirestoreValue>,
        transform_result: FirestoreValue,
    ) -> FirestoreValue {
        match self {
            TransformOperation::ArrayUnion(_) | TransformOperation::ArrayRemove(_) => {
                self.apply_to_local_view(previous, Timestamp::default())
            }
            _ => transform_result,
        }
    }

    /// Value that must be captured at write time so that re-applying the transform on top of
    /// newer remote data stays idempotent. Only increments need one.
    pub fn compute_base_value(&self, previous: Option<&FirestoreValue>) -> Option<FirestoreValue> {
        match self {
            TransformOperation::NumericIncrement(_) => Some(match previous {
                Some(value) if value.is_number() => value.clone(),
                _ => FirestoreValue::from_integer(0),
            }),
            _ => None,
        }
    }
}

fn coerce_array(previous: Option<&FirestoreValue>) -> ArrayValue {
    previous
        .and_then(FirestoreValue::as_array)
        .cloned()
        .unwrap_or_default()
}

fn increment(base: &FirestoreValue, operand: &FirestoreValue) -> FirestoreValue {
    match (base.kind(), operand.kind()) {
        (ValueKind::Integer(a), ValueKind::Integer(b)) => {
            FirestoreValue::from_integer(a.saturating_add(*b))
        }
        _ => {
            let sum = base.as_f64().unwrap_or(0.0) + operand.as_f64().unwrap_or(0.0);
            FirestoreValue::from_double(sum)
        }
    }
}
