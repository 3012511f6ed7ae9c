use std::collections::BTreeMap;

use crate::firestore::model::Timestamp;
use crate::firestore::value::{FirestoreValue, ValueKind};

const TYPE_KEY: &str = "__type__";
const SERVER_TIMESTAMP_TYPE: &str = "server_timestamp";
const LOCAL_WRITE_TIME_KEY: &str = "__local_write_time__";
const PREVIOUS_VALUE_KEY: &str = "__previous_value__";

/// Local placeholder for a server timestamp that has not been committed yet.
///
/// The placeholder remembers when the write happened locally and the value the field held
/// before, so that listeners can choose how to render it. Nested placeholders are collapsed
/// so the previous value is always a concrete value.
pub fn server_timestamp_placeholder(
    local_write_time: Timestamp,
    previous_value: Option<&FirestoreValue>,
) -> FirestoreValue {
    let mut fields = BTreeMap::new();
    fields.insert(
        TYPE_KEY.to_string(),
        FirestoreValue::from_string(SERVER_TIMESTAMP_TYPE),
    );
    fields.insert(
        LOCAL_WRITE_TIME_KEY.to_string(),
        FirestoreValue::from_timestamp(local_write_time),
    );

    let previous = previous_value.and_then(|value| {
        if is_server_timestamp(value) {
            server_timestamp_previous_value(value).cloned()
        } else {
            Some(value.clone())
        }
    });
    if let Some(previous) = previous {
        fields.insert(PREVIOUS_VALUE_KEY.to_string(), previous);
    }
    FirestoreValue::from_map(fields)
}

pub fn is_server_timestamp(value: &FirestoreValue) -> bool {
    match value.kind() {
        ValueKind::Map(map) => map
            .get(TYPE_KEY)
            .and_then(FirestoreValue::as_str)
            .map(|kind| kind == SERVER_TIMESTAMP_TYPE)
            .unwrap_or(false),
        _ => false,
    }
}

pub fn server_timestamp_local_write_time(value: &FirestoreValue) -> Option<Timestamp> {
    let map = value.as_map()?;
    match map.get(LOCAL_WRITE_TIME_KEY)?.kind() {
        ValueKind::Timestamp(timestamp) => Some(*timestamp),
        _ => None,
    }
}

pub fn server_timestamp_previous_value(value: &FirestoreValue) -> Option<&FirestoreValue> {
    value.as_map()?.get(PREVIOUS_VALUE_KEY)
}
