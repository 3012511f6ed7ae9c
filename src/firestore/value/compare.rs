use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::firestore::model::ResourcePath;
use crate::firestore::value::server_timestamp::{
    is_server_timestamp, server_timestamp_local_write_time,
};
use crate::firestore::value::{FirestoreValue, MapValue, ValueKind};

/// Rank of each value type in Firestore's cross-type ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TypeOrder {
    Null,
    Boolean,
    Number,
    Timestamp,
    ServerTimestamp,
    String,
    Bytes,
    Reference,
    GeoPoint,
    Array,
    Map,
    Sentinel,
}

pub fn type_order(value: &FirestoreValue) -> TypeOrder {
    match value.kind() {
        ValueKind::Null => TypeOrder::Null,
        ValueKind::Boolean(_) => TypeOrder::Boolean,
        ValueKind::Integer(_) | ValueKind::Double(_) => TypeOrder::Number,
        ValueKind::Timestamp(_) => TypeOrder::Timestamp,
        ValueKind::String(_) => TypeOrder::String,
        ValueKind::Bytes(_) => TypeOrder::Bytes,
        ValueKind::Reference(_) => TypeOrder::Reference,
        ValueKind::GeoPoint(_) => TypeOrder::GeoPoint,
        ValueKind::Array(_) => TypeOrder::Array,
        ValueKind::Map(_) if is_server_timestamp(value) => TypeOrder::ServerTimestamp,
        ValueKind::Map(_) => TypeOrder::Map,
        ValueKind::Sentinel(_) => TypeOrder::Sentinel,
    }
}

/// Total order over values used for query ordering, bounds and index entries.
///
/// NaN sorts before every other number and integers compare numerically with doubles.
pub fn compare_values(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    let left_order = type_order(left);
    let right_order = type_order(right);
    if left_order != right_order {
        return left_order.cmp(&right_order);
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
        (ValueKind::Boolean(a), ValueKind::Boolean(b)) => a.cmp(b),
        (ValueKind::Integer(a), ValueKind::Integer(b)) => a.cmp(b),
        (ValueKind::Integer(a), ValueKind::Double(b)) => compare_mixed(*a, *b),
        (ValueKind::Double(a), ValueKind::Integer(b)) => compare_mixed(*b, *a).reverse(),
        (ValueKind::Double(a), ValueKind::Double(b)) => compare_doubles(*a, *b),
        (ValueKind::Timestamp(a), ValueKind::Timestamp(b)) => a.cmp(b),
        (ValueKind::String(a), ValueKind::String(b)) => a.cmp(b),
        (ValueKind::Bytes(a), ValueKind::Bytes(b)) => a.cmp(b),
        (ValueKind::Reference(a), ValueKind::Reference(b)) => compare_references(a, b),
        (ValueKind::GeoPoint(a), ValueKind::GeoPoint(b)) => a.compare(b),
        (ValueKind::Array(a), ValueKind::Array(b)) => {
            for (l, r) in a.values().iter().zip(b.values().iter()) {
                match compare_values(l, r) {
                    Ordering::Equal => continue,
                    non_eq => return non_eq,
                }
            }
            a.values().len().cmp(&b.values().len())
        }
        (ValueKind::Map(_), ValueKind::Map(_)) if left_order == TypeOrder::ServerTimestamp => {
            server_timestamp_local_write_time(left).cmp(&server_timestamp_local_write_time(right))
        }
        (ValueKind::Map(a), ValueKind::Map(b)) => compare_maps(a, b),
        _ => Ordering::Equal,
    }
}

/// Strict equality: same type and same value. `1` and `1.0` are different values, NaN
/// equals NaN.
pub fn values_equal(left: &FirestoreValue, right: &FirestoreValue) -> bool {
    if type_order(left) != type_order(right) {
        return false;
    }
    match (left.kind(), right.kind()) {
        (ValueKind::Integer(a), ValueKind::Integer(b)) => a == b,
        (ValueKind::Double(a), ValueKind::Double(b)) => a.to_bits() == b.to_bits(),
        (ValueKind::Integer(_), ValueKind::Double(_))
        | (ValueKind::Double(_), ValueKind::Integer(_)) => false,
        (ValueKind::Array(a), ValueKind::Array(b)) => {
            a.values().len() == b.values().len()
                && a.values()
                    .iter()
                    .zip(b.values().iter())
                    .all(|(l, r)| values_equal(l, r))
        }
        (ValueKind::Map(a), ValueKind::Map(b)) => {
            a.fields().len() == b.fields().len()
                && a.fields().iter().all(|(key, value)| {
                    b.fields()
                        .get(key)
                        .map(|other| values_equal(value, other))
                        .unwrap_or(false)
                })
        }
        _ => compare_values(left, right) == Ordering::Equal,
    }
}

/// Stable textual form used to build query canonical ids.
pub fn canonical_value(value: &FirestoreValue) -> String {
    match value.kind() {
        ValueKind::Null => "null".to_string(),
        ValueKind::Boolean(b) => b.to_string(),
        ValueKind::Integer(i) => i.to_string(),
        ValueKind::Double(d) => format!("{d:?}"),
        ValueKind::Timestamp(t) => format!("time({},{})", t.seconds, t.nanos),
        ValueKind::String(s) => s.clone(),
        ValueKind::Bytes(b) => b.to_base64(),
        ValueKind::Reference(r) => r.clone(),
        ValueKind::GeoPoint(g) => format!("geo({},{})", g.latitude(), g.longitude()),
        ValueKind::Array(a) => {
            let parts: Vec<String> = a.values().iter().map(canonical_value).collect();
            format!("[{}]", parts.join(","))
        }
        ValueKind::Map(m) => {
            let parts: Vec<String> = m
                .fields()
                .iter()
                .map(|(k, v)| format!("{k}:{}", canonical_value(v)))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        ValueKind::Sentinel(s) => format!("{s:?}"),
    }
}

/// Wrapper that gives values a total `Ord`, so they can key ordered collections.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderedValue(pub FirestoreValue);

impl PartialEq for OrderedValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrderedValue {}

impl PartialOrd for OrderedValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedValue {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_values(&self.0, &other.0)
    }
}

fn compare_doubles(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

fn compare_mixed(integer: i64, double: f64) -> Ordering {
    if double.is_nan() {
        return Ordering::Greater;
    }
    let as_double = integer as f64;
    match as_double.partial_cmp(&double) {
        Some(Ordering::Equal) => {
            // Large integers lose precision as doubles; fall back to integer comparison.
            if double >= i64::MAX as f64 {
                Ordering::Less
            } else if double <= i64::MIN as f64 {
                Ordering::Greater
            } else {
                integer.cmp(&(double as i64))
            }
        }
        Some(ordering) => ordering,
        None => Ordering::Equal,
    }
}

fn compare_references(left: &str, right: &str) -> Ordering {
    let left = ResourcePath::from_segments(left.split('/').filter(|s| !s.is_empty()));
    let right = ResourcePath::from_segments(right.split('/').filter(|s| !s.is_empty()));
    left.cmp(&right)
}

fn compare_maps(left: &MapValue, right: &MapValue) -> Ordering {
    for ((lk, lv), (rk, rv)) in left.fields().iter().zip(right.fields().iter()) {
        match lk.cmp(rk).then_with(|| compare_values(lv, rv)) {
            Ordering::Equal => continue,
            non_eq => return non_eq,
        }
    }
    left.fields().len().cmp(&right.fields().len())
}
