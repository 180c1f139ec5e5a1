//! Ordering, equality and canonical ids for [`FirestoreValue`].

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::firestore::model::Timestamp;
use crate::firestore::value::{FirestoreValue, ValueKind};

const TYPE_KEY: &str = "__type__";
const SERVER_TIMESTAMP_SENTINEL: &str = "server_timestamp";
const LOCAL_WRITE_TIME_KEY: &str = "__local_write_time__";
const PREVIOUS_VALUE_KEY: &str = "__previous_value__";
const VECTOR_SENTINEL: &str = "__vector__";
const VECTOR_VALUE_KEY: &str = "value";

/// Cross-type ordering buckets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TypeOrder {
    Null = 0,
    Boolean = 1,
    Number = 2,
    Timestamp = 3,
    ServerTimestamp = 4,
    String = 5,
    Bytes = 6,
    Reference = 7,
    GeoPoint = 8,
    Array = 9,
    Vector = 10,
    Map = 11,
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
        ValueKind::Map(_) => {
            if is_server_timestamp(value) {
                TypeOrder::ServerTimestamp
            } else if is_vector_value(value) {
                TypeOrder::Vector
            } else {
                TypeOrder::Map
            }
        }
    }
}

fn reserved_type(value: &FirestoreValue) -> Option<&str> {
    value
        .as_map()
        .and_then(|fields| fields.get(TYPE_KEY))
        .and_then(FirestoreValue::as_str)
}

pub fn is_server_timestamp(value: &FirestoreValue) -> bool {
    reserved_type(value) == Some(SERVER_TIMESTAMP_SENTINEL)
}

pub fn is_vector_value(value: &FirestoreValue) -> bool {
    reserved_type(value) == Some(VECTOR_SENTINEL)
}

/// Builds the placeholder stored locally until the server resolves a
/// server-timestamp transform.
pub fn server_timestamp_value(
    local_write_time: Timestamp,
    previous_value: Option<&FirestoreValue>,
) -> FirestoreValue {
    let mut fields = BTreeMap::new();
    fields.insert(
        TYPE_KEY.to_string(),
        FirestoreValue::from_string(SERVER_TIMESTAMP_SENTINEL),
    );
    fields.insert(
        LOCAL_WRITE_TIME_KEY.to_string(),
        FirestoreValue::from_timestamp(local_write_time),
    );
    // Chained server timestamps keep the oldest concrete value.
    let previous = previous_value.and_then(|previous| {
        if is_server_timestamp(previous) {
            self::previous_value(previous).cloned()
        } else {
            Some(previous.clone())
        }
    });
    if let Some(previous) = previous {
        fields.insert(PREVIOUS_VALUE_KEY.to_string(), previous);
    }
    FirestoreValue::from_map(fields)
}

pub fn local_write_time(value: &FirestoreValue) -> Option<Timestamp> {
    match value.as_map()?.get(LOCAL_WRITE_TIME_KEY)?.kind() {
        ValueKind::Timestamp(ts) => Some(*ts),
        _ => None,
    }
}

pub fn previous_value(value: &FirestoreValue) -> Option<&FirestoreValue> {
    let previous = value.as_map()?.get(PREVIOUS_VALUE_KEY)?;
    if is_server_timestamp(previous) {
        return self::previous_value(previous);
    }
    Some(previous)
}

pub fn vector_value(elements: Vec<f64>) -> FirestoreValue {
    let mut fields = BTreeMap::new();
    fields.insert(TYPE_KEY.to_string(), FirestoreValue::from_string(VECTOR_SENTINEL));
    fields.insert(
        VECTOR_VALUE_KEY.to_string(),
        FirestoreValue::from_array(elements.into_iter().map(FirestoreValue::from_double).collect()),
    );
    FirestoreValue::from_map(fields)
}

fn vector_elements(value: &FirestoreValue) -> &[FirestoreValue] {
    value
        .as_map()
        .and_then(|fields| fields.get(VECTOR_VALUE_KEY))
        .and_then(FirestoreValue::as_array)
        .unwrap_or(&[])
}

pub fn value_equals(left: &FirestoreValue, right: &FirestoreValue) -> bool {
    value_compare(left, right) == Ordering::Equal
}

/// Total order over values: NaN is the smallest number, `-0.0 == 0.0`,
/// integers and doubles compare numerically.
pub fn value_compare(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    let left_order = type_order(left);
    let right_order = type_order(right);
    if left_order != right_order {
        return left_order.cmp(&right_order);
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
        (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l.cmp(r),
        (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l.cmp(r),
        (ValueKind::String(l), ValueKind::String(r)) => l.as_bytes().cmp(r.as_bytes()),
        (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l.cmp(r),
        (ValueKind::Reference(l), ValueKind::Reference(r)) => compare_references(l, r),
        (ValueKind::GeoPoint(l), ValueKind::GeoPoint(r)) => {
            compare_doubles(l.latitude(), r.latitude())
                .then_with(|| compare_doubles(l.longitude(), r.longitude()))
        }
        (ValueKind::Array(l), ValueKind::Array(r)) => compare_arrays(l.values(), r.values()),
        (ValueKind::Map(_), ValueKind::Map(_)) => match left_order {
            TypeOrder::ServerTimestamp => local_write_time(left).cmp(&local_write_time(right)),
            TypeOrder::Vector => {
                let l = vector_elements(left);
                let r = vector_elements(right);
                l.len().cmp(&r.len()).then_with(|| compare_arrays(l, r))
            }
            _ => compare_maps(left, right),
        },
        (l, r) => compare_numbers(l, r),
    }
}

fn compare_numbers(left: &ValueKind, right: &ValueKind) -> Ordering {
    match (left, right) {
        (ValueKind::Integer(l), ValueKind::Integer(r)) => l.cmp(r),
        (ValueKind::Double(l), ValueKind::Double(r)) => compare_doubles(*l, *r),
        (ValueKind::Integer(l), ValueKind::Double(r)) => compare_integer_to_double(*l, *r),
        (ValueKind::Double(l), ValueKind::Integer(r)) => {
            compare_integer_to_double(*r, *l).reverse()
        }
        _ => Ordering::Equal,
    }
}

pub(crate) fn compare_doubles(left: f64, right: f64) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        // -0.0 and 0.0 compare equal under partial_cmp.
        (false, false) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}

fn compare_integer_to_double(integer: i64, double: f64) -> Ordering {
    const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;
    if double.is_nan() || double < -TWO_POW_63 {
        return Ordering::Greater;
    }
    if double >= TWO_POW_63 {
        return Ordering::Less;
    }
    let truncated = double.trunc();
    integer.cmp(&(truncated as i64)).then_with(|| {
        let fraction = double - truncated;
        if fraction > 0.0 {
            Ordering::Less
        } else if fraction < 0.0 {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    })
}

/// References compare by document path, so a bare `rooms/a` matches the
/// fully qualified name of the same document.
fn compare_references(left: &str, right: &str) -> Ordering {
    reference_path(left)
        .split('/')
        .filter(|segment| !segment.is_empty())
        .cmp(reference_path(right).split('/').filter(|segment| !segment.is_empty()))
}

fn compare_arrays(left: &[FirestoreValue], right: &[FirestoreValue]) -> Ordering {
    for (l, r) in left.iter().zip(right.iter()) {
        let ordering = value_compare(l, r);
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left.len().cmp(&right.len())
}

fn compare_maps(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    let (Some(left), Some(right)) = (left.as_map(), right.as_map()) else {
        return Ordering::Equal;
    };
    for ((lk, lv), (rk, rv)) in left.iter().zip(right.iter()) {
        let ordering = lk
            .as_bytes()
            .cmp(rk.as_bytes())
            .then_with(|| value_compare(lv, rv));
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left.len().cmp(&right.len())
}

/// Stable string form used in target canonical ids.
pub fn canonical_id(value: &FirestoreValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &FirestoreValue, out: &mut String) {
    match value.kind() {
        ValueKind::Null => out.push_str("null"),
        ValueKind::Boolean(b) => out.push_str(if *b { "true" } else { "false" }),
        ValueKind::Integer(i) => out.push_str(&i.to_string()),
        ValueKind::Double(d) => out.push_str(&format_double(*d)),
        ValueKind::Timestamp(ts) => out.push_str(&format!("time({},{})", ts.seconds, ts.nanos)),
        ValueKind::String(s) => out.push_str(s),
        ValueKind::Bytes(bytes) => out.push_str(&bytes.to_base64()),
        ValueKind::Reference(name) => out.push_str(reference_path(name)),
        ValueKind::GeoPoint(point) => out.push_str(&format!(
            "geo({},{})",
            format_double(point.latitude()),
            format_double(point.longitude())
        )),
        ValueKind::Array(array) => {
            out.push('[');
            for (index, element) in array.values().iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(element, out);
            }
            out.push(']');
        }
        ValueKind::Map(map) => {
            out.push('{');
            for (index, (key, element)) in map.fields().iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(key);
                out.push(':');
                write_canonical(element, out);
            }
            out.push('}');
        }
    }
}

fn format_double(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "Infinity".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else {
        value.to_string()
    }
}

/// Strips the `projects/p/databases/d/documents/` prefix of a reference.
pub(crate) fn reference_path(name: &str) -> &str {
    match name.find("/documents/") {
        Some(index) => &name[index + "/documents/".len()..],
        None => name,
    }
}
