use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::firestore::model::{GeoPoint, Timestamp};
use crate::firestore::value::{values, ArrayValue, BytesValue, MapValue};

/// A single field value stored in a document.
///
/// Server timestamps and vectors are not separate variants: they are maps
/// with a reserved `__type__` entry, recognised by the helpers in
/// [`crate::firestore::value::values`].
#[derive(Clone, Debug)]
pub struct FirestoreValue {
    kind: ValueKind,
}

#[derive(Clone, Debug)]
pub enum ValueKind {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(Timestamp),
    String(String),
    Bytes(BytesValue),
    /// Fully qualified resource name of the referenced document.
    Reference(String),
    GeoPoint(GeoPoint),
    Array(ArrayValue),
    Map(MapValue),
}

impl FirestoreValue {
    pub fn null() -> Self {
        Self {
            kind: ValueKind::Null,
        }
    }

    pub fn from_bool(value: bool) -> Self {
        Self {
            kind: ValueKind::Boolean(value),
        }
    }

    pub fn from_integer(value: i64) -> Self {
        Self {
            kind: ValueKind::Integer(value),
        }
    }

    pub fn from_double(value: f64) -> Self {
        Self {
            kind: ValueKind::Double(value),
        }
    }

    pub fn from_timestamp(value: Timestamp) -> Self {
        Self {
            kind: ValueKind::Timestamp(value),
        }
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::String(value.into()),
        }
    }

    pub fn from_bytes(value: BytesValue) -> Self {
        Self {
            kind: ValueKind::Bytes(value),
        }
    }

    pub fn from_reference(name: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::Reference(name.into()),
        }
    }

    pub fn from_geo_point(value: GeoPoint) -> Self {
        Self {
            kind: ValueKind::GeoPoint(value),
        }
    }

    pub fn from_array(values: Vec<FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Array(ArrayValue::new(values)),
        }
    }

    pub fn from_map(map: BTreeMap<String, FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Map(MapValue::new(map)),
        }
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, ValueKind::Null)
    }

    pub fn is_nan(&self) -> bool {
        matches!(self.kind, ValueKind::Double(value) if value.is_nan())
    }

    pub fn is_number(&self) -> bool {
        matches!(self.kind, ValueKind::Integer(_) | ValueKind::Double(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind, ValueKind::Array(_))
    }

    pub fn as_array(&self) -> Option<&[FirestoreValue]> {
        match &self.kind {
            ValueKind::Array(array) => Some(array.values()),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, FirestoreValue>> {
        match &self.kind {
            ValueKind::Map(map) => Some(map.fields()),
            _ => None,
        }
    }

    pub(crate) fn as_map_mut(&mut self) -> Option<&mut BTreeMap<String, FirestoreValue>> {
        match &mut self.kind {
            ValueKind::Map(map) => Some(map.fields_mut()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.kind {
            ValueKind::String(value) => Some(value),
            _ => None,
        }
    }
}

impl PartialEq for FirestoreValue {
    fn eq(&self, other: &Self) -> bool {
        values::value_equals(self, other)
    }
}

impl Eq for FirestoreValue {}

impl PartialOrd for FirestoreValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FirestoreValue {
    fn cmp(&self, other: &Self) -> Ordering {
        values::value_compare(self, other)
    }
}

impl From<bool> for FirestoreValue {
    fn from(value: bool) -> Self {
        Self::from_bool(value)
    }
}

impl From<i64> for FirestoreValue {
    fn from(value: i64) -> Self {
        Self::from_integer(value)
    }
}

impl From<f64> for FirestoreValue {
    fn from(value: f64) -> Self {
        Self::from_double(value)
    }
}

impl From<&str> for FirestoreValue {
    fn from(value: &str) -> Self {
        Self::from_string(value)
    }
}

impl From<String> for FirestoreValue {
    fn from(value: String) -> Self {
        Self::from_string(value)
    }
}

impl From<Timestamp> for FirestoreValue {
    fn from(value: Timestamp) -> Self {
        Self::from_timestamp(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_basic_values() {
        let v = FirestoreValue::from_string("hello");
        match v.kind() {
            ValueKind::String(value) => assert_eq!(value, "hello"),
            _ => panic!("unexpected kind"),
        }
        assert_eq!(v.as_str(), Some("hello"));
    }

    #[test]
    fn nan_detection() {
        assert!(FirestoreValue::from_double(f64::NAN).is_nan());
        assert!(!FirestoreValue::from_integer(0).is_nan());
        assert!(FirestoreValue::from_integer(0).is_number());
    }

    #[test]
    fn equality_uses_value_semantics() {
        assert_eq!(
            FirestoreValue::from_double(f64::NAN),
            FirestoreValue::from_double(f64::NAN)
        );
        assert_eq!(
            FirestoreValue::from_double(-0.0),
            FirestoreValue::from_double(0.0)
        );
        assert_eq!(
            FirestoreValue::from_integer(1),
            FirestoreValue::from_double(1.0)
        );
    }
}
