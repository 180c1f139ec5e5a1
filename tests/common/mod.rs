#![allow(dead_code)]

use firebase_firestore_local::firestore::core::Query;
use firebase_firestore_local::firestore::model::{
    DocumentKey, FieldPath, MutableDocument, Mutation, ObjectValue, ResourcePath,
    SnapshotVersion, Timestamp,
};
use firebase_firestore_local::firestore::value::FirestoreValue;

pub fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).expect("valid document path")
}

pub fn field(path: &str) -> FieldPath {
    FieldPath::from_dot_separated(path).expect("valid field path")
}

pub fn version(seconds: i64) -> SnapshotVersion {
    SnapshotVersion::new(Timestamp::new(seconds, 0))
}

pub fn map(entries: &[(&str, FirestoreValue)]) -> ObjectValue {
    let mut object = ObjectValue::empty();
    for (path, value) in entries {
        object.set(&field(path), value.clone());
    }
    object
}

pub fn int(value: i64) -> FirestoreValue {
    FirestoreValue::from_integer(value)
}

pub fn doc(path: &str, seconds: i64, data: ObjectValue) -> MutableDocument {
    MutableDocument::new_found_document(key(path), version(seconds), version(seconds), data)
}

pub fn set(path: &str, data: ObjectValue) -> Mutation {
    Mutation::set(key(path), data)
}

pub fn patch(path: &str, data: ObjectValue) -> Mutation {
    let mask = data.field_mask();
    Mutation::patch(key(path), data, mask)
}

pub fn delete(path: &str) -> Mutation {
    Mutation::delete(key(path))
}

pub fn query(collection: &str) -> Query {
    Query::new(ResourcePath::from_string(collection).expect("valid collection path"))
}
