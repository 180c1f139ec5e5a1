//! Builders shared by unit tests.

use crate::firestore::core::query::Query;
use crate::firestore::model::{
    DocumentKey, FieldMask, FieldPath, MutableDocument, Mutation, ObjectValue, ResourcePath,
    SnapshotVersion, Timestamp,
};
use crate::firestore::value::FirestoreValue;

pub fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).expect("valid document path")
}

pub fn path(field: &str) -> FieldPath {
    FieldPath::from_dot_separated(field).expect("valid field path")
}

pub fn version(seconds: i64) -> SnapshotVersion {
    SnapshotVersion::new(Timestamp::new(seconds, 0))
}

/// Object with dot-separated field paths.
pub fn map(entries: &[(&str, FirestoreValue)]) -> ObjectValue {
    let mut object = ObjectValue::empty();
    for (field, value) in entries {
        object.set(&path(field), value.clone());
    }
    object
}

/// Found document at `version_seconds`.
pub fn doc(document_path: &str, version_seconds: i64, data: ObjectValue) -> MutableDocument {
    MutableDocument::new_found_document(
        key(document_path),
        version(version_seconds),
        version(version_seconds),
        data,
    )
}

pub fn deleted_doc(document_path: &str, version_seconds: i64) -> MutableDocument {
    MutableDocument::new_no_document(key(document_path), version(version_seconds))
}

pub fn set_mutation(document_path: &str, data: ObjectValue) -> Mutation {
    Mutation::set(key(document_path), data)
}

/// Patch whose mask is every leaf of `data`.
pub fn patch_mutation(document_path: &str, data: ObjectValue) -> Mutation {
    let mask: FieldMask = data.field_mask();
    Mutation::patch(key(document_path), data, mask)
}

pub fn delete_mutation(document_path: &str) -> Mutation {
    Mutation::delete(key(document_path))
}

pub fn query(collection_path: &str) -> Query {
    Query::new(ResourcePath::from_string(collection_path).expect("valid collection path"))
}
