use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::firestore::error::{
    internal_error, invalid_argument, FirestoreError, FirestoreErrorCode, FirestoreResult,
};
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion, TargetId};
use crate::firestore::remote::serializer::{decode_bytes, JsonProtoSerializer};

/// One decoded frame of the listen stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    DocumentChange(DocumentWatchChange),
    ExistenceFilter(ExistenceFilterChange),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchTargetChange {
    pub state: TargetChangeState,
    /// Empty means the change applies to every target.
    pub target_ids: Vec<TargetId>,
    /// Empty when the frame carried no token.
    pub resume_token: Vec<u8>,
    pub read_time: SnapshotVersion,
    pub cause: Option<FirestoreError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetChangeState {
    NoChange,
    Add,
    Remove,
    Current,
    Reset,
}

/// A document entering, changing in, or leaving some targets.
///
/// `documentDelete` frames arrive here with a no-document at the delete's
/// read time; `documentRemove` frames carry no document at all.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentWatchChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub key: DocumentKey,
    pub document: Option<MutableDocument>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub filter: ExistenceFilter,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExistenceFilter {
    pub count: i32,
    pub unchanged_names: Option<BloomFilterPayload>,
}

/// Undecoded `unchangedNames` bloom filter; decoding may still fail.
#[derive(Debug, Clone, PartialEq)]
pub struct BloomFilterPayload {
    /// Base64 bitmap as sent on the wire.
    pub bitmap: String,
    pub padding: i32,
    pub hash_count: i32,
}

#[derive(Debug, Deserialize)]
struct StatusCause {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: Option<String>,
}

pub fn decode_watch_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<Option<WatchChange>> {
    if let Some(target_change) = value.get("targetChange") {
        return decode_target_change(serializer, target_change).map(Some);
    }

    if let Some(document_change) = value.get("documentChange") {
        return decode_document_change(serializer, document_change).map(Some);
    }

    if let Some(document_delete) = value.get("documentDelete") {
        return decode_document_delete(serializer, document_delete).map(Some);
    }

    if let Some(document_remove) = value.get("documentRemove") {
        return decode_document_remove(serializer, document_remove).map(Some);
    }

    if let Some(filter) = value.get("filter") {
        return decode_filter_change(filter).map(Some);
    }

    Ok(None)
}

fn decode_target_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let target_ids = numeric_array(value.get("targetIds"));

    let resume_token = match value.get("resumeToken").and_then(JsonValue::as_str) {
        Some(token) => decode_bytes(token)?,
        None => Vec::new(),
    };

    let read_time = serializer.decode_version(value.get("readTime"))?;

    let state = value
        .get("targetChangeType")
        .and_then(JsonValue::as_str)
        .map(target_state_from_str)
        .unwrap_or(TargetChangeState::NoChange);

    let cause = value
        .get("cause")
        .map(|cause| serde_json::from_value::<StatusCause>(cause.clone()))
        .transpose()
        .map_err(|err| internal_error(format!("Failed to decode watch cause: {err}")))?
        .map(|cause| map_grpc_status(cause.code, cause.message));

    Ok(WatchChange::TargetChange(WatchTargetChange {
        state,
        target_ids,
        resume_token,
        read_time,
        cause,
    }))
}

fn decode_document_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let updated_target_ids = numeric_array(value.get("targetIds"));
    let removed_target_ids = numeric_array(value.get("removedTargetIds"));
    let document = value
        .get("document")
        .ok_or_else(|| invalid_argument("documentChange missing document"))?;
    let document = serializer.decode_found_document(document)?;

    Ok(WatchChange::DocumentChange(DocumentWatchChange {
        updated_target_ids,
        removed_target_ids,
        key: document.key().clone(),
        document: Some(document),
    }))
}

fn decode_document_delete(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let name = value
        .get("document")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("documentDelete missing document"))?;
    let key = serializer.decode_document_key(name)?;
    let read_time = serializer.decode_version(value.get("readTime"))?;
    let removed_target_ids = numeric_array(value.get("removedTargetIds"));

    Ok(WatchChange::DocumentChange(DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids,
        document: Some(MutableDocument::new_no_document(key.clone(), read_time)),
        key,
    }))
}

fn decode_document_remove(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let name = value
        .get("document")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("documentRemove missing document"))?;
    let key = serializer.decode_document_key(name)?;
    let removed_target_ids = numeric_array(value.get("removedTargetIds"));

    Ok(WatchChange::DocumentChange(DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids,
        key,
        document: None,
    }))
}

fn decode_filter_change(value: &JsonValue) -> FirestoreResult<WatchChange> {
    let target_id = value
        .get("targetId")
        .and_then(JsonValue::as_i64)
        .unwrap_or_default() as TargetId;
    let count = value
        .get("count")
        .and_then(JsonValue::as_i64)
        .unwrap_or_default() as i32;
    let unchanged_names = value.get("unchangedNames").map(|names| {
        let bits = names.get("bits");
        BloomFilterPayload {
            bitmap: bits
                .and_then(|bits| bits.get("bitmap"))
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string(),
            padding: bits
                .and_then(|bits| bits.get("padding"))
                .and_then(JsonValue::as_i64)
                .unwrap_or_default() as i32,
            hash_count: names
                .get("hashCount")
                .and_then(JsonValue::as_i64)
                .unwrap_or_default() as i32,
        }
    });
    Ok(WatchChange::ExistenceFilter(ExistenceFilterChange {
        target_id,
        filter: ExistenceFilter {
            count,
            unchanged_names,
        },
    }))
}

fn numeric_array(value: Option<&JsonValue>) -> Vec<TargetId> {
    value
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.as_i64().map(|value| value as TargetId))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default()
}

fn target_state_from_str(value: &str) -> TargetChangeState {
    match value {
        "ADD" => TargetChangeState::Add,
        "REMOVE" => TargetChangeState::Remove,
        "CURRENT" => TargetChangeState::Current,
        "RESET" => TargetChangeState::Reset,
        _ => TargetChangeState::NoChange,
    }
}

fn map_grpc_status(code: i32, message: Option<String>) -> FirestoreError {
    let message = message.unwrap_or_else(|| "watch stream error".to_string());
    FirestoreError::new(FirestoreErrorCode::from_grpc_code(code), message)
}
