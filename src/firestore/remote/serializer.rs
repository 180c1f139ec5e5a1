use std::collections::BTreeMap;
use std::str::FromStr;

use serde_json::{json, Value as JsonValue};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::{
    DatabaseId, DocumentKey, GeoPoint, MutableDocument, Mutation, MutationKind, MutationResult,
    ObjectValue, Precondition, ResourcePath, SnapshotVersion, Timestamp, TransformOperation,
};
use crate::firestore::remote::structured_query::encode_query_target;
use crate::firestore::value::{BytesValue, FirestoreValue, ValueKind};

/// Commit outcome decoded from a write stream response.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteResponse {
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Vec<u8>,
}

/// Converts between model types and the JSON form of the Firestore protos.
#[derive(Clone, Debug)]
pub struct JsonProtoSerializer {
    database_id: DatabaseId,
}

impl JsonProtoSerializer {
    pub fn new(database_id: DatabaseId) -> Self {
        Self { database_id }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn database_name(&self) -> String {
        self.database_id.database_name()
    }

    /// `projects/{p}/databases/{d}/documents[/{path}]`
    pub fn resource_name(&self, path: &ResourcePath) -> String {
        let root = format!("{}/documents", self.database_name());
        if path.is_empty() {
            root
        } else {
            format!("{root}/{}", path.canonical_string())
        }
    }

    pub fn document_name(&self, key: &DocumentKey) -> String {
        self.resource_name(key.path())
    }

    /// Strips the database prefix from a resource name, rejecting names that
    /// belong to another project or database.
    pub fn decode_resource_path(&self, name: &str) -> FirestoreResult<ResourcePath> {
        let path = ResourcePath::from_string(name)?;
        let valid = path.len() >= 5
            && path.get(0) == Some("projects")
            && path.get(1) == Some(self.database_id.project_id())
            && path.get(2) == Some("databases")
            && path.get(3) == Some(self.database_id.database())
            && path.get(4) == Some("documents");
        if !valid {
            return Err(invalid_argument(format!(
                "Tried to deserialize invalid resource name '{name}' for database {}",
                self.database_name()
            )));
        }
        Ok(path.pop_first_n(5))
    }

    pub fn decode_document_key(&self, name: &str) -> FirestoreResult<DocumentKey> {
        DocumentKey::from_path(self.decode_resource_path(name)?)
    }

    pub fn encode_version(&self, version: SnapshotVersion) -> JsonValue {
        JsonValue::String(version.timestamp().to_rfc3339())
    }

    /// Missing or null timestamps decode as the minimum version.
    pub fn decode_version(&self, value: Option<&JsonValue>) -> FirestoreResult<SnapshotVersion> {
        match value {
            None | Some(JsonValue::Null) => Ok(SnapshotVersion::min()),
            Some(JsonValue::String(text)) => Ok(SnapshotVersion::new(Timestamp::from_rfc3339(text)?)),
            Some(_) => Err(invalid_argument("Timestamps must be RFC 3339 strings")),
        }
    }

    pub fn encode_document(&self, key: &DocumentKey, data: &ObjectValue) -> JsonValue {
        json!({
            "name": self.document_name(key),
            "fields": encode_fields(data.fields()),
        })
    }

    /// Decodes a `Document` message into a found document.
    pub fn decode_found_document(&self, value: &JsonValue) -> FirestoreResult<MutableDocument> {
        let name = value
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Document is missing its name"))?;
        let key = self.decode_document_key(name)?;
        let version = self.decode_version(value.get("updateTime"))?;
        if version.is_min() {
            return Err(invalid_argument("Got a document with no update time"));
        }
        let create_time = self.decode_version(value.get("createTime"))?;
        let data = match value.get("fields") {
            Some(fields) => ObjectValue::from_map(decode_fields(fields)?),
            None => ObjectValue::empty(),
        };
        Ok(MutableDocument::new_found_document(key, version, create_time, data))
    }

    pub fn encode_mutation(&self, mutation: &Mutation) -> JsonValue {
        let mut write = serde_json::Map::new();
        match &mutation.kind {
            MutationKind::Set { value } => {
                write.insert("update".to_string(), self.encode_document(&mutation.key, value));
            }
            MutationKind::Patch { data, mask } => {
                write.insert("update".to_string(), self.encode_document(&mutation.key, data));
                let paths: Vec<String> = mask.fields().map(|field| field.canonical_string()).collect();
                write.insert("updateMask".to_string(), json!({ "fieldPaths": paths }));
            }
            MutationKind::Delete => {
                write.insert("delete".to_string(), json!(self.document_name(&mutation.key)));
            }
            MutationKind::Verify => {
                write.insert("verify".to_string(), json!(self.document_name(&mutation.key)));
            }
        }

        if !mutation.field_transforms.is_empty() {
            let transforms: Vec<JsonValue> = mutation
                .field_transforms
                .iter()
                .map(|transform| {
                    let mut encoded = serde_json::Map::new();
                    encoded.insert(
                        "fieldPath".to_string(),
                        json!(transform.field.canonical_string()),
                    );
                    let (name, operand) = match &transform.operation {
                        TransformOperation::ServerTimestamp => {
                            ("setToServerValue", json!("REQUEST_TIME"))
                        }
                        TransformOperation::ArrayUnion(elements) => (
                            "appendMissingElements",
                            json!({ "values": elements.iter().map(encode_value).collect::<Vec<_>>() }),
                        ),
                        TransformOperation::ArrayRemove(elements) => (
                            "removeAllFromArray",
                            json!({ "values": elements.iter().map(encode_value).collect::<Vec<_>>() }),
                        ),
                        TransformOperation::NumericIncrement(operand) => {
                            ("increment", encode_value(operand))
                        }
                    };
                    encoded.insert(name.to_string(), operand);
                    JsonValue::Object(encoded)
                })
                .collect();
            write.insert("updateTransforms".to_string(), JsonValue::Array(transforms));
        }

        match &mutation.precondition {
            Precondition::None => {}
            Precondition::Exists(exists) => {
                write.insert("currentDocument".to_string(), json!({ "exists": exists }));
            }
            Precondition::UpdateTime(version) => {
                write.insert(
                    "currentDocument".to_string(),
                    json!({ "updateTime": self.encode_version(*version) }),
                );
            }
        }
        JsonValue::Object(write)
    }

    /// Decodes a `WriteResult`; a missing update time means the write was a
    /// no-op and the commit version applies.
    pub fn decode_mutation_result(
        &self,
        value: &JsonValue,
        commit_version: SnapshotVersion,
    ) -> FirestoreResult<MutationResult> {
        let mut version = self.decode_version(value.get("updateTime"))?;
        if version.is_min() {
            version = commit_version;
        }
        let transform_results = match value.get("transformResults").and_then(JsonValue::as_array) {
            Some(results) => results.iter().map(decode_value).collect::<FirestoreResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        Ok(MutationResult::new(version, transform_results))
    }

    pub fn decode_write_response(&self, value: &JsonValue) -> FirestoreResult<WriteResponse> {
        let commit_version = self.decode_version(value.get("commitTime"))?;
        let mutation_results = match value.get("writeResults").and_then(JsonValue::as_array) {
            Some(results) => results
                .iter()
                .map(|result| self.decode_mutation_result(result, commit_version))
                .collect::<FirestoreResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        let stream_token = match value.get("streamToken").and_then(JsonValue::as_str) {
            Some(token) => decode_bytes(token)?,
            None => Vec::new(),
        };
        Ok(WriteResponse {
            commit_version,
            mutation_results,
            stream_token,
        })
    }

    /// Encodes the `Target` message sent on the listen stream.
    pub fn encode_target(&self, target_data: &TargetData) -> JsonValue {
        let target = &target_data.target;
        let mut encoded = if target.is_document_target() {
            json!({ "documents": { "documents": [self.resource_name(&target.path)] } })
        } else {
            json!({ "query": encode_query_target(self, target) })
        };
        let Some(object) = encoded.as_object_mut() else {
            return encoded;
        };
        object.insert("targetId".to_string(), json!(target_data.target_id));
        if !target_data.resume_token.is_empty() {
            object.insert(
                "resumeToken".to_string(),
                json!(BytesValue::new(target_data.resume_token.clone()).to_base64()),
            );
            if let Some(expected_count) = target_data.expected_count {
                object.insert("expectedCount".to_string(), json!(expected_count));
            }
        } else if !target_data.snapshot_version.is_min() {
            object.insert(
                "readTime".to_string(),
                self.encode_version(target_data.snapshot_version),
            );
            if let Some(expected_count) = target_data.expected_count {
                object.insert("expectedCount".to_string(), json!(expected_count));
            }
        }
        encoded
    }
}

pub(crate) fn decode_bytes(value: &str) -> FirestoreResult<Vec<u8>> {
    BytesValue::from_base64(value)
        .map(|bytes| bytes.as_slice().to_vec())
        .map_err(|err| invalid_argument(format!("Invalid base64 payload: {err}")))
}

pub(crate) fn encode_fields(fields: &BTreeMap<String, FirestoreValue>) -> JsonValue {
    let mut encoded = serde_json::Map::new();
    for (key, value) in fields {
        encoded.insert(key.clone(), encode_value(value));
    }
    JsonValue::Object(encoded)
}

pub(crate) fn decode_fields(value: &JsonValue) -> FirestoreResult<BTreeMap<String, FirestoreValue>> {
    let object = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected 'fields' to be an object"))?;
    let mut fields = BTreeMap::new();
    for (key, value) in object {
        fields.insert(key.clone(), decode_value(value)?);
    }
    Ok(fields)
}

pub(crate) fn encode_value(value: &FirestoreValue) -> JsonValue {
    match value.kind() {
        ValueKind::Null => json!({ "nullValue": JsonValue::Null }),
        ValueKind::Boolean(boolean) => json!({ "booleanValue": boolean }),
        ValueKind::Integer(integer) => json!({ "integerValue": integer.to_string() }),
        ValueKind::Double(double) => {
            if double.is_finite() {
                json!({ "doubleValue": double })
            } else if double.is_nan() {
                json!({ "doubleValue": "NaN" })
            } else if *double > 0.0 {
                json!({ "doubleValue": "Infinity" })
            } else {
                json!({ "doubleValue": "-Infinity" })
            }
        }
        ValueKind::Timestamp(timestamp) => json!({ "timestampValue": timestamp.to_rfc3339() }),
        ValueKind::String(string) => json!({ "stringValue": string }),
        ValueKind::Bytes(bytes) => json!({ "bytesValue": bytes.to_base64() }),
        ValueKind::Reference(reference) => json!({ "referenceValue": reference }),
        ValueKind::GeoPoint(point) => json!({
            "geoPointValue": {
                "latitude": point.latitude(),
                "longitude": point.longitude(),
            }
        }),
        ValueKind::Array(array) => {
            let values = array.values().iter().map(encode_value).collect::<Vec<_>>();
            json!({ "arrayValue": { "values": values } })
        }
        ValueKind::Map(map) => json!({
            "mapValue": {
                "fields": encode_fields(map.fields())
            }
        }),
    }
}

pub(crate) fn decode_value(value: &JsonValue) -> FirestoreResult<FirestoreValue> {
    let object = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected Firestore value object"))?;
    if object.contains_key("nullValue") {
        return Ok(FirestoreValue::null());
    }
    if let Some(bool_value) = object.get("booleanValue") {
        let value = bool_value
            .as_bool()
            .ok_or_else(|| invalid_argument("booleanValue must be bool"))?;
        return Ok(FirestoreValue::from_bool(value));
    }
    if let Some(integer_value) = object.get("integerValue") {
        let parsed = match integer_value {
            JsonValue::String(value) => i64::from_str(value)
                .map_err(|err| invalid_argument(format!("Invalid integerValue: {err}")))?,
            JsonValue::Number(number) => number
                .as_i64()
                .ok_or_else(|| invalid_argument("Integer out of range"))?,
            _ => return Err(invalid_argument("integerValue must be a string or number")),
        };
        return Ok(FirestoreValue::from_integer(parsed));
    }
    if let Some(double_value) = object.get("doubleValue") {
        let parsed = match double_value {
            JsonValue::Number(number) => number
                .as_f64()
                .ok_or_else(|| invalid_argument("Invalid doubleValue"))?,
            JsonValue::String(value) => value
                .parse::<f64>()
                .map_err(|err| invalid_argument(format!("Invalid doubleValue: {err}")))?,
            _ => return Err(invalid_argument("doubleValue must be a number or string")),
        };
        return Ok(FirestoreValue::from_double(parsed));
    }
    if let Some(timestamp_value) = object.get("timestampValue") {
        let text = timestamp_value
            .as_str()
            .ok_or_else(|| invalid_argument("timestampValue must be string"))?;
        return Ok(FirestoreValue::from_timestamp(Timestamp::from_rfc3339(text)?));
    }
    if let Some(string_value) = object.get("stringValue") {
        let text = string_value
            .as_str()
            .ok_or_else(|| invalid_argument("stringValue must be string"))?;
        return Ok(FirestoreValue::from_string(text));
    }
    if let Some(bytes_value) = object.get("bytesValue") {
        let text = bytes_value
            .as_str()
            .ok_or_else(|| invalid_argument("bytesValue must be base64 string"))?;
        return Ok(FirestoreValue::from_bytes(BytesValue::new(decode_bytes(text)?)));
    }
    if let Some(reference_value) = object.get("referenceValue") {
        let text = reference_value
            .as_str()
            .ok_or_else(|| invalid_argument("referenceValue must be string"))?;
        return Ok(FirestoreValue::from_reference(text));
    }
    if let Some(geo_point) = object.get("geoPointValue") {
        let latitude = geo_point
            .get("latitude")
            .and_then(JsonValue::as_f64)
            .unwrap_or(0.0);
        let longitude = geo_point
            .get("longitude")
            .and_then(JsonValue::as_f64)
            .unwrap_or(0.0);
        return Ok(FirestoreValue::from_geo_point(GeoPoint::new(latitude, longitude)?));
    }
    if let Some(array_value) = object.get("arrayValue") {
        let values = match array_value.get("values").and_then(JsonValue::as_array) {
            Some(entries) => entries
                .iter()
                .map(decode_value)
                .collect::<FirestoreResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        return Ok(FirestoreValue::from_array(values));
    }
    if let Some(map_value) = object.get("mapValue") {
        let fields = match map_value.get("fields") {
            Some(fields) => decode_fields(fields)?,
            None => BTreeMap::new(),
        };
        return Ok(FirestoreValue::from_map(fields));
    }

    Err(invalid_argument("Unknown Firestore value type"))
}
