use std::collections::BTreeMap;

use crate::firestore::model::{
    DocumentKey, FieldMask, FieldPath, MutableDocument, ObjectValue, SnapshotVersion, Timestamp,
};
use crate::firestore::value::values::server_timestamp_value;
use crate::firestore::value::{FirestoreValue, ValueKind};
use crate::util::hard_assert;

/// Condition the current document must meet for a mutation to apply.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, document: &MutableDocument) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == document.is_found_document(),
            Precondition::UpdateTime(version) => {
                document.is_found_document() && document.version() == *version
            }
        }
    }
}

/// Server-side transforms attached to set and patch mutations.
#[derive(Clone, Debug, PartialEq)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(FirestoreValue),
}

impl TransformOperation {
    /// Locally estimated result, shown until the server reports the real one.
    pub fn apply_to_local_view(
        &self,
        previous: Option<&FirestoreValue>,
        local_write_time: Timestamp,
    ) -> FirestoreValue {
        match self {
            TransformOperation::ServerTimestamp => {
                server_timestamp_value(local_write_time, previous)
            }
            TransformOperation::ArrayUnion(elements) => {
                let mut values = coerce_array(previous);
                for element in elements {
                    if !values.contains(element) {
                        values.push(element.clone());
                    }
                }
                FirestoreValue::from_array(values)
            }
            TransformOperation::ArrayRemove(elements) => {
                let values = coerce_array(previous)
                    .into_iter()
                    .filter(|candidate| !elements.contains(candidate))
                    .collect();
                FirestoreValue::from_array(values)
            }
            TransformOperation::NumericIncrement(operand) => increment(previous, operand),
        }
    }

    /// Value the transform must start from when re-applied on top of a
    /// different base; only increments depend on their base.
    pub fn compute_base_value(&self, previous: Option<&FirestoreValue>) -> Option<FirestoreValue> {
        match self {
            TransformOperation::NumericIncrement(_) => Some(match previous {
                Some(value) if value.is_number() => value.clone(),
                _ => FirestoreValue::from_integer(0),
            }),
            _ => None,
        }
    }

    /// The backend's result is authoritative for every transform type.
    pub fn apply_to_remote_document(
        &self,
        _previous: Option<&FirestoreValue>,
        transform_result: FirestoreValue,
    ) -> FirestoreValue {
        transform_result
    }
}

fn coerce_array(previous: Option<&FirestoreValue>) -> Vec<FirestoreValue> {
    previous
        .and_then(FirestoreValue::as_array)
        .map(<[FirestoreValue]>::to_vec)
        .unwrap_or_default()
}

/// Non-numeric previous values count as zero. Integer sums saturate.
fn increment(previous: Option<&FirestoreValue>, operand: &FirestoreValue) -> FirestoreValue {
    match (previous.map(FirestoreValue::kind), operand.kind()) {
        (Some(ValueKind::Integer(base)), ValueKind::Integer(delta)) => {
            FirestoreValue::from_integer(base.saturating_add(*delta))
        }
        (Some(ValueKind::Integer(base)), ValueKind::Double(delta)) => {
            FirestoreValue::from_double(*base as f64 + *delta)
        }
        (Some(ValueKind::Double(base)), ValueKind::Integer(delta)) => {
            FirestoreValue::from_double(*base + *delta as f64)
        }
        (Some(ValueKind::Double(base)), ValueKind::Double(delta)) => {
            FirestoreValue::from_double(*base + *delta)
        }
        (_, ValueKind::Integer(_) | ValueKind::Double(_)) => operand.clone(),
        _ => previous.cloned().unwrap_or_else(FirestoreValue::null),
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldTransform {
    pub field: FieldPath,
    pub operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field: FieldPath, operation: TransformOperation) -> Self {
        Self { field, operation }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MutationKind {
    /// Replaces the whole document.
    Set { value: ObjectValue },
    /// Writes the masked fields; masked paths missing from `data` are deleted.
    Patch { data: ObjectValue, mask: FieldMask },
    Delete,
    /// Checks the precondition without writing anything.
    Verify,
}

/// A single write against one document.
#[derive(Clone, Debug, PartialEq)]
pub struct Mutation {
    pub key: DocumentKey,
    pub precondition: Precondition,
    pub kind: MutationKind,
    pub field_transforms: Vec<FieldTransform>,
}

/// Result of applying a mutation on the backend.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResult {
    /// Version of the document after the write; `min()` when it was not reported.
    pub version: SnapshotVersion,
    pub transform_results: Vec<FirestoreValue>,
}

impl MutationResult {
    pub fn new(version: SnapshotVersion, transform_results: Vec<FirestoreValue>) -> Self {
        Self {
            version,
            transform_results,
        }
    }
}

impl Mutation {
    pub fn set(key: DocumentKey, value: ObjectValue) -> Self {
        Self {
            key,
            precondition: Precondition::None,
            kind: MutationKind::Set { value },
            field_transforms: Vec::new(),
        }
    }

    pub fn patch(key: DocumentKey, data: ObjectValue, mask: FieldMask) -> Self {
        Self {
            key,
            precondition: Precondition::Exists(true),
            kind: MutationKind::Patch { data, mask },
            field_transforms: Vec::new(),
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Self {
            key,
            precondition: Precondition::None,
            kind: MutationKind::Delete,
            field_transforms: Vec::new(),
        }
    }

    pub fn verify(key: DocumentKey, precondition: Precondition) -> Self {
        Self {
            key,
            precondition,
            kind: MutationKind::Verify,
            field_transforms: Vec::new(),
        }
    }

    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        self.precondition = precondition;
        self
    }

    pub fn with_transform(mut self, field: FieldPath, operation: TransformOperation) -> Self {
        self.field_transforms.push(FieldTransform::new(field, operation));
        self
    }

    pub fn is_delete(&self) -> bool {
        matches!(self.kind, MutationKind::Delete)
    }

    /// Fields written by a patch and its transforms; `None` for whole-document writes.
    pub fn field_mask(&self) -> Option<FieldMask> {
        match &self.kind {
            MutationKind::Patch { mask, .. } => {
                let mut mask = mask.clone();
                for transform in &self.field_transforms {
                    mask.insert(transform.field.clone());
                }
                Some(mask)
            }
            _ => None,
        }
    }

    /// Captures the base values of non-idempotent transforms from the
    /// document the user saw, so the batch replays identically later.
    pub fn extract_transform_base_value(&self, document: &MutableDocument) -> Option<ObjectValue> {
        let mut base = ObjectValue::empty();
        for transform in &self.field_transforms {
            let previous = document.field(&transform.field);
            if let Some(value) = transform.operation.compute_base_value(previous) {
                base.set(&transform.field, value);
            }
        }
        if base.is_empty() {
            None
        } else {
            Some(base)
        }
    }

    /// Applies the mutation as acknowledged by the backend.
    pub fn apply_to_remote_document(
        &self,
        document: &mut MutableDocument,
        result: &MutationResult,
    ) {
        hard_assert(
            document.key() == &self.key,
            "Can only apply a mutation to a document with the same key",
        );
        match &self.kind {
            MutationKind::Set { value } => {
                let transforms = self.server_transform_results(document, &result.transform_results);
                let mut data = value.clone();
                data.set_all(transforms);
                document
                    .convert_to_found_document(result.version, data)
                    .set_has_committed_mutations();
            }
            MutationKind::Patch { data, mask } => {
                if !self.precondition.is_valid_for(document) {
                    // The patch was acknowledged but its base is unknown locally.
                    document.convert_to_unknown_document(result.version);
                    return;
                }
                let transforms = self.server_transform_results(document, &result.transform_results);
                let mut merged = document.data().clone();
                merged.set_all(patch_values(data, mask));
                merged.set_all(transforms);
                document
                    .convert_to_found_document(result.version, merged)
                    .set_has_committed_mutations();
            }
            MutationKind::Delete => {
                document
                    .convert_to_no_document(result.version)
                    .set_has_committed_mutations();
            }
            MutationKind::Verify => {}
        }
    }

    /// Applies the mutation optimistically.
    ///
    /// `previous_mask` is the set of fields already changed by earlier local
    /// mutations; `None` means the whole document was replaced. The returned
    /// mask accumulates this mutation's effect in the same way.
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        hard_assert(
            document.key() == &self.key,
            "Can only apply a mutation to a document with the same key",
        );
        if !self.precondition.is_valid_for(document) {
            return previous_mask;
        }
        match &self.kind {
            MutationKind::Set { value } => {
                let transforms = self.local_transform_results(document, local_write_time);
                let mut data = value.clone();
                data.set_all(transforms);
                let version = document.version();
                document
                    .convert_to_found_document(version, data)
                    .set_has_local_mutations();
                None
            }
            MutationKind::Patch { data, mask } => {
                let transforms = self.local_transform_results(document, local_write_time);
                let mut merged = document.data().clone();
                merged.set_all(patch_values(data, mask));
                merged.set_all(transforms);
                let version = document.version();
                document
                    .convert_to_found_document(version, merged)
                    .set_has_local_mutations();
                let mut previous_mask = previous_mask?;
                previous_mask.union_with(mask);
                for transform in &self.field_transforms {
                    previous_mask.insert(transform.field.clone());
                }
                Some(previous_mask)
            }
            MutationKind::Delete => {
                let version = document.version();
                document
                    .convert_to_no_document(version)
                    .set_has_local_mutations();
                None
            }
            MutationKind::Verify => previous_mask,
        }
    }

    fn local_transform_results(
        &self,
        document: &MutableDocument,
        local_write_time: Timestamp,
    ) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
        self.field_transforms
            .iter()
            .map(|transform| {
                let previous = document.field(&transform.field);
                let value = transform
                    .operation
                    .apply_to_local_view(previous, local_write_time);
                (transform.field.clone(), Some(value))
            })
            .collect()
    }

    fn server_transform_results(
        &self,
        document: &MutableDocument,
        results: &[FirestoreValue],
    ) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
        hard_assert(
            self.field_transforms.len() == results.len(),
            "Server transform result count does not match the field transforms",
        );
        self.field_transforms
            .iter()
            .zip(results.iter())
            .map(|(transform, result)| {
                let previous = document.field(&transform.field);
                let value = transform
                    .operation
                    .apply_to_remote_document(previous, result.clone());
                (transform.field.clone(), Some(value))
            })
            .collect()
    }
}

fn patch_values(data: &ObjectValue, mask: &FieldMask) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
    mask.fields()
        .filter(|path| !path.is_empty())
        .map(|path| (path.clone(), data.field(path).cloned()))
        .collect()
}

/// Collapses a document's pending local changes into one mutation.
///
/// Returns `None` when the document has no local mutations or the mask is
/// empty. A `None` mask yields a set (or a delete for missing documents).
/// Deleted nested fields are masked by their parent so the patch removes them.
pub fn calculate_overlay_mutation(
    document: &MutableDocument,
    mask: Option<&FieldMask>,
) -> Option<Mutation> {
    if !document.has_local_mutations() {
        return None;
    }
    let Some(mask) = mask else {
        if document.is_no_document() {
            return Some(Mutation::delete(document.key().clone()));
        }
        return Some(Mutation::set(document.key().clone(), document.data().clone()));
    };
    if mask.is_empty() {
        return None;
    }

    let data = document.data();
    let mut patch = ObjectValue::empty();
    let mut patch_mask = FieldMask::empty();
    for path in mask.fields() {
        if patch_mask.fields().any(|existing| existing == path) {
            continue;
        }
        let mut path = path.clone();
        let mut value = data.field(&path);
        if value.is_none() && path.len() > 1 {
            path = path.without_last();
            value = data.field(&path);
        }
        match value {
            Some(value) => patch.set(&path, value.clone()),
            None => patch.delete(&path),
        }
        patch_mask.insert(path);
    }
    Some(
        Mutation::patch(document.key().clone(), patch, patch_mask)
            .with_precondition(Precondition::None),
    )
}
