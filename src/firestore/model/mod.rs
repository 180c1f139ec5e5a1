mod database_id;
mod document;
mod document_key;
mod field_mask;
mod field_path;
mod geo_point;
pub mod mutation;
mod mutation_batch;
mod object_value;
mod resource_path;
mod snapshot_version;
mod timestamp;

pub use database_id::{DatabaseId, DEFAULT_DATABASE_ID};
pub use document::{DocumentState, DocumentType, MutableDocument};
pub use document_key::DocumentKey;
pub use field_mask::FieldMask;
pub use field_path::{FieldPath, IntoFieldPath};
pub use geo_point::GeoPoint;
pub use mutation::{
    calculate_overlay_mutation, FieldTransform, Mutation, MutationKind, MutationResult,
    Precondition, TransformOperation,
};
pub use mutation_batch::{MutationBatch, MutationBatchResult, Overlay, OverlayedDocument};
pub use object_value::ObjectValue;
pub use resource_path::ResourcePath;
pub use snapshot_version::SnapshotVersion;
pub use timestamp::Timestamp;

pub type BatchId = i32;
pub type TargetId = i32;
pub type ListenSequenceNumber = i64;

/// Batch id used before any batch has been written.
pub const BATCH_ID_UNKNOWN: BatchId = -1;
