use crate::firestore::core::target::Target;
use crate::firestore::model::{ListenSequenceNumber, SnapshotVersion, TargetId};

/// Why a target is being listened to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TargetPurpose {
    /// A regular query listener.
    Listen,
    /// Re-listen after an existence filter mismatch without a usable bloom filter.
    ExistenceFilterMismatch,
    /// Re-listen after the bloom filter could not explain a mismatch.
    ExistenceFilterMismatchBloom,
    /// Single-document target confirming whether a limbo document exists.
    LimboResolution,
}

/// A target plus the bookkeeping the cache keeps for it.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetData {
    pub target: Target,
    pub target_id: TargetId,
    pub purpose: TargetPurpose,
    pub sequence_number: ListenSequenceNumber,
    /// Version of the last consistent snapshot received for this target.
    pub snapshot_version: SnapshotVersion,
    /// Last snapshot at which the view had no limbo documents; bounds
    /// incremental re-runs of the query against cached results.
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    /// Opaque cursor for resuming the watch; empty when none was received.
    pub resume_token: Vec<u8>,
    /// Documents the target matched when it was last current, sent back to
    /// size bloom filters in existence filter replies.
    pub expected_count: Option<i32>,
}

impl TargetData {
    pub fn new(
        target: Target,
        target_id: TargetId,
        purpose: TargetPurpose,
        sequence_number: ListenSequenceNumber,
    ) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::min(),
            last_limbo_free_snapshot_version: SnapshotVersion::min(),
            resume_token: Vec::new(),
            expected_count: None,
        }
    }

    pub fn with_sequence_number(mut self, sequence_number: ListenSequenceNumber) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    /// A new resume token invalidates any previously recorded expected count.
    pub fn with_resume_token(mut self, resume_token: Vec<u8>, snapshot_version: SnapshotVersion) -> Self {
        self.resume_token = resume_token;
        self.snapshot_version = snapshot_version;
        self.expected_count = None;
        self
    }

    pub fn with_expected_count(mut self, expected_count: i32) -> Self {
        self.expected_count = Some(expected_count);
        self
    }

    pub fn with_last_limbo_free_snapshot_version(mut self, version: SnapshotVersion) -> Self {
        self.last_limbo_free_snapshot_version = version;
        self
    }

    pub fn with_purpose(mut self, purpose: TargetPurpose) -> Self {
        self.purpose = purpose;
        self
    }
}
