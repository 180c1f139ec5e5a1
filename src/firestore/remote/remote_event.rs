use std::collections::BTreeMap;

use crate::firestore::collection::{DocumentKeySet, MutableDocumentMap};
use crate::firestore::local::target_data::TargetPurpose;
use crate::firestore::model::{SnapshotVersion, TargetId};

/// Everything the watch stream established as of one consistent snapshot.
#[derive(Debug, Clone, Default)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose existence filter did not match, with the purpose of the requery.
    pub target_mismatches: BTreeMap<TargetId, TargetPurpose>,
    pub document_updates: MutableDocumentMap,
    /// Limbo documents the watch stream confirmed as present or absent.
    pub resolved_limbo_documents: DocumentKeySet,
}

impl RemoteEvent {
    /// Event that only marks `target_id` current, as sent after a target with
    /// no documents is resolved without a snapshot.
    pub fn synthesized_for_current_change(
        target_id: TargetId,
        current: bool,
        resume_token: Vec<u8>,
    ) -> Self {
        let mut target_changes = BTreeMap::new();
        target_changes.insert(
            target_id,
            TargetChange::synthesized_for_current_change(current, resume_token),
        );
        Self {
            snapshot_version: SnapshotVersion::min(),
            target_changes,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty()
            && self.document_updates.is_empty()
            && self.target_mismatches.is_empty()
            && self.resolved_limbo_documents.is_empty()
    }
}

/// Changes to one target's result set. The three key sets are disjoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetChange {
    /// Empty when the server did not send a new token.
    pub resume_token: Vec<u8>,
    pub current: bool,
    pub added_documents: DocumentKeySet,
    pub modified_documents: DocumentKeySet,
    pub removed_documents: DocumentKeySet,
}

impl TargetChange {
    pub fn synthesized_for_current_change(current: bool, resume_token: Vec<u8>) -> Self {
        Self {
            resume_token,
            current,
            ..Self::default()
        }
    }

    pub fn document_count(&self) -> usize {
        self.added_documents.len() + self.modified_documents.len() + self.removed_documents.len()
    }
}
