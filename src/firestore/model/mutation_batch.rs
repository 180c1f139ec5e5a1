use std::collections::BTreeMap;

use crate::firestore::collection::{DocumentKeySet, DocumentVersionMap};
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::mutation::calculate_overlay_mutation;
use crate::firestore::model::{
    BatchId, DocumentKey, FieldMask, MutableDocument, Mutation, MutationResult, SnapshotVersion,
    Timestamp,
};

/// A document with all pending local mutations applied, plus the fields they touched.
#[derive(Clone, Debug, PartialEq)]
pub struct OverlayedDocument {
    pub document: MutableDocument,
    /// `None` when a set or delete replaced the whole document.
    pub mutated_fields: Option<FieldMask>,
}

/// Mutations written together by one local write call.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatch {
    pub batch_id: BatchId,
    pub local_write_time: Timestamp,
    /// Mutations applied before `mutations`, used to preserve base state for transforms.
    pub base_mutations: Vec<Mutation>,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: BatchId,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    pub fn apply_to_remote_document(
        &self,
        document: &mut MutableDocument,
        batch_result: &MutationBatchResult,
    ) {
        for (mutation, result) in self
            .mutations
            .iter()
            .zip(batch_result.mutation_results.iter())
        {
            if mutation.key == *document.key() {
                mutation.apply_to_remote_document(document, result);
            }
        }
    }

    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        mut mutated_fields: Option<FieldMask>,
    ) -> Option<FieldMask> {
        for mutation in self.base_mutations.iter().chain(self.mutations.iter()) {
            if mutation.key == *document.key() {
                mutated_fields =
                    mutation.apply_to_local_view(document, mutated_fields, self.local_write_time);
            }
        }
        mutated_fields
    }

    /// Applies the batch to every affected document in `documents` and
    /// returns the overlay each of them now needs.
    ///
    /// Keys in `documents_without_remote_version` get a full set or delete
    /// overlay since there is no remote base to patch.
    pub fn apply_to_local_document_set(
        &self,
        documents: &mut BTreeMap<DocumentKey, OverlayedDocument>,
        documents_without_remote_version: &DocumentKeySet,
    ) -> BTreeMap<DocumentKey, Mutation> {
        let mut overlays = BTreeMap::new();
        for key in self.keys().iter() {
            let Some(overlayed) = documents.get_mut(key) else {
                continue;
            };
            let mut mutated_fields =
                self.apply_to_local_view(&mut overlayed.document, overlayed.mutated_fields.take());
            if documents_without_remote_version.contains(key) {
                mutated_fields = None;
            }
            if let Some(overlay) =
                calculate_overlay_mutation(&overlayed.document, mutated_fields.as_ref())
            {
                overlays.insert(key.clone(), overlay);
            }
            overlayed.mutated_fields = mutated_fields;
            if overlayed.document.is_invalid_document() {
                overlayed
                    .document
                    .convert_to_no_document(SnapshotVersion::min());
            }
        }
        overlays
    }

    pub fn keys(&self) -> DocumentKeySet {
        self.mutations
            .iter()
            .map(|mutation| mutation.key.clone())
            .collect()
    }
}

/// The backend's acknowledgement of a [`MutationBatch`].
#[derive(Clone, Debug)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Vec<u8>,
    /// Version each written document reached.
    pub doc_versions: DocumentVersionMap,
}

impl MutationBatchResult {
    pub fn from(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<Self> {
        if batch.mutations.len() != mutation_results.len() {
            return Err(internal_error(format!(
                "Mutations sent {} must equal results received {}",
                batch.mutations.len(),
                mutation_results.len()
            )));
        }
        let mut doc_versions = DocumentVersionMap::new();
        for (mutation, result) in batch.mutations.iter().zip(mutation_results.iter()) {
            let version = if result.version.is_min() {
                commit_version
            } else {
                result.version
            };
            doc_versions = doc_versions.insert(mutation.key.clone(), version);
        }
        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        })
    }
}

/// The net pending effect of local writes on one document.
#[derive(Clone, Debug, PartialEq)]
pub struct Overlay {
    pub largest_batch_id: BatchId,
    pub mutation: Mutation,
}

impl Overlay {
    pub fn new(largest_batch_id: BatchId, mutation: Mutation) -> Self {
        Self {
            largest_batch_id,
            mutation,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        &self.mutation.key
    }
}
