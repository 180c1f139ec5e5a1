use std::collections::BTreeMap;

use crate::firestore::collection::{DocumentKeySet, DocumentMap, MutableDocumentMap, OverlayMap};
use crate::firestore::core::query::Query;
use crate::firestore::core::target::Target;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{
    calculate_overlay_mutation, BatchId, DocumentKey, FieldMask, MutableDocument, MutationKind,
    OverlayedDocument, SnapshotVersion, Timestamp, BATCH_ID_UNKNOWN,
};

/// Local view of documents: the remote state with pending overlays applied.
///
/// Reads never touch the network. Recalculating overlays writes to the
/// overlay cache of the wrapped transaction.
pub struct LocalDocumentsView<'a> {
    txn: &'a mut PersistenceTransaction,
}

impl<'a> LocalDocumentsView<'a> {
    pub fn new(txn: &'a mut PersistenceTransaction) -> Self {
        Self { txn }
    }

    /// Local view of one document; an invalid document when nothing is known.
    pub fn get_document(&self, key: &DocumentKey) -> MutableDocument {
        let mut document = self.txn.remote_documents.get_entry(key);
        if let Some(overlay) = self.txn.document_overlays.get_overlay(key) {
            overlay
                .mutation
                .apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
        }
        document
    }

    pub fn get_documents(&mut self, keys: &DocumentKeySet) -> DocumentMap {
        let documents = self.txn.remote_documents.get_entries(keys);
        self.get_local_view_of_documents(documents, &DocumentKeySet::new())
    }

    /// Applies overlays to `documents`. Keys in `existence_state_changed` whose
    /// overlay is a patch get their overlay recalculated first, since a patch
    /// precondition may now hold where it did not before.
    pub fn get_local_view_of_documents(
        &mut self,
        documents: MutableDocumentMap,
        existence_state_changed: &DocumentKeySet,
    ) -> DocumentMap {
        let keys: DocumentKeySet = documents.keys().cloned().collect();
        let overlays = self.txn.document_overlays.get_overlays(&keys);
        self.compute_views(documents, overlays, existence_state_changed)
            .into_iter()
            .map(|(key, overlayed)| (key, overlayed.document))
            .collect()
    }

    /// Overlayed documents together with the fields their overlays touched.
    pub fn get_overlayed_documents(
        &mut self,
        documents: MutableDocumentMap,
    ) -> BTreeMap<DocumentKey, OverlayedDocument> {
        let keys: DocumentKeySet = documents.keys().cloned().collect();
        let overlays = self.txn.document_overlays.get_overlays(&keys);
        self.compute_views(documents, overlays, &DocumentKeySet::new())
    }

    fn compute_views(
        &mut self,
        documents: MutableDocumentMap,
        overlays: OverlayMap,
        existence_state_changed: &DocumentKeySet,
    ) -> BTreeMap<DocumentKey, OverlayedDocument> {
        let mut to_recalculate = MutableDocumentMap::new();
        let mut mutated_fields: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        let mut documents = documents;

        for (key, document) in documents.iter_mut() {
            let overlay = overlays.get(key);
            let is_patch = overlay
                .map(|overlay| matches!(overlay.mutation.kind, MutationKind::Patch { .. }))
                .unwrap_or(true);
            if existence_state_changed.contains(key) && is_patch {
                to_recalculate.insert(key.clone(), document.clone());
            } else if let Some(overlay) = overlay {
                let mask = overlay.mutation.field_mask();
                mutated_fields.insert(key.clone(), mask.clone());
                overlay
                    .mutation
                    .apply_to_local_view(document, mask, Timestamp::now());
            } else {
                mutated_fields.insert(key.clone(), Some(FieldMask::empty()));
            }
        }

        let (recalculated_masks, recalculated_documents) =
            self.recalculate_and_save_overlays(to_recalculate);
        mutated_fields.extend(recalculated_masks);
        documents.extend(recalculated_documents);

        documents
            .into_iter()
            .map(|(key, document)| {
                let mask = mutated_fields
                    .remove(&key)
                    .unwrap_or_else(|| Some(FieldMask::empty()));
                (
                    key,
                    OverlayedDocument {
                        document,
                        mutated_fields: mask,
                    },
                )
            })
            .collect()
    }

    /// Folds every pending batch over `documents` and stores one overlay per
    /// key, attributed to the newest batch that touched it.
    ///
    /// Returns the mutated field mask of each key along with the documents in
    /// their locally mutated state.
    pub fn recalculate_and_save_overlays(
        &mut self,
        documents: MutableDocumentMap,
    ) -> (BTreeMap<DocumentKey, Option<FieldMask>>, MutableDocumentMap) {
        let mut documents = documents;
        let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        let mut keys_by_batch_id: BTreeMap<BatchId, DocumentKeySet> = BTreeMap::new();
        if documents.is_empty() {
            return (masks, documents);
        }

        let keys: DocumentKeySet = documents.keys().cloned().collect();
        let batches = self
            .txn
            .mutation_queue
            .all_mutation_batches_affecting_document_keys(&keys);
        for batch in &batches {
            for key in batch.keys().iter() {
                let Some(document) = documents.get_mut(key) else {
                    continue;
                };
                let previous = masks
                    .remove(key)
                    .unwrap_or_else(|| Some(FieldMask::empty()));
                let mask = batch.apply_to_local_view(document, previous);
                masks.insert(key.clone(), mask);
                let batch_keys = keys_by_batch_id.remove(&batch.batch_id).unwrap_or_default();
                keys_by_batch_id.insert(batch.batch_id, batch_keys.insert(key.clone()));
            }
        }

        let mut processed = DocumentKeySet::new();
        for (batch_id, batch_keys) in keys_by_batch_id.into_iter().rev() {
            let mut overlays = BTreeMap::new();
            for key in batch_keys.iter() {
                if processed.contains(key) {
                    continue;
                }
                if let Some(document) = documents.get(key) {
                    let mask = masks
                        .get(key)
                        .cloned()
                        .unwrap_or_else(|| Some(FieldMask::empty()));
                    if let Some(overlay) = calculate_overlay_mutation(document, mask.as_ref()) {
                        overlays.insert(key.clone(), overlay);
                    }
                }
                processed = processed.insert(key.clone());
            }
            self.txn.document_overlays.save_overlays(batch_id, overlays);
        }
        (masks, documents)
    }

    /// Recalculates overlays from the cached remote state of `keys`.
    pub fn recalculate_and_save_overlays_for_document_keys(&mut self, keys: &DocumentKeySet) {
        let documents = self.txn.remote_documents.get_entries(keys);
        self.recalculate_and_save_overlays(documents);
    }

    /// Candidate keys from a field index, when one serves `target`.
    pub fn index_candidates(&self, target: &Target) -> Option<DocumentKeySet> {
        self.txn.index_manager.get_documents_matching_target(target)
    }

    /// Keys in the query's scope whose local view differs from the remote state.
    pub fn keys_with_overlays(&self, query: &Query) -> DocumentKeySet {
        let overlays = match query.collection_group_id() {
            Some(group) => self.txn.document_overlays.get_overlays_for_collection_group(
                group,
                BATCH_ID_UNKNOWN,
                usize::MAX,
            ),
            None => self
                .txn
                .document_overlays
                .get_overlays_for_collection(query.path(), BATCH_ID_UNKNOWN),
        };
        overlays.into_keys().collect()
    }

    /// Documents matching `query` in the local view.
    ///
    /// Only remote documents read after `since_read_time` are scanned, but
    /// every document with a pending overlay is considered.
    pub fn get_documents_matching_query(
        &self,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> DocumentMap {
        if query.is_document_query() {
            self.get_documents_matching_document_query(query)
        } else if let Some(group) = query.collection_group_id() {
            self.get_documents_matching_collection_group_query(query, group)
        } else {
            self.get_documents_matching_collection_query(query, since_read_time)
        }
    }

    fn get_documents_matching_document_query(&self, query: &Query) -> DocumentMap {
        let mut results = DocumentMap::new();
        let Ok(key) = DocumentKey::from_path(query.path().clone()) else {
            return results;
        };
        let document = self.get_document(&key);
        if document.is_found_document() {
            results = results.insert(key, document);
        }
        results
    }

    fn get_documents_matching_collection_group_query(&self, query: &Query, group: &str) -> DocumentMap {
        let mut results = DocumentMap::new();
        for parent in self.txn.index_manager.get_collection_parents(group) {
            if !query.path().is_prefix_of(&parent) {
                continue;
            }
            let collection_query = query.as_collection_query_at_path(parent.child([group]));
            let matches =
                self.get_documents_matching_collection_query(&collection_query, SnapshotVersion::min());
            for (key, document) in matches.iter() {
                results = results.insert(key.clone(), document.clone());
            }
        }
        results
    }

    fn get_documents_matching_collection_query(
        &self,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> DocumentMap {
        let overlays = self
            .txn
            .document_overlays
            .get_overlays_for_collection(query.path(), BATCH_ID_UNKNOWN);
        let mut documents = self
            .txn
            .remote_documents
            .get_documents_in_collection(query.path(), since_read_time);
        for key in overlays.keys() {
            if !documents.contains_key(key) {
                documents.insert(key.clone(), self.txn.remote_documents.get_entry(key));
            }
        }

        let mut results = DocumentMap::new();
        for (key, mut document) in documents {
            if let Some(overlay) = overlays.get(&key) {
                overlay
                    .mutation
                    .apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
            }
            if query.matches(&document) {
                results = results.insert(key, document);
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::user::User;
    use crate::firestore::local::persistence::MemoryPersistence;
    use crate::firestore::model::Mutation;
    use crate::firestore::value::FirestoreValue;
    use crate::test_support::{delete_mutation, doc, key, map, patch_mutation, query, set_mutation, version};

    fn int(value: i64) -> FirestoreValue {
        FirestoreValue::from_integer(value)
    }

    fn write(txn: &mut PersistenceTransaction, mutations: Vec<Mutation>) {
        let batch = txn
            .mutation_queue
            .add_mutation_batch(Timestamp::now(), Vec::new(), mutations);
        let keys = batch.keys();
        LocalDocumentsView::new(txn).recalculate_and_save_overlays_for_document_keys(&keys);
    }

    #[tokio::test]
    async fn overlays_fold_all_pending_batches() {
        let persistence = MemoryPersistence::new();
        let user = User::unauthenticated();
        persistence
            .run_transaction("test", &user, |txn| {
                txn.remote_documents
                    .add_entry(doc("rooms/a", 1, map(&[("x", int(1)), ("y", int(1))])), version(1));
                write(txn, vec![patch_mutation("rooms/a", map(&[("x", int(2))]))]);
                write(txn, vec![patch_mutation("rooms/a", map(&[("y", int(3))]))]);

                let overlay = txn.document_overlays.get_overlay(&key("rooms/a")).cloned().unwrap();
                assert_eq!(overlay.largest_batch_id, 2);

                let view = LocalDocumentsView::new(txn);
                let document = view.get_document(&key("rooms/a"));
                assert_eq!(document.data(), &map(&[("x", int(2)), ("y", int(3))]));
                assert!(document.has_local_mutations());
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn delete_overlay_hides_document_from_queries() {
        let persistence = MemoryPersistence::new();
        let user = User::unauthenticated();
        persistence
            .run_transaction("test", &user, |txn| {
                txn.remote_documents.add_entry(doc("rooms/a", 1, map(&[])), version(1));
                txn.remote_documents.add_entry(doc("rooms/b", 1, map(&[])), version(1));
                write(txn, vec![delete_mutation("rooms/a")]);
                write(txn, vec![set_mutation("rooms/c", map(&[("n", int(1))]))]);

                let overlay = txn.document_overlays.get_overlay(&key("rooms/a")).cloned().unwrap();
                assert!(overlay.mutation.is_delete());

                let view = LocalDocumentsView::new(txn);
                let results = view.get_documents_matching_query(&query("rooms"), SnapshotVersion::min());
                let keys: Vec<_> = results.keys().cloned().collect();
                assert_eq!(keys, vec![key("rooms/b"), key("rooms/c")]);
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn recalculating_twice_is_stable() {
        let persistence = MemoryPersistence::new();
        let user = User::unauthenticated();
        persistence
            .run_transaction("test", &user, |txn| {
                txn.remote_documents
                    .add_entry(doc("rooms/a", 1, map(&[("x", int(1))])), version(1));
                write(txn, vec![patch_mutation("rooms/a", map(&[("y.z", int(2))]))]);
                write(txn, vec![set_mutation("rooms/b", map(&[("n", int(1))]))]);
                let keys: DocumentKeySet = [key("rooms/a"), key("rooms/b")].into_iter().collect();
                let first = txn.document_overlays.get_overlays(&keys);
                LocalDocumentsView::new(txn).recalculate_and_save_overlays_for_document_keys(&keys);
                assert_eq!(first, txn.document_overlays.get_overlays(&keys));
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_documents_read_as_invalid() {
        let persistence = MemoryPersistence::new();
        let user = User::unauthenticated();
        persistence
            .run_transaction("test", &user, |txn| {
                let keys: DocumentKeySet = [key("rooms/missing")].into_iter().collect();
                let documents = LocalDocumentsView::new(txn).get_documents(&keys);
                assert!(documents
                    .get(&key("rooms/missing"))
                    .is_some_and(MutableDocument::is_invalid_document));
                Ok(())
            })
            .await
            .unwrap();
    }
}
