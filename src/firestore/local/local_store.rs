use std::collections::BTreeMap;
use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::firestore::collection::{DocumentKeySet, DocumentMap, MutableDocumentMap};
use crate::firestore::core::query::Query;
use crate::firestore::core::target::Target;
use crate::firestore::core::user::User;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::index_manager::FieldIndex;
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::local::persistence::{
    ignore_if_primary_lease_loss, MemoryPersistence, PersistenceTransaction,
};
use crate::firestore::local::query_engine::QueryEngine;
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{
    BatchId, DocumentKey, MutableDocument, Mutation, MutationBatch, MutationBatchResult,
    Precondition, SnapshotVersion, TargetId, Timestamp,
};
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::settings::FirestoreSettings;
use crate::util::{fail, hard_assert};

const LOG_TARGET: &str = "firestore::local_store";

/// Result of a local write: the new batch and the documents it changed.
#[derive(Clone, Debug)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    pub changes: DocumentMap,
}

#[derive(Clone, Debug)]
pub struct QueryResult {
    pub documents: DocumentMap,
    /// Keys the server last reported as part of the target.
    pub remote_keys: DocumentKeySet,
}

/// Batches that disappeared and appeared when the user changed, and the
/// local view of every document they touch.
#[derive(Clone, Debug)]
pub struct UserChangeResult {
    pub removed_batch_ids: Vec<BatchId>,
    pub added_batch_ids: Vec<BatchId>,
    pub affected_documents: DocumentMap,
}

/// Documents a view started or stopped showing.
#[derive(Clone, Debug)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
    pub added_keys: DocumentKeySet,
    pub removed_keys: DocumentKeySet,
}

struct LocalStoreState {
    user: User,
    target_data_by_target: BTreeMap<TargetId, TargetData>,
    target_ids_by_canonical_id: BTreeMap<String, TargetId>,
    local_view_references: ReferenceSet,
}

/// The client's knowledge of documents: cached server state, pending writes
/// and the targets being listened to.
///
/// Every operation is one persistence transaction. Active target data is
/// also kept in memory so the watch pipeline can read it synchronously.
pub struct LocalStore {
    persistence: MemoryPersistence,
    query_engine: QueryEngine,
    resume_token_max_age: Duration,
    state: StdMutex<LocalStoreState>,
}

impl LocalStore {
    pub fn new(persistence: MemoryPersistence, initial_user: User, settings: &FirestoreSettings) -> Self {
        Self {
            persistence,
            query_engine: QueryEngine::new(),
            resume_token_max_age: settings.resume_token_max_age,
            state: StdMutex::new(LocalStoreState {
                user: initial_user,
                target_data_by_target: BTreeMap::new(),
                target_ids_by_canonical_id: BTreeMap::new(),
                local_view_references: ReferenceSet::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, LocalStoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current_user(&self) -> User {
        self.state().user.clone()
    }

    /// Switches the mutation queue and overlays to `user`.
    pub async fn handle_user_change(&self, user: User) -> FirestoreResult<UserChangeResult> {
        let old_user = self.current_user();
        let old_batches = self
            .persistence
            .run_transaction("Read batches of previous user", &old_user, |txn| {
                Ok(txn.mutation_queue.all_mutation_batches())
            })
            .await?;

        let (new_batches, affected_documents) = self
            .persistence
            .run_transaction("Handle user change", &user, |txn| {
                let new_batches = txn.mutation_queue.all_mutation_batches();
                let mut changed_keys = DocumentKeySet::new();
                for batch in old_batches.iter().chain(new_batches.iter()) {
                    for mutation in &batch.mutations {
                        changed_keys = changed_keys.insert(mutation.key.clone());
                    }
                }
                let documents = LocalDocumentsView::new(txn).get_documents(&changed_keys);
                Ok((new_batches, documents))
            })
            .await?;

        log::debug!(
            target: LOG_TARGET,
            "user changed from {} to {}",
            old_user,
            user
        );
        self.state().user = user;
        Ok(UserChangeResult {
            removed_batch_ids: old_batches.iter().map(|batch| batch.batch_id).collect(),
            added_batch_ids: new_batches.iter().map(|batch| batch.batch_id).collect(),
            affected_documents,
        })
    }

    /// Queues `mutations` as one batch and returns the documents as they now
    /// look locally.
    pub async fn local_write(&self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        let user = self.current_user();
        let local_write_time = Timestamp::now();
        let keys: DocumentKeySet = mutations.iter().map(|mutation| mutation.key.clone()).collect();

        self.persistence
            .run_transaction("Locally write mutations", &user, move |txn| {
                let remote_documents = txn.remote_documents.get_entries(&keys);
                let documents_without_remote_version: DocumentKeySet = remote_documents
                    .values()
                    .filter(|document| document.is_invalid_document())
                    .map(|document| document.key().clone())
                    .collect();
                let mut overlayed =
                    LocalDocumentsView::new(txn).get_overlayed_documents(remote_documents);

                // Non-idempotent transforms keep the value they were computed
                // from, so replays after a restart produce the same result.
                let mut base_mutations = Vec::new();
                for mutation in &mutations {
                    let Some(document) = overlayed.get(&mutation.key) else {
                        continue;
                    };
                    if let Some(base_value) = mutation.extract_transform_base_value(&document.document) {
                        let mask = base_value.field_mask();
                        base_mutations.push(
                            Mutation::patch(mutation.key.clone(), base_value, mask)
                                .with_precondition(Precondition::Exists(true)),
                        );
                    }
                }

                for key in keys.iter() {
                    txn.index_manager
                        .add_to_collection_parent_index(&key.collection_path());
                }
                let batch = txn
                    .mutation_queue
                    .add_mutation_batch(local_write_time, base_mutations, mutations);
                let overlays =
                    batch.apply_to_local_document_set(&mut overlayed, &documents_without_remote_version);
                txn.document_overlays.save_overlays(batch.batch_id, overlays);

                Ok(LocalWriteResult {
                    batch_id: batch.batch_id,
                    changes: overlayed
                        .into_iter()
                        .map(|(key, overlayed)| (key, overlayed.document))
                        .collect(),
                })
            })
            .await
    }

    /// Applies the backend's acknowledgement of a batch and returns the
    /// affected documents.
    pub async fn acknowledge_batch(&self, batch_result: MutationBatchResult) -> FirestoreResult<DocumentMap> {
        let user = self.current_user();
        self.persistence
            .run_transaction("Acknowledge batch", &user, move |txn| {
                let batch = &batch_result.batch;
                let affected = batch.keys();
                txn.mutation_queue
                    .acknowledge_batch(batch, batch_result.stream_token.clone());
                apply_write_to_remote_documents(txn, &batch_result);
                txn.document_overlays
                    .remove_overlays_for_batch_id(batch.batch_id);

                let keys_with_transform_results: DocumentKeySet = batch
                    .mutations
                    .iter()
                    .zip(batch_result.mutation_results.iter())
                    .filter(|(_, result)| !result.transform_results.is_empty())
                    .map(|(mutation, _)| mutation.key.clone())
                    .collect();
                let mut view = LocalDocumentsView::new(txn);
                view.recalculate_and_save_overlays_for_document_keys(&keys_with_transform_results);
                Ok(view.get_documents(&affected))
            })
            .await
    }

    /// Drops a batch the backend refused and returns the affected documents.
    pub async fn reject_batch(&self, batch_id: BatchId) -> FirestoreResult<DocumentMap> {
        let user = self.current_user();
        self.persistence
            .run_transaction("Reject batch", &user, move |txn| {
                let Some(batch) = txn.mutation_queue.lookup_mutation_batch(batch_id).cloned() else {
                    fail(format!("Attempt to reject nonexistent batch {batch_id}"));
                };
                let affected = batch.keys();
                txn.mutation_queue.remove_mutation_batch(&batch);
                txn.document_overlays.remove_overlays_for_batch_id(batch_id);
                let mut view = LocalDocumentsView::new(txn);
                view.recalculate_and_save_overlays_for_document_keys(&affected);
                Ok(view.get_documents(&affected))
            })
            .await
    }

    pub async fn get_highest_unacknowledged_batch_id(&self) -> FirestoreResult<BatchId> {
        self.run_as_current_user("Get highest unacknowledged batch id", |txn| {
            Ok(txn.mutation_queue.get_highest_unacknowledged_batch_id())
        })
        .await
    }

    pub async fn get_last_stream_token(&self) -> FirestoreResult<Vec<u8>> {
        self.run_as_current_user("Get last stream token", |txn| {
            Ok(txn.mutation_queue.last_stream_token().to_vec())
        })
        .await
    }

    pub async fn set_last_stream_token(&self, token: Vec<u8>) -> FirestoreResult<()> {
        self.run_as_current_user("Set last stream token", move |txn| {
            txn.mutation_queue.set_last_stream_token(token);
            Ok(())
        })
        .await
    }

    pub async fn last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion> {
        self.run_as_current_user("Get last remote snapshot version", |txn| {
            Ok(txn.target_cache.last_remote_snapshot_version())
        })
        .await
    }

    /// Applies a consistent watch snapshot and returns the local view of every
    /// document it changed.
    pub async fn apply_remote_event(&self, event: RemoteEvent) -> FirestoreResult<DocumentMap> {
        let user = self.current_user();
        let active_targets = self.state().target_data_by_target.clone();
        let resume_token_max_age = self.resume_token_max_age;

        let (documents, updated_targets) = self
            .persistence
            .run_transaction("Apply remote event", &user, move |txn| {
                let remote_version = event.snapshot_version;
                let sequence_number = txn.target_cache.next_sequence_number();
                let mut updated_targets = BTreeMap::new();

                for (target_id, change) in &event.target_changes {
                    let Some(old_target_data) = active_targets.get(target_id) else {
                        continue;
                    };
                    txn.target_cache
                        .remove_matching_keys(&change.removed_documents, *target_id);
                    txn.target_cache
                        .add_matching_keys(&change.added_documents, *target_id);

                    let mut new_target_data = old_target_data.clone().with_sequence_number(sequence_number);
                    if event.target_mismatches.contains_key(target_id) {
                        new_target_data = new_target_data
                            .with_resume_token(Vec::new(), SnapshotVersion::min())
                            .with_last_limbo_free_snapshot_version(SnapshotVersion::min());
                    } else if !change.resume_token.is_empty() {
                        new_target_data =
                            new_target_data.with_resume_token(change.resume_token.clone(), remote_version);
                    }

                    if should_persist_target_data(
                        old_target_data,
                        &new_target_data,
                        change,
                        resume_token_max_age,
                    ) && txn.target_cache.get_target_data_by_id(*target_id).is_some()
                    {
                        txn.target_cache.update_target_data(new_target_data.clone());
                    }
                    updated_targets.insert(*target_id, new_target_data);
                }

                let (changed_documents, existence_changed) =
                    populate_document_changes(txn, event.document_updates);

                if !remote_version.is_min() {
                    let last_remote_version = txn.target_cache.last_remote_snapshot_version();
                    hard_assert(
                        remote_version >= last_remote_version,
                        format!(
                            "Watch stream reverted to previous snapshot?? {remote_version} < {last_remote_version}"
                        ),
                    );
                    txn.target_cache
                        .set_last_remote_snapshot_version(remote_version);
                }

                let documents = LocalDocumentsView::new(txn)
                    .get_local_view_of_documents(changed_documents, &existence_changed);
                Ok((documents, updated_targets))
            })
            .await?;

        let mut state = self.state();
        for (target_id, target_data) in updated_targets {
            if state.target_data_by_target.contains_key(&target_id) {
                state.target_data_by_target.insert(target_id, target_data);
            }
        }
        Ok(documents)
    }

    /// Tracks which documents active views show; a view that is in sync with
    /// the server advances its target's last limbo-free snapshot version.
    pub fn notify_local_view_changes(&self, view_changes: Vec<LocalViewChanges>) {
        let mut state = self.state();
        for change in view_changes {
            state
                .local_view_references
                .add_references(&change.added_keys, change.target_id);
            state
                .local_view_references
                .remove_references(&change.removed_keys, change.target_id);

            if !change.from_cache {
                let Some(target_data) = state.target_data_by_target.get(&change.target_id) else {
                    fail(format!(
                        "Can't set limbo-free snapshot version for unknown target {}",
                        change.target_id
                    ));
                };
                let snapshot_version = target_data.snapshot_version;
                let updated = target_data
                    .clone()
                    .with_last_limbo_free_snapshot_version(snapshot_version);
                state.target_data_by_target.insert(change.target_id, updated);
            }
        }
    }

    pub fn is_referenced_by_view(&self, key: &DocumentKey) -> bool {
        self.state().local_view_references.contains_key(key)
    }

    /// First batch after `after_batch_id`, or the first batch when `None`.
    pub async fn next_mutation_batch(&self, after_batch_id: Option<BatchId>) -> FirestoreResult<Option<MutationBatch>> {
        self.run_as_current_user("Get next mutation batch", move |txn| {
            Ok(txn
                .mutation_queue
                .get_next_mutation_batch_after_batch_id(after_batch_id)
                .cloned())
        })
        .await
    }

    pub async fn read_document(&self, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        self.run_as_current_user("Read document", |txn| {
            Ok(LocalDocumentsView::new(txn).get_document(key))
        })
        .await
    }

    /// Local view of `keys`; keys never seen read as invalid documents.
    pub async fn get_documents(&self, keys: &DocumentKeySet) -> FirestoreResult<DocumentMap> {
        self.run_as_current_user("Get documents", |txn| {
            Ok(LocalDocumentsView::new(txn).get_documents(keys))
        })
        .await
    }

    /// Returns the target data of `target`, allocating and persisting a new
    /// target id the first time it is seen.
    pub async fn allocate_target(&self, target: Target) -> FirestoreResult<TargetData> {
        let user = self.current_user();
        let canonical_id = target.canonical_id();
        let target_data = self
            .persistence
            .run_transaction("Allocate target", &user, move |txn| {
                if let Some(cached) = txn.target_cache.get_target_data(&target) {
                    return Ok(cached.clone());
                }
                let target_id = txn.target_cache.allocate_target_id();
                let sequence_number = txn.target_cache.next_sequence_number();
                let target_data =
                    TargetData::new(target, target_id, TargetPurpose::Listen, sequence_number);
                txn.target_cache.add_target_data(target_data.clone());
                Ok(target_data)
            })
            .await?;

        let mut state = self.state();
        if let Some(active) = state.target_data_by_target.get(&target_data.target_id) {
            return Ok(active.clone());
        }
        state
            .target_data_by_target
            .insert(target_data.target_id, target_data.clone());
        state
            .target_ids_by_canonical_id
            .insert(canonical_id, target_data.target_id);
        Ok(target_data)
    }

    /// Target data of `target`, preferring the in-memory copy of an active target.
    pub async fn get_target_data(&self, target: &Target) -> FirestoreResult<Option<TargetData>> {
        if let Some(active) = self.active_target_data_for(target) {
            return Ok(Some(active));
        }
        self.run_as_current_user("Get target data", |txn| {
            Ok(txn.target_cache.get_target_data(target).cloned())
        })
        .await
    }

    fn active_target_data_for(&self, target: &Target) -> Option<TargetData> {
        let state = self.state();
        state
            .target_ids_by_canonical_id
            .get(&target.canonical_id())
            .and_then(|target_id| state.target_data_by_target.get(target_id))
            .filter(|data| data.target == *target)
            .cloned()
    }

    /// In-memory data of an active target.
    pub fn active_target_data(&self, target_id: TargetId) -> Option<TargetData> {
        self.state().target_data_by_target.get(&target_id).cloned()
    }

    /// Stops tracking an active target. With `keep_persisted_target_data`
    /// the cached target and its keys stay on disk for a later listen.
    pub async fn release_target(&self, target_id: TargetId, keep_persisted_target_data: bool) -> FirestoreResult<()> {
        let Some(target_data) = self.active_target_data(target_id) else {
            log::debug!(target: LOG_TARGET, "ignoring release of inactive target {target_id}");
            return Ok(());
        };
        let user = self.current_user();
        let result = self
            .persistence
            .run_transaction("Release target", &user, move |txn| {
                let persisted = txn.target_cache.get_target_data_by_id(target_id).is_some();
                if !keep_persisted_target_data {
                    txn.target_cache.remove_target_data(target_id);
                } else if persisted {
                    txn.target_cache.update_target_data(target_data);
                }
                Ok(())
            })
            .await;
        ignore_if_primary_lease_loss(result)?;

        let mut state = self.state();
        state.local_view_references.remove_references_for_id(target_id);
        if let Some(removed) = state.target_data_by_target.remove(&target_id) {
            let canonical_id = removed.target.canonical_id();
            if state.target_ids_by_canonical_id.get(&canonical_id) == Some(&target_id) {
                state.target_ids_by_canonical_id.remove(&canonical_id);
            }
        }
        Ok(())
    }

    /// Runs `query` against the local cache. With `use_previous_results` the
    /// keys the server last sent for the query's target seed the result.
    pub async fn execute_query(&self, query: &Query, use_previous_results: bool) -> FirestoreResult<QueryResult> {
        let target_data = self.get_target_data(&query.to_target()).await?;
        let query_engine = self.query_engine;
        self.run_as_current_user("Execute query", move |txn| {
            let (last_limbo_free_snapshot_version, remote_keys) = match &target_data {
                Some(target_data) => (
                    target_data.last_limbo_free_snapshot_version,
                    txn.target_cache
                        .get_matching_keys_for_target_id(target_data.target_id),
                ),
                None => (SnapshotVersion::min(), DocumentKeySet::new()),
            };
            let (since, previous_keys) = if use_previous_results {
                (last_limbo_free_snapshot_version, remote_keys.clone())
            } else {
                (SnapshotVersion::min(), DocumentKeySet::new())
            };
            let mut view = LocalDocumentsView::new(txn);
            let (documents, strategy) =
                query_engine.get_documents_matching_query(&mut view, query, since, &previous_keys);
            log::debug!(target: LOG_TARGET, "executed {} using {:?}", query.canonical_id(), strategy);
            Ok(QueryResult {
                documents,
                remote_keys,
            })
        })
        .await
    }

    pub async fn get_remote_document_keys(&self, target_id: TargetId) -> FirestoreResult<DocumentKeySet> {
        self.run_as_current_user("Get remote document keys", |txn| {
            Ok(txn.target_cache.get_matching_keys_for_target_id(target_id))
        })
        .await
    }

    /// Replaces the configured field indexes and indexes the cached documents.
    pub async fn configure_field_indexes(&self, indexes: Vec<FieldIndex>) -> FirestoreResult<()> {
        self.run_as_current_user("Configure field indexes", move |txn| {
            let existing: Vec<FieldIndex> = txn.index_manager.field_indexes().cloned().collect();
            let same = |left: &FieldIndex, right: &FieldIndex| {
                left.collection_group == right.collection_group && left.segments == right.segments
            };
            for index in &existing {
                if !indexes.iter().any(|wanted| same(wanted, index)) {
                    txn.index_manager.delete_field_index(index.index_id);
                }
            }
            for index in indexes {
                if !existing.iter().any(|current| same(current, &index)) {
                    txn.index_manager.add_field_index(index);
                }
            }
            let documents: Vec<MutableDocument> = txn.remote_documents.iter().cloned().collect();
            for document in &documents {
                txn.index_manager.update_index_entries(document);
            }
            Ok(())
        })
        .await
    }

    /// Runs one persistence transaction, read or write, as the current user.
    async fn run_as_current_user<T, F>(&self, action: &str, operation: F) -> FirestoreResult<T>
    where
        F: FnOnce(&mut PersistenceTransaction) -> FirestoreResult<T>,
    {
        let user = self.current_user();
        self.persistence.run_transaction(action, &user, operation).await
    }
}

/// Applies acknowledged mutations to the remote documents they wrote and
/// removes the batch from the queue.
fn apply_write_to_remote_documents(txn: &mut PersistenceTransaction, batch_result: &MutationBatchResult) {
    let batch = &batch_result.batch;
    for key in batch.keys().iter() {
        let mut document = txn.remote_documents.get_entry(key);
        let Some(ack_version) = batch_result.doc_versions.get(key).copied() else {
            fail(format!("doc_versions should contain every mutated key, missing {key:?}"));
        };
        if document.version() < ack_version {
            batch.apply_to_remote_document(&mut document, batch_result);
            if !document.is_invalid_document() {
                txn.index_manager.update_index_entries(&document);
                txn.remote_documents
                    .add_entry(document, batch_result.commit_version);
            }
        }
    }
    txn.mutation_queue.remove_mutation_batch(batch);
}

/// Writes watch document updates into the remote cache, dropping updates
/// older than what is cached. Returns the documents that changed and the keys
/// whose existence flipped.
fn populate_document_changes(
    txn: &mut PersistenceTransaction,
    updates: MutableDocumentMap,
) -> (MutableDocumentMap, DocumentKeySet) {
    let mut changed = MutableDocumentMap::new();
    let mut existence_changed = DocumentKeySet::new();
    for (key, document) in updates {
        let existing = txn.remote_documents.get_entry(&key);
        if document.is_found_document() != existing.is_found_document() {
            existence_changed = existence_changed.insert(key.clone());
        }

        if document.is_no_document() && document.version().is_min() {
            // Synthesized deletes mean access to the document was lost.
            txn.remote_documents.remove_entry(&key);
            txn.index_manager
                .update_index_entries(&MutableDocument::new_invalid_document(key.clone()));
            changed.insert(key, document);
        } else if existing.is_invalid_document()
            || document.version() > existing.version()
            || (document.version() == existing.version()
                && (existing.has_local_mutations() || existing.has_committed_mutations()))
        {
            let read_time = document.read_time();
            txn.index_manager
                .add_to_collection_parent_index(&key.collection_path());
            txn.index_manager.update_index_entries(&document);
            txn.remote_documents.add_entry(document.clone(), read_time);
            changed.insert(key, document);
        } else {
            log::debug!(
                target: LOG_TARGET,
                "ignoring outdated watch update for {:?}: current version {}, watch version {}",
                key,
                existing.version(),
                document.version()
            );
        }
    }
    (changed, existence_changed)
}

/// Target data is persisted when a resume token first appears, when the
/// stored one is stale, or when the change carried documents.
fn should_persist_target_data(
    old_target_data: &TargetData,
    new_target_data: &TargetData,
    change: &TargetChange,
    resume_token_max_age: Duration,
) -> bool {
    if new_target_data.resume_token.is_empty() {
        return false;
    }
    if old_target_data.resume_token.is_empty() {
        return true;
    }
    let elapsed_micros = new_target_data.snapshot_version.to_micros()
        - old_target_data.snapshot_version.to_micros();
    if elapsed_micros >= resume_token_max_age.as_micros() as i64 {
        return true;
    }
    change.document_count() > 0
}
