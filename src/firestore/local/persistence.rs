//! Transactional in-memory persistence with a pluggable durable backend.
//!
//! Every cache lives in one [`PersistenceState`]. A transaction works on a
//! copy of that state (cheap, the caches share structure through
//! [`SortedMap`](crate::firestore::collection::SortedMap)), collects the
//! writes each cache recorded, hands them to the [`PersistenceBackend`] and
//! only publishes the copy once the backend accepted them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex as StdMutex};

use async_lock::Mutex;
use async_trait::async_trait;

use crate::firestore::core::user::User;
use crate::firestore::error::{failed_precondition, FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::firestore::local::document_overlay_cache::DocumentOverlayCache;
use crate::firestore::local::index_manager::{FieldIndex, IndexManager};
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::local::target_cache::TargetCache;
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::{
    BatchId, DocumentKey, ListenSequenceNumber, MutableDocument, MutationBatch, Overlay,
    ResourcePath, SnapshotVersion, TargetId, BATCH_ID_UNKNOWN,
};

const LOG_TARGET: &str = "firestore::persistence";

pub const PRIMARY_LEASE_LOST_ERROR_MSG: &str =
    "The client lost its primary lease and can no longer write to persistence.";

/// Target metadata that is not tied to a single target.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TargetGlobals {
    pub highest_target_id: TargetId,
    pub highest_listen_sequence_number: ListenSequenceNumber,
    pub last_remote_snapshot_version: SnapshotVersion,
}

/// One durable change produced by a transaction.
#[derive(Clone, Debug, PartialEq)]
pub enum PersistenceWrite {
    PutRemoteDocument(MutableDocument),
    RemoveRemoteDocument(DocumentKey),
    AddMutationBatch { user: String, batch: MutationBatch },
    RemoveMutationBatch { user: String, batch_id: BatchId },
    SetLastStreamToken { user: String, token: Vec<u8> },
    PutOverlay { user: String, overlay: Overlay },
    RemoveOverlay { user: String, key: DocumentKey },
    PutTarget(TargetData),
    RemoveTarget(TargetId),
    AddTargetDocument { target_id: TargetId, key: DocumentKey },
    RemoveTargetDocument { target_id: TargetId, key: DocumentKey },
    AddCollectionParent(ResourcePath),
    PutFieldIndex(FieldIndex),
    DeleteFieldIndex(i32),
    SetTargetGlobals(TargetGlobals),
}

/// Everything a backend stores, in the shape it is replayed from.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PersistedState {
    pub remote_documents: BTreeMap<DocumentKey, MutableDocument>,
    pub mutation_batches: BTreeMap<String, BTreeMap<BatchId, MutationBatch>>,
    /// Largest batch id each user was ever given; survives batch removal.
    pub highest_batch_ids: BTreeMap<String, BatchId>,
    pub stream_tokens: BTreeMap<String, Vec<u8>>,
    pub overlays: BTreeMap<String, BTreeMap<DocumentKey, Overlay>>,
    pub targets: BTreeMap<TargetId, TargetData>,
    pub target_documents: BTreeSet<(TargetId, DocumentKey)>,
    pub collection_parents: BTreeSet<ResourcePath>,
    pub field_indexes: BTreeMap<i32, FieldIndex>,
    pub target_globals: TargetGlobals,
}

impl PersistedState {
    pub fn apply(&mut self, write: PersistenceWrite) {
        match write {
            PersistenceWrite::PutRemoteDocument(document) => {
                self.remote_documents.insert(document.key().clone(), document);
            }
            PersistenceWrite::RemoveRemoteDocument(key) => {
                self.remote_documents.remove(&key);
            }
            PersistenceWrite::AddMutationBatch { user, batch } => {
                let highest = self.highest_batch_ids.entry(user.clone()).or_insert(batch.batch_id);
                *highest = (*highest).max(batch.batch_id);
                self.mutation_batches
                    .entry(user)
                    .or_default()
                    .insert(batch.batch_id, batch);
            }
            PersistenceWrite::RemoveMutationBatch { user, batch_id } => {
                if let Some(batches) = self.mutation_batches.get_mut(&user) {
                    batches.remove(&batch_id);
                }
            }
            PersistenceWrite::SetLastStreamToken { user, token } => {
                self.stream_tokens.insert(user, token);
            }
            PersistenceWrite::PutOverlay { user, overlay } => {
                self.overlays
                    .entry(user)
                    .or_default()
                    .insert(overlay.key().clone(), overlay);
            }
            PersistenceWrite::RemoveOverlay { user, key } => {
                if let Some(overlays) = self.overlays.get_mut(&user) {
                    overlays.remove(&key);
                }
            }
            PersistenceWrite::PutTarget(target_data) => {
                self.targets.insert(target_data.target_id, target_data);
            }
            PersistenceWrite::RemoveTarget(target_id) => {
                self.targets.remove(&target_id);
            }
            PersistenceWrite::AddTargetDocument { target_id, key } => {
                self.target_documents.insert((target_id, key));
            }
            PersistenceWrite::RemoveTargetDocument { target_id, key } => {
                self.target_documents.remove(&(target_id, key));
            }
            PersistenceWrite::AddCollectionParent(path) => {
                self.collection_parents.insert(path);
            }
            PersistenceWrite::PutFieldIndex(index) => {
                self.field_indexes.insert(index.index_id, index);
            }
            PersistenceWrite::DeleteFieldIndex(index_id) => {
                self.field_indexes.remove(&index_id);
            }
            PersistenceWrite::SetTargetGlobals(globals) => {
                self.target_globals = globals;
            }
        }
    }
}

/// Durable storage behind [`MemoryPersistence`].
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    async fn load(&self) -> FirestoreResult<PersistedState>;

    /// Stores all writes of one transaction, or none of them.
    async fn commit(&self, writes: Vec<PersistenceWrite>) -> FirestoreResult<()>;
}

/// Backend that keeps nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopPersistenceBackend;

#[async_trait]
impl PersistenceBackend for NoopPersistenceBackend {
    async fn load(&self) -> FirestoreResult<PersistedState> {
        Ok(PersistedState::default())
    }

    async fn commit(&self, _writes: Vec<PersistenceWrite>) -> FirestoreResult<()> {
        Ok(())
    }
}

/// Backend that replays commits into a [`PersistedState`] so a later
/// [`MemoryPersistence`] can be restored from it.
#[derive(Debug, Default)]
pub struct MemoryPersistenceBackend {
    state: StdMutex<PersistedState>,
    commit_count: StdMutex<usize>,
    fail_next_commit: StdMutex<Option<FirestoreError>>,
}

impl MemoryPersistenceBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> PersistedState {
        self.state
            .lock()
            .map(|state| state.clone())
            .unwrap_or_default()
    }

    pub fn commit_count(&self) -> usize {
        self.commit_count.lock().map_or(0, |count| *count)
    }

    /// Makes the next commit fail with `error` without storing anything.
    pub fn fail_next_commit(&self, error: FirestoreError) {
        if let Ok(mut slot) = self.fail_next_commit.lock() {
            *slot = Some(error);
        }
    }
}

#[async_trait]
impl PersistenceBackend for MemoryPersistenceBackend {
    async fn load(&self) -> FirestoreResult<PersistedState> {
        Ok(self.snapshot())
    }

    async fn commit(&self, writes: Vec<PersistenceWrite>) -> FirestoreResult<()> {
        if let Some(error) = self.fail_next_commit.lock().ok().and_then(|mut slot| slot.take()) {
            return Err(error);
        }
        if let Ok(mut state) = self.state.lock() {
            for write in writes {
                state.apply(write);
            }
        }
        if let Ok(mut count) = self.commit_count.lock() {
            *count += 1;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
struct PersistenceState {
    remote_documents: RemoteDocumentCache,
    mutation_queues: BTreeMap<String, MutationQueue>,
    document_overlays: BTreeMap<String, DocumentOverlayCache>,
    target_cache: TargetCache,
    index_manager: IndexManager,
}

impl PersistenceState {
    fn restore(persisted: PersistedState) -> Self {
        let PersistedState {
            remote_documents,
            mutation_batches,
            mut highest_batch_ids,
            mut stream_tokens,
            overlays,
            targets,
            target_documents,
            collection_parents,
            field_indexes,
            target_globals,
        } = persisted;

        let mut users: BTreeSet<String> = mutation_batches.keys().cloned().collect();
        users.extend(stream_tokens.keys().cloned());
        users.extend(highest_batch_ids.keys().cloned());
        let mut mutation_batches = mutation_batches;
        let mutation_queues = users
            .into_iter()
            .map(|user| {
                let batches = mutation_batches.remove(&user).unwrap_or_default();
                let token = stream_tokens.remove(&user).unwrap_or_default();
                let highest_batch_id = highest_batch_ids.remove(&user).unwrap_or(BATCH_ID_UNKNOWN);
                let queue = MutationQueue::restore(
                    user.clone(),
                    batches.into_values(),
                    highest_batch_id,
                    token,
                );
                (user, queue)
            })
            .collect();
        let document_overlays = overlays
            .into_iter()
            .map(|(user, overlays)| {
                let cache = DocumentOverlayCache::restore(user.clone(), overlays.into_values());
                (user, cache)
            })
            .collect();

        let mut index_manager =
            IndexManager::restore(collection_parents, field_indexes.into_values());
        for document in remote_documents.values() {
            index_manager.update_index_entries(document);
        }

        Self {
            remote_documents: RemoteDocumentCache::restore(remote_documents.into_values()),
            mutation_queues,
            document_overlays,
            target_cache: TargetCache::restore(
                targets.into_values(),
                target_documents,
                target_globals,
            ),
            index_manager,
        }
    }
}

/// Working copy of every cache for one transaction, scoped to one user.
pub struct PersistenceTransaction {
    action: String,
    user: User,
    pub remote_documents: RemoteDocumentCache,
    pub mutation_queue: MutationQueue,
    pub document_overlays: DocumentOverlayCache,
    pub target_cache: TargetCache,
    pub index_manager: IndexManager,
}

impl PersistenceTransaction {
    fn begin(action: &str, user: &User, state: &PersistenceState) -> Self {
        let user_key = user.to_key();
        Self {
            action: action.to_string(),
            user: user.clone(),
            remote_documents: state.remote_documents.clone(),
            mutation_queue: state
                .mutation_queues
                .get(user_key)
                .cloned()
                .unwrap_or_else(|| MutationQueue::new(user_key)),
            document_overlays: state
                .document_overlays
                .get(user_key)
                .cloned()
                .unwrap_or_else(|| DocumentOverlayCache::new(user_key)),
            target_cache: state.target_cache.clone(),
            index_manager: state.index_manager.clone(),
        }
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    fn take_writes(&mut self) -> Vec<PersistenceWrite> {
        let mut writes = self.remote_documents.take_changes();
        writes.extend(self.mutation_queue.take_changes());
        writes.extend(self.document_overlays.take_changes());
        writes.extend(self.target_cache.take_changes());
        writes.extend(self.index_manager.take_changes());
        writes
    }

    fn publish(self, state: &mut PersistenceState) {
        let user_key = self.user.to_key().to_string();
        state.remote_documents = self.remote_documents;
        state
            .mutation_queues
            .insert(user_key.clone(), self.mutation_queue);
        state
            .document_overlays
            .insert(user_key, self.document_overlays);
        state.target_cache = self.target_cache;
        state.index_manager = self.index_manager;
    }
}

/// Owner of all local caches. Transactions run one at a time.
pub struct MemoryPersistence {
    state: Mutex<PersistenceState>,
    backend: Arc<dyn PersistenceBackend>,
}

impl MemoryPersistence {
    /// Purely in-memory persistence.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PersistenceState::default()),
            backend: Arc::new(NoopPersistenceBackend),
        }
    }

    /// Restores the caches from `backend` and writes through to it.
    pub async fn with_backend(backend: Arc<dyn PersistenceBackend>) -> FirestoreResult<Self> {
        let persisted = backend.load().await?;
        Ok(Self {
            state: Mutex::new(PersistenceState::restore(persisted)),
            backend,
        })
    }

    /// Runs `operation` against a working copy of the caches as `user`.
    ///
    /// The copy replaces the live state only after the backend committed
    /// every recorded write; any error leaves the live state untouched.
    pub async fn run_transaction<T, F>(&self, action: &str, user: &User, operation: F) -> FirestoreResult<T>
    where
        F: FnOnce(&mut PersistenceTransaction) -> FirestoreResult<T>,
    {
        let mut state = self.state.lock().await;
        let mut transaction = PersistenceTransaction::begin(action, user, &state);
        let value = match operation(&mut transaction) {
            Ok(value) => value,
            Err(err) => {
                log::debug!(target: LOG_TARGET, "transaction '{action}' failed: {err}");
                return Err(err);
            }
        };
        let writes = transaction.take_writes();
        if !writes.is_empty() {
            if let Err(err) = self.backend.commit(writes).await {
                log::warn!(target: LOG_TARGET, "failed to commit transaction '{action}': {err}");
                return Err(err);
            }
        }
        transaction.publish(&mut state);
        Ok(value)
    }
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

pub fn primary_lease_lost_error() -> FirestoreError {
    failed_precondition(PRIMARY_LEASE_LOST_ERROR_MSG)
}

pub fn is_primary_lease_lost_error(error: &FirestoreError) -> bool {
    error.code == FirestoreErrorCode::FailedPrecondition
        && error.message() == PRIMARY_LEASE_LOST_ERROR_MSG
}

/// Swallows a lost primary lease, which is an expected event; other errors pass through.
pub fn ignore_if_primary_lease_loss<T>(result: FirestoreResult<T>) -> FirestoreResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if is_primary_lease_lost_error(&err) => {
            log::debug!(target: LOG_TARGET, "Unexpectedly lost primary lease");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::unavailable;
    use crate::firestore::model::Timestamp;
    use crate::firestore::value::FirestoreValue;
    use crate::test_support::{doc, key, map, set_mutation, version};

    #[tokio::test]
    async fn failed_commit_leaves_state_untouched() {
        let backend = Arc::new(MemoryPersistenceBackend::new());
        let persistence = MemoryPersistence::with_backend(backend.clone()).await.unwrap();
        let user = User::unauthenticated();

        backend.fail_next_commit(unavailable("disk full"));
        let result = persistence
            .run_transaction("write", &user, |txn| {
                txn.remote_documents.add_entry(doc("rooms/a", 1, map(&[])), version(1));
                Ok(())
            })
            .await;
        assert!(result.is_err());

        let found = persistence
            .run_transaction("read", &user, |txn| Ok(txn.remote_documents.get_entry(&key("rooms/a"))))
            .await
            .unwrap();
        assert!(found.is_invalid_document());
        assert_eq!(backend.commit_count(), 0);
    }

    #[tokio::test]
    async fn operation_error_discards_working_copy() {
        let persistence = MemoryPersistence::new();
        let user = User::unauthenticated();
        let result: FirestoreResult<()> = persistence
            .run_transaction("write", &user, |txn| {
                txn.remote_documents.add_entry(doc("rooms/a", 1, map(&[])), version(1));
                Err(unavailable("abort"))
            })
            .await;
        assert!(result.is_err());
        let empty = persistence
            .run_transaction("read", &user, |txn| Ok(txn.remote_documents.is_empty()))
            .await
            .unwrap();
        assert!(empty);
    }

    #[tokio::test]
    async fn state_is_restored_from_backend() {
        let backend = Arc::new(MemoryPersistenceBackend::new());
        let alice = User::new("alice");
        {
            let persistence = MemoryPersistence::with_backend(backend.clone()).await.unwrap();
            persistence
                .run_transaction("seed", &alice, |txn| {
                    txn.remote_documents.add_entry(doc("rooms/a", 3, map(&[])), version(3));
                    txn.mutation_queue.add_mutation_batch(
                        Timestamp::now(),
                        Vec::new(),
                        vec![set_mutation("rooms/b", map(&[("v", FirestoreValue::from_integer(1))]))],
                    );
                    let target_id = txn.target_cache.allocate_target_id();
                    assert_eq!(target_id, 2);
                    Ok(())
                })
                .await
                .unwrap();
        }

        let restored = MemoryPersistence::with_backend(backend).await.unwrap();
        let (document, batches, next_target) = restored
            .run_transaction("read", &alice, |txn| {
                Ok((
                    txn.remote_documents.get_entry(&key("rooms/a")),
                    txn.mutation_queue.all_mutation_batches(),
                    txn.target_cache.allocate_target_id(),
                ))
            })
            .await
            .unwrap();
        assert_eq!(document.version(), version(3));
        assert_eq!(batches.len(), 1);
        assert_eq!(next_target, 4);
    }

    #[tokio::test]
    async fn batch_ids_keep_increasing_after_restart_with_empty_queue() {
        let backend = Arc::new(MemoryPersistenceBackend::new());
        let alice = User::new("alice");
        let first = {
            let persistence = MemoryPersistence::with_backend(backend.clone()).await.unwrap();
            persistence
                .run_transaction("write and acknowledge", &alice, |txn| {
                    let batch = txn.mutation_queue.add_mutation_batch(
                        Timestamp::now(),
                        Vec::new(),
                        vec![set_mutation("rooms/a", map(&[]))],
                    );
                    txn.mutation_queue.acknowledge_batch(&batch, Vec::new());
                    txn.mutation_queue.remove_mutation_batch(&batch);
                    Ok(batch.batch_id)
                })
                .await
                .unwrap()
        };
        assert!(backend.snapshot().mutation_batches.values().all(|batches| batches.is_empty()));

        let restored = MemoryPersistence::with_backend(backend).await.unwrap();
        let second = restored
            .run_transaction("write", &alice, |txn| {
                Ok(txn
                    .mutation_queue
                    .add_mutation_batch(Timestamp::now(), Vec::new(), vec![set_mutation("rooms/b", map(&[]))])
                    .batch_id)
            })
            .await
            .unwrap();
        assert!(second > first, "batch id {second} reused after {first}");
    }

    #[test]
    fn lost_lease_is_ignored() {
        let result: FirestoreResult<()> = Err(primary_lease_lost_error());
        assert_eq!(ignore_if_primary_lease_loss(result).unwrap(), None);
        let other: FirestoreResult<()> = Err(unavailable("offline"));
        assert!(ignore_if_primary_lease_loss(other).is_err());
    }
}
