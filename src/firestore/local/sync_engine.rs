use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};

use crate::firestore::collection::{DocumentKeySet, DocumentMap};
use crate::firestore::core::async_queue::AsyncQueue;
use crate::firestore::core::event_manager::EventManager;
use crate::firestore::core::query::Query;
use crate::firestore::core::target::Target;
use crate::firestore::core::target_id_generator::TargetIdGenerator;
use crate::firestore::core::user::User;
use crate::firestore::core::view::{LimboDocumentChange, View, ViewDocumentChanges};
use crate::firestore::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::firestore::error::{internal_error, FirestoreError, FirestoreResult};
use crate::firestore::local::local_store::{LocalStore, LocalViewChanges, QueryResult};
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{
    BatchId, DocumentKey, MutableDocument, Mutation, MutationBatch, MutationBatchResult,
    SnapshotVersion, TargetId,
};
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::remote_store::{RemoteStore, WatchTransport};
use crate::firestore::remote::remote_syncer::{
    box_remote_store_future, OnlineState, RemoteStoreFuture, RemoteSyncer,
};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::settings::FirestoreSettings;
use crate::platform::token::CredentialsProvider;
use crate::util::hard_assert;

const LOG_TARGET: &str = "firestore::sync_engine";

/// Limbo targets are never persisted, so they carry no sequence number.
const INVALID_SEQUENCE_NUMBER: i64 = -1;

/// Completion of a user write: `Ok` once acknowledged, the backend's error
/// once rejected.
pub type WriteCallback = Box<dyn FnOnce(FirestoreResult<()>) + Send + 'static>;

/// Receives what the sync engine produces for query listeners.
pub trait SyncEngineListener: Send + Sync {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>);

    fn on_watch_error(&self, query: &Query, error: &FirestoreError);

    fn on_online_state_change(&self, online_state: OnlineState);
}

impl SyncEngineListener for EventManager {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
        EventManager::on_watch_change(self, snapshots);
    }

    fn on_watch_error(&self, query: &Query, error: &FirestoreError) {
        EventManager::on_watch_error(self, query, error);
    }

    fn on_online_state_change(&self, online_state: OnlineState) {
        EventManager::on_online_state_change(self, online_state);
    }
}

struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

/// A document being looked up on a dedicated target.
#[derive(Clone, Debug)]
struct LimboResolution {
    key: DocumentKey,
    /// Whether the target has delivered the document. Until then the target's
    /// remote keys are empty.
    received_document: bool,
}

enum RemoteAction {
    Listen(TargetData),
    Unlisten(TargetId),
}

struct SyncEngineState {
    current_user: User,
    online_state: OnlineState,
    /// Views by query canonical id.
    query_views: BTreeMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, Vec<Query>>,
    /// Limbo keys waiting for a free resolution slot, oldest first.
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    active_limbo_resolutions_by_target: BTreeMap<TargetId, LimboResolution>,
    /// Which query targets put each document in limbo.
    limbo_document_refs: ReferenceSet,
    /// Write callbacks by user key, then batch id.
    mutation_user_callbacks: BTreeMap<String, BTreeMap<BatchId, WriteCallback>>,
    limbo_target_id_generator: TargetIdGenerator,
}

/// Turns local writes and remote events into view snapshots, and resolves
/// documents whose existence the views cannot vouch for.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<SyncEngineInner>,
}

struct SyncEngineInner {
    local_store: Arc<LocalStore>,
    remote_store: RemoteStore,
    listener: Arc<dyn SyncEngineListener>,
    max_concurrent_limbo_resolutions: usize,
    state: StdMutex<SyncEngineState>,
}

impl SyncEngine {
    /// Builds the engine and the remote store that reports back to it.
    pub fn new(
        local_store: Arc<LocalStore>,
        transport: Arc<dyn WatchTransport>,
        serializer: JsonProtoSerializer,
        credentials: Arc<dyn CredentialsProvider>,
        queue: AsyncQueue,
        listener: Arc<dyn SyncEngineListener>,
        settings: &FirestoreSettings,
    ) -> Self {
        let current_user = local_store.current_user();
        let inner = Arc::new_cyclic(|weak: &Weak<SyncEngineInner>| {
            let syncer: Weak<dyn RemoteSyncer> = weak.clone();
            SyncEngineInner {
                remote_store: RemoteStore::new(transport, serializer, credentials, queue, settings, syncer),
                local_store,
                listener,
                max_concurrent_limbo_resolutions: settings.max_concurrent_limbo_resolutions,
                state: StdMutex::new(SyncEngineState {
                    current_user,
                    online_state: OnlineState::Unknown,
                    query_views: BTreeMap::new(),
                    queries_by_target: BTreeMap::new(),
                    enqueued_limbo_resolutions: VecDeque::new(),
                    active_limbo_targets_by_key: BTreeMap::new(),
                    active_limbo_resolutions_by_target: BTreeMap::new(),
                    limbo_document_refs: ReferenceSet::new(),
                    mutation_user_callbacks: BTreeMap::new(),
                    limbo_target_id_generator: TargetIdGenerator::for_sync_engine(),
                }),
            }
        });
        Self { inner }
    }

    pub fn local_store(&self) -> &Arc<LocalStore> {
        &self.inner.local_store
    }

    pub fn remote_store(&self) -> &RemoteStore {
        &self.inner.remote_store
    }

    /// Starts a view for `query` and returns its first snapshot.
    pub async fn listen(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        self.inner.listen(query).await
    }

    /// Drops the view of `query`, releasing its target once no other query
    /// shares it.
    pub async fn unlisten(&self, query: &Query) -> FirestoreResult<()> {
        self.inner.unlisten(query).await
    }

    /// Applies `mutations` locally and queues them for the backend.
    /// `callback` hears about the outcome, including a failed local write.
    pub async fn write(&self, mutations: Vec<Mutation>, callback: WriteCallback) -> FirestoreResult<()> {
        self.inner.write(mutations, callback).await
    }

    pub async fn apply_remote_event(&self, event: RemoteEvent) -> FirestoreResult<()> {
        self.inner.apply_remote_event_impl(event).await
    }

    pub async fn reject_listen(&self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()> {
        self.inner.reject_listen_impl(target_id, error).await
    }

    pub async fn apply_successful_write(&self, result: MutationBatchResult) -> FirestoreResult<()> {
        self.inner.apply_successful_write_impl(result).await
    }

    pub async fn reject_failed_write(&self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()> {
        self.inner.reject_failed_write_impl(batch_id, error).await
    }

    /// Switches the local store to `user` and re-raises affected views.
    pub async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        self.inner.handle_credential_change_impl(user).await
    }

    pub fn handle_online_state_change(&self, online_state: OnlineState) {
        self.inner.apply_online_state_change(online_state);
    }

    /// Limbo documents with a resolution target in flight.
    pub fn active_limbo_document_resolutions(&self) -> BTreeMap<DocumentKey, TargetId> {
        self.inner.state().active_limbo_targets_by_key.clone()
    }

    /// Limbo documents waiting for a free slot, oldest first.
    pub fn enqueued_limbo_document_resolutions(&self) -> Vec<DocumentKey> {
        self.inner
            .state()
            .enqueued_limbo_resolutions
            .iter()
            .cloned()
            .collect()
    }

    pub fn current_user(&self) -> User {
        self.inner.state().current_user.clone()
    }
}

impl SyncEngineInner {
    fn state(&self) -> MutexGuard<'_, SyncEngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_remote_actions(&self, actions: Vec<RemoteAction>) -> FirestoreResult<()> {
        for action in actions {
            match action {
                RemoteAction::Listen(target_data) => self.remote_store.listen(target_data).await?,
                RemoteAction::Unlisten(target_id) => self.remote_store.unlisten(target_id).await?,
            }
        }
        Ok(())
    }

    async fn listen(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        let canonical_id = query.canonical_id();
        {
            let state = self.state();
            if let Some(query_view) = state.query_views.get(&canonical_id) {
                return Ok(query_view.view.compute_initial_snapshot());
            }
        }

        let target_data = self.local_store.allocate_target(query.to_target()).await?;
        let target_id = target_data.target_id;
        let query_result = self.local_store.execute_query(&query, true).await?;
        let (snapshot, actions) = {
            let mut state = self.state();
            // A second query mapping to the same target inherits its currency.
            let current = state
                .queries_by_target
                .get(&target_id)
                .and_then(|queries| queries.first())
                .and_then(|existing| state.query_views.get(&existing.canonical_id()))
                .map_or(false, |existing| existing.view.is_current());
            self.initialize_view(&mut state, query, target_id, current, target_data.resume_token.clone(), query_result)?
        };
        self.run_remote_actions(actions).await?;
        self.remote_store.listen(target_data).await?;
        Ok(snapshot)
    }

    fn initialize_view(
        &self,
        state: &mut SyncEngineState,
        query: Query,
        target_id: TargetId,
        current: bool,
        resume_token: Vec<u8>,
        query_result: QueryResult,
    ) -> FirestoreResult<(ViewSnapshot, Vec<RemoteAction>)> {
        let mut view = View::new(query.clone(), query_result.remote_keys);
        let changes = view.compute_doc_changes(&query_result.documents, None);
        let synthesized = TargetChange::synthesized_for_current_change(
            current && state.online_state != OnlineState::Offline,
            resume_token,
        );
        let view_change = view.apply_changes(changes, true, Some(&synthesized), false);
        let mut actions = Vec::new();
        self.update_tracked_limbos(state, target_id, view_change.limbo_changes, &mut actions);
        let snapshot = view_change
            .snapshot
            .ok_or_else(|| internal_error("A new view must produce a snapshot"))?;

        state
            .queries_by_target
            .entry(target_id)
            .or_default()
            .push(query.clone());
        state.query_views.insert(
            query.canonical_id(),
            QueryView {
                query,
                target_id,
                view,
            },
        );
        Ok((snapshot, actions))
    }

    async fn unlisten(&self, query: &Query) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();
        let target_id = {
            let mut state = self.state();
            let Some(query_view) = state.query_views.remove(&canonical_id) else {
                log::debug!(target: LOG_TARGET, "unlisten of unknown query {canonical_id}");
                return Ok(());
            };
            let target_id = query_view.target_id;
            let queries = state.queries_by_target.entry(target_id).or_default();
            if queries.len() > 1 {
                queries.retain(|existing| existing.canonical_id() != canonical_id);
                return Ok(());
            }
            target_id
        };

        log::debug!(target: LOG_TARGET, "releasing target {target_id} for {canonical_id}");
        self.local_store.release_target(target_id, false).await?;
        self.remote_store.unlisten(target_id).await?;
        let actions = {
            let mut state = self.state();
            self.remove_and_cleanup_target(&mut state, target_id)
        };
        self.run_remote_actions(actions).await
    }

    async fn write(&self, mutations: Vec<Mutation>, callback: WriteCallback) -> FirestoreResult<()> {
        let result = match self.local_store.local_write(mutations).await {
            Ok(result) => result,
            Err(err) => {
                log::warn!(target: LOG_TARGET, "local write failed: {err}");
                callback(Err(err));
                return Ok(());
            }
        };
        {
            let mut state = self.state();
            let user_key = state.current_user.to_key().to_string();
            state
                .mutation_user_callbacks
                .entry(user_key)
                .or_default()
                .insert(result.batch_id, callback);
        }
        self.emit_new_snaps_and_notify_local_store(&result.changes, None).await?;
        self.remote_store.fill_write_pipeline().await
    }

    async fn apply_remote_event_impl(&self, event: RemoteEvent) -> FirestoreResult<()> {
        {
            let mut state = self.state();
            for (target_id, change) in &event.target_changes {
                let Some(resolution) = state.active_limbo_resolutions_by_target.get_mut(target_id) else {
                    continue;
                };
                hard_assert(
                    change.document_count() <= 1,
                    "Limbo resolution for single document contains multiple changes.",
                );
                if !change.added_documents.is_empty() {
                    resolution.received_document = true;
                } else if !change.modified_documents.is_empty() {
                    hard_assert(
                        resolution.received_document,
                        "Received change for limbo target document without add.",
                    );
                } else if !change.removed_documents.is_empty() {
                    hard_assert(
                        resolution.received_document,
                        "Received remove for limbo target document without add.",
                    );
                    resolution.received_document = false;
                }
            }
        }
        let changes = self.local_store.apply_remote_event(event.clone()).await?;
        self.emit_new_snaps_and_notify_local_store(&changes, Some(&event)).await
    }

    async fn reject_listen_impl(&self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()> {
        let limbo = {
            let mut state = self.state();
            match state.active_limbo_resolutions_by_target.remove(&target_id) {
                Some(resolution) => {
                    state.active_limbo_targets_by_key.remove(&resolution.key);
                    let mut actions = Vec::new();
                    self.pump_enqueued_limbo_resolutions(&mut state, &mut actions);
                    Some((resolution.key, actions))
                }
                None => None,
            }
        };

        if let Some((key, actions)) = limbo {
            log::debug!(target: LOG_TARGET, "limbo resolution for {key} rejected: {error}");
            self.run_remote_actions(actions).await?;
            // The backend will not tell us about the document; treat it as deleted.
            let mut event = RemoteEvent::default();
            event
                .document_updates
                .insert(key.clone(), MutableDocument::new_no_document(key.clone(), SnapshotVersion::min()));
            event.resolved_limbo_documents = DocumentKeySet::new().insert(key);
            return self.apply_remote_event_impl(event).await;
        }

        self.local_store.release_target(target_id, false).await?;
        let (queries, actions) = {
            let mut state = self.state();
            let queries = state
                .queries_by_target
                .get(&target_id)
                .cloned()
                .unwrap_or_default();
            (queries, self.remove_and_cleanup_target(&mut state, target_id))
        };
        for query in &queries {
            self.listener.on_watch_error(query, &error);
        }
        self.run_remote_actions(actions).await
    }

    async fn apply_successful_write_impl(&self, result: MutationBatchResult) -> FirestoreResult<()> {
        let batch_id = result.batch.batch_id;
        let changes = self.local_store.acknowledge_batch(result).await?;
        self.process_user_callback(batch_id, Ok(()));
        self.emit_new_snaps_and_notify_local_store(&changes, None).await
    }

    async fn reject_failed_write_impl(&self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()> {
        let changes = self.local_store.reject_batch(batch_id).await?;
        self.process_user_callback(batch_id, Err(error));
        self.emit_new_snaps_and_notify_local_store(&changes, None).await
    }

    fn process_user_callback(&self, batch_id: BatchId, result: FirestoreResult<()>) {
        let callback = {
            let mut state = self.state();
            let user_key = state.current_user.to_key().to_string();
            state
                .mutation_user_callbacks
                .get_mut(&user_key)
                .and_then(|callbacks| callbacks.remove(&batch_id))
        };
        if let Some(callback) = callback {
            callback(result);
        }
    }

    async fn handle_credential_change_impl(&self, user: User) -> FirestoreResult<()> {
        if self.state().current_user == user {
            return Ok(());
        }
        log::debug!(target: LOG_TARGET, "user changed to {user}");
        let result = self.local_store.handle_user_change(user.clone()).await?;
        self.state().current_user = user;
        self.emit_new_snaps_and_notify_local_store(&result.affected_documents, None)
            .await
    }

    fn apply_online_state_change(&self, online_state: OnlineState) {
        let snapshots = {
            let mut state = self.state();
            let mut snapshots = Vec::new();
            for query_view in state.query_views.values_mut() {
                let view_change = query_view.view.apply_online_state_change(online_state);
                hard_assert(
                    view_change.limbo_changes.is_empty(),
                    "Online state change must not produce limbo changes",
                );
                snapshots.extend(view_change.snapshot);
            }
            state.online_state = online_state;
            snapshots
        };
        self.listener.on_online_state_change(online_state);
        self.listener.on_watch_change(snapshots);
    }

    /// Folds `changes` into every view, raising the resulting snapshots.
    async fn emit_new_snaps_and_notify_local_store(
        &self,
        changes: &DocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<()> {
        // Limit queries that lost documents at their edge are re-run against
        // the cache before the view is updated.
        let refill_queries: Vec<Query> = {
            let state = self.state();
            state
                .query_views
                .values()
                .filter(|query_view| query_view.view.compute_doc_changes(changes, None).needs_refill)
                .map(|query_view| query_view.query.clone())
                .collect()
        };
        let mut refills = BTreeMap::new();
        for query in refill_queries {
            let result = self.local_store.execute_query(&query, false).await?;
            refills.insert(query.canonical_id(), result.documents);
        }

        let (snapshots, view_changes, actions) = {
            let mut state = self.state();
            let mut snapshots = Vec::new();
            let mut view_changes = Vec::new();
            let mut limbo_updates = Vec::new();
            for (canonical_id, query_view) in state.query_views.iter_mut() {
                let mut doc_changes = query_view.view.compute_doc_changes(changes, None);
                if let Some(documents) = refills.get(canonical_id) {
                    doc_changes = query_view.view.compute_doc_changes(
                        documents,
                        Some(ViewDocumentChanges {
                            needs_refill: false,
                            ..doc_changes
                        }),
                    );
                }
                let target_id = query_view.target_id;
                let target_change = remote_event.and_then(|event| event.target_changes.get(&target_id));
                let pending_reset = remote_event
                    .map_or(false, |event| event.target_mismatches.contains_key(&target_id));
                let view_change = query_view
                    .view
                    .apply_changes(doc_changes, true, target_change, pending_reset);
                limbo_updates.push((target_id, view_change.limbo_changes));
                if let Some(snapshot) = view_change.snapshot {
                    view_changes.push(local_view_changes(target_id, &snapshot));
                    snapshots.push(snapshot);
                }
            }
            let mut actions = Vec::new();
            for (target_id, limbo_changes) in limbo_updates {
                self.update_tracked_limbos(&mut state, target_id, limbo_changes, &mut actions);
            }
            (snapshots, view_changes, actions)
        };

        self.listener.on_watch_change(snapshots);
        self.local_store.notify_local_view_changes(view_changes);
        self.run_remote_actions(actions).await
    }

    fn update_tracked_limbos(
        &self,
        state: &mut SyncEngineState,
        target_id: TargetId,
        limbo_changes: Vec<LimboDocumentChange>,
        actions: &mut Vec<RemoteAction>,
    ) {
        for change in limbo_changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    state.limbo_document_refs.add_reference(key.clone(), target_id);
                    self.track_limbo_change(state, key, actions);
                }
                LimboDocumentChange::Removed(key) => {
                    log::debug!(target: LOG_TARGET, "document no longer in limbo: {key}");
                    state.limbo_document_refs.remove_reference(&key, target_id);
                    if !state.limbo_document_refs.contains_key(&key) {
                        self.remove_limbo_target(state, &key, actions);
                    }
                }
            }
        }
    }

    fn track_limbo_change(
        &self,
        state: &mut SyncEngineState,
        key: DocumentKey,
        actions: &mut Vec<RemoteAction>,
    ) {
        if state.active_limbo_targets_by_key.contains_key(&key)
            || state.enqueued_limbo_resolutions.contains(&key)
        {
            return;
        }
        log::debug!(target: LOG_TARGET, "new document in limbo: {key}");
        state.enqueued_limbo_resolutions.push_back(key);
        self.pump_enqueued_limbo_resolutions(state, actions);
    }

    /// Starts resolution targets for queued limbo documents while slots are free.
    fn pump_enqueued_limbo_resolutions(&self, state: &mut SyncEngineState, actions: &mut Vec<RemoteAction>) {
        while state.active_limbo_targets_by_key.len() < self.max_concurrent_limbo_resolutions {
            let Some(key) = state.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            let limbo_target_id = state.limbo_target_id_generator.next();
            state.active_limbo_resolutions_by_target.insert(
                limbo_target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            state
                .active_limbo_targets_by_key
                .insert(key.clone(), limbo_target_id);
            actions.push(RemoteAction::Listen(TargetData::new(
                Target::for_document(&key),
                limbo_target_id,
                TargetPurpose::LimboResolution,
                INVALID_SEQUENCE_NUMBER,
            )));
        }
    }

    fn remove_limbo_target(
        &self,
        state: &mut SyncEngineState,
        key: &DocumentKey,
        actions: &mut Vec<RemoteAction>,
    ) {
        state.enqueued_limbo_resolutions.retain(|queued| queued != key);
        let Some(limbo_target_id) = state.active_limbo_targets_by_key.remove(key) else {
            return;
        };
        state.active_limbo_resolutions_by_target.remove(&limbo_target_id);
        actions.push(RemoteAction::Unlisten(limbo_target_id));
        self.pump_enqueued_limbo_resolutions(state, actions);
    }

    /// Forgets every query of `target_id` and the limbo documents it held.
    fn remove_and_cleanup_target(&self, state: &mut SyncEngineState, target_id: TargetId) -> Vec<RemoteAction> {
        if let Some(queries) = state.queries_by_target.remove(&target_id) {
            for query in queries {
                state.query_views.remove(&query.canonical_id());
            }
        }
        let mut actions = Vec::new();
        let limbo_keys = state.limbo_document_refs.remove_references_for_id(target_id);
        for key in limbo_keys.iter() {
            if !state.limbo_document_refs.contains_key(key) {
                self.remove_limbo_target(state, key, &mut actions);
            }
        }
        actions
    }

    fn remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        let state = self.state();
        if let Some(resolution) = state.active_limbo_resolutions_by_target.get(&target_id) {
            if resolution.received_document {
                return DocumentKeySet::new().insert(resolution.key.clone());
            }
            return DocumentKeySet::new();
        }
        let mut keys = DocumentKeySet::new();
        let Some(queries) = state.queries_by_target.get(&target_id) else {
            return keys;
        };
        for query in queries {
            if let Some(query_view) = state.query_views.get(&query.canonical_id()) {
                keys = keys.union(query_view.view.synced_documents());
            }
        }
        keys
    }
}

fn local_view_changes(target_id: TargetId, snapshot: &ViewSnapshot) -> LocalViewChanges {
    let mut added_keys = DocumentKeySet::new();
    let mut removed_keys = DocumentKeySet::new();
    for change in &snapshot.doc_changes {
        match change.change_type {
            ChangeType::Added => added_keys = added_keys.insert(change.doc.key().clone()),
            ChangeType::Removed => removed_keys = removed_keys.insert(change.doc.key().clone()),
            ChangeType::Modified | ChangeType::Metadata => {}
        }
    }
    LocalViewChanges {
        target_id,
        from_cache: snapshot.from_cache,
        added_keys,
        removed_keys,
    }
}

impl RemoteSyncer for SyncEngineInner {
    fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.apply_remote_event_impl(event))
    }

    fn reject_listen(
        &self,
        target_id: TargetId,
        error: FirestoreError,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.reject_listen_impl(target_id, error))
    }

    fn apply_successful_write(
        &self,
        result: MutationBatchResult,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.apply_successful_write_impl(result))
    }

    fn reject_failed_write(
        &self,
        batch_id: BatchId,
        error: FirestoreError,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.reject_failed_write_impl(batch_id, error))
    }

    fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        self.remote_keys_for_target(target_id)
    }

    fn next_mutation_batch(
        &self,
        after_batch_id: Option<BatchId>,
    ) -> RemoteStoreFuture<'_, FirestoreResult<Option<MutationBatch>>> {
        box_remote_store_future(self.local_store.next_mutation_batch(after_batch_id))
    }

    fn handle_credential_change(&self, user: User) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.handle_credential_change_impl(user))
    }

    fn last_stream_token(&self) -> RemoteStoreFuture<'_, FirestoreResult<Vec<u8>>> {
        box_remote_store_future(self.local_store.get_last_stream_token())
    }

    fn set_last_stream_token(&self, token: Vec<u8>) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.local_store.set_last_stream_token(token))
    }

    fn handle_online_state_change(&self, online_state: OnlineState) {
        self.apply_online_state_change(online_state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{permission_denied, FirestoreErrorCode};
    use crate::firestore::local::persistence::MemoryPersistence;
    use crate::firestore::model::DatabaseId;
    use crate::firestore::remote::remote_store::StreamId;
    use crate::firestore::value::FirestoreValue;
    use crate::platform::token::{EmptyCredentialsProvider, Token};
    use crate::test_support::{doc, key, map, query, set_mutation, version};
    use async_trait::async_trait;
    use serde_json::Value as JsonValue;
    use std::sync::Mutex as TestMutex;

    struct SilentTransport;

    #[async_trait]
    impl WatchTransport for SilentTransport {
        async fn open(&self, _stream: StreamId, _token: Option<Token>) -> FirestoreResult<()> {
            Ok(())
        }

        async fn send_listen(&self, _stream: StreamId, _request: JsonValue) -> FirestoreResult<()> {
            Ok(())
        }

        async fn send_unlisten(&self, _stream: StreamId, _target_id: TargetId) -> FirestoreResult<()> {
            Ok(())
        }

        async fn send_write(&self, _stream: StreamId, _request: JsonValue) -> FirestoreResult<()> {
            Ok(())
        }

        async fn close(&self, _stream: StreamId) {}
    }

    #[derive(Default)]
    struct RecordingListener {
        snapshots: TestMutex<Vec<ViewSnapshot>>,
        errors: TestMutex<Vec<(String, FirestoreErrorCode)>>,
    }

    impl RecordingListener {
        fn take(&self) -> Vec<ViewSnapshot> {
            std::mem::take(&mut *self.snapshots.lock().unwrap())
        }
    }

    impl SyncEngineListener for RecordingListener {
        fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
            self.snapshots.lock().unwrap().extend(snapshots);
        }

        fn on_watch_error(&self, query: &Query, error: &FirestoreError) {
            self.errors
                .lock()
                .unwrap()
                .push((query.canonical_id(), error.code));
        }

        fn on_online_state_change(&self, _online_state: OnlineState) {}
    }

    fn engine(max_limbo: usize) -> (SyncEngine, Arc<RecordingListener>) {
        let settings = FirestoreSettings {
            max_concurrent_limbo_resolutions: max_limbo,
            ..FirestoreSettings::default()
        };
        let listener = Arc::new(RecordingListener::default());
        let local_store = Arc::new(LocalStore::new(
            MemoryPersistence::new(),
            User::unauthenticated(),
            &settings,
        ));
        let engine = SyncEngine::new(
            local_store,
            Arc::new(SilentTransport),
            JsonProtoSerializer::new(DatabaseId::default("p")),
            Arc::new(EmptyCredentialsProvider::new()),
            AsyncQueue::new(),
            Arc::clone(&listener) as Arc<dyn SyncEngineListener>,
            &settings,
        );
        (engine, listener)
    }

    fn event(
        snapshot_seconds: i64,
        target_id: TargetId,
        change: TargetChange,
        documents: Vec<MutableDocument>,
    ) -> RemoteEvent {
        RemoteEvent {
            snapshot_version: version(snapshot_seconds),
            target_changes: BTreeMap::from([(target_id, change)]),
            document_updates: documents
                .into_iter()
                .map(|document| (document.key().clone(), document))
                .collect(),
            ..RemoteEvent::default()
        }
    }

    fn added(paths: &[&str], current: bool) -> TargetChange {
        TargetChange {
            current,
            resume_token: vec![1],
            added_documents: paths.iter().map(|path| key(path)).collect(),
            ..TargetChange::default()
        }
    }

    fn removed(paths: &[&str]) -> TargetChange {
        TargetChange {
            current: true,
            resume_token: vec![2],
            removed_documents: paths.iter().map(|path| key(path)).collect(),
            ..TargetChange::default()
        }
    }

    fn ids(snapshot: &ViewSnapshot) -> Vec<String> {
        snapshot.docs.iter().map(|doc| doc.key().id().to_string()).collect()
    }

    /// Listens to `rooms`, then lets the server deliver `paths` and drop them
    /// from the target again, leaving them cached but unconfirmed.
    async fn rooms_with_limbo_documents(engine: &SyncEngine, paths: &[&str]) {
        engine.listen(query("rooms")).await.unwrap();
        let documents = paths
            .iter()
            .map(|path| doc(path, 1, map(&[("v", FirestoreValue::from_integer(1))])))
            .collect();
        engine
            .apply_remote_event(event(1, 2, added(paths, false), documents))
            .await
            .unwrap();
        engine
            .apply_remote_event(event(2, 2, removed(paths), Vec::new()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn listen_raises_cached_snapshot_and_watches_target() {
        let (engine, _) = engine(100);
        let snapshot = engine.listen(query("rooms")).await.unwrap();
        assert!(snapshot.from_cache);
        assert!(snapshot.docs.is_empty());
        assert_eq!(engine.remote_store().listen_target_ids(), vec![2]);

        engine.unlisten(&query("rooms")).await.unwrap();
        assert!(engine.remote_store().listen_target_ids().is_empty());
    }

    #[tokio::test]
    async fn remote_event_raises_synced_snapshot() {
        let (engine, listener) = engine(100);
        engine.listen(query("rooms")).await.unwrap();
        engine
            .apply_remote_event(event(1, 2, added(&["rooms/a"], true), vec![doc("rooms/a", 1, map(&[]))]))
            .await
            .unwrap();

        let snapshots = listener.take();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(ids(&snapshots[0]), vec!["a"]);
        assert!(!snapshots[0].from_cache);
        assert_eq!(
            engine.inner.get_remote_keys_for_target(2),
            DocumentKeySet::new().insert(key("rooms/a"))
        );
    }

    #[tokio::test]
    async fn local_write_raises_pending_snapshot_and_reports_rejection() {
        let (engine, listener) = engine(100);
        engine.listen(query("rooms")).await.unwrap();

        let outcome = Arc::new(TestMutex::new(None));
        let sink = Arc::clone(&outcome);
        engine
            .write(
                vec![set_mutation("rooms/a", map(&[("v", FirestoreValue::from_integer(1))]))],
                Box::new(move |result| *sink.lock().unwrap() = Some(result)),
            )
            .await
            .unwrap();
        let snapshots = listener.take();
        assert_eq!(ids(&snapshots[0]), vec!["a"]);
        assert!(snapshots[0].has_pending_writes());

        let batch_id = engine
            .local_store()
            .get_highest_unacknowledged_batch_id()
            .await
            .unwrap();
        engine
            .reject_failed_write(batch_id, permission_denied("denied"))
            .await
            .unwrap();
        let result = outcome.lock().unwrap().take().unwrap();
        assert_eq!(result.unwrap_err().code, FirestoreErrorCode::PermissionDenied);
        let snapshots = listener.take();
        assert!(snapshots[0].docs.is_empty());
    }

    #[tokio::test]
    async fn documents_dropped_from_current_target_enter_limbo() {
        let (engine, _) = engine(100);
        rooms_with_limbo_documents(&engine, &["rooms/b"]).await;

        let active = engine.active_limbo_document_resolutions();
        assert_eq!(active.get(&key("rooms/b")), Some(&1));
        let mut listened = engine.remote_store().listen_target_ids();
        listened.sort();
        assert_eq!(listened, vec![1, 2]);
    }

    #[tokio::test]
    async fn limbo_resolutions_beyond_the_limit_wait_in_order() {
        let (engine, listener) = engine(1);
        rooms_with_limbo_documents(&engine, &["rooms/b", "rooms/c", "rooms/d"]).await;

        assert_eq!(engine.active_limbo_document_resolutions().len(), 1);
        assert_eq!(
            engine.enqueued_limbo_document_resolutions(),
            vec![key("rooms/c"), key("rooms/d")]
        );
        listener.take();

        // A rejected limbo target counts as a deletion and frees the slot.
        engine
            .reject_listen(1, permission_denied("denied"))
            .await
            .unwrap();
        let snapshots = listener.take();
        assert_eq!(ids(snapshots.last().unwrap()), vec!["c", "d"]);
        let active = engine.active_limbo_document_resolutions();
        assert_eq!(active.get(&key("rooms/c")), Some(&3));
        assert_eq!(engine.enqueued_limbo_document_resolutions(), vec![key("rooms/d")]);
    }

    #[tokio::test]
    async fn limbo_target_reports_received_document() {
        let (engine, _) = engine(100);
        rooms_with_limbo_documents(&engine, &["rooms/b"]).await;
        assert!(engine.inner.get_remote_keys_for_target(1).is_empty());

        engine
            .apply_remote_event(event(
                3,
                1,
                added(&["rooms/b"], true),
                vec![doc("rooms/b", 3, map(&[("v", FirestoreValue::from_integer(2))]))],
            ))
            .await
            .unwrap();
        assert_eq!(
            engine.inner.get_remote_keys_for_target(1),
            DocumentKeySet::new().insert(key("rooms/b"))
        );
    }

    #[tokio::test]
    async fn rejected_query_target_reports_error() {
        let (engine, listener) = engine(100);
        engine.listen(query("rooms")).await.unwrap();
        engine
            .reject_listen(2, permission_denied("no access"))
            .await
            .unwrap();

        let errors = listener.errors.lock().unwrap().clone();
        assert_eq!(errors, vec![(query("rooms").canonical_id(), FirestoreErrorCode::PermissionDenied)]);
        assert!(engine.inner.get_remote_keys_for_target(2).is_empty());
    }

    #[tokio::test]
    async fn offline_state_marks_synced_views_from_cache() {
        let (engine, listener) = engine(100);
        engine.listen(query("rooms")).await.unwrap();
        engine
            .apply_remote_event(event(1, 2, added(&["rooms/a"], true), vec![doc("rooms/a", 1, map(&[]))]))
            .await
            .unwrap();
        listener.take();

        engine.handle_online_state_change(OnlineState::Offline);
        let snapshots = listener.take();
        assert_eq!(snapshots.len(), 1);
        assert!(snapshots[0].from_cache);
    }
}
