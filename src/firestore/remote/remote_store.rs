use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};

use async_lock::Mutex;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value as JsonValue};

use crate::firestore::collection::DocumentKeySet;
use crate::firestore::core::async_queue::{AsyncQueue, DelayedOperation, TimerId};
use crate::firestore::core::user::User;
use crate::firestore::error::{
    internal_error, is_permanent_error, is_permanent_write_error, unavailable, FirestoreError,
    FirestoreErrorCode, FirestoreResult,
};
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::{MutationBatch, MutationBatchResult, SnapshotVersion, TargetId};
use crate::firestore::remote::backoff::ExponentialBackoff;
use crate::firestore::remote::remote_event::RemoteEvent;
use crate::firestore::remote::remote_syncer::{OnlineState, RemoteSyncer};
use crate::firestore::remote::watch_change::{
    decode_watch_change, TargetChangeState, WatchChange, WatchTargetChange,
};
use crate::firestore::remote::watch_change_aggregator::{
    TargetMetadataProvider, WatchChangeAggregator,
};
use crate::firestore::remote::JsonProtoSerializer;
use crate::firestore::settings::FirestoreSettings;
use crate::firestore::value::BytesValue;
use crate::platform::token::{CredentialsProvider, Token};

const LOG_TARGET: &str = "firestore::remote_store";

/// Batches sent on the write stream without an acknowledgement.
pub const MAX_PENDING_WRITES: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamKind {
    Listen,
    Write,
}

/// One incarnation of a stream. Transport callbacks carry it back so that
/// completions from a stream that has since been closed are dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamId {
    pub kind: StreamKind,
    pub generation: u64,
}

/// Network side of the listen and write streams.
///
/// Sends are fire-and-forget. The transport reports progress by calling
/// [`RemoteStore::on_stream_open`], [`RemoteStore::on_stream_message`] and
/// [`RemoteStore::on_stream_close`] with the id it was opened with.
#[async_trait]
pub trait WatchTransport: Send + Sync {
    /// Begins connecting `stream`. An `Err` means the attempt failed outright.
    async fn open(&self, stream: StreamId, token: Option<Token>) -> FirestoreResult<()>;

    async fn send_listen(&self, stream: StreamId, request: JsonValue) -> FirestoreResult<()>;

    async fn send_unlisten(&self, stream: StreamId, target_id: TargetId) -> FirestoreResult<()>;

    async fn send_write(&self, stream: StreamId, request: JsonValue) -> FirestoreResult<()>;

    /// Tears `stream` down without reporting a close back.
    async fn close(&self, stream: StreamId);
}

/// Reasons the network is currently off.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    CredentialChange,
    Shutdown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StreamState {
    Initial,
    Starting,
    Open,
    /// Open for longer than the health check timeout.
    Healthy,
    Error,
    Backoff,
}

struct StreamSlot {
    kind: StreamKind,
    state: StreamState,
    close_count: u64,
    backoff: ExponentialBackoff,
    idle_timer: Option<DelayedOperation>,
    health_timer: Option<DelayedOperation>,
}

impl StreamSlot {
    fn new(kind: StreamKind, queue: &AsyncQueue, settings: &FirestoreSettings) -> Self {
        let timer_id = match kind {
            StreamKind::Listen => TimerId::ListenStreamConnectionBackoff,
            StreamKind::Write => TimerId::WriteStreamConnectionBackoff,
        };
        Self {
            kind,
            state: StreamState::Initial,
            close_count: 0,
            backoff: ExponentialBackoff::new(queue.clone(), timer_id, settings.backoff),
            idle_timer: None,
            health_timer: None,
        }
    }

    fn id(&self) -> StreamId {
        StreamId {
            kind: self.kind,
            generation: self.close_count,
        }
    }

    fn is_current(&self, id: StreamId) -> bool {
        self.close_count == id.generation
    }

    fn is_started(&self) -> bool {
        matches!(
            self.state,
            StreamState::Starting | StreamState::Open | StreamState::Healthy | StreamState::Backoff
        )
    }

    fn is_open(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::Healthy)
    }

    fn cancel_idle_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.cancel();
        }
    }

    /// Ends the current incarnation; later callbacks for it are ignored.
    fn close(&mut self, final_state: StreamState) -> StreamId {
        self.cancel_idle_timer();
        if let Some(timer) = self.health_timer.take() {
            timer.cancel();
        }
        self.backoff.cancel();
        let id = self.id();
        self.close_count += 1;
        self.state = final_state;
        id
    }
}

struct RemoteStoreState {
    listen: StreamSlot,
    write: StreamSlot,
    watch_aggregator: Option<WatchChangeAggregator>,
    write_pipeline: VecDeque<MutationBatch>,
    handshake_complete: bool,
    stream_token: Vec<u8>,
    offline_causes: BTreeSet<OfflineCause>,
    online_state: OnlineState,
}

type ListenTargets = Arc<StdMutex<BTreeMap<TargetId, TargetData>>>;

fn lock_targets(targets: &ListenTargets) -> MutexGuard<'_, BTreeMap<TargetId, TargetData>> {
    targets.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Answers the aggregator's questions from the syncer and the listen set.
struct RemoteStoreMetadata {
    syncer: Weak<dyn RemoteSyncer>,
    listen_targets: ListenTargets,
}

impl TargetMetadataProvider for RemoteStoreMetadata {
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        self.syncer
            .upgrade()
            .map(|syncer| syncer.get_remote_keys_for_target(target_id))
            .unwrap_or_default()
    }

    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
        lock_targets(&self.listen_targets).get(&target_id).cloned()
    }
}

/// Keeps the listen and write streams running for the sync engine.
///
/// Listen targets are re-sent whenever the listen stream reopens, and the
/// write pipeline is refilled from the mutation queue after every
/// reconnect. Failed streams restart with exponential backoff.
#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<RemoteStoreInner>,
}

impl RemoteStore {
    pub fn new(
        transport: Arc<dyn WatchTransport>,
        serializer: JsonProtoSerializer,
        credentials: Arc<dyn CredentialsProvider>,
        queue: AsyncQueue,
        settings: &FirestoreSettings,
        syncer: Weak<dyn RemoteSyncer>,
    ) -> Self {
        let state = RemoteStoreState {
            listen: StreamSlot::new(StreamKind::Listen, &queue, settings),
            write: StreamSlot::new(StreamKind::Write, &queue, settings),
            watch_aggregator: None,
            write_pipeline: VecDeque::new(),
            handshake_complete: false,
            stream_token: Vec::new(),
            // Streams stay down until the network is enabled.
            offline_causes: BTreeSet::from([OfflineCause::UserDisabled]),
            online_state: OnlineState::Unknown,
        };
        Self {
            inner: Arc::new(RemoteStoreInner {
                state: Mutex::new(state),
                listen_targets: Arc::new(StdMutex::new(BTreeMap::new())),
                transport,
                serializer,
                credentials,
                queue,
                settings: settings.clone(),
                syncer,
            }),
        }
    }

    /// Starts the streams if there is work for them.
    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.inner.enable_network(OfflineCause::UserDisabled).await
    }

    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.inner.disable_network(OfflineCause::UserDisabled).await
    }

    pub async fn shutdown(&self) -> FirestoreResult<()> {
        self.inner.disable_network(OfflineCause::Shutdown).await
    }

    /// Starts watching `target_data`. Re-listening to a watched target is a no-op.
    pub async fn listen(&self, target_data: TargetData) -> FirestoreResult<()> {
        self.inner.listen(target_data).await
    }

    pub async fn unlisten(&self, target_id: TargetId) -> FirestoreResult<()> {
        self.inner.unlisten(target_id).await
    }

    /// Pulls pending batches from the syncer into the write pipeline.
    pub async fn fill_write_pipeline(&self) -> FirestoreResult<()> {
        self.inner.fill_write_pipeline().await
    }

    /// Restarts both streams under `user`'s credentials.
    pub async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        self.inner.handle_credential_change(user).await
    }

    pub async fn on_stream_open(&self, stream: StreamId) {
        self.inner.on_stream_open(stream).await;
    }

    pub async fn on_stream_message(&self, stream: StreamId, message: JsonValue) {
        self.inner.on_stream_message(stream, message).await;
    }

    /// `error` is `None` when the server closed the stream cleanly.
    pub async fn on_stream_close(&self, stream: StreamId, error: Option<FirestoreError>) {
        self.inner.handle_stream_close(stream, error).await;
    }

    pub fn listen_target_ids(&self) -> Vec<TargetId> {
        lock_targets(&self.inner.listen_targets).keys().copied().collect()
    }

    pub async fn pending_write_batch_ids(&self) -> Vec<i32> {
        let state = self.inner.state.lock().await;
        state.write_pipeline.iter().map(|batch| batch.batch_id).collect()
    }

    /// Id of the live incarnation of `kind`, if it has been started.
    pub async fn active_stream(&self, kind: StreamKind) -> Option<StreamId> {
        let state = self.inner.state.lock().await;
        let slot = state.slot(kind);
        slot.is_started().then(|| slot.id())
    }

    pub async fn online_state(&self) -> OnlineState {
        self.inner.state.lock().await.online_state
    }
}

struct RemoteStoreInner {
    state: Mutex<RemoteStoreState>,
    listen_targets: ListenTargets,
    transport: Arc<dyn WatchTransport>,
    serializer: JsonProtoSerializer,
    credentials: Arc<dyn CredentialsProvider>,
    queue: AsyncQueue,
    settings: FirestoreSettings,
    syncer: Weak<dyn RemoteSyncer>,
}

impl RemoteStoreState {
    fn slot(&self, kind: StreamKind) -> &StreamSlot {
        match kind {
            StreamKind::Listen => &self.listen,
            StreamKind::Write => &self.write,
        }
    }

    fn slot_mut(&mut self, kind: StreamKind) -> &mut StreamSlot {
        match kind {
            StreamKind::Listen => &mut self.listen,
            StreamKind::Write => &mut self.write,
        }
    }

    fn can_use_network(&self) -> bool {
        self.offline_causes.is_empty()
    }

    fn can_add_to_write_pipeline(&self) -> bool {
        self.can_use_network() && self.write_pipeline.len() < MAX_PENDING_WRITES
    }

    fn should_start_write_stream(&self) -> bool {
        self.can_use_network() && !self.write.is_started() && !self.write_pipeline.is_empty()
    }
}

impl RemoteStoreInner {
    fn syncer(&self) -> Option<Arc<dyn RemoteSyncer>> {
        self.syncer.upgrade()
    }

    fn has_listen_targets(&self) -> bool {
        !lock_targets(&self.listen_targets).is_empty()
    }

    fn should_start_watch_stream(&self, state: &RemoteStoreState) -> bool {
        state.can_use_network() && !state.listen.is_started() && self.has_listen_targets()
    }

    fn new_aggregator(&self) -> WatchChangeAggregator {
        WatchChangeAggregator::new(
            self.serializer.database_id().clone(),
            Arc::new(RemoteStoreMetadata {
                syncer: self.syncer.clone(),
                listen_targets: Arc::clone(&self.listen_targets),
            }),
        )
    }

    async fn set_online_state(&self, online_state: OnlineState) {
        {
            let mut state = self.state.lock().await;
            if state.online_state == online_state {
                return;
            }
            state.online_state = online_state;
        }
        log::debug!(target: LOG_TARGET, "online state is now {online_state:?}");
        if let Some(syncer) = self.syncer() {
            syncer.handle_online_state_change(online_state);
        }
    }

    async fn enable_network(self: &Arc<Self>, cause: OfflineCause) -> FirestoreResult<()> {
        let start_watch = {
            let mut state = self.state.lock().await;
            state.offline_causes.remove(&cause);
            if !state.can_use_network() {
                return Ok(());
            }
            self.should_start_watch_stream(&state)
        };
        if start_watch {
            self.start_stream(StreamKind::Listen).await;
        } else {
            self.set_online_state(OnlineState::Unknown).await;
        }
        self.fill_write_pipeline().await
    }

    async fn disable_network(self: &Arc<Self>, cause: OfflineCause) -> FirestoreResult<()> {
        let closed = {
            let mut state = self.state.lock().await;
            state.offline_causes.insert(cause);
            Self::stop_streams_locked(&mut state)
        };
        for stream in closed {
            self.transport.close(stream).await;
        }
        self.set_online_state(OnlineState::Offline).await;
        Ok(())
    }

    /// Stops both streams and drops in-flight state. Batches left in the
    /// pipeline are re-read from the mutation queue on the next fill.
    fn stop_streams_locked(state: &mut RemoteStoreState) -> Vec<StreamId> {
        let mut closed = Vec::new();
        for kind in [StreamKind::Listen, StreamKind::Write] {
            let slot = state.slot_mut(kind);
            let was_started = slot.is_started();
            let id = slot.close(StreamState::Initial);
            if was_started {
                closed.push(id);
            }
        }
        state.watch_aggregator = None;
        state.handshake_complete = false;
        state.write_pipeline.clear();
        closed
    }

    async fn handle_credential_change(self: &Arc<Self>, user: User) -> FirestoreResult<()> {
        let can_use_network = self.state.lock().await.can_use_network();
        if !can_use_network {
            // Only the syncer needs to hear about it; streams restart later.
            if let Some(syncer) = self.syncer() {
                syncer.handle_credential_change(user).await?;
            }
            return Ok(());
        }
        log::debug!(target: LOG_TARGET, "restarting streams for new credentials");
        self.disable_network(OfflineCause::CredentialChange).await?;
        self.set_online_state(OnlineState::Unknown).await;
        if let Some(syncer) = self.syncer() {
            syncer.handle_credential_change(user).await?;
        }
        self.enable_network(OfflineCause::CredentialChange).await
    }

    async fn listen(self: &Arc<Self>, target_data: TargetData) -> FirestoreResult<()> {
        let target_id = target_data.target_id;
        {
            let mut targets = lock_targets(&self.listen_targets);
            if targets.contains_key(&target_id) {
                return Ok(());
            }
            targets.insert(target_id, target_data.clone());
        }

        let (open_stream, start) = {
            let state = self.state.lock().await;
            let open_stream = state.listen.is_open().then(|| state.listen.id());
            (open_stream, self.should_start_watch_stream(&state))
        };
        if start {
            self.start_stream(StreamKind::Listen).await;
        } else if let Some(stream) = open_stream {
            self.send_watch_request(stream, target_data).await;
        }
        Ok(())
    }

    async fn unlisten(self: &Arc<Self>, target_id: TargetId) -> FirestoreResult<()> {
        let removed = lock_targets(&self.listen_targets).remove(&target_id);
        if removed.is_none() {
            return Ok(());
        }
        let (open_stream, can_use_network) = {
            let state = self.state.lock().await;
            (
                state.listen.is_open().then(|| state.listen.id()),
                state.can_use_network(),
            )
        };
        if let Some(stream) = open_stream {
            self.send_unwatch_request(stream, target_id).await;
        }
        if !self.has_listen_targets() {
            if let Some(stream) = open_stream {
                self.mark_idle(stream).await;
            } else if can_use_network {
                self.set_online_state(OnlineState::Unknown).await;
            }
        }
        Ok(())
    }

    async fn send_watch_request(self: &Arc<Self>, stream: StreamId, target_data: TargetData) {
        let target_id = target_data.target_id;
        let mut request_data = target_data;
        if !request_data.resume_token.is_empty() || !request_data.snapshot_version.is_min() {
            let expected_count = self
                .syncer()
                .map(|syncer| syncer.get_remote_keys_for_target(target_id).len())
                .unwrap_or_default();
            request_data = request_data.with_expected_count(expected_count as i32);
        }
        {
            let mut state = self.state.lock().await;
            if !state.listen.is_current(stream) {
                return;
            }
            state.listen.cancel_idle_timer();
            if let Some(aggregator) = state.watch_aggregator.as_mut() {
                aggregator.record_pending_target_request(target_id);
            }
        }
        let request = self.serializer.encode_target(&request_data);
        if let Err(err) = self.transport.send_listen(stream, request).await {
            self.handle_stream_close(stream, Some(err)).await;
        }
    }

    async fn send_unwatch_request(self: &Arc<Self>, stream: StreamId, target_id: TargetId) {
        {
            let mut state = self.state.lock().await;
            if !state.listen.is_current(stream) {
                return;
            }
            state.listen.cancel_idle_timer();
            if let Some(aggregator) = state.watch_aggregator.as_mut() {
                aggregator.record_pending_target_request(target_id);
            }
        }
        if let Err(err) = self.transport.send_unlisten(stream, target_id).await {
            self.handle_stream_close(stream, Some(err)).await;
        }
    }

    /// Fetches a token and asks the transport to open `kind`.
    async fn start_stream(self: &Arc<Self>, kind: StreamKind) {
        let stream = {
            let mut state = self.state.lock().await;
            let slot = state.slot_mut(kind);
            if slot.is_started() && slot.state != StreamState::Backoff {
                return;
            }
            slot.state = StreamState::Starting;
            let id = slot.id();
            if kind == StreamKind::Listen {
                state.watch_aggregator = Some(self.new_aggregator());
            } else {
                state.handshake_complete = false;
            }
            id
        };

        if kind == StreamKind::Write {
            if let Some(syncer) = self.syncer() {
                match syncer.last_stream_token().await {
                    Ok(stream_token) => self.state.lock().await.stream_token = stream_token,
                    Err(err) => {
                        log::warn!(target: LOG_TARGET, "failed to read the last stream token: {err}")
                    }
                }
            }
        }

        let token = match self.credentials.get_token().await {
            Ok(token) => token,
            Err(err) => {
                self.handle_stream_close(stream, Some(err)).await;
                return;
            }
        };
        {
            let state = self.state.lock().await;
            if !state.slot(kind).is_current(stream) {
                // Closed while the token was being fetched.
                return;
            }
        }

        if let Err(err) = self.transport.open(stream, token).await {
            self.handle_stream_close(stream, Some(err)).await;
            return;
        }

        let weak = Arc::downgrade(self);
        let timer = self.queue.enqueue_after_delay(
            TimerId::HealthCheckTimeout,
            self.settings.health_check_timeout,
            move || async move {
                if let Some(inner) = weak.upgrade() {
                    inner.on_health_check(stream).await;
                }
            },
        );
        let mut state = self.state.lock().await;
        let slot = state.slot_mut(kind);
        if slot.is_current(stream) {
            slot.health_timer = Some(timer);
        } else {
            timer.cancel();
        }
    }

    /// A stream that opened in time is marked healthy; one still connecting
    /// is torn down and retried.
    async fn on_health_check(self: &Arc<Self>, stream: StreamId) {
        let starting = {
            let mut state = self.state.lock().await;
            let slot = state.slot_mut(stream.kind);
            if !slot.is_current(stream) {
                return;
            }
            slot.health_timer = None;
            if slot.is_open() {
                slot.state = StreamState::Healthy;
                return;
            }
            slot.state == StreamState::Starting
        };
        if starting {
            log::debug!(target: LOG_TARGET, "{:?} stream did not open in time", stream.kind);
            self.transport.close(stream).await;
            self.handle_stream_close(
                stream,
                Some(unavailable("Stream did not become healthy in time")),
            )
            .await;
        }
    }

    async fn mark_idle(self: &Arc<Self>, stream: StreamId) {
        let idle_timer_id = match stream.kind {
            StreamKind::Listen => TimerId::ListenStreamIdle,
            StreamKind::Write => TimerId::WriteStreamIdle,
        };
        let mut state = self.state.lock().await;
        let slot = state.slot_mut(stream.kind);
        if !slot.is_current(stream) || !slot.is_open() || slot.idle_timer.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        slot.idle_timer = Some(self.queue.enqueue_after_delay(
            idle_timer_id,
            self.settings.idle_timeout,
            move || async move {
                if let Some(inner) = weak.upgrade() {
                    inner.on_idle_timeout(stream).await;
                }
            },
        ));
    }

    async fn on_idle_timeout(self: &Arc<Self>, stream: StreamId) {
        let open = {
            let mut state = self.state.lock().await;
            let slot = state.slot_mut(stream.kind);
            slot.idle_timer = None;
            slot.is_current(stream) && slot.is_open()
        };
        if open {
            log::debug!(target: LOG_TARGET, "closing idle {:?} stream", stream.kind);
            self.transport.close(stream).await;
            self.handle_stream_close(stream, None).await;
        }
    }

    async fn on_stream_open(self: &Arc<Self>, stream: StreamId) {
        {
            let mut state = self.state.lock().await;
            let slot = state.slot_mut(stream.kind);
            if !slot.is_current(stream) || slot.state != StreamState::Starting {
                return;
            }
            slot.state = StreamState::Open;
        }
        match stream.kind {
            StreamKind::Listen => {
                let targets: Vec<TargetData> =
                    lock_targets(&self.listen_targets).values().cloned().collect();
                for target_data in targets {
                    self.send_watch_request(stream, target_data).await;
                }
            }
            StreamKind::Write => {
                // The first request only names the database; its response
                // carries the stream token.
                let request = json!({ "database": self.serializer.database_name() });
                if let Err(err) = self.transport.send_write(stream, request).await {
                    self.handle_stream_close(stream, Some(err)).await;
                }
            }
        }
    }

    async fn on_stream_message(self: &Arc<Self>, stream: StreamId, message: JsonValue) {
        {
            let mut state = self.state.lock().await;
            let slot = state.slot_mut(stream.kind);
            if !slot.is_current(stream) || !slot.is_open() {
                return;
            }
            slot.backoff.reset();
        }
        let result = match stream.kind {
            StreamKind::Listen => self.on_watch_message(stream, message).await,
            StreamKind::Write => self.on_write_message(stream, message).await,
        };
        if let Err(err) = result {
            log::warn!(target: LOG_TARGET, "failed to handle {:?} stream message: {err}", stream.kind);
            self.transport.close(stream).await;
            self.handle_stream_close(stream, Some(err)).await;
        }
    }

    async fn on_watch_message(
        self: &Arc<Self>,
        stream: StreamId,
        message: JsonValue,
    ) -> FirestoreResult<()> {
        let Some(change) = decode_watch_change(&self.serializer, &message)? else {
            return Ok(());
        };
        self.set_online_state(OnlineState::Online).await;

        if let WatchChange::TargetChange(target_change) = &change {
            if target_change.state == TargetChangeState::Remove {
                if let Some(cause) = target_change.cause.clone() {
                    return self.handle_target_error(target_change, cause).await;
                }
            }
        }

        let snapshot_version = global_snapshot_version(&change);
        let event = {
            let mut state = self.state.lock().await;
            if !state.listen.is_current(stream) {
                return Ok(());
            }
            let Some(aggregator) = state.watch_aggregator.as_mut() else {
                return Ok(());
            };
            aggregator.handle_watch_change(change);
            match snapshot_version {
                Some(version) => Some(aggregator.create_remote_event(version)),
                None => None,
            }
        };

        if let Some(event) = event {
            self.raise_watch_snapshot(stream, event).await?;
        }
        Ok(())
    }

    async fn raise_watch_snapshot(
        self: &Arc<Self>,
        stream: StreamId,
        event: RemoteEvent,
    ) -> FirestoreResult<()> {
        let mut requeries = Vec::new();
        {
            let mut targets = lock_targets(&self.listen_targets);
            for (target_id, change) in &event.target_changes {
                if change.resume_token.is_empty() {
                    continue;
                }
                if let Some(target_data) = targets.get_mut(target_id) {
                    *target_data = target_data
                        .clone()
                        .with_resume_token(change.resume_token.clone(), event.snapshot_version);
                }
            }
            for (target_id, purpose) in &event.target_mismatches {
                let Some(target_data) = targets.get_mut(target_id) else {
                    continue;
                };
                // Forget the token so the server re-sends the full result.
                *target_data = target_data
                    .clone()
                    .with_resume_token(Vec::new(), SnapshotVersion::min());
                requeries.push(target_data.clone().with_purpose(*purpose));
            }
        }

        for target_data in requeries {
            log::debug!(
                target: LOG_TARGET,
                "re-querying target {} after existence filter mismatch",
                target_data.target_id
            );
            self.send_unwatch_request(stream, target_data.target_id).await;
            self.send_watch_request(stream, target_data).await;
        }

        if let Some(syncer) = self.syncer() {
            syncer.apply_remote_event(event).await?;
        }
        Ok(())
    }

    async fn handle_target_error(
        self: &Arc<Self>,
        change: &WatchTargetChange,
        cause: FirestoreError,
    ) -> FirestoreResult<()> {
        for target_id in &change.target_ids {
            if lock_targets(&self.listen_targets).remove(target_id).is_none() {
                continue;
            }
            {
                let mut state = self.state.lock().await;
                if let Some(aggregator) = state.watch_aggregator.as_mut() {
                    aggregator.remove_target(*target_id);
                }
            }
            log::warn!(target: LOG_TARGET, "listen to target {target_id} rejected: {cause}");
            if let Some(syncer) = self.syncer() {
                syncer.reject_listen(*target_id, cause.clone()).await?;
            }
        }
        Ok(())
    }

    async fn on_write_message(
        self: &Arc<Self>,
        stream: StreamId,
        message: JsonValue,
    ) -> FirestoreResult<()> {
        let response = self.serializer.decode_write_response(&message)?;
        let handshake = {
            let mut state = self.state.lock().await;
            if !state.write.is_current(stream) {
                return Ok(());
            }
            state.stream_token = response.stream_token.clone();
            !std::mem::replace(&mut state.handshake_complete, true)
        };

        let Some(syncer) = self.syncer() else {
            return Ok(());
        };
        if handshake {
            syncer.set_last_stream_token(response.stream_token).await?;
            let batches: Vec<MutationBatch> = {
                let state = self.state.lock().await;
                state.write_pipeline.iter().cloned().collect()
            };
            for batch in batches {
                self.send_write_request(stream, &batch).await;
            }
            return Ok(());
        }

        let batch = {
            let mut state = self.state.lock().await;
            state.write_pipeline.pop_front()
        };
        let Some(batch) = batch else {
            return Err(internal_error("Got a write response without a pending batch"));
        };
        let result = MutationBatchResult::from(
            batch,
            response.commit_version,
            response.mutation_results,
            response.stream_token,
        )?;
        syncer.apply_successful_write(result).await?;
        self.fill_write_pipeline().await
    }

    async fn send_write_request(self: &Arc<Self>, stream: StreamId, batch: &MutationBatch) {
        let stream_token = {
            let mut state = self.state.lock().await;
            if !state.write.is_current(stream) || !state.handshake_complete {
                return;
            }
            state.write.cancel_idle_timer();
            state.stream_token.clone()
        };
        let writes: Vec<JsonValue> = batch
            .mutations
            .iter()
            .map(|mutation| self.serializer.encode_mutation(mutation))
            .collect();
        let request = json!({
            "streamToken": BytesValue::new(stream_token).to_base64(),
            "writes": writes,
        });
        if let Err(err) = self.transport.send_write(stream, request).await {
            self.handle_stream_close(stream, Some(err)).await;
        }
    }

    async fn fill_write_pipeline(self: &Arc<Self>) -> FirestoreResult<()> {
        let Some(syncer) = self.syncer() else {
            return Ok(());
        };
        loop {
            let (can_add, last_batch_id) = {
                let state = self.state.lock().await;
                (
                    state.can_add_to_write_pipeline(),
                    state.write_pipeline.back().map(|batch| batch.batch_id),
                )
            };
            if !can_add {
                break;
            }
            let Some(batch) = syncer.next_mutation_batch(last_batch_id).await? else {
                let idle_stream = {
                    let state = self.state.lock().await;
                    (state.write_pipeline.is_empty() && state.write.is_open())
                        .then(|| state.write.id())
                };
                if let Some(stream) = idle_stream {
                    self.mark_idle(stream).await;
                }
                break;
            };

            let open_stream = {
                let mut state = self.state.lock().await;
                state.write_pipeline.push_back(batch.clone());
                (state.write.is_open() && state.handshake_complete).then(|| state.write.id())
            };
            if let Some(stream) = open_stream {
                self.send_write_request(stream, &batch).await;
            }
        }

        let start = self.state.lock().await.should_start_write_stream();
        if start {
            self.start_stream(StreamKind::Write).await;
        }
        Ok(())
    }

    /// Single place where a stream incarnation ends, cleanly or not.
    fn handle_stream_close(
        self: &Arc<Self>,
        stream: StreamId,
        error: Option<FirestoreError>,
    ) -> BoxFuture<'static, ()> {
        let this = Arc::clone(self);
        async move {
            let (restart, use_backoff, write_error) = {
                let mut state = this.state.lock().await;
                let slot = state.slot_mut(stream.kind);
                if !slot.is_current(stream) {
                    return;
                }
                let was_healthy = slot.state == StreamState::Healthy;
                let final_state = if error.is_some() {
                    StreamState::Error
                } else {
                    StreamState::Initial
                };
                slot.close(final_state);
                match &error {
                    None => slot.backoff.reset(),
                    Some(err) if err.code == FirestoreErrorCode::ResourceExhausted => {
                        log::debug!(target: LOG_TARGET, "using maximum backoff after quota error");
                        slot.backoff.reset_to_max();
                    }
                    Some(err) if err.code == FirestoreErrorCode::Unauthenticated && !was_healthy => {
                        this.credentials.invalidate_token();
                    }
                    Some(_) => {}
                }
                if stream.kind == StreamKind::Listen {
                    state.watch_aggregator = None;
                    (this.should_start_watch_stream(&state), error.is_some(), None)
                } else {
                    let handshake_complete = std::mem::replace(&mut state.handshake_complete, false);
                    (
                        state.can_use_network() && !state.write_pipeline.is_empty(),
                        error.is_some(),
                        error.clone().map(|err| (err, handshake_complete)),
                    )
                }
            };

            if let Some(err) = &error {
                log::debug!(target: LOG_TARGET, "{:?} stream closed with error: {err}", stream.kind);
            }

            let mut use_backoff = use_backoff;
            let mut restart = restart;
            if stream.kind == StreamKind::Write {
                if let Some((err, handshake_complete)) = &write_error {
                    if this.handle_write_error(err, *handshake_complete).await
                        == WriteErrorOutcome::Rejected
                    {
                        // The next attempt skips the backoff.
                        use_backoff = false;
                        restart = this.state.lock().await.should_start_write_stream();
                    }
                }
            } else if restart && error.is_some() {
                this.set_online_state(OnlineState::Offline).await;
            }

            if !restart {
                return;
            }
            if use_backoff {
                let weak = Arc::downgrade(&this);
                let mut state = this.state.lock().await;
                let slot = state.slot_mut(stream.kind);
                slot.state = StreamState::Backoff;
                slot.backoff.backoff_and_run(move || async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.start_stream(stream.kind).await;
                    }
                });
            } else {
                this.start_stream(stream.kind).await;
            }
        }
        .boxed()
    }

    /// Drops the head batch on a permanent write error, or the stream token
    /// on a permanent handshake error.
    async fn handle_write_error(
        self: &Arc<Self>,
        error: &FirestoreError,
        handshake_complete: bool,
    ) -> WriteErrorOutcome {
        let Some(syncer) = self.syncer() else {
            return WriteErrorOutcome::Retry;
        };
        if !handshake_complete {
            if is_permanent_error(error.code) {
                log::debug!(target: LOG_TARGET, "resetting stream token after handshake error: {error}");
                self.state.lock().await.stream_token.clear();
                if let Err(err) = syncer.set_last_stream_token(Vec::new()).await {
                    log::warn!(target: LOG_TARGET, "failed to clear stream token: {err}");
                }
            }
            return WriteErrorOutcome::Retry;
        }
        if !is_permanent_write_error(error.code) {
            return WriteErrorOutcome::Retry;
        }

        let Some(batch) = self.state.lock().await.write_pipeline.pop_front() else {
            return WriteErrorOutcome::Retry;
        };
        log::warn!(target: LOG_TARGET, "write batch {} rejected: {error}", batch.batch_id);
        if let Err(err) = syncer.reject_failed_write(batch.batch_id, error.clone()).await {
            log::warn!(target: LOG_TARGET, "failed to reject batch {}: {err}", batch.batch_id);
        }
        if let Err(err) = self.fill_write_pipeline().await {
            log::warn!(target: LOG_TARGET, "failed to refill write pipeline: {err}");
        }
        WriteErrorOutcome::Rejected
    }
}

#[derive(PartialEq, Eq)]
enum WriteErrorOutcome {
    Retry,
    Rejected,
}

/// Only a target change addressed to every target marks a consistent
/// snapshot.
fn global_snapshot_version(change: &WatchChange) -> Option<SnapshotVersion> {
    match change {
        WatchChange::TargetChange(change)
            if change.state == TargetChangeState::NoChange
                && change.target_ids.is_empty()
                && !change.read_time.is_min() =>
        {
            Some(change.read_time)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::target_data::TargetPurpose;
    use crate::firestore::model::{BatchId, DatabaseId, Timestamp};
    use crate::firestore::remote::remote_syncer::{box_remote_store_future, RemoteStoreFuture};
    use crate::platform::token::StaticCredentialsProvider;
    use crate::test_support::{key, query, set_mutation, map};
    use std::sync::Mutex as TestMutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Sent {
        Open(StreamId),
        Listen(StreamId, JsonValue),
        Unlisten(StreamId, TargetId),
        Write(StreamId, JsonValue),
        Close(StreamId),
    }

    #[derive(Default)]
    struct RecordingTransport {
        sent: TestMutex<Vec<Sent>>,
    }

    impl RecordingTransport {
        fn take(&self) -> Vec<Sent> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    #[async_trait]
    impl WatchTransport for RecordingTransport {
        async fn open(&self, stream: StreamId, _token: Option<Token>) -> FirestoreResult<()> {
            self.sent.lock().unwrap().push(Sent::Open(stream));
            Ok(())
        }

        async fn send_listen(&self, stream: StreamId, request: JsonValue) -> FirestoreResult<()> {
            self.sent.lock().unwrap().push(Sent::Listen(stream, request));
            Ok(())
        }

        async fn send_unlisten(&self, stream: StreamId, target_id: TargetId) -> FirestoreResult<()> {
            self.sent.lock().unwrap().push(Sent::Unlisten(stream, target_id));
            Ok(())
        }

        async fn send_write(&self, stream: StreamId, request: JsonValue) -> FirestoreResult<()> {
            self.sent.lock().unwrap().push(Sent::Write(stream, request));
            Ok(())
        }

        async fn close(&self, stream: StreamId) {
            self.sent.lock().unwrap().push(Sent::Close(stream));
        }
    }

    #[derive(Default)]
    struct TestSyncer {
        events: TestMutex<Vec<RemoteEvent>>,
        rejected_listens: TestMutex<Vec<TargetId>>,
        acknowledged: TestMutex<Vec<BatchId>>,
        rejected_writes: TestMutex<Vec<BatchId>>,
        batches: TestMutex<Vec<MutationBatch>>,
    }

    impl RemoteSyncer for TestSyncer {
        fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            self.events.lock().unwrap().push(event);
            box_remote_store_future(async { Ok(()) })
        }

        fn reject_listen(
            &self,
            target_id: TargetId,
            _error: FirestoreError,
        ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            self.rejected_listens.lock().unwrap().push(target_id);
            box_remote_store_future(async { Ok(()) })
        }

        fn apply_successful_write(
            &self,
            result: MutationBatchResult,
        ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            let batch_id = result.batch.batch_id;
            self.acknowledged.lock().unwrap().push(batch_id);
            self.batches.lock().unwrap().retain(|batch| batch.batch_id != batch_id);
            box_remote_store_future(async { Ok(()) })
        }

        fn reject_failed_write(
            &self,
            batch_id: BatchId,
            _error: FirestoreError,
        ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            self.rejected_writes.lock().unwrap().push(batch_id);
            self.batches.lock().unwrap().retain(|batch| batch.batch_id != batch_id);
            box_remote_store_future(async { Ok(()) })
        }

        fn get_remote_keys_for_target(&self, _target_id: TargetId) -> DocumentKeySet {
            DocumentKeySet::new()
        }

        fn next_mutation_batch(
            &self,
            after_batch_id: Option<BatchId>,
        ) -> RemoteStoreFuture<'_, FirestoreResult<Option<MutationBatch>>> {
            let after = after_batch_id.unwrap_or(-1);
            let next = self
                .batches
                .lock()
                .unwrap()
                .iter()
                .find(|batch| batch.batch_id > after)
                .cloned();
            box_remote_store_future(async move { Ok(next) })
        }
    }

    struct Fixture {
        store: RemoteStore,
        transport: Arc<RecordingTransport>,
        syncer: Arc<TestSyncer>,
        credentials: Arc<StaticCredentialsProvider>,
        queue: AsyncQueue,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(RecordingTransport::default());
        let syncer = Arc::new(TestSyncer::default());
        let credentials = Arc::new(StaticCredentialsProvider::new(None));
        let queue = AsyncQueue::new();
        let weak_syncer: Weak<dyn RemoteSyncer> = Arc::downgrade(&syncer) as Weak<dyn RemoteSyncer>;
        let store = RemoteStore::new(
            Arc::clone(&transport) as Arc<dyn WatchTransport>,
            JsonProtoSerializer::new(DatabaseId::default("p")),
            Arc::clone(&credentials) as Arc<dyn CredentialsProvider>,
            queue.clone(),
            &FirestoreSettings::default(),
            weak_syncer,
        );
        Fixture {
            store,
            transport,
            syncer,
            credentials,
            queue,
        }
    }

    fn target(target_id: TargetId) -> TargetData {
        TargetData::new(query("rooms").to_target(), target_id, TargetPurpose::Listen, 1)
    }

    fn batch(batch_id: BatchId) -> MutationBatch {
        MutationBatch::new(
            batch_id,
            Timestamp::now(),
            Vec::new(),
            vec![set_mutation("rooms/a", map(&[]))],
        )
    }

    #[tokio::test]
    async fn listen_opens_stream_and_sends_targets_once_open() {
        let f = fixture();
        f.store.enable_network().await.unwrap();
        assert!(f.transport.take().is_empty());

        f.store.listen(target(2)).await.unwrap();
        let stream = StreamId { kind: StreamKind::Listen, generation: 0 };
        assert_eq!(f.transport.take(), vec![Sent::Open(stream)]);

        f.store.on_stream_open(stream).await;
        let sent = f.transport.take();
        assert!(matches!(&sent[..], [Sent::Listen(id, request)] if *id == stream && request["targetId"] == json!(2)));

        f.store.unlisten(2).await.unwrap();
        assert_eq!(f.transport.take(), vec![Sent::Unlisten(stream, 2)]);
        assert!(f.queue.contains_delayed_operation(TimerId::ListenStreamIdle));
    }

    #[tokio::test]
    async fn global_snapshot_raises_remote_event() {
        let f = fixture();
        f.store.enable_network().await.unwrap();
        f.store.listen(target(2)).await.unwrap();
        let stream = f.store.active_stream(StreamKind::Listen).await.unwrap();
        f.store.on_stream_open(stream).await;

        f.store
            .on_stream_message(stream, json!({"targetChange": {"targetChangeType": "ADD", "targetIds": [2]}}))
            .await;
        f.store
            .on_stream_message(
                stream,
                json!({"documentChange": {
                    "document": {
                        "name": "projects/p/databases/(default)/documents/rooms/a",
                        "updateTime": "1970-01-01T00:00:01Z",
                        "fields": {}
                    },
                    "targetIds": [2]
                }}),
            )
            .await;
        f.store
            .on_stream_message(
                stream,
                json!({"targetChange": {"targetChangeType": "CURRENT", "targetIds": [2], "resumeToken": "AQ=="}}),
            )
            .await;
        assert!(f.syncer.events.lock().unwrap().is_empty());

        f.store
            .on_stream_message(stream, json!({"targetChange": {"readTime": "1970-01-01T00:00:02Z"}}))
            .await;
        let events = f.syncer.events.lock().unwrap().clone();
        assert_eq!(events.len(), 1);
        let change = &events[0].target_changes[&2];
        assert!(change.current);
        assert!(change.added_documents.contains(&key("rooms/a")));
        assert_eq!(f.store.online_state().await, OnlineState::Online);
    }

    #[tokio::test]
    async fn messages_from_closed_stream_are_ignored() {
        let f = fixture();
        f.store.enable_network().await.unwrap();
        f.store.listen(target(2)).await.unwrap();
        let old = f.store.active_stream(StreamKind::Listen).await.unwrap();
        f.store.on_stream_open(old).await;

        f.store.on_stream_close(old, Some(unavailable("network"))).await;
        f.store.on_stream_close(old, Some(unavailable("duplicate"))).await;
        f.store
            .on_stream_message(old, json!({"targetChange": {"readTime": "1970-01-01T00:00:02Z"}}))
            .await;
        assert!(f.syncer.events.lock().unwrap().is_empty());
        assert_eq!(f.store.online_state().await, OnlineState::Offline);

        // The replacement stream is waiting out its backoff.
        let current = f.store.active_stream(StreamKind::Listen).await.unwrap();
        assert_eq!(current.generation, old.generation + 1);
    }

    #[tokio::test]
    async fn rejected_target_is_forgotten() {
        let f = fixture();
        f.store.enable_network().await.unwrap();
        f.store.listen(target(2)).await.unwrap();
        let stream = f.store.active_stream(StreamKind::Listen).await.unwrap();
        f.store.on_stream_open(stream).await;
        f.store
            .on_stream_message(
                stream,
                json!({"targetChange": {
                    "targetChangeType": "REMOVE",
                    "targetIds": [2],
                    "cause": {"code": 7, "message": "denied"}
                }}),
            )
            .await;
        assert_eq!(*f.syncer.rejected_listens.lock().unwrap(), vec![2]);
        assert!(f.store.listen_target_ids().is_empty());
    }

    #[tokio::test]
    async fn write_pipeline_waits_for_handshake_then_acknowledges() {
        let f = fixture();
        f.syncer.batches.lock().unwrap().extend([batch(1), batch(2)]);
        f.store.enable_network().await.unwrap();
        assert_eq!(f.store.pending_write_batch_ids().await, vec![1, 2]);
        let stream = f.store.active_stream(StreamKind::Write).await.unwrap();
        assert_eq!(f.transport.take(), vec![Sent::Open(stream)]);

        f.store.on_stream_open(stream).await;
        let handshake = f.transport.take();
        assert!(matches!(&handshake[..], [Sent::Write(_, request)] if request.get("database").is_some()));

        f.store
            .on_stream_message(stream, json!({"streamToken": "AQ==", "writeResults": []}))
            .await;
        let writes = f.transport.take();
        assert_eq!(writes.len(), 2);
        assert!(matches!(&writes[0], Sent::Write(_, request) if request["streamToken"] == json!("AQ==")));

        f.store
            .on_stream_message(
                stream,
                json!({
                    "streamToken": "Ag==",
                    "commitTime": "1970-01-01T00:00:05Z",
                    "writeResults": [{"updateTime": "1970-01-01T00:00:05Z"}]
                }),
            )
            .await;
        assert_eq!(*f.syncer.acknowledged.lock().unwrap(), vec![1]);
        assert_eq!(f.store.pending_write_batch_ids().await, vec![2]);
    }

    #[tokio::test]
    async fn permanent_write_error_rejects_head_batch() {
        let f = fixture();
        f.syncer.batches.lock().unwrap().push(batch(1));
        f.store.enable_network().await.unwrap();
        let stream = f.store.active_stream(StreamKind::Write).await.unwrap();
        f.store.on_stream_open(stream).await;
        f.store
            .on_stream_message(stream, json!({"streamToken": "AQ==", "writeResults": []}))
            .await;

        f.store
            .on_stream_close(
                stream,
                Some(FirestoreError::new(FirestoreErrorCode::FailedPrecondition, "missing")),
            )
            .await;
        assert_eq!(*f.syncer.rejected_writes.lock().unwrap(), vec![1]);
        assert!(f.store.pending_write_batch_ids().await.is_empty());
    }

    #[tokio::test]
    async fn unauthenticated_close_invalidates_token() {
        let f = fixture();
        f.store.enable_network().await.unwrap();
        f.store.listen(target(2)).await.unwrap();
        let stream = f.store.active_stream(StreamKind::Listen).await.unwrap();
        f.store
            .on_stream_close(
                stream,
                Some(FirestoreError::new(FirestoreErrorCode::Unauthenticated, "expired")),
            )
            .await;
        assert!(f.credentials.was_invalidated());
    }

    #[tokio::test]
    async fn health_check_reopens_stalled_stream() {
        let f = fixture();
        f.store.enable_network().await.unwrap();
        f.store.listen(target(2)).await.unwrap();
        let stalled = f.store.active_stream(StreamKind::Listen).await.unwrap();
        f.transport.take();

        f.queue.run_delays_until(TimerId::HealthCheckTimeout).await.unwrap();
        assert_eq!(f.transport.take().first(), Some(&Sent::Close(stalled)));
        let retry = f.store.active_stream(StreamKind::Listen).await.unwrap();
        assert_eq!(retry.generation, stalled.generation + 1);
    }

    #[tokio::test]
    async fn disable_network_closes_streams() {
        let f = fixture();
        f.store.enable_network().await.unwrap();
        f.store.listen(target(2)).await.unwrap();
        let stream = f.store.active_stream(StreamKind::Listen).await.unwrap();
        f.transport.take();

        f.store.disable_network().await.unwrap();
        assert_eq!(f.transport.take(), vec![Sent::Close(stream)]);
        assert!(f.store.active_stream(StreamKind::Listen).await.is_none());
        assert_eq!(f.store.listen_target_ids(), vec![2]);
    }
}
