use futures::future::BoxFuture;
use futures::FutureExt;

use crate::firestore::collection::DocumentKeySet;
use crate::firestore::core::user::User;
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::model::{BatchId, MutationBatch, MutationBatchResult, TargetId};
use crate::firestore::remote::remote_event::RemoteEvent;

pub type RemoteStoreFuture<'a, T> = BoxFuture<'a, T>;

pub fn box_remote_store_future<'a, F, T>(future: F) -> RemoteStoreFuture<'a, T>
where
    F: std::future::Future<Output = T> + Send + 'a,
{
    future.boxed()
}

/// Callbacks from the remote store into the component that owns local
/// state, usually the sync engine.
pub trait RemoteSyncer: Send + Sync + 'static {
    /// Applies a consistent snapshot assembled from the watch stream.
    fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// The backend refused to listen to `target_id`; the target is gone.
    fn reject_listen(
        &self,
        target_id: TargetId,
        error: FirestoreError,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    fn apply_successful_write(
        &self,
        result: MutationBatchResult,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// The backend permanently rejected the batch.
    fn reject_failed_write(
        &self,
        batch_id: BatchId,
        error: FirestoreError,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// Keys last reported by the server for `target_id`. Must not block on
    /// the async queue; the watch aggregator calls it while folding frames.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet;

    /// First pending batch after `after_batch_id`.
    fn next_mutation_batch(
        &self,
        after_batch_id: Option<BatchId>,
    ) -> RemoteStoreFuture<'_, FirestoreResult<Option<MutationBatch>>>;

    fn handle_credential_change(&self, _user: User) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(async { Ok(()) })
    }

    /// Persisted write stream token, sent with the handshake.
    fn last_stream_token(&self) -> RemoteStoreFuture<'_, FirestoreResult<Vec<u8>>> {
        box_remote_store_future(async { Ok(Vec::new()) })
    }

    fn set_last_stream_token(&self, _token: Vec<u8>) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(async { Ok(()) })
    }

    /// Whether the client appears online, for listeners waiting on it.
    fn handle_online_state_change(&self, _state: OnlineState) {}
}

/// Best guess at whether the client can reach the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnlineState {
    Unknown,
    Online,
    Offline,
}
