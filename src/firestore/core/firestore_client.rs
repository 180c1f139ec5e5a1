use std::sync::Arc;

use futures::channel::oneshot;
use serde_json::Value as JsonValue;

use crate::firestore::core::async_queue::AsyncQueue;
use crate::firestore::core::event_manager::{EventManager, ListenOptions, QueryListener};
use crate::firestore::core::query::Query;
use crate::firestore::core::user::User;
use crate::firestore::core::view::View;
use crate::firestore::core::view_snapshot::ViewSnapshot;
use crate::firestore::error::{cancelled, internal_error, FirestoreError, FirestoreResult};
use crate::firestore::local::index_manager::FieldIndex;
use crate::firestore::local::local_store::LocalStore;
use crate::firestore::local::persistence::{MemoryPersistence, PersistenceBackend};
use crate::firestore::local::sync_engine::{SyncEngine, SyncEngineListener};
use crate::firestore::model::{DatabaseId, DocumentKey, MutableDocument, Mutation};
use crate::firestore::remote::remote_store::{StreamId, WatchTransport};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::settings::FirestoreSettings;
use crate::platform::token::CredentialsProvider;
use crate::util::{Observer, Unsubscribe};

const LOG_TARGET: &str = "firestore::client";

/// Entry point tying the caches, the sync engine and the streams together.
///
/// Every operation runs on the client's [`AsyncQueue`], in call order.
/// Transport callbacks must be routed through [`FirestoreClient::on_stream_open`],
/// [`FirestoreClient::on_stream_message`] and [`FirestoreClient::on_stream_close`]
/// so they are serialised with everything else.
#[derive(Clone)]
pub struct FirestoreClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    queue: AsyncQueue,
    credentials: Arc<dyn CredentialsProvider>,
    event_manager: Arc<EventManager>,
    sync_engine: SyncEngine,
}

impl FirestoreClient {
    /// Restores the local caches from `backend`, starts the credentials
    /// provider and enables the network.
    pub async fn new(
        database_id: DatabaseId,
        transport: Arc<dyn WatchTransport>,
        credentials: Arc<dyn CredentialsProvider>,
        backend: Arc<dyn PersistenceBackend>,
        settings: FirestoreSettings,
    ) -> FirestoreResult<Self> {
        settings.validate()?;
        let persistence = MemoryPersistence::with_backend(backend).await?;
        let local_store = Arc::new(LocalStore::new(persistence, User::unauthenticated(), &settings));
        let queue = AsyncQueue::new();
        let event_manager = Arc::new(EventManager::new());
        let sync_engine = SyncEngine::new(
            local_store,
            transport,
            JsonProtoSerializer::new(database_id),
            Arc::clone(&credentials),
            queue.clone(),
            Arc::clone(&event_manager) as Arc<dyn SyncEngineListener>,
            &settings,
        );

        let client = Self {
            inner: Arc::new(ClientInner {
                queue,
                credentials,
                event_manager,
                sync_engine,
            }),
        };

        let weak = Arc::downgrade(&client.inner);
        client.inner.credentials.start(
            &client.inner.queue,
            Arc::new(move |user: User| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let sync_engine = inner.sync_engine.clone();
                inner.queue.enqueue_and_forget(async move {
                    log::debug!(target: LOG_TARGET, "credential changed to {user}");
                    if let Err(err) = sync_engine.remote_store().handle_credential_change(user).await {
                        log::warn!(target: LOG_TARGET, "failed to apply credential change: {err}");
                    }
                });
            }),
        );
        client.enable_network().await?;
        Ok(client)
    }

    async fn run<F, Fut, T>(&self, operation: F) -> FirestoreResult<T>
    where
        F: FnOnce(Arc<ClientInner>) -> Fut,
        Fut: std::future::Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.inner
            .queue
            .enqueue(operation(Arc::clone(&self.inner)))
            .await?
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.run(|inner| async move { inner.sync_engine.remote_store().enable_network().await })
            .await
    }

    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.run(|inner| async move { inner.sync_engine.remote_store().disable_network().await })
            .await
    }

    /// Registers `observer` for snapshots of `query`. Dropping nothing stops
    /// the subscription; call the returned [`Unsubscribe`].
    pub async fn listen(
        &self,
        query: Query,
        options: ListenOptions,
        observer: Observer<ViewSnapshot>,
    ) -> FirestoreResult<Unsubscribe> {
        let listener = QueryListener::new(query.clone(), options, observer);
        let handle = listener.observer_handle();
        let listen_query = query.clone();
        let listener_id = self
            .run(move |inner| async move {
                let added = inner.event_manager.add_listener(listener);
                if added.first_for_query {
                    match inner.sync_engine.listen(listen_query.clone()).await {
                        Ok(snapshot) => inner.event_manager.on_watch_change(vec![snapshot]),
                        Err(err) => {
                            log::warn!(target: LOG_TARGET, "failed to listen to {}: {err}", listen_query.canonical_id());
                            inner.event_manager.on_watch_error(&listen_query, &err);
                        }
                    }
                }
                Ok(added.id)
            })
            .await?;

        let weak = Arc::downgrade(&self.inner);
        Ok(Box::new(move || {
            handle.mute();
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let task_inner = Arc::clone(&inner);
            inner.queue.enqueue_and_forget(async move {
                if task_inner.event_manager.remove_listener(&query, listener_id) {
                    if let Err(err) = task_inner.sync_engine.unlisten(&query).await {
                        log::warn!(target: LOG_TARGET, "failed to stop listening to {}: {err}", query.canonical_id());
                    }
                }
            });
        }))
    }

    /// Applies `mutations` locally and resolves once the backend accepted or
    /// rejected them.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<()> {
        let (sender, receiver) = oneshot::channel();
        self.run(move |inner| async move {
            inner
                .sync_engine
                .write(
                    mutations,
                    Box::new(move |result| {
                        let _ = sender.send(result);
                    }),
                )
                .await
        })
        .await?;
        receiver
            .await
            .map_err(|_| cancelled("The write was dropped before it completed"))?
    }

    pub async fn get_document_from_local_cache(&self, key: DocumentKey) -> FirestoreResult<MutableDocument> {
        self.run(move |inner| async move { inner.sync_engine.local_store().read_document(&key).await })
            .await
    }

    /// Runs `query` against the cache only.
    pub async fn get_documents_from_local_cache(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        self.run(move |inner| async move {
            let result = inner.sync_engine.local_store().execute_query(&query, true).await?;
            let mut view = View::new(query, result.remote_keys);
            let changes = view.compute_doc_changes(&result.documents, None);
            view.apply_changes(changes, false, None, false)
                .snapshot
                .ok_or_else(|| internal_error("A new view must produce a snapshot"))
        })
        .await
    }

    pub async fn configure_field_indexes(&self, indexes: Vec<FieldIndex>) -> FirestoreResult<()> {
        self.run(move |inner| async move {
            inner
                .sync_engine
                .local_store()
                .configure_field_indexes(indexes)
                .await
        })
        .await
    }

    pub fn on_stream_open(&self, stream: StreamId) {
        let sync_engine = self.inner.sync_engine.clone();
        self.inner.queue.enqueue_and_forget(async move {
            sync_engine.remote_store().on_stream_open(stream).await;
        });
    }

    pub fn on_stream_message(&self, stream: StreamId, message: JsonValue) {
        let sync_engine = self.inner.sync_engine.clone();
        self.inner.queue.enqueue_and_forget(async move {
            sync_engine.remote_store().on_stream_message(stream, message).await;
        });
    }

    /// `error` is `None` for a clean close by the server.
    pub fn on_stream_close(&self, stream: StreamId, error: Option<FirestoreError>) {
        let sync_engine = self.inner.sync_engine.clone();
        self.inner.queue.enqueue_and_forget(async move {
            sync_engine.remote_store().on_stream_close(stream, error).await;
        });
    }

    pub fn sync_engine(&self) -> &SyncEngine {
        &self.inner.sync_engine
    }

    pub fn queue(&self) -> &AsyncQueue {
        &self.inner.queue
    }

    /// Closes the streams and stops the queue. Later calls fail with
    /// `cancelled`.
    pub async fn terminate(&self) -> FirestoreResult<()> {
        self.run(|inner| async move {
            inner.sync_engine.remote_store().shutdown().await?;
            inner.credentials.shutdown();
            Ok(())
        })
        .await?;
        self.inner.queue.shutdown();
        Ok(())
    }
}
