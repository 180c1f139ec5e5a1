use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::firestore::core::query::Query;
use crate::firestore::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::firestore::error::FirestoreError;
use crate::firestore::remote::remote_syncer::OnlineState;
use crate::util::{AsyncObserver, Observer};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Raise snapshots whose only change is metadata (`from_cache`,
    /// pending writes).
    pub include_metadata_changes: bool,
    /// Hold back a cached first snapshot while the client may still be
    /// online, waiting for the server's.
    pub wait_for_sync_when_online: bool,
}

pub type ListenerId = u64;

/// One application subscription to a query.
pub struct QueryListener {
    query: Query,
    options: ListenOptions,
    observer: Arc<AsyncObserver<ViewSnapshot>>,
    raised_initial_event: bool,
    snapshot: Option<ViewSnapshot>,
    online_state: OnlineState,
}

impl QueryListener {
    pub fn new(query: Query, options: ListenOptions, observer: Observer<ViewSnapshot>) -> Self {
        Self {
            query,
            options,
            observer: Arc::new(AsyncObserver::new(observer)),
            raised_initial_event: false,
            snapshot: None,
            online_state: OnlineState::Unknown,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Returns whether an event was delivered to the observer.
    pub fn on_view_snapshot(&mut self, snapshot: ViewSnapshot) -> bool {
        let snapshot = if self.options.include_metadata_changes {
            snapshot
        } else {
            let mut filtered = snapshot;
            filtered
                .doc_changes
                .retain(|change| change.change_type != ChangeType::Metadata);
            filtered.excludes_metadata_changes = true;
            filtered
        };

        let mut raised = false;
        if !self.raised_initial_event {
            if self.should_raise_initial_event(&snapshot, self.online_state) {
                self.raise_initial_event(&snapshot);
                raised = true;
            }
        } else if self.should_raise_event(&snapshot) {
            self.observer.next(&snapshot);
            raised = true;
        }
        self.snapshot = Some(snapshot);
        raised
    }

    pub fn on_error(&self, error: &FirestoreError) {
        self.observer.error(error);
    }

    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> bool {
        self.online_state = online_state;
        let Some(snapshot) = self.snapshot.clone() else {
            return false;
        };
        if !self.raised_initial_event && self.should_raise_initial_event(&snapshot, online_state) {
            self.raise_initial_event(&snapshot);
            return true;
        }
        false
    }

    /// Stops delivery of events that were already on their way.
    pub(crate) fn mute(&self) {
        self.observer.mute();
    }

    /// Handle that mutes this listener from outside the event manager.
    pub(crate) fn observer_handle(&self) -> Arc<AsyncObserver<ViewSnapshot>> {
        Arc::clone(&self.observer)
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache {
            return true;
        }
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        // An empty cached result is only worth raising once we know we are offline.
        !snapshot.docs.is_empty() || snapshot.has_cached_results || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.doc_changes.is_empty() {
            return true;
        }
        let pending_writes_changed = self
            .snapshot
            .as_ref()
            .map_or(false, |previous| previous.has_pending_writes() != snapshot.has_pending_writes());
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }

    fn raise_initial_event(&mut self, snapshot: &ViewSnapshot) {
        let initial = ViewSnapshot::from_initial_documents(
            snapshot.query.clone(),
            snapshot.docs.clone(),
            snapshot.mutated_keys.clone(),
            snapshot.from_cache,
            snapshot.has_cached_results,
        );
        self.raised_initial_event = true;
        self.observer.next(&initial);
    }
}

struct QueryListeners {
    view_snapshot: Option<ViewSnapshot>,
    listeners: Vec<(ListenerId, QueryListener)>,
}

#[derive(Default)]
struct EventManagerState {
    queries: BTreeMap<String, QueryListeners>,
    online_state: Option<OnlineState>,
    next_listener_id: ListenerId,
}

/// Outcome of [`EventManager::add_listener`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddedListener {
    pub id: ListenerId,
    /// The query had no listener before; the caller must start listening
    /// in the sync engine.
    pub first_for_query: bool,
}

/// Fans view snapshots out to the listeners of each query, keyed by the
/// query's canonical id.
#[derive(Default)]
pub struct EventManager {
    state: Mutex<EventManagerState>,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, mut listener: QueryListener) -> AddedListener {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let id = state.next_listener_id;
        state.next_listener_id += 1;
        let online_state = state.online_state.unwrap_or(OnlineState::Unknown);

        let canonical_id = listener.query().canonical_id();
        let entry = state
            .queries
            .entry(canonical_id)
            .or_insert_with(|| QueryListeners {
                view_snapshot: None,
                listeners: Vec::new(),
            });
        let first_for_query = entry.listeners.is_empty();

        listener.apply_online_state_change(online_state);
        if let Some(snapshot) = entry.view_snapshot.clone() {
            listener.on_view_snapshot(snapshot);
        }
        entry.listeners.push((id, listener));
        AddedListener { id, first_for_query }
    }

    /// Returns true when `id` was the last listener of `query`, in which
    /// case the caller must stop listening in the sync engine.
    pub fn remove_listener(&self, query: &Query, id: ListenerId) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let canonical_id = query.canonical_id();
        let Some(entry) = state.queries.get_mut(&canonical_id) else {
            return false;
        };
        let Some(position) = entry.listeners.iter().position(|(listener_id, _)| *listener_id == id) else {
            return false;
        };
        let (_, listener) = entry.listeners.remove(position);
        listener.mute();
        if entry.listeners.is_empty() {
            state.queries.remove(&canonical_id);
            return true;
        }
        false
    }

    pub fn listener_count(&self, query: &Query) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .queries
            .get(&query.canonical_id())
            .map_or(0, |entry| entry.listeners.len())
    }

    pub fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        for snapshot in snapshots {
            let Some(entry) = state.queries.get_mut(&snapshot.query.canonical_id()) else {
                continue;
            };
            for (_, listener) in entry.listeners.iter_mut() {
                listener.on_view_snapshot(snapshot.clone());
            }
            entry.view_snapshot = Some(snapshot);
        }
    }

    /// Delivers `error` to every listener of `query` and forgets the query.
    pub fn on_watch_error(&self, query: &Query, error: &FirestoreError) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = state.queries.remove(&query.canonical_id()) {
            for (_, listener) in entry.listeners.iter() {
                listener.on_error(error);
            }
        }
    }

    pub fn on_online_state_change(&self, online_state: OnlineState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.online_state = Some(online_state);
        for entry in state.queries.values_mut() {
            for (_, listener) in entry.listeners.iter_mut() {
                listener.apply_online_state_change(online_state);
            }
        }
    }
}
