use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::firestore::collection::{DocumentKeySet, MutableDocumentMap};
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{DatabaseId, DocumentKey, MutableDocument, SnapshotVersion, TargetId};
use crate::firestore::remote::bloom_filter::BloomFilter;
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::watch_change::{
    DocumentWatchChange, ExistenceFilterChange, TargetChangeState, WatchChange, WatchTargetChange,
};
use crate::util::hard_assert;

const LOG_TARGET: &str = "firestore::watch";

/// Read access to the targets the aggregator reasons about.
pub trait TargetMetadataProvider: Send + Sync {
    /// Keys the cache currently associates with `target_id`.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet;

    /// `None` when the target is no longer listened to.
    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData>;
}

/// Outcome of checking an existence filter mismatch against its bloom filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BloomFilterApplication {
    /// Removing the keys absent from the filter reconciled the count.
    Success,
    /// The count still differs, so the filter produced false positives.
    FalsePositive,
    /// No usable filter was sent.
    Skipped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChangeType {
    Added,
    Modified,
    Removed,
}

/// Accumulated changes for one target since the last remote event.
struct TargetState {
    /// Outstanding add/remove requests; changes are ignored while non-zero.
    pending_responses: i32,
    document_changes: BTreeMap<DocumentKey, ChangeType>,
    resume_token: Vec<u8>,
    current: bool,
    has_pending_changes: bool,
}

impl TargetState {
    fn new() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: Vec::new(),
            current: false,
            // Starts dirty so a freshly added target is reported.
            has_pending_changes: true,
        }
    }

    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, resume_token: &[u8]) {
        if !resume_token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = resume_token.to_vec();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..TargetChange::default()
        };
        for (key, change_type) in &self.document_changes {
            match change_type {
                ChangeType::Added => change.added_documents = change.added_documents.insert(key.clone()),
                ChangeType::Modified => {
                    change.modified_documents = change.modified_documents.insert(key.clone())
                }
                ChangeType::Removed => {
                    change.removed_documents = change.removed_documents.insert(key.clone())
                }
            }
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: ChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn record_pending_target_request(&mut self) {
        self.pending_responses += 1;
    }

    fn record_target_response(&mut self) {
        self.pending_responses -= 1;
        hard_assert(
            self.pending_responses >= 0,
            "Target state received a response without a pending request",
        );
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Folds watch stream frames into [`RemoteEvent`]s.
pub struct WatchChangeAggregator {
    serializer: JsonProtoSerializer,
    metadata: Arc<dyn TargetMetadataProvider>,
    target_states: BTreeMap<TargetId, TargetState>,
    pending_document_updates: MutableDocumentMap,
    /// Targets each pending key was last seen in; drives limbo resolution.
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeMap<TargetId, TargetPurpose>,
}

impl WatchChangeAggregator {
    pub fn new(database_id: DatabaseId, metadata: Arc<dyn TargetMetadataProvider>) -> Self {
        Self {
            serializer: JsonProtoSerializer::new(database_id),
            metadata,
            target_states: BTreeMap::new(),
            pending_document_updates: MutableDocumentMap::new(),
            pending_document_target_mapping: BTreeMap::new(),
            pending_target_resets: BTreeMap::new(),
        }
    }

    pub fn handle_watch_change(&mut self, change: WatchChange) {
        match change {
            WatchChange::TargetChange(change) => self.handle_target_change(change),
            WatchChange::DocumentChange(change) => self.handle_document_change(change),
            WatchChange::ExistenceFilter(change) => self.handle_existence_filter(change),
        }
    }

    pub fn handle_document_change(&mut self, change: DocumentWatchChange) {
        for target_id in &change.updated_target_ids {
            match &change.document {
                Some(document) if document.is_found_document() => {
                    self.add_document_to_target(*target_id, document.clone());
                }
                _ => self.remove_document_from_target(
                    *target_id,
                    change.key.clone(),
                    change.document.clone(),
                ),
            }
        }
        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(*target_id, change.key.clone(), change.document.clone());
        }
    }

    pub fn handle_target_change(&mut self, change: WatchTargetChange) {
        for target_id in self.target_ids_for_change(&change) {
            match change.state {
                TargetChangeState::NoChange => {
                    if self.is_active_target(target_id) {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Add => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        // A re-added target starts over.
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                TargetChangeState::Remove => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                    hard_assert(
                        change.cause.is_none(),
                        "WatchChangeAggregator does not handle errored targets",
                    );
                }
                TargetChangeState::Current => {
                    if self.is_active_target(target_id) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Reset => {
                    if self.is_active_target(target_id) {
                        self.reset_target(target_id);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    /// An empty id list addresses every known target.
    fn target_ids_for_change(&self, change: &WatchTargetChange) -> Vec<TargetId> {
        if change.target_ids.is_empty() {
            self.target_states.keys().copied().collect()
        } else {
            change.target_ids.clone()
        }
    }

    pub fn handle_existence_filter(&mut self, change: ExistenceFilterChange) {
        let target_id = change.target_id;
        let expected_count = change.filter.count;
        let Some(target_data) = self.target_data_for_active_target(target_id) else {
            return;
        };

        if target_data.target.is_document_target() {
            if expected_count == 0 {
                // The single document is gone; synthesize its delete.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path.clone()) {
                    let deleted = MutableDocument::new_no_document(key.clone(), SnapshotVersion::min());
                    self.remove_document_from_target(target_id, key, Some(deleted));
                }
            } else {
                hard_assert(
                    expected_count == 1,
                    format!("Single document existence filter with count: {expected_count}"),
                );
            }
            return;
        }

        let current_count = self.current_document_count_for_target(target_id);
        if current_count == expected_count as i64 {
            return;
        }
        log::debug!(
            target: LOG_TARGET,
            "existence filter mismatch for target {target_id}: expected {expected_count}, have {current_count}"
        );
        let application = self.apply_bloom_filter(&change, current_count);
        if application != BloomFilterApplication::Success {
            self.reset_target(target_id);
            let purpose = if application == BloomFilterApplication::FalsePositive {
                TargetPurpose::ExistenceFilterMismatchBloom
            } else {
                TargetPurpose::ExistenceFilterMismatch
            };
            self.pending_target_resets.insert(target_id, purpose);
        }
    }

    fn apply_bloom_filter(
        &mut self,
        change: &ExistenceFilterChange,
        current_count: i64,
    ) -> BloomFilterApplication {
        let Some(payload) = &change.filter.unchanged_names else {
            return BloomFilterApplication::Skipped;
        };
        let bloom_filter = match BloomFilter::from_payload(payload) {
            Ok(filter) => filter,
            Err(err) => {
                log::warn!(
                    target: LOG_TARGET,
                    "applying bloom filter failed ({err}); falling back to a full re-query"
                );
                return BloomFilterApplication::Skipped;
            }
        };
        if bloom_filter.bit_count() == 0 {
            return BloomFilterApplication::Skipped;
        }

        let removed = self.filter_removed_documents(&bloom_filter, change.target_id);
        if change.filter.count as i64 == current_count - removed {
            BloomFilterApplication::Success
        } else {
            BloomFilterApplication::FalsePositive
        }
    }

    /// Removes every cached key the filter rules out and returns how many.
    fn filter_removed_documents(&mut self, bloom_filter: &BloomFilter, target_id: TargetId) -> i64 {
        let existing_keys = self.metadata.get_remote_keys_for_target(target_id);
        let mut removed = 0;
        for key in existing_keys.iter() {
            let name = self.serializer.document_name(key);
            if !bloom_filter.might_contain(&name) {
                self.remove_document_from_target(target_id, key.clone(), None);
                removed += 1;
            }
        }
        removed
    }

    /// Drains the accumulated state into an event at `snapshot_version`.
    pub fn create_remote_event(&mut self, snapshot_version: SnapshotVersion) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();

        let target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();
        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(target_id) else {
                continue;
            };
            let current = self
                .target_states
                .get(&target_id)
                .map_or(false, |state| state.current);
            if current && target_data.target.is_document_target() {
                // A current document target without the document proves it
                // does not exist.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path.clone()) {
                    if !self.pending_document_updates.contains_key(&key)
                        && !self.target_contains_document(target_id, &key)
                    {
                        let deleted = MutableDocument::new_no_document(key.clone(), snapshot_version);
                        self.remove_document_from_target(target_id, key, Some(deleted));
                    }
                }
            }

            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let mut resolved_limbo_documents = DocumentKeySet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo_targets = targets.iter().all(|target_id| {
                self.target_data_for_active_target(*target_id)
                    .map_or(true, |data| data.purpose == TargetPurpose::LimboResolution)
            });
            if only_limbo_targets {
                resolved_limbo_documents = resolved_limbo_documents.insert(key.clone());
            }
        }

        let mut document_updates = std::mem::take(&mut self.pending_document_updates);
        for document in document_updates.values_mut() {
            document.set_read_time(snapshot_version);
        }

        self.pending_document_target_mapping.clear();
        RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        }
    }

    fn add_document_to_target(&mut self, target_id: TargetId, document: MutableDocument) {
        if !self.is_active_target(target_id) {
            return;
        }
        let key = document.key().clone();
        let change_type = if self.target_contains_document(target_id, &key) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), change_type);
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        self.pending_document_updates.insert(key, document);
    }

    /// `updated_document` is recorded when the removal carries new state,
    /// such as a delete.
    fn remove_document_from_target(
        &mut self,
        target_id: TargetId,
        key: DocumentKey,
        updated_document: Option<MutableDocument>,
    ) {
        if !self.is_active_target(target_id) {
            return;
        }
        let contained = self.target_contains_document(target_id, &key);
        let state = self.ensure_target_state(target_id);
        if contained {
            state.add_document_change(key.clone(), ChangeType::Removed);
        } else {
            // Added and removed within one event; nothing to report.
            state.remove_document_change(&key);
        }
        // The key is still recorded against the target so that a removal from
        // a listen target never counts as a resolved limbo document.
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(document) = updated_document {
            self.pending_document_updates.insert(key, document);
        }
    }

    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    /// Called when a listen or unlisten request is sent; responses until the
    /// matching ack are for the old incarnation and get ignored.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id)
            .record_pending_target_request();
    }

    fn current_document_count_for_target(&self, target_id: TargetId) -> i64 {
        let mut count = self.metadata.get_remote_keys_for_target(target_id).len() as i64;
        if let Some(state) = self.target_states.get(&target_id) {
            for change_type in state.document_changes.values() {
                match change_type {
                    ChangeType::Added => count += 1,
                    ChangeType::Removed => count -= 1,
                    ChangeType::Modified => {}
                }
            }
        }
        count
    }

    /// Forgets accumulated changes and schedules removal of every cached key,
    /// as if the target were newly added.
    fn reset_target(&mut self, target_id: TargetId) {
        hard_assert(
            self.target_states
                .get(&target_id)
                .map_or(true, |state| !state.is_pending()),
            "Should only reset active targets",
        );
        self.target_states.insert(target_id, TargetState::new());
        let existing_keys = self.metadata.get_remote_keys_for_target(target_id);
        for key in existing_keys.iter() {
            self.remove_document_from_target(target_id, key.clone(), None);
        }
    }

    fn target_contains_document(&self, target_id: TargetId, key: &DocumentKey) -> bool {
        self.metadata
            .get_remote_keys_for_target(target_id)
            .contains(key)
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states
            .entry(target_id)
            .or_insert_with(TargetState::new)
    }

    fn is_active_target(&self, target_id: TargetId) -> bool {
        self.target_data_for_active_target(target_id).is_some()
    }

    fn target_data_for_active_target(&self, target_id: TargetId) -> Option<TargetData> {
        match self.target_states.get(&target_id) {
            Some(state) if state.is_pending() => None,
            _ => self.metadata.get_target_data_for_target(target_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::target::Target;
    use crate::firestore::remote::watch_change::{BloomFilterPayload, ExistenceFilter};
    use crate::test_support::{doc, key, map, query, version};
    use std::sync::Mutex;

    #[derive(Default)]
    struct TestMetadata {
        remote_keys: Mutex<BTreeMap<TargetId, DocumentKeySet>>,
        targets: Mutex<BTreeMap<TargetId, TargetData>>,
    }

    impl TestMetadata {
        fn listen(&self, target_id: TargetId, target: Target, purpose: TargetPurpose) {
            self.targets
                .lock()
                .unwrap()
                .insert(target_id, TargetData::new(target, target_id, purpose, 0));
        }

        fn set_keys(&self, target_id: TargetId, keys: &[&str]) {
            self.remote_keys
                .lock()
                .unwrap()
                .insert(target_id, keys.iter().map(|path| key(path)).collect());
        }
    }

    impl TargetMetadataProvider for TestMetadata {
        fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
            self.remote_keys
                .lock()
                .unwrap()
                .get(&target_id)
                .cloned()
                .unwrap_or_default()
        }

        fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
            self.targets.lock().unwrap().get(&target_id).cloned()
        }
    }

    fn aggregator(metadata: &Arc<TestMetadata>) -> WatchChangeAggregator {
        WatchChangeAggregator::new(DatabaseId::default("p"), Arc::clone(metadata) as Arc<_>)
    }

    fn target_change(state: TargetChangeState, target_ids: Vec<TargetId>) -> WatchTargetChange {
        WatchTargetChange {
            state,
            target_ids,
            resume_token: Vec::new(),
            read_time: SnapshotVersion::min(),
            cause: None,
        }
    }

    fn added(path: &str, target_id: TargetId) -> DocumentWatchChange {
        DocumentWatchChange {
            updated_target_ids: vec![target_id],
            removed_target_ids: Vec::new(),
            key: key(path),
            document: Some(doc(path, 1, map(&[]))),
        }
    }

    #[test]
    fn aggregates_document_changes() {
        let metadata = Arc::new(TestMetadata::default());
        metadata.listen(2, query("rooms").to_target(), TargetPurpose::Listen);
        metadata.set_keys(2, &["rooms/b"]);
        let mut aggregator = aggregator(&metadata);

        aggregator.handle_document_change(added("rooms/a", 2));
        aggregator.handle_document_change(added("rooms/b", 2));
        aggregator.handle_target_change(WatchTargetChange {
            resume_token: vec![9],
            ..target_change(TargetChangeState::Current, vec![2])
        });

        let event = aggregator.create_remote_event(version(3));
        let change = &event.target_changes[&2];
        assert!(change.current);
        assert_eq!(change.resume_token, vec![9]);
        assert!(change.added_documents.contains(&key("rooms/a")));
        assert!(change.modified_documents.contains(&key("rooms/b")));
        assert_eq!(event.document_updates[&key("rooms/a")].read_time(), version(3));
        assert!(event.resolved_limbo_documents.is_empty());
    }

    #[test]
    fn ignores_changes_while_target_request_pending() {
        let metadata = Arc::new(TestMetadata::default());
        metadata.listen(2, query("rooms").to_target(), TargetPurpose::Listen);
        let mut aggregator = aggregator(&metadata);

        aggregator.record_pending_target_request(2);
        aggregator.handle_document_change(added("rooms/a", 2));
        assert!(aggregator.create_remote_event(version(1)).document_updates.is_empty());

        aggregator.handle_target_change(target_change(TargetChangeState::Add, vec![2]));
        aggregator.handle_document_change(added("rooms/a", 2));
        let event = aggregator.create_remote_event(version(2));
        assert!(event.target_changes[&2].added_documents.contains(&key("rooms/a")));
    }

    #[test]
    fn bloom_filter_evicts_only_missing_keys() {
        let metadata = Arc::new(TestMetadata::default());
        metadata.listen(2, query("rooms").to_target(), TargetPurpose::Listen);
        metadata.set_keys(2, &["rooms/a", "rooms/b", "rooms/c"]);
        let mut aggregator = aggregator(&metadata);

        // Bitmap built from rooms/a and rooms/c.
        aggregator.handle_existence_filter(ExistenceFilterChange {
            target_id: 2,
            filter: ExistenceFilter {
                count: 2,
                unchanged_names: Some(BloomFilterPayload {
                    bitmap: "IAAQAgAoCAQCACACAA==".to_string(),
                    padding: 4,
                    hash_count: 5,
                }),
            },
        });

        let event = aggregator.create_remote_event(version(4));
        assert!(event.target_mismatches.is_empty());
        let change = &event.target_changes[&2];
        assert_eq!(
            change.removed_documents.iter().cloned().collect::<Vec<_>>(),
            vec![key("rooms/b")]
        );
        assert!(event.resolved_limbo_documents.is_empty());
    }

    #[test]
    fn only_limbo_targets_resolve_limbo_documents() {
        let metadata = Arc::new(TestMetadata::default());
        metadata.listen(2, query("rooms").to_target(), TargetPurpose::Listen);
        metadata.listen(1, Target::for_document(&key("rooms/b")), TargetPurpose::LimboResolution);
        metadata.set_keys(2, &["rooms/a"]);
        let mut aggregator = aggregator(&metadata);

        aggregator.handle_document_change(DocumentWatchChange {
            updated_target_ids: Vec::new(),
            removed_target_ids: vec![2],
            key: key("rooms/a"),
            document: None,
        });
        aggregator.handle_document_change(added("rooms/b", 1));

        let event = aggregator.create_remote_event(version(4));
        assert!(event.target_changes[&2].removed_documents.contains(&key("rooms/a")));
        assert_eq!(
            event.resolved_limbo_documents.iter().cloned().collect::<Vec<_>>(),
            vec![key("rooms/b")]
        );
    }

    #[test]
    fn corrupt_bloom_filter_falls_back_to_requery() {
        let metadata = Arc::new(TestMetadata::default());
        metadata.listen(2, query("rooms").to_target(), TargetPurpose::Listen);
        metadata.set_keys(2, &["rooms/a", "rooms/b"]);
        let mut aggregator = aggregator(&metadata);

        aggregator.handle_existence_filter(ExistenceFilterChange {
            target_id: 2,
            filter: ExistenceFilter {
                count: 1,
                unchanged_names: Some(BloomFilterPayload {
                    bitmap: "%%%".to_string(),
                    padding: 0,
                    hash_count: 1,
                }),
            },
        });

        let event = aggregator.create_remote_event(version(4));
        assert_eq!(
            event.target_mismatches.get(&2),
            Some(&TargetPurpose::ExistenceFilterMismatch)
        );
        assert_eq!(event.target_changes[&2].removed_documents.len(), 2);
    }

    #[test]
    fn current_document_target_without_document_resolves_limbo() {
        let metadata = Arc::new(TestMetadata::default());
        metadata.listen(1, Target::for_document(&key("rooms/a")), TargetPurpose::LimboResolution);
        let mut aggregator = aggregator(&metadata);

        aggregator.handle_target_change(target_change(TargetChangeState::Current, vec![1]));
        let event = aggregator.create_remote_event(version(5));

        let document = &event.document_updates[&key("rooms/a")];
        assert!(document.is_no_document());
        assert_eq!(document.version(), version(5));
        assert!(event.resolved_limbo_documents.contains(&key("rooms/a")));
    }
}
