use crate::firestore::collection::{DocumentKeySet, SortedMap};
use crate::firestore::core::target::Target;
use crate::firestore::core::target_id_generator::TargetIdGenerator;
use crate::firestore::local::persistence::{PersistenceWrite, TargetGlobals};
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::{DocumentKey, ListenSequenceNumber, SnapshotVersion, TargetId};
use crate::util::hard_assert;

/// Persisted targets, the documents each one matches on the server, and the
/// global listen metadata.
#[derive(Clone, Debug, Default)]
pub struct TargetCache {
    targets: SortedMap<TargetId, TargetData>,
    target_ids_by_canonical_id: SortedMap<String, TargetId>,
    references: ReferenceSet,
    globals: TargetGlobals,
    changes: Vec<PersistenceWrite>,
}

impl TargetCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    pub fn highest_target_id(&self) -> TargetId {
        self.globals.highest_target_id
    }

    pub fn highest_sequence_number(&self) -> ListenSequenceNumber {
        self.globals.highest_listen_sequence_number
    }

    pub fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.globals.last_remote_snapshot_version
    }

    pub fn set_last_remote_snapshot_version(&mut self, version: SnapshotVersion) {
        self.globals.last_remote_snapshot_version = version;
        self.record_globals();
    }

    /// Next even target id above every id allocated so far.
    pub fn allocate_target_id(&mut self) -> TargetId {
        let mut generator = TargetIdGenerator::for_target_cache(self.globals.highest_target_id);
        let target_id = generator.next();
        self.globals.highest_target_id = target_id;
        self.record_globals();
        target_id
    }

    pub fn next_sequence_number(&mut self) -> ListenSequenceNumber {
        self.globals.highest_listen_sequence_number += 1;
        self.record_globals();
        self.globals.highest_listen_sequence_number
    }

    pub fn get_target_data(&self, target: &Target) -> Option<&TargetData> {
        self.target_ids_by_canonical_id
            .get(&target.canonical_id())
            .and_then(|target_id| self.targets.get(target_id))
            .filter(|data| data.target == *target)
    }

    pub fn get_target_data_by_id(&self, target_id: TargetId) -> Option<&TargetData> {
        self.targets.get(&target_id)
    }

    pub fn add_target_data(&mut self, target_data: TargetData) {
        hard_assert(
            !self.targets.contains_key(&target_data.target_id),
            "Cannot add a target that already exists",
        );
        self.save_target_data(target_data);
    }

    pub fn update_target_data(&mut self, target_data: TargetData) {
        hard_assert(
            self.targets.contains_key(&target_data.target_id),
            "Cannot update a target that does not exist",
        );
        self.save_target_data(target_data);
    }

    fn save_target_data(&mut self, target_data: TargetData) {
        let target_id = target_data.target_id;
        if target_id > self.globals.highest_target_id {
            self.globals.highest_target_id = target_id;
        }
        if target_data.sequence_number > self.globals.highest_listen_sequence_number {
            self.globals.highest_listen_sequence_number = target_data.sequence_number;
        }
        self.record_globals();
        self.target_ids_by_canonical_id = self
            .target_ids_by_canonical_id
            .insert(target_data.target.canonical_id(), target_id);
        self.changes
            .push(PersistenceWrite::PutTarget(target_data.clone()));
        self.targets = self.targets.insert(target_id, target_data);
    }

    /// Removes the target and every document reference it held.
    pub fn remove_target_data(&mut self, target_id: TargetId) {
        let Some(existing) = self.targets.get(&target_id) else {
            return;
        };
        let canonical_id = existing.target.canonical_id();
        if self.target_ids_by_canonical_id.get(&canonical_id) == Some(&target_id) {
            self.target_ids_by_canonical_id = self.target_ids_by_canonical_id.remove(&canonical_id);
        }
        self.remove_matching_keys_for_target_id(target_id);
        self.targets = self.targets.remove(&target_id);
        self.changes.push(PersistenceWrite::RemoveTarget(target_id));
    }

    pub fn add_matching_keys(&mut self, keys: &DocumentKeySet, target_id: TargetId) {
        for key in keys.iter() {
            self.references.add_reference(key.clone(), target_id);
            self.changes.push(PersistenceWrite::AddTargetDocument {
                target_id,
                key: key.clone(),
            });
        }
    }

    pub fn remove_matching_keys(&mut self, keys: &DocumentKeySet, target_id: TargetId) {
        for key in keys.iter() {
            self.references.remove_reference(key, target_id);
            self.changes.push(PersistenceWrite::RemoveTargetDocument {
                target_id,
                key: key.clone(),
            });
        }
    }

    pub fn remove_matching_keys_for_target_id(&mut self, target_id: TargetId) {
        let removed = self.references.remove_references_for_id(target_id);
        for key in removed.iter() {
            self.changes.push(PersistenceWrite::RemoveTargetDocument {
                target_id,
                key: key.clone(),
            });
        }
    }

    pub fn get_matching_keys_for_target_id(&self, target_id: TargetId) -> DocumentKeySet {
        self.references.references_for_id(target_id)
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.references.contains_key(key)
    }

    pub fn targets(&self) -> impl Iterator<Item = &TargetData> {
        self.targets.values()
    }

    fn record_globals(&mut self) {
        // Only the latest globals matter; collapse consecutive updates.
        if let Some(PersistenceWrite::SetTargetGlobals(_)) = self.changes.last() {
            self.changes.pop();
        }
        self.changes
            .push(PersistenceWrite::SetTargetGlobals(self.globals.clone()));
    }

    pub(crate) fn take_changes(&mut self) -> Vec<PersistenceWrite> {
        std::mem::take(&mut self.changes)
    }

    pub(crate) fn restore(
        targets: impl IntoIterator<Item = TargetData>,
        target_documents: impl IntoIterator<Item = (TargetId, DocumentKey)>,
        globals: TargetGlobals,
    ) -> Self {
        let mut cache = Self {
            globals,
            ..Self::default()
        };
        for target_data in targets {
            cache.target_ids_by_canonical_id = cache
                .target_ids_by_canonical_id
                .insert(target_data.target.canonical_id(), target_data.target_id);
            cache.targets = cache.targets.insert(target_data.target_id, target_data);
        }
        for (target_id, key) in target_documents {
            cache.references.add_reference(key, target_id);
        }
        cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::target_data::TargetPurpose;
    use crate::test_support::{key, query};

    #[test]
    fn allocates_even_ids_and_finds_targets_by_canonical_id() {
        let mut cache = TargetCache::new();
        let target = query("rooms").to_target();
        let target_id = cache.allocate_target_id();
        assert_eq!(target_id, 2);
        let sequence_number = cache.next_sequence_number();
        cache.add_target_data(TargetData::new(target.clone(), target_id, TargetPurpose::Listen, sequence_number));

        assert_eq!(cache.get_target_data(&target).unwrap().target_id, 2);
        assert!(cache.get_target_data(&query("halls").to_target()).is_none());
        assert_eq!(cache.allocate_target_id(), 4);
    }

    #[test]
    fn removing_a_target_drops_its_keys() {
        let mut cache = TargetCache::new();
        let target_id = cache.allocate_target_id();
        cache.add_target_data(TargetData::new(query("rooms").to_target(), target_id, TargetPurpose::Listen, 1));
        let keys: DocumentKeySet = [key("rooms/a"), key("rooms/b")].into_iter().collect();
        cache.add_matching_keys(&keys, target_id);
        assert!(cache.contains_key(&key("rooms/a")));

        cache.remove_target_data(target_id);
        assert!(!cache.contains_key(&key("rooms/a")));
        assert_eq!(cache.target_count(), 0);
        assert_eq!(cache.highest_target_id(), 2);
    }
}
