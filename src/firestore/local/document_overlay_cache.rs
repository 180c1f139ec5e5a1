use std::collections::BTreeMap;

use crate::firestore::collection::{DocumentKeySet, OverlayMap, SortedMap};
use crate::firestore::local::persistence::PersistenceWrite;
use crate::firestore::model::{BatchId, DocumentKey, Mutation, Overlay, ResourcePath};

/// Net pending mutation per document for one user, plus an index from the
/// batch that produced each overlay.
#[derive(Clone, Debug)]
pub struct DocumentOverlayCache {
    user_key: String,
    overlays: SortedMap<DocumentKey, Overlay>,
    overlay_by_batch_id: SortedMap<BatchId, DocumentKeySet>,
    changes: Vec<PersistenceWrite>,
}

impl DocumentOverlayCache {
    pub fn new(user_key: impl Into<String>) -> Self {
        Self {
            user_key: user_key.into(),
            overlays: SortedMap::new(),
            overlay_by_batch_id: SortedMap::new(),
            changes: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.overlays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overlays.is_empty()
    }

    pub fn get_overlay(&self, key: &DocumentKey) -> Option<&Overlay> {
        self.overlays.get(key)
    }

    pub fn get_overlays(&self, keys: &DocumentKeySet) -> OverlayMap {
        keys.iter()
            .filter_map(|key| {
                self.overlays
                    .get(key)
                    .map(|overlay| (key.clone(), overlay.clone()))
            })
            .collect()
    }

    /// Replaces the overlays of the given keys with ones attributed to `largest_batch_id`.
    pub fn save_overlays(&mut self, largest_batch_id: BatchId, overlays: BTreeMap<DocumentKey, Mutation>) {
        for (_, mutation) in overlays {
            self.save_overlay(largest_batch_id, mutation);
        }
    }

    fn save_overlay(&mut self, largest_batch_id: BatchId, mutation: Mutation) {
        let key = mutation.key.clone();
        self.detach_from_batch(&key);
        let overlay = Overlay::new(largest_batch_id, mutation);
        self.changes.push(PersistenceWrite::PutOverlay {
            user: self.user_key.clone(),
            overlay: overlay.clone(),
        });
        self.index_overlay(overlay);
    }

    fn index_overlay(&mut self, overlay: Overlay) {
        let key = overlay.key().clone();
        let batch_id = overlay.largest_batch_id;
        let keys = self
            .overlay_by_batch_id
            .get(&batch_id)
            .cloned()
            .unwrap_or_default()
            .insert(key.clone());
        self.overlay_by_batch_id = self.overlay_by_batch_id.insert(batch_id, keys);
        self.overlays = self.overlays.insert(key, overlay);
    }

    fn detach_from_batch(&mut self, key: &DocumentKey) {
        let Some(existing) = self.overlays.get(key) else {
            return;
        };
        let batch_id = existing.largest_batch_id;
        if let Some(keys) = self.overlay_by_batch_id.get(&batch_id) {
            let remaining = keys.remove(key);
            self.overlay_by_batch_id = if remaining.is_empty() {
                self.overlay_by_batch_id.remove(&batch_id)
            } else {
                self.overlay_by_batch_id.insert(batch_id, remaining)
            };
        }
    }

    /// Drops the overlays last produced by `batch_id`.
    pub fn remove_overlays_for_batch_id(&mut self, batch_id: BatchId) {
        let Some(keys) = self.overlay_by_batch_id.get(&batch_id).cloned() else {
            return;
        };
        for key in keys.iter() {
            self.overlays = self.overlays.remove(key);
            self.changes.push(PersistenceWrite::RemoveOverlay {
                user: self.user_key.clone(),
                key: key.clone(),
            });
        }
        self.overlay_by_batch_id = self.overlay_by_batch_id.remove(&batch_id);
    }

    /// Overlays of documents directly inside `collection` produced after `since_batch_id`.
    pub fn get_overlays_for_collection(
        &self,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> OverlayMap {
        let mut results = OverlayMap::new();
        let Ok(start) = DocumentKey::from_path(collection.child([""])) else {
            return results;
        };
        for (key, overlay) in self.overlays.iter_from(&start) {
            if !collection.is_prefix_of(key.path()) {
                break;
            }
            if key.path().len() == collection.len() + 1 && overlay.largest_batch_id > since_batch_id {
                results.insert(key.clone(), overlay.clone());
            }
        }
        results
    }

    /// Overlays in any collection named `collection_group`, whole batches at a
    /// time in batch order, stopping once `count` overlays were collected.
    pub fn get_overlays_for_collection_group(
        &self,
        collection_group: &str,
        since_batch_id: BatchId,
        count: usize,
    ) -> OverlayMap {
        let mut results = OverlayMap::new();
        for (_, keys) in self.overlay_by_batch_id.iter_from(&since_batch_id.saturating_add(1)) {
            for key in keys.iter() {
                if key.has_collection_id(collection_group) {
                    if let Some(overlay) = self.overlays.get(key) {
                        results.insert(key.clone(), overlay.clone());
                    }
                }
            }
            if results.len() >= count {
                break;
            }
        }
        results
    }

    pub(crate) fn take_changes(&mut self) -> Vec<PersistenceWrite> {
        std::mem::take(&mut self.changes)
    }

    pub(crate) fn restore(user_key: impl Into<String>, overlays: impl IntoIterator<Item = Overlay>) -> Self {
        let mut cache = Self::new(user_key);
        for overlay in overlays {
            let key = overlay.key().clone();
            cache.detach_from_batch(&key);
            cache.index_overlay(overlay);
        }
        cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::value::FirestoreValue;
    use crate::test_support::{delete_mutation, key, map, set_mutation};

    fn overlays(entries: &[&str]) -> BTreeMap<DocumentKey, Mutation> {
        entries
            .iter()
            .map(|path| (key(path), set_mutation(path, map(&[("v", FirestoreValue::from_integer(1))]))))
            .collect()
    }

    #[test]
    fn newer_overlay_replaces_older_one() {
        let mut cache = DocumentOverlayCache::new("alice");
        cache.save_overlays(1, overlays(&["rooms/a", "rooms/b"]));
        cache.save_overlays(2, [(key("rooms/a"), delete_mutation("rooms/a"))].into_iter().collect());

        assert_eq!(cache.get_overlay(&key("rooms/a")).unwrap().largest_batch_id, 2);

        cache.remove_overlays_for_batch_id(1);
        assert!(cache.get_overlay(&key("rooms/b")).is_none());
        assert!(cache.get_overlay(&key("rooms/a")).is_some());

        cache.remove_overlays_for_batch_id(2);
        assert!(cache.is_empty());
    }

    #[test]
    fn collection_queries_respect_batch_offset() {
        let mut cache = DocumentOverlayCache::new("alice");
        cache.save_overlays(1, overlays(&["rooms/a", "rooms/a/msgs/1"]));
        cache.save_overlays(3, overlays(&["rooms/b", "halls/x/rooms/c"]));

        let rooms = ResourcePath::from_string("rooms").unwrap();
        assert_eq!(cache.get_overlays_for_collection(&rooms, -1).len(), 2);
        assert_eq!(cache.get_overlays_for_collection(&rooms, 1).len(), 1);

        let group = cache.get_overlays_for_collection_group("rooms", -1, 100);
        assert_eq!(group.len(), 3);
    }
}
