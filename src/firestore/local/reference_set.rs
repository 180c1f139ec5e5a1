use crate::firestore::collection::{DocumentKeySet, SortedSet};
use crate::firestore::model::DocumentKey;

/// Many-to-many references between document keys and integer ids (target
/// ids or batch ids), indexed in both directions.
#[derive(Clone, Debug, Default)]
pub struct ReferenceSet {
    by_key: SortedSet<(DocumentKey, i32)>,
    by_id: SortedSet<(i32, DocumentKey)>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn add_reference(&mut self, key: DocumentKey, id: i32) {
        self.by_key = self.by_key.insert((key.clone(), id));
        self.by_id = self.by_id.insert((id, key));
    }

    pub fn add_references(&mut self, keys: &DocumentKeySet, id: i32) {
        for key in keys.iter() {
            self.add_reference(key.clone(), id);
        }
    }

    pub fn remove_reference(&mut self, key: &DocumentKey, id: i32) {
        self.by_key = self.by_key.remove(&(key.clone(), id));
        self.by_id = self.by_id.remove(&(id, key.clone()));
    }

    pub fn remove_references(&mut self, keys: &DocumentKeySet, id: i32) {
        for key in keys.iter() {
            self.remove_reference(key, id);
        }
    }

    /// Drops every reference held by `id` and returns the keys it referenced.
    pub fn remove_references_for_id(&mut self, id: i32) -> DocumentKeySet {
        let keys = self.references_for_id(id);
        for key in keys.iter() {
            self.remove_reference(key, id);
        }
        keys
    }

    pub fn remove_all_references(&mut self) {
        self.by_key = SortedSet::new();
        self.by_id = SortedSet::new();
    }

    pub fn references_for_id(&self, id: i32) -> DocumentKeySet {
        let start = (id, minimal_key());
        self.by_id
            .iter_from(&start)
            .take_while(|(candidate, _)| *candidate == id)
            .map(|(_, key)| key.clone())
            .collect()
    }

    /// Ids referencing `key`.
    pub fn ids_for_key(&self, key: &DocumentKey) -> Vec<i32> {
        self.by_key
            .iter_from(&(key.clone(), i32::MIN))
            .take_while(|(candidate, _)| candidate == key)
            .map(|(_, id)| *id)
            .collect()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key
            .iter_from(&(key.clone(), i32::MIN))
            .next()
            .map_or(false, |(candidate, _)| candidate == key)
    }
}

/// Sorts before every real key: the empty path.
fn minimal_key() -> DocumentKey {
    DocumentKey::empty()
}
