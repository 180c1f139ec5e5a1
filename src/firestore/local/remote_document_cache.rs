use crate::firestore::collection::{DocumentKeySet, MutableDocumentMap, SortedMap};
use crate::firestore::local::persistence::PersistenceWrite;
use crate::firestore::model::{DocumentKey, MutableDocument, ResourcePath, SnapshotVersion};

/// Last known server state of every cached document, keyed by document key.
#[derive(Clone, Debug, Default)]
pub struct RemoteDocumentCache {
    documents: SortedMap<DocumentKey, MutableDocument>,
    changes: Vec<PersistenceWrite>,
}

impl RemoteDocumentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Stores `document` with its read time. Invalid documents are never stored.
    pub fn add_entry(&mut self, document: MutableDocument, read_time: SnapshotVersion) {
        debug_assert!(!document.is_invalid_document());
        let mut document = document;
        document.set_read_time(read_time);
        self.changes
            .push(PersistenceWrite::PutRemoteDocument(document.clone()));
        self.documents = self.documents.insert(document.key().clone(), document);
    }

    pub fn remove_entry(&mut self, key: &DocumentKey) {
        if self.documents.contains_key(key) {
            self.changes
                .push(PersistenceWrite::RemoveRemoteDocument(key.clone()));
            self.documents = self.documents.remove(key);
        }
    }

    /// Cached state of `key`, or an invalid document when it was never seen.
    pub fn get_entry(&self, key: &DocumentKey) -> MutableDocument {
        self.documents
            .get(key)
            .map(MutableDocument::mutable_copy)
            .unwrap_or_else(|| MutableDocument::new_invalid_document(key.clone()))
    }

    pub fn get_entries(&self, keys: &DocumentKeySet) -> MutableDocumentMap {
        keys.iter()
            .map(|key| (key.clone(), self.get_entry(key)))
            .collect()
    }

    /// Documents directly inside `collection` read after `since_read_time`.
    pub fn get_documents_in_collection(
        &self,
        collection: &ResourcePath,
        since_read_time: SnapshotVersion,
    ) -> MutableDocumentMap {
        let mut results = MutableDocumentMap::new();
        let Ok(start) = DocumentKey::from_path(collection.child([""])) else {
            return results;
        };
        for (key, document) in self.documents.iter_from(&start) {
            if !collection.is_prefix_of(key.path()) {
                break;
            }
            if key.path().len() != collection.len() + 1 {
                continue;
            }
            if document.read_time() <= since_read_time {
                continue;
            }
            results.insert(key.clone(), document.mutable_copy());
        }
        results
    }

    pub fn iter(&self) -> impl Iterator<Item = &MutableDocument> {
        self.documents.values()
    }

    pub(crate) fn take_changes(&mut self) -> Vec<PersistenceWrite> {
        std::mem::take(&mut self.changes)
    }

    /// Rebuilds the cache from persisted documents without recording writes.
    pub(crate) fn restore(documents: impl IntoIterator<Item = MutableDocument>) -> Self {
        Self {
            documents: documents
                .into_iter()
                .map(|document| (document.key().clone(), document))
                .collect(),
            changes: Vec::new(),
        }
    }
}
