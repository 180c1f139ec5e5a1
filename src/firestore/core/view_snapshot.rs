use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use crate::firestore::collection::{DocumentKeySet, DocumentMap};
use crate::firestore::core::query::Query;
use crate::firestore::model::{DocumentKey, MutableDocument};
use crate::util::fail;

pub type DocumentComparator =
    Arc<dyn Fn(&MutableDocument, &MutableDocument) -> Ordering + Send + Sync + 'static>;

/// Documents in query order, with lookup by key.
#[derive(Clone)]
pub struct DocumentSet {
    comparator: DocumentComparator,
    key_index: DocumentMap,
    sorted: Vec<MutableDocument>,
}

impl DocumentSet {
    /// Orders by `comparator`, breaking ties by key.
    pub fn new(comparator: DocumentComparator) -> Self {
        Self {
            comparator,
            key_index: DocumentMap::new(),
            sorted: Vec::new(),
        }
    }

    pub fn for_query(query: &Query) -> Self {
        let query = query.clone();
        Self::new(Arc::new(move |left, right| query.compare_documents(left, right)))
    }

    fn compare(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        (self.comparator)(left, right).then_with(|| left.key().cmp(right.key()))
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.key_index.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&MutableDocument> {
        self.key_index.get(key)
    }

    pub fn first(&self) -> Option<&MutableDocument> {
        self.sorted.first()
    }

    pub fn last(&self) -> Option<&MutableDocument> {
        self.sorted.last()
    }

    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        let document = self.key_index.get(key)?;
        self.sorted
            .binary_search_by(|probe| self.compare(probe, document))
            .ok()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MutableDocument> {
        self.sorted.iter()
    }

    pub fn keys(&self) -> DocumentKeySet {
        self.sorted.iter().map(|document| document.key().clone()).collect()
    }

    /// Inserts `document`, replacing any document with the same key.
    pub fn add(&mut self, document: MutableDocument) {
        self.delete(document.key());
        let position = self
            .sorted
            .binary_search_by(|probe| self.compare(probe, &document))
            .unwrap_or_else(|position| position);
        self.key_index = self.key_index.insert(document.key().clone(), document.clone());
        self.sorted.insert(position, document);
    }

    pub fn delete(&mut self, key: &DocumentKey) {
        if let Some(position) = self.index_of(key) {
            self.sorted.remove(position);
            self.key_index = self.key_index.remove(key);
        }
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.sorted == other.sorted
    }
}

impl Debug for DocumentSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.sorted.iter().map(|document| document.key().to_string()))
            .finish()
    }
}

impl<'a> IntoIterator for &'a DocumentSet {
    type Item = &'a MutableDocument;
    type IntoIter = std::slice::Iter<'a, MutableDocument>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
    /// Only `has_pending_writes` changed.
    Metadata,
}

impl ChangeType {
    /// Removals are reported first, then additions, then modifications.
    fn order(self) -> u8 {
        match self {
            ChangeType::Removed => 0,
            ChangeType::Added => 1,
            ChangeType::Modified | ChangeType::Metadata => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub change_type: ChangeType,
    pub doc: MutableDocument,
}

/// Collapses successive changes to one key into the net change.
#[derive(Clone, Debug, Default)]
pub struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, change: DocumentViewChange) {
        let key = change.doc.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return;
        };
        use ChangeType::*;
        let merged = match (old.change_type, change.change_type) {
            (Metadata, new_type) if new_type != Added => Some(change),
            (old_type, Metadata) if old_type != Removed => Some(DocumentViewChange {
                change_type: old_type,
                doc: change.doc,
            }),
            (Modified, Modified) => Some(change),
            (Added, Modified) => Some(DocumentViewChange {
                change_type: Added,
                doc: change.doc,
            }),
            (Added, Removed) => None,
            (Modified, Removed) => Some(DocumentViewChange {
                change_type: Removed,
                doc: old.doc.clone(),
            }),
            (Removed, Added) => Some(DocumentViewChange {
                change_type: Modified,
                doc: change.doc,
            }),
            (old_type, new_type) => fail(format!(
                "Unsupported combination of changes: {new_type:?} after {old_type:?}"
            )),
        };
        match merged {
            Some(merged) => {
                self.changes.insert(key, merged);
            }
            None => {
                self.changes.remove(&key);
            }
        }
    }

    pub fn changes(&self) -> Vec<DocumentViewChange> {
        self.changes.values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Sorts changes for presentation: by change type, then query order.
pub(crate) fn sort_changes(changes: &mut [DocumentViewChange], comparator: &DocumentComparator) {
    changes.sort_by(|left, right| {
        left.change_type
            .order()
            .cmp(&right.change_type.order())
            .then_with(|| comparator(&left.doc, &right.doc))
    });
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    /// Results may be stale or missing limbo documents.
    Local,
    Synced,
}

/// The result of a query at one point in time, with the changes since the
/// previous snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewSnapshot {
    pub query: Query,
    pub docs: DocumentSet,
    pub old_docs: DocumentSet,
    pub doc_changes: Vec<DocumentViewChange>,
    pub mutated_keys: DocumentKeySet,
    pub from_cache: bool,
    pub sync_state_changed: bool,
    pub excludes_metadata_changes: bool,
    pub has_cached_results: bool,
}

impl ViewSnapshot {
    /// First snapshot delivered to a listener: every document is an addition.
    pub fn from_initial_documents(
        query: Query,
        documents: DocumentSet,
        mutated_keys: DocumentKeySet,
        from_cache: bool,
        has_cached_results: bool,
    ) -> Self {
        let doc_changes = documents
            .iter()
            .map(|doc| DocumentViewChange {
                change_type: ChangeType::Added,
                doc: doc.clone(),
            })
            .collect();
        Self {
            old_docs: DocumentSet::for_query(&query),
            query,
            docs: documents,
            doc_changes,
            mutated_keys,
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes: false,
            has_cached_results,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }
}
