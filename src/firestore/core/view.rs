use crate::firestore::collection::{DocumentKeySet, DocumentMap};
use crate::firestore::core::query::{LimitType, Query};
use crate::firestore::core::view_snapshot::{
    sort_changes, ChangeType, DocumentChangeSet, DocumentComparator, DocumentSet,
    DocumentViewChange, SyncState, ViewSnapshot,
};
use crate::firestore::local::local_store::QueryResult;
use crate::firestore::model::{DocumentKey, MutableDocument};
use crate::firestore::remote::remote_event::TargetChange;
use crate::firestore::remote::remote_syncer::OnlineState;
use crate::util::hard_assert;
use std::cmp::Ordering;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

impl LimboDocumentChange {
    pub fn key(&self) -> &DocumentKey {
        match self {
            LimboDocumentChange::Added(key) | LimboDocumentChange::Removed(key) => key,
        }
    }
}

/// Intermediate result of [`View::compute_doc_changes`], applied with
/// [`View::apply_changes`].
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    /// A limit query lost documents at its edge and must be recomputed from
    /// the full local result.
    pub needs_refill: bool,
    pub mutated_keys: DocumentKeySet,
}

#[derive(Clone, Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// Incrementally maintained result of one query.
pub struct View {
    query: Query,
    comparator: DocumentComparator,
    current: bool,
    document_set: DocumentSet,
    /// `None` until the first snapshot, which is therefore always raised.
    sync_state: Option<SyncState>,
    limbo_documents: DocumentKeySet,
    /// Keys the server says belong to the target.
    synced_documents: DocumentKeySet,
    mutated_keys: DocumentKeySet,
}

impl View {
    pub fn new(query: Query, synced_documents: DocumentKeySet) -> Self {
        let comparator: DocumentComparator = {
            let query = query.clone();
            Arc::new(move |left, right| query.compare_documents(left, right))
        };
        Self {
            document_set: DocumentSet::new(Arc::clone(&comparator)),
            comparator,
            query,
            current: false,
            sync_state: None,
            limbo_documents: DocumentKeySet::new(),
            synced_documents,
            mutated_keys: DocumentKeySet::new(),
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn synced_documents(&self) -> &DocumentKeySet {
        &self.synced_documents
    }

    pub fn limbo_documents(&self) -> &DocumentKeySet {
        &self.limbo_documents
    }

    pub fn is_current(&self) -> bool {
        self.current
    }

    /// Snapshot of the current results for a listener joining late.
    pub fn compute_initial_snapshot(&self) -> ViewSnapshot {
        ViewSnapshot::from_initial_documents(
            self.query.clone(),
            self.document_set.clone(),
            self.mutated_keys.clone(),
            self.sync_state != Some(SyncState::Synced),
            false,
        )
    }

    /// Folds `doc_changes` into the current results. Pass the output of a
    /// previous call to continue from it, as done when refilling.
    pub fn compute_doc_changes(
        &self,
        doc_changes: &DocumentMap,
        previous: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let refilling = previous.is_some();
        let (old_document_set, mut change_set, mut new_mutated_keys) = match previous {
            Some(previous) => (previous.document_set, previous.change_set, previous.mutated_keys),
            None => (
                self.document_set.clone(),
                DocumentChangeSet::new(),
                self.mutated_keys.clone(),
            ),
        };
        let mut new_document_set = old_document_set.clone();
        let mut needs_refill = false;

        let limit = self.query.limit().map(|limit| limit as usize);
        let at_limit = limit.map_or(false, |limit| old_document_set.len() == limit);
        let last_doc_in_limit = (self.query.limit_type() == LimitType::First && at_limit)
            .then(|| old_document_set.last().cloned())
            .flatten();
        let first_doc_in_limit = (self.query.limit_type() == LimitType::Last && at_limit)
            .then(|| old_document_set.first().cloned())
            .flatten();

        for (key, entry) in doc_changes.iter() {
            let old_doc = old_document_set.get(key);
            let new_doc = self.query.matches(entry).then_some(entry);

            let old_doc_had_pending_mutations =
                old_doc.map_or(false, |doc| self.mutated_keys.contains(doc.key()));
            let new_doc_has_pending_mutations = new_doc.map_or(false, |doc| {
                doc.has_local_mutations()
                    || (self.mutated_keys.contains(doc.key()) && doc.has_committed_mutations())
            });

            let mut change_applied = false;
            match (old_doc, new_doc) {
                (Some(old_doc), Some(new_doc)) => {
                    if old_doc.data() != new_doc.data() {
                        if !should_wait_for_synced_document(old_doc, new_doc) {
                            change_set.track(DocumentViewChange {
                                change_type: ChangeType::Modified,
                                doc: new_doc.clone(),
                            });
                            change_applied = true;
                            let past_last = last_doc_in_limit.as_ref().map_or(false, |last| {
                                (self.comparator)(new_doc, last) == Ordering::Greater
                            });
                            let before_first = first_doc_in_limit.as_ref().map_or(false, |first| {
                                (self.comparator)(new_doc, first) == Ordering::Less
                            });
                            if past_last || before_first {
                                // The document moved out of the window; something
                                // past the edge may now belong in it.
                                needs_refill = true;
                            }
                        }
                    } else if old_doc_had_pending_mutations != new_doc_has_pending_mutations {
                        change_set.track(DocumentViewChange {
                            change_type: ChangeType::Metadata,
                            doc: new_doc.clone(),
                        });
                        change_applied = true;
                    }
                }
                (None, Some(new_doc)) => {
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Added,
                        doc: new_doc.clone(),
                    });
                    change_applied = true;
                }
                (Some(old_doc), None) => {
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Removed,
                        doc: old_doc.clone(),
                    });
                    change_applied = true;
                    if last_doc_in_limit.is_some() || first_doc_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if change_applied {
                match new_doc {
                    Some(new_doc) => {
                        new_document_set.add(new_doc.clone());
                        new_mutated_keys = if new_doc_has_pending_mutations {
                            new_mutated_keys.insert(key.clone())
                        } else {
                            new_mutated_keys.remove(key)
                        };
                    }
                    None => {
                        new_document_set.delete(key);
                        new_mutated_keys = new_mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = limit {
            while new_document_set.len() > limit {
                let evicted = match self.query.limit_type() {
                    LimitType::First => new_document_set.last().cloned(),
                    LimitType::Last => new_document_set.first().cloned(),
                };
                let Some(evicted) = evicted else {
                    break;
                };
                new_document_set.delete(evicted.key());
                new_mutated_keys = new_mutated_keys.remove(evicted.key());
                change_set.track(DocumentViewChange {
                    change_type: ChangeType::Removed,
                    doc: evicted,
                });
            }
        }

        hard_assert(
            !needs_refill || !refilling,
            "View was refilled using docs that themselves needed refilling.",
        );
        ViewDocumentChanges {
            document_set: new_document_set,
            change_set,
            needs_refill,
            mutated_keys: new_mutated_keys,
        }
    }

    /// Commits `doc_changes` and returns the snapshot to raise, if any.
    /// `target_change` carries the server's view of the target for this event.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        update_limbo_documents: bool,
        target_change: Option<&TargetChange>,
        target_is_pending_reset: bool,
    ) -> ViewChange {
        hard_assert(
            !doc_changes.needs_refill,
            "Cannot apply changes that need a refill",
        );
        let old_docs = std::mem::replace(&mut self.document_set, doc_changes.document_set.clone());
        self.mutated_keys = doc_changes.mutated_keys.clone();

        let mut changes = doc_changes.change_set.changes();
        sort_changes(&mut changes, &self.comparator);

        self.apply_target_change(target_change);
        let limbo_changes = if update_limbo_documents && !target_is_pending_reset {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current && !target_is_pending_reset;
        let new_sync_state = if synced {
            SyncState::Synced
        } else {
            SyncState::Local
        };
        let sync_state_changed = self.sync_state != Some(new_sync_state);
        self.sync_state = Some(new_sync_state);

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }
        let snapshot = ViewSnapshot {
            query: self.query.clone(),
            docs: doc_changes.document_set,
            old_docs,
            doc_changes: changes,
            mutated_keys: doc_changes.mutated_keys,
            from_cache: new_sync_state == SyncState::Local,
            sync_state_changed,
            excludes_metadata_changes: false,
            has_cached_results: target_change.map_or(false, |change| !change.resume_token.is_empty()),
        };
        ViewChange {
            snapshot: Some(snapshot),
            limbo_changes,
        }
    }

    /// Going offline makes a current view fall back to cached results.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let unchanged = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentChangeSet::new(),
                needs_refill: false,
                mutated_keys: self.mutated_keys.clone(),
            };
            return self.apply_changes(unchanged, false, None, false);
        }
        ViewChange::default()
    }

    /// Resets the view from a fresh local query, e.g. after a target reset.
    pub fn synchronize_with_persisted_state(&mut self, query_result: QueryResult) -> ViewChange {
        self.synced_documents = query_result.remote_keys;
        self.limbo_documents = DocumentKeySet::new();
        let changes = self.compute_doc_changes(&query_result.documents, None);
        self.apply_changes(changes, true, None, false)
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(change) = target_change else {
            return;
        };
        for key in change.added_documents.iter() {
            self.synced_documents = self.synced_documents.insert(key.clone());
        }
        for key in change.modified_documents.iter() {
            hard_assert(
                self.synced_documents.contains(key),
                format!("Modified document {key} not found in view."),
            );
        }
        for key in change.removed_documents.iter() {
            self.synced_documents = self.synced_documents.remove(key);
        }
        self.current = change.current;
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }
        let old_limbo_documents = std::mem::take(&mut self.limbo_documents);
        let mut limbo_documents = DocumentKeySet::new();
        for document in self.document_set.iter() {
            if self.should_be_in_limbo(document.key()) {
                limbo_documents = limbo_documents.insert(document.key().clone());
            }
        }
        self.limbo_documents = limbo_documents;

        let mut changes = Vec::new();
        for key in old_limbo_documents.iter() {
            if !self.limbo_documents.contains(key) {
                changes.push(LimboDocumentChange::Removed(key.clone()));
            }
        }
        for key in self.limbo_documents.iter() {
            if !old_limbo_documents.contains(key) {
                changes.push(LimboDocumentChange::Added(key.clone()));
            }
        }
        changes
    }

    /// A cached document the server did not send for a current target may
    /// have been deleted remotely.
    fn should_be_in_limbo(&self, key: &DocumentKey) -> bool {
        if self.synced_documents.contains(key) {
            return false;
        }
        match self.document_set.get(key) {
            Some(document) => !document.has_local_mutations(),
            None => false,
        }
    }
}

/// A locally modified document should not flicker back to its old state
/// while waiting for the server to echo the committed write.
fn should_wait_for_synced_document(old_doc: &MutableDocument, new_doc: &MutableDocument) -> bool {
    old_doc.has_local_mutations() && new_doc.has_committed_mutations() && !new_doc.has_local_mutations()
}
