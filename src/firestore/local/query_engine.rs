use crate::firestore::collection::{DocumentKeySet, DocumentMap};
use crate::firestore::core::query::{LimitType, Query};
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::model::{MutableDocument, SnapshotVersion};

const LOG_TARGET: &str = "firestore::query_engine";

/// How a query result was assembled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryStrategy {
    /// Candidates came from a field index.
    Indexed,
    /// The previous result set was refreshed with documents changed since it was limbo-free.
    PreviousResults,
    FullScan,
}

/// Picks the cheapest way to answer a query from the local cache. All
/// strategies return the same documents.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueryEngine;

impl QueryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn get_documents_matching_query(
        &self,
        view: &mut LocalDocumentsView<'_>,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &DocumentKeySet,
    ) -> (DocumentMap, QueryStrategy) {
        if let Some(documents) = self.perform_query_using_index(view, query) {
            return (documents, QueryStrategy::Indexed);
        }
        if let Some(documents) =
            self.perform_query_using_remote_keys(view, query, remote_keys, last_limbo_free_snapshot_version)
        {
            return (documents, QueryStrategy::PreviousResults);
        }
        log::debug!(target: LOG_TARGET, "full collection scan for {}", query.canonical_id());
        (
            view.get_documents_matching_query(query, SnapshotVersion::min()),
            QueryStrategy::FullScan,
        )
    }

    fn perform_query_using_index(
        &self,
        view: &mut LocalDocumentsView<'_>,
        query: &Query,
    ) -> Option<DocumentMap> {
        if query.matches_all_documents() {
            return None;
        }
        let mut keys = view.index_candidates(&query.to_target())?;
        for key in view.keys_with_overlays(query).iter() {
            keys = keys.insert(key.clone());
        }
        log::debug!(
            target: LOG_TARGET,
            "index lookup for {} yielded {} candidates",
            query.canonical_id(),
            keys.len()
        );
        let documents = view.get_documents(&keys);
        Some(
            documents
                .iter()
                .filter(|(_, document)| query.matches(document))
                .map(|(key, document)| (key.clone(), document.clone()))
                .collect(),
        )
    }

    fn perform_query_using_remote_keys(
        &self,
        view: &mut LocalDocumentsView<'_>,
        query: &Query,
        remote_keys: &DocumentKeySet,
        last_limbo_free_snapshot_version: SnapshotVersion,
    ) -> Option<DocumentMap> {
        if query.matches_all_documents() || last_limbo_free_snapshot_version.is_min() {
            return None;
        }
        let documents = view.get_documents(remote_keys);
        let previous_results = apply_query(query, &documents);
        if query.has_limit()
            && needs_refill(query, &previous_results, remote_keys, last_limbo_free_snapshot_version)
        {
            return None;
        }

        log::debug!(
            target: LOG_TARGET,
            "re-using previous result from {:?} for {}",
            last_limbo_free_snapshot_version,
            query.canonical_id()
        );
        let mut results = view.get_documents_matching_query(query, last_limbo_free_snapshot_version);
        for document in previous_results {
            results = results.insert(document.key().clone(), document);
        }
        Some(results)
    }
}

fn apply_query(query: &Query, documents: &DocumentMap) -> Vec<MutableDocument> {
    let mut results: Vec<MutableDocument> = documents
        .values()
        .filter(|document| query.matches(document))
        .cloned()
        .collect();
    let comparator = query.comparator();
    results.sort_by(|left, right| comparator(left, right));
    results
}

/// A limited result cannot be reused when a document may have moved past
/// the limit edge since the results were last consistent with the server.
fn needs_refill(
    query: &Query,
    sorted_previous_results: &[MutableDocument],
    remote_keys: &DocumentKeySet,
    limbo_free_snapshot_version: SnapshotVersion,
) -> bool {
    if !query.has_limit() {
        return false;
    }
    if remote_keys.len() != sorted_previous_results.len() {
        return true;
    }
    let edge = match query.limit_type() {
        LimitType::First => sorted_previous_results.last(),
        LimitType::Last => sorted_previous_results.first(),
    };
    match edge {
        None => false,
        Some(document) => {
            document.has_local_mutations()
                || document.has_committed_mutations()
                || document.version() > limbo_free_snapshot_version
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::filter::{Filter, Operator};
    use crate::firestore::core::user::User;
    use crate::firestore::local::index_manager::{FieldIndex, IndexKind, IndexSegment};
    use crate::firestore::local::persistence::{MemoryPersistence, PersistenceTransaction};
    use crate::firestore::model::Timestamp;
    use crate::firestore::value::FirestoreValue;
    use crate::test_support::{doc, key, map, path, query, set_mutation, version};

    fn int(value: i64) -> FirestoreValue {
        FirestoreValue::from_integer(value)
    }

    fn add(txn: &mut PersistenceTransaction, path: &str, read_time: i64, n: i64) {
        let document = doc(path, read_time, map(&[("n", int(n))]));
        txn.index_manager.update_index_entries(&document);
        txn.remote_documents.add_entry(document, version(read_time));
    }

    fn keys(documents: &DocumentMap) -> Vec<String> {
        documents
            .keys()
            .map(|key| key.path().canonical_string())
            .collect()
    }

    fn n_equals(value: i64) -> Query {
        query("rooms").with_filter(Filter::field(path("n"), Operator::Equal, int(value)).unwrap())
    }

    #[tokio::test]
    async fn strategies_agree_on_results() {
        let persistence = MemoryPersistence::new();
        let user = User::unauthenticated();
        persistence
            .run_transaction("test", &user, |txn| {
                txn.index_manager.add_to_collection_parent_index(&key("rooms/a").collection_path());
                add(txn, "rooms/a", 1, 1);
                add(txn, "rooms/b", 1, 2);
                add(txn, "rooms/c", 5, 1);
                let engine = QueryEngine::new();
                let query = n_equals(1);
                let remote_keys: DocumentKeySet = [key("rooms/a")].into_iter().collect();

                let mut view = LocalDocumentsView::new(txn);
                let (scanned, strategy) = engine.get_documents_matching_query(
                    &mut view,
                    &query,
                    SnapshotVersion::min(),
                    &DocumentKeySet::new(),
                );
                assert_eq!(strategy, QueryStrategy::FullScan);

                let (previous, strategy) =
                    engine.get_documents_matching_query(&mut view, &query, version(2), &remote_keys);
                assert_eq!(strategy, QueryStrategy::PreviousResults);
                assert_eq!(keys(&previous), keys(&scanned));
                assert_eq!(keys(&previous), vec!["rooms/a", "rooms/c"]);
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn index_candidates_include_local_writes() {
        let persistence = MemoryPersistence::new();
        let user = User::unauthenticated();
        persistence
            .run_transaction("test", &user, |txn| {
                txn.index_manager.add_field_index(FieldIndex::new(
                    "rooms",
                    vec![IndexSegment::new(path("n"), IndexKind::Ascending)],
                ));
                add(txn, "rooms/a", 1, 1);
                add(txn, "rooms/b", 1, 2);
                let batch = txn.mutation_queue.add_mutation_batch(
                    Timestamp::now(),
                    Vec::new(),
                    vec![set_mutation("rooms/d", map(&[("n", int(1))]))],
                );
                let mut view = LocalDocumentsView::new(txn);
                view.recalculate_and_save_overlays_for_document_keys(&batch.keys());

                let (results, strategy) = QueryEngine::new().get_documents_matching_query(
                    &mut view,
                    &n_equals(1),
                    SnapshotVersion::min(),
                    &DocumentKeySet::new(),
                );
                assert_eq!(strategy, QueryStrategy::Indexed);
                assert_eq!(keys(&results), vec!["rooms/a", "rooms/d"]);
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn limit_edge_with_pending_write_forces_scan() {
        let persistence = MemoryPersistence::new();
        let user = User::unauthenticated();
        persistence
            .run_transaction("test", &user, |txn| {
                add(txn, "rooms/a", 1, 1);
                add(txn, "rooms/b", 1, 1);
                let query = n_equals(1).with_limit_to_first(1);
                // Fewer previous results than remote keys.
                let remote_keys: DocumentKeySet =
                    [key("rooms/a"), key("rooms/gone")].into_iter().collect();
                let mut view = LocalDocumentsView::new(txn);
                let (_, strategy) =
                    QueryEngine::new().get_documents_matching_query(&mut view, &query, version(2), &remote_keys);
                assert_eq!(strategy, QueryStrategy::FullScan);
                Ok(())
            })
            .await
            .unwrap();
    }
}
