#![cfg(not(target_arch = "wasm32"))]

mod common;

use std::sync::Arc;

use common::{delete, doc, field, int, key, map, patch, query, set, version};
use firebase_firestore_local::firestore::collection::DocumentKeySet;
use firebase_firestore_local::firestore::core::User;
use firebase_firestore_local::firestore::local::{
    LocalStore, MemoryPersistence, MemoryPersistenceBackend,
};
use firebase_firestore_local::firestore::model::{
    MutableDocument, MutationBatchResult, MutationResult, SnapshotVersion, TargetId,
    BATCH_ID_UNKNOWN,
};
use firebase_firestore_local::firestore::remote::{RemoteEvent, TargetChange};
use firebase_firestore_local::firestore::FirestoreSettings;

fn local_store(persistence: MemoryPersistence) -> LocalStore {
    LocalStore::new(persistence, User::unauthenticated(), &FirestoreSettings::default())
}

fn keys(paths: &[&str]) -> DocumentKeySet {
    paths.iter().map(|path| key(path)).collect()
}

fn watch_update(target_id: TargetId, at: i64, documents: Vec<MutableDocument>) -> RemoteEvent {
    let mut event = RemoteEvent {
        snapshot_version: version(at),
        ..RemoteEvent::default()
    };
    let added: DocumentKeySet = documents.iter().map(|document| document.key().clone()).collect();
    event.target_changes.insert(
        target_id,
        TargetChange {
            resume_token: vec![at as u8],
            current: true,
            added_documents: added,
            ..TargetChange::default()
        },
    );
    for document in documents {
        event.document_updates.insert(document.key().clone(), document);
    }
    event
}

async fn acknowledge_next(store: &LocalStore, at: i64) {
    let batch = store
        .next_mutation_batch(None)
        .await
        .unwrap()
        .expect("pending batch");
    let results = batch
        .mutations
        .iter()
        .map(|_| MutationResult {
            version: version(at),
            transform_results: Vec::new(),
        })
        .collect();
    let result = MutationBatchResult::from(batch, version(at), results, Vec::new()).unwrap();
    store.acknowledge_batch(result).await.unwrap();
}

#[tokio::test]
async fn acknowledged_write_settles_at_commit_version() {
    let store = local_store(MemoryPersistence::new());
    let written = store
        .local_write(vec![set("rooms/a", map(&[("v", int(1))]))])
        .await
        .unwrap();
    assert!(written.changes.get(&key("rooms/a")).unwrap().has_local_mutations());

    let pending = store.get_documents(&keys(&["rooms/a"])).await.unwrap();
    let document = pending.get(&key("rooms/a")).unwrap();
    assert!(document.has_local_mutations());
    assert_eq!(document.field(&field("v")), Some(&int(1)));
    assert_eq!(
        store.get_highest_unacknowledged_batch_id().await.unwrap(),
        written.batch_id
    );

    acknowledge_next(&store, 5).await;

    let document = store.read_document(&key("rooms/a")).await.unwrap();
    assert!(document.is_found_document());
    assert!(!document.has_local_mutations());
    assert!(document.has_committed_mutations());
    assert_eq!(document.version(), version(5));
    assert_eq!(document.field(&field("v")), Some(&int(1)));
    assert_eq!(
        store.get_highest_unacknowledged_batch_id().await.unwrap(),
        BATCH_ID_UNKNOWN
    );
}

#[tokio::test]
async fn stale_watch_update_does_not_replace_newer_document() {
    let store = local_store(MemoryPersistence::new());
    let target = store.allocate_target(query("rooms").to_target()).await.unwrap();
    store
        .apply_remote_event(watch_update(
            target.target_id,
            5,
            vec![doc("rooms/a", 5, map(&[("v", int(5))]))],
        ))
        .await
        .unwrap();
    store
        .local_write(vec![patch("rooms/a", map(&[("w", int(1))]))])
        .await
        .unwrap();

    let changed = store
        .apply_remote_event(watch_update(
            target.target_id,
            6,
            vec![doc("rooms/a", 3, map(&[("v", int(3))]))],
        ))
        .await
        .unwrap();
    assert!(changed.get(&key("rooms/a")).is_none());

    let document = store.read_document(&key("rooms/a")).await.unwrap();
    assert_eq!(document.version(), version(5));
    assert_eq!(document.field(&field("v")), Some(&int(5)));
    assert_eq!(document.field(&field("w")), Some(&int(1)));
    assert!(document.has_local_mutations());
    assert_eq!(store.last_remote_snapshot_version().await.unwrap(), version(6));
}

#[tokio::test]
async fn newer_watch_update_replaces_cached_version() {
    let store = local_store(MemoryPersistence::new());
    let target = store.allocate_target(query("rooms").to_target()).await.unwrap();
    let mut last_seen = SnapshotVersion::min();
    for at in [2, 4, 7] {
        store
            .apply_remote_event(watch_update(
                target.target_id,
                at,
                vec![doc("rooms/a", at, map(&[("v", int(at))]))],
            ))
            .await
            .unwrap();
        let document = store.read_document(&key("rooms/a")).await.unwrap();
        assert!(document.version() > last_seen);
        last_seen = document.version();
    }
    assert_eq!(last_seen, version(7));
    assert_eq!(
        store.get_remote_document_keys(target.target_id).await.unwrap(),
        keys(&["rooms/a"])
    );
}

#[tokio::test]
async fn local_view_is_stable_across_reads_and_restarts() {
    let backend = Arc::new(MemoryPersistenceBackend::new());
    let persistence = MemoryPersistence::with_backend(backend.clone()).await.unwrap();
    let store = local_store(persistence);
    let target = store.allocate_target(query("rooms").to_target()).await.unwrap();
    store
        .apply_remote_event(watch_update(
            target.target_id,
            1,
            vec![doc("rooms/a", 1, map(&[("a", int(1)), ("b", int(2))]))],
        ))
        .await
        .unwrap();
    store
        .local_write(vec![patch("rooms/a", map(&[("b", int(3))]))])
        .await
        .unwrap();
    store
        .local_write(vec![patch("rooms/a", map(&[("c", int(4))]))])
        .await
        .unwrap();

    let first = store.read_document(&key("rooms/a")).await.unwrap();
    let second = store.read_document(&key("rooms/a")).await.unwrap();
    assert_eq!(first, second);

    let restored = local_store(MemoryPersistence::with_backend(backend).await.unwrap());
    let after_restart = restored.read_document(&key("rooms/a")).await.unwrap();
    assert_eq!(after_restart, first);
    assert_eq!(after_restart.field(&field("a")), Some(&int(1)));
    assert_eq!(after_restart.field(&field("b")), Some(&int(3)));
    assert_eq!(after_restart.field(&field("c")), Some(&int(4)));
}

#[tokio::test]
async fn set_then_delete_reads_as_missing() {
    let store = local_store(MemoryPersistence::new());
    store
        .local_write(vec![set("rooms/a", map(&[("v", int(1))]))])
        .await
        .unwrap();
    store.local_write(vec![delete("rooms/a")]).await.unwrap();

    let document = store.read_document(&key("rooms/a")).await.unwrap();
    assert!(document.is_no_document());
    assert!(document.has_local_mutations());

    let result = store.execute_query(&query("rooms"), false).await.unwrap();
    assert!(result.documents.get(&key("rooms/a")).is_none());
}

#[tokio::test]
async fn patch_only_touches_masked_fields() {
    let store = local_store(MemoryPersistence::new());
    store
        .local_write(vec![set(
            "rooms/a",
            map(&[("a", int(1)), ("b", int(2)), ("nested.x", int(1))]),
        )])
        .await
        .unwrap();
    store
        .local_write(vec![patch("rooms/a", map(&[("b", int(3)), ("nested.y", int(4))]))])
        .await
        .unwrap();

    let document = store.read_document(&key("rooms/a")).await.unwrap();
    assert_eq!(document.field(&field("a")), Some(&int(1)));
    assert_eq!(document.field(&field("b")), Some(&int(3)));
    assert_eq!(document.field(&field("nested.x")), Some(&int(1)));
    assert_eq!(document.field(&field("nested.y")), Some(&int(4)));
}

#[tokio::test]
async fn rejected_batch_reverts_to_remote_document() {
    let store = local_store(MemoryPersistence::new());
    let target = store.allocate_target(query("rooms").to_target()).await.unwrap();
    store
        .apply_remote_event(watch_update(
            target.target_id,
            1,
            vec![doc("rooms/a", 1, map(&[("v", int(1))]))],
        ))
        .await
        .unwrap();
    let written = store
        .local_write(vec![set("rooms/a", map(&[("v", int(2))]))])
        .await
        .unwrap();

    store.reject_batch(written.batch_id).await.unwrap();

    let document = store.read_document(&key("rooms/a")).await.unwrap();
    assert!(!document.has_local_mutations());
    assert_eq!(document.field(&field("v")), Some(&int(1)));
    assert_eq!(document.version(), version(1));
}

#[tokio::test]
async fn batch_ids_are_not_reused_after_restart() {
    let backend = Arc::new(MemoryPersistenceBackend::new());
    let store = local_store(MemoryPersistence::with_backend(backend.clone()).await.unwrap());
    let first = store
        .local_write(vec![set("rooms/a", map(&[("v", int(1))]))])
        .await
        .unwrap();
    acknowledge_next(&store, 2).await;
    assert_eq!(
        store.get_highest_unacknowledged_batch_id().await.unwrap(),
        BATCH_ID_UNKNOWN
    );

    let restored = local_store(MemoryPersistence::with_backend(backend).await.unwrap());
    let second = restored
        .local_write(vec![set("rooms/b", map(&[("v", int(2))]))])
        .await
        .unwrap();
    assert!(second.batch_id > first.batch_id);
}
