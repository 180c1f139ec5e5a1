#![cfg(not(target_arch = "wasm32"))]

mod common;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use common::{key, query, version};
use firebase_firestore_local::firestore::collection::DocumentKeySet;
use firebase_firestore_local::firestore::local::{TargetData, TargetPurpose};
use firebase_firestore_local::firestore::model::{DatabaseId, TargetId};
use firebase_firestore_local::firestore::remote::{
    decode_watch_change, BloomFilter, JsonProtoSerializer, TargetMetadataProvider,
    WatchChangeAggregator,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;

const GOLDEN_BITMAP: &str = "IAAQAgAoCAQCACACAA==";

#[derive(Default)]
struct CachedTargets {
    keys: Mutex<BTreeMap<TargetId, DocumentKeySet>>,
    targets: Mutex<BTreeMap<TargetId, TargetData>>,
}

impl CachedTargets {
    fn with_room_target(paths: &[&str]) -> Arc<Self> {
        let cached = Self::default();
        cached.targets.lock().unwrap().insert(
            2,
            TargetData::new(query("rooms").to_target(), 2, TargetPurpose::Listen, 1),
        );
        cached
            .keys
            .lock()
            .unwrap()
            .insert(2, paths.iter().map(|path| key(path)).collect());
        Arc::new(cached)
    }
}

impl TargetMetadataProvider for CachedTargets {
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        self.keys
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

fn aggregate_filter(metadata: Arc<CachedTargets>, frame: serde_json::Value) -> WatchChangeAggregator {
    let database_id = DatabaseId::default("p");
    let serializer = JsonProtoSerializer::new(database_id.clone());
    let mut aggregator = WatchChangeAggregator::new(database_id, metadata);
    let change = decode_watch_change(&serializer, &frame)
        .unwrap()
        .expect("filter frame");
    aggregator.handle_watch_change(change);
    aggregator
}

fn document_name(path: &str) -> String {
    format!("projects/p/databases/(default)/documents/{path}")
}

#[test]
fn existence_filter_with_bloom_filter_evicts_only_missing_document() {
    let metadata = CachedTargets::with_room_target(&["rooms/a", "rooms/b", "rooms/c"]);
    let mut aggregator = aggregate_filter(
        metadata,
        json!({"filter": {
            "targetId": 2,
            "count": 2,
            "unchangedNames": {"bits": {"bitmap": GOLDEN_BITMAP, "padding": 4}, "hashCount": 5}
        }}),
    );

    let event = aggregator.create_remote_event(version(10));
    assert!(event.target_mismatches.is_empty());
    let removed: Vec<_> = event.target_changes[&2].removed_documents.iter().cloned().collect();
    assert_eq!(removed, vec![key("rooms/b")]);
}

#[test]
fn bloom_filter_that_cannot_reconcile_count_requests_bloom_requery() {
    let metadata = CachedTargets::with_room_target(&["rooms/a", "rooms/b", "rooms/c"]);
    let mut aggregator = aggregate_filter(
        metadata,
        json!({"filter": {
            "targetId": 2,
            "count": 1,
            "unchangedNames": {"bits": {"bitmap": GOLDEN_BITMAP, "padding": 4}, "hashCount": 5}
        }}),
    );

    let event = aggregator.create_remote_event(version(10));
    assert_eq!(
        event.target_mismatches.get(&2),
        Some(&TargetPurpose::ExistenceFilterMismatchBloom)
    );
}

#[test]
fn existence_filter_without_bloom_filter_requests_full_requery() {
    let metadata = CachedTargets::with_room_target(&["rooms/a", "rooms/b"]);
    let mut aggregator = aggregate_filter(metadata, json!({"filter": {"targetId": 2, "count": 1}}));

    let event = aggregator.create_remote_event(version(10));
    assert_eq!(
        event.target_mismatches.get(&2),
        Some(&TargetPurpose::ExistenceFilterMismatch)
    );
}

#[test]
fn matching_count_leaves_target_untouched() {
    let metadata = CachedTargets::with_room_target(&["rooms/a", "rooms/b"]);
    let mut aggregator = aggregate_filter(metadata, json!({"filter": {"targetId": 2, "count": 2}}));

    let event = aggregator.create_remote_event(version(10));
    assert!(event.target_mismatches.is_empty());
    assert!(event
        .target_changes
        .get(&2)
        .map_or(true, |change| change.removed_documents.is_empty()));
}

#[test]
fn golden_bitmap_matches_its_source_names() {
    let filter = BloomFilter::new(
        base64_decode(GOLDEN_BITMAP),
        4,
        5,
    )
    .unwrap();
    assert_eq!(filter.bit_count(), 100);
    assert!(filter.might_contain(&document_name("rooms/a")));
    assert!(filter.might_contain(&document_name("rooms/c")));
    assert!(!filter.might_contain(&document_name("rooms/b")));
}

#[test]
fn inserted_names_are_always_reported() {
    let mut rng = StdRng::seed_from_u64(7);
    let names: Vec<String> = (0..500)
        .map(|_| document_name(&format!("docs/{}", rng.gen::<u64>())))
        .collect();
    let filter = BloomFilter::create(4_800, 7, names.iter().map(String::as_str)).unwrap();
    for name in &names {
        assert!(filter.might_contain(name), "missing {name}");
    }
}

#[test]
fn false_positive_rate_stays_near_target() {
    // 1000 names in 9586 bits with 7 hashes targets a 1% false positive rate.
    let inserted: Vec<String> = (0..1_000)
        .map(|index| document_name(&format!("in/{index}")))
        .collect();
    let filter = BloomFilter::create(9_586, 7, inserted.iter().map(String::as_str)).unwrap();

    let mut rng = StdRng::seed_from_u64(42);
    let probes = 10_000;
    let false_positives = (0..probes)
        .filter(|_| filter.might_contain(&document_name(&format!("out/{}", rng.gen::<u64>()))))
        .count();
    let rate = false_positives as f64 / probes as f64;
    assert!(rate < 0.03, "false positive rate {rate}");
}

fn base64_decode(value: &str) -> Vec<u8> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(value)
        .unwrap()
}
