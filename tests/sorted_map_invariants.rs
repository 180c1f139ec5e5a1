#![cfg(not(target_arch = "wasm32"))]

mod common;

use std::collections::{BTreeMap, BTreeSet};

use common::key;
use firebase_firestore_local::firestore::collection::{DocumentKeySet, SortedMap, SortedSet};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[test]
fn every_snapshot_keeps_its_own_contents() {
    let mut rng = StdRng::seed_from_u64(11);
    let mut history = vec![(SortedMap::new(), BTreeMap::new())];
    for _ in 0..600 {
        let (map, reference) = history.last().cloned().unwrap();
        let key: u32 = rng.gen_range(0..200);
        let (map, reference) = if rng.gen_bool(0.65) {
            let mut reference = reference;
            reference.insert(key, key * 2);
            (map.insert(key, key * 2), reference)
        } else {
            let mut reference = reference;
            reference.remove(&key);
            (map.remove(&key), reference)
        };
        history.push((map, reference));
    }

    for (map, reference) in &history {
        map.check_invariants().unwrap();
        let entries: Vec<(u32, u32)> = map.iter().map(|(k, v)| (*k, *v)).collect();
        let expected: Vec<(u32, u32)> = reference.iter().map(|(k, v)| (*k, *v)).collect();
        assert_eq!(entries, expected);
    }
}

#[test]
fn black_height_stays_logarithmic() {
    let map: SortedMap<u32, ()> = (0..4_096).map(|key| (key, ())).collect();
    let black_height = map.check_invariants().unwrap();
    assert!(black_height <= 13, "black height {black_height}");
    assert_eq!(map.len(), 4_096);
    assert_eq!(map.index_of(&4_000), Some(4_000));
}

#[test]
fn sets_match_reference_under_random_edits() {
    let mut rng = StdRng::seed_from_u64(5);
    let mut set = SortedSet::new();
    let mut reference = BTreeSet::new();
    for _ in 0..1_500 {
        let value: i16 = rng.gen_range(-100..100);
        if rng.gen_bool(0.5) {
            set = set.insert(value);
            reference.insert(value);
        } else {
            set = set.remove(&value);
            reference.remove(&value);
        }
    }
    set.check_invariants().unwrap();
    assert_eq!(set.iter().copied().collect::<Vec<_>>(), reference.into_iter().collect::<Vec<_>>());
}

#[test]
fn document_keys_sort_by_path_segments() {
    let keys: DocumentKeySet = ["rooms/b", "rooms/a/messages/1", "rooms/a", "chats/z"]
        .iter()
        .map(|path| key(path))
        .collect();
    let ordered: Vec<String> = keys.iter().map(|key| key.to_string()).collect();
    assert_eq!(
        ordered,
        vec!["chats/z", "rooms/a", "rooms/a/messages/1", "rooms/b"]
    );

    let others: DocumentKeySet = [key("rooms/c"), key("rooms/a")].into_iter().collect();
    let merged = keys.union(&others);
    assert_eq!(merged.len(), 5);
    assert_eq!(merged.difference(&keys).iter().cloned().collect::<Vec<_>>(), vec![key("rooms/c")]);
}
