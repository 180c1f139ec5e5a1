//! Persistent ordered collections and the aliases the cache layers share.

use std::collections::BTreeMap;

use crate::firestore::model::{DocumentKey, MutableDocument, Overlay, SnapshotVersion};

pub mod sorted_map;
pub mod sorted_set;

pub use sorted_map::SortedMap;
pub use sorted_set::SortedSet;

pub type DocumentKeySet = SortedSet<DocumentKey>;
/// Snapshot of documents handed out by the local store.
pub type DocumentMap = SortedMap<DocumentKey, MutableDocument>;
/// Working map mutated while a single read or write is computed.
pub type MutableDocumentMap = BTreeMap<DocumentKey, MutableDocument>;
pub type OverlayMap = BTreeMap<DocumentKey, Overlay>;
pub type DocumentVersionMap = SortedMap<DocumentKey, SnapshotVersion>;
