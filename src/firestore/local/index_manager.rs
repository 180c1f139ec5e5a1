use crate::firestore::collection::{DocumentKeySet, SortedMap, SortedSet};
use crate::firestore::core::filter::{CompositeOperator, Filter, Operator};
use crate::firestore::core::target::Target;
use crate::firestore::local::persistence::PersistenceWrite;
use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument, ResourcePath};
use crate::firestore::value::FirestoreValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexKind {
    Ascending,
    Descending,
    /// One entry per array element, serving `array-contains`.
    Contains,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexSegment {
    pub field: FieldPath,
    pub kind: IndexKind,
}

impl IndexSegment {
    pub fn new(field: FieldPath, kind: IndexKind) -> Self {
        Self { field, kind }
    }
}

/// Client-side field index over one collection group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldIndex {
    pub index_id: i32,
    pub collection_group: String,
    pub segments: Vec<IndexSegment>,
}

impl FieldIndex {
    pub fn new(collection_group: impl Into<String>, segments: Vec<IndexSegment>) -> Self {
        Self {
            index_id: -1,
            collection_group: collection_group.into(),
            segments,
        }
    }

    fn covers(&self, field: &FieldPath) -> bool {
        self.segments.iter().any(|segment| segment.field == *field)
    }
}

/// How much of a target a configured index can serve.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexType {
    None,
    /// Some filters are indexed; the rest must be applied to the candidates.
    Partial,
    Full,
}

type IndexEntry = (i32, Vec<FirestoreValue>, DocumentKey);

/// Collection parent index for collection group queries, plus optional field
/// indexes that narrow query candidates.
#[derive(Clone, Debug, Default)]
pub struct IndexManager {
    collection_parents: SortedMap<String, SortedSet<ResourcePath>>,
    field_indexes: SortedMap<i32, FieldIndex>,
    next_index_id: i32,
    entries: SortedSet<IndexEntry>,
    entries_by_document: SortedMap<(i32, DocumentKey), Vec<Vec<FirestoreValue>>>,
    changes: Vec<PersistenceWrite>,
}

impl IndexManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the parent of `collection_path` under its collection id.
    pub fn add_to_collection_parent_index(&mut self, collection_path: &ResourcePath) {
        debug_assert!(collection_path.len() % 2 == 1);
        let Some(collection_id) = collection_path.last_segment() else {
            return;
        };
        let parent = collection_path.without_last();
        let parents = self
            .collection_parents
            .get(&collection_id.to_string())
            .cloned()
            .unwrap_or_default();
        if parents.contains(&parent) {
            return;
        }
        self.collection_parents = self
            .collection_parents
            .insert(collection_id.to_string(), parents.insert(parent));
        self.changes
            .push(PersistenceWrite::AddCollectionParent(collection_path.clone()));
    }

    /// Parent paths of every collection named `collection_id`.
    pub fn get_collection_parents(&self, collection_id: &str) -> Vec<ResourcePath> {
        self.collection_parents
            .get(&collection_id.to_string())
            .map(|parents| parents.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn add_field_index(&mut self, mut index: FieldIndex) -> FieldIndex {
        self.next_index_id += 1;
        index.index_id = self.next_index_id;
        self.changes.push(PersistenceWrite::PutFieldIndex(index.clone()));
        self.field_indexes = self.field_indexes.insert(index.index_id, index.clone());
        index
    }

    pub fn delete_field_index(&mut self, index_id: i32) {
        if !self.field_indexes.contains_key(&index_id) {
            return;
        }
        self.field_indexes = self.field_indexes.remove(&index_id);
        let stale: Vec<IndexEntry> = self
            .entries
            .iter()
            .filter(|(id, _, _)| *id == index_id)
            .cloned()
            .collect();
        for entry in stale {
            self.entries_by_document = self
                .entries_by_document
                .remove(&(index_id, entry.2.clone()));
            self.entries = self.entries.remove(&entry);
        }
        self.changes.push(PersistenceWrite::DeleteFieldIndex(index_id));
    }

    pub fn get_field_indexes(&self, collection_group: &str) -> Vec<FieldIndex> {
        self.field_indexes
            .values()
            .filter(|index| index.collection_group == collection_group)
            .cloned()
            .collect()
    }

    pub fn field_indexes(&self) -> impl Iterator<Item = &FieldIndex> {
        self.field_indexes.values()
    }

    /// Re-indexes `document`; missing or deleted documents leave every index.
    pub fn update_index_entries(&mut self, document: &MutableDocument) {
        let key = document.key();
        let indexes: Vec<FieldIndex> = self
            .field_indexes
            .values()
            .filter(|index| key.has_collection_id(&index.collection_group))
            .cloned()
            .collect();
        for index in indexes {
            if let Some(previous) = self.entries_by_document.get(&(index.index_id, key.clone())) {
                for values in previous.clone() {
                    self.entries = self.entries.remove(&(index.index_id, values, key.clone()));
                }
                self.entries_by_document = self
                    .entries_by_document
                    .remove(&(index.index_id, key.clone()));
            }
            if !document.is_found_document() {
                continue;
            }
            let rows = index_rows(&index, document);
            if rows.is_empty() {
                continue;
            }
            for values in &rows {
                self.entries = self
                    .entries
                    .insert((index.index_id, values.clone(), key.clone()));
            }
            self.entries_by_document = self
                .entries_by_document
                .insert((index.index_id, key.clone()), rows);
        }
    }

    fn index_for_target(&self, target: &Target) -> Option<&FieldIndex> {
        let group = target
            .collection_group
            .as_deref()
            .or_else(|| target.path.last_segment())?;
        let fields = target_fields(target)?;
        self.field_indexes
            .values()
            .filter(|index| index.collection_group == group)
            .max_by_key(|index| fields.iter().filter(|field| index.covers(field)).count())
    }

    pub fn get_index_type(&self, target: &Target) -> IndexType {
        if target.is_document_target() {
            return IndexType::None;
        }
        let (Some(index), Some(fields)) = (self.index_for_target(target), target_fields(target)) else {
            return IndexType::None;
        };
        let covered = fields.iter().filter(|field| index.covers(field)).count();
        if covered == 0 && !fields.is_empty() {
            IndexType::None
        } else if covered == fields.len() {
            IndexType::Full
        } else {
            IndexType::Partial
        }
    }

    /// Candidate keys for `target` when an index fully covers it.
    ///
    /// The candidates are a superset of the matches: every filter still has
    /// to be applied to the documents.
    pub fn get_documents_matching_target(&self, target: &Target) -> Option<DocumentKeySet> {
        if self.get_index_type(target) != IndexType::Full {
            return None;
        }
        let index = self.index_for_target(target)?;
        let first = index.segments.first()?;
        let needle = first_segment_needle(target, first);

        let mut keys = DocumentKeySet::new();
        for (index_id, values, key) in self.entries.iter() {
            if *index_id != index.index_id {
                continue;
            }
            if let (Some(needle), Some(value)) = (needle, values.first()) {
                if value != needle {
                    continue;
                }
            }
            let in_scope = if target.collection_group.is_some() {
                target.path.is_prefix_of(key.path())
            } else {
                key.collection_path() == target.path
            };
            if in_scope {
                keys = keys.insert(key.clone());
            }
        }
        Some(keys)
    }

    pub(crate) fn take_changes(&mut self) -> Vec<PersistenceWrite> {
        std::mem::take(&mut self.changes)
    }

    pub(crate) fn restore(
        collection_paths: impl IntoIterator<Item = ResourcePath>,
        field_indexes: impl IntoIterator<Item = FieldIndex>,
    ) -> Self {
        let mut manager = Self::new();
        for path in collection_paths {
            manager.add_to_collection_parent_index(&path);
        }
        for index in field_indexes {
            manager.next_index_id = manager.next_index_id.max(index.index_id);
            manager.field_indexes = manager.field_indexes.insert(index.index_id, index);
        }
        manager.changes.clear();
        manager
    }
}

/// Filter and order-by fields of a target, or `None` when it uses a
/// disjunction that field indexes cannot serve.
fn target_fields(target: &Target) -> Option<Vec<FieldPath>> {
    let mut fields: Vec<FieldPath> = Vec::new();
    for filter in &target.filters {
        if let Filter::Composite(composite) = filter {
            if composite.op() == CompositeOperator::Or {
                return None;
            }
        }
        for field_filter in filter.flattened() {
            if !fields.contains(field_filter.field()) {
                fields.push(field_filter.field().clone());
            }
        }
    }
    for order_by in &target.order_by {
        if !order_by.field.is_key_field() && !fields.contains(&order_by.field) {
            fields.push(order_by.field.clone());
        }
    }
    Some(fields)
}

fn first_segment_needle<'a>(target: &'a Target, segment: &IndexSegment) -> Option<&'a FirestoreValue> {
    target
        .filters
        .iter()
        .flat_map(Filter::flattened)
        .find(|filter| {
            filter.field() == &segment.field
                && match segment.kind {
                    IndexKind::Contains => filter.op() == Operator::ArrayContains,
                    _ => filter.op() == Operator::Equal,
                }
        })
        .map(|filter| filter.value())
}

/// Index rows for `document`; empty when a segment field is missing.
fn index_rows(index: &FieldIndex, document: &MutableDocument) -> Vec<Vec<FirestoreValue>> {
    let mut rows: Vec<Vec<FirestoreValue>> = vec![Vec::new()];
    for segment in &index.segments {
        let Some(value) = document.field(&segment.field) else {
            return Vec::new();
        };
        let choices: Vec<FirestoreValue> = match segment.kind {
            IndexKind::Contains => match value.as_array() {
                Some(elements) => elements.to_vec(),
                None => return Vec::new(),
            },
            _ => vec![value.clone()],
        };
        rows = rows
            .into_iter()
            .flat_map(|row| {
                choices.iter().map(move |choice| {
                    let mut row = row.clone();
                    row.push(choice.clone());
                    row
                })
            })
            .collect();
    }
    rows.sort();
    rows.dedup();
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{doc, key, map, path, query};

    #[test]
    fn tracks_collection_parents() {
        let mut manager = IndexManager::new();
        manager.add_to_collection_parent_index(&ResourcePath::from_string("rooms").unwrap());
        manager.add_to_collection_parent_index(&ResourcePath::from_string("halls/h/rooms").unwrap());
        manager.add_to_collection_parent_index(&ResourcePath::from_string("rooms").unwrap());
        let parents = manager.get_collection_parents("rooms");
        assert_eq!(parents.len(), 2);
        assert_eq!(manager.take_changes().len(), 2);
    }

    #[test]
    fn equality_index_narrows_candidates() {
        let mut manager = IndexManager::new();
        manager.add_field_index(FieldIndex::new(
            "rooms",
            vec![IndexSegment::new(path("floor"), IndexKind::Ascending)],
        ));
        manager.update_index_entries(&doc("rooms/a", 1, map(&[("floor", FirestoreValue::from_integer(1))])));
        manager.update_index_entries(&doc("rooms/b", 1, map(&[("floor", FirestoreValue::from_integer(2))])));
        manager.update_index_entries(&doc("rooms/c", 1, map(&[("name", FirestoreValue::from_string("c"))])));

        let target = query("rooms")
            .with_filter(Filter::field(path("floor"), Operator::Equal, FirestoreValue::from_integer(2)).unwrap())
            .to_target();
        assert_eq!(manager.get_index_type(&target), IndexType::Full);
        let keys = manager.get_documents_matching_target(&target).unwrap();
        assert_eq!(keys.iter().cloned().collect::<Vec<_>>(), vec![key("rooms/b")]);

        let unindexed = query("rooms")
            .with_filter(Filter::field(path("name"), Operator::Equal, FirestoreValue::from_string("c")).unwrap())
            .to_target();
        assert_eq!(manager.get_index_type(&unindexed), IndexType::None);
        assert!(manager.get_documents_matching_target(&unindexed).is_none());
    }

    #[test]
    fn contains_index_emits_one_row_per_element() {
        let mut manager = IndexManager::new();
        manager.add_field_index(FieldIndex::new(
            "rooms",
            vec![IndexSegment::new(path("tags"), IndexKind::Contains)],
        ));
        let tags = FirestoreValue::from_array(vec![FirestoreValue::from_string("x"), FirestoreValue::from_string("y")]);
        manager.update_index_entries(&doc("rooms/a", 1, map(&[("tags", tags)])));
        let target = query("rooms")
            .with_filter(Filter::field(path("tags"), Operator::ArrayContains, FirestoreValue::from_string("y")).unwrap())
            .to_target();
        assert_eq!(manager.get_documents_matching_target(&target).unwrap().len(), 1);

        manager.update_index_entries(&crate::test_support::deleted_doc("rooms/a", 2));
        assert!(manager.get_documents_matching_target(&target).unwrap().is_empty());
    }
}
