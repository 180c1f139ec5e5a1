use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::firestore::core::filter::Filter;
use crate::firestore::core::target::{Bound, Direction, OrderBy, Target};
use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument, ResourcePath};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LimitType {
    First,
    Last,
}

/// A client-side query: a [`Target`] plus the limit direction and the
/// user's explicit orderings.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<Filter>,
    explicit_order_by: Vec<OrderBy>,
    limit: Option<u32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    pub fn new(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    pub fn collection_group(collection_id: impl Into<String>) -> Self {
        let mut query = Self::new(ResourcePath::root());
        query.collection_group = Some(collection_id.into());
        query
    }

    pub fn for_document(key: &DocumentKey) -> Self {
        Self::new(key.path().clone())
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_order_by(mut self, order_by: OrderBy) -> Self {
        self.explicit_order_by.push(order_by);
        self
    }

    pub fn with_limit_to_first(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        self
    }

    pub fn with_limit_to_last(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        self
    }

    pub fn starting_at(mut self, bound: Bound) -> Self {
        self.start_at = Some(bound);
        self
    }

    pub fn ending_at(mut self, bound: Bound) -> Self {
        self.end_at = Some(bound);
        self
    }

    /// Same query scoped to one collection, used to fan out collection groups.
    pub fn as_collection_query_at_path(&self, path: ResourcePath) -> Self {
        let mut query = self.clone();
        query.path = path;
        query.collection_group = None;
        query
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    /// `true` when every document in the collection is part of the result.
    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && (self.explicit_order_by.is_empty()
                || (self.explicit_order_by.len() == 1
                    && self.explicit_order_by[0].field.is_key_field()))
    }

    fn inequality_fields(&self) -> BTreeSet<FieldPath> {
        self.filters
            .iter()
            .flat_map(|filter| filter.inequality_fields())
            .collect()
    }

    /// Explicit orderings, then any inequality field not already ordered, then
    /// the document key in the direction of the last ordering.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut result = self.explicit_order_by.clone();
        let mut seen: BTreeSet<FieldPath> =
            result.iter().map(|order| order.field.clone()).collect();
        let last_direction = self
            .explicit_order_by
            .last()
            .map_or(Direction::Ascending, |order| order.direction);

        for field in self.inequality_fields() {
            if !seen.contains(&field) && !field.is_key_field() {
                seen.insert(field.clone());
                result.push(OrderBy::new(field, last_direction));
            }
        }
        if !seen.contains(&FieldPath::key_path()) {
            result.push(OrderBy::new(FieldPath::key_path(), last_direction));
        }
        result
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        document.is_found_document()
            && self.matches_path(document)
            && self.matches_order_by(document)
            && self.filters.iter().all(|filter| filter.matches(document))
            && self.matches_bounds(document)
    }

    fn matches_path(&self, document: &MutableDocument) -> bool {
        let doc_path = document.key().path();
        if let Some(group) = &self.collection_group {
            document.key().has_collection_id(group) && self.path.is_prefix_of(doc_path)
        } else if DocumentKey::is_document_key(&self.path) {
            self.path == *doc_path
        } else {
            self.path.is_immediate_parent_of(doc_path)
        }
    }

    /// Documents missing an explicitly ordered field are excluded.
    fn matches_order_by(&self, document: &MutableDocument) -> bool {
        self.explicit_order_by.iter().all(|order| {
            order.field.is_key_field() || document.field(&order.field).is_some()
        })
    }

    fn matches_bounds(&self, document: &MutableDocument) -> bool {
        let order_by = self.normalized_order_by();
        if let Some(start) = &self.start_at {
            if !start.sorts_before_document(&order_by, document) {
                return false;
            }
        }
        if let Some(end) = &self.end_at {
            if !end.sorts_after_document(&order_by, document) {
                return false;
            }
        }
        true
    }

    /// Orders documents the way results of this query are presented.
    pub fn compare_documents(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        for order in self.normalized_order_by() {
            let ordering = order.compare(left, right);
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    pub fn comparator(&self) -> impl Fn(&MutableDocument, &MutableDocument) -> Ordering + '_ {
        let order_by = self.normalized_order_by();
        move |left, right| {
            order_by
                .iter()
                .map(|order| order.compare(left, right))
                .find(|ordering| *ordering != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        }
    }

    /// Limit-to-last queries are sent as their reversed limit-to-first form.
    pub fn to_target(&self) -> Target {
        let order_by = self.normalized_order_by();
        match self.limit_type {
            LimitType::First => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                filters: self.filters.clone(),
                order_by,
                limit: self.limit,
                start_at: self.start_at.clone(),
                end_at: self.end_at.clone(),
            },
            LimitType::Last => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                filters: self.filters.clone(),
                order_by: order_by
                    .into_iter()
                    .map(|order| OrderBy::new(order.field, order.direction.flipped()))
                    .collect(),
                limit: self.limit,
                start_at: self
                    .end_at
                    .as_ref()
                    .map(|bound| Bound::new(bound.position.clone(), bound.inclusive)),
                end_at: self
                    .start_at
                    .as_ref()
                    .map(|bound| Bound::new(bound.position.clone(), bound.inclusive)),
            },
        }
    }

    pub fn canonical_id(&self) -> String {
        let limit_type = match self.limit_type {
            LimitType::First => "f",
            LimitType::Last => "l",
        };
        format!("{}|lt:{limit_type}", self.to_target().canonical_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::filter::Operator;
    use crate::firestore::model::{ObjectValue, SnapshotVersion};
    use crate::firestore::value::FirestoreValue;

    fn path(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    fn doc(key: &str, entries: &[(&str, FirestoreValue)]) -> MutableDocument {
        let mut data = ObjectValue::empty();
        for (field, value) in entries {
            data.set(&path(field), value.clone());
        }
        MutableDocument::new_found_document(
            DocumentKey::from_string(key).unwrap(),
            SnapshotVersion::min(),
            SnapshotVersion::min(),
            data,
        )
    }

    fn rooms() -> Query {
        Query::new(ResourcePath::from_string("rooms").unwrap())
    }

    #[test]
    fn matches_immediate_children_only() {
        let query = rooms();
        assert!(query.matches(&doc("rooms/a", &[])));
        assert!(!query.matches(&doc("rooms/a/messages/b", &[])));
        assert!(!query.matches(&doc("other/a", &[])));
        assert!(!query.matches(&MutableDocument::new_no_document(
            DocumentKey::from_string("rooms/a").unwrap(),
            SnapshotVersion::min()
        )));
    }

    #[test]
    fn collection_group_matches_nested_collections() {
        let query = Query::collection_group("messages");
        assert!(query.matches(&doc("rooms/a/messages/b", &[])));
        assert!(!query.matches(&doc("rooms/a", &[])));
        assert!(query.is_collection_group_query());
    }

    #[test]
    fn normalized_order_by_adds_inequality_and_key() {
        let query = rooms()
            .with_filter(Filter::field(path("size"), Operator::GreaterThan, FirestoreValue::from_integer(1)).unwrap())
            .with_order_by(OrderBy::new(path("name"), Direction::Descending));
        let order: Vec<(String, Direction)> = query
            .normalized_order_by()
            .into_iter()
            .map(|o| (o.field.canonical_string(), o.direction))
            .collect();
        assert_eq!(
            order,
            vec![
                ("name".to_string(), Direction::Descending),
                ("size".to_string(), Direction::Descending),
                ("__name__".to_string(), Direction::Descending),
            ]
        );
    }

    #[test]
    fn explicit_order_by_excludes_missing_fields() {
        let query = rooms().with_order_by(OrderBy::ascending(path("rank")));
        assert!(!query.matches(&doc("rooms/a", &[])));
        assert!(query.matches(&doc("rooms/a", &[("rank", FirestoreValue::from_integer(1))])));
    }

    #[test]
    fn bounds_filter_results() {
        let query = rooms()
            .with_order_by(OrderBy::ascending(path("n")))
            .starting_at(Bound::new(vec![FirestoreValue::from_integer(2)], true))
            .ending_at(Bound::new(vec![FirestoreValue::from_integer(4)], false));
        let with = |n: i64| doc("rooms/a", &[("n", FirestoreValue::from_integer(n))]);
        assert!(!query.matches(&with(1)));
        assert!(query.matches(&with(2)));
        assert!(query.matches(&with(3)));
        assert!(!query.matches(&with(4)));
    }

    #[test]
    fn compare_documents_uses_key_tiebreak() {
        let query = rooms().with_order_by(OrderBy::ascending(path("n")));
        let a = doc("rooms/a", &[("n", FirestoreValue::from_integer(1))]);
        let b = doc("rooms/b", &[("n", FirestoreValue::from_integer(1))]);
        let c = doc("rooms/c", &[("n", FirestoreValue::from_integer(0))]);
        assert_eq!(query.compare_documents(&a, &b), Ordering::Less);
        assert_eq!(query.compare_documents(&a, &c), Ordering::Greater);
        let compare = query.comparator();
        assert_eq!(compare(&b, &a), Ordering::Greater);
    }

    #[test]
    fn limit_to_last_flips_target() {
        let query = rooms()
            .with_order_by(OrderBy::ascending(path("n")))
            .with_limit_to_last(2)
            .starting_at(Bound::new(vec![FirestoreValue::from_integer(1)], true));
        let target = query.to_target();
        assert_eq!(target.order_by[0].direction, Direction::Descending);
        assert!(target.start_at.is_none());
        assert!(target.end_at.is_some());
        assert_ne!(
            query.canonical_id(),
            rooms()
                .with_order_by(OrderBy::ascending(path("n")))
                .with_limit_to_first(2)
                .canonical_id()
        );
    }

    #[test]
    fn document_query() {
        let query = Query::for_document(&DocumentKey::from_string("rooms/a").unwrap());
        assert!(query.is_document_query());
        assert!(query.matches(&doc("rooms/a", &[])));
        assert!(!query.matches(&doc("rooms/b", &[])));
    }
}
