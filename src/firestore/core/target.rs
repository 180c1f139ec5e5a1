use std::cmp::Ordering;

use crate::firestore::core::filter::{document_field, Filter};
use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument, ResourcePath};
use crate::firestore::value::{canonical_id, value_compare, FirestoreValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    fn canonical(&self) -> &'static str {
        match self {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        }
    }

    pub fn flipped(&self) -> Self {
        match self {
            Direction::Ascending => Direction::Descending,
            Direction::Descending => Direction::Ascending,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderBy {
    pub field: FieldPath,
    pub direction: Direction,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: Direction) -> Self {
        Self { field, direction }
    }

    pub fn ascending(field: FieldPath) -> Self {
        Self::new(field, Direction::Ascending)
    }

    /// Compares two documents on this field; missing fields sort first.
    pub fn compare(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        let ordering = if self.field.is_key_field() {
            left.key().cmp(right.key())
        } else {
            match (left.field(&self.field), right.field(&self.field)) {
                (Some(l), Some(r)) => value_compare(l, r),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        };
        match self.direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }

    fn canonical_id(&self) -> String {
        format!("{}{}", self.field.canonical_string(), self.direction.canonical())
    }
}

/// Cursor position over the ordered fields of a query.
#[derive(Clone, Debug, PartialEq)]
pub struct Bound {
    pub position: Vec<FirestoreValue>,
    /// Whether documents exactly at `position` are part of the result.
    pub inclusive: bool,
}

impl Bound {
    pub fn new(position: Vec<FirestoreValue>, inclusive: bool) -> Self {
        Self {
            position,
            inclusive,
        }
    }

    /// Compares `document` to the bound position along `order_by`.
    fn compare_to_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> Ordering {
        for (component, order) in self.position.iter().zip(order_by.iter()) {
            let ordering = match document_field(document, &order.field) {
                Some(value) => value_compare(&value, component),
                None => Ordering::Less,
            };
            let ordering = match order.direction {
                Direction::Ascending => ordering,
                Direction::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    pub fn sorts_before_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Less
        } else {
            ordering == Ordering::Greater
        }
    }

    pub fn sorts_after_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Greater
        } else {
            ordering == Ordering::Less
        }
    }

    fn canonical_position(&self) -> String {
        self.position
            .iter()
            .map(canonical_id)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// The server-facing form of a query: what a watch target listens to.
#[derive(Clone, Debug, PartialEq)]
pub struct Target {
    pub path: ResourcePath,
    pub collection_group: Option<String>,
    pub filters: Vec<Filter>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u32>,
    pub start_at: Option<Bound>,
    pub end_at: Option<Bound>,
}

impl Target {
    /// Target for a single document, as used by limbo resolution.
    pub fn for_document(key: &DocumentKey) -> Self {
        Self {
            path: key.path().clone(),
            collection_group: None,
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            start_at: None,
            end_at: None,
        }
    }

    pub fn is_document_target(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    /// `path|cg:group|f:filters|ob:orders|l:limit|lb:start|ub:end`
    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            id.push_str("|cg:");
            id.push_str(group);
        }
        id.push_str("|f:");
        id.push_str(
            &self
                .filters
                .iter()
                .map(Filter::canonical_id)
                .collect::<Vec<_>>()
                .join(","),
        );
        id.push_str("|ob:");
        id.push_str(
            &self
                .order_by
                .iter()
                .map(OrderBy::canonical_id)
                .collect::<Vec<_>>()
                .join(","),
        );
        if let Some(limit) = self.limit {
            id.push_str(&format!("|l:{limit}"));
        }
        if let Some(start) = &self.start_at {
            id.push_str("|lb:");
            id.push_str(if start.inclusive { "b:" } else { "a:" });
            id.push_str(&start.canonical_position());
        }
        if let Some(end) = &self.end_at {
            id.push_str("|ub:");
            id.push_str(if end.inclusive { "a:" } else { "b:" });
            id.push_str(&end.canonical_position());
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::filter::Operator;

    fn path(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    #[test]
    fn canonical_id_covers_every_component() {
        let target = Target {
            path: ResourcePath::from_string("rooms").unwrap(),
            collection_group: None,
            filters: vec![Filter::field(path("size"), Operator::GreaterThan, FirestoreValue::from_integer(3)).unwrap()],
            order_by: vec![OrderBy::ascending(path("size")), OrderBy::ascending(FieldPath::key_path())],
            limit: Some(10),
            start_at: Some(Bound::new(vec![FirestoreValue::from_integer(4)], true)),
            end_at: Some(Bound::new(vec![FirestoreValue::from_integer(9)], false)),
        };
        assert_eq!(
            target.canonical_id(),
            "rooms|f:size>3|ob:sizeasc,__name__asc|l:10|lb:b:4|ub:b:9"
        );
    }

    #[test]
    fn collection_group_segment_only_when_present() {
        let mut target = Target::for_document(&DocumentKey::from_string("rooms/a").unwrap());
        assert!(target.is_document_target());
        assert_eq!(target.canonical_id(), "rooms/a|f:|ob:");
        target.path = ResourcePath::root();
        target.collection_group = Some("messages".to_string());
        assert_eq!(target.canonical_id(), "|cg:messages|f:|ob:");
    }
}
