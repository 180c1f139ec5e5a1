use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{FieldPath, MutableDocument};
use crate::firestore::value::{canonical_id, type_order, value_compare, FirestoreValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::LessThan => "<",
            Operator::LessThanOrEqual => "<=",
            Operator::Equal => "==",
            Operator::NotEqual => "!=",
            Operator::GreaterThan => ">",
            Operator::GreaterThanOrEqual => ">=",
            Operator::ArrayContains => "array-contains",
            Operator::ArrayContainsAny => "array-contains-any",
            Operator::In => "in",
            Operator::NotIn => "not-in",
        }
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            Operator::LessThan
                | Operator::LessThanOrEqual
                | Operator::GreaterThan
                | Operator::GreaterThanOrEqual
                | Operator::NotEqual
                | Operator::NotIn
        )
    }

    fn takes_array(&self) -> bool {
        matches!(
            self,
            Operator::In | Operator::NotIn | Operator::ArrayContainsAny
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompositeOperator {
    And,
    Or,
}

/// Resolves a field of a document, mapping `__name__` to a reference to its key.
pub(crate) fn document_field<'a>(
    document: &'a MutableDocument,
    field: &FieldPath,
) -> Option<Cow<'a, FirestoreValue>> {
    if field.is_key_field() {
        return Some(Cow::Owned(FirestoreValue::from_reference(
            document.key().path().canonical_string(),
        )));
    }
    document.field(field).map(Cow::Borrowed)
}

/// A single `field op value` condition.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldFilter {
    field: FieldPath,
    op: Operator,
    value: FirestoreValue,
}

impl FieldFilter {
    pub fn new(field: FieldPath, op: Operator, value: FirestoreValue) -> FirestoreResult<Self> {
        if op.takes_array() && !value.is_array() {
            return Err(invalid_argument(format!(
                "Invalid query. A non-empty array is required for '{}' filters.",
                op.as_str()
            )));
        }
        if op.takes_array() && value.as_array().map_or(true, <[FirestoreValue]>::is_empty) {
            return Err(invalid_argument(format!(
                "Invalid query. A non-empty array is required for '{}' filters.",
                op.as_str()
            )));
        }
        if field.is_key_field()
            && matches!(op, Operator::ArrayContains | Operator::ArrayContainsAny)
        {
            return Err(invalid_argument(format!(
                "Invalid query. You can't perform '{}' queries on the document id.",
                op.as_str()
            )));
        }
        Ok(Self { field, op, value })
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn op(&self) -> Operator {
        self.op
    }

    pub fn value(&self) -> &FirestoreValue {
        &self.value
    }

    pub fn is_inequality(&self) -> bool {
        self.op.is_inequality()
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        let field_value = document_field(document, &self.field);
        let Some(field_value) = field_value.as_deref() else {
            // Missing fields never match, including for `!=` and `not-in`.
            return false;
        };
        match self.op {
            Operator::Equal => *field_value == self.value,
            Operator::NotEqual => {
                !field_value.is_null() && *field_value != self.value
            }
            Operator::In => self
                .needles()
                .any(|needle| !needle.is_nan() && needle == field_value),
            Operator::NotIn => {
                !field_value.is_null()
                    && !self
                        .needles()
                        .any(|needle| !needle.is_nan() && needle == field_value)
            }
            Operator::ArrayContains => field_value
                .as_array()
                .map_or(false, |values| values.contains(&self.value)),
            Operator::ArrayContainsAny => field_value.as_array().map_or(false, |values| {
                self.needles().any(|needle| values.contains(needle))
            }),
            Operator::LessThan
            | Operator::LessThanOrEqual
            | Operator::GreaterThan
            | Operator::GreaterThanOrEqual => {
                type_order(field_value) == type_order(&self.value)
                    && self.matches_comparison(value_compare(field_value, &self.value))
            }
        }
    }

    fn needles(&self) -> impl Iterator<Item = &FirestoreValue> {
        self.value.as_array().unwrap_or(&[]).iter()
    }

    fn matches_comparison(&self, ordering: Ordering) -> bool {
        match self.op {
            Operator::LessThan => ordering == Ordering::Less,
            Operator::LessThanOrEqual => ordering != Ordering::Greater,
            Operator::GreaterThan => ordering == Ordering::Greater,
            Operator::GreaterThanOrEqual => ordering != Ordering::Less,
            _ => false,
        }
    }

    pub fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.op.as_str(),
            canonical_id(&self.value)
        )
    }
}

/// Conjunction or disjunction of nested filters.
#[derive(Clone, Debug, PartialEq)]
pub struct CompositeFilter {
    op: CompositeOperator,
    filters: Vec<Filter>,
}

impl CompositeFilter {
    pub fn new(op: CompositeOperator, filters: Vec<Filter>) -> Self {
        Self { op, filters }
    }

    pub fn op(&self) -> CompositeOperator {
        self.op
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        match self.op {
            CompositeOperator::And => self.filters.iter().all(|filter| filter.matches(document)),
            CompositeOperator::Or => self.filters.iter().any(|filter| filter.matches(document)),
        }
    }

    pub fn canonical_id(&self) -> String {
        let prefix = match self.op {
            CompositeOperator::And => "and",
            CompositeOperator::Or => "or",
        };
        let inner: Vec<String> = self.filters.iter().map(Filter::canonical_id).collect();
        format!("{prefix}({})", inner.join(","))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    Field(FieldFilter),
    Composite(CompositeFilter),
}

impl Filter {
    pub fn field(field: FieldPath, op: Operator, value: FirestoreValue) -> FirestoreResult<Self> {
        FieldFilter::new(field, op, value).map(Filter::Field)
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::Composite(CompositeFilter::new(CompositeOperator::And, filters))
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Composite(CompositeFilter::new(CompositeOperator::Or, filters))
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        match self {
            Filter::Field(filter) => filter.matches(document),
            Filter::Composite(filter) => filter.matches(document),
        }
    }

    pub fn canonical_id(&self) -> String {
        match self {
            Filter::Field(filter) => filter.canonical_id(),
            Filter::Composite(filter) => filter.canonical_id(),
        }
    }

    /// All field filters, regardless of nesting.
    pub fn flattened(&self) -> Vec<&FieldFilter> {
        match self {
            Filter::Field(filter) => vec![filter],
            Filter::Composite(filter) => filter
                .filters
                .iter()
                .flat_map(Filter::flattened)
                .collect(),
        }
    }

    pub fn inequality_fields(&self) -> BTreeSet<FieldPath> {
        self.flattened()
            .into_iter()
            .filter(|filter| filter.is_inequality())
            .map(|filter| filter.field.clone())
            .collect()
    }
}

impl From<FieldFilter> for Filter {
    fn from(filter: FieldFilter) -> Self {
        Filter::Field(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{DocumentKey, ObjectValue, SnapshotVersion};

    fn path(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    fn doc(entries: &[(&str, FirestoreValue)]) -> MutableDocument {
        let mut data = ObjectValue::empty();
        for (field, value) in entries {
            data.set(&path(field), value.clone());
        }
        MutableDocument::new_found_document(
            DocumentKey::from_string("rooms/a").unwrap(),
            SnapshotVersion::min(),
            SnapshotVersion::min(),
            data,
        )
    }

    fn filter(field: &str, op: Operator, value: FirestoreValue) -> FieldFilter {
        FieldFilter::new(path(field), op, value).unwrap()
    }

    fn nan() -> FirestoreValue {
        FirestoreValue::from_double(f64::NAN)
    }

    #[test]
    fn equality_against_null_and_nan() {
        let null_doc = doc(&[("x", FirestoreValue::null())]);
        let nan_doc = doc(&[("x", nan())]);
        let missing = doc(&[]);
        let eq_null = filter("x", Operator::Equal, FirestoreValue::null());
        let eq_nan = filter("x", Operator::Equal, nan());
        assert!(eq_null.matches(&null_doc));
        assert!(!eq_null.matches(&nan_doc));
        assert!(!eq_null.matches(&missing));
        assert!(eq_nan.matches(&nan_doc));
        assert!(!eq_nan.matches(&null_doc));
    }

    #[test]
    fn not_equal_excludes_missing_and_null() {
        let ne = filter("x", Operator::NotEqual, FirestoreValue::from_integer(1));
        assert!(ne.matches(&doc(&[("x", FirestoreValue::from_integer(2))])));
        assert!(!ne.matches(&doc(&[("x", FirestoreValue::from_integer(1))])));
        assert!(!ne.matches(&doc(&[("x", FirestoreValue::null())])));
        assert!(!ne.matches(&doc(&[])));

        let ne_nan = filter("x", Operator::NotEqual, nan());
        assert!(ne_nan.matches(&doc(&[("x", FirestoreValue::from_integer(2))])));
        assert!(!ne_nan.matches(&doc(&[("x", nan())])));

        let ne_null = filter("x", Operator::NotEqual, FirestoreValue::null());
        assert!(ne_null.matches(&doc(&[("x", FirestoreValue::from_integer(2))])));
        assert!(!ne_null.matches(&doc(&[("x", FirestoreValue::null())])));
    }

    #[test]
    fn in_and_not_in_ignore_nan_needles() {
        let list = FirestoreValue::from_array(vec![FirestoreValue::from_integer(1), nan()]);
        let in_filter = filter("x", Operator::In, list.clone());
        let not_in = filter("x", Operator::NotIn, list);
        assert!(in_filter.matches(&doc(&[("x", FirestoreValue::from_double(1.0))])));
        assert!(!in_filter.matches(&doc(&[("x", nan())])));
        assert!(not_in.matches(&doc(&[("x", nan())])));
        assert!(!not_in.matches(&doc(&[("x", FirestoreValue::from_integer(1))])));
        assert!(!not_in.matches(&doc(&[("x", FirestoreValue::null())])));
        assert!(!not_in.matches(&doc(&[])));
    }

    #[test]
    fn range_requires_same_type() {
        let lt = filter("x", Operator::LessThan, FirestoreValue::from_integer(5));
        assert!(lt.matches(&doc(&[("x", FirestoreValue::from_double(4.5))])));
        assert!(!lt.matches(&doc(&[("x", FirestoreValue::from_string("a"))])));
        assert!(!lt.matches(&doc(&[("x", FirestoreValue::null())])));
    }

    #[test]
    fn array_operators() {
        let tags = FirestoreValue::from_array(vec![
            FirestoreValue::from_string("a"),
            FirestoreValue::from_string("b"),
        ]);
        let document = doc(&[("tags", tags)]);
        assert!(filter("tags", Operator::ArrayContains, FirestoreValue::from_string("b")).matches(&document));
        assert!(filter(
            "tags",
            Operator::ArrayContainsAny,
            FirestoreValue::from_array(vec![FirestoreValue::from_string("z"), FirestoreValue::from_string("a")])
        )
        .matches(&document));
    }

    #[test]
    fn composite_filters() {
        let document = doc(&[("a", FirestoreValue::from_integer(1)), ("b", FirestoreValue::from_integer(2))]);
        let a1 = Filter::from(filter("a", Operator::Equal, FirestoreValue::from_integer(1)));
        let b3 = Filter::from(filter("b", Operator::Equal, FirestoreValue::from_integer(3)));
        assert!(!Filter::and(vec![a1.clone(), b3.clone()]).matches(&document));
        assert!(Filter::or(vec![a1.clone(), b3.clone()]).matches(&document));
        assert_eq!(Filter::or(vec![a1, b3]).canonical_id(), "or(a==1,b==3)");
    }

    #[test]
    fn key_field_filters_compare_paths() {
        let document = doc(&[]);
        let by_key = filter(
            "__name__",
            Operator::Equal,
            FirestoreValue::from_reference("projects/p/databases/(default)/documents/rooms/a"),
        );
        assert!(by_key.matches(&document));
    }

    #[test]
    fn rejects_invalid_filters() {
        assert!(FieldFilter::new(path("x"), Operator::In, FirestoreValue::from_integer(1)).is_err());
        assert!(FieldFilter::new(path("x"), Operator::In, FirestoreValue::from_array(Vec::new())).is_err());
        assert!(FieldFilter::new(
            FieldPath::key_path(),
            Operator::ArrayContains,
            FirestoreValue::from_integer(1)
        )
        .is_err());
    }
}
