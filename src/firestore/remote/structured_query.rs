use serde_json::{json, Value as JsonValue};

use crate::firestore::core::filter::{CompositeOperator, FieldFilter, Filter, Operator};
use crate::firestore::core::target::{Bound, Direction, Target};
use crate::firestore::remote::serializer::{encode_value, JsonProtoSerializer};

/// Encodes a non-document target as `{parent, structuredQuery}`.
pub(crate) fn encode_query_target(serializer: &JsonProtoSerializer, target: &Target) -> JsonValue {
    let (parent, collection_id) = match &target.collection_group {
        Some(group) => (target.path.clone(), group.clone()),
        None => (
            target.path.without_last(),
            target.path.last_segment().unwrap_or_default().to_string(),
        ),
    };
    json!({
        "parent": serializer.resource_name(&parent),
        "structuredQuery": encode_structured_query(target, &collection_id),
    })
}

fn encode_structured_query(target: &Target, collection_id: &str) -> JsonValue {
    let mut structured = serde_json::Map::new();
    structured.insert(
        "from".to_string(),
        json!([{
            "collectionId": collection_id,
            "allDescendants": target.collection_group.is_some(),
        }]),
    );

    if !target.filters.is_empty() {
        let filter = if target.filters.len() == 1 {
            encode_filter(&target.filters[0])
        } else {
            encode_composite(CompositeOperator::And, &target.filters)
        };
        structured.insert("where".to_string(), filter);
    }

    if !target.order_by.is_empty() {
        let orders: Vec<_> = target
            .order_by
            .iter()
            .map(|order| {
                json!({
                    "field": { "fieldPath": order.field.canonical_string() },
                    "direction": match order.direction {
                        Direction::Ascending => "ASCENDING",
                        Direction::Descending => "DESCENDING",
                    },
                })
            })
            .collect();
        structured.insert("orderBy".to_string(), JsonValue::Array(orders));
    }

    if let Some(limit) = target.limit {
        structured.insert("limit".to_string(), json!(limit));
    }
    if let Some(start) = &target.start_at {
        structured.insert("startAt".to_string(), encode_cursor(start, true));
    }
    if let Some(end) = &target.end_at {
        structured.insert("endAt".to_string(), encode_cursor(end, false));
    }

    JsonValue::Object(structured)
}

fn encode_filter(filter: &Filter) -> JsonValue {
    match filter {
        Filter::Field(field_filter) => encode_field_filter(field_filter),
        Filter::Composite(composite) => encode_composite(composite.op(), composite.filters()),
    }
}

fn encode_composite(op: CompositeOperator, filters: &[Filter]) -> JsonValue {
    json!({
        "compositeFilter": {
            "op": match op {
                CompositeOperator::And => "AND",
                CompositeOperator::Or => "OR",
            },
            "filters": filters.iter().map(encode_filter).collect::<Vec<_>>(),
        }
    })
}

fn encode_field_filter(filter: &FieldFilter) -> JsonValue {
    let field = json!({ "fieldPath": filter.field().canonical_string() });
    // Equality against null and NaN travels as a unary filter.
    let unary = match (filter.op(), filter.value()) {
        (Operator::Equal, value) if value.is_null() => Some("IS_NULL"),
        (Operator::Equal, value) if value.is_nan() => Some("IS_NAN"),
        (Operator::NotEqual, value) if value.is_null() => Some("IS_NOT_NULL"),
        (Operator::NotEqual, value) if value.is_nan() => Some("IS_NOT_NAN"),
        _ => None,
    };
    if let Some(op) = unary {
        return json!({ "unaryFilter": { "field": field, "op": op } });
    }
    json!({
        "fieldFilter": {
            "field": field,
            "op": operator_name(filter.op()),
            "value": encode_value(filter.value()),
        }
    })
}

fn operator_name(op: Operator) -> &'static str {
    match op {
        Operator::LessThan => "LESS_THAN",
        Operator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
        Operator::Equal => "EQUAL",
        Operator::NotEqual => "NOT_EQUAL",
        Operator::GreaterThan => "GREATER_THAN",
        Operator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
        Operator::ArrayContains => "ARRAY_CONTAINS",
        Operator::ArrayContainsAny => "ARRAY_CONTAINS_ANY",
        Operator::In => "IN",
        Operator::NotIn => "NOT_IN",
    }
}

fn encode_cursor(bound: &Bound, start: bool) -> JsonValue {
    json!({
        "values": bound.position.iter().map(encode_value).collect::<Vec<_>>(),
        "before": if start { bound.inclusive } else { !bound.inclusive },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::DatabaseId;
    use crate::firestore::value::FirestoreValue;
    use crate::test_support::{path, query};

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::default("p"))
    }

    #[test]
    fn collection_query_uses_parent_and_collection_id() {
        let target = query("rooms/eros/messages")
            .with_limit_to_first(3)
            .to_target();
        let encoded = encode_query_target(&serializer(), &target);
        assert_eq!(
            encoded["parent"],
            json!("projects/p/databases/(default)/documents/rooms/eros")
        );
        let structured = &encoded["structuredQuery"];
        assert_eq!(structured["from"][0]["collectionId"], json!("messages"));
        assert_eq!(structured["from"][0]["allDescendants"], json!(false));
        assert_eq!(structured["limit"], json!(3));
        assert_eq!(structured["orderBy"][0]["field"]["fieldPath"], json!("__name__"));
    }

    #[test]
    fn null_equality_becomes_unary_filter() {
        let target = query("rooms")
            .with_filter(Filter::field(path("owner"), Operator::Equal, FirestoreValue::null()).unwrap())
            .to_target();
        let encoded = encode_query_target(&serializer(), &target);
        assert_eq!(
            encoded["structuredQuery"]["where"],
            json!({ "unaryFilter": { "field": { "fieldPath": "owner" }, "op": "IS_NULL" } })
        );
    }
}
