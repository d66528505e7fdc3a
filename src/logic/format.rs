//! Shaping fetched records into response documents.

use serde_json::{json, Map, Value};

use crate::model::node::Node;
use crate::model::record::{Record, RelationResult};

/// Render a node's result: a document or `null` for single records, an
/// array for unpaginated lists, an envelope for paginated ones.
pub fn render(node: &Node, result: &RelationResult) -> Value {
    match result {
        RelationResult::One(record) => record
            .as_deref()
            .map(|record| document(node, record))
            .unwrap_or(Value::Null),
        RelationResult::Many(records) => Value::Array(documents(node, records)),
        RelationResult::Page {
            count,
            limit,
            offset,
            records,
        } => envelope(*count, *limit, *offset, documents(node, records)),
    }
}

pub fn envelope(count: u64, limit: u64, offset: u64, documents: Vec<Value>) -> Value {
    json!({
        "count": count,
        "limit": limit,
        "offset": offset,
        "documents": documents,
    })
}

fn documents(node: &Node, records: &[Record]) -> Vec<Value> {
    records.iter().map(|record| document(node, record)).collect()
}

/// Project the node's output fields and relations from one record. Void
/// values are left out; envelopes always keep their `documents`.
pub fn document(node: &Node, record: &Record) -> Value {
    let mut doc = Map::new();
    for name in &node.output {
        let value = if let Some(child) = node.relations.get(name) {
            record.relations.get(name).map(|result| render(child, result))
        } else {
            node.entity
                .field(name)
                .and_then(|field| record.row.get(&field.column))
                .map(|value| prune(value.clone()))
        };
        if let Some(value) = value.filter(|value| !is_void(value)) {
            doc.insert(name.clone(), value);
        }
    }
    Value::Object(doc)
}

/// Remove, depth first, every object key whose value is null, an empty
/// array or an empty object.
pub fn prune(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (key, prune(value)))
                .filter(|(_, value)| !is_void(value))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(prune).collect()),
        other => other,
    }
}

pub fn is_void(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::normalize::normalize;
    use crate::logic::validate::Validator;
    use crate::model::entity::Registry;
    use crate::model::request::RawRequest;

    #[test]
    fn test_prune_removes_void_values_depth_first() {
        let value = json!({
            "name": "Skåla",
            "beds": 0,
            "open": false,
            "note": null,
            "tags": [],
            "owner": { "email": null, "phone": { "mobile": null } },
            "pictures": [{ "caption": null }, { "caption": "north face" }],
        });
        let pruned = prune(value);
        assert_eq!(
            pruned,
            json!({
                "name": "Skåla",
                "beds": 0,
                "open": false,
                "pictures": [{}, { "caption": "north face" }],
            })
        );
        assert_eq!(prune(pruned.clone()), pruned);
    }

    #[test]
    fn test_relation_envelope_keeps_empty_documents() {
        let registry =
            Registry::from_json(include_str!("../../tests/fixtures/registry.json")).unwrap();
        let params = normalize(RawRequest::flat([("fields", "name,beds,owner,pictures")]));
        let node = Validator::new(&registry).validate("cabin", None, params).unwrap();

        let mut record = Record::new(
            json!({ "id": "00000000-0000-4000-8000-000000000001", "name": null, "beds": 4 })
                .as_object()
                .cloned()
                .unwrap(),
        );
        record.relations.insert("owner".into(), RelationResult::One(None));
        record.relations.insert(
            "pictures".into(),
            RelationResult::Page {
                count: 0,
                limit: 5,
                offset: 0,
                records: Vec::new(),
            },
        );

        assert_eq!(
            document(&node, &record),
            json!({
                "beds": 4,
                "pictures": { "count": 0, "limit": 5, "offset": 0, "documents": [] }
            })
        );
    }

    #[test]
    fn test_envelope_keeps_empty_documents() {
        assert_eq!(
            envelope(0, 20, 0, Vec::new()),
            json!({ "count": 0, "limit": 20, "offset": 0, "documents": [] })
        );
    }
}
