//! Translation of both request shapes into [`RequestParams`].

use serde_json::Value;

use crate::error::ValidationError;
use crate::model::filter::Combinator;
use crate::model::request::{FilterInput, FilterLeaf, RawRequest, RequestParams};

/// Prefix of a flat-form filter on a relation that is not included.
pub const DEEP_FILTER_PREFIX: &str = "df";

pub fn normalize(request: RawRequest) -> RequestParams {
    match request {
        RawRequest::Flat(pairs) => normalize_flat(pairs),
        RawRequest::Structured(value) => normalize_structured(value),
    }
}

fn normalize_flat(pairs: Vec<(String, String)>) -> RequestParams {
    let mut root = RequestParams::default();
    for (key, value) in pairs {
        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() {
            continue;
        }
        let segments: Vec<&str> = key.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            root.errors
                .push(ValidationError::new(&key, "malformed parameter name"));
            continue;
        }
        insert_flat(&mut root, &segments, &key, value);
    }
    root
}

fn insert_flat(params: &mut RequestParams, segments: &[&str], key: &str, value: String) {
    match segments {
        [DEEP_FILTER_PREFIX, relation, field] => {
            push_filter(params, format!("{relation}.{field}"), key, value)
        }
        [DEEP_FILTER_PREFIX, ..] => params.errors.push(ValidationError::new(
            key,
            "deep filters take the form df.<relation>.<field>",
        )),
        [name] => match *name {
            "limit" => params.limit.push(value),
            "offset" => params.offset.push(value),
            "search" => params.search.push(value),
            "fields" => params
                .fields
                .get_or_insert_with(Vec::new)
                .extend(split_list(&value)),
            "order" => params
                .order
                .get_or_insert_with(Vec::new)
                .extend(split_list(&value)),
            field => push_filter(params, field.to_string(), key, value),
        },
        [relation, rest @ ..] => insert_flat(params.relation_mut(relation), rest, key, value),
        [] => {}
    }
}

/// Repeated keys collect their values on one leaf.
fn push_filter(params: &mut RequestParams, filter_key: String, trace: &str, value: String) {
    let existing = params.filters.iter_mut().find_map(|f| match f {
        FilterInput::Leaf(leaf) if leaf.key == filter_key => Some(leaf),
        _ => None,
    });
    match existing {
        Some(leaf) => leaf.values.push(value),
        None => params.filters.push(FilterInput::Leaf(FilterLeaf {
            key: filter_key,
            trace: trace.to_string(),
            values: vec![value],
        })),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn normalize_structured(value: Value) -> RequestParams {
    let mut root = RequestParams::default();
    structured_into(&mut root, value);
    root
}

fn structured_into(params: &mut RequestParams, value: Value) {
    let map = match value {
        Value::Object(map) => map,
        Value::Null => return,
        _ => {
            let trace = match params.own_trace() {
                "" => "request".to_string(),
                own => own.to_string(),
            };
            params
                .errors
                .push(ValidationError::new(trace, "expected an object"));
            return;
        }
    };

    for (key, value) in map {
        let name = key.trim().to_ascii_lowercase();
        let trace = params.trace(&name);
        match name.as_str() {
            "fields" | "order" => match string_list(&value) {
                Some(list) if name == "fields" => params.fields = Some(list),
                Some(list) => params.order = Some(list),
                None => params
                    .errors
                    .push(ValidationError::new(trace, "expected a list of strings")),
            },
            "limit" | "offset" => match scalar(&value) {
                Some(s) if name == "limit" => params.limit.push(s),
                Some(s) => params.offset.push(s),
                None => params
                    .errors
                    .push(ValidationError::new(trace, "expected a number")),
            },
            "search" => match value {
                Value::String(s) => params.search.push(s),
                _ => params
                    .errors
                    .push(ValidationError::new(trace, "expected a string")),
            },
            "filters" => {
                if let Some(filter) = parse_filter(params, &value) {
                    params.filters.push(filter);
                }
            }
            "relations" => match value {
                Value::Object(relations) => {
                    for (relation, sub) in relations {
                        let child = params.relation_mut(&relation.trim().to_ascii_lowercase());
                        child.include = true;
                        structured_into(child, sub);
                    }
                }
                _ => params
                    .errors
                    .push(ValidationError::new(trace, "expected an object of relations")),
            },
            _ => params
                .errors
                .push(ValidationError::new(trace, "unknown parameter")),
        }
    }
}

fn string_list(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::String(s) => Some(split_list(s)),
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_str().map(|s| s.trim().to_string()))
            .collect(),
        _ => None,
    }
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// `["$and"|"$or", [..]]`, a single `[path, value]` leaf, or a bare list of
/// either (implicit `$and`).
fn parse_filter(params: &mut RequestParams, value: &Value) -> Option<FilterInput> {
    let trace = params.trace("filters");
    let Value::Array(items) = value else {
        params
            .errors
            .push(ValidationError::new(trace, "expected a filter tree"));
        return None;
    };

    if let [Value::String(head), rest] = items.as_slice() {
        let combinator = match head.as_str() {
            "$and" => Combinator::And,
            "$or" => Combinator::Or,
            path => return parse_leaf(params, path, rest),
        };
        let Value::Array(children) = rest else {
            params.errors.push(ValidationError::new(
                trace,
                format!("'{head}' expects a list of filters"),
            ));
            return None;
        };
        let items = children
            .iter()
            .filter_map(|child| parse_filter(params, child))
            .collect();
        return Some(FilterInput::Group { combinator, items });
    }

    if items.iter().all(Value::is_array) {
        let items = items
            .iter()
            .filter_map(|child| parse_filter(params, child))
            .collect();
        return Some(FilterInput::Group {
            combinator: Combinator::And,
            items,
        });
    }

    params.errors.push(ValidationError::new(
        trace,
        "expected [\"$and\"|\"$or\", [...]] or [<field>, <value>]",
    ));
    None
}

fn parse_leaf(params: &mut RequestParams, path: &str, value: &Value) -> Option<FilterInput> {
    let path = path.trim().to_ascii_lowercase();
    let trace = params.trace(&path);
    let key = path
        .strip_prefix("df.")
        .unwrap_or(&path)
        .to_string();

    let values = match value {
        Value::Array(items) => items.iter().map(scalar).collect::<Option<Vec<_>>>(),
        other => scalar(other).map(|s| vec![s]),
    };
    match values {
        Some(values) if !values.is_empty() => Some(FilterInput::Leaf(FilterLeaf { key, trace, values })),
        _ => {
            params.errors.push(ValidationError::new(
                trace,
                "expected a string, number or boolean value",
            ));
            None
        }
    }
}
