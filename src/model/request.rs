use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::ValidationError;
use crate::model::filter::Combinator;

/// A request as it arrives, in either accepted shape.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRequest {
    /// Query-string pairs, in arrival order.
    Flat(Vec<(String, String)>),
    /// `{fields, relations, filters, order, limit, offset, search}`
    Structured(Value),
}

impl RawRequest {
    pub fn flat<K: Into<String>, V: Into<String>>(pairs: impl IntoIterator<Item = (K, V)>) -> Self {
        RawRequest::Flat(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// A filter key with its raw values. Values are ANDed.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterLeaf {
    /// `field` or `relation.field`, lower case.
    pub key: String,
    /// The parameter as the client wrote it, for error messages.
    pub trace: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterInput {
    Group {
        combinator: Combinator,
        items: Vec<FilterInput>,
    },
    Leaf(FilterLeaf),
}

impl FilterInput {
    pub fn leaves(&self) -> Vec<&FilterLeaf> {
        match self {
            FilterInput::Leaf(leaf) => vec![leaf],
            FilterInput::Group { items, .. } => items.iter().flat_map(|i| i.leaves()).collect(),
        }
    }
}

/// Canonical request parameters for one node, whichever shape they came in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestParams {
    /// Trace prefix for parameters of this node (`""`, `"owner."`, ...).
    pub scope: String,
    /// Set when the relation was named explicitly (structured `relations`).
    pub include: bool,
    pub fields: Option<Vec<String>>,
    pub order: Option<Vec<String>>,
    pub limit: Vec<String>,
    pub offset: Vec<String>,
    pub search: Vec<String>,
    /// Top-level filters, ANDed.
    pub filters: Vec<FilterInput>,
    pub relations: BTreeMap<String, RequestParams>,
    /// Malformed input found while normalizing.
    pub errors: Vec<ValidationError>,
}

impl RequestParams {
    pub fn scoped(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            ..Default::default()
        }
    }

    pub fn trace(&self, name: &str) -> String {
        format!("{}{}", self.scope, name)
    }

    /// The trace path of this node itself, without the trailing dot.
    pub fn own_trace(&self) -> &str {
        self.scope.trim_end_matches('.')
    }

    pub fn relation_mut(&mut self, name: &str) -> &mut RequestParams {
        let scope = self.trace(name) + ".";
        self.relations
            .entry(name.to_string())
            .or_insert_with(|| RequestParams::scoped(scope))
    }

    /// Trace of every parameter supplied at or below this node.
    pub fn traces(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.fields.is_some() {
            out.push(self.trace("fields"));
        }
        if self.order.is_some() {
            out.push(self.trace("order"));
        }
        if !self.limit.is_empty() {
            out.push(self.trace("limit"));
        }
        if !self.offset.is_empty() {
            out.push(self.trace("offset"));
        }
        if !self.search.is_empty() {
            out.push(self.trace("search"));
        }
        for filter in &self.filters {
            out.extend(filter.leaves().into_iter().map(|l| l.trace.clone()));
        }
        for relation in self.relations.values() {
            out.extend(relation.traces());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_traces_cover_nested_parameters() {
        let mut params = RequestParams::default();
        params.limit.push("5".into());
        let owner = params.relation_mut("owner");
        owner.fields = Some(vec!["email".into()]);
        owner.filters.push(FilterInput::Leaf(FilterLeaf {
            key: "email".into(),
            trace: "owner.email".into(),
            values: vec!["!".into()],
        }));

        let mut traces = params.traces();
        traces.sort();
        assert_eq!(traces, vec!["limit", "owner.email", "owner.fields"]);
        assert_eq!(params.relations["owner"].own_trace(), "owner");
    }
}
