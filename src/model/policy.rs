use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::filter::Operator;

/// Policy key every entity must define.
pub const DEFAULT_POLICY: &str = "default";

/// Per-entity, per-referrer API configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Every output field and relation a client may request.
    pub fields: Vec<String>,
    /// Plain fields returned when the request names none.
    pub default_fields: Vec<String>,
    /// Relations included when the request names no fields.
    pub default_relations: Vec<String>,
    /// Entries of the form `"<field> asc|desc"`.
    pub default_order: Vec<String>,
    /// Fields a client may order by. Empty means any plain field in `fields`.
    pub order_fields: Vec<String>,
    pub pagination: bool,
    pub ordering: bool,
    pub fulltext: bool,
    pub default_limit: Option<u64>,
    pub max_limit: Option<u64>,
    /// Filterable keys (`field` or `relation.field`) and their operators.
    pub filters: BTreeMap<String, FilterableField>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterableField {
    pub operators: Vec<Operator>,
    /// A supplied filter must carry a non-empty value.
    #[serde(default)]
    pub required: bool,
}

impl FilterableField {
    pub fn allows(&self, operator: Operator) -> bool {
        self.operators.contains(&operator)
    }
}

impl ApiConfig {
    pub fn allows_field(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f == name)
    }

    pub fn allows_order_by(&self, name: &str) -> bool {
        if self.order_fields.is_empty() {
            self.allows_field(name)
        } else {
            self.order_fields.iter().any(|f| f == name)
        }
    }

    pub fn filter(&self, key: &str) -> Option<&FilterableField> {
        self.filters.get(key)
    }
}

/// Ordered policy lookup keys for a node: where in the request tree it was
/// reached from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferrerChain(Vec<String>);

impl ReferrerChain {
    /// A top-level list request.
    pub fn list() -> Self {
        Self(Vec::new())
    }

    /// A top-level request addressing one record of `entity` by identifier.
    pub fn single(entity: &str) -> Self {
        Self(vec![format!("{entity}.single")])
    }

    /// The chain for `relation` of a node of `entity` with this chain.
    pub fn child(&self, entity: &str, single_parent: bool, relation: &str) -> Self {
        let mut chain = self.0.clone();
        if single_parent {
            chain.push(format!("{entity}.single.{relation}"));
        } else {
            chain.push(format!("{entity}.{relation}"));
        }
        Self(chain)
    }

    /// Keys to try, most specific first, ending with the default policy.
    pub fn lookup_keys(&self) -> impl Iterator<Item = &str> {
        self.0
            .iter()
            .rev()
            .map(String::as_str)
            .chain(std::iter::once(DEFAULT_POLICY))
    }

    /// First-match-wins lookup over `lookup_keys`.
    pub fn resolve<'p>(&self, policies: &'p BTreeMap<String, ApiConfig>) -> Option<&'p ApiConfig> {
        self.lookup_keys().find_map(|key| policies.get(key))
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}
