use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::EngineError;
use crate::model::filter::FilterKind;
use crate::model::node::parse_order_entry;
use crate::model::policy::{ApiConfig, ReferrerChain, DEFAULT_POLICY};

pub const DEFAULT_MAX_DEPTH: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Text,
    Uuid,
    Number,
    Date,
    Boolean,
    Geometry,
    Json,
}

impl FieldKind {
    /// The filter grammar for this kind, if the kind can be filtered at all.
    pub fn filter_kind(self) -> Option<FilterKind> {
        match self {
            FieldKind::Text => Some(FilterKind::Text),
            FieldKind::Uuid => Some(FilterKind::Uuid),
            FieldKind::Number => Some(FilterKind::Number),
            FieldKind::Date => Some(FilterKind::Date),
            FieldKind::Boolean => Some(FilterKind::Boolean),
            FieldKind::Geometry | FieldKind::Json => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub column: String,
    pub kind: FieldKind,
}

/// A named column pair. `local` lives on the side that owns the relation
/// (or the through table for `related_keys`), `foreign` on the other side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    pub local: String,
    pub foreign: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelationKind {
    ToOne {
        keys: Vec<KeyPair>,
    },
    ToMany {
        keys: Vec<KeyPair>,
    },
    /// Many-to-many through a join table. `owner_keys` pair owner columns
    /// with through-table columns, `related_keys` pair through-table columns
    /// with related columns.
    Through {
        table: String,
        owner_keys: Vec<KeyPair>,
        related_keys: Vec<KeyPair>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationDef {
    pub entity: String,
    #[serde(flatten)]
    pub kind: RelationKind,
}

impl RelationDef {
    pub fn is_to_many(&self) -> bool {
        !matches!(self.kind, RelationKind::ToOne { .. })
    }

    /// Columns on the owning entity the relation joins on.
    pub fn owner_columns(&self) -> Vec<&str> {
        match &self.kind {
            RelationKind::ToOne { keys } | RelationKind::ToMany { keys } => {
                keys.iter().map(|k| k.local.as_str()).collect()
            }
            RelationKind::Through { owner_keys, .. } => {
                owner_keys.iter().map(|k| k.local.as_str()).collect()
            }
        }
    }

    /// Columns on the related entity the relation joins on.
    pub fn related_columns(&self) -> Vec<&str> {
        match &self.kind {
            RelationKind::ToOne { keys } | RelationKind::ToMany { keys } => {
                keys.iter().map(|k| k.foreign.as_str()).collect()
            }
            RelationKind::Through { related_keys, .. } => {
                related_keys.iter().map(|k| k.foreign.as_str()).collect()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDef {
    /// Filled in from the registry key.
    #[serde(default)]
    pub name: String,
    pub table: String,
    /// Primary key columns.
    pub primary_keys: Vec<String>,
    pub fields: BTreeMap<String, FieldDef>,
    #[serde(default)]
    pub relations: BTreeMap<String, RelationDef>,
    #[serde(default)]
    pub fulltext_column: Option<String>,
    pub policies: BTreeMap<String, ApiConfig>,
}

impl EntityDef {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.get(name)
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDef> {
        self.relations.get(name)
    }

    /// Kind of a column, looked up through the field that maps to it.
    pub fn column_kind(&self, column: &str) -> Option<FieldKind> {
        self.fields
            .values()
            .find(|f| f.column == column)
            .map(|f| f.kind)
    }

    pub fn policy(&self, referrers: &ReferrerChain) -> Result<&ApiConfig, EngineError> {
        referrers
            .resolve(&self.policies)
            .ok_or_else(|| EngineError::config(&self.name, "no applicable policy"))
    }

    fn check(&self, registry: &Registry) -> Result<(), EngineError> {
        let fail = |message: String| Err(EngineError::config(&self.name, message));

        if self.primary_keys.is_empty() {
            return fail("no primary key columns".into());
        }
        // Key columns are bound as typed arrays, so each needs a declared kind.
        if let Some(column) = self.primary_keys.iter().find(|c| self.column_kind(c).is_none()) {
            return fail(format!("primary key column '{column}' is not a declared field"));
        }
        for name in self.fields.keys().chain(self.relations.keys()) {
            if *name != name.to_ascii_lowercase() {
                return fail(format!("field and relation names must be lower case: '{name}'"));
            }
        }
        if let Some(name) = self.fields.keys().find(|n| self.relations.contains_key(*n)) {
            return fail(format!("'{name}' is both a field and a relation"));
        }
        for (name, relation) in &self.relations {
            let Some(related) = registry.entity(&relation.entity) else {
                return fail(format!(
                    "relation '{name}' points at unknown entity '{}'",
                    relation.entity
                ));
            };
            if relation.owner_columns().is_empty() || relation.related_columns().is_empty() {
                return fail(format!("relation '{name}' has no join keys"));
            }
            if let Some(column) = relation
                .owner_columns()
                .into_iter()
                .find(|c| self.column_kind(c).is_none())
            {
                return fail(format!(
                    "relation '{name}' joins on '{column}', which is not a declared field"
                ));
            }
            if let Some(column) = relation
                .related_columns()
                .into_iter()
                .find(|c| related.column_kind(c).is_none())
            {
                return fail(format!(
                    "relation '{name}' joins on '{}.{column}', which is not a declared field",
                    related.name
                ));
            }
        }
        if !self.policies.contains_key(DEFAULT_POLICY) {
            return fail(format!("missing '{DEFAULT_POLICY}' policy"));
        }
        for (key, policy) in &self.policies {
            if let Err(message) = self.check_policy(policy, registry) {
                return fail(format!("policy '{key}': {message}"));
            }
        }
        Ok(())
    }

    fn check_policy(&self, policy: &ApiConfig, registry: &Registry) -> Result<(), String> {
        for name in &policy.fields {
            if self.field(name).is_none() && self.relation(name).is_none() {
                return Err(format!("unknown field '{name}'"));
            }
        }
        for name in &policy.default_fields {
            if self.field(name).is_none() || !policy.allows_field(name) {
                return Err(format!("default field '{name}' is not a permitted field"));
            }
        }
        for name in &policy.default_relations {
            if self.relation(name).is_none() || !policy.allows_field(name) {
                return Err(format!("default relation '{name}' is not a permitted relation"));
            }
        }
        for name in &policy.order_fields {
            if self.field(name).is_none() {
                return Err(format!("unknown order field '{name}'"));
            }
        }
        for entry in &policy.default_order {
            match parse_order_entry(entry) {
                Some((field, _)) if self.field(&field).is_some() => {}
                _ => return Err(format!("malformed default order '{entry}'")),
            }
        }
        if policy.pagination {
            match (policy.default_limit, policy.max_limit) {
                (Some(default), Some(max)) if default <= max => {}
                (Some(_), Some(_)) => return Err("default_limit exceeds max_limit".into()),
                _ => return Err("pagination requires default_limit and max_limit".into()),
            }
        }
        if (policy.pagination || policy.ordering) && policy.default_order.is_empty() {
            return Err("pagination and ordering require a default_order".into());
        }
        if policy.fulltext && self.fulltext_column.is_none() {
            return Err("fulltext requires a fulltext_column".into());
        }
        for key in policy.filters.keys() {
            let field = match key.split_once('.') {
                Some((relation, field)) => self
                    .relation(relation)
                    .and_then(|r| registry.entity(&r.entity))
                    .and_then(|related| related.field(field).cloned()),
                None => self.field(key).cloned(),
            };
            match field {
                Some(field) if field.kind.filter_kind().is_some() => {}
                Some(_) => return Err(format!("filter '{key}' targets a non-filterable field")),
                None => return Err(format!("filter '{key}' targets an unknown field")),
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default = "default_max_depth")]
    max_depth: usize,
    entities: BTreeMap<String, EntityDef>,
}

fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

/// Static schema and policy lookup for every exposed entity.
#[derive(Debug, Clone)]
pub struct Registry {
    max_depth: usize,
    entities: BTreeMap<String, Arc<EntityDef>>,
}

impl Registry {
    pub fn new(entities: Vec<EntityDef>, max_depth: usize) -> Result<Self, EngineError> {
        let registry = Self {
            max_depth,
            entities: entities
                .into_iter()
                .map(|e| (e.name.to_ascii_lowercase(), Arc::new(e)))
                .collect(),
        };
        registry.check()?;
        Ok(registry)
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let file: RegistryFile =
            serde_json::from_str(json).context("Failed to parse entity registry")?;
        let entities = file
            .entities
            .into_iter()
            .map(|(name, mut def)| {
                def.name = name;
                def
            })
            .collect();
        Ok(Self::new(entities, file.max_depth)?)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read entity registry {}", path.display()))?;
        Self::from_json(&json)
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Case-insensitive entity lookup.
    pub fn entity(&self, name: &str) -> Option<Arc<EntityDef>> {
        self.entities.get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn entity_names(&self) -> impl Iterator<Item = &str> {
        self.entities.values().map(|e| e.name.as_str())
    }

    /// Reject registries with missing or inconsistent policy settings.
    pub fn check(&self) -> Result<(), EngineError> {
        for entity in self.entities.values() {
            entity.check(self)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry_json(cabin_policy: serde_json::Value) -> String {
        json!({
            "max_depth": 2,
            "entities": {
                "Cabin": {
                    "table": "cabins",
                    "primary_keys": ["id"],
                    "fields": {
                        "id": {"column": "id", "kind": "uuid"},
                        "name": {"column": "name", "kind": "text"},
                        "geometry": {"column": "geom", "kind": "geometry"},
                        "owner_id": {"column": "owner_id", "kind": "uuid"}
                    },
                    "relations": {
                        "owner": {
                            "entity": "Owner",
                            "type": "to_one",
                            "keys": [{"local": "owner_id", "foreign": "id"}]
                        }
                    },
                    "policies": { "default": cabin_policy }
                },
                "Owner": {
                    "table": "owners",
                    "primary_keys": ["id"],
                    "fields": {
                        "id": {"column": "id", "kind": "uuid"},
                        "email": {"column": "email", "kind": "text"}
                    },
                    "policies": { "default": { "fields": ["id", "email"] } }
                }
            }
        })
        .to_string()
    }

    #[test]
    fn test_load_registry() {
        let registry = Registry::from_json(&registry_json(json!({
            "fields": ["id", "name", "owner"],
            "default_fields": ["name"],
            "default_order": ["name asc"],
            "pagination": true,
            "default_limit": 10,
            "max_limit": 50,
            "filters": {
                "name": {"operators": ["eq", "contains"]},
                "owner.email": {"operators": ["missing"], "required": false}
            }
        })))
        .unwrap();

        assert_eq!(registry.max_depth(), 2);
        let cabin = registry.entity("cabin").unwrap();
        assert_eq!(cabin.name, "Cabin");
        assert_eq!(cabin.column_kind("geom"), Some(FieldKind::Geometry));
        assert_eq!(cabin.column_kind("owner_id"), Some(FieldKind::Uuid));
        assert_eq!(cabin.column_kind("is_open"), None);
        let owner = cabin.relation("owner").unwrap();
        assert!(!owner.is_to_many());
        assert_eq!(owner.owner_columns(), vec!["owner_id"]);
        assert_eq!(owner.related_columns(), vec!["id"]);
    }

    #[test]
    fn test_pagination_without_default_limit_is_rejected() {
        let err = Registry::from_json(&registry_json(json!({
            "fields": ["name"],
            "default_order": ["name asc"],
            "pagination": true,
            "max_limit": 50
        })))
        .unwrap_err();
        assert!(err.to_string().contains("default_limit"));
    }

    #[test]
    fn test_ordering_without_default_order_is_rejected() {
        let err = Registry::from_json(&registry_json(json!({
            "fields": ["name"],
            "ordering": true
        })))
        .unwrap_err();
        assert!(err.to_string().contains("default_order"));
    }

    #[test]
    fn test_filter_on_geometry_is_rejected() {
        let err = Registry::from_json(&registry_json(json!({
            "fields": ["name", "geometry"],
            "filters": { "geometry": {"operators": ["eq"]} }
        })))
        .unwrap_err();
        assert!(err.to_string().contains("non-filterable"));
    }

    #[test]
    fn test_undeclared_join_column_is_rejected() {
        let mut registry: serde_json::Value =
            serde_json::from_str(&registry_json(json!({ "fields": ["name", "owner"] }))).unwrap();
        registry["entities"]["Cabin"]["fields"]
            .as_object_mut()
            .unwrap()
            .remove("owner_id");
        let err = Registry::from_json(&registry.to_string()).unwrap_err();
        assert!(err.to_string().contains("'owner_id'"), "{err}");
    }

    #[test]
    fn test_undeclared_related_column_is_rejected() {
        let mut registry: serde_json::Value =
            serde_json::from_str(&registry_json(json!({ "fields": ["name", "owner"] }))).unwrap();
        registry["entities"]["Cabin"]["relations"]["owner"]["keys"][0]["foreign"] =
            json!("owner_ref");
        let err = Registry::from_json(&registry.to_string()).unwrap_err();
        assert!(err.to_string().contains("Owner.owner_ref"), "{err}");
    }

    #[test]
    fn test_undeclared_primary_key_is_rejected() {
        let mut registry: serde_json::Value =
            serde_json::from_str(&registry_json(json!({ "fields": ["name"] }))).unwrap();
        registry["entities"]["Owner"]["primary_keys"] = json!(["owner_no"]);
        let err = Registry::from_json(&registry.to_string()).unwrap_err();
        assert!(err.to_string().contains("'owner_no'"), "{err}");
    }

    #[test]
    fn test_through_relation_deserializes() {
        let relation: RelationDef = serde_json::from_value(json!({
            "entity": "Area",
            "type": "through",
            "table": "cabin_areas",
            "owner_keys": [{"local": "id", "foreign": "cabin_id"}],
            "related_keys": [{"local": "area_id", "foreign": "id"}]
        }))
        .unwrap();
        assert!(relation.is_to_many());
        assert_eq!(relation.owner_columns(), vec!["id"]);
        assert_eq!(relation.related_columns(), vec!["id"]);
    }
}
