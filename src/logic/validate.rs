//! Request validation: checks a normalized parameter tree against the
//! registry and policies and builds the validated [`Node`] tree.
//!
//! Errors are collected across the whole tree and returned together; a
//! request with any error never produces a node.

use itertools::Itertools;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::error::{EngineError, ValidationError};
use crate::logic::filter_grammar::{compile_value, parse_uuid_v4, FilterField};
use crate::model::entity::{EntityDef, FieldKind, Registry};
use crate::model::filter::{BindValue, Combinator, Comparison, Predicate, Target};
use crate::model::node::{
    parse_order_entry, FilterJoin, JoinKind, Node, OrderBy, Pagination, RelationLink,
};
use crate::model::policy::{ApiConfig, ReferrerChain};
use crate::model::request::{FilterInput, FilterLeaf, RequestParams};

/// Largest accepted `offset`.
pub const MAX_OFFSET: u64 = i32::MAX as u64;

/// Trace used for errors about a point-lookup identifier.
pub const IDENTIFIER_TRACE: &str = "id";

pub struct Validator<'r> {
    registry: &'r Registry,
    max_depth: usize,
}

/// Where a node sits in the request tree.
struct Position {
    entity: Arc<EntityDef>,
    referrers: ReferrerChain,
    link: Option<RelationLink>,
    identifier: Option<String>,
    depth: usize,
}

/// Which parameter families a node accepts.
#[derive(Debug, Clone, Copy)]
struct Toggles {
    pagination: bool,
    ordering: bool,
    fulltext: bool,
    filtering: bool,
}

impl<'r> Validator<'r> {
    pub fn new(registry: &'r Registry) -> Self {
        Self {
            registry,
            max_depth: registry.max_depth(),
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Validate a request for `entity`, or for one record of it when
    /// `identifier` is given.
    pub fn validate(
        &self,
        entity: &str,
        identifier: Option<&str>,
        params: RequestParams,
    ) -> Result<Node, EngineError> {
        let entity = self
            .registry
            .entity(entity)
            .ok_or_else(|| EngineError::UnknownEntity(entity.to_string()))?;
        let referrers = match identifier {
            Some(_) => ReferrerChain::single(&entity.name),
            None => ReferrerChain::list(),
        };
        let position = Position {
            entity,
            referrers,
            link: None,
            identifier: identifier.map(str::to_string),
            depth: 0,
        };

        let mut errors = Vec::new();
        let node = self.validate_node(position, params, &mut errors)?;
        if errors.is_empty() {
            Ok(node)
        } else {
            Err(EngineError::Validation(errors))
        }
    }

    fn validate_node(
        &self,
        position: Position,
        mut params: RequestParams,
        errors: &mut Vec<ValidationError>,
    ) -> Result<Node, EngineError> {
        errors.append(&mut params.errors);

        let entity = position.entity.clone();
        let policy = entity.policy(&position.referrers)?;
        let single = position.identifier.is_some();
        let to_one = position
            .link
            .as_ref()
            .is_some_and(|link| !link.def.is_to_many());
        let toggles = Toggles {
            pagination: policy.pagination && !single && !to_one,
            ordering: policy.ordering && !single && !to_one,
            fulltext: policy.fulltext && !single && entity.fulltext_column.is_some(),
            filtering: !single,
        };

        Whitelist::new(&entity, policy, toggles).apply(&mut params, errors);

        let pagination = if toggles.pagination {
            let (Some(default_limit), Some(max_limit)) = (policy.default_limit, policy.max_limit)
            else {
                return Err(EngineError::config(
                    &entity.name,
                    "pagination enabled without default_limit and max_limit",
                ));
            };
            Pagination {
                enabled: true,
                limit: bounded(&params.limit, params.trace("limit"), max_limit, default_limit, errors),
                offset: bounded(&params.offset, params.trace("offset"), MAX_OFFSET, 0, errors),
            }
        } else {
            Pagination::default()
        };

        let order = if single {
            Vec::new()
        } else {
            order_by(&entity, policy, &params, errors)?
        };

        let (fields, included) = select_fields(&entity, policy, &params, errors);

        let mut clauses = Vec::new();
        for input in std::mem::take(&mut params.filters) {
            if let Some(clause) = self.compile_filter(&entity, policy, &input, errors)? {
                clauses.push(clause);
            }
        }
        if let Some(clause) = search_clause(&entity, &params, errors) {
            clauses.push(clause);
        }
        if let Some(identifier) = &position.identifier {
            clauses.extend(identifier_clause(&entity, identifier, errors)?);
        }
        let filter = Predicate::combine(Combinator::And, clauses);
        let filter_joins = self.filter_joins(&entity, filter.as_ref(), &included)?;

        let mut relations = BTreeMap::new();
        let mut output = fields.clone();
        for name in &included {
            let trace = params.trace(name);
            let child_params = params
                .relations
                .remove(name)
                .unwrap_or_else(|| RequestParams::scoped(format!("{trace}.")));
            let depth = position.depth + 1;
            if depth > self.max_depth {
                errors.push(ValidationError::new(
                    trace,
                    format!(
                        "relations nest deeper than the maximum depth of {}",
                        self.max_depth
                    ),
                ));
                continue;
            }

            let def = entity
                .relation(name)
                .ok_or_else(|| EngineError::config(&entity.name, format!("unknown relation '{name}'")))?
                .clone();
            let related = self.related(&entity, &def.entity)?;
            let child = Position {
                entity: related,
                referrers: position.referrers.child(&entity.name, single, name),
                link: Some(RelationLink {
                    name: name.clone(),
                    def,
                    parent: entity.clone(),
                }),
                identifier: None,
                depth,
            };
            let child = self.validate_node(child, child_params, errors)?;
            relations.insert(name.clone(), child);
            output.push(name.clone());
        }

        for (name, rest) in std::mem::take(&mut params.relations) {
            let message = format!("relation '{name}' is not included");
            let traces = rest.traces();
            if traces.is_empty() {
                errors.push(ValidationError::new(rest.own_trace(), message));
            } else {
                for trace in traces {
                    errors.push(ValidationError::new(trace, message.clone()));
                }
            }
        }

        let attributes = attributes(
            &entity,
            &fields,
            &order,
            &relations,
            &filter_joins,
            position.link.as_ref(),
        );

        Ok(Node {
            entity,
            referrers: position.referrers,
            path: params.own_trace().to_string(),
            link: position.link,
            fields,
            output,
            attributes,
            relations,
            filter,
            filter_joins,
            order,
            pagination,
            identifier: position.identifier,
            depth: position.depth,
        })
    }

    fn related(&self, entity: &EntityDef, name: &str) -> Result<Arc<EntityDef>, EngineError> {
        self.registry.entity(name).ok_or_else(|| {
            EngineError::config(&entity.name, format!("relation points at unknown entity '{name}'"))
        })
    }

    fn compile_filter(
        &self,
        entity: &EntityDef,
        policy: &ApiConfig,
        input: &FilterInput,
        errors: &mut Vec<ValidationError>,
    ) -> Result<Option<Predicate>, EngineError> {
        match input {
            FilterInput::Group { combinator, items } => {
                let mut compiled = Vec::new();
                for item in items {
                    if let Some(clause) = self.compile_filter(entity, policy, item, errors)? {
                        compiled.push(clause);
                    }
                }
                Ok(Predicate::combine(*combinator, compiled))
            }
            FilterInput::Leaf(leaf) => self.compile_leaf(entity, policy, leaf, errors),
        }
    }

    fn compile_leaf(
        &self,
        entity: &EntityDef,
        policy: &ApiConfig,
        leaf: &FilterLeaf,
        errors: &mut Vec<ValidationError>,
    ) -> Result<Option<Predicate>, EngineError> {
        let Some(permitted) = policy.filter(&leaf.key) else {
            errors.push(ValidationError::new(&leaf.trace, "unknown filter"));
            return Ok(None);
        };
        let unknown = || EngineError::config(&entity.name, format!("filter '{}' has no field", leaf.key));

        let (target, kind) = match leaf.key.split_once('.') {
            Some((relation, name)) => {
                let def = entity.relation(relation).ok_or_else(unknown)?;
                let related = self.related(entity, &def.entity)?;
                let field = related.field(name).ok_or_else(unknown)?;
                (Target::related(relation, &field.column), field.kind)
            }
            None => {
                let field = entity.field(&leaf.key).ok_or_else(unknown)?;
                (Target::own(&field.column), field.kind)
            }
        };
        let kind = kind.filter_kind().ok_or_else(|| {
            EngineError::config(&entity.name, format!("filter '{}' is not filterable", leaf.key))
        })?;
        let field = FilterField {
            kind,
            target: &target,
            permitted,
        };

        let mut clauses = Vec::new();
        for value in &leaf.values {
            match compile_value(field, value) {
                Ok(clause) => clauses.push(clause),
                Err(err) => errors.push(ValidationError::new(&leaf.trace, err.to_string())),
            }
        }
        Ok(Predicate::combine(Combinator::And, clauses))
    }

    /// One join per relation a predicate references. A relation is
    /// inner-joined only when it is not included and every condition on it
    /// sits on an AND-only path from the root.
    fn filter_joins(
        &self,
        entity: &EntityDef,
        filter: Option<&Predicate>,
        included: &[String],
    ) -> Result<Vec<FilterJoin>, EngineError> {
        let Some(filter) = filter else {
            return Ok(Vec::new());
        };
        let optional = filter.optional_relations();
        filter
            .relations()
            .into_iter()
            .map(|relation| -> Result<FilterJoin, EngineError> {
                let def = entity.relation(relation).ok_or_else(|| {
                    EngineError::config(&entity.name, format!("unknown relation '{relation}'"))
                })?;
                let related = self.related(entity, &def.entity)?;
                let kind = if optional.contains(relation)
                    || included.iter().any(|name| name == relation)
                {
                    JoinKind::Left
                } else {
                    JoinKind::Inner
                };
                Ok(FilterJoin {
                    relation: relation.to_string(),
                    table: related.table.clone(),
                    def: def.clone(),
                    kind,
                })
            })
            .collect()
    }
}

/// The parameter names, relation scopes and filter keys a node accepts.
struct Whitelist {
    reserved: HashSet<&'static str>,
    relations: HashSet<String>,
    filters: HashSet<String>,
}

impl Whitelist {
    fn new(entity: &EntityDef, policy: &ApiConfig, toggles: Toggles) -> Self {
        let mut reserved = HashSet::from(["fields"]);
        if toggles.pagination {
            reserved.extend(["limit", "offset"]);
        }
        if toggles.ordering {
            reserved.insert("order");
        }
        if toggles.fulltext {
            reserved.insert("search");
        }
        let relations = policy
            .fields
            .iter()
            .filter(|name| entity.relation(name).is_some())
            .cloned()
            .collect();
        let filters = if toggles.filtering {
            policy.filters.keys().cloned().collect()
        } else {
            HashSet::new()
        };
        Self {
            reserved,
            relations,
            filters,
        }
    }

    /// Drop every parameter the node does not accept, one error each.
    fn apply(&self, params: &mut RequestParams, errors: &mut Vec<ValidationError>) {
        let mut reject = |trace: String| {
            errors.push(ValidationError::new(trace, "parameter is not allowed here"));
        };
        if !self.reserved.contains("limit") && !params.limit.is_empty() {
            reject(params.trace("limit"));
            params.limit.clear();
        }
        if !self.reserved.contains("offset") && !params.offset.is_empty() {
            reject(params.trace("offset"));
            params.offset.clear();
        }
        if !self.reserved.contains("search") && !params.search.is_empty() {
            reject(params.trace("search"));
            params.search.clear();
        }
        if !self.reserved.contains("order") && params.order.is_some() {
            reject(params.trace("order"));
            params.order = None;
        }

        params.filters = std::mem::take(&mut params.filters)
            .into_iter()
            .filter_map(|input| self.retain_filter(input, errors))
            .collect();

        params.relations.retain(|name, scoped| {
            if self.relations.contains(name) {
                return true;
            }
            let traces = scoped.traces();
            if traces.is_empty() {
                errors.push(ValidationError::new(scoped.own_trace(), "unknown relation"));
            } else {
                for trace in traces {
                    errors.push(ValidationError::new(trace, "unknown relation"));
                }
            }
            false
        });
    }

    fn retain_filter(
        &self,
        input: FilterInput,
        errors: &mut Vec<ValidationError>,
    ) -> Option<FilterInput> {
        match input {
            FilterInput::Leaf(leaf) if self.filters.contains(&leaf.key) => Some(FilterInput::Leaf(leaf)),
            FilterInput::Leaf(leaf) => {
                errors.push(ValidationError::new(leaf.trace, "unknown or disallowed filter"));
                None
            }
            FilterInput::Group { combinator, items } => {
                let items: Vec<_> = items
                    .into_iter()
                    .filter_map(|item| self.retain_filter(item, errors))
                    .collect();
                (!items.is_empty()).then_some(FilterInput::Group { combinator, items })
            }
        }
    }
}

/// A single integer in `[0, max]`. Absent or invalid values fall back to
/// `default`; invalid ones are also reported.
fn bounded(
    values: &[String],
    trace: String,
    max: u64,
    default: u64,
    errors: &mut Vec<ValidationError>,
) -> u64 {
    match values {
        [] => default,
        [value] => match value.trim().parse::<u64>() {
            Ok(n) if n <= max => n,
            _ => {
                errors.push(ValidationError::new(
                    trace,
                    format!("must be an integer between 0 and {max}"),
                ));
                default
            }
        },
        _ => {
            errors.push(ValidationError::new(trace, "must be given exactly once"));
            default
        }
    }
}

fn order_by(
    entity: &EntityDef,
    policy: &ApiConfig,
    params: &RequestParams,
    errors: &mut Vec<ValidationError>,
) -> Result<Vec<OrderBy>, EngineError> {
    let mut order = Vec::new();
    for entry in params.order.iter().flatten() {
        let resolved = parse_order_entry(entry)
            .filter(|(field, _)| policy.allows_order_by(field))
            .and_then(|(field, direction)| {
                let def = entity.field(&field)?;
                matches!(
                    def.kind,
                    FieldKind::Text | FieldKind::Uuid | FieldKind::Number | FieldKind::Date | FieldKind::Boolean
                )
                .then(|| OrderBy {
                    column: def.column.clone(),
                    field,
                    direction,
                })
            });
        match resolved {
            Some(by) if !order.iter().any(|o: &OrderBy| o.field == by.field) => order.push(by),
            Some(_) => {}
            None => errors.push(ValidationError::new(
                params.trace("order"),
                format!("'{entry}' is not '<field> asc|desc' on an orderable field"),
            )),
        }
    }
    if !order.is_empty() {
        return Ok(order);
    }

    for entry in &policy.default_order {
        let (field, direction) = parse_order_entry(entry)
            .ok_or_else(|| EngineError::config(&entity.name, format!("malformed default order '{entry}'")))?;
        let def = entity
            .field(&field)
            .ok_or_else(|| EngineError::config(&entity.name, format!("unknown order field '{field}'")))?;
        order.push(OrderBy {
            column: def.column.clone(),
            field,
            direction,
        });
    }
    Ok(order)
}

/// Plain fields and included relations, in request order.
fn select_fields(
    entity: &EntityDef,
    policy: &ApiConfig,
    params: &RequestParams,
    errors: &mut Vec<ValidationError>,
) -> (Vec<String>, Vec<String>) {
    let mut fields: Vec<String> = Vec::new();
    let mut relations: Vec<String> = Vec::new();

    for entry in params.fields.iter().flatten() {
        let name = entry.trim().to_ascii_lowercase();
        if !policy.allows_field(&name) {
            errors.push(ValidationError::new(
                params.trace("fields"),
                format!("unknown field '{entry}'"),
            ));
        } else if entity.relation(&name).is_some() {
            if !relations.contains(&name) {
                relations.push(name);
            }
        } else if entity.field(&name).is_some() && !fields.contains(&name) {
            fields.push(name);
        }
    }

    if fields.is_empty() && relations.is_empty() {
        fields = policy.default_fields.clone();
        relations = policy.default_relations.clone();
    }
    for (name, scoped) in &params.relations {
        if scoped.include && !relations.contains(name) {
            relations.push(name.clone());
        }
    }
    (fields, relations)
}

fn search_clause(
    entity: &EntityDef,
    params: &RequestParams,
    errors: &mut Vec<ValidationError>,
) -> Option<Predicate> {
    let column = entity.fulltext_column.as_ref()?;
    match params.search.as_slice() {
        [] => None,
        [query] if !query.trim().is_empty() => Some(Predicate::condition(
            Target::own(column),
            Comparison::TextSearch(query.trim().to_string()),
        )),
        [_] => {
            errors.push(ValidationError::new(params.trace("search"), "a value is required"));
            None
        }
        _ => {
            errors.push(ValidationError::new(params.trace("search"), "must be given exactly once"));
            None
        }
    }
}

/// Equality on the primary key, typed by the key column's kind.
fn identifier_clause(
    entity: &EntityDef,
    identifier: &str,
    errors: &mut Vec<ValidationError>,
) -> Result<Option<Predicate>, EngineError> {
    let [column] = entity.primary_keys.as_slice() else {
        return Err(EngineError::config(
            &entity.name,
            "a composite primary key cannot be addressed by one identifier",
        ));
    };
    let kind = entity.column_kind(column).ok_or_else(|| {
        EngineError::config(&entity.name, format!("primary key column '{column}' has no field"))
    })?;
    let value = match kind {
        FieldKind::Uuid => parse_uuid_v4(identifier)
            .map(BindValue::Uuid)
            .map_err(|err| err.to_string()),
        FieldKind::Number => identifier
            .trim()
            .parse::<i64>()
            .map(BindValue::Integer)
            .map_err(|_| format!("'{identifier}' is not a valid identifier")),
        _ => Ok(BindValue::Text(identifier.to_string())),
    };
    match value {
        Ok(value) => Ok(Some(Predicate::condition(
            Target::own(column),
            Comparison::Eq(value),
        ))),
        Err(message) => {
            errors.push(ValidationError::new(IDENTIFIER_TRACE, message));
            Ok(None)
        }
    }
}

/// Columns a node must fetch: primary keys, requested fields, ordering
/// columns, join keys towards children and filter joins, and the keys
/// that correlate the node with its parent.
fn attributes(
    entity: &EntityDef,
    fields: &[String],
    order: &[OrderBy],
    relations: &BTreeMap<String, Node>,
    filter_joins: &[FilterJoin],
    link: Option<&RelationLink>,
) -> Vec<String> {
    let children = relations
        .values()
        .filter_map(|child| child.link.as_ref())
        .flat_map(|link| link.def.owner_columns());
    let joins = filter_joins.iter().flat_map(|join| join.def.owner_columns());
    let own_link = link.into_iter().flat_map(|link| link.def.related_columns());

    entity
        .primary_keys
        .iter()
        .map(String::as_str)
        .chain(fields.iter().filter_map(|f| entity.field(f)).map(|f| f.column.as_str()))
        .chain(order.iter().map(|o| o.column.as_str()))
        .chain(children)
        .chain(joins)
        .chain(own_link)
        .unique()
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::normalize::normalize;
    use crate::model::node::Direction;
    use crate::model::request::RawRequest;
    use serde_json::json;
    use std::collections::BTreeSet;

    const CABIN_ID: &str = "0b8b6a3e-5b0c-4c2c-9f5e-2f1d1c1b1a19";

    fn registry() -> Registry {
        Registry::from_json(include_str!("../../tests/fixtures/registry.json")).unwrap()
    }

    fn validate(entity: &str, identifier: Option<&str>, pairs: &[(&str, &str)]) -> Result<Node, EngineError> {
        let registry = registry();
        let params = normalize(RawRequest::flat(pairs.iter().copied()));
        Validator::new(&registry).validate(entity, identifier, params)
    }

    fn traces(err: EngineError) -> BTreeSet<String> {
        match err {
            EngineError::Validation(errors) => errors.into_iter().map(|e| e.trace).collect(),
            other => panic!("expected validation errors, got {other:?}"),
        }
    }

    fn set(traces: &[&str]) -> BTreeSet<String> {
        traces.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_defaults() {
        let node = validate("cabin", None, &[]).unwrap();
        assert_eq!(node.fields, vec!["id", "name"]);
        assert_eq!(node.output, vec!["id", "name"]);
        assert_eq!(node.attributes, vec!["id", "name"]);
        assert_eq!(
            node.pagination,
            Pagination {
                enabled: true,
                limit: 20,
                offset: 0
            }
        );
        assert_eq!(node.order.len(), 1);
        assert_eq!(node.order[0].column, "name");
        assert_eq!(node.order[0].direction, Direction::Asc);
        assert!(node.filter.is_none());
        assert!(node.relations.is_empty());
    }

    #[test]
    fn test_limit_bounds() {
        for n in 0..=50u64 {
            let node = validate("cabin", None, &[("limit", &n.to_string())]).unwrap();
            assert_eq!(node.pagination.limit, n);
        }
        for bad in ["51", "-1", "abc", "2.5", ""] {
            let err = validate("cabin", None, &[("limit", bad)]).unwrap_err();
            assert_eq!(traces(err), set(&["limit"]), "limit={bad}");
        }
    }

    #[test]
    fn test_repeated_limit_is_rejected() {
        let err = validate("cabin", None, &[("limit", "2"), ("limit", "3")]).unwrap_err();
        assert_eq!(traces(err), set(&["limit"]));
    }

    #[test]
    fn test_offset_bound() {
        let node = validate("cabin", None, &[("offset", &MAX_OFFSET.to_string())]).unwrap();
        assert_eq!(node.pagination.offset, MAX_OFFSET);
        let err = validate("cabin", None, &[("offset", &(MAX_OFFSET + 1).to_string())]).unwrap_err();
        assert_eq!(traces(err), set(&["offset"]));
    }

    #[test]
    fn test_errors_are_aggregated() {
        let err = validate(
            "cabin",
            None,
            &[
                ("colour", "red"),
                ("limit", "999"),
                ("order", "name sideways"),
                ("fields", "name,nope"),
                ("owner.limit", "3"),
                ("updated", "2020-01-01"),
            ],
        )
        .unwrap_err();
        assert_eq!(
            traces(err),
            set(&["colour", "limit", "order", "fields", "owner.limit", "updated"])
        );
    }

    #[test]
    fn test_order_and_fields() {
        let node = validate(
            "cabin",
            None,
            &[("order", "beds desc, name asc"), ("fields", "name,beds,geometry")],
        )
        .unwrap();
        let order: Vec<_> = node.order.iter().map(|o| (o.column.as_str(), o.direction)).collect();
        assert_eq!(order, vec![("beds", Direction::Desc), ("name", Direction::Asc)]);
        assert_eq!(node.fields, vec!["name", "beds", "geometry"]);
        assert_eq!(node.attributes, vec!["id", "name", "beds", "geom"]);
    }

    #[test]
    fn test_point_lookup() {
        let node = validate("cabin", Some(CABIN_ID), &[]).unwrap();
        assert!(node.is_single());
        assert!(!node.pagination.enabled);
        assert!(node.order.is_empty());
        assert_eq!(node.fields, vec!["id", "name", "beds", "geometry"]);
        assert_eq!(
            node.filter,
            Some(Predicate::condition(
                Target::own("id"),
                Comparison::Eq(BindValue::Uuid(CABIN_ID.parse().unwrap()))
            ))
        );
        assert!(node.attributes.contains(&"owner_id".to_string()));

        let owner = &node.relations["owner"];
        assert_eq!(owner.referrers.as_slice(), ["Cabin.single", "Cabin.single.owner"]);
        assert!(owner.is_to_one());
        assert!(!owner.pagination.enabled);
        assert_eq!(owner.attributes, vec!["id", "name", "email"]);
    }

    #[test]
    fn test_point_lookup_rejects_list_parameters() {
        let err = validate("cabin", Some(CABIN_ID), &[("limit", "5"), ("name", "x")]).unwrap_err();
        assert_eq!(traces(err), set(&["limit", "name"]));

        let err = validate("cabin", Some("not-a-uuid"), &[]).unwrap_err();
        assert_eq!(traces(err), set(&[IDENTIFIER_TRACE]));
    }

    #[test]
    fn test_deep_filter_joins_inner() {
        let node = validate("cabin", None, &[("df.owner.email", "!")]).unwrap();
        let email = Target::related("owner", "email");
        assert_eq!(
            node.filter,
            Some(Predicate::Or(vec![
                Predicate::condition(email.clone(), Comparison::IsNull),
                Predicate::condition(email, Comparison::EmptyText),
            ]))
        );
        assert_eq!(node.filter_joins.len(), 1);
        assert_eq!(node.filter_joins[0].relation, "owner");
        assert_eq!(node.filter_joins[0].table, "owners");
        assert_eq!(node.filter_joins[0].kind, JoinKind::Inner);
        assert!(node.attributes.contains(&"owner_id".to_string()));
        assert!(node.relations.is_empty());
    }

    #[test]
    fn test_filter_on_included_relation_joins_left() {
        let node = validate(
            "cabin",
            None,
            &[("fields", "name,owner"), ("df.owner.email", "~@example")],
        )
        .unwrap();
        assert_eq!(node.filter_joins[0].kind, JoinKind::Left);
        assert!(node.relations.contains_key("owner"));
    }

    #[test]
    fn test_children() {
        let node = validate(
            "cabin",
            None,
            &[("fields", "name,areas,pictures"), ("pictures.limit", "2")],
        )
        .unwrap();
        assert_eq!(node.output, vec!["name", "areas", "pictures"]);

        let pictures = &node.relations["pictures"];
        assert_eq!(pictures.path, "pictures");
        assert_eq!(pictures.depth, 1);
        assert_eq!(pictures.pagination.limit, 2);
        assert_eq!(pictures.attributes, vec!["id", "caption", "cabin_id"]);

        let areas = &node.relations["areas"];
        assert!(!areas.pagination.enabled);
        assert_eq!(areas.attributes, vec!["id", "name"]);
        assert_eq!(areas.referrers.as_slice(), ["Cabin.areas"]);
    }

    #[test]
    fn test_scoped_params_need_an_included_relation() {
        let err = validate("cabin", None, &[("pictures.limit", "2"), ("nope.limit", "1")]).unwrap_err();
        assert_eq!(traces(err), set(&["pictures.limit", "nope.limit"]));
    }

    #[test]
    fn test_depth_is_enforced() {
        let node = validate("cabin", None, &[("fields", "owner"), ("owner.fields", "cabins")]).unwrap();
        assert_eq!(node.relations["owner"].relations["cabins"].depth, 2);

        let err = validate(
            "cabin",
            None,
            &[
                ("fields", "owner"),
                ("owner.fields", "cabins"),
                ("owner.cabins.fields", "owner"),
            ],
        )
        .unwrap_err();
        assert_eq!(traces(err), set(&["owner.cabins.owner"]));

        let registry = registry();
        let params = normalize(RawRequest::flat([("fields", "owner")]));
        let err = Validator::new(&registry)
            .with_max_depth(0)
            .validate("cabin", None, params)
            .unwrap_err();
        assert_eq!(traces(err), set(&["owner"]));
    }

    #[test]
    fn test_structured_request() {
        let registry = registry();
        let params = normalize(RawRequest::Structured(json!({
            "fields": ["name"],
            "search": "lodge",
            "filters": ["$or", [["beds", "$gte:4"], ["open", "true"]]],
            "relations": { "pictures": { "limit": 3 } }
        })));
        let node = Validator::new(&registry).validate("Cabin", None, params).unwrap();

        let Some(Predicate::And(clauses)) = &node.filter else {
            panic!("expected an AND of filter and search, got {:?}", node.filter);
        };
        assert!(matches!(clauses[0], Predicate::Or(_)));
        assert_eq!(
            clauses[1],
            Predicate::condition(Target::own("name"), Comparison::TextSearch("lodge".into()))
        );
        assert_eq!(node.output, vec!["name", "pictures"]);
        assert_eq!(node.relations["pictures"].pagination.limit, 3);
    }

    #[test]
    fn test_unknown_entity() {
        let err = validate("boat", None, &[]).unwrap_err();
        assert!(matches!(err, EngineError::UnknownEntity(name) if name == "boat"));
    }
}
