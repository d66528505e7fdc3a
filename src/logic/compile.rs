//! SQL generation for validated nodes.
//!
//! Every statement reads the node's table as `"t"`. Relations joined for
//! filtering are `"r_<relation>"` (through tables `"x_<relation>"`), the
//! unnested parent keys of a relation statement are `"p"`, a link's through
//! table is `"l"` and a lateral subquery is `"c"`.

use itertools::Itertools;
use std::fmt;

use crate::error::EngineError;
use crate::model::entity::{FieldKind, RelationDef, RelationKind};
use crate::model::filter::{BindValue, Comparison, Predicate, Target};
use crate::model::node::{JoinKind, Node, RelationLink};

/// Prefix of the columns echoing parent keys in relation rows.
pub const PARENT_KEY_PREFIX: &str = "__parent_";
/// Column holding the result of count statements.
pub const COUNT_COLUMN: &str = "count";

pub fn parent_key_alias(column: &str) -> String {
    format!("{PARENT_KEY_PREFIX}{column}")
}

/// A statement with its positional bind values (`$1` is `binds[0]`).
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub sql: String,
    pub binds: Vec<BindValue>,
}

impl fmt::Display for SqlQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)?;
        if !self.binds.is_empty() {
            write!(f, " -- [{}]", self.binds.iter().join(", "))?;
        }
        Ok(())
    }
}

/// Table aliases used in generated statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alias<'a> {
    Node,
    Relation(&'a str),
    Through(&'a str),
    Parent,
    Link,
    Lateral,
}

impl Alias<'_> {
    pub fn name(&self) -> String {
        match self {
            Alias::Node => "t".to_string(),
            Alias::Relation(relation) => format!("r_{relation}"),
            Alias::Through(relation) => format!("x_{relation}"),
            Alias::Parent => "p".to_string(),
            Alias::Link => "l".to_string(),
            Alias::Lateral => "c".to_string(),
        }
    }

    /// Qualified, quoted column reference.
    pub fn column(&self, column: &str) -> String {
        format!("{}.{}", self, quote(column))
    }
}

impl fmt::Display for Alias<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&quote(&self.name()))
    }
}

pub fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Parent key values for a relation statement: one typed array per owner
/// column of the link, all of the same length.
#[derive(Debug, Clone, PartialEq)]
pub struct ParentKeys {
    pub columns: Vec<String>,
    pub arrays: Vec<BindValue>,
}

/// Collects bind values while a statement is assembled.
#[derive(Debug, Default)]
pub struct SqlBuilder {
    binds: Vec<BindValue>,
}

impl SqlBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a bind value and return its placeholder.
    pub fn bind(&mut self, value: BindValue) -> String {
        self.binds.push(value);
        format!("${}", self.binds.len())
    }

    pub fn finish(self, sql: String) -> SqlQuery {
        SqlQuery {
            sql,
            binds: self.binds,
        }
    }

    pub fn predicate(&mut self, predicate: &Predicate) -> String {
        match predicate {
            Predicate::And(items) if items.is_empty() => "TRUE".to_string(),
            Predicate::Or(items) if items.is_empty() => "FALSE".to_string(),
            Predicate::And(items) => self.group(items, " AND "),
            Predicate::Or(items) => self.group(items, " OR "),
            Predicate::Condition { target, comparison } => self.condition(target, comparison),
        }
    }

    fn group(&mut self, items: &[Predicate], separator: &str) -> String {
        let parts: Vec<String> = items.iter().map(|item| self.predicate(item)).collect();
        format!("({})", parts.join(separator))
    }

    fn condition(&mut self, target: &Target, comparison: &Comparison) -> String {
        let column = match &target.relation {
            Some(relation) => Alias::Relation(relation).column(&target.column),
            None => Alias::Node.column(&target.column),
        };
        match comparison {
            Comparison::IsNull => format!("{column} IS NULL"),
            Comparison::IsNotNull => format!("{column} IS NOT NULL"),
            Comparison::EmptyText => format!("length({column}) = 0"),
            Comparison::NonEmptyText => format!("length({column}) > 0"),
            Comparison::Eq(value) => format!("{column} = {}", self.bind(value.clone())),
            Comparison::NotEq(value) => format!("{column} <> {}", self.bind(value.clone())),
            Comparison::NotEqIgnoreCase(value) => format!(
                "lower({column}) <> lower({})",
                self.bind(BindValue::Text(value.clone()))
            ),
            Comparison::ILike(pattern) => {
                format!("{column} ILIKE {}", self.bind(BindValue::Text(pattern.clone())))
            }
            Comparison::In(values) => format!("{column} = ANY({})", self.bind(values.clone())),
            Comparison::NotIn(values) => {
                format!("NOT ({column} = ANY({}))", self.bind(values.clone()))
            }
            Comparison::Gt(value) => format!("{column} > {}", self.bind(value.clone())),
            Comparison::Gte(value) => format!("{column} >= {}", self.bind(value.clone())),
            Comparison::Lt(value) => format!("{column} < {}", self.bind(value.clone())),
            Comparison::Lte(value) => format!("{column} <= {}", self.bind(value.clone())),
            Comparison::Between(from, to) => {
                let from = self.bind(from.clone());
                let to = self.bind(to.clone());
                format!("{column} BETWEEN {from} AND {to}")
            }
            Comparison::TextSearch(query) => format!(
                "to_tsvector('simple', {column}) @@ plainto_tsquery('simple', {})",
                self.bind(BindValue::Text(query.clone()))
            ),
        }
    }

    fn pagination(&mut self, node: &Node) -> Option<String> {
        node.pagination.enabled.then(|| {
            let limit = self.bind(BindValue::Integer(node.pagination.limit as i64));
            let offset = self.bind(BindValue::Integer(node.pagination.offset as i64));
            format!("LIMIT {limit} OFFSET {offset}")
        })
    }
}

/// The clauses of one `SELECT`.
#[derive(Debug, Default)]
struct Select {
    columns: Vec<String>,
    from: String,
    joins: Vec<String>,
    conditions: Vec<String>,
    group_by: Vec<String>,
    order_by: Vec<String>,
    limit: Option<String>,
}

impl Select {
    fn render(&self) -> String {
        let mut sql = format!("SELECT {} FROM {}", self.columns.join(", "), self.from);
        for join in &self.joins {
            sql.push(' ');
            sql.push_str(join);
        }
        if !self.conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.conditions.join(" AND "));
        }
        if !self.group_by.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&self.group_by.join(", "));
        }
        if !self.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.order_by.join(", "));
        }
        if let Some(limit) = &self.limit {
            sql.push(' ');
            sql.push_str(limit);
        }
        sql
    }
}

/// Row statement for a top-level node.
pub fn row_query(node: &Node) -> SqlQuery {
    let mut builder = SqlBuilder::new();
    let select = Select {
        columns: projection(node),
        from: table_source(&node.entity.table, Alias::Node),
        joins: filter_joins(node),
        conditions: node.filter.iter().map(|p| builder.predicate(p)).collect(),
        group_by: if node.has_to_many_joins() {
            primary_key_columns(node, Alias::Node)
        } else {
            Vec::new()
        },
        order_by: order_terms(node, Alias::Node),
        limit: builder.pagination(node),
    };
    builder.finish(select.render())
}

/// Count statement for a top-level node. Never paginated.
pub fn count_query(node: &Node) -> SqlQuery {
    let mut builder = SqlBuilder::new();
    let select = Select {
        columns: vec![count_column(node)],
        from: table_source(&node.entity.table, Alias::Node),
        joins: filter_joins(node),
        conditions: node.filter.iter().map(|p| builder.predicate(p)).collect(),
        ..Default::default()
    };
    builder.finish(select.render())
}

/// Row statement for a relation node, for every parent at once. Paginated
/// relations page each parent separately through a lateral subquery.
pub fn relation_row_query(node: &Node, parents: &ParentKeys) -> Result<SqlQuery, EngineError> {
    let link = relation_link(node, parents)?;
    let mut builder = SqlBuilder::new();
    let parent_source = parent_source(&mut builder, parents);

    let mut columns = projection(node);
    columns.extend(parent_echo(parents));
    let group_by = |extra: Vec<String>| {
        if node.has_to_many_joins() {
            extra.into_iter().chain(primary_key_columns(node, Alias::Node)).collect()
        } else {
            Vec::new()
        }
    };

    if !node.is_paginated() {
        let mut joins = joins_from_parent(node, &link.def);
        joins.extend(filter_joins(node));
        let select = Select {
            columns,
            from: parent_source,
            joins,
            conditions: node.filter.iter().map(|p| builder.predicate(p)).collect(),
            group_by: group_by(parent_columns(parents)),
            order_by: order_terms(node, Alias::Node),
            limit: None,
        };
        return Ok(builder.finish(select.render()));
    }

    let (mut joins, mut conditions) = lateral_link(&link.def);
    joins.extend(filter_joins(node));
    conditions.extend(node.filter.iter().map(|p| builder.predicate(p)));
    let inner = Select {
        columns,
        from: table_source(&node.entity.table, Alias::Node),
        joins,
        conditions,
        group_by: group_by(Vec::new()),
        order_by: order_terms(node, Alias::Node),
        limit: builder.pagination(node),
    };
    let outer_order = parents
        .columns
        .iter()
        .map(|column| Alias::Lateral.column(&parent_key_alias(column)))
        .chain(order_terms(node, Alias::Lateral))
        .collect();
    let outer = Select {
        columns: vec![format!("{}.*", Alias::Lateral)],
        from: format!(
            "{parent_source} CROSS JOIN LATERAL ({}) AS {}",
            inner.render(),
            Alias::Lateral
        ),
        order_by: outer_order,
        ..Default::default()
    };
    Ok(builder.finish(outer.render()))
}

/// Per-parent count statement for a paginated relation node. Parents with
/// no related rows produce no row.
pub fn relation_count_query(node: &Node, parents: &ParentKeys) -> Result<SqlQuery, EngineError> {
    let link = relation_link(node, parents)?;
    let mut builder = SqlBuilder::new();
    let parent_source = parent_source(&mut builder, parents);

    let mut columns = parent_echo(parents);
    columns.push(count_column(node));
    let mut joins = joins_from_parent(node, &link.def);
    joins.extend(filter_joins(node));
    let select = Select {
        columns,
        from: parent_source,
        joins,
        conditions: node.filter.iter().map(|p| builder.predicate(p)).collect(),
        group_by: parent_columns(parents),
        ..Default::default()
    };
    Ok(builder.finish(select.render()))
}

fn relation_link<'n>(node: &'n Node, parents: &ParentKeys) -> Result<&'n RelationLink, EngineError> {
    let link = node
        .link
        .as_ref()
        .ok_or_else(|| EngineError::config(node.name(), "relation statement for a top-level node"))?;
    let expected = link.def.owner_columns();
    if parents.columns != expected || parents.arrays.len() != expected.len() {
        return Err(EngineError::config(
            &link.parent.name,
            format!("parent keys of relation '{}' do not match its owner columns", link.name),
        ));
    }
    Ok(link)
}

fn table_source(table: &str, alias: Alias<'_>) -> String {
    format!("{} AS {}", quote(table), alias)
}

fn projection(node: &Node) -> Vec<String> {
    node.attributes
        .iter()
        .map(|column| match node.entity.column_kind(column) {
            Some(FieldKind::Geometry) => format!(
                "ST_AsGeoJSON(ST_Transform({}, 4326))::json AS {}",
                Alias::Node.column(column),
                quote(column)
            ),
            _ => Alias::Node.column(column),
        })
        .collect()
}

fn primary_key_columns(node: &Node, alias: Alias<'_>) -> Vec<String> {
    node.entity
        .primary_keys
        .iter()
        .map(|column| alias.column(column))
        .collect()
}

fn count_column(node: &Node) -> String {
    let keys = primary_key_columns(node, Alias::Node);
    let distinct = match keys.as_slice() {
        [key] => key.clone(),
        _ => format!("({})", keys.join(", ")),
    };
    format!("COUNT(DISTINCT {distinct}) AS {}", quote(COUNT_COLUMN))
}

/// Requested order, then primary key columns as a tiebreak.
fn order_terms(node: &Node, alias: Alias<'_>) -> Vec<String> {
    let ordered = node
        .order
        .iter()
        .map(|order| (order.column.as_str(), order.direction.as_sql()));
    let tiebreak = node
        .entity
        .primary_keys
        .iter()
        .filter(|pk| !node.order.iter().any(|o| o.column == **pk))
        .map(|pk| (pk.as_str(), "ASC"));
    ordered
        .chain(tiebreak)
        .map(|(column, direction)| format!("{} {direction}", alias.column(column)))
        .collect()
}

fn filter_joins(node: &Node) -> Vec<String> {
    node.filter_joins
        .iter()
        .flat_map(|join| {
            let keyword = match join.kind {
                JoinKind::Inner => "INNER JOIN",
                JoinKind::Left => "LEFT JOIN",
            };
            let related = Alias::Relation(&join.relation);
            match &join.def.kind {
                RelationKind::ToOne { keys } | RelationKind::ToMany { keys } => {
                    let on = keys
                        .iter()
                        .map(|k| format!("{} = {}", Alias::Node.column(&k.local), related.column(&k.foreign)))
                        .join(" AND ");
                    vec![format!("{keyword} {} ON {on}", table_source(&join.table, related))]
                }
                RelationKind::Through {
                    table,
                    owner_keys,
                    related_keys,
                } => {
                    let through = Alias::Through(&join.relation);
                    let owner_on = owner_keys
                        .iter()
                        .map(|k| format!("{} = {}", Alias::Node.column(&k.local), through.column(&k.foreign)))
                        .join(" AND ");
                    let related_on = related_keys
                        .iter()
                        .map(|k| format!("{} = {}", through.column(&k.local), related.column(&k.foreign)))
                        .join(" AND ");
                    vec![
                        format!("{keyword} {} ON {owner_on}", table_source(table, through)),
                        format!("{keyword} {} ON {related_on}", table_source(&join.table, related)),
                    ]
                }
            }
        })
        .collect()
}

/// `unnest($1::uuid[], ...) AS "p"("col", ...)`
fn parent_source(builder: &mut SqlBuilder, parents: &ParentKeys) -> String {
    let arrays = parents
        .arrays
        .iter()
        .map(|array| {
            let cast = array.sql_type();
            format!("{}::{cast}", builder.bind(array.clone()))
        })
        .collect::<Vec<_>>()
        .join(", ");
    let columns = parents.columns.iter().map(|c| quote(c)).join(", ");
    format!("unnest({arrays}) AS {}({columns})", Alias::Parent)
}

fn parent_columns(parents: &ParentKeys) -> Vec<String> {
    parents
        .columns
        .iter()
        .map(|column| Alias::Parent.column(column))
        .collect()
}

fn parent_echo(parents: &ParentKeys) -> Vec<String> {
    parents
        .columns
        .iter()
        .map(|column| {
            format!(
                "{} AS {}",
                Alias::Parent.column(column),
                quote(&parent_key_alias(column))
            )
        })
        .collect()
}

/// Joins reaching the node's table from the unnested parent keys.
fn joins_from_parent(node: &Node, def: &RelationDef) -> Vec<String> {
    let related = table_source(&node.entity.table, Alias::Node);
    match &def.kind {
        RelationKind::ToOne { keys } | RelationKind::ToMany { keys } => {
            let on = keys
                .iter()
                .map(|k| format!("{} = {}", Alias::Node.column(&k.foreign), Alias::Parent.column(&k.local)))
                .join(" AND ");
            vec![format!("INNER JOIN {related} ON {on}")]
        }
        RelationKind::Through {
            table,
            owner_keys,
            related_keys,
        } => {
            let owner_on = owner_keys
                .iter()
                .map(|k| format!("{} = {}", Alias::Link.column(&k.foreign), Alias::Parent.column(&k.local)))
                .join(" AND ");
            let related_on = related_keys
                .iter()
                .map(|k| format!("{} = {}", Alias::Node.column(&k.foreign), Alias::Link.column(&k.local)))
                .join(" AND ");
            vec![
                format!("INNER JOIN {} ON {owner_on}", table_source(table, Alias::Link)),
                format!("INNER JOIN {related} ON {related_on}"),
            ]
        }
    }
}

/// Joins and conditions tying the node's table to the current parent row
/// inside a lateral subquery.
fn lateral_link(def: &RelationDef) -> (Vec<String>, Vec<String>) {
    match &def.kind {
        RelationKind::ToOne { keys } | RelationKind::ToMany { keys } => {
            let conditions = keys
                .iter()
                .map(|k| format!("{} = {}", Alias::Node.column(&k.foreign), Alias::Parent.column(&k.local)))
                .collect();
            (Vec::new(), conditions)
        }
        RelationKind::Through {
            table,
            owner_keys,
            related_keys,
        } => {
            let on = related_keys
                .iter()
                .map(|k| format!("{} = {}", Alias::Node.column(&k.foreign), Alias::Link.column(&k.local)))
                .join(" AND ");
            let conditions = owner_keys
                .iter()
                .map(|k| format!("{} = {}", Alias::Link.column(&k.foreign), Alias::Parent.column(&k.local)))
                .collect();
            (
                vec![format!("INNER JOIN {} ON {on}", table_source(table, Alias::Link))],
                conditions,
            )
        }
    }
}
