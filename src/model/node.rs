use std::collections::BTreeMap;
use std::sync::Arc;

use crate::model::entity::{EntityDef, RelationDef};
use crate::model::filter::Predicate;
use crate::model::policy::ReferrerChain;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Some(Direction::Asc),
            "desc" => Some(Direction::Desc),
            _ => None,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

/// Parse `"<field> asc|desc"`. The field name is lower-cased.
pub fn parse_order_entry(entry: &str) -> Option<(String, Direction)> {
    let parts: Vec<&str> = entry.split_whitespace().collect();
    match parts.as_slice() {
        [field, direction] => Direction::parse(direction).map(|d| (field.to_ascii_lowercase(), d)),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub column: String,
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pagination {
    pub enabled: bool,
    pub limit: u64,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

/// A relation joined into a node's own statements because a filter
/// references it.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterJoin {
    pub relation: String,
    pub table: String,
    pub def: RelationDef,
    pub kind: JoinKind,
}

/// How a relation node hangs off its parent.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationLink {
    pub name: String,
    pub def: RelationDef,
    pub parent: Arc<EntityDef>,
}

/// One validated level of a request: the top-level entity or an included
/// relation. Built during validation, read-only afterwards.
#[derive(Debug, Clone)]
pub struct Node {
    pub entity: Arc<EntityDef>,
    pub referrers: ReferrerChain,
    /// Dotted path of this node in the request, empty for the top level.
    pub path: String,
    pub link: Option<RelationLink>,
    /// Requested plain output fields.
    pub fields: Vec<String>,
    /// Plain fields and relation names, in output order.
    pub output: Vec<String>,
    /// Columns fetched for this node.
    pub attributes: Vec<String>,
    pub relations: BTreeMap<String, Node>,
    pub filter: Option<Predicate>,
    pub filter_joins: Vec<FilterJoin>,
    pub order: Vec<OrderBy>,
    pub pagination: Pagination,
    pub identifier: Option<String>,
    pub depth: usize,
}

impl Node {
    pub fn name(&self) -> &str {
        &self.entity.name
    }

    pub fn is_single(&self) -> bool {
        self.identifier.is_some()
    }

    pub fn is_paginated(&self) -> bool {
        self.pagination.enabled
    }

    /// A to-one relation yields at most one document per parent.
    pub fn is_to_one(&self) -> bool {
        self.link.as_ref().is_some_and(|l| !l.def.is_to_many())
    }

    pub fn has_to_many_joins(&self) -> bool {
        self.filter_joins.iter().any(|j| j.def.is_to_many())
    }
}
