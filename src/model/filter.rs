use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// The field kinds a filter can be compiled for. Chosen once during
/// validation and carried with the clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterKind {
    Text,
    Uuid,
    Number,
    Date,
    Boolean,
}

impl fmt::Display for FilterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FilterKind::Text => "text",
            FilterKind::Uuid => "uuid",
            FilterKind::Number => "number",
            FilterKind::Date => "date",
            FilterKind::Boolean => "boolean",
        };
        f.write_str(name)
    }
}

/// Filter operators as named in a policy's allow-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    /// Empty value: the field has a value.
    Exists,
    /// `!`: the field is null or empty.
    Missing,
    Eq,
    Ne,
    Contains,
    StartsWith,
    EndsWith,
    In,
    Nin,
    Gt,
    Gte,
    Lt,
    Lte,
    After,
    Before,
    Between,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Exists => "exists",
            Operator::Missing => "missing",
            Operator::Eq => "eq",
            Operator::Ne => "ne",
            Operator::Contains => "contains",
            Operator::StartsWith => "starts_with",
            Operator::EndsWith => "ends_with",
            Operator::In => "in",
            Operator::Nin => "nin",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::After => "after",
            Operator::Before => "before",
            Operator::Between => "between",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combinator {
    And,
    Or,
}

/// Typed bind parameter for a compiled statement.
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Text(String),
    Uuid(Uuid),
    Number(f64),
    Integer(i64),
    Timestamp(DateTime<Utc>),
    Boolean(bool),
    TextArray(Vec<String>),
    UuidArray(Vec<Uuid>),
    NumberArray(Vec<f64>),
    IntegerArray(Vec<i64>),
}

impl BindValue {
    /// Postgres type name used when the parameter needs an explicit cast.
    pub fn sql_type(&self) -> &'static str {
        match self {
            BindValue::Text(_) => "text",
            BindValue::Uuid(_) => "uuid",
            BindValue::Number(_) => "float8",
            BindValue::Integer(_) => "int8",
            BindValue::Timestamp(_) => "timestamptz",
            BindValue::Boolean(_) => "boolean",
            BindValue::TextArray(_) => "text[]",
            BindValue::UuidArray(_) => "uuid[]",
            BindValue::NumberArray(_) => "float8[]",
            BindValue::IntegerArray(_) => "int8[]",
        }
    }
}

impl fmt::Display for BindValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindValue::Text(s) => write!(f, "{s:?}"),
            BindValue::Uuid(u) => write!(f, "{u}"),
            BindValue::Number(n) => write!(f, "{n}"),
            BindValue::Integer(n) => write!(f, "{n}"),
            BindValue::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
            BindValue::Boolean(b) => write!(f, "{b}"),
            BindValue::TextArray(v) => write!(f, "{v:?}"),
            BindValue::UuidArray(v) => {
                write!(f, "[")?;
                for (i, u) in v.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{u}")?;
                }
                write!(f, "]")
            }
            BindValue::NumberArray(v) => write!(f, "{v:?}"),
            BindValue::IntegerArray(v) => write!(f, "{v:?}"),
        }
    }
}

/// Column a condition applies to. `relation` names a relation of the node's
/// entity whose joined table holds the column; `None` is the node's own table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub relation: Option<String>,
    pub column: String,
}

impl Target {
    pub fn own(column: impl Into<String>) -> Self {
        Self {
            relation: None,
            column: column.into(),
        }
    }

    pub fn related(relation: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            relation: Some(relation.into()),
            column: column.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Comparison {
    IsNull,
    IsNotNull,
    /// `length(col) = 0`
    EmptyText,
    /// `length(col) > 0`
    NonEmptyText,
    Eq(BindValue),
    NotEq(BindValue),
    NotEqIgnoreCase(String),
    /// Case-insensitive pattern, already escaped for `ILIKE`.
    ILike(String),
    In(BindValue),
    NotIn(BindValue),
    Gt(BindValue),
    Gte(BindValue),
    Lt(BindValue),
    Lte(BindValue),
    Between(BindValue, BindValue),
    TextSearch(String),
}

/// Canonical where-clause tree shared by both request shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Condition { target: Target, comparison: Comparison },
}

impl Predicate {
    pub fn condition(target: Target, comparison: Comparison) -> Self {
        Predicate::Condition { target, comparison }
    }

    /// Combine clauses, collapsing the trivial cases.
    pub fn combine(combinator: Combinator, mut items: Vec<Predicate>) -> Option<Predicate> {
        match items.len() {
            0 => None,
            1 => items.pop(),
            _ => Some(match combinator {
                Combinator::And => Predicate::And(items),
                Combinator::Or => Predicate::Or(items),
            }),
        }
    }

    /// Relations referenced by relation-qualified conditions anywhere in the tree.
    pub fn relations(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.collect_relations(&mut out);
        out
    }

    fn collect_relations<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Predicate::And(items) | Predicate::Or(items) => {
                for item in items {
                    item.collect_relations(out);
                }
            }
            Predicate::Condition { target, .. } => {
                if let Some(relation) = &target.relation {
                    out.insert(relation.as_str());
                }
            }
        }
    }

    /// Relations with at least one condition below an `Or`. Such a
    /// relation must not restrict rows through an inner join.
    pub fn optional_relations(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.collect_optional_relations(false, &mut out);
        out
    }

    fn collect_optional_relations<'a>(&'a self, under_or: bool, out: &mut BTreeSet<&'a str>) {
        match self {
            Predicate::And(items) => {
                for item in items {
                    item.collect_optional_relations(under_or, out);
                }
            }
            Predicate::Or(items) => {
                for item in items {
                    item.collect_optional_relations(true, out);
                }
            }
            Predicate::Condition { target, .. } => {
                if let (true, Some(relation)) = (under_or, &target.relation) {
                    out.insert(relation.as_str());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_collapses_single_clause() {
        let clause = Predicate::condition(Target::own("name"), Comparison::IsNull);
        assert_eq!(
            Predicate::combine(Combinator::And, vec![clause.clone()]),
            Some(clause.clone())
        );
        assert_eq!(Predicate::combine(Combinator::Or, Vec::new()), None);
        assert!(matches!(
            Predicate::combine(Combinator::Or, vec![clause.clone(), clause]),
            Some(Predicate::Or(items)) if items.len() == 2
        ));
    }

    #[test]
    fn test_relations_are_collected_from_nested_groups() {
        let tree = Predicate::And(vec![
            Predicate::condition(Target::own("name"), Comparison::IsNotNull),
            Predicate::Or(vec![
                Predicate::condition(Target::related("owner", "email"), Comparison::IsNull),
                Predicate::condition(Target::related("areas", "name"), Comparison::IsNull),
            ]),
        ]);
        let relations: Vec<_> = tree.relations().into_iter().collect();
        assert_eq!(relations, vec!["areas", "owner"]);
    }

    #[test]
    fn test_optional_relations_are_those_below_or() {
        let owner = || Predicate::condition(Target::related("owner", "email"), Comparison::IsNull);
        let tree = Predicate::And(vec![
            Predicate::condition(Target::related("areas", "name"), Comparison::IsNotNull),
            Predicate::Or(vec![
                Predicate::condition(Target::own("name"), Comparison::IsNull),
                Predicate::And(vec![owner()]),
            ]),
        ]);
        assert_eq!(tree.optional_relations().into_iter().collect::<Vec<_>>(), vec!["owner"]);
        assert!(Predicate::And(vec![owner(), owner()]).optional_relations().is_empty());
    }

    #[test]
    fn test_operator_names_match_serde() {
        let op: Operator = serde_json::from_str("\"starts_with\"").unwrap();
        assert_eq!(op, Operator::StartsWith);
        assert_eq!(op.as_str(), "starts_with");
    }
}
