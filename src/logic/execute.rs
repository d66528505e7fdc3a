//! Statement execution for a validated node tree.
//!
//! Each level is fetched with a fixed number of statements: rows and, when
//! paginated, a count. Relations of a level are fetched for all parent rows
//! at once and correlated back through the echoed parent key columns.

use anyhow::anyhow;
use futures_util::future::{try_join_all, BoxFuture, FutureExt};
use log::{debug, error};
use serde_json::{Number, Value};
use std::collections::HashMap;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::error::EngineError;
use crate::logic::compile::{
    count_query, parent_key_alias, relation_count_query, relation_row_query, row_query,
    ParentKeys, SqlQuery, COUNT_COLUMN,
};
use crate::model::entity::{EntityDef, FieldKind};
use crate::model::filter::BindValue;
use crate::model::node::Node;
use crate::model::record::{Record, RelationResult, Row};
use crate::store::QueryRunner;

/// Runs the statements of one request, at most `max_concurrent_queries`
/// at a time.
pub struct Executor<'r, R: QueryRunner + ?Sized> {
    runner: &'r R,
    permits: Semaphore,
}

impl<'r, R: QueryRunner + ?Sized> Executor<'r, R> {
    pub fn new(runner: &'r R, max_concurrent_queries: usize) -> Self {
        Self {
            runner,
            permits: Semaphore::new(max_concurrent_queries.max(1)),
        }
    }

    /// Fetch a top-level node and every relation below it.
    pub async fn execute(&self, node: &Node) -> Result<RelationResult, EngineError> {
        if node.is_single() {
            let mut records = self.records(row_query(node)).await?;
            records.truncate(1);
            self.resolve_relations(node, &mut records).await?;
            return Ok(RelationResult::One(records.pop().map(Box::new)));
        }
        if !node.is_paginated() {
            let mut records = self.records(row_query(node)).await?;
            self.resolve_relations(node, &mut records).await?;
            return Ok(RelationResult::Many(records));
        }

        let (count, mut records) = if node.pagination.limit == 0 {
            (self.count(count_query(node)).await?, Vec::new())
        } else {
            tokio::try_join!(self.count(count_query(node)), self.records(row_query(node)))?
        };
        self.resolve_relations(node, &mut records).await?;
        Ok(RelationResult::Page {
            count,
            limit: node.pagination.limit,
            offset: node.pagination.offset,
            records,
        })
    }

    async fn fetch(&self, query: SqlQuery) -> Result<Vec<Row>, EngineError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|err| EngineError::Execution(err.into()))?;
        debug!("{query}");
        self.runner
            .fetch_rows(&query)
            .await
            .map_err(EngineError::Execution)
    }

    async fn records(&self, query: SqlQuery) -> Result<Vec<Record>, EngineError> {
        Ok(self.fetch(query).await?.into_iter().map(Record::new).collect())
    }

    async fn count(&self, query: SqlQuery) -> Result<u64, EngineError> {
        let rows = self.fetch(query).await?;
        match rows.first() {
            Some(row) => read_count(row),
            None => Ok(0),
        }
    }

    /// Fetch every child relation of `node` for `records` and attach the
    /// results. Siblings run concurrently; nothing is attached unless all
    /// of them succeed.
    fn resolve_relations<'a>(
        &'a self,
        node: &'a Node,
        records: &'a mut [Record],
    ) -> BoxFuture<'a, Result<(), EngineError>> {
        async move {
            if records.is_empty() || node.relations.is_empty() {
                return Ok(());
            }
            let parents: &[Record] = records;
            let fetched = try_join_all(
                node.relations
                    .values()
                    .map(|child| self.fetch_relation(child, parents)),
            )
            .await?;

            for (name, results) in node.relations.keys().zip(fetched) {
                for (record, result) in records.iter_mut().zip(results) {
                    record.relations.insert(name.clone(), result);
                }
            }
            Ok(())
        }
        .boxed()
    }

    /// One result per parent record, in parent order.
    async fn fetch_relation(
        &self,
        node: &Node,
        parents: &[Record],
    ) -> Result<Vec<RelationResult>, EngineError> {
        let link = node.link.as_ref().ok_or_else(|| {
            EngineError::config(node.name(), "relation node without a parent link")
        })?;
        let columns: Vec<String> = link
            .def
            .owner_columns()
            .into_iter()
            .map(str::to_string)
            .collect();

        let parent_keys: Vec<Option<String>> = parents
            .iter()
            .map(|parent| canonical_key(&parent.row, &columns, false))
            .collect();
        let mut index: HashMap<&str, Vec<usize>> = HashMap::new();
        let mut unique = Vec::new();
        for (i, key) in parent_keys.iter().enumerate() {
            if let Some(key) = key {
                let slots = index.entry(key.as_str()).or_default();
                if slots.is_empty() {
                    unique.push(&parents[i].row);
                }
                slots.push(i);
            }
        }
        if unique.is_empty() {
            return Ok(parents.iter().map(|_| empty_result(node)).collect());
        }
        let keys = parent_key_arrays(&link.parent, &columns, &unique)?;

        let (counts, mut records) = if !node.is_paginated() {
            (Vec::new(), self.records(relation_row_query(node, &keys)?).await?)
        } else if node.pagination.limit == 0 {
            (self.fetch(relation_count_query(node, &keys)?).await?, Vec::new())
        } else {
            tokio::try_join!(
                self.fetch(relation_count_query(node, &keys)?),
                self.records(relation_row_query(node, &keys)?)
            )?
        };
        self.resolve_relations(node, &mut records).await?;

        let orphan = |key: String| {
            error!(
                "Relation '{}' of {} returned a row matching no parent (key {key})",
                link.name, link.parent.name
            );
            EngineError::Invariant {
                relation: link.name.clone(),
                key,
            }
        };

        let mut grouped: Vec<Vec<Record>> = parents.iter().map(|_| Vec::new()).collect();
        for mut record in records {
            let key = canonical_key(&record.row, &columns, true).unwrap_or_default();
            for column in &columns {
                record.row.remove(&parent_key_alias(column));
            }
            let slots = index.get(key.as_str()).ok_or_else(|| orphan(key.clone()))?;
            for &slot in slots {
                grouped[slot].push(record.clone());
            }
        }

        let mut totals = vec![0u64; parents.len()];
        for row in &counts {
            let key = canonical_key(row, &columns, true).unwrap_or_default();
            let slots = index.get(key.as_str()).ok_or_else(|| orphan(key.clone()))?;
            let count = read_count(row)?;
            for &slot in slots {
                totals[slot] = count;
            }
        }

        Ok(grouped
            .into_iter()
            .zip(totals)
            .map(|(records, count)| {
                if node.is_to_one() {
                    RelationResult::One(records.into_iter().next().map(Box::new))
                } else if node.is_paginated() {
                    RelationResult::Page {
                        count,
                        limit: node.pagination.limit,
                        offset: node.pagination.offset,
                        records,
                    }
                } else {
                    RelationResult::Many(records)
                }
            })
            .collect())
    }
}

fn empty_result(node: &Node) -> RelationResult {
    if node.is_to_one() {
        RelationResult::One(None)
    } else if node.is_paginated() {
        RelationResult::Page {
            count: 0,
            limit: node.pagination.limit,
            offset: node.pagination.offset,
            records: Vec::new(),
        }
    } else {
        RelationResult::Many(Vec::new())
    }
}

/// A string identifying the values of `columns` in `row`, comparable
/// between parent rows and echoed keys (`echoed` reads the
/// `__parent_<column>` copies). `None` if any value is null.
fn canonical_key(row: &Row, columns: &[String], echoed: bool) -> Option<String> {
    let mut parts = Vec::with_capacity(columns.len());
    for column in columns {
        let value = if echoed {
            row.get(&parent_key_alias(column))
        } else {
            row.get(column)
        };
        parts.push(canonical_value(value?)?);
    }
    Some(parts.join("\u{1f}"))
}

fn canonical_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(canonical_number(n)),
        other => Some(other.to_string()),
    }
}

/// Largest magnitude below which every integral `f64` is exact.
const MAX_EXACT_FLOAT: f64 = 9_007_199_254_740_992.0;

/// Integers keep every digit; integral floats print like the integer.
fn canonical_number(n: &Number) -> String {
    if n.is_i64() || n.is_u64() {
        return n.to_string();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < MAX_EXACT_FLOAT => format!("{f:.0}"),
        Some(f) => f.to_string(),
        None => n.to_string(),
    }
}

/// One typed array per key column, typed by the parent's column kind.
fn parent_key_arrays(
    parent: &EntityDef,
    columns: &[String],
    rows: &[&Row],
) -> Result<ParentKeys, EngineError> {
    let arrays = columns
        .iter()
        .map(|column| {
            let values = rows.iter().filter_map(|row| row.get(column));
            match parent.column_kind(column) {
                Some(FieldKind::Uuid) => values
                    .map(|value| {
                        value
                            .as_str()
                            .and_then(|s| Uuid::parse_str(s).ok())
                            .ok_or_else(|| {
                                EngineError::Execution(anyhow!(
                                    "{}.{column} holds a non-UUID key: {value}",
                                    parent.name
                                ))
                            })
                    })
                    .collect::<Result<Vec<_>, _>>()
                    .map(BindValue::UuidArray),
                Some(FieldKind::Number) => {
                    let values: Vec<&Value> = values.collect();
                    match values.iter().map(|value| value.as_i64()).collect::<Option<Vec<_>>>() {
                        Some(integers) => Ok(BindValue::IntegerArray(integers)),
                        None => values
                            .iter()
                            .map(|value| {
                                value.as_f64().ok_or_else(|| {
                                    EngineError::Execution(anyhow!(
                                        "{}.{column} holds a non-numeric key: {value}",
                                        parent.name
                                    ))
                                })
                            })
                            .collect::<Result<Vec<_>, _>>()
                            .map(BindValue::NumberArray),
                    }
                }
                None => Err(EngineError::config(
                    &parent.name,
                    format!("key column '{column}' has no field"),
                )),
                _ => Ok(BindValue::TextArray(
                    values.filter_map(canonical_value).collect(),
                )),
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ParentKeys {
        columns: columns.to_vec(),
        arrays,
    })
}

fn read_count(row: &Row) -> Result<u64, EngineError> {
    let count = match row.get(COUNT_COLUMN) {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    };
    count.ok_or_else(|| EngineError::Execution(anyhow!("count statement returned no count: {row:?}")))
}
