use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// One database row, keyed by column name.
pub type Row = Map<String, Value>;

/// A fetched row plus the relations resolved for it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    pub row: Row,
    pub relations: BTreeMap<String, RelationResult>,
}

impl Record {
    pub fn new(row: Row) -> Self {
        Self {
            row,
            relations: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelationResult {
    One(Option<Box<Record>>),
    Many(Vec<Record>),
    Page {
        count: u64,
        limit: u64,
        offset: u64,
        records: Vec<Record>,
    },
}
