//! String filter mini-language.
//!
//! A raw value is trimmed and its prefix selects the operator:
//!
//! | value            | meaning                                  |
//! |------------------|------------------------------------------|
//! | `""`             | has a value                              |
//! | `!`              | null or empty                            |
//! | `$in:"a","b"`    | one of                                   |
//! | `$nin:"a","b"`   | none of                                  |
//! | `~x` `^x` `$x`   | contains / starts with / ends with (text)|
//! | `!x`             | not equal                                |
//! | `$gt:` `$gte:` `$lt:` `$lte:` | number comparisons          |
//! | `$after:` `$before:` `$between:a\|b` | date comparisons     |
//! | anything else    | equal                                    |

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::model::filter::{BindValue, Comparison, FilterKind, Operator, Predicate, Target};
use crate::model::policy::FilterableField;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GrammarError {
    #[error("operator '{0}' is not allowed")]
    OperatorNotAllowed(Operator),
    #[error("operator '{0}' cannot be used on {1} fields")]
    UnsupportedOperator(Operator, FilterKind),
    #[error("unknown operator '{0}'")]
    UnknownOperator(String),
    #[error("a value is required")]
    EmptyValue,
    #[error("operator '{0}' needs a value")]
    MissingOperand(Operator),
    #[error("invalid list for operator '{0}': {1}")]
    InvalidList(Operator, String),
    #[error("'{0}' is not a valid UUID v4")]
    InvalidUuid(String),
    #[error("'{0}' is not a valid number")]
    InvalidNumber(String),
    #[error("'{0}' is not a valid date")]
    InvalidDate(String),
    #[error("'{0}' is not a valid boolean, expected 'true' or 'false'")]
    InvalidBoolean(String),
    #[error("'{0}' is not a valid range, expected '<from>|<to>'")]
    InvalidRange(String),
}

/// What a filter applies to: the compiled kind, target column and the
/// policy entry that permits it.
#[derive(Debug, Clone, Copy)]
pub struct FilterField<'a> {
    pub kind: FilterKind,
    pub target: &'a Target,
    pub permitted: &'a FilterableField,
}

impl FilterField<'_> {
    fn permit(&self, operator: Operator) -> Result<(), GrammarError> {
        if self.permitted.allows(operator) {
            Ok(())
        } else {
            Err(GrammarError::OperatorNotAllowed(operator))
        }
    }

    fn condition(&self, comparison: Comparison) -> Predicate {
        Predicate::condition(self.target.clone(), comparison)
    }
}

/// Compile one raw value into a typed clause.
pub fn compile_value(field: FilterField<'_>, raw: &str) -> Result<Predicate, GrammarError> {
    let value = raw.trim();

    if value.is_empty() {
        if field.permitted.required {
            return Err(GrammarError::EmptyValue);
        }
        field.permit(Operator::Exists)?;
        return Ok(has_value(field));
    }
    if value == "!" {
        field.permit(Operator::Missing)?;
        return Ok(null_or_empty(field));
    }
    if let Some(list) = value.strip_prefix("$in:") {
        field.permit(Operator::In)?;
        let values = parse_list(field.kind, Operator::In, list)?;
        return Ok(field.condition(Comparison::In(values)));
    }
    if let Some(list) = value.strip_prefix("$nin:") {
        field.permit(Operator::Nin)?;
        let values = parse_list(field.kind, Operator::Nin, list)?;
        return Ok(field.condition(Comparison::NotIn(values)));
    }

    match field.kind {
        FilterKind::Text => text(field, value),
        FilterKind::Uuid => uuid(field, value),
        FilterKind::Number => number(field, value),
        FilterKind::Date => date(field, value),
        FilterKind::Boolean => boolean(field, value),
    }
}

fn has_value(field: FilterField<'_>) -> Predicate {
    match field.kind {
        FilterKind::Text => Predicate::And(vec![
            field.condition(Comparison::IsNotNull),
            field.condition(Comparison::NonEmptyText),
        ]),
        _ => field.condition(Comparison::IsNotNull),
    }
}

fn null_or_empty(field: FilterField<'_>) -> Predicate {
    match field.kind {
        FilterKind::Text => Predicate::Or(vec![
            field.condition(Comparison::IsNull),
            field.condition(Comparison::EmptyText),
        ]),
        _ => field.condition(Comparison::IsNull),
    }
}

fn operand(operator: Operator, rest: &str) -> Result<&str, GrammarError> {
    let rest = rest.trim();
    if rest.is_empty() {
        Err(GrammarError::MissingOperand(operator))
    } else {
        Ok(rest)
    }
}

fn text(field: FilterField<'_>, value: &str) -> Result<Predicate, GrammarError> {
    let (operator, rest) = match value.chars().next() {
        Some('~') => (Operator::Contains, &value[1..]),
        Some('^') => (Operator::StartsWith, &value[1..]),
        Some('$') => (Operator::EndsWith, &value[1..]),
        Some('!') => (Operator::Ne, &value[1..]),
        _ => (Operator::Eq, value),
    };
    field.permit(operator)?;
    let rest = operand(operator, rest)?;

    let comparison = match operator {
        Operator::Contains => Comparison::ILike(format!("%{}%", escape_like(rest))),
        Operator::StartsWith => Comparison::ILike(format!("{}%", escape_like(rest))),
        Operator::EndsWith => Comparison::ILike(format!("%{}", escape_like(rest))),
        Operator::Ne => Comparison::NotEqIgnoreCase(rest.to_string()),
        _ => Comparison::Eq(BindValue::Text(rest.to_string())),
    };
    Ok(field.condition(comparison))
}

fn uuid(field: FilterField<'_>, value: &str) -> Result<Predicate, GrammarError> {
    let (operator, rest) = match value.strip_prefix('!') {
        Some(rest) => (Operator::Ne, rest),
        None => (Operator::Eq, value),
    };
    field.permit(operator)?;
    let id = parse_uuid_v4(operand(operator, rest)?)?;

    let comparison = match operator {
        Operator::Ne => Comparison::NotEq(BindValue::Uuid(id)),
        _ => Comparison::Eq(BindValue::Uuid(id)),
    };
    Ok(field.condition(comparison))
}

fn number(field: FilterField<'_>, value: &str) -> Result<Predicate, GrammarError> {
    let (operator, rest) = if let Some(rest) = value.strip_prefix("$gte:") {
        (Operator::Gte, rest)
    } else if let Some(rest) = value.strip_prefix("$gt:") {
        (Operator::Gt, rest)
    } else if let Some(rest) = value.strip_prefix("$lte:") {
        (Operator::Lte, rest)
    } else if let Some(rest) = value.strip_prefix("$lt:") {
        (Operator::Lt, rest)
    } else if value.starts_with('$') {
        return Err(unknown_operator(value));
    } else if let Some(rest) = value.strip_prefix('!') {
        (Operator::Ne, rest)
    } else {
        (Operator::Eq, value)
    };
    field.permit(operator)?;
    let n = BindValue::Number(parse_number(operand(operator, rest)?)?);

    let comparison = match operator {
        Operator::Gte => Comparison::Gte(n),
        Operator::Gt => Comparison::Gt(n),
        Operator::Lte => Comparison::Lte(n),
        Operator::Lt => Comparison::Lt(n),
        Operator::Ne => Comparison::NotEq(n),
        _ => Comparison::Eq(n),
    };
    Ok(field.condition(comparison))
}

fn date(field: FilterField<'_>, value: &str) -> Result<Predicate, GrammarError> {
    if let Some(range) = value.strip_prefix("$between:") {
        field.permit(Operator::Between)?;
        let range = operand(Operator::Between, range)?;
        let (from, to) = range
            .split_once('|')
            .ok_or_else(|| GrammarError::InvalidRange(range.to_string()))?;
        let (from, to) = (parse_date(from.trim())?, parse_date(to.trim())?);
        if from > to {
            return Err(GrammarError::InvalidRange(range.to_string()));
        }
        return Ok(field.condition(Comparison::Between(
            BindValue::Timestamp(from),
            BindValue::Timestamp(to),
        )));
    }

    let (operator, rest) = if let Some(rest) = value.strip_prefix("$after:") {
        (Operator::After, rest)
    } else if let Some(rest) = value.strip_prefix("$before:") {
        (Operator::Before, rest)
    } else if value.starts_with('$') {
        return Err(unknown_operator(value));
    } else if let Some(rest) = value.strip_prefix('!') {
        (Operator::Ne, rest)
    } else {
        (Operator::Eq, value)
    };
    field.permit(operator)?;
    let at = BindValue::Timestamp(parse_date(operand(operator, rest)?)?);

    let comparison = match operator {
        Operator::After => Comparison::Gt(at),
        Operator::Before => Comparison::Lt(at),
        Operator::Ne => Comparison::NotEq(at),
        _ => Comparison::Eq(at),
    };
    Ok(field.condition(comparison))
}

fn boolean(field: FilterField<'_>, value: &str) -> Result<Predicate, GrammarError> {
    field.permit(Operator::Eq)?;
    match value {
        "true" => Ok(field.condition(Comparison::Eq(BindValue::Boolean(true)))),
        // An absent flag counts as false.
        "false" => Ok(Predicate::Or(vec![
            field.condition(Comparison::Eq(BindValue::Boolean(false))),
            field.condition(Comparison::IsNull),
        ])),
        other => Err(GrammarError::InvalidBoolean(other.to_string())),
    }
}

fn unknown_operator(value: &str) -> GrammarError {
    let name = value.split(':').next().unwrap_or(value);
    GrammarError::UnknownOperator(name.to_string())
}

/// Parse the comma list after `$in:`/`$nin:` as the body of a JSON array.
fn parse_list(kind: FilterKind, operator: Operator, list: &str) -> Result<BindValue, GrammarError> {
    let invalid = |reason: &str| GrammarError::InvalidList(operator, reason.to_string());

    let items: Vec<Value> = serde_json::from_str(&format!("[{list}]"))
        .map_err(|_| invalid("expected a comma separated list of quoted strings"))?;
    if items.is_empty() {
        return Err(invalid("the list is empty"));
    }

    let mut strings = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::String(s) if !s.trim().is_empty() => strings.push(s),
            Value::Number(n) if kind == FilterKind::Number => strings.push(n.to_string()),
            _ => return Err(invalid("every element must be a non-empty string")),
        }
    }

    match kind {
        FilterKind::Text => Ok(BindValue::TextArray(strings)),
        FilterKind::Uuid => strings
            .iter()
            .map(|s| parse_uuid_v4(s))
            .collect::<Result<Vec<_>, _>>()
            .map(BindValue::UuidArray),
        FilterKind::Number => strings
            .iter()
            .map(|s| parse_number(s))
            .collect::<Result<Vec<_>, _>>()
            .map(BindValue::NumberArray),
        FilterKind::Date | FilterKind::Boolean => {
            Err(GrammarError::UnsupportedOperator(operator, kind))
        }
    }
}

/// Accepts hyphenated version 4 UUIDs only.
pub fn parse_uuid_v4(s: &str) -> Result<Uuid, GrammarError> {
    let s = s.trim();
    match Uuid::parse_str(s) {
        Ok(id) if s.len() == 36 && id.get_version() == Some(uuid::Version::Random) => Ok(id),
        _ => Err(GrammarError::InvalidUuid(s.to_string())),
    }
}

pub fn parse_number(s: &str) -> Result<f64, GrammarError> {
    match s.trim().parse::<f64>() {
        Ok(n) if n.is_finite() => Ok(n),
        _ => Err(GrammarError::InvalidNumber(s.to_string())),
    }
}

/// RFC 3339 timestamps, or `YYYY-MM-DD` taken as midnight UTC.
pub fn parse_date(s: &str) -> Result<DateTime<Utc>, GrammarError> {
    if let Ok(at) = DateTime::parse_from_rfc3339(s) {
        return Ok(at.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| GrammarError::InvalidDate(s.to_string()))
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
