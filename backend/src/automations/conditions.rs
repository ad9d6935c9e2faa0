// Condition evaluation - field/operator/value predicates against a live contact snapshot

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use std::cmp::Ordering;

use cadence_shared::{ConditionConfig, ConditionOperator};

use super::templates::lookup;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConditionError {
    #[error("Invalid condition field '{0}'")]
    InvalidField(String),
    #[error("Operator {operator:?} requires a comparison value")]
    MissingValue { operator: ConditionOperator },
    #[error("Cannot compare field '{field}' with {operator:?}: {reason}")]
    TypeMismatch {
        field: String,
        operator: ConditionOperator,
        reason: String,
    },
}

pub struct ConditionEvaluator;

impl ConditionEvaluator {
    /// Check the field path is well formed (non-empty segments)
    pub fn validate_field(field: &str) -> Result<(), ConditionError> {
        let field = field.trim();
        if field.is_empty() || field.split('.').any(|part| part.trim().is_empty()) {
            return Err(ConditionError::InvalidField(field.to_string()));
        }
        Ok(())
    }

    /// Evaluate `condition` against a contact document (see `ContactSnapshot::to_document`).
    /// A bare field name that is not a contact attribute falls back to `fields.<name>`.
    pub fn evaluate(condition: &ConditionConfig, contact: &Value) -> Result<bool, ConditionError> {
        Self::validate_field(&condition.field)?;
        if condition.operator.needs_value() && condition.value.is_null() {
            return Err(ConditionError::MissingValue { operator: condition.operator });
        }

        let field = condition.field.trim();
        let actual = lookup(contact, field)
            .or_else(|| contact.get("fields").and_then(|fields| lookup(fields, field)))
            .filter(|v| !v.is_null());
        let expected = &condition.value;

        let result = match condition.operator {
            ConditionOperator::IsSet => actual.is_some_and(is_present),
            ConditionOperator::IsNotSet => !actual.is_some_and(is_present),
            ConditionOperator::Equals => actual.is_some_and(|v| loose_eq(v, expected)),
            ConditionOperator::NotEquals => !actual.is_some_and(|v| loose_eq(v, expected)),
            ConditionOperator::Contains => actual.is_some_and(|v| contains(v, expected)),
            ConditionOperator::GreaterThan | ConditionOperator::LessThan => {
                let Some(actual) = actual else {
                    return Ok(false);
                };
                let ordering = compare(actual, expected).ok_or_else(|| ConditionError::TypeMismatch {
                    field: field.to_string(),
                    operator: condition.operator,
                    reason: format!("{} vs {}", type_name(actual), type_name(expected)),
                })?;
                match condition.operator {
                    ConditionOperator::GreaterThan => ordering == Ordering::Greater,
                    _ => ordering == Ordering::Less,
                }
            }
        };

        Ok(result)
    }
}

/// Empty strings and empty collections count as unset
fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        _ => true,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_datetime(value: &Value) -> Option<DateTime<Utc>> {
    let s = value.as_str()?.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

fn loose_eq(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::String(a), Value::String(b)) => a.trim().eq_ignore_ascii_case(b.trim()),
        (Value::Bool(a), Value::String(b)) | (Value::String(b), Value::Bool(a)) => {
            b.trim().parse::<bool>().is_ok_and(|b| b == *a)
        }
        (Value::Array(items), other) if !other.is_array() => items.iter().any(|item| loose_eq(item, other)),
        _ => match (as_number(actual), as_number(expected)) {
            (Some(a), Some(b)) => a == b,
            _ => actual == expected,
        },
    }
}

fn contains(actual: &Value, expected: &Value) -> bool {
    match actual {
        Value::String(s) => match expected {
            Value::String(needle) => s.to_lowercase().contains(&needle.to_lowercase()),
            other => s.contains(&other.to_string()),
        },
        Value::Array(items) => items.iter().any(|item| loose_eq(item, expected)),
        Value::Object(map) => expected.as_str().is_some_and(|key| map.contains_key(key)),
        _ => false,
    }
}

fn compare(actual: &Value, expected: &Value) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (as_number(actual), as_number(expected)) {
        return a.partial_cmp(&b);
    }
    if let (Some(a), Some(b)) = (as_datetime(actual), as_datetime(expected)) {
        return Some(a.cmp(&b));
    }
    None
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
