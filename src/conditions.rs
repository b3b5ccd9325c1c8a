//! Precondition and deny-condition evaluation.
//!
//! Conditions are evaluated after variable substitution, so `key` and
//! `value` are plain JSON values here. A condition that cannot be
//! evaluated (wrong operand types, bad regex, unparseable duration) is
//! logged and treated as false; it never aborts the enclosing rule.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use slog::{debug, Logger};
use std::time::Duration;

use crate::pattern::operator::wildcard_match;

/// A single `key <operator> value` condition.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(default)]
    pub key: Value,
    #[serde(default)]
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConditionOperator {
    #[default]
    Equals,
    NotEquals,
    In,
    NotIn,
    GreaterThan,
    GreaterThanOrEquals,
    LessThan,
    LessThanOrEquals,
    DurationGreaterThan,
    DurationGreaterThanOrEquals,
    DurationLessThan,
    DurationLessThanOrEquals,
    Matches,
    NotMatches,
}

/// An any/all condition group. `all` passes when every member passes,
/// `any` when at least one does; empty lists pass. The group passes when
/// both parts pass.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct AnyAllConditions {
    #[serde(default)]
    pub any: Vec<Condition>,
    #[serde(default)]
    pub all: Vec<Condition>,
}

/// A condition tree: either an any/all group or the legacy bare list,
/// which evaluates as a conjunction.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(untagged)]
pub enum Conditions {
    AnyAll(AnyAllConditions),
    List(Vec<Condition>),
}

impl Default for Conditions {
    fn default() -> Self {
        Conditions::AnyAll(AnyAllConditions::default())
    }
}

/// Evaluates a condition tree to a boolean.
pub fn evaluate(log: &Logger, conditions: &Conditions) -> bool {
    match conditions {
        Conditions::AnyAll(group) => {
            let all_pass = group.all.iter().all(|c| evaluate_condition(log, c));
            let any_pass =
                group.any.is_empty() || group.any.iter().any(|c| evaluate_condition(log, c));
            all_pass && any_pass
        }
        Conditions::List(list) => list.iter().all(|c| evaluate_condition(log, c)),
    }
}

fn evaluate_condition(log: &Logger, condition: &Condition) -> bool {
    let key = &condition.key;
    let value = &condition.value;
    let result = match condition.operator {
        ConditionOperator::Equals => Ok(values_equal(key, value)),
        ConditionOperator::NotEquals => Ok(!values_equal(key, value)),
        ConditionOperator::In => contains(key, value),
        ConditionOperator::NotIn => excludes(key, value),
        ConditionOperator::GreaterThan => compare_numbers(key, value).map(|o| o > 0.0),
        ConditionOperator::GreaterThanOrEquals => compare_numbers(key, value).map(|o| o >= 0.0),
        ConditionOperator::LessThan => compare_numbers(key, value).map(|o| o < 0.0),
        ConditionOperator::LessThanOrEquals => compare_numbers(key, value).map(|o| o <= 0.0),
        ConditionOperator::DurationGreaterThan => compare_durations(key, value).map(|o| o > 0),
        ConditionOperator::DurationGreaterThanOrEquals => {
            compare_durations(key, value).map(|o| o >= 0)
        }
        ConditionOperator::DurationLessThan => compare_durations(key, value).map(|o| o < 0),
        ConditionOperator::DurationLessThanOrEquals => {
            compare_durations(key, value).map(|o| o <= 0)
        }
        ConditionOperator::Matches => regex_matches(key, value),
        ConditionOperator::NotMatches => regex_matches(key, value).map(|r| !r),
    };

    match result {
        Ok(outcome) => outcome,
        Err(reason) => {
            debug!(log, "condition failed to evaluate, treating as false";
                "operator" => format!("{:?}", condition.operator),
                "reason" => reason);
            false
        }
    }
}

/// Equality with the coercions conditions are expected to support:
/// numbers compare numerically regardless of representation, and the
/// expected string may carry `*`/`?` wildcards.
fn values_equal(key: &Value, expected: &Value) -> bool {
    match (key, expected) {
        (Value::String(k), Value::String(e)) => wildcard_match(e, k),
        (Value::Bool(k), Value::Bool(e)) => k == e,
        (Value::Null, Value::Null) => true,
        (Value::Array(k), Value::Array(e)) => k == e,
        (Value::Object(k), Value::Object(e)) => k == e,
        _ => match (as_number(key), as_number(expected)) {
            (Some(k), Some(e)) => k == e,
            _ => false,
        },
    }
}

/// Membership test for `In`. A scalar key must appear in the value list;
/// a list key requires every element to appear.
fn contains(key: &Value, value: &Value) -> Result<bool, String> {
    let set = value
        .as_array()
        .ok_or_else(|| format!("In/NotIn expects a list value, got {}", value))?;
    match key {
        Value::Array(keys) => Ok(keys
            .iter()
            .all(|k| set.iter().any(|candidate| values_equal(k, candidate)))),
        scalar => Ok(set.iter().any(|candidate| values_equal(scalar, candidate))),
    }
}

/// Disjointness test for `NotIn`. A scalar key must be absent from the
/// value list; a list key requires every element to be absent. This is
/// not the negation of [`contains`]: a list key that overlaps the value
/// list on some elements is neither all-in nor none-in.
fn excludes(key: &Value, value: &Value) -> Result<bool, String> {
    let set = value
        .as_array()
        .ok_or_else(|| format!("In/NotIn expects a list value, got {}", value))?;
    match key {
        Value::Array(keys) => Ok(keys
            .iter()
            .all(|k| !set.iter().any(|candidate| values_equal(k, candidate)))),
        scalar => Ok(!set.iter().any(|candidate| values_equal(scalar, candidate))),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Returns the sign of `key - value` for numeric operands.
fn compare_numbers(key: &Value, value: &Value) -> Result<f64, String> {
    let k = as_number(key).ok_or_else(|| format!("not a number: {}", key))?;
    let v = as_number(value).ok_or_else(|| format!("not a number: {}", value))?;
    Ok(k - v)
}

fn as_duration(value: &Value) -> Result<Duration, String> {
    match value {
        Value::String(s) => {
            humantime::parse_duration(s.trim()).map_err(|e| format!("bad duration {}: {}", s, e))
        }
        Value::Number(n) => n
            .as_f64()
            .filter(|secs| *secs >= 0.0)
            .map(Duration::from_secs_f64)
            .ok_or_else(|| format!("bad duration: {}", n)),
        other => Err(format!("not a duration: {}", other)),
    }
}

fn compare_durations(key: &Value, value: &Value) -> Result<i8, String> {
    let k = as_duration(key)?;
    let v = as_duration(value)?;
    Ok(match k.cmp(&v) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    })
}

fn regex_matches(key: &Value, value: &Value) -> Result<bool, String> {
    let pattern = value
        .as_str()
        .ok_or_else(|| format!("regex operator expects a string pattern, got {}", value))?;
    let subject = key
        .as_str()
        .ok_or_else(|| format!("regex operator expects a string key, got {}", key))?;
    let re = regex::Regex::new(pattern).map_err(|e| format!("bad regex {}: {}", pattern, e))?;
    Ok(re.is_match(subject))
}
