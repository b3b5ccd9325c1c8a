//! `{{ ... }}` variable substitution.
//!
//! Patterns, condition keys, messages and context-entry parameters may
//! embed JMESPath expressions in double curly braces. Substitution walks
//! an arbitrary JSON document and replaces every placeholder found in a
//! string leaf with the expression's value, queried from the context
//! store.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use slog::{debug, Logger};

use crate::conditions::Conditions;
use crate::context::Context;

lazy_static! {
    static ref VARIABLE_RE: Regex = Regex::new(r"\{\{\s*([^{}]*?)\s*\}\}").unwrap();
}

/// A placeholder that could not be resolved against the context store.
/// Whether this aborts the rule or is recoverable is the caller's call.
#[derive(Debug, Clone, thiserror::Error)]
#[error("failed to substitute variables: {{{{ {expression} }}}}: {reason}")]
pub struct SubstitutionError {
    pub expression: String,
    pub reason: String,
}

/// Recursively replaces every `{{ expr }}` in every string leaf of
/// `document` with its value from the store.
///
/// A string that consists of a single placeholder takes the type of the
/// replacement (object, list, number, bool); a placeholder embedded in
/// surrounding text is stringified in place.
pub fn substitute_all(
    log: &Logger,
    ctx: &Context,
    document: &Value,
) -> Result<Value, SubstitutionError> {
    match document {
        Value::String(s) => substitute_string(log, ctx, s),
        Value::Array(items) => items
            .iter()
            .map(|item| substitute_all(log, ctx, item))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| Ok((key.clone(), substitute_all(log, ctx, value)?)))
            .collect::<Result<serde_json::Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

/// Substitutes placeholders in a single string, stringifying any
/// non-string replacement. Used for messages, list expressions and
/// context-entry parameters.
pub fn substitute_to_string(
    log: &Logger,
    ctx: &Context,
    s: &str,
) -> Result<String, SubstitutionError> {
    match substitute_all(log, ctx, &Value::String(s.to_string()))? {
        Value::String(out) => Ok(out),
        other => Ok(other.to_string()),
    }
}

/// Substitutes a condition tree, preserving its any/all shape.
pub fn substitute_all_in_conditions(
    log: &Logger,
    ctx: &Context,
    conditions: &Conditions,
) -> Result<Conditions, SubstitutionError> {
    let raw = serde_json::to_value(conditions).map_err(|e| SubstitutionError {
        expression: String::new(),
        reason: format!("cannot serialize conditions: {}", e),
    })?;
    let substituted = substitute_all(log, ctx, &raw)?;
    serde_json::from_value(substituted).map_err(|e| SubstitutionError {
        expression: String::new(),
        reason: format!("conditions lost their shape after substitution: {}", e),
    })
}

fn substitute_string(log: &Logger, ctx: &Context, s: &str) -> Result<Value, SubstitutionError> {
    // Whole-string placeholder: the replacement keeps its type.
    if let Some(captures) = VARIABLE_RE.captures(s) {
        let whole = captures.get(0).unwrap();
        if whole.start() == 0 && whole.end() == s.len() {
            return resolve(log, ctx, &captures[1]);
        }
    } else {
        return Ok(Value::String(s.to_string()));
    }

    let mut result = String::with_capacity(s.len());
    let mut last = 0;
    for captures in VARIABLE_RE.captures_iter(s) {
        let whole = captures.get(0).unwrap();
        let replacement = resolve(log, ctx, &captures[1])?;
        result.push_str(&s[last..whole.start()]);
        result.push_str(&stringify(&replacement));
        last = whole.end();
    }
    result.push_str(&s[last..]);
    Ok(Value::String(result))
}

fn resolve(log: &Logger, ctx: &Context, expression: &str) -> Result<Value, SubstitutionError> {
    ctx.query(expression).map_err(|e| {
        debug!(log, "variable substitution failed"; "expression" => expression);
        SubstitutionError {
            expression: expression.to_string(),
            reason: e.to_string(),
        }
    })
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
