//! Pattern matching over resource documents.
//!
//! A pattern is a document co-shaped with the resource it validates.
//! Maps match key-wise (with [`anchor`] markers altering the rules),
//! lists match element-wise or apply a single pattern map to every
//! element, and leaves go through the extended [`operator`] comparisons.
//!
//! A failed match reports the resource path that diverged, in dot/bracket
//! notation (`spec.containers[0].image`). An error with an empty path
//! means the pattern itself is unusable.

pub mod anchor;
pub mod operator;

use serde_json::Value;
use slog::{debug, Logger};

use anchor::Anchor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternErrorKind {
    /// The resource does not satisfy the pattern.
    Mismatch,
    /// The pattern cannot be evaluated at all.
    Malformed,
    /// A global anchor declared the resource out of scope.
    GlobalMismatch,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct PatternError {
    /// Dot/bracket path into the resource; empty for malformed patterns.
    pub path: String,
    pub message: String,
    pub kind: PatternErrorKind,
}

impl PatternError {
    fn mismatch(path: &str, message: String) -> Self {
        PatternError {
            path: if path.is_empty() { ".".to_string() } else { path.to_string() },
            message,
            kind: PatternErrorKind::Mismatch,
        }
    }

    fn malformed(message: String) -> Self {
        PatternError {
            path: String::new(),
            message,
            kind: PatternErrorKind::Malformed,
        }
    }

    fn global(path: &str) -> Self {
        PatternError {
            path: path.to_string(),
            message: "global anchor conditions not satisfied".to_string(),
            kind: PatternErrorKind::GlobalMismatch,
        }
    }
}

/// Matches a resource document against a pattern document.
pub fn match_pattern(log: &Logger, resource: &Value, pattern: &Value) -> Result<(), PatternError> {
    validate_element(log, resource, pattern, "")
}

fn validate_element(
    log: &Logger,
    value: &Value,
    pattern: &Value,
    path: &str,
) -> Result<(), PatternError> {
    match pattern {
        Value::Object(map) => validate_map(log, value, map, path),
        Value::Array(items) => validate_array(log, value, items, path),
        leaf => validate_leaf(value, leaf, path),
    }
}

fn validate_map(
    log: &Logger,
    value: &Value,
    pattern: &serde_json::Map<String, Value>,
    path: &str,
) -> Result<(), PatternError> {
    let Some(object) = value.as_object() else {
        return Err(PatternError::mismatch(
            path,
            format!("expected an object, found {}", type_name(value)),
        ));
    };

    // Anchors decide whether and how the plain entries apply, so they are
    // evaluated first.
    for (raw_key, anchored) in pattern {
        match anchor::parse(raw_key) {
            Anchor::Negation(key) => {
                if object.contains_key(key) {
                    return Err(PatternError::mismatch(
                        &child_path(path, key),
                        format!("field {} is not allowed", key),
                    ));
                }
            }
            Anchor::Condition(key) => {
                let satisfied = match object.get(key) {
                    Some(actual) => {
                        matches_subtree(log, actual, anchored, &child_path(path, key))?
                    }
                    None => false,
                };
                if !satisfied {
                    debug!(log, "conditional anchor not satisfied, skipping subtree";
                        "key" => key, "path" => path);
                    return Ok(());
                }
            }
            Anchor::Global(key) => {
                let satisfied = match object.get(key) {
                    Some(actual) => {
                        matches_subtree(log, actual, anchored, &child_path(path, key))?
                    }
                    None => false,
                };
                if !satisfied {
                    return Err(PatternError::global(&child_path(path, key)));
                }
            }
            Anchor::Existence(_) | Anchor::Plain(_) => {}
        }
    }

    for (raw_key, entry) in pattern {
        let parsed = anchor::parse(raw_key);
        if let Anchor::Plain(key) | Anchor::Existence(key) = parsed {
            let child = child_path(path, key);
            match object.get(key) {
                Some(actual) => validate_element(log, actual, entry, &child)?,
                None => {
                    return Err(PatternError::mismatch(
                        &child,
                        format!("field {} is missing", key),
                    ))
                }
            }
        }
    }
    Ok(())
}

fn validate_array(
    log: &Logger,
    value: &Value,
    pattern: &[Value],
    path: &str,
) -> Result<(), PatternError> {
    let Some(items) = value.as_array() else {
        return Err(PatternError::mismatch(
            path,
            format!("expected a list, found {}", type_name(value)),
        ));
    };

    match pattern {
        [] => Ok(()),
        // A single pattern map applies to every element; anchors inside
        // it select which elements the plain entries constrain.
        [single] if single.is_object() => {
            for (index, item) in items.iter().enumerate() {
                validate_element(log, item, single, &index_path(path, index))?;
            }
            Ok(())
        }
        _ => {
            if pattern.len() != items.len() {
                return Err(PatternError::mismatch(
                    path,
                    format!(
                        "list has {} elements, pattern expects {}",
                        items.len(),
                        pattern.len()
                    ),
                ));
            }
            for (index, (item, entry)) in items.iter().zip(pattern).enumerate() {
                validate_element(log, item, entry, &index_path(path, index))?;
            }
            Ok(())
        }
    }
}

fn validate_leaf(value: &Value, pattern: &Value, path: &str) -> Result<(), PatternError> {
    match operator::match_leaf(value, pattern) {
        Ok(true) => Ok(()),
        Ok(false) => Err(PatternError::mismatch(
            path,
            format!("value {} does not match pattern {}", value, pattern),
        )),
        Err(reason) => Err(PatternError::malformed(reason)),
    }
}

/// Evaluates an anchored subtree as a yes/no question. Mismatches answer
/// "no"; malformed patterns and global-anchor failures keep propagating.
fn matches_subtree(
    log: &Logger,
    value: &Value,
    pattern: &Value,
    path: &str,
) -> Result<bool, PatternError> {
    match validate_element(log, value, pattern, path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind == PatternErrorKind::Mismatch => Ok(false),
        Err(e) => Err(e),
    }
}

fn child_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}

fn index_path(path: &str, index: usize) -> String {
    format!("{}[{}]", path, index)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}
