//! Leaf-level pattern operators.
//!
//! A string leaf in a pattern may carry an operator prefix (`!`, `>`,
//! `<`, `>=`, `<=`), `|`-separated alternatives, and `*`/`?` wildcards.
//! Numeric leaves compare numerically regardless of how the resource
//! spells the number.

use regex::Regex;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equal,
    NotEqual,
    More,
    Less,
    MoreEqual,
    LessEqual,
}

/// Splits the operator prefix off a pattern string.
pub fn parse_operator(pattern: &str) -> (Operator, &str) {
    for (prefix, operator) in [
        (">=", Operator::MoreEqual),
        ("<=", Operator::LessEqual),
        ("!=", Operator::NotEqual),
        (">", Operator::More),
        ("<", Operator::Less),
        ("!", Operator::NotEqual),
    ] {
        if let Some(operand) = pattern.strip_prefix(prefix) {
            return (operator, operand.trim_start());
        }
    }
    (Operator::Equal, pattern)
}

/// Glob-style string matching: `*` matches any run of characters, `?`
/// exactly one.
pub fn wildcard_match(pattern: &str, value: &str) -> bool {
    let mut expr = String::with_capacity(pattern.len() + 2);
    expr.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr)
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}

/// Matches a resource leaf against a pattern leaf.
///
/// `Ok(bool)` reports whether the leaf matches; `Err` means the pattern
/// itself is unusable (a comparison against a non-numeric operand) and
/// must surface as a configuration error, not a validation failure.
pub fn match_leaf(value: &Value, pattern: &Value) -> Result<bool, String> {
    match pattern {
        Value::String(s) => match_string_pattern(value, s),
        Value::Number(expected) => Ok(numbers_equal(value, expected.as_f64())),
        Value::Bool(expected) => Ok(value.as_bool() == Some(*expected)),
        Value::Null => Ok(value.is_null()),
        other => Err(format!("invalid pattern leaf: {}", other)),
    }
}

fn match_string_pattern(value: &Value, pattern: &str) -> Result<bool, String> {
    // Alternatives: the leaf matches when any one of them does.
    for alternative in pattern.split('|') {
        let (operator, operand) = parse_operator(alternative.trim());
        let matched = match operator {
            Operator::Equal => equal(value, operand),
            Operator::NotEqual => !equal(value, operand),
            Operator::More | Operator::Less | Operator::MoreEqual | Operator::LessEqual => {
                let expected = operand
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| format!("non-numeric operand {:?} in pattern", alternative))?;
                match leaf_as_number(value) {
                    Some(actual) => match operator {
                        Operator::More => actual > expected,
                        Operator::Less => actual < expected,
                        Operator::MoreEqual => actual >= expected,
                        Operator::LessEqual => actual <= expected,
                        _ => unreachable!(),
                    },
                    None => false,
                }
            }
        };
        if matched {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Equality between a resource leaf and a pattern operand: numeric when
/// both sides are numbers, wildcard string comparison otherwise.
fn equal(value: &Value, operand: &str) -> bool {
    if let (Some(actual), Ok(expected)) = (leaf_as_number(value), operand.trim().parse::<f64>()) {
        return actual == expected;
    }
    match value {
        Value::String(s) => wildcard_match(operand, s),
        Value::Bool(b) => operand == b.to_string(),
        Value::Number(n) => wildcard_match(operand, &n.to_string()),
        _ => false,
    }
}

fn leaf_as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn numbers_equal(value: &Value, expected: Option<f64>) -> bool {
    match (leaf_as_number(value), expected) {
        (Some(actual), Some(expected)) => actual == expected,
        _ => false,
    }
}
