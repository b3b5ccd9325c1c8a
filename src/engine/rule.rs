//! Per-rule validation.
//!
//! Orchestrates one rule against one admission event: filter, context
//! loading, preconditions, dispatch to the pattern/deny/foreach body,
//! and the old/new gate that keeps updates from re-raising pre-existing
//! violations. The context store is checkpointed on entry and restored
//! on every exit path, so rules never observe each other's context.

use serde_json::Value;
use slog::{debug, Logger};
use std::time::Instant;

use crate::conditions;
use crate::context::loader;
use crate::pattern::{self, PatternErrorKind};
use crate::policy::{Deny, ForEachValidation, Rule, ValidationKind};
use crate::request::PolicyContext;
use crate::resource;
use crate::response::{RuleResponse, RuleStatus};
use crate::variables;

/// Runs one rule. Returns `None` when the rule does not apply to the
/// event (no match, or a pattern outcome already present on the old
/// resource).
pub(crate) fn process_validation_rule(
    log: &Logger,
    ctx: &mut PolicyContext,
    rule: &Rule,
) -> Option<RuleResponse> {
    let matches_new = !resource::is_empty(&ctx.new_resource)
        && super::filter::rule_applies(rule, &ctx.new_resource, ctx);
    let matches_old = !resource::is_empty(&ctx.old_resource)
        && super::filter::rule_applies(rule, &ctx.old_resource, ctx);
    if !matches_new && !matches_old {
        debug!(log, "rule does not match the resource"; "rule" => &rule.name);
        return None;
    }

    let started = Instant::now();
    ctx.json_context.checkpoint();
    let response = run_rule(log, ctx, rule);
    ctx.json_context.restore();

    response.map(|r| r.with_processing_time(started.elapsed()))
}

/// The rule body, run between the caller's checkpoint and restore.
/// Foreach recursion re-enters here per element.
fn run_rule(log: &Logger, ctx: &mut PolicyContext, rule: &Rule) -> Option<RuleResponse> {
    let validation = rule.validate.as_ref()?;

    if let Err(e) = loader::load_context(log, ctx, &rule.context) {
        return Some(RuleResponse::error(
            &rule.name,
            format!("failed to load context: {:#}", e),
        ));
    }

    if let Some(preconditions) = &rule.preconditions {
        let substituted =
            match variables::substitute_all_in_conditions(log, &ctx.json_context, preconditions) {
                Ok(conditions) => conditions,
                Err(e) => return Some(RuleResponse::error(&rule.name, e.to_string())),
            };
        if !conditions::evaluate(log, &substituted) {
            return Some(RuleResponse::skip(
                &rule.name,
                "preconditions not met".to_string(),
            ));
        }
    }

    let kind = match validation.kind() {
        Ok(kind) => kind,
        Err(e) => return Some(RuleResponse::error(&rule.name, e.to_string())),
    };

    let user_message = match &validation.message {
        Some(message) => {
            match variables::substitute_to_string(log, &ctx.json_context, message) {
                Ok(substituted) => Some(substituted),
                Err(e) => return Some(RuleResponse::error(&rule.name, e.to_string())),
            }
        }
        None => None,
    };

    match kind {
        ValidationKind::Pattern(raw) => {
            let pattern = match variables::substitute_all(log, &ctx.json_context, raw) {
                Ok(pattern) => pattern,
                Err(e) => return Some(RuleResponse::error(&rule.name, e.to_string())),
            };
            validate_old_new(
                log,
                ctx,
                &rule.name,
                user_message.as_deref(),
                PatternBody::Single(&pattern),
            )
        }
        ValidationKind::AnyPattern(raw) => {
            let substituted = match variables::substitute_all(log, &ctx.json_context, raw) {
                Ok(patterns) => patterns,
                Err(e) => return Some(RuleResponse::error(&rule.name, e.to_string())),
            };
            let Some(patterns) = substituted.as_array() else {
                return Some(RuleResponse::error(
                    &rule.name,
                    "anyPattern requires a list of patterns".to_string(),
                ));
            };
            validate_old_new(
                log,
                ctx,
                &rule.name,
                user_message.as_deref(),
                PatternBody::Any(patterns),
            )
        }
        ValidationKind::Deny(deny) => Some(validate_deny(
            log,
            ctx,
            &rule.name,
            user_message.as_deref(),
            deny,
        )),
        ValidationKind::ForEach(foreach) => {
            validate_foreach(log, ctx, rule, foreach)
        }
    }
}

enum PatternBody<'a> {
    Single(&'a Value),
    Any(&'a [Value]),
}

/// The idempotence gate over old and new resources.
///
/// On create (no old resource) the new resource decides. On delete (no
/// new resource) patterns have nothing to validate. On update both are
/// matched: an outcome identical to the old resource's pre-existed, so
/// the update does not re-raise it.
fn validate_old_new(
    log: &Logger,
    ctx: &PolicyContext,
    rule_name: &str,
    user_message: Option<&str>,
    body: PatternBody,
) -> Option<RuleResponse> {
    if resource::is_empty(&ctx.old_resource) {
        return Some(match_resource(
            log,
            &ctx.new_resource,
            rule_name,
            user_message,
            &body,
        ));
    }
    if resource::is_empty(&ctx.new_resource) {
        return None;
    }

    let new_response = match_resource(log, &ctx.new_resource, rule_name, user_message, &body);
    let old_response = match_resource(log, &ctx.old_resource, rule_name, user_message, &body);
    if new_response.same_outcome(&old_response) {
        debug!(log, "outcome unchanged from the old resource, suppressing response";
            "rule" => rule_name);
        return None;
    }
    Some(new_response)
}

fn match_resource(
    log: &Logger,
    doc: &Value,
    rule_name: &str,
    user_message: Option<&str>,
    body: &PatternBody,
) -> RuleResponse {
    match body {
        PatternBody::Single(pattern) => match pattern::match_pattern(log, doc, pattern) {
            Ok(()) => RuleResponse::pass(
                rule_name,
                format!("validation rule '{}' passed.", rule_name),
            ),
            Err(e) => match e.kind {
                PatternErrorKind::Mismatch => {
                    RuleResponse::fail(rule_name, fail_message(user_message, rule_name, &e.path))
                }
                PatternErrorKind::GlobalMismatch => {
                    RuleResponse::skip(rule_name, e.message.clone())
                }
                PatternErrorKind::Malformed => {
                    RuleResponse::error(rule_name, format!("invalid pattern: {}", e.message))
                }
            },
        },
        PatternBody::Any(patterns) => {
            let mut mismatches: Vec<String> = Vec::new();
            for (index, pattern) in patterns.iter().enumerate() {
                match pattern::match_pattern(log, doc, pattern) {
                    Ok(()) => {
                        return RuleResponse::pass(
                            rule_name,
                            format!(
                                "validation rule '{}' anyPattern[{}] passed.",
                                rule_name, index
                            ),
                        )
                    }
                    Err(e) => match e.kind {
                        PatternErrorKind::Mismatch | PatternErrorKind::GlobalMismatch => {
                            mismatches.push(format!(
                                "rule {} anyPattern[{}] failed at path {}",
                                rule_name, index, e.path
                            ));
                        }
                        PatternErrorKind::Malformed => {
                            return RuleResponse::error(
                                rule_name,
                                format!("invalid anyPattern[{}]: {}", index, e.message),
                            )
                        }
                    },
                }
            }
            let joined = mismatches.join(" ");
            let message = match user_message {
                Some(m) => format!("validation error: {} {}", m, joined),
                None => format!("validation error: {}", joined),
            };
            RuleResponse::fail(rule_name, message)
        }
    }
}

fn fail_message(user_message: Option<&str>, rule_name: &str, path: &str) -> String {
    match user_message {
        Some(m) => format!(
            "validation error: {} Rule {} failed at path {}",
            m, rule_name, path
        ),
        None => format!(
            "validation error: rule {} failed at path {}",
            rule_name, path
        ),
    }
}

/// Deny rules reject when their conditions hold. They run for every
/// operation, including delete, where the store's `request.object` is
/// the resource being removed.
fn validate_deny(
    log: &Logger,
    ctx: &PolicyContext,
    rule_name: &str,
    user_message: Option<&str>,
    deny: &Deny,
) -> RuleResponse {
    let substituted =
        match variables::substitute_all_in_conditions(log, &ctx.json_context, &deny.conditions) {
            Ok(conditions) => conditions,
            Err(e) => return RuleResponse::error(rule_name, e.to_string()),
        };

    if conditions::evaluate(log, &substituted) {
        let message = user_message
            .map(str::to_string)
            .unwrap_or_else(|| format!("validation rule '{}' failed.", rule_name));
        RuleResponse::fail(rule_name, message)
    } else {
        RuleResponse::pass(
            rule_name,
            format!("validation rule '{}' passed.", rule_name),
        )
    }
}

/// Runs every foreach block of the rule. The first failing element ends
/// the whole iteration; a rule whose blocks processed no element at all
/// is skipped.
fn validate_foreach(
    log: &Logger,
    ctx: &mut PolicyContext,
    rule: &Rule,
    foreach_blocks: &[ForEachValidation],
) -> Option<RuleResponse> {
    let mut applied = 0u32;
    for foreach in foreach_blocks {
        match validate_elements(log, ctx, rule, foreach) {
            Ok(count) => applied += count,
            Err(response) => return Some(response),
        }
    }

    if applied == 0 {
        Some(RuleResponse::skip(
            &rule.name,
            "no elements processed by the foreach rule".to_string(),
        ))
    } else {
        Some(RuleResponse::pass(
            &rule.name,
            format!("validation rule '{}' passed.", rule.name),
        ))
    }
}

fn validate_elements(
    log: &Logger,
    ctx: &mut PolicyContext,
    rule: &Rule,
    foreach: &ForEachValidation,
) -> Result<u32, RuleResponse> {
    let list_expression =
        match variables::substitute_to_string(log, &ctx.json_context, &foreach.list) {
            Ok(expression) => expression,
            Err(e) => return Err(RuleResponse::error(&rule.name, e.to_string())),
        };
    let elements = match ctx.json_context.query(&list_expression) {
        Ok(Value::Array(elements)) => elements,
        Ok(single) => vec![single],
        Err(e) => {
            return Err(RuleResponse::error(
                &rule.name,
                format!("failed to evaluate foreach list {:?}: {}", list_expression, e),
            ))
        }
    };

    ctx.json_context.checkpoint();
    let result = iterate_elements(log, ctx, rule, foreach, elements);
    ctx.json_context.restore();
    result
}

fn iterate_elements(
    log: &Logger,
    ctx: &mut PolicyContext,
    rule: &Rule,
    foreach: &ForEachValidation,
    elements: Vec<Value>,
) -> Result<u32, RuleResponse> {
    let inner_rule = Rule {
        name: rule.name.clone(),
        context: foreach.context.clone(),
        preconditions: foreach.preconditions.clone(),
        validate: Some(foreach.to_validation()),
        ..Default::default()
    };

    let mut applied = 0u32;
    for (index, element) in elements.into_iter().enumerate() {
        ctx.json_context.reset();
        ctx.json_context.add_element(element.clone(), index);
        ctx.json_context.add_resource_as_object(element.clone());

        // The element stands in for the resource while the inner block
        // runs; the old resource is cleared so the inner patterns match
        // the element directly.
        let saved_new = std::mem::replace(&mut ctx.new_resource, element);
        let saved_old = std::mem::replace(&mut ctx.old_resource, Value::Null);
        let inner = run_rule(log, ctx, &inner_rule);
        ctx.new_resource = saved_new;
        ctx.old_resource = saved_old;

        match inner {
            None => continue,
            Some(response) => match response.status {
                RuleStatus::Skip => continue,
                RuleStatus::Pass | RuleStatus::Warn => applied += 1,
                RuleStatus::Fail | RuleStatus::Error => {
                    let mut short_circuit = response;
                    short_circuit.message = format!(
                        "validation failed in foreach rule for element at index {}: {}",
                        index, short_circuit.message
                    );
                    return Err(short_circuit);
                }
            },
        }
    }
    Ok(applied)
}
