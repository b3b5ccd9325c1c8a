//! Rule match/exclude filtering.
//!
//! Decides whether a rule applies to a resource at all. A rule that does
//! not apply is skipped silently: no rule response is emitted.

use serde_json::Value;

use crate::pattern::operator::wildcard_match;
use crate::policy::{LabelSelector, MatchResources, ResourceDescription, Rule, Subject};
use crate::request::PolicyContext;
use crate::resource;

/// True when the rule's match block accepts the resource and its exclude
/// block does not carve it back out.
pub(crate) fn rule_applies(rule: &Rule, doc: &Value, ctx: &PolicyContext) -> bool {
    if let Some(match_block) = &rule.match_resources {
        if !block_matches(match_block, doc, ctx, &[]) {
            return false;
        }
    }
    if let Some(exclude) = &rule.exclude {
        // Groups in exclude_group_role are ignored here so that broad
        // system groups cannot exempt every request.
        if !exclude.is_empty() && block_matches(exclude, doc, ctx, &ctx.exclude_group_role) {
            return false;
        }
    }
    true
}

fn block_matches(
    block: &MatchResources,
    doc: &Value,
    ctx: &PolicyContext,
    suppressed_groups: &[String],
) -> bool {
    if let Some(resources) = &block.resources {
        if !resources_match(resources, doc, ctx) {
            return false;
        }
    }
    if !block.subjects.is_empty()
        && !block
            .subjects
            .iter()
            .any(|s| subject_matches(s, ctx, suppressed_groups))
    {
        return false;
    }
    true
}

fn resources_match(description: &ResourceDescription, doc: &Value, ctx: &PolicyContext) -> bool {
    if !description.kinds.is_empty()
        && !description
            .kinds
            .iter()
            .any(|kind| wildcard_match(kind, resource::kind(doc)))
    {
        return false;
    }

    let mut names = description.names.clone();
    if let Some(name) = &description.name {
        names.push(name.clone());
    }
    if !names.is_empty()
        && !names
            .iter()
            .any(|name| wildcard_match(name, resource::name(doc)))
    {
        return false;
    }

    if !description.namespaces.is_empty()
        && !description
            .namespaces
            .iter()
            .any(|ns| wildcard_match(ns, resource::namespace(doc)))
    {
        return false;
    }

    if !description.operations.is_empty()
        && !description
            .operations
            .contains(&ctx.admission_info.operation)
    {
        return false;
    }

    if let Some(selector) = &description.selector {
        let labels = resource::labels(doc);
        if !selector.match_labels.iter().all(|(key, expected)| {
            labels
                .and_then(|l| l.get(key))
                .and_then(Value::as_str)
                .map(|actual| wildcard_match(expected, actual))
                .unwrap_or(false)
        }) {
            return false;
        }
    }

    if let Some(selector) = &description.namespace_selector {
        if !namespace_labels_match(selector, ctx) {
            return false;
        }
    }

    true
}

fn namespace_labels_match(selector: &LabelSelector, ctx: &PolicyContext) -> bool {
    selector.match_labels.iter().all(|(key, expected)| {
        ctx.namespace_labels
            .get(key)
            .map(|actual| wildcard_match(expected, actual))
            .unwrap_or(false)
    })
}

fn subject_matches(subject: &Subject, ctx: &PolicyContext, suppressed_groups: &[String]) -> bool {
    let info = &ctx.admission_info;
    match subject.kind.as_str() {
        "User" => wildcard_match(&subject.name, &info.username),
        "Group" => info
            .groups
            .iter()
            .filter(|group| !suppressed_groups.contains(group))
            .any(|group| wildcard_match(&subject.name, group)),
        "ServiceAccount" => {
            let mut parts = info.username.splitn(4, ':');
            matches!(
                (parts.next(), parts.next(), parts.next(), parts.next()),
                (Some("system"), Some("serviceaccount"), Some(_), Some(name))
                    if wildcard_match(&subject.name, name)
            )
        }
        _ => false,
    }
}
