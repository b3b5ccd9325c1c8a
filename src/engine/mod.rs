//! The validation engine entry point.
//!
//! [`validate`] applies every rule of the policy carried by a
//! [`PolicyContext`] to its admission event and aggregates the outcomes.
//! Failures inside one rule never abort the run; the next rule still
//! executes with a pristine context store.

pub(crate) mod filter;
mod rule;

use chrono::Utc;
use slog::{debug, o, Logger};
use std::time::Instant;

use crate::request::PolicyContext;
use crate::resource;
use crate::response::{EngineResponse, PolicyIdentifier, PolicyResponse, ResourceIdentifier};

/// Validates one admission event against one policy.
///
/// Rules run in declared order. Each produces at most one rule response;
/// rules whose match block does not apply, and pattern rules whose
/// outcome pre-existed on the old resource, stay silent.
pub fn validate(log: &Logger, ctx: &mut PolicyContext) -> EngineResponse {
    let started = Instant::now();

    let target = if resource::is_empty(&ctx.new_resource) {
        ctx.old_resource.clone()
    } else {
        ctx.new_resource.clone()
    };

    let log = log.new(o!(
        "policy" => ctx.policy.name().to_string(),
        "kind" => resource::kind(&target).to_string(),
        "namespace" => resource::namespace(&target).to_string(),
        "name" => resource::name(&target).to_string(),
    ));

    let mut response = EngineResponse {
        policy_response: PolicyResponse {
            policy: PolicyIdentifier {
                name: ctx.policy.name().to_string(),
                namespace: ctx.policy.namespace().map(str::to_string),
            },
            resource: ResourceIdentifier {
                api_version: resource::api_version(&target).to_string(),
                kind: resource::kind(&target).to_string(),
                namespace: resource::namespace(&target).to_string(),
                name: resource::name(&target).to_string(),
            },
            background: ctx.policy.spec.background,
            validation_failure_action: ctx.policy.spec.validation_failure_action.clone(),
            mutate_existing_on_policy_update: ctx.policy.spec.mutate_existing_on_policy_update,
            timestamp: Utc::now().timestamp(),
            ..Default::default()
        },
        patched_resource: target,
    };

    // Pods owned by a workload controller are validated through their
    // controller; validating them twice would double-report.
    if resource::owned_by_workload_controller(&ctx.new_resource) {
        debug!(log, "pod is managed by a workload controller, skipping validation");
        response.policy_response.processing_time = started.elapsed();
        return response;
    }

    ctx.json_context.checkpoint();
    let rules = ctx.policy.spec.rules.clone();
    for r in &rules {
        if r.validate.is_none() {
            continue;
        }
        if let Some(rule_response) = rule::process_validation_rule(&log, ctx, r) {
            response.policy_response.add(rule_response);
        }
    }
    ctx.json_context.restore();

    response.policy_response.processing_time = started.elapsed();
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Policy;
    use crate::request::{AdmissionInfo, Operation};
    use crate::response::RuleStatus;
    use assert_json_diff::assert_json_eq;
    use serde_json::{json, Value};

    fn discard() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn policy(yaml: &str) -> Policy {
        Policy::from_yaml(yaml).expect("cannot deserialize policy")
    }

    fn non_root_policy() -> Policy {
        policy(
            r#"
metadata:
  name: require-run-as-non-root
spec:
  rules:
    - name: check-containers
      match:
        resources:
          kinds: ["Pod"]
      validate:
        pattern:
          spec:
            containers:
              - securityContext:
                  runAsNonRoot: true
"#,
        )
    }

    fn non_root_pod(run_as_non_root: bool, labels: Value) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "app", "namespace": "prod", "labels": labels},
            "spec": {
                "containers": [
                    {"name": "app", "securityContext": {"runAsNonRoot": run_as_non_root}}
                ]
            }
        })
    }

    #[test]
    fn pattern_mismatch_fails_with_the_diverging_path() {
        let log = discard();
        let mut ctx = PolicyContext::new(
            non_root_policy(),
            non_root_pod(false, json!({})),
            Value::Null,
        )
        .unwrap();

        let response = validate(&log, &mut ctx);
        let rules = &response.policy_response.rules;
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].status, RuleStatus::Fail);
        assert!(rules[0]
            .message
            .contains("path spec.containers[0].securityContext.runAsNonRoot"));
        assert_eq!(response.policy_response.rules_applied_count, 1);
    }

    #[test]
    fn matching_resource_passes() {
        let log = discard();
        let mut ctx = PolicyContext::new(
            non_root_policy(),
            non_root_pod(true, json!({})),
            Value::Null,
        )
        .unwrap();

        let response = validate(&log, &mut ctx);
        assert_eq!(response.policy_response.rules[0].status, RuleStatus::Pass);
        assert_eq!(
            response.policy_response.rules[0].message,
            "validation rule 'check-containers' passed."
        );
        assert!(response.is_successful());
    }

    #[test]
    fn unrelated_updates_do_not_re_raise_violations() {
        let log = discard();
        let mut ctx = PolicyContext::new(
            non_root_policy(),
            non_root_pod(false, json!({"a": "2"})),
            non_root_pod(false, json!({"a": "1"})),
        )
        .unwrap();

        let response = validate(&log, &mut ctx);
        assert!(response.policy_response.rules.is_empty());
        assert_eq!(response.policy_response.rules_applied_count, 0);
    }

    #[test]
    fn updates_that_introduce_a_violation_fail() {
        let log = discard();
        let mut ctx = PolicyContext::new(
            non_root_policy(),
            non_root_pod(false, json!({})),
            non_root_pod(true, json!({})),
        )
        .unwrap();

        let response = validate(&log, &mut ctx);
        assert_eq!(response.policy_response.rules.len(), 1);
        assert_eq!(response.policy_response.rules[0].status, RuleStatus::Fail);
    }

    #[test]
    fn false_preconditions_skip_the_rule() {
        let log = discard();
        let p = policy(
            r#"
metadata:
  name: on-create-only
spec:
  rules:
    - name: create-only
      preconditions:
        all:
          - key: "{{ request.operation }}"
            operator: Equals
            value: CREATE
      validate:
        pattern:
          metadata:
            name: "*"
"#,
        );
        let mut ctx = PolicyContext::new(p, non_root_pod(true, json!({})), Value::Null)
            .unwrap()
            .with_admission_info(AdmissionInfo {
                operation: Operation::Update,
                ..Default::default()
            });

        let response = validate(&log, &mut ctx);
        assert_eq!(response.policy_response.rules[0].status, RuleStatus::Skip);
        assert_eq!(response.policy_response.rules_applied_count, 0);
    }

    fn latest_tag_policy() -> Policy {
        policy(
            r#"
metadata:
  name: disallow-latest
spec:
  rules:
    - name: no-latest-tag
      match:
        resources:
          kinds: ["Pod"]
      validate:
        foreach:
          - list: "request.object.spec.containers"
            pattern:
              image: "!*:latest"
"#,
        )
    }

    fn pod_with_images(images: &[&str]) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "app"},
            "spec": {
                "containers": images
                    .iter()
                    .map(|image| json!({"image": image}))
                    .collect::<Vec<_>>()
            }
        })
    }

    #[test]
    fn foreach_passes_when_every_element_matches() {
        let log = discard();
        let mut ctx = PolicyContext::new(
            latest_tag_policy(),
            pod_with_images(&["nginx:1.25", "redis:7"]),
            Value::Null,
        )
        .unwrap();

        let response = validate(&log, &mut ctx);
        assert_eq!(response.policy_response.rules[0].status, RuleStatus::Pass);
        assert_eq!(response.policy_response.rules_applied_count, 1);
    }

    #[test]
    fn foreach_short_circuits_on_the_first_failure() {
        let log = discard();
        let mut ctx = PolicyContext::new(
            latest_tag_policy(),
            pod_with_images(&["nginx:1.25", "foo:latest", "redis:7"]),
            Value::Null,
        )
        .unwrap();

        let response = validate(&log, &mut ctx);
        let rule = &response.policy_response.rules[0];
        assert_eq!(rule.status, RuleStatus::Fail);
        assert!(rule.message.contains("validation failed in foreach rule"));
        assert!(rule.message.contains("index 1"));
    }

    #[test]
    fn foreach_over_an_empty_list_skips() {
        let log = discard();
        let mut ctx =
            PolicyContext::new(latest_tag_policy(), pod_with_images(&[]), Value::Null).unwrap();

        let response = validate(&log, &mut ctx);
        assert_eq!(response.policy_response.rules[0].status, RuleStatus::Skip);
        assert_eq!(response.policy_response.rules_applied_count, 0);
    }

    #[test]
    fn deny_substitutes_the_user_message() {
        let log = discard();
        let p = policy(
            r#"
metadata:
  name: block-anonymous
spec:
  rules:
    - name: no-anonymous
      validate:
        message: "user {{ request.userInfo.username }} may not create resources"
        deny:
          conditions:
            all:
              - key: "{{ request.userInfo.username }}"
                operator: Equals
                value: "system:anonymous"
"#,
        );
        let mut ctx = PolicyContext::new(p, non_root_pod(true, json!({})), Value::Null)
            .unwrap()
            .with_admission_info(AdmissionInfo {
                username: "system:anonymous".to_string(),
                ..Default::default()
            });

        let response = validate(&log, &mut ctx);
        let rule = &response.policy_response.rules[0];
        assert_eq!(rule.status, RuleStatus::Fail);
        assert_eq!(
            rule.message,
            "user system:anonymous may not create resources"
        );
    }

    #[test]
    fn deny_passes_when_conditions_do_not_hold() {
        let log = discard();
        let p = policy(
            r#"
metadata:
  name: block-anonymous
spec:
  rules:
    - name: no-anonymous
      validate:
        deny:
          conditions:
            all:
              - key: "{{ request.userInfo.username }}"
                operator: Equals
                value: "system:anonymous"
"#,
        );
        let mut ctx = PolicyContext::new(p, non_root_pod(true, json!({})), Value::Null)
            .unwrap()
            .with_admission_info(AdmissionInfo {
                username: "jane".to_string(),
                ..Default::default()
            });

        let response = validate(&log, &mut ctx);
        assert_eq!(response.policy_response.rules[0].status, RuleStatus::Pass);
    }

    #[test]
    fn deny_still_runs_on_delete() {
        let log = discard();
        let p = policy(
            r#"
metadata:
  name: protect
spec:
  rules:
    - name: no-delete
      validate:
        message: "{{ request.object.metadata.name }} must not be deleted"
        deny:
          conditions:
            all:
              - key: "{{ request.operation }}"
                operator: Equals
                value: DELETE
"#,
        );
        let mut ctx = PolicyContext::new(p, Value::Null, non_root_pod(true, json!({})))
            .unwrap()
            .with_admission_info(AdmissionInfo {
                operation: Operation::Delete,
                ..Default::default()
            });

        let response = validate(&log, &mut ctx);
        let rule = &response.policy_response.rules[0];
        assert_eq!(rule.status, RuleStatus::Fail);
        assert_eq!(rule.message, "app must not be deleted");
        // the deleted resource is still reported as the patched resource
        assert_eq!(resource::name(&response.patched_resource), "app");
    }

    #[test]
    fn pattern_rules_stay_silent_on_delete() {
        let log = discard();
        let mut ctx = PolicyContext::new(
            non_root_policy(),
            Value::Null,
            non_root_pod(false, json!({})),
        )
        .unwrap();

        let response = validate(&log, &mut ctx);
        assert!(response.policy_response.rules.is_empty());
        assert!(!resource::is_empty(&response.patched_resource));
    }

    #[test]
    fn any_pattern_short_circuits_and_names_the_winning_index() {
        let log = discard();
        let p = policy(
            r#"
metadata:
  name: registries
spec:
  rules:
    - name: known-registry
      validate:
        anyPattern:
          - metadata:
              name: "db-*"
          - metadata:
              name: "app*"
"#,
        );
        let mut ctx = PolicyContext::new(p, non_root_pod(true, json!({})), Value::Null).unwrap();

        let response = validate(&log, &mut ctx);
        let rule = &response.policy_response.rules[0];
        assert_eq!(rule.status, RuleStatus::Pass);
        assert_eq!(
            rule.message,
            "validation rule 'known-registry' anyPattern[1] passed."
        );
    }

    #[test]
    fn any_pattern_failure_lists_every_index() {
        let log = discard();
        let p = policy(
            r#"
metadata:
  name: registries
spec:
  rules:
    - name: known-registry
      validate:
        anyPattern:
          - metadata:
              name: "db-*"
          - metadata:
              name: "cache-*"
"#,
        );
        let mut ctx = PolicyContext::new(p, non_root_pod(true, json!({})), Value::Null).unwrap();

        let response = validate(&log, &mut ctx);
        let rule = &response.policy_response.rules[0];
        assert_eq!(rule.status, RuleStatus::Fail);
        assert!(rule.message.contains("anyPattern[0]"));
        assert!(rule.message.contains("anyPattern[1]"));
    }

    #[test]
    fn counters_account_for_every_emitted_status() {
        let log = discard();
        let p = policy(
            r#"
metadata:
  name: mixed
spec:
  rules:
    - name: passes
      validate:
        pattern:
          kind: Pod
    - name: fails
      validate:
        pattern:
          metadata:
            name: other
    - name: skipped
      preconditions:
        all:
          - key: "{{ request.operation }}"
            operator: Equals
            value: DELETE
      validate:
        pattern:
          kind: Pod
    - name: errors
      validate:
        pattern:
          spec:
            containers:
              - securityContext:
                  runAsNonRoot: ">oops"
    - name: not-matching
      match:
        resources:
          kinds: ["Secret"]
      validate:
        pattern:
          kind: Secret
"#,
        );
        let mut ctx = PolicyContext::new(p, non_root_pod(true, json!({})), Value::Null).unwrap();

        let response = validate(&log, &mut ctx);
        let pr = &response.policy_response;
        assert_eq!(pr.rules.len(), 4, "the non-matching rule stays silent");
        assert_eq!(pr.rules_applied_count, 2);
        assert_eq!(pr.rules_error_count, 1);
        assert_eq!(pr.rules[2].status, RuleStatus::Skip);
    }

    #[test]
    fn rule_errors_do_not_abort_later_rules() {
        let log = discard();
        let p = policy(
            r#"
metadata:
  name: resilient
spec:
  rules:
    - name: broken-context
      context:
        - name: missing
          configMap:
            name: does-not-exist
      validate:
        pattern:
          kind: Pod
    - name: still-runs
      validate:
        pattern:
          kind: Pod
"#,
        );
        let mut ctx = PolicyContext::new(p, non_root_pod(true, json!({})), Value::Null).unwrap();

        let response = validate(&log, &mut ctx);
        let pr = &response.policy_response;
        assert_eq!(pr.rules[0].status, RuleStatus::Error);
        assert_eq!(pr.rules[1].status, RuleStatus::Pass);
    }

    #[test]
    fn controller_owned_pods_are_not_validated() {
        let log = discard();
        let pod = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "web-abc12",
                "ownerReferences": [{"kind": "ReplicaSet", "name": "web-abc"}]
            },
            "spec": {"containers": [{"securityContext": {"runAsNonRoot": false}}]}
        });
        let mut ctx = PolicyContext::new(non_root_policy(), pod, Value::Null).unwrap();

        let response = validate(&log, &mut ctx);
        assert!(response.policy_response.rules.is_empty());
    }

    #[test]
    fn the_context_store_is_restored_after_validation() {
        let log = discard();
        let p = policy(
            r#"
metadata:
  name: nested
spec:
  rules:
    - name: nested-foreach
      context:
        - name: marker
          variable:
            value: outer
      validate:
        foreach:
          - list: "request.object.spec.containers"
            context:
              - name: marker
                variable:
                  value: inner
            foreach:
              - list: "element.ports"
                pattern:
                  containerPort: "<65536"
"#,
        );
        let pod = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "app"},
            "spec": {"containers": [
                {"name": "a", "ports": [{"containerPort": 80}, {"containerPort": 443}]},
                {"name": "b", "ports": [{"containerPort": 8080}]}
            ]}
        });
        let mut ctx = PolicyContext::new(p, pod, Value::Null).unwrap();
        let before = ctx.json_context.document().clone();

        let response = validate(&log, &mut ctx);
        assert_eq!(response.policy_response.rules[0].status, RuleStatus::Pass);
        assert_json_eq!(ctx.json_context.document().clone(), before);
    }

    #[test]
    fn policy_fields_are_forwarded_into_the_response() {
        let log = discard();
        let p = policy(
            r#"
metadata:
  name: forwarded
  namespace: team-a
spec:
  background: false
  validationFailureAction: enforce
  mutateExistingOnPolicyUpdate: true
  rules: []
"#,
        );
        let mut ctx = PolicyContext::new(p, non_root_pod(true, json!({})), Value::Null).unwrap();

        let response = validate(&log, &mut ctx);
        let pr = &response.policy_response;
        assert_eq!(pr.policy.name, "forwarded");
        assert_eq!(pr.policy.namespace.as_deref(), Some("team-a"));
        assert!(!pr.background);
        assert!(pr.mutate_existing_on_policy_update);
        assert_eq!(pr.resource.kind, "Pod");
        assert_eq!(pr.resource.namespace, "prod");
    }
}
