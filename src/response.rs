//! Engine output types.
//!
//! Every processed rule yields exactly one [`RuleResponse`]; the driver
//! aggregates them into an [`EngineResponse`] that the admission webhook
//! serializes into events and reports.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::policy::ValidationFailureAction;

/// Response type attached to every rule response produced by this engine.
pub const RULE_TYPE_VALIDATION: &str = "Validation";

/// Outcome of a single rule.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    /// The resource satisfies the rule.
    Pass,
    /// The resource violates the rule.
    Fail,
    /// Preconditions were not met, or the pattern declared the resource
    /// out of scope.
    Skip,
    /// The rule could not be evaluated.
    Error,
    /// A violation reported as a warning instead of a failure.
    Warn,
}

/// The outcome of one rule applied to one admission event.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuleResponse {
    pub name: String,
    #[serde(rename = "type")]
    pub rule_type: String,
    pub message: String,
    pub status: RuleStatus,
    #[serde(default)]
    pub processing_time: Duration,
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
}

impl RuleResponse {
    pub fn new(name: &str, status: RuleStatus, message: String) -> Self {
        RuleResponse {
            name: name.to_string(),
            rule_type: RULE_TYPE_VALIDATION.to_string(),
            message,
            status,
            processing_time: Duration::ZERO,
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn pass(name: &str, message: String) -> Self {
        Self::new(name, RuleStatus::Pass, message)
    }

    pub fn fail(name: &str, message: String) -> Self {
        Self::new(name, RuleStatus::Fail, message)
    }

    pub fn skip(name: &str, message: String) -> Self {
        Self::new(name, RuleStatus::Skip, message)
    }

    pub fn error(name: &str, message: String) -> Self {
        Self::new(name, RuleStatus::Error, message)
    }

    pub fn with_processing_time(mut self, elapsed: Duration) -> Self {
        self.processing_time = elapsed;
        self
    }

    /// True when two responses describe the same outcome: same rule, type,
    /// message and status. Timing fields are not compared. Used to decide
    /// whether an update re-raises a pre-existing violation.
    pub fn same_outcome(&self, other: &RuleResponse) -> bool {
        self.name == other.name
            && self.rule_type == other.rule_type
            && self.message == other.message
            && self.status == other.status
    }
}

/// Identifiers of the policy that produced a response.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct PolicyIdentifier {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Identifiers of the resource the event was about.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceIdentifier {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

/// Per-policy aggregate of rule responses and counters.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct PolicyResponse {
    pub policy: PolicyIdentifier,
    pub resource: ResourceIdentifier,

    // Forwarded verbatim from the policy spec.
    pub background: bool,
    pub validation_failure_action: ValidationFailureAction,
    pub mutate_existing_on_policy_update: bool,

    /// Number of rules that produced Pass or Fail.
    pub rules_applied_count: u32,
    /// Number of rules that produced Error.
    pub rules_error_count: u32,

    pub processing_time: Duration,
    /// Seconds since the Unix epoch.
    pub timestamp: i64,

    /// Rule responses in rule-declaration order.
    pub rules: Vec<RuleResponse>,
}

impl PolicyResponse {
    /// Appends a rule response and updates the counters: Pass and Fail
    /// count as applied, Error as errored, Skip stays out of both.
    pub fn add(&mut self, response: RuleResponse) {
        match response.status {
            RuleStatus::Pass | RuleStatus::Fail => self.rules_applied_count += 1,
            RuleStatus::Error => self.rules_error_count += 1,
            RuleStatus::Skip | RuleStatus::Warn => {}
        }
        self.rules.push(response);
    }
}

/// The full result of validating one admission event against one policy.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct EngineResponse {
    /// The resource the response refers to: the new resource, or the old
    /// one when the event deleted it. Never empty for a valid event.
    pub patched_resource: Value,
    pub policy_response: PolicyResponse,
}

impl EngineResponse {
    /// True when no rule failed or errored.
    pub fn is_successful(&self) -> bool {
        !self
            .policy_response
            .rules
            .iter()
            .any(|r| matches!(r.status, RuleStatus::Fail | RuleStatus::Error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_statuses() {
        let mut response = PolicyResponse::default();
        response.add(RuleResponse::pass("a", "ok".to_string()));
        response.add(RuleResponse::fail("b", "bad".to_string()));
        response.add(RuleResponse::skip("c", "preconditions not met".to_string()));
        response.add(RuleResponse::error("d", "boom".to_string()));

        assert_eq!(response.rules_applied_count, 2);
        assert_eq!(response.rules_error_count, 1);
        assert_eq!(response.rules.len(), 4);
    }

    #[test]
    fn same_outcome_ignores_timing() {
        let first = RuleResponse::fail("r", "validation error".to_string())
            .with_processing_time(Duration::from_millis(5));
        let mut second = RuleResponse::fail("r", "validation error".to_string());
        second.timestamp = first.timestamp + 60;

        assert!(first.same_outcome(&second));
        assert!(!first.same_outcome(&RuleResponse::pass("r", "validation error".to_string())));
    }

    #[test]
    fn statuses_serialize_lowercase() {
        assert_eq!(
            serde_json::to_value(RuleStatus::Pass).unwrap(),
            serde_json::json!("pass")
        );
        assert_eq!(
            serde_json::to_value(RuleStatus::Error).unwrap(),
            serde_json::json!("error")
        );
    }

    #[test]
    fn success_means_no_fail_or_error() {
        let mut response = EngineResponse::default();
        response
            .policy_response
            .add(RuleResponse::pass("a", "ok".to_string()));
        assert!(response.is_successful());

        response
            .policy_response
            .add(RuleResponse::fail("b", "bad".to_string()));
        assert!(!response.is_successful());
    }
}
