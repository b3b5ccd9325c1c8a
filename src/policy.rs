//! Policy and rule definitions.
//!
//! These types mirror the policy CRD read by the admission controller.
//! Only the fields the validation engine consumes are modeled; unknown
//! fields are ignored so newer CRD revisions keep deserializing.

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::conditions::Conditions;
use crate::request::Operation;

/// A validation policy: an ordered set of rules applied to one admission
/// event.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    #[serde(default)]
    pub metadata: PolicyMetadata,
    #[serde(default)]
    pub spec: PolicySpec,
}

impl Policy {
    /// Decodes a policy from its JSON representation.
    pub fn from_json(payload: &[u8]) -> anyhow::Result<Self> {
        serde_json::from_slice(payload).map_err(|e| {
            anyhow!(
                "Error decoding policy {}: {:?}",
                String::from_utf8_lossy(payload),
                e
            )
        })
    }

    /// Decodes a policy from a YAML manifest.
    pub fn from_yaml(manifest: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(manifest)
            .map_err(|e| anyhow!("Error decoding policy manifest: {:?}", e))
    }

    /// Name of the policy.
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Namespace of the policy; `None` for cluster-scoped policies.
    pub fn namespace(&self) -> Option<&str> {
        self.metadata.namespace.as_deref()
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct PolicyMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    #[serde(default)]
    pub rules: Vec<Rule>,

    /// Whether the policy also applies to existing resources during
    /// background scans. Forwarded verbatim into the engine response.
    #[serde(default = "default_background")]
    pub background: bool,

    /// What the admission controller does with a Fail outcome.
    /// Forwarded verbatim into the engine response.
    #[serde(default)]
    pub validation_failure_action: ValidationFailureAction,

    /// Whether mutate-existing rules re-run when the policy itself is
    /// updated. Not interpreted by this engine; forwarded verbatim.
    #[serde(default)]
    pub mutate_existing_on_policy_update: bool,
}

fn default_background() -> bool {
    true
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub enum ValidationFailureAction {
    #[default]
    #[serde(rename = "audit", alias = "Audit")]
    Audit,
    #[serde(rename = "enforce", alias = "Enforce")]
    Enforce,
}

/// A single validation rule.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(default)]
    pub name: String,

    /// Which resources and subjects the rule applies to. An absent match
    /// block matches everything.
    #[serde(default, rename = "match")]
    pub match_resources: Option<MatchResources>,

    /// Resources and subjects carved out of the match. A matching exclude
    /// block suppresses the rule without a response.
    #[serde(default)]
    pub exclude: Option<MatchResources>,

    /// Context entries resolved before the rule body runs, in declared
    /// order. Later entries may reference earlier ones.
    #[serde(default)]
    pub context: Vec<ContextEntry>,

    /// Conditions gating the rule body; false yields a Skip response.
    #[serde(default)]
    pub preconditions: Option<Conditions>,

    #[serde(default)]
    pub validate: Option<Validation>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct MatchResources {
    #[serde(default)]
    pub resources: Option<ResourceDescription>,
    #[serde(default)]
    pub subjects: Vec<Subject>,
}

impl MatchResources {
    pub fn is_empty(&self) -> bool {
        self.resources.is_none() && self.subjects.is_empty()
    }
}

/// Selects resources by kind, name, namespace, operation and labels.
/// `names`, `namespaces` and label values accept `*`/`?` wildcards.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescription {
    #[serde(default)]
    pub kinds: Vec<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default)]
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub selector: Option<LabelSelector>,
    /// Matched against the labels of the namespace the resource lives
    /// in, supplied by the caller alongside the admission event.
    #[serde(default)]
    pub namespace_selector: Option<LabelSelector>,
}

/// An RBAC-style subject reference: `kind` is `User`, `Group` or
/// `ServiceAccount`; `name` accepts wildcards.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

/// One named entry of a rule's context block. Exactly one source must be
/// set; the resolved value is published in the context store under `name`.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ContextEntry {
    pub name: String,
    #[serde(default)]
    pub variable: Option<VariableSource>,
    #[serde(default)]
    pub api_call: Option<ApiCallSource>,
    #[serde(default)]
    pub config_map: Option<ConfigMapSource>,
    #[serde(default)]
    pub image_registry: Option<ImageRegistrySource>,
}

/// A context value computed from a literal and/or a JMESPath query over
/// the current store.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct VariableSource {
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub jmes_path: Option<String>,
    /// Fallback used when the query hits an absent key.
    #[serde(default)]
    pub default: Option<Value>,
}

/// A Kubernetes API lookup performed through the resource cache.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ApiCallSource {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub name: String,
    /// Optional projection applied to the fetched document.
    #[serde(default)]
    pub jmes_path: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapSource {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

/// An OCI image descriptor lookup by reference string.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ImageRegistrySource {
    #[serde(default)]
    pub reference: String,
    #[serde(default)]
    pub jmes_path: Option<String>,
}

/// The validate block of a rule. Exactly one of `pattern`, `anyPattern`,
/// `deny` or `foreach` must be present.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Validation {
    /// User-facing message attached to Fail responses. Supports
    /// `{{ ... }}` substitution.
    #[serde(default)]
    pub message: Option<String>,

    /// A pattern the resource must match.
    #[serde(default)]
    pub pattern: Option<Value>,

    /// A list of patterns; the resource must match at least one.
    #[serde(default)]
    pub any_pattern: Option<Value>,

    /// Conditions that reject the request when they evaluate to true.
    #[serde(default)]
    pub deny: Option<Deny>,

    /// Per-element validation over a list extracted from the resource.
    #[serde(default)]
    pub foreach: Option<Vec<ForEachValidation>>,
}

/// The body of a validate block, resolved to exactly one shape.
#[derive(Debug)]
pub enum ValidationKind<'a> {
    Pattern(&'a Value),
    AnyPattern(&'a Value),
    Deny(&'a Deny),
    ForEach(&'a [ForEachValidation]),
}

impl Validation {
    /// Resolves which of the four validation shapes this block carries.
    /// Zero or more than one shape is a configuration error.
    pub fn kind(&self) -> anyhow::Result<ValidationKind<'_>> {
        let mut kinds: Vec<ValidationKind> = Vec::new();
        if let Some(pattern) = &self.pattern {
            kinds.push(ValidationKind::Pattern(pattern));
        }
        if let Some(any_pattern) = &self.any_pattern {
            kinds.push(ValidationKind::AnyPattern(any_pattern));
        }
        if let Some(deny) = &self.deny {
            kinds.push(ValidationKind::Deny(deny));
        }
        if let Some(foreach) = &self.foreach {
            kinds.push(ValidationKind::ForEach(foreach));
        }
        match kinds.len() {
            1 => Ok(kinds.remove(0)),
            0 => Err(anyhow!(
                "a validate block requires one of pattern, anyPattern, deny or foreach"
            )),
            _ => Err(anyhow!(
                "a validate block accepts only one of pattern, anyPattern, deny or foreach"
            )),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Deny {
    /// The request is rejected when these conditions hold. An empty
    /// condition set always holds.
    #[serde(default)]
    pub conditions: Conditions,
}

/// A foreach iteration: an inner validate block applied to every element
/// of `list`. Iterations nest through the `foreach` field.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ForEachValidation {
    /// JMESPath expression producing the elements, evaluated against the
    /// context store. A non-list result is treated as a single element.
    #[serde(default)]
    pub list: String,

    /// Context entries resolved once per element, after the element is
    /// published.
    #[serde(default)]
    pub context: Vec<ContextEntry>,

    /// Conditions gating each element; a false precondition skips the
    /// element without failing the rule.
    #[serde(default)]
    pub preconditions: Option<Conditions>,

    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub pattern: Option<Value>,
    #[serde(default)]
    pub any_pattern: Option<Value>,
    #[serde(default)]
    pub deny: Option<Deny>,
    #[serde(default)]
    pub foreach: Option<Vec<ForEachValidation>>,
}

impl ForEachValidation {
    /// The inner validate block evaluated for each element.
    pub(crate) fn to_validation(&self) -> Validation {
        Validation {
            message: self.message.clone(),
            pattern: self.pattern.clone(),
            any_pattern: self.any_pattern.clone(),
            deny: self.deny.clone(),
            foreach: self.foreach.clone(),
        }
    }
}
