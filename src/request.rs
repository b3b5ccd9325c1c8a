//! The per-event input to the engine.
//!
//! A [`PolicyContext`] bundles everything one admission event carries: the
//! old and new resource documents, the acting user, the policy to apply,
//! the context store and the shared resource cache. It lives for exactly
//! one call to [`validate`](crate::engine::validate).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::{ResourceCache, StaticCache};
use crate::context::Context;
use crate::policy::Policy;
use crate::resource;

/// The admission operation that produced the event.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Operation {
    #[default]
    #[serde(rename = "CREATE")]
    Create,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "CONNECT")]
    Connect,
}

/// Identity of the actor behind the admission request.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionInfo {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub operation: Operation,
}

/// Everything the engine needs to evaluate one admission event against
/// one policy.
pub struct PolicyContext {
    pub policy: Policy,

    /// The incoming resource; empty on DELETE.
    pub new_resource: Value,
    /// The stored resource; empty on CREATE.
    pub old_resource: Value,

    pub admission_info: AdmissionInfo,

    /// Groups ignored when evaluating exclude-block subjects, so that
    /// broad system groups do not accidentally exempt every request.
    pub exclude_group_role: Vec<String>,

    /// Labels of the namespace the resource lives in, for selector
    /// matching without an API round trip.
    pub namespace_labels: BTreeMap<String, String>,

    /// The context store queried by variable substitution and context
    /// entries.
    pub json_context: Context,

    /// Shared read-through cache for API, ConfigMap and registry lookups.
    pub resource_cache: Arc<dyn ResourceCache>,

    /// Absolute point after which context loading must give up, derived
    /// from the webhook timeout budget.
    pub deadline: Option<Instant>,
}

impl PolicyContext {
    /// Builds a context for one admission event. At most one of the two
    /// resource documents may be empty.
    ///
    /// The context store is seeded with the resources: `request.object`
    /// holds the new resource, or the old one on DELETE so that rules can
    /// still address the resource being removed.
    pub fn new(policy: Policy, new_resource: Value, old_resource: Value) -> anyhow::Result<Self> {
        if resource::is_empty(&new_resource) && resource::is_empty(&old_resource) {
            anyhow::bail!("an admission event requires a new or an old resource");
        }

        let mut json_context = Context::new();
        if resource::is_empty(&new_resource) {
            json_context.add_resource(old_resource.clone());
        } else {
            json_context.add_resource(new_resource.clone());
        }
        json_context.add_old_resource(old_resource.clone());
        // A default identity keeps `request.operation` and
        // `request.userInfo` resolvable before the caller attaches the
        // real one.
        json_context.add_user_info(&AdmissionInfo::default());

        Ok(PolicyContext {
            policy,
            new_resource,
            old_resource,
            admission_info: AdmissionInfo::default(),
            exclude_group_role: Vec::new(),
            namespace_labels: BTreeMap::new(),
            json_context,
            resource_cache: Arc::new(StaticCache::default()),
            deadline: None,
        })
    }

    /// Attaches the acting user and publishes it in the context store.
    pub fn with_admission_info(mut self, info: AdmissionInfo) -> Self {
        self.json_context.add_user_info(&info);
        self.admission_info = info;
        self
    }

    pub fn with_resource_cache(mut self, cache: Arc<dyn ResourceCache>) -> Self {
        self.resource_cache = cache;
        self
    }

    /// Derives the context-loading deadline from the remaining webhook
    /// timeout budget.
    pub fn with_timeout(mut self, budget: Duration) -> Self {
        self.deadline = Some(Instant::now() + budget);
        self
    }

    pub fn with_namespace_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.namespace_labels = labels;
        self
    }

    pub fn with_exclude_group_role(mut self, groups: Vec<String>) -> Self {
        self.exclude_group_role = groups;
        self
    }

    /// True once the webhook budget is exhausted.
    pub fn deadline_exceeded(&self) -> bool {
        self.deadline
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }
}
