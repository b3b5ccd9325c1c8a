//! Validation rule engine for Kubernetes admission policies.
//!
//! Given a policy (an ordered set of rules) and an admission event (the
//! old and new state of a resource plus the acting user), the engine
//! decides for each rule whether the event passes, fails, is skipped or
//! errors, and assembles a structured [`EngineResponse`].
//!
//! Rules select resources with match/exclude blocks, pre-load external
//! data into a per-event context store, gate themselves with any/all
//! preconditions, and validate through declarative patterns, deny
//! conditions, or per-element foreach iteration. `{{ ... }}` expressions
//! anywhere in a rule are JMESPath queries against the context store.
//!
//! # Example
//!
//! ```
//! use admission_policy_engine::policy::Policy;
//! use admission_policy_engine::{validate, PolicyContext};
//! use serde_json::json;
//! use slog::{o, Logger};
//!
//! let policy = Policy::from_yaml(
//!     r#"
//! metadata:
//!   name: require-team-label
//! spec:
//!   rules:
//!     - name: has-team-label
//!       validate:
//!         pattern:
//!           metadata:
//!             labels:
//!               team: "?*"
//! "#,
//! )
//! .unwrap();
//!
//! let pod = json!({
//!     "kind": "Pod",
//!     "metadata": {"name": "app", "labels": {"team": "storage"}}
//! });
//!
//! let log = Logger::root(slog::Discard, o!());
//! let mut ctx = PolicyContext::new(policy, pod, serde_json::Value::Null).unwrap();
//! let response = validate(&log, &mut ctx);
//! assert!(response.is_successful());
//! ```

pub mod cache;
pub mod conditions;
pub mod context;
pub mod engine;
pub mod pattern;
pub mod policy;
pub mod request;
pub mod resource;
pub mod response;
pub mod variables;

pub use engine::validate;
pub use request::{AdmissionInfo, Operation, PolicyContext};
pub use response::{EngineResponse, RuleResponse, RuleStatus};
