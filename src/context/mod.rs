//! The per-event context store.
//!
//! A [`Context`] is a JSON document holding everything `{{ ... }}`
//! expressions and context entries can address: the request resource
//! under `request.object`, the actor under `request.userInfo`, pre-loaded
//! external data under user-chosen names, and the current iteration
//! element under `element`. Queries run through JMESPath, the same engine
//! admission requests are searched with.
//!
//! The store supports checkpoint/restore so that a rule (or a foreach
//! element) can mutate it freely and still leave it exactly as found.

pub mod loader;

use jmespatch::Variable;
use serde_json::{json, Value};

use crate::request::AdmissionInfo;

/// Errors surfaced by context queries. `NotFound` is non-fatal in the
/// context-load path; everything else aborts the rule.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// The query evaluated to nothing. JMESPath yields `null` both for
    /// absent keys and for genuinely-null leaves; the engine treats both
    /// as absence.
    #[error("path not found in context: {0}")]
    NotFound(String),

    #[error("JMESPath query {expression:?} failed: {source}")]
    Query {
        expression: String,
        #[source]
        source: jmespatch::JmespathError,
    },

    #[error("cannot convert query result: {0}")]
    Conversion(#[from] serde_json::Error),
}

/// Evaluates a JMESPath expression against an arbitrary document. A
/// `null` result reports [`ContextError::NotFound`].
pub fn query_document(expression: &str, document: &Value) -> Result<Value, ContextError> {
    let compiled = jmespatch::compile(expression).map_err(|e| ContextError::Query {
        expression: expression.to_string(),
        source: e,
    })?;
    let data = Variable::from_serializable(document.clone()).map_err(|e| ContextError::Query {
        expression: expression.to_string(),
        source: e,
    })?;
    let result = compiled.search(data).map_err(|e| ContextError::Query {
        expression: expression.to_string(),
        source: e,
    })?;

    if result.is_null() {
        return Err(ContextError::NotFound(expression.to_string()));
    }
    Ok(serde_json::to_value(result.as_ref())?)
}

/// Hierarchical key/value document with a checkpoint stack.
pub struct Context {
    document: Value,
    checkpoints: Vec<Value>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    pub fn new() -> Self {
        Context {
            document: json!({}),
            checkpoints: Vec::new(),
        }
    }

    /// Publishes the request resource at `request.object`.
    pub fn add_resource(&mut self, resource: Value) {
        self.add_variable("request.object", resource);
    }

    /// Publishes the prior state of the resource at `request.oldObject`.
    pub fn add_old_resource(&mut self, resource: Value) {
        self.add_variable("request.oldObject", resource);
    }

    /// Publishes the acting user at `request.userInfo` and
    /// `request.operation`. Service-account usernames
    /// (`system:serviceaccount:<namespace>:<name>`) additionally populate
    /// `serviceAccountName` and `serviceAccountNamespace`.
    pub fn add_user_info(&mut self, info: &AdmissionInfo) {
        self.add_variable(
            "request.userInfo",
            json!({"username": info.username, "groups": info.groups}),
        );
        self.add_variable(
            "request.operation",
            serde_json::to_value(info.operation).unwrap_or(Value::Null),
        );

        let mut parts = info.username.splitn(4, ':');
        if let (Some("system"), Some("serviceaccount"), Some(namespace), Some(name)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        {
            self.add_variable("serviceAccountName", json!(name));
            self.add_variable("serviceAccountNamespace", json!(namespace));
        }
    }

    /// Replaces `request.object`, used by foreach to stand an element in
    /// for the resource.
    pub fn add_resource_as_object(&mut self, element: Value) {
        self.add_variable("request.object", element);
    }

    /// Publishes the current iteration element at `element` and its
    /// position at `elementIndex`.
    pub fn add_element(&mut self, element: Value, index: usize) {
        self.add_variable("element", element);
        self.add_variable("elementIndex", json!(index));
    }

    /// Writes `value` at a dotted path, creating intermediate objects and
    /// overwriting whatever was there.
    pub fn add_variable(&mut self, path: &str, value: Value) {
        let mut target = &mut self.document;
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            if !target.is_object() {
                *target = json!({});
            }
            let map = target.as_object_mut().unwrap();
            if segments.peek().is_none() {
                map.insert(segment.to_string(), value);
                return;
            }
            target = map
                .entry(segment.to_string())
                .or_insert_with(|| json!({}));
        }
    }

    /// Evaluates a JMESPath expression against the current document.
    pub fn query(&self, expression: &str) -> Result<Value, ContextError> {
        query_document(expression, &self.document)
    }

    /// Pushes a snapshot of the document onto the checkpoint stack.
    pub fn checkpoint(&mut self) {
        self.checkpoints.push(self.document.clone());
    }

    /// Pops the last checkpoint and restores it. A restore without a
    /// matching checkpoint is a no-op.
    pub fn restore(&mut self) {
        if let Some(snapshot) = self.checkpoints.pop() {
            self.document = snapshot;
        }
    }

    /// Restores the last checkpoint without popping it, discarding every
    /// mutation made since. Used between foreach elements.
    pub fn reset(&mut self) {
        if let Some(snapshot) = self.checkpoints.last() {
            self.document = snapshot.clone();
        }
    }

    /// The current store document.
    pub fn document(&self) -> &Value {
        &self.document
    }
}
