//! Resolution of a rule's context entries.
//!
//! Entries resolve in declared order, so later entries can reference
//! earlier ones through `{{ ... }}` substitution in their parameters.
//! External sources go through the shared [`ResourceCache`]
//! (crate::cache::ResourceCache) and refuse to start once the event
//! deadline has passed.

use anyhow::{anyhow, bail, Context as _, Result};
use slog::{debug, Logger};

use crate::context::{query_document, ContextError};
use crate::policy::ContextEntry;
use crate::request::PolicyContext;
use crate::resource;
use crate::variables;

/// Resolves every entry and publishes the results into the context
/// store. A JMESPath miss in a `variable` entry is tolerated (the entry
/// is skipped, or its `default` is used); every other failure aborts.
pub fn load_context(
    log: &Logger,
    ctx: &mut PolicyContext,
    entries: &[ContextEntry],
) -> Result<()> {
    for entry in entries {
        load_entry(log, ctx, entry)
            .with_context(|| format!("failed to load context entry {:?}", entry.name))?;
    }
    Ok(())
}

fn load_entry(log: &Logger, ctx: &mut PolicyContext, entry: &ContextEntry) -> Result<()> {
    if entry.name.is_empty() {
        bail!("context entries require a name");
    }

    let sources = [
        entry.variable.is_some(),
        entry.api_call.is_some(),
        entry.config_map.is_some(),
        entry.image_registry.is_some(),
    ]
    .iter()
    .filter(|set| **set)
    .count();
    if sources != 1 {
        bail!("a context entry requires exactly one source");
    }

    if let Some(source) = &entry.variable {
        return load_variable(log, ctx, &entry.name, source);
    }

    // The remaining sources consult the outside world.
    if ctx.deadline_exceeded() {
        bail!("deadline exceeded before loading context entry");
    }

    if let Some(source) = &entry.api_call {
        let api_version = substitute_param(log, ctx, &source.api_version)?;
        let kind = substitute_param(log, ctx, &source.kind)?;
        let name = substitute_param(log, ctx, &source.name)?;
        let namespace = match &source.namespace {
            Some(ns) => Some(substitute_param(log, ctx, ns)?),
            None => None,
        };

        let mut document = ctx.resource_cache.get_resource(
            &api_version,
            &kind,
            namespace.as_deref(),
            &name,
        )?;
        if let Some(expression) = &source.jmes_path {
            let expression = substitute_param(log, ctx, expression)?;
            document = query_document(&expression, &document)?;
        }
        ctx.json_context.add_variable(&entry.name, document);
        return Ok(());
    }

    if let Some(source) = &entry.config_map {
        let name = substitute_param(log, ctx, &source.name)?;
        let namespace = match &source.namespace {
            Some(ns) => substitute_param(log, ctx, ns)?,
            None => default_namespace(ctx),
        };
        let config_map = ctx.resource_cache.get_config_map(&namespace, &name)?;
        ctx.json_context.add_variable(&entry.name, config_map);
        return Ok(());
    }

    if let Some(source) = &entry.image_registry {
        let reference = substitute_param(log, ctx, &source.reference)?;
        let data = ctx.resource_cache.get_image_data(&reference)?;
        let mut document = serde_json::to_value(&data)
            .map_err(|e| anyhow!("cannot serialize image data for {}: {}", reference, e))?;
        if let Some(expression) = &source.jmes_path {
            let expression = substitute_param(log, ctx, expression)?;
            document = query_document(&expression, &document)?;
        }
        ctx.json_context.add_variable(&entry.name, document);
        return Ok(());
    }

    unreachable!("entry source counted above");
}

fn load_variable(
    log: &Logger,
    ctx: &mut PolicyContext,
    name: &str,
    source: &crate::policy::VariableSource,
) -> Result<()> {
    let literal = match &source.value {
        Some(value) => Some(variables::substitute_all(log, &ctx.json_context, value)?),
        None => None,
    };

    let resolved = match &source.jmes_path {
        Some(expression) => {
            let expression = substitute_param(log, ctx, expression)?;
            let result = match &literal {
                // With a literal present the query projects the literal,
                // not the store.
                Some(document) => query_document(&expression, document),
                None => ctx.json_context.query(&expression),
            };
            match result {
                Ok(value) => Some(value),
                Err(ContextError::NotFound(path)) => match &source.default {
                    Some(default) => {
                        debug!(log, "context variable not found, using default";
                            "name" => name, "path" => path);
                        Some(default.clone())
                    }
                    None => {
                        debug!(log, "context variable not found, skipping entry";
                            "name" => name, "path" => path);
                        None
                    }
                },
                Err(e) => return Err(e.into()),
            }
        }
        None => literal,
    };

    if let Some(value) = resolved {
        ctx.json_context.add_variable(name, value);
    }
    Ok(())
}

/// Substitutes variables in a single entry parameter.
fn substitute_param(log: &Logger, ctx: &PolicyContext, param: &str) -> Result<String> {
    Ok(variables::substitute_to_string(log, &ctx.json_context, param)?)
}

fn default_namespace(ctx: &PolicyContext) -> String {
    let ns = if resource::is_empty(&ctx.new_resource) {
        resource::namespace(&ctx.old_resource)
    } else {
        resource::namespace(&ctx.new_resource)
    };
    if ns.is_empty() {
        "default".to_string()
    } else {
        ns.to_string()
    }
}
