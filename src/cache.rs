//! The boundary between the engine and the outside world.
//!
//! Context entries that consult the cluster (API lookups, ConfigMaps) or
//! an image registry go through a [`ResourceCache`]. One cache instance is
//! shared across concurrent admission events and must be thread-safe; it
//! is the engine's only synchronization boundary. Implementations are
//! expected to be read-through with a single-flight guarantee per key, so
//! concurrent events do not duplicate upstream calls.

use anyhow::{anyhow, Result};
use oci_spec::image::{ImageConfiguration, ImageManifest};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

/// Manifest, configuration and digest of an OCI image, as published into
/// the context store by `imageRegistry` entries.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ImageData {
    pub manifest: ImageManifest,
    pub config: ImageConfiguration,
    pub digest: String,
}

/// Read-through cache consulted by the context loader.
///
/// Implementations own their timeout behavior; the loader additionally
/// refuses to start a fetch once the event deadline has passed.
#[cfg_attr(test, mockall::automock)]
pub trait ResourceCache: Send + Sync {
    /// Fetches a resource by apiVersion, kind, namespace and name.
    /// `namespace` is `None` for cluster-scoped resources.
    fn get_resource<'a>(
        &self,
        api_version: &'a str,
        kind: &'a str,
        namespace: Option<&'a str>,
        name: &'a str,
    ) -> Result<Value>;

    /// Fetches a ConfigMap by namespace and name.
    fn get_config_map(&self, namespace: &str, name: &str) -> Result<Value>;

    /// Fetches the descriptor of the image behind a reference string.
    fn get_image_data(&self, reference: &str) -> Result<ImageData>;
}

/// An in-memory [`ResourceCache`] preloaded with fixed documents.
///
/// This is the test double for code built on the engine, in the same
/// spirit as a mock cluster client: populate it with the resources a test
/// expects, hand it to the [`PolicyContext`](crate::request::PolicyContext),
/// and every lookup resolves locally. Lookups for anything not inserted
/// fail, which is also how a cache miss surfaces in production paths.
#[derive(Default)]
pub struct StaticCache {
    resources: RwLock<HashMap<String, Value>>,
    config_maps: RwLock<HashMap<String, Value>>,
    images: RwLock<HashMap<String, ImageData>>,
}

impl StaticCache {
    pub fn insert_resource(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
        resource: Value,
    ) {
        self.resources
            .write()
            .unwrap()
            .insert(resource_key(api_version, kind, namespace, name), resource);
    }

    pub fn insert_config_map(&self, namespace: &str, name: &str, config_map: Value) {
        self.config_maps
            .write()
            .unwrap()
            .insert(format!("{}/{}", namespace, name), config_map);
    }

    pub fn insert_image(&self, reference: &str, data: ImageData) {
        self.images
            .write()
            .unwrap()
            .insert(reference.to_string(), data);
    }
}

fn resource_key(api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> String {
    format!(
        "{}/{}/{}/{}",
        api_version,
        kind,
        namespace.unwrap_or(""),
        name
    )
}

impl ResourceCache for StaticCache {
    fn get_resource(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Value> {
        self.resources
            .read()
            .unwrap()
            .get(&resource_key(api_version, kind, namespace, name))
            .cloned()
            .ok_or_else(|| {
                anyhow!(
                    "resource {}/{} {} not found in cache",
                    api_version,
                    kind,
                    name
                )
            })
    }

    fn get_config_map(&self, namespace: &str, name: &str) -> Result<Value> {
        self.config_maps
            .read()
            .unwrap()
            .get(&format!("{}/{}", namespace, name))
            .cloned()
            .ok_or_else(|| anyhow!("configmap {}/{} not found in cache", namespace, name))
    }

    fn get_image_data(&self, reference: &str) -> Result<ImageData> {
        self.images
            .read()
            .unwrap()
            .get(reference)
            .cloned()
            .ok_or_else(|| anyhow!("image {} not found in cache", reference))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn static_cache_round_trips_resources() {
        let cache = StaticCache::default();
        cache.insert_resource(
            "v1",
            "Namespace",
            None,
            "prod",
            json!({"metadata": {"name": "prod", "labels": {"tier": "restricted"}}}),
        );

        let fetched = cache.get_resource("v1", "Namespace", None, "prod").unwrap();
        assert_eq!(
            fetched.pointer("/metadata/labels/tier"),
            Some(&json!("restricted"))
        );

        assert!(cache.get_resource("v1", "Namespace", None, "dev").is_err());
    }

    #[test]
    fn static_cache_round_trips_config_maps() {
        let cache = StaticCache::default();
        cache.insert_config_map(
            "default",
            "policy-config",
            json!({"data": {"allowed": "nginx,redis"}}),
        );

        let fetched = cache.get_config_map("default", "policy-config").unwrap();
        assert_eq!(fetched.pointer("/data/allowed"), Some(&json!("nginx,redis")));
    }
}
