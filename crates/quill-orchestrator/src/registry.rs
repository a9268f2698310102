//! Capability registry for managing registered workers.
//!
//! This module provides functionality to register, retrieve, list, and unregister capabilities.

use quill_abstraction::Capability;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// A registered capability together with the step kinds it declares.
#[derive(Clone)]
pub struct CapabilityEntry {
    /// Registry name.
    pub name: String,
    /// The executable capability.
    pub capability: Arc<dyn Capability>,
    /// Declared capability tags (e.g. the step kinds it can perform).
    pub tags: Vec<String>,
}

impl fmt::Debug for CapabilityEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityEntry")
            .field("name", &self.name)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

/// Metadata about a registered capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityMetadata {
    /// Registry name.
    pub name: String,
    /// The capability's description.
    pub description: String,
    /// Declared capability tags.
    pub tags: Vec<String>,
}

/// Registry mapping worker names to executable capabilities.
pub struct CapabilityRegistry {
    /// Map of capability name to entry.
    entries: Arc<RwLock<HashMap<String, CapabilityEntry>>>,
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("capability_count", &self.entries.try_read().map(|e| e.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl CapabilityRegistry {
    /// Creates a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self { entries: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Registers a capability under `name`. The last registration for a name wins.
    ///
    /// # Arguments
    /// * `name` - Name steps refer to the capability by
    /// * `capability` - The executable capability
    /// * `tags` - Declared capability tags
    ///
    /// # Returns
    /// Returns `true` if the name was newly registered, `false` if it replaced an existing entry.
    pub async fn register(
        &self,
        name: impl Into<String>,
        capability: Arc<dyn Capability>,
        tags: Vec<String>,
    ) -> bool {
        let name = name.into();
        debug!(capability = %name, tags = ?tags, "Registering capability");

        let mut entries = self.entries.write().await;
        let was_new = !entries.contains_key(&name);
        entries.insert(name.clone(), CapabilityEntry { name: name.clone(), capability, tags });

        if !was_new {
            warn!(capability = %name, "Capability replaced in registry");
        }

        was_new
    }

    /// Retrieves a capability by name.
    pub async fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.entries.read().await.get(name).map(|e| Arc::clone(&e.capability))
    }

    /// Returns the declared tags of a capability.
    pub async fn tags(&self, name: &str) -> Option<Vec<String>> {
        self.entries.read().await.get(name).map(|e| e.tags.clone())
    }

    /// Returns whether `name` declares the tag `step_kind`.
    pub async fn supports(&self, name: &str, step_kind: &str) -> bool {
        self.entries
            .read()
            .await
            .get(name)
            .is_some_and(|e| e.tags.iter().any(|t| t == step_kind))
    }

    /// Lists all registered capabilities, sorted by name.
    pub async fn list(&self) -> Vec<CapabilityMetadata> {
        let entries = self.entries.read().await;
        let mut all: Vec<CapabilityMetadata> = entries
            .values()
            .map(|e| CapabilityMetadata {
                name: e.name.clone(),
                description: e.capability.description().to_string(),
                tags: e.tags.clone(),
            })
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Unregisters a capability.
    ///
    /// # Returns
    /// Returns `true` if the capability was found and removed, `false` otherwise.
    pub async fn unregister(&self, name: &str) -> bool {
        let removed = self.entries.write().await.remove(name).is_some();
        if !removed {
            warn!(capability = %name, "Attempted to unregister non-existent capability");
        }
        removed
    }

    /// Checks if a capability is registered.
    pub async fn is_registered(&self, name: &str) -> bool {
        self.entries.read().await.contains_key(name)
    }

    /// Returns the number of registered capabilities.
    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use quill_abstraction::{CapabilityError, Parameters};
    use serde_json::{Value, json};

    struct Fixed {
        description: &'static str,
        value: Value,
    }

    #[async_trait]
    impl Capability for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        fn description(&self) -> &str {
            self.description
        }

        async fn execute(&self, _step_id: &str, _params: &Parameters) -> Result<Value, CapabilityError> {
            Ok(self.value.clone())
        }
    }

    fn fixed(description: &'static str, value: Value) -> Arc<dyn Capability> {
        Arc::new(Fixed { description, value })
    }

    #[tokio::test]
    async fn test_register_capability() {
        let registry = CapabilityRegistry::new();
        let was_new =
            registry.register("tag_selector", fixed("tags", json!(1)), vec!["tag_selection".into()]).await;
        assert!(was_new);
        assert_eq!(registry.count().await, 1);
        assert!(registry.is_registered("tag_selector").await);
    }

    #[tokio::test]
    async fn test_register_last_wins() {
        let registry = CapabilityRegistry::new();
        assert!(registry.register("writer", fixed("v1", json!(1)), vec!["a".into()]).await);
        assert!(!registry.register("writer", fixed("v2", json!(2)), vec!["b".into()]).await);
        assert_eq!(registry.count().await, 1);

        let cap = registry.get("writer").await.unwrap();
        assert_eq!(cap.execute("s", &Parameters::new()).await.unwrap(), json!(2));
        assert_eq!(registry.tags("writer").await, Some(vec!["b".to_string()]));
    }

    #[tokio::test]
    async fn test_get_nonexistent_capability() {
        let registry = CapabilityRegistry::new();
        assert!(registry.get("nonexistent").await.is_none());
        assert!(registry.tags("nonexistent").await.is_none());
    }

    #[tokio::test]
    async fn test_supports_tag() {
        let registry = CapabilityRegistry::new();
        registry
            .register(
                "quality_assessor",
                fixed("qa", json!(0)),
                vec!["quality_assessment".into(), "quality_check".into()],
            )
            .await;
        assert!(registry.supports("quality_assessor", "quality_check").await);
        assert!(!registry.supports("quality_assessor", "chapter_writing").await);
        assert!(!registry.supports("missing", "quality_check").await);
    }

    #[tokio::test]
    async fn test_list_and_unregister() {
        let registry = CapabilityRegistry::new();
        registry.register("b", fixed("second", json!(0)), vec![]).await;
        registry.register("a", fixed("first", json!(0)), vec![]).await;

        let listed = registry.list().await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].name, "a");
        assert_eq!(listed[0].description, "first");

        assert!(registry.unregister("a").await);
        assert!(!registry.unregister("a").await);
        assert_eq!(registry.count().await, 1);
    }
}
