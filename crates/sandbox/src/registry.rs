//! Named sandbox registry.
//!
//! An explicit, constructed registry: callers create one and pass it to
//! whatever needs lookup. There is no process-wide instance.

use dashmap::DashMap;
use std::sync::Arc;

use agent_runner_core::Result;

use crate::Sandbox;

/// Name → sandbox map shared between tasks.
#[derive(Default)]
pub struct SandboxRegistry {
    sandboxes: DashMap<String, Arc<dyn Sandbox>>,
}

impl std::fmt::Debug for SandboxRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl SandboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sandbox, returning the one previously stored under `name`.
    pub fn register(
        &self,
        name: impl Into<String>,
        sandbox: Arc<dyn Sandbox>,
    ) -> Option<Arc<dyn Sandbox>> {
        let name = name.into();
        tracing::debug!(sandbox = %name, kind = sandbox.kind(), "Sandbox registered");
        self.sandboxes.insert(name, sandbox)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Sandbox>> {
        self.sandboxes.get(name).map(|entry| entry.value().clone())
    }

    /// Remove a sandbox without closing it.
    pub fn remove(&self, name: &str) -> Option<Arc<dyn Sandbox>> {
        self.sandboxes.remove(name).map(|(_, sandbox)| sandbox)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sandboxes.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.sandboxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sandboxes.is_empty()
    }

    /// Close and drop every registered sandbox.
    ///
    /// All sandboxes are closed even if some fail; the first error is returned.
    pub async fn close_all(&self) -> Result<()> {
        // Collect first so no map guard is held across an await.
        let drained: Vec<(String, Arc<dyn Sandbox>)> = self
            .names()
            .into_iter()
            .filter_map(|name| self.sandboxes.remove(&name))
            .collect();

        let mut first_error = None;
        for (name, sandbox) in drained {
            if let Err(e) = sandbox.close().await {
                tracing::warn!(sandbox = %name, error = %e, "Failed to close sandbox");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockSandbox;

    #[tokio::test]
    async fn test_register_get_remove() {
        let registry = SandboxRegistry::new();
        assert!(registry.is_empty());

        registry.register("b", Arc::new(MockSandbox::new()));
        registry.register("a", Arc::new(MockSandbox::new()));
        assert_eq!(registry.names(), vec!["a", "b"]);
        assert_eq!(registry.get("a").unwrap().kind(), "mock");
        assert!(registry.get("missing").is_none());

        assert!(registry.remove("a").is_some());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_register_replaces_existing() {
        let registry = SandboxRegistry::new();
        assert!(registry.register("x", Arc::new(MockSandbox::new())).is_none());
        assert!(registry.register("x", Arc::new(MockSandbox::new())).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_close_all_closes_and_clears() {
        let registry = SandboxRegistry::new();
        let first = Arc::new(MockSandbox::new());
        let second = Arc::new(MockSandbox::new());
        registry.register("first", first.clone());
        registry.register("second", second.clone());

        registry.close_all().await.unwrap();
        assert!(registry.is_empty());
        assert!(first.is_closed());
        assert!(second.is_closed());
    }
}
