use crate::backend::Backend;
use crate::claude::ClaudeBackend;
use crate::codex::CodexBackend;
use crate::gemini::GeminiBackend;
use crate::mock::MockBackend;
use foreman_core::{ForemanError, ForemanResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Per-backend configuration passed to a factory at construction time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendSettings {
    /// Path to the backend's CLI binary; the backend's default when absent.
    #[serde(default)]
    pub cli_path: Option<String>,
    /// Model identifier to request, if any.
    #[serde(default)]
    pub model: Option<String>,
    /// Extra CLI arguments appended verbatim.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl BackendSettings {
    /// Settings that select a specific model.
    pub fn for_model(model: impl Into<String>) -> Self {
        Self {
            cli_path: None,
            model: Some(model.into()),
            extra_args: Vec::new(),
        }
    }
}

type BackendFactory = Box<dyn Fn(&BackendSettings) -> Arc<dyn Backend> + Send + Sync>;

/// Maps backend names to constructors.
///
/// An explicit, injectable component: the orchestrator receives one by
/// handle, and tests register fakes under the names the scheduler resolves.
/// Registering a name twice replaces the earlier factory.
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl BackendRegistry {
    /// An empty registry with no backends.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry with the built-in backends: `claude`, `codex`, `gemini`,
    /// and `mock`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("claude", |settings| {
            Arc::new(ClaudeBackend::new(settings.clone()))
        });
        registry.register("codex", |settings| {
            Arc::new(CodexBackend::new(settings.clone()))
        });
        registry.register("gemini", |settings| {
            Arc::new(GeminiBackend::new(settings.clone()))
        });
        registry.register("mock", |_| Arc::new(MockBackend::new("mock")));
        registry
    }

    /// Register a factory under `name`, replacing any existing one.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&BackendSettings) -> Arc<dyn Backend> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    /// Construct the backend registered under `name`.
    pub fn create(
        &self,
        name: &str,
        settings: &BackendSettings,
    ) -> ForemanResult<Arc<dyn Backend>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| ForemanError::UnknownBackend(name.to_string()))?;
        Ok(factory(settings))
    }

    /// Registered backend names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_include_builtin_backends() {
        let registry = BackendRegistry::with_defaults();
        assert!(registry.contains("claude"));
        assert!(registry.contains("codex"));
        assert!(registry.contains("gemini"));
        assert!(registry.contains("mock"));
        assert_eq!(registry.list(), vec!["claude", "codex", "gemini", "mock"]);
    }

    #[test]
    fn unknown_backend_is_an_error() {
        let registry = BackendRegistry::with_defaults();
        assert!(matches!(
            registry.create("copilot", &BackendSettings::default()),
            Err(ForemanError::UnknownBackend(name)) if name == "copilot"
        ));
    }

    #[test]
    fn create_passes_settings_through() {
        let registry = BackendRegistry::with_defaults();
        let backend = registry
            .create("claude", &BackendSettings::for_model("sonnet"))
            .unwrap();
        assert_eq!(backend.name(), "claude");
    }

    #[test]
    fn register_replaces_existing_factory() {
        let mut registry = BackendRegistry::new();
        assert!(!registry.contains("mock"));

        registry.register("mock", |_| Arc::new(MockBackend::new("mock")));
        registry.register("mock", |_| {
            Arc::new(MockBackend::new("mock").with_result(crate::RunResult::ok("scripted")))
        });
        assert_eq!(registry.list(), vec!["mock"]);
    }
}
