//! Backend registry: model id -> backend and call timeout

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{ConfigError, ConfigResult, OrchestratorConfig, ProviderKind};
use crate::state::ModelId;

use super::anthropic::AnthropicBackend;
use super::backend::ModelBackend;
use super::openai::OpenAiCompatBackend;
use super::simulated::SimulatedBackend;

/// Default per-call timeout for backends registered without one
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// A registered backend
#[derive(Clone)]
pub struct BackendEntry {
    pub backend: Arc<dyn ModelBackend>,
    pub timeout: Duration,
}

impl std::fmt::Debug for BackendEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendEntry")
            .field("provider", &self.backend.provider())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Registry of model backends
#[derive(Debug, Clone, Default)]
pub struct BackendRegistry {
    entries: BTreeMap<ModelId, BackendEntry>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every model declared in the config
    pub fn from_config(config: &OrchestratorConfig) -> ConfigResult<Self> {
        let mut registry = Self::new();
        for (id, model) in &config.models {
            let upstream = model
                .upstream_model
                .clone()
                .unwrap_or_else(|| id.to_string());
            let base_url = || {
                model
                    .base_url
                    .clone()
                    .ok_or_else(|| ConfigError::Invalid(format!("model '{}' needs a base_url", id)))
            };
            let to_config_error =
                |e: super::BackendError| ConfigError::Invalid(format!("model '{}': {}", id, e));

            let backend: Arc<dyn ModelBackend> = match model.provider {
                ProviderKind::OpenaiCompatible => Arc::new(
                    OpenAiCompatBackend::new(
                        base_url()?,
                        upstream,
                        model.api_key_env.clone(),
                        model.max_tokens,
                    )
                    .map_err(to_config_error)?,
                ),
                ProviderKind::Anthropic => Arc::new(
                    AnthropicBackend::new(
                        base_url()?,
                        upstream,
                        model.api_key_env.clone(),
                        model.max_tokens,
                    )
                    .map_err(to_config_error)?,
                ),
                ProviderKind::Simulated => Arc::new(SimulatedBackend::new(
                    id.clone(),
                    model.simulated.clone().unwrap_or_default(),
                )),
            };
            registry.register(id.clone(), backend, model.timeout());
        }
        Ok(registry)
    }

    pub fn register(
        &mut self,
        model: impl Into<ModelId>,
        backend: Arc<dyn ModelBackend>,
        timeout: Duration,
    ) {
        self.entries
            .insert(model.into(), BackendEntry { backend, timeout });
    }

    /// Builder form of [`register`](Self::register)
    pub fn with_backend(
        mut self,
        model: impl Into<ModelId>,
        backend: Arc<dyn ModelBackend>,
        timeout: Duration,
    ) -> Self {
        self.register(model, backend, timeout);
        self
    }

    pub fn get(&self, model: &ModelId) -> Option<&BackendEntry> {
        self.entries.get(model)
    }

    pub fn contains(&self, model: &ModelId) -> bool {
        self.entries.contains_key(model)
    }

    pub fn models(&self) -> impl Iterator<Item = &ModelId> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
