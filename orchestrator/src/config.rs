//! Orchestrator configuration
//!
//! Loaded from a TOML file (path in `ENSEMBLE_CONFIG`) with built-in mode
//! profiles as defaults. `ENSEMBLE_DATASET_DIR` overrides the dataset root.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::state::ModelId;

/// Name of the built-in development profile
pub const MODE_TESTING: &str = "testing";

/// Name of the built-in full-scale profile
pub const MODE_PRODUCTION: &str = "production";

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

/// How many workers a run may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyCeiling {
    /// A fixed number of workers regardless of model count
    Fixed(usize),
    /// One worker per backend in the run's model set
    PerBackend,
}

impl ConcurrencyCeiling {
    /// Worker slots for a run over `model_count` backends
    pub fn slots(self, model_count: usize) -> usize {
        match self {
            ConcurrencyCeiling::Fixed(n) => n.max(1),
            ConcurrencyCeiling::PerBackend => model_count.max(1),
        }
    }
}

/// Execution profile selected per run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeProfile {
    /// Filled from the table key
    #[serde(skip)]
    pub name: String,
    pub concurrency: ConcurrencyCeiling,
    /// Running cost (USD) at which the run auto-pauses
    #[serde(default)]
    pub cost_ceiling: Option<f64>,
    /// Retries for timeout and rate-limit failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay between retries, doubled per attempt
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    500
}

impl ModeProfile {
    /// Small-scale development profile: fixed low concurrency and a cost ceiling
    pub fn testing() -> Self {
        Self {
            name: MODE_TESTING.to_string(),
            concurrency: ConcurrencyCeiling::Fixed(3),
            cost_ceiling: Some(1.0),
            max_retries: 2,
            retry_backoff_ms: 500,
        }
    }

    /// Full-scale profile: one worker per backend, no ceiling
    pub fn production() -> Self {
        Self {
            name: MODE_PRODUCTION.to_string(),
            concurrency: ConcurrencyCeiling::PerBackend,
            cost_ceiling: None,
            max_retries: 3,
            retry_backoff_ms: 1_000,
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(6);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }

    fn validate(&self) -> ConfigResult<()> {
        if let ConcurrencyCeiling::Fixed(0) = self.concurrency {
            return Err(ConfigError::Invalid(format!(
                "mode '{}' has a fixed concurrency of 0",
                self.name
            )));
        }
        if let Some(ceiling) = self.cost_ceiling {
            if ceiling.is_nan() || ceiling <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "mode '{}' has a non-positive cost ceiling",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Backend family a model is served by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Any `/chat/completions` endpoint (OpenAI, OpenRouter, xAI, DeepSeek, local servers)
    OpenaiCompatible,
    /// Anthropic messages API
    Anthropic,
    /// Deterministic in-process backend for dry runs
    Simulated,
}

/// Per-model pricing overrides (USD)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PricingOverride {
    pub input_usd_per_mtok: Option<f64>,
    pub output_usd_per_mtok: Option<f64>,
    pub task_cost_low: Option<f64>,
    pub task_cost_high: Option<f64>,
    pub seconds_per_task: Option<f64>,
}

/// Parameters of the simulated backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedConfig {
    /// Probability of returning the expected answer
    pub accuracy: f64,
    pub latency_ms: u64,
    pub cost_per_call: f64,
    /// Probability of a transport failure
    pub failure_rate: f64,
    pub seed: u64,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            accuracy: 0.5,
            latency_ms: 50,
            cost_per_call: 0.01,
            failure_rate: 0.0,
            seed: 7,
        }
    }
}

/// Backend configuration for one model id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: ProviderKind,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Model name sent upstream (defaults to the model id)
    #[serde(default)]
    pub upstream_model: Option<String>,
    /// Environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub pricing: Option<PricingOverride>,
    #[serde(default)]
    pub simulated: Option<SimulatedConfig>,
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_max_tokens() -> u32 {
    4_096
}

impl ModelConfig {
    pub fn simulated(config: SimulatedConfig) -> Self {
        Self {
            provider: ProviderKind::Simulated,
            base_url: None,
            upstream_model: None,
            api_key_env: None,
            timeout_secs: default_timeout_secs(),
            max_tokens: default_max_tokens(),
            pricing: None,
            simulated: Some(config),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub modes: BTreeMap<String, ModeProfile>,
    #[serde(default)]
    pub models: BTreeMap<ModelId, ModelConfig>,
    /// Root directory for dataset files
    #[serde(default)]
    pub dataset_dir: Option<PathBuf>,
    /// RocksDB archive location (used with the `heavy-state` feature)
    #[serde(default)]
    pub archive_path: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let mut config = Self {
            modes: BTreeMap::new(),
            models: BTreeMap::new(),
            dataset_dir: std::env::var("ENSEMBLE_DATASET_DIR").ok().map(PathBuf::from),
            archive_path: None,
        };
        config.fill_default_modes();
        config
    }
}

impl OrchestratorConfig {
    /// Parse a TOML document; built-in modes fill in any profile it omits
    pub fn from_toml_str(s: &str) -> ConfigResult<Self> {
        let mut config: OrchestratorConfig = toml::from_str(s)?;
        config.fill_default_modes();
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Load from `ENSEMBLE_CONFIG` if set, else defaults; then apply env overrides
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = match std::env::var("ENSEMBLE_CONFIG") {
            Ok(path) => Self::load(path)?,
            Err(_) => Self::default(),
        };
        if let Ok(dir) = std::env::var("ENSEMBLE_DATASET_DIR") {
            config.dataset_dir = Some(PathBuf::from(dir));
        }
        Ok(config)
    }

    pub fn mode(&self, name: &str) -> Option<&ModeProfile> {
        self.modes.get(name)
    }

    pub fn with_model(mut self, id: impl Into<ModelId>, model: ModelConfig) -> Self {
        self.models.insert(id.into(), model);
        self
    }

    pub fn with_mode(mut self, mut mode: ModeProfile, name: impl Into<String>) -> Self {
        let name = name.into();
        mode.name = name.clone();
        self.modes.insert(name, mode);
        self
    }

    fn fill_default_modes(&mut self) {
        for (name, mode) in self.modes.iter_mut() {
            mode.name = name.clone();
        }
        for default in [ModeProfile::testing(), ModeProfile::production()] {
            self.modes.entry(default.name.clone()).or_insert(default);
        }
    }

    fn validate(&self) -> ConfigResult<()> {
        for mode in self.modes.values() {
            mode.validate()?;
        }
        for (id, model) in &self.models {
            if model.timeout_secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "model '{}' has a zero call timeout",
                    id
                )));
            }
            if model.provider != ProviderKind::Simulated && model.base_url.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "model '{}' needs a base_url",
                    id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_modes() {
        let config = OrchestratorConfig::default();
        let testing = config.mode(MODE_TESTING).unwrap();
        assert_eq!(testing.concurrency, ConcurrencyCeiling::Fixed(3));
        assert_eq!(testing.concurrency.slots(5), 3);
        assert!(testing.cost_ceiling.is_some());

        let production = config.mode(MODE_PRODUCTION).unwrap();
        assert_eq!(production.concurrency.slots(4), 4);
        assert!(production.cost_ceiling.is_none());
    }

    #[test]
    fn test_parse_toml() {
        let text = r#"
            dataset_dir = "/data/puzzles"

            [modes.testing]
            concurrency = { fixed = 2 }
            cost_ceiling = 0.5

            [modes.overnight]
            concurrency = "per_backend"
            max_retries = 5

            [models."gpt-4o-mini"]
            provider = "openai_compatible"
            base_url = "https://api.openai.com/v1"
            api_key_env = "OPENAI_API_KEY"
            timeout_secs = 60

            [models."gpt-4o-mini".pricing]
            input_usd_per_mtok = 0.15
            output_usd_per_mtok = 0.6

            [models.sim]
            provider = "simulated"
            simulated = { accuracy = 0.9, seed = 42 }
        "#;

        let config = OrchestratorConfig::from_toml_str(text).unwrap();
        assert_eq!(config.dataset_dir, Some(PathBuf::from("/data/puzzles")));

        let testing = config.mode("testing").unwrap();
        assert_eq!(testing.concurrency, ConcurrencyCeiling::Fixed(2));
        assert_eq!(testing.cost_ceiling, Some(0.5));

        let overnight = config.mode("overnight").unwrap();
        assert_eq!(overnight.name, "overnight");
        assert_eq!(overnight.max_retries, 5);
        assert_eq!(overnight.retry_backoff_ms, 500);

        // Built-in production profile still present
        assert!(config.mode(MODE_PRODUCTION).is_some());

        let gpt = &config.models[&ModelId::from("gpt-4o-mini")];
        assert_eq!(gpt.provider, ProviderKind::OpenaiCompatible);
        assert_eq!(gpt.timeout(), Duration::from_secs(60));
        assert_eq!(gpt.pricing.unwrap().input_usd_per_mtok, Some(0.15));

        let sim = &config.models[&ModelId::from("sim")];
        let params = sim.simulated.as_ref().unwrap();
        assert_eq!(params.seed, 42);
        assert_eq!(params.latency_ms, 50);
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let text = r#"
            [modes.broken]
            concurrency = { fixed = 0 }
        "#;
        assert!(matches!(
            OrchestratorConfig::from_toml_str(text),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_rejects_remote_model_without_url() {
        let text = r#"
            [models.claude]
            provider = "anthropic"
        "#;
        assert!(OrchestratorConfig::from_toml_str(text).is_err());
    }

    #[test]
    fn test_backoff_doubles() {
        let mode = ModeProfile::testing();
        assert_eq!(mode.backoff(1), Duration::from_millis(500));
        assert_eq!(mode.backoff(2), Duration::from_millis(1_000));
        assert_eq!(mode.backoff(3), Duration::from_millis(2_000));
    }

    #[test]
    fn test_load_missing_file() {
        let err = OrchestratorConfig::load("/nonexistent/ensemble.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
