//! Model pricing priors.
//!
//! Per-token rates plus the per-task cost range and duration used for
//! pre-run estimates. Costs are in nanodollars (1e-9 USD) per token.

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::config::{OrchestratorConfig, PricingOverride};
use crate::state::ModelId;

use super::usd_to_nanos;

/// Token profile of a cheap task (short reply)
const LOW_INPUT_TOKENS: i64 = 2_000;
const LOW_OUTPUT_TOKENS: i64 = 500;

/// Token profile of an expensive task (long reasoning reply)
const HIGH_INPUT_TOKENS: i64 = 8_000;
const HIGH_OUTPUT_TOKENS: i64 = 8_000;

/// Pricing information for a model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    /// Cost per input token in nanodollars.
    pub input_nanos_per_token: i64,
    /// Cost per output token in nanodollars.
    pub output_nanos_per_token: i64,
    /// Lower bound of one task's cost in nanodollars.
    pub task_low_nanos: i64,
    /// Upper bound of one task's cost in nanodollars.
    pub task_high_nanos: i64,
    /// Typical wall-clock seconds for one task.
    pub seconds_per_task: f64,
}

impl ModelPricing {
    const fn new(input: i64, output: i64, seconds_per_task: f64) -> Self {
        Self {
            input_nanos_per_token: input,
            output_nanos_per_token: output,
            task_low_nanos: LOW_INPUT_TOKENS * input + LOW_OUTPUT_TOKENS * output,
            task_high_nanos: HIGH_INPUT_TOKENS * input + HIGH_OUTPUT_TOKENS * output,
            seconds_per_task,
        }
    }

    /// Calculate cost for a request.
    pub fn calculate_cost(&self, input_tokens: u32, output_tokens: u32) -> i64 {
        (input_tokens as i64) * self.input_nanos_per_token
            + (output_tokens as i64) * self.output_nanos_per_token
    }

    /// Midpoint of the task cost range, charged when a reply carries no usage
    pub fn expected_task_nanos(&self) -> i64 {
        (self.task_low_nanos + self.task_high_nanos) / 2
    }

    /// Apply configured overrides (USD amounts)
    pub fn with_override(mut self, o: &PricingOverride) -> Self {
        if let Some(usd) = o.input_usd_per_mtok {
            self.input_nanos_per_token = usd_to_nanos(usd) / 1_000_000;
        }
        if let Some(usd) = o.output_usd_per_mtok {
            self.output_nanos_per_token = usd_to_nanos(usd) / 1_000_000;
        }
        if o.input_usd_per_mtok.is_some() || o.output_usd_per_mtok.is_some() {
            let rescaled = Self::new(
                self.input_nanos_per_token,
                self.output_nanos_per_token,
                self.seconds_per_task,
            );
            self.task_low_nanos = rescaled.task_low_nanos;
            self.task_high_nanos = rescaled.task_high_nanos;
        }
        if let Some(usd) = o.task_cost_low {
            self.task_low_nanos = usd_to_nanos(usd);
        }
        if let Some(usd) = o.task_cost_high {
            self.task_high_nanos = usd_to_nanos(usd);
        }
        if self.task_high_nanos < self.task_low_nanos {
            self.task_high_nanos = self.task_low_nanos;
        }
        if let Some(seconds) = o.seconds_per_task {
            if seconds.is_finite() && seconds >= 0.0 {
                self.seconds_per_task = seconds;
            }
        }
        self
    }
}

// =============================================================================
// PRICING DATA
// =============================================================================

// OpenAI
// GPT-4o: $2.50/1M input, $10.00/1M output
// GPT-4o-mini: $0.15/1M input, $0.60/1M output
// GPT-5: $1.25/1M input, $10.00/1M output
// GPT-5-mini: $0.25/1M input, $2.00/1M output
// o3: $2.00/1M input, $8.00/1M output
// o4-mini: $1.10/1M input, $4.40/1M output
const GPT_4O: ModelPricing = ModelPricing::new(2_500, 10_000, 20.0);
const GPT_4O_MINI: ModelPricing = ModelPricing::new(150, 600, 10.0);
const GPT_5: ModelPricing = ModelPricing::new(1_250, 10_000, 90.0);
const GPT_5_MINI: ModelPricing = ModelPricing::new(250, 2_000, 45.0);
const O3: ModelPricing = ModelPricing::new(2_000, 8_000, 120.0);
const O4_MINI: ModelPricing = ModelPricing::new(1_100, 4_400, 60.0);

// Anthropic
// Claude Sonnet 4.5: $3.00/1M input, $15.00/1M output
// Claude Opus 4.1: $15.00/1M input, $75.00/1M output
// Claude 3.5 Haiku: $0.80/1M input, $4.00/1M output
const CLAUDE_SONNET_4_5: ModelPricing = ModelPricing::new(3_000, 15_000, 40.0);
const CLAUDE_OPUS_4_1: ModelPricing = ModelPricing::new(15_000, 75_000, 60.0);
const CLAUDE_35_HAIKU: ModelPricing = ModelPricing::new(800, 4_000, 10.0);

// Others (OpenAI-compatible endpoints)
// Grok 4: $3.00/1M input, $15.00/1M output
// DeepSeek V3 chat: $0.27/1M input, $1.10/1M output
// DeepSeek R1: $0.55/1M input, $2.19/1M output
// Gemini 2.5 Pro: $1.25/1M input, $10.00/1M output
// Kimi K2: $0.39/1M input, $1.90/1M output
const GROK_4: ModelPricing = ModelPricing::new(3_000, 15_000, 90.0);
const DEEPSEEK_CHAT: ModelPricing = ModelPricing::new(270, 1_100, 30.0);
const DEEPSEEK_REASONER: ModelPricing = ModelPricing::new(550, 2_190, 150.0);
const GEMINI_25_PRO: ModelPricing = ModelPricing::new(1_250, 10_000, 60.0);
const KIMI_K2: ModelPricing = ModelPricing::new(390, 1_900, 30.0);

/// Fallback for unknown models: priced like a frontier model
pub const DEFAULT_PRICING: ModelPricing = ModelPricing::new(3_000, 15_000, 60.0);

static PRICING_MAP: OnceLock<HashMap<&'static str, ModelPricing>> = OnceLock::new();

fn init_pricing() -> HashMap<&'static str, ModelPricing> {
    let mut map = HashMap::new();

    map.insert("gpt-4o", GPT_4O);
    map.insert("gpt-4o-mini", GPT_4O_MINI);
    map.insert("gpt-5", GPT_5);
    map.insert("gpt-5-mini", GPT_5_MINI);
    map.insert("o3", O3);
    map.insert("o4-mini", O4_MINI);

    map.insert("claude-sonnet-4-5", CLAUDE_SONNET_4_5);
    map.insert("claude-sonnet-4-5-20250929", CLAUDE_SONNET_4_5);
    map.insert("claude-opus-4-1", CLAUDE_OPUS_4_1);
    map.insert("claude-opus-4-1-20250805", CLAUDE_OPUS_4_1);
    map.insert("claude-3-5-haiku", CLAUDE_35_HAIKU);
    map.insert("claude-3-5-haiku-20241022", CLAUDE_35_HAIKU);

    map.insert("grok-4", GROK_4);
    map.insert("deepseek-chat", DEEPSEEK_CHAT);
    map.insert("deepseek-reasoner", DEEPSEEK_REASONER);
    map.insert("gemini-2.5-pro", GEMINI_25_PRO);
    map.insert("kimi-k2", KIMI_K2);

    map
}

/// Get built-in pricing for a model.
///
/// Router-style ids (`openai/gpt-4o-mini`) fall back to the part after the slash.
pub fn get_pricing(model_id: &str) -> Option<ModelPricing> {
    let map = PRICING_MAP.get_or_init(init_pricing);
    map.get(model_id).copied().or_else(|| {
        let (_, bare) = model_id.rsplit_once('/')?;
        map.get(bare).copied()
    })
}

/// Pricing lookups with per-model overrides layered over the built-in table
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    overrides: HashMap<ModelId, ModelPricing>,
}

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect overrides from model config entries
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        let mut table = Self::new();
        for (id, model) in &config.models {
            let upstream = model.upstream_model.as_deref().unwrap_or(id.as_str());
            let base = get_pricing(upstream)
                .or_else(|| get_pricing(id.as_str()))
                .unwrap_or(DEFAULT_PRICING);
            if let Some(o) = &model.pricing {
                table.insert(id.clone(), base.with_override(o));
            } else if upstream != id.as_str() {
                table.insert(id.clone(), base);
            }
        }
        table
    }

    pub fn insert(&mut self, model: ModelId, pricing: ModelPricing) {
        self.overrides.insert(model, pricing);
    }

    pub fn with(mut self, model: impl Into<ModelId>, pricing: ModelPricing) -> Self {
        self.insert(model.into(), pricing);
        self
    }

    /// Pricing for a model, falling back to the default prior
    pub fn get(&self, model: &ModelId) -> ModelPricing {
        self.overrides
            .get(model)
            .copied()
            .or_else(|| get_pricing(model.as_str()))
            .unwrap_or(DEFAULT_PRICING)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelConfig, SimulatedConfig};

    #[test]
    fn test_known_models() {
        let mini = get_pricing("gpt-4o-mini").unwrap();
        assert_eq!(mini.input_nanos_per_token, 150);
        assert_eq!(mini.calculate_cost(1_000, 1_000), 750_000);
        assert!(mini.task_low_nanos < mini.task_high_nanos);

        assert_eq!(get_pricing("openai/gpt-4o-mini"), Some(mini));
        assert!(get_pricing("unknown-model").is_none());
    }

    #[test]
    fn test_table_falls_back_to_default() {
        let table = PricingTable::new();
        assert_eq!(table.get(&ModelId::from("mystery")), DEFAULT_PRICING);
    }

    #[test]
    fn test_override_applies() {
        let override_ = PricingOverride {
            input_usd_per_mtok: Some(1.0),
            output_usd_per_mtok: Some(2.0),
            task_cost_high: Some(0.25),
            seconds_per_task: Some(5.0),
            ..PricingOverride::default()
        };
        let mut model = ModelConfig::simulated(SimulatedConfig::default());
        model.pricing = Some(override_);
        let config = OrchestratorConfig::default().with_model("local", model);

        let table = PricingTable::from_config(&config);
        let pricing = table.get(&ModelId::from("local"));
        assert_eq!(pricing.input_nanos_per_token, 1_000);
        assert_eq!(pricing.output_nanos_per_token, 2_000);
        assert_eq!(pricing.task_low_nanos, 2_000 * 1_000 + 500 * 2_000);
        assert_eq!(pricing.task_high_nanos, 250_000_000);
        assert_eq!(pricing.seconds_per_task, 5.0);
    }
}
