//! Cost meter: pre-run estimates and idempotent per-task charging

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ModeProfile;
use crate::state::{CostLedger, ModelId, TaskKey};

use super::pricing::PricingTable;
use super::{nanos_to_usd, usd_to_nanos};

/// Shared reference to the cost meter
pub type SharedCostMeter = Arc<CostMeter>;

/// Estimated cost range for one model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEstimate {
    pub model_id: ModelId,
    pub low: f64,
    pub high: f64,
    pub seconds_per_task: f64,
}

/// Pre-run cost and duration estimate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub mode: String,
    pub puzzle_count: usize,
    pub task_count: usize,
    /// Worker slots the run would use
    pub concurrency: usize,
    pub low: f64,
    pub high: f64,
    /// Expected wall-clock seconds at that concurrency
    pub expected_seconds: f64,
    /// The upper bound is above the mode's cost ceiling
    pub exceeds_ceiling: bool,
    pub per_model: Vec<ModelEstimate>,
}

/// Prices tasks and maintains cost ledgers
#[derive(Debug, Clone, Default)]
pub struct CostMeter {
    pricing: PricingTable,
}

impl CostMeter {
    pub fn new(pricing: PricingTable) -> Self {
        Self { pricing }
    }

    pub fn shared(self) -> SharedCostMeter {
        Arc::new(self)
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    /// Estimate a run of `puzzle_count` puzzles over `models` in `mode`
    pub fn estimate(
        &self,
        mode: &ModeProfile,
        models: &[ModelId],
        puzzle_count: usize,
    ) -> CostEstimate {
        let task_count = puzzle_count * models.len();
        let concurrency = mode.concurrency.slots(models.len()).min(task_count.max(1));

        let mut low_nanos = 0i64;
        let mut high_nanos = 0i64;
        let mut task_seconds = 0.0;
        let mut per_model = Vec::with_capacity(models.len());

        for model in models {
            let pricing = self.pricing.get(model);
            let n = puzzle_count as i64;
            low_nanos += pricing.task_low_nanos * n;
            high_nanos += pricing.task_high_nanos * n;
            task_seconds += pricing.seconds_per_task * puzzle_count as f64;
            per_model.push(ModelEstimate {
                model_id: model.clone(),
                low: nanos_to_usd(pricing.task_low_nanos * n),
                high: nanos_to_usd(pricing.task_high_nanos * n),
                seconds_per_task: pricing.seconds_per_task,
            });
        }

        let high = nanos_to_usd(high_nanos);
        CostEstimate {
            mode: mode.name.clone(),
            puzzle_count,
            task_count,
            concurrency,
            low: nanos_to_usd(low_nanos),
            high,
            expected_seconds: task_seconds / concurrency as f64,
            exceeds_ceiling: mode.cost_ceiling.is_some_and(|ceiling| high > ceiling),
            per_model,
        }
    }

    /// USD cost of a call from its token usage
    pub fn call_cost(&self, model: &ModelId, input_tokens: u32, output_tokens: u32) -> f64 {
        nanos_to_usd(
            self.pricing
                .get(model)
                .calculate_cost(input_tokens, output_tokens),
        )
    }

    /// USD cost charged for a call that reported no usage
    pub fn prior_cost(&self, model: &ModelId) -> f64 {
        nanos_to_usd(self.pricing.get(model).expected_task_nanos())
    }

    /// Charge a task's cost to the ledger.
    ///
    /// Each task is charged at most once; returns false for a repeat.
    pub fn record_call(
        &self,
        ledger: &mut CostLedger,
        key: &TaskKey,
        elapsed_ms: u64,
        cost: f64,
    ) -> bool {
        if !ledger.charged.insert(key.clone()) {
            debug!(run_id = %ledger.run_id, task = %key, "Task already charged");
            return false;
        }

        let nanos = usd_to_nanos(cost);
        ledger.total_nanos += nanos;

        let entry = ledger.per_model.entry(key.model_id.clone()).or_default();
        entry.calls += 1;
        entry.cost_nanos += nanos;
        entry.elapsed_ms += elapsed_ms;
        true
    }

    /// Running total of a ledger in USD
    pub fn running_total(ledger: &CostLedger) -> f64 {
        ledger.total()
    }
}
