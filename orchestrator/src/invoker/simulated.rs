//! Deterministic in-process backend for dry runs and load tests

use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::config::SimulatedConfig;
use crate::dataset::Puzzle;
use crate::state::ModelId;

use super::backend::{BackendError, BackendReply, BackendResult, ModelBackend};

/// Answers correctly with a fixed probability. The same (seed, model, puzzle)
/// always draws the same result.
pub struct SimulatedBackend {
    model: ModelId,
    config: SimulatedConfig,
}

impl SimulatedBackend {
    pub fn new(model: ModelId, config: SimulatedConfig) -> Self {
        Self { model, config }
    }

    /// Uniform draw in [0, 1) for this puzzle and purpose
    fn draw(&self, puzzle_id: &str, salt: &str) -> f64 {
        let mut hasher = DefaultHasher::new();
        self.config.seed.hash(&mut hasher);
        self.model.hash(&mut hasher);
        puzzle_id.hash(&mut hasher);
        salt.hash(&mut hasher);
        (hasher.finish() >> 11) as f64 / (1u64 << 53) as f64
    }
}

#[async_trait]
impl ModelBackend for SimulatedBackend {
    fn provider(&self) -> &'static str {
        "simulated"
    }

    async fn solve(&self, puzzle: &Puzzle) -> BackendResult<BackendReply> {
        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }

        if self.draw(&puzzle.id, "failure") < self.config.failure_rate {
            return Err(BackendError::Transport("simulated connection reset".to_string()));
        }

        let correct = self.draw(&puzzle.id, "answer") < self.config.accuracy;
        let answer = match (&puzzle.expected, correct) {
            (Some(expected), true) => expected.clone(),
            _ => json!({ "guess": self.model.as_str(), "puzzle": puzzle.id }),
        };

        Ok(BackendReply {
            answer,
            score: None,
            usage: None,
            cost_usd: Some(self.config.cost_per_call),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(accuracy: f64, failure_rate: f64) -> SimulatedBackend {
        SimulatedBackend::new(
            ModelId::from("sim"),
            SimulatedConfig {
                accuracy,
                latency_ms: 0,
                cost_per_call: 0.02,
                failure_rate,
                seed: 1,
            },
        )
    }

    #[tokio::test]
    async fn test_perfect_accuracy_returns_expected() {
        let puzzle = Puzzle::new("p1", json!({})).with_expected(json!([[3]]));
        let reply = backend(1.0, 0.0).solve(&puzzle).await.unwrap();
        assert_eq!(reply.answer, json!([[3]]));
        assert_eq!(reply.cost_usd, Some(0.02));
    }

    #[tokio::test]
    async fn test_zero_accuracy_never_matches() {
        let puzzle = Puzzle::new("p1", json!({})).with_expected(json!([[3]]));
        let reply = backend(0.0, 0.0).solve(&puzzle).await.unwrap();
        assert!(!puzzle.is_correct(&reply.answer));
    }

    #[tokio::test]
    async fn test_draws_are_deterministic() {
        let b = backend(0.5, 0.0);
        let puzzle = Puzzle::new("p7", json!({})).with_expected(json!(1));
        let first = b.solve(&puzzle).await.unwrap();
        let second = b.solve(&puzzle).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_always_failing() {
        let puzzle = Puzzle::new("p1", json!({}));
        let err = backend(1.0, 1.0).solve(&puzzle).await.unwrap_err();
        assert!(matches!(err, BackendError::Transport(_)));
    }
}
