//! Model invocation
//!
//! [`ModelInvoker`] sends one puzzle to one backend under a timeout and turns
//! whatever comes back into a [`TaskOutcome`]. It never returns an error:
//! every failure is classified into an [`ErrorKind`] on the outcome.
//!
//! Backends:
//! - [`OpenAiCompatBackend`]: `/chat/completions` endpoints
//! - [`AnthropicBackend`]: the messages API
//! - [`SimulatedBackend`]: deterministic, in-process

pub mod anthropic;
pub mod backend;
pub mod openai;
pub mod registry;
pub mod simulated;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cost::{usd_to_nanos, SharedCostMeter};
use crate::dataset::Puzzle;
use crate::state::{ErrorKind, ModelId, TaskKey, TaskOutcome};

pub use anthropic::AnthropicBackend;
pub use backend::{BackendError, BackendReply, BackendResult, ModelBackend, TokenUsage};
pub use openai::OpenAiCompatBackend;
pub use registry::{BackendEntry, BackendRegistry, DEFAULT_CALL_TIMEOUT};
pub use simulated::SimulatedBackend;

/// Error type for invoker setup
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("No backend registered for model '{0}'")]
    UnknownModel(ModelId),

    #[error("Backend for '{model}' failed setup: {source}")]
    Setup {
        model: ModelId,
        #[source]
        source: BackendError,
    },
}

/// Shared reference to the invoker
pub type SharedModelInvoker = Arc<ModelInvoker>;

/// Per-backend call counters, kept across runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendUsage {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub rate_limited: u64,
    /// Average latency of successful calls
    pub avg_latency_ms: u64,
    /// Cost in nanodollars
    pub cost_nanos: i64,
}

impl BackendUsage {
    /// Compute success rate (0.0 - 1.0)
    pub fn success_rate(&self) -> f64 {
        if self.calls == 0 {
            1.0
        } else {
            self.successes as f64 / self.calls as f64
        }
    }

    fn record_success(&mut self, latency_ms: u64) {
        self.avg_latency_ms =
            (self.avg_latency_ms * self.successes + latency_ms) / (self.successes + 1);
        self.successes += 1;
        self.calls += 1;
    }

    fn record_failure(&mut self, kind: ErrorKind) {
        self.failures += 1;
        self.calls += 1;
        match kind {
            ErrorKind::Timeout => self.timeouts += 1,
            ErrorKind::RateLimited => self.rate_limited += 1,
            _ => {}
        }
    }
}

/// Calls backends and scores their replies
pub struct ModelInvoker {
    registry: BackendRegistry,
    meter: SharedCostMeter,
    usage: Mutex<BTreeMap<ModelId, BackendUsage>>,
}

impl ModelInvoker {
    pub fn new(registry: BackendRegistry, meter: SharedCostMeter) -> Self {
        Self {
            registry,
            meter,
            usage: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn shared(self) -> SharedModelInvoker {
        Arc::new(self)
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn knows(&self, model: &ModelId) -> bool {
        self.registry.contains(model)
    }

    /// Run each backend's one-time setup
    pub async fn prepare(&self, models: &[ModelId]) -> Result<(), InvokeError> {
        for model in models {
            let entry = self
                .registry
                .get(model)
                .ok_or_else(|| InvokeError::UnknownModel(model.clone()))?;
            entry
                .backend
                .prepare()
                .await
                .map_err(|source| InvokeError::Setup {
                    model: model.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Make one call for a task and score the reply
    pub async fn invoke(&self, key: &TaskKey, puzzle: &Puzzle) -> TaskOutcome {
        let Some(entry) = self.registry.get(&key.model_id) else {
            return TaskOutcome::failed(
                ErrorKind::BackendError,
                format!("no backend registered for model '{}'", key.model_id),
                0,
                0.0,
            );
        };

        let started = Instant::now();
        let result = tokio::time::timeout(entry.timeout, entry.backend.solve(puzzle)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let outcome = match result {
            Err(_) => TaskOutcome::failed(
                ErrorKind::Timeout,
                format!("no reply within {}s", entry.timeout.as_secs_f64()),
                elapsed_ms,
                0.0,
            ),
            Ok(Err(e)) => {
                warn!(
                    task = %key,
                    provider = entry.backend.provider(),
                    error = %e,
                    "Backend call failed"
                );
                TaskOutcome::failed(e.kind(), e.to_string(), elapsed_ms, 0.0)
            }
            Ok(Ok(reply)) => self.score(key, puzzle, reply, elapsed_ms),
        };

        self.record_usage(&key.model_id, &outcome);
        debug!(
            task = %key,
            elapsed_ms,
            correct = outcome.correct,
            error_kind = ?outcome.error_kind,
            "Invocation finished"
        );
        outcome
    }

    fn score(
        &self,
        key: &TaskKey,
        puzzle: &Puzzle,
        reply: BackendReply,
        elapsed_ms: u64,
    ) -> TaskOutcome {
        let cost = reply
            .cost_usd
            .or_else(|| {
                reply.usage.map(|u| {
                    self.meter
                        .call_cost(&key.model_id, u.input_tokens, u.output_tokens)
                })
            })
            .unwrap_or_else(|| self.meter.prior_cost(&key.model_id));

        let verdict = match serde_json::to_string(&reply.answer) {
            Ok(v) => v,
            Err(e) => {
                return TaskOutcome::failed(
                    ErrorKind::InvalidResponse,
                    format!("unserializable answer: {e}"),
                    elapsed_ms,
                    cost,
                )
            }
        };

        let correct = puzzle.expected.is_some() && puzzle.is_correct(&reply.answer);
        let accuracy = if correct {
            1.0
        } else {
            reply
                .score
                .filter(|s| s.is_finite())
                .map_or(0.0, |s| s.clamp(0.0, 1.0))
        };

        TaskOutcome::answered(verdict, correct, accuracy, elapsed_ms, cost)
    }

    fn lock_usage(&self) -> MutexGuard<'_, BTreeMap<ModelId, BackendUsage>> {
        self.usage
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record_usage(&self, model: &ModelId, outcome: &TaskOutcome) {
        let mut usage = self.lock_usage();
        let entry = usage.entry(model.clone()).or_default();
        match outcome.error_kind {
            None => entry.record_success(outcome.duration_ms),
            Some(kind) => entry.record_failure(kind),
        }
        entry.cost_nanos += usd_to_nanos(outcome.cost);
    }

    /// Snapshot of per-backend counters
    pub fn usage(&self) -> BTreeMap<ModelId, BackendUsage> {
        self.lock_usage().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::CostMeter;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct FixedBackend {
        answer: serde_json::Value,
        delay: Duration,
    }

    #[async_trait]
    impl ModelBackend for FixedBackend {
        fn provider(&self) -> &'static str {
            "fixed"
        }

        async fn solve(&self, _puzzle: &Puzzle) -> BackendResult<BackendReply> {
            tokio::time::sleep(self.delay).await;
            Ok(BackendReply {
                cost_usd: Some(0.05),
                ..BackendReply::new(self.answer.clone())
            })
        }
    }

    struct FailingBackend(fn() -> BackendError);

    #[async_trait]
    impl ModelBackend for FailingBackend {
        fn provider(&self) -> &'static str {
            "failing"
        }

        async fn prepare(&self) -> BackendResult<()> {
            Err((self.0)())
        }

        async fn solve(&self, _puzzle: &Puzzle) -> BackendResult<BackendReply> {
            Err((self.0)())
        }
    }

    fn invoker(registry: BackendRegistry) -> ModelInvoker {
        ModelInvoker::new(registry, CostMeter::default().shared())
    }

    fn puzzle() -> Puzzle {
        Puzzle::new("p1", json!({"grid": [[0]]})).with_expected(json!([[1]]))
    }

    #[tokio::test]
    async fn test_correct_answer() {
        let registry = BackendRegistry::new().with_backend(
            "m1",
            Arc::new(FixedBackend {
                answer: json!([[1]]),
                delay: Duration::ZERO,
            }),
            Duration::from_secs(5),
        );
        let invoker = invoker(registry);

        let outcome = invoker.invoke(&TaskKey::new("p1", "m1"), &puzzle()).await;
        assert!(outcome.correct);
        assert_eq!(outcome.accuracy, 1.0);
        assert_eq!(outcome.verdict.as_deref(), Some("[[1]]"));
        assert_eq!(outcome.cost, 0.05);

        let usage = invoker.usage()[&ModelId::from("m1")];
        assert_eq!(usage.successes, 1);
        assert_eq!(usage.cost_nanos, 50_000_000);
    }

    #[tokio::test]
    async fn test_usage_survives_poisoned_lock() {
        let registry = BackendRegistry::new().with_backend(
            "m1",
            Arc::new(FixedBackend {
                answer: json!([[1]]),
                delay: Duration::ZERO,
            }),
            Duration::from_secs(5),
        );
        let invoker = invoker(registry);
        invoker.invoke(&TaskKey::new("p1", "m1"), &puzzle()).await;

        std::thread::scope(|s| {
            let poisoner = s.spawn(|| {
                let _guard = invoker.usage.lock().unwrap();
                panic!("poison the usage lock");
            });
            assert!(poisoner.join().is_err());
        });
        assert!(invoker.usage.is_poisoned());

        invoker.invoke(&TaskKey::new("p1", "m1"), &puzzle()).await;
        let usage = invoker.usage()[&ModelId::from("m1")];
        assert_eq!(usage.calls, 2);
        assert_eq!(usage.successes, 2);
    }

    #[tokio::test]
    async fn test_wrong_answer_is_completed_not_failed() {
        let registry = BackendRegistry::new().with_backend(
            "m1",
            Arc::new(FixedBackend {
                answer: json!([[9]]),
                delay: Duration::ZERO,
            }),
            Duration::from_secs(5),
        );
        let outcome = invoker(registry)
            .invoke(&TaskKey::new("p1", "m1"), &puzzle())
            .await;
        assert!(!outcome.correct);
        assert!(!outcome.is_failure());
        assert_eq!(outcome.accuracy, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let registry = BackendRegistry::new().with_backend(
            "slow",
            Arc::new(FixedBackend {
                answer: json!(1),
                delay: Duration::from_secs(60),
            }),
            Duration::from_secs(2),
        );
        let invoker = invoker(registry);
        let outcome = invoker.invoke(&TaskKey::new("p1", "slow"), &puzzle()).await;
        assert_eq!(outcome.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(outcome.cost, 0.0);
        assert_eq!(invoker.usage()[&ModelId::from("slow")].timeouts, 1);
    }

    #[tokio::test]
    async fn test_backend_errors_are_classified() {
        let registry = BackendRegistry::new()
            .with_backend(
                "limited",
                Arc::new(FailingBackend(|| BackendError::RateLimited("429".into()))),
                Duration::from_secs(5),
            )
            .with_backend(
                "garbled",
                Arc::new(FailingBackend(|| BackendError::InvalidResponse("??".into()))),
                Duration::from_secs(5),
            );
        let invoker = invoker(registry);

        let limited = invoker
            .invoke(&TaskKey::new("p1", "limited"), &puzzle())
            .await;
        assert_eq!(limited.error_kind, Some(ErrorKind::RateLimited));

        let garbled = invoker
            .invoke(&TaskKey::new("p1", "garbled"), &puzzle())
            .await;
        assert_eq!(garbled.error_kind, Some(ErrorKind::InvalidResponse));
    }

    #[tokio::test]
    async fn test_unknown_model() {
        let invoker = invoker(BackendRegistry::new());
        let outcome = invoker.invoke(&TaskKey::new("p1", "ghost"), &puzzle()).await;
        assert_eq!(outcome.error_kind, Some(ErrorKind::BackendError));

        assert!(matches!(
            invoker.prepare(&[ModelId::from("ghost")]).await,
            Err(InvokeError::UnknownModel(_))
        ));
    }

    #[tokio::test]
    async fn test_prepare_failure() {
        let registry = BackendRegistry::new().with_backend(
            "broken",
            Arc::new(FailingBackend(|| BackendError::Setup("no key".into()))),
            Duration::from_secs(5),
        );
        let err = invoker(registry)
            .prepare(&[ModelId::from("broken")])
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Setup { .. }));
    }

    #[tokio::test]
    async fn test_unscored_puzzle_uses_backend_score() {
        struct Scored;

        #[async_trait]
        impl ModelBackend for Scored {
            fn provider(&self) -> &'static str {
                "scored"
            }

            async fn solve(&self, _puzzle: &Puzzle) -> BackendResult<BackendReply> {
                Ok(BackendReply {
                    score: Some(0.7),
                    usage: Some(TokenUsage {
                        input_tokens: 1_000,
                        output_tokens: 1_000,
                    }),
                    ..BackendReply::new(json!("x"))
                })
            }
        }

        let registry =
            BackendRegistry::new().with_backend("gpt-4o-mini", Arc::new(Scored), Duration::from_secs(5));
        let outcome = invoker(registry)
            .invoke(
                &TaskKey::new("p1", "gpt-4o-mini"),
                &Puzzle::new("p1", json!({})),
            )
            .await;
        assert!(!outcome.correct);
        assert_eq!(outcome.accuracy, 0.7);
        // 1000 * 150 + 1000 * 600 nanodollars
        assert!((outcome.cost - 0.00075).abs() < 1e-12);
    }
}
