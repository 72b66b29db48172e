//! Worker loop
//!
//! Each worker repeatedly takes a task from its run's queue, calls the
//! model's backend (retrying timeouts and rate limits) and reports the
//! combined outcome back to the state machine.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::ModeProfile;
use crate::dataset::Puzzle;
use crate::invoker::SharedModelInvoker;
use crate::state::{ErrorKind, PuzzleId, TaskKey, TaskOutcome};

use super::machine::RunStateMachine;

/// Everything a run's workers share
pub struct WorkerContext {
    pub machine: Arc<RunStateMachine>,
    pub invoker: SharedModelInvoker,
    pub puzzles: HashMap<PuzzleId, Puzzle>,
    /// Retry limits and backoff
    pub mode: ModeProfile,
}

/// Process tasks until the queue is drained or closed.
///
/// Returns the number of tasks this worker reported.
pub async fn run_worker(worker_id: usize, ctx: Arc<WorkerContext>) -> usize {
    let machine = &ctx.machine;
    let mut processed = 0;

    while let Some(key) = machine.queue().acquire().await {
        if machine.claim(&key).is_none() {
            continue;
        }

        let outcome = match ctx.puzzles.get(&key.puzzle_id) {
            Some(puzzle) => attempt(&ctx, &key, puzzle).await,
            None => TaskOutcome {
                attempts: 0,
                ..TaskOutcome::failed(
                    ErrorKind::BackendError,
                    format!("puzzle '{}' missing from dataset", key.puzzle_id),
                    0,
                    0.0,
                )
            },
        };

        debug!(
            run_id = machine.run_id(),
            worker_id,
            task = %key,
            attempts = outcome.attempts,
            "Task attempted"
        );
        machine.complete(&key, outcome);
        processed += 1;
    }

    debug!(run_id = machine.run_id(), worker_id, processed, "Worker exiting");
    processed
}

/// Call the backend, retrying retriable failures.
///
/// Attempts, duration and cost accumulate across retries. Cancel stops
/// retrying and keeps the last failure; a pause only delays the next attempt.
async fn attempt(ctx: &WorkerContext, key: &TaskKey, puzzle: &Puzzle) -> TaskOutcome {
    let mut attempts = 0;
    let mut duration_ms = 0;
    let mut cost = 0.0;

    let mut outcome = loop {
        let outcome = ctx.invoker.invoke(key, puzzle).await;
        attempts += 1;
        duration_ms += outcome.duration_ms;
        cost += outcome.cost;

        let retriable = outcome.error_kind.is_some_and(ErrorKind::is_retriable);
        let retries_used = attempts - 1;
        if !retriable || retries_used >= ctx.mode.max_retries || ctx.machine.is_cancelled() {
            break outcome;
        }

        let delay = ctx.mode.backoff(retries_used + 1);
        warn!(
            run_id = ctx.machine.run_id(),
            task = %key,
            attempt = attempts,
            error_kind = ?outcome.error_kind,
            delay_ms = delay.as_millis() as u64,
            "Retrying task"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = ctx.machine.cancelled() => break outcome,
        }

        // Paused during backoff: the task stays in flight until resume
        if !ctx.machine.wait_until_running().await {
            break outcome;
        }
    };

    outcome.attempts = attempts;
    outcome.duration_ms = duration_ms;
    outcome.cost = cost;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::{CostMeter, PricingTable};
    use crate::events::EventBus;
    use crate::invoker::{
        BackendError, BackendRegistry, BackendReply, BackendResult, ModelBackend, ModelInvoker,
    };
    use crate::state::{ModelId, Run, RunStatus, Task, TaskStatus};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Rate-limited for the first `failures` calls, then answers correctly
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ModelBackend for Flaky {
        fn provider(&self) -> &'static str {
            "flaky"
        }

        async fn solve(&self, puzzle: &Puzzle) -> BackendResult<BackendReply> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(BackendError::RateLimited("slow down".into()));
            }
            let mut reply = BackendReply::new(puzzle.expected.clone().unwrap_or(json!(null)));
            reply.cost_usd = Some(0.01);
            Ok(reply)
        }
    }

    fn context(failures: u32, mode: ModeProfile) -> (Arc<WorkerContext>, Arc<Flaky>) {
        let backend = Arc::new(Flaky {
            failures,
            calls: AtomicU32::new(0),
        });
        let meter = CostMeter::new(PricingTable::new()).shared();
        let registry = BackendRegistry::new().with_backend(
            "m1",
            backend.clone(),
            Duration::from_secs(5),
        );
        let invoker = ModelInvoker::new(registry, meter.clone()).shared();

        let mut run = Run::new("d1".into(), vec![ModelId::from("m1")], mode.name.clone(), 1);
        let tasks = vec![Task::new(run.id.clone(), TaskKey::new("p1", "m1"))];
        run.counters.total = 1;
        let machine =
            RunStateMachine::new(run, tasks, &mode, EventBus::new().shared(), meter).unwrap();
        machine.start();

        let puzzle = Puzzle::new("p1", json!({"q": 1})).with_expected(json!(42));
        let ctx = WorkerContext {
            machine: Arc::new(machine),
            invoker,
            puzzles: HashMap::from([("p1".to_string(), puzzle)]),
            mode,
        };
        (Arc::new(ctx), backend)
    }

    fn mode(max_retries: u32) -> ModeProfile {
        let mut mode = ModeProfile::testing();
        mode.max_retries = max_retries;
        mode.retry_backoff_ms = 100;
        mode.cost_ceiling = None;
        mode
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let (ctx, backend) = context(2, mode(2));
        assert_eq!(run_worker(0, ctx.clone()).await, 1);

        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        let task = ctx.machine.task(&TaskKey::new("p1", "m1")).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        let outcome = task.outcome.unwrap();
        assert!(outcome.correct);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(ctx.machine.status(), RunStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let (ctx, backend) = context(5, mode(1));
        run_worker(0, ctx.clone()).await;

        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        let outcome = ctx
            .machine
            .task(&TaskKey::new("p1", "m1"))
            .unwrap()
            .outcome
            .unwrap();
        assert_eq!(outcome.error_kind, Some(ErrorKind::RateLimited));
        assert_eq!(outcome.attempts, 2);
        // Failed calls are charged nothing
        assert_eq!(outcome.cost, 0.0);
        assert_eq!(ctx.machine.run().counters.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_stops_retrying() {
        let mut slow = mode(3);
        slow.retry_backoff_ms = 60_000;
        let (ctx, backend) = context(10, slow);

        let handle = tokio::spawn(run_worker(0, ctx.clone()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        ctx.machine.cancel();
        handle.await.unwrap();

        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.machine.status(), RunStatus::Cancelled);
        let task = ctx.machine.task(&TaskKey::new("p1", "m1")).unwrap();
        assert_eq!(
            task.outcome.unwrap().error_kind,
            Some(ErrorKind::Cancelled)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_during_backoff_keeps_task_in_flight() {
        let mut slow = mode(3);
        slow.retry_backoff_ms = 10_000;
        let (ctx, backend) = context(1, slow);
        let key = TaskKey::new("p1", "m1");

        let handle = tokio::spawn(run_worker(0, ctx.clone()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ctx.machine.pause(), RunStatus::Paused);

        // Backoff elapses while paused: no new call, task still open
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.machine.task(&key).unwrap().status, TaskStatus::Running);
        assert!(!handle.is_finished());

        assert_eq!(ctx.machine.resume(), RunStatus::Running);
        assert_eq!(handle.await.unwrap(), 1);

        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        let task = ctx.machine.task(&key).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.outcome.unwrap().attempts, 2);
        assert_eq!(ctx.machine.status(), RunStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_paused_in_backoff() {
        let mut slow = mode(3);
        slow.retry_backoff_ms = 1_000;
        let (ctx, backend) = context(1, slow);

        let handle = tokio::spawn(run_worker(0, ctx.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        ctx.machine.pause();
        tokio::time::sleep(Duration::from_secs(5)).await;
        ctx.machine.cancel();
        handle.await.unwrap();

        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        let task = ctx.machine.task(&TaskKey::new("p1", "m1")).unwrap();
        assert_eq!(task.outcome.unwrap().error_kind, Some(ErrorKind::Cancelled));
    }

    #[tokio::test]
    async fn test_worker_exits_on_closed_queue() {
        let (ctx, backend) = context(0, mode(0));
        ctx.machine.cancel();
        assert_eq!(run_worker(0, ctx).await, 0);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }
}
