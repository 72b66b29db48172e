//! End-to-end runs against mocked HTTP providers.
//!
//! Models are declared in TOML the way a deployment would declare them, with
//! base URLs pointing at wiremock servers.

use std::sync::Arc;

use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use orchestrator::config::OrchestratorConfig;
use orchestrator::dataset::{InMemoryDatasets, Puzzle};
use orchestrator::ensemble::{LaunchRequest, RunCoordinator, TaskFilter};
use orchestrator::state::{ErrorKind, RunStatus, TaskStatus};

fn datasets() -> Arc<InMemoryDatasets> {
    Arc::new(InMemoryDatasets::new().with_dataset(
        "arc",
        vec![
            Puzzle::new("a1", json!({"grid": [[1, 0]]})).with_expected(json!([[0, 1]])),
            Puzzle::new("a2", json!({"grid": [[2, 0]]})).with_expected(json!([[0, 1]])),
        ],
    ))
}

async fn openai_server(content: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"content": content}}],
            "usage": {"prompt_tokens": 100, "completion_tokens": 20}
        })))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_mixed_providers_reach_consensus() {
    std::env::set_var("ORCH_E2E_ANTHROPIC_KEY", "ak-e2e");

    let openai = openai_server("```json\n{\"answer\": [[0, 1]]}\n```").await;
    let anthropic = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "ak-e2e"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [{"type": "text", "text": "The answer is {\"answer\": [[0, 1]]}"}],
            "usage": {"input_tokens": 100, "output_tokens": 20}
        })))
        .expect(2)
        .mount(&anthropic)
        .await;

    let text = format!(
        r#"
        [models.gpt-mock]
        provider = "openai_compatible"
        base_url = "{openai}"
        upstream_model = "gpt-4o-mini"

        [models.gpt-mock.pricing]
        input_usd_per_mtok = 1.0
        output_usd_per_mtok = 2.0

        [models.claude-mock]
        provider = "anthropic"
        base_url = "{anthropic}"
        api_key_env = "ORCH_E2E_ANTHROPIC_KEY"

        [models.claude-mock.pricing]
        input_usd_per_mtok = 1.0
        output_usd_per_mtok = 2.0
        "#,
        openai = openai.uri(),
        anthropic = anthropic.uri(),
    );
    let config = OrchestratorConfig::from_toml_str(&text).unwrap();
    let c = RunCoordinator::from_config(config, datasets()).unwrap();

    let run_id = c
        .launch(LaunchRequest::new("arc", ["gpt-mock", "claude-mock"], "testing"))
        .await
        .unwrap();
    let view = c.wait(&run_id).await.unwrap();

    assert_eq!(view.status, RunStatus::Completed);
    assert_eq!(view.completed, 4);
    assert_eq!(view.successful, 4);
    // 100 input tokens at $1/M plus 20 output tokens at $2/M, four calls
    assert!((view.running_cost - 4.0 * 0.00014).abs() < 1e-12);

    let consensus = c.consensus(&run_id).unwrap();
    assert_eq!(consensus.len(), 2);
    assert!(consensus
        .iter()
        .all(|r| r.verdict.as_deref() == Some("[[0,1]]") && r.correct && r.agreement == 1.0));

    let usage = c.backend_usage();
    assert_eq!(usage.len(), 2);
    assert!(usage.values().all(|u| u.calls == 2 && u.failures == 0));
}

#[tokio::test]
async fn test_rate_limits_are_retried_then_recorded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .expect(4)
        .mount(&server)
        .await;

    let text = format!(
        r#"
        [modes.testing]
        concurrency = {{ fixed = 1 }}
        max_retries = 1
        retry_backoff_ms = 5

        [models.limited]
        provider = "openai_compatible"
        base_url = "{}"
        "#,
        server.uri()
    );
    let config = OrchestratorConfig::from_toml_str(&text).unwrap();
    let c = RunCoordinator::from_config(config, datasets()).unwrap();

    let run_id = c
        .launch(LaunchRequest::new("arc", ["limited"], "testing"))
        .await
        .unwrap();
    let view = c.wait(&run_id).await.unwrap();

    // Backend failures never fail the run
    assert_eq!(view.status, RunStatus::Completed);
    assert_eq!(view.failed, 2);

    let tasks = c.list_tasks(&run_id, &TaskFilter::new()).unwrap();
    for task in &tasks {
        assert_eq!(task.status, TaskStatus::Failed);
        let outcome = task.outcome.as_ref().unwrap();
        assert_eq!(outcome.error_kind, Some(ErrorKind::RateLimited));
        assert_eq!(outcome.attempts, 2);
    }
    assert_eq!(c.running_total(&run_id).unwrap(), 0.0);
}

#[tokio::test]
async fn test_invalid_reply_is_a_task_failure() {
    let server = openai_server("I am not sure.").await;
    let text = format!(
        r#"
        [models.vague]
        provider = "openai_compatible"
        base_url = "{}"
        "#,
        server.uri()
    );
    let config = OrchestratorConfig::from_toml_str(&text).unwrap();
    let c = RunCoordinator::from_config(config, datasets()).unwrap();

    let run_id = c
        .launch(LaunchRequest::new("arc", ["vague"], "testing"))
        .await
        .unwrap();
    c.wait(&run_id).await.unwrap();

    let failed = c
        .list_tasks(&run_id, &TaskFilter::new().status(TaskStatus::Failed))
        .unwrap();
    assert_eq!(failed.len(), 2);
    assert!(failed.iter().all(|t| {
        t.outcome.as_ref().unwrap().error_kind == Some(ErrorKind::InvalidResponse)
    }));
}

#[tokio::test]
async fn test_missing_api_key_fails_setup() {
    std::env::remove_var("ORCH_E2E_UNSET_KEY");
    let server = openai_server("{\"answer\": 1}").await;
    let text = format!(
        r#"
        [models.locked]
        provider = "openai_compatible"
        base_url = "{}"
        api_key_env = "ORCH_E2E_UNSET_KEY"
        "#,
        server.uri()
    );
    let config = OrchestratorConfig::from_toml_str(&text).unwrap();
    let c = RunCoordinator::from_config(config, datasets()).unwrap();

    let run_id = c
        .launch(LaunchRequest::new("arc", ["locked"], "testing"))
        .await
        .unwrap();
    let view = c.wait(&run_id).await.unwrap();

    assert_eq!(view.status, RunStatus::Error);
    assert_eq!(view.failed, 2);
    let run = c.get_run(&run_id).unwrap();
    assert!(run.error.unwrap().contains("ORCH_E2E_UNSET_KEY"));
    assert!(server.received_requests().await.unwrap().is_empty());
}
