//! OpenAI-compatible `/chat/completions` backend
//!
//! Covers OpenAI itself and the many endpoints that mirror its API
//! (OpenRouter, xAI, DeepSeek, local inference servers).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dataset::Puzzle;

use super::backend::{
    extract_answer, puzzle_message, BackendError, BackendReply, BackendResult, ModelBackend,
    TokenUsage, SOLVER_PROMPT,
};

/// Backend for OpenAI-style chat completion endpoints
pub struct OpenAiCompatBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key_env: Option<String>,
    max_tokens: u32,
}

impl OpenAiCompatBackend {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key_env: Option<String>,
        max_tokens: u32,
    ) -> BackendResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BackendError::Setup(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key_env,
            max_tokens,
        })
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn api_key(&self) -> BackendResult<Option<String>> {
        match &self.api_key_env {
            None => Ok(None),
            Some(var) => std::env::var(var)
                .map(Some)
                .map_err(|_| BackendError::Setup(format!("environment variable {var} is not set"))),
        }
    }
}

// =============================================================================
// API TYPES
// =============================================================================

#[derive(Serialize)]
struct ChatApiRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatApiResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    /// Reported by some routers (OpenRouter)
    #[serde(default)]
    cost: Option<f64>,
}

// =============================================================================
// BACKEND IMPL
// =============================================================================

#[async_trait]
impl ModelBackend for OpenAiCompatBackend {
    fn provider(&self) -> &'static str {
        "openai_compatible"
    }

    async fn prepare(&self) -> BackendResult<()> {
        self.api_key().map(|_| ())
    }

    async fn solve(&self, puzzle: &Puzzle) -> BackendResult<BackendReply> {
        let user = puzzle_message(puzzle);
        let request = ChatApiRequest {
            model: &self.model,
            messages: vec![
                ApiMessage {
                    role: "system",
                    content: SOLVER_PROMPT,
                },
                ApiMessage {
                    role: "user",
                    content: &user,
                },
            ],
            max_tokens: self.max_tokens,
            temperature: 0.0,
        };

        let mut builder = self.client.post(self.chat_url()).json(&request);
        if let Some(key) = self.api_key()? {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(BackendError::from_status(status.as_u16(), body));
        }

        let parsed: ChatApiResponse = serde_json::from_str(&body)
            .map_err(|e| BackendError::InvalidResponse(format!("invalid JSON: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .ok_or_else(|| BackendError::InvalidResponse("no choices in response".to_string()))?;

        let (answer, score) = extract_answer(&content)?;

        let usage = parsed.usage.as_ref().map(|u| TokenUsage {
            input_tokens: u.prompt_tokens.unwrap_or(0),
            output_tokens: u.completion_tokens.unwrap_or(0),
        });
        let cost_usd = parsed.usage.as_ref().and_then(|u| u.cost);

        debug!(
            model = %self.model,
            puzzle_id = %puzzle.id,
            input_tokens = usage.map(|u| u.input_tokens),
            output_tokens = usage.map(|u| u.output_tokens),
            "Chat completion finished"
        );

        Ok(BackendReply {
            answer,
            score,
            usage,
            cost_usd,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn puzzle() -> Puzzle {
        Puzzle::new("p1", json!({"train": [[1]]})).with_expected(json!([[2]]))
    }

    #[tokio::test]
    async fn test_solve_parses_answer_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "```json\n{\"answer\": [[2]], \"score\": 0.9}\n```"}}],
                "usage": {"prompt_tokens": 120, "completion_tokens": 30}
            })))
            .mount(&server)
            .await;

        let backend =
            OpenAiCompatBackend::new(format!("{}/v1", server.uri()), "gpt-4o-mini", None, 256)
                .unwrap();
        let reply = backend.solve(&puzzle()).await.unwrap();

        assert_eq!(reply.answer, json!([[2]]));
        assert_eq!(reply.score, Some(0.9));
        assert_eq!(
            reply.usage,
            Some(TokenUsage {
                input_tokens: 120,
                output_tokens: 30
            })
        );
        assert_eq!(reply.cost_usd, None);
    }

    #[tokio::test]
    async fn test_rate_limit_maps_to_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("too many requests"))
            .mount(&server)
            .await;

        let backend = OpenAiCompatBackend::new(server.uri(), "m", None, 256).unwrap();
        let err = backend.solve(&puzzle()).await.unwrap_err();
        assert!(matches!(err, BackendError::RateLimited(_)));
    }

    #[tokio::test]
    async fn test_server_error_maps_to_http() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let backend = OpenAiCompatBackend::new(server.uri(), "m", None, 256).unwrap();
        let err = backend.solve(&puzzle()).await.unwrap_err();
        assert!(matches!(err, BackendError::Http { status: 502, .. }));
    }

    #[tokio::test]
    async fn test_garbage_reply_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "I refuse to answer."}}]
            })))
            .mount(&server)
            .await;

        let backend = OpenAiCompatBackend::new(server.uri(), "m", None, 256).unwrap();
        let err = backend.solve(&puzzle()).await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_bearer_auth_sent() {
        std::env::set_var("ORCH_TEST_OPENAI_KEY", "sk-test");
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "{\"answer\": 1}"}}],
                "usage": {"prompt_tokens": 1, "completion_tokens": 1, "cost": 0.002}
            })))
            .mount(&server)
            .await;

        let backend = OpenAiCompatBackend::new(
            server.uri(),
            "m",
            Some("ORCH_TEST_OPENAI_KEY".to_string()),
            256,
        )
        .unwrap();
        backend.prepare().await.unwrap();
        let reply = backend.solve(&puzzle()).await.unwrap();
        assert_eq!(reply.cost_usd, Some(0.002));
    }

    #[tokio::test]
    async fn test_prepare_fails_without_key() {
        let backend = OpenAiCompatBackend::new(
            "http://localhost:1",
            "m",
            Some("ORCH_TEST_MISSING_KEY_VAR".to_string()),
            256,
        )
        .unwrap();
        assert!(matches!(
            backend.prepare().await,
            Err(BackendError::Setup(_))
        ));
    }
}
