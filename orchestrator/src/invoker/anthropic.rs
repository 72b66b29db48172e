//! Anthropic messages API backend

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dataset::Puzzle;

use super::backend::{
    extract_answer, puzzle_message, BackendError, BackendReply, BackendResult, ModelBackend,
    TokenUsage, SOLVER_PROMPT,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_KEY_ENV: &str = "ANTHROPIC_API_KEY";

/// Backend for `POST /v1/messages`
pub struct AnthropicBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key_env: String,
    max_tokens: u32,
}

impl AnthropicBackend {
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
            api_key_env: api_key_env.unwrap_or_else(|| DEFAULT_KEY_ENV.to_string()),
            max_tokens,
        })
    }

    fn api_key(&self) -> BackendResult<String> {
        std::env::var(&self.api_key_env).map_err(|_| {
            BackendError::Setup(format!(
                "environment variable {} is not set",
                self.api_key_env
            ))
        })
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    system: &'a str,
    max_tokens: u32,
    messages: Vec<ApiMessage<'a>>,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

#[async_trait]
impl ModelBackend for AnthropicBackend {
    fn provider(&self) -> &'static str {
        "anthropic"
    }

    async fn prepare(&self) -> BackendResult<()> {
        self.api_key().map(|_| ())
    }

    async fn solve(&self, puzzle: &Puzzle) -> BackendResult<BackendReply> {
        let user = puzzle_message(puzzle);
        let request = MessagesRequest {
            model: &self.model,
            system: SOLVER_PROMPT,
            max_tokens: self.max_tokens,
            messages: vec![ApiMessage {
                role: "user",
                content: &user,
            }],
        };

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", self.api_key()?)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(BackendError::from_status(status.as_u16(), body));
        }

        let parsed: MessagesResponse = serde_json::from_str(&body)
            .map_err(|e| BackendError::InvalidResponse(format!("invalid JSON: {e}")))?;

        let text: String = parsed
            .content
            .iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");

        let (answer, score) = extract_answer(&text)?;
        let usage = parsed.usage.map(|u| TokenUsage {
            input_tokens: u.input_tokens.unwrap_or(0),
            output_tokens: u.output_tokens.unwrap_or(0),
        });

        debug!(model = %self.model, puzzle_id = %puzzle.id, "Message finished");

        Ok(BackendReply {
            answer,
            score,
            usage,
            cost_usd: None,
        })
    }
}
