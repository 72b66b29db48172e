//! Backend abstraction: one implementation per provider family

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::dataset::Puzzle;
use crate::state::ErrorKind;

/// Instruction sent ahead of every puzzle
pub const SOLVER_PROMPT: &str = "You are solving an evaluation puzzle. The puzzle is given as JSON. \
Reply with a single JSON object of the form {\"answer\": <your answer>, \"score\": <confidence between 0 and 1>} \
inside a ```json fenced block. Do not add any other text.";

/// Fenced JSON block in a model reply
static FENCED_JSON_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json|JSON)?\s*\n?(.*?)```").expect("FENCED_JSON_RE regex should compile")
});

/// Errors a backend call can end with.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Provider returned 429.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Non-success HTTP status other than 429.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Connection, TLS or body read failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Reply arrived but carried no usable answer.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Backend could not be initialized.
    #[error("setup failed: {0}")]
    Setup(String),
}

/// Result type for backend calls
pub type BackendResult<T> = Result<T, BackendError>;

impl BackendError {
    /// Task error kind this failure maps to
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::Http { .. } | Self::Transport(_) => ErrorKind::BackendError,
            Self::InvalidResponse(_) => ErrorKind::InvalidResponse,
            Self::Setup(_) => ErrorKind::SetupFailure,
        }
    }

    /// Map an HTTP status and body to an error
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        if status == 429 {
            Self::RateLimited(truncate(&body, 200))
        } else {
            Self::Http {
                status,
                body: truncate(&body, 500),
            }
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => Self::from_status(status.as_u16(), e.to_string()),
            None if e.is_decode() => Self::InvalidResponse(e.to_string()),
            None => Self::Transport(e.to_string()),
        }
    }
}

/// Token usage reported by the provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// A successful backend reply
#[derive(Debug, Clone, PartialEq)]
pub struct BackendReply {
    /// The model's answer
    pub answer: Value,
    /// Self-reported accuracy, if any
    pub score: Option<f64>,
    pub usage: Option<TokenUsage>,
    /// Cost in USD when the provider reports it directly
    pub cost_usd: Option<f64>,
}

impl BackendReply {
    pub fn new(answer: Value) -> Self {
        Self {
            answer,
            score: None,
            usage: None,
            cost_usd: None,
        }
    }
}

/// A model backend.
///
/// `solve` performs exactly one call; retries and timeouts are applied by the
/// caller.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Provider family name, for logs
    fn provider(&self) -> &'static str;

    /// One-time setup before the first call of a run
    async fn prepare(&self) -> BackendResult<()> {
        Ok(())
    }

    /// Attempt a puzzle
    async fn solve(&self, puzzle: &Puzzle) -> BackendResult<BackendReply>;
}

/// Render a puzzle as the user message
pub fn puzzle_message(puzzle: &Puzzle) -> String {
    format!("Puzzle {}:\n{}", puzzle.id, puzzle.payload)
}

/// Extract the answer (and optional score) from reply text.
///
/// Accepts bare JSON, a fenced JSON block, or the outermost JSON object in
/// the text. An object with an `answer` field is unwrapped.
pub fn extract_answer(content: &str) -> BackendResult<(Value, Option<f64>)> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(BackendError::InvalidResponse("empty reply".to_string()));
    }

    let parsed = serde_json::from_str::<Value>(trimmed)
        .ok()
        .or_else(|| {
            FENCED_JSON_RE
                .captures_iter(trimmed)
                .find_map(|c| serde_json::from_str::<Value>(c[1].trim()).ok())
        })
        .or_else(|| {
            let start = trimmed.find(['{', '['])?;
            let end = trimmed.rfind(['}', ']'])?;
            (end > start)
                .then(|| serde_json::from_str::<Value>(&trimmed[start..=end]).ok())
                .flatten()
        })
        .ok_or_else(|| {
            BackendError::InvalidResponse(format!("no JSON answer in: {}", truncate(trimmed, 120)))
        })?;

    match parsed {
        Value::Object(mut map) if map.contains_key("answer") => {
            let score = map
                .get("score")
                .or_else(|| map.get("confidence"))
                .and_then(Value::as_f64)
                .filter(|s| s.is_finite())
                .map(|s| s.clamp(0.0, 1.0));
            let answer = map.remove("answer").unwrap_or(Value::Null);
            Ok((answer, score))
        }
        other => Ok((other, None)),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_bare_json() {
        let (answer, score) = extract_answer(r#"{"answer": [[1, 2]], "score": 0.8}"#).unwrap();
        assert_eq!(answer, json!([[1, 2]]));
        assert_eq!(score, Some(0.8));
    }

    #[test]
    fn test_extract_fenced_block() {
        let reply = "Here is my answer:\n```json\n{\"answer\": 42, \"confidence\": 3}\n```\nDone.";
        let (answer, score) = extract_answer(reply).unwrap();
        assert_eq!(answer, json!(42));
        assert_eq!(score, Some(1.0));
    }

    #[test]
    fn test_extract_embedded_value() {
        let (answer, score) = extract_answer("The grid is [[0, 1], [1, 0]] I think").unwrap();
        assert_eq!(answer, json!([[0, 1], [1, 0]]));
        assert_eq!(score, None);
    }

    #[test]
    fn test_extract_rejects_prose() {
        assert!(matches!(
            extract_answer("I cannot solve this."),
            Err(BackendError::InvalidResponse(_))
        ));
        assert!(matches!(
            extract_answer("   "),
            Err(BackendError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            BackendError::from_status(429, "slow down").kind(),
            ErrorKind::RateLimited
        );
        assert_eq!(
            BackendError::from_status(503, "overloaded").kind(),
            ErrorKind::BackendError
        );
        assert_eq!(
            BackendError::Setup("no key".into()).kind(),
            ErrorKind::SetupFailure
        );
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let s = "ééééé";
        let t = truncate(s, 3);
        assert!(t.ends_with("..."));
        assert!(t.starts_with('é'));
    }
}
