//! OpenAI-compatible chat completion client.
//!
//! One shared [`LlmClient`] serves every worker in an experiment. Retry
//! policy: at least four attempts with exponential backoff, a rate-limit
//! response extends the minimum wait to ten seconds, and 4xx bodies are
//! carried (truncated) into the error surface so misconfigured models
//! are diagnosable from the log alone.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Default OpenAI-compatible endpoint when `OPENAI_BASE_URL` is unset.
const DEFAULT_BASE_URL: &str = "http://localhost:8000/v1";

/// Number of attempts before a chat completion gives up.
const MAX_ATTEMPTS: u32 = 4;

/// Minimum wait after a 429 response.
const RATE_LIMIT_FLOOR: Duration = Duration::from_secs(10);

/// How much of a 4xx response body is carried into the error.
const ERROR_BODY_LIMIT: usize = 1024;

/// Per-request HTTP timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Result type alias for LLM calls.
pub type LlmResult<T> = Result<T, LlmError>;

/// Error from the chat completion client.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Building the HTTP client failed.
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),

    /// The endpoint returned a non-success status.
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The response did not carry a usable completion.
    #[error("malformed completion response: {0}")]
    MalformedResponse(String),

    /// All retry attempts were exhausted.
    #[error("chat completion failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

/// One chat message in a completion request.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    /// Build a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    /// Build a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Sampling parameters for one chat completion.
#[derive(Debug, Clone)]
pub struct ChatParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
}

impl Default for ChatParams {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_p: 1.0,
            max_tokens: 1024,
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    top_p: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// Shared HTTP client for an OpenAI-compatible endpoint.
pub struct LlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl LlmClient {
    /// Create a client for an explicit endpoint.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> LlmResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(LlmError::ClientBuild)?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    /// Create a client from `OPENAI_BASE_URL` / `OPENAI_API_KEY`.
    pub fn from_env() -> LlmResult<Self> {
        let base_url =
            std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_else(|_| "EMPTY".to_string());
        Self::new(base_url, api_key)
    }

    /// Call the chat completion endpoint and return the assistant text.
    pub async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: &ChatParams,
    ) -> LlmResult<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let model = normalize_model_id(&self.base_url, model);
        let request = ChatRequest {
            model: &model,
            messages,
            temperature: params.temperature,
            top_p: params.top_p,
            max_tokens: params.max_tokens,
        };

        let mut last_error = String::new();
        for attempt in 0..MAX_ATTEMPTS {
            match self.try_once(&url, &request).await {
                Ok(content) => return Ok(content),
                Err(err) => {
                    let status = match &err {
                        LlmError::Status { status, .. } => Some(*status),
                        _ => None,
                    };
                    last_error = err.to_string();
                    if attempt + 1 < MAX_ATTEMPTS {
                        let wait = retry_delay(attempt, status);
                        warn!(
                            attempt = attempt + 1,
                            wait_s = wait.as_secs(),
                            error = %last_error,
                            "chat completion attempt failed, retrying"
                        );
                        tokio::time::sleep(wait).await;
                    }
                }
            }
        }

        Err(LlmError::RetriesExhausted {
            attempts: MAX_ATTEMPTS,
            last: last_error,
        })
    }

    async fn try_once(&self, url: &str, request: &ChatRequest<'_>) -> LlmResult<String> {
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| LlmError::MalformedResponse(format!("transport: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body = body.chars().take(ERROR_BODY_LIMIT).collect();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::MalformedResponse(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::MalformedResponse("no choices in response".to_string()))
    }
}

/// Backoff for the given attempt: 1s, 2s, 4s, ... with a 10s floor on
/// rate-limit responses.
fn retry_delay(attempt: u32, status: Option<u16>) -> Duration {
    let base = Duration::from_secs(1 << attempt.min(6));
    if status == Some(429) {
        base.max(RATE_LIMIT_FLOOR)
    } else {
        base
    }
}

/// Strip a provider prefix from the model id when targeting OpenAI's
/// native API, which expects bare ids. Other parts of the pipeline pass
/// litellm-style names like `openai/gpt-5.2`.
fn normalize_model_id(base_url: &str, model: &str) -> String {
    if base_url.contains("api.openai.com") {
        if let Some((provider, bare)) = model.split_once('/') {
            if provider.eq_ignore_ascii_case("openai") && !bare.trim().is_empty() {
                return bare.trim().to_string();
            }
        }
    }
    model.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_doubles() {
        assert_eq!(retry_delay(0, None), Duration::from_secs(1));
        assert_eq!(retry_delay(1, None), Duration::from_secs(2));
        assert_eq!(retry_delay(2, None), Duration::from_secs(4));
    }

    #[test]
    fn test_rate_limit_floor() {
        assert_eq!(retry_delay(0, Some(429)), Duration::from_secs(10));
        assert_eq!(retry_delay(1, Some(429)), Duration::from_secs(10));
        // Once the backoff exceeds the floor, the backoff wins.
        assert_eq!(retry_delay(4, Some(429)), Duration::from_secs(16));
    }

    #[test]
    fn test_non_429_errors_use_plain_backoff() {
        assert_eq!(retry_delay(0, Some(500)), Duration::from_secs(1));
        assert_eq!(retry_delay(0, Some(400)), Duration::from_secs(1));
    }

    #[test]
    fn test_model_normalization_only_for_openai() {
        assert_eq!(
            normalize_model_id("https://api.openai.com/v1", "openai/gpt-5.2"),
            "gpt-5.2"
        );
        assert_eq!(
            normalize_model_id("http://localhost:8000/v1", "openai/gpt-5.2"),
            "openai/gpt-5.2"
        );
        assert_eq!(
            normalize_model_id("https://api.openai.com/v1", "gpt-5.2"),
            "gpt-5.2"
        );
        // Non-openai providers keep their prefix even on api.openai.com.
        assert_eq!(
            normalize_model_id("https://api.openai.com/v1", "azure/gpt-5.2"),
            "azure/gpt-5.2"
        );
    }

    #[test]
    fn test_message_constructors() {
        let m = ChatMessage::system("be terse");
        assert_eq!(m.role, "system");
        let m = ChatMessage::user("hi");
        assert_eq!(m.role, "user");
        assert_eq!(m.content, "hi");
    }
}
