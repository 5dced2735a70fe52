//! Completion transport: the HTTP seam between the client and the provider.
//!
//! The `CompletionTransport` trait isolates the single network call so the
//! client's prompt assembly and retry behavior can be tested against a
//! scripted transport. The production implementation posts to any
//! OpenAI-compatible `/chat/completions` endpoint via `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::CompletionError;

/// One chat-format message in a completion request.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// An OpenAI-format chat completion request body.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f64,
}

/// The provider's answer, reduced to what the client needs.
#[derive(Debug, Clone)]
pub struct TransportReply {
    pub text: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A single completion round trip. Implementations perform no retries;
/// the client owns the retry policy.
#[async_trait]
pub trait CompletionTransport: Send + Sync {
    async fn send(&self, request: &ChatRequest) -> Result<TransportReply, CompletionError>;
}

/// Production transport for OpenAI-compatible chat completion endpoints.
pub struct HttpTransport {
    client: Client,
    api_base: String,
    api_key: String,
}

impl HttpTransport {
    /// Creates a transport for `{api_base}/chat/completions`.
    ///
    /// `request_timeout` bounds the full round trip; a timeout surfaces as
    /// `Unavailable` and is subject to the client's retry policy.
    pub fn new(
        api_base: &str,
        api_key: &str,
        request_timeout: Duration,
    ) -> Result<Self, CompletionError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| CompletionError::Unavailable(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }
}

#[async_trait]
impl CompletionTransport for HttpTransport {
    async fn send(&self, request: &ChatRequest) -> Result<TransportReply, CompletionError> {
        let url = format!("{}/chat/completions", self.api_base);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| CompletionError::Unavailable(e.to_string()))?;

        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                let body = response.text().await.unwrap_or_default();
                return Err(CompletionError::Auth(format!("HTTP {status}: {body}")));
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after_ms = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(|secs| secs * 1_000);
                return Err(CompletionError::RateLimited { retry_after_ms });
            }
            s if s.is_server_error() => {
                let body = response.text().await.unwrap_or_default();
                return Err(CompletionError::Unavailable(format!(
                    "HTTP {status}: {body}"
                )));
            }
            s if !s.is_success() => {
                let body = response.text().await.unwrap_or_default();
                return Err(CompletionError::InvalidResponse(format!(
                    "HTTP {status}: {body}"
                )));
            }
            _ => {}
        }

        let body = response
            .text()
            .await
            .map_err(|e| CompletionError::Unavailable(e.to_string()))?;

        reply_from_body(&body, &request.model)
    }
}

#[derive(Debug, Deserialize)]
struct CompletionBody {
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

/// Parses a 2xx response body into a `TransportReply`.
///
/// The first choice's content is the answer; an absent or empty first
/// choice is `InvalidResponse`.
fn reply_from_body(body: &str, requested_model: &str) -> Result<TransportReply, CompletionError> {
    let parsed: CompletionBody = serde_json::from_str(body)
        .map_err(|e| CompletionError::InvalidResponse(format!("bad completion json: {e}")))?;

    let text = parsed
        .choices
        .first()
        .and_then(|c| c.message.content.as_deref())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| CompletionError::InvalidResponse("no completion content".to_string()))?
        .to_string();

    let usage = parsed.usage.unwrap_or_default();

    Ok(TransportReply {
        text,
        model: parsed.model.unwrap_or_else(|| requested_model.to_string()),
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
    })
}
