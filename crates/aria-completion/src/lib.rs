//! Chat completion client for the Aria server.
//!
//! Assembles context-aware prompts from conversation history, sends them to
//! an OpenAI-compatible chat completions endpoint, and retries transient
//! failures with bounded exponential backoff. The transport is a trait seam
//! so the surrounding behavior is testable without a network.

mod error;
mod prompt;
mod retry;
mod transport;

pub use error::CompletionError;
pub use prompt::{build_messages, system_instructions};
pub use retry::RetryPolicy;
pub use transport::{ChatMessage, ChatRequest, CompletionTransport, HttpTransport, TransportReply};

use std::sync::Arc;
use std::time::{Duration, Instant};

use aria_types::{CompletionMetadata, ContextType, Message};
use backon::Retryable;

/// A successful completion: the assistant's text plus usage metadata.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub metadata: CompletionMetadata,
}

/// Request shaping knobs for the completion client.
#[derive(Debug, Clone)]
pub struct CompletionOptions {
    /// Model identifier sent to the provider.
    pub model: String,
    /// Completion token cap per request.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f64,
    /// How many stored history turns to include in the prompt.
    pub history_window: usize,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            max_tokens: 1_000,
            temperature: 0.7,
            history_window: 10,
        }
    }
}

/// Client for requesting chat completions.
///
/// Stateless between calls; safe to share behind an `Arc`. Serialization of
/// concurrent calls for one conversation is the caller's responsibility.
pub struct CompletionClient {
    transport: Arc<dyn CompletionTransport>,
    options: CompletionOptions,
    retry: RetryPolicy,
}

impl CompletionClient {
    pub fn new(
        transport: Arc<dyn CompletionTransport>,
        options: CompletionOptions,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            options,
            retry,
        }
    }

    /// Requests a completion for `user_text` given prior conversation turns.
    ///
    /// Transient transport failures are retried per the configured policy;
    /// auth and rate-limit errors surface immediately. `response_time_ms`
    /// in the returned metadata covers the whole call including retries.
    pub async fn complete(
        &self,
        history: &[Message],
        user_text: &str,
        context: ContextType,
    ) -> Result<Completion, CompletionError> {
        let request = ChatRequest {
            model: self.options.model.clone(),
            messages: prompt::build_messages(
                history,
                user_text,
                context,
                self.options.history_window,
            ),
            max_tokens: self.options.max_tokens,
            temperature: self.options.temperature,
        };

        let started = Instant::now();
        let reply = (|| async { self.transport.send(&request).await })
            .retry(self.retry.backoff())
            .when(CompletionError::is_transient)
            .notify(|err: &CompletionError, delay: Duration| {
                tracing::warn!(
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "transient completion failure, retrying"
                );
            })
            .await?;
        let response_time_ms = started.elapsed().as_millis() as u64;

        tracing::debug!(
            model = %reply.model,
            total_tokens = reply.total_tokens,
            response_time_ms,
            "completion succeeded"
        );

        Ok(Completion {
            text: reply.text,
            metadata: CompletionMetadata {
                model: reply.model,
                prompt_tokens: reply.prompt_tokens,
                completion_tokens: reply.completion_tokens,
                total_tokens: reply.total_tokens,
                response_time_ms,
            },
        })
    }

    /// Suggests up to three brief follow-up messages the user might send
    /// after `last_reply`.
    ///
    /// One round trip, no retries: suggestions are decorative and the
    /// caller degrades any failure to an empty list. A reply that is not a
    /// JSON array of strings is `InvalidResponse`.
    pub async fn suggest_followups(
        &self,
        last_reply: &str,
    ) -> Result<Vec<String>, CompletionError> {
        let request = ChatRequest {
            model: self.options.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: "Based on the AI's last response, suggest 3 brief follow-up \
                              questions or responses the user might want to ask. Return as a \
                              JSON array of strings."
                        .to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: format!("Last AI response: {last_reply}"),
                },
            ],
            max_tokens: 150,
            temperature: 0.8,
        };

        let reply = self.transport.send(&request).await?;
        let mut suggestions: Vec<String> = serde_json::from_str(reply.text.trim())
            .map_err(|e| {
                CompletionError::InvalidResponse(format!("suggestions are not a JSON array: {e}"))
            })?;
        suggestions.truncate(3);
        Ok(suggestions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedTransport {
        replies: Mutex<VecDeque<Result<TransportReply, CompletionError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Result<TransportReply, CompletionError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CompletionTransport for ScriptedTransport {
        async fn send(&self, _request: &ChatRequest) -> Result<TransportReply, CompletionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(CompletionError::Unavailable("script exhausted".into())))
        }
    }

    fn ok_reply(text: &str) -> Result<TransportReply, CompletionError> {
        Ok(TransportReply {
            text: text.to_string(),
            model: "test-model".to_string(),
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        })
    }

    fn client(transport: Arc<ScriptedTransport>, retries: usize) -> CompletionClient {
        CompletionClient::new(
            transport,
            CompletionOptions::default(),
            RetryPolicy::immediate(retries),
        )
    }

    #[tokio::test]
    async fn success_populates_text_and_metadata() {
        let transport = ScriptedTransport::new(vec![ok_reply("Greetings.")]);
        let client = client(transport.clone(), 3);

        let completion = client
            .complete(&[], "hello", ContextType::Default)
            .await
            .expect("completion should succeed");

        assert_eq!(completion.text, "Greetings.");
        assert_eq!(completion.metadata.model, "test-model");
        assert_eq!(completion.metadata.total_tokens, 15);
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let transport = ScriptedTransport::new(vec![
            Err(CompletionError::Unavailable("connect refused".into())),
            Err(CompletionError::Unavailable("HTTP 503".into())),
            ok_reply("third time lucky"),
        ]);
        let client = client(transport.clone(), 3);

        let completion = client
            .complete(&[], "hello", ContextType::Default)
            .await
            .expect("should succeed after retries");

        assert_eq!(completion.text, "third time lucky");
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_unavailable() {
        let transport = ScriptedTransport::new(vec![]);
        let client = client(transport.clone(), 2);

        let err = client
            .complete(&[], "hello", ContextType::Default)
            .await
            .expect_err("must fail once retries are spent");

        assert!(matches!(err, CompletionError::Unavailable(_)));
        // initial attempt + 2 retries
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test]
    async fn auth_errors_are_never_retried() {
        let transport =
            ScriptedTransport::new(vec![Err(CompletionError::Auth("bad key".into()))]);
        let client = client(transport.clone(), 3);

        let err = client
            .complete(&[], "hello", ContextType::Default)
            .await
            .expect_err("auth failure must surface");

        assert!(matches!(err, CompletionError::Auth(_)));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn followup_suggestions_are_capped_at_three() {
        let transport = ScriptedTransport::new(vec![ok_reply(
            r#"["One?", "Two?", "Three?", "Four?"]"#,
        )]);
        let client = client(transport.clone(), 3);

        let suggestions = client
            .suggest_followups("The capital of France is Paris.")
            .await
            .expect("suggestions should parse");

        assert_eq!(suggestions, vec!["One?", "Two?", "Three?"]);
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn non_json_suggestions_surface_invalid_response_without_retry() {
        let transport = ScriptedTransport::new(vec![
            ok_reply("Here are some ideas: ask about history."),
            ok_reply(r#"["unreached"]"#),
        ]);
        let client = client(transport.clone(), 3);

        let err = client
            .suggest_followups("anything")
            .await
            .expect_err("prose reply must be rejected");

        assert!(matches!(err, CompletionError::InvalidResponse(_)));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn rate_limit_is_never_retried() {
        let transport = ScriptedTransport::new(vec![Err(CompletionError::RateLimited {
            retry_after_ms: Some(5_000),
        })]);
        let client = client(transport.clone(), 3);

        let err = client
            .complete(&[], "hello", ContextType::Default)
            .await
            .expect_err("rate limit must surface");

        assert!(matches!(err, CompletionError::RateLimited { .. }));
        assert_eq!(transport.call_count(), 1);
    }
}
