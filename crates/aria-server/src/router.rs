//! Conversation exchange orchestration.
//!
//! One entry point, `run_exchange`, shared by the WebSocket path, the HTTP
//! fallback path, and the voice transcript path. It appends the user turn,
//! requests a completion (serialized per conversation), appends the
//! assistant turn, and shapes the outgoing `ai_response` payload.
//!
//! Persistence is best-effort throughout: a store failure is logged at warn
//! and the conversational path continues without it.

use std::sync::Arc;

use aria_completion::CompletionError;
use aria_store::{AppendMessageParams, StoreError};
use aria_types::{CompletionMetadata, ContextType, Message, MessageOrigin, Sender};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::AppState;

/// Reply text when the completion provider cannot be reached.
const APOLOGY_TEXT: &str =
    "I apologize, but I'm experiencing technical difficulties. Please try again.";

/// Discriminator on an `ai_response`: which surface produced the exchange,
/// or `Error` for the apology degradation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    Text,
    Voice,
    Error,
}

/// The `ai_response` event payload, shared by the WS and HTTP surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct AiResponse {
    pub text: String,
    pub conversation_id: String,
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: ResponseKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<CompletionMetadata>,
}

impl AiResponse {
    pub fn is_degraded(&self) -> bool {
        self.kind == ResponseKind::Error
    }
}

/// A request rejected before any side effect.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("message text must be non-empty")]
    EmptyText,
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Runs one user→assistant exchange.
///
/// Empty text is rejected up front with no side effects. Otherwise: the user
/// turn is appended (best-effort), the completion call runs under the
/// conversation's lock so concurrent sends for one conversation serialize,
/// and on success the assistant turn is appended (best-effort). On
/// completion failure nothing is appended and the returned payload is the
/// apology, typed as an error.
pub async fn run_exchange(
    state: &AppState,
    conversation_id: &str,
    user_text: &str,
    origin: MessageOrigin,
    context: ContextType,
) -> Result<AiResponse, ExchangeError> {
    let text = user_text.trim();
    if text.is_empty() {
        return Err(ExchangeError::EmptyText);
    }

    let lock = conversation_lock(state, conversation_id).await;
    let response = {
        let _guard = lock.lock().await;

        // History is read before the user turn is appended so the prompt
        // assembler can add the current text itself.
        let history = fetch_history(state, conversation_id).await;

        persist_message(
            state,
            AppendMessageParams {
                conversation_id: conversation_id.to_string(),
                sender: Sender::User,
                text: text.to_string(),
                origin,
                metadata: None,
            },
        )
        .await;

        match state.completion.complete(&history, text, context).await {
            Ok(completion) => {
                let stored = persist_message(
                    state,
                    AppendMessageParams {
                        conversation_id: conversation_id.to_string(),
                        sender: Sender::Assistant,
                        text: completion.text.clone(),
                        origin,
                        metadata: Some(completion.metadata.clone()),
                    },
                )
                .await;

                let timestamp = stored
                    .map(|m| m.created_at)
                    .unwrap_or_else(now_rfc3339);

                let kind = match origin {
                    MessageOrigin::Voice => ResponseKind::Voice,
                    MessageOrigin::Typed => ResponseKind::Text,
                };
                AiResponse {
                    text: completion.text,
                    conversation_id: conversation_id.to_string(),
                    timestamp,
                    kind,
                    metadata: Some(completion.metadata),
                }
            }
            Err(e) => {
                log_completion_failure(conversation_id, &e);
                AiResponse {
                    text: APOLOGY_TEXT.to_string(),
                    conversation_id: conversation_id.to_string(),
                    timestamp: now_rfc3339(),
                    kind: ResponseKind::Error,
                    metadata: None,
                }
            }
        }
    };

    release_conversation_lock(state, conversation_id, &lock).await;
    Ok(response)
}

fn log_completion_failure(conversation_id: &str, e: &CompletionError) {
    match e {
        CompletionError::Auth(_) => tracing::error!(
            conversation_id,
            error = %e,
            "completion credentials rejected, degrading to apology"
        ),
        _ => tracing::warn!(
            conversation_id,
            error = %e,
            "completion failed, degrading to apology"
        ),
    }
}

/// Returns the per-conversation lock, creating it on first use.
async fn conversation_lock(state: &AppState, conversation_id: &str) -> Arc<Mutex<()>> {
    let mut locks = state.conversation_locks.lock().await;
    locks
        .entry(conversation_id.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// Evicts the map entry when no other exchange holds the lock, so the map
/// does not grow with every conversation id ever seen.
///
/// `lock` is the caller's clone; with the map mutex held, a strong count of
/// exactly 2 (the map's entry plus the caller's clone) means no other
/// exchange is waiting on this conversation.
async fn release_conversation_lock(
    state: &AppState,
    conversation_id: &str,
    lock: &Arc<Mutex<()>>,
) {
    let mut locks = state.conversation_locks.lock().await;
    if Arc::strong_count(lock) == 2 {
        locks.remove(conversation_id);
    }
}

/// Runs a store operation on a pooled connection via the blocking pool.
pub(crate) async fn with_conn<T, F>(state: &AppState, f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&rusqlite::Connection) -> Result<T, StoreError> + Send + 'static,
{
    let pool = state.pool.clone();
    tokio::task::spawn_blocking(move || {
        let conn = pool
            .get()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        f(&conn)
    })
    .await
    .map_err(|e| StoreError::Unavailable(format!("blocking task failed: {e}")))?
}

/// Best-effort append. Returns the stored message, or `None` after logging
/// the failure.
async fn persist_message(state: &AppState, params: AppendMessageParams) -> Option<Message> {
    let conversation_id = params.conversation_id.clone();
    match with_conn(state, move |conn| aria_store::append_message(conn, &params)).await {
        Ok(message) => Some(message),
        Err(e) => {
            tracing::warn!(
                conversation_id = %conversation_id,
                error = %e,
                "failed to persist message, continuing without it"
            );
            None
        }
    }
}

/// Best-effort history read. An unreachable store yields an empty history
/// so the exchange can still complete.
async fn fetch_history(state: &AppState, conversation_id: &str) -> Vec<Message> {
    let id = conversation_id.to_string();
    match with_conn(state, move |conn| {
        aria_store::conversation_history(conn, &id, None)
    })
    .await
    {
        Ok(history) => history,
        Err(e) => {
            tracing::warn!(
                conversation_id,
                error = %e,
                "failed to load history, completing without context"
            );
            Vec::new()
        }
    }
}
