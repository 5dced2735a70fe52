//! HTTP fallback surface for stateless clients.
//!
//! Mirrors the WebSocket semantics: the chat endpoint runs the same
//! exchange (including the apology degradation), and the voice endpoints
//! delegate to the same bridge.

use crate::router::{self, ExchangeError};
use crate::AppState;
use aria_types::{ContextType, MessageOrigin, VoiceSettingsPatch};
use aria_voice::VoiceError;
use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

fn error_body(message: impl Into<String>) -> Json<Value> {
    Json(json!({ "error": message.into() }))
}

/// `GET /api/health`: service status plus per-dependency availability.
pub async fn health_handler(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    let store_ok = router::with_conn(&state, |conn| {
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map_err(aria_store::StoreError::from)
    })
    .await
    .is_ok();

    let completion_ok = state.completion_configured;
    let voice_ok = state.voice.binaries_resolvable();

    let status = if store_ok && completion_ok {
        "ok"
    } else {
        "degraded"
    };

    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": router::now_rfc3339(),
        "dependencies": {
            "store": store_ok,
            "completion": completion_ok,
            "voice": voice_ok,
        },
        "sessions": state.sessions.session_count().await,
    }))
}

/// Request body for `POST /api/chat`.
#[derive(Debug, Deserialize)]
pub struct ChatRequestBody {
    pub message: String,
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub context_type: ContextType,
    #[serde(default = "default_true")]
    pub include_suggestions: bool,
}

fn default_true() -> bool {
    true
}

/// `POST /api/chat` runs one stateless exchange.
///
/// Follow-up suggestions are best-effort: they are skipped on a degraded
/// exchange, and any suggestion failure yields an empty list rather than
/// an error.
pub async fn chat_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<ChatRequestBody>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let conversation_id = body
        .conversation_id
        .unwrap_or_else(|| format!("conv-{}", Uuid::new_v4()));

    let response = router::run_exchange(
        &state,
        &conversation_id,
        &body.message,
        MessageOrigin::Typed,
        body.context_type,
    )
    .await
    .map_err(|e| match e {
        ExchangeError::EmptyText => (StatusCode::BAD_REQUEST, error_body(e.to_string())),
    })?;

    let suggestions = if body.include_suggestions && !response.is_degraded() {
        match state.completion.suggest_followups(&response.text).await {
            Ok(suggestions) => suggestions,
            Err(e) => {
                tracing::debug!(error = %e, "follow-up suggestions unavailable");
                Vec::new()
            }
        }
    } else {
        Vec::new()
    };

    Ok(Json(json!({
        "response": response.text,
        "conversation_id": response.conversation_id,
        "timestamp": response.timestamp,
        "type": response.kind,
        "suggestions": suggestions,
        "metadata": response.metadata,
    })))
}

/// Query parameters for `GET /api/conversations`.
#[derive(Debug, Deserialize)]
pub struct ConversationsQuery {
    pub conversation_id: String,
    pub limit: Option<u32>,
}

/// Returns ascending history plus per-sender counts for one conversation.
pub async fn conversations_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<ConversationsQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let id = query.conversation_id.clone();
    let limit = query.limit;

    let result = router::with_conn(&state, move |conn| {
        let messages = aria_store::conversation_history(conn, &id, limit)?;
        let stats = aria_store::conversation_stats(conn, &id)?;
        Ok((messages, stats))
    })
    .await;

    match result {
        Ok((messages, stats)) => Ok(Json(json!({
            "conversation_id": query.conversation_id,
            "messages": messages,
            "stats": stats,
        }))),
        Err(e) => {
            tracing::error!(conversation_id = %query.conversation_id, error = %e, "history read failed");
            Err((
                StatusCode::SERVICE_UNAVAILABLE,
                error_body("conversation store unavailable"),
            ))
        }
    }
}

/// `GET /api/analytics`: usage aggregates across the whole store.
pub async fn analytics_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match router::with_conn(&state, |conn| aria_store::analytics_summary(conn)).await {
        Ok(stats) => Ok(Json(json!({
            "stats": stats,
            "timestamp": router::now_rfc3339(),
        }))),
        Err(e) => {
            tracing::error!(error = %e, "analytics read failed");
            Err((
                StatusCode::SERVICE_UNAVAILABLE,
                error_body("conversation store unavailable"),
            ))
        }
    }
}

/// Starts voice capture. 409 when already listening, 503 when the
/// capture device is missing.
pub async fn voice_start_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let settings = state.current_voice_settings();
    match state.voice.start_listening(settings).await {
        Ok(()) => Ok(Json(json!({ "listening": true }))),
        Err(VoiceError::AlreadyListening) => Err((
            StatusCode::CONFLICT,
            error_body("already listening"),
        )),
        Err(e) => {
            tracing::error!(error = %e, "voice start failed");
            Err((StatusCode::SERVICE_UNAVAILABLE, error_body(e.to_string())))
        }
    }
}

/// Stops voice capture. Idempotent.
pub async fn voice_stop_handler(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    state.voice.stop_listening().await;
    Json(json!({ "listening": false }))
}

/// Request body for `POST /api/speak`.
#[derive(Debug, Deserialize)]
pub struct SpeakRequestBody {
    pub text: String,
    #[serde(default)]
    pub interrupt: bool,
}

/// Starts playback; completion is reported over the real-time channel.
pub async fn speak_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<SpeakRequestBody>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if body.text.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            error_body("speak text must be non-empty"),
        ));
    }

    let settings = state.current_voice_settings();
    match state.voice.speak(&body.text, body.interrupt, &settings).await {
        Ok(()) => Ok(Json(json!({ "speaking": true }))),
        Err(e) => {
            tracing::error!(error = %e, "speak failed");
            Err((StatusCode::SERVICE_UNAVAILABLE, error_body(e.to_string())))
        }
    }
}

/// Current settings plus bridge status.
pub async fn get_voice_settings_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Json<Value> {
    Json(json!({
        "settings": state.current_voice_settings(),
        "listening": state.voice.is_listening(),
        "speaking": state.voice.is_speaking(),
    }))
}

/// Validated partial settings update. Any out-of-bounds field rejects the
/// whole update with 422 and prior settings stand.
pub async fn update_voice_settings_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(patch): Json<VoiceSettingsPatch>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.update_voice_settings(&patch) {
        Ok(updated) => Ok(Json(json!({ "settings": updated }))),
        Err(e) => Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            error_body(e.to_string()),
        )),
    }
}
