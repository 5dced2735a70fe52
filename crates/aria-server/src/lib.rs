//! Aria server library logic.

pub mod api;
pub mod api_ws;
pub mod config;
pub mod router;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use aria_completion::CompletionClient;
use aria_store::DbPool;
use aria_types::{SettingsError, VoiceSettings, VoiceSettingsPatch};
use aria_voice::VoiceBridge;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Extension, Router,
};
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Maximum request body size (2 MiB). Protects against OOM from oversized payloads.
const MAX_REQUEST_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: DbPool,
    /// Completion client.
    pub completion: Arc<CompletionClient>,
    /// Whether the completion provider has credentials configured.
    pub completion_configured: bool,
    /// Process-wide voice bridge.
    pub voice: Arc<VoiceBridge>,
    /// Live WebSocket sessions.
    pub sessions: api_ws::SessionRegistry,
    /// Process-wide voice settings.
    ///
    /// Uses `std::sync::RwLock` intentionally: every acquisition is a brief
    /// copy in/out that never spans an `.await` point.
    pub voice_settings: Arc<RwLock<VoiceSettings>>,
    /// Per-conversation completion locks, created on first use.
    pub conversation_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    /// Whether a client-supplied `user_id` is honored on connect.
    pub accept_client_user_id: bool,
}

impl AppState {
    /// Snapshot of the current voice settings.
    pub fn current_voice_settings(&self) -> VoiceSettings {
        *self
            .voice_settings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Applies a validated partial settings update.
    ///
    /// The merge-and-validate happens against a snapshot and the store is a
    /// single write, so concurrent readers see either the old settings or
    /// the fully updated ones.
    pub fn update_voice_settings(
        &self,
        patch: &VoiceSettingsPatch,
    ) -> Result<VoiceSettings, SettingsError> {
        let mut guard = self
            .voice_settings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let updated = patch.apply(*guard)?;
        *guard = updated;
        tracing::info!(
            speech_rate = updated.speech_rate,
            speech_volume = updated.speech_volume,
            "voice settings updated"
        );
        Ok(updated)
    }
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(api::health_handler))
        .route("/api/chat", post(api::chat_handler))
        .route("/api/conversations", get(api::conversations_handler))
        .route("/api/analytics", get(api::analytics_handler))
        .route("/api/voice/start", post(api::voice_start_handler))
        .route("/api/voice/stop", post(api::voice_stop_handler))
        .route("/api/speak", post(api::speak_handler))
        .route(
            "/api/voice/settings",
            get(api::get_voice_settings_handler).post(api::update_voice_settings_handler),
        )
        .route("/ws", get(api_ws::ws_handler))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
