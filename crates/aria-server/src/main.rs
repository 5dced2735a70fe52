//! Aria server binary — the entry point for the voice chat backend.
//!
//! Starts an axum HTTP/WebSocket server with structured logging, database
//! initialization, the voice event forwarder, and graceful shutdown on
//! SIGTERM/SIGINT.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use aria_completion::{CompletionClient, CompletionOptions, HttpTransport, RetryPolicy};
use aria_server::{api_ws, app, config, AppState};
use aria_types::VoiceSettings;
use aria_voice::{VoiceBinaries, VoiceBridge};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("ARIA_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    // Load configuration
    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration — the server cannot start without valid config");

    // Initialize tracing
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    // Initialize database
    let pool = aria_store::create_pool(
        &config.database.path,
        aria_store::DbRuntimeSettings {
            busy_timeout_ms: config.database.busy_timeout_ms,
            pool_max_size: config.database.pool_max_size,
        },
    )
    .expect("failed to create database pool — check database.path in config");

    {
        let conn = pool
            .get()
            .expect("failed to get database connection for migrations");
        let applied = aria_store::run_migrations(&conn).expect("failed to run database migrations");
        if applied > 0 {
            tracing::info!(count = applied, "applied database migrations");
        }
    }

    // Completion client
    let completion_configured = !config.completion.api_key.is_empty();
    if !completion_configured {
        tracing::error!(
            "completion api_key is not configured — chat exchanges will degrade to apologies \
             (set completion.api_key or ARIA_API_KEY)"
        );
    }
    let transport = HttpTransport::new(
        &config.completion.api_base,
        &config.completion.api_key,
        Duration::from_secs(config.completion.request_timeout_secs),
    )
    .expect("failed to build completion transport");
    let completion = Arc::new(CompletionClient::new(
        Arc::new(transport),
        CompletionOptions {
            model: config.completion.model.clone(),
            max_tokens: config.completion.max_tokens,
            temperature: config.completion.temperature,
            history_window: config.completion.history_window,
        },
        RetryPolicy {
            max_retries: config.completion.max_retries,
            ..RetryPolicy::default()
        },
    ));

    // Voice bridge
    let voice = Arc::new(VoiceBridge::new(VoiceBinaries {
        capture_binary: PathBuf::from(&config.voice.capture_binary),
        recognizer_binary: PathBuf::from(&config.voice.recognizer_binary),
        recognizer_model: PathBuf::from(&config.voice.recognizer_model),
        tts_binary: PathBuf::from(&config.voice.tts_binary),
    }));

    let state = AppState {
        pool,
        completion,
        completion_configured,
        voice,
        sessions: api_ws::SessionRegistry::new(),
        voice_settings: Arc::new(RwLock::new(VoiceSettings::default())),
        conversation_locks: Arc::new(Mutex::new(HashMap::new())),
        accept_client_user_id: config.session.accept_client_user_id,
    };

    let forwarder = api_ws::spawn_voice_forwarder(Arc::new(state.clone()));

    // Build application
    let app = app(state);
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, "starting aria server");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address — is another process using this port?");

    // Serve with graceful shutdown
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("server error");

    forwarder.abort();
    tracing::info!("aria server shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
