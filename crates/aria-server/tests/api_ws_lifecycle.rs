use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use aria_completion::{
    ChatRequest, CompletionClient, CompletionError, CompletionOptions, CompletionTransport,
    RetryPolicy, TransportReply,
};
use aria_server::{api_ws, app, AppState};
use aria_store::{create_pool, run_migrations, DbRuntimeSettings};
use aria_types::{Sender as MessageSender, VoiceSettings};
use aria_voice::{VoiceBinaries, VoiceBridge};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

struct EchoTransport {
    calls: AtomicUsize,
}

#[async_trait]
impl CompletionTransport for EchoTransport {
    async fn send(&self, request: &ChatRequest) -> Result<TransportReply, CompletionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(TransportReply {
            text: format!("echo: {last_user}"),
            model: "test-model".to_string(),
            prompt_tokens: 1,
            completion_tokens: 1,
            total_tokens: 2,
        })
    }
}

/// Transport that delays its reply, keeping an exchange in flight.
struct SlowTransport {
    delay: Duration,
}

#[async_trait]
impl CompletionTransport for SlowTransport {
    async fn send(&self, _request: &ChatRequest) -> Result<TransportReply, CompletionError> {
        tokio::time::sleep(self.delay).await;
        Ok(TransportReply {
            text: "eventually".to_string(),
            model: "test-model".to_string(),
            prompt_tokens: 1,
            completion_tokens: 1,
            total_tokens: 2,
        })
    }
}

async fn start_server(dir: &TempDir) -> (SocketAddr, aria_store::DbPool) {
    start_server_with(
        dir,
        Arc::new(EchoTransport {
            calls: AtomicUsize::new(0),
        }),
    )
    .await
}

async fn start_server_with(
    dir: &TempDir,
    transport: Arc<dyn CompletionTransport>,
) -> (SocketAddr, aria_store::DbPool) {
    let db_path = dir.path().join("aria-ws-test.db");
    let pool = create_pool(db_path.to_str().unwrap(), DbRuntimeSettings::default()).unwrap();
    {
        let conn = pool.get().unwrap();
        run_migrations(&conn).unwrap();
    }

    let completion = Arc::new(CompletionClient::new(
        transport,
        CompletionOptions::default(),
        RetryPolicy::immediate(1),
    ));

    let voice = Arc::new(VoiceBridge::new(VoiceBinaries {
        capture_binary: dir.path().join("no-such-recorder"),
        recognizer_binary: dir.path().join("no-such-recognizer"),
        recognizer_model: PathBuf::from("no-such-model.bin"),
        tts_binary: dir.path().join("no-such-tts"),
    }));

    let state = AppState {
        pool: pool.clone(),
        completion,
        completion_configured: true,
        voice,
        sessions: api_ws::SessionRegistry::new(),
        voice_settings: Arc::new(RwLock::new(VoiceSettings::default())),
        conversation_locks: Arc::new(Mutex::new(HashMap::new())),
        accept_client_user_id: false,
    };

    let app = app(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    (addr, pool)
}

async fn next_event(
    ws: &mut (impl futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
              + Unpin),
) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for event")
            .expect("connection closed")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("event must be json");
        }
    }
}

#[tokio::test]
async fn ws_chat_lifecycle() {
    let dir = TempDir::new().unwrap();
    let (addr, pool) = start_server(&dir).await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("failed to connect");

    // Server-assigned identity arrives first.
    let connected = next_event(&mut ws).await;
    assert_eq!(connected["type"], "connected");
    let user_id = connected["user_id"].as_str().unwrap();
    assert!(user_id.starts_with("user-"));
    assert!(connected["session_id"].as_str().is_some());

    ws.send(Message::Text(
        json!({
            "type": "send_message",
            "message": "Hello",
            "conversation_id": "conv-ws"
        })
        .to_string()
        .into(),
    ))
    .await
    .expect("failed to send");

    let response = next_event(&mut ws).await;
    assert_eq!(response["type"], "ai_response");
    assert_eq!(response["data"]["type"], "text");
    assert_eq!(response["data"]["text"], "echo: Hello");
    assert_eq!(response["data"]["conversation_id"], "conv-ws");
    assert!(response["data"]["timestamp"].as_str().is_some());

    // Both turns are persisted.
    {
        let conn = pool.get().unwrap();
        let messages = aria_store::conversation_history(&conn, "conv-ws", None).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].sender, MessageSender::User);
        assert_eq!(messages[1].text, "echo: Hello");
    }
}

#[tokio::test]
async fn slow_exchange_does_not_block_other_events() {
    let dir = TempDir::new().unwrap();
    let (addr, _pool) = start_server_with(
        &dir,
        Arc::new(SlowTransport {
            delay: Duration::from_millis(1_500),
        }),
    )
    .await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("failed to connect");
    let _connected = next_event(&mut ws).await;

    ws.send(Message::Text(
        json!({
            "type": "send_message",
            "message": "think about it",
            "conversation_id": "conv-slow"
        })
        .to_string()
        .into(),
    ))
    .await
    .unwrap();

    // Give the exchange a moment to reach the transport before the next
    // event arrives.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // start_voice fails fast (no capture binary); its error must arrive
    // while the completion call is still outstanding.
    ws.send(Message::Text(
        json!({ "type": "start_voice" }).to_string().into(),
    ))
    .await
    .unwrap();

    let first = next_event(&mut ws).await;
    assert_eq!(
        first["type"], "error",
        "voice error must not wait behind the pending completion"
    );

    let second = next_event(&mut ws).await;
    assert_eq!(second["type"], "ai_response");
    assert_eq!(second["data"]["text"], "eventually");
}

#[tokio::test]
async fn ws_rejects_malformed_and_invalid_events() {
    let dir = TempDir::new().unwrap();
    let (addr, _pool) = start_server(&dir).await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("failed to connect");
    let _connected = next_event(&mut ws).await;

    ws.send(Message::Text(
        json!({ "type": "no_such_event" }).to_string().into(),
    ))
    .await
    .unwrap();
    let error = next_event(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["message"], "unrecognized event");

    ws.send(Message::Text(
        json!({ "type": "send_message", "message": "   " })
            .to_string()
            .into(),
    ))
    .await
    .unwrap();
    let error = next_event(&mut ws).await;
    assert_eq!(error["type"], "error");
}

#[tokio::test]
async fn ws_voice_settings_update_is_acknowledged() {
    let dir = TempDir::new().unwrap();
    let (addr, _pool) = start_server(&dir).await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("failed to connect");
    let _connected = next_event(&mut ws).await;

    ws.send(Message::Text(
        json!({
            "type": "update_voice_settings",
            "settings": { "speech_rate": 200 }
        })
        .to_string()
        .into(),
    ))
    .await
    .unwrap();

    let ack = next_event(&mut ws).await;
    assert_eq!(ack["type"], "voice_settings");
    assert_eq!(ack["settings"]["speech_rate"], 200);
    assert_eq!(ack["settings"]["speech_volume"], 0.9);

    // Out-of-bounds update is rejected with an error event.
    ws.send(Message::Text(
        json!({
            "type": "update_voice_settings",
            "settings": { "speech_rate": 400 }
        })
        .to_string()
        .into(),
    ))
    .await
    .unwrap();

    let error = next_event(&mut ws).await;
    assert_eq!(error["type"], "error");
}
