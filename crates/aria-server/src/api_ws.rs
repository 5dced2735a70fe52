//! WebSocket API handler and session management.

use crate::router::{self, AiResponse};
use crate::AppState;
use aria_types::{ContextType, MessageOrigin, VoiceSettings, VoiceSettingsPatch};
use aria_voice::{VoiceError, VoiceEvent};
use axum::{
    extract::{
        ws::{Message as AxumMessage, WebSocket},
        ConnectInfo, Extension, Query, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Conversation id used for exchanges triggered by recognized speech. Voice
/// capture is process-wide, so its transcript thread is too.
pub const VOICE_CONVERSATION_ID: &str = "voice";

/// Maximum allowed length for a message text field (64 KiB).
const MAX_MESSAGE_TEXT_LEN: usize = 65_536;

/// Query parameters for the WebSocket connection.
#[derive(Debug, Deserialize)]
pub struct WsConnectParams {
    /// Client-proposed stable identity. Honored only when
    /// `session.accept_client_user_id` is enabled.
    pub user_id: Option<String>,
}

/// Incoming WebSocket event types.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum IncomingEvent {
    #[serde(rename = "send_message")]
    SendMessage {
        message: String,
        conversation_id: Option<String>,
        #[serde(default)]
        context_type: ContextType,
    },
    #[serde(rename = "start_voice")]
    StartVoice,
    #[serde(rename = "stop_voice")]
    StopVoice,
    #[serde(rename = "speak")]
    Speak {
        text: String,
        #[serde(default)]
        interrupt: bool,
    },
    #[serde(rename = "update_voice_settings")]
    UpdateVoiceSettings {
        #[serde(default)]
        settings: VoiceSettingsPatch,
    },
}

/// Outgoing WebSocket event types.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum OutgoingEvent {
    #[serde(rename = "connected")]
    Connected {
        session_id: String,
        user_id: String,
        timestamp: String,
    },
    /// The payload is nested under `data` because it carries its own
    /// `type` discriminator (response vs error) which would collide with
    /// the envelope tag if flattened.
    #[serde(rename = "ai_response")]
    AiResponse { data: AiResponse },
    #[serde(rename = "voice_input_received")]
    VoiceInputReceived { text: String, timestamp: String },
    #[serde(rename = "voice_status")]
    VoiceStatus { listening: bool },
    #[serde(rename = "speaking_status")]
    SpeakingStatus { speaking: bool },
    #[serde(rename = "voice_settings")]
    VoiceSettings { settings: VoiceSettings },
    #[serde(rename = "error")]
    Error { message: String },
}

impl OutgoingEvent {
    /// Serializes the event for the wire. Serialization of these types
    /// cannot fail in practice; a failure is logged and yields `None`.
    pub fn to_json(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(json) => Some(json),
            Err(e) => {
                tracing::error!("failed to serialize outgoing event: {}", e);
                None
            }
        }
    }
}

/// One registered session: the identity behind it and its outbound channel.
#[derive(Clone)]
struct SessionHandle {
    user_id: String,
    sender: mpsc::Sender<String>,
}

/// Tracks live WebSocket sessions and fans events out to them.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session under its id.
    pub async fn add_session(&self, session_id: String, user_id: String, sender: mpsc::Sender<String>) {
        self.sessions
            .write()
            .await
            .insert(session_id, SessionHandle { user_id, sender });
    }

    /// Removes a session. Removing an unknown id is a no-op.
    pub async fn remove_session(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Sends an event to one session. A slow consumer's message is dropped
    /// rather than blocking the caller.
    pub async fn send(&self, session_id: &str, message_json: String) {
        let sessions = self.sessions.read().await;
        if let Some(handle) = sessions.get(session_id) {
            if let Err(e) = handle.sender.try_send(message_json) {
                tracing::warn!(
                    session_id = %session_id,
                    user_id = %handle.user_id,
                    "dropping event for slow consumer: {}",
                    e
                );
            }
        }
    }

    /// Broadcasts an event to every live session.
    pub async fn broadcast(&self, message_json: String) {
        let sessions = self.sessions.read().await;
        for (session_id, handle) in sessions.iter() {
            if let Err(e) = handle.sender.try_send(message_json.clone()) {
                tracing::warn!(
                    session_id = %session_id,
                    "dropping broadcast event for slow consumer: {}",
                    e
                );
            }
        }
    }
}

/// Sends a typed error event to one session's channel.
fn send_ws_error(tx: &mpsc::Sender<String>, message: String) {
    if let Some(json) = (OutgoingEvent::Error { message }).to_json() {
        if let Err(e) = tx.try_send(json) {
            tracing::warn!("failed to send error event to client: {}", e);
        }
    }
}

/// WebSocket handler: `GET /ws?user_id=...`.
///
/// Client-supplied identities are ignored unless the server is configured to
/// accept them; otherwise every connection gets a fresh server-assigned id.
pub async fn ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    Query(params): Query<WsConnectParams>,
) -> impl IntoResponse {
    let user_id = match params.user_id {
        Some(id) if state.accept_client_user_id && !id.trim().is_empty() => id,
        _ => format!("user-{}", Uuid::new_v4()),
    };

    tracing::info!(user_id = %user_id, remote_addr = %addr, "websocket connect");
    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id))
}

/// Handles one WebSocket connection end to end.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, user_id: String) {
    let session_id = Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();

    // Bounded per-session channel; beyond 256 buffered events the client is
    // too slow and events are dropped.
    let (tx, mut rx) = mpsc::channel::<String>(256);

    state
        .sessions
        .add_session(session_id.clone(), user_id.clone(), tx.clone())
        .await;
    record_session_row(&state, &session_id, &user_id).await;

    // Forward events from the session channel to the socket.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(AxumMessage::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    if let Some(json) = (OutgoingEvent::Connected {
        session_id: session_id.clone(),
        user_id: user_id.clone(),
        timestamp: router::now_rfc3339(),
    })
    .to_json()
    {
        let _ = tx.try_send(json);
    }

    while let Some(Ok(msg)) = receiver.next().await {
        if let AxumMessage::Text(text) = msg {
            match serde_json::from_str::<IncomingEvent>(&text) {
                Ok(incoming) => {
                    // Each event is handled on its own task so the
                    // connection stays responsive (a stop_voice must not
                    // wait behind an outstanding completion call). The
                    // per-conversation lock keeps assistant appends ordered.
                    let state = Arc::clone(&state);
                    let session_id = session_id.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        handle_incoming(&state, &session_id, &tx, incoming).await;
                    });
                }
                Err(_) => {
                    send_ws_error(&tx, "unrecognized event".to_string());
                }
            }
        }
    }

    state.sessions.remove_session(&session_id).await;
    close_session_row(&state, &session_id).await;
    send_task.abort();
    tracing::info!(session_id = %session_id, user_id = %user_id, "websocket disconnect");
}

async fn handle_incoming(
    state: &Arc<AppState>,
    session_id: &str,
    tx: &mpsc::Sender<String>,
    incoming: IncomingEvent,
) {
    match incoming {
        IncomingEvent::SendMessage {
            message,
            conversation_id,
            context_type,
        } => {
            if message.len() > MAX_MESSAGE_TEXT_LEN {
                send_ws_error(tx, "message too long".to_string());
                return;
            }
            let conversation_id =
                conversation_id.unwrap_or_else(|| format!("conv-{session_id}"));

            match router::run_exchange(
                state,
                &conversation_id,
                &message,
                MessageOrigin::Typed,
                context_type,
            )
            .await
            {
                Ok(response) => {
                    if let Some(json) = (OutgoingEvent::AiResponse { data: response }).to_json() {
                        state.sessions.send(session_id, json).await;
                    }
                }
                Err(e) => send_ws_error(tx, e.to_string()),
            }
        }
        IncomingEvent::StartVoice => {
            let settings = state.current_voice_settings();
            // The listening transition itself is broadcast by the voice
            // event forwarder.
            if let Err(e) = state.voice.start_listening(settings).await {
                send_ws_error(tx, e.to_string());
            }
        }
        IncomingEvent::StopVoice => {
            state.voice.stop_listening().await;
        }
        IncomingEvent::Speak { text, interrupt } => {
            if text.trim().is_empty() {
                send_ws_error(tx, "speak text must be non-empty".to_string());
                return;
            }
            let settings = state.current_voice_settings();
            if let Err(e) = state.voice.speak(&text, interrupt, &settings).await {
                send_ws_error(tx, e.to_string());
            }
        }
        IncomingEvent::UpdateVoiceSettings { settings: patch } => {
            match state.update_voice_settings(&patch) {
                Ok(updated) => {
                    if let Some(json) =
                        (OutgoingEvent::VoiceSettings { settings: updated }).to_json()
                    {
                        state.sessions.send(session_id, json).await;
                    }
                }
                Err(e) => send_ws_error(tx, e.to_string()),
            }
        }
    }
}

/// Spawns the forwarder that turns bridge events into session broadcasts.
///
/// Transcripts additionally drive a full voice exchange: broadcast the
/// transcript, run the completion with voice context, broadcast the reply,
/// and speak it back unless it was an apology.
pub fn spawn_voice_forwarder(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    let mut events = state.voice.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "voice event forwarder lagged");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };

            match event {
                VoiceEvent::ListeningChanged(listening) => {
                    if let Some(json) = (OutgoingEvent::VoiceStatus { listening }).to_json() {
                        state.sessions.broadcast(json).await;
                    }
                }
                VoiceEvent::SpeakingChanged(speaking) => {
                    if let Some(json) = (OutgoingEvent::SpeakingStatus { speaking }).to_json() {
                        state.sessions.broadcast(json).await;
                    }
                }
                VoiceEvent::Transcript(text) => {
                    handle_transcript(&state, text).await;
                }
            }
        }
    })
}

async fn handle_transcript(state: &Arc<AppState>, text: String) {
    if let Some(json) = (OutgoingEvent::VoiceInputReceived {
        text: text.clone(),
        timestamp: router::now_rfc3339(),
    })
    .to_json()
    {
        state.sessions.broadcast(json).await;
    }

    let response = match router::run_exchange(
        state,
        VOICE_CONVERSATION_ID,
        &text,
        MessageOrigin::Voice,
        ContextType::Voice,
    )
    .await
    {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(error = %e, "voice transcript rejected");
            return;
        }
    };

    let speak_back = !response.is_degraded();
    let reply_text = response.text.clone();
    if let Some(json) = (OutgoingEvent::AiResponse { data: response }).to_json() {
        state.sessions.broadcast(json).await;
    }

    if speak_back {
        let settings = state.current_voice_settings();
        if let Err(e) = state.voice.speak(&reply_text, false, &settings).await {
            match e {
                VoiceError::EngineUnavailable(_) => {
                    tracing::warn!(error = %e, "could not speak reply");
                }
                _ => tracing::warn!(error = %e, "speak failed"),
            }
        }
    }
}

async fn record_session_row(state: &Arc<AppState>, session_id: &str, user_id: &str) {
    let (sid, uid) = (session_id.to_string(), user_id.to_string());
    if let Err(e) = router::with_conn(state, move |conn| {
        aria_store::record_session(conn, &sid, &uid)
    })
    .await
    {
        tracing::warn!(session_id, error = %e, "failed to record session");
    }
}

async fn close_session_row(state: &Arc<AppState>, session_id: &str) {
    let sid = session_id.to_string();
    if let Err(e) = router::with_conn(state, move |conn| aria_store::close_session(conn, &sid)).await
    {
        tracing::warn!(session_id, error = %e, "failed to close session record");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_broadcast_reaches_all_sessions() {
        let registry = SessionRegistry::new();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);

        registry.add_session("s-a".into(), "u-a".into(), tx_a).await;
        registry.add_session("s-b".into(), "u-b".into(), tx_b).await;

        registry.broadcast("hello".to_string()).await;
        assert_eq!(rx_a.recv().await.as_deref(), Some("hello"));
        assert_eq!(rx_b.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn registry_send_targets_one_session() {
        let registry = SessionRegistry::new();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);

        registry.add_session("s-a".into(), "u-a".into(), tx_a).await;
        registry.add_session("s-b".into(), "u-b".into(), tx_b).await;

        registry.send("s-a", "direct".to_string()).await;
        assert_eq!(rx_a.recv().await.as_deref(), Some("direct"));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn registry_remove_is_idempotent() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = mpsc::channel(8);

        registry.add_session("s-a".into(), "u-a".into(), tx).await;
        assert_eq!(registry.session_count().await, 1);

        registry.remove_session("s-a").await;
        registry.remove_session("s-a").await;
        assert_eq!(registry.session_count().await, 0);
    }

    #[test]
    fn incoming_events_deserialize_by_tag() {
        let send: IncomingEvent = serde_json::from_str(
            r#"{"type": "send_message", "message": "hi", "context_type": "technical"}"#,
        )
        .expect("send_message should parse");
        assert!(matches!(
            send,
            IncomingEvent::SendMessage {
                context_type: ContextType::Technical,
                conversation_id: None,
                ..
            }
        ));

        let start: IncomingEvent =
            serde_json::from_str(r#"{"type": "start_voice"}"#).expect("start_voice should parse");
        assert!(matches!(start, IncomingEvent::StartVoice));

        let speak: IncomingEvent = serde_json::from_str(r#"{"type": "speak", "text": "hello"}"#)
            .expect("speak should parse");
        assert!(matches!(speak, IncomingEvent::Speak { interrupt: false, .. }));
    }

    #[test]
    fn ai_response_event_keeps_both_discriminators() {
        let json = (OutgoingEvent::AiResponse {
            data: AiResponse {
                text: "hi".to_string(),
                conversation_id: "c".to_string(),
                timestamp: router::now_rfc3339(),
                kind: crate::router::ResponseKind::Text,
                metadata: None,
            },
        })
        .to_json()
        .expect("serialization");
        let value: serde_json::Value = serde_json::from_str(&json).expect("valid json");
        assert_eq!(value["type"], "ai_response");
        assert_eq!(value["data"]["type"], "text");
        assert_eq!(value["data"]["text"], "hi");
    }

    #[test]
    fn outgoing_error_event_shape() {
        let json = (OutgoingEvent::Error {
            message: "nope".to_string(),
        })
        .to_json()
        .expect("serialization");
        let value: serde_json::Value = serde_json::from_str(&json).expect("valid json");
        assert_eq!(value["type"], "error");
        assert_eq!(value["message"], "nope");
    }
}
