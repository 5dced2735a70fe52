//! Conversation persistence for the Aria server.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization,
//! embedded SQL migrations, and the conversation store adapter: append-only
//! message records keyed by conversation id, read back in ascending
//! timestamp order, plus connection session bookkeeping.
//!
//! # Design decisions
//!
//! - **SQLite with WAL mode**: a single-process chat server needs no
//!   external database; WAL allows history reads concurrent with appends.
//! - **Append-only messages**: rows are never updated or deleted, so the
//!   adapter exposes no mutation beyond `append_message`.
//! - **Monotonic timestamps**: the adapter clamps each append's timestamp to
//!   the conversation's last timestamp, so ordering survives clock slew.

mod migrations;
mod pool;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};

use aria_types::{CompletionMetadata, Message, MessageOrigin, Sender};
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("message text must be non-empty")]
    EmptyText,
    #[error("json serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt record: {0}")]
    CorruptRecord(String),
}

/// Parameters for appending a message to a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendMessageParams {
    pub conversation_id: String,
    pub sender: Sender,
    pub text: String,
    pub origin: MessageOrigin,
    pub metadata: Option<CompletionMetadata>,
}

/// Per-conversation message counts backing the conversations endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationStats {
    pub total_messages: u32,
    pub user_messages: u32,
    pub assistant_messages: u32,
}

/// Whole-store usage aggregates backing the analytics endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyticsSummary {
    pub total_conversations: u32,
    pub total_messages: u32,
    pub voice_messages: u32,
    pub typed_messages: u32,
    /// Timestamp of the oldest stored message, `None` on an empty store.
    pub first_message_at: Option<String>,
    /// Timestamp of the newest stored message, `None` on an empty store.
    pub last_message_at: Option<String>,
}

/// Current UTC time as a fixed-width RFC 3339 string.
///
/// Microsecond precision with a literal `Z` suffix, so lexicographic order
/// matches chronological order in SQL comparisons.
fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Appends a message to a conversation.
///
/// Rejects empty (or whitespace-only) text for user and assistant turns
/// without touching the store. The stored timestamp is clamped to the
/// conversation's newest existing timestamp so that history order is
/// non-decreasing even if the wall clock steps backwards.
pub fn append_message(
    conn: &Connection,
    params: &AppendMessageParams,
) -> Result<Message, StoreError> {
    if matches!(params.sender, Sender::User | Sender::Assistant) && params.text.trim().is_empty() {
        return Err(StoreError::EmptyText);
    }

    let last_created: Option<String> = conn
        .query_row(
            "SELECT MAX(created_at) FROM messages WHERE conversation_id = ?1",
            [&params.conversation_id],
            |row| row.get(0),
        )
        .optional()?
        .flatten();

    let mut created_at = now_rfc3339();
    if let Some(last) = last_created {
        if last > created_at {
            created_at = last;
        }
    }

    let message_id = Uuid::new_v4().to_string();
    let metadata_json = params
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    let message = conn.query_row(
        "INSERT INTO messages (
            message_id, conversation_id, sender, text, origin, created_at, metadata_json
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        RETURNING id, message_id, conversation_id, sender, text, origin, created_at, metadata_json",
        params![
            message_id,
            params.conversation_id,
            params.sender.label(),
            params.text,
            params.origin.label(),
            created_at,
            metadata_json,
        ],
        map_row_to_message,
    )?;

    Ok(message)
}

/// Reads a conversation's history in ascending timestamp order.
///
/// `limit` caps the result to the *most recent* messages while preserving
/// ascending order; `None` returns the full history.
pub fn conversation_history(
    conn: &Connection,
    conversation_id: &str,
    limit: Option<u32>,
) -> Result<Vec<Message>, StoreError> {
    let sql = match limit {
        Some(n) => format!(
            "SELECT id, message_id, conversation_id, sender, text, origin, created_at, metadata_json
             FROM (
                 SELECT * FROM messages
                 WHERE conversation_id = ?1
                 ORDER BY created_at DESC, id DESC
                 LIMIT {}
             ) ORDER BY created_at ASC, id ASC",
            n
        ),
        None => "SELECT id, message_id, conversation_id, sender, text, origin, created_at, metadata_json
                 FROM messages
                 WHERE conversation_id = ?1
                 ORDER BY created_at ASC, id ASC"
            .to_string(),
    };

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([conversation_id], map_row_to_message)?;

    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?);
    }
    Ok(messages)
}

/// Counts messages in a conversation by sender.
pub fn conversation_stats(
    conn: &Connection,
    conversation_id: &str,
) -> Result<ConversationStats, StoreError> {
    let stats = conn.query_row(
        "SELECT
            COUNT(*),
            COALESCE(SUM(sender = 'user'), 0),
            COALESCE(SUM(sender = 'assistant'), 0)
         FROM messages WHERE conversation_id = ?1",
        [conversation_id],
        |row| {
            Ok(ConversationStats {
                total_messages: row.get(0)?,
                user_messages: row.get(1)?,
                assistant_messages: row.get(2)?,
            })
        },
    )?;
    Ok(stats)
}

/// Aggregates usage across the whole store.
pub fn analytics_summary(conn: &Connection) -> Result<AnalyticsSummary, StoreError> {
    let summary = conn.query_row(
        "SELECT
            COUNT(DISTINCT conversation_id),
            COUNT(*),
            COALESCE(SUM(origin = 'voice'), 0),
            COALESCE(SUM(origin = 'typed'), 0),
            MIN(created_at),
            MAX(created_at)
         FROM messages",
        [],
        |row| {
            Ok(AnalyticsSummary {
                total_conversations: row.get(0)?,
                total_messages: row.get(1)?,
                voice_messages: row.get(2)?,
                typed_messages: row.get(3)?,
                first_message_at: row.get(4)?,
                last_message_at: row.get(5)?,
            })
        },
    )?;
    Ok(summary)
}

/// Records a new connection session.
pub fn record_session(
    conn: &Connection,
    session_id: &str,
    user_id: &str,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO sessions (session_id, user_id, connected_at) VALUES (?1, ?2, ?3)",
        params![session_id, user_id, now_rfc3339()],
    )?;
    Ok(())
}

/// Marks a session as disconnected. Idempotent: closing an unknown or
/// already-closed session is not an error.
pub fn close_session(conn: &Connection, session_id: &str) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE sessions SET disconnected_at = ?2
         WHERE session_id = ?1 AND disconnected_at IS NULL",
        params![session_id, now_rfc3339()],
    )?;
    Ok(())
}

fn map_row_to_message(row: &Row) -> rusqlite::Result<Message> {
    let sender_label: String = row.get(3)?;
    let origin_label: String = row.get(5)?;
    let metadata_json: Option<String> = row.get(7)?;

    let sender = Sender::from_label(&sender_label).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown sender label: {sender_label}").into(),
        )
    })?;
    let origin = MessageOrigin::from_label(&origin_label).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            format!("unknown origin label: {origin_label}").into(),
        )
    })?;
    let metadata = match metadata_json {
        Some(json) => Some(serde_json::from_str(&json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                7,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })?),
        None => None,
    };

    Ok(Message {
        id: row.get(0)?,
        message_id: row.get(1)?,
        conversation_id: row.get(2)?,
        sender,
        text: row.get(4)?,
        origin,
        created_at: row.get(6)?,
        metadata,
    })
}
