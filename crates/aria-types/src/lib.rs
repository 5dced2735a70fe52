//! Shared types, error definitions, and constants for the Aria server.
//!
//! This crate provides the foundational types used across all Aria crates:
//! conversation messages, completion metadata, context-type selectors, and
//! voice settings. No crate in the workspace depends on anything *except*
//! `aria-types` for cross-cutting type definitions, which keeps the
//! dependency graph clean and prevents circular dependencies.

pub mod voice;

use serde::{Deserialize, Serialize};

pub use voice::{SettingsError, VoiceSettings, VoiceSettingsPatch};

/// Who produced a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    /// A human participant.
    User,
    /// The AI assistant.
    Assistant,
    /// A platform-generated turn (announcements, notices).
    System,
}

impl Sender {
    /// Returns the string label stored in the database.
    pub fn label(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    /// Parses a database label back into a `Sender`.
    ///
    /// Returns `None` for unrecognized labels.
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// How a user turn was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageOrigin {
    /// Typed into the chat box.
    #[default]
    Typed,
    /// Produced by speech transcription.
    Voice,
}

impl MessageOrigin {
    pub fn label(self) -> &'static str {
        match self {
            Self::Typed => "typed",
            Self::Voice => "voice",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "typed" => Some(Self::Typed),
            "voice" => Some(Self::Voice),
            _ => None,
        }
    }
}

/// Selector for the system instruction prefixed to a completion prompt.
///
/// Unknown values deserialize as `Default` so older clients keep working
/// when new context types are added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextType {
    /// Full conversational responses.
    #[default]
    Default,
    /// Short, speech-friendly phrasing suitable for text-to-speech.
    Voice,
    /// Detailed technical responses with code examples where helpful.
    Technical,
}

impl ContextType {
    pub fn label(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Voice => "voice",
            Self::Technical => "technical",
        }
    }

    /// Parses a context-type label; anything unrecognized is `Default`.
    pub fn parse(label: &str) -> Self {
        match label {
            "voice" => Self::Voice,
            "technical" => Self::Technical,
            _ => Self::Default,
        }
    }
}

impl<'de> Deserialize<'de> for ContextType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let label = String::deserialize(deserializer)?;
        Ok(Self::parse(&label))
    }
}

/// Usage metadata attached to assistant messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionMetadata {
    /// Model identifier reported by the completion service.
    pub model: String,
    /// Tokens consumed by the prompt.
    pub prompt_tokens: u32,
    /// Tokens produced in the completion.
    pub completion_tokens: u32,
    /// Total tokens billed for the exchange.
    pub total_tokens: u32,
    /// Wall-clock latency of the completion call, in milliseconds.
    pub response_time_ms: u64,
}

/// One turn in a conversation.
///
/// Messages are immutable once appended to the store; deletion is a
/// client-side concern and never retracts the persisted record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Internal database ID.
    pub id: i64,
    /// Unique public ID of the message (uuid).
    pub message_id: String,
    /// Conversation grouping key.
    pub conversation_id: String,
    /// Who produced the turn.
    pub sender: Sender,
    /// Message body. Non-empty for user/assistant turns.
    pub text: String,
    /// Whether the text was typed or transcribed from speech.
    pub origin: MessageOrigin,
    /// Creation timestamp (RFC 3339). Non-decreasing within a conversation.
    pub created_at: String,
    /// Usage metadata; present on assistant messages only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<CompletionMetadata>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_labels_round_trip() {
        for sender in [Sender::User, Sender::Assistant, Sender::System] {
            assert_eq!(Sender::from_label(sender.label()), Some(sender));
        }
        assert_eq!(Sender::from_label("robot"), None);
    }

    #[test]
    fn origin_labels_round_trip() {
        for origin in [MessageOrigin::Typed, MessageOrigin::Voice] {
            assert_eq!(MessageOrigin::from_label(origin.label()), Some(origin));
        }
        assert_eq!(MessageOrigin::from_label(""), None);
    }

    #[test]
    fn unknown_context_type_falls_back_to_default() {
        let parsed: ContextType = serde_json::from_str("\"enhanced\"").expect("should deserialize");
        assert_eq!(parsed, ContextType::Default);

        let voice: ContextType = serde_json::from_str("\"voice\"").expect("should deserialize");
        assert_eq!(voice, ContextType::Voice);
    }

    #[test]
    fn metadata_omitted_when_absent() {
        let msg = Message {
            id: 1,
            message_id: "m-1".to_string(),
            conversation_id: "c-1".to_string(),
            sender: Sender::User,
            text: "hello".to_string(),
            origin: MessageOrigin::Typed,
            created_at: "2025-01-01T00:00:00Z".to_string(),
            metadata: None,
        };

        let json = serde_json::to_value(&msg).expect("serialization should not fail");
        assert!(json.get("metadata").is_none());
        assert_eq!(json["sender"], "user");
        assert_eq!(json["origin"], "typed");
    }
}
