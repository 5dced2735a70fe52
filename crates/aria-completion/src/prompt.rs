//! Prompt assembly: context-specific system instructions plus a bounded
//! window of conversation history, in OpenAI chat format.

use aria_types::{ContextType, Message, Sender};

use crate::transport::ChatMessage;

const DEFAULT_INSTRUCTIONS: &str = "You are Aria, an advanced AI assistant with a futuristic \
personality. You are helpful, intelligent, and slightly mysterious. Keep responses concise but \
informative. You have access to real-time capabilities and can process voice commands. Always \
maintain a professional yet engaging tone. You can remember context from previous messages.";

const VOICE_INSTRUCTIONS: &str = "You are Aria, an advanced AI assistant optimized for voice \
interaction. Keep responses brief and conversational, suitable for text-to-speech. Avoid using \
special characters, markdown, or complex formatting. Speak naturally as if having a conversation.";

const TECHNICAL_INSTRUCTIONS: &str = "You are Aria, a technical AI assistant specializing in \
programming and technology. Provide detailed, accurate technical information. Use code examples \
when helpful. Explain complex concepts clearly and offer practical solutions.";

/// Returns the system instructions for a context type.
pub fn system_instructions(context: ContextType) -> &'static str {
    match context {
        ContextType::Default => DEFAULT_INSTRUCTIONS,
        ContextType::Voice => VOICE_INSTRUCTIONS,
        ContextType::Technical => TECHNICAL_INSTRUCTIONS,
    }
}

fn role_for(sender: Sender) -> &'static str {
    match sender {
        Sender::User => "user",
        Sender::Assistant => "assistant",
        Sender::System => "system",
    }
}

/// Builds the chat message list for a completion request.
///
/// System instructions first, then the last `history_window` stored turns,
/// then the current (trimmed) user text.
pub fn build_messages(
    history: &[Message],
    user_text: &str,
    context: ContextType,
    history_window: usize,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history_window + 2);
    messages.push(ChatMessage {
        role: "system".to_string(),
        content: system_instructions(context).to_string(),
    });

    let start = history.len().saturating_sub(history_window);
    for turn in &history[start..] {
        messages.push(ChatMessage {
            role: role_for(turn.sender).to_string(),
            content: turn.text.clone(),
        });
    }

    messages.push(ChatMessage {
        role: "user".to_string(),
        content: user_text.trim().to_string(),
    });

    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use aria_types::MessageOrigin;

    fn message(sender: Sender, text: &str) -> Message {
        Message {
            id: 0,
            message_id: "m".to_string(),
            conversation_id: "c".to_string(),
            sender,
            text: text.to_string(),
            origin: MessageOrigin::Typed,
            created_at: "2026-01-01T00:00:00.000000Z".to_string(),
            metadata: None,
        }
    }

    #[test]
    fn history_window_keeps_most_recent_turns() {
        let history: Vec<Message> = (0..6)
            .map(|i| message(Sender::User, &format!("turn {i}")))
            .collect();

        let messages = build_messages(&history, "now", ContextType::Default, 3);

        // system + 3 history turns + current user text
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].content, "turn 3");
        assert_eq!(messages[3].content, "turn 5");
        assert_eq!(messages[4].content, "now");
    }

    #[test]
    fn current_text_is_trimmed() {
        let messages = build_messages(&[], "  hello  ", ContextType::Default, 10);
        assert_eq!(messages.last().map(|m| m.content.as_str()), Some("hello"));
    }

    #[test]
    fn voice_context_selects_speech_friendly_instructions() {
        let messages = build_messages(&[], "hi", ContextType::Voice, 10);
        assert!(messages[0].content.contains("text-to-speech"));
    }

    #[test]
    fn sender_roles_map_to_chat_roles() {
        let history = vec![
            message(Sender::User, "q"),
            message(Sender::Assistant, "a"),
        ];
        let messages = build_messages(&history, "next", ContextType::Default, 10);
        assert_eq!(messages[1].role, "user");
        assert_eq!(messages[2].role, "assistant");
    }
}
