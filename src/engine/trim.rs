//! Deterministic context trimming.
//!
//! The message list is split into a system prefix (never trimmed) and
//! user-turn segments: a user message plus everything that follows it up to
//! the next user message. Trimming drops whole segments, oldest first, until
//! the list fits the configured turn count and character budget.

use crate::llm::{ChatMessage, Role};

fn message_text_length(msg: &ChatMessage) -> usize {
    msg.content.len()
}

/// Split into (leading system messages, user-turn segments).
pub fn split_segments(messages: &[ChatMessage]) -> (Vec<ChatMessage>, Vec<Vec<ChatMessage>>) {
    let mut idx = 0;
    while idx < messages.len() && messages[idx].role == Role::System {
        idx += 1;
    }
    let system_msgs = messages[..idx].to_vec();

    let mut segments: Vec<Vec<ChatMessage>> = Vec::new();
    let mut current: Vec<ChatMessage> = Vec::new();
    for msg in &messages[idx..] {
        if msg.role == Role::User {
            if !current.is_empty() {
                segments.push(std::mem::take(&mut current));
            }
            current.push(msg.clone());
        } else {
            current.push(msg.clone());
        }
    }
    if !current.is_empty() {
        segments.push(current);
    }

    (system_msgs, segments)
}

/// Trim by user turns and/or char budget. Zero disables a bound.
pub fn trim_messages(
    messages: &[ChatMessage],
    max_user_turns: usize,
    max_chars: usize,
) -> Vec<ChatMessage> {
    if max_user_turns == 0 && max_chars == 0 {
        return messages.to_vec();
    }

    let (system_msgs, mut segments) = split_segments(messages);

    if max_user_turns > 0 && !segments.is_empty() {
        let is_user_segment =
            |seg: &[ChatMessage]| seg.first().map(|m| m.role == Role::User).unwrap_or(false);
        let mut user_segments = segments.iter().filter(|s| is_user_segment(s)).count();
        while user_segments > max_user_turns && segments.len() > 1 {
            let dropped = segments.remove(0);
            if is_user_segment(&dropped) {
                user_segments -= 1;
            }
        }
    }

    if max_chars > 0 {
        let total = |system: &[ChatMessage], segments: &[Vec<ChatMessage>]| -> usize {
            system.iter().map(message_text_length).sum::<usize>()
                + segments
                    .iter()
                    .flat_map(|s| s.iter())
                    .map(message_text_length)
                    .sum::<usize>()
        };
        while total(&system_msgs, &segments) > max_chars && segments.len() > 1 {
            segments.remove(0);
        }
    }

    let mut trimmed = system_msgs;
    for seg in segments {
        trimmed.extend(seg);
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation() -> Vec<ChatMessage> {
        vec![
            ChatMessage::system("instructions"),
            ChatMessage::user("turn one"),
            ChatMessage::assistant("answer one"),
            ChatMessage::user("turn two"),
            ChatMessage::assistant("answer two"),
            ChatMessage::user("turn three"),
            ChatMessage::assistant("answer three"),
        ]
    }

    #[test]
    fn test_split_keeps_system_prefix() {
        let (system, segments) = split_segments(&conversation());
        assert_eq!(system.len(), 1);
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0][0].content, "turn one");
    }

    #[test]
    fn test_trim_by_user_turns_drops_oldest() {
        let trimmed = trim_messages(&conversation(), 2, 0);
        assert_eq!(trimmed[0].role, Role::System);
        assert_eq!(trimmed[1].content, "turn two");
        assert_eq!(trimmed.len(), 5);
    }

    #[test]
    fn test_trim_by_chars_never_touches_system() {
        let trimmed = trim_messages(&conversation(), 0, 40);
        assert_eq!(trimmed[0].role, Role::System);
        // Always keeps at least the newest segment.
        assert!(trimmed.iter().any(|m| m.content == "turn three"));
        assert!(!trimmed.iter().any(|m| m.content == "turn one"));
    }

    #[test]
    fn test_trim_is_deterministic(){
        let a = trim_messages(&conversation(), 2, 60);
        let b = trim_messages(&conversation(), 2, 60);
        let a_contents: Vec<&str> = a.iter().map(|m| m.content.as_str()).collect();
        let b_contents: Vec<&str> = b.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(a_contents, b_contents);
    }

    #[test]
    fn test_zero_bounds_disable_trimming() {
        assert_eq!(trim_messages(&conversation(), 0, 0).len(), 7);
    }

    #[test]
    fn test_orphan_assistant_prefix_forms_segment() {
        // A thread resumed mid-turn can start with non-user messages.
        let messages = vec![
            ChatMessage::system("s"),
            ChatMessage::assistant("dangling"),
            ChatMessage::user("turn"),
        ];
        let (_, segments) = split_segments(&messages);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0][0].content, "dangling");
    }
}
