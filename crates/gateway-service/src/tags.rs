//! Tag Parser (C1 in the component table: `spec.md` §4.1).
//!
//! Scans the last user message only — tags in earlier turns are ignored,
//! per the multi-turn rule. Pure function, trivially unit-tested.

use gateway_core::{ChatMessage, ChatRole};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TagError {
    #[error("malformed routing tag in message")]
    Malformed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeHint {
    PureLlm,
    ResearchRequest,
    ResearchDeeply,
    Autonomous,
    AutonomousPlus,
    None,
}

const RECOGNIZED: &[(&str, ModeHint)] = &[
    ("[[pure_llm]]", ModeHint::PureLlm),
    ("[[research_request]]", ModeHint::ResearchRequest),
    ("[[research_deeply]]", ModeHint::ResearchDeeply),
    ("[[autonomous_plus]]", ModeHint::AutonomousPlus),
    ("[[autonomous]]", ModeHint::Autonomous),
];

/// The well-known opening phrase that identifies IDE-integration system
/// messages; present anywhere in the request forces PureLLM regardless of
/// tags (`spec.md` §4.1).
const IDE_MARKER: &str = "you are an ai programming assistant";

#[derive(Debug, Clone)]
pub struct ParsedTags {
    pub mode_hint: ModeHint,
    pub ide_marker_present: bool,
    pub multimodal: bool,
}

/// Scans `messages` for routing tags and returns the hint plus the message
/// list with the matched tag stripped from the last user message.
pub fn parse_and_strip(messages: &mut [ChatMessage]) -> Result<ParsedTags, TagError> {
    let ide_marker_present = messages.iter().any(|m| {
        m.role == ChatRole::Assistant
            && m.text().to_lowercase().contains(IDE_MARKER)
    });
    let multimodal = messages
        .iter()
        .any(|m| m.content.as_ref().is_some_and(|c| c.is_multimodal()));

    let last_user_idx = messages.iter().rposition(|m| m.role == ChatRole::User);
    let mut mode_hint = ModeHint::None;

    if let Some(idx) = last_user_idx {
        let text = messages[idx].text();
        check_balanced(&text)?;
        for (token, hint) in RECOGNIZED {
            if text.to_lowercase().contains(token) {
                mode_hint = *hint;
                let stripped = strip_case_insensitive(&text, token);
                if let Some(content) = &mut messages[idx].content {
                    content.set_text(stripped.trim().to_string());
                }
                break;
            }
        }
    }

    Ok(ParsedTags {
        mode_hint,
        ide_marker_present,
        multimodal,
    })
}

/// Rejects inputs with unbalanced `[[`/`]]` inside what looks like a routing
/// tag, e.g. `[[research_request]` or `[[pure_llm]]]`.
fn check_balanced(text: &str) -> Result<(), TagError> {
    let mut depth = 0i32;
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '[' && chars.peek() == Some(&'[') {
            chars.next();
            depth += 1;
        } else if c == ']' && chars.peek() == Some(&']') {
            chars.next();
            depth -= 1;
            if depth < 0 {
                return Err(TagError::Malformed);
            }
        }
    }
    if depth != 0 {
        return Err(TagError::Malformed);
    }
    Ok(())
}

fn strip_case_insensitive(text: &str, token: &str) -> String {
    let lower = text.to_lowercase();
    match lower.find(token) {
        Some(pos) => {
            let mut out = String::with_capacity(text.len());
            out.push_str(&text[..pos]);
            out.push_str(&text[pos + token.len()..]);
            out
        }
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(text: &str) -> ChatMessage {
        ChatMessage::user(text)
    }

    #[test]
    fn strips_recognized_tag_case_insensitively() {
        let mut messages = vec![user("[[PURE_LLM]] hello there")];
        let parsed = parse_and_strip(&mut messages).unwrap();
        assert_eq!(parsed.mode_hint, ModeHint::PureLlm);
        assert_eq!(messages[0].text(), "hello there");
    }

    #[test]
    fn ignores_tags_in_earlier_turns() {
        let mut messages = vec![
            user("[[research_deeply]] earlier"),
            ChatMessage::assistant("ok"),
            user("[[autonomous]] latest"),
        ];
        let parsed = parse_and_strip(&mut messages).unwrap();
        assert_eq!(parsed.mode_hint, ModeHint::Autonomous);
        assert_eq!(messages[2].text(), "latest");
        assert!(messages[0].text().contains("research_deeply"));
    }

    #[test]
    fn detects_multimodal_content() {
        use gateway_core::chat::{ContentPart, ImageUrl, MessageContent};
        let mut messages = vec![ChatMessage {
            role: ChatRole::User,
            content: Some(MessageContent::Parts(vec![
                ContentPart::Text { text: "hi".into() },
                ContentPart::ImageUrl {
                    image_url: ImageUrl { url: "http://x/y.png".into() },
                },
            ])),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }];
        let parsed = parse_and_strip(&mut messages).unwrap();
        assert!(parsed.multimodal);
    }

    #[test]
    fn rejects_malformed_tag() {
        let mut messages = vec![user("[[research_request] broken")];
        assert_eq!(parse_and_strip(&mut messages), Err(TagError::Malformed));
    }

    #[test]
    fn ide_marker_detected_on_assistant_message() {
        let mut messages = vec![
            ChatMessage::assistant("You are an AI programming assistant."),
            user("[[research_deeply]] hello"),
        ];
        let parsed = parse_and_strip(&mut messages).unwrap();
        assert!(parsed.ide_marker_present);
    }
}
