use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

// Matched in order; the first prefix match wins.
pub const ENVELOPE_CHANNELS: &[&str] = &[
    "WebChat",
    "WhatsApp",
    "Telegram",
    "Signal",
    "Slack",
    "Discord",
    "iMessage",
    "Teams",
    "Matrix",
    "Zalo",
    "Zalo Personal",
    "BlueBubbles",
];

// Placeholder replies that mean "no reply".
pub const CHAT_SENTINELS: &[&str] = &["NO_", "NO", "NO_REPLY"];

const MESSAGE_TEXT_CAP: usize = 500;

fn envelope_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\[([^\]]+)\]\s*").expect("valid regex"))
}

fn agent_session_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^agent:([^:]+):").expect("valid regex"))
}

pub fn is_chat_sentinel(text: &str) -> bool {
    CHAT_SENTINELS.contains(&text)
}

pub fn extract_agent_id(payload: &Value) -> Option<String> {
    if let Some(key) = payload.get("sessionKey").and_then(Value::as_str) {
        if let Some(id) = agent_session_re().captures(key).and_then(|c| c.get(1)) {
            return Some(id.as_str().to_string());
        }
    }
    let direct = payload.get("agentId").and_then(Value::as_str)?.trim();
    if direct.is_empty() {
        return None;
    }
    Some(direct.to_string())
}

pub fn extract_channel_from_envelope(text: &str) -> Option<&'static str> {
    let captures = envelope_prefix_re().captures(text)?;
    let header = captures.get(1)?.as_str();
    ENVELOPE_CHANNELS.iter().copied().find(|&ch| {
        header
            .strip_prefix(ch)
            .map_or(false, |rest| rest.is_empty() || rest.starts_with(' '))
    })
}

pub fn strip_envelope(text: &str) -> String {
    envelope_prefix_re().replace(text, "").into_owned()
}

pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push('\u{2026}');
    out
}

pub fn extract_message_text(message: &Value) -> Option<String> {
    if !message.is_object() {
        return None;
    }
    match message.get("content") {
        Some(Value::String(text)) => return clean_text(text),
        Some(Value::Array(blocks)) => {
            for block in blocks {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    if let Some(cleaned) = clean_text(text) {
                        return Some(cleaned);
                    }
                }
            }
        }
        _ => {}
    }
    message
        .get("text")
        .and_then(Value::as_str)
        .and_then(clean_text)
}

fn clean_text(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() || is_chat_sentinel(trimmed) {
        return None;
    }
    Some(trimmed.chars().take(MESSAGE_TEXT_CAP).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_string_content() {
        let message = json!({"content": "  hello there  "});
        assert_eq!(extract_message_text(&message).as_deref(), Some("hello there"));
    }

    #[test]
    fn caps_string_content_length() {
        let message = json!({"content": "a".repeat(600)});
        let text = extract_message_text(&message).expect("text");
        assert_eq!(text.chars().count(), 500);
    }

    #[test]
    fn sentinel_string_content_does_not_fall_through() {
        let message = json!({"content": "NO_", "text": "fallback"});
        assert_eq!(extract_message_text(&message), None);
        let message = json!({"content": "   ", "text": "fallback"});
        assert_eq!(extract_message_text(&message), None);
    }

    #[test]
    fn picks_first_usable_content_block() {
        let message = json!({"content": [
            {"type": "image"},
            "bare string block",
            {"type": "text", "text": "  "},
            {"type": "text", "text": "NO_REPLY"},
            {"type": "text", "text": "first real"},
            {"type": "text", "text": "second"}
        ]});
        assert_eq!(extract_message_text(&message).as_deref(), Some("first real"));
    }

    #[test]
    fn block_array_falls_back_to_text_field() {
        let message = json!({"content": [{"type": "image"}], "text": "plain text"});
        assert_eq!(extract_message_text(&message).as_deref(), Some("plain text"));
    }

    #[test]
    fn non_object_messages_have_no_text() {
        assert_eq!(extract_message_text(&json!("just a string")), None);
        assert_eq!(extract_message_text(&json!(null)), None);
        assert_eq!(extract_message_text(&json!({})), None);
    }

    #[test]
    fn extracts_known_channel_from_envelope() {
        assert_eq!(
            extract_channel_from_envelope("[Telegram chat +0s] Hello agent"),
            Some("Telegram")
        );
        assert_eq!(extract_channel_from_envelope("[Slack] ping"), Some("Slack"));
        assert_eq!(extract_channel_from_envelope("[Carrier Pigeon] hi"), None);
        assert_eq!(extract_channel_from_envelope("no envelope here"), None);
    }

    #[test]
    fn zalo_personal_resolves_to_first_list_match() {
        assert_eq!(
            extract_channel_from_envelope("[Zalo Personal thread] hi"),
            Some("Zalo")
        );
    }

    #[test]
    fn strips_leading_envelope_only() {
        assert_eq!(strip_envelope("[Telegram chat] Hello"), "Hello");
        assert_eq!(strip_envelope("Hello [not an envelope]"), "Hello [not an envelope]");
    }

    #[test]
    fn truncate_appends_ellipsis_when_cut() {
        assert_eq!(truncate("short", 60), "short");
        let cut = truncate(&"x".repeat(80), 60);
        assert_eq!(cut.chars().count(), 61);
        assert!(cut.ends_with('\u{2026}'));
    }

    #[test]
    fn agent_id_prefers_session_key() {
        let payload = json!({"sessionKey": "agent:w1le:main", "agentId": "other"});
        assert_eq!(extract_agent_id(&payload).as_deref(), Some("w1le"));
    }

    #[test]
    fn agent_id_falls_back_to_payload_field() {
        let payload = json!({"sessionKey": "agent:w1le", "agentId": "  sabine  "});
        assert_eq!(extract_agent_id(&payload).as_deref(), Some("sabine"));
        assert_eq!(extract_agent_id(&json!({"agentId": ""})), None);
        assert_eq!(extract_agent_id(&json!({})), None);
    }
}
