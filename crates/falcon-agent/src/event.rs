use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single JSONL event emitted by the codex CLI (`codex exec --json`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum CodexEvent {
    #[serde(rename = "item.started")]
    ItemStarted(ItemEvent),

    #[serde(rename = "item.completed")]
    ItemCompleted(ItemEvent),

    #[serde(rename = "turn.completed")]
    TurnCompleted(TurnEvent),

    /// Any event type not explicitly handled above.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ItemEvent {
    pub item: Option<Item>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Item {
    pub item_type: Option<String>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TurnEvent {
    pub usage: Option<Value>,
}

/// The final agent message: the text of the last completed `message` item,
/// or a concatenation of every completed item's text as fallback.
pub fn extract_final_message(events: &[Value]) -> String {
    for event in events.iter().rev() {
        let Ok(CodexEvent::ItemCompleted(e)) = serde_json::from_value(event.clone()) else {
            continue;
        };
        if let Some(item) = e.item {
            if item.item_type.as_deref() == Some("message") {
                if let Some(text) = item.text {
                    return text;
                }
            }
        }
    }

    let mut parts = Vec::new();
    for event in events {
        let Ok(CodexEvent::ItemCompleted(e)) = serde_json::from_value(event.clone()) else {
            continue;
        };
        if let Some(item) = e.item {
            if let Some(text) = item.text {
                parts.push(text);
            }
        }
    }
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn last_completed_message_wins() {
        let events = vec![
            json!({ "type": "item.completed", "item": { "item_type": "message", "text": "first" } }),
            json!({ "type": "item.started", "item": { "item_type": "message" } }),
            json!({ "type": "item.completed", "item": { "item_type": "message", "text": "last" } }),
        ];
        assert_eq!(extract_final_message(&events), "last");
    }

    #[test]
    fn falls_back_to_concatenating_item_texts() {
        let events = vec![
            json!({ "type": "item.completed", "item": { "item_type": "command", "text": "ls -la" } }),
            json!({ "type": "item.completed", "item": { "item_type": "reasoning", "text": "thinking" } }),
        ];
        assert_eq!(extract_final_message(&events), "ls -la\nthinking");
    }

    #[test]
    fn unknown_events_are_ignored() {
        let events = vec![
            json!({ "type": "session.started", "session_id": "abc" }),
            json!({ "type": "item.completed", "item": { "item_type": "message", "text": "hi" } }),
        ];
        assert_eq!(extract_final_message(&events), "hi");
    }

    #[test]
    fn empty_stream_yields_empty_message() {
        assert_eq!(extract_final_message(&[]), "");
    }
}
