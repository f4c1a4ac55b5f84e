//! Message and content-block domain types.
//!
//! These are the value objects that flow through the assistant core:
//! the user sends a message → the agent loop extends history → the provider
//! answers with content blocks → tool results feed back as a new message.
//!
//! Messages are immutable once written. "Update" always means appending a new
//! message, never mutating an existing one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The role of a message sender in a conversation.
///
/// Tool results travel inside a `User` message as `ToolResult` blocks, so
/// there is no separate tool role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user (practitioner or staff member)
    User,
    /// The AI assistant
    Assistant,
}

impl Role {
    /// The wire name used in stored rows and provider requests.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    /// Parse a stored role string. Unknown strings are `None` so callers can
    /// skip the row instead of failing the whole load.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/// One discrete unit of a message's payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Literal text.
    Text { text: String },

    /// A request by the model to invoke a tool.
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    /// The answer to a prior tool invocation. `tool_use_id` must match a
    /// `ToolUse` block in the immediately preceding assistant message —
    /// this is how the provider correlates calls to results.
    ToolResult { tool_use_id: String, content: String },
}

/// A message payload: either a plain string or an ordered block sequence.
///
/// The untagged representation matches the provider wire format, so stored
/// payloads and request bodies serialize identically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Concatenate all literal text in this payload, in order.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect(),
        }
    }

    /// The tool invocations in this payload, in block order.
    pub fn tool_uses(&self) -> Vec<&ContentBlock> {
        match self {
            MessageContent::Text(_) => Vec::new(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter(|b| matches!(b, ContentBlock::ToolUse { .. }))
                .collect(),
        }
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Who sent this message
    pub role: Role,

    /// The structured payload used to resume model context
    pub content: MessageContent,

    /// Optional human-readable string for UI replay, distinct from the
    /// structured payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,

    /// Timestamp
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Create a plain-text user message.
    pub fn user(content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            role: Role::User,
            display: Some(content.clone()),
            content: MessageContent::Text(content),
            created_at: Utc::now(),
        }
    }

    /// Create a user message carrying content blocks (tool results).
    pub fn user_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            display: None,
            content: MessageContent::Blocks(blocks),
            created_at: Utc::now(),
        }
    }

    /// Create an assistant message from the blocks a provider turn produced.
    /// The display string is the concatenated text, if there is any.
    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        let content = MessageContent::Blocks(blocks);
        let text = content.text();
        Self {
            role: Role::Assistant,
            display: if text.is_empty() { None } else { Some(text) },
            content,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn create_user_message() {
        let msg = Message::user("What did Maria eat this week?");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content.text(), "What did Maria eat this week?");
        assert_eq!(msg.display.as_deref(), Some("What did Maria eat this week?"));
    }

    #[test]
    fn assistant_display_from_text_blocks() {
        let msg = Message::assistant_blocks(vec![
            ContentBlock::Text {
                text: "Let me check ".into(),
            },
            ContentBlock::ToolUse {
                id: "tu_1".into(),
                name: "list_meal_plans".into(),
                input: json!({"client_id": 4}),
            },
            ContentBlock::Text {
                text: "her plan.".into(),
            },
        ]);
        assert_eq!(msg.display.as_deref(), Some("Let me check her plan."));
        assert_eq!(msg.content.tool_uses().len(), 1);
    }

    #[test]
    fn assistant_without_text_has_no_display() {
        let msg = Message::assistant_blocks(vec![ContentBlock::ToolUse {
            id: "tu_1".into(),
            name: "get_client".into(),
            input: json!({}),
        }]);
        assert!(msg.display.is_none());
    }

    #[test]
    fn role_parse_round_trip() {
        assert_eq!(Role::parse("user"), Some(Role::User));
        assert_eq!(Role::parse("assistant"), Some(Role::Assistant));
        assert_eq!(Role::parse("system"), None);
        assert_eq!(Role::parse(Role::Assistant.as_str()), Some(Role::Assistant));
    }

    #[test]
    fn plain_text_content_serializes_as_string() {
        let content = MessageContent::Text("hello".into());
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json, json!("hello"));
    }

    #[test]
    fn block_content_round_trip() {
        let content = MessageContent::Blocks(vec![
            ContentBlock::Text {
                text: "Checking the schedule.".into(),
            },
            ContentBlock::ToolUse {
                id: "tu_42".into(),
                name: "list_appointments".into(),
                input: json!({"from": "2026-08-24", "to": "2026-08-31"}),
            },
        ]);
        let json = serde_json::to_string(&content).unwrap();
        let back: MessageContent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, content);
    }

    #[test]
    fn tool_result_block_round_trip() {
        let content = MessageContent::Blocks(vec![ContentBlock::ToolResult {
            tool_use_id: "tu_42".into(),
            content: "[{\"client\":\"Maria\"}]".into(),
        }]);
        let json = serde_json::to_string(&content).unwrap();
        assert!(json.contains(r#""type":"tool_result""#));
        let back: MessageContent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, content);
    }

    #[test]
    fn string_payload_round_trip() {
        let content = MessageContent::Text("plain".into());
        let json = serde_json::to_string(&content).unwrap();
        let back: MessageContent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, content);
    }
}
