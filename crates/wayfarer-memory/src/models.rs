use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    /// Compact audit record of one tool call made during a turn.
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Tool => "tool",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            "tool" => Some(Self::Tool),
            _ => None,
        }
    }
}

/// Durable thread of messages for exactly one user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: Uuid,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Session-level facts such as locale or unit preference.
    pub context: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCallRecord {
    pub tool: String,
    /// Redacted, truncated rendering of the arguments.
    pub args_summary: String,
    pub ok: bool,
    pub result_preview: String,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub tool_call: Option<ToolCallRecord>,
}

impl NewMessage {
    pub fn text(conversation_id: Uuid, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            conversation_id,
            role,
            content: content.into(),
            tool_call: None,
        }
    }

    pub fn tool(conversation_id: Uuid, record: ToolCallRecord) -> Self {
        let status = if record.ok { "ok" } else { "error" };
        Self {
            conversation_id,
            role: MessageRole::Tool,
            content: format!("{} ({status})", record.tool),
            tool_call: Some(record),
        }
    }
}

/// An immutable persisted message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub seq: i64,
    pub role: MessageRole,
    pub content: String,
    pub tool_call: Option<ToolCallRecord>,
    pub created_at: DateTime<Utc>,
}
