use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmMessage {
    pub role: String,
    pub content: Vec<ContentBlock>,
}

impl LlmMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    /// Tool results go back to the model in a user-role message.
    pub fn tool_results(results: Vec<ContentBlock>) -> Self {
        Self {
            role: "user".into(),
            content: results,
        }
    }

    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn tool_uses(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<LlmMessage>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDef>,
}

pub(crate) fn default_max_tokens() -> u32 {
    2048
}

impl LlmRequest {
    pub fn simple(model: String, system: Option<String>, user: String) -> Self {
        Self {
            model,
            system,
            messages: vec![LlmMessage::user(user)],
            max_tokens: default_max_tokens(),
            tools: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    pub content: Vec<ContentBlock>,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub stop_reason: Option<String>,
}

impl LlmResponse {
    pub fn text_only(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            content: vec![ContentBlock::Text { text: text.clone() }],
            text,
            input_tokens: None,
            output_tokens: None,
            stop_reason: Some("end_turn".into()),
        }
    }

    /// True when the model stopped to request one or more tool calls.
    pub fn wants_tools(&self) -> bool {
        self.stop_reason.as_deref() == Some("tool_use")
            && self
                .content
                .iter()
                .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
    }

    pub fn into_assistant_message(self) -> LlmMessage {
        LlmMessage {
            role: "assistant".into(),
            content: self.content,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_block_tool_use_serde() {
        let block = ContentBlock::ToolUse {
            id: "toolu_123".into(),
            name: "convert_units".into(),
            input: serde_json::json!({"value": 10, "from": "km", "to": "mi"}),
        };
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "tool_use");
        assert_eq!(json["id"], "toolu_123");
        assert_eq!(json["name"], "convert_units");
    }

    #[test]
    fn content_block_tool_result_defaults_is_error() {
        let raw = serde_json::json!({
            "type": "tool_result",
            "tool_use_id": "toolu_1",
            "content": "ok"
        });
        let block: ContentBlock = serde_json::from_value(raw).unwrap();
        assert!(matches!(block, ContentBlock::ToolResult { is_error: false, .. }));
    }

    #[test]
    fn llm_message_text_skips_tool_blocks() {
        let msg = LlmMessage {
            role: "assistant".into(),
            content: vec![
                ContentBlock::Text {
                    text: "Converting...".into(),
                },
                ContentBlock::ToolUse {
                    id: "toolu_1".into(),
                    name: "convert_units".into(),
                    input: serde_json::json!({}),
                },
            ],
        };
        assert_eq!(msg.text(), "Converting...");
        assert_eq!(msg.tool_uses().len(), 1);
    }

    #[test]
    fn wants_tools_requires_stop_reason_and_block() {
        let mut resp = LlmResponse {
            text: String::new(),
            content: vec![ContentBlock::ToolUse {
                id: "t".into(),
                name: "x".into(),
                input: serde_json::json!({}),
            }],
            input_tokens: None,
            output_tokens: None,
            stop_reason: Some("tool_use".into()),
        };
        assert!(resp.wants_tools());

        resp.stop_reason = Some("end_turn".into());
        assert!(!resp.wants_tools());

        assert!(!LlmResponse::text_only("hi").wants_tools());
    }

    #[test]
    fn llm_request_simple_uses_default_max_tokens() {
        let req = LlmRequest::simple("model".into(), None, "hello".into());
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.max_tokens, 2048);
        assert_eq!(req.messages[0].text(), "hello");
    }
}
