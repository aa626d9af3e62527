use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::{ContentBlock, LlmProvider, LlmRequest, LlmResponse};

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
    timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderErrorKind {
    RateLimit,
    ServerError,
    Timeout,
    AuthError,
    InvalidRequest,
    Unknown,
}

impl ProviderErrorKind {
    pub fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            429 => Self::RateLimit,
            401 | 403 => Self::AuthError,
            400 | 422 => Self::InvalidRequest,
            500..=599 => Self::ServerError,
            _ => Self::Unknown,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimit | Self::ServerError | Self::Timeout)
    }
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self::with_timeout(api_key, api_base, Duration::from_secs(60))
    }

    pub fn with_timeout(
        api_key: impl Into<String>,
        api_base: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            api_key: api_key.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    pub(crate) fn to_api_request(request: LlmRequest) -> ApiRequest {
        let tools: Vec<ApiToolDef> = request
            .tools
            .into_iter()
            .map(|t| ApiToolDef {
                name: t.name,
                description: t.description,
                input_schema: t.input_schema,
            })
            .collect();

        ApiRequest {
            model: request.model,
            system: request.system,
            max_tokens: request.max_tokens,
            messages: request
                .messages
                .into_iter()
                .map(|m| {
                    let has_non_text = m
                        .content
                        .iter()
                        .any(|b| !matches!(b, ContentBlock::Text { .. }));
                    let content = if has_non_text {
                        serde_json::Value::Array(m.content.iter().map(block_to_json).collect())
                    } else {
                        serde_json::Value::String(m.text())
                    };
                    ApiMessage {
                        role: m.role,
                        content,
                    }
                })
                .collect(),
            tools: if tools.is_empty() { None } else { Some(tools) },
        }
    }
}

fn block_to_json(block: &ContentBlock) -> serde_json::Value {
    match block {
        ContentBlock::Text { text } => serde_json::json!({"type": "text", "text": text}),
        ContentBlock::ToolUse { id, name, input } => {
            serde_json::json!({"type": "tool_use", "id": id, "name": name, "input": input})
        }
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => serde_json::json!({
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "content": content,
            "is_error": is_error
        }),
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse> {
        let url = format!("{}/v1/messages", self.api_base);
        let payload = Self::to_api_request(request);

        let resp = match self
            .client
            .post(url)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .header("x-api-key", &self.api_key)
            .json(&payload)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Err(anyhow!(
                    "anthropic api error (timeout) [retryable]: request timed out after {}s",
                    self.timeout.as_secs()
                ));
            }
            Err(e) if e.is_connect() => {
                return Err(anyhow!("anthropic api error (connect) [retryable]: {e}"));
            }
            Err(e) => return Err(e.into()),
        };

        let status = resp.status();
        if status != StatusCode::OK {
            let text = resp.text().await?;
            let parsed = serde_json::from_str::<ApiError>(&text).ok();
            return Err(format_api_error(status, parsed));
        }

        let body: ApiResponse = resp.json().await?;
        Ok(from_api_response(body))
    }

    async fn health(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            anyhow::bail!("anthropic api key is empty");
        }
        Ok(())
    }
}

fn from_api_response(body: ApiResponse) -> LlmResponse {
    let content: Vec<ContentBlock> = body
        .content
        .iter()
        .filter_map(|block| match block.block_type.as_str() {
            "text" => block
                .text
                .as_ref()
                .map(|t| ContentBlock::Text { text: t.clone() }),
            "tool_use" => {
                let id = block.id.as_ref()?.clone();
                let name = block.name.as_ref()?.clone();
                let input = block
                    .input
                    .clone()
                    .unwrap_or(serde_json::Value::Object(Default::default()));
                Some(ContentBlock::ToolUse { id, name, input })
            }
            _ => None,
        })
        .collect();
    let text = body
        .content
        .iter()
        .filter_map(|block| block.text.as_deref())
        .collect::<Vec<_>>()
        .join("\n");

    LlmResponse {
        text,
        content,
        input_tokens: body.usage.as_ref().map(|u| u.input_tokens),
        output_tokens: body.usage.as_ref().map(|u| u.output_tokens),
        stop_reason: body.stop_reason,
    }
}

fn format_api_error(status: StatusCode, parsed: Option<ApiError>) -> anyhow::Error {
    let kind = ProviderErrorKind::from_status(status);
    let retryable = if kind.is_retryable() {
        " [retryable]"
    } else {
        ""
    };
    match parsed {
        Some(api_error) => {
            let detail = api_error.error;
            anyhow!(
                "anthropic api error ({status}){retryable}: {} ({})",
                detail.message,
                detail.r#type
            )
        }
        None => anyhow!("anthropic api error ({status}){retryable}"),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiRequest {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub max_tokens: u32,
    pub messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ApiToolDef>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiMessage {
    pub role: String,
    pub content: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiToolDef {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiResponse {
    pub content: Vec<ApiContentBlock>,
    pub usage: Option<ApiUsage>,
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiContentBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub input: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiError {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiErrorDetail {
    #[serde(rename = "type")]
    pub r#type: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LlmMessage, ToolDef};

    #[test]
    fn anthropic_new_trims_trailing_slash() {
        let provider = AnthropicProvider::new("test-key", "https://api.anthropic.com/");
        assert_eq!(provider.api_key, "test-key");
        assert_eq!(provider.api_base, "https://api.anthropic.com");
    }

    #[test]
    fn plain_text_messages_serialize_as_strings() {
        let req = LlmRequest {
            model: "claude-sonnet-4-5".to_string(),
            system: Some("system prompt".to_string()),
            messages: vec![LlmMessage::user("hello")],
            max_tokens: 1024,
            tools: vec![],
        };
        let value = serde_json::to_value(AnthropicProvider::to_api_request(req)).unwrap();
        let expected = serde_json::json!({
            "model": "claude-sonnet-4-5",
            "system": "system prompt",
            "max_tokens": 1024,
            "messages": [
                { "role": "user", "content": "hello" }
            ]
        });
        assert_eq!(value, expected);
    }

    #[test]
    fn tool_blocks_serialize_as_arrays() {
        let req = LlmRequest {
            model: "m".into(),
            system: None,
            messages: vec![
                LlmMessage::user("convert 10 km"),
                LlmMessage {
                    role: "assistant".into(),
                    content: vec![ContentBlock::ToolUse {
                        id: "toolu_1".into(),
                        name: "convert_units".into(),
                        input: serde_json::json!({"value": 10, "from": "km", "to": "mi"}),
                    }],
                },
                LlmMessage::tool_results(vec![ContentBlock::ToolResult {
                    tool_use_id: "toolu_1".into(),
                    content: "6.21 mi".into(),
                    is_error: false,
                }]),
            ],
            max_tokens: 256,
            tools: vec![ToolDef {
                name: "convert_units".into(),
                description: "Convert units".into(),
                input_schema: serde_json::json!({"type": "object"}),
            }],
        };
        let value = serde_json::to_value(AnthropicProvider::to_api_request(req)).unwrap();
        assert_eq!(value["messages"][1]["content"][0]["type"], "tool_use");
        assert_eq!(value["messages"][2]["role"], "user");
        assert_eq!(value["messages"][2]["content"][0]["tool_use_id"], "toolu_1");
        assert_eq!(value["tools"][0]["name"], "convert_units");
    }

    #[test]
    fn api_response_maps_tool_use_blocks() {
        let raw = serde_json::json!({
            "content": [
                {"type": "text", "text": "Let me check."},
                {"type": "tool_use", "id": "toolu_9", "name": "trip_expenses", "input": {}}
            ],
            "usage": {"input_tokens": 12, "output_tokens": 34},
            "stop_reason": "tool_use"
        });
        let parsed: ApiResponse = serde_json::from_value(raw).unwrap();
        let resp = from_api_response(parsed);
        assert_eq!(resp.text, "Let me check.");
        assert_eq!(resp.content.len(), 2);
        assert!(resp.wants_tools());
        assert_eq!(resp.input_tokens, Some(12));
    }

    #[test]
    fn provider_error_kind_classification() {
        assert_eq!(
            ProviderErrorKind::from_status(StatusCode::TOO_MANY_REQUESTS),
            ProviderErrorKind::RateLimit
        );
        assert_eq!(
            ProviderErrorKind::from_status(StatusCode::BAD_GATEWAY),
            ProviderErrorKind::ServerError
        );
        assert_eq!(
            ProviderErrorKind::from_status(StatusCode::FORBIDDEN),
            ProviderErrorKind::AuthError
        );
        assert!(ProviderErrorKind::Timeout.is_retryable());
        assert!(!ProviderErrorKind::InvalidRequest.is_retryable());
    }

    #[test]
    fn format_api_error_marks_retryable() {
        let err = format_api_error(StatusCode::INTERNAL_SERVER_ERROR, None);
        let text = err.to_string();
        assert!(text.contains("500"));
        assert!(text.contains("[retryable]"));

        let parsed = Some(ApiError {
            error: ApiErrorDetail {
                r#type: "invalid_request_error".into(),
                message: "messages: required".into(),
            },
        });
        let text = format_api_error(StatusCode::BAD_REQUEST, parsed).to_string();
        assert!(text.contains("messages: required"));
        assert!(!text.contains("[retryable]"));
    }

    #[tokio::test]
    async fn health_rejects_empty_key() {
        let provider = AnthropicProvider::new("  ", "https://api.anthropic.com");
        assert!(provider.health().await.is_err());
    }
}
