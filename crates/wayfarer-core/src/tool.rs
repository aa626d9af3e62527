//! Tool catalog.
//!
//! Tools are registered once at startup with a compiled JSON Schema and a
//! required authorization level. The registry is read-only afterwards.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jsonschema::{Draft, JSONSchema};
use uuid::Uuid;
use wayfarer_provider::ToolDef;
use wayfarer_schema::{AuthLevel, Channel};

/// Output from a tool execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Who is calling and from where.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub user_id: String,
    pub auth_level: AuthLevel,
    pub channel: Channel,
    pub conversation_id: Option<Uuid>,
    pub trace_id: Uuid,
}

impl ToolContext {
    pub fn new(user_id: impl Into<String>, auth_level: AuthLevel) -> Self {
        Self {
            user_id: user_id.into(),
            auth_level,
            channel: Channel::Chat,
            conversation_id: None,
            trace_id: Uuid::new_v4(),
        }
    }

    pub fn with_conversation(mut self, conversation_id: Option<Uuid>) -> Self {
        self.conversation_id = conversation_id;
        self
    }

    pub fn with_trace(mut self, trace_id: Uuid, channel: Channel) -> Self {
        self.trace_id = trace_id;
        self.channel = channel;
        self
    }
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Checks beyond the schema (cross-field rules). Runs only for
    /// authorized callers, after schema validation.
    fn validate(&self, _args: &serde_json::Value) -> Result<(), String> {
        Ok(())
    }

    async fn execute(&self, args: serde_json::Value, ctx: &ToolContext)
        -> anyhow::Result<ToolOutput>;
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    NotFound(String),
    #[error("tool {tool} requires {required} access")]
    Unauthorized { tool: String, required: AuthLevel },
    #[error("invalid arguments for {tool}: {message}")]
    Validation { tool: String, message: String },
    #[error("tool {tool} failed: {message}")]
    Execution { tool: String, message: String },
    #[error("tool {tool} timed out after {}ms", after.as_millis())]
    Timeout { tool: String, after: Duration },
    #[error("tool {tool} is temporarily throttled, retry in {}s", retry_after.as_secs().max(1))]
    Throttled { tool: String, retry_after: Duration },
    #[error("tool call budget of {limit} exhausted for this turn")]
    BudgetExceeded { limit: usize },
}

impl ToolError {
    /// Errors that end the turn instead of going back to the model.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Unauthorized { .. } | Self::BudgetExceeded { .. })
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("tool already registered: {0}")]
    Duplicate(String),
    #[error("invalid schema for tool {tool}: {message}")]
    InvalidSchema { tool: String, message: String },
    #[error("invalid tool name: {0:?}")]
    InvalidName(String),
}

/// A JSON Schema compiled once at registration.
pub struct ParameterSchema {
    raw: serde_json::Value,
    compiled: JSONSchema,
}

impl fmt::Debug for ParameterSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterSchema")
            .field("raw", &self.raw)
            .finish()
    }
}

impl ParameterSchema {
    pub fn compile(tool: &str, raw: serde_json::Value) -> Result<Self, RegistryError> {
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&raw)
            .map_err(|e| RegistryError::InvalidSchema {
                tool: tool.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self { raw, compiled })
    }

    pub fn raw(&self) -> &serde_json::Value {
        &self.raw
    }

    pub fn validate(&self, args: &serde_json::Value) -> Result<(), String> {
        if let Err(errors) = self.compiled.validate(args) {
            let messages: Vec<String> = errors
                .map(|e| {
                    let path = e.instance_path.to_string();
                    if path.is_empty() {
                        e.to_string()
                    } else {
                        format!("{path}: {e}")
                    }
                })
                .collect();
            return Err(messages.join("; "));
        }
        Ok(())
    }
}

pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: ParameterSchema,
    pub required_level: AuthLevel,
    /// Counted against the `tool_heavy` rate-limit class.
    pub heavy: bool,
    pub handler: Arc<dyn ToolHandler>,
}

impl ToolDescriptor {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: serde_json::Value,
        required_level: AuthLevel,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<Self, RegistryError> {
        let name = name.into();
        let valid_name = !name.is_empty()
            && name.len() <= 64
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid_name {
            return Err(RegistryError::InvalidName(name));
        }
        let parameters = ParameterSchema::compile(&name, schema)?;
        Ok(Self {
            name,
            description: description.into(),
            parameters,
            required_level,
            heavy: false,
            handler,
        })
    }

    pub fn heavy(mut self) -> Self {
        self.heavy = true;
        self
    }

    pub fn tool_def(&self) -> ToolDef {
        ToolDef {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.parameters.raw().clone(),
        }
    }
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolDescriptor>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: ToolDescriptor) -> Result<(), RegistryError> {
        if self.tools.contains_key(&descriptor.name) {
            return Err(RegistryError::Duplicate(descriptor.name));
        }
        tracing::debug!(
            tool = %descriptor.name,
            level = %descriptor.required_level,
            "registered tool"
        );
        self.tools.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<&ToolDescriptor, ToolError> {
        self.tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))
    }

    /// Definitions advertised to the model for a caller at `level`, by name.
    pub fn tool_defs_for(&self, level: AuthLevel) -> Vec<ToolDef> {
        let mut defs: Vec<ToolDef> = self
            .tools
            .values()
            .filter(|d| level.satisfies(d.required_level))
            .map(ToolDescriptor::tool_def)
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }
}
