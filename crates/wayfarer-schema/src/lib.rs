use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Channel a turn arrived on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    #[default]
    Chat,
    Voice,
    Repl,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Voice => "voice",
            Self::Repl => "repl",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authorization level of the caller, as asserted by the upstream identity layer.
///
/// Levels are ordered: `Public < Authenticated < Admin`.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum AuthLevel {
    Public,
    #[default]
    Authenticated,
    Admin,
}

impl AuthLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Authenticated => "authenticated",
            Self::Admin => "admin",
        }
    }

    pub fn satisfies(&self, required: AuthLevel) -> bool {
        *self >= required
    }
}

impl std::fmt::Display for AuthLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuthLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "public" => Ok(Self::Public),
            "authenticated" | "user" => Ok(Self::Authenticated),
            "admin" => Ok(Self::Admin),
            other => Err(format!("unknown auth level: {other}")),
        }
    }
}

/// Media attachment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attachment {
    pub kind: AttachmentKind,
    /// URL or storage reference
    pub url: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    Audio,
    Document,
    Other,
}

/// One user utterance entering the assistant core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub trace_id: Uuid,
    pub user_id: String,
    #[serde(default)]
    pub auth_level: AuthLevel,
    #[serde(default)]
    pub channel: Channel,
    pub text: String,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Free-form context from the adapter (locale, unit preference, client info).
    #[serde(default)]
    pub channel_context: serde_json::Value,
}

impl InboundMessage {
    pub fn new(user_id: impl Into<String>, channel: Channel, text: impl Into<String>) -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            user_id: user_id.into(),
            auth_level: AuthLevel::default(),
            channel,
            text: text.into(),
            at: Utc::now(),
            attachments: vec![],
            channel_context: serde_json::Value::Null,
        }
    }

    pub fn with_auth_level(mut self, level: AuthLevel) -> Self {
        self.auth_level = level;
        self
    }

    /// Text handed to the model and stored in history: the utterance followed
    /// by one `[attachment: ...]` line per attachment.
    pub fn content_text(&self) -> String {
        let mut lines: Vec<String> = Vec::with_capacity(self.attachments.len() + 1);
        let text = self.text.trim();
        if !text.is_empty() {
            lines.push(text.to_string());
        }
        lines.extend(self.attachments.iter().map(Attachment::note));
        lines.join("\n")
    }
}

impl Attachment {
    /// One-line description of the attachment for the conversation log.
    pub fn note(&self) -> String {
        let kind = match self.kind {
            AttachmentKind::Image => "image",
            AttachmentKind::Audio => "audio",
            AttachmentKind::Document => "document",
            AttachmentKind::Other => "file",
        };
        let name = self.file_name.as_deref().unwrap_or(&self.url);
        match &self.mime_type {
            Some(mime) => format!("[attachment: {kind} {name} ({mime})]"),
            None => format!("[attachment: {kind} {name}]"),
        }
    }
}

/// Status of one tool call made during a turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Ok,
    Error,
    Denied,
}

/// Compact, argument-free record of a tool call, safe to show to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolTraceEntry {
    pub tool: String,
    pub status: ToolCallStatus,
    pub duration_ms: u64,
}

/// Terminal failure states of a turn that still produce a reply.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TurnErrorKind {
    RateLimited,
    InputBlocked,
    OutputBlocked,
    ToolBudgetExceeded,
    ProviderError,
    Unauthorized,
}

impl TurnErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::InputBlocked => "input_blocked",
            Self::OutputBlocked => "output_blocked",
            Self::ToolBudgetExceeded => "tool_budget_exceeded",
            Self::ProviderError => "provider_error",
            Self::Unauthorized => "unauthorized",
        }
    }
}

impl std::fmt::Display for TurnErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TurnError {
    pub kind: TurnErrorKind,
    /// Present for `RateLimited`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

/// The assistant's reply to one turn. Always carries user-facing text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub trace_id: Uuid,
    pub user_id: String,
    pub channel: Channel,
    pub text: String,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_trace: Vec<ToolTraceEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TurnError>,
}

impl OutboundMessage {
    pub fn reply(inbound: &InboundMessage, text: impl Into<String>) -> Self {
        Self {
            trace_id: inbound.trace_id,
            user_id: inbound.user_id.clone(),
            channel: inbound.channel,
            text: text.into(),
            at: Utc::now(),
            tool_trace: vec![],
            error: None,
        }
    }

    pub fn failure(inbound: &InboundMessage, kind: TurnErrorKind, text: impl Into<String>) -> Self {
        Self {
            error: Some(TurnError {
                kind,
                retry_after_secs: None,
            }),
            ..Self::reply(inbound, text)
        }
    }

    pub fn error_kind(&self) -> Option<TurnErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Which way text is flowing through the security filter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FilterDirection {
    Inbound,
    Outbound,
}

/// Which security stage produced a verdict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FilterStage {
    Pattern,
    Semantic,
}

/// Voice turn-taking states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum VoiceState {
    #[default]
    Idle,
    WakeListening,
    Capturing,
    Transcribing,
    AwaitingReply,
    Speaking,
    Interrupted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMessage {
    TurnAccepted {
        trace_id: Uuid,
        user_id: String,
        channel: Channel,
    },
    ReplyReady {
        outbound: OutboundMessage,
    },
    TurnFailed {
        trace_id: Uuid,
        user_id: String,
        error: TurnErrorKind,
    },
    SecurityBlocked {
        trace_id: Uuid,
        user_id: String,
        conversation_id: Option<String>,
        direction: FilterDirection,
        stage: FilterStage,
        reason: String,
    },
    PersistenceDegraded {
        trace_id: Uuid,
        user_id: String,
        error: String,
    },
    VoiceStateChanged {
        user_id: String,
        from: VoiceState,
        to: VoiceState,
    },
}
