//! Audit logging for tool calls.
//!
//! Entries are emitted on the `wayfarer::audit` tracing target. Authorization
//! denials never carry an input summary.

use chrono::{DateTime, Utc};
use serde::Serialize;
use wayfarer_schema::AuthLevel;

use crate::security::redact_secrets;

pub const AUDIT_TARGET: &str = "wayfarer::audit";

/// Audit log entry for one tool call.
#[derive(Debug, Clone, Serialize)]
pub struct ToolAuditEntry {
    pub timestamp: DateTime<Utc>,
    pub tool_name: String,
    pub caller_level: AuthLevel,
    /// Redacted, truncated input. Absent for denials.
    pub input_summary: Option<String>,
    pub result: AuditOutcome,
    pub duration_ms: u64,
    pub user_id: Option<String>,
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditOutcome {
    Ok { output_preview: String },
    Denied { required: AuthLevel },
    Rejected { reason: String },
    Error { message: String },
}

impl ToolAuditEntry {
    fn base(tool_name: &str, caller_level: AuthLevel, result: AuditOutcome) -> Self {
        Self {
            timestamp: Utc::now(),
            tool_name: tool_name.to_string(),
            caller_level,
            input_summary: None,
            result,
            duration_ms: 0,
            user_id: None,
            conversation_id: None,
        }
    }

    pub fn success(
        tool_name: &str,
        caller_level: AuthLevel,
        input: &serde_json::Value,
        output: &str,
        duration_ms: u64,
    ) -> Self {
        Self {
            input_summary: Some(summarize_input(input, 200)),
            duration_ms,
            ..Self::base(
                tool_name,
                caller_level,
                AuditOutcome::Ok {
                    output_preview: truncate_string(&redact_secrets(output), 100),
                },
            )
        }
    }

    pub fn denied(tool_name: &str, caller_level: AuthLevel, required: AuthLevel) -> Self {
        Self::base(tool_name, caller_level, AuditOutcome::Denied { required })
    }

    /// Validation failures and budget exhaustion: the tool never ran.
    pub fn rejected(
        tool_name: &str,
        caller_level: AuthLevel,
        input: &serde_json::Value,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            input_summary: Some(summarize_input(input, 200)),
            ..Self::base(
                tool_name,
                caller_level,
                AuditOutcome::Rejected {
                    reason: redact_secrets(&reason.into()),
                },
            )
        }
    }

    pub fn error(
        tool_name: &str,
        caller_level: AuthLevel,
        input: &serde_json::Value,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            input_summary: Some(summarize_input(input, 200)),
            duration_ms,
            ..Self::base(
                tool_name,
                caller_level,
                AuditOutcome::Error {
                    message: redact_secrets(&error.into()),
                },
            )
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_conversation(mut self, conversation_id: Option<String>) -> Self {
        self.conversation_id = conversation_id;
        self
    }

    pub fn status(&self) -> &'static str {
        match &self.result {
            AuditOutcome::Ok { .. } => "ok",
            AuditOutcome::Denied { .. } => "denied",
            AuditOutcome::Rejected { .. } => "rejected",
            AuditOutcome::Error { .. } => "error",
        }
    }

    pub fn emit(&self) {
        match &self.result {
            AuditOutcome::Ok { .. } => {
                tracing::info!(
                    target: AUDIT_TARGET,
                    tool = %self.tool_name,
                    level = %self.caller_level,
                    result = "ok",
                    duration_ms = self.duration_ms,
                    user_id = ?self.user_id,
                    conversation_id = ?self.conversation_id,
                    input = self.input_summary.as_deref().unwrap_or(""),
                    "tool_execution"
                );
            }
            AuditOutcome::Denied { required } => {
                tracing::warn!(
                    target: AUDIT_TARGET,
                    tool = %self.tool_name,
                    level = %self.caller_level,
                    required = %required,
                    user_id = ?self.user_id,
                    conversation_id = ?self.conversation_id,
                    "tool authorization denied"
                );
            }
            AuditOutcome::Rejected { reason } => {
                tracing::warn!(
                    target: AUDIT_TARGET,
                    tool = %self.tool_name,
                    level = %self.caller_level,
                    reason = %reason,
                    user_id = ?self.user_id,
                    input = self.input_summary.as_deref().unwrap_or(""),
                    "tool call rejected"
                );
            }
            AuditOutcome::Error { message } => {
                tracing::warn!(
                    target: AUDIT_TARGET,
                    tool = %self.tool_name,
                    level = %self.caller_level,
                    error = %message,
                    duration_ms = self.duration_ms,
                    user_id = ?self.user_id,
                    "tool execution failed"
                );
            }
        }
    }
}

/// Truncated summary of tool input with sensitive values redacted.
pub fn summarize_input(input: &serde_json::Value, max_len: usize) -> String {
    let summary = match input {
        serde_json::Value::Object(map) => {
            let parts: Vec<String> = map
                .iter()
                .map(|(k, v)| {
                    let v_str = if is_sensitive_key(k) {
                        "[REDACTED]".to_string()
                    } else {
                        match v {
                            serde_json::Value::String(s) => {
                                format!("\"{}\"", truncate_string(&redact_secrets(s), 50))
                            }
                            serde_json::Value::Object(_) => summarize_input(v, 100),
                            _ => truncate_string(&redact_secrets(&v.to_string()), 50),
                        }
                    };
                    format!("{k}:{v_str}")
                })
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        serde_json::Value::String(s) => redact_secrets(s),
        _ => redact_secrets(&input.to_string()),
    };

    truncate_string(&summary, max_len)
}

fn is_sensitive_key(key: &str) -> bool {
    const SENSITIVE: [&str; 10] = [
        "password",
        "secret",
        "token",
        "credential",
        "auth",
        "api_key",
        "apikey",
        "card",
        "cvv",
        "iban",
    ];
    let key_lower = key.to_lowercase();
    SENSITIVE.iter().any(|s| key_lower.contains(s))
}

/// Truncate on a char boundary, appending an ellipsis when shortened.
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
