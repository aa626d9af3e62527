use std::sync::Arc;
use std::time::{Duration, Instant};

use wayfarer_schema::{ToolCallStatus, ToolTraceEntry};

use crate::audit::ToolAuditEntry;
use crate::rate_limit::{EndpointClass, RateDecision, RateLimiter};
use crate::tool::{ToolContext, ToolError, ToolOutput, ToolRegistry};

/// Per-turn tool call allowance.
#[derive(Debug, Clone)]
pub struct ToolBudget {
    limit: usize,
    used: usize,
    trace: Vec<ToolTraceEntry>,
}

impl ToolBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            used: 0,
            trace: Vec::new(),
        }
    }

    fn try_consume(&mut self) -> bool {
        if self.used >= self.limit {
            return false;
        }
        self.used += 1;
        true
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn remaining(&self) -> usize {
        self.limit - self.used
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    fn record(&mut self, tool: &str, status: ToolCallStatus, started: Instant) {
        self.trace.push(ToolTraceEntry {
            tool: tool.to_string(),
            status,
            duration_ms: started.elapsed().as_millis() as u64,
        });
    }

    pub fn trace(&self) -> &[ToolTraceEntry] {
        &self.trace
    }

    pub fn into_trace(self) -> Vec<ToolTraceEntry> {
        self.trace
    }
}

/// Runs tool calls against the registry.
///
/// Every call passes, in order: budget, lookup, authorization, schema and
/// handler validation, heavy-tool throttling, then execution under a timeout.
/// Nothing past authorization runs for an unauthorized caller.
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
    max_calls_per_turn: usize,
    rate_limiter: Option<RateLimiter>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, timeout: Duration, max_calls_per_turn: usize) -> Self {
        Self {
            registry,
            timeout,
            max_calls_per_turn,
            rate_limiter: None,
        }
    }

    pub fn with_rate_limiter(mut self, rate_limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn begin_turn(&self) -> ToolBudget {
        ToolBudget::new(self.max_calls_per_turn)
    }

    pub async fn invoke(
        &self,
        budget: &mut ToolBudget,
        ctx: &ToolContext,
        name: &str,
        args: serde_json::Value,
    ) -> Result<ToolOutput, ToolError> {
        let started = Instant::now();
        let level = ctx.auth_level;
        let conversation = ctx.conversation_id.map(|id| id.to_string());

        if !budget.try_consume() {
            ToolAuditEntry::rejected(name, level, &args, "budget_exceeded")
                .with_user(&ctx.user_id)
                .with_conversation(conversation)
                .emit();
            budget.record(name, ToolCallStatus::Denied, started);
            return Err(ToolError::BudgetExceeded {
                limit: budget.limit(),
            });
        }

        let descriptor = match self.registry.resolve(name) {
            Ok(d) => d,
            Err(e) => {
                ToolAuditEntry::rejected(name, level, &args, "unknown_tool")
                    .with_user(&ctx.user_id)
                    .with_conversation(conversation)
                    .emit();
                budget.record(name, ToolCallStatus::Error, started);
                return Err(e);
            }
        };

        if !level.satisfies(descriptor.required_level) {
            ToolAuditEntry::denied(name, level, descriptor.required_level)
                .with_user(&ctx.user_id)
                .with_conversation(conversation)
                .emit();
            budget.record(name, ToolCallStatus::Denied, started);
            return Err(ToolError::Unauthorized {
                tool: name.to_string(),
                required: descriptor.required_level,
            });
        }

        let validation = descriptor
            .parameters
            .validate(&args)
            .and_then(|()| descriptor.handler.validate(&args));
        if let Err(message) = validation {
            ToolAuditEntry::rejected(name, level, &args, format!("validation: {message}"))
                .with_user(&ctx.user_id)
                .with_conversation(conversation)
                .emit();
            budget.record(name, ToolCallStatus::Error, started);
            return Err(ToolError::Validation {
                tool: name.to_string(),
                message,
            });
        }

        if descriptor.heavy {
            if let Some(limiter) = &self.rate_limiter {
                if let RateDecision::Throttled { retry_after } =
                    limiter.check(&ctx.user_id, EndpointClass::ToolHeavy)
                {
                    ToolAuditEntry::rejected(name, level, &args, "throttled")
                        .with_user(&ctx.user_id)
                        .with_conversation(conversation)
                        .emit();
                    budget.record(name, ToolCallStatus::Error, started);
                    return Err(ToolError::Throttled {
                        tool: name.to_string(),
                        retry_after,
                    });
                }
            }
        }

        let summary_args = args.clone();
        let result =
            tokio::time::timeout(self.timeout, descriptor.handler.execute(args, ctx)).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(Ok(output)) if !output.is_error => Ok(output),
            Ok(Ok(output)) => Err(ToolError::Execution {
                tool: name.to_string(),
                message: output.content,
            }),
            Ok(Err(e)) => Err(ToolError::Execution {
                tool: name.to_string(),
                message: e.to_string(),
            }),
            Err(_) => Err(ToolError::Timeout {
                tool: name.to_string(),
                after: self.timeout,
            }),
        };

        match &outcome {
            Ok(output) => {
                ToolAuditEntry::success(name, level, &summary_args, &output.content, duration_ms)
                    .with_user(&ctx.user_id)
                    .with_conversation(conversation)
                    .emit();
                budget.record(name, ToolCallStatus::Ok, started);
            }
            Err(e) => {
                ToolAuditEntry::error(name, level, &summary_args, e.to_string(), duration_ms)
                    .with_user(&ctx.user_id)
                    .with_conversation(conversation)
                    .emit();
                budget.record(name, ToolCallStatus::Error, started);
            }
        }
        outcome
    }
}
