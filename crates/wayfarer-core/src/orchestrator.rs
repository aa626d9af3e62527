//! The per-turn pipeline.
//!
//! `Received → RateChecked → InputFiltered → HistoryLoaded → ModelInvoked →
//! (ToolLoop → ModelInvoked)* → OutputFiltered → Persisted → Replied`, with
//! terminal failures that always produce a short reply.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use wayfarer_bus::BusPublisher;
use wayfarer_memory::{ConversationStore, NewMessage, ToolCallRecord};
use wayfarer_provider::{ContentBlock, LlmMessage, LlmProvider, LlmRequest};
use wayfarer_schema::{
    BusMessage, Channel, FilterDirection, InboundMessage, OutboundMessage, ToolTraceEntry,
    TurnError, TurnErrorKind,
};

use crate::audit::{summarize_input, truncate_string};
use crate::config::WayfarerConfig;
use crate::dispatcher::{ToolBudget, ToolDispatcher};
use crate::rate_limit::{EndpointClass, RateDecision, RateLimiter};
use crate::security::{
    redact_secrets, InspectContext, LlmClassifier, PatternRules, SecurityFilter, SecurityVerdict,
};
use crate::session::{HistoryEntry, Session, SessionManager, TurnGuard};
use crate::tool::{ToolContext, ToolError, ToolRegistry};
use crate::travel_tools::{register_builtin_tools, ExpenseLedger};
use crate::voice::UtteranceHandler;

pub const TURN_TARGET: &str = "wayfarer::turn";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Received,
    RateChecked,
    InputFiltered,
    HistoryLoaded,
    ModelInvoked,
    ToolLoop,
    OutputFiltered,
    Persisted,
    Replied,
    RateLimited,
    Blocked,
    ToolBudgetExceeded,
    ProviderError,
    Unauthorized,
}

impl TurnState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Replied
                | Self::RateLimited
                | Self::Blocked
                | Self::ToolBudgetExceeded
                | Self::ProviderError
                | Self::Unauthorized
        )
    }
}

/// Tracks and logs state transitions for one turn.
struct TurnTracker<'a> {
    inbound: &'a InboundMessage,
    state: TurnState,
}

impl<'a> TurnTracker<'a> {
    fn new(inbound: &'a InboundMessage) -> Self {
        tracing::debug!(
            target: TURN_TARGET,
            trace_id = %inbound.trace_id,
            user_id = %inbound.user_id,
            channel = %inbound.channel,
            state = ?TurnState::Received,
            "turn state"
        );
        Self {
            inbound,
            state: TurnState::Received,
        }
    }

    fn advance(&mut self, next: TurnState) {
        tracing::debug!(
            target: TURN_TARGET,
            trace_id = %self.inbound.trace_id,
            from = ?self.state,
            to = ?next,
            "turn state"
        );
        self.state = next;
    }
}

/// User-facing text for each terminal failure.
pub fn failure_text(kind: TurnErrorKind, retry_after_secs: Option<u64>) -> String {
    match kind {
        TurnErrorKind::RateLimited => format!(
            "You're sending messages a little too quickly. Please wait {} seconds and try again.",
            retry_after_secs.unwrap_or(1).max(1)
        ),
        TurnErrorKind::InputBlocked => {
            "I can't help with that request as written. Could you rephrase it?".into()
        }
        TurnErrorKind::OutputBlocked => {
            "Sorry, I can't share that response. Could you ask in a different way?".into()
        }
        TurnErrorKind::ToolBudgetExceeded => "That took more steps than I can handle at once. \
            Could you break it into smaller requests?"
            .into(),
        TurnErrorKind::ProviderError => "Sorry, I'm having trouble connecting right now. \
            Please try again in a moment."
            .into(),
        TurnErrorKind::Unauthorized => "That action isn't available for your account.".into(),
    }
}

/// Message handed back to the model when a recoverable tool error occurs.
fn tool_error_for_model(err: &ToolError) -> String {
    match err {
        ToolError::NotFound(name) => {
            format!("Unknown tool '{name}'. Use only the tools you were given.")
        }
        ToolError::Validation { message, .. } => {
            format!("Invalid arguments: {}", truncate_string(message, 300))
        }
        ToolError::Execution { message, .. } => format!(
            "The tool failed: {}",
            truncate_string(&redact_secrets(message), 200)
        ),
        ToolError::Timeout { .. } => "The tool timed out. Try again later.".into(),
        ToolError::Throttled { .. } => {
            "The tool is temporarily unavailable because of rate limits.".into()
        }
        ToolError::Unauthorized { .. } | ToolError::BudgetExceeded { .. } => err.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub model: String,
    pub system_prompt: String,
    pub max_tokens: u32,
    pub provider_timeout: Duration,
    pub persist_retries: u32,
    pub persist_backoff: Duration,
}

impl TurnSettings {
    pub fn from_config(config: &WayfarerConfig) -> Self {
        Self {
            model: config.provider.model.clone(),
            system_prompt: config.agent.system_prompt.clone(),
            max_tokens: config.provider.max_tokens,
            provider_timeout: config.provider.timeout(),
            persist_retries: config.agent.persist_retries,
            persist_backoff: Duration::from_millis(50),
        }
    }
}

pub struct AgentOrchestrator {
    sessions: Arc<SessionManager>,
    security: Arc<SecurityFilter>,
    rate_limiter: RateLimiter,
    dispatcher: Arc<ToolDispatcher>,
    provider: Arc<dyn LlmProvider>,
    publisher: BusPublisher,
    settings: TurnSettings,
}

/// How a model/tool loop ended.
enum LoopOutcome {
    Reply(String),
    Failed(TurnErrorKind),
}

impl AgentOrchestrator {
    pub fn new(
        sessions: Arc<SessionManager>,
        security: Arc<SecurityFilter>,
        rate_limiter: RateLimiter,
        dispatcher: Arc<ToolDispatcher>,
        provider: Arc<dyn LlmProvider>,
        publisher: BusPublisher,
        settings: TurnSettings,
    ) -> Self {
        Self {
            sessions,
            security,
            rate_limiter,
            dispatcher,
            provider,
            publisher,
            settings,
        }
    }

    /// Wire up the full core from configuration.
    pub fn from_config(
        config: &WayfarerConfig,
        provider: Arc<dyn LlmProvider>,
        store: Arc<dyn ConversationStore>,
        publisher: BusPublisher,
    ) -> Result<Self> {
        let rate_limiter = RateLimiter::new(config.rate_limits.clone());

        let mut registry = ToolRegistry::new();
        register_builtin_tools(&mut registry, ExpenseLedger::new(), rate_limiter.clone())?;
        let dispatcher = ToolDispatcher::new(
            Arc::new(registry),
            config.agent.tool_timeout(),
            config.agent.max_tool_calls,
        )
        .with_rate_limiter(rate_limiter.clone());

        let mut security =
            SecurityFilter::new(PatternRules::new(&config.security.extra_block_patterns)?);
        if config.security.semantic_enabled {
            security = security.with_classifier(
                Arc::new(LlmClassifier::new(
                    provider.clone(),
                    config.provider.model.clone(),
                )),
                Duration::from_millis(config.security.classifier_timeout_ms),
            );
        }

        let sessions = Arc::new(SessionManager::new(store, config.agent.history_window));
        Ok(Self::new(
            sessions,
            Arc::new(security),
            rate_limiter,
            Arc::new(dispatcher),
            provider,
            publisher,
            TurnSettings::from_config(config),
        ))
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        self.sessions.store()
    }

    /// Wait until every accepted turn for `user_id` has finished, including
    /// its background persistence.
    pub async fn settle(&self, user_id: &str) {
        if let Some(session) = self.sessions.get(user_id) {
            drop(session.begin_turn().await);
        }
    }

    /// [`AgentOrchestrator::settle`] for every live session. Used on shutdown.
    pub async fn settle_all(&self) {
        for session in self.sessions.all() {
            drop(session.begin_turn().await);
        }
    }

    async fn emit(&self, msg: BusMessage) {
        if let Err(e) = self.publisher.publish(msg).await {
            tracing::debug!("bus publish failed: {e}");
        }
    }

    /// Run one turn. Never fails: every outcome is a reply.
    pub async fn handle_turn(&self, inbound: InboundMessage) -> OutboundMessage {
        let mut turn = TurnTracker::new(&inbound);
        self.emit(BusMessage::TurnAccepted {
            trace_id: inbound.trace_id,
            user_id: inbound.user_id.clone(),
            channel: inbound.channel,
        })
        .await;

        let class = match inbound.channel {
            Channel::Voice => EndpointClass::Voice,
            Channel::Chat | Channel::Repl => EndpointClass::Chat,
        };
        if let RateDecision::Throttled { retry_after } =
            self.rate_limiter.check(&inbound.user_id, class)
        {
            turn.advance(TurnState::RateLimited);
            let secs = retry_after.as_secs_f64().ceil() as u64;
            return self
                .fail(&inbound, TurnErrorKind::RateLimited, Some(secs.max(1)), vec![])
                .await;
        }
        turn.advance(TurnState::RateChecked);

        let session = self.sessions.get_or_create(&inbound.user_id).await;
        let guard = session.begin_turn().await;
        session.touch();

        let inspect_ctx = InspectContext {
            user_id: Some(inbound.user_id.clone()),
            conversation_id: session.conversation_id().map(|id| id.to_string()),
            trace_id: Some(inbound.trace_id.to_string()),
        };

        let user_text = inbound.content_text();
        let verdict = self
            .security
            .inspect(&user_text, FilterDirection::Inbound, &inspect_ctx)
            .await;
        if verdict.is_blocked() {
            turn.advance(TurnState::Blocked);
            self.report_block(&inbound, &inspect_ctx, FilterDirection::Inbound, &verdict)
                .await;
            return self
                .fail(&inbound, TurnErrorKind::InputBlocked, None, vec![])
                .await;
        }
        turn.advance(TurnState::InputFiltered);

        let mut messages = session.model_messages();
        messages.push(LlmMessage::user(user_text.clone()));
        turn.advance(TurnState::HistoryLoaded);

        let tool_ctx = ToolContext::new(inbound.user_id.clone(), inbound.auth_level)
            .with_conversation(session.conversation_id())
            .with_trace(inbound.trace_id, inbound.channel);
        let mut budget = self.dispatcher.begin_turn();
        let mut tool_records = Vec::new();

        let outcome = self
            .tool_use_loop(
                &mut turn,
                messages,
                &tool_ctx,
                &mut budget,
                &mut tool_records,
            )
            .await;
        let trace = budget.into_trace();

        let reply = match outcome {
            LoopOutcome::Reply(text) => text,
            LoopOutcome::Failed(kind) => {
                turn.advance(match kind {
                    TurnErrorKind::ToolBudgetExceeded => TurnState::ToolBudgetExceeded,
                    TurnErrorKind::Unauthorized => TurnState::Unauthorized,
                    _ => TurnState::ProviderError,
                });
                return self.fail(&inbound, kind, None, trace).await;
            }
        };

        let verdict = self
            .security
            .inspect(&reply, FilterDirection::Outbound, &inspect_ctx)
            .await;
        if verdict.is_blocked() {
            turn.advance(TurnState::Blocked);
            self.report_block(&inbound, &inspect_ctx, FilterDirection::Outbound, &verdict)
                .await;
            return self
                .fail(&inbound, TurnErrorKind::OutputBlocked, None, trace)
                .await;
        }
        turn.advance(TurnState::OutputFiltered);

        let mut entries = Vec::with_capacity(tool_records.len() + 2);
        entries.push(HistoryEntry::user(user_text));
        entries.extend(tool_records.into_iter().map(HistoryEntry::tool));
        entries.push(HistoryEntry::assistant(reply.clone()));
        session.commit(entries.clone());
        self.spawn_persist(session.clone(), guard, &inbound, entries);
        turn.advance(TurnState::Persisted);

        let mut outbound = OutboundMessage::reply(&inbound, reply);
        outbound.tool_trace = trace;
        turn.advance(TurnState::Replied);
        self.emit(BusMessage::ReplyReady {
            outbound: outbound.clone(),
        })
        .await;
        outbound
    }

    async fn tool_use_loop(
        &self,
        turn: &mut TurnTracker<'_>,
        mut messages: Vec<LlmMessage>,
        ctx: &ToolContext,
        budget: &mut ToolBudget,
        records: &mut Vec<ToolCallRecord>,
    ) -> LoopOutcome {
        let tool_defs = self.dispatcher.registry().tool_defs_for(ctx.auth_level);

        loop {
            turn.advance(TurnState::ModelInvoked);
            let request = LlmRequest {
                model: self.settings.model.clone(),
                system: Some(self.settings.system_prompt.clone()),
                messages: messages.clone(),
                max_tokens: self.settings.max_tokens,
                tools: tool_defs.clone(),
            };
            let response =
                match tokio::time::timeout(self.settings.provider_timeout, self.provider.chat(request))
                    .await
                {
                    Ok(Ok(r)) => r,
                    Ok(Err(e)) => {
                        tracing::error!(
                            target: TURN_TARGET,
                            trace_id = %ctx.trace_id,
                            user_id = %ctx.user_id,
                            error = %redact_secrets(&e.to_string()),
                            "ProviderError"
                        );
                        return LoopOutcome::Failed(TurnErrorKind::ProviderError);
                    }
                    Err(_) => {
                        tracing::error!(
                            target: TURN_TARGET,
                            trace_id = %ctx.trace_id,
                            user_id = %ctx.user_id,
                            timeout_ms = self.settings.provider_timeout.as_millis() as u64,
                            "ProviderError: model call timed out"
                        );
                        return LoopOutcome::Failed(TurnErrorKind::ProviderError);
                    }
                };

            if !response.wants_tools() {
                let text = response.text.trim();
                if text.is_empty() {
                    return LoopOutcome::Reply(
                        "Sorry, I don't have an answer for that yet.".into(),
                    );
                }
                return LoopOutcome::Reply(text.to_string());
            }

            turn.advance(TurnState::ToolLoop);
            let assistant = response.into_assistant_message();
            let calls: Vec<(String, String, serde_json::Value)> = assistant
                .tool_uses()
                .into_iter()
                .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
                .collect();
            messages.push(assistant);

            let mut results = Vec::with_capacity(calls.len());
            for (id, name, input) in calls {
                let args_summary = summarize_input(&input, 200);
                match self.dispatcher.invoke(budget, ctx, &name, input).await {
                    Ok(output) => {
                        records.push(ToolCallRecord {
                            tool: name,
                            args_summary,
                            ok: true,
                            result_preview: truncate_string(&redact_secrets(&output.content), 100),
                        });
                        results.push(ContentBlock::ToolResult {
                            tool_use_id: id,
                            content: output.content,
                            is_error: false,
                        });
                    }
                    Err(ToolError::Unauthorized { .. }) => {
                        return LoopOutcome::Failed(TurnErrorKind::Unauthorized);
                    }
                    Err(ToolError::BudgetExceeded { limit }) => {
                        tracing::warn!(
                            target: TURN_TARGET,
                            trace_id = %ctx.trace_id,
                            user_id = %ctx.user_id,
                            limit,
                            "ToolBudgetExceeded"
                        );
                        return LoopOutcome::Failed(TurnErrorKind::ToolBudgetExceeded);
                    }
                    Err(e) => {
                        let content = tool_error_for_model(&e);
                        records.push(ToolCallRecord {
                            tool: name,
                            args_summary,
                            ok: false,
                            result_preview: truncate_string(&redact_secrets(&content), 100),
                        });
                        results.push(ContentBlock::ToolResult {
                            tool_use_id: id,
                            content,
                            is_error: true,
                        });
                    }
                }
            }
            messages.push(LlmMessage::tool_results(results));
        }
    }

    async fn report_block(
        &self,
        inbound: &InboundMessage,
        ctx: &InspectContext,
        direction: FilterDirection,
        verdict: &SecurityVerdict,
    ) {
        self.emit(BusMessage::SecurityBlocked {
            trace_id: inbound.trace_id,
            user_id: inbound.user_id.clone(),
            conversation_id: ctx.conversation_id.clone(),
            direction,
            stage: verdict.stage,
            reason: verdict.reason.clone(),
        })
        .await;
    }

    async fn fail(
        &self,
        inbound: &InboundMessage,
        kind: TurnErrorKind,
        retry_after_secs: Option<u64>,
        tool_trace: Vec<ToolTraceEntry>,
    ) -> OutboundMessage {
        tracing::warn!(
            target: TURN_TARGET,
            trace_id = %inbound.trace_id,
            user_id = %inbound.user_id,
            error = %kind,
            "turn failed"
        );
        self.emit(BusMessage::TurnFailed {
            trace_id: inbound.trace_id,
            user_id: inbound.user_id.clone(),
            error: kind,
        })
        .await;
        let mut outbound =
            OutboundMessage::failure(inbound, kind, failure_text(kind, retry_after_secs));
        outbound.error = Some(TurnError {
            kind,
            retry_after_secs,
        });
        outbound.tool_trace = tool_trace;
        outbound
    }

    /// Persist the turn in the background. The task keeps the user's turn
    /// gate, so the next turn for this user starts only after the write
    /// settles and store order matches turn order.
    fn spawn_persist(
        &self,
        session: Arc<Session>,
        guard: TurnGuard,
        inbound: &InboundMessage,
        entries: Vec<HistoryEntry>,
    ) {
        let store = self.sessions.store().clone();
        let publisher = self.publisher.clone();
        let retries = self.settings.persist_retries;
        let backoff = self.settings.persist_backoff;
        let trace_id = inbound.trace_id;
        let user_id = inbound.user_id.clone();
        let channel_context = inbound.channel_context.clone();

        tokio::spawn(async move {
            let _guard = guard;
            let result = persist_turn(
                store.as_ref(),
                &session,
                entries,
                &channel_context,
                retries,
                backoff,
            )
            .await;
            if let Err(e) = result {
                tracing::warn!(
                    trace_id = %trace_id,
                    user_id = %user_id,
                    error = %e,
                    "persistence degraded; reply already delivered"
                );
                let msg = BusMessage::PersistenceDegraded {
                    trace_id,
                    user_id,
                    error: e.to_string(),
                };
                if let Err(e) = publisher.publish(msg).await {
                    tracing::debug!("bus publish failed: {e}");
                }
            }
        });
    }
}

async fn persist_turn(
    store: &dyn ConversationStore,
    session: &Session,
    entries: Vec<HistoryEntry>,
    channel_context: &serde_json::Value,
    retries: u32,
    backoff: Duration,
) -> Result<()> {
    let conversation_id = match session.conversation_id() {
        Some(id) => id,
        None => {
            let conv = with_retry(retries, backoff, || {
                store.get_or_create_conversation(session.user_id())
            })
            .await?;
            session.set_conversation_id(conv.id);
            conv.id
        }
    };

    for entry in entries {
        let message = NewMessage {
            conversation_id,
            role: entry.role,
            content: entry.content,
            tool_call: entry.tool_call,
        };
        with_retry(retries, backoff, || store.append_message(message.clone())).await?;
    }

    if let serde_json::Value::Object(incoming) = channel_context {
        if !incoming.is_empty() {
            let mut context = store
                .get_conversation(session.user_id())
                .await?
                .map(|c| c.context)
                .unwrap_or_else(|| serde_json::json!({}));
            if let serde_json::Value::Object(current) = &mut context {
                for (k, v) in incoming {
                    current.insert(k.clone(), v.clone());
                }
            } else {
                context = serde_json::Value::Object(incoming.clone());
            }
            store.update_context(conversation_id, context).await?;
        }
    }
    Ok(())
}

async fn with_retry<T, F, Fut>(retries: u32, backoff: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < retries => {
                attempt += 1;
                tracing::debug!(attempt, error = %e, "store write failed, retrying");
                tokio::time::sleep(backoff * 2u32.saturating_pow(attempt - 1)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[async_trait]
impl UtteranceHandler for AgentOrchestrator {
    async fn handle_utterance(&self, inbound: InboundMessage) -> OutboundMessage {
        self.handle_turn(inbound).await
    }
}
