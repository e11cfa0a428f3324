use std::sync::Arc;
use std::time::{Duration, Instant};

use parley_core::config::{AppConfig, GuardrailMode};
use parley_core::domain::conversation::{ConversationContext, SessionId, Turn};
use parley_core::errors::{ApplicationError, DomainError, InterfaceError};
use parley_core::flows::{
    FlowAction, FlowContext, FlowEvent, FlowRun, FlowState, TransitionOutcome,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::conversation::{awaiting_input, build_request, render_tool_result, system_prompt};
use crate::detector::{DetectionResult, ToolDetector};
use crate::executor::{ToolCallStatus, ToolExecutionRecord, ToolExecutor};
use crate::guardrails::{GuardrailDecision, GuardrailHandle, GuardrailPolicy};
use crate::llm::{
    invoke_with_retry, GenerationParams, LlmProvider, ProviderError, ProviderResponse, RetryPolicy,
};
use crate::session::{SessionLocks, SessionStore, SessionStoreError, SessionSummary};
use crate::tools::ToolRegistry;

const DEGRADED_MESSAGE: &str =
    "I'm having trouble reaching the assistant service right now. Please try again in a moment.";
const TOOL_UNAVAILABLE_MESSAGE: &str =
    "That lookup isn't available right now. Please try again later.";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub session_id: SessionId,
    pub message: String,
}

impl ChatRequest {
    pub fn new(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self { session_id: SessionId(session_id.into()), message: message.into() }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Answered,
    Rejected,
    /// The model could not be reached or refused the request.
    Degraded,
    Failed,
}

impl ReplyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Answered => "answered",
            Self::Rejected => "rejected",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ToolCallSummary {
    pub name: String,
    pub status: ToolCallStatus,
}

impl From<&ToolExecutionRecord> for ToolCallSummary {
    fn from(record: &ToolExecutionRecord) -> Self {
        Self { name: record.tool_name.clone(), status: record.status }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChatReply {
    pub correlation_id: String,
    pub response_text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub tool_call: Option<ToolCallSummary>,
    pub status: ReplyStatus,
    pub reason_code: Option<String>,
    /// States visited by this request, first to last.
    pub trace: Vec<FlowState>,
}

/// Per-request knobs derived from configuration once at startup.
#[derive(Clone, Debug)]
pub struct RuntimeSettings {
    pub tool_timeout: Duration,
    pub model_timeout: Duration,
    pub retry: RetryPolicy,
    pub generation: GenerationParams,
    pub tool_result_only: bool,
}

impl From<&AppConfig> for RuntimeSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            tool_timeout: Duration::from_secs(config.tools.timeout_secs),
            model_timeout: Duration::from_secs(config.llm.timeout_secs),
            retry: RetryPolicy::from(&config.llm),
            generation: GenerationParams::from(&config.llm),
            tool_result_only: config.tools.result_only,
        }
    }
}

enum Failure {
    Provider { error: ProviderError, tool_record: Option<ToolExecutionRecord> },
    /// The detector picked a tool the executor cannot resolve.
    ToolUnavailable(String),
    Application(ApplicationError),
}

impl From<ApplicationError> for Failure {
    fn from(error: ApplicationError) -> Self {
        Self::Application(error)
    }
}

struct Assembled {
    text: String,
    tokens: (u32, u32),
    tool_record: Option<ToolExecutionRecord>,
}

/// Conversation flow controller. One instance serves every session; each
/// request walks its own `FlowRun` while holding that session's lock.
pub struct AgentRuntime {
    registry: Arc<ToolRegistry>,
    detector: ToolDetector,
    executor: ToolExecutor,
    policy: GuardrailPolicy,
    guardrails: GuardrailHandle,
    provider: Arc<dyn LlmProvider>,
    sessions: Arc<dyn SessionStore>,
    locks: SessionLocks,
    settings: RuntimeSettings,
}

impl AgentRuntime {
    pub fn new(
        config: &AppConfig,
        registry: Arc<ToolRegistry>,
        provider: Arc<dyn LlmProvider>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        let settings = RuntimeSettings::from(config);
        Self {
            detector: ToolDetector::from_config(&config.tools, &config.detection),
            executor: ToolExecutor::new(Arc::clone(&registry), settings.tool_timeout),
            registry,
            policy: GuardrailPolicy,
            guardrails: GuardrailHandle::new(config.guardrails.clone()),
            provider,
            sessions,
            locks: SessionLocks::new(),
            settings,
        }
    }

    /// Shares an existing handle so settings reloaded elsewhere apply here.
    pub fn with_guardrail_handle(mut self, handle: GuardrailHandle) -> Self {
        self.guardrails = handle;
        self
    }

    pub fn guardrails(&self) -> &GuardrailHandle {
        &self.guardrails
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn provider_id(&self) -> &str {
        self.provider.id()
    }

    /// Stored history summary, or `None` for a session with no turns.
    pub async fn session_summary(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<SessionSummary>, SessionStoreError> {
        let context = self.sessions.load(session_id).await?;
        Ok(SessionSummary::from_context(&context))
    }

    /// Forgets a session's history. Waits for any in-flight request on the
    /// same session so its turns cannot land after the clear.
    pub async fn clear_session(&self, session_id: &SessionId) -> Result<bool, SessionStoreError> {
        let guard = self.locks.acquire(session_id).await;
        let cleared = self.sessions.clear(session_id).await;
        drop(guard);
        self.locks.prune_idle();

        if let Ok(true) = cleared {
            info!(
                event_name = "agent.session.cleared",
                correlation_id = "session-admin",
                session_id = %session_id,
                "session history cleared"
            );
        }
        cleared
    }

    pub async fn handle(&self, request: ChatRequest) -> ChatReply {
        let correlation_id = Uuid::new_v4().to_string();
        let started = Instant::now();

        let guard = self.locks.acquire(&request.session_id).await;
        let mut run = FlowRun::new();
        let outcome = self.process(&request, &correlation_id, &mut run).await;
        drop(guard);
        self.locks.prune_idle();

        let reply = match outcome {
            Ok(reply) => reply,
            Err(failure) => {
                run.fail();
                self.render_failure(failure, &request, &correlation_id, run.into_trace())
            }
        };

        info!(
            event_name = "agent.chat.completed",
            correlation_id = %reply.correlation_id,
            session_id = %request.session_id,
            status = reply.status.as_str(),
            reason_code = reply.reason_code.as_deref().unwrap_or(""),
            tool_name = reply.tool_call.as_ref().map(|call| call.name.as_str()).unwrap_or(""),
            input_tokens = reply.input_tokens,
            output_tokens = reply.output_tokens,
            duration_ms = started.elapsed().as_millis() as u64,
            "chat request finished"
        );
        reply
    }

    async fn process(
        &self,
        request: &ChatRequest,
        correlation_id: &str,
        run: &mut FlowRun,
    ) -> Result<ChatReply, Failure> {
        let context = self
            .sessions
            .load(&request.session_id)
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?;

        let mut flow = FlowContext {
            tool_result_only: self.settings.tool_result_only,
            ..FlowContext::default()
        };
        advance(run, FlowEvent::MessageAccepted, &flow, correlation_id)?;

        let detection = self.detector.detect(&request.message, &self.registry);
        debug!(
            event_name = "agent.detection.completed",
            correlation_id,
            matched = detection.matched,
            tool_name = detection.tool_name.as_deref().unwrap_or(""),
            confidence = detection.confidence,
            reasoning = %detection.reasoning,
            "tool detection finished"
        );
        flow.tool_matched = detection.matched;
        advance(run, FlowEvent::DetectionCompleted, &flow, correlation_id)?;

        let settings = self.guardrails.snapshot();
        let decision = self.policy.evaluate(&context, &request.message, &detection, &settings);
        flow.guardrail_allowed = decision.is_allowed();
        let guarded = advance(run, FlowEvent::GuardrailEvaluated, &flow, correlation_id)?;

        if guarded.actions.contains(&FlowAction::RenderRejection) {
            return Ok(reject(request, decision, correlation_id, run));
        }

        let assembled = if guarded.actions.contains(&FlowAction::ExecuteTool) {
            self.tool_path(request, &context, detection, settings.mode, correlation_id, run).await?
        } else {
            let system = system_prompt(&self.registry, settings.mode, None, awaiting_input(&context));
            let response = self.call_model(system, &context, request, correlation_id, None).await?;
            advance(run, FlowEvent::ModelCompleted, &flow, correlation_id)?;
            Assembled {
                text: response.text,
                tokens: (response.input_tokens, response.output_tokens),
                tool_record: None,
            }
        };

        let text = self.policy.sanitize_response(&assembled.text);
        let tool_name = assembled.tool_record.as_ref().map(|record| record.tool_name.clone());
        self.persist(request, &text, tool_name).await?;
        advance(run, FlowEvent::ResponseAssembled, &flow, correlation_id)?;

        Ok(ChatReply {
            correlation_id: correlation_id.to_string(),
            response_text: text,
            input_tokens: assembled.tokens.0,
            output_tokens: assembled.tokens.1,
            tool_call: assembled.tool_record.as_ref().map(ToolCallSummary::from),
            status: ReplyStatus::Answered,
            reason_code: None,
            trace: run.trace().to_vec(),
        })
    }

    async fn tool_path(
        &self,
        request: &ChatRequest,
        context: &ConversationContext,
        detection: DetectionResult,
        mode: GuardrailMode,
        correlation_id: &str,
        run: &mut FlowRun,
    ) -> Result<Assembled, Failure> {
        let tool_name = detection.tool_name.clone().ok_or_else(|| {
            ApplicationError::Domain(DomainError::InvariantViolation(
                "matched detection without a tool name".to_string(),
            ))
        })?;

        let record = self
            .executor
            .execute(&tool_name, detection.extracted_arguments, self.settings.tool_timeout)
            .await
            .map_err(|_| Failure::ToolUnavailable(tool_name.clone()))?;

        let flow = FlowContext {
            tool_matched: true,
            guardrail_allowed: true,
            tool_result_only: self.settings.tool_result_only,
        };
        let completed = advance(run, FlowEvent::ToolCompleted, &flow, correlation_id)?;

        if completed.actions.contains(&FlowAction::RenderToolResult) {
            return Ok(Assembled {
                text: render_tool_result(&record),
                tokens: (0, 0),
                tool_record: Some(record),
            });
        }

        let system = system_prompt(&self.registry, mode, Some(&record), awaiting_input(context));
        let response =
            self.call_model(system, context, request, correlation_id, Some(&record)).await?;
        Ok(Assembled {
            text: response.text,
            tokens: (response.input_tokens, response.output_tokens),
            tool_record: Some(record),
        })
    }

    async fn call_model(
        &self,
        system: String,
        context: &ConversationContext,
        request: &ChatRequest,
        correlation_id: &str,
        tool_record: Option<&ToolExecutionRecord>,
    ) -> Result<ProviderResponse, Failure> {
        let provider_request =
            build_request(system, context, &request.message, &self.settings.generation);
        invoke_with_retry(
            self.provider.as_ref(),
            &provider_request,
            &self.settings.retry,
            self.settings.model_timeout,
            correlation_id,
        )
        .await
        .map_err(|error| Failure::Provider { error, tool_record: tool_record.cloned() })
    }

    async fn persist(
        &self,
        request: &ChatRequest,
        reply: &str,
        tool_name: Option<String>,
    ) -> Result<(), Failure> {
        // Stamped in order; the store refuses a turn older than its tail.
        let user = Turn::user(request.message.as_str());
        let assistant = match tool_name {
            Some(name) => Turn::assistant(reply).with_tool(name),
            None => Turn::assistant(reply),
        };
        self.sessions
            .append(&request.session_id, vec![user, assistant])
            .await
            .map_err(|error| Failure::Application(ApplicationError::Persistence(error.to_string())))
    }

    fn render_failure(
        &self,
        failure: Failure,
        request: &ChatRequest,
        correlation_id: &str,
        trace: Vec<FlowState>,
    ) -> ChatReply {
        match failure {
            Failure::Provider { error, tool_record } => {
                warn!(
                    event_name = "agent.chat.degraded",
                    correlation_id,
                    session_id = %request.session_id,
                    provider = self.provider.id(),
                    error = %error,
                    "model unavailable, returning degraded reply"
                );
                // A finished tool lookup is still worth showing without model phrasing.
                let text = match &tool_record {
                    Some(record) => render_tool_result(record),
                    None => DEGRADED_MESSAGE.to_string(),
                };
                ChatReply {
                    correlation_id: correlation_id.to_string(),
                    response_text: text,
                    input_tokens: 0,
                    output_tokens: 0,
                    tool_call: tool_record.as_ref().map(ToolCallSummary::from),
                    status: ReplyStatus::Degraded,
                    reason_code: Some(error.reason_code().to_string()),
                    trace,
                }
            }
            Failure::ToolUnavailable(tool_name) => {
                warn!(
                    event_name = "agent.tool.unavailable",
                    correlation_id,
                    session_id = %request.session_id,
                    tool_name = %tool_name,
                    "detected tool is not registered"
                );
                ChatReply {
                    correlation_id: correlation_id.to_string(),
                    response_text: TOOL_UNAVAILABLE_MESSAGE.to_string(),
                    input_tokens: 0,
                    output_tokens: 0,
                    tool_call: None,
                    status: ReplyStatus::Rejected,
                    reason_code: Some("tool_unavailable".to_string()),
                    trace,
                }
            }
            Failure::Application(error) => {
                error!(
                    event_name = "agent.chat.failed",
                    correlation_id,
                    session_id = %request.session_id,
                    error = %error,
                    "chat request failed"
                );
                let interface = error.into_interface(correlation_id);
                ChatReply {
                    correlation_id: correlation_id.to_string(),
                    response_text: interface.user_message().to_string(),
                    input_tokens: 0,
                    output_tokens: 0,
                    tool_call: None,
                    status: ReplyStatus::Failed,
                    reason_code: Some(failure_reason(&interface).to_string()),
                    trace,
                }
            }
        }
    }
}

/// Guardrail rejections end the request without touching the session store,
/// so refused content never enters history.
fn reject(
    request: &ChatRequest,
    decision: GuardrailDecision,
    correlation_id: &str,
    run: &FlowRun,
) -> ChatReply {
    let reason_code = decision.reason().unwrap_or("rejected");
    info!(
        event_name = "agent.guardrail.rejected",
        correlation_id,
        session_id = %request.session_id,
        reason_code,
        "message rejected by guardrail policy"
    );

    ChatReply {
        correlation_id: correlation_id.to_string(),
        response_text: decision.user_message().unwrap_or_default().to_string(),
        input_tokens: 0,
        output_tokens: 0,
        tool_call: None,
        status: ReplyStatus::Rejected,
        reason_code: Some(reason_code.to_string()),
        trace: run.trace().to_vec(),
    }
}

fn failure_reason(error: &InterfaceError) -> &'static str {
    match error {
        InterfaceError::ServiceUnavailable { .. } => "service_unavailable",
        InterfaceError::Internal { .. } => "internal_error",
    }
}

fn advance(
    run: &mut FlowRun,
    event: FlowEvent,
    flow: &FlowContext,
    correlation_id: &str,
) -> Result<TransitionOutcome, Failure> {
    let outcome = run
        .apply(event, flow)
        .map_err(|error| Failure::Application(ApplicationError::Domain(DomainError::from(error))))?;
    debug!(
        event_name = "agent.flow.transition",
        correlation_id,
        from = ?outcome.from,
        to = ?outcome.to,
        event = ?outcome.event,
        "flow transition applied"
    );
    Ok(outcome)
}
