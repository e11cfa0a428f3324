//! End-to-end flow controller behaviour with scripted collaborators.
//!
//! Every test builds a runtime around a provider that replays canned
//! outcomes and a tool that counts its invocations, so the assertions can
//! prove which side effects happened.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parley_agent::llm::{ProviderRequest, ProviderResponse};
use parley_agent::tools::{DeliveryTracker, ToolArguments};
use parley_agent::{
    AgentRuntime, ChatRequest, InMemorySessionStore, LlmProvider, ProviderError, ReplyStatus,
    SessionStore, Tool, ToolCallStatus, ToolRegistry, ToolSpec,
};
use parley_core::config::{AppConfig, GuardrailMode};
use parley_core::domain::conversation::{Role, SessionId};
use parley_core::flows::FlowState;
use serde_json::{json, Value};

#[derive(Default)]
struct ScriptedProvider {
    outcomes: Mutex<VecDeque<Result<ProviderResponse, ProviderError>>>,
    seen_history: Mutex<Vec<usize>>,
    calls: AtomicUsize,
    delay: Duration,
}

impl ScriptedProvider {
    fn new(outcomes: Vec<Result<ProviderResponse, ProviderError>>) -> Self {
        Self { outcomes: Mutex::new(outcomes.into()), ..Self::default() }
    }

    fn slow(delay: Duration) -> Self {
        Self { delay, ..Self::default() }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn seen_history(&self) -> Vec<usize> {
        self.seen_history.lock().expect("history log").clone()
    }
}

fn text(reply: &str) -> Result<ProviderResponse, ProviderError> {
    Ok(ProviderResponse {
        text: reply.to_string(),
        input_tokens: 40,
        output_tokens: 9,
        finish_reason: Some("stop".to_string()),
    })
}

fn unavailable() -> Result<ProviderResponse, ProviderError> {
    Err(ProviderError::Transient("HTTP 503: upstream overloaded".to_string()))
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn id(&self) -> &str {
        "scripted"
    }

    fn format_history(&self, request: &ProviderRequest) -> Value {
        json!({ "messages": request.messages.len() })
    }

    async fn invoke(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_history.lock().expect("history log").push(request.messages.len());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.outcomes.lock().expect("outcome queue").pop_front();
        next.unwrap_or_else(|| text("Happy to help."))
    }
}

/// The built-in tracker, counted.
struct CountingTracker {
    inner: DeliveryTracker,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for CountingTracker {
    fn spec(&self) -> ToolSpec {
        self.inner.spec()
    }

    async fn run(&self, arguments: ToolArguments) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.run(arguments).await
    }
}

struct Harness {
    runtime: AgentRuntime,
    provider: Arc<ScriptedProvider>,
    store: Arc<InMemorySessionStore>,
    tool_calls: Arc<AtomicUsize>,
}

fn config(mode: GuardrailMode) -> AppConfig {
    let mut config = AppConfig::default();
    config.guardrails.mode = mode;
    config.llm.max_retries = 2;
    config.llm.retry_base_delay_ms = 1;
    config.llm.retry_max_delay_ms = 4;
    config
}

fn harness(config: &AppConfig, provider: ScriptedProvider) -> Harness {
    let tool_calls = Arc::new(AtomicUsize::new(0));
    let mut registry = ToolRegistry::new();
    registry
        .register(CountingTracker { inner: DeliveryTracker::default(), calls: tool_calls.clone() })
        .expect("register tracker");

    let provider = Arc::new(provider);
    let store = Arc::new(InMemorySessionStore::new());
    let runtime = AgentRuntime::new(config, Arc::new(registry), provider.clone(), store.clone());
    Harness { runtime, provider, store, tool_calls }
}

#[tokio::test]
async fn disabled_mode_performs_no_tool_or_model_calls() {
    let h = harness(&config(GuardrailMode::Disabled), ScriptedProvider::default());

    for message in ["track my order 12345", "tell me a joke", "where is my parcel 99812?"] {
        let reply = h.runtime.handle(ChatRequest::new("s-disabled", message)).await;
        assert_eq!(reply.status, ReplyStatus::Rejected);
        assert_eq!(reply.reason_code.as_deref(), Some("chat_disabled"));
        assert!(reply.tool_call.is_none());
    }

    assert_eq!(h.tool_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.provider.calls(), 0);
}

#[tokio::test]
async fn tool_only_mode_rejects_general_chat_without_invoking_the_model() {
    let h = harness(&config(GuardrailMode::ToolOnly), ScriptedProvider::default());

    let reply = h.runtime.handle(ChatRequest::new("s-joke", "tell me a joke")).await;

    assert_eq!(reply.status, ReplyStatus::Rejected);
    assert_eq!(reply.reason_code.as_deref(), Some("general_chat_disabled"));
    assert_eq!(reply.response_text, AppConfig::default().guardrails.rejection_message);
    assert_eq!(reply.trace, vec![
        FlowState::Received,
        FlowState::Detecting,
        FlowState::Guarding,
        FlowState::Done,
    ]);
    assert_eq!(h.provider.calls(), 0);
    assert_eq!(h.tool_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn order_tracking_runs_the_tool_and_reports_the_call() {
    let h = harness(
        &config(GuardrailMode::ToolOnly),
        ScriptedProvider::new(vec![text("Order 12345 is in transit with Parley Express.")]),
    );

    let reply = h.runtime.handle(ChatRequest::new("s-order", "track my order 12345")).await;

    assert_eq!(reply.status, ReplyStatus::Answered);
    let call = reply.tool_call.expect("tool call summary");
    assert_eq!(call.name, "delivery_tracker");
    assert_eq!(call.status, ToolCallStatus::Success);
    assert_eq!(reply.response_text, "Order 12345 is in transit with Parley Express.");
    assert_eq!((reply.input_tokens, reply.output_tokens), (40, 9));
    assert_eq!(h.tool_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.provider.calls(), 1);

    let history = h.store.load(&SessionId::from("s-order")).await.expect("load history");
    assert_eq!(history.len(), 2);
    assert_eq!(history.turns()[0].content, "track my order 12345");
    assert_eq!(history.turns()[1].tool_name.as_deref(), Some("delivery_tracker"));
}

#[tokio::test]
async fn missing_identifier_is_reported_as_validation_error() {
    let h = harness(&config(GuardrailMode::Open), ScriptedProvider::default());

    let reply = h.runtime.handle(ChatRequest::new("s-missing", "where is my delivery?")).await;

    assert_eq!(reply.status, ReplyStatus::Answered);
    assert_eq!(reply.tool_call.map(|call| call.status), Some(ToolCallStatus::ValidationError));
    assert_eq!(h.tool_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn package_question_and_bare_number_reply_stay_on_the_tool_path() {
    let h = harness(&config(GuardrailMode::ToolOnly), ScriptedProvider::default());

    let ask = h.runtime.handle(ChatRequest::new("s-bare", "where is my package?")).await;
    assert_eq!(ask.status, ReplyStatus::Answered);
    assert_eq!(ask.tool_call.map(|call| call.status), Some(ToolCallStatus::ValidationError));

    let answer = h.runtime.handle(ChatRequest::new("s-bare", "1Z999AA1012")).await;
    assert_eq!(answer.status, ReplyStatus::Answered);
    assert_eq!(answer.tool_call.map(|call| call.status), Some(ToolCallStatus::Success));
    assert_eq!(h.tool_calls.load(Ordering::SeqCst), 1);

    let history = h.store.load(&SessionId::from("s-bare")).await.expect("load");
    assert_eq!(history.len(), 4);
}

#[tokio::test]
async fn transient_failures_within_budget_still_answer() {
    let h = harness(
        &config(GuardrailMode::Open),
        ScriptedProvider::new(vec![unavailable(), unavailable(), text("Paris.")]),
    );

    let reply = h.runtime.handle(ChatRequest::new("s-retry", "what's the capital of France")).await;

    assert_eq!(reply.status, ReplyStatus::Answered);
    assert_eq!(reply.response_text, "Paris.");
    assert_eq!(h.provider.calls(), 3);
}

#[tokio::test]
async fn exhausted_retries_degrade_instead_of_hanging() {
    let h = harness(
        &config(GuardrailMode::Open),
        ScriptedProvider::new((0..10).map(|_| unavailable()).collect()),
    );

    let reply = tokio::time::timeout(
        Duration::from_secs(5),
        h.runtime.handle(ChatRequest::new("s-down", "what's the capital of France")),
    )
    .await
    .expect("reply arrives without hanging");

    assert_eq!(reply.status, ReplyStatus::Degraded);
    assert_eq!(reply.reason_code.as_deref(), Some("provider_unavailable"));
    assert!(!reply.response_text.contains("503"));
    assert_eq!(reply.trace.last(), Some(&FlowState::Error));
    assert_eq!(h.provider.calls(), 3);
    assert!(h.store.load(&SessionId::from("s-down")).await.expect("load").is_empty());
}

#[tokio::test]
async fn same_session_messages_apply_in_submission_order() {
    let h = harness(&config(GuardrailMode::Open), ScriptedProvider::slow(Duration::from_millis(40)));
    let runtime = Arc::new(h.runtime);

    let first = {
        let runtime = Arc::clone(&runtime);
        tokio::spawn(async move { runtime.handle(ChatRequest::new("s-busy", "first question")).await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = {
        let runtime = Arc::clone(&runtime);
        tokio::spawn(async move { runtime.handle(ChatRequest::new("s-busy", "second question")).await })
    };

    let (first, second) = (first.await.expect("first task"), second.await.expect("second task"));
    assert_eq!(first.status, ReplyStatus::Answered);
    assert_eq!(second.status, ReplyStatus::Answered);

    let history = h.store.load(&SessionId::from("s-busy")).await.expect("load");
    let transcript: Vec<(Role, &str)> =
        history.turns().iter().map(|turn| (turn.role, turn.content.as_str())).collect();
    assert_eq!(transcript, vec![
        (Role::User, "first question"),
        (Role::Assistant, "Happy to help."),
        (Role::User, "second question"),
        (Role::Assistant, "Happy to help."),
    ]);

    // The second call saw the first exchange.
    assert_eq!(h.provider.seen_history(), vec![1, 3]);
}

#[tokio::test]
async fn different_sessions_do_not_wait_on_each_other() {
    let h = harness(&config(GuardrailMode::Open), ScriptedProvider::slow(Duration::from_millis(150)));
    let runtime = Arc::new(h.runtime);

    let started = tokio::time::Instant::now();
    let tasks: Vec<_> = (0..4)
        .map(|i| {
            let runtime = Arc::clone(&runtime);
            tokio::spawn(async move {
                runtime.handle(ChatRequest::new(format!("s-par-{i}"), "hello there")).await
            })
        })
        .collect();
    for task in tasks {
        assert_eq!(task.await.expect("task").status, ReplyStatus::Answered);
    }

    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(h.store.session_count().await, 4);
}

#[tokio::test]
async fn guardrail_reload_applies_to_the_next_request() {
    let h = harness(&config(GuardrailMode::Open), ScriptedProvider::default());

    let before = h.runtime.handle(ChatRequest::new("s-reload", "tell me a joke")).await;
    assert_eq!(before.status, ReplyStatus::Answered);

    h.runtime.guardrails().set_mode(GuardrailMode::ToolOnly);

    let after = h.runtime.handle(ChatRequest::new("s-reload", "tell me another joke")).await;
    assert_eq!(after.status, ReplyStatus::Rejected);
    assert_eq!(h.provider.calls(), 1);
}
