//! Agent Runtime - tool-aware conversational orchestration
//!
//! This crate provides the request path of parley: every chat message is
//! checked for a tool intent, gated by the guardrail policy, and answered
//! either by a registered tool, a language model, or both.
//!
//! # Architecture
//!
//! Each request walks one explicit state machine (see `parley_core::flows`):
//! 1. **Detection** (`detector`) - Score registered tools against the message
//! 2. **Guardrails** (`guardrails`) - Decide whether any side effect may happen
//! 3. **Tool Execution** (`executor`) - Validate arguments, run with a deadline
//! 4. **Model Call** (`llm`) - Provider-neutral invoke with bounded retries
//! 5. **Assembly** (`runtime`) - Build the reply and persist the turns
//!
//! # Key Types
//!
//! - `AgentRuntime` - Flow controller (see `runtime` module)
//! - `ToolRegistry` - Immutable table of tools built at startup
//! - `LlmProvider` - Pluggable trait for OpenAI/Anthropic/Ollama
//! - `GuardrailPolicy` - Stateless allow/deny decision per request
//!
//! # Safety Principle
//!
//! The guardrail decision is the single authority over whether a tool or the
//! model is called. Nothing internal (provider payloads, tool errors) ever
//! reaches the caller verbatim.

pub mod conversation;
pub mod detector;
pub mod executor;
pub mod guardrails;
pub mod llm;
pub mod runtime;
pub mod session;
pub mod tools;

pub use detector::{DetectionResult, ToolDetector};
pub use executor::{ToolCallStatus, ToolExecutionRecord, ToolExecutor};
pub use guardrails::{GuardrailDecision, GuardrailHandle, GuardrailPolicy};
pub use llm::{LlmProvider, ProviderError, ProviderFactory};
pub use runtime::{AgentRuntime, ChatReply, ChatRequest, ReplyStatus, ToolCallSummary};
pub use session::{InMemorySessionStore, SessionLocks, SessionStore, SessionStoreError, SessionSummary};
pub use tools::{Tool, ToolRegistry, ToolSpec};
