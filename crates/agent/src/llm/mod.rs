//! Provider-neutral language model interface.
//!
//! Every backend translates [`ProviderRequest`] into its own wire shape in
//! `format_history`, performs the call in `invoke`, and reports usage. Wire
//! formats never escape the backend module.

pub mod anthropic;
pub mod echo;
pub mod factory;
pub mod ollama;
pub mod openai;

use std::time::Duration;

use async_trait::async_trait;
use parley_core::config::LlmConfig;
use parley_core::domain::conversation::{Role, Turn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

pub use factory::{FactoryError, ProviderFactory};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl From<&Turn> for ChatMessage {
    fn from(turn: &Turn) -> Self {
        Self { role: turn.role, content: turn.content.clone() }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f64,
    pub top_p: f64,
}

impl From<&LlmConfig> for GenerationParams {
    fn from(config: &LlmConfig) -> Self {
        Self { max_tokens: config.max_tokens, temperature: config.temperature, top_p: config.top_p }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProviderRequest {
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f64,
    pub top_p: f64,
}

impl ProviderRequest {
    /// Text of the newest user message.
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(|message| message.content.as_str())
    }

    /// Every piece of text the provider will see, for local token estimates.
    pub fn prompt_text(&self) -> String {
        let mut parts: Vec<&str> = Vec::with_capacity(self.messages.len() + 1);
        if let Some(system) = &self.system {
            parts.push(system);
        }
        parts.extend(self.messages.iter().map(|message| message.content.as_str()));
        parts.join("\n")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderResponse {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub finish_reason: Option<String>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Worth retrying: timeouts, throttling, upstream 5xx.
    #[error("transient provider failure: {0}")]
    Transient(String),
    /// Retrying will not help: bad request, auth, undecodable payload.
    #[error("permanent provider failure: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Transient(_) => "provider_unavailable",
            Self::Permanent(_) => "provider_rejected",
        }
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        let snippet: String = body.chars().take(200).collect();
        let message = format!("HTTP {status}: {snippet}");
        match status {
            408 | 429 | 500..=599 => Self::Transient(message),
            _ => Self::Permanent(message),
        }
    }

    pub fn from_transport(error: reqwest::Error) -> Self {
        if error.is_decode() || error.is_builder() {
            Self::Permanent(error.to_string())
        } else {
            Self::Transient(error.to_string())
        }
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn id(&self) -> &str;

    /// Backend-specific request body for this conversation.
    fn format_history(&self, request: &ProviderRequest) -> Value;

    async fn invoke(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError>;

    fn count_tokens(&self, text: &str) -> u32 {
        approximate_tokens(text)
    }
}

/// Sends a JSON body and decodes a typed reply, classifying failures.
pub(crate) async fn post_json<T: serde::de::DeserializeOwned>(
    builder: reqwest::RequestBuilder,
    body: &Value,
) -> Result<T, ProviderError> {
    let response = builder.json(body).send().await.map_err(ProviderError::from_transport)?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(ProviderError::from_status(status.as_u16(), &text));
    }

    response.json::<T>().await.map_err(|error| {
        ProviderError::Permanent(format!("undecodable provider response: {error}"))
    })
}

/// Roughly four characters per token.
pub fn approximate_tokens(text: &str) -> u32 {
    let chars = text.chars().count();
    u32::try_from(chars.div_ceil(4)).unwrap_or(u32::MAX)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 2, base_delay_ms: 250, max_delay_ms: 5_000 }
    }
}

impl From<&LlmConfig> for RetryPolicy {
    fn from(config: &LlmConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay_ms: config.retry_base_delay_ms,
            max_delay_ms: config.retry_max_delay_ms,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let multiplier = 1_u64 << exponent;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

/// Calls the provider, retrying transient failures with exponential backoff.
/// Each attempt is bounded by `timeout`; an overrun counts as transient.
pub async fn invoke_with_retry(
    provider: &dyn LlmProvider,
    request: &ProviderRequest,
    policy: &RetryPolicy,
    timeout: Duration,
    correlation_id: &str,
) -> Result<ProviderResponse, ProviderError> {
    let mut attempt = 0_u32;
    loop {
        let result = match tokio::time::timeout(timeout, provider.invoke(request)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Transient(format!(
                "no response within {}ms",
                timeout.as_millis()
            ))),
        };

        let error = match result {
            Ok(response) => return Ok(response),
            Err(error) => error,
        };

        if !error.is_transient() || attempt >= policy.max_retries {
            warn!(
                event_name = "agent.llm.invoke_failed",
                correlation_id,
                provider = provider.id(),
                attempt,
                max_retries = policy.max_retries,
                error = %error,
                "provider call failed"
            );
            return Err(error);
        }

        let delay = policy.backoff(attempt);
        warn!(
            event_name = "agent.llm.retry_scheduled",
            correlation_id,
            provider = provider.id(),
            attempt,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "transient provider failure, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::testing::{reply, ScriptedProvider};
    use super::{
        approximate_tokens, invoke_with_retry, ProviderError, ProviderRequest, RetryPolicy,
    };

    fn request() -> ProviderRequest {
        ProviderRequest {
            system: None,
            messages: Vec::new(),
            max_tokens: 64,
            temperature: 0.0,
            top_p: 1.0,
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy { max_retries, base_delay_ms: 1, max_delay_ms: 2 }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy { max_retries: 5, base_delay_ms: 250, max_delay_ms: 1_000 };
        assert_eq!(policy.backoff(0), Duration::from_millis(250));
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(40), Duration::from_millis(1_000));
    }

    #[test]
    fn status_codes_are_classified() {
        assert!(ProviderError::from_status(429, "slow down").is_transient());
        assert!(ProviderError::from_status(503, "").is_transient());
        assert!(ProviderError::from_status(408, "").is_transient());
        assert!(!ProviderError::from_status(401, "bad key").is_transient());
        assert!(!ProviderError::from_status(400, "malformed").is_transient());
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(approximate_tokens(""), 0);
        assert_eq!(approximate_tokens("abc"), 1);
        assert_eq!(approximate_tokens("abcdefgh"), 2);
        assert_eq!(approximate_tokens("abcdefghi"), 3);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let provider = ScriptedProvider::with_outcomes([
            Err(ProviderError::Transient("HTTP 503".to_string())),
            Err(ProviderError::Transient("HTTP 429".to_string())),
            reply("third time lucky"),
        ]);

        let response =
            invoke_with_retry(&provider, &request(), &fast_policy(2), Duration::from_secs(1), "t-1")
                .await
                .expect("third attempt succeeds");

        assert_eq!(response.text, "third time lucky");
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn retries_stop_at_the_configured_maximum() {
        let provider = ScriptedProvider::with_outcomes(
            (0..5).map(|_| Err(ProviderError::Transient("HTTP 503".to_string()))),
        );

        let error =
            invoke_with_retry(&provider, &request(), &fast_policy(2), Duration::from_secs(1), "t-2")
                .await
                .expect_err("budget exhausted");

        assert!(error.is_transient());
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let provider = ScriptedProvider::with_outcomes([
            Err(ProviderError::Permanent("HTTP 401".to_string())),
            reply("never reached"),
        ]);

        let error =
            invoke_with_retry(&provider, &request(), &fast_policy(3), Duration::from_secs(1), "t-3")
                .await
                .expect_err("permanent");

        assert_eq!(error, ProviderError::Permanent("HTTP 401".to_string()));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn slow_provider_counts_as_transient_timeout() {
        let provider = ScriptedProvider::slow(Duration::from_millis(200));

        let error = invoke_with_retry(
            &provider,
            &request(),
            &fast_policy(1),
            Duration::from_millis(10),
            "t-4",
        )
        .await
        .expect_err("deadline exceeded on every attempt");

        assert!(error.is_transient());
        assert_eq!(provider.calls(), 2);
    }
}
