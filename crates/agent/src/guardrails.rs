use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use parley_core::config::{GuardrailConfig, GuardrailMode};
use parley_core::domain::conversation::{ConversationContext, Role};
use regex::Regex;
use tokio::sync::watch;

use crate::conversation::{normalize_text, tokenize};
use crate::detector::DetectionResult;

const MAX_RESPONSE_CHARS: usize = 5000;
const TRUNCATED_RESPONSE_CHARS: usize = 4800;
const TRUNCATION_MARKER: &str = "... [Response truncated for length]";
const REPETITION_WINDOW: usize = 5;
const MAX_REPEATS: usize = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardrailDecision {
    Allow,
    Deny { reason_code: &'static str, user_message: String },
}

impl GuardrailDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Self::Allow => None,
            Self::Deny { reason_code, .. } => Some(reason_code),
        }
    }

    pub fn user_message(&self) -> Option<&str> {
        match self {
            Self::Allow => None,
            Self::Deny { user_message, .. } => Some(user_message),
        }
    }

    fn deny(reason_code: &'static str, user_message: impl Into<String>) -> Self {
        Self::Deny { reason_code, user_message: user_message.into() }
    }
}

/// Stateless gate over general conversation. Every decision is a function of
/// the settings snapshot, the conversation so far, the message, the
/// detection outcome and the clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct GuardrailPolicy;

impl GuardrailPolicy {
    pub fn evaluate(
        &self,
        context: &ConversationContext,
        message: &str,
        detection: &DetectionResult,
        settings: &GuardrailConfig,
    ) -> GuardrailDecision {
        self.evaluate_at(context, message, detection, settings, Utc::now())
    }

    pub fn evaluate_at(
        &self,
        context: &ConversationContext,
        message: &str,
        detection: &DetectionResult,
        settings: &GuardrailConfig,
        now: DateTime<Utc>,
    ) -> GuardrailDecision {
        if settings.mode == GuardrailMode::Disabled {
            return GuardrailDecision::deny(
                "chat_disabled",
                "The assistant is not accepting messages right now.",
            );
        }

        let trimmed = message.trim();
        if trimmed.is_empty() {
            return GuardrailDecision::deny("empty_message", "Please enter a message.");
        }

        if trimmed.chars().count() > settings.max_input_length {
            return GuardrailDecision::deny(
                "message_too_long",
                format!(
                    "Your message is too long. Please keep it under {} characters.",
                    settings.max_input_length
                ),
            );
        }

        if context.len() >= settings.max_conversation_length {
            return GuardrailDecision::deny(
                "conversation_limit_reached",
                "This conversation has reached its length limit. Please start a new session.",
            );
        }

        if session_expired(context, settings.session_timeout_minutes, now) {
            return GuardrailDecision::deny(
                "session_expired",
                "Your session has expired. Please start a new conversation.",
            );
        }

        if settings.content_filter_enabled && contains_blocked_term(trimmed, &settings.blocked_terms)
        {
            return GuardrailDecision::deny(
                "inappropriate_content",
                "I can't help with that request. Please keep the conversation on supported topics.",
            );
        }

        if settings.sensitive_data_filter_enabled && contains_sensitive_data(trimmed) {
            return GuardrailDecision::deny(
                "sensitive_information",
                "Please don't share card numbers, social security numbers or e-mail addresses \
                 here. Remove them and try again.",
            );
        }

        if settings.repetition_filter_enabled && repeats_recent_message(context, trimmed) {
            return GuardrailDecision::deny(
                "repeated_message",
                "Please don't repeat the same message. Try rephrasing your request or ask a \
                 different question.",
            );
        }

        if settings.mode == GuardrailMode::ToolOnly && !detection.matched {
            return GuardrailDecision::deny(
                "general_chat_disabled",
                settings.rejection_message.clone(),
            );
        }

        GuardrailDecision::Allow
    }

    /// Caps overly long model output before it reaches the caller.
    pub fn sanitize_response(&self, text: &str) -> String {
        if text.chars().count() <= MAX_RESPONSE_CHARS {
            return text.to_string();
        }
        let mut truncated: String = text.chars().take(TRUNCATED_RESPONSE_CHARS).collect();
        truncated.push_str(TRUNCATION_MARKER);
        truncated
    }
}

fn contains_blocked_term(message: &str, blocked_terms: &[String]) -> bool {
    let tokens = tokenize(&normalize_text(message));
    blocked_terms.iter().any(|term| {
        let words = tokenize(&normalize_text(term));
        !words.is_empty() && tokens.windows(words.len()).any(|window| window == words.as_slice())
    })
}

fn session_expired(context: &ConversationContext, timeout_minutes: u64, now: DateTime<Utc>) -> bool {
    if timeout_minutes == 0 {
        return false;
    }
    let Ok(limit_secs) = i64::try_from(timeout_minutes.saturating_mul(60)) else {
        return false;
    };
    context.started_at().is_some_and(|started| (now - started).num_seconds() > limit_secs)
}

fn repeats_recent_message(context: &ConversationContext, message: &str) -> bool {
    let repeats = context
        .recent(REPETITION_WINDOW)
        .iter()
        .filter(|turn| turn.role == Role::User && turn.content.trim() == message)
        .count();
    repeats >= MAX_REPEATS
}

fn sensitive_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"\b\d{4}[- ]?\d{4}[- ]?\d{4}[- ]?\d{4}\b",
            r"\b\d{3}-\d{2}-\d{4}\b",
            r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
        ]
        .into_iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
    })
}

fn contains_sensitive_data(message: &str) -> bool {
    sensitive_patterns().iter().any(|pattern| pattern.is_match(message))
}

/// Live guardrail settings. Readers take a whole snapshot per request, so a
/// reload is seen either entirely or not at all.
#[derive(Clone)]
pub struct GuardrailHandle {
    sender: Arc<watch::Sender<Arc<GuardrailConfig>>>,
}

impl GuardrailHandle {
    pub fn new(settings: GuardrailConfig) -> Self {
        let (sender, _) = watch::channel(Arc::new(settings));
        Self { sender: Arc::new(sender) }
    }

    pub fn snapshot(&self) -> Arc<GuardrailConfig> {
        Arc::clone(&self.sender.borrow())
    }

    pub fn reload(&self, settings: GuardrailConfig) {
        self.sender.send_replace(Arc::new(settings));
    }

    pub fn set_mode(&self, mode: GuardrailMode) {
        self.sender.send_modify(|current| {
            let mut next = GuardrailConfig::clone(current);
            next.mode = mode;
            *current = Arc::new(next);
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<GuardrailConfig>> {
        self.sender.subscribe()
    }
}

impl Default for GuardrailHandle {
    fn default() -> Self {
        Self::new(GuardrailConfig::default())
    }
}
