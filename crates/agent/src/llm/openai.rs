use async_trait::async_trait;
use parley_core::config::LlmConfig;
use parley_core::domain::conversation::Role;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};

use super::factory::{base_url, http_client, require_api_key, FactoryError};
use super::{post_json, LlmProvider, ProviderError, ProviderRequest, ProviderResponse};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Chat Completions backend. Also serves OpenAI-compatible gateways via `base_url`.
pub struct OpenAiProvider {
    http: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    model: String,
}

impl OpenAiProvider {
    pub fn from_config(config: &LlmConfig) -> Result<Self, FactoryError> {
        Ok(Self {
            http: http_client(config)?,
            api_key: require_api_key(config)?,
            base_url: base_url(config, DEFAULT_BASE_URL),
            model: config.model.clone(),
        })
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn id(&self) -> &str {
        "openai"
    }

    fn format_history(&self, request: &ProviderRequest) -> Value {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        for message in &request.messages {
            let role = match message.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            messages.push(json!({ "role": role, "content": message.content }));
        }

        json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "top_p": request.top_p,
        })
    }

    async fn invoke(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let body = self.format_history(request);
        let builder = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret());

        let response: CompletionResponse = post_json(builder, &body).await?;
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Permanent("response contained no choices".to_string()))?;

        let text = choice.message.content.unwrap_or_default();
        let (input_tokens, output_tokens) = match response.usage {
            Some(usage) => (usage.prompt_tokens, usage.completion_tokens),
            None => (self.count_tokens(&request.prompt_text()), self.count_tokens(&text)),
        };

        Ok(ProviderResponse { text, input_tokens, output_tokens, finish_reason: choice.finish_reason })
    }
}

#[cfg(test)]
mod tests {
    use parley_core::config::AppConfig;
    use parley_core::domain::conversation::Role;

    use super::OpenAiProvider;
    use crate::llm::{ChatMessage, LlmProvider, ProviderRequest};

    #[test]
    fn history_puts_system_prompt_first() {
        let mut llm = AppConfig::default().llm;
        llm.provider = "openai".to_string();
        llm.api_key = Some("sk-test".to_string().into());
        llm.base_url = None;
        llm.model = "gpt-4o-mini".to_string();
        let provider = OpenAiProvider::from_config(&llm).expect("provider");

        let body = provider.format_history(&ProviderRequest {
            system: Some("be brief".to_string()),
            messages: vec![ChatMessage { role: Role::User, content: "hi".to_string() }],
            max_tokens: 100,
            temperature: 0.1,
            top_p: 0.9,
        });

        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert_eq!(body["max_tokens"], 100);
        assert_eq!(provider.base_url, "https://api.openai.com/v1");
    }
}
