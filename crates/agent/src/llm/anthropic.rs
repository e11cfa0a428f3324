use async_trait::async_trait;
use parley_core::config::LlmConfig;
use parley_core::domain::conversation::Role;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};

use super::factory::{base_url, http_client, require_api_key, FactoryError};
use super::{post_json, LlmProvider, ProviderError, ProviderRequest, ProviderResponse};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    http: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    model: String,
}

impl AnthropicProvider {
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
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

/// The Messages API wants strictly alternating roles starting with a user
/// turn, so adjacent turns of the same role are merged.
fn alternating_messages(request: &ProviderRequest) -> Vec<Value> {
    let mut merged: Vec<(&'static str, String)> = Vec::new();
    for message in &request.messages {
        let role = match message.role {
            Role::Assistant => "assistant",
            Role::User | Role::System => "user",
        };
        match merged.last_mut() {
            Some((last_role, content)) if *last_role == role => {
                content.push_str("\n\n");
                content.push_str(&message.content);
            }
            _ => merged.push((role, message.content.clone())),
        }
    }
    if merged.first().is_some_and(|(role, _)| *role == "assistant") {
        merged.remove(0);
    }
    merged.into_iter().map(|(role, content)| json!({ "role": role, "content": content })).collect()
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn id(&self) -> &str {
        "anthropic"
    }

    /// Sends `temperature` only; recent Messages models refuse a request that
    /// also sets `top_p`.
    fn format_history(&self, request: &ProviderRequest) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": alternating_messages(request),
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });
        if let Some(system) = &request.system {
            body["system"] = Value::String(system.clone());
        }
        body
    }

    async fn invoke(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let body = self.format_history(request);
        let builder = self
            .http
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION);

        let response: MessagesResponse = post_json(builder, &body).await?;
        let text = response
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");

        let (input_tokens, output_tokens) = match response.usage {
            Some(usage) => (usage.input_tokens, usage.output_tokens),
            None => (self.count_tokens(&request.prompt_text()), self.count_tokens(&text)),
        };

        Ok(ProviderResponse { text, input_tokens, output_tokens, finish_reason: response.stop_reason })
    }
}
