use async_trait::async_trait;
use parley_core::config::LlmConfig;
use parley_core::domain::conversation::Role;
use serde::Deserialize;
use serde_json::{json, Value};

use super::factory::{base_url, http_client, FactoryError};
use super::{post_json, LlmProvider, ProviderError, ProviderRequest, ProviderResponse};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Local models served by Ollama's `/api/chat`. No credentials.
pub struct OllamaProvider {
    http: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaProvider {
    pub fn from_config(config: &LlmConfig) -> Result<Self, FactoryError> {
        Ok(Self {
            http: http_client(config)?,
            base_url: base_url(config, DEFAULT_BASE_URL),
            model: config.model.clone(),
        })
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    message: Option<ResponseMessage>,
    done_reason: Option<String>,
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn id(&self) -> &str {
        "ollama"
    }

    fn format_history(&self, request: &ProviderRequest) -> Value {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.extend(request.messages.iter().map(|message| {
            let role = match message.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            json!({ "role": role, "content": message.content })
        }));

        json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
            "options": {
                "num_predict": request.max_tokens,
                "temperature": request.temperature,
                "top_p": request.top_p,
            },
        })
    }

    async fn invoke(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let body = self.format_history(request);
        let builder = self.http.post(format!("{}/api/chat", self.base_url));

        let response: ChatResponse = post_json(builder, &body).await?;
        let text = response
            .message
            .map(|message| message.content)
            .ok_or_else(|| ProviderError::Permanent("response is missing `message`".to_string()))?;

        let input_tokens =
            response.prompt_eval_count.unwrap_or_else(|| self.count_tokens(&request.prompt_text()));
        let output_tokens = response.eval_count.unwrap_or_else(|| self.count_tokens(&text));

        Ok(ProviderResponse { text, input_tokens, output_tokens, finish_reason: response.done_reason })
    }
}
