use async_trait::async_trait;
use serde_json::{json, Value};

use super::{LlmProvider, ProviderError, ProviderRequest, ProviderResponse};

/// Offline provider for local runs and smoke tests. Repeats the newest user
/// message back; never fails.
#[derive(Clone, Copy, Debug, Default)]
pub struct EchoProvider;

#[async_trait]
impl LlmProvider for EchoProvider {
    fn id(&self) -> &str {
        "echo"
    }

    fn format_history(&self, request: &ProviderRequest) -> Value {
        json!({
            "system": request.system,
            "messages": request
                .messages
                .iter()
                .map(|message| json!({ "role": message.role.as_str(), "content": message.content }))
                .collect::<Vec<_>>(),
        })
    }

    async fn invoke(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let text = format!("You said: {}", request.last_user_message().unwrap_or_default());
        Ok(ProviderResponse {
            input_tokens: self.count_tokens(&request.prompt_text()),
            output_tokens: self.count_tokens(&text),
            text,
            finish_reason: Some("stop".to_string()),
        })
    }
}
