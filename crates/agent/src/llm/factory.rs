use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parley_core::config::LlmConfig;
use thiserror::Error;

use super::anthropic::AnthropicProvider;
use super::echo::EchoProvider;
use super::ollama::OllamaProvider;
use super::openai::OpenAiProvider;
use super::LlmProvider;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FactoryError {
    #[error("unknown LLM provider `{0}`")]
    UnknownProvider(String),
    #[error("LLM provider `{provider}` is misconfigured: {reason}")]
    Misconfigured { provider: String, reason: String },
}

type Builder = Arc<dyn Fn(&LlmConfig) -> Result<Arc<dyn LlmProvider>, FactoryError> + Send + Sync>;

/// Maps configured provider identifiers to constructors. Resolution happens
/// once at startup; the flow controller only ever sees `dyn LlmProvider`.
#[derive(Clone)]
pub struct ProviderFactory {
    builders: BTreeMap<String, Builder>,
}

impl Default for ProviderFactory {
    fn default() -> Self {
        Self::with_builtin_providers()
    }
}

impl ProviderFactory {
    pub fn empty() -> Self {
        Self { builders: BTreeMap::new() }
    }

    pub fn with_builtin_providers() -> Self {
        let mut factory = Self::empty();
        factory.register("openai", |config| {
            Ok(Arc::new(OpenAiProvider::from_config(config)?) as Arc<dyn LlmProvider>)
        });
        factory.register("anthropic", |config| {
            Ok(Arc::new(AnthropicProvider::from_config(config)?) as Arc<dyn LlmProvider>)
        });
        factory.register("ollama", |config| {
            Ok(Arc::new(OllamaProvider::from_config(config)?) as Arc<dyn LlmProvider>)
        });
        factory.register("echo", |_| Ok(Arc::new(EchoProvider) as Arc<dyn LlmProvider>));
        factory
    }

    /// Adds or replaces the constructor for `id`.
    pub fn register<F>(&mut self, id: &str, builder: F)
    where
        F: Fn(&LlmConfig) -> Result<Arc<dyn LlmProvider>, FactoryError> + Send + Sync + 'static,
    {
        self.builders.insert(id.trim().to_ascii_lowercase(), Arc::new(builder));
    }

    pub fn create(&self, config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, FactoryError> {
        let id = config.provider.trim().to_ascii_lowercase();
        let builder =
            self.builders.get(&id).ok_or_else(|| FactoryError::UnknownProvider(id.clone()))?;
        builder(config)
    }

    pub fn provider_ids(&self) -> Vec<&str> {
        self.builders.keys().map(String::as_str).collect()
    }
}

pub(crate) fn http_client(config: &LlmConfig) -> Result<reqwest::Client, FactoryError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs.max(1)))
        .build()
        .map_err(|error| FactoryError::Misconfigured {
            provider: config.provider.clone(),
            reason: format!("failed to build HTTP client: {error}"),
        })
}

pub(crate) fn require_api_key(config: &LlmConfig) -> Result<secrecy::SecretString, FactoryError> {
    config.api_key.clone().ok_or_else(|| FactoryError::Misconfigured {
        provider: config.provider.clone(),
        reason: "api_key is required".to_string(),
    })
}

pub(crate) fn base_url(config: &LlmConfig, default: &str) -> String {
    config
        .base_url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .unwrap_or(default)
        .trim_end_matches('/')
        .to_string()
}
