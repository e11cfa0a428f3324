use std::sync::Arc;

use parley_agent::llm::{FactoryError, ProviderFactory};
use parley_agent::tools::{DeliveryTracker, RegistryError, ToolRegistry};
use parley_agent::{AgentRuntime, InMemorySessionStore};
use parley_core::config::{AppConfig, ConfigError, LoadOptions};
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub runtime: Arc<AgentRuntime>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("tool registration failed: {0}")]
    ToolRegistry(#[from] RegistryError),
    #[error("language model provider setup failed: {0}")]
    Provider(#[from] FactoryError),
}

pub fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config)
}

pub fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    bootstrap_with_factory(config, &ProviderFactory::default())
}

pub fn bootstrap_with_factory(
    config: AppConfig,
    factory: &ProviderFactory,
) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        provider = %config.llm.provider,
        guardrail_mode = config.guardrails.mode.as_str(),
        "starting application bootstrap"
    );

    let registry = Arc::new(build_registry()?);
    info!(
        event_name = "system.bootstrap.tools_registered",
        correlation_id = "bootstrap",
        tool_count = registry.len(),
        "tool registry built"
    );

    let provider = factory.create(&config.llm)?;
    info!(
        event_name = "system.bootstrap.provider_ready",
        correlation_id = "bootstrap",
        provider = provider.id(),
        model = %config.llm.model,
        "language model provider resolved"
    );

    let sessions = Arc::new(InMemorySessionStore::new());
    let runtime = Arc::new(AgentRuntime::new(&config, registry, provider, sessions));

    Ok(Application { config, runtime })
}

fn build_registry() -> Result<ToolRegistry, RegistryError> {
    let mut registry = ToolRegistry::new();
    registry.register(DeliveryTracker::default())?;
    Ok(registry)
}
