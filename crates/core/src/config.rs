use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub guardrails: GuardrailConfig,
    pub tools: ToolsConfig,
    pub detection: DetectionConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    /// Identifier resolved by the provider factory at startup (`openai`, `anthropic`, ...).
    pub provider: String,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub max_tokens: u32,
    pub temperature: f64,
    pub top_p: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GuardrailConfig {
    pub mode: GuardrailMode,
    pub max_input_length: usize,
    pub max_conversation_length: usize,
    /// Age of the first stored turn after which a session is refused. Zero disables.
    pub session_timeout_minutes: u64,
    pub content_filter_enabled: bool,
    pub sensitive_data_filter_enabled: bool,
    pub repetition_filter_enabled: bool,
    pub blocked_terms: Vec<String>,
    pub rejection_message: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolsConfig {
    pub enabled: bool,
    pub timeout_secs: u64,
    /// Answer straight from the tool record instead of asking the model to phrase it.
    pub result_only: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DetectionConfig {
    pub threshold: f64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailMode {
    /// Every message may reach the model.
    Open,
    /// Only messages that matched a tool are served.
    ToolOnly,
    /// Nothing is served.
    Disabled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub log_level: Option<String>,
    pub llm_provider: Option<String>,
    pub llm_model: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_base_url: Option<String>,
    pub guardrail_mode: Option<GuardrailMode>,
    pub detection_threshold: Option<f64>,
    pub tools_result_only: Option<bool>,
    pub server_port: Option<u16>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

pub const DEFAULT_REJECTION_MESSAGE: &str = "I can only help with requests handled by my tools \
right now, such as checking the delivery status of an order.";

fn default_blocked_terms() -> Vec<String> {
    ["hack", "exploit", "bypass", "illegal", "fraud", "scam", "abuse"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig {
                provider: "ollama".to_string(),
                api_key: None,
                base_url: Some("http://localhost:11434".to_string()),
                model: "llama3.1".to_string(),
                timeout_secs: 30,
                max_retries: 2,
                retry_base_delay_ms: 250,
                retry_max_delay_ms: 5_000,
                max_tokens: 4096,
                temperature: 0.7,
                top_p: 0.9,
            },
            guardrails: GuardrailConfig::default(),
            tools: ToolsConfig { enabled: true, timeout_secs: 30, result_only: false },
            detection: DetectionConfig { threshold: 0.3 },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            mode: GuardrailMode::Open,
            max_input_length: 2000,
            max_conversation_length: 50,
            session_timeout_minutes: 30,
            content_filter_enabled: true,
            sensitive_data_filter_enabled: true,
            repetition_filter_enabled: true,
            blocked_terms: default_blocked_terms(),
            rejection_message: DEFAULT_REJECTION_MESSAGE.to_string(),
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for GuardrailMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "open" => Ok(Self::Open),
            "tool_only" => Ok(Self::ToolOnly),
            "disabled" => Ok(Self::Disabled),
            other => Err(ConfigError::Validation(format!(
                "unsupported guardrail mode `{other}` (expected open|tool_only|disabled)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl GuardrailMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::ToolOnly => "tool_only",
            Self::Disabled => "disabled",
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("parley.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = llm.max_retries {
                self.llm.max_retries = max_retries;
            }
            if let Some(retry_base_delay_ms) = llm.retry_base_delay_ms {
                self.llm.retry_base_delay_ms = retry_base_delay_ms;
            }
            if let Some(retry_max_delay_ms) = llm.retry_max_delay_ms {
                self.llm.retry_max_delay_ms = retry_max_delay_ms;
            }
            if let Some(max_tokens) = llm.max_tokens {
                self.llm.max_tokens = max_tokens;
            }
            if let Some(temperature) = llm.temperature {
                self.llm.temperature = temperature;
            }
            if let Some(top_p) = llm.top_p {
                self.llm.top_p = top_p;
            }
        }

        if let Some(guardrails) = patch.guardrails {
            if let Some(mode) = guardrails.mode {
                self.guardrails.mode = mode;
            }
            if let Some(max_input_length) = guardrails.max_input_length {
                self.guardrails.max_input_length = max_input_length;
            }
            if let Some(max_conversation_length) = guardrails.max_conversation_length {
                self.guardrails.max_conversation_length = max_conversation_length;
            }
            if let Some(minutes) = guardrails.session_timeout_minutes {
                self.guardrails.session_timeout_minutes = minutes;
            }
            if let Some(enabled) = guardrails.content_filter_enabled {
                self.guardrails.content_filter_enabled = enabled;
            }
            if let Some(enabled) = guardrails.sensitive_data_filter_enabled {
                self.guardrails.sensitive_data_filter_enabled = enabled;
            }
            if let Some(enabled) = guardrails.repetition_filter_enabled {
                self.guardrails.repetition_filter_enabled = enabled;
            }
            if let Some(blocked_terms) = guardrails.blocked_terms {
                self.guardrails.blocked_terms = blocked_terms;
            }
            if let Some(rejection_message) = guardrails.rejection_message {
                self.guardrails.rejection_message = rejection_message;
            }
        }

        if let Some(tools) = patch.tools {
            if let Some(enabled) = tools.enabled {
                self.tools.enabled = enabled;
            }
            if let Some(timeout_secs) = tools.timeout_secs {
                self.tools.timeout_secs = timeout_secs;
            }
            if let Some(result_only) = tools.result_only {
                self.tools.result_only = result_only;
            }
        }

        if let Some(detection) = patch.detection {
            if let Some(threshold) = detection.threshold {
                self.detection.threshold = threshold;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("PARLEY_LLM_PROVIDER") {
            self.llm.provider = value;
        }
        if let Some(value) = read_env("PARLEY_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("PARLEY_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("PARLEY_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("PARLEY_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("PARLEY_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("PARLEY_LLM_MAX_RETRIES") {
            self.llm.max_retries = parse_u32("PARLEY_LLM_MAX_RETRIES", &value)?;
        }
        if let Some(value) = read_env("PARLEY_LLM_MAX_TOKENS") {
            self.llm.max_tokens = parse_u32("PARLEY_LLM_MAX_TOKENS", &value)?;
        }
        if let Some(value) = read_env("PARLEY_LLM_TEMPERATURE") {
            self.llm.temperature = parse_f64("PARLEY_LLM_TEMPERATURE", &value)?;
        }
        if let Some(value) = read_env("PARLEY_LLM_TOP_P") {
            self.llm.top_p = parse_f64("PARLEY_LLM_TOP_P", &value)?;
        }

        if let Some(value) = read_env("PARLEY_GUARDRAILS_MODE") {
            self.guardrails.mode = value.parse()?;
        }
        if let Some(value) = read_env("PARLEY_GUARDRAILS_MAX_INPUT_LENGTH") {
            self.guardrails.max_input_length =
                parse_usize("PARLEY_GUARDRAILS_MAX_INPUT_LENGTH", &value)?;
        }
        if let Some(value) = read_env("PARLEY_GUARDRAILS_MAX_CONVERSATION_LENGTH") {
            self.guardrails.max_conversation_length =
                parse_usize("PARLEY_GUARDRAILS_MAX_CONVERSATION_LENGTH", &value)?;
        }
        if let Some(value) = read_env("PARLEY_GUARDRAILS_SESSION_TIMEOUT_MINUTES") {
            self.guardrails.session_timeout_minutes =
                parse_u64("PARLEY_GUARDRAILS_SESSION_TIMEOUT_MINUTES", &value)?;
        }
        if let Some(value) = read_env("PARLEY_GUARDRAILS_CONTENT_FILTER_ENABLED") {
            self.guardrails.content_filter_enabled =
                parse_bool("PARLEY_GUARDRAILS_CONTENT_FILTER_ENABLED", &value)?;
        }
        if let Some(value) = read_env("PARLEY_GUARDRAILS_SENSITIVE_DATA_FILTER_ENABLED") {
            self.guardrails.sensitive_data_filter_enabled =
                parse_bool("PARLEY_GUARDRAILS_SENSITIVE_DATA_FILTER_ENABLED", &value)?;
        }
        if let Some(value) = read_env("PARLEY_GUARDRAILS_REPETITION_FILTER_ENABLED") {
            self.guardrails.repetition_filter_enabled =
                parse_bool("PARLEY_GUARDRAILS_REPETITION_FILTER_ENABLED", &value)?;
        }

        if let Some(value) = read_env("PARLEY_TOOLS_ENABLED") {
            self.tools.enabled = parse_bool("PARLEY_TOOLS_ENABLED", &value)?;
        }
        if let Some(value) = read_env("PARLEY_TOOLS_TIMEOUT_SECS") {
            self.tools.timeout_secs = parse_u64("PARLEY_TOOLS_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("PARLEY_TOOLS_RESULT_ONLY") {
            self.tools.result_only = parse_bool("PARLEY_TOOLS_RESULT_ONLY", &value)?;
        }

        if let Some(value) = read_env("PARLEY_DETECTION_THRESHOLD") {
            self.detection.threshold = parse_f64("PARLEY_DETECTION_THRESHOLD", &value)?;
        }

        if let Some(value) = read_env("PARLEY_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("PARLEY_SERVER_PORT") {
            self.server.port = parse_u16("PARLEY_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("PARLEY_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("PARLEY_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level = read_env("PARLEY_LOGGING_LEVEL").or_else(|| read_env("PARLEY_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("PARLEY_LOGGING_FORMAT").or_else(|| read_env("PARLEY_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(llm_api_key) = overrides.llm_api_key {
            self.llm.api_key = Some(secret_value(llm_api_key));
        }
        if let Some(llm_base_url) = overrides.llm_base_url {
            self.llm.base_url = Some(llm_base_url);
        }
        if let Some(mode) = overrides.guardrail_mode {
            self.guardrails.mode = mode;
        }
        if let Some(threshold) = overrides.detection_threshold {
            self.detection.threshold = threshold;
        }
        if let Some(result_only) = overrides.tools_result_only {
            self.tools.result_only = result_only;
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_llm(&self.llm)?;
        validate_guardrails(&self.guardrails)?;
        validate_tools(&self.tools)?;
        validate_detection(&self.detection)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("parley.toml"), PathBuf::from("config/parley.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    let provider = llm.provider.trim().to_ascii_lowercase();
    if provider.is_empty() {
        return Err(ConfigError::Validation("llm.provider must not be empty".to_string()));
    }

    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.model must not be empty".to_string()));
    }

    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if llm.max_tokens == 0 {
        return Err(ConfigError::Validation("llm.max_tokens must be greater than zero".to_string()));
    }

    if !(0.0..=2.0).contains(&llm.temperature) {
        return Err(ConfigError::Validation(
            "llm.temperature must be in range 0.0..=2.0".to_string(),
        ));
    }

    if !(0.0..=1.0).contains(&llm.top_p) {
        return Err(ConfigError::Validation("llm.top_p must be in range 0.0..=1.0".to_string()));
    }

    if llm.retry_base_delay_ms > llm.retry_max_delay_ms {
        return Err(ConfigError::Validation(
            "llm.retry_base_delay_ms must not exceed llm.retry_max_delay_ms".to_string(),
        ));
    }

    match provider.as_str() {
        "openai" | "anthropic" => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for openai/anthropic providers".to_string(),
                ));
            }
        }
        "ollama" => {
            let missing =
                llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.base_url is required for ollama provider".to_string(),
                ));
            }
        }
        _ => {}
    }

    if let Some(base_url) = &llm.base_url {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "llm.base_url must start with http:// or https://".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_guardrails(guardrails: &GuardrailConfig) -> Result<(), ConfigError> {
    if guardrails.max_input_length == 0 {
        return Err(ConfigError::Validation(
            "guardrails.max_input_length must be greater than zero".to_string(),
        ));
    }

    if guardrails.max_conversation_length == 0 {
        return Err(ConfigError::Validation(
            "guardrails.max_conversation_length must be greater than zero".to_string(),
        ));
    }

    if guardrails.rejection_message.trim().is_empty() {
        return Err(ConfigError::Validation(
            "guardrails.rejection_message must not be empty".to_string(),
        ));
    }

    Ok(())
}

fn validate_tools(tools: &ToolsConfig) -> Result<(), ConfigError> {
    if tools.timeout_secs == 0 || tools.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "tools.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_detection(detection: &DetectionConfig) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&detection.threshold) {
        return Err(ConfigError::Validation(
            "detection.threshold must be in range 0.0..=1.0".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_f64(key: &str, value: &str) -> Result<f64, ConfigError> {
    value.parse::<f64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    llm: Option<LlmPatch>,
    guardrails: Option<GuardrailsPatch>,
    tools: Option<ToolsPatch>,
    detection: Option<DetectionPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<String>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    retry_max_delay_ms: Option<u64>,
    max_tokens: Option<u32>,
    temperature: Option<f64>,
    top_p: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct GuardrailsPatch {
    mode: Option<GuardrailMode>,
    max_input_length: Option<usize>,
    max_conversation_length: Option<usize>,
    session_timeout_minutes: Option<u64>,
    content_filter_enabled: Option<bool>,
    sensitive_data_filter_enabled: Option<bool>,
    repetition_filter_enabled: Option<bool>,
    blocked_terms: Option<Vec<String>>,
    rejection_message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ToolsPatch {
    enabled: Option<bool>,
    timeout_secs: Option<u64>,
    result_only: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct DetectionPatch {
    threshold: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, GuardrailMode, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_are_valid_without_a_file() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;

        ensure(config.guardrails.mode == GuardrailMode::Open, "default mode should be open")?;
        ensure((config.detection.threshold - 0.3).abs() < f64::EPSILON, "threshold is 0.3")?;
        ensure(config.llm.provider == "ollama", "default provider should be ollama")?;
        ensure(config.guardrails.max_input_length == 2000, "default input limit is 2000")?;
        ensure(!config.tools.result_only, "model phrasing is the default")
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_PARLEY_OPENAI_KEY", "sk-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("parley.toml");
            fs::write(
                &path,
                r#"
[llm]
provider = "openai"
api_key = "${TEST_PARLEY_OPENAI_KEY}"
base_url = "https://api.openai.com"
model = "gpt-4o-mini"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            let key = config.llm.api_key.as_ref().map(|key| key.expose_secret().to_string());
            ensure(key.as_deref() == Some("sk-from-env"), "api key should come from env")?;
            ensure(config.llm.model == "gpt-4o-mini", "model should come from the file")
        })();

        clear_vars(&["TEST_PARLEY_OPENAI_KEY"]);
        result
    }

    #[test]
    fn missing_interpolation_variable_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path = dir.path().join("parley.toml");
        fs::write(&path, "[llm]\napi_key = \"${PARLEY_TEST_DOES_NOT_EXIST}\"\n")
            .map_err(|err| err.to_string())?;

        let error = match AppConfig::load(LoadOptions {
            config_path: Some(path),
            ..LoadOptions::default()
        }) {
            Ok(_) => return Err("expected interpolation failure".to_string()),
            Err(error) => error,
        };

        ensure(
            matches!(
                error,
                ConfigError::MissingEnvInterpolation { ref var } if var == "PARLEY_TEST_DOES_NOT_EXIST"
            ),
            "missing variable should be named",
        )
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("PARLEY_LOG_LEVEL", "warn");
        env::set_var("PARLEY_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )
        })();

        clear_vars(&["PARLEY_LOG_LEVEL", "PARLEY_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("PARLEY_GUARDRAILS_MODE", "tool-only");
        env::set_var("PARLEY_DETECTION_THRESHOLD", "0.5");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("parley.toml");
            fs::write(
                &path,
                r#"
[guardrails]
mode = "disabled"
max_input_length = 500

[detection]
threshold = 0.4

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    detection_threshold: Some(0.6),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.guardrails.mode == GuardrailMode::ToolOnly,
                "env guardrail mode should win over the file",
            )?;
            ensure(config.guardrails.max_input_length == 500, "file value should beat defaults")?;
            ensure(
                (config.detection.threshold - 0.6).abs() < f64::EPSILON,
                "override threshold should win over env and file",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")
        })();

        clear_vars(&["PARLEY_GUARDRAILS_MODE", "PARLEY_DETECTION_THRESHOLD"]);
        result
    }

    #[test]
    fn invalid_env_number_is_rejected() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("PARLEY_LLM_MAX_RETRIES", "many");

        let result = match AppConfig::load(LoadOptions::default()) {
            Ok(_) => Err("expected env override failure".to_string()),
            Err(error) => ensure(
                matches!(error, ConfigError::InvalidEnvOverride { ref key, .. } if key == "PARLEY_LLM_MAX_RETRIES"),
                "bad override should name the variable",
            ),
        };

        clear_vars(&["PARLEY_LLM_MAX_RETRIES"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("PARLEY_LLM_PROVIDER", "anthropic");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("llm.api_key")
            );
            ensure(has_message, "validation failure should mention llm.api_key")
        })();

        clear_vars(&["PARLEY_LLM_PROVIDER"]);
        result
    }

    #[test]
    fn sampling_parameters_are_range_checked() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("PARLEY_LLM_TEMPERATURE", "2.5");

        let result = match AppConfig::load(LoadOptions::default()) {
            Ok(_) => Err("temperature above 2.0 should be rejected".to_string()),
            Err(error) => ensure(
                matches!(error, ConfigError::Validation(ref message) if message.contains("llm.temperature")),
                "validation failure should mention llm.temperature",
            ),
        };

        clear_vars(&["PARLEY_LLM_TEMPERATURE"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("PARLEY_LLM_PROVIDER", "openai");
        env::set_var("PARLEY_LLM_API_KEY", "sk-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("sk-secret-value"), "debug output should not contain api key")?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )
        })();

        clear_vars(&["PARLEY_LLM_PROVIDER", "PARLEY_LLM_API_KEY"]);
        result
    }

    #[test]
    fn guardrail_mode_parses_all_variants() {
        assert_eq!("open".parse::<GuardrailMode>().ok(), Some(GuardrailMode::Open));
        assert_eq!("TOOL_ONLY".parse::<GuardrailMode>().ok(), Some(GuardrailMode::ToolOnly));
        assert_eq!("disabled".parse::<GuardrailMode>().ok(), Some(GuardrailMode::Disabled));
        assert!("sometimes".parse::<GuardrailMode>().is_err());
        assert_eq!(GuardrailMode::ToolOnly.as_str(), "tool_only");
    }

    #[test]
    fn session_guardrails_load_from_file_and_env() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("PARLEY_GUARDRAILS_REPETITION_FILTER_ENABLED", "false");

        let result = (|| -> Result<(), String> {
            let defaults = AppConfig::default();
            ensure(defaults.guardrails.session_timeout_minutes == 30, "default timeout is 30 minutes")?;
            ensure(defaults.guardrails.repetition_filter_enabled, "repetition filter is on by default")?;

            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("parley.toml");
            fs::write(&path, "[guardrails]\nsession_timeout_minutes = 5\n")
                .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.guardrails.session_timeout_minutes == 5, "timeout should come from the file")?;
            ensure(
                !config.guardrails.repetition_filter_enabled,
                "repetition filter should be switched off by env",
            )
        })();

        clear_vars(&["PARLEY_GUARDRAILS_REPETITION_FILTER_ENABLED"]);
        result
    }
}
