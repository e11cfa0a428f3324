use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::tools::{RegistryError, ToolArguments, ToolRegistry, ToolSpec};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Success,
    ValidationError,
    ExecutionError,
    Timeout,
}

impl ToolCallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::ValidationError => "validation_error",
            Self::ExecutionError => "execution_error",
            Self::Timeout => "timeout",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolExecutionRecord {
    pub tool_name: String,
    pub input_arguments: ToolArguments,
    pub output: Option<Value>,
    /// Failure detail for logs. Never shown to the user verbatim.
    pub error: Option<String>,
    pub duration: Duration,
    pub status: ToolCallStatus,
}

impl ToolExecutionRecord {
    pub fn is_success(&self) -> bool {
        self.status == ToolCallStatus::Success
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationIssue {
    #[error("missing required parameter `{0}`")]
    MissingParameter(String),
    #[error("parameter `{name}` must be of type {expected}")]
    WrongType { name: String, expected: &'static str },
    #[error("unknown parameter `{0}`")]
    UnknownParameter(String),
}

/// Checks arguments against the schema, collecting every problem instead of
/// stopping at the first.
pub fn validate_arguments(
    spec: &ToolSpec,
    arguments: &ToolArguments,
) -> Result<(), Vec<ValidationIssue>> {
    let mut issues = Vec::new();

    for (name, param) in &spec.parameters {
        match arguments.get(name) {
            None | Some(Value::Null) if param.required => {
                issues.push(ValidationIssue::MissingParameter(name.clone()));
            }
            None | Some(Value::Null) => {}
            Some(value) if !param.param_type.accepts(value) => {
                issues.push(ValidationIssue::WrongType {
                    name: name.clone(),
                    expected: param.param_type.as_str(),
                });
            }
            Some(_) => {}
        }
    }

    for name in arguments.keys() {
        if !spec.parameters.contains_key(name) {
            issues.push(ValidationIssue::UnknownParameter(name.clone()));
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}

#[derive(Clone)]
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    default_timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, default_timeout: Duration) -> Self {
        Self { registry, default_timeout }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Runs one tool call. Only an unknown tool name is an `Err`; validation
    /// failures, tool errors, panics and deadline overruns all come back as a
    /// record with the matching status.
    pub async fn execute(
        &self,
        tool_name: &str,
        arguments: ToolArguments,
        timeout: Duration,
    ) -> Result<ToolExecutionRecord, RegistryError> {
        let entry = self.registry.entry(tool_name)?;
        let started = Instant::now();

        if let Err(issues) = validate_arguments(entry.spec(), &arguments) {
            let detail = issues.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ");
            debug!(
                event_name = "agent.tool.validation_failed",
                tool_name,
                issues = %detail,
                "tool arguments rejected before invocation"
            );
            return Ok(ToolExecutionRecord {
                tool_name: tool_name.to_string(),
                input_arguments: arguments,
                output: None,
                error: Some(detail),
                duration: started.elapsed(),
                status: ToolCallStatus::ValidationError,
            });
        }

        let tool = entry.tool();
        let call_arguments = arguments.clone();
        let mut handle = tokio::spawn(async move { tool.run(call_arguments).await });

        let (output, error, status) = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(Ok(value))) => (Some(value), None, ToolCallStatus::Success),
            Ok(Ok(Err(failure))) => {
                (None, Some(format!("{failure:#}")), ToolCallStatus::ExecutionError)
            }
            Ok(Err(join_error)) => {
                let detail = if join_error.is_panic() {
                    "tool panicked".to_string()
                } else {
                    format!("tool task was cancelled: {join_error}")
                };
                (None, Some(detail), ToolCallStatus::ExecutionError)
            }
            Err(_) => {
                handle.abort();
                (
                    None,
                    Some(format!("tool exceeded its {}ms deadline", timeout.as_millis())),
                    ToolCallStatus::Timeout,
                )
            }
        };

        let duration = started.elapsed();
        if let Some(detail) = &error {
            warn!(
                event_name = "agent.tool.execution_failed",
                tool_name,
                status = status.as_str(),
                duration_ms = duration.as_millis() as u64,
                error = %detail,
                "tool execution failed"
            );
        } else {
            debug!(
                event_name = "agent.tool.executed",
                tool_name,
                duration_ms = duration.as_millis() as u64,
                "tool execution succeeded"
            );
        }

        Ok(ToolExecutionRecord {
            tool_name: tool_name.to_string(),
            input_arguments: arguments,
            output,
            error,
            duration,
            status,
        })
    }

    pub async fn execute_with_default_timeout(
        &self,
        tool_name: &str,
        arguments: ToolArguments,
    ) -> Result<ToolExecutionRecord, RegistryError> {
        self.execute(tool_name, arguments, self.default_timeout).await
    }
}
