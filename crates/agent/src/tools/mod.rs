//! Tool contract, declarative specs and the startup-built registry.
//!
//! A tool is one capability (`run`) plus a [`ToolSpec`] that the detector
//! scores against and the executor validates against. Tools are registered
//! explicitly while the process starts; afterwards the registry is shared
//! behind an `Arc` and only read.

pub mod delivery_tracker;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use delivery_tracker::DeliveryTracker;

pub type ToolArguments = serde_json::Map<String, Value>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }

    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }

    /// Converts slot text captured from a message into a value of this type.
    pub fn coerce(&self, raw: &str) -> Option<Value> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        match self {
            Self::String => Some(Value::String(raw.to_string())),
            Self::Integer => raw.parse::<i64>().ok().map(Value::from),
            Self::Number => {
                raw.parse::<f64>().ok().and_then(serde_json::Number::from_f64).map(Value::Number)
            }
            Self::Boolean => match raw.to_ascii_lowercase().as_str() {
                "true" | "yes" => Some(Value::Bool(true)),
                "false" | "no" => Some(Value::Bool(false)),
                _ => None,
            },
            Self::Array | Self::Object => {
                serde_json::from_str::<Value>(raw).ok().filter(|value| self.accepts(value))
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub param_type: ParamType,
    pub required: bool,
    pub description: String,
    /// Extraction regex; the first capture group (or whole match) fills the slot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl ParamSpec {
    pub fn required(param_type: ParamType, description: impl Into<String>) -> Self {
        Self { param_type, required: true, description: description.into(), pattern: None }
    }

    pub fn optional(param_type: ParamType, description: impl Into<String>) -> Self {
        Self { param_type, required: false, description: description.into(), pattern: None }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// Phrases (regex) that signal intent for this tool.
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParamSpec>,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            triggers: Vec::new(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_trigger(mut self, pattern: impl Into<String>) -> Self {
        self.triggers.push(pattern.into());
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, spec: ParamSpec) -> Self {
        self.parameters.insert(name.into(), spec);
        self
    }

    pub fn required_parameters(&self) -> impl Iterator<Item = &str> {
        self.parameters.iter().filter(|(_, spec)| spec.required).map(|(name, _)| name.as_str())
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn run(&self, arguments: ToolArguments) -> Result<Value>;
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("tool `{0}` is already registered")]
    DuplicateTool(String),
    #[error("tool `{0}` is not registered")]
    UnknownTool(String),
    #[error("tool `{name}` has an invalid spec: {reason}")]
    InvalidSpec { name: String, reason: String },
}

pub struct RegisteredTool {
    spec: ToolSpec,
    triggers: Vec<Regex>,
    slot_patterns: BTreeMap<String, Regex>,
    tool: Arc<dyn Tool>,
}

impl RegisteredTool {
    pub fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    pub fn triggers(&self) -> &[Regex] {
        &self.triggers
    }

    pub fn slot_pattern(&self, parameter: &str) -> Option<&Regex> {
        self.slot_patterns.get(parameter)
    }

    /// First participating capture group of the parameter's pattern, or the
    /// whole match when the pattern has no groups.
    pub fn slot_value<'m>(&self, parameter: &str, message: &'m str) -> Option<&'m str> {
        let captures = self.slot_pattern(parameter)?.captures(message)?;
        captures
            .iter()
            .skip(1)
            .flatten()
            .next()
            .or_else(|| captures.get(0))
            .map(|capture| capture.as_str())
    }

    pub fn tool(&self) -> Arc<dyn Tool> {
        Arc::clone(&self.tool)
    }
}

/// Tools in registration order. Mutable only until it is wrapped in an `Arc`.
#[derive(Default)]
pub struct ToolRegistry {
    entries: Vec<RegisteredTool>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T>(&mut self, tool: T) -> Result<(), RegistryError>
    where
        T: Tool + 'static,
    {
        self.register_shared(Arc::new(tool))
    }

    pub fn register_shared(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let spec = tool.spec();
        if self.index.contains_key(&spec.name) {
            return Err(RegistryError::DuplicateTool(spec.name));
        }

        let (triggers, slot_patterns) = compile_spec(&spec)?;
        self.index.insert(spec.name.clone(), self.entries.len());
        self.entries.push(RegisteredTool { spec, triggers, slot_patterns, tool });
        Ok(())
    }

    pub fn list(&self) -> impl Iterator<Item = &ToolSpec> {
        self.entries.iter().map(RegisteredTool::spec)
    }

    pub fn entries(&self) -> &[RegisteredTool] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Result<&ToolSpec, RegistryError> {
        self.entry(name).map(RegisteredTool::spec)
    }

    pub fn entry(&self, name: &str) -> Result<&RegisteredTool, RegistryError> {
        self.index
            .get(name)
            .and_then(|position| self.entries.get(*position))
            .ok_or_else(|| RegistryError::UnknownTool(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

type CompiledSpec = (Vec<Regex>, BTreeMap<String, Regex>);

fn compile_spec(spec: &ToolSpec) -> Result<CompiledSpec, RegistryError> {
    let invalid = |reason: String| RegistryError::InvalidSpec { name: spec.name.clone(), reason };

    let valid_name = !spec.name.is_empty()
        && spec.name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !valid_name {
        return Err(invalid("name must be non-empty snake_case".to_string()));
    }
    if spec.description.trim().is_empty() {
        return Err(invalid("description must not be empty".to_string()));
    }

    let triggers = spec
        .triggers
        .iter()
        .map(|pattern| {
            compile_pattern(pattern).map_err(|e| invalid(format!("trigger `{pattern}`: {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut slot_patterns = BTreeMap::new();
    for (parameter, param_spec) in &spec.parameters {
        if let Some(pattern) = &param_spec.pattern {
            let regex = compile_pattern(pattern)
                .map_err(|e| invalid(format!("parameter `{parameter}` pattern: {e}")))?;
            slot_patterns.insert(parameter.clone(), regex);
        }
    }

    Ok((triggers, slot_patterns))
}

fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}
