use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    Received,
    Detecting,
    Guarding,
    ExecutingTool,
    CallingModel,
    Assembling,
    Done,
    Error,
}

impl FlowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowEvent {
    MessageAccepted,
    DetectionCompleted,
    GuardrailEvaluated,
    ToolCompleted,
    ModelCompleted,
    ResponseAssembled,
    Failed,
}

/// Facts gathered so far in the request that steer branching transitions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FlowContext {
    pub tool_matched: bool,
    pub guardrail_allowed: bool,
    pub tool_result_only: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowAction {
    EvaluateGuardrails,
    ExecuteTool,
    InvokeModel,
    PhraseToolResult,
    RenderToolResult,
    RenderRejection,
    AssembleResponse,
    RenderFailure,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: FlowState,
    pub to: FlowState,
    pub event: FlowEvent,
    pub actions: Vec<FlowAction>,
}
